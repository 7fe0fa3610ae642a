use std::fmt;
use std::ops::Range;

use logos::{FilterResult, Lexer, Logos};
use strum_macros::AsRefStr;
use thiserror::Error;

pub type SourceId = usize;

/// A half-open byte range into one source buffer, carried on every
/// token and AST node for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Loc {
    pub source: SourceId,
    pub span: Range<usize>,
}

impl Loc {
    pub fn new(source: SourceId, span: Range<usize>) -> Self {
        Self { source, span }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Error)]
pub enum LexError {
    #[default]
    #[error("Unexpected character.")]
    UnexpectedCharacter,
    #[error("Unterminated string.")]
    UnterminatedString,
    #[error("Unterminated char literal.")]
    UnterminatedChar,
    #[error("Unterminated block comment.")]
    UnterminatedBlockComment,
}

#[derive(Logos, Debug, Clone, PartialEq, AsRefStr)]
#[logos(error = LexError)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[rustfmt::skip]
pub enum Token {
    // ==< Separators & operators >==
    #[token("(")] LeftParen,
    #[token(")")] RightParen,
    #[token("{")] LeftBrace,
    #[token("}")] RightBrace,
    #[token("[")] LeftBracket,
    #[token("]")] RightBracket,
    #[token(",")] Comma,
    #[token(".")] Dot,
    #[token(";")] Semicolon,
    #[token(":")] Colon,
    #[token("::")] ColonColon,

    #[token("+")] Plus,
    #[token("-")] Minus,
    #[token("*")] Star,
    #[token("/")] Slash,
    #[token("%")] Percent,
    #[token("^")] Caret,
    #[token("~")] Tilde,
    #[token("@")] At,

    #[token("!")] Bang,
    #[token("!=")] BangEqual,
    #[token("=")] Equal,
    #[token("==")] EqualEqual,
    #[token(">")] Greater,
    #[token(">=")] GreaterEqual,
    #[token(">>")] GreaterGreater,
    #[token("<")] Less,
    #[token("<=")] LessEqual,
    #[token("<<")] LessLess,
    #[token("&")] Amp,
    #[token("&&")] AmpAmp,
    #[token("|")] Pipe,
    #[token("||")] PipePipe,

    // ==< Keywords >==
    #[token("var")] Var,
    #[token("const")] Const,
    #[token("fn")] Fn,
    #[token("type")] Type,
    #[token("enum")] Enum,
    #[token("if")] If,
    #[token("else")] Else,
    #[token("for")] For,
    #[token("while")] While,
    #[token("return")] Return,
    #[token("as")] As,
    #[token("asm")] Asm,
    #[token("ext")] Ext,
    #[token("import")] Import,
    #[token("bank")] Bank,
    #[token("true")] True,
    #[token("false")] False,

    // ==< Literals >==
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    #[regex(r"0x[0-9a-fA-F]+", |lex| i64::from_str_radix(&lex.slice()[2..], 16).ok())]
    #[regex(r"0b[01]+", |lex| i64::from_str_radix(&lex.slice()[2..], 2).ok())]
    Number(i64),

    #[token("\"", lex_string)]
    Str(String),

    #[token("'", lex_char)]
    Char(u8),

    // The distinguished type-name spellings, so the grammar can tell a
    // type from an identifier. The uint8 family are accepted aliases.
    #[token("void", type_name)]
    #[token("ptr", type_name)]
    #[token("bool", type_name)]
    #[token("char", type_name)]
    #[token("string", type_name)]
    #[token("u8", type_name)]
    #[token("i8", type_name)]
    #[token("u16", type_name)]
    #[token("i16", type_name)]
    #[token("uint8", type_name)]
    #[token("int8", type_name)]
    #[token("uint16", type_name)]
    #[token("int16", type_name)]
    TypeName(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_owned())]
    Identifier(String),

    #[token("/*", lex_block_comment)]
    BlockComment,

    // Sentinels, produced by `tokenize` rather than the derive table.
    Error(LexError),
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Identifier(name) => write!(f, "{name}"),
            Token::TypeName(name) => write!(f, "{name}"),
            Token::Number(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "\"{s}\""),
            Token::Char(c) => write!(f, "'{}'", *c as char),
            Token::Eof => write!(f, "end of file"),
            other => write!(f, "{}", other.as_ref()),
        }
    }
}

fn type_name(lex: &mut Lexer<Token>) -> String {
    lex.slice().to_owned()
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        'r' => '\r',
        't' => '\t',
        '0' => '\0',
        other => other,
    }
}

fn lex_string(lex: &mut Lexer<Token>) -> Result<String, LexError> {
    let mut out = String::new();
    let mut chars = lex.remainder().char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => {
                lex.bump(i + 1);
                return Ok(out);
            }
            '\\' => match chars.next() {
                Some((_, esc)) => out.push(unescape(esc)),
                None => break,
            },
            _ => out.push(c),
        }
    }
    Err(LexError::UnterminatedString)
}

fn lex_char(lex: &mut Lexer<Token>) -> Result<u8, LexError> {
    let rem = lex.remainder();
    let mut chars = rem.char_indices();
    let value = match chars.next() {
        Some((_, '\\')) => match chars.next() {
            Some((_, esc)) => unescape(esc),
            None => return Err(LexError::UnterminatedChar),
        },
        Some((_, '\'')) | None => return Err(LexError::UnterminatedChar),
        Some((_, c)) => c,
    };
    for (i, c) in chars {
        if c == '\'' {
            lex.bump(i + 1);
            return Ok(value as u8);
        }
    }
    Err(LexError::UnterminatedChar)
}

// Block comments nest; the derive table only sees the opener.
fn lex_block_comment(lex: &mut Lexer<Token>) -> FilterResult<(), LexError> {
    let bytes = lex.remainder().as_bytes();
    let mut depth = 1usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
            depth -= 1;
            i += 2;
            if depth == 0 {
                lex.bump(i);
                return FilterResult::Skip;
            }
        } else {
            i += 1;
        }
    }
    lex.bump(bytes.len());
    FilterResult::Error(LexError::UnterminatedBlockComment)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub loc: Loc,
}

/// Runs the whole buffer through the lexer. Lex failures surface as
/// `Token::Error` entries so the parser can report them in order; the
/// stream always ends with a single `Eof`.
pub fn tokenize(source: &str, source_id: SourceId) -> Vec<SpannedToken> {
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(source);
    while let Some(result) = lexer.next() {
        let token = match result {
            Ok(token) => token,
            Err(error) => Token::Error(error),
        };
        tokens.push(SpannedToken {
            token,
            loc: Loc::new(source_id, lexer.span()),
        });
    }
    tokens.push(SpannedToken {
        token: Token::Eof,
        loc: Loc::new(source_id, source.len()..source.len()),
    });
    tokens
}

/// Byte offset to 1-based line/column mapping for one source buffer.
pub struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        Self { line_starts }
    }

    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let line = self
            .line_starts
            .partition_point(|&start| start <= offset)
            .saturating_sub(1);
        (line + 1, offset - self.line_starts[line] + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source, 0).into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn punctuation_longest_match() {
        assert_eq!(
            kinds("<< <= < :: :"),
            vec![
                Token::LessLess,
                Token::LessEqual,
                Token::Less,
                Token::ColonColon,
                Token::Colon,
                Token::Eof
            ]
        );
    }

    #[test]
    fn keywords_beat_identifiers() {
        assert_eq!(
            kinds("var variant u8 u8x"),
            vec![
                Token::Var,
                Token::Identifier("variant".into()),
                Token::TypeName("u8".into()),
                Token::Identifier("u8x".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn numeric_radixes() {
        assert_eq!(
            kinds("10 0x1f 0b101"),
            vec![
                Token::Number(10),
                Token::Number(31),
                Token::Number(5),
                Token::Eof
            ]
        );
    }

    #[test]
    fn strings_and_chars_unescape() {
        assert_eq!(
            kinds(r#""a\"b" '\n'"#),
            vec![
                Token::Str("a\"b".into()),
                Token::Char(b'\n'),
                Token::Eof
            ]
        );
    }

    #[test]
    fn nested_block_comments_skip() {
        assert_eq!(
            kinds("1 /* a /* b */ c */ 2"),
            vec![Token::Number(1), Token::Number(2), Token::Eof]
        );
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let tokens = kinds("\"abc");
        assert_eq!(tokens[0], Token::Error(LexError::UnterminatedString));
    }

    #[test]
    fn spans_stay_inside_the_buffer() {
        let source = "var x: u8 = 1; // trailing";
        for token in tokenize(source, 0) {
            assert!(token.loc.span.start <= token.loc.span.end);
            assert!(token.loc.span.end <= source.len());
        }
    }

    #[test]
    fn line_index_maps_offsets() {
        let index = LineIndex::new("ab\ncd\n");
        assert_eq!(index.line_col(0), (1, 1));
        assert_eq!(index.line_col(3), (2, 1));
        assert_eq!(index.line_col(4), (2, 2));
    }
}
