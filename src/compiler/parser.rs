use log::trace;

use crate::compiler::ast::{
    AstKind, AstNode, BinaryOp, ExtKind, InitializerKind, NodeIdGen, UnaryOp,
};
use crate::compiler::const_pool::{ConstPool, FALSE_INDEX, TRUE_INDEX};
use crate::compiler::error::Diagnostic;
use crate::compiler::lexer::{
    LineIndex, Loc, SourceId, SpannedToken, Token, tokenize,
};
use crate::compiler::type_table::TypeTable;
use crate::values::Value;

/// Binding strength, weakest first. An expression parse at strength
/// `p` only consumes infix operators binding at least as tightly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Bitwise,
    Term,
    Factor,
    Unary,
    Ref,
    Call,
    Subscript,
    As,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Bitwise,
            Precedence::Bitwise => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Ref,
            Precedence::Ref => Precedence::Call,
            Precedence::Call => Precedence::Subscript,
            Precedence::Subscript => Precedence::As,
            Precedence::As => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

fn infix_precedence(token: &Token) -> Precedence {
    match token {
        Token::LeftParen | Token::Dot => Precedence::Call,
        Token::LeftBracket => Precedence::Subscript,
        Token::Minus | Token::Plus => Precedence::Term,
        Token::Slash | Token::Star | Token::Percent => Precedence::Factor,
        Token::BangEqual => Precedence::Equality,
        Token::EqualEqual
        | Token::GreaterEqual
        | Token::LessEqual
        | Token::Less
        | Token::Greater => Precedence::Comparison,
        Token::GreaterGreater | Token::LessLess | Token::Amp | Token::Pipe => {
            Precedence::Bitwise
        }
        Token::AmpAmp => Precedence::And,
        Token::PipePipe => Precedence::Or,
        Token::As => Precedence::As,
        _ => Precedence::None,
    }
}

pub struct Parser<'a> {
    source: &'a str,
    module_name: &'a str,
    tokens: Vec<SpannedToken>,
    line_index: LineIndex,
    pos: usize,
    prev: usize,
    had_error: bool,
    panic_mode: bool,
    exit_emitted: bool,
    errors: Vec<Diagnostic>,
    pool: &'a mut ConstPool,
    types: &'a mut TypeTable,
    ids: &'a mut NodeIdGen,
}

/// Parses one source buffer into its module tree. On failure the
/// partial tree is discarded and all accumulated diagnostics are
/// returned. The boolean reports whether the module already contains
/// a top-level exit.
pub fn parse_module(
    source: &str,
    module_name: &str,
    source_id: SourceId,
    pool: &mut ConstPool,
    types: &mut TypeTable,
    ids: &mut NodeIdGen,
) -> Result<(AstNode, bool), Vec<Diagnostic>> {
    let tokens = tokenize(source, source_id);
    let mut parser = Parser {
        source,
        module_name,
        line_index: LineIndex::new(source),
        tokens,
        pos: 0,
        prev: 0,
        had_error: false,
        panic_mode: false,
        exit_emitted: false,
        errors: Vec::new(),
        pool,
        types,
        ids,
    };
    parser.skip_leading_errors();

    let start = parser.current_loc();
    let mut decls = Vec::new();
    while !parser.check(Token::Eof) {
        decls.push(parser.top_level());
    }
    parser.consume(Token::Eof, "Expect end of expression.");
    trace!("parsed module '{module_name}' with {} declarations", decls.len());

    if parser.had_error {
        return Err(parser.errors);
    }
    let exit_emitted = parser.exit_emitted;
    let module = parser.node(
        start,
        AstKind::Module {
            name: module_name.to_owned(),
            decls,
        },
    );
    Ok((module, exit_emitted))
}

impl<'a> Parser<'a> {
    fn current(&self) -> &SpannedToken {
        &self.tokens[self.pos]
    }

    fn previous(&self) -> &SpannedToken {
        &self.tokens[self.prev]
    }

    fn current_loc(&self) -> Loc {
        self.current().loc.clone()
    }

    fn previous_loc(&self) -> Loc {
        self.previous().loc.clone()
    }

    fn node(&mut self, loc: Loc, kind: AstKind) -> AstNode {
        AstNode::new(self.ids.next(), loc, kind)
    }

    fn error_node(&mut self) -> AstNode {
        let loc = self.previous_loc();
        self.node(loc, AstKind::Error)
    }

    fn skip_leading_errors(&mut self) {
        while let Token::Error(lex_error) = &self.tokens[self.pos].token {
            let message = lex_error.to_string();
            self.report(self.pos, &message);
            self.pos += 1;
        }
        self.prev = self.pos;
    }

    fn advance(&mut self) {
        self.prev = self.pos;
        loop {
            if self.pos + 1 < self.tokens.len() {
                self.pos += 1;
            }
            match &self.tokens[self.pos].token {
                Token::Error(lex_error) => {
                    let message = lex_error.to_string();
                    self.report(self.pos, &message);
                }
                _ => break,
            }
        }
    }

    fn report(&mut self, index: usize, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let token = &self.tokens[index];
        let (line, pos) = self.line_index.line_col(token.loc.span.start);
        let (lexeme, at_end) = match &token.token {
            Token::Eof => (String::new(), true),
            Token::Error(_) => (String::new(), false),
            _ => (
                self.source[token.loc.span.clone()].to_owned(),
                false,
            ),
        };
        self.errors.push(Diagnostic {
            message: message.to_owned(),
            lexeme,
            line,
            pos,
            at_end,
        });
    }

    fn error(&mut self, message: &str) {
        self.report(self.prev, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.report(self.pos, message);
    }

    fn check(&self, token: Token) -> bool {
        self.current().token == token
    }

    fn match_token(&mut self, token: Token) -> bool {
        if !self.check(token) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, token: Token, message: &str) {
        if self.check(token) {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn consume_identifier(&mut self, message: &str) -> String {
        if let Token::Identifier(name) = &self.current().token {
            let name = name.clone();
            self.advance();
            return name;
        }
        self.error_at_current(message);
        String::new()
    }

    fn consume_string(&mut self, message: &str) -> String {
        if let Token::Str(text) = &self.current().token {
            let text = text.clone();
            self.advance();
            return text;
        }
        self.error_at_current(message);
        String::new()
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(Token::Eof) {
            if self.previous().token == Token::Semicolon {
                return;
            }
            match self.current().token {
                Token::Type
                | Token::Fn
                | Token::Ext
                | Token::Var
                | Token::For
                | Token::If
                | Token::While
                | Token::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ==< Expressions >==

    fn expression(&mut self) -> AstNode {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> AstNode {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        let mut expr = match self.prefix(can_assign) {
            Some(expr) => expr,
            None => {
                self.error("Expect expression.");
                return self.error_node();
            }
        };
        while precedence <= infix_precedence(&self.current().token) {
            self.advance();
            expr = self.infix(can_assign, expr);
        }
        if can_assign && self.match_token(Token::Equal) {
            self.error("Invalid assignment target.");
        }
        expr
    }

    fn prefix(&mut self, can_assign: bool) -> Option<AstNode> {
        let token = self.previous().token.clone();
        let expr = match token {
            Token::LeftParen => self.grouping(),
            Token::LeftBrace => self.record_initializer(),
            Token::LeftBracket => self.array_initializer(),
            Token::Minus | Token::Bang | Token::Tilde => self.unary(),
            Token::At | Token::Caret => self.ref_expr(can_assign),
            Token::Identifier(name) => self.variable(name, can_assign),
            Token::Number(n) => self.number(n),
            Token::Str(text) => self.string(text),
            Token::Char(c) => self.character(c),
            Token::True | Token::False => self.literal(),
            _ => return None,
        };
        Some(expr)
    }

    fn infix(&mut self, can_assign: bool, left: AstNode) -> AstNode {
        match self.previous().token.clone() {
            Token::LeftParen => self.call(left),
            Token::LeftBracket => self.subscript(can_assign, left),
            Token::Dot => self.dot(can_assign, left),
            Token::As => self.cast(can_assign, left),
            token => self.binary(token, left),
        }
    }

    fn grouping(&mut self) -> AstNode {
        let expr = self.expression();
        self.consume(Token::RightParen, "Expect ')' after expression.");
        expr
    }

    fn variable(&mut self, name: String, can_assign: bool) -> AstNode {
        let loc = self.previous_loc();
        let (module, name) = if self.match_token(Token::ColonColon) {
            let qualified =
                self.consume_identifier("Expect a name after '::'.");
            (Some(name), qualified)
        } else {
            (None, name)
        };
        if can_assign && self.match_token(Token::Equal) {
            let lvalue =
                self.node(loc.clone(), AstKind::Lvalue { module, name });
            let expr = self.expression();
            return self.node(
                loc,
                AstKind::Assignment {
                    lvalue: Box::new(lvalue),
                    expr: Box::new(expr),
                },
            );
        }
        self.node(loc, AstKind::Identifier { module, name })
    }

    fn number(&mut self, value: i64) -> AstNode {
        let loc = self.previous_loc();
        let index = self.pool.store(Value::LitNum(value));
        self.node(loc, AstKind::Literal { index })
    }

    fn string(&mut self, text: String) -> AstNode {
        let loc = self.previous_loc();
        let id = self.pool.intern(&text);
        let index = self.pool.store(Value::Str(id));
        self.node(loc, AstKind::Literal { index })
    }

    fn character(&mut self, c: u8) -> AstNode {
        let loc = self.previous_loc();
        let index = self.pool.store(Value::Char(c));
        self.node(loc, AstKind::Literal { index })
    }

    fn literal(&mut self) -> AstNode {
        let loc = self.previous_loc();
        let index = match self.previous().token {
            Token::True => TRUE_INDEX,
            Token::False => FALSE_INDEX,
            _ => return self.error_node(),
        };
        self.node(loc, AstKind::Literal { index })
    }

    fn unary(&mut self) -> AstNode {
        let loc = self.previous_loc();
        let op = match self.previous().token {
            Token::Minus => UnaryOp::Neg,
            Token::Bang => UnaryOp::Not,
            Token::Tilde => UnaryOp::BitNot,
            _ => return self.error_node(),
        };
        let operand = self.parse_precedence(Precedence::Unary);
        self.node(
            loc,
            AstKind::Unary {
                op,
                expr: Box::new(operand),
            },
        )
    }

    fn ref_expr(&mut self, can_assign: bool) -> AstNode {
        let loc = self.previous_loc();
        let op = match self.previous().token {
            Token::At => UnaryOp::Deref,
            Token::Caret => UnaryOp::Ref,
            _ => return self.error_node(),
        };
        let operand = self.parse_precedence(Precedence::Ref);
        let mut expr = self.node(
            loc.clone(),
            AstKind::Unary {
                op,
                expr: Box::new(operand),
            },
        );
        if can_assign && self.match_token(Token::Equal) {
            let right = self.expression();
            expr = self.node(
                loc,
                AstKind::Assignment {
                    lvalue: Box::new(expr),
                    expr: Box::new(right),
                },
            );
        }
        expr
    }

    fn binary(&mut self, token: Token, left: AstNode) -> AstNode {
        let loc = self.previous_loc();
        let op = match token {
            Token::Plus => BinaryOp::Add,
            Token::Minus => BinaryOp::Sub,
            Token::Star => BinaryOp::Mul,
            Token::Slash => BinaryOp::Div,
            Token::Percent => BinaryOp::Mod,
            Token::Amp => BinaryOp::BitAnd,
            Token::AmpAmp => BinaryOp::And,
            Token::Pipe => BinaryOp::BitOr,
            Token::PipePipe => BinaryOp::Or,
            Token::Greater => BinaryOp::Greater,
            Token::GreaterGreater => BinaryOp::ShiftRight,
            Token::Less => BinaryOp::Less,
            Token::LessLess => BinaryOp::ShiftLeft,
            Token::EqualEqual => BinaryOp::Equal,
            Token::BangEqual => BinaryOp::NotEqual,
            Token::GreaterEqual => BinaryOp::GreaterEqual,
            Token::LessEqual => BinaryOp::LessEqual,
            _ => return self.error_node(),
        };
        let right = self.parse_precedence(infix_precedence(&token).next());
        self.node(
            loc,
            AstKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
        )
    }

    fn call(&mut self, callee: AstNode) -> AstNode {
        let loc = self.previous_loc();
        let mut args = Vec::new();
        if !self.check(Token::RightParen) {
            loop {
                args.push(self.expression());
                if !self.match_token(Token::Comma) {
                    break;
                }
            }
        }
        self.consume(Token::RightParen, "Expect ')' after arguments.");
        self.node(
            loc,
            AstKind::Call {
                callee: Box::new(callee),
                args,
            },
        )
    }

    fn subscript(&mut self, can_assign: bool, left: AstNode) -> AstNode {
        let loc = self.previous_loc();
        let index = self.expression();
        self.consume(Token::RightBracket, "Expect ']' after a subscript.");
        let mut expr = self.node(
            loc.clone(),
            AstKind::Subscript {
                left: Box::new(left),
                index: Box::new(index),
            },
        );
        if can_assign && self.match_token(Token::Equal) {
            let right = self.expression();
            expr = self.node(
                loc,
                AstKind::Assignment {
                    lvalue: Box::new(expr),
                    expr: Box::new(right),
                },
            );
        }
        expr
    }

    fn dot(&mut self, can_assign: bool, left: AstNode) -> AstNode {
        let loc = self.previous_loc();
        let field = self.consume_identifier("Expect property name after '.'.");
        let mut expr = self.node(
            loc.clone(),
            AstKind::Dot {
                left: Box::new(left),
                field,
            },
        );
        if can_assign && self.match_token(Token::Equal) {
            let right = self.expression();
            expr = self.node(
                loc,
                AstKind::Assignment {
                    lvalue: Box::new(expr),
                    expr: Box::new(right),
                },
            );
        }
        expr
    }

    fn cast(&mut self, can_assign: bool, left: AstNode) -> AstNode {
        let loc = self.previous_loc();
        let ty = self.type_expr();
        let mut expr = self.node(
            loc.clone(),
            AstKind::Cast {
                expr: Box::new(left),
                ty: Box::new(ty),
            },
        );
        if can_assign && self.match_token(Token::Equal) {
            let right = self.expression();
            expr = self.node(
                loc,
                AstKind::Assignment {
                    lvalue: Box::new(expr),
                    expr: Box::new(right),
                },
            );
        }
        expr
    }

    fn record_initializer(&mut self) -> AstNode {
        let loc = self.previous_loc();
        let mut assignments = Vec::new();
        while !self.check(Token::RightBrace) && !self.check(Token::Eof) {
            let name = self
                .consume_identifier("Expect field name in record literal.");
            self.consume(
                Token::Equal,
                "Expect '=' after field name in record literal.",
            );
            let value = self.expression();
            self.consume(
                Token::Semicolon,
                "Expect ';' after field in record literal.",
            );
            let field_loc = self.previous_loc();
            assignments.push(self.node(
                field_loc,
                AstKind::Param {
                    name,
                    value: Box::new(value),
                },
            ));
            if self.panic_mode {
                break;
            }
        }
        self.consume(Token::RightBrace, "Expect '}' after a record literal.");
        self.node(
            loc,
            AstKind::Initializer {
                assignments,
                kind: InitializerKind::Record,
            },
        )
    }

    fn array_initializer(&mut self) -> AstNode {
        let loc = self.previous_loc();
        let mut values = Vec::new();
        if !self.check(Token::RightBracket) {
            loop {
                values.push(self.parse_precedence(Precedence::Or));
                if !self.match_token(Token::Comma) {
                    break;
                }
            }
        }
        self.consume(Token::RightBracket, "Expect ']' after an array literal.");
        self.node(
            loc,
            AstKind::Initializer {
                assignments: values,
                kind: InitializerKind::Array,
            },
        )
    }

    // ==< Types >==

    fn type_expr(&mut self) -> AstNode {
        let loc = self.current_loc();
        if self.match_token(Token::Caret) {
            let sub = self.type_expr();
            return self.node(loc, AstKind::TypePtr { sub: Box::new(sub) });
        }
        if self.match_token(Token::LeftBracket) {
            let length = self.parse_precedence(Precedence::Or);
            self.consume(
                Token::RightBracket,
                "Expect array size to be followed by ']'.",
            );
            let sub = self.type_expr();
            return self.node(
                loc,
                AstKind::TypeArray {
                    length: Box::new(length),
                    sub: Box::new(sub),
                },
            );
        }
        if self.match_token(Token::LeftParen) {
            let inner = self.type_expr();
            self.consume(
                Token::RightParen,
                "Expect matching ')' in type definition.",
            );
            return inner;
        }
        if self.match_token(Token::Fn) {
            self.consume(
                Token::LeftParen,
                "Expect '(' after 'fn' in function pointer type.",
            );
            let mut params = Vec::new();
            if !self.check(Token::RightParen) {
                loop {
                    params.push(self.type_expr());
                    if !self.match_token(Token::Comma) {
                        break;
                    }
                }
            }
            self.consume(
                Token::RightParen,
                "Expect ')' after a function pointer type.",
            );
            self.consume(
                Token::Colon,
                "Expect ':' after a function pointer type.",
            );
            let ret = self.type_expr();
            return self.node(
                loc,
                AstKind::TypeFn {
                    params,
                    ret: Box::new(ret),
                },
            );
        }
        match self.current().token.clone() {
            Token::TypeName(name) | Token::Identifier(name) => {
                self.advance();
                self.node(loc, AstKind::TypeName { module: None, name })
            }
            _ => {
                self.error_at_current("Expecting a type declaration.");
                self.error_node()
            }
        }
    }

    // ==< Statements & declarations >==

    fn expression_statement(&mut self) -> AstNode {
        let expr = self.expression();
        self.consume(Token::Semicolon, "Expect ';' after expression.");
        expr
    }

    fn block(&mut self) -> AstNode {
        let loc = self.previous_loc();
        let mut decls = Vec::new();
        while !self.check(Token::RightBrace) && !self.check(Token::Eof) {
            decls.push(self.declaration());
        }
        self.consume(Token::RightBrace, "Expect '}' after block.");
        self.node(loc, AstKind::Block { decls })
    }

    fn if_statement(&mut self) -> AstNode {
        let loc = self.previous_loc();
        self.consume(Token::LeftParen, "Expect '(' after 'if'.");
        let condition = self.expression();
        self.consume(Token::RightParen, "Expect ')' after condition.");
        let then_branch = self.statement();
        let else_branch = if self.match_token(Token::Else) {
            Some(Box::new(self.statement()))
        } else {
            None
        };
        self.node(
            loc,
            AstKind::If {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch,
            },
        )
    }

    fn while_statement(&mut self) -> AstNode {
        let loc = self.previous_loc();
        self.consume(Token::LeftParen, "Expect '(' after 'while'.");
        let condition = self.expression();
        self.consume(Token::RightParen, "Expect ')' after condition.");
        let body = self.statement();
        self.node(
            loc,
            AstKind::While {
                condition: Box::new(condition),
                body: Box::new(body),
            },
        )
    }

    fn for_statement(&mut self) -> AstNode {
        let loc = self.previous_loc();
        self.consume(Token::LeftParen, "Expect '(' after 'for'.");
        let initializer = if self.match_token(Token::Semicolon) {
            None
        } else if self.match_token(Token::Var) {
            Some(Box::new(self.var_decl()))
        } else {
            Some(Box::new(self.expression_statement()))
        };
        let condition = if self.match_token(Token::Semicolon) {
            None
        } else {
            let condition = self.expression();
            self.consume(Token::Semicolon, "Expect ';' after loop condition.");
            Some(Box::new(condition))
        };
        let increment = if self.match_token(Token::RightParen) {
            None
        } else {
            let increment = self.expression();
            self.consume(Token::RightParen, "Expect ')' after condition.");
            Some(Box::new(increment))
        };
        let body = self.statement();
        self.node(
            loc,
            AstKind::For {
                initializer,
                condition,
                increment,
                body: Box::new(body),
            },
        )
    }

    fn return_statement(&mut self, top_level: bool) -> AstNode {
        let loc = self.previous_loc();
        let value = if self.match_token(Token::Semicolon) {
            None
        } else {
            let expr = self.expression();
            self.consume(Token::Semicolon, "Expect ';' after return value.");
            Some(Box::new(expr))
        };
        self.exit_emitted = self.exit_emitted || top_level;
        if top_level {
            self.node(loc, AstKind::Exit { value })
        } else {
            self.node(loc, AstKind::Return { value })
        }
    }

    fn statement(&mut self) -> AstNode {
        if self.match_token(Token::LeftBrace) {
            self.block()
        } else if self.match_token(Token::If) {
            self.if_statement()
        } else if self.match_token(Token::For) {
            self.for_statement()
        } else if self.match_token(Token::Return) {
            self.return_statement(false)
        } else if self.match_token(Token::While) {
            self.while_statement()
        } else {
            self.expression_statement()
        }
    }

    fn var_decl(&mut self) -> AstNode {
        let loc = self.previous_loc();
        let name = self.consume_identifier("Expect variable name.");
        self.consume(Token::Colon, "Expect ':' after identifier.");
        let ty = self.type_expr();
        let decl = if self.match_token(Token::Equal) {
            let expr = self.expression();
            AstKind::VarInit {
                name,
                ty: Box::new(ty),
                expr: Box::new(expr),
            }
        } else {
            AstKind::VarDecl {
                name,
                ty: Box::new(ty),
            }
        };
        self.consume(
            Token::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.node(loc, decl)
    }

    fn const_decl(&mut self) -> AstNode {
        let loc = self.previous_loc();
        let name = self.consume_identifier("Expect constant name.");
        self.consume(Token::Colon, "Expect ':' after identifier.");
        let ty = self.type_expr();
        self.consume(Token::Equal, "Expect '=' after constant declaration.");
        let expr = self.expression();
        self.consume(Token::Semicolon, "Expect ';' after expression.");
        self.node(
            loc,
            AstKind::ConstDecl {
                name,
                ty: Box::new(ty),
                expr: Box::new(expr),
            },
        )
    }

    fn asm_decl(&mut self) -> AstNode {
        let loc = self.previous_loc();
        self.consume(Token::LeftBrace, "Expect '{' after keyword 'asm'.");
        let mut strings = Vec::new();
        if !self.check(Token::RightBrace) {
            strings.push(
                self.consume_string("ASM blocks can only contain strings."),
            );
            while let Token::Str(text) = &self.current().token {
                strings.push(text.clone());
                self.advance();
            }
        }
        self.consume(Token::RightBrace, "Expect '}' after keyword 'asm'.");
        self.consume(Token::Semicolon, "Expect ';' after asm declaration.");
        self.node(loc, AstKind::Asm { strings })
    }

    fn fn_decl(&mut self) -> AstNode {
        let loc = self.previous_loc();
        let name = self.consume_identifier("Expect function identifier.");
        self.consume(
            Token::LeftParen,
            "Expect '(' after function identifier.",
        );
        let mut params = Vec::new();
        if !self.check(Token::RightParen) {
            loop {
                let param_name =
                    self.consume_identifier("Expect parameter name.");
                self.consume(Token::Colon, "Expect ':' after parameter name.");
                let ty = self.type_expr();
                let param_loc = self.previous_loc();
                params.push(self.node(
                    param_loc,
                    AstKind::Param {
                        name: param_name,
                        value: Box::new(ty),
                    },
                ));
                if !self.match_token(Token::Comma) {
                    break;
                }
            }
        }
        self.consume(
            Token::RightParen,
            "Expect ')' after function parameter list.",
        );
        self.consume(
            Token::Colon,
            "Expect ':' after function parameter list.",
        );
        let return_type = self.type_expr();
        self.consume(Token::LeftBrace, "Expect '{' before function body.");
        let body = self.block();
        self.node(
            loc,
            AstKind::Fn {
                name,
                params,
                return_type: Box::new(return_type),
                body: Box::new(body),
                type_index: 0,
            },
        )
    }

    fn field_list(&mut self) -> Vec<AstNode> {
        let mut fields = Vec::new();
        while !self.check(Token::RightBrace) && !self.check(Token::Eof) {
            let name = self.consume_identifier("Expect field name.");
            self.consume(Token::Colon, "Expect ':' after field name.");
            let ty = self.type_expr();
            self.consume(
                Token::Semicolon,
                "Expect ';' after field declaration.",
            );
            let loc = self.previous_loc();
            fields.push(self.node(
                loc,
                AstKind::Param {
                    name,
                    value: Box::new(ty),
                },
            ));
            if self.panic_mode {
                break;
            }
        }
        self.consume(Token::RightBrace, "Expect '}' after field list.");
        fields
    }

    fn type_decl(&mut self) -> AstNode {
        let loc = self.previous_loc();
        let name = self.consume_identifier("Expect a data type name.");
        let index = self.types.declare(Some(self.module_name), &name);
        self.consume(Token::LeftBrace, "Expect '{' before type definition.");
        let fields = self.field_list();
        self.node(
            loc,
            AstKind::TypeDecl {
                name,
                fields,
                index,
            },
        )
    }

    fn enum_decl(&mut self) -> AstNode {
        let loc = self.previous_loc();
        let name = self.consume_identifier("Expect an enum name.");
        self.consume(Token::LeftBrace, "Expect '{' before enum definition.");
        let mut members = Vec::new();
        if !self.check(Token::RightBrace) {
            loop {
                let member =
                    self.consume_identifier("Expect enum value name.");
                let value = if self.match_token(Token::Equal) {
                    Some(self.parse_precedence(Precedence::Or))
                } else {
                    None
                };
                members.push((member, value));
                if !self.match_token(Token::Comma) {
                    break;
                }
            }
        }
        self.consume(Token::RightBrace, "Expect '}' after enum definition.");
        self.match_token(Token::Semicolon);
        self.node(loc, AstKind::EnumDecl { name, members })
    }

    fn ext_decl(&mut self) -> AstNode {
        let loc = self.previous_loc();
        if self.match_token(Token::Fn) {
            let name =
                self.consume_identifier("Expect external function name.");
            self.consume(
                Token::LeftParen,
                "Expect '(' after external function name.",
            );
            let mut params = Vec::new();
            if !self.check(Token::RightParen) {
                loop {
                    params.push(self.type_expr());
                    if !self.match_token(Token::Comma) {
                        break;
                    }
                }
            }
            self.consume(
                Token::RightParen,
                "Expect ')' after external function parameters.",
            );
            self.consume(
                Token::Colon,
                "Expect ':' after external function parameters.",
            );
            let ret = self.type_expr();
            self.consume(
                Token::Semicolon,
                "Expect ';' after external declaration.",
            );
            let ty_loc = loc.clone();
            let ty = self.node(
                ty_loc,
                AstKind::TypeFn {
                    params,
                    ret: Box::new(ret),
                },
            );
            return self.node(
                loc,
                AstKind::Ext {
                    symbol_kind: ExtKind::Function,
                    name,
                    ty: Box::new(ty),
                },
            );
        }
        self.consume(Token::Var, "Expect 'fn' or 'var' after 'ext'.");
        let name = self.consume_identifier("Expect external symbol name.");
        self.consume(Token::Colon, "Expect ':' after identifier.");
        let ty = self.type_expr();
        self.consume(
            Token::Semicolon,
            "Expect ';' after external declaration.",
        );
        self.node(
            loc,
            AstKind::Ext {
                symbol_kind: ExtKind::Variable,
                name,
                ty: Box::new(ty),
            },
        )
    }

    fn import_decl(&mut self) -> AstNode {
        let loc = self.previous_loc();
        let module = self.consume_identifier("Expect module name.");
        self.consume(Token::Semicolon, "Expect ';' after import.");
        self.node(loc, AstKind::Import { module })
    }

    fn bank_decl(&mut self) -> AstNode {
        let loc = self.previous_loc();
        let annotation =
            self.consume_string("Expect bank annotation string.");
        self.consume(Token::LeftBrace, "Expect '{' after bank annotation.");
        let mut decls = Vec::new();
        while !self.check(Token::RightBrace) && !self.check(Token::Eof) {
            if self.match_token(Token::Fn) {
                decls.push(self.fn_decl());
            } else {
                decls.push(self.declaration());
            }
        }
        self.consume(Token::RightBrace, "Expect '}' after bank body.");
        self.node(loc, AstKind::Bank { annotation, decls })
    }

    fn declaration(&mut self) -> AstNode {
        let decl = if self.match_token(Token::Var) {
            self.var_decl()
        } else if self.match_token(Token::Const) {
            self.const_decl()
        } else if self.match_token(Token::Asm) {
            self.asm_decl()
        } else {
            self.statement()
        };
        if self.panic_mode {
            self.synchronize();
        }
        decl
    }

    fn top_level(&mut self) -> AstNode {
        let decl = if self.match_token(Token::Type) {
            self.type_decl()
        } else if self.match_token(Token::Enum) {
            self.enum_decl()
        } else if self.match_token(Token::Fn) {
            self.fn_decl()
        } else if self.match_token(Token::Ext) {
            self.ext_decl()
        } else if self.match_token(Token::Import) {
            self.import_decl()
        } else if self.match_token(Token::Bank) {
            self.bank_decl()
        } else if self.match_token(Token::Return) {
            self.return_statement(true)
        } else {
            return self.declaration();
        };
        if self.panic_mode {
            self.synchronize();
        }
        decl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Result<(AstNode, bool), Vec<Diagnostic>> {
        let mut pool = ConstPool::new();
        let mut types = TypeTable::new();
        let mut ids = NodeIdGen::default();
        parse_module(source, "main", 0, &mut pool, &mut types, &mut ids)
    }

    fn decls(node: &AstNode) -> &[AstNode] {
        match &node.kind {
            AstKind::Module { decls, .. } => decls,
            _ => panic!("expected a module"),
        }
    }

    #[test]
    fn precedence_shapes_the_tree() {
        let (module, _) = parse("var x: u8 = 1 + 2 * 3;").unwrap();
        let AstKind::VarInit { expr, .. } = &decls(&module)[0].kind else {
            panic!("expected a var init");
        };
        let AstKind::Binary { op, right, .. } = &expr.kind else {
            panic!("expected a binary expression");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            right.kind,
            AstKind::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn assignment_only_at_loose_precedence() {
        assert!(parse("var a: u8 = 1; a = 2;").is_ok());
        let errors = parse("var a: u8 = 1; 1 + a = 2;").unwrap_err();
        assert!(errors[0].message.contains("Invalid assignment target"));
    }

    #[test]
    fn top_level_return_becomes_exit() {
        let (module, exit_emitted) = parse("return 3;").unwrap();
        assert!(exit_emitted);
        assert!(matches!(
            decls(&module)[0].kind,
            AstKind::Exit { value: Some(_) }
        ));
    }

    #[test]
    fn return_inside_function_stays_return() {
        let (module, exit_emitted) =
            parse("fn main(): u8 { return 3; }").unwrap();
        assert!(!exit_emitted);
        let AstKind::Fn { body, .. } = &decls(&module)[0].kind else {
            panic!("expected a function");
        };
        let AstKind::Block { decls } = &body.kind else {
            panic!("expected a block body");
        };
        assert!(matches!(decls[0].kind, AstKind::Return { .. }));
    }

    #[test]
    fn ref_and_deref_are_prefix_operators() {
        let (module, _) = parse("var p: ^u8 = ^x; @p = 1;").unwrap();
        let AstKind::VarInit { expr, .. } = &decls(&module)[0].kind else {
            panic!("expected a var init");
        };
        assert!(matches!(
            expr.kind,
            AstKind::Unary {
                op: UnaryOp::Ref,
                ..
            }
        ));
        let AstKind::Assignment { lvalue, .. } = &decls(&module)[1].kind
        else {
            panic!("expected an assignment");
        };
        assert!(matches!(
            lvalue.kind,
            AstKind::Unary {
                op: UnaryOp::Deref,
                ..
            }
        ));
    }

    #[test]
    fn compound_types_parse() {
        let (module, _) =
            parse("var f: fn (u8, ^u8): u16; var a: [4]u8;").unwrap();
        let AstKind::VarDecl { ty, .. } = &decls(&module)[0].kind else {
            panic!("expected a var decl");
        };
        assert!(matches!(ty.kind, AstKind::TypeFn { .. }));
        let AstKind::VarDecl { ty, .. } = &decls(&module)[1].kind else {
            panic!("expected a var decl");
        };
        assert!(matches!(ty.kind, AstKind::TypeArray { .. }));
    }

    #[test]
    fn errors_synchronize_to_the_next_statement() {
        let errors = parse("var : u8 = 1; var ok: u8 = 2; var : u8 = 3;")
            .unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn lex_errors_surface_through_the_parser() {
        let errors = parse("var x: u8 = \"abc;").unwrap_err();
        assert!(
            errors
                .iter()
                .any(|e| e.message.contains("Unterminated string"))
        );
    }

    #[test]
    fn qualified_identifiers_carry_their_module() {
        let (module, _) = parse("var x: u8 = other::value;").unwrap();
        let AstKind::VarInit { expr, .. } = &decls(&module)[0].kind else {
            panic!("expected a var init");
        };
        let AstKind::Identifier { module: m, name } = &expr.kind else {
            panic!("expected an identifier");
        };
        assert_eq!(m.as_deref(), Some("other"));
        assert_eq!(name, "value");
    }
}
