use std::fmt;

use thiserror::Error;

/// One located message in the `[line N; pos M] Error at 'x': ...`
/// shape shared by every stage that reports against a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    pub lexeme: String,
    pub line: usize,
    pub pos: usize,
    pub at_end: bool,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}; pos {}] Error", self.line, self.pos)?;
        if self.at_end {
            write!(f, " at end")?;
        } else if !self.lexeme.is_empty() {
            write!(f, " at '{}'", self.lexeme)?;
        }
        write!(f, ": {}", self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseErrors(pub Vec<Diagnostic>);

impl fmt::Display for ParseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, diagnostic) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{diagnostic}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompilerError {
    #[error("{0}")]
    Parse(ParseErrors),
    #[error("{0}")]
    Resolve(Diagnostic),
    #[error("{0}")]
    ConstEval(Diagnostic),
    #[error("Types cannot be recursively defined.")]
    RecursiveType,
    #[error("Type '{0}' is already defined with a different kind.")]
    TypeRedefinition(String),
    #[error("Module '{0}' is declared more than once.")]
    DuplicateModule(String),
    #[error("Out of registers; expression is too complex.")]
    RegisterExhausted,
    #[error("Double-freeing a scratch register.")]
    RegisterDoubleFree,
    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),
    #[error("Operation not supported by the platform: {0}")]
    UnsupportedOperation(String),
}

impl From<Vec<Diagnostic>> for CompilerError {
    fn from(value: Vec<Diagnostic>) -> Self {
        CompilerError::Parse(ParseErrors(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_renders_location_and_lexeme() {
        let diagnostic = Diagnostic {
            message: "Expect expression.".into(),
            lexeme: ";".into(),
            line: 3,
            pos: 7,
            at_end: false,
        };
        assert_eq!(
            diagnostic.to_string(),
            "[line 3; pos 7] Error at ';': Expect expression."
        );
    }

    #[test]
    fn diagnostic_at_end() {
        let diagnostic = Diagnostic {
            message: "Expect end of expression.".into(),
            lexeme: String::new(),
            line: 1,
            pos: 1,
            at_end: true,
        };
        assert_eq!(
            diagnostic.to_string(),
            "[line 1; pos 1] Error at end: Expect end of expression."
        );
    }
}
