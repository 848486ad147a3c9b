use thiserror::Error;

/// Errors produced while parsing an operation document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("unexpected character '{ch}' at {line}:{column}")]
    UnexpectedChar { ch: char, line: usize, column: usize },

    #[error("unterminated string starting at {line}:{column}")]
    UnterminatedString { line: usize, column: usize },

    #[error("expected {expected}, found {found} at {line}:{column}")]
    Expected {
        expected: String,
        found: String,
        line: usize,
        column: usize,
    },

    #[error("unexpected end of document")]
    UnexpectedEof,

    #[error("document contains no operation")]
    Empty,

    #[error("unsupported construct: {0}")]
    Unsupported(String),
}

/// Errors produced by type conversions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid entity key: {0}")]
    InvalidEntityKey(String),
}
