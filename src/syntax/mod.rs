//! The pattern front end: byte classes, lexer and parser.

use std::error::Error as StdError;
use std::fmt;

pub mod classes;
pub mod lexer;
pub mod parser;

pub use classes::{ByteClass, ClassSet};
pub use parser::{Ast, parse};

/// Pattern syntax error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    BadEscape,
    BadRepetition,
    BadCharacterClass,
    UnmatchedOpenParen,
    UnmatchedCloseParen,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadEscape => write!(f, "Pattern contains an invalid escape sequence"),
            Error::BadRepetition => write!(f, "Pattern contains an invalid repetition"),
            Error::BadCharacterClass => write!(f, "Pattern contains an invalid character class"),
            Error::UnmatchedOpenParen => write!(f, "Pattern contains an unmatched '('"),
            Error::UnmatchedCloseParen => write!(f, "Pattern contains an unmatched ')'"),
        }
    }
}

impl StdError for Error {}
