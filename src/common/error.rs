//! User-facing compilation errors.
//!
//! Only the frontend produces these: once an AST has type-checked, the rest of
//! the compiler treats any inconsistency as an internal bug and panics with an
//! assertion message instead of returning an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("lex error: {0}")]
    Lex(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("type error: {0}")]
    Type(String),
}

pub type Result<T> = std::result::Result<T, CompileError>;
