//! Error taxonomy for the solver crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SmtError {
    #[error("dimacs parse error at line {line}: {message}")]
    Dimacs { line: usize, message: String },

    #[error("bit-vector op on mismatched widths: {a} vs {b}")]
    WidthMismatch { a: u32, b: u32 },

    #[error("unsupported bit-vector opcode: {0}")]
    UnsupportedOp(String),
}

pub type SmtResult<T> = Result<T, SmtError>;
