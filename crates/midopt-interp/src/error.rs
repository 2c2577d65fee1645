//! Error taxonomy for the interpreter crate.

use thiserror::Error;

use midopt_ir::{IrError, OpId};

#[derive(Debug, Error)]
pub enum InterpError {
    #[error(transparent)]
    Ir(#[from] IrError),

    #[error("op {0} has no value recorded; interpreter and IR are out of sync")]
    UndefinedValue(OpId),

    #[error("no function named '{0}' in this module")]
    UnknownFunction(String),

    #[error("unknown extern function: {0}")]
    UnknownExtern(String),

    #[error("phi {phi} has no operand tagged with predecessor bb{from}")]
    UndefPhiEdge { phi: OpId, from: u32 },

    #[error("address {0} is out of bounds of the interpreter's memory arena")]
    OutOfBounds(i64),

    #[error("unsupported opcode in the interpreter: {0:?}")]
    UnsupportedOpcode(midopt_ir::Opcode),
}

pub type InterpResult<T> = Result<T, InterpError>;
