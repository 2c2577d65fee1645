//! Error taxonomy for the IR crate.

use thiserror::Error;

use crate::id::{BlockId, OpId, RegionId};

/// Errors raised by the IR core: malformed mutations, invariant violations
/// caught eagerly (as opposed to by `Verify`, which catches them after the
/// fact), and textual-format round-trip failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IrError {
    #[error("op {0} not found in module")]
    UnknownOp(OpId),

    #[error("block {0} not found in region")]
    UnknownBlock(BlockId),

    #[error("region {0} not found in module")]
    UnknownRegion(RegionId),

    #[error("cannot erase op {0}: {1} use(s) remain")]
    EraseWithUses(OpId, usize),

    #[error("op {0} expects {expected} operand(s), got {got}", expected = .expected, got = .got)]
    OperandArity { op: OpId, expected: usize, got: usize },

    #[error("phi {phi} in block {block} has {operands} operand(s) but block has {preds} predecessor(s)")]
    PhiShapeMismatch {
        phi: OpId,
        block: BlockId,
        operands: usize,
        preds: usize,
    },

    #[error("block {0} has no terminator")]
    MissingTerminator(BlockId),

    #[error("attribute {0:?} missing on op {1}")]
    MissingAttr(crate::attr::AttrKind, OpId),

    #[error("attribute {0:?} has the wrong payload type on op {1}")]
    AttrTypeMismatch(crate::attr::AttrKind, OpId),

    #[error("malformed textual IR at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("no insertion cursor is active")]
    NoCursor,
}

pub type IrResult<T> = Result<T, IrError>;
