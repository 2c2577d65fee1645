//! Error taxonomy for the analysis crate.
//!
//! Per the propagation policy analyses follow: analyses never fail outward
//! with a semantic error -- an analysis that cannot determine something
//! produces an `unknown`/`Unknown` attribute instead. `AnalysisError` exists
//! only for malformed IR that makes running the analysis meaningless at all
//! (a function with no region, a call naming no such function).

use thiserror::Error;

use midopt_ir::{IrError, OpId};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Ir(#[from] IrError),

    #[error("function op {0} has no body region")]
    FunctionHasNoRegion(OpId),

    #[error("call op {0} names no function in this module")]
    UnresolvedCallee(OpId),
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;
