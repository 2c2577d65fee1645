//! Error taxonomy for the pass suite and its driver.

use thiserror::Error;

use midopt_analysis::AnalysisError;
use midopt_ir::IrError;
use midopt_smt::SmtError;

#[derive(Debug, Error)]
pub enum PassError {
    #[error(transparent)]
    Ir(#[from] IrError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Smt(#[from] SmtError),

    #[error("verification failed after pass '{pass}': {message}")]
    VerifyFailed { pass: String, message: String },

    #[error(
        "differential test mismatch after pass '{pass}': expected exit {expected_exit}, got {actual_exit}; expected stdout {expected_stdout:?}, got {actual_stdout:?}"
    )]
    DifferentialMismatch {
        pass: String,
        expected_stdout: String,
        actual_stdout: String,
        expected_exit: i32,
        actual_exit: i32,
    },

    #[error("differential test oracle failed after pass '{pass}': {message}")]
    OracleFailed { pass: String, message: String },
}

pub type PassResult<T> = Result<T, PassError>;
