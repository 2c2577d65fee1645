//! A direct tree-walking interpreter over the mid-level IR.
//!
//! This is the oracle the Pass Manager's differential-testing mode checks
//! every post-flatten pass against, and the thing the CLI's `-i`/`--compare`
//! flags drive directly: run a module against simulated stdin, and compare
//! stdout plus exit code before and after a transformation.

mod error;
mod externals;
mod interp;
mod memory;
mod value;

pub use error::{InterpError, InterpResult};
pub use interp::{run, Interpreter};
pub use memory::Memory;
pub use value::Value;
