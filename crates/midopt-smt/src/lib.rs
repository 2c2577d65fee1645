//! Auxiliary SAT / bit-vector SMT subsystem.
//!
//! A self-contained CDCL core ([`sat`]) plus a bit-blasting fixed-width
//! bit-vector layer on top of it ([`bv`]), and a DIMACS-like parser
//! ([`dimacs`]) for the standalone `--sat` CLI mode. `SynthConstArray` is
//! the only optimizer pass that reaches into this crate; everything else
//! here is also directly exercised by the CLI's `--sat`/`--bv` solver modes.

mod bv;
mod dimacs;
mod error;
mod sat;

pub use bv::{BitVec, BvBuilder};
pub use dimacs::{parse as parse_dimacs, solver_for, Cnf};
pub use error::{SmtError, SmtResult};
pub use sat::{SatResult, Solver};
