//! The pass suite: every rewrite that turns a freshly-built [`midopt_ir::Module`]
//! into one ready for backend lowering, plus the [`pass::Pass`]/[`pass::PassManager`]
//! machinery that sequences them and the [`verify::verify`] checker that
//! validates structural invariants between stages.

pub mod error;
pub mod const_globals;
pub mod dae;
pub mod dce;
pub mod dse_dle;
pub mod flatten;
pub mod fold;
pub mod gcm;
pub mod gvn;
pub mod inline;
pub mod instschedule;
pub mod localize_globalize;
pub mod loops;
pub mod mem2reg;
pub mod move_alloca;
pub mod pass;
pub mod pipeline;
pub mod remerge_raise_to_for;
pub mod select;
pub mod simplify_cfg;
pub mod structured_cleanup;
pub mod synth_const_array;
pub mod tco;
pub mod verify;

pub use const_globals::{HoistConstArray, InlineStore};
pub use dae::Dae;
pub use dce::{AggressiveDce, Dce};
pub use dse_dle::{Dle, Dse};
pub use error::{PassError, PassResult};
pub use flatten::Flatten;
pub use fold::FoldPass;
pub use gcm::Gcm;
pub use gvn::Gvn;
pub use inline::{EarlyInline, Inline, LateInline};
pub use instschedule::InstSchedule;
pub use localize_globalize::{Globalize, Localize};
pub use loops::canonicalize::CanonicalizeLoop;
pub use loops::licm::Licm;
pub use loops::remove_empty::RemoveEmptyLoop;
pub use loops::rotate::LoopRotate;
pub use loops::unroll::ConstLoopUnroll;
pub use loops::vectorize::Vectorize;
pub use mem2reg::Mem2Reg;
pub use move_alloca::MoveAlloca;
pub use pass::{DifferentialOracle, ExpectedOutput, Pass, PassManager};
pub use pipeline::default_pipeline;
pub use remerge_raise_to_for::{RaiseToFor, Remerge};
pub use select::Select;
pub use simplify_cfg::SimplifyCfg;
pub use structured_cleanup::{ColumnMajor, LoopDce, Parallelizable, TidyMemory, View};
pub use synth_const_array::SynthConstArray;
pub use tco::Tco;
pub use verify::verify;
