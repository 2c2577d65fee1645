//! Analyses that annotate a [`midopt_ir::Module`] with derived facts: who
//! calls whom, which functions are pure, which pointers can alias, what
//! integer range a value holds, and which functions run at most once.
//!
//! Every analysis here writes its result back onto the IR as attributes
//! (`CallerAttr`, `ImpureAttr`, `AliasAttr`, `RangeAttr`, `AtMostOnceAttr`)
//! rather than returning a side table, so a pass can consult a prior
//! analysis's result just by reading the op it cares about.

pub mod alias;
pub mod at_most_once;
pub mod callgraph;
pub mod error;
pub mod pureness;
pub mod range;

pub use alias::{compute_alias, may_alias, must_alias, never_alias};
pub use at_most_once::compute_at_most_once;
pub use callgraph::{call_target, compute_call_graph, CallGraph};
pub use error::{AnalysisError, AnalysisResult};
pub use pureness::compute_pureness;
pub use range::{compute_range, split_at_branches};
