//! IR core: the arena-backed data model (operations, basic blocks, regions,
//! modules, attributes), the Builder insertion-cursor API, and the
//! dominator/post-dominator/liveness computations every analysis and pass
//! in this workspace is built on.

pub mod attr;
pub mod block;
pub mod builder;
pub mod dominators;
pub mod error;
pub mod id;
pub mod liveness;
pub mod module;
pub mod op;
pub mod opcode;
pub mod region;
pub mod textformat;

pub use attr::{Attr, AttrKind, AttrMap, AliasSet, RangeValue};
pub use block::BasicBlock;
pub use builder::{Builder, Cursor};
pub use error::{IrError, IrResult};
pub use id::{BlockId, OpId, RegionId};
pub use module::Module;
pub use op::{Op, OperandList, ValueType};
pub use opcode::Opcode;
pub use region::Region;
pub use textformat::{dump, parse};
pub use dominators::{compute_dominators, compute_post_dominators, dom_tree_children, dom_tree_preorder, dominates, recompute_cfg};
pub use liveness::compute_liveness;
