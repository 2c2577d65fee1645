//! Loop machinery (§4.9): a shared natural-loop-forest builder plus the
//! individual passes (`CanonicalizeLoop`, `LoopRotate`, `Licm`, `Scev`,
//! `ConstLoopUnroll`, `RemoveEmptyLoop`, `Vectorize`) that all consult it.
//!
//! Loops are found the classical way, over the already-flattened CFG: a
//! back edge is any CFG edge `latch -> header` where `header` dominates
//! `latch`; the loop body is every block that can reach `latch` without
//! passing back through `header`. This workspace only ever sees reducible
//! loops (the front end that would produce irreducible ones is out of
//! scope), so one back edge per header is assumed.

pub mod canonicalize;
pub mod licm;
pub mod remove_empty;
pub mod rotate;
pub mod scev;
pub mod unroll;
pub mod vectorize;

pub use canonicalize::CanonicalizeLoop;
pub use licm::Licm;
pub use remove_empty::RemoveEmptyLoop;
pub use rotate::LoopRotate;
pub use scev::Scev;
pub use unroll::ConstLoopUnroll;
pub use vectorize::Vectorize;

use std::collections::{HashMap, HashSet};

use midopt_ir::{dominates, BlockId, Module, Region};

use crate::error::PassResult;

#[derive(Debug, Clone)]
pub struct NaturalLoop {
    pub header: BlockId,
    pub latch: BlockId,
    pub body: HashSet<BlockId>,
    pub preheader: Option<BlockId>,
}

impl NaturalLoop {
    pub fn exit_edges(&self, module: &Module) -> Vec<(BlockId, BlockId)> {
        let mut out = Vec::new();
        for &b in &self.body {
            let Ok(bb) = module.block(b) else { continue };
            for &s in &bb.succs {
                if !self.body.contains(&s) {
                    out.push((b, s));
                }
            }
        }
        out
    }
}

/// Find every natural loop in `region` (dominators must already be fresh).
/// Nested loops both appear, inner-to-outer order is not guaranteed; callers
/// that care about nesting should sort by `body.len()`.
pub fn find_natural_loops(module: &Module, region: &Region) -> PassResult<Vec<NaturalLoop>> {
    let mut loops = Vec::new();
    for &latch in &region.blocks {
        let Ok(latch_bb) = module.block(latch) else { continue };
        for &header in &latch_bb.succs.clone() {
            if dominates(module, header, latch) {
                let body = loop_body(module, header, latch)?;
                let preheader = single_preheader(module, header, &body);
                loops.push(NaturalLoop { header, latch, body, preheader });
            }
        }
    }
    Ok(loops)
}

fn loop_body(module: &Module, header: BlockId, latch: BlockId) -> PassResult<HashSet<BlockId>> {
    let mut body = HashSet::new();
    body.insert(header);
    body.insert(latch);
    let mut stack = vec![latch];
    while let Some(b) = stack.pop() {
        for &p in &module.block(b)?.preds {
            if body.insert(p) {
                stack.push(p);
            }
        }
    }
    Ok(body)
}

/// A loop has a canonical preheader if `header` has exactly one predecessor
/// outside the loop body.
fn single_preheader(module: &Module, header: BlockId, body: &HashSet<BlockId>) -> Option<BlockId> {
    let preds: Vec<BlockId> = module.block(header).ok()?.preds.iter().copied().filter(|p| !body.contains(p)).collect();
    if preds.len() == 1 {
        Some(preds[0])
    } else {
        None
    }
}

/// Loop nesting depth of `block`: how many loop bodies (by header) contain
/// it, counting only loops reachable from `all_loops`.
pub fn loop_depth(block: BlockId, all_loops: &[NaturalLoop]) -> usize {
    all_loops.iter().filter(|l| l.body.contains(&block)).count()
}

pub fn header_map(all_loops: &[NaturalLoop]) -> HashMap<BlockId, usize> {
    let mut m = HashMap::new();
    for (i, l) in all_loops.iter().enumerate() {
        m.entry(l.header).or_insert(i);
    }
    m
}
