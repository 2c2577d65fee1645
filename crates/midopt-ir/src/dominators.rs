//! Dominator and post-dominator computation (Cooper-Harvey-Kennedy, "A
//! Simple, Fast Dominance Algorithm") plus CFG predecessor/successor
//! recomputation from terminator attributes.

use std::collections::{HashMap, HashSet};

use crate::error::IrResult;
use crate::id::BlockId;
use crate::module::Module;
use crate::opcode::Opcode;
use crate::region::Region;

/// Sentinel used only inside post-dominator computation to stand for the
/// single virtual exit node joining every real exit block. Never stored on
/// a `BasicBlock` or returned to callers.
const VIRTUAL_EXIT: BlockId = BlockId(u32::MAX);

/// Recompute every block's `preds`/`succs` in `region` from its
/// terminator's `Target`/`Else` attributes. Must be called (and the result
/// used immediately) any time a terminator is rewritten, since nothing
/// else keeps these derived sets in sync.
pub fn recompute_cfg(module: &mut Module, region: &Region) -> IrResult<()> {
    for &block_id in &region.blocks {
        module.block_mut(block_id)?.succs.clear();
    }
    for &block_id in &region.blocks {
        let succs = terminator_successors(module, block_id)?;
        for &s in &succs {
            module.block_mut(s)?.preds.retain(|&p| p != block_id);
        }
    }
    for &block_id in &region.blocks {
        module.block_mut(block_id)?.preds.clear();
    }
    for &block_id in &region.blocks {
        let succs = terminator_successors(module, block_id)?;
        module.block_mut(block_id)?.succs = succs.clone();
        for s in succs {
            module.block_mut(s)?.preds.push(block_id);
        }
    }
    Ok(())
}

fn terminator_successors(module: &Module, block: BlockId) -> IrResult<Vec<BlockId>> {
    let b = module.block(block)?;
    let Some(term) = b.terminator() else { return Ok(Vec::new()) };
    let op = module.op(term)?;
    Ok(match op.opcode {
        Opcode::Goto => op.target_block().into_iter().collect(),
        Opcode::Branch => {
            let mut v = Vec::new();
            if let Some(t) = op.target_block() {
                v.push(t);
            }
            if let Some(e) = op.else_block() {
                v.push(e);
            }
            v
        }
        Opcode::Return => Vec::new(),
        _ => Vec::new(),
    })
}

/// Reverse-postorder over the successor relation starting at `entry`; every
/// block unreachable from `entry` is simply omitted (dominator queries
/// about unreachable blocks are meaningless and callers should not ask).
fn reverse_postorder(entry: BlockId, succs_of: impl Fn(BlockId) -> Vec<BlockId>) -> Vec<BlockId> {
    let mut visited = HashSet::new();
    let mut postorder = Vec::new();
    let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
    visited.insert(entry);
    while let Some((node, next_child)) = stack.pop() {
        let children = succs_of(node);
        if next_child < children.len() {
            let child = children[next_child];
            stack.push((node, next_child + 1));
            if visited.insert(child) {
                stack.push((child, 0));
            }
        } else {
            postorder.push(node);
        }
    }
    postorder.reverse();
    postorder
}

fn intersect(mut a: BlockId, mut b: BlockId, idom: &HashMap<BlockId, BlockId>, rpo_index: &HashMap<BlockId, usize>) -> BlockId {
    while a != b {
        while rpo_index[&a] > rpo_index[&b] {
            a = idom[&a];
        }
        while rpo_index[&b] > rpo_index[&a] {
            b = idom[&b];
        }
    }
    a
}

fn compute_idom(
    entry: BlockId,
    rpo: &[BlockId],
    preds_of: impl Fn(BlockId) -> Vec<BlockId>,
) -> HashMap<BlockId, BlockId> {
    let rpo_index: HashMap<BlockId, usize> = rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();
    let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
    idom.insert(entry, entry);
    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo.iter() {
            if b == entry {
                continue;
            }
            let mut new_idom: Option<BlockId> = None;
            for p in preds_of(b) {
                if !idom.contains_key(&p) {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(ni) => intersect(ni, p, &idom, &rpo_index),
                });
            }
            if let Some(ni) = new_idom {
                if idom.get(&b) != Some(&ni) {
                    idom.insert(b, ni);
                    changed = true;
                }
            }
        }
    }
    idom
}

/// Compute and store `idom` on every reachable block of `region`. Requires
/// `preds`/`succs` already populated (call [`recompute_cfg`] first).
pub fn compute_dominators(module: &mut Module, region: &Region) -> IrResult<()> {
    let Some(entry) = region.entry() else { return Ok(()) };
    let succs_of = |b: BlockId| module.block(b).map(|bb| bb.succs.clone()).unwrap_or_default();
    let preds_of = |b: BlockId| module.block(b).map(|bb| bb.preds.clone()).unwrap_or_default();
    let rpo = reverse_postorder(entry, succs_of);
    let idom = compute_idom(entry, &rpo, preds_of);
    tracing::debug!(region = region.id.0, blocks = rpo.len(), "computed dominator tree");
    for &b in &rpo {
        let value = if b == entry { None } else { idom.get(&b).copied() };
        module.block_mut(b)?.idom = value;
    }
    Ok(())
}

/// Compute and store `ipdom` on every block of `region` that can reach an
/// exit. An exit block (no successors, i.e. `Return`-terminated) has
/// `ipdom == None`.
pub fn compute_post_dominators(module: &mut Module, region: &Region) -> IrResult<()> {
    let exits: Vec<BlockId> = region
        .blocks
        .iter()
        .copied()
        .filter(|&b| module.block(b).map(|bb| bb.succs.is_empty()).unwrap_or(false))
        .collect();
    if exits.is_empty() {
        return Ok(());
    }
    let succs_of = |b: BlockId| -> Vec<BlockId> {
        if b == VIRTUAL_EXIT {
            exits.clone()
        } else {
            module.block(b).map(|bb| bb.preds.clone()).unwrap_or_default()
        }
    };
    let preds_of = |b: BlockId| -> Vec<BlockId> {
        if b == VIRTUAL_EXIT {
            Vec::new()
        } else if module.block(b).map(|bb| bb.succs.is_empty()).unwrap_or(false) {
            vec![VIRTUAL_EXIT]
        } else {
            module.block(b).map(|bb| bb.succs.clone()).unwrap_or_default()
        }
    };
    let rpo = reverse_postorder(VIRTUAL_EXIT, succs_of);
    let idom = compute_idom(VIRTUAL_EXIT, &rpo, preds_of);
    for &b in &rpo {
        if b == VIRTUAL_EXIT {
            continue;
        }
        let value = idom.get(&b).copied().filter(|&v| v != VIRTUAL_EXIT);
        module.block_mut(b)?.ipdom = value;
    }
    Ok(())
}

/// `a` dominates `b` iff walking `idom` from `b` reaches `a` (every block
/// dominates itself).
pub fn dominates(module: &Module, a: BlockId, b: BlockId) -> bool {
    if a == b {
        return true;
    }
    let mut cur = b;
    loop {
        let Ok(block) = module.block(cur) else { return false };
        match block.idom {
            Some(idom) if idom == cur => return false,
            Some(idom) => {
                if idom == a {
                    return true;
                }
                cur = idom;
            }
            None => return false,
        }
    }
}

pub fn dom_tree_children(module: &Module, region: &Region) -> HashMap<BlockId, Vec<BlockId>> {
    let mut children: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
    for &b in &region.blocks {
        if let Ok(block) = module.block(b) {
            if let Some(idom) = block.idom {
                if idom != b {
                    children.entry(idom).or_default().push(b);
                }
            }
        }
    }
    children
}

/// Dominator-tree preorder: parent before children, stable within siblings
/// by `BlockId` order. Used by GVN and Mem2Reg's renaming pass.
pub fn dom_tree_preorder(module: &Module, region: &Region) -> Vec<BlockId> {
    let children = dom_tree_children(module, region);
    let Some(entry) = region.entry() else { return Vec::new() };
    let mut order = Vec::new();
    let mut stack = vec![entry];
    while let Some(b) = stack.pop() {
        order.push(b);
        if let Some(kids) = children.get(&b) {
            let mut kids = kids.clone();
            kids.sort_by_key(|k| std::cmp::Reverse(k.0));
            stack.extend(kids);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;

    /// Builds: entry -> (branches to) then_block / else_block, both -> merge.
    fn diamond(module: &mut Module) -> (Region, BlockId, BlockId, BlockId, BlockId) {
        let region_id = module.alloc_region();
        let entry = module.alloc_block();
        module.region_mut_pub(region_id).unwrap().append(entry);
        let then_b = module.alloc_block();
        module.region_mut_pub(region_id).unwrap().append(then_b);
        let else_b = module.alloc_block();
        module.region_mut_pub(region_id).unwrap().append(else_b);
        let merge = module.alloc_block();
        module.region_mut_pub(region_id).unwrap().append(merge);

        let mut b = Builder::at_block_end(module, entry);
        let c = b.const_int(1).unwrap();
        b.branch(c, then_b, else_b).unwrap();
        let mut b = Builder::at_block_end(module, then_b);
        b.goto(merge).unwrap();
        let mut b = Builder::at_block_end(module, else_b);
        b.goto(merge).unwrap();
        let mut b = Builder::at_block_end(module, merge);
        b.ret(None).unwrap();

        let region = module.region(region_id).unwrap().clone();
        (region, entry, then_b, else_b, merge)
    }

    #[test]
    fn dominance_over_diamond() {
        let mut m = Module::new();
        let (region, entry, then_b, else_b, merge) = diamond(&mut m);
        recompute_cfg(&mut m, &region).unwrap();
        compute_dominators(&mut m, &region).unwrap();
        assert!(dominates(&m, entry, merge));
        assert!(dominates(&m, entry, then_b));
        assert!(!dominates(&m, then_b, merge));
        assert!(!dominates(&m, else_b, then_b));
        assert_eq!(m.block(merge).unwrap().idom, Some(entry));
    }

    #[test]
    fn post_dominance_over_diamond() {
        let mut m = Module::new();
        let (region, entry, then_b, else_b, merge) = diamond(&mut m);
        recompute_cfg(&mut m, &region).unwrap();
        compute_post_dominators(&mut m, &region).unwrap();
        assert_eq!(m.block(entry).unwrap().ipdom, Some(merge));
        assert_eq!(m.block(then_b).unwrap().ipdom, Some(merge));
        assert_eq!(m.block(else_b).unwrap().ipdom, Some(merge));
        assert_eq!(m.block(merge).unwrap().ipdom, None);
    }

    #[test]
    fn preorder_starts_with_entry() {
        let mut m = Module::new();
        let (region, entry, _, _, _) = diamond(&mut m);
        recompute_cfg(&mut m, &region).unwrap();
        compute_dominators(&mut m, &region).unwrap();
        let order = dom_tree_preorder(&m, &region);
        assert_eq!(order.first(), Some(&entry));
        assert_eq!(order.len(), 4);
    }
}
