//! `GCM` (Global Code Motion, §4.10): schedules every pure op to a single
//! legal block chosen to minimize loop depth, between two extremes computed
//! over the dominator tree -- "early" (as close to the entry as dominance
//! of its operands allows) and "late" (as close to its uses as dominance
//! *by* it allows, i.e. the least common ancestor of every use's block).
//! Impure ops are pinned in place; they never move.
//!
//! Both `early`/`late` are computed over a topological order derived from
//! the existing op list: because this IR's SSA invariant already requires
//! every operand to be defined earlier in dominance order, a single pass
//! over `(blocks in dominator-tree preorder) x (ops in block order)` is a
//! valid topological order for the schedulable subgraph, and its reverse is
//! a valid reverse-topological order -- no separate sort is needed.

use std::collections::HashMap;

use midopt_ir::{compute_dominators, dom_tree_preorder, recompute_cfg, BlockId, Module, OpId, Opcode};

use crate::error::PassResult;
use crate::loops::{find_natural_loops, loop_depth, NaturalLoop};
use crate::pass::Pass;

pub struct Gcm;

impl Pass for Gcm {
    fn name(&self) -> &'static str {
        "GCM"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        for func in module.functions() {
            let Some(region) = module.op(func)?.region else { continue };
            if module.region(region)?.blocks.is_empty() {
                continue;
            }
            let snapshot = module.region(region)?.clone();
            recompute_cfg(module, &snapshot)?;
            compute_dominators(module, &snapshot)?;
            let Some(entry) = snapshot.entry() else { continue };
            let loops = find_natural_loops(module, &snapshot)?;
            let order = dom_tree_preorder(module, &snapshot);
            let depth: HashMap<BlockId, u32> = order.iter().enumerate().map(|(i, &b)| (b, dom_depth(module, b, &order[..i]))).collect();

            let topo = schedulable_topo_order(module, &order)?;
            let early = schedule_early(module, &topo, entry, &depth)?;
            let late = schedule_late(module, &topo, &early)?;
            if apply_schedule(module, &topo, &early, &late, &loops)? {
                changed = true;
            }
        }
        Ok(changed)
    }
}

fn is_schedulable_op(module: &Module, op: OpId) -> bool {
    module.op(op).map(|o| o.opcode.is_schedulable()).unwrap_or(false)
}

/// Dominator-tree depth of `block`, computed by walking `idom` up to a
/// block already assigned a depth in `known` (all ancestors precede `block`
/// in dominator-tree preorder, so this always terminates).
fn dom_depth(module: &Module, block: BlockId, known: &[BlockId]) -> u32 {
    let mut depths: HashMap<BlockId, u32> = HashMap::new();
    for &b in known {
        if let Ok(bb) = module.block(b) {
            if let Some(idom) = bb.idom {
                let parent_depth = depths.get(&idom).copied().unwrap_or(0);
                depths.insert(b, parent_depth + 1);
            } else {
                depths.insert(b, 0);
            }
        }
    }
    let Ok(bb) = module.block(block) else { return 0 };
    match bb.idom {
        None => 0,
        Some(idom) => depths.get(&idom).copied().unwrap_or(0) + 1,
    }
}

fn schedulable_topo_order(module: &Module, block_order: &[BlockId]) -> PassResult<Vec<OpId>> {
    let mut out = Vec::new();
    for &b in block_order {
        for &op_id in &module.block(b)?.ops {
            if is_schedulable_op(module, op_id) {
                out.push(op_id);
            }
        }
    }
    Ok(out)
}

fn current_block_of(module: &Module, op: OpId, computed: &HashMap<OpId, BlockId>) -> Option<BlockId> {
    computed.get(&op).copied().or_else(|| module.op(op).ok().and_then(|o| o.parent))
}

fn schedule_early(module: &Module, topo: &[OpId], entry: BlockId, depth: &HashMap<BlockId, u32>) -> PassResult<HashMap<OpId, BlockId>> {
    let mut early: HashMap<OpId, BlockId> = HashMap::new();
    for &op_id in topo {
        let op = module.op(op_id)?;
        let mut best = entry;
        for &operand in &op.operands {
            let Some(ob) = current_block_of(module, operand, &early) else { continue };
            if depth.get(&ob).copied().unwrap_or(0) > depth.get(&best).copied().unwrap_or(0) {
                best = ob;
            }
        }
        early.insert(op_id, best);
    }
    Ok(early)
}

fn schedule_late(module: &Module, topo: &[OpId], early: &HashMap<OpId, BlockId>) -> PassResult<HashMap<OpId, BlockId>> {
    let mut late: HashMap<OpId, BlockId> = HashMap::new();
    for &op_id in topo.iter().rev() {
        let uses = module.op(op_id)?.uses.clone();
        let mut lca: Option<BlockId> = None;
        for user in uses {
            let Ok(user_op) = module.op(user) else { continue };
            let user_block = if user_op.opcode == Opcode::Phi {
                let idx = user_op.operands.iter().position(|&o| o == op_id);
                match idx.and_then(|i| user_op.phi_incoming.get(i).copied()) {
                    Some(b) => b,
                    None => continue,
                }
            } else {
                match current_block_of(module, user, late) {
                    Some(b) => b,
                    None => continue,
                }
            };
            lca = Some(match lca {
                None => user_block,
                Some(existing) => lowest_common_ancestor(module, existing, user_block),
            });
        }
        late.insert(op_id, lca.unwrap_or_else(|| early.get(&op_id).copied().unwrap_or(user_fallback(module, op_id))));
    }
    Ok(late)
}

fn user_fallback(module: &Module, op: OpId) -> BlockId {
    module.op(op).ok().and_then(|o| o.parent).unwrap_or(BlockId(0))
}

fn ancestors(module: &Module, mut block: BlockId) -> Vec<BlockId> {
    let mut out = vec![block];
    while let Ok(bb) = module.block(block) {
        match bb.idom {
            Some(p) if p != block => {
                out.push(p);
                block = p;
            }
            _ => break,
        }
    }
    out
}

fn lowest_common_ancestor(module: &Module, a: BlockId, b: BlockId) -> BlockId {
    let a_chain = ancestors(module, a);
    let b_chain: std::collections::HashSet<BlockId> = ancestors(module, b).into_iter().collect();
    a_chain.into_iter().find(|c| b_chain.contains(c)).unwrap_or(a)
}

/// For each schedulable op, walk from its late block up to (and including)
/// its early block, choosing the ancestor with the lowest loop depth;
/// ties keep the first one found (closest to `late`, i.e. as close to the
/// op's uses, and therefore its register pressure window, as legal).
fn apply_schedule(module: &mut Module, topo: &[OpId], early: &HashMap<OpId, BlockId>, late: &HashMap<OpId, BlockId>, loops: &[NaturalLoop]) -> PassResult<bool> {
    let mut changed = false;
    for &op_id in topo {
        let Some(&early_b) = early.get(&op_id) else { continue };
        let Some(&late_b) = late.get(&op_id) else { continue };
        let mut best = late_b;
        let mut best_depth = loop_depth(late_b, loops);
        let mut cur = late_b;
        while cur != early_b {
            let Ok(bb) = module.block(cur) else { break };
            let Some(idom) = bb.idom else { break };
            cur = idom;
            let d = loop_depth(cur, loops);
            if d < best_depth {
                best_depth = d;
                best = cur;
            }
        }
        let current_parent = module.op(op_id)?.parent;
        if current_parent != Some(best) {
            move_before_terminator(module, op_id, best)?;
            changed = true;
        }
    }
    Ok(changed)
}

fn move_before_terminator(module: &mut Module, op: OpId, target: BlockId) -> PassResult<()> {
    if let Some(old_parent) = module.op(op)?.parent {
        module.block_mut(old_parent)?.remove_op(op);
    }
    let terminator_pos = module.block(target)?.terminator().and_then(|t| module.block(target).unwrap().position(t));
    let index = terminator_pos.unwrap_or_else(|| module.block(target).unwrap().ops.len());
    module.block_mut(target)?.insert_at(index, op);
    module.op_mut(op)?.parent = Some(target);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Attr, Builder as B, ValueType as VT};

    fn new_function(m: &mut Module, name: &str) -> (OpId, BlockId) {
        let f = m.alloc_op(Opcode::Function, VT::Void);
        m.op_mut(f).unwrap().attrs.set(Attr::Name(name.to_string()));
        let region = m.alloc_region();
        m.op_mut(f).unwrap().region = Some(region);
        let top = m.top_block;
        m.block_mut(top).unwrap().append(f);
        m.op_mut(f).unwrap().parent = Some(top);
        let entry = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(entry);
        (f, entry)
    }

    #[test]
    fn pure_op_computed_in_entry_but_used_only_in_one_branch_sinks_into_it() {
        let mut m = Module::new();
        let (f, entry) = new_function(&mut m, "main");
        let region = m.op(f).unwrap().region.unwrap();
        let then_b = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(then_b);
        let else_b = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(else_b);

        let mut b = B::at_block_end(&mut m, entry);
        let x = b.create(Opcode::GetArg, VT::I32, [], [Attr::Int(0)]).unwrap();
        let y = b.create(Opcode::GetArg, VT::I32, [], [Attr::Int(1)]).unwrap();
        let sum = b.create(Opcode::AddI, VT::I32, [x, y], []).unwrap();
        let cond = b.const_int(1).unwrap();
        b.branch(cond, then_b, else_b).unwrap();

        let mut b = B::at_block_end(&mut m, then_b);
        let doubled = b.create(Opcode::AddI, VT::I32, [sum, sum], []).unwrap();
        b.ret(Some(doubled)).unwrap();

        let mut b = B::at_block_end(&mut m, else_b);
        b.ret(None).unwrap();

        let mut pass = Gcm;
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);
        assert_eq!(m.op(sum).unwrap().parent, Some(then_b));
    }

    #[test]
    fn pure_op_used_in_both_branches_stays_in_entry() {
        let mut m = Module::new();
        let (f, entry) = new_function(&mut m, "main");
        let region = m.op(f).unwrap().region.unwrap();
        let then_b = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(then_b);
        let else_b = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(else_b);

        let mut b = B::at_block_end(&mut m, entry);
        let x = b.create(Opcode::GetArg, VT::I32, [], [Attr::Int(0)]).unwrap();
        let y = b.create(Opcode::GetArg, VT::I32, [], [Attr::Int(1)]).unwrap();
        let sum = b.create(Opcode::AddI, VT::I32, [x, y], []).unwrap();
        let cond = b.const_int(1).unwrap();
        b.branch(cond, then_b, else_b).unwrap();

        let mut b = B::at_block_end(&mut m, then_b);
        b.ret(Some(sum)).unwrap();
        let mut b = B::at_block_end(&mut m, else_b);
        b.ret(Some(sum)).unwrap();

        let mut pass = Gcm;
        pass.run(&mut m).unwrap();
        assert_eq!(m.op(sum).unwrap().parent, Some(entry));
    }
}
