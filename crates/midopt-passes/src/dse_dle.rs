//! `DSE`/`DLE`: store/load dataflow cleanup per §4.7, run after `Alias`.
//!
//! Both are local, single forward scan per block in dominator-tree preorder
//! (no fixpoint needed -- a store's liveness only ever depends on what
//! follows it along one path from entry, and we're conservative about
//! anything that isn't must/never alias resolved). `Alias` attributes must
//! already be attached before either pass runs; neither recomputes them.

use std::collections::HashMap;

use midopt_analysis::{may_alias, must_alias};
use midopt_ir::{compute_dominators, dom_tree_children, recompute_cfg, Attr, AttrKind, BlockId, Module, OpId, Opcode};

use crate::error::PassResult;
use crate::pass::Pass;

fn store_addr(module: &Module, store: OpId) -> Option<OpId> {
    module.op(store).ok().and_then(|op| (op.opcode == Opcode::Store).then(|| op.operands[1]))
}

/// A store is never provably dead if its address's alias set names (or
/// merges to) a global base, or is unknown altogether -- either way some
/// caller or later aliasing access this pass can't see might depend on it.
fn escapes_or_global(module: &Module, addr: OpId) -> bool {
    use midopt_ir::AliasSet;
    match module.op(addr).ok().and_then(|op| op.attr(AttrKind::Alias)).and_then(Attr::as_alias) {
        Some(AliasSet::Known(bases)) => bases.keys().any(|&base| module.op(base).map(|op| op.opcode == Opcode::GetGlobal).unwrap_or(true)),
        _ => true,
    }
}

/// `DSE`: a store with no later read before either the function returns or
/// a must-aliasing store overwrites it is dead, unless its base is a global
/// or escapes into an impure call's arguments (never provably dead then).
pub struct Dse;

impl Pass for Dse {
    fn name(&self) -> &'static str {
        "DSE"
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
            let children = dom_tree_children(module, &snapshot);
            let Some(entry) = snapshot.entry() else { continue };
            let mut last_store: HashMap<OpId, OpId> = HashMap::new();
            let mut read: std::collections::HashSet<OpId> = std::collections::HashSet::new();
            let mut dead: Vec<OpId> = Vec::new();
            dse_block(module, entry, &children, &mut last_store, &mut read, &mut dead)?;
            for store in dead {
                if module.op(store).is_ok() {
                    module.force_erase_op(store)?;
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

fn dse_block(module: &Module, block: BlockId, children: &HashMap<BlockId, Vec<BlockId>>, last_store: &mut HashMap<OpId, OpId>, read: &mut std::collections::HashSet<OpId>, dead: &mut Vec<OpId>) -> PassResult<()> {
    let mut undo: Vec<(OpId, Option<OpId>)> = Vec::new();
    let ops = module.block(block)?.ops.clone();
    for op_id in ops {
        let op = module.op(op_id)?;
        match op.opcode {
            Opcode::Store => {
                let addr = op.operands[1];
                let mut killed = None;
                for (&base, &prior) in last_store.iter() {
                    if must_alias(module, addr, base) && !read.contains(&prior) {
                        killed = Some(prior);
                    }
                }
                if let Some(prior) = killed {
                    if !escapes_or_global(module, store_addr(module, prior).unwrap_or(prior)) {
                        dead.push(prior);
                    }
                }
                undo.push((addr, last_store.insert(addr, op_id)));
            }
            Opcode::Load => {
                let addr = op.operands[0];
                for (&base, &store) in last_store.iter() {
                    if may_alias(module, addr, base) {
                        read.insert(store);
                    }
                }
            }
            Opcode::Call | Opcode::Clone | Opcode::Join | Opcode::Wake => {
                for &store in last_store.values() {
                    read.insert(store);
                }
            }
            _ => {}
        }
    }
    if let Some(kids) = children.get(&block) {
        let mut kids = kids.clone();
        kids.sort_by_key(|k| k.0);
        for kid in kids {
            dse_block(module, kid, children, last_store, read, dead)?;
        }
    }
    for (addr, previous) in undo.into_iter().rev() {
        match previous {
            Some(v) => {
                last_store.insert(addr, v);
            }
            None => {
                last_store.remove(&addr);
            }
        }
    }
    Ok(())
}

/// `DLE`: load-after-load and load-after-store redundancy, both within a
/// dominator-scoped forward scan. A may-aliasing store or an impure call
/// clobbers every tracked value for conservative safety.
pub struct Dle;

impl Pass for Dle {
    fn name(&self) -> &'static str {
        "DLE"
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
            let children = dom_tree_children(module, &snapshot);
            let Some(entry) = snapshot.entry() else { continue };
            let mut table: HashMap<OpId, OpId> = HashMap::new();
            if dle_block(module, entry, &children, &mut table)? {
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// `table` maps an address op to the value currently known to be stored at
/// (or last loaded from) that address.
fn dle_block(module: &mut Module, block: BlockId, children: &HashMap<BlockId, Vec<BlockId>>, table: &mut HashMap<OpId, OpId>) -> PassResult<bool> {
    let mut changed = false;
    let mut undo: Vec<(OpId, Option<OpId>)> = Vec::new();
    let ops = module.block(block)?.ops.clone();
    for op_id in ops {
        if module.op(op_id).is_err() {
            continue;
        }
        let op = module.op(op_id)?.clone();
        match op.opcode {
            Opcode::Store => {
                let addr = op.operands[1];
                let value = op.operands[0];
                for (&base, _) in table.clone().iter() {
                    if base != addr && may_alias(module, addr, base) {
                        undo.push((base, table.remove(&base)));
                    }
                }
                undo.push((addr, table.insert(addr, value)));
            }
            Opcode::Load => {
                let addr = op.operands[0];
                let mut forwarded = None;
                for (&base, &value) in table.iter() {
                    if must_alias(module, addr, base) {
                        forwarded = Some(value);
                        break;
                    }
                }
                if let Some(value) = forwarded {
                    module.replace_all_uses_with(op_id, value)?;
                    module.erase_op(op_id)?;
                    changed = true;
                } else {
                    undo.push((addr, table.insert(addr, op_id)));
                }
            }
            Opcode::Call | Opcode::Clone | Opcode::Join | Opcode::Wake => {
                for (&base, previous) in table.drain().collect::<Vec<_>>() {
                    undo.push((base, Some(previous)));
                }
            }
            _ => {}
        }
    }
    if let Some(kids) = children.get(&block) {
        let mut kids = kids.clone();
        kids.sort_by_key(|k| k.0);
        for kid in kids {
            changed |= dle_block(module, kid, children, table)?;
        }
    }
    for (addr, previous) in undo.into_iter().rev() {
        match previous {
            Some(v) => {
                table.insert(addr, v);
            }
            None => {
                table.remove(&addr);
            }
        }
    }
    Ok(changed)
}
