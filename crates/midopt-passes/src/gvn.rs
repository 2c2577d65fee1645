//! `GVN`: dominator-scoped value numbering (Briggs).
//!
//! Walks the dominator tree in preorder with a scoped hash table: a pure
//! op's structural key (opcode, operand VNs with commutative operands
//! sorted, attribute key) is inserted when first seen and undone on the way
//! back out of its block, so a later op with the same key is only judged
//! redundant when an *actual dominating* instance reaches it. Since a
//! redundant op is rewired (`replace_all_uses_with`) and erased immediately,
//! downstream operand lists already point at the single surviving instance
//! -- ordinary ops don't need a separate numeric VN, their `OpId` doubles
//! as one.
//!
//! Phis are the one place that breaks that shortcut: a Phi's operands name
//! values from predecessor blocks that don't dominate the Phi, so two
//! structurally-identical-but-distinct ops feeding a merge (one per branch)
//! can never be unified by replacement. A persistent `vn_of` map (never
//! undone, unlike the scoped table) tracks each op's key so a Phi can check
//! whether its incoming values merely *agree in structure*; when they do,
//! the Phi itself becomes the dominator-scoped representative for that key
//! (and is replaced outright if a true dominating representative already
//! reaches it), exactly the "numbered if all incoming VNs agree" rule.

use std::collections::HashMap;

use midopt_ir::{compute_dominators, dom_tree_children, recompute_cfg, BlockId, Module, Op, OpId, Opcode};

use crate::error::PassResult;
use crate::pass::Pass;

#[derive(Clone, PartialEq, Eq, Hash)]
enum VnKey {
    Structural { opcode: Opcode, operands: Vec<OpId>, attrs: String },
    Unique(OpId),
}

fn structural_key(op: &Op) -> VnKey {
    let mut operands: Vec<OpId> = op.operands.iter().copied().collect();
    if op.opcode.is_commutative() {
        operands.sort();
    }
    VnKey::Structural { opcode: op.opcode, operands, attrs: format!("{:?}", op.attrs) }
}

pub struct Gvn;

impl Pass for Gvn {
    fn name(&self) -> &'static str {
        "GVN"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        for func in module.functions() {
            let Some(region) = module.op(func)?.region else { continue };
            if module.region(region)?.blocks.is_empty() {
                continue;
            }
            let region_snapshot = module.region(region)?.clone();
            recompute_cfg(module, &region_snapshot)?;
            compute_dominators(module, &region_snapshot)?;
            let children = dom_tree_children(module, &region_snapshot);
            let Some(entry) = region_snapshot.entry() else { continue };
            let mut table: HashMap<VnKey, OpId> = HashMap::new();
            let mut vn_of: HashMap<OpId, VnKey> = HashMap::new();
            if gvn_block(module, entry, &children, &mut table, &mut vn_of)? {
                changed = true;
            }
        }
        Ok(changed)
    }
}

fn gvn_block(module: &mut Module, block: BlockId, children: &HashMap<BlockId, Vec<BlockId>>, table: &mut HashMap<VnKey, OpId>, vn_of: &mut HashMap<OpId, VnKey>) -> PassResult<bool> {
    let mut changed = false;
    let mut undo: Vec<(VnKey, Option<OpId>)> = Vec::new();

    let ops = module.block(block)?.ops.clone();
    for op_id in ops {
        if module.op(op_id).is_err() {
            continue;
        }
        let op = module.op(op_id)?.clone();

        if op.opcode == Opcode::Phi {
            let incoming_keys: Vec<VnKey> = op.operands.iter().map(|&operand| vn_of.get(&operand).cloned().unwrap_or(VnKey::Unique(operand))).collect();
            let agree = incoming_keys.first().is_some_and(|first| incoming_keys.iter().all(|k| k == first));
            if agree {
                let key = incoming_keys[0].clone();
                if let Some(&existing) = table.get(&key) {
                    module.replace_all_uses_with(op_id, existing)?;
                    module.erase_op(op_id)?;
                    changed = true;
                } else {
                    undo.push((key.clone(), table.insert(key.clone(), op_id)));
                    vn_of.insert(op_id, key);
                }
            } else {
                vn_of.insert(op_id, VnKey::Unique(op_id));
            }
            continue;
        }

        if !op.opcode.is_pure_computation() {
            vn_of.insert(op_id, VnKey::Unique(op_id));
            continue;
        }

        let key = structural_key(&op);
        if let Some(&existing) = table.get(&key) {
            module.replace_all_uses_with(op_id, existing)?;
            module.erase_op(op_id)?;
            vn_of.insert(op_id, key);
            changed = true;
            continue;
        }
        undo.push((key.clone(), table.insert(key.clone(), op_id)));
        vn_of.insert(op_id, key);
    }

    if let Some(kids) = children.get(&block) {
        let mut kids = kids.clone();
        kids.sort_by_key(|k| k.0);
        for kid in kids {
            changed |= gvn_block(module, kid, children, table, vn_of)?;
        }
    }

    for (key, previous) in undo.into_iter().rev() {
        match previous {
            Some(v) => {
                table.insert(key, v);
            }
            None => {
                table.remove(&key);
            }
        }
    }
    Ok(changed)
}
