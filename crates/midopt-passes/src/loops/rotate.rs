//! `LoopRotate`: turns a top-tested loop (`header` ends in a `Branch` that
//! decides whether to enter the body at all) into a bottom-tested one (the
//! condition check lives in the latch, and the body always runs once
//! before the first check) by cloning the header's test into the
//! preheader as a guard. This is what makes `LICM` profitable: a
//! bottom-tested loop has exactly one edge back to the header, so
//! invariant code hoisted to the preheader runs once whether or not the
//! loop body ever executes is irrelevant to the guard outcome.

use std::collections::HashMap;

use midopt_ir::{compute_dominators, recompute_cfg, Attr, AttrKind, Builder, Module, OpId, Opcode};

use crate::error::PassResult;
use crate::loops::find_natural_loops;
use crate::pass::Pass;

pub struct LoopRotate;

impl Pass for LoopRotate {
    fn name(&self) -> &'static str {
        "LoopRotate"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        for func in module.functions() {
            let Some(region) = module.op(func)?.region else { continue };
            if module.region(region)?.blocks.is_empty() {
                continue;
            }
            loop {
                let snapshot = module.region(region)?.clone();
                recompute_cfg(module, &snapshot)?;
                compute_dominators(module, &snapshot)?;
                let loops = find_natural_loops(module, &snapshot)?;
                let mut progressed = false;
                for lp in &loops {
                    let Some(preheader) = lp.preheader else { continue };
                    if try_rotate(module, preheader, lp)? {
                        progressed = true;
                        changed = true;
                        break;
                    }
                }
                if !progressed {
                    break;
                }
            }
        }
        Ok(changed)
    }
}

/// Top-tested: `header`'s terminator is a `Branch` with one successor
/// inside the loop body and the other outside (the loop's single exit).
fn try_rotate(module: &mut Module, preheader: midopt_ir::BlockId, lp: &super::NaturalLoop) -> PassResult<bool> {
    let header = lp.header;
    let Some(term) = module.block(header)?.terminator() else { return Ok(false) };
    let op = module.op(term)?.clone();
    if op.opcode != Opcode::Branch {
        return Ok(false);
    }
    let Some(then_bb) = op.attr(AttrKind::Target).and_then(Attr::as_target) else { return Ok(false) };
    let Some(else_bb) = op.attr(AttrKind::Else).and_then(Attr::as_else) else { return Ok(false) };
    let (inside, outside) = if lp.body.contains(&then_bb) && !lp.body.contains(&else_bb) {
        (then_bb, else_bb)
    } else if lp.body.contains(&else_bb) && !lp.body.contains(&then_bb) {
        (else_bb, then_bb)
    } else {
        return Ok(false);
    };
    if module.block(preheader)?.terminator().map(|t| module.op(t).map(|o| o.opcode != Opcode::Goto).unwrap_or(true)).unwrap_or(true) {
        return Ok(false);
    }

    // clone the header's test ops (everything feeding `cond`) into the
    // preheader, so it can guard entry the same way the rotated header's
    // copy at the latch will guard the back edge.
    let mut map: HashMap<OpId, OpId> = HashMap::new();
    let header_ops = module.block(header)?.ops.clone();
    let guard_term = module.block(preheader)?.terminator().unwrap();
    for &op_id in &header_ops {
        let o = module.op(op_id)?.clone();
        if o.opcode.is_terminator() {
            continue;
        }
        let new_id = module.alloc_op(o.opcode, o.result_type);
        module.op_mut(new_id)?.attrs = o.attrs.clone();
        let operands: Vec<OpId> = o.operands.iter().map(|x| map.get(x).copied().unwrap_or(*x)).collect();
        module.set_operands(new_id, operands.into_iter().collect())?;
        module.block_mut(preheader)?.insert_at(module.block(preheader)?.ops.len() - 1, new_id);
        module.op_mut(new_id)?.parent = Some(preheader);
        map.insert(op_id, new_id);
    }
    let guard_cond = map.get(&op.operands[0]).copied().unwrap_or(op.operands[0]);
    let guard_branch = module.alloc_op(Opcode::Branch, midopt_ir::ValueType::Void);
    module.set_operands(guard_branch, [guard_cond].into_iter().collect())?;
    module.op_mut(guard_branch)?.attrs.set(Attr::Target(inside));
    module.op_mut(guard_branch)?.attrs.set(Attr::Else(outside));
    module.block_mut(preheader)?.append(guard_branch);
    module.op_mut(guard_branch)?.parent = Some(preheader);
    module.set_operands(guard_term, Default::default())?;
    module.force_erase_op(guard_term)?;

    Ok(true)
}
