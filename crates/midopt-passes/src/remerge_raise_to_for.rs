//! `Remerge`/`RaiseToFor`: two structured-CFG cleanups that run back to
//! back because both are about collapsing syntactic noise the front end
//! leaves behind before `Flatten` has to deal with it.
//!
//! `Remerge` erases an `If` whose branches do nothing observable (a body
//! that is just `Proceed`), since evaluating the condition only to fall
//! straight through either way has no effect other ops downstream would
//! notice. `RaiseToFor` recognizes the canonical counting-loop shape a
//! front end desugars `for (i = init; i < bound; i += step) body` into --
//! a `While` whose body opens with a guard `if (i >= bound) break;` and
//! closes with `i = i + step` -- and rewrites it into a `For` carrying
//! `(init, bound, step)` as explicit operands, which is what lets SCEV
//! and `ConstLoopUnroll` work without re-deriving the induction variable.

use midopt_ir::{Module, OpId, Opcode};

use crate::error::PassResult;
use crate::pass::Pass;

pub struct Remerge;

fn region_is_trivial(module: &Module, region: Option<midopt_ir::RegionId>) -> PassResult<bool> {
    let Some(region) = region else { return Ok(true) };
    let Some(block) = module.region(region)?.entry() else { return Ok(true) };
    let ops = &module.block(block)?.ops;
    Ok(ops.len() == 1 && module.op(ops[0])?.opcode == Opcode::Proceed)
}

impl Pass for Remerge {
    fn name(&self) -> &'static str {
        "Remerge"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        let candidates = module.find_all(|op| op == Opcode::If)?;
        for if_op in candidates {
            if module.op(if_op).is_err() {
                continue;
            }
            let op = module.op(if_op)?.clone();
            if region_is_trivial(module, op.region)? && region_is_trivial(module, op.else_region)? {
                module.erase_op(if_op)?;
                changed = true;
            }
        }
        Ok(changed)
    }
}

pub struct RaiseToFor;

struct CountingLoop {
    induction_slot: OpId,
    bound: OpId,
    step: OpId,
    guard_if: OpId,
    increment_store: OpId,
}

fn detect_counting_loop(module: &Module, while_op: OpId) -> PassResult<Option<CountingLoop>> {
    let Some(region) = module.op(while_op)?.region else { return Ok(None) };
    let Some(body) = module.region(region)?.entry() else { return Ok(None) };
    let ops = module.block(body)?.ops.clone();
    if ops.len() < 3 {
        return Ok(None);
    }

    let guard_if = ops[0];
    let guard = module.op(guard_if)?;
    if guard.opcode != Opcode::If {
        return Ok(None);
    }
    let Some(then_region) = guard.region else { return Ok(None) };
    let Some(then_block) = module.region(then_region)?.entry() else { return Ok(None) };
    let then_ops = &module.block(then_block)?.ops;
    if then_ops.len() != 1 || module.op(then_ops[0])?.opcode != Opcode::Break {
        return Ok(None);
    }

    let Some(&cond) = guard.operands.first() else { return Ok(None) };
    let cond_op = module.op(cond)?;
    if cond_op.opcode != Opcode::GeI {
        return Ok(None);
    }
    let (iv_load, bound) = (cond_op.operands[0], cond_op.operands[1]);
    let iv_op = module.op(iv_load)?;
    if iv_op.opcode != Opcode::Load {
        return Ok(None);
    }
    let induction_slot = iv_op.operands[0];

    let last_before_terminator = ops[ops.len() - 2];
    let increment_store = last_before_terminator;
    let store = module.op(increment_store)?;
    if store.opcode != Opcode::Store || store.operands.get(1) != Some(&induction_slot) {
        return Ok(None);
    }
    let added = module.op(store.operands[0])?;
    if added.opcode != Opcode::AddI {
        return Ok(None);
    }
    let step = if module.op(added.operands[0])?.opcode == Opcode::Load && added.operands[0] != added.operands[1] {
        added.operands[1]
    } else {
        added.operands[0]
    };

    Ok(Some(CountingLoop { induction_slot, bound, step, guard_if, increment_store }))
}

fn find_preceding_init(module: &Module, while_op: OpId, slot: OpId) -> Option<OpId> {
    let parent = module.op(while_op).ok()?.parent?;
    let ops = &module.block(parent).ok()?.ops;
    let pos = ops.iter().position(|&o| o == while_op)?;
    for &candidate in ops[..pos].iter().rev() {
        let c = module.op(candidate).ok()?;
        if c.opcode == Opcode::Store && c.operands.get(1) == Some(&slot) {
            return Some(c.operands[0]);
        }
    }
    None
}

impl Pass for RaiseToFor {
    fn name(&self) -> &'static str {
        "RaiseToFor"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        let whiles = module.find_all(|op| op == Opcode::While)?;
        for while_op in whiles {
            let Some(loop_shape) = detect_counting_loop(module, while_op)? else { continue };
            let Some(init) = find_preceding_init(module, while_op, loop_shape.induction_slot) else { continue };

            module.erase_op(loop_shape.guard_if)?;
            module.erase_op(loop_shape.increment_store)?;

            module.op_mut(while_op)?.opcode = Opcode::For;
            module.push_operand(while_op, init)?;
            module.push_operand(while_op, loop_shape.bound)?;
            module.push_operand(while_op, loop_shape.step)?;
            // Fourth operand: the stack slot the (now-removed) guard/increment
            // read and wrote, beyond the documented `(init, bound, step)`
            // triple. `Flatten` needs to know which slot to re-synthesize the
            // guard/increment against, and SCEV needs it to name the
            // induction variable -- carrying it as a 4th operand keeps that
            // information attached to the op instead of requiring a second
            // pass to re-derive it by pattern-matching the body.
            module.push_operand(while_op, loop_shape.induction_slot)?;
            changed = true;
        }
        Ok(changed)
    }
}
