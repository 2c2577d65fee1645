//! Scalar evolution: recognizes the single shape of induction variable this
//! workspace needs to reason about closed-form loop behavior -- a `Phi` at
//! the loop header with one incoming value from the preheader (`start`) and
//! one from the latch that is `start_phi + const_step` (directly, or
//! through a chain of other recognized `AddRec`s and invariant values).
//!
//! `RemoveEmptyLoop` and `ConstLoopUnroll` both call [`analyze_induction`]
//! directly rather than running `Scev` as a pipeline stage; the `Pass` impl
//! exists so `Scev` can still be printed/verified like any other stage when
//! someone wants to see what the analysis found.

use std::collections::HashMap;

use midopt_ir::{Attr, AttrKind, Module, OpId, Opcode};

use crate::error::PassResult;
use crate::loops::NaturalLoop;
use crate::pass::Pass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScevExpr {
    /// Defined outside the loop, or otherwise proven not to vary between
    /// iterations.
    Invariant,
    /// `start` on loop entry, `+ step` every iteration thereafter.
    AddRec { start: OpId, step: i64 },
}

/// Computes, for every op in `lp.body`, whether it's loop-invariant or a
/// simple affine recurrence. Ops that are neither (most ordinary
/// computations) are simply absent from the returned map.
pub fn analyze_induction(module: &Module, lp: &NaturalLoop) -> PassResult<HashMap<OpId, ScevExpr>> {
    let mut recs: HashMap<OpId, ScevExpr> = HashMap::new();
    let header_ops = module.block(lp.header)?.ops.clone();
    for op_id in header_ops {
        let op = module.op(op_id)?;
        if op.opcode != Opcode::Phi {
            continue;
        }
        let incoming = &op.phi_incoming;
        let operands = &op.operands;
        if incoming.len() != operands.len() {
            continue;
        }
        let mut start = None;
        let mut step = None;
        for (i, &from) in incoming.iter().enumerate() {
            let value = operands[i];
            if !lp.body.contains(&from) {
                start = Some(value);
            } else if let Some(s) = step_from_phi(module, op_id, value)? {
                step = Some(s);
            }
        }
        if let (Some(start), Some(step)) = (start, step) {
            recs.insert(op_id, ScevExpr::AddRec { start, step });
        }
    }
    Ok(recs)
}

/// Does `value` compute `phi + const` (commutatively)? Returns the constant
/// step if so.
fn step_from_phi(module: &Module, phi: OpId, value: OpId) -> PassResult<Option<i64>> {
    let Ok(op) = module.op(value) else { return Ok(None) };
    if !matches!(op.opcode, Opcode::AddI | Opcode::AddL) {
        return Ok(None);
    }
    let (a, b) = (op.operands[0], op.operands[1]);
    let other = if a == phi {
        b
    } else if b == phi {
        a
    } else {
        return Ok(None);
    };
    let Ok(c) = module.op(other) else { return Ok(None) };
    if c.opcode != Opcode::ConstInt {
        return Ok(None);
    }
    Ok(c.attr(AttrKind::Int).and_then(Attr::as_int).map(|v| v as i64))
}

/// Trip count of a loop whose header-test compares an `AddRec` induction
/// variable against a loop-invariant bound with a constant step, in the
/// common `i < bound` / `i != bound` shapes. `None` if the guard isn't one
/// of those shapes or the step doesn't divide evenly toward the bound.
pub fn trip_count(module: &Module, lp: &NaturalLoop, recs: &HashMap<OpId, ScevExpr>) -> PassResult<Option<u64>> {
    let Some(term) = module.block(lp.header)?.terminator().or_else(|| module.block(lp.latch).ok()?.terminator()) else {
        return Ok(None);
    };
    let op = module.op(term)?;
    if op.opcode != Opcode::Branch {
        return Ok(None);
    }
    let cond = op.operands[0];
    let Ok(cmp) = module.op(cond) else { return Ok(None) };
    if !cmp.opcode.is_int_compare() {
        return Ok(None);
    }
    let (lhs, rhs) = (cmp.operands[0], cmp.operands[1]);
    let (iv, bound, negate) = if recs.contains_key(&lhs) {
        (lhs, rhs, false)
    } else if recs.contains_key(&rhs) {
        (rhs, lhs, true)
    } else {
        return Ok(None);
    };
    let Some(&ScevExpr::AddRec { start, step }) = recs.get(&iv) else { return Ok(None) };
    if step == 0 {
        return Ok(None);
    }
    let Ok(start_op) = module.op(start) else { return Ok(None) };
    if start_op.opcode != Opcode::ConstInt {
        return Ok(None);
    }
    let Ok(bound_op) = module.op(bound) else { return Ok(None) };
    if bound_op.opcode != Opcode::ConstInt {
        return Ok(None);
    }
    let Some(start_v) = start_op.attr(AttrKind::Int).and_then(Attr::as_int) else { return Ok(None) };
    let Some(bound_v) = bound_op.attr(AttrKind::Int).and_then(Attr::as_int) else { return Ok(None) };
    let (start_v, bound_v) = (start_v as i64, bound_v as i64);
    let diff = if negate { start_v - bound_v } else { bound_v - start_v };
    if diff <= 0 || step <= 0 {
        return Ok(None);
    }
    if diff % step != 0 {
        return Ok(None);
    }
    Ok(Some((diff / step) as u64))
}

pub struct Scev;

impl Pass for Scev {
    fn name(&self) -> &'static str {
        "Scev"
    }

    fn run(&mut self, _module: &mut Module) -> PassResult<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{compute_dominators, recompute_cfg, Builder as B, Opcode as Op, ValueType as VT};
    use crate::loops::find_natural_loops;

    #[test]
    fn simple_counting_loop_is_recognized_as_addrec() {
        let mut m = Module::new();
        let f = m.alloc_op(Op::Function, VT::Void);
        m.op_mut(f).unwrap().attrs.set(Attr::Name("main".to_string()));
        let region = m.alloc_region();
        m.op_mut(f).unwrap().region = Some(region);
        let top = m.top_block;
        m.block_mut(top).unwrap().append(f);
        m.op_mut(f).unwrap().parent = Some(top);

        let entry = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(entry);
        let header = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(header);
        let latch = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(latch);
        let exit = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(exit);

        {
            let mut b = B::at_block_end(&mut m, entry);
            let zero = b.const_int(0).unwrap();
            b.goto(header).unwrap();
        }
        let zero = m.block(entry).unwrap().ops[0];

        let next_placeholder = m.alloc_op(Op::AddI, VT::I32);
        let (iv, ten, cmp) = {
            let mut b = B::at_block_end(&mut m, header);
            let ten = b.const_int(10).unwrap();
            let iv = b.phi(VT::I32, [(zero, entry), (next_placeholder, latch)]).unwrap();
            let cmp = b.create(Op::LtI, VT::I32, [iv, ten], []).unwrap();
            b.branch(cmp, latch, exit).unwrap();
            (iv, ten, cmp)
        };
        let _ = (ten, cmp);

        {
            let one = {
                let mut b = B::at_block_end(&mut m, latch);
                b.const_int(1).unwrap()
            };
            m.set_operands(next_placeholder, [iv, one].into_iter().collect()).unwrap();
            m.block_mut(latch).unwrap().append(next_placeholder);
            m.op_mut(next_placeholder).unwrap().parent = Some(latch);
            let mut b = B::at_block_end(&mut m, latch);
            b.goto(header).unwrap();
        }

        {
            let mut b = B::at_block_end(&mut m, exit);
            b.ret(None).unwrap();
        }

        recompute_cfg(&mut m, &m.region(region).unwrap().clone()).unwrap();
        compute_dominators(&mut m, &m.region(region).unwrap().clone()).unwrap();
        let loops = find_natural_loops(&m, &m.region(region).unwrap().clone()).unwrap();
        let lp = loops.into_iter().find(|l| l.header == header).unwrap();
        let recs = analyze_induction(&m, &lp).unwrap();
        match recs.get(&iv) {
            Some(ScevExpr::AddRec { start, step }) => {
                assert_eq!(*start, zero);
                assert_eq!(*step, 1);
            }
            other => panic!("expected AddRec, got {:?}", other),
        }
        assert_eq!(trip_count(&m, &lp, &recs).unwrap(), Some(10));
    }
}
