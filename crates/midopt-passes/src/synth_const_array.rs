//! `SynthConstArray` (§4.14): a speculative pass that replaces a
//! single-block counting loop that stores one value per iteration into a
//! fixed array with a direct, statically materialized sequence of stores,
//! once the per-iteration value is proven to follow a closed-form affine
//! expression in the induction variable.
//!
//! Recognition is deliberately narrow (only loops shaped like
//! `for (i = start; i < bound; i += step) arr[i] = f(i);`, one `Store` per
//! iteration, address exactly `AddL(base, i)`, value built from pure
//! integer ops over `i` and literals, no `Load`/`Call`/concurrency anywhere
//! in the body) -- the same "document your own restriction" latitude
//! `HoistConstArray` takes. What's novel here versus `ConstLoopUnroll` is
//! *how* the per-iteration value is validated: rather than unrolling `f`
//! itself for every iteration, a handful of sampled `(i, f(i))` pairs are
//! handed to the bit-vector solver to guess affine coefficients `a`, `b`
//! with `f(i) = a*i + b`; the guess is then checked against every iteration
//! by direct evaluation before the rewrite is trusted. A solver failure (no
//! affine fit, or the fit doesn't hold for iterations outside the sample)
//! just leaves the loop alone.

use std::collections::HashMap;

use midopt_ir::{compute_dominators, recompute_cfg, Attr, AttrKind, Builder, Module, OpId, Opcode};

use crate::error::PassResult;
use crate::loops::scev::{analyze_induction, trip_count, ScevExpr};
use crate::loops::{find_natural_loops, NaturalLoop};
use crate::pass::Pass;
use midopt_smt::{BvBuilder, SatResult, Solver};

/// Loops with more iterations than this are left alone -- this pass
/// materializes one `Store` per iteration, so unbounded growth here would
/// turn a tiny loop into an arbitrarily large one.
const MAX_TRIP_COUNT: u64 = 256;
/// Samples offered to the solver when guessing `a`/`b`; two points pin a
/// line, a third guards against the solver finding an equation that's
/// trivially satisfiable because too few constraints were given.
const GUESS_SAMPLES: u64 = 3;
const WORD_WIDTH: u32 = 32;

pub struct SynthConstArray;

impl Pass for SynthConstArray {
    fn name(&self) -> &'static str {
        "SynthConstArray"
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
                    if try_synthesize(module, region, lp)? {
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

struct Shape {
    store: OpId,
    base: OpId,
    value_root: OpId,
    iv: OpId,
    start: i64,
    step: i64,
}

fn recognize_shape(module: &Module, lp: &NaturalLoop) -> PassResult<Option<Shape>> {
    if lp.header != lp.latch {
        return Ok(None);
    }
    let recs = analyze_induction(module, lp)?;
    let Some((&iv, &ScevExpr::AddRec { start, step })) = recs.iter().find(|(_, e)| matches!(e, ScevExpr::AddRec { .. })) else {
        return Ok(None);
    };
    let Ok(start_op) = module.op(start) else { return Ok(None) };
    if start_op.opcode != Opcode::ConstInt {
        return Ok(None);
    }
    let Some(start_v) = start_op.attr(AttrKind::Int).and_then(Attr::as_int) else { return Ok(None) };

    let mut store = None;
    for &op_id in &module.block(lp.header)?.ops {
        let op = module.op(op_id)?;
        match op.opcode {
            Opcode::Load | Opcode::Call | Opcode::Clone | Opcode::Join | Opcode::Wake => return Ok(None),
            Opcode::Store => {
                if store.is_some() {
                    return Ok(None);
                }
                store = Some(op_id);
            }
            _ => {}
        }
    }
    let Some(store) = store else { return Ok(None) };
    let store_op = module.op(store)?;
    let (value_root, addr) = (store_op.operands[0], store_op.operands[1]);
    let Ok(addr_op) = module.op(addr) else { return Ok(None) };
    if addr_op.opcode != Opcode::AddL || addr_op.operands.len() != 2 {
        return Ok(None);
    }
    let (base, offset) = (addr_op.operands[0], addr_op.operands[1]);
    if offset != iv {
        return Ok(None);
    }
    let base_in_body = module.op(base)?.parent.map(|p| lp.body.contains(&p)).unwrap_or(true);
    if base_in_body {
        return Ok(None);
    }

    Ok(Some(Shape { store, base, value_root, iv, start: start_v as i64, step }))
}

/// Folds a pure-integer expression rooted at `op_id`, substituting `iv_val`
/// for `iv`. Returns `None` the moment anything isn't a literal or a pure
/// integer op over already-folded operands -- in particular any leaf that
/// isn't `iv` itself must be a `ConstInt`, which is what keeps this sound
/// without needing a general loop-invariant-value oracle.
fn eval_pure(module: &Module, op_id: OpId, iv: OpId, iv_val: i64, memo: &mut HashMap<OpId, i64>) -> Option<i64> {
    if op_id == iv {
        return Some(iv_val);
    }
    if let Some(&v) = memo.get(&op_id) {
        return Some(v);
    }
    let op = module.op(op_id).ok()?;
    let v = match op.opcode {
        Opcode::ConstInt => op.attr(AttrKind::Int).and_then(Attr::as_int)? as i64,
        Opcode::NegI => -eval_pure(module, op.operands[0], iv, iv_val, memo)?,
        Opcode::NotI => !eval_pure(module, op.operands[0], iv, iv_val, memo)?,
        Opcode::AddI | Opcode::SubI | Opcode::MulI | Opcode::DivI | Opcode::ModI | Opcode::AndI | Opcode::OrI | Opcode::XorI | Opcode::ShlI | Opcode::LShrI | Opcode::AShrI => {
            let a = eval_pure(module, op.operands[0], iv, iv_val, memo)?;
            let b = eval_pure(module, op.operands[1], iv, iv_val, memo)?;
            match op.opcode {
                Opcode::AddI => (a as i32).wrapping_add(b as i32) as i64,
                Opcode::SubI => (a as i32).wrapping_sub(b as i32) as i64,
                Opcode::MulI => (a as i32).wrapping_mul(b as i32) as i64,
                Opcode::DivI if b != 0 => (a as i32).wrapping_div(b as i32) as i64,
                Opcode::ModI if b != 0 => (a as i32).wrapping_rem(b as i32) as i64,
                Opcode::AndI => ((a as i32) & (b as i32)) as i64,
                Opcode::OrI => ((a as i32) | (b as i32)) as i64,
                Opcode::XorI => ((a as i32) ^ (b as i32)) as i64,
                Opcode::ShlI => (a as i32).wrapping_shl(b as u32) as i64,
                Opcode::LShrI => ((a as i32 as u32) >> (b as u32 & 31)) as i32 as i64,
                Opcode::AShrI => (a as i32).wrapping_shr(b as u32) as i64,
                _ => return None,
            }
        }
        _ => return None,
    };
    memo.insert(op_id, v);
    Some(v)
}

/// Asks the bit-vector solver whether some `(a, b)` satisfies
/// `a*i + b = v` for every sample. Each sample is its own constraint on the
/// same pair of unknowns, so a solution (if any) fits all of them at once.
fn guess_affine(samples: &[(i64, i64)]) -> Option<(i64, i64)> {
    let mut solver = Solver::new(0);
    let (a, b) = {
        let mut bv = BvBuilder::new(&mut solver);
        let a = bv.fresh(WORD_WIDTH);
        let b = bv.fresh(WORD_WIDTH);
        for &(i, target) in samples {
            let i_bv = bv.constant(i, WORD_WIDTH);
            let target_bv = bv.constant(target, WORD_WIDTH);
            let product = bv.mul(&a, &i_bv).ok()?;
            let candidate = bv.add(&product, &b).ok()?;
            let eq_lit = bv.eq(&candidate, &target_bv).ok()?;
            bv.solver().add_clause(vec![eq_lit]);
        }
        (a, b)
    };
    match solver.solve() {
        SatResult::Sat(assignment) => Some((a.value_of(&assignment), b.value_of(&assignment))),
        SatResult::Unsat => None,
    }
}

fn try_synthesize(module: &mut Module, region: midopt_ir::RegionId, lp: &NaturalLoop) -> PassResult<bool> {
    let Some(shape) = recognize_shape(module, lp)? else { return Ok(false) };
    let recs = analyze_induction(module, lp)?;
    let Some(n) = trip_count(module, lp, &recs)? else { return Ok(false) };
    if n == 0 || n > MAX_TRIP_COUNT {
        return Ok(false);
    }
    let Some(preheader) = lp.preheader else { return Ok(false) };

    let mut memo = HashMap::new();
    let mut values = Vec::with_capacity(n as usize);
    for k in 0..n {
        let iv_val = shape.start + k as i64 * shape.step;
        memo.clear();
        let Some(v) = eval_pure(module, shape.value_root, shape.iv, iv_val, &mut memo) else { return Ok(false) };
        values.push((iv_val, v));
    }

    let sample_count = GUESS_SAMPLES.min(n) as usize;
    let Some((a, b)) = guess_affine(&values[..sample_count]) else { return Ok(false) };
    if !values.iter().all(|&(i, v)| (a.wrapping_mul(i).wrapping_add(b)) as i32 as i64 == v) {
        return Ok(false);
    }

    let Some(term) = module.block(lp.header)?.terminator() else { return Ok(false) };
    let term_op = module.op(term)?.clone();
    if term_op.opcode != Opcode::Branch {
        return Ok(false);
    }
    let target = term_op.attr(AttrKind::Target).and_then(Attr::as_target);
    let else_target = term_op.attr(AttrKind::Else).and_then(Attr::as_else);
    let outside = match (target, else_target) {
        (Some(t), Some(e)) if t == lp.header => e,
        (Some(t), Some(e)) if e == lp.header => t,
        _ => return Ok(false),
    };

    // No value computed in the loop may escape it -- this pass only ever
    // replaces the array contents, it has nothing to offer a live-out Phi.
    for &block in &lp.body {
        for &op_id in &module.block(block)?.ops {
            for &user in &module.op(op_id)?.uses {
                let user_block = module.op(user)?.parent;
                if user_block.map(|b| !lp.body.contains(&b)).unwrap_or(true) {
                    return Ok(false);
                }
            }
        }
    }

    let preheader_term = module.block(preheader)?.terminator().expect("preheader always ends in Goto");
    let base = shape.base;
    let mut b = Builder::before(module, preheader_term);
    for &(iv_val, v) in &values {
        let idx = b.const_int(iv_val as i32)?;
        let addr = b.create(Opcode::AddL, midopt_ir::ValueType::I64, [base, idx], [])?;
        let value = b.const_int(v as i32)?;
        b.create(Opcode::Store, midopt_ir::ValueType::Void, [value, addr], [])?;
    }
    let _ = shape.store;

    retarget_goto(module, preheader, lp.header, outside)?;

    let stale_ops: Vec<OpId> = lp.body.iter().flat_map(|&blk| module.block(blk).map(|bb| bb.ops.clone()).unwrap_or_default()).collect();
    for op_id in &stale_ops {
        if module.op(*op_id).is_ok() {
            let _ = module.set_operands(*op_id, Default::default());
        }
    }
    for op_id in stale_ops {
        if module.op(op_id).is_ok() {
            module.force_erase_op(op_id)?;
        }
    }
    for &blk in &lp.body {
        if module.block(blk).is_ok() {
            module.region_mut_pub(region)?.remove(blk);
            module.force_erase_block(blk)?;
        }
    }

    Ok(true)
}

fn retarget_goto(module: &mut Module, block: midopt_ir::BlockId, from: midopt_ir::BlockId, to: midopt_ir::BlockId) -> PassResult<()> {
    let Some(term) = module.block(block)?.terminator() else { return Ok(()) };
    let op = module.op(term)?;
    if op.attr(AttrKind::Target).and_then(Attr::as_target) == Some(from) {
        module.op_mut(term)?.attrs.set(Attr::Target(to));
    }
    if op.attr(AttrKind::Else).and_then(Attr::as_else) == Some(from) {
        module.op_mut(term)?.attrs.set(Attr::Else(to));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Builder as B, Opcode as Op, ValueType as VT};
    use midopt_interp::run;

    /// `for (i = 0; i < 5; i++) a[i] = 2*i + 1;` is a textbook affine
    /// per-iteration store; this collapses to five direct stores and the
    /// loop disappears.
    #[test]
    fn affine_store_loop_collapses_to_direct_stores() {
        let mut m = Module::new();
        let f = m.alloc_op(Op::Function, VT::I32);
        m.op_mut(f).unwrap().attrs.set(Attr::Name("main".to_string()));
        let region = m.alloc_region();
        m.op_mut(f).unwrap().region = Some(region);
        let top = m.top_block;
        m.block_mut(top).unwrap().append(f);
        m.op_mut(f).unwrap().parent = Some(top);

        let entry = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(entry);
        let preheader = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(preheader);
        let header = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(header);
        let exit = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(exit);

        let (zero, arr, five, one, two) = {
            let mut b = B::at_block_end(&mut m, entry);
            let zero = b.const_int(0).unwrap();
            let arr = b.create(Op::Alloca, VT::I64, [], [Attr::Size(20), Attr::Dimension(vec![5])]).unwrap();
            let five = b.const_int(5).unwrap();
            let one = b.const_int(1).unwrap();
            let two = b.const_int(2).unwrap();
            b.goto(preheader).unwrap();
            (zero, arr, five, one, two)
        };
        {
            let mut b = B::at_block_end(&mut m, preheader);
            b.goto(header).unwrap();
        }

        let i_next = m.alloc_op(Op::AddI, VT::I32);
        let (i_phi,) = {
            let mut b = B::at_block_end(&mut m, header);
            let i_phi = b.phi(VT::I32, [(zero, preheader), (i_next, header)]).unwrap();
            let doubled = b.create(Op::MulI, VT::I32, [i_phi, two], []).unwrap();
            let value = b.create(Op::AddI, VT::I32, [doubled, one], []).unwrap();
            let addr = b.create(Op::AddL, VT::I64, [arr, i_phi], []).unwrap();
            b.create(Op::Store, VT::Void, [value, addr], []).unwrap();
            let cmp = b.create(Op::LtI, VT::I32, [i_phi, five], []).unwrap();
            b.branch(cmp, header, exit).unwrap();
            (i_phi,)
        };
        m.set_operands(i_next, [i_phi, one].into_iter().collect()).unwrap();
        m.block_mut(header).unwrap().insert_at(m.block(header).unwrap().ops.len() - 1, i_next);
        m.op_mut(i_next).unwrap().parent = Some(header);

        {
            let mut b = B::at_block_end(&mut m, exit);
            let addr0 = b.create(Op::AddL, VT::I64, [arr, zero], []).unwrap();
            let loaded = b.create(Op::Load, VT::I32, [addr0], []).unwrap();
            b.ret(Some(loaded)).unwrap();
        }

        let mut pass = SynthConstArray;
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);
        assert!(m.block(header).is_err());

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 1);
    }

    /// A loop whose stored value depends on a runtime `Call` result has no
    /// closed form at all; the solver correctly finds nothing and the loop
    /// is left untouched.
    #[test]
    fn loop_with_call_dependent_value_is_left_alone() {
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
        let preheader = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(preheader);
        let header = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(header);
        let exit = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(exit);

        let (zero, arr, five, one) = {
            let mut b = B::at_block_end(&mut m, entry);
            let zero = b.const_int(0).unwrap();
            let arr = b.create(Op::Alloca, VT::I64, [], [Attr::Size(20), Attr::Dimension(vec![5])]).unwrap();
            let five = b.const_int(5).unwrap();
            let one = b.const_int(1).unwrap();
            b.goto(preheader).unwrap();
            (zero, arr, five, one)
        };
        {
            let mut b = B::at_block_end(&mut m, preheader);
            b.goto(header).unwrap();
        }

        let i_next = m.alloc_op(Op::AddI, VT::I32);
        let i_phi = {
            let mut b = B::at_block_end(&mut m, header);
            let i_phi = b.phi(VT::I32, [(zero, preheader), (i_next, header)]).unwrap();
            let value = b.create(Op::Call, VT::I32, [], [Attr::Name("getint".to_string())]).unwrap();
            let addr = b.create(Op::AddL, VT::I64, [arr, i_phi], []).unwrap();
            b.create(Op::Store, VT::Void, [value, addr], []).unwrap();
            let cmp = b.create(Op::LtI, VT::I32, [i_phi, five], []).unwrap();
            b.branch(cmp, header, exit).unwrap();
            i_phi
        };
        m.set_operands(i_next, [i_phi, one].into_iter().collect()).unwrap();
        m.block_mut(header).unwrap().insert_at(m.block(header).unwrap().ops.len() - 1, i_next);
        m.op_mut(i_next).unwrap().parent = Some(header);

        {
            let mut b = B::at_block_end(&mut m, exit);
            b.ret(None).unwrap();
        }

        let mut pass = SynthConstArray;
        let changed = pass.run(&mut m).unwrap();
        assert!(!changed);
    }
}
