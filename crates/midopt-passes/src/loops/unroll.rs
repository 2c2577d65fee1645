//! `ConstLoopUnroll`: fully unrolls a loop whose trip count `Scev` can prove
//! constant, replacing the loop with `n` straight-line copies of its body
//! chained by unconditional `Goto`s.
//!
//! Scope is deliberately narrow: only a single-block body (`header == latch`,
//! the shape `CanonicalizeLoop` + `LoopRotate` leave behind for a simple
//! counting loop) with a statically-known, small trip count is unrolled.
//! Anything wider is left for `Licm`/`Gvn`/`Dce` to clean up on their own --
//! guessing at unrolling a multi-block body risks an unbounded code-size
//! blowup for no return.

use std::collections::HashMap;

use midopt_ir::{compute_dominators, recompute_cfg, Attr, AttrKind, Builder, Module, OpId, Opcode};

use crate::error::PassResult;
use crate::loops::scev::{analyze_induction, trip_count};
use crate::loops::{find_natural_loops, NaturalLoop};
use crate::pass::Pass;

/// Total unrolled instructions (`trip_count * body_len`) above this are left
/// alone; small counting loops over a handful of ops are the intended
/// target, not the occasional `for (i = 0; i < 1000; i++)`.
const MAX_UNROLLED_OPS: usize = 64;
const MAX_TRIP_COUNT: u64 = 16;

pub struct ConstLoopUnroll;

impl Pass for ConstLoopUnroll {
    fn name(&self) -> &'static str {
        "ConstLoopUnroll"
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
                    if try_unroll(module, region, lp)? {
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

struct PhiShape {
    id: OpId,
    start: OpId,
    latch_value: OpId,
}

fn header_phis(module: &Module, header: midopt_ir::BlockId) -> PassResult<Option<Vec<PhiShape>>> {
    let mut phis = Vec::new();
    for &op_id in &module.block(header)?.ops {
        let op = module.op(op_id)?;
        if op.opcode != Opcode::Phi {
            continue;
        }
        if op.phi_incoming.len() != 2 || op.operands.len() != 2 {
            return Ok(None);
        }
        let (mut start, mut latch_value) = (None, None);
        for (i, &from) in op.phi_incoming.iter().enumerate() {
            if from == header {
                latch_value = Some(op.operands[i]);
            } else {
                start = Some(op.operands[i]);
            }
        }
        match (start, latch_value) {
            (Some(start), Some(latch_value)) => phis.push(PhiShape { id: op_id, start, latch_value }),
            _ => return Ok(None),
        }
    }
    Ok(Some(phis))
}

fn try_unroll(module: &mut Module, region: midopt_ir::RegionId, lp: &NaturalLoop) -> PassResult<bool> {
    if lp.header != lp.latch {
        return Ok(false);
    }
    let Some(preheader) = lp.preheader else { return Ok(false) };
    let Some(phis) = header_phis(module, lp.header)? else { return Ok(false) };

    let recs = analyze_induction(module, lp)?;
    let Some(n) = trip_count(module, lp, &recs)? else { return Ok(false) };
    if n == 0 || n > MAX_TRIP_COUNT {
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

    let phi_ids: Vec<OpId> = phis.iter().map(|p| p.id).collect();
    let body_ops: Vec<OpId> = module.block(lp.header)?.ops.iter().copied().filter(|o| !phi_ids.contains(o) && *o != term).collect();

    if body_ops.len().saturating_mul(n as usize) > MAX_UNROLLED_OPS {
        return Ok(false);
    }

    let header_pos = module.region(region)?.position(lp.header).unwrap_or(module.region(region)?.blocks.len());
    let new_blocks: Vec<midopt_ir::BlockId> = (0..n).map(|_| module.alloc_block()).collect();
    for (i, &b) in new_blocks.iter().enumerate() {
        module.region_mut_pub(region)?.blocks.insert(header_pos + i, b);
    }

    let mut current: HashMap<OpId, OpId> = phis.iter().map(|p| (p.id, p.start)).collect();
    let mut last_clone_map: HashMap<OpId, OpId> = HashMap::new();

    for (i, &block) in new_blocks.iter().enumerate() {
        let mut clone_map = current.clone();
        for &op_id in &body_ops {
            let op = module.op(op_id)?.clone();
            let operands: Vec<OpId> = op.operands.iter().map(|o| clone_map.get(o).copied().unwrap_or(*o)).collect();
            let new_id = module.alloc_op(op.opcode, op.result_type);
            module.op_mut(new_id)?.attrs = op.attrs.clone();
            module.set_operands(new_id, operands.into_iter().collect())?;
            module.block_mut(block)?.append(new_id);
            module.op_mut(new_id)?.parent = Some(block);
            clone_map.insert(op_id, new_id);
        }
        let mut b = Builder::at_block_end(module, block);
        if i + 1 < new_blocks.len() {
            b.goto(new_blocks[i + 1])?;
        } else {
            b.goto(outside)?;
        }
        current = phis.iter().map(|p| (p.id, clone_map.get(&p.latch_value).copied().unwrap_or(p.latch_value))).collect();
        last_clone_map = clone_map;
    }

    for p in &phis {
        let exit_value = current[&p.id];
        if !module.op(p.id)?.uses.is_empty() {
            module.replace_all_uses_with(p.id, exit_value)?;
        }
    }
    for &op_id in &body_ops {
        if let Some(&mapped) = last_clone_map.get(&op_id) {
            if module.op(op_id).map(|o| !o.uses.is_empty()).unwrap_or(false) {
                module.replace_all_uses_with(op_id, mapped)?;
            }
        }
    }

    retarget_goto(module, preheader, lp.header, new_blocks[0])?;

    let stale_ops: Vec<OpId> = module.block(lp.header)?.ops.clone();
    for op_id in stale_ops.into_iter().rev() {
        if module.op(op_id).is_ok() {
            module.set_operands(op_id, Default::default())?;
            module.force_erase_op(op_id)?;
        }
    }
    module.region_mut_pub(region)?.remove(lp.header);
    module.force_erase_block(lp.header)?;

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

    /// `int s = 0; for (i = 0; i < 4; i++) s += i;` flattened to a single
    /// self-looping block; unrolling should produce `s == 0+1+2+3 == 6`
    /// without any branch left in the function.
    #[test]
    fn small_counting_loop_fully_unrolls() {
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

        let zero = {
            let mut b = B::at_block_end(&mut m, entry);
            let zero = b.const_int(0).unwrap();
            b.goto(preheader).unwrap();
            zero
        };
        {
            let mut b = B::at_block_end(&mut m, preheader);
            b.goto(header).unwrap();
        }

        let one = m.alloc_op(Op::ConstInt, VT::I32);
        m.op_mut(one).unwrap().attrs.set(Attr::Int(1));
        let four = m.alloc_op(Op::ConstInt, VT::I32);
        m.op_mut(four).unwrap().attrs.set(Attr::Int(4));

        let i_next = m.alloc_op(Op::AddI, VT::I32);
        let s_next = m.alloc_op(Op::AddI, VT::I32);

        let (i_phi, s_phi, ret_s) = {
            let mut b = B::at_block_end(&mut m, header);
            let i_phi = b.phi(VT::I32, [(zero, preheader), (i_next, header)]).unwrap();
            let s_phi = b.phi(VT::I32, [(zero, preheader), (s_next, header)]).unwrap();
            let cmp = b.create(Op::LtI, VT::I32, [i_phi, four], []).unwrap();
            b.branch(cmp, header, exit).unwrap();
            (i_phi, s_phi, s_phi)
        };
        m.set_operands(i_next, [i_phi, one].into_iter().collect()).unwrap();
        m.block_mut(header).unwrap().insert_at(2, i_next);
        m.op_mut(i_next).unwrap().parent = Some(header);
        m.set_operands(s_next, [s_phi, i_phi].into_iter().collect()).unwrap();
        m.block_mut(header).unwrap().insert_at(3, s_next);
        m.op_mut(s_next).unwrap().parent = Some(header);

        // `four`/`one` need a parent block to be well-formed ops.
        m.block_mut(entry).unwrap().insert_at(1, one);
        m.op_mut(one).unwrap().parent = Some(entry);
        m.block_mut(entry).unwrap().insert_at(2, four);
        m.op_mut(four).unwrap().parent = Some(entry);

        {
            let mut b = B::at_block_end(&mut m, exit);
            b.ret(Some(ret_s)).unwrap();
        }

        let mut pass = ConstLoopUnroll;
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 6);
    }
}
