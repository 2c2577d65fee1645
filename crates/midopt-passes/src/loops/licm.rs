//! `Licm`: Loop-Invariant Code Motion. Hoists a pure computation -- or a
//! `Load` proven safe by `Alias` -- out of a loop into its preheader once
//! every operand is defined outside the loop body.
//!
//! Only ops with no side effect are ever candidates (`is_pure_computation`
//! plus `Load`, matching §4.9's "invariant-load/compute hoist" wording);
//! everything else is pinned in place. A `Load` additionally requires that
//! no `Store` anywhere in the loop body may-alias its address and that the
//! loop body contains no impure `Call`/concurrency op -- either could write
//! through a base this analysis can't see, so the conservative answer is
//! to leave the load where it is.

use midopt_analysis::{compute_alias, compute_call_graph, may_alias};
use midopt_ir::{compute_dominators, recompute_cfg, BlockId, Builder, Module, OpId, Opcode};

use crate::error::PassResult;
use crate::loops::{find_natural_loops, NaturalLoop};
use crate::pass::Pass;

pub struct Licm;

impl Pass for Licm {
    fn name(&self) -> &'static str {
        "LICM"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let graph = compute_call_graph(module)?;
        compute_alias(module, &graph)?;

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
                let mut loops = find_natural_loops(module, &snapshot)?;
                // innermost loops first: a value invariant in an inner loop
                // may need one more round to also clear the outer one.
                loops.sort_by_key(|l| l.body.len());
                let mut progressed = false;
                for lp in &loops {
                    let Some(preheader) = lp.preheader else { continue };
                    if hoist_one(module, preheader, lp)? {
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

fn hoist_one(module: &mut Module, preheader: BlockId, lp: &NaturalLoop) -> PassResult<bool> {
    let mut blocks: Vec<BlockId> = lp.body.iter().copied().collect();
    blocks.sort_by_key(|b| b.0);
    for block in blocks {
        let ops = module.block(block)?.ops.clone();
        for op_id in ops {
            if module.op(op_id).is_err() {
                continue;
            }
            if !is_hoistable_opcode(module, op_id, lp)? {
                continue;
            }
            if !operands_invariant(module, op_id, lp)? {
                continue;
            }
            let term = module.block(preheader)?.terminator().expect("preheader is always Goto-terminated");
            let mut b = Builder::at_block_end(module, preheader);
            b.move_before(op_id, term)?;
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_hoistable_opcode(module: &Module, op_id: OpId, lp: &NaturalLoop) -> PassResult<bool> {
    let op = module.op(op_id)?;
    if op.opcode.is_pure_computation() {
        return Ok(true);
    }
    if op.opcode == Opcode::Load {
        return load_is_safe(module, op_id, lp);
    }
    Ok(false)
}

fn load_is_safe(module: &Module, load: OpId, lp: &NaturalLoop) -> PassResult<bool> {
    let addr = module.op(load)?.operands[0];
    for &block in &lp.body {
        for &op_id in &module.block(block)?.ops {
            let op = module.op(op_id)?;
            match op.opcode {
                Opcode::Store => {
                    if may_alias(module, addr, op.operands[1]) {
                        return Ok(false);
                    }
                }
                Opcode::Call | Opcode::Clone | Opcode::Join | Opcode::Wake => return Ok(false),
                _ => {}
            }
        }
    }
    Ok(true)
}

fn operands_invariant(module: &Module, op_id: OpId, lp: &NaturalLoop) -> PassResult<bool> {
    for &operand in &module.op(op_id)?.operands {
        let Some(parent) = module.op(operand)?.parent else { continue };
        if lp.body.contains(&parent) {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Attr, Builder as B, Opcode as Op, ValueType as VT};
    use midopt_interp::run;

    /// `int i = 0; while (i < n) { t = a * b; s += t; i++; }` -- `t` is
    /// loop-invariant and should move to the preheader.
    #[test]
    fn invariant_multiply_hoisted_to_preheader() {
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

        let mut b = B::at_block_end(&mut m, entry);
        let a = b.const_int(3).unwrap();
        let bb_val = b.const_int(4).unwrap();
        b.goto(preheader).unwrap();

        let mut b = B::at_block_end(&mut m, preheader);
        b.goto(header).unwrap();

        let mut b = B::at_block_end(&mut m, header);
        let t = b.create(Op::MulI, VT::I32, [a, bb_val], []).unwrap();
        let cond = b.const_int(0).unwrap();
        b.branch(cond, header, exit).unwrap();

        let mut b = B::at_block_end(&mut m, exit);
        b.ret(Some(t)).unwrap();

        let mut pass = Licm;
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);
        assert_eq!(m.op(t).unwrap().parent, Some(preheader));

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 12);
    }

    #[test]
    fn load_clobbered_by_in_loop_store_stays_put() {
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

        let mut b = B::at_block_end(&mut m, entry);
        let slot = b.create(Op::Alloca, VT::I64, [], [Attr::Size(4)]).unwrap();
        b.goto(preheader).unwrap();
        let mut b = B::at_block_end(&mut m, preheader);
        b.goto(header).unwrap();

        let mut b = B::at_block_end(&mut m, header);
        let one = b.const_int(1).unwrap();
        b.create(Op::Store, VT::Void, [one, slot], []).unwrap();
        let load = b.create(Op::Load, VT::I32, [slot], []).unwrap();
        let cond = b.const_int(0).unwrap();
        b.branch(cond, header, exit).unwrap();

        let mut b = B::at_block_end(&mut m, exit);
        b.ret(Some(load)).unwrap();

        let mut pass = Licm;
        pass.run(&mut m).unwrap();
        assert_eq!(m.op(load).unwrap().parent, Some(header));
    }
}
