//! `Vectorize` (ARM only, per §4.9): mark loops whose body is a vectorizable
//! reduction or map so the backend can lower them to SIMD form.
//!
//! This crate stops at the mid-level IR -- there is no SIMD opcode to emit
//! here, and the actual instruction-selection decision belongs to the
//! backend the CLI's `--arm` flag hands off to. What this pass *can* do at
//! this level is recognize the two shapes a vectorizing backend cares about
//! and record the finding as a `Simd` attribute on the loop header's
//! terminator, the same "backend hint, opaque to every other pass in this
//! crate" contract `Attr::Fp` already uses. Nothing about the loop's
//! observable behavior changes, so this pass never needs to recompute
//! dominators for anyone downstream -- it only annotates.
//!
//! - **Reduction**: the header carries an accumulator `Phi` whose
//!   loop-carried value is a commutative pure combine (`AddI`/`MulI`/
//!   `AddF`/`MulF`) of the `Phi` itself and some other value computed in the
//!   loop -- the classic `sum += a[i]` / `prod *= a[i]` shape.
//! - **Map**: the body stores a value that's transitively computed (through
//!   pure ops only) from a `Load`, with no `Call`/concurrency op anywhere in
//!   the body to hide a dependency this analysis can't see -- `b[i] = f(a[i])`.

use std::collections::HashSet;

use midopt_ir::{compute_dominators, recompute_cfg, Attr, BlockId, Module, OpId, Opcode};

use crate::error::PassResult;
use crate::loops::{find_natural_loops, NaturalLoop};
use crate::pass::Pass;

/// Lanes assumed for a 32-bit element (`I32`/`F32`) on the target SIMD unit.
/// `I64` addresses are never reduced/mapped directly, so one width covers
/// every shape this pass recognizes.
const SIMD_WIDTH: u32 = 4;

pub struct Vectorize;

impl Pass for Vectorize {
    fn name(&self) -> &'static str {
        "Vectorize"
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
            let loops = find_natural_loops(module, &snapshot)?;
            for lp in &loops {
                let vectorizable = find_reduction(module, lp)?.is_some() || is_map_loop(module, lp)?;
                if vectorizable && mark_loop(module, lp)? {
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

fn mark_loop(module: &mut Module, lp: &NaturalLoop) -> PassResult<bool> {
    let Some(term) = module.block(lp.header)?.terminator() else { return Ok(false) };
    if module.op(term)?.attr(midopt_ir::AttrKind::Simd).and_then(Attr::as_simd_width) == Some(SIMD_WIDTH) {
        return Ok(false);
    }
    module.op_mut(term)?.attrs.set(Attr::Simd(SIMD_WIDTH));
    Ok(true)
}

/// Returns the header `Phi` acting as the reduction accumulator, if any.
fn find_reduction(module: &Module, lp: &NaturalLoop) -> PassResult<Option<OpId>> {
    if lp.header != lp.latch {
        return Ok(None);
    }
    let header = lp.header;
    for &op_id in &module.block(header)?.ops {
        let op = module.op(op_id)?;
        if op.opcode != Opcode::Phi || op.phi_incoming.len() != 2 || op.operands.len() != 2 {
            continue;
        }
        let mut latch_value = None;
        for (i, &from) in op.phi_incoming.iter().enumerate() {
            if from == header {
                latch_value = Some(op.operands[i]);
            }
        }
        let Some(latch_value) = latch_value else { continue };
        let Ok(combine) = module.op(latch_value) else { continue };
        if !matches!(combine.opcode, Opcode::AddI | Opcode::MulI | Opcode::AddF | Opcode::MulF) {
            continue;
        }
        if combine.operands[0] == op_id || combine.operands[1] == op_id {
            return Ok(Some(op_id));
        }
    }
    Ok(None)
}

fn is_map_loop(module: &Module, lp: &NaturalLoop) -> PassResult<bool> {
    if lp.header != lp.latch {
        return Ok(false);
    }
    let block = lp.header;
    let mut found = false;
    for &op_id in &module.block(block)?.ops {
        let op = module.op(op_id)?;
        match op.opcode {
            Opcode::Call | Opcode::Clone | Opcode::Join | Opcode::Wake => return Ok(false),
            Opcode::Store => {
                let stored = op.operands[0];
                let mut visited = HashSet::new();
                if value_depends_on_load(module, stored, block, &mut visited)? {
                    found = true;
                }
            }
            _ => {}
        }
    }
    Ok(found)
}

/// Does `value` trace back, through pure ops defined in `block` only, to a
/// `Load`? Operands defined outside `block` are treated as loop-invariant
/// inputs and don't themselves count as the load dependency being searched
/// for (they contribute no per-iteration memory traffic).
fn value_depends_on_load(module: &Module, value: OpId, block: BlockId, visited: &mut HashSet<OpId>) -> PassResult<bool> {
    if !visited.insert(value) {
        return Ok(false);
    }
    let Ok(op) = module.op(value) else { return Ok(false) };
    if op.opcode == Opcode::Load {
        return Ok(true);
    }
    if op.parent != Some(block) || !op.opcode.is_pure_computation() {
        return Ok(false);
    }
    for &operand in &op.operands {
        if value_depends_on_load(module, operand, block, visited)? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{AttrKind, Builder as B, Opcode as Op, ValueType as VT};
    use midopt_interp::run;

    /// `int s = 0; for (i = 0; i < n; i++) s += a[i];` is the textbook
    /// reduction shape: the loop is marked, and the computed sum is
    /// unaffected (this pass never rewrites behavior, only annotates).
    #[test]
    fn sum_reduction_loop_is_marked() {
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

        let (zero, arr, n) = {
            let mut b = B::at_block_end(&mut m, entry);
            let zero = b.const_int(0).unwrap();
            let arr = b.create(Op::Alloca, VT::I64, [], [Attr::Size(16), Attr::Dimension(vec![4])]).unwrap();
            let n = b.const_int(3).unwrap();
            b.goto(preheader).unwrap();
            (zero, arr, n)
        };
        {
            let mut b = B::at_block_end(&mut m, preheader);
            b.goto(header).unwrap();
        }

        let one = m.alloc_op(Op::ConstInt, VT::I32);
        m.op_mut(one).unwrap().attrs.set(Attr::Int(1));
        m.block_mut(entry).unwrap().insert_at(3, one);
        m.op_mut(one).unwrap().parent = Some(entry);

        let i_next = m.alloc_op(Op::AddI, VT::I32);
        let s_next = m.alloc_op(Op::AddI, VT::I32);
        let (i_phi, s_phi, ret_s) = {
            let mut b = B::at_block_end(&mut m, header);
            let i_phi = b.phi(VT::I32, [(zero, preheader), (i_next, header)]).unwrap();
            let s_phi = b.phi(VT::I32, [(zero, preheader), (s_next, header)]).unwrap();
            let addr = b.create(Op::AddL, VT::I64, [arr, i_phi], []).unwrap();
            let loaded = b.create(Op::Load, VT::I32, [addr], []).unwrap();
            let cmp = b.create(Op::LtI, VT::I32, [i_phi, n], []).unwrap();
            b.branch(cmp, header, exit).unwrap();
            let _ = loaded;
            (i_phi, s_phi, s_phi)
        };
        let loaded = m.block(header).unwrap().ops[3];
        m.set_operands(s_next, [s_phi, loaded].into_iter().collect()).unwrap();
        m.block_mut(header).unwrap().insert_at(4, s_next);
        m.op_mut(s_next).unwrap().parent = Some(header);
        m.set_operands(i_next, [i_phi, one].into_iter().collect()).unwrap();
        m.block_mut(header).unwrap().insert_at(5, i_next);
        m.op_mut(i_next).unwrap().parent = Some(header);

        {
            let mut b = B::at_block_end(&mut m, exit);
            b.ret(Some(ret_s)).unwrap();
        }

        let mut pass = Vectorize;
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);

        let term = m.block(header).unwrap().terminator().unwrap();
        assert_eq!(m.op(term).unwrap().attr(AttrKind::Simd).and_then(Attr::as_simd_width), Some(SIMD_WIDTH));

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 0);
    }

    /// A loop whose body contains an impure `Call` is never marked: the
    /// call could hide anything, so the conservative answer is to leave it
    /// alone for the scalar backend.
    #[test]
    fn loop_with_call_is_not_marked() {
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

        {
            let mut b = B::at_block_end(&mut m, entry);
            b.goto(preheader).unwrap();
        }
        {
            let mut b = B::at_block_end(&mut m, preheader);
            b.goto(header).unwrap();
        }
        {
            let mut b = B::at_block_end(&mut m, header);
            b.create(Op::Call, VT::Void, [], [Attr::Name("putint".to_string())]).unwrap();
            let cond = b.const_int(0).unwrap();
            b.branch(cond, header, exit).unwrap();
        }
        {
            let mut b = B::at_block_end(&mut m, exit);
            b.ret(None).unwrap();
        }

        let mut pass = Vectorize;
        let changed = pass.run(&mut m).unwrap();
        assert!(!changed);
        let term = m.block(header).unwrap().terminator().unwrap();
        assert!(m.op(term).unwrap().attr(AttrKind::Simd).is_none());
    }
}
