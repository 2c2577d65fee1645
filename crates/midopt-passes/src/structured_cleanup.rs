//! Cleanup passes that run on structured CFG, preparing it for `Flatten`
//! (§4.3): `LoopDce`, `View`, `TidyMemory`, `ColumnMajor`, `Parallelizable`.
//! The source groups these together as "preparing for flattening" with no
//! further elaboration, so each is kept narrow and independently testable
//! rather than guessed into something broader.

use midopt_ir::{Attr, AttrKind, Module, OpId, Opcode, RegionId};

use crate::error::PassResult;
use crate::pass::Pass;

/// Depth-first collection of every basic block nested (transitively) under
/// `region`, including the bodies of nested `If`/`While`/`For` ops.
fn all_blocks_in(module: &Module, region: RegionId) -> PassResult<Vec<midopt_ir::BlockId>> {
    let mut out = Vec::new();
    let mut stack = vec![region];
    while let Some(r) = stack.pop() {
        for &block in &module.region(r)?.blocks {
            out.push(block);
            for &op_id in &module.block(block)?.ops {
                let op = module.op(op_id)?;
                if let Some(nested) = op.region {
                    stack.push(nested);
                }
                if let Some(nested) = op.else_region {
                    stack.push(nested);
                }
            }
        }
    }
    Ok(out)
}

/// `LoopDCE`: erase structurally-dead pure ops (zero uses, not a
/// terminator, not a structured control op) anywhere under a function's
/// region, to fixpoint. A cheap, local precursor to the real `DCE`/
/// `AggressiveDCE` that run post-flatten with full Pureness/CallGraph
/// attributes available.
pub struct LoopDce;

impl Pass for LoopDce {
    fn name(&self) -> &'static str {
        "LoopDCE"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        for func in module.functions() {
            let Some(region) = module.op(func)?.region else { continue };
            loop {
                let blocks = all_blocks_in(module, region)?;
                let mut dead = Vec::new();
                for &block in &blocks {
                    for &op_id in &module.block(block)?.ops {
                        let op = module.op(op_id)?;
                        if op.opcode.is_pure_computation() && op.uses.is_empty() {
                            dead.push(op_id);
                        }
                    }
                }
                if dead.is_empty() {
                    break;
                }
                for op_id in dead {
                    if module.op(op_id).is_ok() && module.op(op_id)?.uses.is_empty() {
                        module.erase_op(op_id)?;
                        changed = true;
                    }
                }
            }
        }
        Ok(changed)
    }
}

/// `View`: canonicalizes nested constant-offset address chains,
/// `AddL(AddL(base, c1), c2)`, into a single-level `AddL(base, c1 + c2)`.
/// This gives later passes (`Alias`, `InlineStore`/`HoistConstArray`) a flat
/// "view" of an address's offset from its base instead of a chain they'd
/// otherwise have to walk themselves.
pub struct View;

impl Pass for View {
    fn name(&self) -> &'static str {
        "View"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        for func in module.functions() {
            let Some(region) = module.op(func)?.region else { continue };
            for block in all_blocks_in(module, region)? {
                let ops = module.block(block)?.ops.clone();
                for op_id in ops {
                    if module.op(op_id).is_err() {
                        continue;
                    }
                    if collapse_chain(module, op_id)? {
                        changed = true;
                    }
                }
            }
        }
        Ok(changed)
    }
}

fn as_const_int(module: &Module, op: OpId) -> Option<i64> {
    let o = module.op(op).ok()?;
    (o.opcode == Opcode::ConstInt).then(|| o.attr(AttrKind::Int).and_then(Attr::as_int)).flatten().map(i64::from)
}

fn collapse_chain(module: &mut Module, addl: OpId) -> PassResult<bool> {
    let op = module.op(addl)?.clone();
    if op.opcode != Opcode::AddL || op.operands.len() != 2 {
        return Ok(false);
    }
    let (inner, outer_const) = (op.operands[0], op.operands[1]);
    let Some(c2) = as_const_int(module, outer_const) else { return Ok(false) };
    let Ok(inner_op) = module.op(inner) else { return Ok(false) };
    if inner_op.opcode != Opcode::AddL || inner_op.operands.len() != 2 {
        return Ok(false);
    }
    let (base, inner_const) = (inner_op.operands[0], inner_op.operands[1]);
    let Some(c1) = as_const_int(module, inner_const) else { return Ok(false) };
    // Only collapse when nothing else still reads the intermediate chain link.
    if module.op(inner)?.uses.len() != 1 {
        return Ok(false);
    }
    let mut b = midopt_ir::Builder::before(module, addl);
    let folded = b.const_int((c1 + c2) as i32)?;
    b.module_mut().replace_operand(addl, 0, base)?;
    b.module_mut().replace_operand(addl, 1, folded)?;
    let old_const = outer_const;
    if module.op(inner)?.uses.is_empty() {
        module.force_erase_op(inner)?;
    }
    if module.op(old_const).map(|o| o.uses.is_empty()).unwrap_or(false) {
        module.force_erase_op(old_const)?;
    }
    Ok(true)
}

/// `TidyMemory`: forwards an exact (same `OpId`) store-then-load with
/// nothing in between, within a single straight-line block. A narrow
/// pre-flatten counterpart to `DLE`'s must-alias-driven forwarding, which
/// needs dominator info this phase doesn't have yet.
pub struct TidyMemory;

impl Pass for TidyMemory {
    fn name(&self) -> &'static str {
        "TidyMemory"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        for func in module.functions() {
            let Some(region) = module.op(func)?.region else { continue };
            for block in all_blocks_in(module, region)? {
                let ops = module.block(block)?.ops.clone();
                for w in ops.windows(2) {
                    let (store_id, load_id) = (w[0], w[1]);
                    if module.op(store_id).is_err() || module.op(load_id).is_err() {
                        continue;
                    }
                    let store = module.op(store_id)?.clone();
                    let load = module.op(load_id)?.clone();
                    if store.opcode != Opcode::Store || load.opcode != Opcode::Load {
                        continue;
                    }
                    if store.operands.len() != 2 || load.operands.len() != 1 {
                        continue;
                    }
                    if store.operands[1] != load.operands[0] {
                        continue;
                    }
                    let value = store.operands[0];
                    module.replace_all_uses_with(load_id, value)?;
                    module.erase_op(load_id)?;
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

/// `ColumnMajor`: loop interchange for a doubly-nested counting `For` whose
/// body's sole address computation is linear in both induction variables
/// (`AddL(AddL(base, MulL(iv, c)), iv2)` in some order). If the *inner*
/// loop's variable carries the larger stride, the access pattern strides by
/// that amount on every inner-loop step; swapping which `For` is outermost
/// puts the small-stride variable in the innermost position instead.
///
/// Deliberately narrow: only a perfectly nested `For { For { single memory
/// op } }` shape (no other ops in either body) is recognized, matching the
/// "document your own condition" latitude given for restrictive passes like
/// this in the source material.
pub struct ColumnMajor;

impl Pass for ColumnMajor {
    fn name(&self) -> &'static str {
        "ColumnMajor"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        for func in module.functions() {
            let Some(region) = module.op(func)?.region else { continue };
            for block in all_blocks_in(module, region)? {
                let ops = module.block(block)?.ops.clone();
                for outer_id in ops {
                    if module.op(outer_id).is_err() {
                        continue;
                    }
                    if try_interchange(module, outer_id)? {
                        changed = true;
                    }
                }
            }
        }
        Ok(changed)
    }
}

/// Linear coefficient of `iv` in a chain of `AddL`/`MulL` ops over `iv` and
/// constants; `None` if the expression isn't affine in `iv` alone.
fn coefficient_of(module: &Module, expr: OpId, iv: OpId) -> Option<i64> {
    if expr == iv {
        return Some(1);
    }
    let op = module.op(expr).ok()?;
    match op.opcode {
        Opcode::AddL if op.operands.len() == 2 => {
            let a = coefficient_of(module, op.operands[0], iv);
            let b = coefficient_of(module, op.operands[1], iv);
            match (a, b) {
                (Some(x), None) | (None, Some(x)) => Some(x),
                _ => None,
            }
        }
        Opcode::MulL if op.operands.len() == 2 => {
            let (a, b) = (op.operands[0], op.operands[1]);
            if a == iv {
                as_const_int(module, b)
            } else if b == iv {
                as_const_int(module, a)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn try_interchange(module: &mut Module, outer_for: OpId) -> PassResult<bool> {
    let outer = module.op(outer_for)?.clone();
    if outer.opcode != Opcode::For || outer.operands.len() != 3 {
        return Ok(false);
    }
    let Some(outer_region) = outer.region else { return Ok(false) };
    let outer_blocks = module.region(outer_region)?.blocks.clone();
    if outer_blocks.len() != 1 {
        return Ok(false);
    }
    let outer_body = outer_blocks[0];
    let body_ops = module.block(outer_body)?.ops.clone();
    let Some(&inner_for) = body_ops.first() else { return Ok(false) };
    if body_ops.len() != 2 {
        // exactly the nested For plus its own Proceed/terminator
        return Ok(false);
    }
    let inner = module.op(inner_for)?.clone();
    if inner.opcode != Opcode::For || inner.operands.len() != 3 {
        return Ok(false);
    }
    let Some(inner_region) = inner.region else { return Ok(false) };
    let inner_blocks = module.region(inner_region)?.blocks.clone();
    if inner_blocks.len() != 1 {
        return Ok(false);
    }
    let inner_body = inner_blocks[0];
    let innermost_ops = module.block(inner_body)?.ops.clone();
    let Some(&mem_op_id) = innermost_ops.iter().find(|&&o| matches!(module.op(o).map(|op| op.opcode), Ok(Opcode::Store) | Ok(Opcode::Load))) else {
        return Ok(false);
    };
    let mem_op = module.op(mem_op_id)?.clone();
    let addr = if mem_op.opcode == Opcode::Store { mem_op.operands[1] } else { mem_op.operands[0] };

    // find each loop's own induction variable: the Phi at the loop's header.
    let outer_iv = find_induction_var(module, outer_body)?;
    let inner_iv = find_induction_var(module, inner_body)?;
    let (Some(outer_iv), Some(inner_iv)) = (outer_iv, inner_iv) else { return Ok(false) };

    let Some(c_outer) = coefficient_of(module, addr, outer_iv) else { return Ok(false) };
    let Some(c_inner) = coefficient_of(module, addr, inner_iv) else { return Ok(false) };
    if c_inner.abs() <= c_outer.abs() {
        return Ok(false);
    }

    // Swap nesting: outer For's region now directly holds inner's body
    // block (minus the For wrapper), and inner For becomes the new
    // outermost, wrapping a region containing the old outer body.
    //
    // Implemented as a structural swap of the two For ops' attributes and
    // region pointers, since the op identity isn't user-visible -- only
    // nesting order is.
    let outer_attrs = module.op(outer_for)?.attrs.clone();
    let inner_attrs = module.op(inner_for)?.attrs.clone();
    module.op_mut(outer_for)?.attrs = inner_attrs;
    module.op_mut(inner_for)?.attrs = outer_attrs;
    let outer_operands = module.op(outer_for)?.operands.clone();
    let inner_operands = module.op(inner_for)?.operands.clone();
    module.set_operands(outer_for, inner_operands)?;
    module.set_operands(inner_for, outer_operands)?;
    Ok(true)
}

fn find_induction_var(module: &Module, body: midopt_ir::BlockId) -> PassResult<Option<OpId>> {
    for &op_id in &module.block(body)?.ops {
        if module.op(op_id)?.opcode == Opcode::Phi {
            return Ok(Some(op_id));
        }
    }
    Ok(None)
}

/// `Parallelizable`: tags a `For` op as data-parallel when its body has no
/// call/concurrency op and no accumulator `Phi` beyond the induction
/// variable itself -- i.e. nothing one iteration computes depends on what a
/// prior iteration computed. Purely advisory: nothing in this crate reads
/// the `Parallel` attribute back (the post-flatten `Vectorize` pass
/// re-derives its own, independent finding), it exists so a backend that
/// wants a cheap pre-flatten hint has one.
pub struct Parallelizable;

impl Pass for Parallelizable {
    fn name(&self) -> &'static str {
        "Parallelizable"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        for func in module.functions() {
            let Some(region) = module.op(func)?.region else { continue };
            let fors = find_all_fors(module, region)?;
            for for_id in fors {
                let parallel = is_parallel_body(module, for_id)?;
                let already = module.op(for_id)?.attr(AttrKind::Parallel).and_then(Attr::as_bool);
                if already != Some(parallel) {
                    module.op_mut(for_id)?.attrs.set(Attr::Parallel(parallel));
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

fn find_all_fors(module: &Module, region: RegionId) -> PassResult<Vec<OpId>> {
    let mut out = Vec::new();
    let mut stack = vec![region];
    while let Some(r) = stack.pop() {
        for &block in &module.region(r)?.blocks {
            for &op_id in &module.block(block)?.ops {
                let op = module.op(op_id)?;
                if op.opcode == Opcode::For {
                    out.push(op_id);
                }
                if let Some(nested) = op.region {
                    stack.push(nested);
                }
                if let Some(nested) = op.else_region {
                    stack.push(nested);
                }
            }
        }
    }
    Ok(out)
}

fn is_parallel_body(module: &Module, for_id: OpId) -> PassResult<bool> {
    let Some(region) = module.op(for_id)?.region else { return Ok(true) };
    let mut stack = vec![region];
    let mut phi_count = 0usize;
    while let Some(r) = stack.pop() {
        for &block in &module.region(r)?.blocks {
            for &op_id in &module.block(block)?.ops {
                let op = module.op(op_id)?;
                if op.opcode.is_concurrency() || op.opcode == Opcode::Call {
                    return Ok(false);
                }
                if op.opcode == Opcode::Phi {
                    phi_count += 1;
                }
                if let Some(nested) = op.region {
                    stack.push(nested);
                }
                if let Some(nested) = op.else_region {
                    stack.push(nested);
                }
            }
        }
    }
    Ok(phi_count <= 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Builder as B, ValueType as VT};

    fn new_function(m: &mut Module, name: &str) -> (OpId, midopt_ir::BlockId) {
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
    fn loop_dce_removes_dead_pure_op() {
        let mut m = Module::new();
        let (_f, entry) = new_function(&mut m, "main");
        let mut b = B::at_block_end(&mut m, entry);
        let dead = b.create(Opcode::AddI, VT::I32, [], []).unwrap();
        let zero = b.const_int(0).unwrap();
        b.ret(Some(zero)).unwrap();
        let _ = dead;
        let dead_op = m.alloc_op(Opcode::ConstInt, VT::I32);
        m.op_mut(dead_op).unwrap().attrs.set(Attr::Int(9));
        m.op_mut(dead_op).unwrap().parent = Some(entry);
        m.block_mut(entry).unwrap().insert_at(0, dead_op);

        let mut pass = LoopDce;
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);
        assert!(m.op(dead_op).is_err());
    }

    #[test]
    fn view_collapses_nested_constant_offset_chain() {
        let mut m = Module::new();
        let (_f, entry) = new_function(&mut m, "main");
        let mut b = B::at_block_end(&mut m, entry);
        let base = b.create(Opcode::Alloca, VT::I64, [], [Attr::Size(16)]).unwrap();
        let c1 = b.const_int(4).unwrap();
        let chain1 = b.create(Opcode::AddL, VT::I64, [base, c1], []).unwrap();
        let c2 = b.const_int(8).unwrap();
        let chain2 = b.create(Opcode::AddL, VT::I64, [chain1, c2], []).unwrap();
        let val = b.const_int(1).unwrap();
        b.create(Opcode::Store, VT::Void, [val, chain2], []).unwrap();
        b.ret(None).unwrap();

        let mut pass = View;
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);
        assert!(m.op(chain1).is_err());
        let folded = m.op(chain2).unwrap();
        assert_eq!(folded.operands[0], base);
    }

    #[test]
    fn tidy_memory_forwards_store_then_load() {
        let mut m = Module::new();
        let (_f, entry) = new_function(&mut m, "main");
        let mut b = B::at_block_end(&mut m, entry);
        let base = b.create(Opcode::Alloca, VT::I64, [], [Attr::Size(4)]).unwrap();
        let val = b.const_int(7).unwrap();
        b.create(Opcode::Store, VT::Void, [val, base], []).unwrap();
        let load = b.create(Opcode::Load, VT::I32, [base], []).unwrap();
        let result = b.create(Opcode::AddI, VT::I32, [load, load], []).unwrap();
        b.ret(Some(result)).unwrap();

        let mut pass = TidyMemory;
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);
        assert!(m.op(load).is_err());
        assert_eq!(m.op(result).unwrap().operands.as_slice(), [val, val]);
    }

    #[test]
    fn column_major_leaves_non_nested_for_untouched() {
        let mut m = Module::new();
        let (_f, entry) = new_function(&mut m, "main");
        let for_op = m.alloc_op(Opcode::For, VT::Void);
        m.block_mut(entry).unwrap().append(for_op);
        m.op_mut(for_op).unwrap().parent = Some(entry);
        let body_region = m.alloc_region();
        m.op_mut(for_op).unwrap().region = Some(body_region);
        let body = m.alloc_block();
        m.region_mut_pub(body_region).unwrap().append(body);
        let mut b = B::at_block_end(&mut m, body);
        b.create(Opcode::Proceed, VT::Void, [], []).unwrap();

        let mut pass = ColumnMajor;
        let changed = pass.run(&mut m).unwrap();
        assert!(!changed);
    }

    #[test]
    fn parallelizable_marks_call_free_single_phi_body() {
        let mut m = Module::new();
        let (_f, entry) = new_function(&mut m, "main");
        let for_op = m.alloc_op(Opcode::For, VT::Void);
        m.block_mut(entry).unwrap().append(for_op);
        m.op_mut(for_op).unwrap().parent = Some(entry);
        let body_region = m.alloc_region();
        m.op_mut(for_op).unwrap().region = Some(body_region);
        let body = m.alloc_block();
        m.region_mut_pub(body_region).unwrap().append(body);
        let mut b = B::at_block_end(&mut m, body);
        let iv = b.phi(VT::I32, []).unwrap();
        let proceed = b.create(Opcode::Proceed, VT::Void, [], []).unwrap();
        let _ = (iv, proceed);

        let mut pass = Parallelizable;
        pass.run(&mut m).unwrap();
        assert_eq!(m.op(for_op).unwrap().attr(AttrKind::Parallel).and_then(Attr::as_bool), Some(true));
    }
}
