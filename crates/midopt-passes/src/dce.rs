//! `DCE`/`AggressiveDCE`: the two dead-code sweeps per §4.7.
//!
//! `DCE` is conservative and local: an op with zero recorded uses and no
//! side effect is erased, to a fixpoint; on top of that it separately
//! erases whole unused functions and unreachable blocks, and breaks dead
//! `Phi` cycles that a plain uses-count check can never see zero uses for
//! (each phi in the cycle "uses" the other). `AggressiveDCE` throws the
//! uses-count bookkeeping away entirely and does a real mark-sweep from
//! the ops that matter (effects and control), which gets the Phi-cycle
//! case, and more, for free.

use std::collections::HashSet;

use midopt_analysis::{call_target, compute_call_graph, compute_pureness};
use midopt_ir::{recompute_cfg, Attr, AttrKind, BlockId, Module, OpId, Opcode, RegionId};

use crate::error::PassResult;
use crate::pass::Pass;

pub struct Dce;

impl Pass for Dce {
    fn name(&self) -> &'static str {
        "DCE"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let graph = compute_call_graph(module)?;
        compute_pureness(module, &graph)?;

        let mut changed = false;
        changed |= erase_dead_pure_ops(module)?;
        changed |= erase_unused_functions(module)?;
        changed |= erase_dead_phi_cycles(module)?;
        changed |= erase_unreachable_blocks(module)?;
        Ok(changed)
    }
}

fn is_pure_for_dce(module: &Module, op_id: OpId) -> PassResult<bool> {
    let op = module.op(op_id)?;
    if op.opcode.is_terminator() || op.opcode == Opcode::Store || op.opcode.is_concurrency() {
        return Ok(false);
    }
    if op.opcode == Opcode::Call {
        return Ok(match call_target(module, op_id) {
            Some(callee) => !module.op(callee)?.attr(AttrKind::Impure).and_then(Attr::as_bool).unwrap_or(true),
            None => false,
        });
    }
    if op.opcode.is_structured() {
        let regions: Vec<RegionId> = [op.region, op.else_region].into_iter().flatten().collect();
        for region in regions {
            if region_contains_impure(module, region)? {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn region_contains_impure(module: &Module, region: RegionId) -> PassResult<bool> {
    for &block in &module.region(region)?.blocks {
        for &op_id in &module.block(block)?.ops {
            if !is_pure_for_dce(module, op_id)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn erase_dead_pure_ops(module: &mut Module) -> PassResult<bool> {
    let mut changed = false;
    loop {
        let mut progressed = false;
        let candidates: Vec<OpId> = module.all_op_ids().collect();
        for op_id in candidates {
            if module.op(op_id).is_err() {
                continue;
            }
            let op = module.op(op_id)?;
            if matches!(op.opcode, Opcode::Function | Opcode::Global) {
                continue;
            }
            if op.uses.is_empty() && is_pure_for_dce(module, op_id)? {
                module.erase_op(op_id)?;
                progressed = true;
            }
        }
        changed |= progressed;
        if !progressed {
            break;
        }
    }
    Ok(changed)
}

fn erase_unused_functions(module: &mut Module) -> PassResult<bool> {
    let mut changed = false;
    loop {
        let graph = compute_call_graph(module)?;
        let mut erased_this_round = false;
        for func in module.functions() {
            if module.function_name(func).as_deref() == Some("main") {
                continue;
            }
            if graph.callers_of(func).is_empty() {
                erase_function(module, func)?;
                erased_this_round = true;
                changed = true;
            }
        }
        if !erased_this_round {
            break;
        }
    }
    Ok(changed)
}

fn erase_function(module: &mut Module, func: OpId) -> PassResult<()> {
    if let Some(region) = module.op(func)?.region {
        erase_region_contents(module, region)?;
    }
    module.force_erase_op(func)?;
    Ok(())
}

fn erase_region_contents(module: &mut Module, region: RegionId) -> PassResult<()> {
    let blocks = module.region(region)?.blocks.clone();
    for block in blocks {
        let ops = module.block(block)?.ops.clone();
        for op_id in &ops {
            let op = module.op(*op_id)?.clone();
            if let Some(nested) = op.region {
                erase_region_contents(module, nested)?;
            }
            if let Some(nested) = op.else_region {
                erase_region_contents(module, nested)?;
            }
        }
        for op_id in ops {
            module.force_erase_op(op_id)?;
        }
        module.force_erase_block(block)?;
    }
    Ok(())
}

fn erase_dead_phi_cycles(module: &mut Module) -> PassResult<bool> {
    let phis = module.find_all(|op| op == Opcode::Phi)?;
    let phi_set: HashSet<OpId> = phis.iter().copied().collect();
    let mut alive: HashSet<OpId> = HashSet::new();
    let mut progressed = true;
    while progressed {
        progressed = false;
        for &phi in &phis {
            if alive.contains(&phi) {
                continue;
            }
            let uses = module.op(phi)?.uses.clone();
            if uses.iter().any(|u| !phi_set.contains(u) || alive.contains(u)) {
                alive.insert(phi);
                progressed = true;
            }
        }
    }
    let dead: Vec<OpId> = phis.into_iter().filter(|p| !alive.contains(p)).collect();
    let changed = !dead.is_empty();
    for phi in dead {
        module.force_erase_op(phi)?;
    }
    Ok(changed)
}

fn erase_unreachable_blocks(module: &mut Module) -> PassResult<bool> {
    let mut changed = false;
    for func in module.functions() {
        let Some(region) = module.op(func)?.region else { continue };
        if module.region(region)?.blocks.is_empty() {
            continue;
        }
        let region_snapshot = module.region(region)?.clone();
        recompute_cfg(module, &region_snapshot)?;
        let Some(entry) = region_snapshot.entry() else { continue };

        let mut reachable: HashSet<BlockId> = HashSet::new();
        let mut stack = vec![entry];
        while let Some(b) = stack.pop() {
            if !reachable.insert(b) {
                continue;
            }
            for s in module.block(b)?.succs.clone() {
                stack.push(s);
            }
        }

        let unreachable: Vec<BlockId> = region_snapshot.blocks.iter().copied().filter(|b| !reachable.contains(b)).collect();
        if unreachable.is_empty() {
            continue;
        }
        changed = true;
        for block in unreachable {
            let ops: Vec<OpId> = module.block(block)?.ops.clone();
            for op_id in ops {
                module.force_erase_op(op_id)?;
            }
            module.force_erase_block(block)?;
        }
        let region_snapshot = module.region(region)?.clone();
        recompute_cfg(module, &region_snapshot)?;
    }
    Ok(changed)
}

pub struct AggressiveDce;

impl Pass for AggressiveDce {
    fn name(&self) -> &'static str {
        "AggressiveDCE"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let graph = compute_call_graph(module)?;
        compute_pureness(module, &graph)?;

        let mut changed = false;
        for func in module.functions() {
            let Some(region) = module.op(func)?.region else { continue };
            if mark_sweep_function(module, region)? {
                changed = true;
            }
        }
        Ok(changed)
    }
}

fn is_aggressive_root(module: &Module, op_id: OpId) -> PassResult<bool> {
    let op = module.op(op_id)?;
    if op.opcode.is_terminator() || op.opcode == Opcode::Store || op.opcode.is_concurrency() {
        return Ok(true);
    }
    if op.opcode == Opcode::Call {
        return Ok(match call_target(module, op_id) {
            Some(callee) => module.op(callee)?.attr(AttrKind::Impure).and_then(Attr::as_bool).unwrap_or(true),
            None => true,
        });
    }
    Ok(false)
}

fn collect_region_ops(module: &Module, region: RegionId) -> PassResult<Vec<OpId>> {
    let mut out = Vec::new();
    let mut stack = vec![region];
    while let Some(r) = stack.pop() {
        for &block in &module.region(r)?.blocks {
            for &op_id in &module.block(block)?.ops {
                out.push(op_id);
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

fn mark_sweep_function(module: &mut Module, region: RegionId) -> PassResult<bool> {
    let all_ops = collect_region_ops(module, region)?;
    let mut live: HashSet<OpId> = HashSet::new();
    let mut worklist: Vec<OpId> = Vec::new();
    for &op_id in &all_ops {
        if is_aggressive_root(module, op_id)? {
            worklist.push(op_id);
        }
    }
    while let Some(op_id) = worklist.pop() {
        if !live.insert(op_id) {
            continue;
        }
        let operands = module.op(op_id)?.operands.clone();
        worklist.extend(operands);
    }

    let dead: Vec<OpId> = all_ops.into_iter().filter(|o| !live.contains(o)).collect();
    let changed = !dead.is_empty();
    for op_id in dead {
        module.force_erase_op(op_id)?;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Builder as B, Opcode as Op, ValueType as VT};
    use midopt_interp::run;

    fn new_function(m: &mut Module, name: &str) -> (OpId, BlockId) {
        let f = m.alloc_op(Op::Function, VT::Void);
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
    fn dead_pure_computation_is_erased_but_observable_result_kept() {
        let mut m = Module::new();
        let (_f, entry) = new_function(&mut m, "main");
        let mut b = B::at_block_end(&mut m, entry);
        let one = b.const_int(1).unwrap();
        let two = b.const_int(2).unwrap();
        let dead = b.create(Op::AddI, VT::I32, [one, two], []).unwrap();
        let answer = b.const_int(42).unwrap();
        b.ret(Some(answer)).unwrap();

        let mut pass = Dce;
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);
        assert!(m.op(dead).is_err());
        assert!(m.op(answer).is_ok());

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 42);
    }

    #[test]
    fn uncalled_function_is_removed_but_main_survives() {
        let mut m = Module::new();
        let (_unused, unused_entry) = new_function(&mut m, "unused");
        B::at_block_end(&mut m, unused_entry).ret(None).unwrap();
        let (main_f, main_entry) = new_function(&mut m, "main");
        let mut b = B::at_block_end(&mut m, main_entry);
        let zero = b.const_int(0).unwrap();
        b.ret(Some(zero)).unwrap();

        let mut pass = Dce;
        pass.run(&mut m).unwrap();
        assert!(m.find_function_by_name("unused").is_none());
        assert!(m.op(main_f).is_ok());
    }

    #[test]
    fn mutually_referential_dead_phi_cycle_is_erased() {
        let mut m = Module::new();
        let (f, entry) = new_function(&mut m, "main");
        let region = m.op(f).unwrap().region.unwrap();
        let loop_b = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(loop_b);
        let exit_b = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(exit_b);

        let mut b = B::at_block_end(&mut m, entry);
        let zero = b.const_int(0).unwrap();
        b.goto(loop_b).unwrap();

        // loop_b has a self-referential phi nobody outside the cycle reads.
        let phi = {
            let mut b = B::at_block_end(&mut m, loop_b);
            b.phi(VT::I32, []).unwrap()
        };
        m.push_operand(phi, zero).unwrap();
        m.op_mut(phi).unwrap().phi_incoming.push(entry);
        m.push_operand(phi, phi).unwrap();
        m.op_mut(phi).unwrap().phi_incoming.push(loop_b);
        let mut b = B::at_block_end(&mut m, loop_b);
        let cond = b.const_int(0).unwrap();
        b.branch(cond, loop_b, exit_b).unwrap();

        let mut b = B::at_block_end(&mut m, exit_b);
        let seven = b.const_int(7).unwrap();
        b.ret(Some(seven)).unwrap();

        let mut pass = Dce;
        pass.run(&mut m).unwrap();
        assert!(m.op(phi).is_err());

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 7);
    }
}
