//! Inlining per §4.8: `EarlyInline` runs on structured CFG before `Flatten`
//! (no block splitting, no Phis -- a structured function body is one
//! straight-line op list per the shape `Flatten` itself relies on);
//! `Inline` and `LateInline` run on flat CFG, before and after `Mem2Reg`
//! respectively, sharing the block-split/clone-map/retarget-map mechanics
//! and differing only in how a cloned `Return` becomes a value back at the
//! call site (stack slot before `Mem2Reg`, merging `Phi` after).
//!
//! All three refuse a recursive callee outright: this workspace never
//! builds a real inliner call stack, so a callee that (transitively) calls
//! itself is left as an ordinary `Call`.

use std::collections::HashMap;

use midopt_analysis::{call_target, compute_call_graph, CallGraph};
use midopt_ir::{Attr, AttrKind, BlockId, Builder, Module, OpId, Opcode, RegionId, ValueType};

use crate::error::PassResult;
use crate::pass::Pass;

fn call_sites_of(module: &Module, callee: OpId) -> Vec<OpId> {
    module
        .find_all(|op| matches!(op, Opcode::Call))
        .unwrap_or_default()
        .into_iter()
        .filter(|&call| call_target(module, call) == Some(callee))
        .collect()
}

fn is_recursive(module: &Module, graph: &CallGraph, func: OpId) -> bool {
    let mut seen = std::collections::HashSet::new();
    let mut stack = vec![func];
    while let Some(f) = stack.pop() {
        for &callee in graph.callees_of(f) {
            if callee == func {
                return true;
            }
            if seen.insert(callee) {
                stack.push(callee);
            }
        }
    }
    false
}

fn op_count(module: &Module, region: RegionId) -> usize {
    module.region(region).map(|r| r.blocks.iter().map(|&b| module.block(b).map(|bb| bb.ops.len()).unwrap_or(0)).sum()).unwrap_or(0)
}

// ---------------------------------------------------------------------
// EarlyInline: structured CFG, single call site, no internal Return except
// (optionally) one trailing the entry block's op list. A Return nested
// inside an If/While/For would need a non-local exit rewrite through every
// enclosing structured op; this pass declines rather than attempt that, and
// leaves the callee for ordinary (flat-CFG) Inline/LateInline to handle.
// ---------------------------------------------------------------------

pub struct EarlyInline {
    pub threshold: usize,
}

impl Default for EarlyInline {
    fn default() -> Self {
        EarlyInline { threshold: 200 }
    }
}

fn has_nested_return(module: &Module, region: RegionId) -> PassResult<bool> {
    for &block in &module.region(region)?.blocks {
        for &op_id in &module.block(block)?.ops {
            let op = module.op(op_id)?;
            for nested in [op.region, op.else_region].into_iter().flatten() {
                if region_contains_return(module, nested)? {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

fn region_contains_return(module: &Module, region: RegionId) -> PassResult<bool> {
    for &block in &module.region(region)?.blocks {
        for &op_id in &module.block(block)?.ops {
            let op = module.op(op_id)?;
            if op.opcode == Opcode::Return {
                return Ok(true);
            }
            for nested in [op.region, op.else_region].into_iter().flatten() {
                if region_contains_return(module, nested)? {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

impl Pass for EarlyInline {
    fn name(&self) -> &'static str {
        "EarlyInline"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let graph = compute_call_graph(module)?;
        let mut changed = false;
        for callee in module.functions() {
            if module.function_name(callee).as_deref() == Some("main") {
                continue;
            }
            let Some(callee_region) = module.op(callee)?.region else { continue };
            if op_count(module, callee_region) > self.threshold {
                continue;
            }
            if is_recursive(module, &graph, callee) {
                continue;
            }
            let sites = call_sites_of(module, callee);
            if sites.len() != 1 {
                continue;
            }
            if has_nested_return(module, callee_region)? {
                continue;
            }
            let call = sites[0];
            if inline_one_structured(module, call, callee, callee_region)? {
                changed = true;
            }
        }
        Ok(changed)
    }
}

fn inline_one_structured(module: &mut Module, call: OpId, callee: OpId, callee_region: RegionId) -> PassResult<bool> {
    let Some(block) = module.op(call)?.parent else { return Ok(false) };
    let Some(pos) = module.block(block)?.position(call) else { return Ok(false) };
    let Some(entry) = module.region(callee_region)?.entry() else { return Ok(false) };
    let callee_ops = module.block(entry)?.ops.clone();
    let actuals: Vec<OpId> = module.op(call)?.operands.iter().copied().collect();

    let mut map: HashMap<OpId, OpId> = HashMap::new();
    let mut trailing_value: Option<OpId> = None;
    let mut insert_at = pos;
    for &op_id in &callee_ops {
        let op = module.op(op_id)?.clone();
        match op.opcode {
            Opcode::GetArg => {
                let idx = op.attr(AttrKind::Int).and_then(Attr::as_int).unwrap_or(0) as usize;
                if let Some(&actual) = actuals.get(idx) {
                    map.insert(op_id, actual);
                }
            }
            Opcode::Return => {
                trailing_value = op.operands.first().map(|&v| map.get(&v).copied().unwrap_or(*v));
            }
            _ => {
                let new_id = module.alloc_op(op.opcode, op.result_type);
                module.op_mut(new_id)?.attrs = op.attrs.clone();
                let new_operands: Vec<OpId> = op.operands.iter().map(|o| map.get(o).copied().unwrap_or(*o)).collect();
                module.set_operands(new_id, new_operands.into_iter().collect())?;
                // structured nested ops (If/While/For inside this body) are
                // left sharing the callee's own region/else_region; since
                // this op is freshly cloned and the original callee function
                // is about to lose all callers it's safe to hand the region
                // ownership across rather than deep-clone it.
                module.op_mut(new_id)?.region = op.region;
                module.op_mut(new_id)?.else_region = op.else_region;
                module.block_mut(block)?.insert_at(insert_at, new_id);
                module.op_mut(new_id)?.parent = Some(block);
                insert_at += 1;
                map.insert(op_id, new_id);
            }
        }
    }

    if let Some(value) = trailing_value {
        module.replace_all_uses_with(call, value)?;
    }
    module.block_mut(block)?.remove_op(call);
    module.force_erase_op(call)?;
    let _ = callee;
    Ok(true)
}

// ---------------------------------------------------------------------
// Flat-CFG inlining, shared by `Inline` (pre-Mem2Reg) and `LateInline`
// (post-Mem2Reg).
// ---------------------------------------------------------------------

fn inline_flat(module: &mut Module, call: OpId, callee: OpId, late: bool) -> PassResult<bool> {
    let Some(caller_block) = module.op(call)?.parent else { return Ok(false) };
    let Some(caller_func) = enclosing_function(module, call) else { return Ok(false) };
    let Some(caller_region) = module.op(caller_func)?.region else { return Ok(false) };
    let Some(callee_region) = module.op(callee)?.region else { return Ok(false) };
    let Some(pos) = module.block(caller_block)?.position(call) else { return Ok(false) };
    let actuals: Vec<OpId> = module.op(call)?.operands.iter().copied().collect();
    let result_type = module.op(call)?.result_type;

    // 1. split caller_block at the call: everything from `pos` onward
    // (including the call itself) moves to a fresh `tail` block.
    let tail = module.alloc_block();
    module.region_mut_pub(caller_region)?.append(tail);
    let trailing: Vec<OpId> = module.block(caller_block)?.ops[pos..].to_vec();
    for &op_id in &trailing {
        module.block_mut(caller_block)?.remove_op(op_id);
        module.block_mut(tail)?.append(op_id);
        module.op_mut(op_id)?.parent = Some(tail);
    }
    // the call itself stays at the front of `tail`; it's replaced below.

    // 2. allocate return storage for the pre-Mem2Reg flavor.
    let return_slot = if !late && result_type != ValueType::Void {
        let entry = module.region(caller_region)?.entry().unwrap();
        let mut b = Builder::at_block_start(module, entry);
        Some(b.create(Opcode::Alloca, ValueType::I64, [], [Attr::Size(4)])?)
    } else {
        None
    };

    // 3. clone callee blocks in order, building a block map.
    let callee_blocks = module.region(callee_region)?.blocks.clone();
    let mut block_map: HashMap<BlockId, BlockId> = HashMap::new();
    for &cb in &callee_blocks {
        let nb = module.alloc_block();
        module.region_mut_pub(caller_region)?.append(nb);
        block_map.insert(cb, nb);
    }

    let mut op_map: HashMap<OpId, OpId> = HashMap::new();
    let mut return_sites: Vec<(OpId, BlockId)> = Vec::new();
    let mut cloned_allocas: Vec<OpId> = Vec::new();

    for &cb in &callee_blocks {
        let new_block = block_map[&cb];
        let ops = module.block(cb)?.ops.clone();
        for op_id in ops {
            let op = module.op(op_id)?.clone();
            match op.opcode {
                Opcode::GetArg => {
                    let idx = op.attr(AttrKind::Int).and_then(Attr::as_int).unwrap_or(0) as usize;
                    if let Some(&actual) = actuals.get(idx) {
                        op_map.insert(op_id, actual);
                    }
                }
                Opcode::Return => {
                    let value = op.operands.first().map(|&v| op_map.get(&v).copied().unwrap_or(v));
                    let goto_op = module.alloc_op(Opcode::Goto, ValueType::Void);
                    module.op_mut(goto_op)?.attrs.set(Attr::Target(tail));
                    module.block_mut(new_block)?.append(goto_op);
                    module.op_mut(goto_op)?.parent = Some(new_block);
                    if !late {
                        if let (Some(slot), Some(value)) = (return_slot, value) {
                            let store_op = module.alloc_op(Opcode::Store, ValueType::Void);
                            module.set_operands(store_op, [slot, value].into_iter().collect())?;
                            module.block_mut(new_block)?.insert_at(module.block(new_block)?.ops.len() - 1, store_op);
                            module.op_mut(store_op)?.parent = Some(new_block);
                        }
                    } else if let Some(value) = value {
                        return_sites.push((value, new_block));
                    }
                }
                _ => {
                    let new_id = module.alloc_op(op.opcode, op.result_type);
                    module.op_mut(new_id)?.attrs = op.attrs.clone();
                    if op.opcode == Opcode::Alloca {
                        cloned_allocas.push(new_id);
                    }
                    let new_operands: Vec<OpId> = op.operands.iter().map(|o| op_map.get(o).copied().unwrap_or(*o)).collect();
                    module.set_operands(new_id, new_operands.into_iter().collect())?;
                    if let Some(target) = op.attr(AttrKind::Target).and_then(Attr::as_target) {
                        module.op_mut(new_id)?.attrs.set(Attr::Target(block_map.get(&target).copied().unwrap_or(target)));
                    }
                    if let Some(els) = op.attr(AttrKind::Else).and_then(Attr::as_else) {
                        module.op_mut(new_id)?.attrs.set(Attr::Else(block_map.get(&els).copied().unwrap_or(els)));
                    }
                    if op.opcode == Opcode::Phi {
                        let retargeted: Vec<BlockId> = op.phi_incoming.iter().map(|b| block_map.get(b).copied().unwrap_or(*b)).collect();
                        module.op_mut(new_id)?.phi_incoming = retargeted;
                    }
                    module.block_mut(new_block)?.append(new_id);
                    module.op_mut(new_id)?.parent = Some(new_block);
                    op_map.insert(op_id, new_id);
                }
            }
        }
    }

    // 4. Goto(caller_block -> callee entry clone).
    let callee_entry = block_map[&callee_blocks[0]];
    let goto_entry = module.alloc_op(Opcode::Goto, ValueType::Void);
    module.op_mut(goto_entry)?.attrs.set(Attr::Target(callee_entry));
    module.block_mut(caller_block)?.append(goto_entry);
    module.op_mut(goto_entry)?.parent = Some(caller_block);

    // 5. resolve the call's uses to the returned value, and drop the call.
    if late {
        if result_type != ValueType::Void {
            if return_sites.len() == 1 {
                module.replace_all_uses_with(call, return_sites[0].0)?;
            } else if return_sites.len() > 1 {
                let mut b = Builder::at_block_start(module, tail);
                let phi = b.phi(result_type, return_sites.iter().map(|&(v, b)| (v, b)))?;
                module.replace_all_uses_with(call, phi)?;
            }
        }
    } else if let Some(slot) = return_slot {
        let mut b = Builder::at_block_start(module, tail);
        let loaded = b.create(Opcode::Load, result_type, [slot], [])?;
        module.replace_all_uses_with(call, loaded)?;
    }
    module.block_mut(tail)?.remove_op(call);
    module.force_erase_op(call)?;

    // 6. hoist cloned allocas into the caller's entry prelude.
    let entry = module.region(caller_region)?.entry().unwrap();
    for (i, alloca) in cloned_allocas.into_iter().enumerate() {
        if let Some(old_parent) = module.op(alloca)?.parent {
            module.block_mut(old_parent)?.remove_op(alloca);
        }
        let at = i.min(module.block(entry)?.ops.len());
        module.block_mut(entry)?.insert_at(at, alloca);
        module.op_mut(alloca)?.parent = Some(entry);
    }

    Ok(true)
}

fn enclosing_function(module: &Module, op_id: OpId) -> Option<OpId> {
    let mut block = module.op(op_id).ok()?.parent?;
    loop {
        let parent_op = module.get_parent_op(block)?;
        if module.is_function(parent_op) {
            return Some(parent_op);
        }
        block = module.op(parent_op).ok()?.parent?;
    }
}

fn run_flat_inline(module: &mut Module, threshold: usize, late: bool) -> PassResult<bool> {
    let graph = compute_call_graph(module)?;
    let mut changed = false;
    loop {
        let mut did_one = false;
        'outer: for callee in module.functions() {
            if module.function_name(callee).as_deref() == Some("main") {
                continue;
            }
            let Some(callee_region) = module.op(callee)?.region else { continue };
            if op_count(module, callee_region) > threshold {
                continue;
            }
            if is_recursive(module, &graph, callee) {
                continue;
            }
            for call in call_sites_of(module, callee) {
                if enclosing_function(module, call) == Some(callee) {
                    continue;
                }
                if inline_flat(module, call, callee, late)? {
                    changed = true;
                    did_one = true;
                    break 'outer;
                }
            }
        }
        if !did_one {
            break;
        }
    }
    Ok(changed)
}

pub struct Inline {
    pub threshold: usize,
}

impl Default for Inline {
    fn default() -> Self {
        Inline { threshold: 200 }
    }
}

impl Pass for Inline {
    fn name(&self) -> &'static str {
        "Inline"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        run_flat_inline(module, self.threshold, false)
    }
}

pub struct LateInline {
    pub threshold: usize,
}

impl Default for LateInline {
    fn default() -> Self {
        LateInline { threshold: 200 }
    }
}

impl Pass for LateInline {
    fn name(&self) -> &'static str {
        "LateInline"
    }

    fn marks_mem2reg(&self) -> bool {
        true
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        run_flat_inline(module, self.threshold, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Builder as B, Opcode as Op, ValueType as VT};
    use midopt_interp::run;

    fn new_function(m: &mut Module, name: &str, ret: VT) -> (OpId, BlockId) {
        let f = m.alloc_op(Op::Function, ret);
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
    fn flat_inline_splices_single_return_callee() {
        let mut m = Module::new();
        let (_callee, callee_entry) = new_function(&mut m, "double", VT::I32);
        let mut b = B::at_block_end(&mut m, callee_entry);
        let arg = b.create(Op::GetArg, VT::I32, [], [Attr::Int(0)]).unwrap();
        let sum = b.create(Op::AddI, VT::I32, [arg, arg], []).unwrap();
        b.ret(Some(sum)).unwrap();

        let (_main, main_entry) = new_function(&mut m, "main", VT::I32);
        let mut b = B::at_block_end(&mut m, main_entry);
        let seven = b.const_int(7).unwrap();
        let call = b.create(Op::Call, VT::I32, [seven], [Attr::Name("double".to_string())]).unwrap();
        b.ret(Some(call)).unwrap();

        let mut pass = Inline::default();
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);
        assert!(m.op(call).is_err());

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 14);
    }
}
