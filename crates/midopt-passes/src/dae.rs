//! `DAE` (Dead Argument Elimination) per §4.7: an argument that is either
//! constant across every call site, or must-aliases the same global at
//! offset 0 at every call site, is dropped from the callee's signature (and
//! from every call site's argument list); a return value nobody ever reads
//! is dropped the same way.
//!
//! Runs after `CallGraph`/`Alias` so `call_target` and `must_alias` both
//! have fresh attributes to consult. Only ever touches non-recursive,
//! fully-resolved call sites -- a callee reachable through an unresolved
//! call (external, or named but missing) is left alone since this pass
//! can't see every site that would need reindexing.

use std::collections::HashMap;

use midopt_analysis::{call_target, compute_call_graph, must_alias, CallGraph};
use midopt_ir::{Attr, AttrKind, Module, OpId, Opcode, ValueType};

use crate::error::PassResult;
use crate::pass::Pass;

pub struct Dae;

fn all_call_sites(module: &Module, callee: OpId, _graph: &CallGraph) -> Vec<OpId> {
    // CallGraph only records functions, not individual call ops; rescan.
    module
        .find_all(|op| matches!(op, Opcode::Call))
        .unwrap_or_default()
        .into_iter()
        .filter(|&call| call_target(module, call) == Some(callee))
        .collect()
}

fn const_key(module: &Module, op_id: OpId) -> Option<(Opcode, i64)> {
    let op = module.op(op_id).ok()?;
    match op.opcode {
        Opcode::ConstInt => op.attr(AttrKind::Int).and_then(Attr::as_int).map(|v| (Opcode::ConstInt, v as i64)),
        Opcode::ConstFloat => op.attr(AttrKind::Float).and_then(Attr::as_float).map(|v| (Opcode::ConstFloat, v.to_bits() as i64)),
        _ => None,
    }
}

/// A dead argument is either constant across every call site, or every call
/// site's actual must-aliases the same global at offset 0; returns the
/// replacement recipe each site should use in place of passing it.
enum DeadArg {
    Constant(Opcode, i64),
    Global(String),
}

fn classify_argument(module: &Module, callee: OpId, index: usize, sites: &[OpId]) -> Option<DeadArg> {
    if sites.is_empty() {
        return None;
    }
    let actuals: Vec<OpId> = sites.iter().map(|&call| module.op(call).unwrap().operands[index]).collect();
    if let Some(first_key) = const_key(module, actuals[0]) {
        if actuals.iter().all(|&a| const_key(module, a) == Some(first_key)) {
            return Some(DeadArg::Constant(first_key.0, first_key.1));
        }
    }
    let first_global = global_base(module, actuals[0]);
    if let Some(name) = &first_global {
        if actuals.iter().all(|&a| must_alias(module, a, actuals[0])) {
            let _ = callee;
            return Some(DeadArg::Global(name.clone()));
        }
    }
    None
}

fn global_base(module: &Module, op_id: OpId) -> Option<String> {
    let op = module.op(op_id).ok()?;
    if op.opcode == Opcode::GetGlobal {
        op.attr(AttrKind::Name).and_then(Attr::as_name).map(str::to_string)
    } else {
        None
    }
}

impl Pass for Dae {
    fn name(&self) -> &'static str {
        "DAE"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let graph = compute_call_graph(module)?;
        let mut changed = false;

        for func in module.functions() {
            if module.function_name(func).as_deref() == Some("main") {
                continue;
            }
            let sites = all_call_sites(module, func, &graph);
            if sites.is_empty() {
                continue;
            }
            // Skip recursive functions: reindexing while the function
            // might call itself with a different actual-argument count
            // mid-rewrite is unsound without a second pass.
            if sites.iter().any(|&call| enclosing_function(module, call) == Some(func)) {
                continue;
            }

            let get_args = module.find_all(|op| op == Opcode::GetArg).unwrap_or_default();
            let mut callee_get_args: HashMap<usize, Vec<OpId>> = HashMap::new();
            for &ga in &get_args {
                let Some(parent_fn) = enclosing_function(module, ga) else { continue };
                if parent_fn != func {
                    continue;
                }
                if let Some(idx) = module.op(ga)?.attr(AttrKind::Int).and_then(Attr::as_int) {
                    callee_get_args.entry(idx as usize).or_default().push(ga);
                }
            }

            let max_index = callee_get_args.keys().copied().max();
            let Some(max_index) = max_index else { continue };
            let mut dead_indices: Vec<usize> = Vec::new();
            for index in 0..=max_index {
                if let Some(recipe) = classify_argument(module, func, index, &sites) {
                    let replacement = match recipe {
                        DeadArg::Constant(Opcode::ConstInt, bits) => {
                            let entry_block = module.region(module.op(func)?.region.unwrap())?.entry().unwrap();
                            let mut b = midopt_ir::Builder::at_block_start(module, entry_block);
                            b.const_int(bits as i32)?
                        }
                        DeadArg::Constant(Opcode::ConstFloat, bits) => {
                            let entry_block = module.region(module.op(func)?.region.unwrap())?.entry().unwrap();
                            let mut b = midopt_ir::Builder::at_block_start(module, entry_block);
                            b.const_float(f32::from_bits(bits as u32))?
                        }
                        DeadArg::Constant(..) => continue,
                        DeadArg::Global(name) => {
                            let entry_block = module.region(module.op(func)?.region.unwrap())?.entry().unwrap();
                            let mut b = midopt_ir::Builder::at_block_start(module, entry_block);
                            b.create(Opcode::GetGlobal, ValueType::I64, [], [Attr::Name(name)])?
                        }
                    };
                    if let Some(users) = callee_get_args.get(&index) {
                        for &ga in users {
                            module.replace_all_uses_with(ga, replacement)?;
                            module.erase_op(ga)?;
                        }
                    }
                    dead_indices.push(index);
                    changed = true;
                }
            }

            if dead_indices.is_empty() {
                continue;
            }
            dead_indices.sort_unstable();
            for &call in &sites {
                let mut op = module.op(call)?.clone();
                for &idx in dead_indices.iter().rev() {
                    if idx < op.operands.len() {
                        op.operands.remove(idx);
                    }
                }
                module.set_operands(call, op.operands)?;
            }
            // Reindex the surviving GetArg ops: each one's Int attr shifts
            // down by the count of dropped indices below it.
            for index in 0..=max_index {
                if dead_indices.contains(&index) {
                    continue;
                }
                let shift = dead_indices.iter().filter(|&&d| d < index).count();
                if shift == 0 {
                    continue;
                }
                if let Some(users) = callee_get_args.get(&index) {
                    for &ga in users {
                        if module.op(ga).is_ok() {
                            module.op_mut(ga)?.attrs.set(Attr::Int((index - shift) as i32));
                        }
                    }
                }
            }
        }

        changed |= eliminate_dead_returns(module, &graph)?;
        Ok(changed)
    }
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

/// A `Call`'s result that is never used at any call site means the callee's
/// `Return` value can be dropped (its `Return` op keeps executing for
/// control flow, it just stops carrying an operand).
fn eliminate_dead_returns(module: &mut Module, graph: &CallGraph) -> PassResult<bool> {
    let mut changed = false;
    for func in module.functions() {
        if module.function_name(func).as_deref() == Some("main") {
            continue;
        }
        if module.op(func)?.result_type == ValueType::Void {
            continue;
        }
        let sites = all_call_sites(module, func, graph);
        if sites.is_empty() {
            continue;
        }
        if sites.iter().all(|&call| module.op(call).map(|op| op.uses.is_empty()).unwrap_or(true)) {
            let returns = module.find_all(|op| op == Opcode::Return)?;
            for ret in returns {
                if enclosing_function(module, ret) == Some(func) {
                    module.set_operands(ret, Default::default())?;
                }
            }
            module.op_mut(func)?.result_type = ValueType::Void;
            changed = true;
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_analysis::compute_alias;
    use midopt_ir::{Builder as B, Opcode as Op, ValueType as VT};
    use midopt_interp::run;

    fn new_function(m: &mut Module, name: &str) -> (OpId, midopt_ir::BlockId) {
        let f = m.alloc_op(Op::Function, VT::I32);
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
    fn constant_argument_across_all_call_sites_is_dropped() {
        let mut m = Module::new();
        let (_callee, entry) = new_function(&mut m, "add_one");
        let mut b = B::at_block_end(&mut m, entry);
        let arg = b.create(Op::GetArg, VT::I32, [], [Attr::Int(0)]).unwrap();
        let one = b.const_int(1).unwrap();
        let sum = b.create(Op::AddI, VT::I32, [arg, one], []).unwrap();
        b.ret(Some(sum)).unwrap();

        let (_main, entry2) = new_function(&mut m, "main");
        let mut b = B::at_block_end(&mut m, entry2);
        let five = b.const_int(5).unwrap();
        let call1 = b.create(Op::Call, VT::I32, [five], [Attr::Name("add_one".to_string())]).unwrap();
        let five2 = b.const_int(5).unwrap();
        let call2 = b.create(Op::Call, VT::I32, [five2], [Attr::Name("add_one".to_string())]).unwrap();
        let sum = b.create(Op::AddI, VT::I32, [call1, call2], []).unwrap();
        b.ret(Some(sum)).unwrap();

        let graph = compute_call_graph(&mut m).unwrap();
        compute_alias(&mut m, &graph).unwrap();
        let mut pass = Dae;
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);
        assert!(m.op(arg).is_err());
        assert!(m.op(call1).unwrap().operands.is_empty());

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 12);
    }
}
