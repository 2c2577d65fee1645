//! Pureness analysis: a function is impure if it (transitively) touches
//! globals, calls an external function, or performs a concurrency
//! primitive.

use std::collections::{HashSet, VecDeque};

use midopt_ir::{Attr, Module, OpId, Opcode};

use crate::callgraph::{call_target, CallGraph};
use crate::error::AnalysisResult;

/// Scan `func`'s region (recursively, through nested structured regions)
/// for a direct cause of impurity: `GetGlobal`, a concurrency primitive, or
/// a `Call`/`Clone` that names no function in this module ("external").
fn has_direct_impurity(module: &Module, func: OpId) -> AnalysisResult<bool> {
    let Some(region) = module.op(func)?.region else { return Ok(false) };
    let mut stack = vec![region];
    while let Some(r) = stack.pop() {
        for &block in &module.region(r)?.blocks {
            for &op_id in &module.block(block)?.ops {
                let op = module.op(op_id)?;
                match op.opcode {
                    Opcode::GetGlobal | Opcode::Clone | Opcode::Join | Opcode::Wake => return Ok(true),
                    Opcode::Call => {
                        if call_target(module, op_id).is_none() {
                            return Ok(true);
                        }
                    }
                    _ => {}
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
    Ok(false)
}

/// Run Pureness to a fixpoint and write `ImpureAttr` on every function.
/// Returns the set of impure function ids.
pub fn compute_pureness(module: &mut Module, graph: &CallGraph) -> AnalysisResult<HashSet<OpId>> {
    let functions = module.functions();
    let mut impure: HashSet<OpId> = HashSet::new();
    let mut worklist: VecDeque<OpId> = VecDeque::new();
    for &f in &functions {
        if has_direct_impurity(module, f)? {
            impure.insert(f);
            worklist.push_back(f);
        }
    }
    while let Some(f) = worklist.pop_front() {
        for &caller in graph.callers_of(f) {
            if impure.insert(caller) {
                worklist.push_back(caller);
            }
        }
    }
    for &f in &functions {
        module.op_mut(f)?.attrs.set(Attr::Impure(impure.contains(&f)));
    }
    Ok(impure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callgraph::compute_call_graph;
    use midopt_ir::{AttrKind, Builder, ValueType};

    #[test]
    fn function_touching_global_is_impure_and_so_is_its_caller() {
        let mut m = Module::new();
        let global = m.alloc_op(Opcode::Global, ValueType::Void);
        m.op_mut(global).unwrap().attrs.set(Attr::Name("g".to_string()));
        let top = m.top_block;
        m.block_mut(top).unwrap().append(global);
        m.op_mut(global).unwrap().parent = Some(top);

        let callee = m.alloc_op(Opcode::Function, ValueType::Void);
        m.op_mut(callee).unwrap().attrs.set(Attr::Name("touches_global".to_string()));
        let callee_region = m.alloc_region();
        m.op_mut(callee).unwrap().region = Some(callee_region);
        m.block_mut(top).unwrap().append(callee);
        m.op_mut(callee).unwrap().parent = Some(top);
        let callee_entry = m.alloc_block();
        m.region_mut_pub(callee_region).unwrap().append(callee_entry);
        let mut b = Builder::at_block_end(&mut m, callee_entry);
        b.create(Opcode::GetGlobal, ValueType::I32, [], [Attr::Name("g".to_string())]).unwrap();
        b.ret(None).unwrap();

        let caller = m.alloc_op(Opcode::Function, ValueType::Void);
        m.op_mut(caller).unwrap().attrs.set(Attr::Name("caller".to_string()));
        let caller_region = m.alloc_region();
        m.op_mut(caller).unwrap().region = Some(caller_region);
        m.block_mut(top).unwrap().append(caller);
        m.op_mut(caller).unwrap().parent = Some(top);
        let caller_entry = m.alloc_block();
        m.region_mut_pub(caller_region).unwrap().append(caller_entry);
        let mut b = Builder::at_block_end(&mut m, caller_entry);
        b.create(Opcode::Call, ValueType::Void, [], [Attr::Name("touches_global".to_string())]).unwrap();
        b.ret(None).unwrap();

        let graph = compute_call_graph(&mut m).unwrap();
        let impure = compute_pureness(&mut m, &graph).unwrap();
        assert!(impure.contains(&callee));
        assert!(impure.contains(&caller));
        assert_eq!(m.op(caller).unwrap().attr(AttrKind::Impure), Some(&Attr::Impure(true)));
    }

    #[test]
    fn function_with_no_effects_is_pure() {
        let mut m = Module::new();
        let f = m.alloc_op(Opcode::Function, ValueType::Void);
        m.op_mut(f).unwrap().attrs.set(Attr::Name("pure_fn".to_string()));
        let region = m.alloc_region();
        m.op_mut(f).unwrap().region = Some(region);
        let top = m.top_block;
        m.block_mut(top).unwrap().append(f);
        m.op_mut(f).unwrap().parent = Some(top);
        let entry = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(entry);
        let mut b = Builder::at_block_end(&mut m, entry);
        let c = b.const_int(1).unwrap();
        b.ret(Some(c)).unwrap();

        let graph = compute_call_graph(&mut m).unwrap();
        let impure = compute_pureness(&mut m, &graph).unwrap();
        assert!(!impure.contains(&f));
    }
}
