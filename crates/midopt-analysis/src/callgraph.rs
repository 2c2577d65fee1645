//! CallGraph analysis: recomputes `CallerAttr` for every function by
//! scanning `Call` (and `Clone`, which behaves as a call for graph
//! purposes) ops.
//!
//! A `Call`'s target function is named by its `NameAttr` (resolved against
//! the module's function table by name, the same way a `Global`'s name
//! resolves a `GetGlobal`). This is the one place the generic attribute set
//! is pressed into a role with no dedicated `CalleeAttr` of its own.

use std::collections::HashMap;

use midopt_ir::{Attr, AttrKind, Module, OpId, Opcode};

use crate::error::AnalysisResult;

#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    /// callee function OpId -> caller function OpIds that call it.
    pub callers: HashMap<OpId, Vec<OpId>>,
    /// caller function OpId -> callee function OpIds it calls.
    pub callees: HashMap<OpId, Vec<OpId>>,
}

impl CallGraph {
    pub fn callers_of(&self, callee: OpId) -> &[OpId] {
        self.callers.get(&callee).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn callees_of(&self, caller: OpId) -> &[OpId] {
        self.callees.get(&caller).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Name the function a `Call`/`Clone` op targets, if it can be resolved
/// against the module's function table.
pub fn call_target(module: &Module, call: OpId) -> Option<OpId> {
    let op = module.op(call).ok()?;
    if !matches!(op.opcode, Opcode::Call | Opcode::Clone) {
        return None;
    }
    let name = op.attr(AttrKind::Name).and_then(Attr::as_name)?;
    module.find_function_by_name(name)
}

/// Recompute the call graph, and write `CallerAttr` onto every function op
/// to match (the per-function "who calls me" set; `CallGraph` itself is the
/// richer in-memory form other analyses consult without re-scanning).
pub fn compute_call_graph(module: &mut Module) -> AnalysisResult<CallGraph> {
    let mut graph = CallGraph::default();
    for func in module.functions() {
        let calls = module.find_all(|op| matches!(op, Opcode::Call | Opcode::Clone))?;
        for call in calls {
            // restrict to calls that are (transitively) inside this func's region
            if !op_in_function(module, call, func)? {
                continue;
            }
            if let Some(callee) = call_target(module, call) {
                graph.callees.entry(func).or_default().push(callee);
                graph.callers.entry(callee).or_default().push(func);
            }
        }
    }
    for (&callee, callers) in graph.callers.iter_mut() {
        callers.sort();
        callers.dedup();
        module.op_mut(callee)?.attrs.set(Attr::Caller(callers.clone()));
    }
    for func in module.functions() {
        if !graph.callers.contains_key(&func) {
            module.op_mut(func)?.attrs.set(Attr::Caller(Vec::new()));
        }
    }
    Ok(graph)
}

fn op_in_function(module: &Module, op: OpId, func: OpId) -> AnalysisResult<bool> {
    let Some(region) = module.op(func)?.region else { return Ok(false) };
    let mut stack = vec![region];
    while let Some(r) = stack.pop() {
        let region = module.region(r)?;
        for &block in &region.blocks {
            for &candidate in &module.block(block)?.ops {
                if candidate == op {
                    return Ok(true);
                }
                let candidate_op = module.op(candidate)?;
                if let Some(nested) = candidate_op.region {
                    stack.push(nested);
                }
                if let Some(nested) = candidate_op.else_region {
                    stack.push(nested);
                }
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Builder, ValueType};

    fn make_caller_callee(name_caller: &str, name_callee: &str) -> (Module, OpId, OpId) {
        let mut m = Module::new();
        let callee = m.alloc_op(Opcode::Function, ValueType::Void);
        m.op_mut(callee).unwrap().attrs.set(Attr::Name(name_callee.to_string()));
        let callee_region = m.alloc_region();
        m.op_mut(callee).unwrap().region = Some(callee_region);
        let top = m.top_block;
        m.block_mut(top).unwrap().append(callee);
        m.op_mut(callee).unwrap().parent = Some(top);
        let callee_entry = m.alloc_block();
        m.region_mut_pub(callee_region).unwrap().append(callee_entry);
        Builder::at_block_end(&mut m, callee_entry).ret(None).unwrap();

        let caller = m.alloc_op(Opcode::Function, ValueType::Void);
        m.op_mut(caller).unwrap().attrs.set(Attr::Name(name_caller.to_string()));
        let caller_region = m.alloc_region();
        m.op_mut(caller).unwrap().region = Some(caller_region);
        m.block_mut(top).unwrap().append(caller);
        m.op_mut(caller).unwrap().parent = Some(top);
        let caller_entry = m.alloc_block();
        m.region_mut_pub(caller_region).unwrap().append(caller_entry);
        let mut b = Builder::at_block_end(&mut m, caller_entry);
        let call = b.create(Opcode::Call, ValueType::Void, [], [Attr::Name(name_callee.to_string())]).unwrap();
        let _ = call;
        b.ret(None).unwrap();
        (m, caller, callee)
    }

    #[test]
    fn call_graph_links_caller_and_callee() {
        let (mut m, caller, callee) = make_caller_callee("main", "f");
        let graph = compute_call_graph(&mut m).unwrap();
        assert_eq!(graph.callers_of(callee), &[caller]);
        assert_eq!(graph.callees_of(caller), &[callee]);
        assert_eq!(m.op(callee).unwrap().attr(AttrKind::Caller), Some(&Attr::Caller(vec![caller])));
    }
}
