//! AtMostOnce analysis: is a function called at most once at runtime?
//!
//! A function qualifies if it has no callers at all, or if it has exactly
//! one caller (other than itself), that caller contains exactly one `Call`
//! op naming it, and that call site is not nested inside any `While`/`For`
//! body (a loop body can run its call any number of times regardless of how
//! many `Call` ops lexically appear in it).

use std::collections::HashSet;

use midopt_ir::{Attr, Module, OpId, Opcode};

use crate::callgraph::{call_target, CallGraph};
use crate::error::AnalysisResult;

/// Every `Call`/`Clone` op inside `func`'s region, paired with whether it is
/// nested (transitively) inside a `While` or `For` body.
fn call_sites_with_loop_nesting(module: &Module, func: OpId) -> AnalysisResult<Vec<(OpId, bool)>> {
    let mut out = Vec::new();
    let Some(region) = module.op(func)?.region else { return Ok(out) };
    let mut stack = vec![(region, false)];
    while let Some((r, in_loop)) = stack.pop() {
        for &block in &module.region(r)?.blocks {
            for &op_id in &module.block(block)?.ops {
                let op = module.op(op_id)?;
                if matches!(op.opcode, Opcode::Call | Opcode::Clone) {
                    out.push((op_id, in_loop));
                }
                let nested_in_loop = in_loop || matches!(op.opcode, Opcode::While | Opcode::For);
                if let Some(nested) = op.region {
                    stack.push((nested, nested_in_loop));
                }
                if let Some(nested) = op.else_region {
                    stack.push((nested, nested_in_loop));
                }
            }
        }
    }
    Ok(out)
}

fn is_at_most_once(module: &Module, func: OpId, graph: &CallGraph) -> AnalysisResult<bool> {
    let callers: HashSet<OpId> = graph.callers_of(func).iter().copied().filter(|&c| c != func).collect();
    if callers.is_empty() {
        return Ok(true);
    }
    if callers.len() != 1 {
        return Ok(false);
    }
    let caller = *callers.iter().next().unwrap();
    let sites = call_sites_with_loop_nesting(module, caller)?;
    let matching: Vec<_> = sites.into_iter().filter(|&(call, _)| call_target(module, call) == Some(func)).collect();
    Ok(matching.len() == 1 && !matching[0].1)
}

/// Compute AtMostOnce for every function and write `AtMostOnceAttr`.
pub fn compute_at_most_once(module: &mut Module, graph: &CallGraph) -> AnalysisResult<HashSet<OpId>> {
    let mut result = HashSet::new();
    for func in module.functions() {
        if is_at_most_once(module, func, graph)? {
            result.insert(func);
        }
    }
    for func in module.functions() {
        module.op_mut(func)?.attrs.set(Attr::AtMostOnce(result.contains(&func)));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callgraph::compute_call_graph;
    use midopt_ir::{AttrKind, Builder, ValueType};

    fn declare_function(m: &mut Module, name: &str) -> (OpId, midopt_ir::BlockId) {
        let f = m.alloc_op(Opcode::Function, ValueType::Void);
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
    fn uncalled_function_is_at_most_once() {
        let mut m = Module::new();
        let (f, entry) = declare_function(&mut m, "helper");
        Builder::at_block_end(&mut m, entry).ret(None).unwrap();
        let graph = compute_call_graph(&mut m).unwrap();
        let result = compute_at_most_once(&mut m, &graph).unwrap();
        assert!(result.contains(&f));
        assert_eq!(m.op(f).unwrap().attr(AttrKind::AtMostOnce), Some(&Attr::AtMostOnce(true)));
    }

    #[test]
    fn single_call_site_outside_a_loop_is_at_most_once() {
        let mut m = Module::new();
        let (callee, callee_entry) = declare_function(&mut m, "once");
        Builder::at_block_end(&mut m, callee_entry).ret(None).unwrap();

        let (caller, caller_entry) = declare_function(&mut m, "main");
        let mut b = Builder::at_block_end(&mut m, caller_entry);
        b.create(Opcode::Call, ValueType::Void, [], [Attr::Name("once".to_string())]).unwrap();
        b.ret(None).unwrap();
        let _ = caller;

        let graph = compute_call_graph(&mut m).unwrap();
        let result = compute_at_most_once(&mut m, &graph).unwrap();
        assert!(result.contains(&callee));
    }

    #[test]
    fn call_site_inside_a_loop_is_not_at_most_once() {
        let mut m = Module::new();
        let (callee, callee_entry) = declare_function(&mut m, "repeated");
        Builder::at_block_end(&mut m, callee_entry).ret(None).unwrap();

        let (caller, caller_entry) = declare_function(&mut m, "main");
        let loop_region = m.alloc_region();
        let loop_block = m.alloc_block();
        m.region_mut_pub(loop_region).unwrap().append(loop_block);
        let mut b = Builder::at_block_end(&mut m, loop_block);
        b.create(Opcode::Call, ValueType::Void, [], [Attr::Name("repeated".to_string())]).unwrap();
        drop(b);
        let mut b = Builder::at_block_end(&mut m, caller_entry);
        let while_op = b.create(Opcode::While, ValueType::Void, [], []).unwrap();
        m.op_mut(while_op).unwrap().region = Some(loop_region);
        Builder::at_block_end(&mut m, caller_entry).ret(None).unwrap();
        let _ = caller;

        let graph = compute_call_graph(&mut m).unwrap();
        let result = compute_at_most_once(&mut m, &graph).unwrap();
        assert!(!result.contains(&callee));
    }
}
