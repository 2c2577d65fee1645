//! Alias analysis: points-to sets over storage bases (`Alloca`/`Global`
//! ops), propagated forward over the dominator tree and then across call
//! edges to a fixpoint.
//!
//! Ground truth for the propagation rules is the source's `Alias.cpp`:
//! seed `Alloca` with `{self: [0]}` and `GetGlobal` with `{global: [0]}`;
//! an `AddL` with one constant operand shifts every offset by that
//! constant; an `AddL` of two non-constant operands merges the operands'
//! bases and drops to the `-1` ("unknown offset within this base")
//! wildcard, since the compile-time offset can no longer be tracked; an
//! operand whose own alias set is `Unknown` poisons the result to
//! `Unknown` rather than silently merging partial information.

use std::collections::HashSet;

use indexmap::IndexMap;
use midopt_ir::dominators::{compute_dominators, recompute_cfg, dom_tree_preorder};
use midopt_ir::{AliasSet, Attr, AttrKind, Module, OpId, Opcode};

use crate::callgraph::CallGraph;
use crate::error::AnalysisResult;

fn operand_alias(module: &Module, op: OpId) -> AliasSet {
    module
        .op(op)
        .ok()
        .and_then(|o| o.attr(AttrKind::Alias))
        .and_then(Attr::as_alias)
        .cloned()
        .unwrap_or(AliasSet::Unknown)
}

fn const_int_value(module: &Module, op: OpId) -> Option<i32> {
    let o = module.op(op).ok()?;
    if o.opcode == Opcode::ConstInt {
        o.attr(AttrKind::Int).and_then(Attr::as_int)
    } else {
        None
    }
}

fn shift(set: &AliasSet, delta: i64) -> AliasSet {
    match set {
        AliasSet::Unknown => AliasSet::Unknown,
        AliasSet::Known(map) => {
            let mut out = IndexMap::new();
            for (&base, offsets) in map {
                let shifted: Vec<i64> = offsets
                    .iter()
                    .map(|&o| if o == AliasSet::UNKNOWN_OFFSET { o } else { o + delta })
                    .collect();
                out.insert(base, shifted);
            }
            AliasSet::Known(out)
        }
    }
}

fn merge_to_wildcard(a: &AliasSet, b: &AliasSet) -> AliasSet {
    match (a, b) {
        (AliasSet::Unknown, _) | (_, AliasSet::Unknown) => AliasSet::Unknown,
        (AliasSet::Known(ma), AliasSet::Known(mb)) => {
            let mut out: IndexMap<OpId, Vec<i64>> = IndexMap::new();
            for &base in ma.keys().chain(mb.keys()) {
                out.insert(base, vec![AliasSet::UNKNOWN_OFFSET]);
            }
            AliasSet::Known(out)
        }
    }
}

/// Union of two alias sets (used for the interprocedural join at `GetArg`,
/// where a callee's argument may be reached from several distinct call
/// sites and all of them are possible, not "the unknown offset of a merged
/// base" -- unlike `merge_to_wildcard`, this keeps concrete offsets.
fn union(a: &AliasSet, b: &AliasSet) -> AliasSet {
    match (a, b) {
        (AliasSet::Unknown, _) | (_, AliasSet::Unknown) => AliasSet::Unknown,
        (AliasSet::Known(ma), AliasSet::Known(mb)) => {
            let mut out = ma.clone();
            for (&base, offsets) in mb {
                let entry = out.entry(base).or_default();
                for &o in offsets {
                    if !entry.contains(&o) {
                        entry.push(o);
                    }
                }
            }
            AliasSet::Known(out)
        }
    }
}

fn local_propagate(module: &mut Module, func: OpId) -> AnalysisResult<()> {
    let Some(region) = module.op(func)?.region else { return Ok(()) };
    let region_snapshot = module.region(region)?.clone();
    recompute_cfg(module, &region_snapshot)?;
    compute_dominators(module, &region_snapshot)?;
    let order = dom_tree_preorder(module, &region_snapshot);

    for block in order {
        let ops = module.block(block)?.ops.clone();
        for op_id in ops {
            let op = module.op(op_id)?;
            match op.opcode {
                Opcode::Alloca => {
                    module.op_mut(op_id)?.attrs.set(Attr::Alias(AliasSet::single_base(op_id, 0)));
                }
                Opcode::GetGlobal => {
                    let name = op.attr(AttrKind::Name).and_then(Attr::as_name).map(str::to_owned);
                    if let Some(name) = name {
                        if let Some(global) = module.globals().into_iter().find(|&g| module.function_name(g).as_deref() == Some(name.as_str())) {
                            module.op_mut(op_id)?.attrs.set(Attr::Alias(AliasSet::single_base(global, 0)));
                        } else {
                            module.op_mut(op_id)?.attrs.set(Attr::Alias(AliasSet::Unknown));
                        }
                    } else {
                        module.op_mut(op_id)?.attrs.set(Attr::Alias(AliasSet::Unknown));
                    }
                }
                Opcode::AddL => {
                    let operands = op.operands.clone();
                    let computed = if operands.len() == 2 {
                        let (l, r) = (operands[0], operands[1]);
                        if let Some(k) = const_int_value(module, r) {
                            shift(&operand_alias(module, l), k as i64)
                        } else if let Some(k) = const_int_value(module, l) {
                            shift(&operand_alias(module, r), k as i64)
                        } else {
                            merge_to_wildcard(&operand_alias(module, l), &operand_alias(module, r))
                        }
                    } else {
                        AliasSet::Unknown
                    };
                    module.op_mut(op_id)?.attrs.set(Attr::Alias(computed));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Interprocedural fixpoint: every `Call`'s actual argument alias sets are
/// unioned onto the callee's corresponding `GetArg` ops. Iterates until no
/// `GetArg` alias set changes.
fn interprocedural_fixpoint(module: &mut Module, graph: &CallGraph) -> AnalysisResult<()> {
    let mut changed = true;
    let mut guard = 0;
    while changed && guard < 64 {
        changed = false;
        guard += 1;
        for func in module.functions() {
            for &caller in graph.callers_of(func) {
                let calls = module.find_all(|op| op == Opcode::Call)?;
                for call in calls {
                    if crate::callgraph::call_target(module, call) != Some(func) {
                        continue;
                    }
                    if !call_site_in(module, call, caller)? {
                        continue;
                    }
                    let actuals = module.op(call)?.operands.clone();
                    let get_args = ordered_get_args(module, func)?;
                    for (i, &arg_op) in get_args.iter().enumerate() {
                        let Some(&actual) = actuals.get(i) else { continue };
                        let incoming = operand_alias(module, actual);
                        let existing = operand_alias(module, arg_op);
                        let joined = union(&existing, &incoming);
                        if joined != existing {
                            module.op_mut(arg_op)?.attrs.set(Attr::Alias(joined));
                            changed = true;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn call_site_in(module: &Module, call: OpId, func: OpId) -> AnalysisResult<bool> {
    let Some(region) = module.op(func)?.region else { return Ok(false) };
    let mut stack = vec![region];
    while let Some(r) = stack.pop() {
        for &block in &module.region(r)?.blocks {
            if module.block(block)?.ops.contains(&call) {
                return Ok(true);
            }
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
    Ok(false)
}

fn ordered_get_args(module: &Module, func: OpId) -> AnalysisResult<Vec<OpId>> {
    let Some(region) = module.op(func)?.region else { return Ok(Vec::new()) };
    let entry = module.region(region)?.entry();
    let Some(entry) = entry else { return Ok(Vec::new()) };
    Ok(module
        .block(entry)?
        .ops
        .iter()
        .copied()
        .filter(|&o| module.op(o).map(|op| op.opcode == Opcode::GetArg).unwrap_or(false))
        .collect())
}

/// Run Alias analysis over the whole module: local dominator-tree
/// propagation per function, then the interprocedural fixpoint.
pub fn compute_alias(module: &mut Module, graph: &CallGraph) -> AnalysisResult<()> {
    for func in module.functions() {
        local_propagate(module, func)?;
    }
    interprocedural_fixpoint(module, graph)?;
    Ok(())
}

fn concrete_pairs(set: &AliasSet) -> Option<HashSet<(OpId, i64)>> {
    match set {
        AliasSet::Unknown => None,
        AliasSet::Known(map) => {
            let mut out = HashSet::new();
            for (&base, offsets) in map {
                for &o in offsets {
                    if o == AliasSet::UNKNOWN_OFFSET {
                        return None;
                    }
                    out.insert((base, o));
                }
            }
            Some(out)
        }
    }
}

pub fn must_alias(module: &Module, a: OpId, b: OpId) -> bool {
    let (Some(pa), Some(pb)) = (concrete_pairs(&operand_alias(module, a)), concrete_pairs(&operand_alias(module, b))) else {
        return false;
    };
    pa.len() == 1 && pa == pb
}

pub fn never_alias(module: &Module, a: OpId, b: OpId) -> bool {
    let (Some(pa), Some(pb)) = (concrete_pairs(&operand_alias(module, a)), concrete_pairs(&operand_alias(module, b))) else {
        return false;
    };
    pa.is_disjoint(&pb)
}

pub fn may_alias(module: &Module, a: OpId, b: OpId) -> bool {
    !never_alias(module, a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callgraph::compute_call_graph;
    use midopt_ir::{Builder, ValueType};

    fn simple_function(m: &mut Module, name: &str) -> (OpId, midopt_ir::RegionId, midopt_ir::BlockId) {
        let f = m.alloc_op(Opcode::Function, ValueType::Void);
        m.op_mut(f).unwrap().attrs.set(Attr::Name(name.to_string()));
        let region = m.alloc_region();
        m.op_mut(f).unwrap().region = Some(region);
        let top = m.top_block;
        m.block_mut(top).unwrap().append(f);
        m.op_mut(f).unwrap().parent = Some(top);
        let entry = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(entry);
        (f, region, entry)
    }

    #[test]
    fn two_distinct_allocas_never_alias() {
        let mut m = Module::new();
        let (_, _, entry) = simple_function(&mut m, "f");
        let mut b = Builder::at_block_end(&mut m, entry);
        let a1 = b.create(Opcode::Alloca, ValueType::I64, [], [Attr::Size(4)]).unwrap();
        let a2 = b.create(Opcode::Alloca, ValueType::I64, [], [Attr::Size(4)]).unwrap();
        b.ret(None).unwrap();
        let graph = compute_call_graph(&mut m).unwrap();
        compute_alias(&mut m, &graph).unwrap();
        assert!(never_alias(&m, a1, a2));
        assert!(must_alias(&m, a1, a1));
    }

    #[test]
    fn addl_with_constant_offset_shifts_and_stays_distinguishable() {
        let mut m = Module::new();
        let (_, _, entry) = simple_function(&mut m, "f");
        let mut b = Builder::at_block_end(&mut m, entry);
        let a1 = b.create(Opcode::Alloca, ValueType::I64, [], [Attr::Size(16)]).unwrap();
        let four = b.const_int(4).unwrap();
        let p1 = b.create(Opcode::AddL, ValueType::I64, [a1, four], []).unwrap();
        b.ret(None).unwrap();
        let graph = compute_call_graph(&mut m).unwrap();
        compute_alias(&mut m, &graph).unwrap();
        assert!(must_alias(&m, a1, a1));
        assert!(never_alias(&m, a1, p1));
    }

    #[test]
    fn addl_of_two_values_merges_to_wildcard() {
        let mut m = Module::new();
        let (_, _, entry) = simple_function(&mut m, "f");
        let mut b = Builder::at_block_end(&mut m, entry);
        let a1 = b.create(Opcode::Alloca, ValueType::I64, [], [Attr::Size(16)]).unwrap();
        let idx = b.create(Opcode::GetArg, ValueType::I64, [], []).unwrap();
        let p = b.create(Opcode::AddL, ValueType::I64, [a1, idx], []).unwrap();
        b.ret(None).unwrap();
        let graph = compute_call_graph(&mut m).unwrap();
        compute_alias(&mut m, &graph).unwrap();
        assert!(may_alias(&m, a1, p));
        assert!(!must_alias(&m, a1, p));
    }
}
