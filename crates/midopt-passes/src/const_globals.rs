//! `InlineStore` and `HoistConstArray` per §4.12: both fold a sequence of
//! constant-valued, constant-indexed `Store`s into a data initializer
//! instead of leaving them as executable code -- `InlineStore` for an
//! existing `Global`'s prelude writes, `HoistConstArray` for a purely local
//! array that never escapes.
//!
//! Both restrict to the entry block's leading prefix of stores to keep the
//! "what does the array look like before any read" question answerable by
//! inspection rather than a full dataflow pass: a store appearing after a
//! `Load` of the same base, or in any block but the entry, is left alone
//! and the array is not folded at all (conservative, matches the "document
//! your own condition" note in the source).

use std::collections::HashSet;

use midopt_analysis::{compute_alias, compute_call_graph};
use midopt_ir::{AliasSet, Attr, AttrKind, Module, OpId, Opcode};

use crate::error::PassResult;
use crate::pass::Pass;

/// Resolve `addr` to a constant byte offset from `base`, walking through
/// `AddL(ptr, const_offset)` chains. `None` if `addr` isn't `base` itself or
/// a constant-offset derivation of it.
fn resolve_offset(module: &Module, base: OpId, addr: OpId) -> Option<i64> {
    if addr == base {
        return Some(0);
    }
    let op = module.op(addr).ok()?;
    if op.opcode != Opcode::AddL {
        return None;
    }
    let (a, b) = (op.operands[0], op.operands[1]);
    if let Some(off) = resolve_offset(module, base, a) {
        let c = module.op(b).ok()?;
        if c.opcode == Opcode::ConstInt {
            return Some(off + c.attr(AttrKind::Int).and_then(Attr::as_int)? as i64);
        }
    }
    if let Some(off) = resolve_offset(module, base, b) {
        let c = module.op(a).ok()?;
        if c.opcode == Opcode::ConstInt {
            return Some(off + c.attr(AttrKind::Int).and_then(Attr::as_int)? as i64);
        }
    }
    None
}

fn const_value(module: &Module, op_id: OpId) -> Option<i32> {
    let op = module.op(op_id).ok()?;
    match op.opcode {
        Opcode::ConstInt => op.attr(AttrKind::Int).and_then(Attr::as_int),
        Opcode::ConstFloat => op.attr(AttrKind::Float).and_then(Attr::as_float).map(|f| f.to_bits() as i32),
        _ => None,
    }
}

/// Collect every `Store` in `block` that writes `base` at a constant offset
/// with a constant value. Rejects the whole group (returns `None`) if any
/// `Load` of `base` appears before the last such store in source order --
/// that load would observe an intermediate value the folded initializer
/// can no longer represent once the stores are erased. A `Load` appearing
/// after every qualifying store is fine: by the time it executes, the
/// folded initializer already reflects the final image.
fn leading_constant_stores(module: &Module, block: midopt_ir::BlockId, base: OpId) -> Option<Vec<(OpId, i64, i32)>> {
    let mut out = Vec::new();
    let mut first_load_pos = None;
    let ops = &module.block(block).ok()?.ops;
    for (pos, &op_id) in ops.iter().enumerate() {
        let op = module.op(op_id).ok()?;
        match op.opcode {
            Opcode::Store => {
                let addr = op.operands[1];
                if let (Some(offset), Some(value)) = (resolve_offset(module, base, addr), const_value(module, op.operands[0])) {
                    out.push((op_id, offset, value));
                }
            }
            Opcode::Load if resolve_offset(module, base, op.operands[0]).is_some() => {
                first_load_pos.get_or_insert(pos);
            }
            _ => {}
        }
    }
    if out.is_empty() {
        return None;
    }
    if let Some(load_pos) = first_load_pos {
        let last_store_pos = ops.iter().position(|&o| o == out.last().unwrap().0).unwrap();
        if load_pos < last_store_pos {
            return None;
        }
    }
    Some(out)
}

fn pointer_alias(module: &Module, op: OpId) -> AliasSet {
    module.op(op).ok().and_then(|o| o.attr(AttrKind::Alias)).and_then(Attr::as_alias).cloned().unwrap_or(AliasSet::Unknown)
}

/// A pointer's Alias attribute is "fully local to `base`" when it names
/// exactly one base -- `base` itself -- and every offset into it is a
/// tracked constant rather than the `-1` wildcard. A merge with another
/// base, or a dropped-to-wildcard offset, means some other pointer got
/// combined with this one and the escape question can no longer be
/// answered just by walking `base`'s own uses.
fn alias_is_fully_local(set: &AliasSet, base: OpId) -> bool {
    match set {
        AliasSet::Unknown => false,
        AliasSet::Known(map) => map.len() == 1 && map.get(&base).map(|offsets| !offsets.contains(&AliasSet::UNKNOWN_OFFSET)).unwrap_or(false),
    }
}

/// `base` never escapes when every pointer derived from it -- `base`
/// itself and every `AddL` chained off it, transitively -- is used only
/// for `Load`, a `Store` where it is the address operand, or further
/// `AddL` derivation, and Alias confirms each of those pointers never
/// merged with some other base or lost a concrete offset along the way.
/// Requires `compute_alias` to already have run on `module`.
fn never_escapes(module: &Module, base: OpId) -> bool {
    let mut stack = vec![base];
    let mut seen = HashSet::new();
    while let Some(ptr) = stack.pop() {
        if !seen.insert(ptr) {
            continue;
        }
        if !alias_is_fully_local(&pointer_alias(module, ptr), base) {
            return false;
        }
        for &user in &module.op(ptr).map(|op| op.uses.clone()).unwrap_or_default() {
            let Ok(u) = module.op(user) else { continue };
            match u.opcode {
                Opcode::Load => {}
                Opcode::AddL => stack.push(user),
                Opcode::Store if u.operands.get(1) == Some(&ptr) => {}
                _ => return false,
            }
        }
    }
    true
}

pub struct InlineStore;

impl Pass for InlineStore {
    fn name(&self) -> &'static str {
        "InlineStore"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let graph = compute_call_graph(module)?;
        compute_alias(module, &graph)?;

        let mut changed = false;
        for global in module.globals() {
            let Some(name) = module.function_name(global) else { continue };
            let size = match module.op(global)?.attr(AttrKind::Size) {
                Some(Attr::Size(s)) => *s as usize / 4,
                _ => continue,
            };
            if size == 0 {
                continue;
            }
            let uses = module.find_all(|op| op == Opcode::GetGlobal)?.into_iter().filter(|&gg| module.op(gg).map(|o| o.attr(AttrKind::Name).and_then(Attr::as_name) == Some(name.as_str())).unwrap_or(false)).collect::<Vec<_>>();
            if uses.len() != 1 {
                continue;
            }
            let gg = uses[0];
            let Some(block) = module.op(gg)?.parent else { continue };
            if !never_escapes(module, gg) {
                continue;
            }
            let Some(stores) = leading_constant_stores(module, block, gg) else { continue };
            if stores.is_empty() {
                continue;
            }
            let mut image = vec![0i32; size];
            for &(_, offset, value) in &stores {
                let idx = (offset / 4) as usize;
                if idx < size {
                    image[idx] = value;
                }
            }
            module.op_mut(global)?.attrs.set(Attr::IntArray(image));
            for (store, ..) in stores {
                module.set_operands(store, Default::default())?;
                module.force_erase_op(store)?;
            }
            changed = true;
        }
        Ok(changed)
    }
}

pub struct HoistConstArray {
    counter: std::cell::Cell<u32>,
}

impl Default for HoistConstArray {
    fn default() -> Self {
        HoistConstArray { counter: std::cell::Cell::new(0) }
    }
}

impl Pass for HoistConstArray {
    fn name(&self) -> &'static str {
        "HoistConstArray"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let graph = compute_call_graph(module)?;
        compute_alias(module, &graph)?;

        let mut changed = false;
        for func in module.functions() {
            let Some(region) = module.op(func)?.region else { continue };
            let Some(entry) = module.region(region)?.entry() else { continue };
            let allocas: Vec<OpId> = module.find_all(|op| op == Opcode::Alloca)?.into_iter().filter(|&a| module.op(a).map(|o| o.parent == Some(entry)).unwrap_or(false)).collect();
            for alloca in allocas {
                let size = match module.op(alloca)?.attr(AttrKind::Size) {
                    Some(Attr::Size(s)) => *s as usize / 4,
                    _ => continue,
                };
                if size == 0 || !never_escapes(module, alloca) {
                    continue;
                }
                let Some(stores) = leading_constant_stores(module, entry, alloca) else { continue };
                let all_stores_to_array = module.find_all(|op| op == Opcode::Store)?;
                let all_stores_to_array: Vec<OpId> = all_stores_to_array.into_iter().filter(|&s| resolve_offset(module, alloca, module.op(s).unwrap().operands[1]).is_some()).collect();
                if stores.is_empty() || all_stores_to_array.len() != stores.len() {
                    continue;
                }
                let mut image = vec![0i32; size];
                for &(_, offset, value) in &stores {
                    let idx = (offset / 4) as usize;
                    if idx < size {
                        image[idx] = value;
                    }
                }
                let name = format!("__const_array_{}", self.counter.get());
                self.counter.set(self.counter.get() + 1);
                let dims = module.op(alloca)?.attr(AttrKind::Dimension).cloned();
                let global = module.alloc_op(Opcode::Global, midopt_ir::ValueType::Void);
                module.op_mut(global)?.attrs.set(Attr::Name(name.clone()));
                module.op_mut(global)?.attrs.set(Attr::Size((size * 4) as u32));
                module.op_mut(global)?.attrs.set(Attr::IntArray(image));
                if let Some(d) = dims {
                    module.op_mut(global)?.attrs.set(d);
                }
                let top = module.top_block;
                module.block_mut(top)?.append(global);
                module.op_mut(global)?.parent = Some(top);

                let mut b = midopt_ir::Builder::at_block_start(module, entry);
                let gg = b.create(Opcode::GetGlobal, midopt_ir::ValueType::I64, [], [Attr::Name(name)])?;
                module.replace_all_uses_with(alloca, gg)?;
                module.erase_op(alloca)?;
                for (store, ..) in stores {
                    if module.op(store).is_ok() {
                        module.set_operands(store, Default::default())?;
                        module.force_erase_op(store)?;
                    }
                }
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Builder as B, Opcode as Op, ValueType as VT};
    use midopt_interp::run;

    #[test]
    fn fully_constant_local_array_is_hoisted_to_a_global() {
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

        let mut b = B::at_block_end(&mut m, entry);
        let arr = b.create(Op::Alloca, VT::I64, [], [Attr::Size(8)]).unwrap();
        let zero = b.const_int(0).unwrap();
        let offset4 = b.const_int(4).unwrap();
        let addr1 = b.create(Op::AddL, VT::I64, [arr, zero], []).unwrap();
        let v1 = b.const_int(11).unwrap();
        b.create(Op::Store, VT::Void, [v1, addr1], []).unwrap();
        let addr2 = b.create(Op::AddL, VT::I64, [arr, offset4], []).unwrap();
        let v2 = b.const_int(22).unwrap();
        b.create(Op::Store, VT::Void, [v2, addr2], []).unwrap();
        let load = b.create(Op::Load, VT::I32, [addr2], []).unwrap();
        b.ret(Some(load)).unwrap();

        let mut pass = HoistConstArray::default();
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);
        assert!(m.op(arr).is_err());

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 22);
    }
}
