//! `Localize`/`Globalize`: move globals used by a single function into
//! alloca-style locals, or raise large local arrays of `AtMostOnce`
//! functions into globals. Both directions are conservative: they refuse
//! whenever the base might be shared in a way the simple ownership check
//! below can't rule out.

use std::collections::HashSet;

use midopt_analysis::{compute_at_most_once, compute_call_graph};
use midopt_ir::{Attr, AttrKind, Builder, Cursor, Module, OpId, Opcode, ValueType};

use crate::error::PassResult;
use crate::pass::Pass;

fn functions_using_global(module: &Module, global: OpId) -> PassResult<HashSet<OpId>> {
    let mut out = HashSet::new();
    let name = module.function_name(global);
    let Some(name) = name else { return Ok(out) };
    for func in module.functions() {
        let uses = uses_within(module, func, &name)?;
        if uses {
            out.insert(func);
        }
    }
    Ok(out)
}

fn uses_within(module: &Module, func: OpId, global_name: &str) -> PassResult<bool> {
    let Some(region) = module.op(func)?.region else { return Ok(false) };
    let mut stack = vec![region];
    while let Some(r) = stack.pop() {
        for &block in &module.region(r)?.blocks {
            for &op_id in &module.block(block)?.ops {
                let op = module.op(op_id)?;
                if op.opcode == Opcode::GetGlobal && op.attr(AttrKind::Name).and_then(Attr::as_name) == Some(global_name) {
                    return Ok(true);
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

pub struct Localize;

impl Pass for Localize {
    fn name(&self) -> &'static str {
        "Localize"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        for global in module.globals() {
            let users = functions_using_global(module, global)?;
            if users.len() != 1 {
                continue;
            }
            let func = *users.iter().next().unwrap();
            let Some(region) = module.op(func)?.region else { continue };
            let Some(entry) = module.region(region)?.entry() else { continue };
            let size = match module.op(global)?.attr(AttrKind::Size) {
                Some(Attr::Size(s)) => *s,
                _ => 4,
            };
            let dims = match module.op(global)?.attr(AttrKind::Dimension) {
                Some(Attr::Dimension(d)) => Some(d.clone()),
                _ => None,
            };
            let name = module.function_name(global).unwrap_or_default();
            let mut b = Builder::new(module, Cursor::BlockStart(entry));
            let attrs: Vec<Attr> = std::iter::once(Attr::Size(size)).chain(dims.map(Attr::Dimension)).collect();
            let alloca = b.create(Opcode::Alloca, ValueType::I64, [], attrs)?;

            let get_globals = module.find_all(|op| op == Opcode::GetGlobal)?;
            for gg in get_globals {
                if module.op(gg)?.attr(AttrKind::Name).and_then(Attr::as_name) == Some(name.as_str()) {
                    module.replace_all_uses_with(gg, alloca)?;
                    if module.op(gg)?.uses.is_empty() {
                        module.erase_op(gg)?;
                    }
                }
            }
            if module.op(global)?.uses.is_empty() {
                module.erase_op(global)?;
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// A local alloca is safe to raise to a global when it's only ever an
/// operand to `Load`/`Store`/`AddL` within its own function -- i.e. its
/// address is never passed to a `Call`, stored itself, or returned.
fn alloca_is_contained(module: &Module, alloca: OpId) -> bool {
    module.op(alloca).map(|o| o.uses.clone()).unwrap_or_default().into_iter().all(|user| {
        module
            .op(user)
            .map(|u| matches!(u.opcode, Opcode::Load | Opcode::AddL) || (u.opcode == Opcode::Store && u.operands.get(1) == Some(&alloca)))
            .unwrap_or(false)
    })
}

pub struct Globalize {
    pub min_size: u32,
    counter: std::cell::Cell<u32>,
}

impl Globalize {
    pub fn new() -> Self {
        Globalize { min_size: 64, counter: std::cell::Cell::new(0) }
    }
}

impl Default for Globalize {
    fn default() -> Self {
        Globalize::new()
    }
}

impl Pass for Globalize {
    fn name(&self) -> &'static str {
        "Globalize"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let graph = compute_call_graph(module)?;
        compute_at_most_once(module, &graph)?;

        let mut changed = false;
        for func in module.functions() {
            let at_most_once = matches!(module.op(func)?.attr(AttrKind::AtMostOnce), Some(Attr::AtMostOnce(true)));
            if !at_most_once {
                continue;
            }
            let Some(region) = module.op(func)?.region else { continue };
            let allocas: Vec<OpId> = module.find_all(|op| op == Opcode::Alloca)?.into_iter().filter(|&a| op_in_region(module, a, region).unwrap_or(false)).collect();
            for alloca in allocas {
                let size = match module.op(alloca)?.attr(AttrKind::Size) {
                    Some(Attr::Size(s)) => *s,
                    _ => 0,
                };
                if size < self.min_size || !alloca_is_contained(module, alloca) {
                    continue;
                }
                let name = format!("__globalized_{}", self.counter.get());
                self.counter.set(self.counter.get() + 1);
                let dims = module.op(alloca)?.attr(AttrKind::Dimension).cloned();
                let global = module.alloc_op(Opcode::Global, ValueType::Void);
                module.op_mut(global)?.attrs.set(Attr::Name(name.clone()));
                module.op_mut(global)?.attrs.set(Attr::Size(size));
                if let Some(d) = dims {
                    module.op_mut(global)?.attrs.set(d);
                }
                let top = module.top_block;
                module.block_mut(top)?.append(global);
                module.op_mut(global)?.parent = Some(top);

                let entry = module.region(region)?.entry().unwrap();
                let mut b = Builder::at_block_start(module, entry);
                let gg = b.create(Opcode::GetGlobal, ValueType::I64, [], [Attr::Name(name)])?;
                module.replace_all_uses_with(alloca, gg)?;
                module.erase_op(alloca)?;
                changed = true;
            }
        }
        Ok(changed)
    }
}

fn op_in_region(module: &Module, op: OpId, region: midopt_ir::RegionId) -> PassResult<bool> {
    let mut stack = vec![region];
    while let Some(r) = stack.pop() {
        for &block in &module.region(r)?.blocks {
            if module.block(block)?.ops.contains(&op) {
                return Ok(true);
            }
            for &candidate in &module.block(block)?.ops {
                let c = module.op(candidate)?;
                if let Some(nested) = c.region {
                    stack.push(nested);
                }
                if let Some(nested) = c.else_region {
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
    use midopt_ir::{Builder as B, Opcode as Op, ValueType as VT};

    fn declare_function(m: &mut Module, name: &str) -> (OpId, midopt_ir::BlockId) {
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
    fn global_used_by_single_function_becomes_local_alloca() {
        let mut m = Module::new();
        let g = m.alloc_op(Op::Global, VT::Void);
        m.op_mut(g).unwrap().attrs.set(Attr::Name("g".to_string()));
        m.op_mut(g).unwrap().attrs.set(Attr::Size(4));
        let top = m.top_block;
        m.block_mut(top).unwrap().append(g);
        m.op_mut(g).unwrap().parent = Some(top);

        let (_f, entry) = declare_function(&mut m, "only_user");
        let mut b = B::at_block_end(&mut m, entry);
        b.create(Op::GetGlobal, VT::I64, [], [Attr::Name("g".to_string())]).unwrap();
        b.ret(None).unwrap();

        let mut pass = Localize;
        pass.run(&mut m).unwrap();
        assert!(m.op(g).is_err());
        assert_eq!(m.block(entry).unwrap().ops[0], *m.block(entry).unwrap().ops.first().unwrap());
        assert_eq!(m.op(m.block(entry).unwrap().ops[0]).unwrap().opcode, Op::Alloca);
    }
}
