//! `TCO`: turns a self-tail-recursive function into an iterative one while
//! the body is still structured, before `Flatten` ever gets a chance to
//! turn the recursion into an ordinary `Call` the backend would have to
//! emit as a real call.
//!
//! A tail call here is `Call self(args...)` immediately followed by
//! `Return` of that call's result (or a bare `Return` for a void
//! function) in the same block. Since parameters arrive as `GetArg`
//! values rather than mutable slots, rewriting "call with new arguments"
//! into "loop with new arguments" needs somewhere to put the new values:
//! one `Alloca` per parameter, seeded from the real `GetArg` once in a
//! prelude block, with the loop body's own `GetArg` uses switched to
//! `Load`s of that slot and each tail call turned into a `Store` per
//! argument followed by `Continue`.

use midopt_ir::{Attr, AttrKind, Builder, Module, OpId, Opcode, ValueType};

use crate::error::PassResult;
use crate::pass::Pass;

pub struct Tco;

fn is_self_tail_call(module: &Module, ret_op: OpId, func_name: &str) -> PassResult<Option<OpId>> {
    let ret = module.op(ret_op)?;
    if ret.opcode != Opcode::Return {
        return Ok(None);
    }
    let Some(parent) = ret.parent else { return Ok(None) };
    let ops = &module.block(parent)?.ops;
    let Some(pos) = ops.iter().position(|&o| o == ret_op) else { return Ok(None) };
    if pos == 0 {
        return Ok(None);
    }
    let call_id = ops[pos - 1];
    let call = module.op(call_id)?;
    if call.opcode != Opcode::Call || call.attr(AttrKind::Name).and_then(Attr::as_name) != Some(func_name) {
        return Ok(None);
    }
    let matches_void = ret.operands.is_empty() && call.uses.is_empty();
    let matches_value = ret.operands.as_slice() == [call_id] && call.uses == [ret_op];
    if matches_void || matches_value {
        Ok(Some(call_id))
    } else {
        Ok(None)
    }
}

impl Pass for Tco {
    fn name(&self) -> &'static str {
        "TCO"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        for func in module.functions() {
            let Some(name) = module.function_name(func) else { continue };
            let Some(region) = module.op(func)?.region else { continue };
            let Some(body_block) = module.region(region)?.entry() else { continue };

            let returns = module.find_all(|op| op == Opcode::Return)?;
            let tail_calls: Vec<(OpId, OpId)> = returns
                .into_iter()
                .filter_map(|ret| is_self_tail_call(module, ret, &name).ok().flatten().map(|call| (call, ret)))
                .collect();
            if tail_calls.is_empty() {
                continue;
            }

            let arg_count = tail_calls.iter().map(|&(call, _)| module.op(call).map(|c| c.operands.len()).unwrap_or(0)).max().unwrap_or(0);

            // Move the whole original body into a fresh region/block that
            // becomes the While's loop body; `body_block` itself becomes the
            // slot-initializing prelude.
            let loop_region = module.alloc_region();
            let loop_block = module.alloc_block();
            module.region_mut_pub(loop_region)?.append(loop_block);
            let original_ops: Vec<OpId> = module.block(body_block)?.ops.clone();
            for &op_id in &original_ops {
                module.block_mut(body_block)?.remove_op(op_id);
                module.block_mut(loop_block)?.append(op_id);
                module.op_mut(op_id)?.parent = Some(loop_block);
            }

            // Replace each `GetArg(i)` living in the loop body with a `Load`
            // of a fresh per-argument slot.
            let mut slots = Vec::with_capacity(arg_count);
            {
                let mut b = Builder::at_block_start(module, body_block);
                for i in 0..arg_count {
                    let slot = b.create(Opcode::Alloca, ValueType::I64, [], [Attr::Size(4)])?;
                    slots.push(slot);
                }
                for (i, &slot) in slots.iter().enumerate() {
                    let initial = b.create(Opcode::GetArg, ValueType::I32, [], [Attr::Int(i as i32)])?;
                    b.create(Opcode::Store, ValueType::Void, [initial, slot], [])?;
                }
            }
            let get_args_in_loop = module.find_all(|op| op == Opcode::GetArg)?;
            for get_arg in get_args_in_loop {
                if module.op(get_arg)?.parent != Some(loop_block) {
                    continue;
                }
                let index = module.op(get_arg)?.attr(AttrKind::Int).and_then(Attr::as_int).unwrap_or(0) as usize;
                let Some(&slot) = slots.get(index) else { continue };
                let load = {
                    let mut b = Builder::before(module, get_arg);
                    b.create(Opcode::Load, ValueType::I32, [slot], [])?
                };
                module.replace_all_uses_with(get_arg, load)?;
                module.erase_op(get_arg)?;
            }

            // Rewrite every tail call into slot stores + Continue.
            for (call_id, ret_id) in &tail_calls {
                let operands = module.op(*call_id)?.operands.clone();
                {
                    let mut b = Builder::before(module, *call_id);
                    for (i, &arg) in operands.iter().enumerate() {
                        if let Some(&slot) = slots.get(i) {
                            b.create(Opcode::Store, ValueType::Void, [arg, slot], [])?;
                        }
                    }
                    b.create(Opcode::Continue, ValueType::Void, [], [])?;
                }
                module.erase_op(*ret_id)?;
                if module.op(*call_id)?.uses.is_empty() {
                    module.erase_op(*call_id)?;
                }
            }

            // Wrap the loop region in a `While` sitting in the prelude block,
            // with an unreachable-but-required `Proceed` after it (every
            // path out of the loop exits through a real `Return`).
            let while_op = {
                let mut b = Builder::at_block_end(module, body_block);
                let w = b.create(Opcode::While, ValueType::Void, [], [])?;
                b.create(Opcode::Proceed, ValueType::Void, [], [])?;
                w
            };
            module.op_mut(while_op)?.region = Some(loop_region);
            changed = true;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{BlockId, Builder as B, Opcode as Op, ValueType as VT};

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
    fn self_tail_call_becomes_a_loop() {
        let mut m = Module::new();
        let (_f, entry) = new_function(&mut m, "count_down");
        let mut b = B::at_block_end(&mut m, entry);
        let n = b.create(Op::GetArg, VT::I32, [], [Attr::Int(0)]).unwrap();
        let zero = b.const_int(0).unwrap();
        let one = b.const_int(1).unwrap();
        let n_minus_1 = b.create(Op::SubI, VT::I32, [n, one], []).unwrap();
        let call = b.create(Op::Call, VT::I32, [n_minus_1], [Attr::Name("count_down".to_string())]).unwrap();
        b.ret(Some(call)).unwrap();
        let _ = zero;

        let mut pass = Tco;
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);
        let ops = &m.block(entry).unwrap().ops;
        assert!(ops.iter().any(|&o| m.op(o).unwrap().opcode == Op::While));
        assert!(ops.iter().any(|&o| m.op(o).unwrap().opcode == Op::Proceed));
        assert!(m.op(call).is_err());
    }
}
