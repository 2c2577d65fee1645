//! `Flatten`: lowers structured control flow (`If`/`While`/`For`/`Break`/
//! `Continue`/`Proceed`) into the flat `Goto`/`Branch`/`Return`-terminated
//! multi-block CFG the rest of the pipeline (Mem2Reg onward) expects.
//!
//! Every structured region is, by construction, a single straight-line list
//! of ops physically living in one `BasicBlock`. Flattening an op list
//! therefore never needs to *clone* an op: it only ever needs to *move* an
//! op from the block it currently sits in into whichever real block it
//! belongs in once the surrounding structure is gone, the same trick `TCO`
//! already uses to splice a structured body into a synthetic `While`.
//!
//! The one piece of information threaded through the recursion is "what
//! happens when control falls off the end of this op list": a
//! `continuation` block for an ordinary sequence (what a trailing `Proceed`
//! jumps to) and, inside a loop body, a `(break_target, continue_target)`
//! pair besides.

use midopt_ir::{compute_dominators, recompute_cfg, Builder, BlockId, Module, OpId, Opcode, RegionId, ValueType};

use crate::error::PassResult;
use crate::pass::Pass;

#[derive(Clone, Copy)]
struct LoopCtx {
    break_target: BlockId,
    continue_target: BlockId,
}

pub struct Flatten;

impl Pass for Flatten {
    fn name(&self) -> &'static str {
        "Flatten"
    }

    fn marks_flattened(&self) -> bool {
        true
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        for func in module.functions() {
            let Some(region) = module.op(func)?.region else { continue };
            let Some(entry) = module.region(region)?.entry() else { continue };
            if !region_has_structured_ops(module, region)? {
                continue;
            }
            flatten_seq(module, region, entry, None, None)?;
            let region_snapshot = module.region(region)?.clone();
            recompute_cfg(module, &region_snapshot)?;
            compute_dominators(module, &region_snapshot)?;
            changed = true;
        }
        Ok(changed)
    }
}

fn region_has_structured_ops(module: &Module, region: RegionId) -> PassResult<bool> {
    for &block in &module.region(region)?.blocks {
        for &op in &module.block(block)?.ops {
            if module.op(op)?.opcode.is_structured() {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Move every op in `ops` out of `from` and into `to`, in order, preserving
/// the relative order they already had.
fn move_ops(module: &mut Module, from: BlockId, ops: &[OpId], to: BlockId) -> PassResult<()> {
    for &op in ops {
        module.block_mut(from)?.remove_op(op);
        module.block_mut(to)?.append(op);
        module.op_mut(op)?.parent = Some(to);
    }
    Ok(())
}

/// A block to jump to when control needs somewhere to go but no structured
/// continuation applies: used only for the "fell off the end with no
/// terminator" fallback, which well-formed input never reaches since every
/// structured sequence ends in `Proceed`/`Break`/`Continue`/`Return`.
fn trap_or_return(module: &mut Module, region: RegionId, continuation: Option<BlockId>) -> PassResult<BlockId> {
    if let Some(b) = continuation {
        return Ok(b);
    }
    let trap = module.alloc_block();
    module.region_mut_pub(region)?.append(trap);
    Builder::at_block_end(module, trap).ret(None)?;
    Ok(trap)
}

/// Flatten the op sequence currently living in `block`, appending a real
/// terminator by the time this returns. `continuation` is where a trailing
/// `Proceed` (or falling off the end) should go; `loop_ctx` is set while
/// flattening the body of a `While`/`For`.
fn flatten_seq(module: &mut Module, region: RegionId, block: BlockId, continuation: Option<BlockId>, loop_ctx: Option<LoopCtx>) -> PassResult<()> {
    let ops = module.block(block)?.ops.clone();
    for (i, &op_id) in ops.iter().enumerate() {
        // The op may already have been erased if it was a trailing,
        // now-unreachable op in a list that a sibling call already
        // terminated; nothing left to do.
        if module.op(op_id).is_err() {
            continue;
        }
        let opcode = module.op(op_id)?.opcode;

        match opcode {
            Opcode::Proceed | Opcode::Break | Opcode::Continue => {
                let target = match opcode {
                    Opcode::Proceed => trap_or_return(module, region, continuation)?,
                    Opcode::Break => loop_ctx.map(|c| c.break_target).expect("Break only appears inside a loop body"),
                    Opcode::Continue => loop_ctx.map(|c| c.continue_target).expect("Continue only appears inside a loop body"),
                    _ => unreachable!(),
                };
                Builder::at_block_end(module, block).goto(target)?;
                module.erase_op(op_id)?;
                return Ok(());
            }
            Opcode::Return => {
                // Already a valid terminator. Any ops physically after this
                // one in `ops` are unreachable and left for DCE.
                return Ok(());
            }
            _ if !opcode.is_structured() => continue,
            Opcode::If | Opcode::While | Opcode::For => {
                let remainder: Vec<OpId> = ops[i + 1..].to_vec();
                let tail = if remainder.is_empty() {
                    trap_or_return(module, region, continuation)?
                } else {
                    let t = module.alloc_block();
                    module.region_mut_pub(region)?.append(t);
                    move_ops(module, block, &remainder, t)?;
                    t
                };

                match opcode {
                    Opcode::If => {
                        let op = module.op(op_id)?.clone();
                        let cond = op.operands[0];
                        let then_target = match op.region {
                            Some(r) => {
                                let b = module.region(r)?.entry().expect("If.region always has an entry block");
                                module.region_mut_pub(region)?.append(b);
                                flatten_seq(module, region, b, Some(tail), loop_ctx)?;
                                b
                            }
                            None => tail,
                        };
                        let else_target = match op.else_region {
                            Some(r) => {
                                let b = module.region(r)?.entry().expect("If.else_region always has an entry block");
                                module.region_mut_pub(region)?.append(b);
                                flatten_seq(module, region, b, Some(tail), loop_ctx)?;
                                b
                            }
                            None => tail,
                        };
                        Builder::at_block_end(module, block).branch(cond, then_target, else_target)?;
                        module.erase_op(op_id)?;
                    }
                    Opcode::While => {
                        let op = module.op(op_id)?.clone();
                        let body_region = op.region.expect("While always has a body region");
                        let header = module.region(body_region)?.entry().expect("While.region always has an entry block");
                        module.region_mut_pub(region)?.append(header);
                        Builder::at_block_end(module, block).goto(header)?;
                        let inner_ctx = LoopCtx { break_target: tail, continue_target: header };
                        flatten_seq(module, region, header, Some(header), Some(inner_ctx))?;
                        module.erase_op(op_id)?;
                    }
                    Opcode::For => {
                        let op = module.op(op_id)?.clone();
                        let body_region = op.region.expect("For always has a body region");
                        let body = module.region(body_region)?.entry().expect("For.region always has an entry block");
                        let (init, bound, step, slot) = (op.operands[0], op.operands[1], op.operands[2], op.operands[3]);

                        let guard = module.alloc_block();
                        module.region_mut_pub(region)?.append(guard);
                        let increment = module.alloc_block();
                        module.region_mut_pub(region)?.append(increment);
                        module.region_mut_pub(region)?.append(body);

                        {
                            let mut b = Builder::at_block_end(module, block);
                            b.create(Opcode::Store, ValueType::Void, [init, slot], [])?;
                            b.goto(guard)?;
                        }
                        {
                            let mut b = Builder::at_block_end(module, guard);
                            let cur = b.create(Opcode::Load, ValueType::I32, [slot], [])?;
                            let cond = b.create(Opcode::GeI, ValueType::I32, [cur, bound], [])?;
                            b.branch(cond, tail, body)?;
                        }
                        {
                            let mut b = Builder::at_block_end(module, increment);
                            let cur = b.create(Opcode::Load, ValueType::I32, [slot], [])?;
                            let next = b.create(Opcode::AddI, ValueType::I32, [cur, step], [])?;
                            b.create(Opcode::Store, ValueType::Void, [next, slot], [])?;
                            b.goto(guard)?;
                        }

                        let inner_ctx = LoopCtx { break_target: tail, continue_target: increment };
                        flatten_seq(module, region, body, Some(increment), Some(inner_ctx))?;
                        module.erase_op(op_id)?;
                    }
                    _ => unreachable!("loop guard above only admits If/While/For"),
                }

                return flatten_seq(module, region, tail, continuation, loop_ctx);
            }
            _ => unreachable!("structured opcodes are exactly If/While/For/Break/Continue/Proceed"),
        }
    }
    // Fell off the end of the list with no explicit terminator: malformed
    // input only, since a well-formed structured sequence always ends in
    // Proceed/Break/Continue/Return.
    let target = trap_or_return(module, region, continuation)?;
    if target != block {
        Builder::at_block_end(module, block).goto(target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Attr, BlockId as BId, Builder as B, Opcode as Op, ValueType as VT};
    use midopt_interp::run;

    fn new_function(m: &mut Module, name: &str) -> (OpId, BId) {
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
    fn if_with_both_branches_flattens_to_branch_and_merge() {
        let mut m = Module::new();
        let (_f, entry) = new_function(&mut m, "main");
        let cond = B::at_block_end(&mut m, entry).const_int(1).unwrap();

        let then_region = m.alloc_region();
        let then_block = m.alloc_block();
        m.region_mut_pub(then_region).unwrap().append(then_block);
        {
            let mut tb = B::at_block_end(&mut m, then_block);
            let ten = tb.const_int(10).unwrap();
            tb.create(Op::Return, VT::Void, [ten], []).unwrap();
        }

        let else_region = m.alloc_region();
        let else_block = m.alloc_block();
        m.region_mut_pub(else_region).unwrap().append(else_block);
        {
            let mut eb = B::at_block_end(&mut m, else_block);
            let twenty = eb.const_int(20).unwrap();
            eb.create(Op::Return, VT::Void, [twenty], []).unwrap();
        }

        let if_op = {
            let mut b = B::at_block_end(&mut m, entry);
            b.create(Op::If, VT::Void, [cond], []).unwrap()
        };
        m.op_mut(if_op).unwrap().region = Some(then_region);
        m.op_mut(if_op).unwrap().else_region = Some(else_region);
        B::at_block_end(&mut m, entry).create(Op::Proceed, VT::Void, [], []).unwrap();

        let mut pass = Flatten;
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);
        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 10);
    }

    #[test]
    fn while_loop_with_break_flattens_and_executes() {
        let mut m = Module::new();
        let (_f, entry) = new_function(&mut m, "main");
        let slot = {
            let mut b = B::at_block_end(&mut m, entry);
            b.create(Op::Alloca, VT::I64, [], [Attr::Size(4)]).unwrap()
        };
        {
            let mut b = B::at_block_end(&mut m, entry);
            let zero = b.const_int(0).unwrap();
            b.create(Op::Store, VT::Void, [zero, slot], []).unwrap();
        }

        let body_region = m.alloc_region();
        let body_block = m.alloc_block();
        m.region_mut_pub(body_region).unwrap().append(body_block);
        {
            let mut bb = B::at_block_end(&mut m, body_block);
            let cur = bb.create(Op::Load, VT::I32, [slot], []).unwrap();
            let five = bb.const_int(5).unwrap();
            let ge = bb.create(Op::GeI, VT::I32, [cur, five], []).unwrap();

            let guard_then_region = m.alloc_region();
            let guard_then_block = m.alloc_block();
            m.region_mut_pub(guard_then_region).unwrap().append(guard_then_block);
            B::at_block_end(&mut m, guard_then_block).create(Op::Break, VT::Void, [], []).unwrap();

            let guard_if = {
                let mut bb = B::at_block_end(&mut m, body_block);
                bb.create(Op::If, VT::Void, [ge], []).unwrap()
            };
            m.op_mut(guard_if).unwrap().region = Some(guard_then_region);
            B::at_block_end(&mut m, body_block).create(Op::Proceed, VT::Void, [], []).unwrap();

            let mut bb = B::at_block_end(&mut m, body_block);
            let cur2 = bb.create(Op::Load, VT::I32, [slot], []).unwrap();
            let one = bb.const_int(1).unwrap();
            let next = bb.create(Op::AddI, VT::I32, [cur2, one], []).unwrap();
            bb.create(Op::Store, VT::Void, [next, slot], []).unwrap();
            bb.create(Op::Proceed, VT::Void, [], []).unwrap();
        }

        let while_op = {
            let mut b = B::at_block_end(&mut m, entry);
            b.create(Op::While, VT::Void, [], []).unwrap()
        };
        m.op_mut(while_op).unwrap().region = Some(body_region);
        {
            let mut b = B::at_block_end(&mut m, entry);
            let final_val = b.create(Op::Load, VT::I32, [slot], []).unwrap();
            b.ret(Some(final_val)).unwrap();
        }

        let mut pass = Flatten;
        pass.run(&mut m).unwrap();
        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 5);
    }

    #[test]
    fn for_loop_lowers_guard_and_increment_blocks() {
        let mut m = Module::new();
        let (_f, entry) = new_function(&mut m, "main");
        let slot = {
            let mut b = B::at_block_end(&mut m, entry);
            b.create(Op::Alloca, VT::I64, [], [Attr::Size(4)]).unwrap()
        };
        let sum_slot = {
            let mut b = B::at_block_end(&mut m, entry);
            let z = b.const_int(0).unwrap();
            let s = b.create(Op::Alloca, VT::I64, [], [Attr::Size(4)]).unwrap();
            b.create(Op::Store, VT::Void, [z, s], []).unwrap();
            s
        };

        let body_region = m.alloc_region();
        let body_block = m.alloc_block();
        m.region_mut_pub(body_region).unwrap().append(body_block);
        {
            let mut bb = B::at_block_end(&mut m, body_block);
            let cur_sum = bb.create(Op::Load, VT::I32, [sum_slot], []).unwrap();
            let cur_i = bb.create(Op::Load, VT::I32, [slot], []).unwrap();
            let new_sum = bb.create(Op::AddI, VT::I32, [cur_sum, cur_i], []).unwrap();
            bb.create(Op::Store, VT::Void, [new_sum, sum_slot], []).unwrap();
            bb.create(Op::Proceed, VT::Void, [], []).unwrap();
        }

        let (init, bound, step) = {
            let mut b = B::at_block_end(&mut m, entry);
            (b.const_int(0).unwrap(), b.const_int(5).unwrap(), b.const_int(1).unwrap())
        };
        let for_op = {
            let mut b = B::at_block_end(&mut m, entry);
            b.create(Op::For, VT::Void, [init, bound, step, slot], []).unwrap()
        };
        m.op_mut(for_op).unwrap().region = Some(body_region);
        {
            let mut b = B::at_block_end(&mut m, entry);
            let total = b.create(Op::Load, VT::I32, [sum_slot], []).unwrap();
            b.ret(Some(total)).unwrap();
        }

        let mut pass = Flatten;
        pass.run(&mut m).unwrap();
        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 10); // 0+1+2+3+4
    }
}
