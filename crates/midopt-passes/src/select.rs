//! `Select`: raises the diamond-if-then-else-with-a-single-merging-Phi
//! idiom into a single `Select` op, eliminating the branch entirely when
//! both arms are otherwise side-effect-free and empty.
//!
//! Pattern matched: a block `head` ending in `Branch(cond, then_bb,
//! else_bb)`, where `then_bb` and `else_bb` are each either empty (just a
//! `Goto` to a common `merge`) or contain no ops with side effects, both
//! branching straight to `merge`, and `merge` starts with exactly one
//! `Phi` fed by `then_bb`/`else_bb`. Rewritten to: `head` computes
//! `Select(cond, then_val, else_val)` directly and jumps to `merge`;
//! `then_bb`/`else_bb` are dropped.

use midopt_ir::{recompute_cfg, Attr, AttrKind, BlockId, Builder, Module, OpId, Opcode};

use crate::error::PassResult;
use crate::pass::Pass;

pub struct Select;

impl Pass for Select {
    fn name(&self) -> &'static str {
        "Select"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        for func in module.functions() {
            let Some(region) = module.op(func)?.region else { continue };
            if module.region(region)?.blocks.is_empty() {
                continue;
            }
            loop {
                let snapshot = module.region(region)?.clone();
                recompute_cfg(module, &snapshot)?;
                let mut did_one = false;
                for &head in &snapshot.blocks {
                    if try_raise(module, head)? {
                        did_one = true;
                        changed = true;
                        break;
                    }
                }
                if !did_one {
                    break;
                }
            }
        }
        Ok(changed)
    }
}

/// A branch arm qualifies if it's just a `Goto` straight to `merge`
/// (nothing computed in the arm itself -- the value a `Phi` picks up from
/// that edge must already be defined before the branch).
fn trivial_arm(module: &Module, block: BlockId, merge: BlockId) -> bool {
    let Ok(bb) = module.block(block) else { return false };
    bb.ops.len() == 1 && module.op(bb.ops[0]).map(|op| op.opcode == Opcode::Goto && op.attr(AttrKind::Target).and_then(Attr::as_target) == Some(merge)).unwrap_or(false)
}

fn try_raise(module: &mut Module, head: BlockId) -> PassResult<bool> {
    let Some(term) = module.block(head)?.terminator() else { return Ok(false) };
    let term_op = module.op(term)?.clone();
    if term_op.opcode != Opcode::Branch {
        return Ok(false);
    }
    let cond = term_op.operands[0];
    let Some(then_bb) = term_op.attr(AttrKind::Target).and_then(Attr::as_target) else { return Ok(false) };
    let Some(else_bb) = term_op.attr(AttrKind::Else).and_then(Attr::as_else) else { return Ok(false) };
    if then_bb == else_bb {
        return Ok(false);
    }

    fn goto_target(module: &Module, b: BlockId) -> Option<BlockId> {
        let t = module.block(b).ok()?.terminator()?;
        let op = module.op(t).ok()?;
        (op.opcode == Opcode::Goto).then(|| op.attr(AttrKind::Target).and_then(Attr::as_target)).flatten()
    }
    let (Some(merge_then), Some(merge_else)) = (goto_target(module, then_bb), goto_target(module, else_bb)) else { return Ok(false) };
    if merge_then != merge_else {
        return Ok(false);
    }
    let merge = merge_then;

    if !trivial_arm(module, then_bb, merge) || !trivial_arm(module, else_bb, merge) {
        return Ok(false);
    }
    if module.block(merge)?.preds.len() != 2 {
        return Ok(false);
    }

    let phis: Vec<OpId> = module.block(merge)?.ops.iter().copied().take_while(|&op_id| module.op(op_id).map(|o| o.opcode == Opcode::Phi).unwrap_or(false)).collect();
    if phis.len() != 1 {
        return Ok(false);
    }
    let phi = phis[0];
    let phi_op = module.op(phi)?.clone();
    if phi_op.operands.len() != 2 {
        return Ok(false);
    }
    let mut then_val = None;
    let mut else_val = None;
    for (i, &from) in phi_op.phi_incoming.iter().enumerate() {
        if from == then_bb {
            then_val = Some(phi_op.operands[i]);
        } else if from == else_bb {
            else_val = Some(phi_op.operands[i]);
        }
    }
    let (Some(then_val), Some(else_val)) = (then_val, else_val) else { return Ok(false) };

    let mut b = Builder::before(module, term);
    let select = b.create(Opcode::Select, phi_op.result_type, [cond, then_val, else_val], [])?;
    module.replace_all_uses_with(phi, select)?;
    module.erase_op(phi)?;

    let goto = module.alloc_op(Opcode::Goto, midopt_ir::ValueType::Void);
    module.op_mut(goto)?.attrs.set(Attr::Target(merge));
    module.block_mut(head)?.append(goto);
    module.op_mut(goto)?.parent = Some(head);
    module.set_operands(term, Default::default())?;
    module.force_erase_op(term)?;

    for dead in [then_bb, else_bb] {
        for &op_id in &module.block(dead)?.ops.clone() {
            module.set_operands(op_id, Default::default())?;
        }
        module.force_erase_block(dead)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Builder as B, Opcode as Op, ValueType as VT};
    use midopt_interp::run;

    #[test]
    fn diamond_with_trivial_arms_becomes_select() {
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
        let then_b = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(then_b);
        let else_b = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(else_b);
        let merge = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(merge);

        let mut b = B::at_block_end(&mut m, entry);
        let cond = b.const_int(1).unwrap();
        let then_val = b.const_int(10).unwrap();
        let else_val = b.const_int(20).unwrap();
        b.branch(cond, then_b, else_b).unwrap();
        let mut b = B::at_block_end(&mut m, then_b);
        b.goto(merge).unwrap();
        let mut b = B::at_block_end(&mut m, else_b);
        b.goto(merge).unwrap();
        let mut b = B::at_block_end(&mut m, merge);
        let phi = b.phi(VT::I32, [(then_val, then_b), (else_val, else_b)]).unwrap();
        b.ret(Some(phi)).unwrap();

        let mut pass = Select;
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);
        assert!(m.block(then_b).is_err());

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 10);
    }
}
