//! `CanonicalizeLoop`: gives every natural loop a dedicated preheader (a
//! single predecessor of the header outside the loop body) and, when
//! `lcssa` is requested, a closed-form SSA exit: every value defined inside
//! the loop and used outside gets a single-operand `Phi` in its exit block,
//! and outside uses are rewritten to read that `Phi` instead of the
//! original value directly.

use midopt_ir::{compute_dominators, recompute_cfg, Attr, AttrKind, Builder, Module, OpId, Opcode};

use crate::error::PassResult;
use crate::loops::find_natural_loops;
use crate::pass::Pass;

pub struct CanonicalizeLoop {
    pub lcssa: bool,
}

impl Pass for CanonicalizeLoop {
    fn name(&self) -> &'static str {
        "CanonicalizeLoop"
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
                compute_dominators(module, &snapshot)?;
                let natural_loops = find_natural_loops(module, &snapshot)?;
                let mut progressed = false;
                for lp in &natural_loops {
                    if lp.preheader.is_none() {
                        insert_preheader(module, region, lp.header, &lp.body)?;
                        progressed = true;
                        changed = true;
                        break;
                    }
                }
                if progressed {
                    continue;
                }
                if self.lcssa {
                    for lp in &natural_loops {
                        if insert_lcssa(module, lp)? {
                            changed = true;
                        }
                    }
                }
                break;
            }
        }
        Ok(changed)
    }
}

fn insert_preheader(module: &mut Module, region: midopt_ir::RegionId, header: midopt_ir::BlockId, body: &std::collections::HashSet<midopt_ir::BlockId>) -> PassResult<()> {
    let preheader = module.alloc_block();
    let pos = module.region(region)?.position(header).unwrap_or(module.region(region)?.blocks.len());
    module.region_mut_pub(region)?.blocks.insert(pos, preheader);

    let outside_preds: Vec<_> = module.block(header)?.preds.iter().copied().filter(|p| !body.contains(p)).collect();
    for pred in outside_preds {
        let term = module.block(pred)?.terminator();
        if let Some(term) = term {
            retarget(module, term, header, preheader)?;
        }
    }
    let mut b = Builder::at_block_end(module, preheader);
    b.goto(header)?;
    Ok(())
}

fn retarget(module: &mut Module, term: OpId, from: midopt_ir::BlockId, to: midopt_ir::BlockId) -> PassResult<()> {
    let op = module.op(term)?;
    if op.attr(AttrKind::Target).and_then(Attr::as_target) == Some(from) {
        module.op_mut(term)?.attrs.set(Attr::Target(to));
    }
    if op.attr(AttrKind::Else).and_then(Attr::as_else) == Some(from) {
        module.op_mut(term)?.attrs.set(Attr::Else(to));
    }
    Ok(())
}

fn insert_lcssa(module: &mut Module, lp: &super::NaturalLoop) -> PassResult<bool> {
    let mut changed = false;
    let exits = lp.exit_edges(module);
    let defs: Vec<OpId> = lp.body.iter().flat_map(|&b| module.block(b).map(|bb| bb.ops.clone()).unwrap_or_default()).collect();

    for &def in &defs {
        let Ok(def_op) = module.op(def) else { continue };
        if !def_op.has_result() {
            continue;
        }
        let users: Vec<OpId> = def_op.uses.clone();
        for user in users {
            let Some(user_block) = module.op(user).ok().and_then(|o| o.parent) else { continue };
            if lp.body.contains(&user_block) {
                continue;
            }
            // find the exit block on the path to `user_block`: the unique
            // exit edge's target that dominates it, if any.
            let Some(&(from, exit_block)) = exits.iter().find(|&&(_, e)| e == user_block || midopt_ir::dominates(module, e, user_block)) else { continue };
            if module.block(exit_block)?.preds.len() != 1 {
                continue;
            }
            let mut b = Builder::at_block_start(module, exit_block);
            let phi = b.phi(def_op.result_type, [(def, from)])?;
            let mut to_fix: Vec<OpId> = Vec::new();
            for u in module.op(def)?.uses.clone() {
                if module.op(u).ok().and_then(|o| o.parent).map(|p| !lp.body.contains(&p) && p != exit_block).unwrap_or(false) {
                    to_fix.push(u);
                }
            }
            for u in to_fix {
                replace_operand_occurrences(module, u, def, phi)?;
            }
            changed = true;
        }
    }
    Ok(changed)
}

fn replace_operand_occurrences(module: &mut Module, op_id: OpId, old: OpId, new: OpId) -> PassResult<()> {
    let operands = module.op(op_id)?.operands.clone();
    for (i, &o) in operands.iter().enumerate() {
        if o == old {
            module.replace_operand(op_id, i, new)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Builder as B, Opcode as Op, ValueType as VT};

    #[test]
    fn loop_without_dedicated_preheader_gets_one() {
        let mut m = Module::new();
        let f = m.alloc_op(Op::Function, VT::Void);
        m.op_mut(f).unwrap().attrs.set(Attr::Name("main".to_string()));
        let region = m.alloc_region();
        m.op_mut(f).unwrap().region = Some(region);
        let top = m.top_block;
        m.block_mut(top).unwrap().append(f);
        m.op_mut(f).unwrap().parent = Some(top);

        let entry = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(entry);
        let header = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(header);
        let exit = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(exit);

        let mut b = B::at_block_end(&mut m, entry);
        b.goto(header).unwrap();
        let mut b = B::at_block_end(&mut m, header);
        let cond = b.const_int(0).unwrap();
        b.branch(cond, header, exit).unwrap();
        let mut b = B::at_block_end(&mut m, exit);
        b.ret(None).unwrap();

        let mut pass = CanonicalizeLoop { lcssa: false };
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);
        assert_eq!(m.block(header).unwrap().preds.len(), 2);
    }
}
