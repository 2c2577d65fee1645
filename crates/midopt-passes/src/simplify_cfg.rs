//! `SimplifyCfg`: merges straight-line chains of blocks (a single-successor
//! block whose successor has no other predecessor) by splicing the
//! successor's ops onto the end of the predecessor and dropping the
//! connecting `Goto`. Also drops blocks with zero predecessors (other than
//! the entry), which `DCE`'s unreachable-block sweep would otherwise have
//! to catch on its own.
//!
//! Commented out in the source pipeline: combining diamond If/else into a
//! single block via `Select`-raising. That's `select.rs`'s job here, kept
//! as a separate pass rather than folded into this one.

use midopt_ir::{recompute_cfg, Module, Opcode};

use crate::error::PassResult;
use crate::pass::Pass;

pub struct SimplifyCfg;

impl Pass for SimplifyCfg {
    fn name(&self) -> &'static str {
        "SimplifyCFG"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        for func in module.functions() {
            let Some(region) = module.op(func)?.region else { continue };
            if module.region(region)?.blocks.is_empty() {
                continue;
            }
            let snapshot = module.region(region)?.clone();
            recompute_cfg(module, &snapshot)?;
            let entry = snapshot.entry();

            loop {
                let snapshot = module.region(region)?.clone();
                recompute_cfg(module, &snapshot)?;
                let mut merged_any = false;
                for &block in &snapshot.blocks {
                    if module.block(block).is_err() {
                        continue;
                    }
                    let succs = module.block(block)?.succs.clone();
                    if succs.len() != 1 {
                        continue;
                    }
                    let succ = succs[0];
                    if succ == block {
                        continue;
                    }
                    if module.block(succ)?.preds.len() != 1 {
                        continue;
                    }
                    if module.block(succ)?.phi_count(|op| module.op(op).map(|o| o.opcode == Opcode::Phi).unwrap_or(false)) > 0 {
                        continue;
                    }
                    merge_blocks(module, block, succ)?;
                    merged_any = true;
                    changed = true;
                    break;
                }
                if !merged_any {
                    break;
                }
            }

            // drop blocks with zero preds other than entry: their ops are
            // already unreachable, but leaving the block around confuses
            // dominator computation for everything else.
            let snapshot = module.region(region)?.clone();
            recompute_cfg(module, &snapshot)?;
            for &block in &snapshot.blocks {
                if Some(block) == entry {
                    continue;
                }
                if module.block(block).map(|b| b.preds.is_empty()).unwrap_or(false) {
                    for &op_id in &module.block(block)?.ops.clone() {
                        module.set_operands(op_id, Default::default())?;
                    }
                    module.force_erase_block(block)?;
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

/// Drop `block`'s terminator `Goto` and append `succ`'s ops in place,
/// retargeting `succ`'s old body to live in `block`, then erase `succ`.
fn merge_blocks(module: &mut Module, block: midopt_ir::BlockId, succ: midopt_ir::BlockId) -> PassResult<()> {
    let goto = module.block(block)?.terminator();
    if let Some(goto) = goto {
        if module.op(goto)?.opcode == Opcode::Goto {
            module.set_operands(goto, Default::default())?;
            module.force_erase_op(goto)?;
        }
    }
    let ops = module.block(succ)?.ops.clone();
    for op_id in ops {
        module.block_mut(succ)?.remove_op(op_id);
        module.block_mut(block)?.append(op_id);
        module.op_mut(op_id)?.parent = Some(block);
    }
    module.force_erase_block(succ)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Builder as B, Opcode as Op, ValueType as VT};
    use midopt_interp::run;

    #[test]
    fn single_pred_chain_collapses() {
        let mut m = Module::new();
        let f = m.alloc_op(Op::Function, VT::I32);
        m.op_mut(f).unwrap().attrs.set(midopt_ir::Attr::Name("main".to_string()));
        let region = m.alloc_region();
        m.op_mut(f).unwrap().region = Some(region);
        let top = m.top_block;
        m.block_mut(top).unwrap().append(f);
        m.op_mut(f).unwrap().parent = Some(top);
        let entry = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(entry);
        let second = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(second);

        let mut b = B::at_block_end(&mut m, entry);
        b.goto(second).unwrap();
        let mut b = B::at_block_end(&mut m, second);
        let c = b.const_int(9).unwrap();
        b.ret(Some(c)).unwrap();

        let mut pass = SimplifyCfg;
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);
        assert!(m.block(second).is_err());

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 9);
    }
}
