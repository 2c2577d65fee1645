//! Classical backward liveness dataflow over operand/use edges, computed
//! per basic block as sets of `Op`s (an Op is "live" at a program point if
//! some later use may still read its result).

use std::collections::BTreeSet;

use crate::error::IrResult;
use crate::id::{BlockId, OpId};
use crate::module::Module;
use crate::opcode::Opcode;
use crate::region::Region;

/// A block's operand references, excluding Phi operands (which are live
/// only along the specific incoming edge, not generally in-block) and
/// self-definitions.
fn block_uses_and_defs(module: &Module, block: BlockId) -> IrResult<(BTreeSet<OpId>, BTreeSet<OpId>)> {
    let mut uses = BTreeSet::new();
    let mut defs = BTreeSet::new();
    for &op_id in &module.block(block)?.ops {
        let op = module.op(op_id)?;
        if op.opcode != Opcode::Phi {
            for &operand in &op.operands {
                if !defs.contains(&operand) {
                    uses.insert(operand);
                }
            }
        }
        if op.has_result() {
            defs.insert(op_id);
        }
    }
    Ok((uses, defs))
}

/// Run liveness to a fixpoint over `region` and store `live_in`/`live_out`
/// on every block. Phi operands count as live-out of the *named
/// predecessor* specifically (not generic live-out), matching the standard
/// SSA liveness treatment.
pub fn compute_liveness(module: &mut Module, region: &Region) -> IrResult<()> {
    let blocks = region.blocks.clone();
    let mut use_def: Vec<(BlockId, BTreeSet<OpId>, BTreeSet<OpId>)> = Vec::new();
    for &b in &blocks {
        let (uses, defs) = block_uses_and_defs(module, b)?;
        use_def.push((b, uses, defs));
    }

    // Phi operand at index i is live-out of preds[i] specifically; fold
    // that into each predecessor's live-out seed before the main fixpoint.
    let mut phi_live_out: Vec<BTreeSet<OpId>> = vec![BTreeSet::new(); blocks.len()];
    let index_of: std::collections::HashMap<BlockId, usize> = blocks.iter().enumerate().map(|(i, &b)| (b, i)).collect();
    for &b in &blocks {
        for &op_id in &module.block(b)?.ops {
            let op = module.op(op_id)?;
            if op.opcode != Opcode::Phi {
                continue;
            }
            for (i, &operand) in op.operands.iter().enumerate() {
                if let Some(&from) = op.phi_incoming.get(i) {
                    if let Some(&idx) = index_of.get(&from) {
                        phi_live_out[idx].insert(operand);
                    }
                }
            }
        }
    }

    let mut live_in: Vec<BTreeSet<OpId>> = vec![BTreeSet::new(); blocks.len()];
    let mut live_out: Vec<BTreeSet<OpId>> = vec![BTreeSet::new(); blocks.len()];
    let mut changed = true;
    while changed {
        changed = false;
        for (i, &b) in blocks.iter().enumerate() {
            let mut out = phi_live_out[i].clone();
            for &s in &module.block(b)?.succs {
                if let Some(&si) = index_of.get(&s) {
                    out.extend(live_in[si].iter().copied());
                }
            }
            let (_, uses, defs) = &use_def[i];
            let mut inn: BTreeSet<OpId> = uses.clone();
            inn.extend(out.iter().filter(|v| !defs.contains(v)).copied());
            if inn != live_in[i] || out != live_out[i] {
                changed = true;
            }
            live_in[i] = inn;
            live_out[i] = out;
        }
    }

    for (i, &b) in blocks.iter().enumerate() {
        module.block_mut(b)?.live_in = std::mem::take(&mut live_in[i]);
        module.block_mut(b)?.live_out = std::mem::take(&mut live_out[i]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::dominators::recompute_cfg;
    use crate::module::Module;

    #[test]
    fn value_dead_across_block_without_use_is_not_live() {
        let mut m = Module::new();
        let region_id = m.alloc_region();
        let b0 = m.alloc_block();
        m.region_mut_pub(region_id).unwrap().append(b0);
        let b1 = m.alloc_block();
        m.region_mut_pub(region_id).unwrap().append(b1);

        let mut b = Builder::at_block_end(&mut m, b0);
        let c1 = b.const_int(1).unwrap();
        let c2 = b.const_int(2).unwrap();
        let _add = b.create(crate::opcode::Opcode::AddI, crate::op::ValueType::I32, [c1, c2], []).unwrap();
        b.goto(b1).unwrap();
        let mut b = Builder::at_block_end(&mut m, b1);
        b.ret(None).unwrap();

        let region = m.region(region_id).unwrap().clone();
        recompute_cfg(&mut m, &region).unwrap();
        compute_liveness(&mut m, &region).unwrap();
        assert!(m.block(b0).unwrap().live_out.is_empty());
        assert!(m.block(b1).unwrap().live_in.is_empty());
    }

    #[test]
    fn value_used_in_successor_is_live_out() {
        let mut m = Module::new();
        let region_id = m.alloc_region();
        let b0 = m.alloc_block();
        m.region_mut_pub(region_id).unwrap().append(b0);
        let b1 = m.alloc_block();
        m.region_mut_pub(region_id).unwrap().append(b1);

        let mut b = Builder::at_block_end(&mut m, b0);
        let c1 = b.const_int(1).unwrap();
        b.goto(b1).unwrap();
        let mut b = Builder::at_block_end(&mut m, b1);
        let c2 = b.const_int(2).unwrap();
        let _add = b.create(crate::opcode::Opcode::AddI, crate::op::ValueType::I32, [c1, c2], []).unwrap();
        b.ret(None).unwrap();

        let region = m.region(region_id).unwrap().clone();
        recompute_cfg(&mut m, &region).unwrap();
        compute_liveness(&mut m, &region).unwrap();
        assert!(m.block(b0).unwrap().live_out.contains(&c1));
        assert!(m.block(b1).unwrap().live_in.contains(&c1));
    }
}
