//! `--verify`: checks the two dominance-shaped invariants that only hold
//! once a function is in SSA (post-`Mem2Reg`) form.
//!
//! 1. Every non-Phi Op's operand is defined by an Op that dominates it.
//! 2. Every Phi has one operand per predecessor, each tagged with a real
//!    predecessor block.
//!
//! Returns `Err(message)` naming the offending Op on the first violation
//! found, rather than a typed error: the caller (the Pass Manager) wraps it
//! with the guilty pass's name, which is the information that actually
//! matters to whoever reads the diagnostic.

use midopt_ir::{compute_dominators, dominates, recompute_cfg, BlockId, Module, OpId, Opcode, RegionId};

pub fn verify(module: &mut Module) -> Result<(), String> {
    for function in module.functions() {
        let Some(region) = module.op(function).map_err(|e| e.to_string())?.region else {
            continue;
        };
        verify_region(module, region)?;
    }
    Ok(())
}

fn verify_region(module: &mut Module, region_id: RegionId) -> Result<(), String> {
    let region = module.region(region_id).map_err(|e| e.to_string())?.clone();
    recompute_cfg(module, &region).map_err(|e| e.to_string())?;
    compute_dominators(module, &region).map_err(|e| e.to_string())?;

    for &block_id in &region.blocks {
        let block = module.block(block_id).map_err(|e| e.to_string())?.clone();
        for &op_id in &block.ops {
            let op = module.op(op_id).map_err(|e| e.to_string())?.clone();

            if op.opcode == Opcode::Phi {
                if op.operands.len() != block.preds.len() || op.phi_incoming.len() != op.operands.len() {
                    return Err(format!("phi {op_id} has {} operands but block bb{} has {} predecessors", op.operands.len(), block_id.0, block.preds.len()));
                }
                for &from in &op.phi_incoming {
                    if !block.preds.contains(&from) {
                        return Err(format!("phi {op_id} names bb{} as an incoming block, but it is not a predecessor of bb{}", from.0, block_id.0));
                    }
                }
                for (i, &operand) in op.operands.iter().enumerate() {
                    let from = op.phi_incoming[i];
                    operand_reaches_predecessor(module, operand, from, op_id)?;
                }
                continue;
            }

            for &operand in &op.operands {
                let def_block = module.op(operand).map_err(|e| e.to_string())?.parent;
                let Some(def_block) = def_block else {
                    continue;
                };
                if def_block == block_id {
                    let defined_before_use = block.position(operand).zip(block.position(op_id)).map_or(false, |(p, u)| p < u);
                    if !defined_before_use {
                        return Err(format!("op {op_id} uses {operand} which is not defined earlier in the same block bb{}", block_id.0));
                    }
                } else if !dominates(module, def_block, block_id) {
                    return Err(format!("op {op_id} in bb{} uses {operand} defined in bb{}, which does not dominate it", block_id.0, def_block.0));
                }
            }
        }
    }

    // Nested structured regions (If/While/For bodies before flattening) get
    // their own independent dominator tree.
    for &block_id in &region.blocks {
        let block = module.block(block_id).map_err(|e| e.to_string())?.clone();
        for &op_id in &block.ops {
            let op = module.op(op_id).map_err(|e| e.to_string())?.clone();
            if let Some(r) = op.region {
                verify_region(module, r)?;
            }
            if let Some(r) = op.else_region {
                verify_region(module, r)?;
            }
        }
    }
    Ok(())
}

fn operand_reaches_predecessor(module: &Module, operand: OpId, from_block: BlockId, phi: OpId) -> Result<(), String> {
    let def_block = module.op(operand).map_err(|e| e.to_string())?.parent;
    match def_block {
        Some(def_block) if def_block == from_block || dominates(module, def_block, from_block) => Ok(()),
        _ => Err(format!("phi {phi}'s operand {operand} does not dominate its incoming block bb{}", from_block.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Attr, Builder, ValueType};

    fn new_function(m: &mut Module, name: &str) -> (OpId, BlockId) {
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
    fn well_formed_function_verifies() {
        let mut m = Module::new();
        let (_f, entry) = new_function(&mut m, "main");
        let mut b = Builder::at_block_end(&mut m, entry);
        let c1 = b.const_int(1).unwrap();
        let c2 = b.const_int(2).unwrap();
        let add = b.create(Opcode::AddI, ValueType::I32, [c1, c2], []).unwrap();
        b.ret(Some(add)).unwrap();
        assert!(verify(&mut m).is_ok());
    }

    #[test]
    fn use_before_def_in_block_fails() {
        let mut m = Module::new();
        let (_f, entry) = new_function(&mut m, "main");
        let later = m.alloc_op(Opcode::ConstInt, ValueType::I32);
        m.op_mut(later).unwrap().attrs.set(Attr::Int(1));
        m.op_mut(later).unwrap().parent = Some(entry);
        m.block_mut(entry).unwrap().append(later);
        let user = m.alloc_op(Opcode::AddI, ValueType::I32);
        m.push_operand(user, later).unwrap();
        m.push_operand(user, later).unwrap();
        m.op_mut(user).unwrap().parent = Some(entry);
        m.block_mut(entry).unwrap().insert_at(0, user);
        assert!(verify(&mut m).is_err());
    }
}
