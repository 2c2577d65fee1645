//! `Mem2Reg`: promotes stack-only scalar `Alloca`s to SSA values via the
//! classical iterated-dominance-frontier Phi placement + dominator-tree
//! renaming algorithm (Cytron, Ferrante, Rosen, Wegman & Zadeck).
//!
//! Only meaningful post-`Flatten`: Phi placement is driven by the real CFG's
//! dominance structure, which a structured `If`/`While`/`For` region doesn't
//! have (it has no merge points at all -- that's what `Flatten` introduces).
//! An alloca is eligible when every one of its uses is a `Load` of it or a
//! `Store` into it; anything else (its address taken by a `Call`, stored
//! itself, used as a `Store`'s *value* operand, or an array -- arrays keep
//! their per-element structure and are handled by `HoistConstArray`
//! instead) disqualifies it.

use std::collections::{HashMap, HashSet};

use midopt_ir::{compute_dominators, dom_tree_children, recompute_cfg, AttrKind, Builder, BlockId, Module, OpId, Opcode, Region, RegionId, ValueType};

use crate::error::PassResult;
use crate::pass::Pass;

pub struct Mem2Reg;

impl Pass for Mem2Reg {
    fn name(&self) -> &'static str {
        "Mem2Reg"
    }

    fn marks_mem2reg(&self) -> bool {
        true
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        for func in module.functions() {
            let Some(region) = module.op(func)?.region else { continue };
            if module.region(region)?.blocks.is_empty() {
                continue;
            }
            let region_snapshot = module.region(region)?.clone();
            recompute_cfg(module, &region_snapshot)?;
            compute_dominators(module, &region_snapshot)?;
            if promote_function(module, region)? {
                changed = true;
            }
        }
        Ok(changed)
    }
}

fn promotable_allocas(module: &Module, region: RegionId) -> PassResult<Vec<OpId>> {
    let mut out = Vec::new();
    for &block in &module.region(region)?.blocks {
        for &op_id in &module.block(block)?.ops {
            let op = module.op(op_id)?;
            if op.opcode == Opcode::Alloca && !op.attrs.contains(AttrKind::Dimension) && is_promotable(module, op_id)? {
                out.push(op_id);
            }
        }
    }
    Ok(out)
}

fn is_promotable(module: &Module, alloca: OpId) -> PassResult<bool> {
    for &user in &module.op(alloca)?.uses {
        let u = module.op(user)?;
        match u.opcode {
            Opcode::Load if u.operands.first() == Some(&alloca) => {}
            Opcode::Store if u.operands.get(1) == Some(&alloca) => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

fn infer_value_type(module: &Module, alloca: OpId) -> PassResult<ValueType> {
    for &user in &module.op(alloca)?.uses {
        let u = module.op(user)?;
        if u.opcode == Opcode::Load {
            return Ok(u.result_type);
        }
    }
    for &user in &module.op(alloca)?.uses {
        let u = module.op(user)?;
        if u.opcode == Opcode::Store {
            if let Some(&value) = u.operands.first() {
                return Ok(module.op(value)?.result_type);
            }
        }
    }
    Ok(ValueType::I32)
}

/// Standard dominance-frontier construction: for each predecessor edge
/// `p -> b`, walk `p`'s idom chain up to (not including) `idom(b)`, adding
/// `b` to the frontier of every block visited.
fn dominance_frontier(module: &Module, region: &Region) -> HashMap<BlockId, HashSet<BlockId>> {
    let mut df: HashMap<BlockId, HashSet<BlockId>> = HashMap::new();
    for &b in &region.blocks {
        let preds = module.block(b).map(|bb| bb.preds.clone()).unwrap_or_default();
        if preds.len() < 2 {
            continue;
        }
        let idom_b = module.block(b).ok().and_then(|bb| bb.idom);
        for p in preds {
            let mut runner = p;
            loop {
                if Some(runner) == idom_b {
                    break;
                }
                df.entry(runner).or_default().insert(b);
                match module.block(runner).ok().and_then(|bb| bb.idom) {
                    Some(next) if next != runner => runner = next,
                    _ => break,
                }
            }
        }
    }
    df
}

fn iterated_df(def_blocks: &HashSet<BlockId>, df: &HashMap<BlockId, HashSet<BlockId>>) -> HashSet<BlockId> {
    let mut result = HashSet::new();
    let mut worklist: Vec<BlockId> = def_blocks.iter().copied().collect();
    while let Some(b) = worklist.pop() {
        if let Some(frontier) = df.get(&b) {
            for &f in frontier {
                if result.insert(f) {
                    worklist.push(f);
                }
            }
        }
    }
    result
}

fn promote_function(module: &mut Module, region: RegionId) -> PassResult<bool> {
    let allocas = promotable_allocas(module, region)?;
    if allocas.is_empty() {
        return Ok(false);
    }
    let region_snapshot = module.region(region)?.clone();
    let df = dominance_frontier(module, &region_snapshot);
    let children = dom_tree_children(module, &region_snapshot);

    let allocas_set: HashSet<OpId> = allocas.iter().copied().collect();
    let mut value_type_of: HashMap<OpId, ValueType> = HashMap::new();
    let mut phi_for: HashMap<(BlockId, OpId), OpId> = HashMap::new();

    for &alloca in &allocas {
        let vt = infer_value_type(module, alloca)?;
        value_type_of.insert(alloca, vt);

        let def_blocks: HashSet<BlockId> = module
            .op(alloca)?
            .uses
            .iter()
            .filter_map(|&user| {
                let u = module.op(user).ok()?;
                (u.opcode == Opcode::Store && u.operands.get(1) == Some(&alloca)).then(|| u.parent).flatten()
            })
            .collect();

        for block in iterated_df(&def_blocks, &df) {
            if module.block(block)?.preds.is_empty() {
                continue;
            }
            let phi = module.alloc_op(Opcode::Phi, vt);
            module.op_mut(phi)?.parent = Some(block);
            module.block_mut(block)?.insert_at(0, phi);
            phi_for.insert((block, alloca), phi);
        }
    }

    let mut stacks: HashMap<OpId, Vec<OpId>> = HashMap::new();
    let mut undef: HashMap<OpId, OpId> = HashMap::new();
    let entry = module.region(region)?.entry().expect("non-empty region has an entry block");
    rename_block(module, entry, &children, &allocas_set, &phi_for, &mut stacks, &mut undef, &value_type_of)?;

    for &alloca in &allocas {
        if module.op(alloca)?.uses.is_empty() {
            module.erase_op(alloca)?;
        }
    }
    Ok(true)
}

fn current_value(module: &mut Module, alloca: OpId, stacks: &HashMap<OpId, Vec<OpId>>, undef: &mut HashMap<OpId, OpId>, value_type_of: &HashMap<OpId, ValueType>) -> PassResult<OpId> {
    if let Some(&v) = stacks.get(&alloca).and_then(|s| s.last()) {
        return Ok(v);
    }
    if let Some(&u) = undef.get(&alloca) {
        return Ok(u);
    }
    // No reaching store on this path: every predecessor-free read of a
    // promotable alloca is an uninitialized read, which this IR treats as
    // zero (the interpreter's `Memory` zero-initializes on alloc too).
    let entry = module.op(alloca)?.parent.ok_or(midopt_ir::IrError::UnknownOp(alloca))?;
    let vt = value_type_of.get(&alloca).copied().unwrap_or(ValueType::I32);
    let mut b = Builder::at_block_start(module, entry);
    let value = match vt {
        ValueType::F32 => b.const_float(0.0)?,
        _ => b.const_int(0)?,
    };
    undef.insert(alloca, value);
    Ok(value)
}

#[allow(clippy::too_many_arguments)]
fn rename_block(
    module: &mut Module,
    block: BlockId,
    children: &HashMap<BlockId, Vec<BlockId>>,
    allocas: &HashSet<OpId>,
    phi_for: &HashMap<(BlockId, OpId), OpId>,
    stacks: &mut HashMap<OpId, Vec<OpId>>,
    undef: &mut HashMap<OpId, OpId>,
    value_type_of: &HashMap<OpId, ValueType>,
) -> PassResult<()> {
    let mut pushed: Vec<OpId> = Vec::new();

    for (&(b, alloca), &phi) in phi_for {
        if b == block {
            stacks.entry(alloca).or_default().push(phi);
            pushed.push(alloca);
        }
    }

    let ops = module.block(block)?.ops.clone();
    for op_id in ops {
        if module.op(op_id).is_err() {
            continue;
        }
        let op = module.op(op_id)?.clone();
        match op.opcode {
            Opcode::Load if op.operands.first().map(|p| allocas.contains(p)).unwrap_or(false) => {
                let alloca = op.operands[0];
                let current = current_value(module, alloca, stacks, undef, value_type_of)?;
                module.replace_all_uses_with(op_id, current)?;
                module.erase_op(op_id)?;
            }
            Opcode::Store if op.operands.get(1).map(|p| allocas.contains(p)).unwrap_or(false) => {
                let alloca = op.operands[1];
                let value = op.operands[0];
                stacks.entry(alloca).or_default().push(value);
                pushed.push(alloca);
                module.erase_op(op_id)?;
            }
            _ => {}
        }
    }

    let succs = module.block(block)?.succs.clone();
    for s in succs {
        for (&(b, alloca), &phi) in phi_for {
            if b == s {
                let current = current_value(module, alloca, stacks, undef, value_type_of)?;
                module.push_operand(phi, current)?;
                module.op_mut(phi)?.phi_incoming.push(block);
            }
        }
    }

    if let Some(kids) = children.get(&block) {
        let mut kids = kids.clone();
        kids.sort_by_key(|k| k.0);
        for kid in kids {
            rename_block(module, kid, children, allocas, phi_for, stacks, undef, value_type_of)?;
        }
    }

    for alloca in pushed {
        stacks.get_mut(&alloca).unwrap().pop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Attr, Builder as B, Opcode as Op, ValueType as VT};
    use midopt_interp::run;

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
    fn straight_line_alloca_is_fully_promoted() {
        let mut m = Module::new();
        let (_f, entry) = new_function(&mut m, "main");
        let mut b = B::at_block_end(&mut m, entry);
        let slot = b.create(Op::Alloca, VT::I64, [], [Attr::Size(4)]).unwrap();
        let c5 = b.const_int(5).unwrap();
        b.create(Op::Store, VT::Void, [c5, slot], []).unwrap();
        let loaded = b.create(Op::Load, VT::I32, [slot], []).unwrap();
        let one = b.const_int(1).unwrap();
        let incremented = b.create(Op::AddI, VT::I32, [loaded, one], []).unwrap();
        b.create(Op::Store, VT::Void, [incremented, slot], []).unwrap();
        let reloaded = b.create(Op::Load, VT::I32, [slot], []).unwrap();
        b.ret(Some(reloaded)).unwrap();

        let mut pass = Mem2Reg;
        let changed = pass.run(&mut m).unwrap();
        assert!(changed);
        assert!(m.op(slot).is_err());
        assert!(m.find_all(|op| op == Op::Load).unwrap().is_empty());
        assert!(m.find_all(|op| op == Op::Store).unwrap().is_empty());

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 6);
    }

    #[test]
    fn diamond_merge_inserts_phi_and_preserves_semantics() {
        let mut m = Module::new();
        let (f, entry) = new_function(&mut m, "main");
        let region = m.op(f).unwrap().region.unwrap();
        let then_b = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(then_b);
        let else_b = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(else_b);
        let merge = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(merge);

        let mut b = B::at_block_end(&mut m, entry);
        let slot = b.create(Op::Alloca, VT::I64, [], [Attr::Size(4)]).unwrap();
        let cond = b.const_int(1).unwrap();
        b.branch(cond, then_b, else_b).unwrap();

        let mut b = B::at_block_end(&mut m, then_b);
        let ten = b.const_int(10).unwrap();
        b.create(Op::Store, VT::Void, [ten, slot], []).unwrap();
        b.goto(merge).unwrap();

        let mut b = B::at_block_end(&mut m, else_b);
        let twenty = b.const_int(20).unwrap();
        b.create(Op::Store, VT::Void, [twenty, slot], []).unwrap();
        b.goto(merge).unwrap();

        let mut b = B::at_block_end(&mut m, merge);
        let loaded = b.create(Op::Load, VT::I32, [slot], []).unwrap();
        b.ret(Some(loaded)).unwrap();

        let mut pass = Mem2Reg;
        pass.run(&mut m).unwrap();
        assert!(m.op(slot).is_err());
        let phis = m.find_all(|op| op == Op::Phi).unwrap();
        assert_eq!(phis.len(), 1);

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 10);
    }
}
