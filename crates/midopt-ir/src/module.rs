//! [`Module`]: the arena that owns every `Op`, `BasicBlock`, and `Region`.
//!
//! Entities are stored in `Vec<Option<T>>` slots indexed by `id.0 as usize`.
//! A `None` slot is a tombstone left by `force_erase`/`erase_op`: the id
//! stays permanently invalid rather than being recycled, which is what lets
//! every other index into the arena remain stable for the Module's whole
//! lifetime without a generation counter.

use serde::{Deserialize, Serialize};

use crate::attr::{Attr, AttrKind};
use crate::block::BasicBlock;
use crate::error::{IrError, IrResult};
use crate::id::{BlockId, OpId, RegionId};
use crate::op::{Op, OperandList, ValueType};
use crate::opcode::Opcode;
use crate::region::Region;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    ops: Vec<Option<Op>>,
    blocks: Vec<Option<BasicBlock>>,
    regions: Vec<Option<Region>>,
    /// The single region owned directly by the Module; its one block's op
    /// list holds `Global` and `Function` ops in declaration order.
    pub top_region: RegionId,
    pub top_block: BlockId,
}

impl Module {
    pub fn new() -> Self {
        let mut m = Module {
            ops: Vec::new(),
            blocks: Vec::new(),
            regions: Vec::new(),
            top_region: RegionId(0),
            top_block: BlockId(0),
        };
        let top_block = m.alloc_block();
        let top_region = m.alloc_region();
        m.region_mut(top_region).unwrap().append(top_block);
        m.top_region = top_region;
        m.top_block = top_block;
        m
    }

    // -- Allocation --------------------------------------------------------

    pub fn alloc_op(&mut self, opcode: Opcode, result_type: ValueType) -> OpId {
        let id = OpId(self.ops.len() as u32);
        self.ops.push(Some(Op::new(id, opcode, result_type)));
        id
    }

    pub fn alloc_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Some(BasicBlock::new(id)));
        id
    }

    pub fn alloc_region(&mut self) -> RegionId {
        let id = RegionId(self.regions.len() as u32);
        self.regions.push(Some(Region::new(id)));
        id
    }

    // -- Accessors -----------------------------------------------------------

    pub fn op(&self, id: OpId) -> IrResult<&Op> {
        self.ops.get(id.0 as usize).and_then(Option::as_ref).ok_or(IrError::UnknownOp(id))
    }

    pub fn op_mut(&mut self, id: OpId) -> IrResult<&mut Op> {
        self.ops.get_mut(id.0 as usize).and_then(Option::as_mut).ok_or(IrError::UnknownOp(id))
    }

    pub fn block(&self, id: BlockId) -> IrResult<&BasicBlock> {
        self.blocks.get(id.0 as usize).and_then(Option::as_ref).ok_or(IrError::UnknownBlock(id))
    }

    pub fn block_mut(&mut self, id: BlockId) -> IrResult<&mut BasicBlock> {
        self.blocks.get_mut(id.0 as usize).and_then(Option::as_mut).ok_or(IrError::UnknownBlock(id))
    }

    pub fn region(&self, id: RegionId) -> IrResult<&Region> {
        self.regions.get(id.0 as usize).and_then(Option::as_ref).ok_or(IrError::UnknownRegion(id))
    }

    fn region_mut(&mut self, id: RegionId) -> IrResult<&mut Region> {
        self.regions.get_mut(id.0 as usize).and_then(Option::as_mut).ok_or(IrError::UnknownRegion(id))
    }

    pub fn region_mut_pub(&mut self, id: RegionId) -> IrResult<&mut Region> {
        self.region_mut(id)
    }

    /// All live op ids, in arena order (not execution order).
    pub fn all_op_ids(&self) -> impl Iterator<Item = OpId> + '_ {
        self.ops.iter().enumerate().filter_map(|(i, o)| o.as_ref().map(|_| OpId(i as u32)))
    }

    pub fn all_block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().enumerate().filter_map(|(i, b)| b.as_ref().map(|_| BlockId(i as u32)))
    }

    pub fn all_region_ids(&self) -> impl Iterator<Item = RegionId> + '_ {
        self.regions.iter().enumerate().filter_map(|(i, r)| r.as_ref().map(|_| RegionId(i as u32)))
    }

    /// Depth-first search over every region nested transitively under
    /// `top_region`, yielding every op whose opcode matches `pred`. Mirrors
    /// the `findAll<Kind>()` query from the Builder contract.
    pub fn find_all(&self, pred: impl Fn(Opcode) -> bool) -> IrResult<Vec<OpId>> {
        let mut out = Vec::new();
        self.find_all_in_region(self.top_region, &pred, &mut out)?;
        Ok(out)
    }

    fn find_all_in_region(&self, region: RegionId, pred: &impl Fn(Opcode) -> bool, out: &mut Vec<OpId>) -> IrResult<()> {
        for &block_id in &self.region(region)?.blocks {
            let block = self.block(block_id)?;
            for &op_id in &block.ops {
                let op = self.op(op_id)?;
                if pred(op.opcode) {
                    out.push(op_id);
                }
                if let Some(r) = op.region {
                    self.find_all_in_region(r, pred, out)?;
                }
                if let Some(r) = op.else_region {
                    self.find_all_in_region(r, pred, out)?;
                }
            }
        }
        Ok(())
    }

    /// The `Op` (if any) whose nested region directly contains `block`.
    pub fn get_parent_op(&self, block: BlockId) -> Option<OpId> {
        self.all_op_ids().find(|&id| {
            let op = self.op(id).expect("id came from all_op_ids");
            op.region.map_or(false, |r| self.region(r).map_or(false, |r| r.blocks.contains(&block)))
                || op.else_region.map_or(false, |r| self.region(r).map_or(false, |r| r.blocks.contains(&block)))
        })
    }

    /// The op immediately following `op` in its parent block, if any.
    pub fn next_op(&self, op: OpId) -> IrResult<Option<OpId>> {
        let parent = self.op(op)?.parent.ok_or(IrError::UnknownOp(op))?;
        let block = self.block(parent)?;
        let idx = block.position(op).ok_or(IrError::UnknownOp(op))?;
        Ok(block.ops.get(idx + 1).copied())
    }

    // -- Operand / use linkage ----------------------------------------------

    /// Append `operand` to `op`'s operand list and record the reverse edge.
    pub fn push_operand(&mut self, op: OpId, operand: OpId) -> IrResult<()> {
        self.op_mut(op)?.operands.push(operand);
        self.op_mut(operand)?.uses.push(op);
        Ok(())
    }

    pub fn set_operands(&mut self, op: OpId, operands: OperandList) -> IrResult<()> {
        let old = self.op(op)?.operands.clone();
        for o in old {
            self.remove_use(o, op);
        }
        for &o in &operands {
            self.op_mut(o)?.uses.push(op);
        }
        self.op_mut(op)?.operands = operands;
        Ok(())
    }

    pub fn replace_operand(&mut self, op: OpId, index: usize, new_operand: OpId) -> IrResult<()> {
        let old = self.op(op)?.operands.get(index).copied().ok_or(IrError::OperandArity {
            op,
            expected: index + 1,
            got: self.op(op)?.operands.len(),
        })?;
        self.remove_use(old, op);
        self.op_mut(op)?.operands[index] = new_operand;
        self.op_mut(new_operand)?.uses.push(op);
        Ok(())
    }

    fn remove_use(&mut self, producer: OpId, user: OpId) {
        if let Ok(p) = self.op_mut(producer) {
            if let Some(pos) = p.uses.iter().position(|&u| u == user) {
                p.uses.remove(pos);
            }
        }
    }

    /// Rewire every use of `old` to point at `new`, leaving `old` with zero
    /// uses (ready to erase). Does not touch `old`'s own operand list.
    pub fn replace_all_uses_with(&mut self, old: OpId, new: OpId) -> IrResult<()> {
        let users = self.op(old)?.uses.clone();
        for user in users {
            if user == new {
                continue;
            }
            let operand_positions: Vec<usize> = self
                .op(user)?
                .operands
                .iter()
                .enumerate()
                .filter(|(_, &o)| o == old)
                .map(|(i, _)| i)
                .collect();
            for idx in operand_positions {
                self.op_mut(user)?.operands[idx] = new;
            }
            // also rewire From/Target/Else back-references to ops, in case
            // the replaced value is itself targeted there (not applicable
            // for OpId attrs today, kept for forward compatibility).
            self.op_mut(new)?.uses.push(user);
        }
        self.op_mut(old)?.uses.clear();
        Ok(())
    }

    /// Erase `op`: requires zero remaining uses. Drops it from its parent
    /// block's op list, clears its forward operand edges, and tombstones the
    /// arena slot.
    pub fn erase_op(&mut self, op: OpId) -> IrResult<()> {
        let uses_len = self.op(op)?.uses.len();
        if uses_len != 0 {
            return Err(IrError::EraseWithUses(op, uses_len));
        }
        let operands = self.op(op)?.operands.clone();
        for operand in operands {
            self.remove_use(operand, op);
        }
        if let Some(parent) = self.op(op)?.parent {
            if let Ok(block) = self.block_mut(parent) {
                block.remove_op(op);
            }
        }
        self.ops[op.0 as usize] = None;
        Ok(())
    }

    /// Erase `op` unconditionally, ignoring its `uses` list. For throwing
    /// away an entire dead subtree at once (an uncalled `Function`, a dead
    /// `Phi` cycle) where every remaining use only points at another op in
    /// the same subtree and is about to be discarded too, so there's no
    /// reason to unwind operand order the way `erase_op`'s zero-uses check
    /// would otherwise demand.
    pub fn force_erase_op(&mut self, op: OpId) -> IrResult<()> {
        let operands = self.op(op)?.operands.clone();
        for operand in operands {
            self.remove_use(operand, op);
        }
        if let Some(parent) = self.op(op)?.parent {
            if let Ok(block) = self.block_mut(parent) {
                block.remove_op(op);
            }
        }
        self.ops[op.0 as usize] = None;
        Ok(())
    }

    /// Erase a block that has already had all its ops erased. Does not check
    /// for dangling predecessor/successor references -- the caller (usually
    /// SimplifyCFG) is responsible for fixing those up first.
    pub fn force_erase_block(&mut self, block: BlockId) -> IrResult<()> {
        let b = self.block(block)?;
        if !b.ops.is_empty() {
            return Err(IrError::UnknownBlock(block));
        }
        if let Some(region) = self.all_region_ids().find(|&r| self.region(r).unwrap().blocks.contains(&block)) {
            self.region_mut(region)?.remove(block);
        }
        self.blocks[block.0 as usize] = None;
        Ok(())
    }

    // -- Convenience queries used widely by passes --------------------------

    pub fn is_function(&self, op: OpId) -> bool {
        self.op(op).map(|o| o.opcode == Opcode::Function).unwrap_or(false)
    }

    pub fn function_name(&self, op: OpId) -> Option<String> {
        self.op(op).ok()?.attr(AttrKind::Name).and_then(Attr::as_name).map(str::to_owned)
    }

    pub fn functions(&self) -> Vec<OpId> {
        self.block(self.top_block)
            .map(|b| b.ops.iter().copied().filter(|&o| self.is_function(o)).collect())
            .unwrap_or_default()
    }

    pub fn globals(&self) -> Vec<OpId> {
        self.block(self.top_block)
            .map(|b| b.ops.iter().copied().filter(|&o| self.op(o).map(|op| op.opcode == Opcode::Global).unwrap_or(false)).collect())
            .unwrap_or_default()
    }

    pub fn find_function_by_name(&self, name: &str) -> Option<OpId> {
        self.functions().into_iter().find(|&f| self.function_name(f).as_deref() == Some(name))
    }
}

impl Default for Module {
    fn default() -> Self {
        Module::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_module_has_empty_top_region() {
        let m = Module::new();
        assert_eq!(m.region(m.top_region).unwrap().blocks, vec![m.top_block]);
        assert!(m.block(m.top_block).unwrap().ops.is_empty());
    }

    #[test]
    fn operand_use_linkage_stays_consistent() {
        let mut m = Module::new();
        let a = m.alloc_op(Opcode::ConstInt, ValueType::I32);
        let b = m.alloc_op(Opcode::AddI, ValueType::I32);
        m.push_operand(b, a).unwrap();
        assert_eq!(m.op(a).unwrap().uses, vec![b]);
        assert_eq!(m.op(b).unwrap().operands.as_slice(), &[a]);
    }

    #[test]
    fn replace_all_uses_with_rewires_and_clears() {
        let mut m = Module::new();
        let a = m.alloc_op(Opcode::ConstInt, ValueType::I32);
        let c = m.alloc_op(Opcode::ConstInt, ValueType::I32);
        let user1 = m.alloc_op(Opcode::AddI, ValueType::I32);
        let user2 = m.alloc_op(Opcode::SubI, ValueType::I32);
        m.push_operand(user1, a).unwrap();
        m.push_operand(user2, a).unwrap();
        m.replace_all_uses_with(a, c).unwrap();
        assert!(m.op(a).unwrap().uses.is_empty());
        assert_eq!(m.op(user1).unwrap().operands.as_slice(), &[c]);
        assert_eq!(m.op(user2).unwrap().operands.as_slice(), &[c]);
        assert_eq!(m.op(c).unwrap().uses.len(), 2);
    }

    #[test]
    fn erase_requires_no_uses() {
        let mut m = Module::new();
        let a = m.alloc_op(Opcode::ConstInt, ValueType::I32);
        let b = m.alloc_op(Opcode::AddI, ValueType::I32);
        m.push_operand(b, a).unwrap();
        assert!(m.erase_op(a).is_err());
        m.erase_op(b).unwrap();
        m.erase_op(a).unwrap();
        assert!(m.op(a).is_err());
    }

    #[test]
    fn find_all_recurses_into_nested_regions() {
        let mut m = Module::new();
        let func = m.alloc_op(Opcode::Function, ValueType::Void);
        let top_block = m.top_block;
        m.block_mut(top_block).unwrap().append(func);
        m.op_mut(func).unwrap().parent = Some(top_block);
        let inner_region = m.alloc_region();
        let inner_block = m.alloc_block();
        m.region_mut_pub(inner_region).unwrap().append(inner_block);
        m.op_mut(func).unwrap().region = Some(inner_region);
        let c = m.alloc_op(Opcode::ConstInt, ValueType::I32);
        m.op_mut(c).unwrap().parent = Some(inner_block);
        m.block_mut(inner_block).unwrap().append(c);
        let found = m.find_all(|op| op == Opcode::ConstInt).unwrap();
        assert_eq!(found, vec![c]);
    }
}
