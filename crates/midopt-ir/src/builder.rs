//! [`Builder`]: an insertion cursor over a [`Module`].
//!
//! Every pass that rewrites the IR goes through a `Builder` rather than
//! poking `Module` arenas directly, so that "where does the new op go"
//! is answered once, at cursor-construction time, instead of at every call
//! site.

use crate::attr::Attr;
use crate::error::{IrError, IrResult};
use crate::id::{BlockId, OpId, RegionId};
use crate::module::Module;
use crate::op::ValueType;
use crate::opcode::Opcode;

/// Where the next `create` will insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Start of a region's entry block.
    RegionStart(RegionId),
    BlockStart(BlockId),
    BlockEnd(BlockId),
    Before(OpId),
    After(OpId),
}

pub struct Builder<'m> {
    module: &'m mut Module,
    cursor: Cursor,
}

impl<'m> Builder<'m> {
    pub fn new(module: &'m mut Module, cursor: Cursor) -> Self {
        Builder { module, cursor }
    }

    pub fn at_block_end(module: &'m mut Module, block: BlockId) -> Self {
        Builder::new(module, Cursor::BlockEnd(block))
    }

    pub fn at_block_start(module: &'m mut Module, block: BlockId) -> Self {
        Builder::new(module, Cursor::BlockStart(block))
    }

    pub fn before(module: &'m mut Module, op: OpId) -> Self {
        Builder::new(module, Cursor::Before(op))
    }

    pub fn after(module: &'m mut Module, op: OpId) -> Self {
        Builder::new(module, Cursor::After(op))
    }

    pub fn set_cursor(&mut self, cursor: Cursor) {
        self.cursor = cursor;
    }

    pub fn module(&self) -> &Module {
        self.module
    }

    pub fn module_mut(&mut self) -> &mut Module {
        self.module
    }

    fn cursor_block(&self) -> IrResult<BlockId> {
        match self.cursor {
            Cursor::RegionStart(r) => self.module.region(r)?.entry().ok_or(IrError::UnknownRegion(r)),
            Cursor::BlockStart(b) | Cursor::BlockEnd(b) => Ok(b),
            Cursor::Before(op) | Cursor::After(op) => self.module.op(op)?.parent.ok_or(IrError::UnknownOp(op)),
        }
    }

    fn insert_index(&self, block: BlockId) -> IrResult<usize> {
        let b = self.module.block(block)?;
        Ok(match self.cursor {
            Cursor::RegionStart(_) | Cursor::BlockStart(_) => 0,
            Cursor::BlockEnd(_) => b.ops.len(),
            Cursor::Before(op) => b.position(op).ok_or(IrError::UnknownOp(op))?,
            Cursor::After(op) => b.position(op).ok_or(IrError::UnknownOp(op))? + 1,
        })
    }

    /// Allocate a new op, attach operands/attrs, and insert it at the cursor.
    /// Advances the cursor to just after the new op so a sequence of
    /// `create` calls appends in order.
    pub fn create(
        &mut self,
        opcode: Opcode,
        result_type: ValueType,
        operands: impl IntoIterator<Item = OpId>,
        attrs: impl IntoIterator<Item = Attr>,
    ) -> IrResult<OpId> {
        let block = self.cursor_block()?;
        let index = self.insert_index(block)?;
        let id = self.module.alloc_op(opcode, result_type);
        for operand in operands {
            self.module.push_operand(id, operand)?;
        }
        for attr in attrs {
            self.module.op_mut(id)?.attrs.set(attr);
        }
        self.module.op_mut(id)?.parent = Some(block);
        self.module.block_mut(block)?.insert_at(index, id);
        self.cursor = Cursor::After(id);
        Ok(id)
    }

    /// Create a new op at `target`'s position, rewire every use of `target`
    /// to the new op, then erase `target`. The new op must not reference
    /// `target` in its operand list (that would make it unerasable).
    pub fn replace(
        &mut self,
        target: OpId,
        opcode: Opcode,
        result_type: ValueType,
        operands: impl IntoIterator<Item = OpId>,
        attrs: impl IntoIterator<Item = Attr>,
    ) -> IrResult<OpId> {
        let saved_cursor = self.cursor;
        self.cursor = Cursor::Before(target);
        let new_id = self.create(opcode, result_type, operands, attrs)?;
        self.module.replace_all_uses_with(target, new_id)?;
        self.module.erase_op(target)?;
        self.cursor = if saved_cursor == Cursor::After(target) { Cursor::After(new_id) } else { saved_cursor };
        Ok(new_id)
    }

    /// Shallow-clone `op`'s opcode/attrs/result type and insert the clone at
    /// the cursor with an empty operand list; the caller must assign
    /// operands (typically via a clone-map lookup during inlining).
    pub fn copy(&mut self, op: OpId) -> IrResult<OpId> {
        let block = self.cursor_block()?;
        let index = self.insert_index(block)?;
        let source = self.module.op(op)?.clone();
        let new_id = self.module.alloc_op(source.opcode, source.result_type);
        self.module.op_mut(new_id)?.attrs = source.attrs;
        self.module.op_mut(new_id)?.phi_incoming = source.phi_incoming;
        self.module.op_mut(new_id)?.parent = Some(block);
        self.module.block_mut(block)?.insert_at(index, new_id);
        self.cursor = Cursor::After(new_id);
        Ok(new_id)
    }

    pub fn move_before(&mut self, op: OpId, anchor: OpId) -> IrResult<()> {
        let block = self.module.op(anchor)?.parent.ok_or(IrError::UnknownOp(anchor))?;
        let old_block = self.module.op(op)?.parent.ok_or(IrError::UnknownOp(op))?;
        self.module.block_mut(old_block)?.remove_op(op);
        let index = self.module.block(block)?.position(anchor).ok_or(IrError::UnknownOp(anchor))?;
        self.module.block_mut(block)?.insert_at(index, op);
        self.module.op_mut(op)?.parent = Some(block);
        Ok(())
    }

    pub fn move_after(&mut self, op: OpId, anchor: OpId) -> IrResult<()> {
        let block = self.module.op(anchor)?.parent.ok_or(IrError::UnknownOp(anchor))?;
        let old_block = self.module.op(op)?.parent.ok_or(IrError::UnknownOp(op))?;
        self.module.block_mut(old_block)?.remove_op(op);
        let index = self.module.block(block)?.position(anchor).ok_or(IrError::UnknownOp(anchor))? + 1;
        self.module.block_mut(block)?.insert_at(index, op);
        self.module.op_mut(op)?.parent = Some(block);
        Ok(())
    }

    pub fn create_block_in(&mut self, region: RegionId) -> IrResult<BlockId> {
        let block = self.module.alloc_block();
        self.module.region_mut_pub(region)?.append(block);
        Ok(block)
    }

    /// Shorthand for a common pattern: `create` a constant-int op.
    pub fn const_int(&mut self, value: i32) -> IrResult<OpId> {
        self.create(Opcode::ConstInt, ValueType::I32, [], [Attr::Int(value)])
    }

    pub fn const_float(&mut self, value: f32) -> IrResult<OpId> {
        self.create(Opcode::ConstFloat, ValueType::F32, [], [Attr::Float(value)])
    }

    pub fn goto(&mut self, target: BlockId) -> IrResult<OpId> {
        self.create(Opcode::Goto, ValueType::Void, [], [Attr::Target(target)])
    }

    pub fn branch(&mut self, cond: OpId, then_block: BlockId, else_block: BlockId) -> IrResult<OpId> {
        self.create(Opcode::Branch, ValueType::Void, [cond], [Attr::Target(then_block), Attr::Else(else_block)])
    }

    pub fn ret(&mut self, value: Option<OpId>) -> IrResult<OpId> {
        self.create(Opcode::Return, ValueType::Void, value, [])
    }

    /// Create a Phi with its operand list and `FromAttr`-equivalent
    /// `phi_incoming` vector built in lockstep, one pair per predecessor.
    pub fn phi(&mut self, result_type: ValueType, incoming: impl IntoIterator<Item = (OpId, BlockId)>) -> IrResult<OpId> {
        let block = self.cursor_block()?;
        let index = self.insert_index(block)?;
        let id = self.module.alloc_op(Opcode::Phi, result_type);
        self.module.op_mut(id)?.parent = Some(block);
        self.module.block_mut(block)?.insert_at(index, id);
        for (value, from) in incoming {
            self.module.push_operand(id, value)?;
            self.module.op_mut(id)?.phi_incoming.push(from);
        }
        self.cursor = Cursor::After(id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_appends_and_advances_cursor() {
        let mut m = Module::new();
        let func = m.alloc_op(Opcode::Function, ValueType::Void);
        let region = m.alloc_region();
        m.op_mut(func).unwrap().region = Some(region);
        let mut b = Builder::new(&mut m, Cursor::RegionStart(region));
        let block = b.create_block_in(region).unwrap();
        b.set_cursor(Cursor::BlockEnd(block));
        let c1 = b.const_int(1).unwrap();
        let c2 = b.const_int(2).unwrap();
        let add = b.create(Opcode::AddI, ValueType::I32, [c1, c2], []).unwrap();
        assert_eq!(m.block(block).unwrap().ops, vec![c1, c2, add]);
    }

    #[test]
    fn replace_rewires_uses_and_erases_target() {
        let mut m = Module::new();
        let func = m.alloc_op(Opcode::Function, ValueType::Void);
        let region = m.alloc_region();
        m.op_mut(func).unwrap().region = Some(region);
        let mut b = Builder::new(&mut m, Cursor::RegionStart(region));
        let block = b.create_block_in(region).unwrap();
        b.set_cursor(Cursor::BlockEnd(block));
        let c1 = b.const_int(1).unwrap();
        let user = b.create(Opcode::AddI, ValueType::I32, [c1, c1], []).unwrap();
        let c2 = b.const_int(99).unwrap();
        b.replace(c1, Opcode::ConstInt, ValueType::I32, [], [Attr::Int(42)]).unwrap();
        let _ = c2;
        assert!(m.op(c1).is_err());
        let user_op = m.op(user).unwrap();
        assert_eq!(user_op.operands.len(), 2);
        for &operand in &user_op.operands {
            assert_ne!(operand, c1);
        }
    }

    #[test]
    fn copy_clones_attrs_with_empty_operands() {
        let mut m = Module::new();
        let func = m.alloc_op(Opcode::Function, ValueType::Void);
        let region = m.alloc_region();
        m.op_mut(func).unwrap().region = Some(region);
        let mut b = Builder::new(&mut m, Cursor::RegionStart(region));
        let block = b.create_block_in(region).unwrap();
        b.set_cursor(Cursor::BlockEnd(block));
        let c1 = b.const_int(5).unwrap();
        let c1_copy = b.copy(c1).unwrap();
        assert_eq!(m.op(c1_copy).unwrap().attrs, m.op(c1).unwrap().attrs);
        assert!(m.op(c1_copy).unwrap().operands.is_empty());
    }
}
