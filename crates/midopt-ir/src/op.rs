//! [`Op`]: the unit of computation.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::attr::{Attr, AttrKind, AttrMap};
use crate::id::{BlockId, OpId, RegionId};
use crate::opcode::Opcode;

/// The result type of an `Op`. `Void` is used by terminators, `Store`, and
/// any opcode with no SSA result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Void,
    I32,
    I64,
    F32,
}

/// Small inline-capacity vector for operand lists: almost every opcode in
/// this IR takes 0-3 operands (binary arithmetic, Branch, Store); Phi and
/// Call are the only opcodes with a variable, larger count.
pub type OperandList = SmallVec<[OpId; 4]>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Op {
    pub id: OpId,
    pub opcode: Opcode,
    pub operands: OperandList,
    /// Reverse edges: every `OpId` whose operand list contains `self.id`.
    /// Duplicated per occurrence, so `uses.len()` equals the number of
    /// operand *slots* referencing this op, not the number of distinct
    /// users -- this is what keeps the operand/use consistency invariant a
    /// plain multiset equality rather than a set one.
    pub uses: Vec<OpId>,
    pub result_type: ValueType,
    pub attrs: AttrMap,
    /// The block this op currently lives in. `None` only transiently,
    /// between creation and insertion.
    pub parent: Option<BlockId>,
    /// Nested region for `Function`, and for the structured `If`/`While`/
    /// `For` ops before flattening.
    pub region: Option<RegionId>,
    /// Second nested region, used by `If` for its else-branch body.
    pub else_region: Option<RegionId>,
    /// `Phi`-only: the predecessor each operand flows in from, in lockstep
    /// with `operands`. `FromAttr` is conceptually "one tag per operand",
    /// which does not fit the single-valued `AttrMap`, so Phi keeps its own
    /// parallel vector instead of overloading the attribute map with
    /// per-index entries.
    pub phi_incoming: Vec<BlockId>,
}

impl Op {
    pub fn new(id: OpId, opcode: Opcode, result_type: ValueType) -> Self {
        Op {
            id,
            opcode,
            operands: OperandList::new(),
            uses: Vec::new(),
            result_type,
            attrs: AttrMap::new(),
            parent: None,
            region: None,
            else_region: None,
            phi_incoming: Vec::new(),
        }
    }

    pub fn with_operands(mut self, operands: impl IntoIterator<Item = OpId>) -> Self {
        self.operands = operands.into_iter().collect();
        self
    }

    pub fn with_attr(mut self, attr: Attr) -> Self {
        self.attrs.set(attr);
        self
    }

    pub fn is_terminator(&self) -> bool {
        self.opcode.is_terminator()
    }

    pub fn has_result(&self) -> bool {
        self.result_type != ValueType::Void
    }

    pub fn attr(&self, kind: AttrKind) -> Option<&Attr> {
        self.attrs.get(kind)
    }

    pub fn target_block(&self) -> Option<BlockId> {
        self.attr(AttrKind::Target).and_then(Attr::as_target)
    }

    pub fn else_block(&self) -> Option<BlockId> {
        self.attr(AttrKind::Else).and_then(Attr::as_else)
    }

    pub fn from_block(&self) -> Option<BlockId> {
        self.attr(AttrKind::From).and_then(Attr::as_from)
    }

    /// Shallow clone: same opcode, result type, and attributes; empty operand
    /// list (the caller must assign operands) and no uses/parent/region.
    /// Mirrors the Builder's `copy(op)` contract.
    pub fn shallow_clone(&self, new_id: OpId) -> Op {
        Op {
            id: new_id,
            opcode: self.opcode,
            operands: OperandList::new(),
            uses: Vec::new(),
            result_type: self.result_type,
            attrs: self.attrs.clone(),
            parent: None,
            region: None,
            else_region: None,
            // Copied verbatim; the caller (LateInline) remaps these through
            // its block-retarget map once the clone's operands are assigned.
            phi_incoming: self.phi_incoming.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_style_construction() {
        let op = Op::new(OpId(0), Opcode::ConstInt, ValueType::I32).with_attr(Attr::Int(7));
        assert_eq!(op.attr(AttrKind::Int).and_then(Attr::as_int), Some(7));
        assert!(!op.is_terminator());
        assert!(op.has_result());
    }

    #[test]
    fn shallow_clone_drops_operands_and_linkage() {
        let mut op = Op::new(OpId(0), Opcode::AddI, ValueType::I32);
        op.operands.push(OpId(1));
        op.operands.push(OpId(2));
        op.parent = Some(BlockId(0));
        let clone = op.shallow_clone(OpId(9));
        assert_eq!(clone.opcode, Opcode::AddI);
        assert!(clone.operands.is_empty());
        assert!(clone.parent.is_none());
    }
}
