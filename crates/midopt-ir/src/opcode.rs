//! The closed opcode vocabulary.
//!
//! An [`Opcode`] is a bare discriminant; operands and attributes live on the
//! owning [`Op`](crate::op::Op) rather than inside the enum. This mirrors the
//! data model described for this IR: "opcode (a closed enum of kinds) /
//! operand list / attributes" are three separate things, not folded into one
//! sum-of-structs the way a frontend AST might be.

use serde::{Deserialize, Serialize};

/// One of the IR's operation kinds.
///
/// Grouped by role; the grouping has no run-time meaning, it's only here to
/// keep ~60 variants navigable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    // -- Constants --
    ConstInt,
    ConstFloat,

    // -- 32-bit integer arithmetic --
    AddI,
    SubI,
    MulI,
    DivI,
    ModI,
    NegI,

    // -- Bitwise / shifts --
    AndI,
    OrI,
    XorI,
    NotI,
    ShlI,
    LShrI,
    AShrI,

    // -- Integer comparisons (result is i32 0/1) --
    EqI,
    NeI,
    LtI,
    LeI,
    GtI,
    GeI,

    // -- f32 arithmetic --
    AddF,
    SubF,
    MulF,
    DivF,
    NegF,

    // -- f32 comparisons --
    EqF,
    NeF,
    LtF,
    LeF,
    GtF,
    GeF,

    // -- Conversions --
    IntToFloat,
    FloatToInt,

    // -- 64-bit address arithmetic. Pointers are represented as i64; AddL/MulL
    // -- do base+offset math, RShiftL divides a byte offset down to an
    // -- element index (or back) for array indexing. --
    AddL,
    MulL,
    RShiftL,

    // -- Memory --
    Alloca,
    Load,
    Store,
    GetGlobal,

    // -- Flat-CFG control flow --
    Goto,
    Branch,
    Return,

    // -- SSA --
    Phi,
    Select,

    // -- Calls --
    Call,
    GetArg,

    // -- Top-level containers. A Function/Global op lives directly in the
    // -- module region; its nested Region (for Function) holds the body. --
    Function,
    Global,

    // -- Structured control flow (pre-flattening only) --
    If,
    While,
    For,
    Break,
    Continue,
    Proceed,

    // -- Concurrency primitives. Opaque and impure; never interpreted, only
    // -- tracked by purity/DCE. --
    Clone,
    Join,
    Wake,

    // -- Backend handoff. Out of scope for this crate's consumers: emitted
    // -- only as an opaque placeholder so the IR can model "this op has been
    // -- lowered" without modeling instruction selection itself. --
    BackendOpaque,
}

impl Opcode {
    /// True for opcodes that end a basic block.
    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Goto | Opcode::Branch | Opcode::Return)
    }

    /// True for the structured (pre-flattening) control-flow opcodes.
    pub fn is_structured(self) -> bool {
        matches!(
            self,
            Opcode::If | Opcode::While | Opcode::For | Opcode::Break | Opcode::Continue | Opcode::Proceed
        )
    }

    /// True for opcodes whose presence always marks a function impure
    /// (concurrency primitives, and by extension anything the caller cannot
    /// see through). `GetGlobal`/external `Call` are judged by the Pureness
    /// analysis instead, since their impurity is contextual.
    pub fn is_concurrency(self) -> bool {
        matches!(self, Opcode::Clone | Opcode::Join | Opcode::Wake)
    }

    /// True for opcodes that have a side effect on the heap/stack and are
    /// therefore never eligible for GVN or dead-store-as-source elimination.
    pub fn has_memory_effect(self) -> bool {
        matches!(self, Opcode::Store | Opcode::Call | Opcode::Clone | Opcode::Join | Opcode::Wake)
    }

    /// True for opcodes with no side effects and a deterministic result
    /// purely as a function of their operands and attributes -- eligible for
    /// GVN, GCM scheduling, and folding.
    pub fn is_pure_computation(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            ConstInt
                | ConstFloat
                | AddI
                | SubI
                | MulI
                | DivI
                | ModI
                | NegI
                | AndI
                | OrI
                | XorI
                | NotI
                | ShlI
                | LShrI
                | AShrI
                | EqI
                | NeI
                | LtI
                | LeI
                | GtI
                | GeI
                | AddF
                | SubF
                | MulF
                | DivF
                | NegF
                | EqF
                | NeF
                | LtF
                | LeF
                | GtF
                | GeF
                | IntToFloat
                | FloatToInt
                | AddL
                | MulL
                | RShiftL
                | Select
        )
    }

    /// True for opcodes whose order in a block carries no meaning and which
    /// GCM is therefore allowed to reschedule.
    pub fn is_schedulable(self) -> bool {
        self.is_pure_computation() || matches!(self, Opcode::GetArg | Opcode::GetGlobal)
    }

    /// True for integer (vs. float) binary comparisons, used by Range
    /// analysis to decide whether a branch's condition can be split.
    pub fn is_int_compare(self) -> bool {
        matches!(self, Opcode::EqI | Opcode::NeI | Opcode::LtI | Opcode::LeI | Opcode::GtI | Opcode::GeI)
    }

    /// True when the two operands of a binary opcode may be swapped without
    /// changing the result, used by GVN's commutative key canonicalization.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Opcode::AddI | Opcode::MulI | Opcode::AndI | Opcode::OrI | Opcode::XorI | Opcode::AddF | Opcode::MulF | Opcode::EqI | Opcode::NeI | Opcode::EqF | Opcode::NeF
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_classification() {
        assert!(Opcode::Goto.is_terminator());
        assert!(Opcode::Branch.is_terminator());
        assert!(Opcode::Return.is_terminator());
        assert!(!Opcode::AddI.is_terminator());
    }

    #[test]
    fn pure_computation_excludes_memory_and_control() {
        assert!(Opcode::AddI.is_pure_computation());
        assert!(!Opcode::Load.is_pure_computation());
        assert!(!Opcode::Store.is_pure_computation());
        assert!(!Opcode::Call.is_pure_computation());
        assert!(!Opcode::Phi.is_pure_computation());
    }

    #[test]
    fn commutative_opcodes() {
        assert!(Opcode::AddI.is_commutative());
        assert!(!Opcode::SubI.is_commutative());
        assert!(!Opcode::DivI.is_commutative());
    }
}
