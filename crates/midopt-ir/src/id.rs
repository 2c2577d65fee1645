//! Stable ID newtypes for the IR arena.
//!
//! The source represents the IR as a pointer graph (`Op*`, `BasicBlock*`,
//! `Region*`) with cyclic use/def edges. We render that as arena allocation:
//! every entity lives in a `Vec` owned by the `Module`, and every reference
//! between entities is an index newtype rather than a pointer or a borrow.
//! This keeps iteration-while-mutating safe and makes `Op::copy` (shallow
//! clone) a matter of copying a small `Copy` struct.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies an [`Op`](crate::op::Op) within a [`Module`](crate::module::Module).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId(pub u32);

/// Identifies a [`BasicBlock`](crate::block::BasicBlock) within a `Module`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Identifies a [`Region`](crate::region::Region) within a `Module`.
///
/// A `Function` op and a `Module` each own exactly one region; `RegionId`
/// lets both refer to "their" region without the region borrowing back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionId(pub u32);

macro_rules! display_as_inner {
    ($ty:ident, $prefix:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

display_as_inner!(OpId, "%");
display_as_inner!(BlockId, "bb");
display_as_inner!(RegionId, "rg");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types_with_same_repr() {
        let op = OpId(3);
        let block = BlockId(3);
        assert_eq!(op.0, block.0);
    }

    #[test]
    fn display_formats() {
        assert_eq!(format!("{}", OpId(5)), "%5");
        assert_eq!(format!("{}", BlockId(2)), "bb2");
        assert_eq!(format!("{}", RegionId(0)), "rg0");
    }

    #[test]
    fn serde_roundtrip() {
        let id = OpId(42);
        let json = serde_json::to_string(&id).unwrap();
        let back: OpId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
