//! Typed attribute map attached to every [`Op`](crate::op::Op).
//!
//! Attributes are values, not shared objects -- except the three
//! back-reference kinds (`Target`, `Else`, `From`) which carry a [`BlockId`]
//! rather than duplicating block data. An [`AttrMap`] is an `IndexMap` so
//! that textual dump order matches insertion order, which keeps the
//! round-trip format (and diffs against it) stable.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::id::{BlockId, OpId};

/// The key half of an attribute: which kind of payload is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttrKind {
    Int,
    Float,
    Name,
    Size,
    Dimension,
    Target,
    Else,
    From,
    IntArray,
    FloatArray,
    Impure,
    AtMostOnce,
    Caller,
    Range,
    Alias,
    Fp,
    Simd,
    /// Set on a structured `For` op by the pre-flatten `Parallelizable`
    /// cleanup pass.
    Parallel,
}

/// A closed interval over i32, saturating at the i32 bounds, or `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeValue {
    Unknown,
    Interval { lo: i32, hi: i32 },
}

impl RangeValue {
    pub const FULL: RangeValue = RangeValue::Interval { lo: i32::MIN, hi: i32::MAX };

    pub fn singleton(v: i32) -> RangeValue {
        RangeValue::Interval { lo: v, hi: v }
    }

    pub fn contains(&self, v: i32) -> bool {
        match self {
            RangeValue::Unknown => true,
            RangeValue::Interval { lo, hi } => *lo <= v && v <= *hi,
        }
    }
}

/// A points-to set: `Unknown` (may point anywhere) or a mapping from storage
/// base (an `Alloca` or `GetGlobal` op) to the set of byte offsets possibly
/// accessed through it. An offset of `-1` is the "unknown offset within this
/// base" wildcard described for the Alias analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AliasSet {
    #[default]
    Unknown,
    Known(IndexMap<OpId, Vec<i64>>),
}

impl AliasSet {
    pub fn single_base(base: OpId, offset: i64) -> AliasSet {
        let mut m = IndexMap::new();
        m.insert(base, vec![offset]);
        AliasSet::Known(m)
    }

    pub const UNKNOWN_OFFSET: i64 = -1;
}

/// The payload half of an attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attr {
    Int(i32),
    Float(f32),
    Name(String),
    /// Storage size in bytes (Alloca/Global).
    Size(u32),
    /// Array dimensions, outermost first (Global/Alloca arrays).
    Dimension(Vec<u32>),
    /// Branch-taken target (Branch/Goto) or loop-exit target.
    Target(BlockId),
    /// Branch-not-taken target (Branch).
    Else(BlockId),
    /// The predecessor a Phi operand flows in from.
    From(BlockId),
    IntArray(Vec<i32>),
    FloatArray(Vec<f32>),
    /// Set on a Function op once Pureness analysis determines it touches
    /// globals, calls something impure, or contains a concurrency op.
    Impure(bool),
    /// Set on a Function op by the AtMostOnce analysis.
    AtMostOnce(bool),
    /// Function ops that call this Function op, recomputed by CallGraph.
    Caller(Vec<OpId>),
    Range(RangeValue),
    Alias(AliasSet),
    /// Backend floating-point lowering hint; carried through verbatim, never
    /// interpreted by any pass in this crate.
    Fp(bool),
    /// Backend SIMD-width hint set on a loop's header terminator by
    /// `Vectorize`; carried through verbatim, never interpreted by any other
    /// pass in this crate.
    Simd(u32),
    /// Set by the pre-flatten `Parallelizable` cleanup pass on a structured
    /// `For` op: the body writes each iteration to a distinct element with
    /// no loop-carried dependency besides the induction variable.
    Parallel(bool),
}

impl Attr {
    pub fn kind(&self) -> AttrKind {
        match self {
            Attr::Int(_) => AttrKind::Int,
            Attr::Float(_) => AttrKind::Float,
            Attr::Name(_) => AttrKind::Name,
            Attr::Size(_) => AttrKind::Size,
            Attr::Dimension(_) => AttrKind::Dimension,
            Attr::Target(_) => AttrKind::Target,
            Attr::Else(_) => AttrKind::Else,
            Attr::From(_) => AttrKind::From,
            Attr::IntArray(_) => AttrKind::IntArray,
            Attr::FloatArray(_) => AttrKind::FloatArray,
            Attr::Impure(_) => AttrKind::Impure,
            Attr::AtMostOnce(_) => AttrKind::AtMostOnce,
            Attr::Caller(_) => AttrKind::Caller,
            Attr::Range(_) => AttrKind::Range,
            Attr::Alias(_) => AttrKind::Alias,
            Attr::Fp(_) => AttrKind::Fp,
            Attr::Simd(_) => AttrKind::Simd,
            Attr::Parallel(_) => AttrKind::Parallel,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Attr::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Attr::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Attr::Name(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_target(&self) -> Option<BlockId> {
        match self {
            Attr::Target(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_else(&self) -> Option<BlockId> {
        match self {
            Attr::Else(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_from(&self) -> Option<BlockId> {
        match self {
            Attr::From(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_range(&self) -> Option<&RangeValue> {
        match self {
            Attr::Range(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_alias(&self) -> Option<&AliasSet> {
        match self {
            Attr::Alias(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Attr::Impure(b) | Attr::AtMostOnce(b) | Attr::Fp(b) | Attr::Parallel(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_simd_width(&self) -> Option<u32> {
        match self {
            Attr::Simd(w) => Some(*w),
            _ => None,
        }
    }
}

/// Ordered attribute map for a single `Op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AttrMap(IndexMap<AttrKind, Attr>);

impl AttrMap {
    pub fn new() -> Self {
        AttrMap(IndexMap::new())
    }

    pub fn set(&mut self, attr: Attr) {
        self.0.insert(attr.kind(), attr);
    }

    pub fn get(&self, kind: AttrKind) -> Option<&Attr> {
        self.0.get(&kind)
    }

    pub fn remove(&mut self, kind: AttrKind) -> Option<Attr> {
        self.0.shift_remove(&kind)
    }

    pub fn contains(&self, kind: AttrKind) -> bool {
        self.0.contains_key(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AttrKind, &Attr)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_map_set_get_remove() {
        let mut m = AttrMap::new();
        m.set(Attr::Int(42));
        assert_eq!(m.get(AttrKind::Int).and_then(Attr::as_int), Some(42));
        m.set(Attr::Int(7));
        assert_eq!(m.get(AttrKind::Int).and_then(Attr::as_int), Some(7));
        assert_eq!(m.len(), 1);
        m.remove(AttrKind::Int);
        assert!(m.get(AttrKind::Int).is_none());
    }

    #[test]
    fn range_contains() {
        let r = RangeValue::Interval { lo: 0, hi: 10 };
        assert!(r.contains(5));
        assert!(!r.contains(11));
        assert!(RangeValue::Unknown.contains(i32::MIN));
    }

    #[test]
    fn alias_single_base_roundtrip() {
        let base = OpId(1);
        let set = AliasSet::single_base(base, 4);
        match set {
            AliasSet::Known(m) => assert_eq!(m.get(&base), Some(&vec![4i64])),
            AliasSet::Unknown => panic!("expected Known"),
        }
    }
}
