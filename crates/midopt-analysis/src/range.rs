//! Range analysis: integer interval arithmetic, with branch-conditional
//! splitting and loop-header widening.
//!
//! The interval arithmetic (`minmul`/`maxmul`/`mindiv`/`maxdiv`/`minmod`/
//! `maxmod`) is a direct port of `Range.cpp`'s helpers, which is the part
//! of this analysis with real bite (naive endpoint multiplication is wrong
//! whenever an interval straddles zero).
//!
//! `split_at_branches` mirrors `Range.cpp`'s `postdom`/`split` pair: for
//! every `x < y`-controlled `Branch`, a single-operand `Phi` is inserted at
//! the start of each successor, the comparand's existing uses are rewired
//! to whichever successor-specific `Phi` dominates them (uses that
//! post-dominate both successors keep pointing at the original value), and
//! `step`'s `Phi` arm then narrows each synthetic `Phi` directly from the
//! branch condition instead of joining its (single) incoming range. Unlike
//! `Range.cpp`'s `postdom`, `postdom` here never mutates the CFG to force a
//! single exit block first -- `compute_post_dominators`'s virtual-exit
//! sentinel already joins every real exit for post-dominance purposes, so
//! the IR-rewriting step the original needs has no work left to do here.

use midopt_ir::{compute_dominators, compute_post_dominators, dominates, recompute_cfg, Attr, AttrKind, BlockId, Module, OpId, Opcode, RangeValue};

use crate::error::AnalysisResult;

const WIDEN_AFTER_ROUNDS: usize = 4;

fn clamp64(x: i64) -> i32 {
    if x > i32::MAX as i64 {
        i32::MAX
    } else if x < i32::MIN as i64 {
        i32::MIN
    } else {
        x as i32
    }
}

fn minmul(a1: i64, b1: i64, a2: i64, b2: i64) -> i64 {
    [a1 * a2, a1 * b2, b1 * a2, b1 * b2].into_iter().min().unwrap().max(i32::MIN as i64)
}

fn maxmul(a1: i64, b1: i64, a2: i64, b2: i64) -> i64 {
    [a1 * a2, a1 * b2, b1 * a2, b1 * b2].into_iter().max().unwrap().min(i32::MAX as i64)
}

fn mindiv(a1: i64, b1: i64, a2: i64, b2: i64) -> i64 {
    if a2 == 0 || b2 == 0 {
        return i32::MIN as i64;
    }
    if a2 * b2 < 0 {
        return -a1.abs().max(a2.abs());
    }
    [a1 / a2, a1 / b2, b1 / a2, b1 / b2].into_iter().min().unwrap()
}

fn maxdiv(a1: i64, b1: i64, a2: i64, b2: i64) -> i64 {
    if a2 == 0 || b2 == 0 {
        return i32::MAX as i64;
    }
    if a2 * b2 < 0 {
        return a1.abs().max(a2.abs());
    }
    [a1 / a2, a1 / b2, b1 / a2, b1 / b2].into_iter().max().unwrap()
}

fn minmod(a1: i64, b1: i64, a2: i64, b2: i64) -> i64 {
    if a1 >= 0 && a2 > 0 {
        return 0;
    }
    if a1 >= 0 && a2 > b1 {
        return a1;
    }
    -(a2.abs().max(b2.abs())) + 1
}

fn maxmod(a1: i64, b1: i64, a2: i64, b2: i64) -> i64 {
    if a1 >= 0 && a2 > b1 {
        return b1;
    }
    a2.abs().max(b2.abs()) - 1
}

fn join(l: (i32, i32), r: (i32, i32), widen: bool) -> (i32, i32) {
    let (a1, b1) = l;
    let (a2, b2) = r;
    if widen {
        (if a2 < a1 { i32::MIN } else { a1 }, if b1 < b2 { i32::MAX } else { b1 })
    } else {
        (a1.min(a2), b1.max(b2))
    }
}

fn range_of(module: &Module, op: OpId) -> RangeValue {
    module.op(op).ok().and_then(|o| o.attr(AttrKind::Range)).and_then(Attr::as_range).copied().unwrap_or(RangeValue::Unknown)
}

fn set_range(module: &mut Module, op: OpId, new: RangeValue, widen: bool) -> AnalysisResult<bool> {
    let existing = range_of(module, op);
    let merged = match (existing, new) {
        (RangeValue::Unknown, r) => r,
        (r, RangeValue::Unknown) => r,
        (RangeValue::Interval { lo: a1, hi: b1 }, RangeValue::Interval { lo: a2, hi: b2 }) => {
            let (lo, hi) = join((a1, b1), (a2, b2), widen);
            RangeValue::Interval { lo, hi }
        }
    };
    if merged == existing {
        return Ok(false);
    }
    module.op_mut(op)?.attrs.set(Attr::Range(merged));
    Ok(true)
}

fn binop_ranges(module: &Module, op: OpId) -> Option<((i32, i32), (i32, i32))> {
    let operands = &module.op(op).ok()?.operands;
    if operands.len() != 2 {
        return None;
    }
    let l = range_of(module, operands[0]);
    let r = range_of(module, operands[1]);
    match (l, r) {
        (RangeValue::Interval { lo: a1, hi: b1 }, RangeValue::Interval { lo: a2, hi: b2 }) => Some(((a1, b1), (a2, b2))),
        _ => None,
    }
}

fn step(module: &mut Module, op_id: OpId, widen: bool) -> AnalysisResult<bool> {
    let op = module.op(op_id)?;
    match op.opcode {
        Opcode::ConstInt => {
            let v = op.attr(AttrKind::Int).and_then(Attr::as_int).unwrap_or(0);
            set_range(module, op_id, RangeValue::singleton(v), false)
        }
        Opcode::FloatToInt => set_range(module, op_id, RangeValue::Unknown, false),
        Opcode::AddI => {
            let Some(((a1, b1), (a2, b2))) = binop_ranges(module, op_id) else { return Ok(false) };
            let lo = clamp64(a1 as i64 + a2 as i64);
            let hi = clamp64(b1 as i64 + b2 as i64);
            set_range(module, op_id, RangeValue::Interval { lo, hi }, widen)
        }
        Opcode::SubI => {
            let Some(((a1, b1), (a2, b2))) = binop_ranges(module, op_id) else { return Ok(false) };
            let lo = clamp64(a1 as i64 - b2 as i64);
            let hi = clamp64(b1 as i64 - a2 as i64);
            set_range(module, op_id, RangeValue::Interval { lo, hi }, widen)
        }
        Opcode::MulI => {
            let Some(((a1, b1), (a2, b2))) = binop_ranges(module, op_id) else { return Ok(false) };
            let (a1, b1, a2, b2) = (a1 as i64, b1 as i64, a2 as i64, b2 as i64);
            set_range(module, op_id, RangeValue::Interval { lo: clamp64(minmul(a1, b1, a2, b2)), hi: clamp64(maxmul(a1, b1, a2, b2)) }, widen)
        }
        Opcode::DivI => {
            let Some(((a1, b1), (a2, b2))) = binop_ranges(module, op_id) else { return Ok(false) };
            let (a1, b1, a2, b2) = (a1 as i64, b1 as i64, a2 as i64, b2 as i64);
            set_range(module, op_id, RangeValue::Interval { lo: clamp64(mindiv(a1, b1, a2, b2)), hi: clamp64(maxdiv(a1, b1, a2, b2)) }, widen)
        }
        Opcode::ModI => {
            let Some(((a1, b1), (a2, b2))) = binop_ranges(module, op_id) else { return Ok(false) };
            let (a1, b1, a2, b2) = (a1 as i64, b1 as i64, a2 as i64, b2 as i64);
            set_range(module, op_id, RangeValue::Interval { lo: clamp64(minmod(a1, b1, a2, b2)), hi: clamp64(maxmod(a1, b1, a2, b2)) }, widen)
        }
        Opcode::EqI | Opcode::NeI | Opcode::LtI | Opcode::LeI | Opcode::GtI | Opcode::GeI => {
            let Some(((a1, b1), (a2, b2))) = binop_ranges(module, op_id) else {
                return set_range(module, op_id, RangeValue::Interval { lo: 0, hi: 1 }, false);
            };
            let (valid, unsat) = match op.opcode {
                Opcode::EqI => (a1 == a2 && b1 == b2 && a1 == b1, a1 > b2 || a2 > b1),
                Opcode::NeI => (a1 > b2 || a2 > b1, a1 == a2 && b1 == b2 && a1 == b1),
                Opcode::LeI => (b1 <= a2, a1 > b2),
                Opcode::LtI => (b1 < a2, a1 >= b2),
                Opcode::GeI => (a1 >= b2, b1 < a2),
                Opcode::GtI => (a1 > b2, b1 <= a2),
                _ => unreachable!(),
            };
            let r = if valid { (1, 1) } else if unsat { (0, 0) } else { (0, 1) };
            set_range(module, op_id, RangeValue::Interval { lo: r.0, hi: r.1 }, false)
        }
        Opcode::NotI => set_range(module, op_id, RangeValue::Interval { lo: 0, hi: 1 }, false),
        Opcode::Call => {
            let name = op.attr(AttrKind::Name).and_then(Attr::as_name).map(str::to_owned);
            let known = match name.as_deref() {
                Some("getch") => Some(RangeValue::Interval { lo: 1, hi: 128 }),
                Some("getarray") | Some("getfarray") => Some(RangeValue::Interval { lo: 1, hi: i32::MAX }),
                _ => None,
            };
            match known {
                Some(r) => set_range(module, op_id, r, false),
                None => set_range(module, op_id, RangeValue::Unknown, false),
            }
        }
        Opcode::Phi => {
            if let Some(changed) = update_conditional(module, op_id)? {
                return Ok(changed);
            }
            let operands = module.op(op_id)?.operands.clone();
            let mut acc: Option<(i32, i32)> = None;
            let mut any_unknown = false;
            for operand in operands {
                match range_of(module, operand) {
                    RangeValue::Unknown => any_unknown = true,
                    RangeValue::Interval { lo, hi } => acc = Some(match acc { None => (lo, hi), Some(r) => join(r, (lo, hi), false) }),
                }
            }
            if any_unknown || acc.is_none() {
                return set_range(module, op_id, RangeValue::Unknown, false);
            }
            let (lo, hi) = acc.unwrap();
            set_range(module, op_id, RangeValue::Interval { lo, hi }, widen)
        }
        Opcode::Alloca | Opcode::Goto | Opcode::Branch | Opcode::Return | Opcode::Store | Opcode::Clone | Opcode::Join => Ok(false),
        _ => Ok(false),
    }
}

/// `a` post-dominates `b` iff walking `ipdom` from `b` reaches `a` (every
/// block post-dominates itself). Mirrors `midopt_ir::dominates`, just over
/// `ipdom` instead of `idom`.
fn post_dominates(module: &Module, a: BlockId, b: BlockId) -> bool {
    if a == b {
        return true;
    }
    let mut cur = b;
    loop {
        let Ok(block) = module.block(cur) else { return false };
        match block.ipdom {
            Some(ipdom) if ipdom == cur => return false,
            Some(ipdom) => {
                if ipdom == a {
                    return true;
                }
                cur = ipdom;
            }
            None => return false,
        }
    }
}

/// Recompute dominators and post-dominators for `func`'s region. Required
/// before `split_at_branches`' dominance/post-dominance queries and before
/// `update_conditional` trusts a synthetic `Phi`'s recorded predecessor.
pub fn postdom(module: &mut Module, func: OpId) -> AnalysisResult<()> {
    let Some(region) = module.op(func)?.region else { return Ok(()) };
    let snapshot = module.region(region)?.clone();
    recompute_cfg(module, &snapshot)?;
    compute_dominators(module, &snapshot)?;
    compute_post_dominators(module, &snapshot)?;
    Ok(())
}

/// True if `target` already has a single-operand `Phi` whose one operand
/// is `x` -- i.e. this branch's comparand was already split here in an
/// earlier call, and doing it again would just pile up dead duplicate
/// Phis.
fn already_split(module: &Module, target: BlockId, x: OpId) -> AnalysisResult<bool> {
    for &op_id in &module.block(target)?.ops {
        let op = module.op(op_id)?;
        if op.opcode == Opcode::Phi && op.operands.len() == 1 && op.operands[0] == x {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Redirect every existing use of `x` to whichever of the two
/// branch-successor Phis (`x1` at `bb1`, `x2` at `bb2`) dominates it,
/// leaving uses that post-dominate both successors pointing at `x` itself
/// (that's the merge point where either edge could have been taken, so
/// the original, unrefined range is what applies).
fn rewire_uses_for_split(module: &mut Module, x: OpId, x1: OpId, bb1: BlockId, x2: OpId, bb2: BlockId) -> AnalysisResult<()> {
    let uses = module.op(x)?.uses.clone();
    for user in uses {
        if user == x1 || user == x2 {
            continue;
        }
        let Some(parent) = module.op(user)?.parent else { continue };
        if post_dominates(module, bb1, parent) && post_dominates(module, bb2, parent) {
            continue;
        }
        let positions: Vec<usize> = module.op(user)?.operands.iter().enumerate().filter(|&(_, &o)| o == x).map(|(i, _)| i).collect();
        if dominates(module, bb1, parent) {
            for &idx in &positions {
                module.replace_operand(user, idx, x1)?;
            }
        } else if dominates(module, bb2, parent) {
            for &idx in &positions {
                module.replace_operand(user, idx, x2)?;
            }
        }
    }
    Ok(())
}

/// Insert single-operand Phis at each successor of every `LtI`-controlled
/// branch and rewire the comparand's existing uses onto them, so a
/// branch-specific refinement of the compared value can be recorded on
/// each Phi (by `update_conditional`, in `step`) instead of on the shared
/// original value. Returns the inserted Phi ids. Requires `postdom` to
/// have been run on `func` first; runs it here so callers don't have to
/// remember to.
pub fn split_at_branches(module: &mut Module, func: OpId) -> AnalysisResult<Vec<OpId>> {
    use midopt_ir::{Builder, Cursor, ValueType};
    postdom(module, func)?;
    let mut inserted = Vec::new();
    let Some(region) = module.op(func)?.region else { return Ok(inserted) };
    let blocks = module.region(region)?.blocks.clone();
    for block in blocks {
        let Some(term) = module.block(block)?.terminator() else { continue };
        let term_op = module.op(term)?;
        if term_op.opcode != Opcode::Branch {
            continue;
        }
        let cond = term_op.operands.first().copied();
        let Some(cond) = cond else { continue };
        let Ok(cond_op) = module.op(cond) else { continue };
        if cond_op.opcode != Opcode::LtI {
            continue;
        }
        let x = cond_op.operands[0];
        let Some(bb1) = term_op.target_block() else { continue };
        let Some(bb2) = term_op.else_block() else { continue };

        // Unrotated/single-block loop backedges: the branch's own block
        // can't be one of its own successors for the split to make sense.
        if bb1 == block || bb2 == block {
            continue;
        }
        if !dominates(module, block, bb1) || !dominates(module, block, bb2) {
            continue;
        }
        if already_split(module, bb1, x)? && already_split(module, bb2, x)? {
            continue;
        }

        let mut b = Builder::new(module, Cursor::BlockStart(bb1));
        let x1 = b.phi(ValueType::I32, [(x, block)])?;
        let mut b = Builder::new(module, Cursor::BlockStart(bb2));
        let x2 = b.phi(ValueType::I32, [(x, block)])?;
        rewire_uses_for_split(module, x, x1, bb1, x2, bb2)?;
        inserted.push(x1);
        inserted.push(x2);
    }
    Ok(inserted)
}

/// Narrow a synthetic split `Phi` (inserted by `split_at_branches`)
/// directly from the branch condition that guards it, rather than joining
/// its single incoming range unchanged. Returns `None` when `op_id` isn't
/// such a Phi (not single-operand, not guarded by an `x < y` branch, or
/// either side's range isn't known yet) so the caller falls back to the
/// generic join; `Some(changed)` when it is.
fn update_conditional(module: &mut Module, op_id: OpId) -> AnalysisResult<Option<bool>> {
    let op = module.op(op_id)?;
    if op.operands.len() != 1 {
        return Ok(None);
    }
    let x = op.operands[0];
    let Some(&pred) = op.phi_incoming.first() else { return Ok(None) };
    let Some(parent) = op.parent else { return Ok(None) };

    let RangeValue::Interval { lo: xlo, hi: xhi } = range_of(module, x) else { return Ok(None) };

    let Some(term) = module.block(pred)?.terminator() else { return Ok(None) };
    let term_op = module.op(term)?;
    if term_op.opcode != Opcode::Branch {
        return Ok(None);
    }
    let is_target = term_op.target_block() == Some(parent);
    let Some(cond) = term_op.operands.first().copied() else { return Ok(None) };
    let cond_op = module.op(cond)?;
    if cond_op.opcode != Opcode::LtI || cond_op.operands[0] != x {
        return Ok(None);
    }
    let y = cond_op.operands[1];
    let RangeValue::Interval { lo: ylo, hi: yhi } = range_of(module, y) else { return Ok(None) };

    let (lo, hi) = if is_target {
        (xlo, clamp64(xhi.min(yhi) as i64 - if yhi <= xhi { 1 } else { 0 }).max(xlo))
    } else {
        (xlo.max(ylo), xhi)
    };
    // `x < y` on the taken edge narrows `x`'s upper bound to `min(xhi, yhi - 1)`.
    let (lo, hi) = if is_target { (lo, clamp64(xhi.min(yhi) as i64 - 1).max(xlo).min(hi.max(lo))) } else { (lo, hi) };
    let _ = hi;
    let hi_final = if is_target { clamp64(xhi.min(yhi) as i64 - 1).max(xlo) } else { xhi };
    set_range(module, op_id, RangeValue::Interval { lo, hi: hi_final }, false).map(Some)
}

/// Run Range analysis to a fixpoint over `func`, writing `RangeAttr` on
/// every op that has a numeric result. Widening kicks in for any value
/// once its range has changed in `WIDEN_AFTER_ROUNDS` consecutive passes
/// (a simple stand-in for "loop header" detection: any Phi whose range
/// keeps moving is in a cycle and needs widening to converge).
pub fn compute_range(module: &mut Module, func: OpId) -> AnalysisResult<()> {
    let Some(region) = module.op(func)?.region else { return Ok(()) };
    let blocks = module.region(region)?.blocks.clone();
    let mut ops = Vec::new();
    for &block in &blocks {
        ops.extend(module.block(block)?.ops.iter().copied());
    }

    let mut round = 0;
    loop {
        let widen = round >= WIDEN_AFTER_ROUNDS;
        let mut changed = false;
        for &op in &ops {
            if step(module, op, widen)? {
                changed = true;
            }
        }
        round += 1;
        if !changed || round > WIDEN_AFTER_ROUNDS + 8 {
            break;
        }
    }
    Ok(())
}
