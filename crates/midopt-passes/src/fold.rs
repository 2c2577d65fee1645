//! `EarlyConstFold`/`RegularFold`: algebraic simplification and constant
//! folding over a fixed rule set. Both names share this one rule table;
//! `RegularFold` is just this same pass re-invoked to a fixpoint by the
//! Pass Manager as other passes expose fresh constants.

use midopt_ir::{Attr, AttrKind, Builder, Module, OpId, Opcode, ValueType};

use crate::error::PassResult;
use crate::pass::Pass;

fn const_int(module: &Module, op: OpId) -> Option<i32> {
    let o = module.op(op).ok()?;
    if o.opcode == Opcode::ConstInt {
        o.attr(AttrKind::Int).and_then(Attr::as_int)
    } else {
        None
    }
}

fn const_float(module: &Module, op: OpId) -> Option<f32> {
    let o = module.op(op).ok()?;
    if o.opcode == Opcode::ConstFloat {
        o.attr(AttrKind::Float).and_then(Attr::as_float)
    } else {
        None
    }
}

fn is_pow2(v: i32) -> Option<u32> {
    if v > 0 && (v as u32).is_power_of_two() {
        Some((v as u32).trailing_zeros())
    } else {
        None
    }
}

/// Try to fold or algebraically simplify one op. Returns `Some` if the op
/// should be replaced by a new `ConstInt`/`ConstFloat`/operand-forwarding
/// rewrite, expressed as a builder closure result (the new op id).
fn try_fold(module: &mut Module, op_id: OpId) -> PassResult<Option<OpId>> {
    let op = module.op(op_id)?.clone();
    if op.operands.len() > 2 {
        return Ok(None);
    }
    let parent = match op.parent {
        Some(p) => p,
        None => return Ok(None),
    };

    macro_rules! fold_int {
        ($f:expr) => {{
            if let (Some(a), Some(b)) = (op.operands.first().and_then(|&o| const_int(module, o)), op.operands.get(1).and_then(|&o| const_int(module, o))) {
                let f: fn(i32, i32) -> i32 = $f;
                let mut b_ = Builder::before(module, op_id);
                return Ok(Some(b_.const_int(f(a, b))?));
            }
        }};
    }

    match op.opcode {
        Opcode::AddI => {
            fold_int!(|a, b| a.wrapping_add(b));
            if let Some(0) = op.operands.get(1).and_then(|&o| const_int(module, o)) {
                return Ok(Some(op.operands[0]));
            }
            if let Some(0) = op.operands.first().and_then(|&o| const_int(module, o)) {
                return Ok(Some(op.operands[1]));
            }
        }
        Opcode::SubI => {
            fold_int!(|a, b| a.wrapping_sub(b));
            if let Some(0) = op.operands.get(1).and_then(|&o| const_int(module, o)) {
                return Ok(Some(op.operands[0]));
            }
        }
        Opcode::MulI => {
            fold_int!(|a, b| a.wrapping_mul(b));
            for (i, &operand) in op.operands.iter().enumerate() {
                let other = op.operands[1 - i];
                match const_int(module, operand) {
                    Some(0) => {
                        let mut b_ = Builder::before(module, op_id);
                        return Ok(Some(b_.const_int(0)?));
                    }
                    Some(1) => return Ok(Some(other)),
                    Some(v) => {
                        if let Some(shift) = is_pow2(v) {
                            let mut b_ = Builder::before(module, op_id);
                            let amt = b_.const_int(shift as i32)?;
                            return Ok(Some(b_.create(Opcode::ShlI, ValueType::I32, [other, amt], [])?));
                        }
                    }
                    None => {}
                }
            }
        }
        Opcode::DivI => {
            fold_int!(|a, b| if b == 0 { 0 } else { a.wrapping_div(b) });
            if let Some(1) = op.operands.get(1).and_then(|&o| const_int(module, o)) {
                return Ok(Some(op.operands[0]));
            }
        }
        Opcode::ModI => fold_int!(|a, b| if b == 0 { 0 } else { a.wrapping_rem(b) }),
        Opcode::AndI => {
            fold_int!(|a, b| a & b);
            for (i, &operand) in op.operands.iter().enumerate() {
                if const_int(module, operand) == Some(0) {
                    let mut b_ = Builder::before(module, op_id);
                    return Ok(Some(b_.const_int(0)?));
                }
                if const_int(module, operand) == Some(-1) {
                    return Ok(Some(op.operands[1 - i]));
                }
            }
        }
        Opcode::OrI => {
            fold_int!(|a, b| a | b);
            for (i, &operand) in op.operands.iter().enumerate() {
                if const_int(module, operand) == Some(0) {
                    return Ok(Some(op.operands[1 - i]));
                }
            }
        }
        Opcode::XorI => fold_int!(|a, b| a ^ b),
        Opcode::ShlI => fold_int!(|a, b| a.wrapping_shl(b as u32 & 31)),
        Opcode::LShrI => fold_int!(|a, b| ((a as u32).wrapping_shr(b as u32 & 31)) as i32),
        Opcode::AShrI => fold_int!(|a, b| a.wrapping_shr(b as u32 & 31)),
        Opcode::EqI => fold_int!(|a, b| (a == b) as i32),
        Opcode::NeI => fold_int!(|a, b| (a != b) as i32),
        Opcode::LtI => fold_int!(|a, b| (a < b) as i32),
        Opcode::LeI => fold_int!(|a, b| (a <= b) as i32),
        Opcode::GtI => fold_int!(|a, b| (a > b) as i32),
        Opcode::GeI => fold_int!(|a, b| (a >= b) as i32),
        Opcode::NegI => {
            if let Some(a) = op.operands.first().and_then(|&o| const_int(module, o)) {
                let mut b_ = Builder::before(module, op_id);
                return Ok(Some(b_.const_int(a.wrapping_neg())?));
            }
        }
        Opcode::NotI => {
            if let Some(a) = op.operands.first().and_then(|&o| const_int(module, o)) {
                let mut b_ = Builder::before(module, op_id);
                return Ok(Some(b_.const_int(!a)?));
            }
        }
        Opcode::AddF => {
            if let (Some(a), Some(b)) = (op.operands.first().and_then(|&o| const_float(module, o)), op.operands.get(1).and_then(|&o| const_float(module, o))) {
                let mut b_ = Builder::before(module, op_id);
                return Ok(Some(b_.const_float(a + b)?));
            }
        }
        Opcode::MulF => {
            if let (Some(a), Some(b)) = (op.operands.first().and_then(|&o| const_float(module, o)), op.operands.get(1).and_then(|&o| const_float(module, o))) {
                let mut b_ = Builder::before(module, op_id);
                return Ok(Some(b_.const_float(a * b)?));
            }
        }
        Opcode::Select => {
            if let Some(cond) = op.operands.first().and_then(|&o| const_int(module, o)) {
                return Ok(Some(if cond != 0 { op.operands[1] } else { op.operands[2] }));
            }
        }
        _ => {}
    }
    let _ = parent;
    Ok(None)
}

pub struct FoldPass {
    pub name: &'static str,
}

impl FoldPass {
    pub fn early() -> Self {
        FoldPass { name: "EarlyConstFold" }
    }
    pub fn regular() -> Self {
        FoldPass { name: "RegularFold" }
    }
}

impl Pass for FoldPass {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        let candidates = module.find_all(|op| {
            matches!(
                op,
                Opcode::AddI
                    | Opcode::SubI
                    | Opcode::MulI
                    | Opcode::DivI
                    | Opcode::ModI
                    | Opcode::AndI
                    | Opcode::OrI
                    | Opcode::XorI
                    | Opcode::ShlI
                    | Opcode::LShrI
                    | Opcode::AShrI
                    | Opcode::EqI
                    | Opcode::NeI
                    | Opcode::LtI
                    | Opcode::LeI
                    | Opcode::GtI
                    | Opcode::GeI
                    | Opcode::NegI
                    | Opcode::NotI
                    | Opcode::AddF
                    | Opcode::MulF
                    | Opcode::Select
            )
        })?;
        for op_id in candidates {
            if module.op(op_id).is_err() {
                continue;
            }
            if let Some(replacement) = try_fold(module, op_id)? {
                if replacement != op_id {
                    module.replace_all_uses_with(op_id, replacement)?;
                    if module.op(op_id)?.uses.is_empty() {
                        module.erase_op(op_id)?;
                    }
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}
