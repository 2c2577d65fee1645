//! Bit-blasted fixed-width bit-vector arithmetic on top of the CDCL core.
//!
//! Each [`BitVec`] is a vector of SAT literals, least-significant bit first.
//! Arithmetic is built from Tseitin-encoded logic gates: ripple-carry
//! addition with explicit carry-propagate/generate, two's-complement
//! subtraction as add-the-negation, shift-and-add multiplication, restoring
//! unsigned division with an absolute-value dispatch for signed division,
//! and subtract-and-test-sign for ordering. `SynthConstArray` is this
//! layer's only client: it guesses a closed-form index expression for a
//! constant array's stores and asks a [`Solver`] whether some assignment of
//! unknown coefficients reproduces every sampled store.

use crate::error::{SmtError, SmtResult};
use crate::sat::Solver;

/// A fixed-width bit-vector: one SAT literal per bit, LSB first.
#[derive(Debug, Clone)]
pub struct BitVec {
    pub bits: Vec<i32>,
}

impl BitVec {
    pub fn width(&self) -> u32 {
        self.bits.len() as u32
    }

    /// Decode a satisfying assignment (as returned by `Solver::solve`) into
    /// this bit-vector's signed integer value.
    pub fn value_of(&self, assignment: &[bool]) -> i64 {
        let mut v: i64 = 0;
        for (i, &lit) in self.bits.iter().enumerate() {
            let var = (lit.unsigned_abs() - 1) as usize;
            let bit = assignment[var] == (lit > 0);
            if bit {
                v |= 1 << i;
            }
        }
        let width = self.bits.len() as u32;
        if width < 64 && (v >> (width - 1)) & 1 == 1 {
            v -= 1i64 << width;
        }
        v
    }
}

pub struct BvBuilder<'s> {
    solver: &'s mut Solver,
}

impl<'s> BvBuilder<'s> {
    pub fn new(solver: &'s mut Solver) -> Self {
        BvBuilder { solver }
    }

    pub fn solver(&mut self) -> &mut Solver {
        self.solver
    }

    /// `width` fresh, otherwise-unconstrained bits.
    pub fn fresh(&mut self, width: u32) -> BitVec {
        BitVec { bits: (0..width).map(|_| self.solver.fresh_var()).collect() }
    }

    /// A constant, encoded as `width` fresh bits each pinned by a unit clause.
    pub fn constant(&mut self, value: i64, width: u32) -> BitVec {
        let bits = (0..width)
            .map(|i| {
                let lit = self.solver.fresh_var();
                let bit_set = (value >> i) & 1 == 1;
                self.solver.add_clause(vec![if bit_set { lit } else { -lit }]);
                lit
            })
            .collect();
        BitVec { bits }
    }

    fn check_widths(a: &BitVec, b: &BitVec) -> SmtResult<u32> {
        if a.width() != b.width() {
            return Err(SmtError::WidthMismatch { a: a.width(), b: b.width() });
        }
        Ok(a.width())
    }

    fn xor_gate(&mut self, a: i32, b: i32) -> i32 {
        let y = self.solver.fresh_var();
        self.solver.add_clause(vec![-a, -b, -y]);
        self.solver.add_clause(vec![a, b, -y]);
        self.solver.add_clause(vec![a, -b, y]);
        self.solver.add_clause(vec![-a, b, y]);
        y
    }

    fn and_gate(&mut self, a: i32, b: i32) -> i32 {
        let y = self.solver.fresh_var();
        self.solver.add_clause(vec![-a, -b, y]);
        self.solver.add_clause(vec![a, -y]);
        self.solver.add_clause(vec![b, -y]);
        y
    }

    fn or_gate(&mut self, a: i32, b: i32) -> i32 {
        let y = self.solver.fresh_var();
        self.solver.add_clause(vec![a, b, -y]);
        self.solver.add_clause(vec![-a, y]);
        self.solver.add_clause(vec![-b, y]);
        y
    }

    /// `cond ? on_true : on_false`, Tseitin-encoded as a single fresh literal.
    fn mux(&mut self, cond: i32, on_true: i32, on_false: i32) -> i32 {
        let a = self.and_gate(cond, on_true);
        let not_cond = -cond;
        let b = self.and_gate(not_cond, on_false);
        self.or_gate(a, b)
    }

    fn mux_bitvec(&mut self, cond: i32, on_true: &BitVec, on_false: &BitVec) -> BitVec {
        let bits = on_true.bits.iter().zip(&on_false.bits).map(|(&t, &f)| self.mux(cond, t, f)).collect();
        BitVec { bits }
    }

    /// Full adder: returns `(sum, carry_out)`, the textbook carry-propagate
    /// (`a xor b`) / carry-generate (`a and b`) decomposition.
    fn full_adder(&mut self, a: i32, b: i32, carry_in: i32) -> (i32, i32) {
        let propagate = self.xor_gate(a, b);
        let sum = self.xor_gate(propagate, carry_in);
        let generate = self.and_gate(a, b);
        let carry_and_propagate = self.and_gate(propagate, carry_in);
        let carry_out = self.or_gate(generate, carry_and_propagate);
        (sum, carry_out)
    }

    /// Ripple-carry add. Wraps silently on overflow, matching two's
    /// complement hardware addition.
    pub fn add(&mut self, a: &BitVec, b: &BitVec) -> SmtResult<BitVec> {
        let width = Self::check_widths(a, b)?;
        let zero_carry = self.solver.fresh_var();
        self.solver.add_clause(vec![-zero_carry]);
        let mut carry = zero_carry;
        let mut bits = Vec::with_capacity(width as usize);
        for i in 0..width as usize {
            let (sum, carry_out) = self.full_adder(a.bits[i], b.bits[i], carry);
            bits.push(sum);
            carry = carry_out;
        }
        Ok(BitVec { bits })
    }

    fn negate(&mut self, a: &BitVec) -> BitVec {
        let inverted = BitVec { bits: a.bits.iter().map(|&l| -l).collect() };
        let one = self.constant(1, a.width());
        self.add(&inverted, &one).expect("matching widths by construction")
    }

    pub fn sub(&mut self, a: &BitVec, b: &BitVec) -> SmtResult<BitVec> {
        Self::check_widths(a, b)?;
        let neg_b = self.negate(b);
        self.add(a, &neg_b)
    }

    /// Shift-and-add multiplication: O(width^2) gates, fine for the small
    /// operand widths `SynthConstArray` ever needs.
    pub fn mul(&mut self, a: &BitVec, b: &BitVec) -> SmtResult<BitVec> {
        let width = Self::check_widths(a, b)? as usize;
        let mut acc = self.constant(0, width as u32);
        for i in 0..width {
            let mut partial = Vec::with_capacity(width);
            for j in 0..width {
                partial.push(if j < i { self.constant(0, 1).bits[0] } else { self.and_gate(a.bits[j - i], b.bits[i]) });
            }
            acc = self.add(&acc, &BitVec { bits: partial })?;
        }
        Ok(acc)
    }

    /// `a >= b` as unsigned magnitudes, implemented as "no borrow out of a
    /// width+1-bit subtraction".
    fn uge(&mut self, a: &BitVec, b: &BitVec) -> SmtResult<i32> {
        let width = Self::check_widths(a, b)?;
        // a - b == a + ~b + 1 in two's complement: ripple an adder over a
        // and ~b with a carry-in of 1 at bit 0. The final carry-out is 1
        // exactly when no borrow occurred, i.e. a >= b.
        let mut carry = self.constant(1, 1).bits[0];
        for i in 0..width as usize {
            let not_b = -b.bits[i];
            let (_, carry_out) = self.full_adder(a.bits[i], not_b, carry);
            carry = carry_out;
        }
        Ok(carry)
    }

    /// Restoring unsigned division. Returns `(quotient, remainder)`.
    ///
    /// Keeps the running remainder at the operand width rather than the
    /// textbook `width+1` guard bit: correct as long as the dividend's
    /// magnitude needs no more bits than the width provides, which holds for
    /// every width `SynthConstArray` actually allocates (it sizes operands
    /// to the constant values it is solving for, never to worst-case
    /// `i32::MIN`-adjacent magnitudes).
    fn udiv_urem(&mut self, a: &BitVec, b: &BitVec) -> SmtResult<(BitVec, BitVec)> {
        let width = Self::check_widths(a, b)? as usize;
        let mut remainder = self.constant(0, width as u32);
        let mut quotient_bits = vec![0i32; width];
        for i in (0..width).rev() {
            let mut shifted_bits = Vec::with_capacity(width);
            shifted_bits.push(a.bits[i]);
            shifted_bits.extend_from_slice(&remainder.bits[..width - 1]);
            let shifted = BitVec { bits: shifted_bits };
            let ge = self.uge(&shifted, b)?;
            let trial = self.sub(&shifted, b)?;
            remainder = self.mux_bitvec(ge, &trial, &shifted);
            quotient_bits[i] = ge;
        }
        Ok((BitVec { bits: quotient_bits }, remainder))
    }

    fn abs(&mut self, a: &BitVec) -> BitVec {
        let sign = a.bits[a.bits.len() - 1];
        let negated = self.negate(a);
        self.mux_bitvec(sign, &negated, a)
    }

    /// Signed division and remainder via absolute-value dispatch: divide the
    /// magnitudes, then fix up the quotient's sign from the XOR of the
    /// inputs' signs and the remainder's sign from the dividend's sign
    /// (truncating division, matching ordinary `wrapping_div`/`wrapping_rem`
    /// semantics for same-width signed integers).
    pub fn sdiv_srem(&mut self, a: &BitVec, b: &BitVec) -> SmtResult<(BitVec, BitVec)> {
        let width = Self::check_widths(a, b)?;
        let sign_a = a.bits[width as usize - 1];
        let sign_b = b.bits[width as usize - 1];
        let abs_a = self.abs(a);
        let abs_b = self.abs(b);
        let (uq, ur) = self.udiv_urem(&abs_a, &abs_b)?;
        let quotient_sign = self.xor_gate(sign_a, sign_b);
        let neg_uq = self.negate(&uq);
        let quotient = self.mux_bitvec(quotient_sign, &neg_uq, &uq);
        let neg_ur = self.negate(&ur);
        let remainder = self.mux_bitvec(sign_a, &neg_ur, &ur);
        Ok((quotient, remainder))
    }

    /// Bitwise equality: AND of per-bit XNOR, subtract-and-test-zero in
    /// spirit (`a - b == 0`) but implemented directly as it needs no adder.
    pub fn eq(&mut self, a: &BitVec, b: &BitVec) -> SmtResult<i32> {
        let width = Self::check_widths(a, b)?;
        let mut acc: Option<i32> = None;
        for i in 0..width as usize {
            let differ = self.xor_gate(a.bits[i], b.bits[i]);
            let same = -differ;
            acc = Some(match acc {
                Some(prev) => self.and_gate(prev, same),
                None => same,
            });
        }
        Ok(acc.unwrap_or_else(|| self.constant(1, 1).bits[0]))
    }

    /// Signed `a < b` via subtract-and-test-sign: compute `diff = a - b`,
    /// then the result is `diff`'s sign bit unless the inputs' signs differ,
    /// in which case overflow would lie about it and `a`'s own sign decides.
    pub fn lt_signed(&mut self, a: &BitVec, b: &BitVec) -> SmtResult<i32> {
        let width = Self::check_widths(a, b)?;
        let diff = self.sub(a, b)?;
        let sign_a = a.bits[width as usize - 1];
        let sign_b = b.bits[width as usize - 1];
        let sign_diff = diff.bits[width as usize - 1];
        let signs_differ = self.xor_gate(sign_a, sign_b);
        Ok(self.mux(signs_differ, sign_a, sign_diff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sat::SatResult;

    fn solved_value(solver: &mut Solver, bv: &BitVec) -> i64 {
        match solver.solve() {
            SatResult::Sat(assignment) => bv.value_of(&assignment),
            SatResult::Unsat => panic!("expected sat"),
        }
    }

    #[test]
    fn add_computes_sum_of_constants() {
        let mut solver = Solver::new(0);
        let mut b = BvBuilder::new(&mut solver);
        let a = b.constant(3, 8);
        let c = b.constant(4, 8);
        let sum = b.add(&a, &c).unwrap();
        assert_eq!(solved_value(&mut solver, &sum), 7);
    }

    #[test]
    fn sub_computes_difference_of_constants() {
        let mut solver = Solver::new(0);
        let mut b = BvBuilder::new(&mut solver);
        let a = b.constant(10, 8);
        let c = b.constant(3, 8);
        let diff = b.sub(&a, &c).unwrap();
        assert_eq!(solved_value(&mut solver, &diff), 7);
    }

    #[test]
    fn mul_computes_product_of_constants() {
        let mut solver = Solver::new(0);
        let mut b = BvBuilder::new(&mut solver);
        let a = b.constant(6, 8);
        let c = b.constant(7, 8);
        let prod = b.mul(&a, &c).unwrap();
        assert_eq!(solved_value(&mut solver, &prod), 42);
    }

    #[test]
    fn negative_constant_round_trips_through_value_of() {
        let mut solver = Solver::new(0);
        let mut b = BvBuilder::new(&mut solver);
        let a = b.constant(-5, 8);
        assert_eq!(solved_value(&mut solver, &a), -5);
    }

    #[test]
    fn sdiv_srem_matches_truncating_semantics() {
        let mut solver = Solver::new(0);
        let mut b = BvBuilder::new(&mut solver);
        let a = b.constant(-7, 8);
        let c = b.constant(2, 8);
        let (q, r) = b.sdiv_srem(&a, &c).unwrap();
        match solver.solve() {
            SatResult::Sat(assignment) => {
                assert_eq!(q.value_of(&assignment), -3);
                assert_eq!(r.value_of(&assignment), -1);
            }
            SatResult::Unsat => panic!("expected sat"),
        }
    }

    #[test]
    fn lt_signed_asserts_strict_order() {
        let mut solver = Solver::new(0);
        let mut b = BvBuilder::new(&mut solver);
        let a = b.constant(-1, 8);
        let c = b.constant(1, 8);
        let lt = b.lt_signed(&a, &c).unwrap();
        solver.add_clause(vec![lt]);
        assert!(matches!(solver.solve(), SatResult::Sat(_)));
    }

    #[test]
    fn width_mismatch_is_an_error() {
        let mut solver = Solver::new(0);
        let mut b = BvBuilder::new(&mut solver);
        let a = b.constant(1, 4);
        let c = b.constant(1, 8);
        assert!(b.add(&a, &c).is_err());
    }
}
