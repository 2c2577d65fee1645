//! CDCL SAT core: two-watched-literal unit propagation, 1-UIP conflict
//! analysis with clause learning, VSIDS variable activity, phase saving,
//! and non-chronological backtracking.
//!
//! Literals are signed `i32`s, one-indexed (`3` is variable 3 true, `-3` is
//! variable 3 false), matching the DIMACS convention the parser hands us.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

const VAR_ACTIVITY_RESCALE: f64 = 1e100;
const VAR_ACTIVITY_DECAY: f64 = 0.95;

fn var_of(lit: i32) -> usize {
    (lit.unsigned_abs() - 1) as usize
}

fn is_positive(lit: i32) -> bool {
    lit > 0
}

/// Index into the watch-list table: two slots per variable, one per phase.
fn watch_index(lit: i32) -> usize {
    let v = var_of(lit) * 2;
    if is_positive(lit) {
        v
    } else {
        v + 1
    }
}

#[derive(Debug, Clone)]
struct Clause {
    lits: Vec<i32>,
    learned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct HeapEntry {
    activity: f64,
    var: usize,
}

impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.activity.partial_cmp(&other.activity).unwrap_or(Ordering::Equal)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SatResult {
    Sat(Vec<bool>),
    Unsat,
}

pub struct Solver {
    num_vars: usize,
    clauses: Vec<Clause>,
    watches: Vec<Vec<usize>>,
    assignment: Vec<Option<bool>>,
    phase: Vec<Option<bool>>,
    trail: Vec<i32>,
    trail_lim: Vec<usize>,
    reason: Vec<Option<usize>>,
    level: Vec<i32>,
    activity: Vec<f64>,
    var_inc: f64,
    order: BinaryHeap<HeapEntry>,
    in_heap: Vec<bool>,
}

impl Solver {
    pub fn new(num_vars: usize) -> Self {
        Solver {
            num_vars,
            clauses: Vec::new(),
            watches: vec![Vec::new(); num_vars * 2],
            assignment: vec![None; num_vars],
            phase: vec![None; num_vars],
            trail: Vec::new(),
            trail_lim: Vec::new(),
            reason: vec![None; num_vars],
            level: vec![-1; num_vars],
            activity: vec![0.0; num_vars],
            var_inc: 1.0,
            order: BinaryHeap::new(),
            in_heap: vec![false; num_vars],
        }
    }

    fn ensure_capacity(&mut self, var: usize) {
        if var >= self.num_vars {
            let grow = var + 1 - self.num_vars;
            self.watches.extend(std::iter::repeat_with(Vec::new).take(grow * 2));
            self.assignment.extend(std::iter::repeat(None).take(grow));
            self.phase.extend(std::iter::repeat(None).take(grow));
            self.reason.extend(std::iter::repeat(None).take(grow));
            self.level.extend(std::iter::repeat(-1).take(grow));
            self.activity.extend(std::iter::repeat(0.0).take(grow));
            self.in_heap.extend(std::iter::repeat(false).take(grow));
            self.num_vars = var + 1;
        }
    }

    /// Allocate a fresh variable, growing internal capacity, and return its
    /// positive 1-based DIMACS literal. Used by the bit-vector layer to mint
    /// one literal per bit (and per Tseitin gate output) on top of whatever
    /// clauses were loaded from a DIMACS file.
    pub fn fresh_var(&mut self) -> i32 {
        let v = self.num_vars;
        self.ensure_capacity(v);
        (v + 1) as i32
    }

    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    pub fn add_clause(&mut self, lits: Vec<i32>) {
        for &l in &lits {
            self.ensure_capacity(var_of(l));
        }
        let idx = self.clauses.len();
        if lits.len() >= 2 {
            let w0 = watch_index(lits[0]);
            let w1 = watch_index(lits[1]);
            self.watches[w0].push(idx);
            self.watches[w1].push(idx);
        }
        self.clauses.push(Clause { lits, learned: false });
    }

    fn value_of(&self, lit: i32) -> Option<bool> {
        self.assignment[var_of(lit)].map(|a| a == is_positive(lit))
    }

    fn decision_level(&self) -> usize {
        self.trail_lim.len()
    }

    fn push_to_heap(&mut self, var: usize) {
        if !self.in_heap[var] {
            self.in_heap[var] = true;
            self.order.push(HeapEntry { activity: self.activity[var], var });
        }
    }

    fn bump_var(&mut self, var: usize) {
        self.activity[var] += self.var_inc;
        if self.activity[var] > VAR_ACTIVITY_RESCALE {
            for a in self.activity.iter_mut() {
                *a /= VAR_ACTIVITY_RESCALE;
            }
            self.var_inc /= VAR_ACTIVITY_RESCALE;
        }
        self.push_to_heap(var);
    }

    fn decay_activity(&mut self) {
        self.var_inc /= VAR_ACTIVITY_DECAY;
    }

    fn assign(&mut self, lit: i32, reason: Option<usize>) {
        let v = var_of(lit);
        self.assignment[v] = Some(is_positive(lit));
        self.phase[v] = Some(is_positive(lit));
        self.reason[v] = reason;
        self.level[v] = self.decision_level() as i32;
        self.trail.push(lit);
    }

    /// Unit propagation. Returns the index of a violated clause, if any.
    fn propagate(&mut self) -> Option<usize> {
        let mut i = 0;
        while i < self.trail.len() {
            let p = self.trail[i];
            i += 1;
            let falsified_watch = watch_index(-p);
            let candidates = std::mem::take(&mut self.watches[falsified_watch]);
            let mut kept = Vec::with_capacity(candidates.len());
            let mut conflict = None;
            for (idx_pos, &clause_idx) in candidates.iter().enumerate() {
                if conflict.is_some() {
                    kept.extend_from_slice(&candidates[idx_pos..]);
                    break;
                }
                let moved = self.propagate_clause(clause_idx, -p, &mut kept);
                if let Some(c) = moved {
                    conflict = Some(c);
                }
            }
            self.watches[falsified_watch] = kept;
            if let Some(c) = conflict {
                return Some(c);
            }
        }
        None
    }

    /// Try to keep `clause_idx` satisfied given that `false_lit` just became
    /// false. Pushes the clause back onto the watch list it should live on
    /// (`kept` belongs to the watch list for `false_lit`'s negation). Returns
    /// `Some(clause_idx)` if the clause is now a conflict.
    fn propagate_clause(&mut self, clause_idx: usize, false_lit: i32, kept: &mut Vec<usize>) -> Option<usize> {
        let lits_len = self.clauses[clause_idx].lits.len();
        if lits_len < 2 {
            kept.push(clause_idx);
            return None;
        }
        // Normalize so lits[0] is the watched literal equal to `false_lit`.
        if self.clauses[clause_idx].lits[0] != false_lit {
            self.clauses[clause_idx].lits.swap(0, 1);
        }
        let other_watch = self.clauses[clause_idx].lits[1];
        if self.value_of(other_watch) == Some(true) {
            kept.push(clause_idx);
            return None;
        }
        for i in 2..lits_len {
            let cand = self.clauses[clause_idx].lits[i];
            if self.value_of(cand) != Some(false) {
                self.clauses[clause_idx].lits.swap(0, i);
                self.watches[watch_index(cand)].push(clause_idx);
                return None;
            }
        }
        // No replacement watch found: clause is unit or conflicting on other_watch.
        kept.push(clause_idx);
        match self.value_of(other_watch) {
            Some(false) => Some(clause_idx),
            _ => {
                self.assign(other_watch, Some(clause_idx));
                None
            }
        }
    }

    /// 1-UIP conflict analysis. Returns the learned clause and the level to
    /// backtrack to.
    fn analyze(&mut self, conflict_idx: usize) -> (Vec<i32>, usize) {
        let mut seen = vec![false; self.num_vars];
        let mut learned: Vec<i32> = Vec::new();
        let mut counter = 0;
        let mut p: Option<i32> = None;
        let mut trail_idx = self.trail.len();
        let mut reason_idx = conflict_idx;

        loop {
            let reason_lits = self.clauses[reason_idx].lits.clone();
            for &q in &reason_lits {
                if Some(q) == p {
                    continue;
                }
                let v = var_of(q);
                if seen[v] {
                    continue;
                }
                seen[v] = true;
                self.bump_var(v);
                if self.level[v] as usize >= self.decision_level() {
                    counter += 1;
                } else if self.level[v] >= 0 {
                    learned.push(q);
                }
            }
            loop {
                trail_idx -= 1;
                let lit = self.trail[trail_idx];
                if seen[var_of(lit)] {
                    p = Some(lit);
                    break;
                }
            }
            seen[var_of(p.unwrap())] = false;
            counter -= 1;
            if counter == 0 {
                break;
            }
            reason_idx = self.reason[var_of(p.unwrap())].expect("1-UIP walk hit a decision before counter reached 0");
        }

        learned.insert(0, -p.unwrap());
        let backtrack_level = learned.iter().skip(1).map(|&l| self.level[var_of(l)]).max().map(|l| l.max(0) as usize).unwrap_or(0);
        self.decay_activity();
        (learned, backtrack_level)
    }

    fn backtrack_to(&mut self, level: usize) {
        if self.decision_level() <= level {
            return;
        }
        let lim = self.trail_lim[level];
        for lit in self.trail.drain(lim..) {
            let v = var_of(lit);
            self.assignment[v] = None;
            self.reason[v] = None;
            self.level[v] = -1;
            self.push_to_heap(v);
        }
        self.trail_lim.truncate(level);
    }

    fn pick_branch_var(&mut self) -> Option<usize> {
        while let Some(entry) = self.order.pop() {
            if self.assignment[entry.var].is_none() {
                self.in_heap[entry.var] = false;
                return Some(entry.var);
            }
        }
        None
    }

    pub fn solve(&mut self) -> SatResult {
        for v in 0..self.num_vars {
            self.push_to_heap(v);
        }
        for idx in 0..self.clauses.len() {
            if self.clauses[idx].lits.len() == 1 {
                let lit = self.clauses[idx].lits[0];
                if self.value_of(lit) == Some(false) {
                    return SatResult::Unsat;
                }
                if self.value_of(lit).is_none() {
                    self.assign(lit, Some(idx));
                }
            }
        }

        loop {
            if let Some(conflict) = self.propagate() {
                if self.decision_level() == 0 {
                    return SatResult::Unsat;
                }
                let (learned, backtrack_level) = self.analyze(conflict);
                self.backtrack_to(backtrack_level);
                let asserting = learned[0];
                let learned_idx = self.clauses.len();
                if learned.len() >= 2 {
                    let w0 = watch_index(learned[0]);
                    let w1 = watch_index(learned[1]);
                    self.watches[w0].push(learned_idx);
                    self.watches[w1].push(learned_idx);
                }
                self.clauses.push(Clause { lits: learned, learned: true });
                self.assign(asserting, Some(learned_idx));
                continue;
            }

            let Some(var) = self.pick_branch_var() else {
                return SatResult::Sat(self.assignment.iter().map(|a| a.unwrap_or(false)).collect());
            };
            self.trail_lim.push(self.trail.len());
            let phase = self.phase[var].unwrap_or(true);
            let lit = if phase { (var + 1) as i32 } else { -((var + 1) as i32) };
            self.assign(lit, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trivial_satisfiable_instance() {
        let mut s = Solver::new(2);
        s.add_clause(vec![1, 2]);
        s.add_clause(vec![-1, -2]);
        match s.solve() {
            SatResult::Sat(assignment) => {
                assert_ne!(assignment[0], assignment[1]);
            }
            SatResult::Unsat => panic!("expected sat"),
        }
    }

    #[test]
    fn contradictory_unit_clauses_are_unsat() {
        let mut s = Solver::new(1);
        s.add_clause(vec![1]);
        s.add_clause(vec![-1]);
        assert_eq!(s.solve(), SatResult::Unsat);
    }

    #[test]
    fn pigeonhole_two_into_one_is_unsat() {
        // p1 v p2 both need hole 1: (p1) & (p2) & (-p1 v -p2) is unsat.
        let mut s = Solver::new(2);
        s.add_clause(vec![1]);
        s.add_clause(vec![2]);
        s.add_clause(vec![-1, -2]);
        assert_eq!(s.solve(), SatResult::Unsat);
    }
}
