//! DIMACS-like CNF parsing for the standalone `--sat` solver mode.
//!
//! Format: optional `c`-prefixed comment lines, then a header line
//! `p cnf <vars> <clauses>`, then one clause per line of signed integers
//! terminated by `0`. The header's vars/clauses counts are read but not
//! enforced -- clauses are free to mention any variable, and the actual
//! clause count is whatever followed the header, not whatever the header
//! claimed.

use crate::error::{SmtError, SmtResult};
use crate::sat::Solver;

pub struct Cnf {
    pub declared_vars: usize,
    pub clauses: Vec<Vec<i32>>,
}

pub fn parse(input: &str) -> SmtResult<Cnf> {
    let mut declared_vars = 0usize;
    let mut clauses = Vec::new();
    let mut pending: Vec<i32> = Vec::new();

    for (line_no, raw_line) in input.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('c') {
            continue;
        }
        if line.starts_with('p') {
            let mut tokens = line.split_whitespace();
            tokens.next(); // "p"
            tokens.next(); // "cnf" (lenient: not checked)
            declared_vars = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(0);
            continue;
        }
        for token in line.split_whitespace() {
            let lit: i32 = token.parse().map_err(|_| SmtError::Dimacs { line: line_no + 1, message: format!("not an integer: '{token}'") })?;
            if lit == 0 {
                clauses.push(std::mem::take(&mut pending));
            } else {
                pending.push(lit);
            }
        }
    }
    if !pending.is_empty() {
        return Err(SmtError::Dimacs { line: input.lines().count(), message: "clause not terminated by 0".to_string() });
    }
    Ok(Cnf { declared_vars, clauses })
}

/// Build a [`Solver`] pre-loaded with every clause from a parsed [`Cnf`].
pub fn solver_for(cnf: &Cnf) -> Solver {
    let num_vars = cnf.declared_vars.max(cnf.clauses.iter().flatten().map(|&l| l.unsigned_abs() as usize).max().unwrap_or(0));
    let mut solver = Solver::new(num_vars);
    for clause in &cnf.clauses {
        solver.add_clause(clause.clone());
    }
    solver
}
