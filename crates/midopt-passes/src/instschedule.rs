//! `InstSchedule` (§4.11): list-scheduling within each basic block, run
//! after `GCM` has already chosen which block every pure op lives in. This
//! pass only reorders ops *inside* a block; it never moves an op across a
//! block boundary.
//!
//! The dependence graph has two edge kinds: intra-block def-use (an
//! operand must issue before its user) and memory edges between a `Store`
//! and any `Load`/`Store` that `may_alias` it, ordered by original program
//! order (a must-alias pair is just the `may_alias` case restricted, so one
//! check covers both per §4.14's alias soundness contract). A ready queue
//! holds every op whose dependencies have already issued; at each step the
//! highest-ranked ready op issues next. Ties keep source order, which the
//! ready queue preserves by construction (ops become ready in the order
//! their last dependency issues, and the scan picks the earliest-queued
//! among equal ranks).

use std::collections::HashMap;

use midopt_analysis::{compute_alias, compute_call_graph, may_alias};
use midopt_ir::{BlockId, Module, Op, OpId, Opcode};

use crate::error::PassResult;
use crate::pass::Pass;

const DELAY_CONST_OR_GLOBAL: i32 = -3000;
const DELAY_SUCCESSOR_PHI_OPERAND: i32 = -5000;
const LOAD_LATENCY_PENALTY_WINDOW: usize = 2;
const LOAD_BONUS: i32 = 8;
/// Per cycle of ready-but-unissued wait, rewarded only for live-in operands
/// (reduces the window an incoming value's register stays occupied).
const LIVE_IN_WAIT_BONUS: i32 = 1;

pub struct InstSchedule;

impl Pass for InstSchedule {
    fn name(&self) -> &'static str {
        "InstSchedule"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let graph = compute_call_graph(module)?;
        compute_alias(module, &graph)?;

        let mut changed = false;
        for func in module.functions() {
            let Some(region) = module.op(func)?.region else { continue };
            let blocks = module.region(region)?.blocks.clone();
            for block in blocks {
                if schedule_block(module, block)? {
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

/// The operand set a user cares about scheduling after, restricted to ops
/// living in the same block (cross-block operands are already placed and
/// need no ordering edge here).
fn local_deps(op: &Op, block: BlockId, index: &HashMap<OpId, (BlockId, usize)>) -> Vec<OpId> {
    op.operands.iter().copied().filter(|&d| index.get(&d).map(|(b, _)| *b == block).unwrap_or(false)).collect()
}

fn schedule_block(module: &mut Module, block: BlockId) -> PassResult<bool> {
    let ops = module.block(block)?.ops.clone();
    if ops.len() <= 2 {
        return Ok(false);
    }
    let Some(terminator) = module.block(block)?.terminator() else { return Ok(false) };
    let body: Vec<OpId> = ops.iter().copied().filter(|&o| o != terminator).collect();
    if body.is_empty() {
        return Ok(false);
    }

    let (phis, rest): (Vec<OpId>, Vec<OpId>) = body.iter().copied().partition(|op_id| module.op(*op_id).map(|o| o.opcode == Opcode::Phi).unwrap_or(false));
    if rest.len() <= 1 {
        return Ok(false);
    }

    let order_index: HashMap<OpId, usize> = rest.iter().enumerate().map(|(i, &o)| (o, i)).collect();
    let mut index: HashMap<OpId, (BlockId, usize)> = HashMap::new();
    for (i, &op_id) in ops.iter().enumerate() {
        index.insert(op_id, (block, i));
    }

    let live_out = module.block(block)?.live_out.clone();
    let successor_phi_operands = successor_phi_operand_set(module, block)?;

    let mut deps: HashMap<OpId, Vec<OpId>> = HashMap::new();
    for &op_id in &rest {
        let op = module.op(op_id)?;
        let mut d = local_deps(op, block, &index);
        if op.opcode == Opcode::Store {
            for &earlier in &rest[..order_index[&op_id]] {
                let earlier_op = module.op(earlier)?;
                if matches!(earlier_op.opcode, Opcode::Load | Opcode::Store) && stores_may_conflict(module, op_id, earlier)? {
                    d.push(earlier);
                }
            }
        } else if op.opcode == Opcode::Load {
            for &earlier in &rest[..order_index[&op_id]] {
                let earlier_op = module.op(earlier)?;
                if earlier_op.opcode == Opcode::Store && stores_may_conflict(module, op_id, earlier)? {
                    d.push(earlier);
                }
            }
        }
        deps.insert(op_id, d);
    }

    let mut remaining: HashMap<OpId, usize> = deps.iter().map(|(&op, d)| (op, d.len())).collect();
    let mut users: HashMap<OpId, Vec<OpId>> = HashMap::new();
    for (&op, d) in &deps {
        for &dep in d {
            users.entry(dep).or_default().push(op);
        }
    }

    let mut ready: Vec<OpId> = rest.iter().copied().filter(|op| remaining[op] == 0).collect();
    let mut wait_since: HashMap<OpId, usize> = ready.iter().map(|&o| (o, 0)).collect();
    let mut issued_at: HashMap<OpId, usize> = HashMap::new();
    let mut schedule: Vec<OpId> = Vec::with_capacity(rest.len());

    let mut cycle = 0usize;
    while !ready.is_empty() {
        let mut best_idx = 0;
        let mut best_rank = i32::MIN;
        for (i, &candidate) in ready.iter().enumerate() {
            let rank = rank_of(module, candidate, block, cycle, &issued_at, &live_out, &successor_phi_operands, wait_since.get(&candidate).copied().unwrap_or(0))?;
            if rank > best_rank || (rank == best_rank && order_index[&candidate] < order_index[&ready[best_idx]]) {
                best_rank = rank;
                best_idx = i;
            }
        }
        let picked = ready.remove(best_idx);
        wait_since.remove(&picked);
        issued_at.insert(picked, cycle);
        schedule.push(picked);
        cycle += 1;

        if let Some(dependents) = users.get(&picked) {
            for &user in dependents {
                let left = remaining.get_mut(&user).unwrap();
                *left -= 1;
                if *left == 0 {
                    ready.push(user);
                    wait_since.insert(user, cycle);
                }
            }
        }
    }

    if schedule == rest {
        return Ok(false);
    }

    let mut new_ops = phis.clone();
    new_ops.extend(schedule);
    new_ops.push(terminator);
    module.block_mut(block)?.ops = new_ops;
    Ok(true)
}

fn stores_may_conflict(module: &Module, a: OpId, b: OpId) -> PassResult<bool> {
    let addr_a = module.op(a)?.operands.last().copied();
    let addr_b = module.op(b)?.operands.last().copied();
    match (addr_a, addr_b) {
        (Some(x), Some(y)) => Ok(may_alias(module, x, y)),
        _ => Ok(true),
    }
}

fn successor_phi_operand_set(module: &Module, block: BlockId) -> PassResult<std::collections::HashSet<OpId>> {
    let mut out = std::collections::HashSet::new();
    for &succ in &module.block(block)?.succs {
        for &op_id in &module.block(succ)?.ops {
            let op = module.op(op_id)?;
            if op.opcode != Opcode::Phi {
                break;
            }
            for (i, &from) in op.phi_incoming.iter().enumerate() {
                if from == block {
                    if let Some(&v) = op.operands.get(i) {
                        out.insert(v);
                    }
                }
            }
        }
    }
    Ok(out)
}

fn rank_of(
    module: &Module,
    op_id: OpId,
    block: BlockId,
    cycle: usize,
    issued_at: &HashMap<OpId, usize>,
    live_out: &std::collections::BTreeSet<OpId>,
    successor_phi_operands: &std::collections::HashSet<OpId>,
    waited: usize,
) -> PassResult<i32> {
    let op = module.op(op_id)?;
    let mut rank: i32 = 0;

    if matches!(op.opcode, Opcode::ConstInt | Opcode::ConstFloat | Opcode::GetGlobal) {
        rank += DELAY_CONST_OR_GLOBAL;
    }
    if successor_phi_operands.contains(&op_id) {
        rank += DELAY_SUCCESSOR_PHI_OPERAND;
    }
    if op.opcode == Opcode::Load {
        rank += LOAD_BONUS;
    }
    for &operand in &op.operands {
        if let Some(&issued) = issued_at.get(&operand) {
            if module.op(operand).map(|o| o.opcode == Opcode::Load).unwrap_or(false) && cycle.saturating_sub(issued) < LOAD_LATENCY_PENALTY_WINDOW {
                rank -= 1;
            }
        }
    }
    let has_live_in_operand = op.operands.iter().any(|o| !in_block(module, *o, block));
    if has_live_in_operand || live_out.contains(&op_id) {
        rank += LIVE_IN_WAIT_BONUS * waited as i32;
    }
    Ok(rank)
}

fn in_block(module: &Module, op: OpId, block: BlockId) -> bool {
    module.op(op).map(|o| o.parent == Some(block)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Attr, Builder as B, Opcode as Op, ValueType as VT};
    use midopt_interp::run;

    fn new_function(m: &mut Module, name: &str) -> (OpId, BlockId) {
        let f = m.alloc_op(Op::Function, VT::I32);
        m.op_mut(f).unwrap().attrs.set(Attr::Name(name.to_string()));
        let region = m.alloc_region();
        m.op_mut(f).unwrap().region = Some(region);
        let top = m.top_block;
        m.block_mut(top).unwrap().append(f);
        m.op_mut(f).unwrap().parent = Some(top);
        let entry = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(entry);
        (f, entry)
    }

    #[test]
    fn constants_delayed_behind_a_load_that_does_not_depend_on_them() {
        let mut m = Module::new();
        let (_f, entry) = new_function(&mut m, "main");
        let mut b = B::at_block_end(&mut m, entry);
        let c = b.const_int(42).unwrap();
        let arr = b.create(Op::Alloca, VT::I64, [], [Attr::Size(4), Attr::Dimension(vec![1])]).unwrap();
        let zero = b.const_int(0).unwrap();
        b.create(Op::Store, VT::Void, [zero, arr], []).unwrap();
        let loaded = b.create(Op::Load, VT::I32, [arr], []).unwrap();
        let sum = b.create(Op::AddI, VT::I32, [loaded, c], []).unwrap();
        b.ret(Some(sum)).unwrap();

        let before = m.block(entry).unwrap().ops.clone();
        let mut pass = InstSchedule;
        pass.run(&mut m).unwrap();
        let after = m.block(entry).unwrap().ops.clone();
        assert_ne!(before, after);
        let load_pos = after.iter().position(|&o| o == loaded).unwrap();
        let const_pos = after.iter().position(|&o| o == c).unwrap();
        assert!(load_pos < const_pos);

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 42);
    }

    #[test]
    fn single_op_block_is_left_alone() {
        let mut m = Module::new();
        let (_f, entry) = new_function(&mut m, "main");
        let mut b = B::at_block_end(&mut m, entry);
        let c = b.const_int(1).unwrap();
        b.ret(Some(c)).unwrap();

        let mut pass = InstSchedule;
        let changed = pass.run(&mut m).unwrap();
        assert!(!changed);
    }
}
