//! The tree-walking interpreter: `run(module, stdin) -> (stdout, exit_code)`.
//!
//! Executes the structured-or-flattened mid-level IR directly, without a
//! compiled form, the way an `Interpreter::execf` walks the same `Op` graph
//! the optimizer rewrites. It is the oracle the Pass Manager's
//! differential-testing mode re-invokes after every post-flatten pass, and
//! the judge for end-to-end scenario tests.
//!
//! Each recursive Rust call to [`exec_region`] gets its own fresh local
//! value table, which is what the source achieves explicitly with
//! `SemanticScope` (save the table, run the callee, restore it): Rust's own
//! call stack gives us that scoping for free, since every activation of a
//! (possibly recursive) function owns a fresh `HashMap` rather than sharing
//! one mutable instance field.

use std::collections::HashMap;

use midopt_ir::{Attr, AttrKind, BlockId, Module, Op, OpId, Opcode, RegionId, ValueType};

use crate::error::{InterpError, InterpResult};
use crate::externals::{apply_extern, Stdin};
use crate::memory::Memory;
use crate::value::Value;

pub struct Interpreter<'m> {
    module: &'m Module,
    globals: HashMap<String, i64>,
    memory: Memory,
    stdout: String,
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m Module) -> InterpResult<Self> {
        let mut interp = Interpreter { module, globals: HashMap::new(), memory: Memory::new(), stdout: String::new() };
        interp.init_globals()?;
        Ok(interp)
    }

    fn init_globals(&mut self) -> InterpResult<()> {
        for global in self.module.globals() {
            let op = self.module.op(global)?;
            let name = op.attr(AttrKind::Name).and_then(Attr::as_name).unwrap_or("").to_string();
            let size = match op.attr(AttrKind::Size) {
                Some(Attr::Size(s)) => *s,
                _ => 0,
            };
            let addr = self.memory.alloc(size);
            if let Some(Attr::IntArray(values)) = op.attr(AttrKind::IntArray) {
                self.memory.write_i32_array(addr, values)?;
            }
            if let Some(Attr::FloatArray(values)) = op.attr(AttrKind::FloatArray) {
                self.memory.write_f32_array(addr, values)?;
            }
            self.globals.insert(name, addr);
        }
        Ok(())
    }

    /// Run `main` with no arguments and simulated stdin `input`. Returns
    /// accumulated stdout and the process exit code (`main`'s return value
    /// truncated to a byte, matching the CLI contract's `exitcode() & 0xff`).
    pub fn run(mut self, input: &str) -> InterpResult<(String, i32)> {
        let main = self.module.find_function_by_name("main").ok_or_else(|| InterpError::UnknownFunction("main".to_string()))?;
        let region = self.module.op(main)?.region.ok_or(InterpError::UndefinedValue(main))?;
        let mut stdin = Stdin::new(input);
        let ret = self.exec_region(region, &[], &mut stdin)?;
        let code = (ret.as_i32() as u8) as i32;
        Ok((self.stdout, code))
    }

    /// Execute a function body given actual argument values, returning its
    /// `Return` value (or `Value::Int(0)` for a void return).
    fn exec_region(&mut self, region: RegionId, args: &[Value], stdin: &mut Stdin) -> InterpResult<Value> {
        let mut values: HashMap<OpId, Value> = HashMap::new();
        let entry = self.module.region(region)?.entry().ok_or(InterpError::UndefinedValue(OpId(0)))?;
        let mut block = entry;
        let mut prev: Option<BlockId> = None;
        loop {
            let ops = self.module.block(block)?.ops.clone();
            let mut idx = 0;
            loop {
                let op_id = ops[idx];
                let op = self.module.op(op_id)?.clone();
                match op.opcode {
                    Opcode::Goto => {
                        let target = op.target_block().ok_or(InterpError::UndefinedValue(op_id))?;
                        prev = Some(block);
                        block = target;
                        break;
                    }
                    Opcode::Branch => {
                        let cond = values.get(&op.operands[0]).copied().ok_or(InterpError::UndefinedValue(op.operands[0]))?;
                        let target = if cond.truthy() { op.target_block() } else { op.else_block() };
                        let target = target.ok_or(InterpError::UndefinedValue(op_id))?;
                        prev = Some(block);
                        block = target;
                        break;
                    }
                    Opcode::Return => {
                        let v = match op.operands.first() {
                            Some(&operand) => values.get(&operand).copied().ok_or(InterpError::UndefinedValue(operand))?,
                            None => Value::Int(0),
                        };
                        return Ok(v);
                    }
                    Opcode::Phi => {
                        let from = prev.ok_or(InterpError::UndefPhiEdge { phi: op_id, from: 0 })?;
                        let pos = op.phi_incoming.iter().position(|&b| b == from).ok_or(InterpError::UndefPhiEdge { phi: op_id, from: from.0 })?;
                        let v = values.get(&op.operands[pos]).copied().ok_or(InterpError::UndefinedValue(op.operands[pos]))?;
                        values.insert(op_id, v);
                    }
                    Opcode::Alloca => {
                        let size = match op.attr(AttrKind::Size) {
                            Some(Attr::Size(s)) => *s,
                            _ => 4,
                        };
                        values.insert(op_id, Value::Int(self.memory.alloc(size)));
                    }
                    Opcode::GetGlobal => {
                        let name = op.attr(AttrKind::Name).and_then(Attr::as_name).unwrap_or("");
                        let addr = *self.globals.get(name).ok_or(InterpError::UndefinedValue(op_id))?;
                        values.insert(op_id, Value::Int(addr));
                    }
                    Opcode::GetArg => {
                        let index = op.attr(AttrKind::Int).and_then(Attr::as_int).unwrap_or(0) as usize;
                        values.insert(op_id, args.get(index).copied().unwrap_or(Value::Int(0)));
                    }
                    Opcode::Call => {
                        let name = op.attr(AttrKind::Name).and_then(Attr::as_name).unwrap_or("").to_string();
                        let mut call_args = Vec::with_capacity(op.operands.len());
                        for &operand in &op.operands {
                            call_args.push(values.get(&operand).copied().ok_or(InterpError::UndefinedValue(operand))?);
                        }
                        let result = match self.module.find_function_by_name(&name) {
                            Some(callee) => {
                                let callee_region = self.module.op(callee)?.region.ok_or(InterpError::UndefinedValue(callee))?;
                                self.exec_region(callee_region, &call_args, stdin)?
                            }
                            None => apply_extern(&name, &call_args, stdin, &mut self.stdout, &mut self.memory)?,
                        };
                        if op.has_result() {
                            values.insert(op_id, result);
                        }
                    }
                    Opcode::Clone | Opcode::Join | Opcode::Wake => {
                        // Concurrency primitives are opaque here: never actually
                        // executed, only tracked by purity/DCE upstream.
                        if op.has_result() {
                            values.insert(op_id, Value::Int(0));
                        }
                    }
                    _ => {
                        let v = self.exec_computation(&op, &values)?;
                        if op.has_result() {
                            values.insert(op_id, v);
                        }
                    }
                }
                idx += 1;
                if idx >= ops.len() {
                    // Reachable only for a malformed block with no terminator;
                    // the IR invariant guarantees this doesn't happen for
                    // well-formed modules.
                    return Err(InterpError::UndefinedValue(op_id));
                }
            }
        }
    }

    fn operand_value(&self, values: &HashMap<OpId, Value>, op: &Op, i: usize) -> InterpResult<Value> {
        let operand = *op.operands.get(i).ok_or(InterpError::UndefinedValue(op.id))?;
        values.get(&operand).copied().ok_or(InterpError::UndefinedValue(operand))
    }

    fn exec_computation(&mut self, op: &Op, values: &HashMap<OpId, Value>) -> InterpResult<Value> {
        use Opcode::*;
        Ok(match op.opcode {
            ConstInt => Value::Int(op.attr(AttrKind::Int).and_then(Attr::as_int).unwrap_or(0) as i64),
            ConstFloat => Value::Float(op.attr(AttrKind::Float).and_then(Attr::as_float).unwrap_or(0.0)),
            AddI => Value::Int(self.i32_binop(values, op, i32::wrapping_add)?),
            SubI => Value::Int(self.i32_binop(values, op, i32::wrapping_sub)?),
            MulI => Value::Int(self.i32_binop(values, op, i32::wrapping_mul)?),
            DivI => Value::Int(self.i32_binop(values, op, |a, b| if b == 0 { 0 } else { a.wrapping_div(b) })?),
            ModI => Value::Int(self.i32_binop(values, op, |a, b| if b == 0 { 0 } else { a.wrapping_rem(b) })?),
            NegI => Value::Int(self.operand_value(values, op, 0)?.as_i32().wrapping_neg() as i64),
            AndI => Value::Int(self.i32_binop(values, op, |a, b| a & b)?),
            OrI => Value::Int(self.i32_binop(values, op, |a, b| a | b)?),
            XorI => Value::Int(self.i32_binop(values, op, |a, b| a ^ b)?),
            NotI => Value::Int(!self.operand_value(values, op, 0)?.as_i32() as i64),
            ShlI => Value::Int(self.i32_binop(values, op, |a, b| a.wrapping_shl(b as u32 & 31))?),
            LShrI => Value::Int(self.i32_binop(values, op, |a, b| ((a as u32).wrapping_shr(b as u32 & 31)) as i32)?),
            AShrI => Value::Int(self.i32_binop(values, op, |a, b| a.wrapping_shr(b as u32 & 31))?),
            EqI => Value::Int(self.i32_binop(values, op, |a, b| (a == b) as i32)?),
            NeI => Value::Int(self.i32_binop(values, op, |a, b| (a != b) as i32)?),
            LtI => Value::Int(self.i32_binop(values, op, |a, b| (a < b) as i32)?),
            LeI => Value::Int(self.i32_binop(values, op, |a, b| (a <= b) as i32)?),
            GtI => Value::Int(self.i32_binop(values, op, |a, b| (a > b) as i32)?),
            GeI => Value::Int(self.i32_binop(values, op, |a, b| (a >= b) as i32)?),
            AddF => Value::Float(self.f32_binop(values, op, |a, b| a + b)?),
            SubF => Value::Float(self.f32_binop(values, op, |a, b| a - b)?),
            MulF => Value::Float(self.f32_binop(values, op, |a, b| a * b)?),
            DivF => Value::Float(self.f32_binop(values, op, |a, b| a / b)?),
            NegF => Value::Float(-self.operand_value(values, op, 0)?.as_float()),
            EqF => Value::Int(self.f32_binop(values, op, |a, b| (a == b) as i32 as f32)? as i64),
            NeF => Value::Int(self.f32_binop(values, op, |a, b| (a != b) as i32 as f32)? as i64),
            LtF => Value::Int((self.operand_value(values, op, 0)?.as_float() < self.operand_value(values, op, 1)?.as_float()) as i64),
            LeF => Value::Int((self.operand_value(values, op, 0)?.as_float() <= self.operand_value(values, op, 1)?.as_float()) as i64),
            GtF => Value::Int((self.operand_value(values, op, 0)?.as_float() > self.operand_value(values, op, 1)?.as_float()) as i64),
            GeF => Value::Int((self.operand_value(values, op, 0)?.as_float() >= self.operand_value(values, op, 1)?.as_float()) as i64),
            IntToFloat => Value::Float(self.operand_value(values, op, 0)?.as_i32() as f32),
            FloatToInt => Value::Int(self.operand_value(values, op, 0)?.as_float() as i32 as i64),
            AddL => Value::Int(self.operand_value(values, op, 0)?.as_int().wrapping_add(self.operand_value(values, op, 1)?.as_int())),
            MulL => Value::Int(self.operand_value(values, op, 0)?.as_int().wrapping_mul(self.operand_value(values, op, 1)?.as_int())),
            RShiftL => Value::Int(self.operand_value(values, op, 0)?.as_int().wrapping_shr(self.operand_value(values, op, 1)?.as_int() as u32 & 63)),
            Load => {
                let addr = self.operand_value(values, op, 0)?.as_int();
                match op.result_type {
                    ValueType::F32 => Value::Float(self.memory.read_f32(addr)?),
                    ValueType::I64 => Value::Int(self.memory.read_i64(addr)?),
                    _ => Value::Int(self.memory.read_i32(addr)? as i64),
                }
            }
            Store => {
                let stored = self.operand_value(values, op, 0)?;
                let addr = self.operand_value(values, op, 1)?.as_int();
                let def_ty = self.module.op(op.operands[0])?.result_type;
                match def_ty {
                    ValueType::F32 => self.memory.write_f32(addr, stored.as_float())?,
                    ValueType::I64 => self.memory.write_i64(addr, stored.as_int())?,
                    _ => self.memory.write_i32(addr, stored.as_i32())?,
                }
                Value::Int(0)
            }
            Select => {
                let cond = self.operand_value(values, op, 0)?;
                if cond.truthy() {
                    self.operand_value(values, op, 1)?
                } else {
                    self.operand_value(values, op, 2)?
                }
            }
            other => return Err(InterpError::UnsupportedOpcode(other)),
        })
    }

    fn i32_binop(&self, values: &HashMap<OpId, Value>, op: &Op, f: impl Fn(i32, i32) -> i32) -> InterpResult<i64> {
        let a = self.operand_value(values, op, 0)?.as_i32();
        let b = self.operand_value(values, op, 1)?.as_i32();
        Ok(f(a, b) as i64)
    }

    fn f32_binop(&self, values: &HashMap<OpId, Value>, op: &Op, f: impl Fn(f32, f32) -> f32) -> InterpResult<f32> {
        let a = self.operand_value(values, op, 0)?.as_float();
        let b = self.operand_value(values, op, 1)?.as_float();
        Ok(f(a, b))
    }
}

/// Run `module`'s `main` against simulated stdin `input`, returning
/// `(stdout, exit_code)` -- the contract the differential-testing mode of
/// the Pass Manager and the CLI's `--compare` flag both drive.
pub fn run(module: &Module, input: &str) -> InterpResult<(String, i32)> {
    Interpreter::new(module)?.run(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Attr, Builder, Opcode, ValueType};

    fn new_function(m: &mut Module, name: &str) -> (OpId, BlockId) {
        let f = m.alloc_op(Opcode::Function, ValueType::Void);
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
    fn constant_fold_shaped_program_returns_14() {
        let mut m = Module::new();
        let (_main, entry) = new_function(&mut m, "main");
        let mut b = Builder::at_block_end(&mut m, entry);
        let c2 = b.const_int(2).unwrap();
        let c3 = b.const_int(3).unwrap();
        let c4 = b.const_int(4).unwrap();
        let mul = b.create(Opcode::MulI, ValueType::I32, [c3, c4], []).unwrap();
        let add = b.create(Opcode::AddI, ValueType::I32, [c2, mul], []).unwrap();
        b.ret(Some(add)).unwrap();

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 14);
    }

    #[test]
    fn mem2reg_shaped_program_increments_through_memory() {
        let mut m = Module::new();
        let (_main, entry) = new_function(&mut m, "main");
        let mut b = Builder::at_block_end(&mut m, entry);
        let slot = b.create(Opcode::Alloca, ValueType::I64, [], [Attr::Size(4)]).unwrap();
        let c5 = b.const_int(5).unwrap();
        b.create(Opcode::Store, ValueType::Void, [c5, slot], []).unwrap();
        let loaded = b.create(Opcode::Load, ValueType::I32, [slot], []).unwrap();
        let one = b.const_int(1).unwrap();
        let incremented = b.create(Opcode::AddI, ValueType::I32, [loaded, one], []).unwrap();
        b.create(Opcode::Store, ValueType::Void, [incremented, slot], []).unwrap();
        let reloaded = b.create(Opcode::Load, ValueType::I32, [slot], []).unwrap();
        b.ret(Some(reloaded)).unwrap();

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 6);
    }

    #[test]
    fn branch_and_phi_pick_the_taken_edge() {
        let mut m = Module::new();
        let (_main, entry) = new_function(&mut m, "main");
        let region = m.op(_main).unwrap().region.unwrap();
        let then_b = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(then_b);
        let else_b = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(else_b);
        let merge = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(merge);

        let mut b = Builder::at_block_end(&mut m, entry);
        let cond = b.const_int(1).unwrap();
        b.branch(cond, then_b, else_b).unwrap();

        let mut b = Builder::at_block_end(&mut m, then_b);
        let then_v = b.const_int(10).unwrap();
        b.goto(merge).unwrap();

        let mut b = Builder::at_block_end(&mut m, else_b);
        let else_v = b.const_int(20).unwrap();
        b.goto(merge).unwrap();

        let mut b = Builder::at_block_end(&mut m, merge);
        let phi = b.phi(ValueType::I32, [(then_v, then_b), (else_v, else_b)]).unwrap();
        b.ret(Some(phi)).unwrap();

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 10);
    }

    #[test]
    fn call_to_another_function_recurses_through_exec_region() {
        let mut m = Module::new();
        let (f, f_entry) = new_function(&mut m, "f");
        let mut b = Builder::at_block_end(&mut m, f_entry);
        let arg0 = b.create(Opcode::GetArg, ValueType::I32, [], [Attr::Int(0)]).unwrap();
        let one = b.const_int(1).unwrap();
        let plus_one = b.create(Opcode::AddI, ValueType::I32, [arg0, one], []).unwrap();
        b.ret(Some(plus_one)).unwrap();
        let _ = f;

        let (_main, entry) = new_function(&mut m, "main");
        let mut b = Builder::at_block_end(&mut m, entry);
        let arg = b.const_int(41).unwrap();
        let call = b.create(Opcode::Call, ValueType::I32, [arg], [Attr::Name("f".to_string())]).unwrap();
        b.ret(Some(call)).unwrap();

        let (_, code) = run(&m, "").unwrap();
        assert_eq!(code, 42);
    }

    #[test]
    fn getint_and_putint_round_trip_stdin_to_stdout() {
        let mut m = Module::new();
        let (_main, entry) = new_function(&mut m, "main");
        let mut b = Builder::at_block_end(&mut m, entry);
        let got = b.create(Opcode::Call, ValueType::I32, [], [Attr::Name("getint".to_string())]).unwrap();
        b.create(Opcode::Call, ValueType::Void, [got], [Attr::Name("putint".to_string())]).unwrap();
        let zero = b.const_int(0).unwrap();
        b.ret(Some(zero)).unwrap();

        let (stdout, code) = run(&m, "17").unwrap();
        assert_eq!(stdout, "17");
        assert_eq!(code, 0);
    }
}
