//! `MoveAlloca`: hoists every `Alloca` to the front of its function's entry
//! block, in encounter order, so later passes can assume a canonical
//! prelude shape.

use midopt_ir::{Builder, Module, Opcode};

use crate::error::PassResult;
use crate::pass::Pass;

pub struct MoveAlloca;

impl Pass for MoveAlloca {
    fn name(&self) -> &'static str {
        "MoveAlloca"
    }

    fn run(&mut self, module: &mut Module) -> PassResult<bool> {
        let mut changed = false;
        for func in module.functions() {
            let Some(region) = module.op(func)?.region else { continue };
            let Some(entry) = module.region(region)?.entry() else { continue };
            let allocas = module.find_all(|op| op == Opcode::Alloca)?;
            let allocas: Vec<_> = allocas
                .into_iter()
                .filter(|&a| op_inside(module, a, region).unwrap_or(false))
                .collect();
            for (i, &alloca) in allocas.iter().enumerate() {
                if module.op(alloca)?.parent != Some(entry) {
                    let mut b = Builder::at_block_start(module, entry);
                    let _ = &mut b;
                    module_move_to_entry(module, alloca, entry, i)?;
                    changed = true;
                } else {
                    let pos = module.block(entry)?.position(alloca);
                    if pos != Some(i) {
                        module_move_to_entry(module, alloca, entry, i)?;
                        changed = true;
                    }
                }
            }
        }
        Ok(changed)
    }
}

fn op_inside(module: &Module, op: midopt_ir::OpId, region: midopt_ir::RegionId) -> PassResult<bool> {
    let mut stack = vec![region];
    while let Some(r) = stack.pop() {
        for &block in &module.region(r)?.blocks {
            for &candidate in &module.block(block)?.ops {
                if candidate == op {
                    return Ok(true);
                }
                let c = module.op(candidate)?;
                if let Some(nested) = c.region {
                    stack.push(nested);
                }
                if let Some(nested) = c.else_region {
                    stack.push(nested);
                }
            }
        }
    }
    Ok(false)
}

fn module_move_to_entry(module: &mut Module, alloca: midopt_ir::OpId, entry: midopt_ir::BlockId, index: usize) -> PassResult<()> {
    if let Some(old_parent) = module.op(alloca)?.parent {
        module.block_mut(old_parent)?.remove_op(alloca);
    }
    let clamped = index.min(module.block(entry)?.ops.len());
    module.block_mut(entry)?.insert_at(clamped, alloca);
    module.op_mut(alloca)?.parent = Some(entry);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use midopt_ir::{Attr, Builder as B, Opcode as Op, ValueType as VT};

    #[test]
    fn alloca_in_later_block_moves_to_entry_front() {
        let mut m = Module::new();
        let f = m.alloc_op(Op::Function, VT::Void);
        let region = m.alloc_region();
        m.op_mut(f).unwrap().region = Some(region);
        let top = m.top_block;
        m.block_mut(top).unwrap().append(f);
        m.op_mut(f).unwrap().parent = Some(top);
        let entry = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(entry);
        let second = m.alloc_block();
        m.region_mut_pub(region).unwrap().append(second);

        let mut b = B::at_block_end(&mut m, entry);
        let c = b.const_int(1).unwrap();
        b.goto(second).unwrap();
        let mut b = B::at_block_end(&mut m, second);
        let a = b.create(Op::Alloca, VT::I64, [], [Attr::Size(4)]).unwrap();
        b.ret(None).unwrap();
        let _ = c;

        let mut pass = MoveAlloca;
        pass.run(&mut m).unwrap();
        assert_eq!(m.op(a).unwrap().parent, Some(entry));
        assert_eq!(m.block(entry).unwrap().ops[0], a);
    }
}
