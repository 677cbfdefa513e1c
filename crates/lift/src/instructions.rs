use relume_bytecode::opcode::{OpKind, Opcode};
use relume_bytecode::prototype::{UV_IMMUTABLE, UV_LOCAL};
use relume_hir::func::{FuncId, UpvalueBinding};
use relume_hir::stmt::{InstrInfo, Stmt, StmtKind};

use crate::collector::SlotScopeCollector;
use crate::error::{bytecode_assert, Result};
use crate::Lifter;

impl<'m> Lifter<'m> {
    /// Instruction import: one statement per instruction, classified by
    /// opcode kind. FNEW instantiates the child function node eagerly and
    /// registers captured parent slots with the collector; jump-format
    /// instructions get their absolute target computed here.
    pub(crate) fn build_instructions(
        &mut self,
        func: FuncId,
        collector: &mut SlotScopeCollector,
    ) -> Result<()> {
        let proto = self.proto(func);
        let parameters = proto.header.parameters;
        let instructions = &proto.instructions;
        self.chunk.func_mut(func).has_debug_info = !proto.variable_infos.is_empty();

        if instructions.is_empty() {
            // A function with no instructions still lifts to a body with a
            // single empty return.
            let stmt = Stmt::new(StmtKind::Return, InstrInfo::synthetic(Opcode::Ret0));
            let id = self.chunk.stmts.alloc(stmt);
            self.chunk.func_mut(func).block.push(id);
            return Ok(());
        }

        let mut block = Vec::with_capacity(instructions.len());
        let mut captured = Vec::new();

        for (i, insn) in instructions.iter().enumerate() {
            let id = i as u32;
            let mut stmt = Stmt::new(StmtKind::Instruction, InstrInfo::from_instruction(insn, id));

            match insn.op.kind() {
                OpKind::FunctionNew => {
                    let child_proto = self.child_prototype(func, insn.d)?;
                    let level = self.chunk.func(func).level + 1;
                    let child = self.chunk.new_func(child_proto, level);
                    stmt.function = Some(child);
                    self.chunk.func_mut(func).child_functions.push(child);

                    let descriptors = self.module.prototypes[child_proto].upvalues.clone();
                    let mut bindings = Vec::with_capacity(descriptors.len());
                    for descriptor in descriptors {
                        let slot = (descriptor & !(UV_LOCAL | UV_IMMUTABLE)) as u8;
                        if descriptor & UV_LOCAL == 0 {
                            // References the parent's upvalue list.
                            bytecode_assert!(
                                (slot as usize) < self.chunk.func(func).upvalues.len(),
                                self.fid(func),
                                "upvalue descriptor {slot} out of range"
                            );
                            bindings.push(UpvalueBinding {
                                slot,
                                local: false,
                                cell: self.chunk.func(func).upvalues[slot as usize].cell,
                            });
                            continue;
                        }
                        bindings.push(UpvalueBinding {
                            slot,
                            local: true,
                            cell: None,
                        });
                        if slot >= parameters {
                            captured.push(slot);
                        }
                    }
                    self.chunk.func_mut(child).upvalues = bindings;

                    if !captured.is_empty() {
                        collector.add_upvalues(id, std::mem::take(&mut captured));
                    }
                }
                OpKind::Return => {
                    stmt.kind = StmtKind::Return;
                }
                OpKind::Jump => {
                    stmt.instruction.target = insn.jump_target(id);
                }
                _ => {}
            }

            block.push(self.chunk.stmts.alloc(stmt));
        }

        self.chunk.func_mut(func).block = block;
        Ok(())
    }

    fn child_prototype(&self, func: FuncId, constant: u16) -> Result<usize> {
        use relume_bytecode::constant::GcConstant;
        let proto = self.proto(func);
        match proto.gc_constants.get(constant as usize) {
            Some(GcConstant::Child(index)) => Ok(*index),
            _ => Err(crate::LiftError::MalformedBytecode {
                function: self.fid(func),
                message: format!("FNEW constant {constant} is not a prototype"),
            }),
        }
    }
}
