use relume_bytecode::instruction::JUMP_BIAS;
use relume_bytecode::opcode::{OpKind, Opcode};
use relume_hir::func::FuncId;
use relume_hir::scope::INVALID_ID;
use relume_hir::stmt::StmtKind;

use crate::collector::SlotScopeCollector;
use crate::error::Result;
use crate::Lifter;

impl<'m> Lifter<'m> {
    /// Jump grouping: fold compare/test + jump pairs into condition
    /// statements, classify remaining jumps, elide redundant upvalue
    /// closes, and normalize trailing returns.
    pub(crate) fn group_jumps(
        &mut self,
        func: FuncId,
        collector: &mut SlotScopeCollector,
    ) -> Result<()> {
        let mut block = std::mem::take(&mut self.chunk.func_mut(func).block);

        // Fold conditions and register jump edges. The folded jump's label
        // edge stays registered under its own id (condition id + 1); the
        // elimination passes retire it from there.
        let mut i = block.len();
        while i > 0 {
            i -= 1;
            let stmt_id = block[i];
            let instruction = self.chunk.stmts.get(stmt_id).instruction;
            match instruction.op.kind() {
                OpKind::Compare | OpKind::Test | OpKind::TestAndCopy => {
                    crate::error::bytecode_assert!(
                        i + 1 < block.len(),
                        self.fid(func),
                        "compare at {} has no following jump",
                        instruction.id
                    );
                    if instruction.op.kind() == OpKind::TestAndCopy {
                        self.chunk
                            .func_mut(func)
                            .add_jump(instruction.id, instruction.id + 2);
                    }
                    let target = self.chunk.stmts.get(block[i + 1]).instruction.target;
                    let stmt = self.chunk.stmts.get_mut(stmt_id);
                    stmt.kind = StmtKind::Condition;
                    stmt.instruction.target = target;
                    block.remove(i + 1);
                    collector.add_jump(instruction.id + 1, target);
                }
                OpKind::Jump => match instruction.op {
                    Opcode::UClo => {
                        collector.add_upvalue_close(
                            instruction.id,
                            instruction.target,
                            instruction.a,
                        );
                        self.chunk.stmts.get_mut(stmt_id).kind = StmtKind::Goto;
                        self.chunk
                            .func_mut(func)
                            .add_jump(instruction.id, instruction.target);
                    }
                    Opcode::Jmp => {
                        self.chunk.stmts.get_mut(stmt_id).kind = StmtKind::Goto;
                        self.chunk
                            .func_mut(func)
                            .add_jump(instruction.id, instruction.target);
                    }
                    Opcode::Loop => {
                        self.chunk
                            .func_mut(func)
                            .add_jump(instruction.id, instruction.target);
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        // Attach labels, elide no-op upvalue closes, resolve iterator
        // guards, and fuse the two-phase never-taken-jump pattern.
        let mut i = block.len();
        while i > 0 {
            i -= 1;
            let stmt_id = block[i];
            let id = self.chunk.stmts.get(stmt_id).instruction.id;
            let label = self.chunk.func(func).label_at(id);
            self.chunk.stmts.get_mut(stmt_id).instruction.attached_label = label;

            let instruction = self.chunk.stmts.get(stmt_id).instruction;
            match instruction.op {
                Opcode::UClo => {
                    if i + 1 < block.len()
                        && instruction.target == self.extended_id(block[i + 1])
                    {
                        self.chunk.stmts.get_mut(stmt_id).kind = StmtKind::Empty;
                        self.chunk
                            .func_mut(func)
                            .remove_jump(instruction.id, instruction.target);
                    }
                }
                Opcode::IterC => {
                    // The iterator setup jump was classified Goto; demote it
                    // back to a plain instruction so loop extraction can
                    // consume it as the generic-for opener.
                    if self.chunk.func(func).is_valid_label(instruction.attached_label) {
                        let source =
                            self.chunk.func(func).label(instruction.attached_label).jump_ids[0];
                        let index = self.block_index_of_id(&block, source);
                        if index != INVALID_ID {
                            let setup = block[index as usize];
                            self.chunk.stmts.get_mut(setup).kind = StmtKind::Instruction;
                            let setup_insn = self.chunk.stmts.get(setup).instruction;
                            self.chunk
                                .func_mut(func)
                                .remove_jump(setup_insn.id, setup_insn.target);
                        }
                    }
                }
                Opcode::Jmp if self.chunk.stmts.get(stmt_id).kind == StmtKind::Goto => {
                    collector.add_jump(instruction.id, instruction.target);
                    if instruction.target == instruction.id || i == 0 {
                        continue;
                    }
                    let previous = self.chunk.stmts.get(block[i - 1]).instruction;
                    if previous.op != Opcode::Jmp || previous.d != JUMP_BIAS {
                        continue;
                    }
                    // A never-taken jump marker directly before a real jump:
                    // the pair is a single condition targeting the outer
                    // jump's destination.
                    self.chunk
                        .func_mut(func)
                        .remove_jump(previous.id, previous.target);
                    let previous_stmt = self.chunk.stmts.get_mut(block[i - 1]);
                    previous_stmt.kind = StmtKind::Condition;
                    previous_stmt.instruction.target = instruction.target;
                    block.remove(i);
                }
                _ => {}
            }
        }

        // Trailing-return normalization: a UCLO jumping to a duplicated
        // final return adopts the return in place; the duplicate empties.
        let mut i = block.len();
        while i > 0 {
            i -= 1;
            let stmt_id = block[i];
            let stmt = self.chunk.stmts.get(stmt_id);
            let instruction = stmt.instruction;
            if i > 0
                && stmt.kind == StmtKind::Return
                && self.chunk.stmts.get(block[i - 1]).kind == StmtKind::Return
                && self.chunk.func(func).is_valid_label(instruction.attached_label)
                && self.chunk.func(func).label(instruction.attached_label).jump_ids.len() == 1
            {
                let source = self.chunk.func(func).label(instruction.attached_label).jump_ids[0];
                let index = self.block_index_of_id(&block, source);
                if index != INVALID_ID
                    && self.chunk.stmts.get(block[index as usize]).instruction.op == Opcode::UClo
                {
                    let close = block[index as usize];
                    let close_insn = self.chunk.stmts.get(close).instruction;
                    self.chunk
                        .func_mut(func)
                        .remove_jump(close_insn.id, close_insn.target);
                    let adopted = self.chunk.stmts.get_mut(close);
                    adopted.kind = StmtKind::Return;
                    adopted.instruction.op = instruction.op;
                    adopted.instruction.a = instruction.a;
                    adopted.instruction.b = instruction.b;
                    adopted.instruction.c = instruction.c;
                    adopted.instruction.d = instruction.d;
                    self.chunk.stmts.get_mut(stmt_id).kind = StmtKind::Empty;
                    continue;
                }
            }
            if instruction.op == Opcode::Ret0 {
                self.chunk.stmts.get_mut(stmt_id).kind = StmtKind::Empty;
            }
            break;
        }

        self.chunk.func_mut(func).block = block;
        Ok(())
    }
}
