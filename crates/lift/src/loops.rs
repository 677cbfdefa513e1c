use relume_bytecode::opcode::Opcode;
use relume_hir::func::FuncId;
use relume_hir::scope::INVALID_ID;
use relume_hir::stmt::{InstrInfo, Stmt, StmtId, StmtKind};

use crate::collector::SlotScopeCollector;
use crate::error::{bytecode_assert, Result};
use crate::Lifter;

impl<'m> Lifter<'m> {
    /// Loop extraction: recognize generic-for, numeric-for and backward
    /// loop skeletons, carve their bodies into nested blocks, and rewrite
    /// body gotos aimed past the loop into breaks.
    pub(crate) fn build_loops(
        &mut self,
        func: FuncId,
        collector: &mut SlotScopeCollector,
    ) -> Result<()> {
        let mut block = std::mem::take(&mut self.chunk.func_mut(func).block);

        let mut i = block.len();
        while i > 0 {
            i -= 1;
            let stmt_id = block[i];
            if self.chunk.stmts.get(stmt_id).kind != StmtKind::Instruction {
                continue;
            }
            let instruction = self.chunk.stmts.get(stmt_id).instruction;

            match instruction.op {
                // A plain-instruction JMP at this point is the demoted
                // iterator setup jump; together with ISNEXT it opens a
                // generic-for whose target is the ITERC/ITERL pair.
                Opcode::IsNext | Opcode::Jmp => {
                    let target_index = self.block_index_of_id(&block, instruction.target);
                    bytecode_assert!(
                        target_index != INVALID_ID && (target_index as usize) + 2 < block.len(),
                        self.fid(func),
                        "generic for loop target out of range"
                    );
                    let target_index = target_index as usize;
                    let break_target = self.extended_id(block[target_index + 2]);
                    let iterator = self.chunk.stmts.get(block[target_index]).instruction;
                    let back_edge = self.chunk.stmts.get(block[target_index + 1]).instruction;

                    {
                        let stmt = self.chunk.stmts.get_mut(stmt_id);
                        stmt.kind = StmtKind::GenericFor;
                        stmt.instruction = iterator;
                        stmt.instruction.id = back_edge.target - 1;
                        stmt.instruction.target = back_edge.id + 1;
                    }
                    self.chunk.stmts.get_mut(block[target_index]).kind = StmtKind::Empty;

                    let mut body: Vec<StmtId> = block.drain(i + 1..target_index + 2).collect();
                    body.pop();
                    let begin = self.chunk.stmts.get(stmt_id).instruction.id;
                    let end = self.chunk.stmts.get(stmt_id).instruction.target;
                    collector.add_loop(begin, end);
                    self.build_break_statements(&body, break_target);
                    self.build_local_scopes(func, &mut body)?;
                    self.chunk.stmts.get_mut(stmt_id).block = body;
                }
                Opcode::ForI => {
                    let target_index = self.block_index_of_id(&block, instruction.target);
                    bytecode_assert!(
                        target_index != INVALID_ID && target_index > 0,
                        self.fid(func),
                        "numeric for loop target out of range"
                    );
                    let target_index = target_index as usize;
                    let break_target = self.extended_id(block[target_index]);
                    self.chunk.stmts.get_mut(stmt_id).kind = StmtKind::NumericFor;
                    self.chunk.stmts.get_mut(block[target_index - 1]).kind = StmtKind::Empty;

                    let mut body: Vec<StmtId> = block.drain(i + 1..target_index).collect();
                    collector.add_loop(instruction.id, instruction.target);
                    self.build_break_statements(&body, break_target);
                    self.build_local_scopes(func, &mut body)?;
                    self.chunk.stmts.get_mut(stmt_id).block = body;
                }
                Opcode::Loop => {
                    bytecode_assert!(
                        instruction.target >= instruction.id,
                        self.fid(func),
                        "LOOP instruction has invalid jump target"
                    );
                    self.chunk
                        .func_mut(func)
                        .remove_jump(instruction.id, instruction.target);

                    if instruction.target == instruction.id {
                        // Degenerate self-targeting LOOP: a goto-loop. The
                        // marker empties and the following goto adopts its
                        // opcode so the break pass leaves it alone.
                        let valid = i + 1 < block.len() && {
                            let next = self.chunk.stmts.get(block[i + 1]);
                            next.kind == StmtKind::Goto
                                && next.instruction.target <= instruction.id
                                && !self
                                    .chunk
                                    .func(func)
                                    .is_valid_label(next.instruction.attached_label)
                        };
                        bytecode_assert!(valid, self.fid(func), "invalid goto loop");
                        self.chunk.stmts.get_mut(stmt_id).kind = StmtKind::Empty;
                        self.chunk.stmts.get_mut(block[i + 1]).instruction.op = instruction.op;
                        continue;
                    }

                    let target_index = self.block_index_of_id(&block, instruction.target);
                    bytecode_assert!(
                        target_index != INVALID_ID,
                        self.fid(func),
                        "LOOP target not found"
                    );
                    let target_index = target_index as usize;
                    let break_target = self.extended_id(block[target_index]);
                    self.chunk.stmts.get_mut(stmt_id).kind = StmtKind::Loop;

                    let mut body: Vec<StmtId> = block.drain(i + 1..target_index).collect();
                    collector.add_loop(instruction.id, instruction.target);
                    self.build_break_statements(&body, break_target);

                    // Repeat-style disambiguation: a loop whose label has a
                    // forward jump landing just after an inner condition,
                    // while the body still ends with a condition, gets
                    // synthetic break/goto sentinels preserving the
                    // trailing condition's meaning. Known approximation.
                    let attached = instruction.attached_label;
                    let tail_is_condition = body
                        .last()
                        .is_some_and(|&s| self.chunk.stmts.get(s).kind == StmtKind::Condition);
                    if tail_is_condition
                        && self.chunk.func(func).is_valid_label(attached)
                        && break_target != instruction.id
                    {
                        let jump_ids = self.chunk.func(func).label(attached).jump_ids.clone();
                        let mut j = jump_ids.len();
                        while j > 0 {
                            j -= 1;
                            if jump_ids[j] <= instruction.id {
                                break;
                            }
                            if jump_ids[j] >= instruction.target {
                                continue;
                            }
                            let inner = self.block_index_of_id(&body, jump_ids[j] - 1);
                            if inner != INVALID_ID
                                && self.chunk.stmts.get(body[inner as usize]).kind
                                    == StmtKind::Condition
                            {
                                let mut sentinel =
                                    Stmt::new(StmtKind::Break, InstrInfo::synthetic(Opcode::Jmp));
                                sentinel.instruction.target = break_target;
                                body.push(self.chunk.stmts.alloc(sentinel));
                                let mut sentinel =
                                    Stmt::new(StmtKind::Goto, InstrInfo::synthetic(Opcode::Jmp));
                                sentinel.instruction.target = instruction.id;
                                body.push(self.chunk.stmts.alloc(sentinel));
                            }
                            break;
                        }
                    }

                    self.build_local_scopes(func, &mut body)?;
                    self.chunk.stmts.get_mut(stmt_id).block = body;
                }
                _ => {}
            }
        }

        self.build_local_scopes(func, &mut block)?;
        self.chunk.func_mut(func).block = block;
        Ok(())
    }

    fn build_break_statements(&mut self, block: &[StmtId], break_target: u32) {
        for &stmt_id in block.iter().rev() {
            let stmt = self.chunk.stmts.get(stmt_id);
            if stmt.kind == StmtKind::Goto && stmt.instruction.target == break_target {
                self.chunk.stmts.get_mut(stmt_id).kind = StmtKind::Break;
            }
        }
    }

    /// Local-scope nesting: wrap each debug local group's declaration
    /// region in a nested block hanging off a declaration statement, or
    /// bind the group to the for-loop that declares it.
    pub(crate) fn build_local_scopes(
        &mut self,
        func: FuncId,
        block: &mut Vec<StmtId>,
    ) -> Result<()> {
        if !self.chunk.func(func).has_debug_info {
            return self.build_expressions(func, block);
        }

        for li in (0..self.chunk.func(func).locals.len()).rev() {
            let group = &self.chunk.func(func).locals[li];
            let (scope_begin, scope_end) = (group.scope_begin, group.scope_end);
            let begin_index = self.block_index_of_id(block, scope_begin);
            if begin_index == INVALID_ID {
                continue;
            }
            let begin_index = begin_index as usize;

            match self.chunk.stmts.get(block[begin_index]).kind {
                StmtKind::NumericFor | StmtKind::GenericFor => {
                    self.chunk.stmts.get_mut(block[begin_index]).locals = Some(li as u32);
                    continue;
                }
                _ => {}
            }

            let decl_index = begin_index + 1;
            let mut decl = Stmt::new(
                StmtKind::Declaration,
                InstrInfo::synthetic(Opcode::KNil),
            );
            decl.locals = Some(li as u32);
            let decl_id = self.chunk.stmts.alloc(decl);
            block.insert(decl_index, decl_id);

            if scope_end > scope_begin {
                self.chunk.stmts.get_mut(decl_id).instruction.id = scope_begin + 1;
                let raw_end = self.block_index_of_id(block, scope_end + 1);
                let mut end_index = if raw_end == INVALID_ID {
                    block.len()
                } else {
                    raw_end as usize
                };
                while end_index > decl_index + 1 {
                    let tail = self.chunk.stmts.get(block[end_index - 1]);
                    let excluded = tail.kind == StmtKind::Declaration
                        && tail
                            .locals
                            .is_some_and(|g| self.chunk.func(func).locals[g as usize].exclude_block);
                    if !excluded {
                        break;
                    }
                    end_index -= 1;
                }
                let mut body: Vec<StmtId> = block.drain(decl_index + 1..end_index).collect();
                self.build_expressions(func, &mut body)?;
                self.chunk.stmts.get_mut(decl_id).block = body;
            }
        }

        self.build_expressions(func, block)
    }
}
