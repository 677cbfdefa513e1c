use relume_hir::func::FuncId;
use relume_hir::scope::INVALID_ID;
use relume_hir::stmt::{StmtId, StmtKind};

use crate::error::{lift_assert, Result};
use crate::{BlockCtx, Lifter};

impl<'m> Lifter<'m> {
    /// If-statement framing: promote every surviving condition to an if
    /// whose body runs up to the statement preceding the condition's jump
    /// target, and dissolve the jump edges of breaks. Runs in reverse so
    /// nested conditions are framed before the ones enclosing them.
    pub(crate) fn build_if_statements(
        &mut self,
        func: FuncId,
        block: &mut Vec<StmtId>,
        previous: Option<&BlockCtx<'_>>,
    ) -> Result<()> {
        let mut i = block.len();
        while i > 0 {
            i -= 1;
            let stmt_id = block[i];
            match self.chunk.stmts.get(stmt_id).kind {
                StmtKind::Condition => {
                    let target = self.chunk.stmts.get(stmt_id).instruction.target;
                    let mut index = i;
                    let mut found = false;
                    while index < block.len() {
                        let label = {
                            let ctx = BlockCtx {
                                index,
                                block,
                                previous,
                            };
                            self.label_from_next_statement(func, &ctx, true, false)
                        };
                        if label != INVALID_ID
                            && self.chunk.func(func).is_valid_label(label)
                            && self.chunk.func(func).label(label).target == target
                        {
                            found = true;
                            break;
                        }
                        index += 1;
                    }
                    lift_assert!(found, self.fid(func), "failed to build if statement");

                    let body: Vec<StmtId> = block.drain(i + 1..=index).collect();
                    let stmt = self.chunk.stmts.get_mut(stmt_id);
                    stmt.kind = StmtKind::If;
                    stmt.block = body;
                    let id = stmt.instruction.id;
                    self.chunk.func_mut(func).remove_jump(id, target);
                }
                StmtKind::Break => {
                    let instruction = self.chunk.stmts.get(stmt_id).instruction;
                    self.chunk
                        .func_mut(func)
                        .remove_jump(instruction.id, instruction.target);
                }
                StmtKind::NumericFor
                | StmtKind::GenericFor
                | StmtKind::Loop
                | StmtKind::Declaration => {
                    let mut body = std::mem::take(&mut self.chunk.stmts.get_mut(stmt_id).block);
                    {
                        let ctx = BlockCtx {
                            index: i,
                            block,
                            previous,
                        };
                        self.build_if_statements(func, &mut body, Some(&ctx))?;
                    }
                    self.chunk.stmts.get_mut(stmt_id).block = body;
                }
                _ => {}
            }
        }
        Ok(())
    }
}
