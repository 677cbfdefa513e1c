use relume_bytecode::opcode::Opcode;
use relume_hir::expr::{Constant, Expr, VarKind, Variable};
use relume_hir::func::FuncId;
use relume_hir::scope::INVALID_ID;
use relume_hir::stmt::{InstrInfo, Stmt, StmtId, StmtKind};

use crate::collector::SlotScopeCollector;
use crate::error::{invariant, lift_assert, Result};
use crate::{BlockCtx, Lifter};

impl<'m> Lifter<'m> {
    /// Slot-scope collection: a reverse walk that computes, for every
    /// slot, the instruction range over which it carries one logical
    /// value. Loop and declaration boundaries open and close scopes;
    /// labels widen them across jump edges; a backward label into a
    /// single-use definition triggers the conditional-assignment idiom
    /// detector, which re-collects candidate sub-ranges so the scope is
    /// shared across all branches of a short-circuit expression.
    pub(crate) fn collect_slot_scopes(
        &mut self,
        func: FuncId,
        collector: &mut SlotScopeCollector,
        block: &mut Vec<StmtId>,
        previous: Option<&BlockCtx<'_>>,
    ) -> Result<()> {
        let mut i = block.len();
        while i > 0 {
            i -= 1;
            let stmt_id = block[i];
            let kind = self.chunk.stmts.get(stmt_id).kind;

            match kind {
                StmtKind::NumericFor | StmtKind::GenericFor | StmtKind::Loop => {
                    let instruction = self.chunk.stmts.get(stmt_id).instruction;
                    if kind != StmtKind::Loop {
                        let variables = self.chunk.stmts.get(stmt_id).assignment.variables.clone();
                        for variable in variables.iter().rev() {
                            lift_assert!(
                                collector.slot_infos[variable.slot as usize].active.is_none(),
                                self.fid(func),
                                "slot scope does not match with for loop variable"
                            );
                            collector.begin_scope(
                                &mut self.chunk.scopes,
                                variable.slot,
                                instruction.target - 1,
                            );
                        }
                    }
                    collector.extend_scopes(instruction.id);
                    let mut body = std::mem::take(&mut self.chunk.stmts.get_mut(stmt_id).block);
                    {
                        let ctx = BlockCtx {
                            index: i,
                            block,
                            previous,
                        };
                        self.collect_slot_scopes(func, collector, &mut body, Some(&ctx))?;
                    }
                    self.chunk.stmts.get_mut(stmt_id).block = body;
                    collector.merge_scopes(&mut self.chunk.scopes, instruction.target);
                }
                StmtKind::Declaration => {
                    self.chunk.stmts.get_mut(stmt_id).instruction.id = INVALID_ID;
                    let group_index =
                        self.chunk.stmts.get(stmt_id).locals.unwrap_or(0) as usize;
                    let group = &self.chunk.func(func).locals[group_index];
                    let (base_slot, scope_begin, scope_end) =
                        (group.base_slot, group.scope_begin, group.scope_end);

                    // Debug info promises slots above the declared base are
                    // live here; if the walk found reads with no assignment,
                    // make the value explicit with synthesized nil stores
                    // after the declaration.
                    let mut j = collector.slot_infos.len();
                    while j > base_slot as usize {
                        j -= 1;
                        if collector.slot_infos[j].active.is_none() {
                            continue;
                        }
                        let mut k = j;
                        loop {
                            lift_assert!(
                                collector.slot_infos[k].active.is_some()
                                    && collector.slot_infos[k].min_scope_begin == INVALID_ID,
                                self.fid(func),
                                "slot scope does not match with variable debug info"
                            );
                            let nil_id = self.new_nil_assignment(k as u8);
                            block.insert(i + 1, nil_id);
                            let cell = collector.complete_scope(
                                &mut self.chunk.scopes,
                                k as u8,
                                scope_end,
                            );
                            self.chunk.stmts.get_mut(nil_id).assignment.variables[0].cell =
                                Some(cell);
                            if k == base_slot as usize {
                                break;
                            }
                            k -= 1;
                        }
                        break;
                    }

                    let variables = self.chunk.stmts.get(stmt_id).assignment.variables.clone();
                    for variable in variables.iter().rev() {
                        collector.begin_scope(&mut self.chunk.scopes, variable.slot, scope_end);
                    }
                    collector.extend_scopes(scope_begin);

                    let mut body = std::mem::take(&mut self.chunk.stmts.get_mut(stmt_id).block);
                    {
                        let ctx = BlockCtx {
                            index: i,
                            block,
                            previous,
                        };
                        self.collect_slot_scopes(func, collector, &mut body, Some(&ctx))?;
                    }

                    // Same synthesis inside the body for slots above the
                    // last declared one.
                    let last_slot = variables.last().map(|v| v.slot).unwrap_or(base_slot);
                    let mut j = collector.slot_infos.len();
                    while j > last_slot as usize + 1 {
                        j -= 1;
                        if collector.slot_infos[j].active.is_none() {
                            continue;
                        }
                        let mut k = j;
                        loop {
                            lift_assert!(
                                collector.slot_infos[k].active.is_some()
                                    && collector.slot_infos[k].min_scope_begin == INVALID_ID,
                                self.fid(func),
                                "slot scope does not match with variable debug info"
                            );
                            let nil_id = self.new_nil_assignment(k as u8);
                            body.insert(0, nil_id);
                            let cell = collector.complete_scope(
                                &mut self.chunk.scopes,
                                k as u8,
                                scope_begin,
                            );
                            self.chunk.stmts.get_mut(nil_id).assignment.variables[0].cell =
                                Some(cell);
                            if k == last_slot as usize + 1 {
                                break;
                            }
                            k -= 1;
                        }
                        break;
                    }
                    self.chunk.stmts.get_mut(stmt_id).block = body;
                }
                _ => {}
            }

            let instruction = self.chunk.stmts.get(stmt_id).instruction;
            let id;
            if instruction.id != INVALID_ID {
                id = instruction.id;
                if let Some(consumed) =
                    self.detect_condition_idiom(func, collector, block, previous, i)?
                {
                    i = consumed;
                    continue;
                }
            } else {
                id = collector.previous_id.wrapping_sub(1);
            }

            collector.begin_upvalue_scopes(&mut self.chunk.scopes, id);

            // Upvalue captures of a nested function read the captured
            // slots at the FNEW site.
            if let Some(child) = self.chunk.stmts.get(stmt_id).function {
                let bindings = self.chunk.func(child).upvalues.clone();
                for (j, binding) in bindings.iter().enumerate().rev() {
                    if !binding.local {
                        continue;
                    }
                    let write_slot = self
                        .chunk
                        .stmts
                        .get(stmt_id)
                        .assignment
                        .variables
                        .last()
                        .map(|v| v.slot);
                    if write_slot == Some(binding.slot) {
                        self.chunk.func_mut(child).assignment_slot_is_upvalue = true;
                    }
                    self.chunk
                        .stmts
                        .get_mut(stmt_id)
                        .assignment
                        .used_slots
                        .push(binding.slot);
                    let cell = collector.add_to_scope(&mut self.chunk.scopes, binding.slot, id);
                    self.chunk.func_mut(child).upvalues[j].cell = Some(cell);
                }
            }

            let variable_count = self.chunk.stmts.get(stmt_id).assignment.variables.len();
            for j in (0..variable_count).rev() {
                let variable = self.chunk.stmts.get(stmt_id).assignment.variables[j].clone();
                match variable.kind {
                    VarKind::Slot => {
                        let cell =
                            collector.complete_scope(&mut self.chunk.scopes, variable.slot, id);
                        self.chunk.stmts.get_mut(stmt_id).assignment.variables[j].cell =
                            Some(cell);
                    }
                    VarKind::TableIndex => {
                        let table = invariant(
                            variable.table,
                            self.fid(func),
                            "table-index write has no base expression",
                        )?;
                        let slot = self
                            .chunk
                            .exprs
                            .get(table)
                            .as_variable()
                            .map(|v| v.slot)
                            .unwrap_or(0);
                        let cell = collector.add_to_scope(&mut self.chunk.scopes, slot, id);
                        if let Some(v) = self.chunk.exprs.get_mut(table).as_variable_mut() {
                            v.cell = Some(cell);
                        }
                    }
                    _ => {}
                }
            }

            {
                let stmt = self.chunk.stmts.get(stmt_id);
                if let Some(first) = stmt.assignment.variables.first() {
                    if first.kind == VarKind::Slot && first.is_multres {
                        let cell = invariant(
                            first.cell,
                            self.fid(func),
                            "multres write variable has no scope",
                        )?;
                        let info = &collector.slot_infos[first.slot as usize];
                        let distinct = match info.active {
                            None => true,
                            Some(active) => !self.chunk.scopes.same_scope(active, cell),
                        };
                        lift_assert!(
                            self.chunk.scopes.get(cell).usages == 1 && distinct,
                            self.fid(func),
                            "multres assignment has invalid number of usages"
                        );
                    }
                }
            }

            // A declaration whose declared slot is still scoped above it
            // is initializing a value captured before the declaration
            // (typically a local function referring to itself); rebind the
            // declared variable to that outer scope.
            if kind == StmtKind::Declaration {
                let last = self
                    .chunk
                    .stmts
                    .get(stmt_id)
                    .assignment
                    .variables
                    .last()
                    .cloned();
                if let Some(last) = last {
                    if collector.slot_infos[last.slot as usize].active.is_some() {
                        let saved = collector.slot_infos[last.slot as usize].min_scope_begin;
                        collector.slot_infos[last.slot as usize].min_scope_begin = INVALID_ID;
                        let cell =
                            collector.complete_scope(&mut self.chunk.scopes, last.slot, id);
                        let index = self.chunk.stmts.get(stmt_id).assignment.variables.len() - 1;
                        self.chunk.stmts.get_mut(stmt_id).assignment.variables[index].cell =
                            Some(cell);
                        let usages = &mut self.chunk.scopes.get_mut(cell).usages;
                        *usages = usages.saturating_sub(1);
                        collector.slot_infos[last.slot as usize].min_scope_begin = saved;
                    }
                }
            }

            let open_count = self.chunk.stmts.get(stmt_id).assignment.open_slots.len();
            for j in (0..open_count).rev() {
                let location = self.chunk.stmts.get(stmt_id).assignment.open_slots[j];
                let slot = match self.chunk.exprs.get(location).as_variable() {
                    Some(v) => v.slot,
                    None => continue,
                };
                let cell = collector.add_to_scope(&mut self.chunk.scopes, slot, id);
                if let Some(v) = self.chunk.exprs.get_mut(location).as_variable_mut() {
                    v.cell = Some(cell);
                }
            }

            if instruction.id != INVALID_ID {
                collector.previous_id = id;
                let label = instruction.attached_label;
                if self.chunk.func(func).is_valid_label(label) {
                    let end = self.chunk.func(func).scope_end_from_label(label);
                    collector.merge_scopes(&mut self.chunk.scopes, end);
                    let begin = self.chunk.func(func).scope_begin_from_label(label, end);
                    collector.extend_scopes(begin);
                }
            }
        }
        Ok(())
    }

    fn new_nil_assignment(&mut self, slot: u8) -> StmtId {
        let mut stmt = Stmt::new(StmtKind::Assignment, InstrInfo::synthetic(Opcode::KPri));
        let nil = self.chunk.exprs.alloc(Expr::Constant(Constant::Nil));
        stmt.assignment.expressions = vec![nil];
        stmt.assignment.variables = vec![Variable::slot(slot)];
        self.chunk.stmts.alloc(stmt)
    }
}
