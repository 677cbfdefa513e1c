use relume_bytecode::opcode::Opcode;
use relume_hir::expr::{Expr, VarKind};
use relume_hir::func::FuncId;
use relume_hir::scope::{ScopeCell, INVALID_ID};
use relume_hir::stmt::{ConstantRank, StmtId, StmtKind};

use crate::collector::SlotScopeCollector;
use crate::condition_builder::{ConditionBuilder, ConditionMode, NodeKind};
use crate::error::{invariant, lift_assert, Result};
use crate::{BlockCtx, LiftError, Lifter};

impl<'m> Lifter<'m> {
    /// Slot elimination: forward substitution of single-use slot
    /// definitions into their consumers, method-call fusion, table
    /// constructor folding, and reconstruction of multi-block
    /// short-circuit assignments through the condition builder.
    pub(crate) fn eliminate_slots(
        &mut self,
        func: FuncId,
        collector: &mut SlotScopeCollector,
        block: &mut Vec<StmtId>,
        previous: Option<&BlockCtx<'_>>,
    ) -> Result<()> {
        let mut i = 0usize;
        while i < block.len() {
            let stmt_id = block[i];
            match self.chunk.stmts.get(stmt_id).kind {
                StmtKind::Condition => self.try_compare_swap(func, block, i),
                StmtKind::GenericFor | StmtKind::Declaration => {
                    self.merge_expression_list(func, collector, block, &mut i)?;
                }
                StmtKind::Assignment => self.retarget_table_store_slots(func, block, i),
                _ => {}
            }

            self.inline_open_slots(func, collector, block, &mut i)?;

            {
                let stmt_id = block[i];
                let stmt = self.chunk.stmts.get(stmt_id);
                let multres_left = stmt.assignment.open_slots.last().is_some_and(|&loc| {
                    self.chunk
                        .exprs
                        .get(loc)
                        .as_variable()
                        .is_some_and(|v| v.is_multres)
                });
                lift_assert!(
                    !multres_left,
                    self.fid(func),
                    "unable to eliminate multres slot"
                );
            }

            let stmt_id = block[i];
            match self.chunk.stmts.get(stmt_id).kind {
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
                        self.eliminate_slots(func, collector, &mut body, Some(&ctx))?;
                    }
                    self.chunk.stmts.get_mut(stmt_id).block = body;
                }
                StmtKind::Assignment => {
                    self.eliminate_assignment_slots(func, collector, block, &mut i, previous)?;
                }
                _ => {}
            }

            i += 1;
        }
        Ok(())
    }

    /// Ordered compares read more naturally with the freshly computed
    /// operand on the right; swap when the left side came from the
    /// immediately preceding single-use definition.
    fn try_compare_swap(&mut self, func: FuncId, block: &[StmtId], i: usize) {
        let stmt_id = block[i];
        let stmt = self.chunk.stmts.get(stmt_id);
        if !stmt.condition.allow_slot_swap
            || i == 0
            || self.has_attached_label(func, stmt_id)
        {
            return;
        }
        let Some(previous_slot) = self.single_slot_write(block[i - 1]) else {
            return;
        };
        let previous = self.chunk.stmts.get(block[i - 1]);
        if previous.kind != StmtKind::Assignment {
            return;
        }
        let Some(cell) = previous.assignment.variables[0].cell else {
            return;
        };
        if self.chunk.scopes.get(cell).usages != 1 {
            return;
        }
        let stmt = self.chunk.stmts.get(stmt_id);
        let lhs_slot = self
            .chunk
            .exprs
            .get(stmt.assignment.expressions[0])
            .as_variable()
            .map(|v| v.slot);
        if lhs_slot != Some(previous_slot) {
            return;
        }
        let stmt = self.chunk.stmts.get_mut(stmt_id);
        stmt.assignment.expressions.swap(0, 1);
        if stmt.assignment.open_slots.len() == 2 {
            stmt.assignment.open_slots.swap(0, 1);
        }
        stmt.condition.swapped = true;
    }

    /// Generic-for iterators and declaration initializers absorb the
    /// preceding extra-value assignments and a trailing multi-return
    /// producer into their expression list.
    fn merge_expression_list(
        &mut self,
        func: FuncId,
        collector: &mut SlotScopeCollector,
        block: &mut Vec<StmtId>,
        i: &mut usize,
    ) -> Result<()> {
        loop {
            if *i == 0 || self.has_attached_label(func, block[*i]) {
                return Ok(());
            }
            let stmt_id = block[*i];
            let previous_id = block[*i - 1];
            let previous_kind = self.chunk.stmts.get(previous_id).kind;

            if previous_kind == StmtKind::Assignment || previous_kind == StmtKind::FunctionCall {
                let open_len = self.chunk.stmts.get(stmt_id).assignment.open_slots.len();
                let boundary = self.chunk.stmts.get(stmt_id).assignment.expressions[open_len - 1];
                let boundary_slot = self
                    .chunk
                    .exprs
                    .get(boundary)
                    .as_variable()
                    .map(|v| v.slot)
                    .unwrap_or(0);

                let prepend = if previous_kind == StmtKind::Assignment {
                    let previous = self.chunk.stmts.get(previous_id);
                    let front_slot = previous
                        .assignment
                        .variables
                        .first()
                        .map(|v| v.slot)
                        .unwrap_or(0);
                    if front_slot <= boundary_slot {
                        false
                    } else {
                        let single_dead = previous.assignment.variables.len() == 1
                            && previous.assignment.variables[0]
                                .cell
                                .is_some_and(|c| self.chunk.scopes.get(c).usages == 0);
                        lift_assert!(
                            single_dead,
                            self.fid(func),
                            "invalid expression list assignment"
                        );
                        true
                    }
                } else {
                    true
                };

                if prepend {
                    let previous = self.chunk.stmts.get(previous_id);
                    let value = *invariant(
                        previous.assignment.expressions.last(),
                        self.fid(func),
                        "expression-list producer has no expression",
                    )?;
                    let used = previous.assignment.used_slots.clone();
                    let label = previous.instruction.attached_label;
                    let stmt = self.chunk.stmts.get_mut(stmt_id);
                    stmt.assignment.expressions.insert(open_len, value);
                    stmt.assignment.used_slots.extend(used);
                    stmt.instruction.attached_label = label;
                    *i -= 1;
                    block.remove(*i);
                    continue;
                }
            }

            if previous_kind == StmtKind::Assignment
                && self.chunk.stmts.get(previous_id).assignment.variables.len() != 1
            {
                // The preceding assignment is a multi-return producer whose
                // results feed the tail of this expression list: collapse
                // the consumed slot reads into the producer expression.
                let stmt = self.chunk.stmts.get(stmt_id);
                let previous = self.chunk.stmts.get(previous_id);
                let matches = stmt.assignment.expressions.len()
                    == stmt.assignment.open_slots.len()
                    && stmt
                        .assignment
                        .expressions
                        .last()
                        .and_then(|&e| self.chunk.exprs.get(e).as_variable().map(|v| v.slot))
                        == previous.assignment.variables.last().map(|v| v.slot);
                lift_assert!(
                    matches,
                    self.fid(func),
                    "invalid multres expression list assignment"
                );
                let first_slot = invariant(
                    previous.assignment.variables.first(),
                    self.fid(func),
                    "multi-return producer has no write variables",
                )?
                .slot;
                loop {
                    let last = *invariant(
                        self.chunk.stmts.get(stmt_id).assignment.expressions.last(),
                        self.fid(func),
                        "expression list drained below its producer",
                    )?;
                    let variable = invariant(
                        self.chunk.exprs.get(last).as_variable().cloned(),
                        self.fid(func),
                        "multi-return consumer is not a slot read",
                    )?;
                    if let Some(cell) = variable.cell {
                        collector.remove_scope(&mut self.chunk.scopes, variable.slot, cell);
                    }
                    self.chunk
                        .stmts
                        .get_mut(stmt_id)
                        .assignment
                        .open_slots
                        .pop();
                    if variable.slot != first_slot {
                        self.chunk
                            .stmts
                            .get_mut(stmt_id)
                            .assignment
                            .expressions
                            .pop();
                        continue;
                    }
                    let previous = self.chunk.stmts.get(previous_id);
                    let value = *invariant(
                        previous.assignment.expressions.last(),
                        self.fid(func),
                        "multi-return producer has no expression",
                    )?;
                    let used = previous.assignment.used_slots.clone();
                    let label = previous.instruction.attached_label;
                    let fid = self.fid(func);
                    let stmt = self.chunk.stmts.get_mut(stmt_id);
                    *invariant(
                        stmt.assignment.expressions.last_mut(),
                        fid,
                        "expression list drained below its producer",
                    )? = value;
                    stmt.assignment.used_slots.extend(used);
                    stmt.instruction.attached_label = label;
                    *i -= 1;
                    block.remove(*i);
                    break;
                }
            }

            // Re-anchor the open slots to the (possibly shifted) head of
            // the expression list.
            let stmt = self.chunk.stmts.get_mut(block[*i]);
            for j in 0..stmt.assignment.open_slots.len() {
                stmt.assignment.open_slots[j] = stmt.assignment.expressions[j];
            }
            return Ok(());
        }
    }

    /// `t[k] = v` with both `k` and `v` from adjacent single-use
    /// definitions and `t` from a constructor three statements back:
    /// reorder the open slots so the value inlines before the key.
    fn retarget_table_store_slots(&mut self, func: FuncId, block: &[StmtId], i: usize) {
        let stmt_id = block[i];
        let stmt = self.chunk.stmts.get(stmt_id);
        let Some(write) = stmt.assignment.variables.last() else {
            return;
        };
        if write.kind != VarKind::TableIndex || write.is_multres || i < 3 {
            return;
        }
        if self.has_attached_label(func, block[i])
            || self.has_attached_label(func, block[i - 1])
            || self.has_attached_label(func, block[i - 2])
        {
            return;
        }
        let key_slot = write
            .index
            .and_then(|e| self.chunk.exprs.get(e).as_variable().map(|v| v.slot));
        let value_slot = stmt
            .assignment
            .expressions
            .last()
            .and_then(|&e| self.chunk.exprs.get(e).as_variable().map(|v| v.slot));
        let table_slot = write
            .table
            .and_then(|e| self.chunk.exprs.get(e).as_variable().map(|v| v.slot));
        let (Some(key_slot), Some(value_slot), Some(table_slot)) =
            (key_slot, value_slot, table_slot)
        else {
            return;
        };

        let single_use = |stmt: StmtId| -> Option<(u8, relume_hir::expr::ExprId)> {
            let s = self.chunk.stmts.get(stmt);
            if s.kind != StmtKind::Assignment {
                return None;
            }
            let slot = self.single_slot_write(stmt)?;
            let cell = s.assignment.variables[0].cell?;
            if self.chunk.scopes.get(cell).usages != 1 {
                return None;
            }
            Some((slot, *s.assignment.expressions.last()?))
        };
        let Some((key_def_slot, key_value)) = single_use(block[i - 1]) else {
            return;
        };
        let Some((value_def_slot, value_value)) = single_use(block[i - 2]) else {
            return;
        };
        if key_def_slot != key_slot
            || !self.is_constant(key_value)
            || value_def_slot != value_slot
            || self.is_constant(value_value)
        {
            return;
        }
        let constructor = self.chunk.stmts.get(block[i - 3]);
        if !constructor.assignment.is_table_constructor
            || constructor.assignment.variables.last().map(|v| v.slot) != Some(table_slot)
        {
            return;
        }
        let multres_free = constructor
            .assignment
            .expressions
            .last()
            .is_some_and(|&e| match self.chunk.exprs.get(e) {
                Expr::Table(t) => t.multres_field.is_none(),
                _ => false,
            });
        if !multres_free {
            return;
        }

        let stmt = self.chunk.stmts.get(stmt_id);
        let value_loc = stmt.assignment.expressions.last().copied();
        let key_loc = stmt
            .assignment
            .variables
            .last()
            .and_then(|variable| variable.index);
        let (Some(value_loc), Some(key_loc)) = (value_loc, key_loc) else {
            return;
        };
        let stmt = self.chunk.stmts.get_mut(stmt_id);
        if stmt.assignment.open_slots.len() == 2 {
            stmt.assignment.open_slots[0] = value_loc;
            stmt.assignment.open_slots[1] = key_loc;
        }
    }

    /// The elimination contract: a single-use definition immediately
    /// preceding its only reader (no label between them) is inlined into
    /// the reader's open-slot location. Also hosts method-call fusion.
    fn inline_open_slots(
        &mut self,
        func: FuncId,
        collector: &mut SlotScopeCollector,
        block: &mut Vec<StmtId>,
        i: &mut usize,
    ) -> Result<()> {
        let mut j = self.chunk.stmts.get(block[*i]).assignment.open_slots.len();
        while j > 0 {
            j -= 1;
            if *i == 0 || self.has_attached_label(func, block[*i]) {
                break;
            }
            let eligible = |lifter: &Self, previous_id: StmtId| -> Option<(u8, ScopeCell)> {
                let previous = lifter.chunk.stmts.get(previous_id);
                if previous.kind != StmtKind::Assignment {
                    return None;
                }
                let slot = lifter.single_slot_write(previous_id)?;
                let cell = previous.assignment.variables[0].cell?;
                (lifter.chunk.scopes.get(cell).usages == 1).then_some((slot, cell))
            };
            if eligible(self, block[*i - 1]).is_none() {
                break;
            }

            if j == 1 {
                self.try_method_fusion(func, collector, block, i)?;
            }
            // Re-read: fusion may have erased a statement.
            let previous_id = block[*i - 1];
            let Some((previous_slot, previous_cell)) = eligible(self, previous_id) else {
                break;
            };

            let stmt = self.chunk.stmts.get(block[*i]);
            let location = stmt.assignment.open_slots[j];
            let Some(read) = self.chunk.exprs.get(location).as_variable().cloned() else {
                continue;
            };
            if previous_slot != read.slot {
                continue;
            }
            let previous_multres = self.chunk.stmts.get(previous_id).assignment.variables[0].is_multres;
            lift_assert!(
                previous_multres == read.is_multres,
                self.fid(func),
                "multres type mismatch when trying to eliminate slot"
            );

            let value = *invariant(
                self.chunk.stmts.get(previous_id).assignment.expressions.last(),
                self.fid(func),
                "single-use definition has no expression",
            )?;
            let saved = self.chunk.exprs.get(location).clone();
            self.chunk.exprs.replace_with(location, value);

            if j == 0 {
                let stmt = self.chunk.stmts.get(block[*i]);
                let allowed = stmt.assignment.allowed_constant_rank;
                let whole = stmt.assignment.expressions.last().copied();
                let refused = allowed != ConstantRank::Number
                    && whole.is_some_and(|whole| self.constant_rank(whole) > allowed);
                if refused {
                    self.chunk.exprs.set(location, saved);
                    break;
                }
            }

            collector.remove_scope(&mut self.chunk.scopes, previous_slot, previous_cell);
            let used = self
                .chunk
                .stmts
                .get(previous_id)
                .assignment
                .used_slots
                .clone();
            let label = self.chunk.stmts.get(previous_id).instruction.attached_label;
            let stmt = self.chunk.stmts.get_mut(block[*i]);
            stmt.assignment.used_slots.extend(used);
            stmt.instruction.attached_label = label;
            *i -= 1;
            block.remove(*i);
        }
        Ok(())
    }

    /// Detect `t := obj; m := t.name; t.m(t, ...)` and convert to a method
    /// call, dropping the receiver copy and its helper statements.
    fn try_method_fusion(
        &mut self,
        func: FuncId,
        collector: &mut SlotScopeCollector,
        block: &mut Vec<StmtId>,
        i: &mut usize,
    ) -> Result<()> {
        let stmt_id = block[*i];
        let stmt = self.chunk.stmts.get(stmt_id);
        if !stmt.assignment.is_potential_method || *i < 2 {
            return Ok(());
        }
        if self.has_attached_label(func, block[*i - 1]) {
            return Ok(());
        }
        let Some(&call_expr_id) = stmt.assignment.expressions.last() else {
            return Ok(());
        };
        let Expr::Call(call) = self.chunk.exprs.get(call_expr_id) else {
            return Ok(());
        };
        if call.is_method || call.arguments.is_empty() {
            return Ok(());
        }
        let Some(function_loc) = call.function else {
            return Ok(());
        };
        let first_argument_loc = call.arguments[0];
        let function_slot = match self.chunk.exprs.get(function_loc).as_variable() {
            Some(v) => v.slot,
            None => return Ok(()),
        };
        let first_argument_slot = match self.chunk.exprs.get(first_argument_loc).as_variable() {
            Some(v) => v.slot,
            None => return Ok(()),
        };

        // m := t.name, with a string key that is a valid identifier.
        let method_id = block[*i - 1];
        let method = self.chunk.stmts.get(method_id);
        let Some(method_slot) = self.single_slot_write(method_id) else {
            return Ok(());
        };
        if method_slot != function_slot || method.assignment.used_slots.len() != 1 {
            return Ok(());
        }
        let Some(&method_value) = method.assignment.expressions.last() else {
            return Ok(());
        };
        let Expr::Variable(method_variable) = self.chunk.exprs.get(method_value) else {
            return Ok(());
        };
        if method_variable.kind != VarKind::TableIndex {
            return Ok(());
        }
        let Some(method_table) = method_variable.table else {
            return Ok(());
        };
        let Some(table_variable) = self.chunk.exprs.get(method_table).as_variable() else {
            return Ok(());
        };
        if table_variable.kind != VarKind::Slot {
            return Ok(());
        }
        let method_table_slot = table_variable.slot;
        let name_is_valid = method_variable
            .index
            .map(|e| match self.chunk.exprs.get(e) {
                Expr::Constant(c) => c.is_name(),
                _ => false,
            })
            .unwrap_or(false);
        if !name_is_valid {
            return Ok(());
        }

        // t := obj, feeding both the method lookup and the first argument.
        let receiver_id = block[*i - 2];
        let receiver = self.chunk.stmts.get(receiver_id);
        let Some(receiver_slot) = self.single_slot_write(receiver_id) else {
            return Ok(());
        };
        let Some(receiver_cell) = receiver.assignment.variables[0].cell else {
            return Ok(());
        };
        if self.chunk.scopes.get(receiver_cell).usages != 1
            || receiver_slot != first_argument_slot
            || receiver.assignment.used_slots.len() != 1
        {
            return Ok(());
        }
        let Some(&receiver_value) = receiver.assignment.expressions.last() else {
            return Ok(());
        };
        let receiver_source = match self.chunk.exprs.get(receiver_value).as_variable() {
            Some(v) if v.kind == VarKind::Slot => v.clone(),
            _ => return Ok(()),
        };
        if receiver_source.slot != method_table_slot {
            return Ok(());
        }

        // Fuse.
        if let Expr::Call(call) = self.chunk.exprs.get_mut(call_expr_id) {
            call.is_method = true;
            call.arguments.remove(0);
        }
        let stmt = self.chunk.stmts.get_mut(stmt_id);
        if let Some(pos) = stmt
            .assignment
            .open_slots
            .iter()
            .position(|&l| l == first_argument_loc)
        {
            stmt.assignment.open_slots.remove(pos);
        }
        stmt.assignment.open_slots.insert(0, method_table);
        collector.remove_scope(&mut self.chunk.scopes, receiver_slot, receiver_cell);
        let receiver_label = self.chunk.stmts.get(receiver_id).instruction.attached_label;
        self.chunk.stmts.get_mut(method_id).instruction.attached_label = receiver_label;
        if let Some(cell) = receiver_source.cell {
            let usages = &mut self.chunk.scopes.get_mut(cell).usages;
            *usages = usages.saturating_sub(1);
        }
        *i -= 1;
        block.remove(*i - 1);
        Ok(())
    }

    /// Statement-level elimination for plain assignments: rebuild
    /// multi-block short-circuit expressions into the definition, and fold
    /// table stores into their constructor.
    fn eliminate_assignment_slots(
        &mut self,
        func: FuncId,
        collector: &mut SlotScopeCollector,
        block: &mut Vec<StmtId>,
        i: &mut usize,
        previous: Option<&BlockCtx<'_>>,
    ) -> Result<()> {
        let stmt_id = block[*i];
        let stmt = self.chunk.stmts.get(stmt_id);
        if stmt.assignment.variables.len() != 1 {
            return Ok(());
        }
        match stmt.assignment.variables[0].kind {
            VarKind::Slot => {
                self.rebuild_assignment_condition(func, collector, block, i, previous)
            }
            VarKind::TableIndex => self.fold_table_store(func, collector, block, i),
            _ => Ok(()),
        }
    }

    fn fold_table_store(
        &mut self,
        func: FuncId,
        collector: &mut SlotScopeCollector,
        block: &mut Vec<StmtId>,
        i: &mut usize,
    ) -> Result<()> {
        let stmt_id = block[*i];
        let write = self.chunk.stmts.get(stmt_id).assignment.variables[0].clone();
        let table_slot = write
            .table
            .and_then(|e| self.chunk.exprs.get(e).as_variable().map(|v| v.slot));

        if *i > 0 && !self.has_attached_label(func, block[*i]) {
            let previous_id = block[*i - 1];
            let previous_kind = self.chunk.stmts.get(previous_id).kind;
            let previous_slot = self.single_slot_write(previous_id);
            if previous_kind == StmtKind::Assignment
                && previous_slot.is_some()
                && previous_slot == table_slot
            {
                let previous = self.chunk.stmts.get(previous_id);
                let constructor_value = *invariant(
                    previous.assignment.expressions.last(),
                    self.fid(func),
                    "table constructor has no expression",
                )?;
                let is_constructor = previous.assignment.is_table_constructor
                    && matches!(
                        self.chunk.exprs.get(constructor_value),
                        Expr::Table(t) if t.multres_field.is_none()
                    );

                if is_constructor {
                    let key_rank = write
                        .index
                        .map(|e| self.constant_rank(e))
                        .unwrap_or(ConstantRank::Number);
                    let value = *invariant(
                        self.chunk.stmts.get(stmt_id).assignment.expressions.last(),
                        self.fid(func),
                        "table store has no value expression",
                    )?;
                    let foldable = write.is_multres
                        || key_rank <= ConstantRank::Nil
                        || !self.is_constant(value);

                    if foldable {
                        // The store must not have consumed any slot other
                        // than the table base itself.
                        let stmt = self.chunk.stmts.get_mut(stmt_id);
                        let mut j = stmt.assignment.used_slots.len();
                        let mut saw_base = false;
                        while j > 0 {
                            j -= 1;
                            if Some(stmt.assignment.used_slots[j]) == table_slot {
                                saw_base = true;
                                break;
                            }
                            stmt.assignment.used_slots.remove(j);
                        }
                        if !saw_base && stmt.assignment.used_slots.is_empty() {
                            let fid = self.fid(func);
                            if write.is_multres {
                                if let Expr::Table(table) =
                                    self.chunk.exprs.get_mut(constructor_value)
                                {
                                    table.multres_index = write.multres_index;
                                    table.multres_field = Some(value);
                                }
                            } else {
                                let key = invariant(
                                    write.index,
                                    fid,
                                    "table store has no key expression",
                                )?;
                                if let Expr::Table(table) =
                                    self.chunk.exprs.get_mut(constructor_value)
                                {
                                    table.fields.push(relume_hir::expr::TableField { key, value });
                                }
                            }
                            let previous_cell = invariant(
                                self.chunk.stmts.get(previous_id).assignment.variables[0].cell,
                                fid,
                                "table constructor has no scope",
                            )?;
                            let usages = &mut self.chunk.scopes.get_mut(previous_cell).usages;
                            *usages = usages.saturating_sub(1);
                            block.remove(*i);
                            *i -= 1;
                            return Ok(());
                        }
                    }
                }

                let previous_cell = self.chunk.stmts.get(previous_id).assignment.variables[0].cell;
                if !write.is_multres
                    && previous_cell
                        .is_some_and(|c| self.chunk.scopes.get(c).usages == 1)
                {
                    // Inline the table base itself.
                    let value = *invariant(
                        self.chunk.stmts.get(previous_id).assignment.expressions.last(),
                        self.fid(func),
                        "table base definition has no expression",
                    )?;
                    let label = self.chunk.stmts.get(previous_id).instruction.attached_label;
                    let stmt = self.chunk.stmts.get_mut(stmt_id);
                    stmt.assignment.variables[0].table = Some(value);
                    stmt.instruction.attached_label = label;
                    if let (Some(slot), Some(cell)) = (previous_slot, previous_cell) {
                        collector.remove_scope(&mut self.chunk.scopes, slot, cell);
                    }
                    *i -= 1;
                    block.remove(*i);
                    return Ok(());
                }
            }
        }

        lift_assert!(
            !write.is_multres,
            self.fid(func),
            "unable to eliminate multres table index"
        );
        Ok(())
    }

    /// A slot definition whose scope has several usages spanning a region
    /// bracketed by jumps to the following label is the materialization of
    /// a short-circuit expression: rebuild it with the condition builder
    /// and collapse the region into the definition.
    fn rebuild_assignment_condition(
        &mut self,
        func: FuncId,
        collector: &mut SlotScopeCollector,
        block: &mut Vec<StmtId>,
        i: &mut usize,
        previous: Option<&BlockCtx<'_>>,
    ) -> Result<()> {
        let stmt_id = block[*i];
        let instruction = self.chunk.stmts.get(stmt_id).instruction;
        if instruction.id == INVALID_ID {
            return Ok(());
        }
        let (target_label, extended_label) = {
            let ctx = BlockCtx {
                index: *i,
                block,
                previous,
            };
            (
                self.label_from_next_statement(func, &ctx, false, true),
                self.label_from_next_statement(func, &ctx, true, true),
            )
        };
        if !self.chunk.func(func).is_valid_label(target_label) {
            return Ok(());
        }
        let jump_first = self.chunk.func(func).label(target_label).jump_ids[0];
        let target_target = self.chunk.func(func).label(target_label).target;
        if jump_first > instruction.id {
            return Ok(());
        }

        let cell = invariant(
            self.chunk.stmts.get(stmt_id).assignment.variables[0].cell,
            self.fid(func),
            "slot definition has no scope",
        )?;
        if self.chunk.scopes.get(cell).usages < 2 {
            // A single-use definition here feeds either the next statement
            // (handled by the open-slot pass) or a following declaration;
            // the latter stays an explicit assignment.
            return Ok(());
        }

        let scope_begin = self.chunk.scopes.get(cell).scope_begin;
        let extended_target = if extended_label == target_label {
            target_target
        } else if self.chunk.func(func).is_valid_label(extended_label) {
            self.chunk.func(func).label(extended_label).target
        } else {
            return Ok(());
        };
        if scope_begin >= jump_first
            || (extended_label != target_label
                && (extended_target <= instruction.id || extended_target >= jump_first))
        {
            return Ok(());
        }

        let start = self.block_index_of_id(block, jump_first.wrapping_sub(1));
        if start == INVALID_ID {
            return Ok(());
        }
        let mut index = start as usize;
        let mut index_valid = true;

        match self.chunk.stmts.get(block[index]).kind {
            StmtKind::Condition => {
                let boundary = self.chunk.stmts.get(block[index]);
                if let Some(variable) = boundary.assignment.variables.last() {
                    let ok = variable.cell.is_some_and(|c| {
                        self.chunk.scopes.get(c).scope_begin == boundary.instruction.id
                            && self.chunk.scopes.same_scope(c, cell)
                    });
                    if !ok {
                        index_valid = false;
                    }
                } else {
                    let ok = index > 0
                        && boundary.assignment.expressions.len() == 1
                        && !self.has_attached_label(func, block[index])
                        && {
                            let p = self.chunk.stmts.get(block[index - 1]);
                            p.kind == StmtKind::Assignment
                                && self.single_slot_write(block[index - 1]).is_some()
                                && p.assignment.variables[0].cell.is_some_and(|c| {
                                    self.chunk.scopes.get(c).scope_begin == p.instruction.id
                                        && self.chunk.scopes.same_scope(c, cell)
                                })
                        };
                    if !ok {
                        index_valid = false;
                    }
                }
            }
            StmtKind::Assignment => {
                let boundary = self.chunk.stmts.get(block[index]);
                let ok = self.single_slot_write(block[index]).is_some()
                    && boundary.assignment.variables[0].cell.is_some_and(|c| {
                        self.chunk.scopes.get(c).scope_begin == boundary.instruction.id
                            && self.chunk.scopes.same_scope(c, cell)
                    })
                    && boundary
                        .assignment
                        .expressions
                        .last()
                        .is_some_and(|&e| {
                            matches!(self.chunk.exprs.get(e), Expr::Constant(_))
                                && self.is_constant(e)
                        });
                if !ok {
                    index_valid = false;
                }
            }
            _ => {}
        }
        if !index_valid {
            return Ok(());
        }

        // Bool-construct recognition around the definition.
        let mut has_bool = false;
        if *i >= 3 && self.bool_construct_tail(block, *i, target_target, cell) {
            match self.chunk.stmts.get(block[*i - 3]).kind {
                StmtKind::Condition => {
                    let third = self.chunk.stmts.get(block[*i - 3]);
                    if third.assignment.expressions.len() == 2
                        && third.instruction.target == instruction.id
                    {
                        has_bool = true;
                    }
                }
                StmtKind::Goto | StmtKind::Break => {
                    let third = self.chunk.stmts.get(block[*i - 3]);
                    let labeled = self.has_attached_label(func, block[*i])
                        || self.has_attached_label(func, block[*i - 2]);
                    if *i >= 5
                        && third.instruction.op == Opcode::Jmp
                        && third.instruction.target == extended_target
                        && labeled
                        && self.single_slot_write(block[*i - 4])
                            == Some(self.chunk.stmts.get(stmt_id).assignment.variables[0].slot)
                    {
                        if index == *i - 2 && !self.has_attached_label(func, block[*i]) {
                            let false_label = self
                                .chunk
                                .stmts
                                .get(block[*i - 2])
                                .instruction
                                .attached_label;
                            if self.chunk.func(func).is_valid_label(false_label) {
                                let first =
                                    self.chunk.func(func).label(false_label).jump_ids[0];
                                if first <= self.chunk.stmts.get(block[*i - 2]).instruction.id {
                                    let moved = self
                                        .block_index_of_id(block, first.wrapping_sub(1));
                                    index = if moved == INVALID_ID {
                                        *i - 2
                                    } else {
                                        moved as usize
                                    };
                                    has_bool = moved != INVALID_ID;
                                } else {
                                    has_bool = true;
                                }
                            }
                        } else {
                            has_bool = true;
                        }
                    }
                }
                _ => {}
            }

            if has_bool {
                // Every jump into the construct's labels must come from a
                // plain condition.
                for probe in [*i, *i - 2] {
                    let label = self.chunk.stmts.get(block[probe]).instruction.attached_label;
                    if !self.chunk.func(func).is_valid_label(label) {
                        continue;
                    }
                    let jump_ids = self.chunk.func(func).label(label).jump_ids.clone();
                    let re_entered = jump_ids.last().is_some_and(|&last| {
                        last >= self.chunk.stmts.get(block[probe]).instruction.id
                    });
                    if re_entered {
                        return Ok(());
                    }
                    for jump in jump_ids {
                        let source = self.block_index_of_id(block, jump.wrapping_sub(1));
                        if source == INVALID_ID {
                            return Ok(());
                        }
                        let source = self.chunk.stmts.get(block[source as usize]);
                        if source.kind != StmtKind::Condition {
                            return Ok(());
                        }
                        if probe == *i && !source.assignment.variables.is_empty() {
                            return Ok(());
                        }
                        if source.assignment.expressions.is_empty() {
                            has_bool = false;
                            break;
                        }
                        if probe == *i - 2 && !source.assignment.variables.is_empty() {
                            has_bool = false;
                            break;
                        }
                    }
                }
            }
        }

        // No label inside the region may be entered from outside it.
        {
            let mut j = *i;
            while index_valid
                && self.chunk.stmts.get(block[index]).instruction.id
                    < self.chunk.stmts.get(block[j]).instruction.id
            {
                let label = self.chunk.stmts.get(block[j]).instruction.attached_label;
                if self.chunk.func(func).is_valid_label(label) {
                    let jump_ids = self.chunk.func(func).label(label).jump_ids.clone();
                    let re_entered = jump_ids.last().is_some_and(|&last| {
                        last >= self.chunk.stmts.get(block[j]).instruction.id
                    });
                    if re_entered {
                        index_valid = false;
                        break;
                    }
                    while jump_ids[0] < self.chunk.stmts.get(block[index]).instruction.id {
                        if index == 0 {
                            index_valid = false;
                            break;
                        }
                        index -= 1;
                    }
                }
                j -= 1;
            }
        }
        if !index_valid {
            return Ok(());
        }

        // Step over a leading jump to the target label.
        {
            let head = self.chunk.stmts.get(block[index]);
            let steppable = match head.kind {
                StmtKind::Condition => head.assignment.variables.is_empty(),
                StmtKind::Goto | StmtKind::Break => true,
                _ => false,
            };
            if steppable && head.instruction.target == target_target && index > 0 {
                index -= 1;
            }
        }

        let (true_label, false_label) = if has_bool {
            (
                self.chunk.stmts.get(block[*i]).instruction.attached_label,
                self.chunk.stmts.get(block[*i - 2]).instruction.attached_label,
            )
        } else {
            (INVALID_ID, INVALID_ID)
        };
        let mut builder = ConditionBuilder::new(
            ConditionMode::Assignment,
            target_label,
            true_label,
            false_label,
        );
        let build_end = if has_bool {
            if self.chunk.stmts.get(block[*i - 3]).kind == StmtKind::Goto {
                *i - 4
            } else {
                *i - 2
            }
        } else {
            *i
        };

        let mut j = index;
        while j < build_end {
            let node_stmt = block[j];
            let s = self.chunk.stmts.get(node_stmt);
            match s.kind {
                StmtKind::Condition => {
                    let bad = s.instruction.target <= s.instruction.id
                        || s.instruction.target > target_target
                        || if s.instruction.target == target_target {
                            s.assignment.variables.is_empty()
                                || !s.assignment.variables[0]
                                    .cell
                                    .is_some_and(|c| self.chunk.scopes.same_scope(c, cell))
                        } else {
                            !s.assignment.variables.is_empty()
                        };
                    if bad {
                        return Ok(());
                    }
                    let node_kind =
                        NodeKind::from_opcode(s.instruction.op, s.condition.swapped);
                    let exit = self.chunk.func(func).label_at(s.instruction.target);
                    let operands = s.assignment.expressions.clone();
                    builder.add_node(
                        node_kind,
                        s.instruction.attached_label,
                        exit,
                        operands,
                    );
                }
                StmtKind::Assignment => {
                    let same = s.assignment.variables.len() == 1
                        && s.assignment.variables[0].kind == VarKind::Slot
                        && s.assignment.variables[0]
                            .cell
                            .is_some_and(|c| self.chunk.scopes.same_scope(c, cell));
                    if !same
                        || j + 1 == build_end
                        || self.has_attached_label(func, block[j + 1])
                    {
                        return Ok(());
                    }
                    let assign_label = s.instruction.attached_label;
                    let assign_exprs = s.assignment.expressions.clone();
                    j += 1;
                    let follower = self.chunk.stmts.get(block[j]);
                    match follower.kind {
                        StmtKind::Condition => {
                            let ok = follower.instruction.target == target_target
                                && follower.assignment.variables.is_empty()
                                && follower.assignment.expressions.len() == 1
                                && follower
                                    .assignment
                                    .expressions
                                    .last()
                                    .and_then(|&e| self.chunk.exprs.get(e).as_variable())
                                    .and_then(|v| v.cell)
                                    .is_some_and(|c| self.chunk.scopes.same_scope(c, cell));
                            if !ok {
                                return Ok(());
                            }
                            let node_kind = NodeKind::from_opcode(
                                follower.instruction.op,
                                follower.condition.swapped,
                            );
                            let exit =
                                self.chunk.func(func).label_at(follower.instruction.target);
                            builder.add_node(node_kind, assign_label, exit, assign_exprs);
                        }
                        StmtKind::Goto | StmtKind::Break => {
                            let Some(&stored) = assign_exprs.last() else {
                                return Ok(());
                            };
                            let ok = follower.instruction.op == Opcode::Jmp
                                && follower.instruction.target == target_target
                                && matches!(self.chunk.exprs.get(stored), Expr::Constant(_))
                                && self.is_constant(stored);
                            if !ok {
                                return Ok(());
                            }
                            let truthy = !matches!(
                                self.chunk.exprs.get(stored),
                                Expr::Constant(relume_hir::expr::Constant::Nil)
                                    | Expr::Constant(relume_hir::expr::Constant::False)
                            );
                            let exit = self
                                .chunk
                                .func(func)
                                .label_at(follower.instruction.target);
                            builder.add_node(
                                if truthy {
                                    NodeKind::TruthyTest
                                } else {
                                    NodeKind::FalsyTest
                                },
                                assign_label,
                                exit,
                                assign_exprs,
                            );
                        }
                        _ => return Ok(()),
                    }
                }
                _ => return Ok(()),
            }
            j += 1;
        }

        if !has_bool {
            let s = self.chunk.stmts.get(block[*i]);
            builder.add_node(
                NodeKind::TruthyTest,
                s.instruction.attached_label,
                target_label,
                s.assignment.expressions.clone(),
            );
        } else if self.chunk.stmts.get(block[*i - 3]).kind == StmtKind::Goto {
            let s = self.chunk.stmts.get(block[*i - 4]);
            builder.add_node(
                NodeKind::TruthyTest,
                s.instruction.attached_label,
                target_label,
                s.assignment.expressions.clone(),
            );
        }

        let built = builder
            .build_condition(self)
            .ok_or_else(|| LiftError::UnrecognizedIdiom {
                function: self.fid(func),
                message: format!("failed to build condition in function {}", self.chunk.func(func).id),
            })?;
        let fid = self.fid(func);
        *invariant(
            self.chunk
                .stmts
                .get_mut(stmt_id)
                .assignment
                .expressions
                .last_mut(),
            fid,
            "condition definition has no expression",
        )? = built;

        for j in index..*i {
            let s = self.chunk.stmts.get(block[j]);
            let (kind, sid, target, has_vars) = (
                s.kind,
                s.instruction.id,
                s.instruction.target,
                !s.assignment.variables.is_empty(),
            );
            match kind {
                StmtKind::Condition => {
                    if target == target_target {
                        let usages = &mut self.chunk.scopes.get_mut(cell).usages;
                        *usages = usages.saturating_sub(1);
                    }
                    self.chunk.func_mut(func).remove_jump(sid + 1, target);
                    if has_vars {
                        self.chunk.func_mut(func).remove_jump(sid, sid + 2);
                    }
                }
                StmtKind::Goto | StmtKind::Break => {
                    self.chunk.func_mut(func).remove_jump(sid, target);
                }
                StmtKind::Assignment => {
                    let usages = &mut self.chunk.scopes.get_mut(cell).usages;
                    *usages = usages.saturating_sub(1);
                }
                _ => {}
            }
        }

        let head_label = self.chunk.stmts.get(block[index]).instruction.attached_label;
        self.chunk.stmts.get_mut(stmt_id).instruction.attached_label = head_label;
        block.drain(index..*i);
        *i = index;
        Ok(())
    }

    /// `r := false; goto L; r := true` directly before the definition.
    fn bool_construct_tail(
        &self,
        block: &[StmtId],
        i: usize,
        target_target: u32,
        cell: ScopeCell,
    ) -> bool {
        let last = self.chunk.stmts.get(block[i]);
        let second = self.chunk.stmts.get(block[i - 1]);
        let first = self.chunk.stmts.get(block[i - 2]);
        let last_true = last
            .assignment
            .expressions
            .last()
            .is_some_and(|&e| {
                matches!(
                    self.chunk.exprs.get(e),
                    Expr::Constant(relume_hir::expr::Constant::True)
                )
            });
        let first_false = first
            .assignment
            .expressions
            .last()
            .is_some_and(|&e| {
                matches!(
                    self.chunk.exprs.get(e),
                    Expr::Constant(relume_hir::expr::Constant::False)
                )
            });
        last_true
            && matches!(second.kind, StmtKind::Goto | StmtKind::Break)
            && second.instruction.op == Opcode::Jmp
            && second.instruction.target == target_target
            && first.kind == StmtKind::Assignment
            && first_false
            && first.assignment.variables.len() == 1
            && first.assignment.variables[0].kind == VarKind::Slot
            && first.assignment.variables[0]
                .cell
                .is_some_and(|c| self.chunk.scopes.same_scope(c, cell))
    }
}
