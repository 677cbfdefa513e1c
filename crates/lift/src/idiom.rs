use relume_bytecode::opcode::Opcode;
use relume_hir::expr::{Constant, Expr, VarKind};
use relume_hir::func::FuncId;
use relume_hir::scope::INVALID_ID;
use relume_hir::stmt::{StmtId, StmtKind};

use crate::collector::SlotScopeCollector;
use crate::error::{invariant, Result};
use crate::{BlockCtx, Lifter};

impl<'m> Lifter<'m> {
    /// Conditional-assignment idiom detection (the recursive arm of the
    /// collection pass).
    ///
    /// A label pointing backwards from beyond the current statement into a
    /// single-use slot definition means the slot's value may flow across
    /// several linear segments of a short-circuit expression. The detector
    /// validates the candidate region, splits it into segments at the
    /// jumps that share the target label, and re-collects each segment
    /// with the target slot's scope re-shared across them, so one scope
    /// spans every branch. Returns the walk index to resume from when the
    /// region was consumed.
    pub(super) fn detect_condition_idiom(
        &mut self,
        func: FuncId,
        collector: &mut SlotScopeCollector,
        block: &mut Vec<StmtId>,
        previous: Option<&BlockCtx<'_>>,
        i: usize,
    ) -> Result<Option<usize>> {
        let stmt_id = block[i];
        let stmt_kind = self.chunk.stmts.get(stmt_id).kind;
        let id = self.chunk.stmts.get(stmt_id).instruction.id;

        let (target_label, extended_label) = {
            let ctx = BlockCtx {
                index: i,
                block,
                previous,
            };
            (
                self.label_from_next_statement(func, &ctx, false, true),
                self.label_from_next_statement(func, &ctx, true, true),
            )
        };

        if !self.chunk.func(func).is_valid_label(target_label) {
            return Ok(None);
        }
        let target_jump_first = self.chunk.func(func).label(target_label).jump_ids[0];
        let target_target = self.chunk.func(func).label(target_label).target;
        if target_jump_first >= id {
            return Ok(None);
        }
        let extended_target = if extended_label == target_label {
            target_target
        } else if self.chunk.func(func).is_valid_label(extended_label) {
            self.chunk.func(func).label(extended_label).target
        } else {
            return Ok(None);
        };
        if extended_label != target_label
            && !(extended_target > id || extended_target < target_jump_first)
        {
            return Ok(None);
        }

        let start_index = self.block_index_of_id(block, target_jump_first.wrapping_sub(1));
        if start_index == INVALID_ID {
            return Ok(None);
        }
        let mut index = start_index as usize;

        let mut is_possible = false;
        let mut has_bool = false;
        let mut target_slot = 0u8;

        match stmt_kind {
            StmtKind::Condition => {
                let stmt = self.chunk.stmts.get(stmt_id);
                if stmt.assignment.variables.is_empty()
                    && stmt.instruction.target == extended_target
                {
                    let boundary = self.chunk.stmts.get(block[index]);
                    match boundary.kind {
                        StmtKind::Condition => {
                            if boundary.assignment.expressions.len() == 1 {
                                if let Some(variable) = boundary.assignment.variables.last() {
                                    let info = &collector.slot_infos[variable.slot as usize];
                                    if info.active.is_some()
                                        && info.min_scope_begin == boundary.instruction.id
                                    {
                                        is_possible = true;
                                        target_slot = variable.slot;
                                    }
                                } else if let Some(variable) = self
                                    .chunk
                                    .exprs
                                    .get(boundary.assignment.expressions[0])
                                    .as_variable()
                                {
                                    let info = &collector.slot_infos[variable.slot as usize];
                                    if info.active.is_some()
                                        && info.min_scope_begin == boundary.instruction.id
                                    {
                                        is_possible = true;
                                        target_slot = variable.slot;
                                    }
                                }
                            }
                        }
                        StmtKind::Assignment => {
                            if let Some(slot) = self.single_slot_write(block[index]) {
                                let info = &collector.slot_infos[slot as usize];
                                let constant = boundary
                                    .assignment
                                    .expressions
                                    .last()
                                    .copied()
                                    .map(|e| self.is_constant(e))
                                    .unwrap_or(false);
                                if info.active.is_some()
                                    && info.min_scope_begin == boundary.instruction.id
                                    && constant
                                {
                                    is_possible = true;
                                    target_slot = slot;
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            StmtKind::Assignment => {
                let stmt = self.chunk.stmts.get(stmt_id);
                if stmt.assignment.variables.len() == 1 {
                    let variable = stmt.assignment.variables[0].clone();
                    match variable.kind {
                        VarKind::Slot => {
                            let info = &collector.slot_infos[variable.slot as usize];
                            if info.active.is_some()
                                && info.min_scope_begin
                                    == self.chunk.stmts.get(block[index]).instruction.id
                            {
                                is_possible = true;
                                target_slot = variable.slot;
                                has_bool = i >= 5
                                    && index <= i - 4
                                    && self.bool_construct_head(block, i, target_target, extended_target, id)
                                    && (self.has_attached_label(func, block[i])
                                        || self.has_attached_label(func, block[i - 2]));
                            }
                        }
                        VarKind::TableIndex => {
                            if let Some(table) = variable.table {
                                if let Some(v) = self.chunk.exprs.get(table).as_variable() {
                                    let info = &collector.slot_infos[v.slot as usize];
                                    if info.active.is_some()
                                        && info.min_scope_begin
                                            == self.chunk.stmts.get(block[index]).instruction.id
                                    {
                                        is_possible = true;
                                        target_slot = v.slot;
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }

        if !is_possible {
            return Ok(None);
        }

        let mut condition_blocks: Vec<Vec<StmtId>> = Vec::new();
        if has_bool {
            condition_blocks.push(vec![block[i]]);
            condition_blocks.push(vec![block[i - 2], block[i - 1]]);
            index = if self.chunk.stmts.get(block[i - 3]).kind == StmtKind::Condition {
                i - 3
            } else {
                i - 4
            };
        } else {
            index = i;
        }

        // Establish that the leftmost candidate statement really produces
        // the target slot (directly, or through a table constructor whose
        // population forms a clean block).
        if !has_bool || index == i - 4 {
            is_possible = false;
            let bound_index = if has_bool { i - 4 } else { i };
            let bound_id = self.chunk.stmts.get(block[bound_index]).instruction.id;
            let head = self.chunk.stmts.get(block[index]);

            if head.kind == StmtKind::Assignment
                && self.single_slot_write(block[index]).is_some()
            {
                if self.single_slot_write(block[index]) == Some(target_slot) {
                    is_possible = true;
                }
            } else if self.table_index_write_slot(block[index]) == Some(target_slot)
                || (head.kind == StmtKind::Condition
                    && head.instruction.target == extended_target
                    && head.assignment.variables.is_empty())
            {
                while index > 0 {
                    index -= 1;
                    let s = self.chunk.stmts.get(block[index]);
                    match s.kind {
                        StmtKind::Condition
                            if s.assignment.variables.is_empty()
                                && s.instruction.target == extended_target =>
                        {
                            continue;
                        }
                        StmtKind::Condition | StmtKind::Goto | StmtKind::Break => {
                            if s.instruction.target == target_target
                                || s.instruction.target == extended_target
                                || s.instruction.target > bound_id
                            {
                                break;
                            }
                            continue;
                        }
                        StmtKind::Assignment
                            if self.single_slot_write(block[index]) == Some(target_slot) =>
                        {
                            let s = self.chunk.stmts.get(block[index]);
                            if s.assignment.is_table_constructor
                                && (has_bool || s.instruction.id > target_jump_first)
                                && collector.is_valid_block_range(
                                    self.chunk.stmts.get(block[index + 1]).instruction.id,
                                    bound_id,
                                )
                            {
                                is_possible = true;
                            }
                            break;
                        }
                        _ => continue,
                    }
                }
            }
        }

        // Split the region into segments at the jumps sharing the target
        // label, walking backwards until the segment before the first jump
        // source is reached.
        let mut block_index = if has_bool { i - 3 } else { i };
        while is_possible {
            if self.chunk.stmts.get(block[index]).instruction.id < target_jump_first {
                condition_blocks.push(block[index..=block_index].to_vec());
                break;
            }
            is_possible = false;

            while index > 0 {
                index -= 1;
                let s = self.chunk.stmts.get(block[index]);
                let jumps_to_target = matches!(
                    s.kind,
                    StmtKind::Condition | StmtKind::Goto | StmtKind::Break
                ) && s.instruction.target == target_target;
                if !jumps_to_target {
                    continue;
                }

                condition_blocks.push(block[index + 1..=block_index].to_vec());
                block_index = index;

                match self.chunk.stmts.get(block[index]).kind {
                    StmtKind::Condition => {
                        let s = self.chunk.stmts.get(block[index]);
                        if s.assignment.expressions.len() != 1 {
                            break;
                        }
                        if let Some(variable) = s.assignment.variables.last() {
                            if variable.slot == target_slot {
                                is_possible = true;
                            }
                        } else if self
                            .chunk
                            .exprs
                            .get(s.assignment.expressions[0])
                            .as_variable()
                            .map(|v| v.slot)
                            == Some(target_slot)
                        {
                            if index == 0 {
                                break;
                            }
                            index -= 1;
                            let p = self.chunk.stmts.get(block[index]);
                            let labeled_next = self.has_attached_label(func, block[index + 1]);
                            if p.kind == StmtKind::Assignment
                                && self.single_slot_write(block[index]).is_some()
                            {
                                if self.single_slot_write(block[index]) == Some(target_slot)
                                    && !labeled_next
                                {
                                    is_possible = true;
                                }
                            } else if (self.table_index_write_slot(block[index])
                                == Some(target_slot)
                                && !labeled_next)
                                || (p.kind == StmtKind::Condition
                                    && p.instruction.target
                                        == self.chunk.stmts.get(block[block_index]).instruction.id
                                    && p.assignment.variables.is_empty())
                            {
                                let inner_bound =
                                    self.chunk.stmts.get(block[block_index]).instruction.id;
                                while index > 0 {
                                    index -= 1;
                                    let s = self.chunk.stmts.get(block[index]);
                                    match s.kind {
                                        StmtKind::Condition
                                            if s.assignment.variables.is_empty()
                                                && s.instruction.target == inner_bound =>
                                        {
                                            continue;
                                        }
                                        StmtKind::Condition
                                        | StmtKind::Goto
                                        | StmtKind::Break => {
                                            if s.instruction.target == target_target
                                                || s.instruction.target == extended_target
                                                || s.instruction.target >= inner_bound
                                            {
                                                break;
                                            }
                                            continue;
                                        }
                                        StmtKind::Assignment
                                            if self.single_slot_write(block[index])
                                                == Some(target_slot) =>
                                        {
                                            let s = self.chunk.stmts.get(block[index]);
                                            if s.assignment.is_table_constructor
                                                && collector.is_valid_block_range(
                                                    self.chunk
                                                        .stmts
                                                        .get(block[index + 1])
                                                        .instruction
                                                        .id,
                                                    inner_bound,
                                                )
                                            {
                                                is_possible = true;
                                            }
                                            break;
                                        }
                                        _ => continue,
                                    }
                                }
                            }
                        }
                        break;
                    }
                    StmtKind::Goto | StmtKind::Break => {
                        if index == 0 {
                            break;
                        }
                        index -= 1;
                        let p = self.chunk.stmts.get(block[index]);
                        let constant = p
                            .assignment
                            .expressions
                            .last()
                            .copied()
                            .map(|e| self.is_constant(e))
                            .unwrap_or(false);
                        if self.single_slot_write(block[index]) == Some(target_slot) && constant {
                            is_possible = true;
                        }
                        break;
                    }
                    _ => break,
                }
            }
        }

        if !is_possible {
            return Ok(None);
        }

        // Every statement inside the region must be benign: slot or
        // table-index assignments, or control transfers that stay inside
        // or exit through the recognized labels.
        for j in index..=i {
            let s = self.chunk.stmts.get(block[j]);
            let ok = match s.kind {
                StmtKind::Assignment => {
                    s.assignment.variables.len() == 1
                        && matches!(
                            s.assignment.variables[0].kind,
                            VarKind::Slot | VarKind::TableIndex
                        )
                }
                StmtKind::Goto | StmtKind::Break => {
                    s.instruction.op == Opcode::Jmp
                        && (s.instruction.target == target_target
                            || s.instruction.target == extended_target
                            || (s.instruction.target <= id
                                && s.instruction.target > s.instruction.id))
                }
                StmtKind::Condition => {
                    s.instruction.target == target_target
                        || s.instruction.target == extended_target
                        || (s.instruction.target <= id
                            && s.instruction.target > s.instruction.id)
                }
                StmtKind::Empty
                | StmtKind::Return
                | StmtKind::NumericFor
                | StmtKind::GenericFor
                | StmtKind::Loop
                | StmtKind::Declaration
                | StmtKind::FunctionCall => false,
                _ => true,
            };
            if !ok {
                return Ok(None);
            }
        }

        // Segment sanity: no label may re-enter a segment from outside it.
        for segment in condition_blocks.iter().rev() {
            let (Some(&front_id), Some(&back_id)) = (segment.first(), segment.last()) else {
                return Ok(None);
            };
            if segment.len() > 1 {
                let inner_begin = self.chunk.stmts.get(segment[1]).instruction.id;
                let inner_end = self.chunk.stmts.get(back_id).instruction.id;
                if !collector.is_valid_block_range(inner_begin, inner_end) {
                    return Ok(None);
                }
            }
            let front = self.chunk.stmts.get(front_id);
            if self.chunk.func(func).is_valid_label(front.instruction.attached_label) {
                let re_entered = self
                    .chunk
                    .func(func)
                    .label(front.instruction.attached_label)
                    .jump_ids
                    .last()
                    .is_some_and(|&last| last >= front.instruction.id);
                if re_entered {
                    return Ok(None);
                }
            }
        }

        // Commit: re-collect each segment with the target slot's scope
        // re-shared, merging any sub-scopes the segments opened.
        let target_cell = invariant(
            collector.slot_infos[target_slot as usize].active,
            self.fid(func),
            "condition idiom lost its active scope",
        )?;
        collector.slot_infos[target_slot as usize].min_scope_begin = INVALID_ID;
        let mut walk = i + 1;

        for (j, segment) in condition_blocks.iter().enumerate() {
            let tail_is_condition = segment
                .last()
                .is_some_and(|&s| self.chunk.stmts.get(s).kind == StmtKind::Condition);
            if j > 0 && (!has_bool || j != 2 || !tail_is_condition) {
                self.chunk.scopes.get_mut(target_cell).usages += 1;
                collector.slot_infos[target_slot as usize].active = Some(target_cell);
            }

            let mut sub = segment.clone();
            self.collect_slot_scopes(func, collector, &mut sub, None)?;
            walk -= sub.len();

            if collector.slot_infos[target_slot as usize].active.is_none()
                || j == condition_blocks.len() - 1
            {
                continue;
            }

            while collector.slot_infos[target_slot as usize].stack.last() != Some(&target_cell) {
                let top = invariant(
                    collector.slot_infos[target_slot as usize].stack.last().copied(),
                    self.fid(func),
                    "scope stack lost the shared condition scope",
                )?;
                let absorbed = self.chunk.scopes.get(top).usages;
                self.chunk.scopes.get_mut(target_cell).usages += absorbed + 1;
                let survivor = self.chunk.scopes.id_of(target_cell);
                self.chunk.scopes.redirect(top, survivor);
                collector.slot_infos[target_slot as usize].stack.pop();
            }
            collector.slot_infos[target_slot as usize].active = Some(target_cell);
            collector.slot_infos[target_slot as usize].min_scope_begin = self
                .chunk
                .func(func)
                .scope_begin_from_label(target_label, self.chunk.scopes.get(target_cell).scope_end);
            break;
        }

        Ok(Some(walk))
    }

    fn bool_construct_head(
        &self,
        block: &[StmtId],
        i: usize,
        target_target: u32,
        extended_target: u32,
        own_id: u32,
    ) -> bool {
        let third = self.chunk.stmts.get(block[i - 3]);
        let head_ok = match third.kind {
            StmtKind::Goto | StmtKind::Break => third.instruction.target == extended_target,
            StmtKind::Condition => {
                third.assignment.expressions.len() == 2 && third.instruction.target == own_id
            }
            _ => false,
        };
        if !head_ok {
            return false;
        }
        let last = self.chunk.stmts.get(block[i]);
        let second = self.chunk.stmts.get(block[i - 1]);
        let first = self.chunk.stmts.get(block[i - 2]);
        self.expr_is(last.assignment.expressions.last(), &Constant::True)
            && matches!(second.kind, StmtKind::Goto | StmtKind::Break)
            && second.instruction.target == target_target
            && first.kind == StmtKind::Assignment
            && self.expr_is(first.assignment.expressions.last(), &Constant::False)
    }

    fn expr_is(&self, expr: Option<&relume_hir::expr::ExprId>, expected: &Constant) -> bool {
        expr.is_some_and(|&e| match self.chunk.exprs.get(e) {
            Expr::Constant(c) => c == expected,
            _ => false,
        })
    }

    pub(crate) fn has_attached_label(&self, func: FuncId, stmt: StmtId) -> bool {
        let label = self.chunk.stmts.get(stmt).instruction.attached_label;
        self.chunk.func(func).is_valid_label(label)
    }

    /// The written slot when the statement assigns exactly one slot-kind
    /// variable.
    pub(crate) fn single_slot_write(&self, stmt: StmtId) -> Option<u8> {
        let assignment = &self.chunk.stmts.get(stmt).assignment;
        match assignment.variables.as_slice() {
            [v] if v.kind == VarKind::Slot => Some(v.slot),
            _ => None,
        }
    }

    /// The base-table slot when the statement assigns exactly one
    /// table-index variable.
    pub(crate) fn table_index_write_slot(&self, stmt: StmtId) -> Option<u8> {
        let assignment = &self.chunk.stmts.get(stmt).assignment;
        match assignment.variables.as_slice() {
            [v] if v.kind == VarKind::TableIndex => v
                .table
                .and_then(|t| self.chunk.exprs.get(t).as_variable())
                .map(|v| v.slot),
            _ => None,
        }
    }
}
