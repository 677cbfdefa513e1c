use relume_bytecode::opcode::Opcode;
use relume_hir::expr::{Expr, VarKind};
use relume_hir::func::FuncId;
use relume_hir::scope::INVALID_ID;
use relume_hir::stmt::{StmtId, StmtKind};

use crate::condition_builder::{ConditionBuilder, ConditionMode, NodeKind};
use crate::error::{invariant, lift_assert, Result};
use crate::{BlockCtx, LiftError, Lifter};

impl<'m> Lifter<'m> {
    /// Condition elimination: first collapse remaining assignment-shaped
    /// condition regions (test-and-copy chains, bool constructs) into
    /// their definitions, then merge runs of consecutive conditions that
    /// share an exit into single composite conditions.
    pub(crate) fn eliminate_conditions(
        &mut self,
        func: FuncId,
        block: &mut Vec<StmtId>,
        previous: Option<&BlockCtx<'_>>,
    ) -> Result<()> {
        self.eliminate_assignment_conditions(func, block, previous)?;
        self.merge_statement_conditions(func, block, previous)
    }

    /// Test-and-copy conditions and constant-assignment jumps feeding one
    /// slot collapse into a single assignment of the rebuilt expression.
    fn eliminate_assignment_conditions(
        &mut self,
        func: FuncId,
        block: &mut Vec<StmtId>,
        previous: Option<&BlockCtx<'_>>,
    ) -> Result<()> {
        let mut i = block.len();
        while i > 0 {
            i -= 1;
            let stmt_id = block[i];
            let instruction = self.chunk.stmts.get(stmt_id).instruction;
            if instruction.id == INVALID_ID {
                continue;
            }
            let (target_label, extended_label) = {
                let ctx = BlockCtx {
                    index: i,
                    block,
                    previous,
                };
                (
                    self.label_from_next_statement(func, &ctx, false, false),
                    self.label_from_next_statement(func, &ctx, true, false),
                )
            };
            if !self.chunk.func(func).is_valid_label(target_label) {
                continue;
            }
            let jump_ids = self.chunk.func(func).label(target_label).jump_ids.clone();
            let target_target = self.chunk.func(func).label(target_label).target;
            if jump_ids[0] > instruction.id {
                continue;
            }

            // Locate the anchor assignment that receives the merged
            // expression.
            let assignment_index = match self.chunk.stmts.get(stmt_id).kind {
                StmtKind::Condition => {
                    let mut found = None;
                    for &jump in jump_ids.iter().rev() {
                        if jump > instruction.id {
                            continue;
                        }
                        let source = self.block_index_of_id(block, jump);
                        if source == INVALID_ID {
                            break;
                        }
                        let source = source as usize;
                        let s = self.chunk.stmts.get(block[source]);
                        match s.kind {
                            StmtKind::Condition => {
                                if s.assignment.variables.is_empty() {
                                    // A plain condition cannot anchor the
                                    // value; keep scanning earlier jump
                                    // sources only for slot-test shapes.
                                    let slot_test = s.assignment.expressions.len() == 1
                                        && s.assignment
                                            .expressions
                                            .last()
                                            .and_then(|&e| {
                                                self.chunk.exprs.get(e).as_variable()
                                            })
                                            .is_some_and(|v| v.kind == VarKind::Slot);
                                    if target_label == extended_label || slot_test {
                                        continue;
                                    }
                                    break;
                                }
                                found = Some(source);
                                break;
                            }
                            StmtKind::Assignment => {
                                let constant_store = source + 1 < block.len()
                                    && self.chunk.stmts.get(block[source + 1]).instruction.op
                                        == Opcode::Jmp
                                    && self.single_slot_write(block[source]).is_some()
                                    && s.assignment.expressions.last().is_some_and(|&e| {
                                        matches!(self.chunk.exprs.get(e), Expr::Constant(_))
                                            && !self.is_constant(e)
                                    });
                                if constant_store {
                                    found = Some(source);
                                }
                                break;
                            }
                            _ => break,
                        }
                    }
                    match found {
                        Some(index) => index,
                        None => continue,
                    }
                }
                StmtKind::Goto | StmtKind::Break => {
                    let anchors = i > 0
                        && instruction.op == Opcode::Jmp
                        && instruction.target == target_target
                        && self.chunk.stmts.get(block[i - 1]).kind == StmtKind::Assignment
                        && self.single_slot_write(block[i - 1]).is_some()
                        && self
                            .chunk
                            .stmts
                            .get(block[i - 1])
                            .assignment
                            .expressions
                            .last()
                            .is_some_and(|&e| {
                                matches!(self.chunk.exprs.get(e), Expr::Constant(_))
                                    && self.is_constant(e)
                            });
                    if !anchors {
                        continue;
                    }
                    i - 1
                }
                StmtKind::Assignment => {
                    if self.single_slot_write(stmt_id).is_none() {
                        continue;
                    }
                    i
                }
                _ => continue,
            };

            let target_slot = match self.single_slot_write(block[assignment_index]) {
                Some(slot) => slot,
                None => continue,
            };

            // Bool-construct recognition at the tail.
            let mut has_bool = false;
            let mut index = assignment_index;
            if i >= 3
                && self.chunk.stmts.get(stmt_id).kind == StmtKind::Assignment
                && self.tail_is_bool_construct(block, i, target_target, target_slot)
            {
                match self.chunk.stmts.get(block[i - 3]).kind {
                    StmtKind::Condition => {
                        let third = self.chunk.stmts.get(block[i - 3]);
                        if third.assignment.expressions.len() == 2
                            && third.instruction.target == instruction.id
                        {
                            has_bool = true;
                        }
                    }
                    StmtKind::Goto | StmtKind::Break => {
                        let third = self.chunk.stmts.get(block[i - 3]);
                        let extended_target = if self.chunk.func(func).is_valid_label(extended_label)
                        {
                            self.chunk.func(func).label(extended_label).target
                        } else {
                            INVALID_ID
                        };
                        if i >= 4
                            && third.instruction.op == Opcode::Jmp
                            && third.instruction.target == extended_target
                            && (self.has_attached_label(func, block[i])
                                || self.has_attached_label(func, block[i - 2]))
                        {
                            if index == i - 2 && !self.has_attached_label(func, block[i]) {
                                let false_label = self
                                    .chunk
                                    .stmts
                                    .get(block[i - 2])
                                    .instruction
                                    .attached_label;
                                if self.chunk.func(func).is_valid_label(false_label)
                                    && self.chunk.func(func).label(false_label).jump_ids[0]
                                        >= self.chunk.stmts.get(block[i - 2]).instruction.id
                                {
                                    let moved = self.block_index_of_id(
                                        block,
                                        self.chunk.func(func).label(false_label).jump_ids[0]
                                            .wrapping_sub(1),
                                    );
                                    if moved != INVALID_ID {
                                        index = moved as usize;
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

                if has_bool && !self.bool_labels_are_clean(func, block, i) {
                    continue;
                }
            }

            // Walk the jump sources, extending the region backwards as far
            // as every covered statement stays benign; remember the
            // furthest valid region start.
            let has_end_assignment = if has_bool {
                self.chunk.stmts.get(block[i - 3]).kind == StmtKind::Condition
                    || self.chunk.stmts.get(block[i - 4]).kind == StmtKind::Assignment
            } else {
                self.chunk.stmts.get(stmt_id).kind == StmtKind::Assignment
            };
            let build_end = if has_bool {
                if self.chunk.stmts.get(block[i - 3]).kind == StmtKind::Goto {
                    i - if has_end_assignment { 4 } else { 3 }
                } else {
                    i - 2
                }
            } else if has_end_assignment {
                i
            } else {
                i + 1
            };

            let mut previous_valid_index: Option<usize> = None;
            for (j, &jump) in jump_ids.iter().enumerate().rev() {
                if jump > instruction.id {
                    continue;
                }
                if j > 0
                    && jump_ids[j - 1] < self.chunk.stmts.get(block[index]).instruction.id
                {
                    // An earlier jump source extends the region further; the
                    // next iteration validates the wider extent.
                    continue;
                }
                if jump < self.chunk.stmts.get(block[index]).instruction.id {
                    let moved = self.block_index_of_id(block, jump.wrapping_sub(1));
                    if moved == INVALID_ID {
                        break;
                    }
                    index = moved as usize;
                }

                // No label inside the region may be entered from outside.
                let mut escaped = false;
                {
                    let mut k = i;
                    while self.chunk.stmts.get(block[index]).instruction.id
                        < self.chunk.stmts.get(block[k]).instruction.id
                    {
                        let label = self.chunk.stmts.get(block[k]).instruction.attached_label;
                        if self.chunk.func(func).is_valid_label(label) {
                            let ids = self.chunk.func(func).label(label).jump_ids.clone();
                            let re_entered = ids
                                .last()
                                .is_some_and(|&last| {
                                    last >= self.chunk.stmts.get(block[k]).instruction.id
                                });
                            if re_entered {
                                escaped = true;
                                break;
                            }
                            while ids[0] < self.chunk.stmts.get(block[index]).instruction.id {
                                if index == 0 {
                                    escaped = true;
                                    break;
                                }
                                index -= 1;
                            }
                            if escaped {
                                break;
                            }
                        }
                        k -= 1;
                    }
                }
                if escaped {
                    break;
                }

                {
                    let head = self.chunk.stmts.get(block[index]);
                    if matches!(head.kind, StmtKind::Goto | StmtKind::Break)
                        && head.instruction.target == target_target
                        && index > 0
                    {
                        index -= 1;
                    }
                }

                if !self.region_statements_benign(
                    func,
                    block,
                    index,
                    build_end,
                    target_slot,
                    target_target,
                    extended_label,
                    has_end_assignment,
                ) {
                    break;
                }
                previous_valid_index = Some(index);
            }

            let Some(region_start) = previous_valid_index else {
                continue;
            };
            index = region_start;

            // Build the composite expression.
            let (true_label, false_label) = if has_bool {
                (
                    self.chunk.stmts.get(block[i]).instruction.attached_label,
                    self.chunk.stmts.get(block[i - 2]).instruction.attached_label,
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

            let mut j = index;
            while j < build_end && j < block.len() {
                let s = self.chunk.stmts.get(block[j]);
                match s.kind {
                    StmtKind::Condition => {
                        let exit = self.chunk.func(func).label_at(s.instruction.target);
                        builder.add_node(
                            NodeKind::from_opcode(s.instruction.op, s.condition.swapped),
                            s.instruction.attached_label,
                            exit,
                            s.assignment.expressions.clone(),
                        );
                    }
                    StmtKind::Assignment => {
                        // Constant store followed by the jump to the sink.
                        let truthy = s
                            .assignment
                            .expressions
                            .last()
                            .map(|&e| {
                                !matches!(
                                    self.chunk.exprs.get(e),
                                    Expr::Constant(relume_hir::expr::Constant::Nil)
                                        | Expr::Constant(relume_hir::expr::Constant::False)
                                )
                            })
                            .unwrap_or(false);
                        let label = s.instruction.attached_label;
                        let operands = s.assignment.expressions.clone();
                        let exit = if j + 1 < block.len() {
                            self.chunk
                                .func(func)
                                .label_at(self.chunk.stmts.get(block[j + 1]).instruction.target)
                        } else {
                            INVALID_ID
                        };
                        builder.add_node(
                            if truthy {
                                NodeKind::TruthyTest
                            } else {
                                NodeKind::FalsyTest
                            },
                            label,
                            exit,
                            operands,
                        );
                        j += 1;
                    }
                    _ => {}
                }
                j += 1;
            }

            if has_end_assignment {
                if !has_bool {
                    let s = self.chunk.stmts.get(block[i]);
                    builder.add_node(
                        NodeKind::TruthyTest,
                        s.instruction.attached_label,
                        target_label,
                        s.assignment.expressions.clone(),
                    );
                } else if self.chunk.stmts.get(block[i - 3]).kind == StmtKind::Goto {
                    let s = self.chunk.stmts.get(block[i - 4]);
                    builder.add_node(
                        NodeKind::TruthyTest,
                        s.instruction.attached_label,
                        target_label,
                        s.assignment.expressions.clone(),
                    );
                }
            } else {
                // The value escapes through the tested slot itself.
                let slot_expr = self.new_slot(target_slot);
                let cell = self.chunk.stmts.get(block[assignment_index]).assignment.variables
                    [0]
                .cell;
                if let Some(v) = self.chunk.exprs.get_mut(slot_expr).as_variable_mut() {
                    v.cell = cell;
                }
                builder.add_node(
                    NodeKind::TruthyTest,
                    INVALID_ID,
                    target_label,
                    vec![slot_expr],
                );
            }

            let built = builder.build_condition(self).ok_or_else(|| {
                LiftError::UnrecognizedIdiom {
                    function: self.fid(func),
                    message: format!(
                        "failed to build condition in function {}",
                        self.chunk.func(func).id
                    ),
                }
            })?;

            let fid = self.fid(func);
            let anchor_id = block[assignment_index];
            *invariant(
                self.chunk
                    .stmts
                    .get_mut(anchor_id)
                    .assignment
                    .expressions
                    .last_mut(),
                fid,
                "condition anchor has no expression",
            )? = built;

            let anchor_cell = invariant(
                self.chunk.stmts.get(anchor_id).assignment.variables[0].cell,
                fid,
                "condition anchor has no scope",
            )?;

            // Retire the region's jump edges and merge every participating
            // scope into the anchor's.
            for k in index..i {
                let s = self.chunk.stmts.get(block[k]);
                let (kind, sid, target) = (s.kind, s.instruction.id, s.instruction.target);
                match kind {
                    StmtKind::Condition => {
                        self.chunk.func_mut(func).remove_jump(sid + 1, target);
                        let has_vars = !self
                            .chunk
                            .stmts
                            .get(block[k])
                            .assignment
                            .variables
                            .is_empty();
                        if !has_vars {
                            continue;
                        }
                        self.chunk.func_mut(func).remove_jump(sid, sid + 2);
                        self.merge_scope_into(block[k], anchor_cell);
                    }
                    StmtKind::Assignment => {
                        self.merge_scope_into(block[k], anchor_cell);
                    }
                    StmtKind::Goto | StmtKind::Break => {
                        self.chunk.func_mut(func).remove_jump(sid, target);
                    }
                    _ => {}
                }
            }

            let head_label = self.chunk.stmts.get(block[index]).instruction.attached_label;
            block[i] = anchor_id;
            {
                let anchor = self.chunk.stmts.get_mut(anchor_id);
                anchor.kind = StmtKind::Assignment;
                anchor.instruction.attached_label = head_label;
            }
            let region_entry_id = self.chunk.stmts.get(block[index]).instruction.id;
            if self.chunk.scopes.get(anchor_cell).scope_begin >= region_entry_id {
                self.chunk
                    .stmts
                    .get_mut(anchor_id)
                    .assignment
                    .needs_forward_declaration = true;
            }
            block.drain(index..i);
            i = index;
        }
        Ok(())
    }

    fn merge_scope_into(&mut self, stmt: StmtId, anchor_cell: relume_hir::scope::ScopeCell) {
        let Some(variable) = self.chunk.stmts.get(stmt).assignment.variables.last() else {
            return;
        };
        let Some(cell) = variable.cell else { return };
        if self.chunk.scopes.same_scope(cell, anchor_cell) {
            return;
        }
        let absorbed = self.chunk.scopes.get(cell).clone();
        let survivor = self.chunk.scopes.get_mut(anchor_cell);
        survivor.usages += absorbed.usages;
        if absorbed.scope_begin < survivor.scope_begin {
            survivor.scope_begin = absorbed.scope_begin;
        }
        if absorbed.scope_end != INVALID_ID && absorbed.scope_end > survivor.scope_end {
            survivor.scope_end = absorbed.scope_end;
        }
        let survivor_id = self.chunk.scopes.id_of(anchor_cell);
        self.chunk.scopes.redirect(cell, survivor_id);
    }

    fn tail_is_bool_construct(
        &self,
        block: &[StmtId],
        i: usize,
        target_target: u32,
        target_slot: u8,
    ) -> bool {
        let last = self.chunk.stmts.get(block[i]);
        let second = self.chunk.stmts.get(block[i - 1]);
        let first = self.chunk.stmts.get(block[i - 2]);
        let last_true = last.assignment.expressions.last().is_some_and(|&e| {
            matches!(
                self.chunk.exprs.get(e),
                Expr::Constant(relume_hir::expr::Constant::True)
            )
        });
        let first_false = first.assignment.expressions.last().is_some_and(|&e| {
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
            && self.single_slot_write(block[i - 2]) == Some(target_slot)
    }

    /// All jumps into a bool construct's true/false labels must come from
    /// plain conditions.
    fn bool_labels_are_clean(&self, func: FuncId, block: &[StmtId], i: usize) -> bool {
        for probe in [i, i - 2] {
            let stmt = self.chunk.stmts.get(block[probe]);
            let label = stmt.instruction.attached_label;
            if !self.chunk.func(func).is_valid_label(label) {
                continue;
            }
            let jump_ids = self.chunk.func(func).label(label).jump_ids.clone();
            if jump_ids
                .last()
                .is_some_and(|&last| last >= stmt.instruction.id)
            {
                return false;
            }
            for jump in jump_ids {
                let source = self.block_index_of_id(block, jump.wrapping_sub(1));
                if source == INVALID_ID {
                    return false;
                }
                let source = self.chunk.stmts.get(block[source as usize]);
                if source.kind != StmtKind::Condition
                    || source.assignment.expressions.is_empty()
                {
                    return false;
                }
                if probe == i && !source.assignment.variables.is_empty() {
                    return false;
                }
            }
        }
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn region_statements_benign(
        &self,
        func: FuncId,
        block: &[StmtId],
        index: usize,
        build_end: usize,
        target_slot: u8,
        target_target: u32,
        extended_label: u32,
        has_end_assignment: bool,
    ) -> bool {
        let extended_target = if self.chunk.func(func).is_valid_label(extended_label) {
            self.chunk.func(func).label(extended_label).target
        } else {
            INVALID_ID
        };
        let mut k = index;
        while k < build_end && k < block.len() {
            let s = self.chunk.stmts.get(block[k]);
            match s.kind {
                StmtKind::Condition => {
                    let ok = if !s.assignment.variables.is_empty() {
                        s.instruction.target == target_target
                            && s.assignment.variables.last().map(|v| v.slot)
                                == Some(target_slot)
                    } else if s.instruction.target == target_target {
                        s.assignment.expressions.len() == 1
                            && s.assignment
                                .expressions
                                .last()
                                .and_then(|&e| self.chunk.exprs.get(e).as_variable())
                                .is_some_and(|v| {
                                    v.kind == VarKind::Slot && v.slot == target_slot
                                })
                    } else if s.instruction.target == extended_target && !has_end_assignment {
                        true
                    } else {
                        s.instruction.target > s.instruction.id
                            && s.instruction.target < target_target
                    };
                    if !ok {
                        return false;
                    }
                }
                StmtKind::Assignment => {
                    let constant = self.single_slot_write(block[k]) == Some(target_slot)
                        && s.assignment.expressions.last().is_some_and(|&e| {
                            matches!(self.chunk.exprs.get(e), Expr::Constant(_))
                                && self.is_constant(e)
                        });
                    let followed_by_sink_jump = k + 1 < build_end.min(block.len()) && {
                        let next = self.chunk.stmts.get(block[k + 1]);
                        matches!(next.kind, StmtKind::Goto | StmtKind::Break)
                            && next.instruction.op == Opcode::Jmp
                            && next.instruction.target == target_target
                    };
                    if !(constant && followed_by_sink_jump) {
                        return false;
                    }
                    k += 1;
                }
                _ => return false,
            }
            k += 1;
        }
        true
    }

    /// Merge consecutive condition statements sharing a common exit into
    /// one composite condition.
    fn merge_statement_conditions(
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
                StmtKind::Condition => {}
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
                        self.eliminate_conditions(func, &mut body, Some(&ctx))?;
                    }
                    self.chunk.stmts.get_mut(stmt_id).block = body;
                    continue;
                }
                _ => continue,
            }

            let mut target_label = {
                let ctx = BlockCtx {
                    index: i,
                    block,
                    previous,
                };
                self.label_from_next_statement(func, &ctx, true, false)
            };

            let mut index = i;
            while index > 0 && self.chunk.stmts.get(block[index - 1]).kind == StmtKind::Condition
            {
                index -= 1;
            }

            // Find the composite exit: the last condition whose target
            // leaves the run (not the body label, not an inner target).
            let mut target_index: Option<usize> = None;
            let mut j = index;
            while j <= i {
                let s = self.chunk.stmts.get(block[j]);
                let attached = s.instruction.attached_label;
                if self.chunk.func(func).is_valid_label(attached) {
                    let ids = self.chunk.func(func).label(attached).jump_ids.clone();
                    let enters_from_outside = ids[0]
                        < self.chunk.stmts.get(block[index]).instruction.id
                        || ids
                            .last()
                            .is_some_and(|&last| last > s.instruction.id);
                    if enters_from_outside {
                        index = j;
                        target_index = None;
                    } else if j > 0 && j - 1 >= index {
                        let label_target = self.chunk.func(func).label(attached).target;
                        if self.chunk.stmts.get(block[j - 1]).instruction.target == label_target
                        {
                            let mut k = index;
                            while k < j {
                                let ks = self.chunk.stmts.get(block[k]);
                                if !(ks.instruction.target > ks.instruction.id
                                    && ks.instruction.target
                                        <= self.chunk.stmts.get(block[j]).instruction.id)
                                {
                                    break;
                                }
                                if k == j - 1 {
                                    index = j;
                                    target_index = None;
                                    break;
                                }
                                k += 1;
                            }
                        }
                    }
                }

                let s = self.chunk.stmts.get(block[j]);
                let jumps_outside = (target_label == INVALID_ID
                    || s.instruction.target != self.chunk.func(func).label(target_label).target)
                    && (s.instruction.target < s.instruction.id
                        || s.instruction.target > self.chunk.stmts.get(block[i]).instruction.id);
                if jumps_outside {
                    if let Some(t) = target_index {
                        if s.instruction.target
                            == self.chunk.stmts.get(block[t]).instruction.target
                        {
                            j += 1;
                            continue;
                        }
                        index = t + 1;
                        j = t + 1;
                        target_index = None;
                        continue;
                    }
                    target_index = Some(j);
                }
                j += 1;
            }

            let extended_label = match target_index {
                None => {
                    let extended = target_label;
                    target_label = INVALID_ID;
                    extended
                }
                Some(t) => self
                    .chunk
                    .func(func)
                    .label_at(self.chunk.stmts.get(block[t]).instruction.target),
            };
            lift_assert!(
                extended_label != INVALID_ID,
                self.fid(func),
                "condition run has no resolvable exit"
            );

            let mut builder =
                ConditionBuilder::new(ConditionMode::Statement, INVALID_ID, target_label, extended_label);
            for j in index..=i {
                let s = self.chunk.stmts.get(block[j]);
                lift_assert!(
                    s.assignment.variables.is_empty(),
                    self.fid(func),
                    "failed to eliminate all test and copy conditions"
                );
                builder.add_node(
                    NodeKind::from_opcode(s.instruction.op, s.condition.swapped),
                    s.instruction.attached_label,
                    self.chunk.func(func).label_at(s.instruction.target),
                    s.assignment.expressions.clone(),
                );
            }

            let built = builder.build_condition(self).ok_or_else(|| {
                LiftError::UnrecognizedIdiom {
                    function: self.fid(func),
                    message: format!(
                        "failed to build condition in function {}",
                        self.chunk.func(func).id
                    ),
                }
            })?;

            for j in index..=i {
                let s = self.chunk.stmts.get(block[j]);
                let (sid, target) = (s.instruction.id, s.instruction.target);
                self.chunk.func_mut(func).remove_jump(sid + 1, target);
            }

            let exit_target = self.chunk.func(func).label(extended_label).target;
            let head_label = self.chunk.stmts.get(block[index]).instruction.attached_label;
            {
                let stmt = self.chunk.stmts.get_mut(stmt_id);
                stmt.assignment.expressions = vec![built];
                stmt.instruction.target = exit_target;
                stmt.instruction.attached_label = head_label;
            }
            let own_id = self.chunk.stmts.get(stmt_id).instruction.id;
            self.chunk.func_mut(func).add_jump(own_id, exit_target);
            block.drain(index..i);
            i = index;
        }
        Ok(())
    }
}
