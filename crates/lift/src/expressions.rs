use relume_bytecode::constant::{GcConstant, NumConstant, TableItem};
use relume_bytecode::opcode::Opcode;
use relume_hir::expr::{
    BinaryOp, Call, Constant, Expr, ExprId, TableExpr, TableField, UnaryOp, VarKind, Variable,
};
use relume_hir::func::FuncId;
use relume_hir::scope::INVALID_ID;
use relume_hir::stmt::{ConstantRank, StmtId, StmtKind};

use crate::error::{bytecode_assert, invariant, Result};
use crate::{LiftError, Lifter};

const DOUBLE_SIGN: u64 = 0x8000_0000_0000_0000;
const DOUBLE_EXPONENT: u64 = 0x7FF0_0000_0000_0000;
const DOUBLE_FRACTION: u64 = 0x000F_FFFF_FFFF_FFFF;

impl<'m> Lifter<'m> {
    /// Expression materialization: convert each imported statement into an
    /// assignment, return or condition carrying expression trees, and
    /// record the open slots eligible for later substitution.
    pub(crate) fn build_expressions(&mut self, func: FuncId, block: &mut Vec<StmtId>) -> Result<()> {
        let mut i = block.len();
        while i > 0 {
            i -= 1;
            let stmt_id = block[i];
            let kind = self.chunk.stmts.get(stmt_id).kind;
            match kind {
                StmtKind::Instruction => self.build_instruction_expressions(func, block, &mut i)?,
                StmtKind::Return => self.build_return_expressions(func, block, &mut i)?,
                StmtKind::Condition => self.build_condition_expressions(func, stmt_id)?,
                StmtKind::NumericFor => {
                    let instruction = self.chunk.stmts.get(stmt_id).instruction;
                    let base = instruction.a;
                    let control = Variable::slot(base + 3);
                    let debug_matches = !self.chunk.func(func).has_debug_info
                        || self.chunk.stmts.get(stmt_id).locals.is_some_and(|g| {
                            let group = &self.chunk.func(func).locals[g as usize];
                            group.base_slot == base + 3 && group.names.len() == 1
                        });
                    bytecode_assert!(
                        debug_matches,
                        self.fid(func),
                        "numeric for loop variable does not match debug info"
                    );
                    let start = self.new_slot(base);
                    let stop = self.new_slot(base + 1);
                    let step = self.new_slot(base + 2);
                    let stmt = self.chunk.stmts.get_mut(stmt_id);
                    stmt.assignment.variables = vec![control];
                    stmt.assignment.expressions = vec![start, stop, step];
                    stmt.assignment.open_slots = vec![start, stop, step];
                }
                StmtKind::GenericFor => {
                    let instruction = self.chunk.stmts.get(stmt_id).instruction;
                    let base = instruction.a;
                    let count = instruction.b.saturating_sub(1);
                    let variables: Vec<Variable> =
                        (0..count).map(|j| Variable::slot(base + j)).collect();
                    let debug_matches = !self.chunk.func(func).has_debug_info
                        || self.chunk.stmts.get(stmt_id).locals.is_some_and(|g| {
                            let group = &self.chunk.func(func).locals[g as usize];
                            group.base_slot == base && group.names.len() == count as usize
                        });
                    bytecode_assert!(
                        debug_matches,
                        self.fid(func),
                        "generic for loop variables do not match debug info"
                    );
                    bytecode_assert!(
                        base >= 3,
                        self.fid(func),
                        "generic for iterator base slot out of range"
                    );
                    let generator = self.new_slot(base - 3);
                    let state = self.new_slot(base - 2);
                    let control = self.new_slot(base - 1);
                    let stmt = self.chunk.stmts.get_mut(stmt_id);
                    stmt.assignment.variables = variables;
                    stmt.assignment.expressions = vec![generator, state, control];
                    stmt.assignment.open_slots = vec![generator, state, control];
                }
                StmtKind::Declaration => {
                    let group_index = self.chunk.stmts.get(stmt_id).locals.unwrap_or(0);
                    let group = &self.chunk.func(func).locals[group_index as usize];
                    let base = group.base_slot;
                    let count = group.names.len() as u8;
                    let variables: Vec<Variable> =
                        (0..count).map(|j| Variable::slot(base + j)).collect();
                    let expressions: Vec<ExprId> =
                        (0..count).map(|j| self.new_slot(base + j)).collect();
                    let stmt = self.chunk.stmts.get_mut(stmt_id);
                    stmt.assignment.variables = variables;
                    stmt.assignment.open_slots = expressions.clone();
                    stmt.assignment.expressions = expressions;
                }
                _ => {}
            }

            // Record which slots the statement consumes, in registration
            // order. The elimination passes accumulate inlined statements'
            // lists into their consumers.
            let stmt_id = block[i];
            let used: Vec<u8> = self
                .chunk
                .stmts
                .get(stmt_id)
                .assignment
                .open_slots
                .iter()
                .filter_map(|&loc| self.chunk.exprs.get(loc).as_variable().map(|v| v.slot))
                .collect();
            self.chunk.stmts.get_mut(stmt_id).assignment.used_slots = used;
        }
        Ok(())
    }

    fn build_instruction_expressions(
        &mut self,
        func: FuncId,
        block: &mut Vec<StmtId>,
        i: &mut usize,
    ) -> Result<()> {
        let stmt_id = block[*i];
        let instruction = self.chunk.stmts.get(stmt_id).instruction;
        self.chunk.stmts.get_mut(stmt_id).kind = StmtKind::Assignment;

        // Ops with write targets other than a plain slot return early; the
        // shared tail below assigns `slot A` as the single write target.
        match instruction.op {
            Opcode::Mov => {
                let value = self.new_slot(instruction.d as u8);
                let a = &mut self.chunk.stmts.get_mut(stmt_id).assignment;
                a.expressions = vec![value];
                a.open_slots = vec![value];
            }
            Opcode::Not | Opcode::Unm | Opcode::Len => {
                let operand = self.new_slot(instruction.d as u8);
                let op = match instruction.op {
                    Opcode::Not => UnaryOp::Not,
                    Opcode::Unm => UnaryOp::Minus,
                    _ => UnaryOp::Length,
                };
                let expr = self.chunk.exprs.alloc(Expr::Unary { op, operand });
                let a = &mut self.chunk.stmts.get_mut(stmt_id).assignment;
                a.expressions = vec![expr];
                a.open_slots = vec![operand];
                a.allowed_constant_rank = match instruction.op {
                    Opcode::Not => ConstantRank::Invalid,
                    Opcode::Unm => ConstantRank::Bool,
                    _ => ConstantRank::Number,
                };
            }
            Opcode::AddVN | Opcode::SubVN | Opcode::MulVN | Opcode::DivVN | Opcode::ModVN
            | Opcode::AddNV | Opcode::SubNV | Opcode::MulNV | Opcode::DivNV | Opcode::ModNV
            | Opcode::AddVV | Opcode::SubVV | Opcode::MulVV | Opcode::DivVV | Opcode::ModVV
            | Opcode::Pow => {
                let op = match instruction.op {
                    Opcode::AddVN | Opcode::AddNV | Opcode::AddVV => BinaryOp::Addition,
                    Opcode::SubVN | Opcode::SubNV | Opcode::SubVV => BinaryOp::Subtraction,
                    Opcode::MulVN | Opcode::MulNV | Opcode::MulVV => BinaryOp::Multiplication,
                    Opcode::DivVN | Opcode::DivNV | Opcode::DivVV => BinaryOp::Division,
                    Opcode::ModVN | Opcode::ModNV | Opcode::ModVV => BinaryOp::Modulo,
                    _ => BinaryOp::Exponentiation,
                };
                let (lhs, rhs, open) = match instruction.op {
                    Opcode::AddVN | Opcode::SubVN | Opcode::MulVN | Opcode::DivVN
                    | Opcode::ModVN => {
                        let lhs = self.new_slot(instruction.b);
                        let rhs = self.new_number(func, instruction.c as u16)?;
                        (lhs, rhs, vec![lhs])
                    }
                    Opcode::AddNV | Opcode::SubNV | Opcode::MulNV | Opcode::DivNV
                    | Opcode::ModNV => {
                        let lhs = self.new_number(func, instruction.c as u16)?;
                        let rhs = self.new_slot(instruction.b);
                        (lhs, rhs, vec![rhs])
                    }
                    _ => {
                        let lhs = self.new_slot(instruction.b);
                        let rhs = self.new_slot(instruction.c);
                        (lhs, rhs, vec![lhs, rhs])
                    }
                };
                // Immediate-operand arithmetic may not absorb a number
                // constant into its register side: the recompiler would
                // fold it and change the instruction.
                let immediate_form = matches!(
                    instruction.op,
                    Opcode::AddVN | Opcode::SubVN | Opcode::MulVN | Opcode::DivVN | Opcode::ModVN
                        | Opcode::AddNV | Opcode::SubNV | Opcode::MulNV | Opcode::DivNV
                        | Opcode::ModNV
                );
                let expr = self.chunk.exprs.alloc(Expr::Binary { op, lhs, rhs });
                let a = &mut self.chunk.stmts.get_mut(stmt_id).assignment;
                a.expressions = vec![expr];
                a.open_slots = open;
                if immediate_form {
                    a.allowed_constant_rank = ConstantRank::Bool;
                }
            }
            Opcode::Cat => {
                // B .. B+1 .. ... .. C, right-nested like the source form.
                bytecode_assert!(
                    instruction.c >= instruction.b,
                    self.fid(func),
                    "concat operand range is inverted"
                );
                let operands: Vec<ExprId> = (instruction.b..=instruction.c)
                    .map(|slot| self.new_slot(slot))
                    .collect();
                let mut expr = None;
                for &operand in operands.iter().rev() {
                    expr = Some(match expr {
                        Some(rest) => self.chunk.exprs.alloc(Expr::Binary {
                            op: BinaryOp::Concatenation,
                            lhs: operand,
                            rhs: rest,
                        }),
                        None => operand,
                    });
                }
                let expr = invariant(expr, self.fid(func), "concat range is empty")?;
                let a = &mut self.chunk.stmts.get_mut(stmt_id).assignment;
                a.expressions = vec![expr];
                a.open_slots = operands;
            }
            Opcode::KStr => {
                let value = self.new_string(func, instruction.d)?;
                self.chunk.stmts.get_mut(stmt_id).assignment.expressions = vec![value];
            }
            Opcode::KCData => {
                let value = self.new_cdata(func, instruction.d)?;
                self.chunk.stmts.get_mut(stmt_id).assignment.expressions = vec![value];
            }
            Opcode::KShort => {
                let value = self.new_signed_literal(instruction.d);
                self.chunk.stmts.get_mut(stmt_id).assignment.expressions = vec![value];
            }
            Opcode::KNum => {
                let value = self.new_number(func, instruction.d)?;
                self.chunk.stmts.get_mut(stmt_id).assignment.expressions = vec![value];
            }
            Opcode::KPri => {
                let value = self.new_primitive(instruction.d as u8);
                self.chunk.stmts.get_mut(stmt_id).assignment.expressions = vec![value];
            }
            Opcode::KNil => {
                let value = self.new_primitive(0);
                self.chunk.stmts.get_mut(stmt_id).assignment.expressions = vec![value];
                if instruction.a as u16 != instruction.d {
                    // KNIL spans several slots: peel one nil assignment per
                    // slot, keeping the original id on the lowest one.
                    let mut peeled =
                        relume_hir::stmt::Stmt::new(StmtKind::Instruction, instruction);
                    peeled.instruction.d -= 1;
                    let peeled_id = self.chunk.stmts.alloc(peeled);
                    block.insert(*i, peeled_id);
                    *i += 1;
                    let stmt = self.chunk.stmts.get_mut(stmt_id);
                    stmt.instruction.a = stmt.instruction.d as u8;
                    stmt.instruction.id = INVALID_ID;
                    stmt.instruction.attached_label = INVALID_ID;
                }
            }
            Opcode::UGet => {
                let cell = self.chunk.func(func).upvalues[instruction.d as usize].cell;
                let expr = self.chunk.exprs.alloc(Expr::Variable(Variable {
                    kind: VarKind::Upvalue,
                    slot: instruction.d as u8,
                    cell,
                    ..Default::default()
                }));
                self.chunk.stmts.get_mut(stmt_id).assignment.expressions = vec![expr];
            }
            Opcode::USetV | Opcode::USetS | Opcode::USetN | Opcode::USetP => {
                let target = Variable {
                    kind: VarKind::Upvalue,
                    slot: instruction.a,
                    cell: self.chunk.func(func).upvalues[instruction.a as usize].cell,
                    ..Default::default()
                };
                let (value, open) = match instruction.op {
                    Opcode::USetV => {
                        let value = self.new_slot(instruction.d as u8);
                        (value, vec![value])
                    }
                    Opcode::USetS => (self.new_string(func, instruction.d)?, vec![]),
                    Opcode::USetN => (self.new_number(func, instruction.d)?, vec![]),
                    _ => (self.new_primitive(instruction.d as u8), vec![]),
                };
                let a = &mut self.chunk.stmts.get_mut(stmt_id).assignment;
                a.variables = vec![target];
                a.expressions = vec![value];
                a.open_slots = open;
                return Ok(());
            }
            Opcode::FNew => {
                let child = invariant(
                    self.chunk.stmts.get(stmt_id).function,
                    self.fid(func),
                    "FNEW statement has no child function",
                )?;
                let expr = self.chunk.exprs.alloc(Expr::Closure(child));
                self.chunk.stmts.get_mut(stmt_id).assignment.expressions = vec![expr];
            }
            Opcode::TNew => {
                let expr = self.chunk.exprs.alloc(Expr::Table(TableExpr::default()));
                let a = &mut self.chunk.stmts.get_mut(stmt_id).assignment;
                a.expressions = vec![expr];
                a.is_table_constructor = true;
            }
            Opcode::TDup => {
                let expr = self.new_table(func, instruction.d)?;
                let a = &mut self.chunk.stmts.get_mut(stmt_id).assignment;
                a.expressions = vec![expr];
                a.is_table_constructor = true;
            }
            Opcode::GGet => {
                let name = self.string_constant(func, instruction.d)?;
                if self.chunk.func(func).has_debug_info {
                    self.chunk.func_mut(func).used_globals.push(name.clone());
                }
                let expr = self.chunk.exprs.alloc(Expr::Variable(Variable {
                    kind: VarKind::Global,
                    name,
                    ..Default::default()
                }));
                self.chunk.stmts.get_mut(stmt_id).assignment.expressions = vec![expr];
            }
            Opcode::GSet => {
                let name = self.string_constant(func, instruction.d)?;
                if self.chunk.func(func).has_debug_info {
                    self.chunk.func_mut(func).used_globals.push(name.clone());
                }
                let value = self.new_slot(instruction.a);
                let a = &mut self.chunk.stmts.get_mut(stmt_id).assignment;
                a.variables = vec![Variable {
                    kind: VarKind::Global,
                    name,
                    ..Default::default()
                }];
                a.expressions = vec![value];
                a.open_slots = vec![value];
                return Ok(());
            }
            Opcode::TGetV | Opcode::TGetS | Opcode::TGetB => {
                let table = self.new_slot(instruction.b);
                let mut open = vec![table];
                let index = match instruction.op {
                    Opcode::TGetV => {
                        let index = self.new_slot(instruction.c);
                        open.push(index);
                        index
                    }
                    Opcode::TGetS => self.new_string(func, instruction.c as u16)?,
                    _ => self.new_literal(instruction.c),
                };
                let expr = self.chunk.exprs.alloc(Expr::Variable(Variable {
                    kind: VarKind::TableIndex,
                    table: Some(table),
                    index: Some(index),
                    ..Default::default()
                }));
                let a = &mut self.chunk.stmts.get_mut(stmt_id).assignment;
                a.expressions = vec![expr];
                a.open_slots = open;
            }
            Opcode::TSetV | Opcode::TSetS | Opcode::TSetB => {
                let table = self.new_slot(instruction.b);
                let mut open = Vec::new();
                let index = match instruction.op {
                    Opcode::TSetV => {
                        let index = self.new_slot(instruction.c);
                        open.push(index);
                        index
                    }
                    Opcode::TSetS => self.new_string(func, instruction.c as u16)?,
                    _ => self.new_literal(instruction.c),
                };
                let value = self.new_slot(instruction.a);
                open.push(value);
                let a = &mut self.chunk.stmts.get_mut(stmt_id).assignment;
                a.variables = vec![Variable {
                    kind: VarKind::TableIndex,
                    table: Some(table),
                    index: Some(index),
                    ..Default::default()
                }];
                a.expressions = vec![value];
                a.open_slots = open;
                return Ok(());
            }
            Opcode::TSetM => {
                let multres_index = match self.proto(func).num_constants.get(instruction.d as usize)
                {
                    Some(NumConstant::Num(n)) => *n,
                    _ => {
                        return Err(LiftError::MalformedBytecode {
                            function: self.fid(func),
                            message: "multres table index is not a valid number constant".into(),
                        })
                    }
                };
                let table = self.new_slot(instruction.a - 1);
                let value = self.new_slot(instruction.a);
                self.mark_multres(value);
                let a = &mut self.chunk.stmts.get_mut(stmt_id).assignment;
                a.variables = vec![Variable {
                    kind: VarKind::TableIndex,
                    table: Some(table),
                    is_multres: true,
                    multres_index,
                    ..Default::default()
                }];
                a.expressions = vec![value];
                a.open_slots = vec![value];
                return Ok(());
            }
            Opcode::CallM | Opcode::Call => {
                let base = instruction.a;
                let argument_base = base + if self.fr2 { 2 } else { 1 };
                let argument_count =
                    instruction.c as i32 + if instruction.op == Opcode::CallM { 0 } else { -1 };
                let function_expr = self.new_slot(base);
                let mut open = vec![function_expr];
                let mut arguments = Vec::new();
                for j in 0..argument_count.max(0) as u8 {
                    let argument = self.new_slot(argument_base + j);
                    open.push(argument);
                    arguments.push(argument);
                }
                let multres_argument = if instruction.op == Opcode::CallM {
                    let argument = self.new_slot(argument_base + argument_count.max(0) as u8);
                    self.mark_multres(argument);
                    open.push(argument);
                    Some(argument)
                } else {
                    None
                };

                let mut variables = Vec::new();
                let mut return_count = 0;
                if instruction.b > 0 {
                    if instruction.b == 1 {
                        self.chunk.stmts.get_mut(stmt_id).kind = StmtKind::FunctionCall;
                    } else {
                        for j in 0..instruction.b - 1 {
                            variables.push(Variable::slot(base + j));
                        }
                        return_count = variables.len() as u8;
                    }
                } else {
                    let mut multres = Variable::slot(base);
                    multres.is_multres = true;
                    variables.push(multres);
                }

                let has_arguments = !arguments.is_empty();
                let expr = self.chunk.exprs.alloc(Expr::Call(Call {
                    function: Some(function_expr),
                    arguments,
                    multres_argument,
                    is_method: false,
                    return_count,
                }));
                let a = &mut self.chunk.stmts.get_mut(stmt_id).assignment;
                a.variables = variables;
                a.expressions = vec![expr];
                a.open_slots = open;
                a.is_potential_method = has_arguments;
                return Ok(());
            }
            Opcode::VarG => {
                let base = instruction.a;
                let mut variables = Vec::new();
                let mut return_count = 0;
                if instruction.b > 0 {
                    if instruction.b == 1 {
                        self.chunk.stmts.get_mut(stmt_id).kind = StmtKind::FunctionCall;
                    } else {
                        for j in 0..instruction.b - 1 {
                            variables.push(Variable::slot(base + j));
                        }
                        return_count = variables.len() as u8;
                    }
                } else {
                    let mut multres = Variable::slot(base);
                    multres.is_multres = true;
                    variables.push(multres);
                }
                let expr = self.chunk.exprs.alloc(Expr::Vararg { return_count });
                let a = &mut self.chunk.stmts.get_mut(stmt_id).assignment;
                a.variables = variables;
                a.expressions = vec![expr];
                return Ok(());
            }
            _ => {
                return Err(LiftError::UnrecognizedIdiom {
                    function: self.fid(func),
                    message: format!(
                        "instruction {:?} at {} survived jump grouping",
                        instruction.op, instruction.id
                    ),
                });
            }
        }

        // Shared tail: a single slot write target.
        let slot = self.chunk.stmts.get(stmt_id).instruction.a;
        self.chunk.stmts.get_mut(stmt_id).assignment.variables = vec![Variable::slot(slot)];
        Ok(())
    }

    fn build_return_expressions(
        &mut self,
        func: FuncId,
        block: &mut Vec<StmtId>,
        i: &mut usize,
    ) -> Result<()> {
        let mut stmt_id = block[*i];

        // A return directly after an elided upvalue close adopts its
        // position.
        if *i > 0 {
            let previous = self.chunk.stmts.get(block[*i - 1]);
            if previous.kind == StmtKind::Empty
                && previous.instruction.op == Opcode::UClo
                && !self
                    .chunk
                    .func(func)
                    .is_valid_label(self.chunk.stmts.get(stmt_id).instruction.attached_label)
            {
                let (id, label) = (previous.instruction.id, previous.instruction.attached_label);
                let stmt = self.chunk.stmts.get_mut(stmt_id);
                stmt.instruction.id = id;
                stmt.instruction.attached_label = label;
                *i -= 1;
                block.remove(*i);
                stmt_id = block[*i];
            }
        }

        let instruction = self.chunk.stmts.get(stmt_id).instruction;
        match instruction.op {
            Opcode::CallMT | Opcode::CallT => {
                let base = instruction.a;
                let argument_base = base + if self.fr2 { 2 } else { 1 };
                let argument_count =
                    instruction.d as i32 + if instruction.op == Opcode::CallMT { 0 } else { -1 };
                let function_expr = self.new_slot(base);
                let mut open = vec![function_expr];
                let mut arguments = Vec::new();
                for j in 0..argument_count.max(0) as u16 {
                    let argument = self.new_slot(argument_base + j as u8);
                    open.push(argument);
                    arguments.push(argument);
                }
                let multres_argument = if instruction.op == Opcode::CallMT {
                    let argument = self.new_slot(argument_base + argument_count.max(0) as u8);
                    self.mark_multres(argument);
                    open.push(argument);
                    Some(argument)
                } else {
                    None
                };
                let has_arguments = !arguments.is_empty();
                let expr = self.chunk.exprs.alloc(Expr::Call(Call {
                    function: Some(function_expr),
                    arguments,
                    multres_argument,
                    is_method: false,
                    return_count: 0,
                }));
                let a = &mut self.chunk.stmts.get_mut(stmt_id).assignment;
                a.expressions = vec![expr];
                a.open_slots = open;
                a.is_potential_method = has_arguments;
            }
            Opcode::RetM | Opcode::Ret | Opcode::Ret1 => {
                let count =
                    instruction.d as i32 + if instruction.op == Opcode::RetM { 0 } else { -1 };
                let mut expressions = Vec::new();
                let mut open = Vec::new();
                for j in 0..count.max(0) as u16 {
                    let value = self.new_slot(instruction.a + j as u8);
                    expressions.push(value);
                    open.push(value);
                }
                let multres_return = if instruction.op == Opcode::RetM {
                    let value = self.new_slot(instruction.a + instruction.d as u8);
                    self.mark_multres(value);
                    open.push(value);
                    Some(value)
                } else {
                    None
                };
                let a = &mut self.chunk.stmts.get_mut(stmt_id).assignment;
                a.expressions = expressions;
                a.open_slots = open;
                a.multres_return = multres_return;
            }
            _ => {}
        }
        Ok(())
    }

    fn build_condition_expressions(&mut self, func: FuncId, stmt_id: StmtId) -> Result<()> {
        let instruction = self.chunk.stmts.get(stmt_id).instruction;
        match instruction.op {
            Opcode::IsLt | Opcode::IsGe | Opcode::IsLe | Opcode::IsGt | Opcode::IsEqV
            | Opcode::IsNeV | Opcode::IsEqS | Opcode::IsNeS | Opcode::IsEqN | Opcode::IsNeN
            | Opcode::IsEqP | Opcode::IsNeP => {
                let lhs = self.new_slot(instruction.a);
                let mut open = vec![lhs];
                let allow_slot_swap = matches!(
                    instruction.op,
                    Opcode::IsLt | Opcode::IsGe | Opcode::IsLe | Opcode::IsGt
                );
                let rhs = match instruction.op {
                    Opcode::IsLt | Opcode::IsGe | Opcode::IsLe | Opcode::IsGt | Opcode::IsEqV
                    | Opcode::IsNeV => {
                        let rhs = self.new_slot(instruction.d as u8);
                        open.push(rhs);
                        rhs
                    }
                    Opcode::IsEqS | Opcode::IsNeS => self.new_string(func, instruction.d)?,
                    Opcode::IsEqN | Opcode::IsNeN => self.new_number(func, instruction.d)?,
                    _ => self.new_primitive(instruction.d as u8),
                };
                let stmt = self.chunk.stmts.get_mut(stmt_id);
                stmt.assignment.expressions = vec![lhs, rhs];
                stmt.assignment.open_slots = open;
                stmt.condition.allow_slot_swap = allow_slot_swap;
            }
            Opcode::IsTC | Opcode::IsFC | Opcode::IsT | Opcode::IsF => {
                let operand = self.new_slot(instruction.d as u8);
                let stmt = self.chunk.stmts.get_mut(stmt_id);
                if matches!(instruction.op, Opcode::IsTC | Opcode::IsFC) {
                    stmt.assignment.variables = vec![Variable::slot(instruction.a)];
                }
                stmt.assignment.expressions = vec![operand];
                stmt.assignment.open_slots = vec![operand];
                stmt.assignment.allowed_constant_rank = ConstantRank::Invalid;
            }
            _ => {}
        }
        Ok(())
    }

    // ---- Expression constructors ----

    /// Flag a freshly built slot reference as a multi-return continuation.
    fn mark_multres(&mut self, expr: ExprId) {
        if let Some(variable) = self.chunk.exprs.get_mut(expr).as_variable_mut() {
            variable.is_multres = true;
        }
    }

    pub(crate) fn new_slot(&mut self, slot: u8) -> ExprId {
        self.chunk.exprs.alloc(Expr::Variable(Variable::slot(slot)))
    }

    pub(crate) fn new_literal(&mut self, literal: u8) -> ExprId {
        self.chunk
            .exprs
            .alloc(Expr::Constant(Constant::Number(literal as f64)))
    }

    pub(crate) fn new_signed_literal(&mut self, literal: u16) -> ExprId {
        self.chunk
            .exprs
            .alloc(Expr::Constant(Constant::Number(literal as i16 as f64)))
    }

    pub(crate) fn new_primitive(&mut self, primitive: u8) -> ExprId {
        let constant = match primitive {
            0 => Constant::Nil,
            1 => Constant::False,
            _ => Constant::True,
        };
        self.chunk.exprs.alloc(Expr::Constant(constant))
    }

    pub(crate) fn new_number(&mut self, func: FuncId, index: u16) -> Result<ExprId> {
        let constant = self.proto(func).num_constants.get(index as usize).copied();
        match constant {
            Some(NumConstant::Int(value)) => Ok(self
                .chunk
                .exprs
                .alloc(Expr::Constant(Constant::Number(value as f64)))),
            Some(NumConstant::Num(value)) => {
                let expr = self
                    .chunk
                    .exprs
                    .alloc(Expr::Constant(Constant::Number(value)));
                self.check_special_number(func, expr, false)?;
                Ok(expr)
            }
            None => Err(LiftError::MalformedBytecode {
                function: self.fid(func),
                message: format!("number constant {index} out of range"),
            }),
        }
    }

    pub(crate) fn string_constant(&self, func: FuncId, index: u16) -> Result<String> {
        match self.proto(func).gc_constants.get(index as usize) {
            Some(GcConstant::Str(s)) => Ok(s.clone()),
            _ => Err(LiftError::MalformedBytecode {
                function: self.fid(func),
                message: format!("constant {index} is not a string"),
            }),
        }
    }

    pub(crate) fn new_string(&mut self, func: FuncId, index: u16) -> Result<ExprId> {
        let s = self.string_constant(func, index)?;
        Ok(self.chunk.exprs.alloc(Expr::Constant(Constant::String(s))))
    }

    pub(crate) fn new_table(&mut self, func: FuncId, index: u16) -> Result<ExprId> {
        let template = match self.proto(func).gc_constants.get(index as usize) {
            Some(GcConstant::Table(t)) => t.clone(),
            _ => {
                return Err(LiftError::MalformedBytecode {
                    function: self.fid(func),
                    message: format!("constant {index} is not a table template"),
                })
            }
        };

        let mut list = Vec::with_capacity(template.array.len());
        for item in &template.array {
            list.push(self.new_table_item(func, item)?);
        }
        let mut fields = Vec::with_capacity(template.hash.len());
        for (key, value) in &template.hash {
            let key = self.new_table_item(func, key)?;
            let value = self.new_table_item(func, value)?;
            fields.push(TableField { key, value });
        }

        Ok(self.chunk.exprs.alloc(Expr::Table(TableExpr {
            template_list: list,
            template_fields: fields,
            ..Default::default()
        })))
    }

    fn new_table_item(&mut self, func: FuncId, item: &TableItem) -> Result<ExprId> {
        let expr = match item {
            TableItem::Nil => self.chunk.exprs.alloc(Expr::Constant(Constant::Nil)),
            TableItem::False => self.chunk.exprs.alloc(Expr::Constant(Constant::False)),
            TableItem::True => self.chunk.exprs.alloc(Expr::Constant(Constant::True)),
            TableItem::Int(value) => self
                .chunk
                .exprs
                .alloc(Expr::Constant(Constant::Number(*value as f64))),
            TableItem::Num(value) => {
                let expr = self
                    .chunk
                    .exprs
                    .alloc(Expr::Constant(Constant::Number(*value)));
                self.check_special_number(func, expr, false)?;
                expr
            }
            TableItem::Str(value) => self
                .chunk
                .exprs
                .alloc(Expr::Constant(Constant::String(value.clone()))),
        };
        Ok(expr)
    }

    pub(crate) fn new_cdata(&mut self, func: FuncId, index: u16) -> Result<ExprId> {
        match self.proto(func).gc_constants.get(index as usize) {
            Some(GcConstant::I64(value)) => Ok(self
                .chunk
                .exprs
                .alloc(Expr::Constant(Constant::CdataSigned(*value)))),
            Some(GcConstant::U64(value)) => Ok(self
                .chunk
                .exprs
                .alloc(Expr::Constant(Constant::CdataUnsigned(*value)))),
            Some(GcConstant::Complex(value)) => {
                let expr = self
                    .chunk
                    .exprs
                    .alloc(Expr::Constant(Constant::CdataImaginary(*value)));
                self.check_special_number(func, expr, true)?;
                Ok(expr)
            }
            _ => Err(LiftError::MalformedBytecode {
                function: self.fid(func),
                message: format!("constant {index} is not cdata"),
            }),
        }
    }

    /// NaN has no source form and is an error. Infinities and negative
    /// zero are rewritten to `±1 / 0` so the emitter can print them;
    /// cdata payloads are printed as raw bits and skip the rewrite.
    pub(crate) fn check_special_number(
        &mut self,
        func: FuncId,
        expr: ExprId,
        is_cdata: bool,
    ) -> Result<()> {
        let value = match self.chunk.exprs.get(expr) {
            Expr::Constant(Constant::Number(n)) => *n,
            Expr::Constant(Constant::CdataImaginary(n)) => *n,
            _ => return Ok(()),
        };
        let bits = value.to_bits();
        let special = bits & DOUBLE_EXPONENT == DOUBLE_EXPONENT;
        if special && bits & DOUBLE_FRACTION != 0 {
            return Err(LiftError::NumericLiteral {
                function: self.fid(func),
                message: "number constant is NaN".into(),
            });
        }
        if is_cdata {
            return Ok(());
        }
        if special || bits == DOUBLE_SIGN {
            let sign = if bits & DOUBLE_SIGN != 0 { -1.0 } else { 1.0 };
            let lhs = self.chunk.exprs.alloc(Expr::Constant(Constant::Number(sign)));
            let rhs = self.chunk.exprs.alloc(Expr::Constant(Constant::Number(0.0)));
            self.chunk.exprs.set(
                expr,
                Expr::Binary {
                    op: BinaryOp::Division,
                    lhs,
                    rhs,
                },
            );
        }
        Ok(())
    }

    /// Constant classification with one level of folding: a binary
    /// arithmetic node whose operands are both representable number
    /// constants and whose result is representable ranks as a number
    /// constant itself.
    pub(crate) fn constant_rank(&self, expr: ExprId) -> ConstantRank {
        fn representable(n: f64) -> bool {
            let bits = n.to_bits();
            if bits & DOUBLE_EXPONENT == DOUBLE_EXPONENT {
                bits & DOUBLE_FRACTION == 0
            } else {
                bits != DOUBLE_SIGN
            }
        }

        match self.chunk.exprs.get(expr) {
            Expr::Constant(constant) => match constant {
                Constant::Nil => ConstantRank::Nil,
                Constant::False | Constant::True | Constant::String(_) => ConstantRank::Bool,
                Constant::Number(_) => ConstantRank::Number,
                _ => ConstantRank::Invalid,
            },
            Expr::Binary { op, lhs, rhs } => {
                let arithmetic = matches!(
                    op,
                    BinaryOp::Addition
                        | BinaryOp::Subtraction
                        | BinaryOp::Multiplication
                        | BinaryOp::Division
                        | BinaryOp::Exponentiation
                        | BinaryOp::Modulo
                );
                if !arithmetic
                    || self.constant_rank(*lhs) != ConstantRank::Number
                    || self.constant_rank(*rhs) != ConstantRank::Number
                {
                    return ConstantRank::Invalid;
                }
                let (Some(a), Some(b)) = (self.number_value(*lhs), self.number_value(*rhs)) else {
                    return ConstantRank::Invalid;
                };
                let folded = match op {
                    BinaryOp::Addition => a + b,
                    BinaryOp::Subtraction => a - b,
                    BinaryOp::Multiplication => a * b,
                    BinaryOp::Division => a / b,
                    BinaryOp::Exponentiation => a.powf(b),
                    _ => a % b,
                };
                if representable(folded) {
                    ConstantRank::Number
                } else {
                    ConstantRank::Invalid
                }
            }
            Expr::Unary { op, operand } => match op {
                UnaryOp::Not => {
                    if self.constant_rank(*operand) != ConstantRank::Invalid {
                        ConstantRank::Bool
                    } else {
                        ConstantRank::Invalid
                    }
                }
                UnaryOp::Minus => match self.chunk.exprs.get(*operand) {
                    Expr::Constant(Constant::Number(n)) => {
                        if representable(-n) {
                            ConstantRank::Number
                        } else {
                            ConstantRank::Invalid
                        }
                    }
                    Expr::Constant(
                        Constant::CdataSigned(_)
                        | Constant::CdataUnsigned(_)
                        | Constant::CdataImaginary(_),
                    ) => ConstantRank::Number,
                    _ => ConstantRank::Invalid,
                },
                UnaryOp::Length => ConstantRank::Invalid,
            },
            _ => ConstantRank::Invalid,
        }
    }

    fn number_value(&self, expr: ExprId) -> Option<f64> {
        match self.chunk.exprs.get(expr) {
            Expr::Constant(Constant::Number(n)) => Some(*n),
            _ => None,
        }
    }

    /// True when the expression is a constant at all (the C++ lifter's
    /// truthiness use of its constant classifier).
    pub(crate) fn is_constant(&self, expr: ExprId) -> bool {
        self.constant_rank(expr) != ConstantRank::Invalid
    }
}
