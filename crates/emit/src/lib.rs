//! Lua source printer for lifted chunks.
//!
//! Deliberately thin: it resolves variable names (debug names where
//! present, stable slot-derived names otherwise), applies operator
//! precedence, and prints the statement forms the lifter produces.
//! Reproducing the original formatting is not a goal.

use std::fmt::Write;

use relume_bytecode::module::Module;
use relume_hir::expr::{BinaryOp, Constant, Expr, ExprId, UnaryOp, VarKind};
use relume_hir::func::FuncId;
use relume_hir::stmt::{StmtId, StmtKind};
use relume_hir::Chunk;
use rustc_hash::FxHashMap;

/// Print a whole lifted chunk as Lua source.
pub fn emit_chunk(chunk: &Chunk, module: &Module) -> String {
    let mut emitter = Emitter {
        chunk,
        module,
        names: FxHashMap::default(),
        out: String::new(),
        indent: 0,
    };
    let root = chunk.root.expect("lifted chunk has a root function");
    emitter.collect_names(root);
    emitter.emit_body(root);
    emitter.out
}

struct Emitter<'a> {
    chunk: &'a Chunk,
    module: &'a Module,
    /// Scope id -> display name, shared across the function tree so
    /// upvalue references resolve through their parent scope.
    names: FxHashMap<u32, String>,
    out: String,
    indent: usize,
}

impl<'a> Emitter<'a> {
    fn collect_names(&mut self, func: FuncId) {
        let node = self.chunk.func(func);
        for (slot, cell) in node.parameter_scopes.iter().enumerate() {
            if let Some(cell) = cell {
                let name = node
                    .parameter_names
                    .get(slot)
                    .cloned()
                    .unwrap_or_else(|| format!("arg{slot}"));
                self.names.insert(self.chunk.scopes.id_of(*cell).0, name);
            }
        }
        for &stmt in &node.block {
            self.collect_stmt_names(func, stmt);
        }
        for &child in &node.child_functions {
            self.collect_names(child);
        }
    }

    fn collect_stmt_names(&mut self, func: FuncId, stmt_id: StmtId) {
        let stmt = self.chunk.stmts.get(stmt_id);
        if let Some(group) = stmt.locals {
            let names = self.chunk.func(func).locals[group as usize].names.clone();
            for (variable, name) in stmt.assignment.variables.iter().zip(names) {
                if let Some(cell) = variable.cell {
                    self.names.insert(self.chunk.scopes.id_of(cell).0, name);
                }
            }
        }
        for &inner in &stmt.block {
            self.collect_stmt_names(func, inner);
        }
    }

    fn variable_name(&self, variable: &relume_hir::expr::Variable) -> String {
        match variable.cell {
            Some(cell) => {
                let scope = self.chunk.scopes.id_of(cell).0;
                self.names
                    .get(&scope)
                    .cloned()
                    .unwrap_or_else(|| format!("v{}_{}", variable.slot, scope))
            }
            None => format!("v{}", variable.slot),
        }
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn emit_body(&mut self, func: FuncId) {
        let block = self.chunk.func(func).block.clone();
        for stmt in block {
            self.emit_stmt(func, stmt);
        }
    }

    fn emit_block(&mut self, func: FuncId, block: &[StmtId]) {
        self.indent += 1;
        for &stmt in block {
            self.emit_stmt(func, stmt);
        }
        self.indent -= 1;
    }

    fn emit_stmt(&mut self, func: FuncId, stmt_id: StmtId) {
        let stmt = self.chunk.stmts.get(stmt_id);
        let label = stmt.instruction.attached_label;
        if self.chunk.func(func).is_valid_label(label) && stmt.kind != StmtKind::Empty {
            let target = self.chunk.func(func).label(label).target;
            self.line(&format!("::L{target}::"));
        }

        match stmt.kind {
            StmtKind::Empty | StmtKind::Instruction | StmtKind::Condition => {}
            StmtKind::Assignment => {
                let stmt = self.chunk.stmts.get(stmt_id);
                let targets: Vec<String> = stmt
                    .assignment
                    .variables
                    .iter()
                    .map(|v| self.lvalue(v))
                    .collect();
                let values = self.expression_list(stmt_id);
                if stmt.assignment.needs_forward_declaration && targets.len() == 1 {
                    self.line(&format!("local {}", targets[0]));
                }
                if targets.is_empty() {
                    self.line(&values);
                } else {
                    self.line(&format!("{} = {}", targets.join(", "), values));
                }
            }
            StmtKind::FunctionCall => {
                let values = self.expression_list(stmt_id);
                self.line(&values);
            }
            StmtKind::Return => {
                let stmt = self.chunk.stmts.get(stmt_id);
                if stmt.assignment.expressions.is_empty()
                    && stmt.assignment.multres_return.is_none()
                {
                    self.line("return");
                } else {
                    let values = self.expression_list(stmt_id);
                    self.line(&format!("return {values}"));
                }
            }
            StmtKind::If => {
                let condition = self
                    .chunk
                    .stmts
                    .get(stmt_id)
                    .assignment
                    .expressions
                    .last()
                    .map(|&e| self.expr(e, 0))
                    .unwrap_or_else(|| "true".to_string());
                self.line(&format!("if {condition} then"));
                let body = self.chunk.stmts.get(stmt_id).block.clone();
                self.emit_block(func, &body);
                self.line("end");
            }
            StmtKind::Goto => {
                let target = self.chunk.stmts.get(stmt_id).instruction.target;
                self.line(&format!("goto L{target}"));
            }
            StmtKind::Break => self.line("break"),
            StmtKind::Loop => {
                self.line("while true do");
                let body = self.chunk.stmts.get(stmt_id).block.clone();
                self.emit_block(func, &body);
                self.line("end");
            }
            StmtKind::NumericFor => {
                let stmt = self.chunk.stmts.get(stmt_id);
                let control = self.variable_name(&stmt.assignment.variables[0]);
                let bounds: Vec<String> = stmt
                    .assignment
                    .expressions
                    .iter()
                    .map(|&e| self.expr(e, 0))
                    .collect();
                let step_is_one = stmt.assignment.expressions.get(2).is_some_and(|&e| {
                    matches!(
                        self.chunk.exprs.get(e),
                        Expr::Constant(Constant::Number(n)) if *n == 1.0
                    )
                });
                let header = if step_is_one && bounds.len() == 3 {
                    format!("for {control} = {}, {} do", bounds[0], bounds[1])
                } else {
                    format!("for {control} = {} do", bounds.join(", "))
                };
                self.line(&header);
                let body = self.chunk.stmts.get(stmt_id).block.clone();
                self.emit_block(func, &body);
                self.line("end");
            }
            StmtKind::GenericFor => {
                let stmt = self.chunk.stmts.get(stmt_id);
                let controls: Vec<String> = stmt
                    .assignment
                    .variables
                    .iter()
                    .map(|v| self.variable_name(v))
                    .collect();
                let iterators: Vec<String> = stmt
                    .assignment
                    .expressions
                    .iter()
                    .map(|&e| self.expr(e, 0))
                    .collect();
                self.line(&format!(
                    "for {} in {} do",
                    controls.join(", "),
                    iterators.join(", ")
                ));
                let body = self.chunk.stmts.get(stmt_id).block.clone();
                self.emit_block(func, &body);
                self.line("end");
            }
            StmtKind::Declaration => {
                let stmt = self.chunk.stmts.get(stmt_id);
                let targets: Vec<String> = stmt
                    .assignment
                    .variables
                    .iter()
                    .map(|v| self.variable_name(v))
                    .collect();
                let initialized = stmt
                    .assignment
                    .expressions
                    .iter()
                    .zip(stmt.assignment.variables.iter())
                    .any(|(&e, v)| match self.chunk.exprs.get(e) {
                        Expr::Variable(read) => {
                            !(read.kind == VarKind::Slot && read.slot == v.slot)
                        }
                        _ => true,
                    });
                if initialized {
                    let values = self.expression_list(stmt_id);
                    self.line(&format!("local {} = {}", targets.join(", "), values));
                } else {
                    self.line(&format!("local {}", targets.join(", ")));
                }
                let body = self.chunk.stmts.get(stmt_id).block.clone();
                for stmt in body {
                    self.emit_stmt(func, stmt);
                }
            }
        }
    }

    fn expression_list(&self, stmt_id: StmtId) -> String {
        let stmt = self.chunk.stmts.get(stmt_id);
        let mut parts: Vec<String> = stmt
            .assignment
            .expressions
            .iter()
            .map(|&e| self.expr(e, 0))
            .collect();
        if let Some(multres) = stmt.assignment.multres_return {
            parts.push(self.expr(multres, 0));
        }
        parts.join(", ")
    }

    fn lvalue(&self, variable: &relume_hir::expr::Variable) -> String {
        match variable.kind {
            VarKind::Slot | VarKind::Upvalue => self.variable_name(variable),
            VarKind::Global => variable.name.clone(),
            VarKind::TableIndex => {
                let table = variable.table.map(|t| self.expr(t, 9)).unwrap_or_default();
                if variable.is_multres {
                    return format!("{table}[...]");
                }
                match variable.index.map(|i| self.chunk.exprs.get(i)) {
                    Some(Expr::Constant(Constant::String(s)))
                        if Constant::String(s.clone()).is_name() =>
                    {
                        format!("{table}.{s}")
                    }
                    Some(_) => {
                        let index = variable.index.map(|i| self.expr(i, 0)).unwrap_or_default();
                        format!("{table}[{index}]")
                    }
                    None => table,
                }
            }
        }
    }

    fn expr(&self, expr_id: ExprId, parent_precedence: u8) -> String {
        match self.chunk.exprs.get(expr_id) {
            Expr::Constant(constant) => self.constant(constant),
            Expr::Variable(variable) => self.lvalue(variable),
            Expr::Binary { op, lhs, rhs } => {
                let (precedence, right_associative, text) = binary_op(*op);
                let left = self.expr(*lhs, precedence + u8::from(right_associative));
                let right = self.expr(*rhs, precedence + u8::from(!right_associative));
                let printed = format!("{left} {text} {right}");
                if precedence < parent_precedence {
                    format!("({printed})")
                } else {
                    printed
                }
            }
            Expr::Unary { op, operand } => {
                let text = match op {
                    UnaryOp::Not => "not ",
                    UnaryOp::Minus => "-",
                    UnaryOp::Length => "#",
                };
                let printed = format!("{text}{}", self.expr(*operand, 7));
                if 7 < parent_precedence {
                    format!("({printed})")
                } else {
                    printed
                }
            }
            Expr::Call(call) => {
                let mut arguments: Vec<String> =
                    call.arguments.iter().map(|&a| self.expr(a, 0)).collect();
                if let Some(multres) = call.multres_argument {
                    arguments.push(self.expr(multres, 0));
                }
                if call.is_method {
                    if let Some(function_id) = call.function {
                        if let Expr::Variable(v) = self.chunk.exprs.get(function_id) {
                            if let (Some(table), Some(index)) = (v.table, v.index) {
                                if let Expr::Constant(Constant::String(name)) =
                                    self.chunk.exprs.get(index)
                                {
                                    return format!(
                                        "{}:{}({})",
                                        self.expr(table, 9),
                                        name,
                                        arguments.join(", ")
                                    );
                                }
                            }
                        }
                    }
                }
                let function = call.function.map(|f| self.expr(f, 9)).unwrap_or_default();
                format!("{}({})", function, arguments.join(", "))
            }
            Expr::Table(table) => {
                let mut parts = Vec::new();
                for &item in &table.template_list {
                    parts.push(self.expr(item, 0));
                }
                for field in table.template_fields.iter().chain(table.fields.iter()) {
                    match self.chunk.exprs.get(field.key) {
                        Expr::Constant(Constant::String(s))
                            if Constant::String(s.clone()).is_name() =>
                        {
                            parts.push(format!("{s} = {}", self.expr(field.value, 0)));
                        }
                        _ => parts.push(format!(
                            "[{}] = {}",
                            self.expr(field.key, 0),
                            self.expr(field.value, 0)
                        )),
                    }
                }
                if let Some(multres) = table.multres_field {
                    parts.push(self.expr(multres, 0));
                }
                if parts.is_empty() {
                    "{}".to_string()
                } else {
                    format!("{{ {} }}", parts.join(", "))
                }
            }
            Expr::Vararg { .. } => "...".to_string(),
            Expr::Closure(child) => self.closure(*child),
        }
    }

    fn closure(&self, func: FuncId) -> String {
        let node = self.chunk.func(func);
        let proto = &self.module.prototypes[node.prototype];
        let mut parameters: Vec<String> = (0..proto.header.parameters as usize)
            .map(|slot| {
                node.parameter_names
                    .get(slot)
                    .cloned()
                    .unwrap_or_else(|| format!("arg{slot}"))
            })
            .collect();
        if proto.is_vararg() {
            parameters.push("...".to_string());
        }

        let mut nested = Emitter {
            chunk: self.chunk,
            module: self.module,
            names: self.names.clone(),
            out: String::new(),
            indent: self.indent + 1,
        };
        nested.emit_body(func);
        let mut text = String::new();
        let _ = write!(text, "function({})\n{}", parameters.join(", "), nested.out);
        for _ in 0..self.indent {
            text.push_str("    ");
        }
        text.push_str("end");
        text
    }

    fn constant(&self, constant: &Constant) -> String {
        match constant {
            Constant::Nil => "nil".to_string(),
            Constant::False => "false".to_string(),
            Constant::True => "true".to_string(),
            Constant::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            Constant::String(s) => format!("{s:?}"),
            Constant::CdataSigned(v) => format!("{v}LL"),
            Constant::CdataUnsigned(v) => format!("{v}ULL"),
            Constant::CdataImaginary(v) => format!("{v}i"),
        }
    }
}

/// (precedence, right associative, text) per Lua's operator table.
fn binary_op(op: BinaryOp) -> (u8, bool, &'static str) {
    match op {
        BinaryOp::Or => (1, false, "or"),
        BinaryOp::And => (2, false, "and"),
        BinaryOp::LessThan => (3, false, "<"),
        BinaryOp::LessEqual => (3, false, "<="),
        BinaryOp::GreaterThan => (3, false, ">"),
        BinaryOp::GreaterEqual => (3, false, ">="),
        BinaryOp::Equal => (3, false, "=="),
        BinaryOp::NotEqual => (3, false, "~="),
        BinaryOp::Concatenation => (4, true, ".."),
        BinaryOp::Addition => (5, false, "+"),
        BinaryOp::Subtraction => (5, false, "-"),
        BinaryOp::Multiplication => (6, false, "*"),
        BinaryOp::Division => (6, false, "/"),
        BinaryOp::Modulo => (6, false, "%"),
        BinaryOp::Exponentiation => (8, true, "^"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_op_table() {
        assert_eq!(binary_op(BinaryOp::Or).0, 1);
        assert_eq!(binary_op(BinaryOp::Concatenation), (4, true, ".."));
        assert!(binary_op(BinaryOp::Exponentiation).1);
    }
}
