//! The bytecode-to-AST lifting core.
//!
//! Lifting is a fixed sequence of passes over a mutable per-function block
//! of statements: instruction import, debug-info digestion, jump grouping,
//! loop extraction, local-scope nesting, expression materialization,
//! slot-scope collection, slot elimination, condition elimination, and
//! if-statement framing. Functions are processed depth-first: a nested
//! prototype's upvalue descriptors reference the parent's slot scopes, so
//! the parent finishes its pipeline before its children start theirs.

mod collector;
mod condition_builder;
mod conditions;
mod debug_info;
mod error;
mod expressions;
mod idiom;
mod ifs;
mod instructions;
mod jumps;
mod loops;
mod scopes;
mod slots;

pub use collector::SlotScopeCollector;
pub use error::{LiftError, Result};

use relume_bytecode::module::Module;
use relume_bytecode::opcode::Opcode;
use relume_bytecode::prototype::Prototype;
use relume_hir::func::FuncId;
use relume_hir::scope::INVALID_ID;
use relume_hir::stmt::{StmtId, StmtKind};
use relume_hir::Chunk;

use error::lift_assert;

/// Lift a parsed bytecode module into an AST chunk.
pub fn lift_module(module: &Module) -> Result<Chunk> {
    let mut lifter = Lifter {
        module,
        chunk: Chunk::new(),
        fr2: module.header.fr2,
        next_function_id: 1,
    };
    let root = lifter.chunk.new_func(module.main, 0);
    lifter.chunk.root = Some(root);
    lifter.build_function(root)?;
    Ok(lifter.chunk)
}

pub(crate) struct Lifter<'m> {
    pub(crate) module: &'m Module,
    pub(crate) chunk: Chunk,
    pub(crate) fr2: bool,
    pub(crate) next_function_id: u32,
}

/// Parent-block chain used when a pass needs to look past the end of a
/// nested block for the following statement's label.
pub(crate) struct BlockCtx<'a> {
    pub index: usize,
    pub block: &'a [StmtId],
    pub previous: Option<&'a BlockCtx<'a>>,
}

impl<'m> Lifter<'m> {
    pub(crate) fn proto(&self, func: FuncId) -> &'m Prototype {
        &self.module.prototypes[self.chunk.func(func).prototype]
    }

    /// Stable error context: the function's prototype index.
    pub(crate) fn fid(&self, func: FuncId) -> u32 {
        self.chunk.func(func).prototype as u32
    }

    fn build_function(&mut self, func: FuncId) -> Result<()> {
        let proto = self.proto(func);
        let frame_size = proto.header.frame_size;
        let instruction_count = proto.instructions.len() as u32;
        let mut collector = SlotScopeCollector::new(frame_size, instruction_count);

        self.build_instructions(func, &mut collector)?;
        self.assign_debug_info(func)?;
        self.group_jumps(func, &mut collector)?;
        self.build_loops(func, &mut collector)?;

        if !self.chunk.func(func).has_debug_info {
            collector.build_upvalue_scopes();
        }

        let mut block = std::mem::take(&mut self.chunk.func_mut(func).block);
        self.collect_slot_scopes(func, &mut collector, &mut block, None)?;
        self.chunk.func_mut(func).block = block;

        self.close_parameter_scopes(func, &mut collector);
        lift_assert!(
            collector.assert_scopes_closed(),
            self.fid(func),
            "failed to close slot scopes"
        );

        let mut block = std::mem::take(&mut self.chunk.func_mut(func).block);
        self.eliminate_slots(func, &mut collector, &mut block, None)?;
        self.eliminate_conditions(func, &mut block, None)?;
        self.build_if_statements(func, &mut block, None)?;
        self.chunk.func_mut(func).block = block;

        for child in self.chunk.func(func).child_functions.clone() {
            self.chunk.func_mut(child).id = self.next_function_id;
            self.next_function_id += 1;
            self.build_function(child)?;
        }
        Ok(())
    }

    /// Parameters have no declaring statement: whatever scope is still open
    /// for a parameter slot after the walk is closed at function entry.
    fn close_parameter_scopes(&mut self, func: FuncId, collector: &mut SlotScopeCollector) {
        let parameters = self.proto(func).header.parameters;
        let mut cells = vec![None; parameters as usize];
        for slot in (0..parameters).rev() {
            if collector.slot_infos[slot as usize].active.is_some() {
                cells[slot as usize] =
                    Some(collector.complete_scope(&mut self.chunk.scopes, slot, 0));
            }
        }
        self.chunk.func_mut(func).parameter_scopes = cells;
    }

    /// The block index of the statement whose instruction id is `id`.
    /// Searches backward and stops early once ids fall below `id`.
    pub(crate) fn block_index_of_id(&self, block: &[StmtId], id: u32) -> u32 {
        if id == INVALID_ID {
            return INVALID_ID;
        }
        for i in (0..block.len()).rev() {
            let instruction = &self.chunk.stmts.get(block[i]).instruction;
            if instruction.id != INVALID_ID && instruction.id < id {
                break;
            }
            if instruction.id == id {
                return i as u32;
            }
        }
        INVALID_ID
    }

    /// For goto/break-shaped statements the jump target, otherwise the
    /// statement's own id. Aligns body boundaries with the statement after
    /// a break.
    pub(crate) fn extended_id(&self, stmt: StmtId) -> u32 {
        let stmt = self.chunk.stmts.get(stmt);
        match stmt.kind {
            StmtKind::Goto | StmtKind::Break if stmt.instruction.op == Opcode::Jmp => {
                stmt.instruction.target
            }
            _ => stmt.instruction.id,
        }
    }

    /// The label attached to the statement following `ctx.index`, chasing
    /// parent blocks past the end of nested ones. With `return_extended`,
    /// goto-shaped followers resolve to the label of their jump target
    /// instead.
    pub(crate) fn label_from_next_statement(
        &self,
        func: FuncId,
        ctx: &BlockCtx<'_>,
        return_extended: bool,
        exclude_declaration: bool,
    ) -> u32 {
        if ctx.index + 1 == ctx.block.len() {
            return match ctx.previous {
                Some(previous) => {
                    self.label_from_next_statement(func, previous, return_extended, false)
                }
                None => INVALID_ID,
            };
        }

        let mut stmt_id = ctx.block[ctx.index + 1];
        if exclude_declaration && self.chunk.stmts.get(stmt_id).kind == StmtKind::Declaration {
            let decl = self.chunk.stmts.get(stmt_id);
            if !decl.block.is_empty() {
                stmt_id = decl.block[0];
            } else if ctx.index + 2 != ctx.block.len() {
                stmt_id = ctx.block[ctx.index + 2];
            } else {
                return match ctx.previous {
                    Some(previous) => {
                        self.label_from_next_statement(func, previous, return_extended, false)
                    }
                    None => INVALID_ID,
                };
            }
        }

        let stmt = self.chunk.stmts.get(stmt_id);
        if return_extended
            && matches!(stmt.kind, StmtKind::Goto | StmtKind::Break)
            && stmt.instruction.op == Opcode::Jmp
        {
            return self.chunk.func(func).label_at(stmt.instruction.target);
        }
        stmt.instruction.attached_label
    }
}
