use relume_bytecode::instruction::Instruction;
use relume_bytecode::opcode::Opcode;

use crate::expr::{ExprId, Variable};
use crate::func::FuncId;
use crate::scope::INVALID_ID;

/// Opaque statement identifier. Index into StmtArena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtId(pub u32);

/// Statement kinds. Passes reclassify statements in place, so the kind is a
/// tag next to persistent payloads rather than an enum with per-variant
/// data: an instruction statement becomes an assignment becomes part of a
/// condition without its bytecode record ever moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmtKind {
    Instruction,
    Empty,
    Assignment,
    FunctionCall,
    Return,
    Condition,
    If,
    Goto,
    Break,
    Loop,
    NumericFor,
    GenericFor,
    Declaration,
}

/// The bytecode record a statement was born from. Preserved across every
/// pass — even merged or reclassified statements keep their original
/// instruction id so later passes can reason about bytecode positions.
#[derive(Debug, Clone, Copy)]
pub struct InstrInfo {
    pub op: Opcode,
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u16,
    /// Original position in the instruction stream, or INVALID_ID for
    /// synthesized statements.
    pub id: u32,
    /// Jump target in instruction ids (jump-format ops only).
    pub target: u32,
    /// Label whose target is this statement's id, or INVALID_ID.
    pub attached_label: u32,
}

impl InstrInfo {
    pub fn synthetic(op: Opcode) -> Self {
        InstrInfo {
            op,
            a: 0,
            b: 0,
            c: 0,
            d: 0,
            id: INVALID_ID,
            target: INVALID_ID,
            attached_label: INVALID_ID,
        }
    }

    pub fn from_instruction(insn: &Instruction, id: u32) -> Self {
        InstrInfo {
            op: insn.op,
            a: insn.a,
            b: insn.b,
            c: insn.c,
            d: insn.d,
            id,
            target: INVALID_ID,
            attached_label: INVALID_ID,
        }
    }
}

/// Constant classification used to gate slot inlining: binary operations
/// with immediate operands only tolerate constants up to this rank in
/// their register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConstantRank {
    Invalid,
    Nil,
    Bool,
    Number,
}

impl Default for ConstantRank {
    fn default() -> Self {
        // Permissive: any constant may be substituted unless an opcode
        // narrows the gate.
        ConstantRank::Number
    }
}

/// The assignment payload: write targets, value expressions, and the
/// bookkeeping the elimination passes need.
#[derive(Debug, Clone, Default)]
pub struct Assignment {
    pub variables: Vec<Variable>,
    pub expressions: Vec<ExprId>,
    /// Read-side slot locations still eligible for substitution. Each entry
    /// is the arena location holding a slot reference; inlining overwrites
    /// the location in place.
    pub open_slots: Vec<ExprId>,
    /// Slots consumed by this statement, tracked for table-fold safety.
    pub used_slots: Vec<u8>,
    /// Most permissive constant rank an inlined expression may have.
    pub allowed_constant_rank: ConstantRank,
    pub is_potential_method: bool,
    pub is_table_constructor: bool,
    /// Trailing multi-return expression of a RETM.
    pub multres_return: Option<ExprId>,
    /// The merged scope begins before the surrounding region: the emitter
    /// must hoist `local x` above the statement.
    pub needs_forward_declaration: bool,
}

/// Condition bookkeeping for compare statements.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionFlags {
    /// Ordered compares may swap operands for natural source order.
    pub allow_slot_swap: bool,
    pub swapped: bool,
}

/// A statement: a kind tag plus the payloads that survive reclassification.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub instruction: InstrInfo,
    pub assignment: Assignment,
    pub condition: ConditionFlags,
    /// Nested statements (loop/declaration/if bodies).
    pub block: Vec<StmtId>,
    /// Index into the owning function's local groups.
    pub locals: Option<u32>,
    /// Child function of an FNEW statement.
    pub function: Option<FuncId>,
}

impl Stmt {
    pub fn new(kind: StmtKind, instruction: InstrInfo) -> Self {
        Stmt {
            kind,
            instruction,
            assignment: Assignment::default(),
            condition: ConditionFlags::default(),
            block: Vec::new(),
            locals: None,
            function: None,
        }
    }
}

/// Flat arena storing all statements in a chunk. Blocks are `Vec<StmtId>`,
/// so moving a range into a nested body is a splice of ids.
#[derive(Debug, Default)]
pub struct StmtArena {
    stmts: Vec<Stmt>,
}

impl StmtArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, stmt: Stmt) -> StmtId {
        let id = StmtId(self.stmts.len() as u32);
        self.stmts.push(stmt);
        id
    }

    pub fn get(&self, id: StmtId) -> &Stmt {
        &self.stmts[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: StmtId) -> &mut Stmt {
        &mut self.stmts[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }
}
