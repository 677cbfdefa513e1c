//! End-to-end lifting scenarios over hand-assembled instruction streams.

use relume_bytecode::constant::{GcConstant, NumConstant};
use relume_bytecode::instruction::{Instruction, JUMP_BIAS};
use relume_bytecode::module::{Header, Module, Version};
use relume_bytecode::opcode::Opcode;
use relume_bytecode::prototype::{Prototype, PrototypeHeader, VarKind, VariableInfo};
use relume_hir::stmt::StmtKind;
use relume_lift::{lift_module, LiftError};

fn abc(op: Opcode, a: u8, b: u8, c: u8) -> Instruction {
    Instruction {
        op,
        a,
        b,
        c,
        d: ((b as u16) << 8) | c as u16,
    }
}

fn ad(op: Opcode, a: u8, d: u16) -> Instruction {
    Instruction {
        op,
        a,
        b: (d >> 8) as u8,
        c: (d & 0xFF) as u8,
        d,
    }
}

/// Jump-format instruction at position `id` targeting `target`.
fn jump(op: Opcode, a: u8, id: u16, target: u16) -> Instruction {
    let d = (JUMP_BIAS as i32 + target as i32 - id as i32 - 1) as u16;
    ad(op, a, d)
}

fn module(parameters: u8, frame_size: u8, instructions: Vec<Instruction>) -> Module {
    module_with(parameters, frame_size, instructions, vec![], vec![], vec![])
}

fn module_with(
    parameters: u8,
    frame_size: u8,
    instructions: Vec<Instruction>,
    gc_constants: Vec<GcConstant>,
    num_constants: Vec<NumConstant>,
    variable_infos: Vec<VariableInfo>,
) -> Module {
    let proto = Prototype {
        header: PrototypeHeader {
            flags: 0,
            parameters,
            frame_size,
        },
        instructions,
        gc_constants,
        num_constants,
        upvalues: Vec::new(),
        variable_infos,
        size: 0,
    };
    Module {
        header: Header {
            version: Version::V2,
            flags: 0,
            fr2: false,
        },
        chunk_name: None,
        prototypes: vec![proto],
        main: 0,
        prototypes_total_size: 0,
    }
}

fn lift_to_source(module: &Module) -> String {
    let chunk = lift_module(module).expect("lift succeeds");
    relume_emit::emit_chunk(&chunk, module)
}

#[test]
fn test_arithmetic_return() {
    // KSHORT 0, 5 ; KSHORT 1, 3 ; ADDVV 2, 0, 1 ; RET1 2, 2
    let module = module(
        0,
        3,
        vec![
            ad(Opcode::KShort, 0, 5),
            ad(Opcode::KShort, 1, 3),
            abc(Opcode::AddVV, 2, 0, 1),
            ad(Opcode::Ret1, 2, 2),
        ],
    );
    let source = lift_to_source(&module);
    assert_eq!(source.trim(), "return 5 + 3");
}

#[test]
fn test_compare_operand_swap() {
    // ISGE 0, 1 ; JMP ->4 ; KSHORT 2, 1 ; JMP ->5 ; KSHORT 2, 2 ; RET1 2, 2
    //
    // The ordered compare reads back as `a < b`, and both constant arms
    // collapse into one short-circuit expression.
    let module = module(
        2,
        3,
        vec![
            ad(Opcode::IsGe, 0, 1),
            jump(Opcode::Jmp, 0, 1, 4),
            ad(Opcode::KShort, 2, 1),
            jump(Opcode::Jmp, 0, 3, 5),
            ad(Opcode::KShort, 2, 2),
            ad(Opcode::Ret1, 2, 2),
        ],
    );
    let source = lift_to_source(&module);
    assert_eq!(source.trim(), "return arg0 < arg1 and 1 or 2");
}

#[test]
fn test_logical_or() {
    // ISTC 2, 0 ; JMP ->3 ; MOV 2, 1 ; RET1 2, 2  ->  return a or b
    let module = module(
        2,
        3,
        vec![
            ad(Opcode::IsTC, 2, 0),
            jump(Opcode::Jmp, 0, 1, 3),
            ad(Opcode::Mov, 2, 1),
            ad(Opcode::Ret1, 2, 2),
        ],
    );
    let source = lift_to_source(&module);
    assert_eq!(source.trim(), "return arg0 or arg1");
}

#[test]
fn test_logical_and() {
    // ISFC 2, 0 ; JMP ->3 ; MOV 2, 1 ; RET1 2, 2  ->  return a and b
    let module = module(
        2,
        3,
        vec![
            ad(Opcode::IsFC, 2, 0),
            jump(Opcode::Jmp, 0, 1, 3),
            ad(Opcode::Mov, 2, 1),
            ad(Opcode::Ret1, 2, 2),
        ],
    );
    let source = lift_to_source(&module);
    assert_eq!(source.trim(), "return arg0 and arg1");
}

#[test]
fn test_method_call_fusion() {
    // GGET 0 "obj" ; MOV 2, 0 ; TGETS 1, 0, "m" ; KSHORT 3, 7 ;
    // CALL 1, 1, 3 ; RET0  ->  obj:m(7)
    let module = module_with(
        0,
        4,
        vec![
            ad(Opcode::GGet, 0, 0),
            ad(Opcode::Mov, 2, 0),
            abc(Opcode::TGetS, 1, 0, 1),
            ad(Opcode::KShort, 3, 7),
            abc(Opcode::Call, 1, 1, 3),
            ad(Opcode::Ret0, 0, 1),
        ],
        vec![
            GcConstant::Str("obj".to_string()),
            GcConstant::Str("m".to_string()),
        ],
        vec![],
        vec![],
    );
    let source = lift_to_source(&module);
    assert_eq!(source.trim(), "obj:m(7)");
}

#[test]
fn test_generic_for_with_debug_names() {
    // for k, v in pairs(t) do end
    let instructions = vec![
        ad(Opcode::GGet, 1, 0),
        ad(Opcode::Mov, 2, 0),
        abc(Opcode::Call, 1, 4, 2),
        jump(Opcode::Jmp, 0, 3, 4),
        abc(Opcode::IterC, 4, 3, 3),
        jump(Opcode::IterL, 4, 5, 4),
        ad(Opcode::Ret0, 0, 1),
    ];
    let var = |name: &str, kind, begin, end| VariableInfo {
        name: name.to_string(),
        kind,
        scope_begin: begin,
        scope_end: end,
    };
    let module = module_with(
        1,
        6,
        instructions,
        vec![GcConstant::Str("pairs".to_string())],
        vec![],
        vec![
            var("t", VarKind::Str, 0, 7),
            var("", VarKind::ForGenerator, 3, 5),
            var("", VarKind::ForState, 3, 5),
            var("", VarKind::ForControl, 3, 5),
            var("k", VarKind::Str, 3, 5),
            var("v", VarKind::Str, 3, 5),
        ],
    );
    let source = lift_to_source(&module);
    assert!(
        source.contains("for k, v in pairs(t) do"),
        "unexpected source:\n{source}"
    );
}

#[test]
fn test_table_constructor_fold() {
    // TNEW 0 ; GGET 1 "g" ; TSETS 1, 0, "a" ; RET1 0, 2
    // -> return { a = g }
    let module = module_with(
        0,
        2,
        vec![
            ad(Opcode::TNew, 0, 0),
            ad(Opcode::GGet, 1, 1),
            abc(Opcode::TSetS, 1, 0, 0),
            ad(Opcode::Ret1, 0, 2),
        ],
        vec![
            GcConstant::Str("a".to_string()),
            GcConstant::Str("g".to_string()),
        ],
        vec![],
        vec![],
    );
    let source = lift_to_source(&module);
    assert_eq!(source.trim(), "return { a = g }");
}

#[test]
fn test_if_statement_framing() {
    // ISF 0 ; JMP ->4 ; KSHORT 1, 1 ; GSET 1 "g" ; RET0
    // -> if a then g = 1 end
    let module = module_with(
        1,
        2,
        vec![
            ad(Opcode::IsF, 0, 0),
            jump(Opcode::Jmp, 0, 1, 4),
            ad(Opcode::KShort, 1, 1),
            ad(Opcode::GSet, 1, 0),
            ad(Opcode::Ret0, 0, 1),
        ],
        vec![GcConstant::Str("g".to_string())],
        vec![],
        vec![],
    );
    let source = lift_to_source(&module);
    assert_eq!(source.trim(), "if arg0 then\n    g = 1\nend");
}

#[test]
fn test_numeric_for() {
    // KSHORT 0,1 ; KSHORT 1,10 ; KSHORT 2,1 ; FORI 0 ->5 ; FORL 0 ->4 ; RET0
    let module = module(
        0,
        4,
        vec![
            ad(Opcode::KShort, 0, 1),
            ad(Opcode::KShort, 1, 10),
            ad(Opcode::KShort, 2, 1),
            jump(Opcode::ForI, 0, 3, 5),
            jump(Opcode::ForL, 0, 4, 4),
            ad(Opcode::Ret0, 0, 1),
        ],
    );
    let source = lift_to_source(&module);
    assert!(
        source.contains("= 1, 10 do"),
        "unexpected source:\n{source}"
    );
}

#[test]
fn test_knil_fan_out() {
    // KNIL 0..2 expands into one nil assignment per slot.
    let module = module(
        0,
        3,
        vec![ad(Opcode::KNil, 0, 2), ad(Opcode::Ret0, 0, 1)],
    );
    let chunk = lift_module(&module).expect("lift succeeds");
    let root = chunk.root.unwrap();
    let assignments = chunk
        .func(root)
        .block
        .iter()
        .filter(|&&s| chunk.stmts.get(s).kind == StmtKind::Assignment)
        .count();
    assert_eq!(assignments, 3);
}

#[test]
fn test_only_return_lifts_to_empty_body() {
    let module = module(0, 1, vec![ad(Opcode::Ret0, 0, 1)]);
    let chunk = lift_module(&module).expect("lift succeeds");
    let root = chunk.root.unwrap();
    assert!(chunk
        .func(root)
        .block
        .iter()
        .all(|&s| chunk.stmts.get(s).kind == StmtKind::Empty));
}

#[test]
fn test_nan_constant_is_fatal() {
    let module = module_with(
        0,
        1,
        vec![ad(Opcode::KNum, 0, 0), ad(Opcode::Ret1, 0, 2)],
        vec![],
        vec![NumConstant::Num(f64::NAN)],
        vec![],
    );
    match lift_module(&module) {
        Err(LiftError::NumericLiteral { .. }) => {}
        other => panic!("expected a numeric literal error, got {other:?}"),
    }
}

#[test]
fn test_negative_zero_rewrites() {
    let module = module_with(
        0,
        1,
        vec![ad(Opcode::KNum, 0, 0), ad(Opcode::Ret1, 0, 2)],
        vec![],
        vec![NumConstant::Num(-0.0)],
        vec![],
    );
    let source = lift_to_source(&module);
    assert_eq!(source.trim(), "return -1 / 0");
}

#[test]
fn test_no_raw_statements_survive() {
    // After the full pipeline no instruction- or condition-kind statement
    // may remain anywhere in the tree.
    let module = module(
        2,
        3,
        vec![
            ad(Opcode::IsGe, 0, 1),
            jump(Opcode::Jmp, 0, 1, 4),
            ad(Opcode::KShort, 2, 1),
            jump(Opcode::Jmp, 0, 3, 5),
            ad(Opcode::KShort, 2, 2),
            ad(Opcode::Ret1, 2, 2),
        ],
    );
    let chunk = lift_module(&module).expect("lift succeeds");

    fn walk(chunk: &relume_hir::Chunk, block: &[relume_hir::stmt::StmtId]) {
        for &id in block {
            let stmt = chunk.stmts.get(id);
            assert!(
                !matches!(stmt.kind, StmtKind::Instruction | StmtKind::Condition),
                "statement {id:?} still has kind {:?}",
                stmt.kind
            );
            walk(chunk, &stmt.block);
        }
    }
    let root = chunk.root.unwrap();
    walk(&chunk, &chunk.func(root).block);
}
