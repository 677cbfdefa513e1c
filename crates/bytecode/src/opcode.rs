/// LuaJIT bytecode opcodes.
///
/// The enum follows the 2.1 numbering; 2.0 dumps are decoded through a
/// remap table because four opcodes (ISTYPE/ISNUM/TGETR/TSETR) were
/// inserted mid-table between the two versions.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// ISLT: if A < D then jump
    IsLt = 0,
    /// ISGE: if A >= D then jump
    IsGe,
    /// ISLE: if A <= D then jump
    IsLe,
    /// ISGT: if A > D then jump
    IsGt,
    /// ISEQV: if A == D then jump
    IsEqV,
    /// ISNEV: if A ~= D then jump
    IsNeV,
    /// ISEQS: if A == str(D) then jump
    IsEqS,
    /// ISNES: if A ~= str(D) then jump
    IsNeS,
    /// ISEQN: if A == num(D) then jump
    IsEqN,
    /// ISNEN: if A ~= num(D) then jump
    IsNeN,
    /// ISEQP: if A == pri(D) then jump
    IsEqP,
    /// ISNEP: if A ~= pri(D) then jump
    IsNeP,
    /// ISTC: A = D; if D truthy then jump
    IsTC,
    /// ISFC: A = D; if D falsy then jump
    IsFC,
    /// IST: if D truthy then jump
    IsT,
    /// ISF: if D falsy then jump
    IsF,
    /// ISTYPE: type guard (JIT internal)
    IsType,
    /// ISNUM: number guard (JIT internal)
    IsNum,
    /// MOV: A = D
    Mov,
    /// NOT: A = not D
    Not,
    /// UNM: A = -D
    Unm,
    /// LEN: A = #D
    Len,
    /// ADDVN: A = B + num(C)
    AddVN,
    /// SUBVN: A = B - num(C)
    SubVN,
    /// MULVN: A = B * num(C)
    MulVN,
    /// DIVVN: A = B / num(C)
    DivVN,
    /// MODVN: A = B % num(C)
    ModVN,
    /// ADDNV: A = num(C) + B
    AddNV,
    /// SUBNV: A = num(C) - B
    SubNV,
    /// MULNV: A = num(C) * B
    MulNV,
    /// DIVNV: A = num(C) / B
    DivNV,
    /// MODNV: A = num(C) % B
    ModNV,
    /// ADDVV: A = B + C
    AddVV,
    /// SUBVV: A = B - C
    SubVV,
    /// MULVV: A = B * C
    MulVV,
    /// DIVVV: A = B / C
    DivVV,
    /// MODVV: A = B % C
    ModVV,
    /// POW: A = B ^ C
    Pow,
    /// CAT: A = B .. ... .. C
    Cat,
    /// KSTR: A = str(D)
    KStr,
    /// KCDATA: A = cdata(D)
    KCData,
    /// KSHORT: A = signed 16-bit D
    KShort,
    /// KNUM: A = num(D)
    KNum,
    /// KPRI: A = pri(D) (0 = nil, 1 = false, 2 = true)
    KPri,
    /// KNIL: A..D = nil
    KNil,
    /// UGET: A = upvalue(D)
    UGet,
    /// USETV: upvalue(A) = D
    USetV,
    /// USETS: upvalue(A) = str(D)
    USetS,
    /// USETN: upvalue(A) = num(D)
    USetN,
    /// USETP: upvalue(A) = pri(D)
    USetP,
    /// UCLO: close upvalues >= A, then jump to D
    UClo,
    /// FNEW: A = closure(proto(D))
    FNew,
    /// TNEW: A = new table (D = size hint)
    TNew,
    /// TDUP: A = duplicate of template table(D)
    TDup,
    /// GGET: A = _G[str(D)]
    GGet,
    /// GSET: _G[str(D)] = A
    GSet,
    /// TGETV: A = B[C]
    TGetV,
    /// TGETS: A = B[str(C)]
    TGetS,
    /// TGETB: A = B[literal C]
    TGetB,
    /// TGETR: A = rawget(B, C) (JIT internal)
    TGetR,
    /// TSETV: B[C] = A
    TSetV,
    /// TSETS: B[str(C)] = A
    TSetS,
    /// TSETB: B[literal C] = A
    TSetB,
    /// TSETM: (A-1)[num(D)..] = multres
    TSetM,
    /// TSETR: rawset(B, C, A) (JIT internal)
    TSetR,
    /// CALLM: A..A+B-2 = A(A+1..A+C+multres)
    CallM,
    /// CALL: A..A+B-2 = A(A+1..A+C-1)
    Call,
    /// CALLMT: tailcall A(A+1..A+D+multres)
    CallMT,
    /// CALLT: tailcall A(A+1..A+D-1)
    CallT,
    /// ITERC: A, A+1, A+2 = A-3, A-2, A-1; A..A+B-2 = A-3(A-2, A-1)
    IterC,
    /// ITERN: specialized next() iterator call
    IterN,
    /// VARG: A..A+B-2 = ...
    VarG,
    /// ISNEXT: verify ITERN specialization, jump to loop
    IsNext,
    /// RETM: return A..A+D+multres-1
    RetM,
    /// RET: return A..A+D-2
    Ret,
    /// RET0: return
    Ret0,
    /// RET1: return A
    Ret1,
    /// FORI: numeric for init, jump past loop if done
    ForI,
    /// JFORI: JIT-compiled FORI
    JForI,
    /// FORL: numeric for loop back-edge
    ForL,
    /// IFORL: interpreter FORL
    IForL,
    /// JFORL: JIT-compiled FORL
    JForL,
    /// ITERL: iterator for loop back-edge
    IterL,
    /// IITERL: interpreter ITERL
    IIterL,
    /// JITERL: JIT-compiled ITERL
    JIterL,
    /// LOOP: generic loop marker
    Loop,
    /// ILOOP: interpreter LOOP
    ILoop,
    /// JLOOP: JIT-compiled LOOP
    JLoop,
    /// JMP: unconditional jump
    Jmp,
    /// FUNCF: fixed-arg function header
    FuncF,
    /// IFUNCF: interpreter FUNCF
    IFuncF,
    /// JFUNCF: JIT-compiled FUNCF
    JFuncF,
    /// FUNCV: vararg function header
    FuncV,
    /// IFUNCV: interpreter FUNCV
    IFuncV,
    /// JFUNCV: JIT-compiled FUNCV
    JFuncV,
    /// FUNCC: C function header
    FuncC,
    /// FUNCCW: wrapped C function header
    FuncCW,
}

/// Coarse instruction classification driving the first lifter pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Plain register-writing instruction.
    Normal,
    /// Ordered or equality comparison, always followed by a jump.
    Compare,
    /// Truthiness test (IST/ISF), always followed by a jump.
    Test,
    /// Test that also copies its operand (ISTC/ISFC).
    TestAndCopy,
    /// Jump-displacement instruction (JMP/LOOP/FORI/FORL/ITERL/ISNEXT/UCLO).
    Jump,
    /// Return or tailcall.
    Return,
    /// Closure creation.
    FunctionNew,
}

const V1_OPCODE_COUNT: u8 = 93;
const V2_OPCODE_COUNT: u8 = 97;

impl Opcode {
    /// Decode an opcode byte for the given dump version (1 or 2).
    pub fn from_byte(byte: u8, version: u8) -> Option<Self> {
        let mapped = if version == 1 {
            if byte >= V1_OPCODE_COUNT {
                return None;
            }
            // 2.0 has no ISTYPE/ISNUM pair and no TGETR/TSETR.
            let mut b = byte;
            if b >= Opcode::IsType as u8 {
                b += 2;
            }
            if b >= Opcode::TGetR as u8 {
                b += 1;
            }
            if b >= Opcode::TSetR as u8 {
                b += 1;
            }
            b
        } else {
            if byte >= V2_OPCODE_COUNT {
                return None;
            }
            byte
        };

        Some(unsafe { std::mem::transmute::<u8, Opcode>(mapped) })
    }

    pub fn kind(self) -> OpKind {
        use Opcode::*;
        match self {
            IsLt | IsGe | IsLe | IsGt | IsEqV | IsNeV | IsEqS | IsNeS | IsEqN | IsNeN | IsEqP
            | IsNeP => OpKind::Compare,
            IsT | IsF => OpKind::Test,
            IsTC | IsFC => OpKind::TestAndCopy,
            UClo | IsNext | ForI | JForI | ForL | IForL | JForL | IterL | IIterL | JIterL
            | Loop | ILoop | JLoop | Jmp => OpKind::Jump,
            CallMT | CallT | RetM | Ret | Ret0 | Ret1 => OpKind::Return,
            FNew => OpKind::FunctionNew,
            _ => OpKind::Normal,
        }
    }

    /// True for instructions whose D operand is a jump displacement.
    pub fn is_jump(self) -> bool {
        matches!(self.kind(), OpKind::Jump)
    }

    /// Uses the ABC operand layout rather than AD.
    pub fn has_split_operands(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            AddVN | SubVN | MulVN | DivVN | ModVN | AddNV | SubNV | MulNV | DivNV | ModNV
                | AddVV | SubVV | MulVV | DivVV | ModVV | Pow | Cat | TGetV | TGetS | TGetB
                | TGetR | TSetV | TSetS | TSetB | TSetR | CallM | Call | IterC | IterN | VarG
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_remap() {
        // MOV sits two slots earlier in 2.0 dumps.
        assert_eq!(Opcode::from_byte(18, 2), Some(Opcode::Mov));
        assert_eq!(Opcode::from_byte(16, 1), Some(Opcode::Mov));
        // TSETM shifts by three in 2.0 (ISTYPE, ISNUM, TGETR precede it in 2.1).
        assert_eq!(
            Opcode::from_byte(Opcode::TSetM as u8 - 3, 1),
            Some(Opcode::TSetM)
        );
        assert_eq!(Opcode::from_byte(200, 2), None);
    }

    #[test]
    fn test_kind_table() {
        assert_eq!(Opcode::IsLt.kind(), OpKind::Compare);
        assert_eq!(Opcode::IsTC.kind(), OpKind::TestAndCopy);
        assert_eq!(Opcode::UClo.kind(), OpKind::Jump);
        assert_eq!(Opcode::CallT.kind(), OpKind::Return);
        assert_eq!(Opcode::FNew.kind(), OpKind::FunctionNew);
        assert_eq!(Opcode::AddVV.kind(), OpKind::Normal);
    }
}
