use nom::bytes::complete::take;
use nom::number::complete::{le_u16, le_u32, le_u8};
use nom::IResult;

use crate::constant::{GcConstant, NumConstant, TableItem, TableTemplate};
use crate::instruction::Instruction;
use crate::{uleb128, uleb128_33};

/// Prototype header flag: has child prototypes.
pub const PROTO_CHILD: u8 = 0x01;
/// Prototype header flag: vararg function.
pub const PROTO_VARARG: u8 = 0x02;
/// Prototype header flag: uses the FFI.
pub const PROTO_FFI: u8 = 0x04;

/// Upvalue descriptor bit: refers to a parent-frame slot (not a parent
/// upvalue).
pub const UV_LOCAL: u16 = 0x8000;
/// Upvalue descriptor bit: the referenced slot is never reassigned.
pub const UV_IMMUTABLE: u16 = 0x4000;

/// Debug variable record kinds. The numbered internal kinds describe loop
/// control slots; only named (`Str`) records describe user variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    ForIndex,
    ForStop,
    ForStep,
    ForGenerator,
    ForState,
    ForControl,
    Str,
}

/// One debug variable record: a name (empty for internal kinds) live over
/// `[scope_begin, scope_end]` instruction ids.
#[derive(Debug, Clone)]
pub struct VariableInfo {
    pub name: String,
    pub kind: VarKind,
    pub scope_begin: u32,
    pub scope_end: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PrototypeHeader {
    pub flags: u8,
    pub parameters: u8,
    pub frame_size: u8,
}

/// A parsed function prototype.
#[derive(Debug, Clone, Default)]
pub struct Prototype {
    pub header: PrototypeHeader,
    pub instructions: Vec<Instruction>,
    /// GC constants in pool order (the dump stores them reversed).
    pub gc_constants: Vec<GcConstant>,
    pub num_constants: Vec<NumConstant>,
    /// Raw upvalue descriptors; bit 15 = local flag, low bits = slot.
    pub upvalues: Vec<u16>,
    /// Debug variable records, empty when the dump is stripped.
    pub variable_infos: Vec<VariableInfo>,
    /// Size in bytes of this prototype's dump segment.
    pub size: usize,
}

impl Prototype {
    pub fn is_vararg(&self) -> bool {
        self.header.flags & PROTO_VARARG != 0
    }

    /// Parse one prototype segment. `child_stack` holds the indices of
    /// already-parsed prototypes: the dump is bottom-up and child slots pop
    /// from it in reverse order.
    pub(crate) fn parse<'a>(
        input: &'a [u8],
        version: u8,
        stripped: bool,
        child_stack: &mut Vec<usize>,
    ) -> IResult<&'a [u8], Self> {
        let segment_len = input.len();
        let (input, flags) = le_u8(input)?;
        let (input, parameters) = le_u8(input)?;
        let (input, frame_size) = le_u8(input)?;
        let (input, num_upvalues) = le_u8(input)?;
        let (input, num_gc) = uleb128(input)?;
        let (input, num_num) = uleb128(input)?;
        let (input, num_bc) = uleb128(input)?;

        let (input, debug_len, num_lines) = if stripped {
            (input, 0, 0)
        } else {
            let (input, debug_len) = uleb128(input)?;
            if debug_len > 0 {
                let (input, _first_line) = uleb128(input)?;
                let (input, num_lines) = uleb128(input)?;
                (input, debug_len, num_lines)
            } else {
                (input, 0, 0)
            }
        };

        let mut instructions = Vec::with_capacity(num_bc);
        let mut input = input;
        for _ in 0..num_bc {
            let (rest, word) = le_u32(input)?;
            input = rest;
            let insn = Instruction::decode(word, version).ok_or_else(|| {
                nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Tag))
            })?;
            instructions.push(insn);
        }

        let mut upvalues = Vec::with_capacity(num_upvalues as usize);
        for _ in 0..num_upvalues {
            let (rest, uv) = le_u16(input)?;
            input = rest;
            upvalues.push(uv);
        }

        // GC constants are serialized last-to-first.
        let mut gc_constants = vec![GcConstant::I64(0); num_gc];
        for i in (0..num_gc).rev() {
            let (rest, constant) = parse_gc_constant(input, child_stack)?;
            input = rest;
            gc_constants[i] = constant;
        }

        let mut num_constants = Vec::with_capacity(num_num);
        for _ in 0..num_num {
            let (rest, constant) = parse_num_constant(input)?;
            input = rest;
            num_constants.push(constant);
        }

        let variable_infos = if debug_len > 0 {
            let (rest, debug_bytes) = take(debug_len)(input)?;
            input = rest;
            parse_debug_info(debug_bytes, num_bc, num_lines, num_upvalues)?
        } else {
            Vec::new()
        };

        Ok((
            input,
            Prototype {
                header: PrototypeHeader {
                    flags,
                    parameters,
                    frame_size,
                },
                instructions,
                gc_constants,
                num_constants,
                upvalues,
                variable_infos,
                size: segment_len - input.len(),
            },
        ))
    }
}

fn parse_gc_constant<'a>(
    input: &'a [u8],
    child_stack: &mut Vec<usize>,
) -> IResult<&'a [u8], GcConstant> {
    let (input, tag) = uleb128(input)?;
    match tag {
        0 => {
            let child = child_stack.pop().ok_or_else(|| {
                nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Count))
            })?;
            Ok((input, GcConstant::Child(child)))
        }
        1 => {
            let (input, template) = parse_table_template(input)?;
            Ok((input, GcConstant::Table(template)))
        }
        2 => {
            let (input, lo) = uleb128(input)?;
            let (input, hi) = uleb128(input)?;
            let bits = ((hi as u64) << 32) | (lo as u64 & 0xFFFF_FFFF);
            Ok((input, GcConstant::I64(bits as i64)))
        }
        3 => {
            let (input, lo) = uleb128(input)?;
            let (input, hi) = uleb128(input)?;
            Ok((
                input,
                GcConstant::U64(((hi as u64) << 32) | (lo as u64 & 0xFFFF_FFFF)),
            ))
        }
        4 => {
            // Complex cdata: real part (always zero in emitted literals)
            // followed by the imaginary part.
            let (input, _re_lo) = uleb128(input)?;
            let (input, _re_hi) = uleb128(input)?;
            let (input, lo) = uleb128(input)?;
            let (input, hi) = uleb128(input)?;
            let bits = ((hi as u64) << 32) | (lo as u64 & 0xFFFF_FFFF);
            Ok((input, GcConstant::Complex(f64::from_bits(bits))))
        }
        n => {
            let (input, bytes) = take(n - 5)(input)?;
            Ok((
                input,
                GcConstant::Str(String::from_utf8_lossy(bytes).into_owned()),
            ))
        }
    }
}

fn parse_num_constant(input: &[u8]) -> IResult<&[u8], NumConstant> {
    let (input, (is_num, lo)) = uleb128_33(input)?;
    if is_num {
        let (input, hi) = uleb128(input)?;
        let bits = ((hi as u64) << 32) | (lo as u64 & 0xFFFF_FFFF);
        Ok((input, NumConstant::Num(f64::from_bits(bits))))
    } else {
        Ok((input, NumConstant::Int(lo as i32)))
    }
}

fn parse_table_item(input: &[u8]) -> IResult<&[u8], TableItem> {
    let (input, tag) = uleb128(input)?;
    match tag {
        0 => Ok((input, TableItem::Nil)),
        1 => Ok((input, TableItem::False)),
        2 => Ok((input, TableItem::True)),
        3 => {
            let (input, v) = uleb128(input)?;
            Ok((input, TableItem::Int(v as u32 as i32)))
        }
        4 => {
            let (input, lo) = uleb128(input)?;
            let (input, hi) = uleb128(input)?;
            let bits = ((hi as u64) << 32) | (lo as u64 & 0xFFFF_FFFF);
            Ok((input, TableItem::Num(f64::from_bits(bits))))
        }
        n => {
            let (input, bytes) = take(n - 5)(input)?;
            Ok((
                input,
                TableItem::Str(String::from_utf8_lossy(bytes).into_owned()),
            ))
        }
    }
}

fn parse_table_template(input: &[u8]) -> IResult<&[u8], TableTemplate> {
    let (input, num_array) = uleb128(input)?;
    let (input, num_hash) = uleb128(input)?;
    let mut template = TableTemplate::default();
    let mut input = input;
    for _ in 0..num_array {
        let (rest, item) = parse_table_item(input)?;
        input = rest;
        template.array.push(item);
    }
    for _ in 0..num_hash {
        let (rest, key) = parse_table_item(input)?;
        let (rest, value) = parse_table_item(rest)?;
        input = rest;
        template.hash.push((key, value));
    }
    Ok((input, template))
}

/// Decode the debug segment: per-instruction line entries (skipped — their
/// width follows from the line count), upvalue names (skipped), then
/// variable records with delta-encoded scope endpoints.
fn parse_debug_info(
    debug: &[u8],
    num_bc: usize,
    num_lines: usize,
    num_upvalues: u8,
) -> Result<Vec<VariableInfo>, nom::Err<nom::error::Error<&[u8]>>> {
    let truncated = || nom::Err::Failure(nom::error::Error::new(debug, nom::error::ErrorKind::Eof));

    let line_width = if num_lines < 0x100 {
        1
    } else if num_lines < 0x10000 {
        2
    } else {
        4
    };
    let mut offset = num_bc * line_width;

    for _ in 0..num_upvalues {
        let terminator = debug
            .get(offset..)
            .and_then(|rest| rest.iter().position(|&b| b == 0))
            .ok_or_else(truncated)?;
        offset += terminator + 1;
    }

    let mut vars = Vec::new();
    let mut last_pc = 0u64;
    loop {
        let tag = *debug.get(offset).ok_or_else(truncated)?;
        if tag == 0 {
            return Ok(vars);
        }

        let (name, kind) = if tag >= 7 {
            let end = debug[offset..]
                .iter()
                .position(|&b| b == 0)
                .map(|n| offset + n)
                .ok_or_else(truncated)?;
            let name = String::from_utf8_lossy(&debug[offset..end]).into_owned();
            offset = end + 1;
            (name, VarKind::Str)
        } else {
            offset += 1;
            let kind = match tag {
                1 => VarKind::ForIndex,
                2 => VarKind::ForStop,
                3 => VarKind::ForStep,
                4 => VarKind::ForGenerator,
                5 => VarKind::ForState,
                _ => VarKind::ForControl,
            };
            (String::new(), kind)
        };

        let (start_delta, n) = read_uleb_at(debug, offset).ok_or_else(truncated)?;
        offset += n;
        let (end_delta, n) = read_uleb_at(debug, offset).ok_or_else(truncated)?;
        offset += n;
        last_pc += start_delta;
        vars.push(VariableInfo {
            name,
            kind,
            scope_begin: last_pc as u32,
            scope_end: (last_pc + end_delta) as u32,
        });
    }
}

fn read_uleb_at(bytes: &[u8], mut offset: usize) -> Option<(u64, usize)> {
    let start = offset;
    let mut result = 0u64;
    let mut shift = 0;
    loop {
        let byte = *bytes.get(offset)?;
        offset += 1;
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((result, offset - start));
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_uleb_at() {
        assert_eq!(read_uleb_at(&[0x05], 0), Some((5, 1)));
        assert_eq!(read_uleb_at(&[0x80, 0x01], 0), Some((128, 2)));
        assert_eq!(read_uleb_at(&[0x80], 0), None);
    }
}
