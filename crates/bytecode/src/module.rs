use nom::bytes::complete::{tag, take};
use nom::number::complete::le_u8;
use nom::IResult;

use crate::prototype::Prototype;
use crate::uleb128;

/// Dump header flag: big-endian instruction words (unsupported).
pub const DUMP_BE: u32 = 0x01;
/// Dump header flag: debug info stripped.
pub const DUMP_STRIP: u32 = 0x02;
/// Dump header flag: prototypes use FFI constants.
pub const DUMP_FFI: u32 = 0x04;
/// Dump header flag: two-slot frame layout for call arguments.
pub const DUMP_FR2: u32 = 0x08;

/// The two recognized dump format versions (LuaJIT 2.0 and 2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub version: Version,
    pub flags: u32,
    pub fr2: bool,
}

/// A parsed bytecode module: the read-only input to the lifter.
#[derive(Debug)]
pub struct Module {
    pub header: Header,
    pub chunk_name: Option<String>,
    /// All prototypes, children before parents (dump order).
    pub prototypes: Vec<Prototype>,
    /// Index of the top-level prototype.
    pub main: usize,
    /// Total byte size of all prototype segments, for progress reporting.
    pub prototypes_total_size: usize,
}

impl Module {
    pub fn main_prototype(&self) -> &Prototype {
        &self.prototypes[self.main]
    }
}

/// Read a `luajit -b` dump. Returns a string error with offset context on
/// malformed input; never panics.
pub fn read_module(bytes: &[u8]) -> Result<Module, String> {
    match parse_module(bytes) {
        Ok((_, module)) => Ok(module),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(format!(
            "malformed bytecode dump at byte {}: {:?}",
            bytes.len() - e.input.len(),
            e.code
        )),
        Err(nom::Err::Incomplete(_)) => Err("truncated bytecode dump".to_string()),
    }
}

fn parse_module(input: &[u8]) -> IResult<&[u8], Module> {
    let (input, _) = tag(&b"\x1bLJ"[..])(input)?;
    let (input, version_byte) = le_u8(input)?;
    let version = match version_byte {
        1 => Version::V1,
        2 => Version::V2,
        _ => {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )))
        }
    };

    let (input, flags) = uleb128(input)?;
    let flags = flags as u32;
    if flags & DUMP_BE != 0 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        )));
    }
    let stripped = flags & DUMP_STRIP != 0;

    let (input, chunk_name) = if stripped {
        (input, None)
    } else {
        let (input, len) = uleb128(input)?;
        let (input, name) = take(len)(input)?;
        (input, Some(String::from_utf8_lossy(name).into_owned()))
    };

    let mut prototypes: Vec<Prototype> = Vec::new();
    let mut child_stack: Vec<usize> = Vec::new();
    let mut prototypes_total_size = 0;
    let mut input = input;
    loop {
        let (rest, len) = uleb128(input)?;
        if len == 0 {
            input = rest;
            break;
        }
        let (rest, segment) = take(len)(rest)?;
        let (_, prototype) =
            Prototype::parse(segment, version_byte, stripped, &mut child_stack)?;
        prototypes_total_size += prototype.size.max(len);
        child_stack.push(prototypes.len());
        prototypes.push(prototype);
        input = rest;
    }

    if prototypes.is_empty() {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Count,
        )));
    }

    let main = prototypes.len() - 1;
    Ok((
        input,
        Module {
            header: Header {
                version,
                flags,
                fr2: version == Version::V2 && flags & DUMP_FR2 != 0,
            },
            chunk_name,
            prototypes,
            main,
            prototypes_total_size,
        },
    ))
}
