pub mod constant;
pub mod instruction;
pub mod module;
pub mod opcode;
pub mod prototype;

use nom::number::complete::le_u8;
use nom::IResult;

/// Parse a ULEB128-encoded unsigned integer.
pub(crate) fn uleb128(input: &[u8]) -> IResult<&[u8], usize> {
    let mut result: usize = 0;
    let mut shift = 0;
    let mut i = input;
    loop {
        let (rest, byte) = le_u8(i)?;
        result |= ((byte & 0x7F) as usize) << shift;
        i = rest;
        if byte & 0x80 == 0 {
            return Ok((i, result));
        }
        shift += 7;
    }
}

/// Parse LuaJIT's ULEB128_33 variant: the low bit of the first byte is a
/// separate flag and the value starts one bit up.
pub(crate) fn uleb128_33(input: &[u8]) -> IResult<&[u8], (bool, u32)> {
    let (mut input, first) = le_u8(input)?;
    let flag = first & 1 != 0;
    let mut result = (first >> 1) as u32 & 0x3F;
    if first & 0x80 != 0 {
        let mut shift = 6;
        loop {
            let (rest, byte) = le_u8(input)?;
            input = rest;
            result |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
    }
    Ok((input, (flag, result)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uleb128() {
        assert_eq!(uleb128(&[0x00, 0xFF]).unwrap().1, 0);
        assert_eq!(uleb128(&[0x7F]).unwrap().1, 127);
        assert_eq!(uleb128(&[0xE5, 0x8E, 0x26]).unwrap().1, 624485);
    }

    #[test]
    fn test_uleb128_33() {
        // Flag bit set, value 5: (5 << 1) | 1 = 0x0B
        assert_eq!(uleb128_33(&[0x0B]).unwrap().1, (true, 5));
        // Flag clear, value 40: 40 << 1 = 0x50
        assert_eq!(uleb128_33(&[0x50]).unwrap().1, (false, 40));
    }
}
