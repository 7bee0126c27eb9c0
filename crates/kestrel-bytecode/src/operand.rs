//! Bytecode operands and fixed-width operand decoding

use serde::{Deserialize, Serialize};

use crate::error::{BytecodeError, Result};

/// Index into the constant pool (8, 16 or 32-bit encoded)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ConstantIndex(pub u32);

impl ConstantIndex {
    /// Create a new constant index
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get index value
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Index of a local slot, relative to the frame pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct LocalIndex(pub u16);

impl LocalIndex {
    /// Create a new local index
    #[inline]
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    /// Get index value
    #[inline]
    pub const fn index(self) -> u16 {
        self.0
    }
}

impl From<u16> for LocalIndex {
    fn from(index: u16) -> Self {
        Self(index)
    }
}

/// Index into a closure's upvalue array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct UpvalueIndex(pub u8);

impl UpvalueIndex {
    /// Create a new upvalue index
    #[inline]
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    /// Get index value
    #[inline]
    pub const fn index(self) -> u8 {
        self.0
    }
}

/// Read a `u8` operand at `offset`
#[inline]
pub fn read_u8(code: &[u8], offset: usize) -> Result<u8> {
    code.get(offset)
        .copied()
        .ok_or(BytecodeError::UnexpectedEnd(offset))
}

/// Read a little-endian `u16` operand at `offset`
#[inline]
pub fn read_u16(code: &[u8], offset: usize) -> Result<u16> {
    match code.get(offset..offset + 2) {
        Some(bytes) => Ok(u16::from_le_bytes([bytes[0], bytes[1]])),
        None => Err(BytecodeError::UnexpectedEnd(offset)),
    }
}

/// Read a little-endian `i16` operand at `offset`
#[inline]
pub fn read_i16(code: &[u8], offset: usize) -> Result<i16> {
    read_u16(code, offset).map(|v| v as i16)
}

/// Read a little-endian `u32` operand at `offset`
#[inline]
pub fn read_u32(code: &[u8], offset: usize) -> Result<u32> {
    match code.get(offset..offset + 4) {
        Some(bytes) => Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        None => Err(BytecodeError::UnexpectedEnd(offset)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_little_endian() {
        let code = [0x34, 0x12, 0xff, 0xff, 0x78, 0x56, 0x34, 0x12];
        assert_eq!(read_u8(&code, 1).unwrap(), 0x12);
        assert_eq!(read_u16(&code, 0).unwrap(), 0x1234);
        assert_eq!(read_i16(&code, 2).unwrap(), -1);
        assert_eq!(read_u32(&code, 4).unwrap(), 0x1234_5678);
    }

    #[test]
    fn test_read_past_end() {
        let code = [0x01];
        assert_eq!(read_u16(&code, 0), Err(BytecodeError::UnexpectedEnd(0)));
        assert_eq!(read_u8(&code, 3), Err(BytecodeError::UnexpectedEnd(3)));
    }

    #[test]
    fn test_index_newtypes() {
        assert_eq!(ConstantIndex::new(70_000).index(), 70_000);
        assert_eq!(LocalIndex::from(3).index(), 3);
        assert_eq!(UpvalueIndex::new(9).index(), 9);
    }
}
