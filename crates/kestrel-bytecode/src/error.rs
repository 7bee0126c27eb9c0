//! Bytecode errors

use thiserror::Error;

/// Errors that can occur while building or decoding bytecode
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BytecodeError {
    /// Byte does not name any opcode
    #[error("Invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),

    /// Operand bytes run past the end of the code
    #[error("Truncated operand at offset {0}")]
    UnexpectedEnd(usize),

    /// Operand value is not valid for its instruction
    #[error("Invalid operand at offset {0}")]
    InvalidOperand(usize),

    /// Constant index outside the pool
    #[error("Constant index {0} out of range")]
    ConstantOutOfRange(u32),

    /// Jump distance does not fit the 16-bit operand
    #[error("Jump at offset {0} is too far")]
    JumpTooFar(usize),

    /// Catch-table range is empty or lies outside the code
    #[error("Malformed catch entry {from}..{to} -> {target}")]
    MalformedCatchEntry {
        /// Start of the protected range
        from: u32,
        /// End of the protected range (exclusive)
        to: u32,
        /// Handler offset
        target: u32,
    },

    /// A jump label was never patched
    #[error("Unpatched jump at offset {0}")]
    UnpatchedJump(usize),
}

/// Result type for bytecode operations
pub type Result<T> = std::result::Result<T, BytecodeError>;
