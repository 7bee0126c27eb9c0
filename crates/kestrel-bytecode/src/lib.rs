//! # Kestrel Bytecode
//!
//! The compiled-function format consumed by the Kestrel VM.
//!
//! ## Design Principles
//!
//! - **Stack-based**: Instructions pop their operands and push their results
//! - **Compact**: One-byte opcodes with fixed-width little-endian operands
//! - **Self-describing**: Every function carries its constants, line table and catch table
//! - **Serializable**: Functions can be cached to disk for fast startup

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod constant;
pub mod disasm;
pub mod error;
pub mod function;
pub mod instruction;
pub mod operand;

pub use constant::{Constant, ConstantPool};
pub use disasm::{disassemble, disassemble_instruction};
pub use error::BytecodeError;
pub use function::{
    CatchEntry, Function, FunctionBuilder, FunctionFlags, JumpLabel, LineTable, UpvalueCapture,
};
pub use instruction::{OperandKind, Opcode};
pub use operand::{ConstantIndex, LocalIndex, UpvalueIndex};

/// Bytecode format version
pub const BYTECODE_VERSION: u32 = 1;
