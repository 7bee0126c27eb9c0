//! Bytecode instructions (opcodes)
//!
//! Every instruction is a one-byte opcode followed by zero or more fixed-width
//! little-endian operands. Jump offsets are relative to the end of the
//! instruction that carries them.

use serde::{Deserialize, Serialize};

/// Bytecode opcodes
///
/// Stack-based instruction set. Instructions pop their inputs from the value
/// stack and push their results back onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    // ==================== Frame ====================
    /// Do nothing
    Nop = 0x00,
    /// Return the value on top of the stack from the current frame
    Return = 0x01,
    /// Return nil from the current frame
    ReturnNil = 0x02,

    // ==================== Constants ====================
    /// Push nil
    Nil = 0x08,
    /// Push true
    True = 0x09,
    /// Push false
    False = 0x0A,
    /// Push a small integer immediate (i8)
    Int8 = 0x0B,
    /// Push constants\[u8\]
    Const = 0x0C,
    /// Push constants\[u16\]
    Const16 = 0x0D,
    /// Push constants\[u32\]
    Const32 = 0x0E,

    // ==================== Stack ====================
    /// Discard the top of the stack
    Pop = 0x10,
    /// Duplicate the top of the stack
    Dup = 0x11,
    /// Swap the two topmost values
    Swap = 0x12,

    // ==================== Variables ====================
    /// Push locals\[u16\]
    GetLocal = 0x18,
    /// Pop into locals\[u16\]
    SetLocal = 0x19,
    /// Push upvalues\[u8\]
    GetUpvalue = 0x1A,
    /// Pop into upvalues\[u8\]
    SetUpvalue = 0x1B,
    /// Close the upvalue over the top slot, then pop it
    CloseUpvalue = 0x1C,
    /// Close every open upvalue at or above locals\[u16\]
    CloseUpvalues = 0x1D,
    /// Push globals\[constants\[u16\]\]
    GetGlobal = 0x1E,
    /// Pop into globals\[constants\[u16\]\]
    SetGlobal = 0x1F,
    /// Push the frame's receiver
    SelfValue = 0x20,

    // ==================== Arithmetic ====================
    /// Generic addition
    Add = 0x28,
    /// Generic subtraction
    Sub = 0x29,
    /// Generic multiplication
    Mul = 0x2A,
    /// Generic division
    Div = 0x2B,
    /// Generic remainder
    Mod = 0x2C,
    /// Generic negation
    Neg = 0x2D,
    /// Logical not
    Not = 0x2E,

    // ==================== Comparison ====================
    /// Equality
    Eq = 0x30,
    /// Inequality
    Ne = 0x31,
    /// Less than
    Lt = 0x32,
    /// Less than or equal
    Le = 0x33,
    /// Greater than
    Gt = 0x34,
    /// Greater than or equal
    Ge = 0x35,

    // ==================== Integer fast paths ====================
    /// Integer addition, generic fallback
    AddInt = 0x38,
    /// Integer subtraction, generic fallback
    SubInt = 0x39,
    /// Integer multiplication, generic fallback
    MulInt = 0x3A,
    /// Integer less-than, generic fallback
    LtInt = 0x3B,
    /// Integer less-or-equal, generic fallback
    LeInt = 0x3C,
    /// Integer equality, generic fallback
    EqInt = 0x3D,

    // ==================== Float fast paths ====================
    /// Float addition, generic fallback
    AddFloat = 0x40,
    /// Float subtraction, generic fallback
    SubFloat = 0x41,
    /// Float multiplication, generic fallback
    MulFloat = 0x42,
    /// Float division, generic fallback
    DivFloat = 0x43,
    /// Float less-than, generic fallback
    LtFloat = 0x44,

    // ==================== Control Flow ====================
    /// Unconditional forward jump (u16)
    Jump = 0x48,
    /// Pop; jump forward (u16) if falsy
    JumpIfFalse = 0x49,
    /// Pop; jump forward (u16) if truthy
    JumpIfTrue = 0x4A,
    /// Unconditional backward jump (u16)
    Loop = 0x4B,
    /// Jump (i16) out of protected regions, running `finally` blocks on the way.
    /// The u8 operand is the number of finally blocks whose bodies are exited.
    Leave = 0x4C,

    // ==================== Calls ====================
    /// Call stack\[-argc-1\] with argc (u8) arguments
    Call = 0x50,
    /// Call in tail position; always followed by `RETURN`, which runs when
    /// the frame cannot be reused
    TailCall = 0x51,
    /// Invoke method constants\[u16\] with u8 arguments through cache slot u16
    Invoke = 0x52,
    /// Create a closure over the function constant (u16)
    Closure = 0x53,

    // ==================== Classes ====================
    /// Create a class named constants\[u16\]
    Class = 0x58,
    /// Pop a superclass and attach it to the class below it
    Inherit = 0x59,
    /// Pop a closure and define it as method constants\[u16\] on the class below it
    Method = 0x5A,
    /// Replace an instance with its field constants\[u16\]
    GetField = 0x5B,
    /// Pop value and instance; store the field constants\[u16\]
    SetField = 0x5C,

    // ==================== Collections ====================
    /// Pop u16 values into a new array
    Array = 0x60,
    /// Pop u16 key/value pairs into a new map
    Map = 0x61,
    /// Pop index and container; push container\[index\]
    IndexGet = 0x62,
    /// Pop value, index and container; store container\[index\] = value
    IndexSet = 0x63,

    // ==================== Iteration ====================
    /// Replace an iterable with an iterator over it
    GetIter = 0x68,
    /// Pop an iterator; push its next element, or jump forward (u16) when exhausted
    IterNext = 0x69,

    // ==================== Exceptions ====================
    /// Pop a value and throw it
    Throw = 0x70,
    /// Resume the completion that entered the current `finally` block
    EndFinally = 0x71,

    // ==================== Coroutines ====================
    /// Pop a value and suspend the enclosing generator with it
    Yield = 0x78,
    /// Pop a promise and push its result once resolved
    Await = 0x79,

    // ==================== Concurrency ====================
    /// Start a lightweight thread calling stack\[-argc-1\] with argc (u8) arguments
    Spawn = 0x80,
}

/// Operand layout that follows an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// No operands
    None,
    /// Signed 8-bit immediate
    Imm8,
    /// 8-bit constant index
    Const8,
    /// 16-bit constant index
    Const16,
    /// 32-bit constant index
    Const32,
    /// 16-bit local slot
    Local,
    /// 8-bit upvalue index
    Upvalue,
    /// 16-bit constant index naming a global, field, method or class
    Name,
    /// 8-bit argument count
    Argc,
    /// 16-bit element count
    Count,
    /// 16-bit forward jump
    Jump,
    /// 16-bit backward jump
    Loop,
    /// Signed 16-bit jump plus 8-bit finally-exit count
    Leave,
    /// Name (u16), argument count (u8), cache slot (u16)
    Invoke,
}

impl OperandKind {
    /// Number of operand bytes
    pub const fn width(self) -> usize {
        match self {
            Self::None => 0,
            Self::Imm8 | Self::Const8 | Self::Upvalue | Self::Argc => 1,
            Self::Const16 | Self::Local | Self::Name | Self::Count | Self::Jump | Self::Loop => 2,
            Self::Leave => 3,
            Self::Const32 => 4,
            Self::Invoke => 5,
        }
    }
}

impl Opcode {
    /// Convert from raw byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        let op = match byte {
            0x00 => Self::Nop,
            0x01 => Self::Return,
            0x02 => Self::ReturnNil,

            0x08 => Self::Nil,
            0x09 => Self::True,
            0x0A => Self::False,
            0x0B => Self::Int8,
            0x0C => Self::Const,
            0x0D => Self::Const16,
            0x0E => Self::Const32,

            0x10 => Self::Pop,
            0x11 => Self::Dup,
            0x12 => Self::Swap,

            0x18 => Self::GetLocal,
            0x19 => Self::SetLocal,
            0x1A => Self::GetUpvalue,
            0x1B => Self::SetUpvalue,
            0x1C => Self::CloseUpvalue,
            0x1D => Self::CloseUpvalues,
            0x1E => Self::GetGlobal,
            0x1F => Self::SetGlobal,
            0x20 => Self::SelfValue,

            0x28 => Self::Add,
            0x29 => Self::Sub,
            0x2A => Self::Mul,
            0x2B => Self::Div,
            0x2C => Self::Mod,
            0x2D => Self::Neg,
            0x2E => Self::Not,

            0x30 => Self::Eq,
            0x31 => Self::Ne,
            0x32 => Self::Lt,
            0x33 => Self::Le,
            0x34 => Self::Gt,
            0x35 => Self::Ge,

            0x38 => Self::AddInt,
            0x39 => Self::SubInt,
            0x3A => Self::MulInt,
            0x3B => Self::LtInt,
            0x3C => Self::LeInt,
            0x3D => Self::EqInt,

            0x40 => Self::AddFloat,
            0x41 => Self::SubFloat,
            0x42 => Self::MulFloat,
            0x43 => Self::DivFloat,
            0x44 => Self::LtFloat,

            0x48 => Self::Jump,
            0x49 => Self::JumpIfFalse,
            0x4A => Self::JumpIfTrue,
            0x4B => Self::Loop,
            0x4C => Self::Leave,

            0x50 => Self::Call,
            0x51 => Self::TailCall,
            0x52 => Self::Invoke,
            0x53 => Self::Closure,

            0x58 => Self::Class,
            0x59 => Self::Inherit,
            0x5A => Self::Method,
            0x5B => Self::GetField,
            0x5C => Self::SetField,

            0x60 => Self::Array,
            0x61 => Self::Map,
            0x62 => Self::IndexGet,
            0x63 => Self::IndexSet,

            0x68 => Self::GetIter,
            0x69 => Self::IterNext,

            0x70 => Self::Throw,
            0x71 => Self::EndFinally,

            0x78 => Self::Yield,
            0x79 => Self::Await,

            0x80 => Self::Spawn,

            _ => return None,
        };
        Some(op)
    }

    /// Convert to raw byte
    #[inline]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Operand layout of this opcode
    pub const fn operands(self) -> OperandKind {
        match self {
            Self::Int8 => OperandKind::Imm8,
            Self::Const => OperandKind::Const8,
            Self::Const16 => OperandKind::Const16,
            Self::Const32 => OperandKind::Const32,
            Self::GetLocal | Self::SetLocal | Self::CloseUpvalues => OperandKind::Local,
            Self::GetUpvalue | Self::SetUpvalue => OperandKind::Upvalue,
            Self::GetGlobal
            | Self::SetGlobal
            | Self::Class
            | Self::Method
            | Self::GetField
            | Self::SetField => OperandKind::Name,
            Self::Closure => OperandKind::Const16,
            Self::Call | Self::TailCall | Self::Spawn => OperandKind::Argc,
            Self::Array | Self::Map => OperandKind::Count,
            Self::Jump | Self::JumpIfFalse | Self::JumpIfTrue | Self::IterNext => {
                OperandKind::Jump
            }
            Self::Loop => OperandKind::Loop,
            Self::Leave => OperandKind::Leave,
            Self::Invoke => OperandKind::Invoke,
            _ => OperandKind::None,
        }
    }

    /// Total encoded size of the instruction, opcode byte included
    #[inline]
    pub const fn width(self) -> usize {
        1 + self.operands().width()
    }

    /// Get the mnemonic used by the disassembler
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::Return => "RETURN",
            Self::ReturnNil => "RETURN_NIL",
            Self::Nil => "NIL",
            Self::True => "TRUE",
            Self::False => "FALSE",
            Self::Int8 => "INT8",
            Self::Const => "CONST",
            Self::Const16 => "CONST16",
            Self::Const32 => "CONST32",
            Self::Pop => "POP",
            Self::Dup => "DUP",
            Self::Swap => "SWAP",
            Self::GetLocal => "GET_LOCAL",
            Self::SetLocal => "SET_LOCAL",
            Self::GetUpvalue => "GET_UPVALUE",
            Self::SetUpvalue => "SET_UPVALUE",
            Self::CloseUpvalue => "CLOSE_UPVALUE",
            Self::CloseUpvalues => "CLOSE_UPVALUES",
            Self::GetGlobal => "GET_GLOBAL",
            Self::SetGlobal => "SET_GLOBAL",
            Self::SelfValue => "SELF",
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Mul => "MUL",
            Self::Div => "DIV",
            Self::Mod => "MOD",
            Self::Neg => "NEG",
            Self::Not => "NOT",
            Self::Eq => "EQ",
            Self::Ne => "NE",
            Self::Lt => "LT",
            Self::Le => "LE",
            Self::Gt => "GT",
            Self::Ge => "GE",
            Self::AddInt => "ADD_INT",
            Self::SubInt => "SUB_INT",
            Self::MulInt => "MUL_INT",
            Self::LtInt => "LT_INT",
            Self::LeInt => "LE_INT",
            Self::EqInt => "EQ_INT",
            Self::AddFloat => "ADD_FLOAT",
            Self::SubFloat => "SUB_FLOAT",
            Self::MulFloat => "MUL_FLOAT",
            Self::DivFloat => "DIV_FLOAT",
            Self::LtFloat => "LT_FLOAT",
            Self::Jump => "JUMP",
            Self::JumpIfFalse => "JUMP_IF_FALSE",
            Self::JumpIfTrue => "JUMP_IF_TRUE",
            Self::Loop => "LOOP",
            Self::Leave => "LEAVE",
            Self::Call => "CALL",
            Self::TailCall => "TAIL_CALL",
            Self::Invoke => "INVOKE",
            Self::Closure => "CLOSURE",
            Self::Class => "CLASS",
            Self::Inherit => "INHERIT",
            Self::Method => "METHOD",
            Self::GetField => "GET_FIELD",
            Self::SetField => "SET_FIELD",
            Self::Array => "ARRAY",
            Self::Map => "MAP",
            Self::IndexGet => "INDEX_GET",
            Self::IndexSet => "INDEX_SET",
            Self::GetIter => "GET_ITER",
            Self::IterNext => "ITER_NEXT",
            Self::Throw => "THROW",
            Self::EndFinally => "END_FINALLY",
            Self::Yield => "YIELD",
            Self::Await => "AWAIT",
            Self::Spawn => "SPAWN",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
