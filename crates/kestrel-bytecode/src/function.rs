//! Compiled function representation and the assembler that produces it

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constant::{Constant, ConstantPool};
use crate::error::{BytecodeError, Result};
use crate::instruction::{OperandKind, Opcode};
use crate::operand::{LocalIndex, UpvalueIndex, read_i16, read_u8, read_u16, read_u32};

/// Function flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionFlags {
    /// Calling the function schedules it on the thread pool and returns a promise
    pub is_async: bool,
    /// Calling the function returns a suspended generator
    pub is_generator: bool,
    /// Extra positional arguments are packed into an array in the last parameter slot
    pub variadic: bool,
}

/// Upvalue capture mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpvalueCapture {
    /// Capture from parent's local variable
    Local(LocalIndex),
    /// Capture from parent's upvalue (transitive capture)
    Upvalue(UpvalueIndex),
}

/// One catch-table entry: a protected code range and its handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchEntry {
    /// First protected offset
    pub from: u32,
    /// End of the protected range (exclusive)
    pub to: u32,
    /// Handler offset
    pub target: u32,
    /// `finally` handler rather than `catch`
    pub is_finally: bool,
}

impl CatchEntry {
    /// Does the protected range contain `offset`
    #[inline]
    pub fn contains(&self, offset: usize) -> bool {
        (self.from as usize) <= offset && offset < (self.to as usize)
    }

    /// Size of the protected range
    #[inline]
    pub fn width(&self) -> u32 {
        self.to - self.from
    }

    /// Is this entry's range nested within `outer`'s range
    #[inline]
    pub fn is_within(&self, outer: &CatchEntry) -> bool {
        outer.from <= self.from && self.to <= outer.to
    }
}

/// Maps code offsets to source lines
///
/// Stored run-length encoded: one entry per offset where the line changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineTable {
    entries: Vec<(u32, u32)>,
}

impl LineTable {
    /// Create a new empty line table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that code starting at `offset` belongs to `line`
    pub fn add(&mut self, offset: u32, line: u32) {
        if let Some(last) = self.entries.last_mut() {
            if last.1 == line {
                return;
            }
            if last.0 == offset {
                last.1 = line;
                return;
            }
        }
        self.entries.push((offset, line));
    }

    /// Find the source line for a code offset
    pub fn line_at(&self, offset: u32) -> Option<u32> {
        let idx = self.entries.binary_search_by_key(&offset, |e| e.0);

        match idx {
            Ok(i) => Some(self.entries[i].1),
            Err(i) if i > 0 => Some(self.entries[i - 1].1),
            _ => None,
        }
    }
}

/// A compiled function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    /// Function name (empty for anonymous)
    pub name: String,
    /// Owning file, used in stack traces
    pub file: String,
    /// Number of required parameters
    pub arity: u8,
    /// Number of optional parameters (default to nil)
    pub optional: u8,
    /// Function flags
    pub flags: FunctionFlags,
    /// Number of local slots, parameters included
    pub local_count: u16,
    /// Captures performed by `CLOSURE`
    pub upvalues: Vec<UpvalueCapture>,
    /// Instruction bytes
    pub code: Vec<u8>,
    /// Constants referenced by the code
    pub constants: ConstantPool,
    /// Offset to line mapping
    pub lines: LineTable,
    /// Exception and finally handlers
    pub catch_table: Vec<CatchEntry>,
    /// Number of inline-cache slots used by `INVOKE`
    pub cache_slots: u16,
}

impl Function {
    /// Create a new function builder
    pub fn builder() -> FunctionBuilder {
        FunctionBuilder::new()
    }

    /// Get the function name or `<anonymous>`
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "<anonymous>"
        } else {
            &self.name
        }
    }

    /// Is this an async function
    #[inline]
    pub fn is_async(&self) -> bool {
        self.flags.is_async
    }

    /// Is this a generator function
    #[inline]
    pub fn is_generator(&self) -> bool {
        self.flags.is_generator
    }

    /// Does this function accept extra positional arguments
    #[inline]
    pub fn is_variadic(&self) -> bool {
        self.flags.variadic
    }

    /// Number of declared parameters (required + optional + variadic slot)
    #[inline]
    pub fn param_slots(&self) -> usize {
        self.arity as usize + self.optional as usize + usize::from(self.flags.variadic)
    }

    /// Source line of the instruction at `offset`
    #[inline]
    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines.line_at(offset as u32).unwrap_or(0)
    }

    /// Does any catch-table entry protect `offset`
    pub fn is_protected(&self, offset: usize) -> bool {
        self.catch_table.iter().any(|e| e.contains(offset))
    }

    /// Check that the code decodes and every operand refers to something real
    pub fn verify(&self) -> Result<()> {
        let code = &self.code;
        let mut offset = 0;
        while offset < code.len() {
            let byte = code[offset];
            let op = Opcode::from_byte(byte).ok_or(BytecodeError::InvalidOpcode(byte))?;
            let next = offset + op.width();
            if next > code.len() {
                return Err(BytecodeError::UnexpectedEnd(offset));
            }
            let at = offset + 1;
            match op.operands() {
                OperandKind::Const8 => self.verify_constant(read_u8(code, at)? as u32)?,
                OperandKind::Const16 => self.verify_constant(read_u16(code, at)? as u32)?,
                OperandKind::Const32 => self.verify_constant(read_u32(code, at)?)?,
                OperandKind::Local => {
                    if read_u16(code, at)? >= self.local_count {
                        return Err(BytecodeError::InvalidOperand(offset));
                    }
                }
                OperandKind::Name => self.verify_name(read_u16(code, at)? as u32, offset)?,
                OperandKind::Invoke => {
                    self.verify_name(read_u16(code, at)? as u32, offset)?;
                    if read_u16(code, at + 3)? >= self.cache_slots {
                        return Err(BytecodeError::InvalidOperand(offset));
                    }
                }
                OperandKind::Jump => {
                    if next + read_u16(code, at)? as usize > code.len() {
                        return Err(BytecodeError::InvalidOperand(offset));
                    }
                }
                OperandKind::Loop => {
                    if (read_u16(code, at)? as usize) > next {
                        return Err(BytecodeError::InvalidOperand(offset));
                    }
                }
                OperandKind::Leave => {
                    let target = next as i64 + read_i16(code, at)? as i64;
                    if target < 0 || target as usize > code.len() {
                        return Err(BytecodeError::InvalidOperand(offset));
                    }
                }
                _ => {}
            }
            if op == Opcode::Closure {
                let idx = read_u16(code, at)? as u32;
                if self.constants.get(idx).and_then(Constant::as_function).is_none() {
                    return Err(BytecodeError::InvalidOperand(offset));
                }
            }
            offset = next;
        }
        Ok(())
    }

    fn verify_constant(&self, idx: u32) -> Result<()> {
        match self.constants.get(idx) {
            Some(_) => Ok(()),
            None => Err(BytecodeError::ConstantOutOfRange(idx)),
        }
    }

    fn verify_name(&self, idx: u32, offset: usize) -> Result<()> {
        match self.constants.get(idx) {
            Some(c) if c.as_str().is_some() => Ok(()),
            Some(_) => Err(BytecodeError::InvalidOperand(offset)),
            None => Err(BytecodeError::ConstantOutOfRange(idx)),
        }
    }
}

/// A forward jump waiting for its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a jump label must be patched"]
pub struct JumpLabel {
    operand_at: usize,
    signed: bool,
}

/// Builder and assembler for [`Function`]
#[derive(Debug)]
pub struct FunctionBuilder {
    function: Function,
    line: u32,
    pending: Vec<usize>,
}

impl Default for FunctionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            function: Function {
                name: String::new(),
                file: String::from("<script>"),
                arity: 0,
                optional: 0,
                flags: FunctionFlags::default(),
                local_count: 0,
                upvalues: Vec::new(),
                code: Vec::new(),
                constants: ConstantPool::new(),
                lines: LineTable::new(),
                catch_table: Vec::new(),
                cache_slots: 0,
            },
            line: 1,
            pending: Vec::new(),
        }
    }

    /// Set function name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.function.name = name.into();
        self
    }

    /// Set owning file
    pub fn file(mut self, file: impl Into<String>) -> Self {
        self.function.file = file.into();
        self
    }

    /// Set required parameter count
    pub fn arity(mut self, arity: u8) -> Self {
        self.function.arity = arity;
        self
    }

    /// Set optional parameter count
    pub fn optional(mut self, optional: u8) -> Self {
        self.function.optional = optional;
        self
    }

    /// Set local slot count (parameters included)
    pub fn locals(mut self, count: u16) -> Self {
        self.function.local_count = count;
        self
    }

    /// Mark as async
    pub fn is_async(mut self, value: bool) -> Self {
        self.function.flags.is_async = value;
        self
    }

    /// Mark as generator
    pub fn is_generator(mut self, value: bool) -> Self {
        self.function.flags.is_generator = value;
        self
    }

    /// Mark as variadic
    pub fn variadic(mut self, value: bool) -> Self {
        self.function.flags.variadic = value;
        self
    }

    /// Add an upvalue capture
    pub fn upvalue(mut self, capture: UpvalueCapture) -> Self {
        self.function.upvalues.push(capture);
        self
    }

    /// Set the source line for subsequently emitted instructions
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    /// Current code offset
    #[inline]
    pub fn offset(&self) -> usize {
        self.function.code.len()
    }

    /// Add a constant without emitting a load
    pub fn constant(&mut self, constant: Constant) -> u32 {
        self.function.constants.add(constant)
    }

    fn start(&mut self, op: Opcode) {
        let at = self.function.code.len() as u32;
        self.function.lines.add(at, self.line);
        self.function.code.push(op.as_byte());
    }

    fn push_u16(&mut self, v: u16) {
        self.function.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit an instruction without operands
    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.start(op);
        self
    }

    /// Emit an instruction with an 8-bit operand
    pub fn op_u8(&mut self, op: Opcode, operand: u8) -> &mut Self {
        self.start(op);
        self.function.code.push(operand);
        self
    }

    /// Emit an instruction with a 16-bit operand
    pub fn op_u16(&mut self, op: Opcode, operand: u16) -> &mut Self {
        self.start(op);
        self.push_u16(operand);
        self
    }

    /// Load a constant, picking the narrowest `CONST` form
    pub fn load_const(&mut self, constant: Constant) -> &mut Self {
        let idx = self.constant(constant);
        if let Ok(narrow) = u8::try_from(idx) {
            self.op_u8(Opcode::Const, narrow)
        } else if let Ok(wide) = u16::try_from(idx) {
            self.op_u16(Opcode::Const16, wide)
        } else {
            self.start(Opcode::Const32);
            self.function.code.extend_from_slice(&idx.to_le_bytes());
            self
        }
    }

    /// Push an integer
    pub fn int(&mut self, value: i64) -> &mut Self {
        match i8::try_from(value) {
            Ok(small) => self.op_u8(Opcode::Int8, small as u8),
            Err(_) => self.load_const(Constant::Int(value)),
        }
    }

    /// Push a float
    pub fn float(&mut self, value: f64) -> &mut Self {
        self.load_const(Constant::Float(value))
    }

    /// Push a string
    pub fn string(&mut self, value: &str) -> &mut Self {
        self.load_const(Constant::string(value))
    }

    fn name_index(&mut self, name: &str) -> u16 {
        let idx = self.constant(Constant::symbol(name));
        u16::try_from(idx).unwrap_or(u16::MAX)
    }

    fn op_name(&mut self, op: Opcode, name: &str) -> &mut Self {
        let idx = self.name_index(name);
        self.op_u16(op, idx)
    }

    /// Push a local
    pub fn get_local(&mut self, slot: u16) -> &mut Self {
        self.op_u16(Opcode::GetLocal, slot)
    }

    /// Pop into a local
    pub fn set_local(&mut self, slot: u16) -> &mut Self {
        self.op_u16(Opcode::SetLocal, slot)
    }

    /// Push a global
    pub fn get_global(&mut self, name: &str) -> &mut Self {
        self.op_name(Opcode::GetGlobal, name)
    }

    /// Pop into a global
    pub fn set_global(&mut self, name: &str) -> &mut Self {
        self.op_name(Opcode::SetGlobal, name)
    }

    /// Read a field of the instance on top of the stack
    pub fn get_field(&mut self, name: &str) -> &mut Self {
        self.op_name(Opcode::GetField, name)
    }

    /// Store a field: stack is `[instance, value]`
    pub fn set_field(&mut self, name: &str) -> &mut Self {
        self.op_name(Opcode::SetField, name)
    }

    /// Create a class
    pub fn class(&mut self, name: &str) -> &mut Self {
        self.op_name(Opcode::Class, name)
    }

    /// Define a method: stack is `[class, closure]`
    pub fn method(&mut self, name: &str) -> &mut Self {
        self.op_name(Opcode::Method, name)
    }

    /// Invoke a method by name through a fresh inline-cache slot
    pub fn invoke(&mut self, name: &str, argc: u8) -> &mut Self {
        let idx = self.name_index(name);
        let slot = self.function.cache_slots;
        self.function.cache_slots += 1;
        self.start(Opcode::Invoke);
        self.push_u16(idx);
        self.function.code.push(argc);
        self.push_u16(slot);
        self
    }

    /// Create a closure over a nested function
    pub fn closure(&mut self, function: Function) -> &mut Self {
        let idx = self.constant(Constant::Function(Arc::new(function)));
        self.op_u16(Opcode::Closure, u16::try_from(idx).unwrap_or(u16::MAX))
    }

    /// Emit a forward jump to be patched later
    pub fn jump(&mut self, op: Opcode) -> JumpLabel {
        self.start(op);
        let operand_at = self.offset();
        self.push_u16(0xFFFF);
        self.pending.push(operand_at);
        JumpLabel {
            operand_at,
            signed: false,
        }
    }

    /// Emit a forward `LEAVE` to be patched later
    pub fn leave(&mut self, finally_exits: u8) -> JumpLabel {
        self.start(Opcode::Leave);
        let operand_at = self.offset();
        self.push_u16(0);
        self.function.code.push(finally_exits);
        self.pending.push(operand_at);
        JumpLabel {
            operand_at,
            signed: true,
        }
    }

    /// Emit a backward `LEAVE` to an already emitted offset
    pub fn leave_to(&mut self, target: usize, finally_exits: u8) -> Result<&mut Self> {
        let at = self.offset();
        let end = at + Opcode::Leave.width();
        let distance = target as i64 - end as i64;
        let distance = i16::try_from(distance).map_err(|_| BytecodeError::JumpTooFar(at))?;
        self.start(Opcode::Leave);
        self.push_u16(distance as u16);
        self.function.code.push(finally_exits);
        Ok(self)
    }

    /// Point a pending jump at the current offset
    pub fn patch(&mut self, label: JumpLabel) -> Result<&mut Self> {
        let end = label.operand_at + if label.signed { 3 } else { 2 };
        let distance = self.offset() - end;
        let encoded = if label.signed {
            i16::try_from(distance).map(|d| d as u16).ok()
        } else {
            u16::try_from(distance).ok()
        };
        let encoded = encoded.ok_or(BytecodeError::JumpTooFar(label.operand_at - 1))?;
        self.function.code[label.operand_at..label.operand_at + 2]
            .copy_from_slice(&encoded.to_le_bytes());
        self.pending.retain(|p| *p != label.operand_at);
        Ok(self)
    }

    /// Emit a backward jump to `loop_start`
    pub fn loop_to(&mut self, loop_start: usize) -> Result<&mut Self> {
        let at = self.offset();
        let distance = at + Opcode::Loop.width() - loop_start;
        let distance = u16::try_from(distance).map_err(|_| BytecodeError::JumpTooFar(at))?;
        Ok(self.op_u16(Opcode::Loop, distance))
    }

    /// Register a `catch` handler for `from..to`
    pub fn catch(&mut self, from: usize, to: usize, target: usize) -> &mut Self {
        self.handler(from, to, target, false)
    }

    /// Register a `finally` handler for `from..to`
    pub fn finally(&mut self, from: usize, to: usize, target: usize) -> &mut Self {
        self.handler(from, to, target, true)
    }

    fn handler(&mut self, from: usize, to: usize, target: usize, is_finally: bool) -> &mut Self {
        self.function.catch_table.push(CatchEntry {
            from: from as u32,
            to: to as u32,
            target: target as u32,
            is_finally,
        });
        self
    }

    /// Validate and produce the function
    pub fn build(self) -> Result<Function> {
        if let Some(at) = self.pending.first() {
            return Err(BytecodeError::UnpatchedJump(*at - 1));
        }

        let len = self.function.code.len() as u32;
        for entry in &self.function.catch_table {
            if entry.from >= entry.to || entry.to > len || entry.target >= len {
                return Err(BytecodeError::MalformedCatchEntry {
                    from: entry.from,
                    to: entry.to,
                    target: entry.target,
                });
            }
        }

        Ok(self.function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_builder() {
        let mut b = Function::builder().name("add").arity(2).locals(2);
        b.get_local(0).get_local(1).op(Opcode::AddInt).op(Opcode::Return);
        let func = b.build().unwrap();

        assert_eq!(func.display_name(), "add");
        assert_eq!(func.arity, 2);
        assert_eq!(func.code.len(), 3 + 3 + 1 + 1);
        assert_eq!(func.param_slots(), 2);
    }

    #[test]
    fn test_line_table() {
        let mut map = LineTable::new();
        map.add(0, 1);
        map.add(5, 2);
        map.add(7, 2);
        map.add(10, 3);

        assert_eq!(map.line_at(0), Some(1));
        assert_eq!(map.line_at(5), Some(2));
        assert_eq!(map.line_at(8), Some(2));
        assert_eq!(map.line_at(10), Some(3));
        assert_eq!(map.line_at(99), Some(3));
    }

    #[test]
    fn test_const_width_selection() {
        let mut b = Function::builder();
        for i in 0..300 {
            b.load_const(Constant::Int(1_000 + i));
        }
        let func = b.build().unwrap();
        assert_eq!(func.code[0], Opcode::Const.as_byte());
        // entry 256 is the first one past u8 range
        let wide_at = 256 * Opcode::Const.width();
        assert_eq!(func.code[wide_at], Opcode::Const16.as_byte());
    }

    #[test]
    fn test_jump_patching() {
        let mut b = Function::builder();
        b.op(Opcode::True);
        let skip = b.jump(Opcode::JumpIfFalse);
        b.int(1).op(Opcode::Pop);
        b.patch(skip).unwrap();
        b.op(Opcode::ReturnNil);
        let func = b.build().unwrap();
        // operand counts bytes after the jump instruction: INT8 1 + POP
        assert_eq!(&func.code[1..4], &[Opcode::JumpIfFalse.as_byte(), 3, 0]);
    }

    #[test]
    fn test_unpatched_jump_rejected() {
        let mut b = Function::builder();
        let _label = b.jump(Opcode::Jump);
        assert_eq!(b.build().unwrap_err(), BytecodeError::UnpatchedJump(0));
    }

    #[test]
    fn test_malformed_catch_rejected() {
        let mut b = Function::builder();
        b.op(Opcode::Nop).op(Opcode::ReturnNil);
        b.catch(1, 1, 0);
        assert!(matches!(
            b.build(),
            Err(BytecodeError::MalformedCatchEntry { .. })
        ));
    }

    #[test]
    fn test_verify_rejects_bad_operands() {
        let mut b = Function::builder().locals(1);
        b.get_local(0).op(Opcode::Return);
        let mut func = b.build().unwrap();
        assert!(func.verify().is_ok());

        func.local_count = 0;
        assert_eq!(func.verify(), Err(BytecodeError::InvalidOperand(0)));

        func.code = vec![Opcode::Const.as_byte(), 7];
        assert_eq!(func.verify(), Err(BytecodeError::ConstantOutOfRange(7)));

        func.code = vec![Opcode::GetLocal.as_byte(), 0];
        assert_eq!(func.verify(), Err(BytecodeError::UnexpectedEnd(0)));
    }

    #[test]
    fn test_catch_entry_nesting() {
        let outer = CatchEntry { from: 0, to: 20, target: 30, is_finally: false };
        let inner = CatchEntry { from: 4, to: 8, target: 10, is_finally: true };
        assert!(inner.is_within(&outer));
        assert!(!outer.is_within(&inner));
        assert!(inner.contains(4));
        assert!(!inner.contains(8));
    }
}
