//! Human-readable disassembly
//!
//! Each instruction renders as
//! `OFFSET  LINE    RAW-BYTES         MNEMONIC operands`, for example
//! `0000  1       01                RETURN`.

use std::fmt::Write;

use crate::error::{BytecodeError, Result};
use crate::function::Function;
use crate::instruction::{OperandKind, Opcode};
use crate::operand::{read_i16, read_u8, read_u16, read_u32};

/// Disassemble a function and every function nested in its constant pool
pub fn disassemble(function: &Function) -> String {
    let mut out = String::new();
    write_function(&mut out, function);
    out
}

fn write_function(out: &mut String, function: &Function) {
    let _ = writeln!(out, "== {} ==", function.display_name());

    let mut offset = 0;
    while offset < function.code.len() {
        match disassemble_instruction(function, offset) {
            Ok((line, next)) => {
                out.push_str(&line);
                out.push('\n');
                offset = next;
            }
            Err(err) => {
                let _ = writeln!(out, "{offset:04}  <{err}>");
                break;
            }
        }
    }

    if !function.catch_table.is_empty() {
        out.push_str("-- catch table --\n");
        for entry in &function.catch_table {
            let kind = if entry.is_finally { "finally" } else { "catch" };
            let _ = writeln!(
                out,
                "{:04}..{:04} -> {:04} {kind}",
                entry.from, entry.to, entry.target
            );
        }
    }

    for constant in function.constants.iter() {
        if let Some(nested) = constant.as_function() {
            out.push('\n');
            write_function(out, nested);
        }
    }
}

/// Disassemble one instruction, returning its text and the offset of the next one
pub fn disassemble_instruction(function: &Function, offset: usize) -> Result<(String, usize)> {
    let code = &function.code;
    let byte = read_u8(code, offset)?;
    let op = Opcode::from_byte(byte).ok_or(BytecodeError::InvalidOpcode(byte))?;
    let next = offset + op.width();
    let raw = code
        .get(offset..next)
        .ok_or(BytecodeError::UnexpectedEnd(offset))?;

    let hex = raw
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    let operands = decode_operands(function, op, offset + 1, next)?;

    let mut line = format!(
        "{:04}  {:<8}{:<18}{}",
        offset,
        function.line_at(offset),
        hex,
        op.name()
    );
    if !operands.is_empty() {
        line.push(' ');
        line.push_str(&operands);
    }
    Ok((line, next))
}

fn constant_text(function: &Function, idx: u32) -> String {
    match function.constants.get(idx) {
        Some(c) => format!("{idx} ({c})"),
        None => format!("{idx} (<missing>)"),
    }
}

fn name_text(function: &Function, idx: u32) -> String {
    match function.constants.get(idx).and_then(|c| c.as_str()) {
        Some(name) => format!("{idx} ({name})"),
        None => format!("{idx} (<missing>)"),
    }
}

fn decode_operands(function: &Function, op: Opcode, at: usize, next: usize) -> Result<String> {
    let code = &function.code;
    let text = match op.operands() {
        OperandKind::None => String::new(),
        OperandKind::Imm8 => format!("{}", read_u8(code, at)? as i8),
        OperandKind::Const8 => constant_text(function, read_u8(code, at)? as u32),
        OperandKind::Const16 => constant_text(function, read_u16(code, at)? as u32),
        OperandKind::Const32 => constant_text(function, read_u32(code, at)?),
        OperandKind::Local => format!("{}", read_u16(code, at)?),
        OperandKind::Upvalue | OperandKind::Argc => format!("{}", read_u8(code, at)?),
        OperandKind::Count => format!("{}", read_u16(code, at)?),
        OperandKind::Name => name_text(function, read_u16(code, at)? as u32),
        OperandKind::Jump => {
            let distance = read_u16(code, at)? as usize;
            format!("{distance} -> {:04}", next + distance)
        }
        OperandKind::Loop => {
            let distance = read_u16(code, at)? as usize;
            let target = next
                .checked_sub(distance)
                .ok_or(BytecodeError::InvalidOperand(at))?;
            format!("{distance} -> {target:04}")
        }
        OperandKind::Leave => {
            let distance = read_i16(code, at)? as isize;
            let exits = read_u8(code, at + 2)?;
            let target = next as isize + distance;
            format!("{distance} -> {target:04} exits={exits}")
        }
        OperandKind::Invoke => {
            let name = read_u16(code, at)? as u32;
            let argc = read_u8(code, at + 2)?;
            let slot = read_u16(code, at + 3)?;
            format!("{} argc={argc} cache={slot}", name_text(function, name))
        }
    };
    Ok(text)
}
