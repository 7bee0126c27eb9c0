// SPDX-License-Identifier: MIT OR Apache-2.0
//! Textual forms of values.
//!
//! `Display` is what interpreted code and uncaught-error reports show;
//! `Debug` differs only in quoting strings, including strings nested in
//! collections.

use std::fmt::{self, Write};

use crate::value::{HeapRef, Value};

/// Nested collections deeper than this print as `...`
const MAX_DEPTH: usize = 8;

fn write_float(f: &mut fmt::Formatter<'_>, x: f64) -> fmt::Result {
    if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
        write!(f, "{x:.1}")
    } else {
        write!(f, "{x}")
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &Value, quote: bool, depth: usize) -> fmt::Result {
    match value {
        Value::Undefined => f.write_str("undefined"),
        Value::Nil => f.write_str("nil"),
        Value::Bool(b) => write!(f, "{b}"),
        Value::Int(i) => write!(f, "{i}"),
        Value::Float(x) => write_float(f, *x),
        Value::Byte(b) => write!(f, "{b}u8"),
        Value::Symbol(s) => write!(f, ":{s}"),
        Value::Ref(r) => write_ref(f, r, quote, depth),
    }
}

fn write_ref(f: &mut fmt::Formatter<'_>, r: &HeapRef, quote: bool, depth: usize) -> fmt::Result {
    match r {
        HeapRef::String(s) if quote => write!(f, "{:?}", &**s),
        HeapRef::String(s) => f.write_str(s),
        HeapRef::Array(array) => {
            if depth >= MAX_DEPTH {
                return f.write_str("[...]");
            }
            f.write_char('[')?;
            for (i, item) in array.to_vec().iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write_value(f, item, true, depth + 1)?;
            }
            f.write_char(']')
        }
        HeapRef::Map(map) => {
            if depth >= MAX_DEPTH {
                return f.write_str("{...}");
            }
            f.write_char('{')?;
            for (i, (k, v)) in map.entries().iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write_value(f, k, true, depth + 1)?;
                f.write_str(": ")?;
                write_value(f, v, true, depth + 1)?;
            }
            f.write_char('}')
        }
        HeapRef::Function(func) => write!(f, "<fn {}>", func.name),
        HeapRef::Closure(c) => write!(f, "<fn {}>", c.function.name),
        HeapRef::Native(n) => write!(f, "<native fn {}>", n.name),
        HeapRef::BoundMethod(b) => {
            f.write_str("<bound ")?;
            write_value(f, &b.method, quote, depth + 1)?;
            f.write_char('>')
        }
        HeapRef::Class(c) => write!(f, "<class {}>", c.name),
        HeapRef::Instance(i) => write!(f, "<{} instance>", i.class.name),
        HeapRef::Error(e) => write!(f, "{}: {}", e.class.name, e.message),
        HeapRef::Trace(t) => write!(f, "<trace of {} frames>", t.len()),
        HeapRef::Iterator(_) => f.write_str("<iterator>"),
        HeapRef::Generator(g) => write!(f, "<generator {}>", g.name()),
        HeapRef::Promise(p) if p.is_resolved() => f.write_str("<promise resolved>"),
        HeapRef::Promise(_) => f.write_str("<promise pending>"),
        HeapRef::Mutex(_) => f.write_str("<mutex>"),
        HeapRef::WaitGroup(wg) => write!(f, "<wait group {}>", wg.count()),
        HeapRef::Channel(c) => write!(f, "<channel {}/{}>", c.len(), c.capacity()),
        HeapRef::Thread(t) => write!(f, "<thread {}>", t.name()),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value(f, self, false, 0)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value(f, self, true, 0)
    }
}

/// Render a slice of values as `[a, b, c]` using their debug forms
pub fn format_values(values: &[Value]) -> String {
    let mut out = String::from("[");
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{value:?}");
    }
    out.push(']');
    out
}
