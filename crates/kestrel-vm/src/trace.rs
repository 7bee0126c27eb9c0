// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stack traces captured when errors are thrown.
//!
//! Frames are stored oldest call first, which is also the order they are
//! rendered in:
//!
//! ```text
//! main.kst:3, in `main`
//! main.kst:12, in `parse`
//! ArgumentError: expected 2 arguments but got 1
//! ```

use std::fmt::Write;
use std::sync::Arc;

use crate::value::Value;

/// One frame of a stack trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Function name
    pub function: Arc<str>,
    /// Owning file (`None` for native frames)
    pub file: Option<Arc<str>>,
    /// Source line
    pub line: u32,
    /// Tail calls that reused this frame before the trace was taken
    pub tail_calls: u32,
}

impl TraceFrame {
    /// Render as `<file>:<line>, in `<function>``
    pub fn render(&self) -> String {
        match &self.file {
            Some(file) => format!("{}:{}, in `{}`", file, self.line, self.function),
            None => format!("<native>, in `{}`", self.function),
        }
    }
}

/// Captured call stack, oldest call first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTrace {
    /// Frames, oldest first
    pub frames: Vec<TraceFrame>,
}

impl StackTrace {
    /// Create a trace from frames ordered oldest first
    pub fn new(frames: Vec<TraceFrame>) -> Self {
        Self { frames }
    }

    /// Number of frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Is the trace empty
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Innermost frame
    pub fn innermost(&self) -> Option<&TraceFrame> {
        self.frames.last()
    }

    /// Render every frame on its own line
    pub fn render(&self) -> String {
        let mut out = String::new();
        for frame in &self.frames {
            out.push_str(&frame.render());
            out.push('\n');
        }
        out
    }

    /// Render the trace followed by the error's class and message, or the
    /// textual form of a non-error value
    pub fn render_error(&self, value: &Value) -> String {
        let mut out = self.render();
        match value.as_error() {
            Some(err) => {
                let _ = write!(out, "{}: {}", err.class.name, err.message);
            }
            None => {
                let _ = write!(out, "{value}");
            }
        }
        out
    }
}
