//! Call frames and the frame stack

use std::sync::Arc;

use crate::error::{VmError, VmResult};
use crate::function::{Closure, FunctionObject};
use crate::generator::Generator;
use crate::trace::StackTrace;
use crate::value::Value;

/// Control transfer waiting for a `finally` block to finish
#[derive(Clone)]
pub enum Completion {
    /// `return value`
    Return(Value),
    /// `break`, `continue` or leaving the protected region normally
    Jump {
        /// Code offset to continue at
        target: usize,
    },
    /// Error propagating through the block
    Throw {
        /// Thrown value
        value: Value,
        /// Trace captured at the original throw
        trace: Arc<StackTrace>,
    },
}

/// A completion and the catch-table entry of the `finally` block running it
#[derive(Clone)]
pub struct PendingCompletion {
    /// Index into the function's catch table
    pub entry: usize,
    /// What to do at `END_FINALLY`
    pub completion: Completion,
}

/// Saved interpreter context of one in-flight call
pub struct CallFrame {
    /// Function being executed
    pub function: Arc<FunctionObject>,
    /// Closure providing upvalues, if any
    pub closure: Option<Arc<Closure>>,
    /// `self` for this call
    pub receiver: Value,
    /// Offset of the next instruction
    pub ip: usize,
    /// Offset of the instruction being executed
    pub op_start: usize,
    /// Offset of local slot 0; the callee sits at `fp - 1`
    pub fp: usize,
    /// Number of local slots above `fp`
    pub local_count: usize,
    /// Tail calls that reused this frame
    pub tail_calls: u32,
    /// Returning from this frame exits the interpreter loop
    pub halt_on_return: bool,
    /// Constructor call: returns the receiver
    pub is_construct: bool,
    /// Code fragment evaluated over a caller-supplied stack
    pub fragment: bool,
    /// Generator owning this frame
    pub generator: Option<Arc<Generator>>,
    /// Completions of the `finally` blocks currently executing, innermost last
    pub completions: Vec<PendingCompletion>,
}

impl CallFrame {
    /// Create a frame starting at offset 0
    pub fn new(function: Arc<FunctionObject>, fp: usize) -> Self {
        let local_count = function.code.local_count as usize;
        Self {
            function,
            closure: None,
            receiver: Value::Nil,
            ip: 0,
            op_start: 0,
            fp,
            local_count,
            tail_calls: 0,
            halt_on_return: false,
            is_construct: false,
            fragment: false,
            generator: None,
            completions: Vec::new(),
        }
    }

    /// First slot above the locals
    #[inline]
    pub fn locals_end(&self) -> usize {
        self.fp + self.local_count
    }

    /// Source line of the instruction being executed
    #[inline]
    pub fn line(&self) -> u32 {
        self.function.code.line_at(self.op_start)
    }
}

/// Marker for a call that originated outside the interpreter loop
#[derive(Debug, Clone)]
pub struct NativeFrame {
    /// Native function name
    pub name: Arc<str>,
    /// Number of bytecode frames below this one
    pub depth: usize,
}

/// Fixed-capacity stack of call frames
pub struct FrameStack {
    frames: Vec<CallFrame>,
    max: usize,
}

impl FrameStack {
    /// Create an empty stack holding at most `max` frames
    pub fn new(max: usize) -> Self {
        Self {
            frames: Vec::with_capacity(max.min(64)),
            max,
        }
    }

    /// Push a frame
    pub fn push(&mut self, frame: CallFrame) -> VmResult<()> {
        if self.frames.len() >= self.max {
            return Err(VmError::stack_overflow(format!(
                "call depth exceeded {} frames",
                self.max
            )));
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Pop the current frame
    pub fn pop(&mut self) -> VmResult<CallFrame> {
        self.frames
            .pop()
            .ok_or_else(|| VmError::fatal("call frame stack underflow"))
    }

    /// Current frame
    #[inline]
    pub fn current(&self) -> VmResult<&CallFrame> {
        self.frames
            .last()
            .ok_or_else(|| VmError::fatal("no active call frame"))
    }

    /// Current frame, mutably
    #[inline]
    pub fn current_mut(&mut self) -> VmResult<&mut CallFrame> {
        self.frames
            .last_mut()
            .ok_or_else(|| VmError::fatal("no active call frame"))
    }

    /// Number of frames
    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Is the stack empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Maximum number of frames
    #[inline]
    pub fn max(&self) -> usize {
        self.max
    }

    /// Frames, outermost first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &CallFrame> {
        self.frames.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_bytecode::{Function, Opcode};

    fn frame() -> CallFrame {
        let mut b = Function::builder().locals(2);
        b.op(Opcode::ReturnNil);
        let function = FunctionObject::load(Arc::new(b.build().unwrap())).unwrap();
        CallFrame::new(function, 1)
    }

    #[test]
    fn test_frame_capacity_is_fixed() {
        let mut frames = FrameStack::new(2);
        frames.push(frame()).unwrap();
        frames.push(frame()).unwrap();
        let err = frames.push(frame()).unwrap_err();
        assert!(matches!(err, VmError::StackOverflow(_)));
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_locals_end() {
        let f = frame();
        assert_eq!(f.locals_end(), 3);
        assert_eq!(f.line(), 1);
    }
}
