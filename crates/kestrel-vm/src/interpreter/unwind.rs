//! Error routing, returns and `finally` completions
//!
//! Every control transfer that may cross a protected region ends up here:
//! thrown values look for the innermost handler in the current frame and pop
//! frames until one is found or a VM-call boundary is reached; returns and
//! `LEAVE` jumps detour through the `finally` blocks they exit. A detour
//! records a [`PendingCompletion`] on the frame which `END_FINALLY` resumes.

use std::sync::Arc;

use kestrel_bytecode::Function;

use super::{Exit, Interpreter};
use crate::context::{CallFrame, Completion, NativeFrame, PendingCompletion};
use crate::error::{ThrownValue, VmError, VmResult};
use crate::object::ErrorObject;
use crate::runtime::VmRuntime;
use crate::trace::{StackTrace, TraceFrame};
use crate::value::{HeapRef, Value};

/// Innermost catch-table entry containing `offset`; a catch wins a tie
fn find_handler(code: &Function, offset: usize, finally_only: bool) -> Option<usize> {
    code.catch_table
        .iter()
        .enumerate()
        .filter(|(_, e)| e.contains(offset) && (e.is_finally || !finally_only))
        .min_by_key(|(_, e)| (e.width(), e.is_finally))
        .map(|(i, _)| i)
}

/// Build the error object interpreted code sees for a catchable error
pub(crate) fn error_object(runtime: &VmRuntime, err: &VmError) -> Value {
    if let VmError::Uncaught(thrown) = err {
        return thrown.value.clone();
    }
    let class = runtime.intrinsics().error_class_for(err);
    Value::Ref(HeapRef::Error(Arc::new(ErrorObject {
        class,
        message: err.message(),
    })))
}

/// Thrown value carried by `err`, or a fresh error object without a trace
pub(crate) fn thrown_value(runtime: &VmRuntime, err: VmError) -> ThrownValue {
    match err {
        VmError::Uncaught(thrown) => *thrown,
        other => ThrownValue {
            value: error_object(runtime, &other),
            trace: Arc::default(),
        },
    }
}

impl Interpreter {
    /// Run until the boundary frame returns or an error escapes it
    pub(super) fn run(&mut self) -> VmResult<Exit> {
        loop {
            match self.dispatch() {
                Ok(exit) => return Ok(exit),
                Err(VmError::Uncaught(thrown)) => {
                    let ThrownValue { value, trace } = *thrown;
                    self.throw_value(value, trace)?;
                }
                Err(err) if err.is_catchable() => {
                    let value = error_object(&self.runtime, &err);
                    let trace = Arc::new(self.capture_trace());
                    self.throw_value(value, trace)?;
                }
                Err(err) => {
                    self.abort_to_boundary();
                    return Err(err);
                }
            }
        }
    }

    /// Transfer control to the innermost handler of a thrown value
    ///
    /// Frames without a handler are discarded. Reaching a boundary frame
    /// returns the value as [`VmError::Uncaught`].
    pub(super) fn throw_value(&mut self, value: Value, trace: Arc<StackTrace>) -> VmResult<()> {
        loop {
            let frame = self.frames.current()?;
            let function = frame.function.clone();
            if let Some(index) = find_handler(&function.code, frame.op_start, false) {
                let entry = function.code.catch_table[index];
                if entry.is_finally {
                    return self.detour(index, Completion::Throw { value, trace });
                }

                let frame = self.frames.current_mut()?;
                let table = &function.code.catch_table;
                frame.completions.retain(|p| !table[p.entry].is_within(&entry));
                frame.ip = entry.target as usize;
                let locals_end = frame.locals_end();
                self.stack.truncate(locals_end);
                self.stack.push(value)?;
                self.stack.push(Value::Ref(HeapRef::Trace(trace)))?;
                return Ok(());
            }

            let frame = self.frames.pop()?;
            let halt = frame.halt_on_return;
            self.discard_frame(&frame);
            if halt {
                return Err(VmError::Uncaught(Box::new(ThrownValue { value, trace })));
            }
        }
    }

    /// Run the `finally` block of catch-table entry `index`, then `completion`
    fn detour(&mut self, index: usize, completion: Completion) -> VmResult<()> {
        let frame = self.frames.current_mut()?;
        let function = frame.function.clone();
        let table = &function.code.catch_table;
        let entry = table[index];

        if !matches!(completion, Completion::Jump { .. }) {
            frame.completions.retain(|p| !table[p.entry].is_within(&entry));
        }
        frame.completions.push(PendingCompletion {
            entry: index,
            completion,
        });
        frame.ip = entry.target as usize;
        let locals_end = frame.locals_end();
        self.stack.truncate(locals_end);
        Ok(())
    }

    /// Return `value` from the current frame, running `finally` blocks first
    pub(super) fn return_value(&mut self, value: Value) -> VmResult<Option<Exit>> {
        let frame = self.frames.current()?;
        if let Some(index) = find_handler(&frame.function.code, frame.op_start, true) {
            self.detour(index, Completion::Return(value))?;
            return Ok(None);
        }

        let frame = self.frames.pop()?;
        self.discard_frame(&frame);
        let value = if frame.is_construct {
            frame.receiver
        } else {
            value
        };
        if frame.halt_on_return {
            return Ok(Some(Exit::Return(value)));
        }
        self.stack.push(value)?;
        Ok(None)
    }

    /// `LEAVE`: drop the completions of `exits` finally bodies, then jump
    pub(super) fn leave(&mut self, target: usize, exits: u8) -> VmResult<()> {
        let frame = self.frames.current_mut()?;
        let kept = frame.completions.len().saturating_sub(exits as usize);
        frame.completions.truncate(kept);
        self.leave_to(target)
    }

    /// Jump to `target`, detouring through the innermost `finally` exited
    fn leave_to(&mut self, target: usize) -> VmResult<()> {
        let frame = self.frames.current_mut()?;
        let from = frame.op_start;
        let exited = frame
            .function
            .code
            .catch_table
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_finally && e.contains(from) && !e.contains(target))
            .min_by_key(|(_, e)| e.width())
            .map(|(i, _)| i);

        match exited {
            Some(index) => self.detour(index, Completion::Jump { target }),
            None => {
                frame.ip = target;
                Ok(())
            }
        }
    }

    /// `END_FINALLY`: resume the completion that entered the block
    pub(super) fn end_finally(&mut self) -> VmResult<Option<Exit>> {
        let pending = self
            .frames
            .current_mut()?
            .completions
            .pop()
            .ok_or_else(|| VmError::fatal("END_FINALLY without a pending completion"))?;

        match pending.completion {
            Completion::Return(value) => self.return_value(value),
            Completion::Jump { target } => {
                self.leave_to(target)?;
                Ok(None)
            }
            Completion::Throw { value, trace } => {
                Err(VmError::Uncaught(Box::new(ThrownValue { value, trace })))
            }
        }
    }

    /// Release everything a popped frame owned on the stack
    fn discard_frame(&mut self, frame: &CallFrame) {
        self.close_upvalues(frame.fp);
        self.stack.truncate(frame.fp.saturating_sub(1));
        if let Some(generator) = &frame.generator {
            generator.complete();
        }
    }

    /// Pop frames up to and including the innermost boundary frame
    fn abort_to_boundary(&mut self) {
        while let Ok(frame) = self.frames.pop() {
            let halt = frame.halt_on_return;
            self.discard_frame(&frame);
            if halt {
                break;
            }
        }
    }

    /// Snapshot of the call stack, oldest call first, natives interleaved
    pub(super) fn capture_trace(&self) -> StackTrace {
        let mut frames = Vec::with_capacity(self.frames.len() + self.native_frames.len());
        let mut natives = self.native_frames.iter().peekable();
        let native = |n: &NativeFrame| TraceFrame {
            function: n.name.clone(),
            file: None,
            line: 0,
            tail_calls: 0,
        };

        for (i, frame) in self.frames.iter().enumerate() {
            while let Some(n) = natives.next_if(|n| n.depth <= i) {
                frames.push(native(n));
            }
            frames.push(TraceFrame {
                function: frame.function.name.clone(),
                file: Some(frame.function.file.clone()),
                line: frame.line(),
                tail_calls: frame.tail_calls,
            });
        }
        frames.extend(natives.map(native));
        StackTrace::new(frames)
    }
}
