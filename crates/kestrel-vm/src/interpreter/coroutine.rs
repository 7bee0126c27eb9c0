//! Generators, async functions and iteration
//!
//! A coroutine runs as a boundary frame on whichever interpreter resumes it.
//! Suspending moves the frame's slots, pending completions and upvalues into
//! the [`Generator`]; resuming pushes them back at the current stack top, so a
//! generator created on one thread may be resumed on another.

use std::sync::Arc;

use super::unwind::thrown_value;
use super::{Exit, Interpreter};
use crate::context::CallFrame;
use crate::error::{VmError, VmResult};
use crate::generator::{Generator, GeneratorState, Resume, SavedFrame};
use crate::promise::{Promise, Settlement};
use crate::runtime::VmRuntime;
use crate::upvalue::Upvalue;
use crate::value::{HeapRef, Value};

impl Interpreter {
    /// Resume a generator and return the next value it yields
    ///
    /// A generator that has returned signals [`VmError::StopIteration`],
    /// again on every later call, without re-running its body.
    pub fn resume_generator(
        &mut self,
        generator: &Arc<Generator>,
        resume: Resume,
    ) -> VmResult<Value> {
        if generator.is_async() {
            return Err(VmError::argument(format!(
                "async function `{}` cannot be resumed directly",
                generator.name()
            )));
        }
        match self.resume_coroutine(generator, resume)? {
            Exit::Yield(value) => Ok(value),
            Exit::Return(_) => Err(VmError::StopIteration),
            Exit::Await(_) | Exit::Fragment => {
                Err(VmError::fatal("generator suspended without yielding"))
            }
        }
    }

    fn resume_coroutine(&mut self, generator: &Arc<Generator>, resume: Resume) -> VmResult<Exit> {
        let (saved, fresh) = generator.begin_resume()?;
        let base = self.stack.sp();
        if let Err(err) = self.stack.reserve(saved.slots.len() + 1) {
            generator.complete();
            return Err(err);
        }

        self.stack.push(Value::Ref(HeapRef::Generator(generator.clone())))?;
        let fp = self.stack.sp();
        for value in saved.slots {
            self.stack.push(value)?;
        }

        let mut frame = CallFrame::new(saved.function, fp);
        frame.closure = saved.closure;
        frame.receiver = saved.receiver;
        frame.ip = saved.ip;
        frame.op_start = saved.op_start;
        frame.local_count = saved.local_count;
        frame.completions = saved.completions;
        frame.halt_on_return = true;
        frame.generator = Some(generator.clone());
        if let Err(err) = self.frames.push(frame) {
            self.stack.truncate(base);
            generator.complete();
            return Err(err);
        }

        for (offset, upvalue) in saved.parked {
            let slot = fp + offset;
            if let Some(value) = upvalue.unpark(self.id, slot) {
                self.stack.set(slot, value)?;
                self.open_upvalues.insert(slot, upvalue);
            }
        }

        match resume {
            Resume::Next(value) if !fresh => self.stack.push(value)?,
            Resume::Next(_) => {}
            Resume::Throw(thrown) => self.throw_value(thrown.value, thrown.trace)?,
        }
        self.run()
    }

    /// Move the current frame into `generator`
    fn suspend(&mut self, generator: &Generator, state: GeneratorState) -> VmResult<()> {
        let frame = self.frames.pop()?;
        let fp = frame.fp;

        let parked: Vec<(usize, Arc<Upvalue>)> = self
            .open_upvalues
            .split_off(&fp)
            .into_iter()
            .map(|(slot, upvalue)| {
                let value = self.stack.get(slot).cloned().unwrap_or(Value::Nil);
                upvalue.park(value);
                (slot - fp, upvalue)
            })
            .collect();
        let slots = self.stack.drain_from(fp);
        self.stack.truncate(fp.saturating_sub(1));

        generator.suspend(
            SavedFrame {
                function: frame.function,
                closure: frame.closure,
                receiver: frame.receiver,
                ip: frame.ip,
                op_start: frame.op_start,
                slots,
                local_count: frame.local_count,
                completions: frame.completions,
                parked,
            },
            state,
        );
        Ok(())
    }

    /// `YIELD`
    pub(super) fn yield_value(&mut self, value: Value) -> VmResult<Exit> {
        let generator = self
            .frames
            .current()?
            .generator
            .clone()
            .ok_or_else(|| VmError::argument("yield outside of a generator"))?;
        if generator.is_async() {
            return Err(VmError::argument(format!(
                "yield inside async function `{}`",
                generator.name()
            )));
        }
        self.suspend(&generator, GeneratorState::Suspended)?;
        Ok(Exit::Yield(value))
    }

    /// `AWAIT`: suspends an async body, blocks anywhere else
    pub(super) fn await_value(&mut self, value: Value) -> VmResult<Option<Exit>> {
        let Some(promise) = value.as_promise().cloned() else {
            self.stack.push(value)?;
            return Ok(None);
        };

        let settlement = match promise.settlement() {
            Some(settlement) => settlement,
            None => {
                let coroutine = self
                    .frames
                    .current()?
                    .generator
                    .clone()
                    .filter(|g| g.is_async());
                if let Some(generator) = coroutine {
                    self.suspend(&generator, GeneratorState::Awaiting)?;
                    return Ok(Some(Exit::Await(promise)));
                }
                promise.wait()
            }
        };

        match settlement {
            Settlement::Fulfilled(value) => {
                self.stack.push(value)?;
                Ok(None)
            }
            Settlement::Rejected(thrown) => Err(VmError::Uncaught(Box::new(thrown))),
        }
    }

    /// Advance any iterable produced by `GET_ITER`; `None` once exhausted
    pub(super) fn iter_next(&mut self, iterator: &Value) -> VmResult<Option<Value>> {
        match iterator {
            Value::Ref(HeapRef::Iterator(it)) => Ok(it.next_value()),
            Value::Ref(HeapRef::Generator(generator)) => {
                match self.resume_generator(generator, Resume::Next(Value::Nil)) {
                    Ok(value) => Ok(Some(value)),
                    Err(err) if err.is_stop_iteration() => Ok(None),
                    Err(err) => Err(err),
                }
            }
            Value::Ref(HeapRef::Channel(channel)) => Ok(channel.recv()),
            other => Err(VmError::argument(format!(
                "value of type {} is not iterable",
                other.type_name()
            ))),
        }
    }
}

/// Queue the next step of an async function on the runtime's pool
pub(super) fn schedule(
    runtime: &Arc<VmRuntime>,
    generator: Arc<Generator>,
    promise: Arc<Promise>,
    resume: Resume,
) -> VmResult<()> {
    let job_runtime = runtime.clone();
    runtime
        .pool()?
        .submit(move || drive_async(job_runtime, generator, promise, resume))
}

/// Run an async body until it finishes or awaits a pending promise
fn drive_async(
    runtime: Arc<VmRuntime>,
    generator: Arc<Generator>,
    promise: Arc<Promise>,
    resume: Resume,
) {
    let mut interpreter = runtime.interpreter_with_id(generator.driver());
    let err = match interpreter.resume_coroutine(&generator, resume) {
        Ok(Exit::Return(value)) => {
            promise.resolve(value);
            return;
        }
        Ok(Exit::Await(awaited)) => {
            tracing::trace!(function = %generator.name(), "async function suspended");
            awaited.on_settle(move |settlement| {
                let next = schedule(&runtime, generator, promise.clone(), settlement.into_resume());
                if let Err(err) = next {
                    let thrown = thrown_value(&runtime, err);
                    promise.reject(thrown.value, thrown.trace);
                }
            });
            return;
        }
        Ok(Exit::Yield(_) | Exit::Fragment) => {
            VmError::fatal("async function suspended without awaiting")
        }
        Err(err) => err,
    };
    let thrown = thrown_value(&interpreter.runtime, err);
    promise.reject(thrown.value, thrown.trace);
}
