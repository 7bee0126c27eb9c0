//! Generators
//!
//! A generator owns the suspended state of one function activation: the
//! frame's slots, its resume offset, its pending `finally` completions and the
//! upvalues parked while it is not on any stack.
//!
//! ```text
//! Fresh ──next──▶ Running ──yield──▶ Suspended ──next──▶ Running
//!                   │  ╲                                    │
//!                   │   await (pending) ▶ Awaiting ─resume─▶┘
//!                   ▼
//!               Completed ──next──▶ StopIteration (body is not re-run)
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::PendingCompletion;
use crate::error::{VmError, VmResult};
use crate::function::{Closure, FunctionObject};
use crate::runtime::VmId;
use crate::upvalue::Upvalue;
use crate::value::Value;

/// Generator execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// Created, body not started
    Fresh,
    /// Stopped at a `YIELD`
    Suspended,
    /// Executing on some VM
    Running,
    /// Stopped at an `AWAIT` of a pending promise
    Awaiting,
    /// Returned or failed
    Completed,
}

/// A frame taken off the value stack
pub struct SavedFrame {
    /// Function being executed
    pub function: Arc<FunctionObject>,
    /// Closure providing upvalues
    pub closure: Option<Arc<Closure>>,
    /// `self`
    pub receiver: Value,
    /// Resume offset
    pub ip: usize,
    /// Offset of the suspending instruction
    pub op_start: usize,
    /// Slots from the frame pointer up to the stack pointer
    pub slots: Vec<Value>,
    /// Number of local slots
    pub local_count: usize,
    /// Pending `finally` completions
    pub completions: Vec<PendingCompletion>,
    /// Upvalues parked at suspension, with their slot relative to the frame pointer
    pub parked: Vec<(usize, Arc<Upvalue>)>,
}

struct GeneratorInner {
    state: GeneratorState,
    saved: Option<SavedFrame>,
}

/// A suspendable function activation
pub struct Generator {
    inner: Mutex<GeneratorInner>,
    is_async: bool,
    name: Arc<str>,
    driver: VmId,
}

impl Generator {
    /// Create a fresh generator around an unstarted frame
    pub fn new(frame: SavedFrame, is_async: bool) -> Arc<Self> {
        let name = frame.function.name.clone();
        Arc::new(Self {
            inner: Mutex::new(GeneratorInner {
                state: GeneratorState::Fresh,
                saved: Some(frame),
            }),
            is_async,
            name,
            driver: VmId::next(),
        })
    }

    /// Current state
    pub fn state(&self) -> GeneratorState {
        self.inner.lock().state
    }

    /// Body of an async function
    pub fn is_async(&self) -> bool {
        self.is_async
    }

    /// Identity every step of an async body runs under
    ///
    /// Mutex ownership and parked upvalues are keyed by it, so they survive
    /// an `AWAIT` that resumes on another pool worker.
    pub fn driver(&self) -> VmId {
        self.driver
    }

    /// Name of the generator function
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Take the saved frame and mark the generator running
    ///
    /// Returns whether the body is starting for the first time.
    pub(crate) fn begin_resume(&self) -> VmResult<(SavedFrame, bool)> {
        let mut inner = self.inner.lock();
        match inner.state {
            GeneratorState::Completed => Err(VmError::StopIteration),
            GeneratorState::Running => Err(VmError::argument(format!(
                "generator `{}` is already running",
                self.name
            ))),
            state => {
                let frame = inner.saved.take().ok_or_else(|| {
                    VmError::fatal(format!("generator `{}` lost its frame", self.name))
                })?;
                inner.state = GeneratorState::Running;
                Ok((frame, state == GeneratorState::Fresh))
            }
        }
    }

    /// Store the frame of a generator stopping at `YIELD` or `AWAIT`
    pub(crate) fn suspend(&self, frame: SavedFrame, state: GeneratorState) {
        let mut inner = self.inner.lock();
        inner.saved = Some(frame);
        inner.state = state;
    }

    /// Mark finished; later resumptions raise `StopIteration`
    pub(crate) fn complete(&self) {
        let mut inner = self.inner.lock();
        inner.saved = None;
        inner.state = GeneratorState::Completed;
    }
}

/// How a generator is resumed
pub enum Resume {
    /// Continue, making `value` the result of the suspended `YIELD`/`AWAIT`
    Next(Value),
    /// Throw at the suspension point (an awaited promise was rejected)
    Throw(crate::error::ThrownValue),
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_bytecode::{Function, Opcode};

    fn generator() -> Arc<Generator> {
        let mut b = Function::builder().name("count").is_generator(true);
        b.op(Opcode::ReturnNil);
        let function = FunctionObject::load(Arc::new(b.build().unwrap())).unwrap();
        Generator::new(
            SavedFrame {
                function,
                closure: None,
                receiver: Value::Nil,
                ip: 0,
                op_start: 0,
                slots: Vec::new(),
                local_count: 0,
                completions: Vec::new(),
                parked: Vec::new(),
            },
            false,
        )
    }

    #[test]
    fn test_state_transitions() {
        let generator = generator();
        assert_eq!(generator.state(), GeneratorState::Fresh);

        let (frame, fresh) = generator.begin_resume().unwrap();
        assert!(fresh);
        assert_eq!(generator.state(), GeneratorState::Running);
        assert!(generator.begin_resume().is_err());

        generator.suspend(frame, GeneratorState::Suspended);
        let (_, fresh) = generator.begin_resume().unwrap();
        assert!(!fresh);

        generator.complete();
        assert!(matches!(
            generator.begin_resume(),
            Err(VmError::StopIteration)
        ));
    }
}
