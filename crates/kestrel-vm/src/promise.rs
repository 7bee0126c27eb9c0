//! Promises
//!
//! A promise settles exactly once, under its mutex, either with a result or
//! with an error plus the trace captured where the error was thrown. After
//! settlement the fields never change, so awaiting a settled promise is a flag
//! check followed by one short lock to copy the outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::ThrownValue;
use crate::generator::Resume;
use crate::trace::StackTrace;
use crate::value::Value;

type Waiter = Box<dyn FnOnce(Settlement) + Send>;

/// Outcome of a settled promise
#[derive(Debug, Clone)]
pub enum Settlement {
    /// Resolved with a value
    Fulfilled(Value),
    /// Resolved with an error
    Rejected(ThrownValue),
}

impl Settlement {
    /// How a coroutine awaiting this outcome resumes
    pub fn into_resume(self) -> Resume {
        match self {
            Self::Fulfilled(value) => Resume::Next(value),
            Self::Rejected(thrown) => Resume::Throw(thrown),
        }
    }
}

struct PromiseState {
    resolved: bool,
    result: Value,
    error: Option<Value>,
    trace: Option<Arc<StackTrace>>,
    waiters: Vec<Waiter>,
}

impl PromiseState {
    fn settlement(&self) -> Option<Settlement> {
        if !self.resolved {
            return None;
        }
        Some(match &self.error {
            Some(error) => Settlement::Rejected(ThrownValue {
                value: error.clone(),
                trace: self.trace.clone().unwrap_or_default(),
            }),
            None => Settlement::Fulfilled(self.result.clone()),
        })
    }
}

/// Asynchronous result of an async function
pub struct Promise {
    settled: AtomicBool,
    state: Mutex<PromiseState>,
    cond: Condvar,
}

impl Promise {
    /// Create a pending promise
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            settled: AtomicBool::new(false),
            state: Mutex::new(PromiseState {
                resolved: false,
                result: Value::Nil,
                error: None,
                trace: None,
                waiters: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    /// Create a promise already fulfilled with `value`
    pub fn fulfilled(value: Value) -> Arc<Self> {
        let promise = Self::new();
        promise.resolve(value);
        promise
    }

    /// Fulfill; ignored if already settled
    pub fn resolve(&self, value: Value) {
        self.settle(value, None, None);
    }

    /// Reject with an error and its trace; ignored if already settled
    pub fn reject(&self, error: Value, trace: Arc<StackTrace>) {
        self.settle(Value::Nil, Some(error), Some(trace));
    }

    fn settle(&self, result: Value, error: Option<Value>, trace: Option<Arc<StackTrace>>) {
        let (waiters, settlement) = {
            let mut state = self.state.lock();
            if state.resolved {
                tracing::debug!("promise already settled; ignoring second settlement");
                return;
            }
            state.resolved = true;
            state.result = result;
            state.error = error;
            state.trace = trace;
            self.settled.store(true, Ordering::Release);
            (std::mem::take(&mut state.waiters), state.settlement())
        };
        self.cond.notify_all();

        if let Some(settlement) = settlement {
            for waiter in waiters {
                waiter(settlement.clone());
            }
        }
    }

    /// Has the promise settled
    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Outcome if settled, without blocking
    pub fn settlement(&self) -> Option<Settlement> {
        if !self.is_resolved() {
            return None;
        }
        self.state.lock().settlement()
    }

    /// Block the calling thread until settled
    pub fn wait(&self) -> Settlement {
        let mut state = self.state.lock();
        loop {
            if let Some(settlement) = state.settlement() {
                return settlement;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Run `waiter` once settled; immediately if already settled
    pub fn on_settle(&self, waiter: impl FnOnce(Settlement) + Send + 'static) {
        let settled = {
            let mut state = self.state.lock();
            match state.settlement() {
                Some(settlement) => settlement,
                None => {
                    state.waiters.push(Box::new(waiter));
                    return;
                }
            }
        };
        waiter(settled);
    }
}
