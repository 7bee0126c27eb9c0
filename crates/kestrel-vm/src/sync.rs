//! Synchronization primitives exposed to interpreted code
//!
//! These are the only sanctioned way for lightweight threads to coordinate.
//! Each is a heap object shared by reference between VM instances.

use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::{Condvar, Mutex};

use crate::error::{VmError, VmResult};
use crate::runtime::VmId;
use crate::value::Value;

/// A mutex whose `lock` and `unlock` are separate calls
///
/// The holder is the VM that locked it; unlocking from any other VM is an
/// argument error.
pub struct VmMutex {
    holder: Mutex<Option<VmId>>,
    released: Condvar,
}

impl VmMutex {
    /// Create an unlocked mutex
    pub fn new() -> Self {
        Self {
            holder: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    /// Block until the mutex is free, then take it for `vm`
    pub fn lock(&self, vm: VmId) -> VmResult<()> {
        let mut holder = self.holder.lock();
        if *holder == Some(vm) {
            return Err(VmError::argument("mutex is already locked by this thread"));
        }
        while holder.is_some() {
            self.released.wait(&mut holder);
        }
        *holder = Some(vm);
        Ok(())
    }

    /// Release the mutex held by `vm`
    pub fn unlock(&self, vm: VmId) -> VmResult<()> {
        let mut holder = self.holder.lock();
        if *holder != Some(vm) {
            return Err(VmError::argument("mutex is not locked by this thread"));
        }
        *holder = None;
        drop(holder);
        self.released.notify_one();
        Ok(())
    }

    /// Is the mutex held
    pub fn is_locked(&self) -> bool {
        self.holder.lock().is_some()
    }
}

impl Default for VmMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts outstanding tasks; `wait` blocks until the count reaches zero
#[derive(Default)]
pub struct WaitGroup {
    count: Mutex<i64>,
    zero: Condvar,
}

impl WaitGroup {
    /// Create a wait-group with a zero count
    pub fn new() -> Self {
        Self::default()
    }

    /// Adjust the count by `delta`
    pub fn add(&self, delta: i64) -> VmResult<()> {
        let mut count = self.count.lock();
        let next = count
            .checked_add(delta)
            .filter(|n| *n >= 0)
            .ok_or_else(|| VmError::range("wait group counter would go negative"))?;
        *count = next;
        if next == 0 {
            self.zero.notify_all();
        }
        Ok(())
    }

    /// Decrement the count by one
    pub fn done(&self) -> VmResult<()> {
        self.add(-1)
    }

    /// Block until the count is zero
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    /// Current count
    pub fn count(&self) -> i64 {
        *self.count.lock()
    }
}

/// Bounded multi-producer multi-consumer channel
///
/// Closing drops the channel's sender: blocked receivers drain what is queued
/// and then receive nil.
pub struct Channel {
    tx: Mutex<Option<Sender<Value>>>,
    rx: Receiver<Value>,
    capacity: usize,
}

impl Channel {
    /// Create a channel holding up to `capacity` values
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            capacity,
        }
    }

    /// Send, blocking while the channel is full
    pub fn send(&self, value: Value) -> VmResult<()> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| VmError::argument("send on closed channel"))?;
        tx.send(value)
            .map_err(|_| VmError::argument("send on closed channel"))
    }

    /// Receive, blocking while the channel is empty and open
    ///
    /// Returns `None` once the channel is closed and drained.
    pub fn recv(&self) -> Option<Value> {
        self.rx.recv().ok()
    }

    /// Close the channel; further sends fail
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Has the channel been closed
    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Queued values
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// No values queued
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Maximum queued values
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Handle to a spawned lightweight thread
pub struct ThreadHandle {
    name: String,
    handle: Mutex<Option<JoinHandle<Value>>>,
    result: Mutex<Option<Value>>,
}

impl ThreadHandle {
    pub(crate) fn new(name: String, handle: JoinHandle<Value>) -> Self {
        Self {
            name,
            handle: Mutex::new(Some(handle)),
            result: Mutex::new(None),
        }
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread and return its result
    ///
    /// A thread that died with an uncaught error yields nil. Joining again
    /// returns the same result.
    pub fn join(&self) -> Value {
        let mut result = self.result.lock();
        if let Some(value) = result.as_ref() {
            return value.clone();
        }
        let value = match self.handle.lock().take() {
            Some(handle) => handle.join().unwrap_or(Value::Nil),
            None => Value::Nil,
        };
        *result = Some(value.clone());
        value
    }

    /// Has the thread finished
    pub fn is_finished(&self) -> bool {
        match self.handle.lock().as_ref() {
            Some(handle) => handle.is_finished(),
            None => true,
        }
    }
}
