//! Captured variables
//!
//! An upvalue starts *open*, aliasing a live slot on the value stack of the VM
//! that created it. Closing copies the slot's value into the upvalue, after
//! which reads and writes touch only that private copy; a closed upvalue never
//! reopens.
//!
//! Generators add a third state: when a generator suspends, the upvalues into
//! its frame are *parked* (the slot value moves into the upvalue) and reopened
//! at the frame's new position when it resumes.

use parking_lot::Mutex;

use crate::runtime::VmId;
use crate::value::Value;

/// Upvalue state
#[derive(Clone)]
pub enum UpvalueState {
    /// Aliases `slot` on the stack of VM `vm`
    Open {
        /// Owning VM
        vm: VmId,
        /// Absolute stack slot
        slot: usize,
    },
    /// Holds the value of a suspended generator's slot
    Parked(Value),
    /// Holds its own value permanently
    Closed(Value),
}

/// A shared captured variable
pub struct Upvalue {
    state: Mutex<UpvalueState>,
}

impl Upvalue {
    /// Create an open upvalue
    pub fn open(vm: VmId, slot: usize) -> Self {
        Self {
            state: Mutex::new(UpvalueState::Open { vm, slot }),
        }
    }

    /// Create an already closed upvalue
    pub fn closed(value: Value) -> Self {
        Self {
            state: Mutex::new(UpvalueState::Closed(value)),
        }
    }

    /// Snapshot of the state
    pub fn state(&self) -> UpvalueState {
        self.state.lock().clone()
    }

    /// Is the upvalue open on a VM other than `vm`
    pub fn is_open_elsewhere(&self, vm: VmId) -> bool {
        matches!(*self.state.lock(), UpvalueState::Open { vm: owner, .. } if owner != vm)
    }

    /// Is the upvalue closed
    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), UpvalueState::Closed(_))
    }

    /// Copy `value` in and mark closed
    pub fn close(&self, value: Value) {
        *self.state.lock() = UpvalueState::Closed(value);
    }

    /// Move `value` in while the owning generator is suspended
    pub fn park(&self, value: Value) {
        let mut state = self.state.lock();
        if matches!(*state, UpvalueState::Open { .. }) {
            *state = UpvalueState::Parked(value);
        }
    }

    /// Reopen a parked upvalue at its generator's new slot, returning the
    /// value to place there
    pub fn unpark(&self, vm: VmId, slot: usize) -> Option<Value> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, UpvalueState::Open { vm, slot }) {
            UpvalueState::Parked(value) => Some(value),
            other => {
                *state = other;
                None
            }
        }
    }

    /// Write through a parked or closed upvalue; returns the open location
    /// instead when the value lives on a stack
    pub fn store(&self, value: Value) -> Option<(VmId, usize)> {
        let mut state = self.state.lock();
        match &mut *state {
            UpvalueState::Open { vm, slot } => Some((*vm, *slot)),
            UpvalueState::Parked(v) | UpvalueState::Closed(v) => {
                *v = value;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_is_terminal() {
        let vm = VmId::next();
        let uv = Upvalue::open(vm, 4);
        assert!(!uv.is_closed());
        uv.close(Value::Int(9));
        assert!(uv.is_closed());

        // Parking or unparking a closed upvalue does nothing
        uv.park(Value::Int(1));
        assert_eq!(uv.unpark(vm, 10), None);
        assert!(matches!(uv.state(), UpvalueState::Closed(Value::Int(9))));
    }

    #[test]
    fn test_park_and_unpark() {
        let vm = VmId::next();
        let uv = Upvalue::open(vm, 3);
        uv.park(Value::Int(5));
        assert_eq!(uv.store(Value::Int(6)), None);
        assert_eq!(uv.unpark(vm, 8), Some(Value::Int(6)));
        assert!(matches!(uv.state(), UpvalueState::Open { slot: 8, .. }));
    }

    #[test]
    fn test_foreign_owner_detected() {
        let a = VmId::next();
        let b = VmId::next();
        let uv = Upvalue::open(a, 0);
        assert!(uv.is_open_elsewhere(b));
        assert!(!uv.is_open_elsewhere(a));
        uv.close(Value::Nil);
        assert!(!uv.is_open_elsewhere(b));
    }
}
