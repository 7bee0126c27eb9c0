//! The value stack
//!
//! One contiguous buffer per VM holding every frame's locals, temporaries and
//! arguments. Frames and open upvalues refer to slots by offset, so
//! reallocating the buffer needs no pointer fix-ups: [`ValueStack::grow`] is
//! the single place where the buffer is replaced.
//!
//! The last slot of the buffer is a guard holding [`Value::Undefined`]; debug
//! builds assert it is never overwritten.

use crate::error::{VmError, VmResult};
use crate::value::Value;

/// Size of one stack slot in bytes
pub const SLOT_BYTES: usize = std::mem::size_of::<Value>();

/// Growable value stack addressed by offsets
pub struct ValueStack {
    slots: Vec<Value>,
    sp: usize,
    max_slots: usize,
    growths: u32,
}

impl ValueStack {
    /// Create a stack with the given initial and maximum sizes in bytes
    pub fn new(initial_bytes: usize, max_bytes: usize) -> Self {
        let initial = (initial_bytes / SLOT_BYTES).max(2);
        let max_slots = (max_bytes / SLOT_BYTES).max(initial);
        let mut slots = Vec::new();
        slots.resize(initial, Value::Undefined);
        Self {
            slots,
            sp: 0,
            max_slots,
            growths: 0,
        }
    }

    /// Stack pointer: offset of the next free slot
    #[inline]
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Allocated slots, guard included
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// How many times the buffer has been reallocated
    #[inline]
    pub fn growths(&self) -> u32 {
        self.growths
    }

    /// Make room for `additional` more values above the stack pointer
    #[inline]
    pub fn reserve(&mut self, additional: usize) -> VmResult<()> {
        // +1 keeps the guard slot free
        let needed = self.sp + additional + 1;
        if needed > self.slots.len() {
            self.grow(needed)?;
        }
        Ok(())
    }

    /// Reallocate to at least `needed` slots, doubling each step
    ///
    /// Frame pointers, saved frames and open upvalues hold offsets into the
    /// stack, so they stay valid across reallocation without rebasing.
    fn grow(&mut self, needed: usize) -> VmResult<()> {
        if needed > self.max_slots {
            return Err(VmError::stack_overflow(format!(
                "value stack exceeded {} bytes",
                self.max_slots * SLOT_BYTES
            )));
        }
        let old = self.slots.len();
        let mut new = old.max(1);
        while new < needed {
            new *= 2;
        }
        let new = new.min(self.max_slots);
        self.debug_check_guard();
        self.slots.resize(new, Value::Undefined);
        self.growths += 1;
        tracing::debug!(old_slots = old, new_slots = new, "value stack grown");
        Ok(())
    }

    #[inline]
    fn debug_check_guard(&self) {
        debug_assert!(
            self.slots.last().is_some_and(Value::is_undefined),
            "value stack guard slot overwritten"
        );
    }

    /// Push a value
    #[inline]
    pub fn push(&mut self, value: Value) -> VmResult<()> {
        self.reserve(1)?;
        self.slots[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    /// Pop a value
    #[inline]
    pub fn pop(&mut self) -> VmResult<Value> {
        if self.sp == 0 {
            return Err(VmError::fatal("value stack underflow"));
        }
        self.sp -= 1;
        Ok(std::mem::take(&mut self.slots[self.sp]))
    }

    /// Value `distance` slots below the top (0 is the top)
    #[inline]
    pub fn peek(&self, distance: usize) -> VmResult<&Value> {
        self.sp
            .checked_sub(distance + 1)
            .map(|at| &self.slots[at])
            .ok_or_else(|| VmError::fatal("value stack underflow"))
    }

    /// Read a slot below the stack pointer
    #[inline]
    pub fn get(&self, slot: usize) -> VmResult<&Value> {
        if slot >= self.sp {
            return Err(VmError::fatal(format!(
                "stack slot {slot} above stack pointer {}",
                self.sp
            )));
        }
        Ok(&self.slots[slot])
    }

    /// Overwrite a slot below the stack pointer
    #[inline]
    pub fn set(&mut self, slot: usize, value: Value) -> VmResult<()> {
        if slot >= self.sp {
            return Err(VmError::fatal(format!(
                "stack slot {slot} above stack pointer {}",
                self.sp
            )));
        }
        self.slots[slot] = value;
        Ok(())
    }

    /// Move a slot's value out, leaving the sentinel
    #[inline]
    pub fn take(&mut self, slot: usize) -> VmResult<Value> {
        if slot >= self.sp {
            return Err(VmError::fatal(format!(
                "stack slot {slot} above stack pointer {}",
                self.sp
            )));
        }
        Ok(std::mem::take(&mut self.slots[slot]))
    }

    /// Drop every value at or above `sp`
    pub fn truncate(&mut self, sp: usize) {
        if sp < self.sp {
            for slot in &mut self.slots[sp..self.sp] {
                *slot = Value::Undefined;
            }
            self.sp = sp;
        }
    }

    /// Extend with nil up to `sp`
    pub fn fill_nil_to(&mut self, sp: usize) -> VmResult<()> {
        if sp > self.sp {
            self.reserve(sp - self.sp)?;
            for slot in &mut self.slots[self.sp..sp] {
                *slot = Value::Nil;
            }
            self.sp = sp;
        }
        Ok(())
    }

    /// Values in `from..sp`
    pub fn slice_from(&self, from: usize) -> &[Value] {
        &self.slots[from.min(self.sp)..self.sp]
    }

    /// Remove and return the values in `from..sp`
    pub fn drain_from<C: FromIterator<Value>>(&mut self, from: usize) -> C {
        let from = from.min(self.sp);
        let values = self.slots[from..self.sp]
            .iter_mut()
            .map(std::mem::take)
            .collect();
        self.sp = from;
        values
    }
}
