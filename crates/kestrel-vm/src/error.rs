//! VM error types

use std::sync::Arc;

use kestrel_bytecode::BytecodeError;
use thiserror::Error;

use crate::trace::StackTrace;
use crate::value::Value;

/// VM execution errors
#[derive(Debug, Error)]
pub enum VmError {
    /// Wrong arity, wrong type for a built-in operation, unhashable value
    #[error("ArgumentError: {0}")]
    Argument(String),

    /// Negative or overflowing size, out-of-range index, division by zero
    #[error("RangeError: {0}")]
    Range(String),

    /// Iteration ended; used internally to stop loops
    #[error("StopIteration")]
    StopIteration,

    /// Closure with open upvalues invoked from a VM that does not own them
    #[error("CrossThreadError: closure `{function}` captures live locals of another thread")]
    CrossThreadClosure {
        /// Name of the offending closure
        function: String,
    },

    /// Call-frame or value-stack exhaustion (fatal)
    #[error("StackOverflow: {0}")]
    StackOverflow(String),

    /// Thrown value that reached a VM-call boundary
    #[error("{0}")]
    Uncaught(Box<ThrownValue>),

    /// Structural invariant violation (fatal)
    #[error("Fatal: {0}")]
    Fatal(String),

    /// Corrupt bytecode (fatal)
    #[error("Bytecode error: {0}")]
    Bytecode(#[from] BytecodeError),
}

impl VmError {
    /// Create an argument error
    pub fn argument(msg: impl Into<String>) -> Self {
        Self::Argument(msg.into())
    }

    /// Create a range error
    pub fn range(msg: impl Into<String>) -> Self {
        Self::Range(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Create a stack overflow error
    pub fn stack_overflow(msg: impl Into<String>) -> Self {
        Self::StackOverflow(msg.into())
    }

    /// Wrap a thrown value with its trace
    pub fn uncaught(value: Value, trace: Arc<StackTrace>) -> Self {
        Self::Uncaught(Box::new(ThrownValue { value, trace }))
    }

    /// Can interpreted code observe this error through a catch handler
    pub fn is_catchable(&self) -> bool {
        matches!(
            self,
            Self::Argument(_)
                | Self::Range(_)
                | Self::StopIteration
                | Self::CrossThreadClosure { .. }
                | Self::Uncaught(_)
        )
    }

    /// Is this the internal end-of-iteration signal
    pub fn is_stop_iteration(&self) -> bool {
        match self {
            Self::StopIteration => true,
            Self::Uncaught(thrown) => thrown.is_stop_iteration(),
            _ => false,
        }
    }

    /// Message text without the class prefix
    pub fn message(&self) -> String {
        match self {
            Self::Argument(m) | Self::Range(m) | Self::StackOverflow(m) | Self::Fatal(m) => {
                m.clone()
            }
            Self::StopIteration => String::from("iteration has ended"),
            Self::CrossThreadClosure { function } => {
                format!("closure `{function}` captures live locals of another thread")
            }
            Self::Uncaught(thrown) => thrown.value.to_string(),
            Self::Bytecode(e) => e.to_string(),
        }
    }
}

/// A thrown value together with the trace captured where it was thrown
#[derive(Debug, Clone)]
pub struct ThrownValue {
    /// The thrown value
    pub value: Value,
    /// Stack trace, oldest call first
    pub trace: Arc<StackTrace>,
}

impl ThrownValue {
    /// Is the thrown value a `StopIteration` error object
    pub fn is_stop_iteration(&self) -> bool {
        self.value
            .as_error()
            .is_some_and(|e| &*e.class.name == "StopIteration")
    }

    /// Render the trace followed by the error description
    pub fn render(&self) -> String {
        self.trace.render_error(&self.value)
    }
}

impl std::fmt::Display for ThrownValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Uncaught {}", self.value)
    }
}

/// Result type for VM operations
pub type VmResult<T> = Result<T, VmError>;
