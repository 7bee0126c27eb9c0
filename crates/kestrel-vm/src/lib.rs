//! # Kestrel VM
//!
//! Execution engine for Kestrel bytecode.
//!
//! ## Design Principles
//!
//! - **Stack-based**: One contiguous value stack per interpreter, addressed by offsets
//! - **Thread-safe heap**: Values are `Send + Sync`; interpreters share only the heap
//! - **Table-driven unwinding**: Catch tables and pending completions, no native unwinding
//! - **Inline caches**: Per-call-site method memoization invalidated by a global epoch

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod format;
pub mod function;
pub mod generator;
pub mod interpreter;
pub mod intrinsics;
pub mod object;
pub mod promise;
pub mod runtime;
pub mod stack;
pub mod symbol_registry;
pub mod sync;
pub mod thread_pool;
pub mod trace;
pub mod upvalue;
pub mod value;

pub use cache::{CacheStats, InlineCache};
pub use config::{QueuePolicy, RuntimeConfig};
pub use error::{ThrownValue, VmError, VmResult};
pub use format::format_values;
pub use function::{Closure, FunctionObject};
pub use generator::{Generator, GeneratorState, Resume};
pub use interpreter::Interpreter;
pub use intrinsics::Intrinsics;
pub use object::{Class, ErrorObject, Instance, NativeFunction};
pub use promise::{Promise, Settlement};
pub use runtime::{VmId, VmRuntime};
pub use symbol_registry::Symbol;
pub use sync::{Channel, ThreadHandle, VmMutex, WaitGroup};
pub use trace::{StackTrace, TraceFrame};
pub use value::{HeapRef, Value};
