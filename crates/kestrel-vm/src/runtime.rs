//! VM runtime - the shared half of the engine
//!
//! A [`VmRuntime`] is `Send + Sync` and shared by every [`Interpreter`] that
//! runs on it: global variables, intrinsic classes, configuration and the
//! async thread pool. Each interpreter owns its value stack, frame stack and
//! open upvalues and is identified by a [`VmId`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use kestrel_bytecode::Function;
use once_cell::sync::OnceCell;

use crate::config::RuntimeConfig;
use crate::error::VmResult;
use crate::function::FunctionObject;
use crate::interpreter::Interpreter;
use crate::intrinsics::Intrinsics;
use crate::object::NativeFunction;
use crate::symbol_registry::Symbol;
use crate::thread_pool::ThreadPool;
use crate::value::{HeapRef, Value};

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one interpreter instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmId(u64);

impl VmId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        Self(NEXT_VM_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id
    pub fn get(self) -> u64 {
        self.0
    }
}

/// The VM runtime
pub struct VmRuntime {
    config: RuntimeConfig,
    globals: DashMap<Symbol, Value>,
    intrinsics: Intrinsics,
    pool: OnceCell<ThreadPool>,
}

impl VmRuntime {
    /// Create a runtime configured from the process environment
    pub fn new() -> Arc<Self> {
        Self::with_config(RuntimeConfig::global().clone())
    }

    /// Create a runtime with an explicit configuration
    pub fn with_config(config: RuntimeConfig) -> Arc<Self> {
        let intrinsics = Intrinsics::new();
        let globals = DashMap::new();
        intrinsics.install_globals(&globals);

        Arc::new(Self {
            config,
            globals,
            intrinsics,
            pool: OnceCell::new(),
        })
    }

    /// Runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Built-in classes
    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    /// Create an interpreter bound to this runtime
    pub fn interpreter(self: &Arc<Self>) -> Interpreter {
        Interpreter::new(self.clone())
    }

    /// Create an interpreter that acts as the VM `id`
    pub(crate) fn interpreter_with_id(self: &Arc<Self>, id: VmId) -> Interpreter {
        Interpreter::with_id(self.clone(), id)
    }

    /// Verify and load a compiled function
    pub fn load(&self, function: Function) -> VmResult<Arc<FunctionObject>> {
        FunctionObject::load(Arc::new(function))
    }

    /// Read a global by symbol
    pub fn global(&self, name: Symbol) -> Option<Value> {
        self.globals.get(&name).map(|v| v.clone())
    }

    /// Read a global by name
    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.global(Symbol::intern(name))
    }

    /// Define or overwrite a global
    pub fn set_global(&self, name: &str, value: Value) {
        self.globals.insert(Symbol::intern(name), value);
    }

    pub(crate) fn store_global(&self, name: Symbol, value: Value) {
        self.globals.insert(name, value);
    }

    /// Register a native function as a global
    pub fn define_native<F>(&self, name: &str, min_args: usize, max_args: Option<usize>, func: F)
    where
        F: Fn(&mut Interpreter, &Value, &[Value]) -> VmResult<Value> + Send + Sync + 'static,
    {
        let native = NativeFunction::new(name, min_args, max_args, func);
        self.set_global(name, Value::Ref(HeapRef::Native(Arc::new(native))));
    }

    /// The async thread pool, started on first use
    pub fn pool(&self) -> VmResult<&ThreadPool> {
        self.pool.get_or_try_init(|| {
            ThreadPool::new(
                self.config.pool_workers,
                self.config.pool_queue_depth,
                self.config.queue_policy,
            )
        })
    }

    /// Run `function` as a program entry point on a fresh interpreter
    ///
    /// An uncaught error is reported to stderr before it is returned.
    pub fn run_main(self: &Arc<Self>, function: Function) -> VmResult<Value> {
        let function = self.load(function)?;
        let mut interpreter = self.interpreter();
        match interpreter.execute(&function) {
            Ok(value) => Ok(value),
            Err(err) => {
                if let Some(report) = interpreter.report_uncaught(&err) {
                    eprintln!("{report}");
                }
                Err(err)
            }
        }
    }
}
