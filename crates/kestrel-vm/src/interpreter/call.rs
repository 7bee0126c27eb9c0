//! Calls, tail calls, method invocation and thread spawning

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;
use tracing::{debug, error, info_span};

use super::{Interpreter, coroutine};
use crate::cache::InlineCache;
use crate::context::CallFrame;
use crate::error::{VmError, VmResult};
use crate::function::{Closure, FunctionObject};
use crate::generator::{Generator, Resume, SavedFrame};
use crate::object::{Class, Instance, NativeFunction};
use crate::promise::Promise;
use crate::runtime::VmRuntime;
use crate::symbol_registry::Symbol;
use crate::sync::ThreadHandle;
use crate::value::{HeapRef, Value};

/// Stack size of spawned interpreter threads
const THREAD_STACK_BYTES: usize = 8 * 1024 * 1024;

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

impl Interpreter {
    /// Call the value below the top `argc` arguments
    ///
    /// Returns true when a bytecode frame was pushed; otherwise the result
    /// already replaced the callee slot.
    pub(super) fn call_value(&mut self, argc: usize, halt: bool) -> VmResult<bool> {
        let callee = self.stack.peek(argc)?.clone();
        self.call_with_receiver(callee, None, argc, halt, false)
    }

    pub(super) fn call_with_receiver(
        &mut self,
        callee: Value,
        receiver: Option<Value>,
        argc: usize,
        halt: bool,
        construct: bool,
    ) -> VmResult<bool> {
        match callee {
            Value::Ref(HeapRef::Function(function)) => self.call_function(
                function,
                None,
                receiver.unwrap_or(Value::Nil),
                argc,
                halt,
                construct,
            ),
            Value::Ref(HeapRef::Closure(closure)) => {
                closure.check_thread(self.id)?;
                let receiver = receiver.unwrap_or_else(|| closure.receiver.clone());
                let function = closure.function.clone();
                self.call_function(function, Some(closure), receiver, argc, halt, construct)
            }
            Value::Ref(HeapRef::Native(native)) => {
                self.call_native(&native, receiver.unwrap_or(Value::Nil), argc, construct)?;
                Ok(false)
            }
            Value::Ref(HeapRef::BoundMethod(bound)) => {
                let slot = self.operand_base(argc + 1)?;
                self.stack.set(slot, bound.method.clone())?;
                self.call_with_receiver(
                    bound.method.clone(),
                    Some(bound.receiver.clone()),
                    argc,
                    halt,
                    construct,
                )
            }
            Value::Ref(HeapRef::Class(class)) => self.construct(class, argc, halt),
            other => Err(VmError::argument(format!(
                "value of type {} is not callable",
                other.type_name()
            ))),
        }
    }

    fn construct(&mut self, class: Arc<Class>, argc: usize, halt: bool) -> VmResult<bool> {
        let callee_slot = self.operand_base(argc + 1)?;
        let class_value = Value::Ref(HeapRef::Class(class.clone()));

        if let Some(ctor) = class.find_constructor() {
            self.stack.set(callee_slot, ctor.clone())?;
            return self.call_with_receiver(ctor, Some(class_value), argc, halt, false);
        }

        let instance = Value::Ref(HeapRef::Instance(Arc::new(Instance::new(class.clone()))));
        match class.find_method(Symbol::intern("init")) {
            Some(init) => {
                self.stack.set(callee_slot, init.clone())?;
                self.call_with_receiver(init, Some(instance), argc, halt, true)
            }
            None if argc == 0 => {
                self.stack.set(callee_slot, instance)?;
                Ok(false)
            }
            None => Err(VmError::argument(format!(
                "`{}` expected 0 arguments but got {argc}",
                class.name
            ))),
        }
    }

    fn call_native(
        &mut self,
        native: &NativeFunction,
        receiver: Value,
        argc: usize,
        construct: bool,
    ) -> VmResult<()> {
        native.check_arity(argc)?;
        let callee_slot = self.operand_base(argc + 1)?;
        let args: SmallVec<[Value; 8]> = self.stack.drain_from(callee_slot + 1);

        self.push_native_frame(native.name.clone())?;
        let result = (native.func)(self, &receiver, &args);
        self.pop_native_frame();

        let result = if construct { receiver } else { result? };
        self.stack.set(callee_slot, result)
    }

    /// Check the argument count and lay out parameters and locals above `fp`
    fn bind_arguments(&mut self, function: &FunctionObject, fp: usize, argc: usize) -> VmResult<()> {
        let code = &function.code;
        let min = code.arity as usize;
        let max = min + code.optional as usize;
        let variadic = code.is_variadic();

        if argc < min || (!variadic && argc > max) {
            let expected = if variadic {
                format!("at least {min}")
            } else if min == max {
                format!("{min}")
            } else {
                format!("{min}..{max}")
            };
            return Err(VmError::argument(format!(
                "`{}` expected {expected} arguments but got {argc}",
                function.name
            )));
        }

        self.stack.fill_nil_to(fp + max)?;
        if variadic {
            let rest: Vec<Value> = self.stack.drain_from(fp + max);
            self.stack.push(Value::array(rest))?;
        }
        let locals = (code.local_count as usize).max(code.param_slots());
        self.stack.fill_nil_to(fp + locals)
    }

    fn call_function(
        &mut self,
        function: Arc<FunctionObject>,
        closure: Option<Arc<Closure>>,
        receiver: Value,
        argc: usize,
        halt: bool,
        construct: bool,
    ) -> VmResult<bool> {
        let fp = self.operand_base(argc)?;
        self.bind_arguments(&function, fp, argc)?;
        let local_count = self.stack.sp() - fp;

        if function.code.is_generator() || function.code.is_async() {
            let is_async = function.code.is_async();
            let saved = SavedFrame {
                function,
                closure,
                receiver,
                ip: 0,
                op_start: 0,
                slots: self.stack.drain_from(fp),
                local_count,
                completions: Vec::new(),
                parked: Vec::new(),
            };
            let generator = Generator::new(saved, is_async);
            let result = if is_async {
                let promise = Promise::new();
                coroutine::schedule(
                    &self.runtime,
                    generator,
                    promise.clone(),
                    Resume::Next(Value::Nil),
                )?;
                Value::Ref(HeapRef::Promise(promise))
            } else {
                Value::Ref(HeapRef::Generator(generator))
            };
            self.stack.set(fp - 1, result)?;
            return Ok(false);
        }

        let mut frame = CallFrame::new(function, fp);
        frame.local_count = local_count;
        frame.closure = closure;
        frame.receiver = receiver;
        frame.halt_on_return = halt;
        frame.is_construct = construct;
        self.frames.push(frame)?;
        Ok(true)
    }

    /// `TAIL_CALL`: rebind the current frame to the callee when that is safe
    pub(super) fn tail_call(&mut self, argc: usize) -> VmResult<()> {
        let callee_slot = self.operand_base(argc + 1)?;
        let (function, closure) = match self.stack.get(callee_slot)? {
            Value::Ref(HeapRef::Function(f)) => (f.clone(), None),
            Value::Ref(HeapRef::Closure(c)) => (c.function.clone(), Some(c.clone())),
            _ => {
                self.call_value(argc, false)?;
                return Ok(());
            }
        };

        let frame = self.frames.current()?;
        let reusable = !function.code.is_generator()
            && !function.code.is_async()
            && frame.generator.is_none()
            && !frame.is_construct
            && !frame.fragment
            && !frame.function.code.is_protected(frame.op_start);
        if !reusable {
            self.call_value(argc, false)?;
            return Ok(());
        }

        if let Some(closure) = &closure {
            closure.check_thread(self.id)?;
        }
        let fp = frame.fp;
        let receiver = closure
            .as_ref()
            .map_or(Value::Nil, |c| c.receiver.clone());

        self.close_upvalues(fp);
        let values: SmallVec<[Value; 8]> = self.stack.drain_from(callee_slot);
        self.stack.truncate(fp - 1);
        for value in values {
            self.stack.push(value)?;
        }
        self.bind_arguments(&function, fp, argc)?;
        let local_count = self.stack.sp() - fp;

        let frame = self.frames.current_mut()?;
        frame.function = function;
        frame.closure = closure;
        frame.receiver = receiver;
        frame.ip = 0;
        frame.op_start = 0;
        frame.local_count = local_count;
        frame.tail_calls += 1;
        frame.completions.clear();
        Ok(())
    }

    /// `INVOKE`: call a method on the receiver below the arguments
    pub(super) fn invoke_op(
        &mut self,
        name: Symbol,
        argc: usize,
        cache: &InlineCache,
    ) -> VmResult<()> {
        let receiver_slot = self.operand_base(argc + 1)?;
        let receiver = self.stack.get(receiver_slot)?.clone();
        let (method, bind) = self.resolve_method(&receiver, name, Some(cache))?;
        self.stack.set(receiver_slot, method.clone())?;
        self.call_with_receiver(method, bind.then_some(receiver), argc, false, false)?;
        Ok(())
    }

    /// `SPAWN`: run the callee on a new thread with its own interpreter
    pub(super) fn spawn(&mut self, argc: usize) -> VmResult<()> {
        let start = self.operand_base(argc)?;
        let args: Vec<Value> = self.stack.drain_from(start);
        let callee = self.stack.pop()?;
        if !callee.is_callable() {
            return Err(VmError::argument(format!(
                "value of type {} is not callable",
                callee.type_name()
            )));
        }

        let name = format!("kestrel-thread-{}", NEXT_THREAD.fetch_add(1, Ordering::Relaxed));
        let runtime = self.runtime.clone();
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .stack_size(THREAD_STACK_BYTES)
            .spawn(move || run_thread(runtime, &thread_name, callee, args))
            .map_err(|e| VmError::fatal(format!("failed to spawn thread: {e}")))?;
        debug!(thread = %name, "thread spawned");

        let handle = ThreadHandle::new(name, handle);
        self.stack.push(Value::Ref(HeapRef::Thread(Arc::new(handle))))
    }
}

fn run_thread(runtime: Arc<VmRuntime>, name: &str, callee: Value, args: Vec<Value>) -> Value {
    let _span = info_span!("thread", name = %name).entered();
    let mut interpreter = runtime.interpreter();
    let result = match interpreter.invoke(&callee, &args) {
        Ok(value) => value,
        Err(err) => {
            if let Some(report) = interpreter.report_uncaught(&err) {
                eprintln!("{report}");
                error!(error = %err, "uncaught error on thread");
            }
            Value::Nil
        }
    };
    debug!("thread exited");
    result
}
