//! Bytecode interpreter
//!
//! One [`Interpreter`] runs on one thread. It owns a value stack, a call-frame
//! stack and the set of open upvalues into that stack; everything else it
//! touches is shared through the [`VmRuntime`].
//!
//! Calls made from outside the dispatch loop (embedders, natives, generator
//! resumption) push a frame marked `halt_on_return` and run a nested loop
//! that stops when that frame returns. Errors that unwind past such a frame
//! leave the loop as [`VmError::Uncaught`] and are rethrown by the caller's
//! loop with their original trace.

mod arith;
mod call;
mod coroutine;
mod unwind;

use std::collections::BTreeMap;
use std::sync::Arc;

use kestrel_bytecode::operand::{read_i16, read_u8, read_u16, read_u32};
use kestrel_bytecode::{BytecodeError, Opcode, UpvalueCapture};

use crate::cache::InlineCache;
use crate::context::{CallFrame, FrameStack, NativeFrame};
use crate::error::{VmError, VmResult};
use crate::function::{Closure, FunctionObject};
use crate::object::{BoundMethod, Class, IteratorObject, MapObject};
use crate::promise::Promise;
use crate::runtime::{VmId, VmRuntime};
use crate::stack::ValueStack;
use crate::symbol_registry::Symbol;
use crate::trace::StackTrace;
use crate::upvalue::{Upvalue, UpvalueState};
use crate::value::{HeapRef, Value};

/// Nested interpreter loops allowed on one thread
const MAX_NATIVE_DEPTH: usize = 200;

/// Why the dispatch loop stopped
pub(crate) enum Exit {
    /// The boundary frame returned
    Return(Value),
    /// A generator frame yielded
    Yield(Value),
    /// An async frame suspended on a pending promise
    Await(Arc<Promise>),
    /// A fragment frame ran off the end of its code
    Fragment,
}

/// The bytecode interpreter
pub struct Interpreter {
    id: VmId,
    runtime: Arc<VmRuntime>,
    stack: ValueStack,
    frames: FrameStack,
    native_frames: Vec<NativeFrame>,
    open_upvalues: BTreeMap<usize, Arc<Upvalue>>,
}

impl Interpreter {
    /// Create an interpreter sized by the runtime's configuration
    pub fn new(runtime: Arc<VmRuntime>) -> Self {
        Self::with_id(runtime, VmId::next())
    }

    pub(crate) fn with_id(runtime: Arc<VmRuntime>, id: VmId) -> Self {
        let config = runtime.config();
        let stack = ValueStack::new(config.initial_stack_bytes, config.max_stack_bytes);
        let frames = FrameStack::new(config.max_frames);
        Self {
            id,
            runtime,
            stack,
            frames,
            native_frames: Vec::new(),
            open_upvalues: BTreeMap::new(),
        }
    }

    /// This interpreter's identity
    #[inline]
    pub fn id(&self) -> VmId {
        self.id
    }

    /// The shared runtime
    #[inline]
    pub fn runtime(&self) -> &Arc<VmRuntime> {
        &self.runtime
    }

    /// Run a loaded function with no arguments
    pub fn execute(&mut self, function: &Arc<FunctionObject>) -> VmResult<Value> {
        self.invoke(&Value::Ref(HeapRef::Function(function.clone())), &[])
    }

    /// Call any callable value and wait for its result
    pub fn invoke(&mut self, callee: &Value, args: &[Value]) -> VmResult<Value> {
        self.invoke_with(callee, None, args)
    }

    /// Call a loaded function
    pub fn invoke_function(
        &mut self,
        function: &Arc<FunctionObject>,
        args: &[Value],
    ) -> VmResult<Value> {
        self.invoke(&Value::Ref(HeapRef::Function(function.clone())), args)
    }

    /// Call a closure
    pub fn invoke_closure(&mut self, closure: &Arc<Closure>, args: &[Value]) -> VmResult<Value> {
        self.invoke(&Value::Ref(HeapRef::Closure(closure.clone())), args)
    }

    /// Call the method `name` on `receiver`, resolving it without a cache
    pub fn invoke_method(&mut self, receiver: &Value, name: &str, args: &[Value]) -> VmResult<Value> {
        let name = Symbol::intern(name);
        let (method, bind) = self.resolve_method(receiver, name, None)?;
        self.invoke_with(&method, bind.then(|| receiver.clone()), args)
    }

    /// Call the method `name` on `receiver` through an inline cache
    pub fn invoke_method_cached(
        &mut self,
        receiver: &Value,
        name: Symbol,
        cache: &InlineCache,
        args: &[Value],
    ) -> VmResult<Value> {
        let (method, bind) = self.resolve_method(receiver, name, Some(cache))?;
        self.invoke_with(&method, bind.then(|| receiver.clone()), args)
    }

    pub(crate) fn invoke_with(
        &mut self,
        callee: &Value,
        receiver: Option<Value>,
        args: &[Value],
    ) -> VmResult<Value> {
        let base = self.stack.sp();
        self.stack.reserve(args.len() + 1)?;
        self.stack.push(callee.clone())?;
        for arg in args {
            self.stack.push(arg.clone())?;
        }

        let pushed = match self.call_with_receiver(callee.clone(), receiver, args.len(), true, false)
        {
            Ok(pushed) => pushed,
            Err(err) => {
                self.stack.truncate(base);
                return Err(err);
            }
        };
        if !pushed {
            let result = self.stack.pop()?;
            self.stack.truncate(base);
            return Ok(result);
        }

        match self.run()? {
            Exit::Return(value) => Ok(value),
            _ => Err(VmError::fatal("call suspended outside a coroutine")),
        }
    }

    /// Record a call that originates outside the dispatch loop
    pub fn push_native_frame(&mut self, name: impl Into<Arc<str>>) -> VmResult<()> {
        if self.native_frames.len() >= MAX_NATIVE_DEPTH {
            return Err(VmError::stack_overflow(format!(
                "native call depth exceeded {MAX_NATIVE_DEPTH}"
            )));
        }
        self.native_frames.push(NativeFrame {
            name: name.into(),
            depth: self.frames.len(),
        });
        Ok(())
    }

    /// Remove the innermost native frame
    pub fn pop_native_frame(&mut self) {
        self.native_frames.pop();
    }

    /// Run a code fragment over `values` and return the resulting operand stack
    ///
    /// The fragment stops when it runs off the end of its code. It may also
    /// `RETURN`, in which case the returned value is the only result.
    pub fn eval_stack(
        &mut self,
        function: &Arc<FunctionObject>,
        values: Vec<Value>,
    ) -> VmResult<Vec<Value>> {
        let base = self.stack.sp();
        self.stack.push(Value::Ref(HeapRef::Function(function.clone())))?;
        let fp = self.stack.sp();
        for value in values {
            self.stack.push(value)?;
        }

        let mut frame = CallFrame::new(function.clone(), fp);
        frame.local_count = 0;
        frame.fragment = true;
        frame.halt_on_return = true;
        if let Err(err) = self.frames.push(frame) {
            self.stack.truncate(base);
            return Err(err);
        }

        match self.run()? {
            Exit::Fragment => {
                self.frames.pop()?;
                self.close_upvalues(fp);
                let result = self.stack.drain_from(fp);
                self.stack.truncate(base);
                Ok(result)
            }
            Exit::Return(value) => Ok(vec![value]),
            _ => Err(VmError::fatal("fragment suspended")),
        }
    }

    /// Capture the current call stack, oldest call first
    pub fn stack_trace(&self) -> StackTrace {
        self.capture_trace()
    }

    /// Render an error that escaped to the top level
    ///
    /// Returns `None` for end-of-iteration signals, which are never reported.
    pub fn report_uncaught(&self, err: &VmError) -> Option<String> {
        match err {
            VmError::StopIteration => None,
            VmError::Uncaught(thrown) if thrown.is_stop_iteration() => None,
            VmError::Uncaught(thrown) => Some(thrown.render()),
            other => Some(other.to_string()),
        }
    }

    /// Frame pointers of the active call frames, outermost first
    pub fn frame_pointers(&self) -> Vec<usize> {
        self.frames.iter().map(|f| f.fp).collect()
    }

    /// Number of active call frames
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Times the value stack has been reallocated
    pub fn stack_growths(&self) -> u32 {
        self.stack.growths()
    }

    /// Current value-stack capacity in slots
    pub fn stack_capacity(&self) -> usize {
        self.stack.capacity()
    }

    fn dispatch(&mut self) -> VmResult<Exit> {
        loop {
            let frame = self.frames.current_mut()?;
            let function = frame.function.clone();
            let code = function.code.code.as_slice();
            let op_start = frame.ip;
            if op_start >= code.len() {
                if frame.fragment {
                    return Ok(Exit::Fragment);
                }
                return Err(VmError::fatal(format!(
                    "`{}` ran past the end of its code",
                    function.name
                )));
            }
            let byte = code[op_start];
            let op = Opcode::from_byte(byte).ok_or(BytecodeError::InvalidOpcode(byte))?;
            frame.op_start = op_start;
            frame.ip = op_start + op.width();
            let fp = frame.fp;
            let at = op_start + 1;

            match op {
                Opcode::Nop => {}
                Opcode::Return => {
                    let value = self.stack.pop()?;
                    if let Some(exit) = self.return_value(value)? {
                        return Ok(exit);
                    }
                }
                Opcode::ReturnNil => {
                    if let Some(exit) = self.return_value(Value::Nil)? {
                        return Ok(exit);
                    }
                }

                Opcode::Nil => self.stack.push(Value::Nil)?,
                Opcode::True => self.stack.push(Value::Bool(true))?,
                Opcode::False => self.stack.push(Value::Bool(false))?,
                Opcode::Int8 => self.stack.push(Value::Int(read_u8(code, at)? as i8 as i64))?,
                Opcode::Const => self.stack.push(function.constant(read_u8(code, at)? as u32)?)?,
                Opcode::Const16 => {
                    self.stack.push(function.constant(read_u16(code, at)? as u32)?)?
                }
                Opcode::Const32 => self.stack.push(function.constant(read_u32(code, at)?)?)?,

                Opcode::Pop => {
                    self.stack.pop()?;
                }
                Opcode::Dup => {
                    let top = self.stack.peek(0)?.clone();
                    self.stack.push(top)?;
                }
                Opcode::Swap => {
                    let b = self.stack.pop()?;
                    let a = self.stack.pop()?;
                    self.stack.push(b)?;
                    self.stack.push(a)?;
                }

                Opcode::GetLocal => {
                    let slot = fp + read_u16(code, at)? as usize;
                    let value = self.stack.get(slot)?.clone();
                    self.stack.push(value)?;
                }
                Opcode::SetLocal => {
                    let slot = fp + read_u16(code, at)? as usize;
                    let value = self.stack.pop()?;
                    self.stack.set(slot, value)?;
                }
                Opcode::GetUpvalue => {
                    let upvalue = self.upvalue(read_u8(code, at)?)?;
                    let value = self.read_upvalue(&upvalue)?;
                    self.stack.push(value)?;
                }
                Opcode::SetUpvalue => {
                    let upvalue = self.upvalue(read_u8(code, at)?)?;
                    let value = self.stack.pop()?;
                    self.write_upvalue(&upvalue, value)?;
                }
                Opcode::CloseUpvalue => {
                    let top = self
                        .stack
                        .sp()
                        .checked_sub(1)
                        .ok_or_else(|| VmError::fatal("value stack underflow"))?;
                    self.close_upvalues(top);
                    self.stack.pop()?;
                }
                Opcode::CloseUpvalues => {
                    self.close_upvalues(fp + read_u16(code, at)? as usize);
                }
                Opcode::GetGlobal => {
                    let name = function.name_constant(read_u16(code, at)? as u32)?;
                    let value = self
                        .runtime
                        .global(name)
                        .ok_or_else(|| VmError::argument(format!("undefined variable `{name}`")))?;
                    self.stack.push(value)?;
                }
                Opcode::SetGlobal => {
                    let name = function.name_constant(read_u16(code, at)? as u32)?;
                    let value = self.stack.pop()?;
                    self.runtime.store_global(name, value);
                }
                Opcode::SelfValue => {
                    let receiver = self.frames.current()?.receiver.clone();
                    self.stack.push(receiver)?;
                }

                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::Eq
                | Opcode::Ne
                | Opcode::Lt
                | Opcode::Le
                | Opcode::Gt
                | Opcode::Ge => {
                    let b = self.stack.pop()?;
                    let a = self.stack.pop()?;
                    let result = self.binary_op(op, a, b)?;
                    self.stack.push(result)?;
                }
                Opcode::AddInt
                | Opcode::SubInt
                | Opcode::MulInt
                | Opcode::LtInt
                | Opcode::LeInt
                | Opcode::EqInt
                | Opcode::AddFloat
                | Opcode::SubFloat
                | Opcode::MulFloat
                | Opcode::DivFloat
                | Opcode::LtFloat => {
                    let b = self.stack.pop()?;
                    let a = self.stack.pop()?;
                    let result = match arith::fast_path(op, &a, &b) {
                        Some(value) => value,
                        None => self.binary_op(arith::generic_of(op), a, b)?,
                    };
                    self.stack.push(result)?;
                }
                Opcode::Neg => {
                    let a = self.stack.pop()?;
                    let result = self.negate(a)?;
                    self.stack.push(result)?;
                }
                Opcode::Not => {
                    let a = self.stack.pop()?;
                    self.stack.push(Value::Bool(!a.is_truthy()))?;
                }

                Opcode::Jump => {
                    let offset = read_u16(code, at)? as usize;
                    self.frames.current_mut()?.ip += offset;
                }
                Opcode::JumpIfFalse => {
                    let offset = read_u16(code, at)? as usize;
                    if !self.stack.pop()?.is_truthy() {
                        self.frames.current_mut()?.ip += offset;
                    }
                }
                Opcode::JumpIfTrue => {
                    let offset = read_u16(code, at)? as usize;
                    if self.stack.pop()?.is_truthy() {
                        self.frames.current_mut()?.ip += offset;
                    }
                }
                Opcode::Loop => {
                    let offset = read_u16(code, at)? as usize;
                    let frame = self.frames.current_mut()?;
                    frame.ip = frame
                        .ip
                        .checked_sub(offset)
                        .ok_or(BytecodeError::InvalidOperand(op_start))?;
                }
                Opcode::Leave => {
                    let offset = read_i16(code, at)? as i64;
                    let exits = read_u8(code, at + 2)?;
                    let target = usize::try_from((op_start + op.width()) as i64 + offset)
                        .map_err(|_| BytecodeError::InvalidOperand(op_start))?;
                    self.leave(target, exits)?;
                }

                Opcode::Call => {
                    let argc = read_u8(code, at)? as usize;
                    self.call_value(argc, false)?;
                }
                Opcode::TailCall => {
                    let argc = read_u8(code, at)? as usize;
                    self.tail_call(argc)?;
                }
                Opcode::Invoke => {
                    let name = function.name_constant(read_u16(code, at)? as u32)?;
                    let argc = read_u8(code, at + 2)? as usize;
                    let slot = read_u16(code, at + 3)? as usize;
                    let cache = function
                        .caches
                        .get(slot)
                        .ok_or(BytecodeError::InvalidOperand(op_start))?;
                    self.invoke_op(name, argc, cache)?;
                }
                Opcode::Closure => {
                    let closure = self.make_closure(&function, read_u16(code, at)? as u32, fp)?;
                    self.stack.push(closure)?;
                }

                Opcode::Class => {
                    let name = function.name_constant(read_u16(code, at)? as u32)?;
                    let class = Class::with_superclass(name.name(), &self.runtime.intrinsics().object);
                    self.stack.push(Value::Ref(HeapRef::Class(class)))?;
                }
                Opcode::Inherit => {
                    let superclass = self.stack.pop()?;
                    let class = expect_class(self.stack.peek(0)?)?;
                    let superclass = expect_class(&superclass)?;
                    class.set_superclass(superclass)?;
                }
                Opcode::Method => {
                    let name = function.name_constant(read_u16(code, at)? as u32)?;
                    let method = self.stack.pop()?;
                    expect_class(self.stack.peek(0)?)?.define_method(name, method);
                }
                Opcode::GetField => {
                    let name = function.name_constant(read_u16(code, at)? as u32)?;
                    let object = self.stack.pop()?;
                    let value = self.get_field(&object, name)?;
                    self.stack.push(value)?;
                }
                Opcode::SetField => {
                    let name = function.name_constant(read_u16(code, at)? as u32)?;
                    let value = self.stack.pop()?;
                    let object = self.stack.pop()?;
                    match object.as_instance() {
                        Some(instance) => instance.set_field(name, value),
                        None => {
                            return Err(VmError::argument(format!(
                                "cannot set field `{name}` on {}",
                                object.type_name()
                            )));
                        }
                    }
                }

                Opcode::Array => {
                    let count = read_u16(code, at)? as usize;
                    let start = self.operand_base(count)?;
                    let items: Vec<Value> = self.stack.drain_from(start);
                    self.stack.push(Value::array(items))?;
                }
                Opcode::Map => {
                    let count = read_u16(code, at)? as usize;
                    let start = self.operand_base(count * 2)?;
                    let items: Vec<Value> = self.stack.drain_from(start);
                    let map = MapObject::new();
                    for pair in items.chunks_exact(2) {
                        map.insert(&pair[0], pair[1].clone())?;
                    }
                    self.stack.push(Value::Ref(HeapRef::Map(Arc::new(map))))?;
                }
                Opcode::IndexGet => {
                    let index = self.stack.pop()?;
                    let object = self.stack.pop()?;
                    let value = index_get(&object, &index)?;
                    self.stack.push(value)?;
                }
                Opcode::IndexSet => {
                    let value = self.stack.pop()?;
                    let index = self.stack.pop()?;
                    let object = self.stack.pop()?;
                    index_set(&object, &index, value)?;
                }

                Opcode::GetIter => {
                    let value = self.stack.pop()?;
                    self.stack.push(make_iter(value)?)?;
                }
                Opcode::IterNext => {
                    let offset = read_u16(code, at)? as usize;
                    let iterator = self.stack.pop()?;
                    match self.iter_next(&iterator)? {
                        Some(value) => self.stack.push(value)?,
                        None => self.frames.current_mut()?.ip += offset,
                    }
                }

                Opcode::Throw => {
                    let value = self.stack.pop()?;
                    return Err(VmError::uncaught(value, Arc::new(self.capture_trace())));
                }
                Opcode::EndFinally => {
                    if let Some(exit) = self.end_finally()? {
                        return Ok(exit);
                    }
                }

                Opcode::Yield => {
                    let value = self.stack.pop()?;
                    return self.yield_value(value);
                }
                Opcode::Await => {
                    let value = self.stack.pop()?;
                    if let Some(exit) = self.await_value(value)? {
                        return Ok(exit);
                    }
                }

                Opcode::Spawn => {
                    let argc = read_u8(code, at)? as usize;
                    self.spawn(argc)?;
                }
            }
        }
    }

    /// Slot index of the first of the top `count` values
    #[inline]
    fn operand_base(&self, count: usize) -> VmResult<usize> {
        self.stack
            .sp()
            .checked_sub(count)
            .ok_or_else(|| VmError::fatal("value stack underflow"))
    }

    fn upvalue(&self, index: u8) -> VmResult<Arc<Upvalue>> {
        self.frames
            .current()?
            .closure
            .as_ref()
            .and_then(|c| c.upvalues.get(index as usize))
            .cloned()
            .ok_or_else(|| VmError::fatal(format!("upvalue {index} out of range")))
    }

    fn read_upvalue(&self, upvalue: &Upvalue) -> VmResult<Value> {
        match upvalue.state() {
            UpvalueState::Open { vm, slot } if vm == self.id => Ok(self.stack.get(slot)?.clone()),
            UpvalueState::Open { .. } => Err(self.cross_thread_error()),
            UpvalueState::Parked(value) | UpvalueState::Closed(value) => Ok(value),
        }
    }

    fn write_upvalue(&mut self, upvalue: &Upvalue, value: Value) -> VmResult<()> {
        match upvalue.store(value.clone()) {
            Some((vm, slot)) if vm == self.id => self.stack.set(slot, value),
            Some(_) => Err(self.cross_thread_error()),
            None => Ok(()),
        }
    }

    fn cross_thread_error(&self) -> VmError {
        let function = self
            .frames
            .current()
            .map(|f| f.function.name.to_string())
            .unwrap_or_default();
        VmError::CrossThreadClosure { function }
    }

    /// Find or create the open upvalue for `slot`
    fn capture_upvalue(&mut self, slot: usize) -> Arc<Upvalue> {
        let id = self.id;
        self.open_upvalues
            .entry(slot)
            .or_insert_with(|| Arc::new(Upvalue::open(id, slot)))
            .clone()
    }

    /// Close every open upvalue at or above `from`
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        let closing = self.open_upvalues.split_off(&from);
        for (slot, upvalue) in closing {
            let value = self.stack.get(slot).cloned().unwrap_or(Value::Nil);
            upvalue.close(value);
        }
    }

    fn make_closure(
        &mut self,
        function: &FunctionObject,
        index: u32,
        fp: usize,
    ) -> VmResult<Value> {
        let Value::Ref(HeapRef::Function(target)) = function.constant(index)? else {
            return Err(VmError::fatal(format!("constant {index} is not a function")));
        };
        let frame = self.frames.current()?;
        let enclosing = frame.closure.clone();
        let receiver = frame.receiver.clone();

        let upvalues = target
            .code
            .upvalues
            .iter()
            .map(|capture| match capture {
                UpvalueCapture::Local(local) => Ok(self.capture_upvalue(fp + local.0 as usize)),
                UpvalueCapture::Upvalue(index) => enclosing
                    .as_ref()
                    .and_then(|c| c.upvalues.get(index.0 as usize))
                    .cloned()
                    .ok_or_else(|| VmError::fatal(format!("upvalue {} out of range", index.0))),
            })
            .collect::<VmResult<Vec<_>>>()?;

        Ok(Value::Ref(HeapRef::Closure(Arc::new(Closure {
            function: target,
            upvalues: upvalues.into_boxed_slice(),
            receiver,
            owner: self.id,
        }))))
    }

    /// Look up `name` on `receiver`; the flag says whether to bind the receiver
    fn resolve_method(
        &self,
        receiver: &Value,
        name: Symbol,
        cache: Option<&InlineCache>,
    ) -> VmResult<(Value, bool)> {
        if let Some(field) = receiver.as_instance().and_then(|i| i.field(name)) {
            return Ok((field, false));
        }
        let class = self.runtime.intrinsics().class_of(receiver);
        let method = match cache {
            Some(cache) => cache.lookup(&class, name),
            None => class.find_method(name),
        };
        method
            .map(|m| (m, true))
            .ok_or_else(|| undefined_method(&class, name))
    }

    fn get_field(&self, object: &Value, name: Symbol) -> VmResult<Value> {
        if let Some(field) = object.as_instance().and_then(|i| i.field(name)) {
            return Ok(field);
        }
        let class = self.runtime.intrinsics().class_of(object);
        match class.find_method(name) {
            Some(method) => Ok(Value::Ref(HeapRef::BoundMethod(Arc::new(BoundMethod {
                receiver: object.clone(),
                method,
            })))),
            None => Err(VmError::argument(format!(
                "undefined field `{name}` on {}",
                class.name
            ))),
        }
    }
}

fn undefined_method(class: &Class, name: Symbol) -> VmError {
    VmError::argument(format!("undefined method `{name}` for {}", class.name))
}

fn expect_class(value: &Value) -> VmResult<Arc<Class>> {
    value.as_class().cloned().ok_or_else(|| {
        VmError::argument(format!("expected a class, got {}", value.type_name()))
    })
}

fn index_get(object: &Value, index: &Value) -> VmResult<Value> {
    match object {
        Value::Ref(HeapRef::Array(array)) => array.get(int_index(index)?),
        Value::Ref(HeapRef::Map(map)) => Ok(map.get(index)?.unwrap_or(Value::Nil)),
        Value::Ref(HeapRef::String(s)) => {
            let i = int_index(index)?;
            let len = s.chars().count() as i64;
            let at = if i < 0 { i + len } else { i };
            s.chars()
                .nth(usize::try_from(at).unwrap_or(usize::MAX))
                .map(|c| Value::string(c.to_string()))
                .ok_or_else(|| {
                    VmError::range(format!("index {i} out of range for string of length {len}"))
                })
        }
        other => Err(VmError::argument(format!(
            "value of type {} is not indexable",
            other.type_name()
        ))),
    }
}

fn index_set(object: &Value, index: &Value, value: Value) -> VmResult<()> {
    match object {
        Value::Ref(HeapRef::Array(array)) => array.set(int_index(index)?, value),
        Value::Ref(HeapRef::Map(map)) => map.insert(index, value),
        other => Err(VmError::argument(format!(
            "value of type {} does not support index assignment",
            other.type_name()
        ))),
    }
}

fn int_index(index: &Value) -> VmResult<i64> {
    index.as_int().ok_or_else(|| {
        VmError::argument(format!("index must be an Int, got {}", index.type_name()))
    })
}

fn make_iter(value: Value) -> VmResult<Value> {
    let iterator = match &value {
        Value::Ref(HeapRef::Array(array)) => IteratorObject::over_array(array.clone()),
        Value::Ref(HeapRef::Map(map)) => IteratorObject::over_items(map.keys()),
        Value::Ref(HeapRef::String(s)) => {
            IteratorObject::over_items(s.chars().map(|c| Value::string(c.to_string())).collect())
        }
        Value::Ref(HeapRef::Iterator(_) | HeapRef::Generator(_) | HeapRef::Channel(_)) => {
            return Ok(value);
        }
        other => {
            return Err(VmError::argument(format!(
                "value of type {} is not iterable",
                other.type_name()
            )));
        }
    };
    Ok(Value::Ref(HeapRef::Iterator(Arc::new(iterator))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use kestrel_bytecode::Function;

    fn interpreter() -> Interpreter {
        VmRuntime::with_config(RuntimeConfig::new()).interpreter()
    }

    #[test]
    fn test_native_depth_limit() {
        let mut vm = interpreter();
        for i in 0..MAX_NATIVE_DEPTH {
            vm.push_native_frame(format!("native{i}")).unwrap();
        }
        let err = vm.push_native_frame("one_too_many").unwrap_err();
        assert!(matches!(err, VmError::StackOverflow(_)));

        vm.pop_native_frame();
        assert!(vm.push_native_frame("fits_again").is_ok());
    }

    #[test]
    fn test_native_frames_appear_in_traces() {
        let mut vm = interpreter();
        vm.push_native_frame("host").unwrap();
        let trace = vm.stack_trace();
        assert_eq!(trace.len(), 1);
        assert_eq!(trace.frames[0].file, None);
        assert_eq!(&*trace.frames[0].function, "host");
    }

    #[test]
    fn test_eval_stack_restores_stack() {
        let runtime = VmRuntime::with_config(RuntimeConfig::new());
        let mut b = Function::builder().name("fragment");
        b.op(Opcode::Mul);
        let function = runtime.load(b.build().unwrap()).unwrap();

        let mut vm = runtime.interpreter();
        let result = vm
            .eval_stack(&function, vec![Value::Int(6), Value::Int(7)])
            .unwrap();
        assert_eq!(result, vec![Value::Int(42)]);
        assert_eq!(vm.stack.sp(), 0);
        assert_eq!(vm.depth(), 0);
    }

    #[test]
    fn test_index_get_negative_and_strings() {
        let array = Value::array(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(index_get(&array, &Value::Int(-1)).unwrap(), Value::Int(2));
        let s = Value::string("héllo");
        assert_eq!(index_get(&s, &Value::Int(1)).unwrap(), Value::string("é"));
        assert!(matches!(index_get(&s, &Value::Int(9)), Err(VmError::Range(_))));
        assert!(matches!(index_get(&Value::Nil, &Value::Int(0)), Err(VmError::Argument(_))));
    }
}
