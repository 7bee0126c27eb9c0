//! Built-in classes
//!
//! Every value has a class. Instances and error objects carry theirs; the
//! other kinds map to one of the classes created here. The native methods are
//! the minimum needed to drive method dispatch, coroutines and the
//! concurrency primitives from interpreted code.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{VmError, VmResult};
use crate::generator::Resume;
use crate::interpreter::Interpreter;
use crate::object::{Class, ErrorObject, NativeFunction};
use crate::symbol_registry::Symbol;
use crate::sync::{Channel, VmMutex, WaitGroup};
use crate::value::{HeapRef, Value};

/// Extract the receiver's payload or fail with an argument error
macro_rules! receiver {
    ($value:expr, $variant:ident) => {
        match $value {
            Value::Ref(HeapRef::$variant(inner)) => inner,
            other => {
                return Err(VmError::argument(format!(
                    concat!("expected ", stringify!($variant), " receiver, got {}"),
                    other.type_name()
                )));
            }
        }
    };
}

fn native<F>(name: &str, min: usize, max: Option<usize>, func: F) -> Value
where
    F: Fn(&mut Interpreter, &Value, &[Value]) -> VmResult<Value> + Send + Sync + 'static,
{
    Value::Ref(HeapRef::Native(Arc::new(NativeFunction::new(
        name, min, max, func,
    ))))
}

fn define<F>(class: &Class, name: &str, min: usize, max: Option<usize>, func: F)
where
    F: Fn(&mut Interpreter, &Value, &[Value]) -> VmResult<Value> + Send + Sync + 'static,
{
    class.define_method(Symbol::intern(name), native(name, min, max, func));
}

fn int_arg(args: &[Value], index: usize, default: i64) -> VmResult<i64> {
    match args.get(index) {
        None => Ok(default),
        Some(value) => value.as_int().ok_or_else(|| {
            VmError::argument(format!("expected an Int argument, got {}", value.type_name()))
        }),
    }
}

/// The built-in class hierarchy
pub struct Intrinsics {
    /// Root of every class chain
    pub object: Arc<Class>,
    /// Class of nil
    pub nil: Arc<Class>,
    /// Class of booleans
    pub bool: Arc<Class>,
    /// Class of integers
    pub int: Arc<Class>,
    /// Class of floats
    pub float: Arc<Class>,
    /// Class of bytes
    pub byte: Arc<Class>,
    /// Class of symbols
    pub symbol: Arc<Class>,
    /// Class of strings
    pub string: Arc<Class>,
    /// Class of arrays
    pub array: Arc<Class>,
    /// Class of maps
    pub map: Arc<Class>,
    /// Class of functions, closures, natives and bound methods
    pub function: Arc<Class>,
    /// Class of classes
    pub class: Arc<Class>,
    /// Base error class
    pub error: Arc<Class>,
    /// Wrong arity or operand type
    pub argument_error: Arc<Class>,
    /// Out-of-range index, size or divisor
    pub range_error: Arc<Class>,
    /// End of iteration
    pub stop_iteration: Arc<Class>,
    /// Closure called from a foreign thread
    pub cross_thread_error: Arc<Class>,
    /// Class of captured stack traces
    pub trace: Arc<Class>,
    /// Class of collection iterators
    pub iterator: Arc<Class>,
    /// Class of generators
    pub generator: Arc<Class>,
    /// Class of promises
    pub promise: Arc<Class>,
    /// Class of mutexes
    pub mutex: Arc<Class>,
    /// Class of wait groups
    pub wait_group: Arc<Class>,
    /// Class of channels
    pub channel: Arc<Class>,
    /// Class of thread handles
    pub thread: Arc<Class>,
}

impl Intrinsics {
    /// Create the classes and install their native methods
    pub fn new() -> Self {
        let object = Class::new("Object");
        let sub = |name: &str| Class::with_superclass(name, &object);
        let error = sub("Error");
        let err_sub = |name: &str| Class::with_superclass(name, &error);

        let intrinsics = Self {
            nil: sub("Nil"),
            bool: sub("Bool"),
            int: sub("Int"),
            float: sub("Float"),
            byte: sub("Byte"),
            symbol: sub("Symbol"),
            string: sub("String"),
            array: sub("Array"),
            map: sub("Map"),
            function: sub("Function"),
            class: sub("Class"),
            argument_error: err_sub("ArgumentError"),
            range_error: err_sub("RangeError"),
            stop_iteration: err_sub("StopIteration"),
            cross_thread_error: err_sub("CrossThreadError"),
            trace: sub("Trace"),
            iterator: sub("Iterator"),
            generator: sub("Generator"),
            promise: sub("Promise"),
            mutex: sub("Mutex"),
            wait_group: sub("WaitGroup"),
            channel: sub("Channel"),
            thread: sub("Thread"),
            error,
            object,
        };
        intrinsics.define_methods();
        intrinsics
    }

    fn define_methods(&self) {
        define(&self.object, "to_s", 0, Some(0), |_, this, _| {
            Ok(Value::string(this.to_string()))
        });
        define(&self.object, "class", 0, Some(0), |vm, this, _| {
            let class = vm.runtime().intrinsics().class_of(this);
            Ok(Value::Ref(HeapRef::Class(class)))
        });

        define(&self.array, "len", 0, Some(0), |_, this, _| {
            Ok(Value::Int(receiver!(this, Array).len() as i64))
        });
        define(&self.array, "push", 1, Some(1), |_, this, args| {
            receiver!(this, Array).push(args[0].clone());
            Ok(Value::Nil)
        });
        define(&self.array, "pop", 0, Some(0), |_, this, _| {
            receiver!(this, Array)
                .pop()
                .ok_or_else(|| VmError::range("pop from empty array"))
        });

        define(&self.string, "len", 0, Some(0), |_, this, _| {
            Ok(Value::Int(receiver!(this, String).chars().count() as i64))
        });

        define(&self.map, "len", 0, Some(0), |_, this, _| {
            Ok(Value::Int(receiver!(this, Map).len() as i64))
        });
        define(&self.map, "get", 1, Some(1), |_, this, args| {
            Ok(receiver!(this, Map).get(&args[0])?.unwrap_or(Value::Nil))
        });
        define(&self.map, "set", 2, Some(2), |_, this, args| {
            receiver!(this, Map).insert(&args[0], args[1].clone())?;
            Ok(Value::Nil)
        });

        define(&self.generator, "next", 0, Some(1), |vm, this, args| {
            let generator = receiver!(this, Generator);
            let sent = args.first().cloned().unwrap_or(Value::Nil);
            vm.resume_generator(generator, Resume::Next(sent))
        });

        define(&self.promise, "resolved", 0, Some(0), |_, this, _| {
            Ok(Value::Bool(receiver!(this, Promise).is_resolved()))
        });

        define(&self.mutex, "lock", 0, Some(0), |vm, this, _| {
            receiver!(this, Mutex).lock(vm.id())?;
            Ok(Value::Nil)
        });
        define(&self.mutex, "unlock", 0, Some(0), |vm, this, _| {
            receiver!(this, Mutex).unlock(vm.id())?;
            Ok(Value::Nil)
        });

        define(&self.wait_group, "add", 0, Some(1), |_, this, args| {
            receiver!(this, WaitGroup).add(int_arg(args, 0, 1)?)?;
            Ok(Value::Nil)
        });
        define(&self.wait_group, "done", 0, Some(0), |_, this, _| {
            receiver!(this, WaitGroup).done()?;
            Ok(Value::Nil)
        });
        define(&self.wait_group, "wait", 0, Some(0), |_, this, _| {
            receiver!(this, WaitGroup).wait();
            Ok(Value::Nil)
        });

        define(&self.channel, "send", 1, Some(1), |_, this, args| {
            receiver!(this, Channel).send(args[0].clone())?;
            Ok(Value::Nil)
        });
        define(&self.channel, "recv", 0, Some(0), |_, this, _| {
            Ok(receiver!(this, Channel).recv().unwrap_or(Value::Nil))
        });
        define(&self.channel, "close", 0, Some(0), |_, this, _| {
            receiver!(this, Channel).close();
            Ok(Value::Nil)
        });
        define(&self.channel, "len", 0, Some(0), |_, this, _| {
            Ok(Value::Int(receiver!(this, Channel).len() as i64))
        });

        define(&self.thread, "join", 0, Some(0), |_, this, _| {
            Ok(receiver!(this, Thread).join())
        });

        define(&self.error, "message", 0, Some(0), |_, this, _| {
            Ok(Value::string(&receiver!(this, Error).message))
        });
        define(&self.trace, "render", 0, Some(0), |_, this, _| {
            Ok(Value::string(receiver!(this, Trace).render()))
        });

        // Called with the class value as receiver, so subclasses construct
        // objects of their own class
        self.error.set_constructor(native("Error", 0, Some(1), |_, this, args| {
            let class = receiver!(this, Class).clone();
            let message = args.first().map(Value::to_string).unwrap_or_default();
            Ok(Value::Ref(HeapRef::Error(Arc::new(ErrorObject {
                class,
                message,
            }))))
        }));
        self.mutex.set_constructor(native("Mutex", 0, Some(0), |_, _, _| {
            Ok(Value::Ref(HeapRef::Mutex(Arc::new(VmMutex::new()))))
        }));
        self.wait_group
            .set_constructor(native("WaitGroup", 0, Some(0), |_, _, _| {
                Ok(Value::Ref(HeapRef::WaitGroup(Arc::new(WaitGroup::new()))))
            }));
        self.channel
            .set_constructor(native("Channel", 0, Some(1), |_, _, args| {
                let capacity = int_arg(args, 0, 0)?;
                let capacity = usize::try_from(capacity).map_err(|_| {
                    VmError::range(format!("channel capacity must not be negative, got {capacity}"))
                })?;
                Ok(Value::Ref(HeapRef::Channel(Arc::new(Channel::new(capacity)))))
            }));
    }

    fn all(&self) -> [&Arc<Class>; 25] {
        [
            &self.object,
            &self.nil,
            &self.bool,
            &self.int,
            &self.float,
            &self.byte,
            &self.symbol,
            &self.string,
            &self.array,
            &self.map,
            &self.function,
            &self.class,
            &self.error,
            &self.argument_error,
            &self.range_error,
            &self.stop_iteration,
            &self.cross_thread_error,
            &self.trace,
            &self.iterator,
            &self.generator,
            &self.promise,
            &self.mutex,
            &self.wait_group,
            &self.channel,
            &self.thread,
        ]
    }

    /// Bind every class to a global of the same name
    pub(crate) fn install_globals(&self, globals: &DashMap<Symbol, Value>) {
        for class in self.all() {
            globals.insert(
                Symbol::intern(&class.name),
                Value::Ref(HeapRef::Class(class.clone())),
            );
        }
    }

    /// Class used for method lookup on `value`
    pub fn class_of(&self, value: &Value) -> Arc<Class> {
        let class = match value {
            Value::Undefined | Value::Nil => &self.nil,
            Value::Bool(_) => &self.bool,
            Value::Int(_) => &self.int,
            Value::Float(_) => &self.float,
            Value::Byte(_) => &self.byte,
            Value::Symbol(_) => &self.symbol,
            Value::Ref(r) => match r {
                HeapRef::String(_) => &self.string,
                HeapRef::Array(_) => &self.array,
                HeapRef::Map(_) => &self.map,
                HeapRef::Function(_)
                | HeapRef::Closure(_)
                | HeapRef::Native(_)
                | HeapRef::BoundMethod(_) => &self.function,
                HeapRef::Class(_) => &self.class,
                HeapRef::Instance(instance) => return instance.class.clone(),
                HeapRef::Error(error) => return error.class.clone(),
                HeapRef::Trace(_) => &self.trace,
                HeapRef::Iterator(_) => &self.iterator,
                HeapRef::Generator(_) => &self.generator,
                HeapRef::Promise(_) => &self.promise,
                HeapRef::Mutex(_) => &self.mutex,
                HeapRef::WaitGroup(_) => &self.wait_group,
                HeapRef::Channel(_) => &self.channel,
                HeapRef::Thread(_) => &self.thread,
            },
        };
        class.clone()
    }

    /// Error class interpreted code sees for `err`
    pub fn error_class_for(&self, err: &VmError) -> Arc<Class> {
        let class = match err {
            VmError::Argument(_) => &self.argument_error,
            VmError::Range(_) => &self.range_error,
            VmError::StopIteration => &self.stop_iteration,
            VmError::CrossThreadClosure { .. } => &self.cross_thread_error,
            VmError::Uncaught(thrown) => {
                return thrown
                    .value
                    .as_error()
                    .map_or_else(|| self.error.clone(), |e| e.class.clone());
            }
            VmError::StackOverflow(_) | VmError::Fatal(_) | VmError::Bytecode(_) => &self.error,
        };
        class.clone()
    }
}

impl Default for Intrinsics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Instance;

    #[test]
    fn test_class_of() {
        let intrinsics = Intrinsics::new();
        assert_eq!(&*intrinsics.class_of(&Value::Int(1)).name, "Int");
        assert_eq!(&*intrinsics.class_of(&Value::string("s")).name, "String");
        assert_eq!(&*intrinsics.class_of(&Value::Nil).name, "Nil");

        let point = Class::with_superclass("Point", &intrinsics.object);
        let instance = Value::Ref(HeapRef::Instance(Arc::new(Instance::new(point.clone()))));
        assert_eq!(intrinsics.class_of(&instance).id, point.id);
    }

    #[test]
    fn test_error_hierarchy() {
        let intrinsics = Intrinsics::new();
        assert!(intrinsics.range_error.is_subclass_of(&intrinsics.error));
        assert!(intrinsics.error.is_subclass_of(&intrinsics.object));
        assert_eq!(
            &*intrinsics
                .error_class_for(&VmError::argument("bad"))
                .name,
            "ArgumentError"
        );
    }

    #[test]
    fn test_builtin_methods_resolve() {
        let intrinsics = Intrinsics::new();
        for (class, name) in [
            (&intrinsics.array, "push"),
            (&intrinsics.array, "to_s"),
            (&intrinsics.channel, "recv"),
            (&intrinsics.range_error, "message"),
        ] {
            assert!(class.find_method(Symbol::intern(name)).is_some(), "{name}");
        }
        assert!(intrinsics.argument_error.find_constructor().is_some());
    }
}
