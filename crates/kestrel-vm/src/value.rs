//! Runtime values
//!
//! A [`Value`] is either an inline scalar or a reference to a shared heap
//! object. Heap objects are reference counted and `Send + Sync`, so values move
//! freely between VM instances running on different threads.

use std::sync::Arc;

use crate::error::{VmError, VmResult};
use crate::function::{Closure, FunctionObject};
use crate::generator::Generator;
use crate::object::{
    Array, BoundMethod, Class, ErrorObject, Instance, IteratorObject, MapObject, NativeFunction,
};
use crate::promise::Promise;
use crate::symbol_registry::Symbol;
use crate::sync::{Channel, ThreadHandle, VmMutex, WaitGroup};
use crate::trace::StackTrace;

/// A VM value
#[derive(Clone, Default)]
pub enum Value {
    /// Sentinel for empty stack slots; never observable by interpreted code
    #[default]
    Undefined,
    /// Absent value
    Nil,
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// Unsigned byte
    Byte(u8),
    /// Interned symbol
    Symbol(Symbol),
    /// Heap object
    Ref(HeapRef),
}

/// Reference to a heap object
#[derive(Clone)]
pub enum HeapRef {
    /// Immutable string
    String(Arc<str>),
    /// Growable array
    Array(Arc<Array>),
    /// Insertion-ordered hash map
    Map(Arc<MapObject>),
    /// Bytecode function without captures
    Function(Arc<FunctionObject>),
    /// Bytecode function with captures
    Closure(Arc<Closure>),
    /// Host function
    Native(Arc<NativeFunction>),
    /// Method bound to its receiver
    BoundMethod(Arc<BoundMethod>),
    /// Class
    Class(Arc<Class>),
    /// Class instance
    Instance(Arc<Instance>),
    /// Error object
    Error(Arc<ErrorObject>),
    /// Captured stack trace
    Trace(Arc<StackTrace>),
    /// Iterator over a built-in collection
    Iterator(Arc<IteratorObject>),
    /// Generator
    Generator(Arc<Generator>),
    /// Promise
    Promise(Arc<Promise>),
    /// Mutex for interpreted code
    Mutex(Arc<VmMutex>),
    /// Wait group for interpreted code
    WaitGroup(Arc<WaitGroup>),
    /// Bounded channel for interpreted code
    Channel(Arc<Channel>),
    /// Handle to a lightweight thread
    Thread(Arc<ThreadHandle>),
}

impl HeapRef {
    fn ptr(&self) -> *const () {
        match self {
            Self::String(s) => Arc::as_ptr(s) as *const u8 as *const (),
            Self::Array(a) => Arc::as_ptr(a) as *const (),
            Self::Map(m) => Arc::as_ptr(m) as *const (),
            Self::Function(f) => Arc::as_ptr(f) as *const (),
            Self::Closure(c) => Arc::as_ptr(c) as *const (),
            Self::Native(n) => Arc::as_ptr(n) as *const (),
            Self::BoundMethod(b) => Arc::as_ptr(b) as *const (),
            Self::Class(c) => Arc::as_ptr(c) as *const (),
            Self::Instance(i) => Arc::as_ptr(i) as *const (),
            Self::Error(e) => Arc::as_ptr(e) as *const (),
            Self::Trace(t) => Arc::as_ptr(t) as *const (),
            Self::Iterator(i) => Arc::as_ptr(i) as *const (),
            Self::Generator(g) => Arc::as_ptr(g) as *const (),
            Self::Promise(p) => Arc::as_ptr(p) as *const (),
            Self::Mutex(m) => Arc::as_ptr(m) as *const (),
            Self::WaitGroup(w) => Arc::as_ptr(w) as *const (),
            Self::Channel(c) => Arc::as_ptr(c) as *const (),
            Self::Thread(t) => Arc::as_ptr(t) as *const (),
        }
    }
}

impl Value {
    /// Create a string value
    pub fn string(s: impl AsRef<str>) -> Self {
        Self::Ref(HeapRef::String(Arc::from(s.as_ref())))
    }

    /// Create an array value
    pub fn array(items: Vec<Value>) -> Self {
        Self::Ref(HeapRef::Array(Arc::new(Array::new(items))))
    }

    /// Create a symbol value
    pub fn symbol(name: &str) -> Self {
        Self::Symbol(Symbol::intern(name))
    }

    /// Is this nil
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Is this the empty-slot sentinel
    #[inline]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// Truthiness: only nil and false are falsy
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Bool(false) | Self::Undefined)
    }

    /// Get as integer (bytes widen)
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Byte(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Get as string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Ref(HeapRef::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Get as array
    pub fn as_array(&self) -> Option<&Arc<Array>> {
        match self {
            Self::Ref(HeapRef::Array(a)) => Some(a),
            _ => None,
        }
    }

    /// Get as error object
    pub fn as_error(&self) -> Option<&Arc<ErrorObject>> {
        match self {
            Self::Ref(HeapRef::Error(e)) => Some(e),
            _ => None,
        }
    }

    /// Get as class
    pub fn as_class(&self) -> Option<&Arc<Class>> {
        match self {
            Self::Ref(HeapRef::Class(c)) => Some(c),
            _ => None,
        }
    }

    /// Get as instance
    pub fn as_instance(&self) -> Option<&Arc<Instance>> {
        match self {
            Self::Ref(HeapRef::Instance(i)) => Some(i),
            _ => None,
        }
    }

    /// Get as generator
    pub fn as_generator(&self) -> Option<&Arc<Generator>> {
        match self {
            Self::Ref(HeapRef::Generator(g)) => Some(g),
            _ => None,
        }
    }

    /// Get as promise
    pub fn as_promise(&self) -> Option<&Arc<Promise>> {
        match self {
            Self::Ref(HeapRef::Promise(p)) => Some(p),
            _ => None,
        }
    }

    /// Get as trace
    pub fn as_trace(&self) -> Option<&Arc<StackTrace>> {
        match self {
            Self::Ref(HeapRef::Trace(t)) => Some(t),
            _ => None,
        }
    }

    /// Can this value be called
    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Self::Ref(
                HeapRef::Function(_)
                    | HeapRef::Closure(_)
                    | HeapRef::Native(_)
                    | HeapRef::BoundMethod(_)
                    | HeapRef::Class(_)
            )
        )
    }

    /// Name of the value's kind, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "Undefined",
            Self::Nil => "Nil",
            Self::Bool(_) => "Bool",
            Self::Int(_) => "Int",
            Self::Float(_) => "Float",
            Self::Byte(_) => "Byte",
            Self::Symbol(_) => "Symbol",
            Self::Ref(r) => match r {
                HeapRef::String(_) => "String",
                HeapRef::Array(_) => "Array",
                HeapRef::Map(_) => "Map",
                HeapRef::Function(_)
                | HeapRef::Closure(_)
                | HeapRef::Native(_)
                | HeapRef::BoundMethod(_) => "Function",
                HeapRef::Class(_) => "Class",
                HeapRef::Instance(_) => "Instance",
                HeapRef::Error(_) => "Error",
                HeapRef::Trace(_) => "Trace",
                HeapRef::Iterator(_) => "Iterator",
                HeapRef::Generator(_) => "Generator",
                HeapRef::Promise(_) => "Promise",
                HeapRef::Mutex(_) => "Mutex",
                HeapRef::WaitGroup(_) => "WaitGroup",
                HeapRef::Channel(_) => "Channel",
                HeapRef::Thread(_) => "Thread",
            },
        }
    }

    /// Key used to place this value in a map
    ///
    /// Integral floats hash like the equal integer. Mutable containers and
    /// objects are unhashable.
    pub fn hash_key(&self) -> VmResult<MapKey> {
        let key = match self {
            Self::Nil => MapKey::Nil,
            Self::Bool(b) => MapKey::Bool(*b),
            Self::Int(i) => MapKey::Int(*i),
            Self::Byte(b) => MapKey::Int(*b as i64),
            Self::Float(f) => match exact_int(*f) {
                Some(i) => MapKey::Int(i),
                None => MapKey::Float(f.to_bits()),
            },
            Self::Symbol(s) => MapKey::Symbol(*s),
            Self::Ref(HeapRef::String(s)) => MapKey::String(s.clone()),
            other => {
                return Err(VmError::argument(format!(
                    "unhashable type: {}",
                    other.type_name()
                )));
            }
        };
        Ok(key)
    }
}

/// The integer a float represents exactly, if any
///
/// `i64::MIN as f64` is exactly -2^63 and `i64::MAX as f64` rounds up to 2^63,
/// so the range check is half-open.
pub(crate) fn exact_int(f: f64) -> Option<i64> {
    (f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64).then_some(f as i64)
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Nil, Self::Nil) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => a == b,
            (Self::Int(_) | Self::Byte(_), Self::Int(_) | Self::Byte(_)) => {
                self.as_int() == other.as_int()
            }
            (Self::Int(_) | Self::Byte(_), Self::Float(f))
            | (Self::Float(f), Self::Int(_) | Self::Byte(_)) => {
                let i = self.as_int().or(other.as_int());
                i.is_some() && exact_int(*f) == i
            }
            (Self::Ref(HeapRef::String(a)), Self::Ref(HeapRef::String(b))) => a == b,
            (Self::Ref(a), Self::Ref(b)) => std::ptr::eq(a.ptr(), b.ptr()),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}

impl From<HeapRef> for Value {
    fn from(r: HeapRef) -> Self {
        Self::Ref(r)
    }
}

/// Hashable projection of a value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    /// nil
    Nil,
    /// Boolean
    Bool(bool),
    /// Integer (also integral floats and bytes)
    Int(i64),
    /// Non-integral float, by bit pattern
    Float(u64),
    /// Symbol
    Symbol(Symbol),
    /// String contents
    String(Arc<str>),
}

impl MapKey {
    /// Convert back to a value
    pub fn to_value(&self) -> Value {
        match self {
            Self::Nil => Value::Nil,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Int(*i),
            Self::Float(bits) => Value::Float(f64::from_bits(*bits)),
            Self::Symbol(s) => Value::Symbol(*s),
            Self::String(s) => Value::Ref(HeapRef::String(s.clone())),
        }
    }
}
