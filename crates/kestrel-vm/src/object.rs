//! Heap objects: collections, classes, instances, errors and natives

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::cache::bump_method_epoch;
use crate::error::{VmError, VmResult};
use crate::interpreter::Interpreter;
use crate::symbol_registry::Symbol;
use crate::value::{MapKey, Value};

/// Growable array
pub struct Array {
    items: RwLock<Vec<Value>>,
}

impl Array {
    /// Create an array from its items
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items: RwLock::new(items),
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Is the array empty
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Append an element
    pub fn push(&self, value: Value) {
        self.items.write().push(value);
    }

    /// Remove and return the last element
    pub fn pop(&self) -> Option<Value> {
        self.items.write().pop()
    }

    fn resolve(&self, index: i64, len: usize) -> VmResult<usize> {
        let resolved = if index < 0 { index + len as i64 } else { index };
        if resolved < 0 || resolved >= len as i64 {
            return Err(VmError::range(format!(
                "index {index} out of range for array of length {len}"
            )));
        }
        Ok(resolved as usize)
    }

    /// Read an element; negative indices count from the end
    pub fn get(&self, index: i64) -> VmResult<Value> {
        let items = self.items.read();
        let at = self.resolve(index, items.len())?;
        Ok(items[at].clone())
    }

    /// Overwrite an element; negative indices count from the end
    pub fn set(&self, index: i64, value: Value) -> VmResult<()> {
        let mut items = self.items.write();
        let at = self.resolve(index, items.len())?;
        items[at] = value;
        Ok(())
    }

    /// Copy of the elements
    pub fn to_vec(&self) -> Vec<Value> {
        self.items.read().clone()
    }
}

/// Insertion-ordered map keyed by hashable values
#[derive(Default)]
pub struct MapObject {
    entries: RwLock<IndexMap<MapKey, Value>>,
}

impl MapObject {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Is the map empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Look up a key
    pub fn get(&self, key: &Value) -> VmResult<Option<Value>> {
        let key = key.hash_key()?;
        Ok(self.entries.read().get(&key).cloned())
    }

    /// Insert or replace an entry
    pub fn insert(&self, key: &Value, value: Value) -> VmResult<()> {
        let key = key.hash_key()?;
        self.entries.write().insert(key, value);
        Ok(())
    }

    /// Does the map contain `key`
    pub fn contains(&self, key: &Value) -> VmResult<bool> {
        let key = key.hash_key()?;
        Ok(self.entries.read().contains_key(&key))
    }

    /// Keys in insertion order
    pub fn keys(&self) -> Vec<Value> {
        self.entries.read().keys().map(MapKey::to_value).collect()
    }

    /// Entries in insertion order
    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.to_value(), v.clone()))
            .collect()
    }
}

static NEXT_CLASS_ID: AtomicU64 = AtomicU64::new(1);

/// A class: a named method table with an optional superclass
pub struct Class {
    /// Unique id, used as the inline-cache key
    pub id: u64,
    /// Class name
    pub name: Arc<str>,
    superclass: RwLock<Option<Arc<Class>>>,
    methods: RwLock<FxHashMap<Symbol, Value>>,
    constructor: RwLock<Option<Value>>,
}

impl Class {
    /// Create a class without methods
    pub fn new(name: impl Into<Arc<str>>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CLASS_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            superclass: RwLock::new(None),
            methods: RwLock::new(FxHashMap::default()),
            constructor: RwLock::new(None),
        })
    }

    /// Create a class inheriting from `superclass`
    pub fn with_superclass(name: impl Into<Arc<str>>, superclass: &Arc<Class>) -> Arc<Self> {
        let class = Self::new(name);
        *class.superclass.write() = Some(superclass.clone());
        class
    }

    /// The direct superclass
    pub fn superclass(&self) -> Option<Arc<Class>> {
        self.superclass.read().clone()
    }

    /// Replace the superclass
    pub fn set_superclass(&self, superclass: Arc<Class>) -> VmResult<()> {
        let mut ancestor = Some(superclass.clone());
        while let Some(class) = ancestor {
            if class.id == self.id {
                return Err(VmError::argument(format!(
                    "class `{}` cannot inherit from itself",
                    self.name
                )));
            }
            ancestor = class.superclass();
        }
        *self.superclass.write() = Some(superclass);
        bump_method_epoch();
        Ok(())
    }

    /// Define or redefine a method
    ///
    /// Invalidates every inline cache in the process.
    pub fn define_method(&self, name: Symbol, method: Value) {
        self.methods.write().insert(name, method);
        bump_method_epoch();
    }

    /// Install a host-side constructor used when the class is called
    pub fn set_constructor(&self, constructor: Value) {
        *self.constructor.write() = Some(constructor);
    }

    /// Resolve a method along the superclass chain
    pub fn find_method(&self, name: Symbol) -> Option<Value> {
        if let Some(method) = self.methods.read().get(&name) {
            return Some(method.clone());
        }
        let mut next = self.superclass();
        while let Some(class) = next {
            if let Some(method) = class.methods.read().get(&name) {
                return Some(method.clone());
            }
            next = class.superclass();
        }
        None
    }

    /// Resolve the host-side constructor along the superclass chain
    pub fn find_constructor(&self) -> Option<Value> {
        if let Some(ctor) = self.constructor.read().clone() {
            return Some(ctor);
        }
        let mut next = self.superclass();
        while let Some(class) = next {
            if let Some(ctor) = class.constructor.read().clone() {
                return Some(ctor);
            }
            next = class.superclass();
        }
        None
    }

    /// Is this class `other` or a subclass of it
    pub fn is_subclass_of(&self, other: &Class) -> bool {
        if self.id == other.id {
            return true;
        }
        let mut next = self.superclass();
        while let Some(class) = next {
            if class.id == other.id {
                return true;
            }
            next = class.superclass();
        }
        false
    }
}

/// Instance of a user class
pub struct Instance {
    /// The instance's class
    pub class: Arc<Class>,
    fields: RwLock<FxHashMap<Symbol, Value>>,
}

impl Instance {
    /// Create an instance with no fields
    pub fn new(class: Arc<Class>) -> Self {
        Self {
            class,
            fields: RwLock::new(FxHashMap::default()),
        }
    }

    /// Read a field
    pub fn field(&self, name: Symbol) -> Option<Value> {
        self.fields.read().get(&name).cloned()
    }

    /// Write a field
    pub fn set_field(&self, name: Symbol, value: Value) {
        self.fields.write().insert(name, value);
    }
}

/// Error object: a class plus a message
pub struct ErrorObject {
    /// Error class (`Error` or a subclass)
    pub class: Arc<Class>,
    /// Human-readable message
    pub message: String,
}

/// Host function signature: interpreter, receiver, arguments
pub type NativeFn =
    Arc<dyn Fn(&mut Interpreter, &Value, &[Value]) -> VmResult<Value> + Send + Sync>;

/// Function implemented by the host
pub struct NativeFunction {
    /// Name shown in traces
    pub name: Arc<str>,
    /// Minimum argument count
    pub min_args: usize,
    /// Maximum argument count (`None` for unbounded)
    pub max_args: Option<usize>,
    /// Implementation
    pub func: NativeFn,
}

impl NativeFunction {
    /// Create a native function
    pub fn new<F>(name: &str, min_args: usize, max_args: Option<usize>, func: F) -> Self
    where
        F: Fn(&mut Interpreter, &Value, &[Value]) -> VmResult<Value> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            min_args,
            max_args,
            func: Arc::new(func),
        }
    }

    /// Validate an argument count
    pub fn check_arity(&self, argc: usize) -> VmResult<()> {
        let too_many = self.max_args.is_some_and(|max| argc > max);
        if argc < self.min_args || too_many {
            let expected = match self.max_args {
                Some(max) if max == self.min_args => format!("{max}"),
                Some(max) => format!("{}..{max}", self.min_args),
                None => format!("at least {}", self.min_args),
            };
            return Err(VmError::argument(format!(
                "`{}` expected {expected} arguments but got {argc}",
                self.name
            )));
        }
        Ok(())
    }
}

/// Method bound to a receiver, produced by reading a method as a field
pub struct BoundMethod {
    /// Receiver passed as `self`
    pub receiver: Value,
    /// Closure, function or native
    pub method: Value,
}

/// Iteration state over a built-in collection
pub struct IteratorObject {
    state: Mutex<IterState>,
}

enum IterState {
    Array { array: Arc<Array>, index: usize },
    Items { items: Vec<Value>, index: usize },
}

impl IteratorObject {
    /// Iterate a live array; elements appended during iteration are visited
    pub fn over_array(array: Arc<Array>) -> Self {
        Self {
            state: Mutex::new(IterState::Array { array, index: 0 }),
        }
    }

    /// Iterate a snapshot of values
    pub fn over_items(items: Vec<Value>) -> Self {
        Self {
            state: Mutex::new(IterState::Items { items, index: 0 }),
        }
    }

    /// Advance, returning `None` once exhausted
    pub fn next_value(&self) -> Option<Value> {
        let mut state = self.state.lock();
        match &mut *state {
            IterState::Array { array, index } => {
                let items = array.items.read();
                let value = items.get(*index).cloned();
                if value.is_some() {
                    *index += 1;
                }
                value
            }
            IterState::Items { items, index } => {
                let value = items.get(*index).cloned();
                if value.is_some() {
                    *index += 1;
                }
                value
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_resolution_order() {
        let base = Class::new("Base");
        let derived = Class::with_superclass("Derived", &base);
        let greet = Symbol::intern("greet");
        let wave = Symbol::intern("wave");

        base.define_method(greet, Value::Int(1));
        base.define_method(wave, Value::Int(2));
        derived.define_method(greet, Value::Int(3));

        assert_eq!(derived.find_method(greet), Some(Value::Int(3)));
        assert_eq!(derived.find_method(wave), Some(Value::Int(2)));
        assert!(derived.is_subclass_of(&base));
        assert!(!base.is_subclass_of(&derived));
    }

    #[test]
    fn test_inheritance_cycle_rejected() {
        let a = Class::new("A");
        let b = Class::with_superclass("B", &a);
        assert!(a.set_superclass(b).is_err());
    }

    #[test]
    fn test_array_negative_index() {
        let array = Array::new(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(array.get(-1).unwrap(), Value::Int(3));
        assert!(matches!(array.get(3), Err(VmError::Range(_))));
        array.set(0, Value::Nil).unwrap();
        assert_eq!(array.get(0).unwrap(), Value::Nil);
    }

    #[test]
    fn test_map_float_and_int_keys_collide() {
        let map = MapObject::new();
        map.insert(&Value::Int(1), Value::string("one")).unwrap();
        assert_eq!(
            map.get(&Value::Float(1.0)).unwrap(),
            Some(Value::string("one"))
        );
        assert!(map.insert(&Value::array(vec![]), Value::Nil).is_err());
    }

    #[test]
    fn test_native_arity() {
        let f = NativeFunction::new("pair", 2, Some(2), |_, _, _| Ok(Value::Nil));
        assert!(f.check_arity(2).is_ok());
        let err = f.check_arity(1).unwrap_err();
        assert_eq!(
            err.to_string(),
            "ArgumentError: `pair` expected 2 arguments but got 1"
        );
    }
}
