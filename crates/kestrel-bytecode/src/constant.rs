//! Constant pool for compiled functions

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::function::Function;

/// A constant value in the constant pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Constant {
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point number
    Float(f64),
    /// String literal
    String(Box<str>),
    /// Symbol name (interned by the VM on load)
    Symbol(Box<str>),
    /// Nested compiled function
    Function(Arc<Function>),
}

impl Constant {
    /// Create a string constant
    #[inline]
    pub fn string(s: impl Into<Box<str>>) -> Self {
        Self::String(s.into())
    }

    /// Create a symbol constant
    #[inline]
    pub fn symbol(s: impl Into<Box<str>>) -> Self {
        Self::Symbol(s.into())
    }

    /// Get as string if this is a string or symbol constant
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// Get as function if this is a function constant
    #[inline]
    pub fn as_function(&self) -> Option<&Arc<Function>> {
        match self {
            Self::Function(f) => Some(f),
            _ => None,
        }
    }

    fn dedup_key(&self) -> Option<ConstantKey> {
        match self {
            Self::Int(i) => Some(ConstantKey::Int(*i)),
            Self::Float(f) => Some(ConstantKey::Float(f.to_bits())),
            Self::String(s) => Some(ConstantKey::String(s.clone())),
            Self::Symbol(s) => Some(ConstantKey::Symbol(s.clone())),
            Self::Function(_) => None,
        }
    }
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Symbol(s) => write!(f, ":{s}"),
            Self::Function(func) => write!(f, "<fn {}>", func.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstantKey {
    Int(i64),
    Float(u64),
    String(Box<str>),
    Symbol(Box<str>),
}

/// Constant pool with deduplication of scalar constants
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstantPool {
    constants: Vec<Constant>,
    #[serde(skip)]
    index: FxHashMap<ConstantKey, u32>,
}

impl ConstantPool {
    /// Create a new empty constant pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constant to the pool, returns its index
    ///
    /// Identical scalar constants share one slot. Function constants are
    /// always appended.
    pub fn add(&mut self, constant: Constant) -> u32 {
        let key = constant.dedup_key();
        if let Some(idx) = key.as_ref().and_then(|k| self.index.get(k)) {
            return *idx;
        }

        let idx = self.constants.len() as u32;
        self.constants.push(constant);
        if let Some(key) = key {
            self.index.insert(key, idx);
        }
        idx
    }

    /// Add an integer constant
    #[inline]
    pub fn add_int(&mut self, i: i64) -> u32 {
        self.add(Constant::Int(i))
    }

    /// Add a float constant
    #[inline]
    pub fn add_float(&mut self, f: f64) -> u32 {
        self.add(Constant::Float(f))
    }

    /// Add a string constant
    #[inline]
    pub fn add_string(&mut self, s: &str) -> u32 {
        self.add(Constant::string(s))
    }

    /// Add a symbol constant
    #[inline]
    pub fn add_symbol(&mut self, s: &str) -> u32 {
        self.add(Constant::symbol(s))
    }

    /// Get a constant by index
    #[inline]
    pub fn get(&self, index: u32) -> Option<&Constant> {
        self.constants.get(index as usize)
    }

    /// Number of constants
    #[inline]
    pub fn len(&self) -> usize {
        self.constants.len()
    }

    /// Is the pool empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    /// Iterate over constants
    pub fn iter(&self) -> impl Iterator<Item = &Constant> {
        self.constants.iter()
    }
}
