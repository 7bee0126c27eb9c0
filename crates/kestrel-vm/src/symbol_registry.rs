//! Process-wide symbol interning
//!
//! Symbols are shared by every VM instance in the process so that method
//! tables and globals keyed by symbol agree across threads.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// An interned name
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    /// Intern `name`, returning its symbol
    pub fn intern(name: &str) -> Self {
        REGISTRY.intern(name)
    }

    /// The interned text
    pub fn name(self) -> Arc<str> {
        REGISTRY.name(self)
    }

    /// Numeric id
    #[inline]
    pub fn id(self) -> u32 {
        self.0
    }
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ":{}", self.name())
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

static REGISTRY: Lazy<SymbolRegistry> = Lazy::new(SymbolRegistry::new);

/// Bidirectional name <-> id table
pub struct SymbolRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    names: Vec<Arc<str>>,
    ids: FxHashMap<Arc<str>, u32>,
}

impl SymbolRegistry {
    fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    fn intern(&self, name: &str) -> Symbol {
        if let Some(id) = self.inner.read().ids.get(name) {
            return Symbol(*id);
        }

        let mut inner = self.inner.write();
        // Another thread may have won the race between the two locks
        if let Some(id) = inner.ids.get(name) {
            return Symbol(*id);
        }
        let id = inner.names.len() as u32;
        let text: Arc<str> = Arc::from(name);
        inner.names.push(text.clone());
        inner.ids.insert(text, id);
        Symbol(id)
    }

    fn name(&self, symbol: Symbol) -> Arc<str> {
        self.inner
            .read()
            .names
            .get(symbol.0 as usize)
            .cloned()
            .unwrap_or_else(|| Arc::from("<unknown>"))
    }
}
