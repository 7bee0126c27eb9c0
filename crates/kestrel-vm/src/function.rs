//! Loaded functions and closures

use std::sync::Arc;

use kestrel_bytecode::{Constant, Function};

use crate::cache::InlineCache;
use crate::error::{VmError, VmResult};
use crate::runtime::VmId;
use crate::symbol_registry::Symbol;
use crate::upvalue::Upvalue;
use crate::value::{HeapRef, Value};

/// A verified bytecode function with its constants materialized as values
pub struct FunctionObject {
    /// The compiled function
    pub code: Arc<Function>,
    /// Constant pool as runtime values (nested functions loaded recursively)
    pub constants: Box<[Value]>,
    /// One inline cache per `INVOKE` site
    pub caches: Box<[InlineCache]>,
    /// Display name
    pub name: Arc<str>,
    /// Owning file
    pub file: Arc<str>,
}

impl FunctionObject {
    /// Verify `code` and load it together with every nested function
    pub fn load(code: Arc<Function>) -> VmResult<Arc<Self>> {
        code.verify()?;

        let constants = code
            .constants
            .iter()
            .map(|c| -> VmResult<Value> {
                Ok(match c {
                    Constant::Int(i) => Value::Int(*i),
                    Constant::Float(f) => Value::Float(*f),
                    Constant::String(s) => Value::string(s),
                    Constant::Symbol(s) => Value::Symbol(Symbol::intern(s)),
                    Constant::Function(f) => {
                        Value::Ref(HeapRef::Function(Self::load(f.clone())?))
                    }
                })
            })
            .collect::<VmResult<Vec<_>>>()?;

        let caches = (0..code.cache_slots).map(|_| InlineCache::new()).collect();

        Ok(Arc::new(Self {
            name: Arc::from(code.display_name()),
            file: Arc::from(code.file.as_str()),
            constants: constants.into_boxed_slice(),
            caches,
            code,
        }))
    }

    /// Constant as a value
    #[inline]
    pub fn constant(&self, idx: u32) -> VmResult<Value> {
        self.constants
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| VmError::fatal(format!("constant {idx} missing in `{}`", self.name)))
    }

    /// Constant as a symbol
    pub fn name_constant(&self, idx: u32) -> VmResult<Symbol> {
        match self.constants.get(idx as usize) {
            Some(Value::Symbol(s)) => Ok(*s),
            Some(other) => match other.as_str() {
                Some(s) => Ok(Symbol::intern(s)),
                None => Err(VmError::fatal(format!("constant {idx} is not a name"))),
            },
            None => Err(VmError::fatal(format!("constant {idx} missing in `{}`", self.name))),
        }
    }
}

/// A function paired with its captured environment
pub struct Closure {
    /// The function
    pub function: Arc<FunctionObject>,
    /// Captured variables, in `Function::upvalues` order
    pub upvalues: Box<[Arc<Upvalue>]>,
    /// Captured `self`
    pub receiver: Value,
    /// VM that created the closure
    pub owner: VmId,
}

impl Closure {
    /// Reject invocation from `vm` while any capture is still open on another VM
    pub fn check_thread(&self, vm: VmId) -> VmResult<()> {
        if self.upvalues.iter().any(|uv| uv.is_open_elsewhere(vm)) {
            tracing::warn!(
                function = %self.function.name,
                owner = ?self.owner,
                caller = ?vm,
                "cross-thread closure call rejected"
            );
            return Err(VmError::CrossThreadClosure {
                function: self.function.name.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_bytecode::{BytecodeError, Opcode};

    #[test]
    fn test_load_materializes_constants() {
        let mut inner = Function::builder().name("inner");
        inner.op(Opcode::ReturnNil);
        let mut b = Function::builder().name("outer");
        b.float(1.5).op(Opcode::Pop);
        b.get_global("print");
        b.closure(inner.build().unwrap());
        b.op(Opcode::Return);

        let loaded = FunctionObject::load(Arc::new(b.build().unwrap())).unwrap();
        assert_eq!(loaded.constants[0], Value::Float(1.5));
        assert_eq!(loaded.name_constant(1).unwrap(), Symbol::intern("print"));
        assert!(matches!(
            &loaded.constants[2],
            Value::Ref(HeapRef::Function(f)) if &*f.name == "inner"
        ));
    }

    #[test]
    fn test_load_rejects_corrupt_code() {
        let mut b = Function::builder();
        b.op(Opcode::ReturnNil);
        let mut func = b.build().unwrap();
        func.code.push(0xEE);

        let err = FunctionObject::load(Arc::new(func)).err().unwrap();
        assert!(matches!(
            err,
            VmError::Bytecode(BytecodeError::InvalidOpcode(0xEE))
        ));
    }

    #[test]
    fn test_closure_owner_check() {
        let mut b = Function::builder();
        b.op(Opcode::ReturnNil);
        let function = FunctionObject::load(Arc::new(b.build().unwrap())).unwrap();
        let owner = VmId::next();
        let other = VmId::next();

        let closure = Closure {
            function,
            upvalues: vec![Arc::new(Upvalue::open(owner, 0))].into_boxed_slice(),
            receiver: Value::Nil,
            owner,
        };
        assert!(closure.check_thread(owner).is_ok());
        assert!(matches!(
            closure.check_thread(other),
            Err(VmError::CrossThreadClosure { .. })
        ));

        closure.upvalues[0].close(Value::Int(1));
        assert!(closure.check_thread(other).is_ok());
    }
}
