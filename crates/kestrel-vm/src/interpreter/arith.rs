//! Arithmetic and comparison
//!
//! The specialized opcodes (`ADD_INT`, `LT_FLOAT`, ...) try [`fast_path`]
//! first and fall back to the generic opcode when the operands are not of the
//! expected kind, so both forms always agree on the result.

use kestrel_bytecode::Opcode;

use super::Interpreter;
use crate::error::{VmError, VmResult};
use crate::symbol_registry::Symbol;
use crate::value::{HeapRef, Value};

/// Generic opcode a specialized opcode falls back to
pub(super) fn generic_of(op: Opcode) -> Opcode {
    match op {
        Opcode::AddInt | Opcode::AddFloat => Opcode::Add,
        Opcode::SubInt | Opcode::SubFloat => Opcode::Sub,
        Opcode::MulInt | Opcode::MulFloat => Opcode::Mul,
        Opcode::DivFloat => Opcode::Div,
        Opcode::LtInt | Opcode::LtFloat => Opcode::Lt,
        Opcode::LeInt => Opcode::Le,
        Opcode::EqInt => Opcode::Eq,
        other => other,
    }
}

/// Result of a specialized opcode, or `None` to take the generic path
#[inline]
pub(super) fn fast_path(op: Opcode, a: &Value, b: &Value) -> Option<Value> {
    match (op, a, b) {
        (Opcode::AddInt, Value::Int(x), Value::Int(y)) => x.checked_add(*y).map(Value::Int),
        (Opcode::SubInt, Value::Int(x), Value::Int(y)) => x.checked_sub(*y).map(Value::Int),
        (Opcode::MulInt, Value::Int(x), Value::Int(y)) => x.checked_mul(*y).map(Value::Int),
        (Opcode::LtInt, Value::Int(x), Value::Int(y)) => Some(Value::Bool(x < y)),
        (Opcode::LeInt, Value::Int(x), Value::Int(y)) => Some(Value::Bool(x <= y)),
        (Opcode::EqInt, Value::Int(x), Value::Int(y)) => Some(Value::Bool(x == y)),
        (Opcode::AddFloat, Value::Float(x), Value::Float(y)) => Some(Value::Float(x + y)),
        (Opcode::SubFloat, Value::Float(x), Value::Float(y)) => Some(Value::Float(x - y)),
        (Opcode::MulFloat, Value::Float(x), Value::Float(y)) => Some(Value::Float(x * y)),
        (Opcode::DivFloat, Value::Float(x), Value::Float(y)) => Some(Value::Float(x / y)),
        (Opcode::LtFloat, Value::Float(x), Value::Float(y)) => Some(Value::Bool(x < y)),
        _ => None,
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Int(_) | Value::Byte(_) => value.as_int().map(Num::Int),
            Value::Float(f) => Some(Num::Float(*f)),
            _ => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

/// Integer arithmetic; overflow promotes to float
fn int_op(op: Opcode, x: i64, y: i64) -> VmResult<Option<Value>> {
    let promote = |checked: Option<i64>, wide: f64| checked.map_or(Value::Float(wide), Value::Int);
    let value = match op {
        Opcode::Add => promote(x.checked_add(y), x as f64 + y as f64),
        Opcode::Sub => promote(x.checked_sub(y), x as f64 - y as f64),
        Opcode::Mul => promote(x.checked_mul(y), x as f64 * y as f64),
        Opcode::Div => {
            if y == 0 {
                return Err(VmError::range("integer division by zero"));
            }
            promote(x.checked_div(y), x as f64 / y as f64)
        }
        Opcode::Mod => {
            if y == 0 {
                return Err(VmError::range("integer modulo by zero"));
            }
            Value::Int(x.checked_rem(y).unwrap_or(0))
        }
        Opcode::Eq => Value::Bool(x == y),
        Opcode::Ne => Value::Bool(x != y),
        Opcode::Lt => Value::Bool(x < y),
        Opcode::Le => Value::Bool(x <= y),
        Opcode::Gt => Value::Bool(x > y),
        Opcode::Ge => Value::Bool(x >= y),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn float_op(op: Opcode, x: f64, y: f64) -> Option<Value> {
    let value = match op {
        Opcode::Add => Value::Float(x + y),
        Opcode::Sub => Value::Float(x - y),
        Opcode::Mul => Value::Float(x * y),
        Opcode::Div => Value::Float(x / y),
        Opcode::Mod => Value::Float(x % y),
        Opcode::Eq => Value::Bool(x == y),
        Opcode::Ne => Value::Bool(x != y),
        Opcode::Lt => Value::Bool(x < y),
        Opcode::Le => Value::Bool(x <= y),
        Opcode::Gt => Value::Bool(x > y),
        Opcode::Ge => Value::Bool(x >= y),
        _ => return None,
    };
    Some(value)
}

fn str_op(op: Opcode, x: &str, y: &str) -> Option<Value> {
    let value = match op {
        Opcode::Add => Value::string(format!("{x}{y}")),
        Opcode::Eq => Value::Bool(x == y),
        Opcode::Ne => Value::Bool(x != y),
        Opcode::Lt => Value::Bool(x < y),
        Opcode::Le => Value::Bool(x <= y),
        Opcode::Gt => Value::Bool(x > y),
        Opcode::Ge => Value::Bool(x >= y),
        _ => return None,
    };
    Some(value)
}

/// Generic operation on built-in operands, `None` if they don't support it
pub(super) fn primitive(op: Opcode, a: &Value, b: &Value) -> VmResult<Option<Value>> {
    match (Num::of(a), Num::of(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => return int_op(op, x, y),
        (Some(_), Some(_)) if op == Opcode::Eq => return Ok(Some(Value::Bool(a == b))),
        (Some(_), Some(_)) if op == Opcode::Ne => return Ok(Some(Value::Bool(a != b))),
        (Some(x), Some(y)) => return Ok(float_op(op, x.as_f64(), y.as_f64())),
        _ => {}
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Ok(str_op(op, x, y));
    }
    let value = match op {
        Opcode::Eq if a.as_instance().is_none() => Some(Value::Bool(a == b)),
        Opcode::Ne if a.as_instance().is_none() => Some(Value::Bool(a != b)),
        _ => None,
    };
    Ok(value)
}

fn operator_name(op: Opcode) -> &'static str {
    match op {
        Opcode::Add => "+",
        Opcode::Sub => "-",
        Opcode::Mul => "*",
        Opcode::Div => "/",
        Opcode::Mod => "%",
        Opcode::Eq | Opcode::Ne => "==",
        Opcode::Lt => "<",
        Opcode::Le => "<=",
        Opcode::Gt => ">",
        Opcode::Ge => ">=",
        _ => "?",
    }
}

impl Interpreter {
    /// Generic binary operation; instances dispatch to operator methods
    pub(super) fn binary_op(&mut self, op: Opcode, a: Value, b: Value) -> VmResult<Value> {
        if let Some(value) = primitive(op, &a, &b)? {
            return Ok(value);
        }

        let name = operator_name(op);
        if let Some(instance) = a.as_instance() {
            let method = instance.class.find_method(Symbol::intern(name));
            match method {
                Some(method) => {
                    let result = self.invoke_with(&method, Some(a.clone()), &[b])?;
                    return Ok(if op == Opcode::Ne {
                        Value::Bool(!result.is_truthy())
                    } else {
                        result
                    });
                }
                None if op == Opcode::Eq => return Ok(Value::Bool(a == b)),
                None if op == Opcode::Ne => return Ok(Value::Bool(a != b)),
                None => {}
            }
        }

        Err(VmError::argument(format!(
            "unsupported operand types for {name}: {} and {}",
            a.type_name(),
            b.type_name()
        )))
    }

    /// `NEG`
    pub(super) fn negate(&mut self, a: Value) -> VmResult<Value> {
        match a {
            Value::Int(i) => Ok(i.checked_neg().map_or(Value::Float(-(i as f64)), Value::Int)),
            Value::Byte(b) => Ok(Value::Int(-(b as i64))),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Ref(HeapRef::Instance(ref instance)) => {
                let class = instance.class.clone();
                match class.find_method(Symbol::intern("neg")) {
                    Some(method) => self.invoke_with(&method, Some(a.clone()), &[]),
                    None => Err(VmError::argument(format!(
                        "unsupported operand type for -: {}",
                        class.name
                    ))),
                }
            }
            other => Err(VmError::argument(format!(
                "unsupported operand type for -: {}",
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_path_agrees_with_generic() {
        let operands = [
            Value::Int(7),
            Value::Int(-3),
            Value::Int(i64::MAX),
            Value::Float(2.5),
            Value::Byte(4),
        ];
        let ops = [
            Opcode::AddInt,
            Opcode::SubInt,
            Opcode::MulInt,
            Opcode::LtInt,
            Opcode::LeInt,
            Opcode::EqInt,
            Opcode::AddFloat,
            Opcode::SubFloat,
            Opcode::MulFloat,
            Opcode::DivFloat,
            Opcode::LtFloat,
        ];
        for op in ops {
            for a in &operands {
                for b in &operands {
                    if let Some(fast) = fast_path(op, a, b) {
                        let generic = primitive(generic_of(op), a, b).unwrap().unwrap();
                        assert_eq!(format!("{fast:?}"), format!("{generic:?}"), "{op} {a:?} {b:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_integer_overflow_promotes() {
        let sum = primitive(Opcode::Add, &Value::Int(i64::MAX), &Value::Int(1))
            .unwrap()
            .unwrap();
        assert!(matches!(sum, Value::Float(_)));
        assert_eq!(fast_path(Opcode::AddInt, &Value::Int(i64::MAX), &Value::Int(1)), None);
    }

    #[test]
    fn test_mixed_equality_does_not_round() {
        let big = Value::Int((1 << 53) + 1);
        let rounded = Value::Float((1u64 << 53) as f64);
        let eq = primitive(Opcode::Eq, &big, &rounded).unwrap();
        assert_eq!(eq, Some(Value::Bool(false)));
        let ne = primitive(Opcode::Ne, &rounded, &big).unwrap();
        assert_eq!(ne, Some(Value::Bool(true)));
        let eq = primitive(Opcode::Eq, &Value::Int(3), &Value::Float(3.0)).unwrap();
        assert_eq!(eq, Some(Value::Bool(true)));
    }

    #[test]
    fn test_division_by_zero() {
        let err = primitive(Opcode::Div, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert!(matches!(err, VmError::Range(ref m) if m == "integer division by zero"));
        let err = primitive(Opcode::Mod, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert!(matches!(err, VmError::Range(_)));

        let x = primitive(Opcode::Div, &Value::Float(1.0), &Value::Int(0))
            .unwrap()
            .unwrap();
        assert_eq!(x, Value::Float(f64::INFINITY));
        let m = primitive(Opcode::Mod, &Value::Int(i64::MIN), &Value::Int(-1))
            .unwrap()
            .unwrap();
        assert_eq!(m, Value::Int(0));
    }

    #[test]
    fn test_strings() {
        let s = primitive(Opcode::Add, &Value::string("ab"), &Value::string("c"))
            .unwrap()
            .unwrap();
        assert_eq!(s, Value::string("abc"));
        let lt = primitive(Opcode::Lt, &Value::string("a"), &Value::string("b"))
            .unwrap()
            .unwrap();
        assert_eq!(lt, Value::Bool(true));
        assert!(primitive(Opcode::Sub, &Value::string("a"), &Value::string("b"))
            .unwrap()
            .is_none());
    }
}
