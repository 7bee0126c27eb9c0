//! Dispatch Tests
//!
//! Arithmetic fragments, argument binding, classes, inline caches and the
//! behaviour of the value stack as it grows.

use std::sync::{Arc, Mutex};

use kestrel_bytecode::{Function, LocalIndex, Opcode, UpvalueCapture};
use kestrel_vm::{
    Class, Instance, NativeFunction, RuntimeConfig, Symbol, Value, VmError, VmRuntime,
};
use kestrel_vm::value::HeapRef;

fn runtime() -> Arc<VmRuntime> {
    VmRuntime::with_config(RuntimeConfig::new())
}

fn fragment(ops: &[Opcode]) -> Function {
    let mut b = Function::builder().name("fragment");
    for op in ops {
        b.op(*op);
    }
    b.build().unwrap()
}

fn eval(runtime: &Arc<VmRuntime>, ops: &[Opcode], values: Vec<Value>) -> String {
    let function = runtime.load(fragment(ops)).unwrap();
    let result = runtime.interpreter().eval_stack(&function, values);
    format!("{:?}", result.map_err(|e| e.to_string()))
}

fn native(name: &str, result: i64) -> Value {
    Value::Ref(HeapRef::Native(Arc::new(NativeFunction::new(
        name,
        0,
        None,
        move |_, _, _| Ok(Value::Int(result)),
    ))))
}

#[test]
fn test_add_fragments() {
    let runtime = runtime();
    let mut vm = runtime.interpreter();

    for op in [Opcode::Add, Opcode::AddInt] {
        let function = runtime.load(fragment(&[op])).unwrap();
        let result = vm
            .eval_stack(&function, vec![Value::Int(5), Value::Int(3)])
            .unwrap();
        assert_eq!(result, vec![Value::Int(8)]);
    }

    let function = runtime.load(fragment(&[Opcode::AddInt])).unwrap();
    let result = vm
        .eval_stack(&function, vec![Value::Int(5), Value::Float(0.5)])
        .unwrap();
    assert!(matches!(result[..], [Value::Float(x)] if x == 5.5));
    assert_eq!(vm.depth(), 0);
}

#[test]
fn test_fragment_leaves_operands() {
    let runtime = runtime();
    let function = runtime.load(fragment(&[Opcode::Swap, Opcode::Dup])).unwrap();
    let result = runtime
        .interpreter()
        .eval_stack(&function, vec![Value::Int(1), Value::Int(2)])
        .unwrap();
    assert_eq!(result, vec![Value::Int(2), Value::Int(1), Value::Int(1)]);
}

#[test]
fn test_specialized_opcodes_agree_with_generic() {
    let runtime = runtime();
    let pairs = [
        (Opcode::AddInt, Opcode::Add),
        (Opcode::SubInt, Opcode::Sub),
        (Opcode::MulInt, Opcode::Mul),
        (Opcode::LtInt, Opcode::Lt),
        (Opcode::LeInt, Opcode::Le),
        (Opcode::EqInt, Opcode::Eq),
        (Opcode::AddFloat, Opcode::Add),
        (Opcode::SubFloat, Opcode::Sub),
        (Opcode::MulFloat, Opcode::Mul),
        (Opcode::DivFloat, Opcode::Div),
        (Opcode::LtFloat, Opcode::Lt),
    ];
    let operands = [
        Value::Int(7),
        Value::Int(-2),
        Value::Int(i64::MAX),
        Value::Float(1.5),
        Value::string("ab"),
        Value::Nil,
    ];

    for (fast, generic) in pairs {
        for a in &operands {
            for b in &operands {
                let values = || vec![a.clone(), b.clone()];
                assert_eq!(
                    eval(&runtime, &[fast], values()),
                    eval(&runtime, &[generic], values()),
                    "{fast} on {a:?} and {b:?}"
                );
            }
        }
    }
}

#[test]
fn test_collections_and_indexing() {
    let runtime = runtime();

    // [10, 20, 30][-1]
    let mut b = Function::builder().name("last");
    b.int(10).int(20).int(30).op_u16(Opcode::Array, 3);
    b.int(-1).op(Opcode::IndexGet).op(Opcode::Return);
    let last = runtime.load(b.build().unwrap()).unwrap();
    assert_eq!(runtime.interpreter().execute(&last).unwrap(), Value::Int(30));

    // {"a": 1, "b": 2}["b"]
    let mut b = Function::builder().name("lookup");
    b.string("a").int(1).string("b").int(2).op_u16(Opcode::Map, 2);
    b.string("b").op(Opcode::IndexGet).op(Opcode::Return);
    let lookup = runtime.load(b.build().unwrap()).unwrap();
    assert_eq!(runtime.interpreter().execute(&lookup).unwrap(), Value::Int(2));

    // [1][5]
    let mut b = Function::builder().name("oob");
    b.int(1).op_u16(Opcode::Array, 1).int(5).op(Opcode::IndexGet).op(Opcode::Return);
    let oob = runtime.load(b.build().unwrap()).unwrap();
    let err = runtime.interpreter().execute(&oob).unwrap_err();
    let VmError::Uncaught(thrown) = err else {
        panic!("expected an uncaught error, got {err:?}");
    };
    assert_eq!(&*thrown.value.as_error().unwrap().class.name, "RangeError");
}

#[test]
fn test_argument_binding() {
    let runtime = runtime();

    let mut b = Function::builder()
        .name("f")
        .arity(1)
        .optional(1)
        .variadic(true)
        .locals(3);
    b.get_local(0)
        .get_local(1)
        .get_local(2)
        .op_u16(Opcode::Array, 3)
        .op(Opcode::Return);
    let f = runtime.load(b.build().unwrap()).unwrap();
    let mut vm = runtime.interpreter();

    let one = vm.invoke_function(&f, &[Value::Int(1)]).unwrap();
    assert_eq!(one.to_string(), "[1, nil, []]");

    let args: Vec<Value> = (1..=4).map(Value::Int).collect();
    let many = vm.invoke_function(&f, &args).unwrap();
    assert_eq!(many.to_string(), "[1, 2, [3, 4]]");

    let err = vm.invoke_function(&f, &[]).unwrap_err();
    assert_eq!(err.message(), "`f` expected at least 1 arguments but got 0");

    let mut b = Function::builder().name("pair").arity(2).locals(2);
    b.get_local(0).op(Opcode::Return);
    let pair = runtime.load(b.build().unwrap()).unwrap();
    let err = vm.invoke_function(&pair, &[Value::Int(1)]).unwrap_err();
    assert_eq!(err.message(), "`pair` expected 2 arguments but got 1");
    assert_eq!(vm.depth(), 0);
}

#[test]
fn test_classes_and_inheritance() {
    let runtime = runtime();

    let mut init = Function::builder().name("init").arity(1).locals(1);
    init.op(Opcode::SelfValue)
        .get_local(0)
        .set_field("x")
        .op(Opcode::ReturnNil);
    let mut get_x = Function::builder().name("get_x");
    get_x.op(Opcode::SelfValue).get_field("x").op(Opcode::Return);
    let mut scaled = Function::builder().name("get_x");
    scaled
        .op(Opcode::SelfValue)
        .get_field("x")
        .int(10)
        .op(Opcode::Mul)
        .op(Opcode::Return);

    let mut b = Function::builder().name("main").locals(2);
    b.class("Point")
        .closure(init.build().unwrap())
        .method("init")
        .closure(get_x.build().unwrap())
        .method("get_x")
        .set_global("Point");
    b.class("Scaled")
        .get_global("Point")
        .op(Opcode::Inherit)
        .closure(scaled.build().unwrap())
        .method("get_x")
        .set_global("Scaled");
    b.get_global("Point").int(7).op_u8(Opcode::Call, 1).set_local(0);
    b.get_global("Scaled").int(5).op_u8(Opcode::Call, 1).set_local(1);
    b.get_local(0).invoke("get_x", 0);
    b.get_local(1).invoke("get_x", 0);
    b.op_u16(Opcode::Array, 2).op(Opcode::Return);
    let main = runtime.load(b.build().unwrap()).unwrap();

    let result = runtime.interpreter().execute(&main).unwrap();
    assert_eq!(result.to_string(), "[7, 50]");

    let scaled = runtime.get_global("Scaled").unwrap();
    let point = runtime.get_global("Point").unwrap();
    assert!(scaled.as_class().unwrap().is_subclass_of(point.as_class().unwrap()));
}

#[test]
fn test_instance_operator_methods() {
    let runtime = runtime();
    let money = Class::with_superclass("Money", &runtime.intrinsics().object);
    money.define_method(Symbol::intern("+"), native("+", 100));

    let a = Value::Ref(HeapRef::Instance(Arc::new(Instance::new(money.clone()))));
    let b = Value::Ref(HeapRef::Instance(Arc::new(Instance::new(money))));
    let result = eval(&runtime, &[Opcode::Add], vec![a.clone(), b.clone()]);
    assert_eq!(result, "Ok([100])");

    // No `==` method: identity
    assert_eq!(eval(&runtime, &[Opcode::Eq], vec![a.clone(), a.clone()]), "Ok([true])");
    assert_eq!(eval(&runtime, &[Opcode::Ne], vec![a.clone(), b.clone()]), "Ok([true])");
    assert!(eval(&runtime, &[Opcode::Sub], vec![a, b]).contains("unsupported operand types"));
}

#[test]
fn test_inline_cache_hits_and_invalidation() {
    let runtime = runtime();
    let point = Class::with_superclass("Point", &runtime.intrinsics().object);
    point.define_method(Symbol::intern("value"), native("value", 1));
    let instance = Value::Ref(HeapRef::Instance(Arc::new(Instance::new(point.clone()))));

    let mut b = Function::builder().name("call_value").arity(1).locals(1);
    b.get_local(0).invoke("value", 0).op(Opcode::Return);
    let site = runtime.load(b.build().unwrap()).unwrap();
    let mut vm = runtime.interpreter();

    for _ in 0..100 {
        let value = vm.invoke_function(&site, &[instance.clone()]).unwrap();
        assert_eq!(value, Value::Int(1));
    }
    // Other tests define methods concurrently, which may invalidate a few lookups
    let stats = site.caches[0].stats();
    assert_eq!(stats.hits + stats.misses, 100);
    assert!(stats.hits > 0);

    point.define_method(Symbol::intern("value"), native("value", 2));
    let value = vm.invoke_function(&site, &[instance]).unwrap();
    assert_eq!(value, Value::Int(2));
}

#[test]
fn test_fields_shadow_methods() {
    let runtime = runtime();
    let class = Class::with_superclass("Widget", &runtime.intrinsics().object);
    class.define_method(Symbol::intern("render"), native("render", 1));
    let instance = Instance::new(class);
    instance.set_field(Symbol::intern("render"), native("render_field", 2));
    let widget = Value::Ref(HeapRef::Instance(Arc::new(instance)));

    let mut vm = runtime.interpreter();
    assert_eq!(vm.invoke_method(&widget, "render", &[]).unwrap(), Value::Int(2));
}

fn recursive_sum() -> Function {
    // sum(n) = n == 0 ? (probe(), 0) : n + sum(n - 1)
    let mut b = Function::builder().name("sum").arity(1).locals(1);
    b.get_local(0).int(0).op(Opcode::EqInt);
    let recurse = b.jump(Opcode::JumpIfFalse);
    b.get_global("probe").op_u8(Opcode::Call, 0).op(Opcode::Pop);
    b.int(0).op(Opcode::Return);
    b.patch(recurse).unwrap();
    b.get_local(0)
        .get_global("sum")
        .get_local(0)
        .int(1)
        .op(Opcode::SubInt)
        .op_u8(Opcode::Call, 1)
        .op(Opcode::Add)
        .op(Opcode::Return);
    b.build().unwrap()
}

struct Probe {
    frame_pointers: Vec<usize>,
    growths: u32,
}

fn run_sum(initial_stack_bytes: usize) -> (Value, Probe) {
    let config = RuntimeConfig::new()
        .initial_stack_bytes(initial_stack_bytes)
        .max_frames(1024);
    let runtime = VmRuntime::with_config(config);
    let probe = Arc::new(Mutex::new(None));
    let sink = probe.clone();
    runtime.define_native("probe", 0, Some(0), move |vm, _, _| {
        *sink.lock().unwrap() = Some(Probe {
            frame_pointers: vm.frame_pointers(),
            growths: vm.stack_growths(),
        });
        Ok(Value::Nil)
    });

    let sum = runtime.load(recursive_sum()).unwrap();
    runtime.set_global("sum", Value::Ref(HeapRef::Function(sum.clone())));
    let result = runtime
        .interpreter()
        .invoke_function(&sum, &[Value::Int(200)])
        .unwrap();
    let probe = probe.lock().unwrap().take().unwrap();
    (result, probe)
}

#[test]
fn test_stack_growth_is_transparent() {
    let (small_result, small) = run_sum(256);
    let (large_result, large) = run_sum(1024 * 1024);

    assert_eq!(small_result, Value::Int(20100));
    assert_eq!(small_result, large_result);
    assert!(small.growths > 0);
    assert_eq!(large.growths, 0);
    assert_eq!(small.frame_pointers.len(), 201);
    assert_eq!(small.frame_pointers, large.frame_pointers);
}

/// `main` keeps a local captured by `bump` and `get` open while `deep`
/// recurses 200 frames, calling `bump` at every level
fn run_captured(initial_stack_bytes: usize) -> (String, u32) {
    let config = RuntimeConfig::new()
        .initial_stack_bytes(initial_stack_bytes)
        .max_frames(1024);
    let runtime = VmRuntime::with_config(config);
    let growths = Arc::new(Mutex::new(0));
    let sink = growths.clone();
    runtime.define_native("probe", 0, Some(0), move |vm, _, _| {
        *sink.lock().unwrap() = vm.stack_growths();
        Ok(Value::Nil)
    });

    // deep(n, f) { if n == 0 { probe(); return } f(n); deep(n - 1, f) }
    let mut deep = Function::builder().name("deep").arity(2).locals(2);
    deep.get_local(0).int(0).op(Opcode::EqInt);
    let recurse = deep.jump(Opcode::JumpIfFalse);
    deep.get_global("probe").op_u8(Opcode::Call, 0).op(Opcode::Pop);
    deep.op(Opcode::ReturnNil);
    deep.patch(recurse).unwrap();
    deep.get_local(1)
        .get_local(0)
        .op_u8(Opcode::Call, 1)
        .op(Opcode::Pop);
    deep.get_global("deep")
        .get_local(0)
        .int(1)
        .op(Opcode::SubInt)
        .get_local(1)
        .op_u8(Opcode::Call, 2)
        .op(Opcode::Pop);
    deep.op(Opcode::ReturnNil);
    let deep = runtime.load(deep.build().unwrap()).unwrap();
    runtime.set_global("deep", Value::Ref(HeapRef::Function(deep)));

    let mut bump = Function::builder()
        .name("bump")
        .arity(1)
        .locals(1)
        .upvalue(UpvalueCapture::Local(LocalIndex(0)));
    bump.op_u8(Opcode::GetUpvalue, 0)
        .get_local(0)
        .op(Opcode::AddInt)
        .op_u8(Opcode::SetUpvalue, 0)
        .op(Opcode::ReturnNil);

    let mut get = Function::builder()
        .name("get")
        .upvalue(UpvalueCapture::Local(LocalIndex(0)));
    get.op_u8(Opcode::GetUpvalue, 0).op(Opcode::Return);

    // var x = 0; deep(200, |n| x += n); x += 1; return [get(), x]
    let mut b = Function::builder().name("main").locals(3);
    b.int(0).set_local(0);
    b.closure(bump.build().unwrap()).set_local(1);
    b.closure(get.build().unwrap()).set_local(2);
    b.get_global("deep")
        .int(200)
        .get_local(1)
        .op_u8(Opcode::Call, 2)
        .op(Opcode::Pop);
    b.get_local(0).int(1).op(Opcode::AddInt).set_local(0);
    b.get_local(2).op_u8(Opcode::Call, 0);
    b.get_local(0).op_u16(Opcode::Array, 2).op(Opcode::Return);
    let main = runtime.load(b.build().unwrap()).unwrap();

    let result = runtime.interpreter().execute(&main).unwrap().to_string();
    let growths = *growths.lock().unwrap();
    (result, growths)
}

#[test]
fn test_open_upvalues_survive_stack_growth() {
    let (small, small_growths) = run_captured(256);
    let (large, large_growths) = run_captured(1024 * 1024);

    assert!(small_growths > 0);
    assert_eq!(large_growths, 0);
    assert_eq!(small, "[20101, 20101]");
    assert_eq!(small, large);
}

#[test]
fn test_stack_limit_is_reported() {
    let config = RuntimeConfig::new()
        .initial_stack_bytes(256)
        .max_stack_bytes(4096)
        .max_frames(100_000);
    let runtime = VmRuntime::with_config(config);
    runtime.define_native("probe", 0, Some(0), |_, _, _| Ok(Value::Nil));
    let sum = runtime.load(recursive_sum()).unwrap();
    runtime.set_global("sum", Value::Ref(HeapRef::Function(sum.clone())));

    let mut vm = runtime.interpreter();
    let err = vm.invoke_function(&sum, &[Value::Int(10_000)]).unwrap_err();
    assert!(matches!(err, VmError::StackOverflow(_)), "{err:?}");
    assert_eq!(vm.depth(), 0);

    let again = vm.invoke_function(&sum, &[Value::Int(3)]).unwrap();
    assert_eq!(again, Value::Int(6));
}
