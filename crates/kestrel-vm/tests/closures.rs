//! Closure Tests
//!
//! Closures share captured variables while the enclosing frame is live, keep
//! sharing them after it returns, and refuse to run on an interpreter that
//! does not own the stack their captures still point into.

use std::sync::{Arc, Mutex};

use kestrel_bytecode::{Function, LocalIndex, Opcode, UpvalueCapture, UpvalueIndex};
use kestrel_vm::value::HeapRef;
use kestrel_vm::{RuntimeConfig, Value, VmError, VmRuntime};

fn runtime() -> Arc<VmRuntime> {
    VmRuntime::with_config(RuntimeConfig::new())
}

fn getter() -> Function {
    let mut b = Function::builder()
        .name("get")
        .upvalue(UpvalueCapture::Local(LocalIndex(0)));
    b.op_u8(Opcode::GetUpvalue, 0).op(Opcode::Return);
    b.build().unwrap()
}

fn setter() -> Function {
    let mut b = Function::builder()
        .name("set")
        .arity(1)
        .locals(1)
        .upvalue(UpvalueCapture::Local(LocalIndex(0)));
    b.get_local(0)
        .op_u8(Opcode::SetUpvalue, 0)
        .op(Opcode::ReturnNil);
    b.build().unwrap()
}

#[test]
fn test_closures_share_captured_local() {
    let runtime = runtime();

    // var x = 0; let get = || x; let set = |v| x = v
    // set(5); return [get, set, x]
    let mut b = Function::builder().name("make_pair").locals(3);
    b.int(0).set_local(0);
    b.closure(getter()).set_local(1);
    b.closure(setter()).set_local(2);
    b.get_local(2).int(5).op_u8(Opcode::Call, 1).op(Opcode::Pop);
    b.get_local(1)
        .get_local(2)
        .get_local(0)
        .op_u16(Opcode::Array, 3)
        .op(Opcode::Return);
    let make_pair = runtime.load(b.build().unwrap()).unwrap();

    let mut vm = runtime.interpreter();
    let pair = vm.execute(&make_pair).unwrap().as_array().unwrap().to_vec();
    let (get, set) = (&pair[0], &pair[1]);
    assert_eq!(pair[2], Value::Int(5));

    assert_eq!(vm.invoke(get, &[]).unwrap(), Value::Int(5));
    vm.invoke(set, &[Value::Int(9)]).unwrap();
    assert_eq!(vm.invoke(get, &[]).unwrap(), Value::Int(9));
    // The snapshot taken while the frame was live is unaffected
    assert_eq!(pair[2], Value::Int(5));

    let Value::Ref(HeapRef::Closure(get)) = get else {
        panic!("expected a closure");
    };
    let Value::Ref(HeapRef::Closure(set)) = set else {
        panic!("expected a closure");
    };
    assert!(Arc::ptr_eq(&get.upvalues[0], &set.upvalues[0]));
    assert!(get.upvalues[0].is_closed());
}

#[test]
fn test_writes_through_stack_are_visible_to_open_captures() {
    let runtime = runtime();

    // var x = 1; let get = || x; x = 2; return get()
    let mut b = Function::builder().name("main").locals(2);
    b.int(1).set_local(0);
    b.closure(getter()).set_local(1);
    b.int(2).set_local(0);
    b.get_local(1).op_u8(Opcode::Call, 0).op(Opcode::Return);
    let main = runtime.load(b.build().unwrap()).unwrap();

    assert_eq!(runtime.interpreter().execute(&main).unwrap(), Value::Int(2));
}

#[test]
fn test_nested_capture_reuses_upvalue() {
    let runtime = runtime();

    let mut inner = Function::builder()
        .name("inner")
        .upvalue(UpvalueCapture::Upvalue(UpvalueIndex(0)));
    inner.op_u8(Opcode::GetUpvalue, 0).op(Opcode::Return);

    // middle() returns a closure over its own capture
    let mut middle = Function::builder()
        .name("middle")
        .upvalue(UpvalueCapture::Local(LocalIndex(0)));
    middle
        .closure(inner.build().unwrap())
        .op(Opcode::Return);

    let mut outer = Function::builder().name("outer").locals(2);
    outer.int(42).set_local(0);
    outer.closure(middle.build().unwrap()).set_local(1);
    outer
        .get_local(1)
        .get_local(1)
        .op_u8(Opcode::Call, 0)
        .op_u16(Opcode::Array, 2)
        .op(Opcode::Return);
    let outer = runtime.load(outer.build().unwrap()).unwrap();

    let mut vm = runtime.interpreter();
    let items = vm.execute(&outer).unwrap().as_array().unwrap().to_vec();
    let (Value::Ref(HeapRef::Closure(middle)), Value::Ref(HeapRef::Closure(inner))) =
        (&items[0], &items[1])
    else {
        panic!("expected two closures, got {items:?}");
    };
    assert!(Arc::ptr_eq(&middle.upvalues[0], &inner.upvalues[0]));
    assert_eq!(vm.invoke(&items[1], &[]).unwrap(), Value::Int(42));
}

#[test]
fn test_cross_thread_closure_is_rejected_while_open() {
    let runtime = runtime();
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();

    // Invokes its argument on a second interpreter
    runtime.define_native("elsewhere", 1, Some(1), move |vm, _, args| {
        let mut other = vm.runtime().interpreter();
        *sink.lock().unwrap() = Some(other.invoke(&args[0], &[]));
        Ok(Value::Nil)
    });

    // var x = 3; let get = || x; elsewhere(get); return get
    let mut b = Function::builder().name("main").locals(2);
    b.int(3).set_local(0);
    b.closure(getter()).set_local(1);
    b.get_global("elsewhere")
        .get_local(1)
        .op_u8(Opcode::Call, 1)
        .op(Opcode::Pop);
    b.get_local(1).op(Opcode::Return);
    let main = runtime.load(b.build().unwrap()).unwrap();

    let get = runtime.interpreter().execute(&main).unwrap();
    let result = seen.lock().unwrap().take().unwrap();
    assert!(
        matches!(result, Err(VmError::CrossThreadClosure { ref function }) if function == "get"),
        "{result:?}"
    );

    // Once the owning frame has returned the capture is closed
    let mut other = runtime.interpreter();
    assert_eq!(other.invoke(&get, &[]).unwrap(), Value::Int(3));
}

#[test]
fn test_closure_receiver_is_captured() {
    let runtime = runtime();

    let mut whoami = Function::builder().name("whoami");
    whoami.op(Opcode::SelfValue).op(Opcode::Return);

    // method make() { return || self }
    let mut make = Function::builder().name("make");
    make.closure(whoami.build().unwrap()).op(Opcode::Return);

    let mut b = Function::builder().name("main").locals(1);
    b.class("Box")
        .closure(make.build().unwrap())
        .method("make")
        .op_u8(Opcode::Call, 0)
        .set_local(0);
    b.get_local(0)
        .invoke("make", 0)
        .op_u8(Opcode::Call, 0)
        .get_local(0)
        .op(Opcode::Eq)
        .op(Opcode::Return);
    let main = runtime.load(b.build().unwrap()).unwrap();

    assert_eq!(runtime.interpreter().execute(&main).unwrap(), Value::Bool(true));
}
