//! Coroutine Tests
//!
//! Generators resume where they yielded and never re-run their body once
//! finished; async functions run on the thread pool and their promises settle
//! exactly once.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kestrel_bytecode::{Function, FunctionBuilder, LocalIndex, Opcode, UpvalueCapture};
use kestrel_vm::value::HeapRef;
use kestrel_vm::{
    GeneratorState, Promise, Resume, RuntimeConfig, Value, VmError, VmMutex, VmRuntime,
};

type Log = Arc<Mutex<Vec<String>>>;

fn runtime_with_log() -> (Arc<VmRuntime>, Log) {
    let runtime = VmRuntime::with_config(RuntimeConfig::new().pool_workers(2));
    let log = Log::default();
    let sink = log.clone();
    runtime.define_native("record", 1, Some(1), move |_, _, args| {
        sink.lock().unwrap().push(args[0].to_string());
        Ok(Value::Nil)
    });
    (runtime, log)
}

fn record(b: &mut FunctionBuilder, text: &str) {
    b.get_global("record")
        .string(text)
        .op_u8(Opcode::Call, 1)
        .op(Opcode::Pop);
}

/// Yields 1, 2 and 3, recording when it starts and ends
fn count() -> Function {
    let mut b = Function::builder().name("count").is_generator(true);
    record(&mut b, "start");
    for i in 1..=3 {
        b.int(i).op(Opcode::Yield).op(Opcode::Pop);
    }
    record(&mut b, "end");
    b.op(Opcode::ReturnNil);
    b.build().unwrap()
}

fn define(runtime: &VmRuntime, name: &str, function: Function) -> Value {
    let function = runtime.load(function).unwrap();
    let value = Value::Ref(HeapRef::Function(function));
    runtime.set_global(name, value.clone());
    value
}

#[test]
fn test_generator_yields_in_order_then_stops() {
    let (runtime, log) = runtime_with_log();
    let count = define(&runtime, "count", count());
    let mut vm = runtime.interpreter();

    let generator = vm.invoke(&count, &[]).unwrap();
    let generator = generator.as_generator().unwrap();
    assert_eq!(generator.state(), GeneratorState::Fresh);
    assert!(log.lock().unwrap().is_empty());

    for expected in 1..=3 {
        let value = vm.resume_generator(generator, Resume::Next(Value::Nil)).unwrap();
        assert_eq!(value, Value::Int(expected));
    }
    for _ in 0..3 {
        let err = vm
            .resume_generator(generator, Resume::Next(Value::Nil))
            .unwrap_err();
        assert!(err.is_stop_iteration(), "{err:?}");
    }
    assert_eq!(generator.state(), GeneratorState::Completed);
    assert_eq!(*log.lock().unwrap(), ["start", "end"]);
    assert_eq!(vm.depth(), 0);
}

#[test]
fn test_for_loop_over_generator() {
    let (runtime, _) = runtime_with_log();
    define(&runtime, "count", count());

    // var total = 0; for x in count() { total += x }; return total
    let mut b = Function::builder().name("main").locals(2);
    b.int(0).set_local(1);
    b.get_global("count")
        .op_u8(Opcode::Call, 0)
        .op(Opcode::GetIter)
        .set_local(0);
    let start = b.offset();
    b.get_local(0);
    let done = b.jump(Opcode::IterNext);
    b.get_local(1).op(Opcode::Add).set_local(1);
    b.loop_to(start).unwrap();
    b.patch(done).unwrap();
    b.get_local(1).op(Opcode::Return);
    let main = runtime.load(b.build().unwrap()).unwrap();

    assert_eq!(runtime.interpreter().execute(&main).unwrap(), Value::Int(6));
}

#[test]
fn test_sent_values_resume_yield() {
    let (runtime, _) = runtime_with_log();

    // let v = yield 1; yield v * 2
    let mut b = Function::builder().name("echo").is_generator(true).locals(1);
    b.int(1).op(Opcode::Yield).set_local(0);
    b.get_local(0).int(2).op(Opcode::Mul).op(Opcode::Yield).op(Opcode::Pop);
    b.op(Opcode::ReturnNil);
    let echo = define(&runtime, "echo", b.build().unwrap());

    let mut vm = runtime.interpreter();
    let generator = vm.invoke(&echo, &[]).unwrap();
    assert_eq!(vm.invoke_method(&generator, "next", &[]).unwrap(), Value::Int(1));
    assert_eq!(
        vm.invoke_method(&generator, "next", &[Value::Int(21)]).unwrap(),
        Value::Int(42)
    );
}

#[test]
fn test_generator_catches_thrown_value() {
    let (runtime, log) = runtime_with_log();

    // try { yield 1 } catch (e) { record(e); yield 2 }
    let mut b = Function::builder().name("guarded").is_generator(true);
    let from = b.offset();
    b.int(1).op(Opcode::Yield).op(Opcode::Pop);
    b.op(Opcode::ReturnNil);
    let to = b.offset();
    let handler = b.offset();
    b.op(Opcode::Pop);
    b.get_global("record")
        .op(Opcode::Swap)
        .op_u8(Opcode::Call, 1)
        .op(Opcode::Pop);
    b.int(2).op(Opcode::Yield).op(Opcode::Pop);
    b.op(Opcode::ReturnNil);
    b.catch(from, to, handler);
    let guarded = define(&runtime, "guarded", b.build().unwrap());

    let mut vm = runtime.interpreter();
    let generator = vm.invoke(&guarded, &[]).unwrap();
    let generator = generator.as_generator().unwrap();
    assert_eq!(
        vm.resume_generator(generator, Resume::Next(Value::Nil)).unwrap(),
        Value::Int(1)
    );

    let thrown = kestrel_vm::ThrownValue {
        value: Value::string("interrupt"),
        trace: Arc::default(),
    };
    assert_eq!(
        vm.resume_generator(generator, Resume::Throw(thrown)).unwrap(),
        Value::Int(2)
    );
    assert_eq!(*log.lock().unwrap(), ["interrupt"]);
}

#[test]
fn test_suspended_generator_parks_captured_locals() {
    let (runtime, _) = runtime_with_log();

    let mut bump = Function::builder()
        .name("bump")
        .upvalue(UpvalueCapture::Local(LocalIndex(0)));
    bump.op_u8(Opcode::GetUpvalue, 0)
        .int(1)
        .op(Opcode::AddInt)
        .op(Opcode::Dup)
        .op_u8(Opcode::SetUpvalue, 0)
        .op(Opcode::Return);

    // var x = 10; yield || x += 1; yield x
    let mut b = Function::builder().name("holder").is_generator(true).locals(1);
    b.int(10).set_local(0);
    b.closure(bump.build().unwrap()).op(Opcode::Yield).op(Opcode::Pop);
    b.get_local(0).op(Opcode::Yield).op(Opcode::Pop);
    b.op(Opcode::ReturnNil);
    let holder = define(&runtime, "holder", b.build().unwrap());

    let mut vm = runtime.interpreter();
    let generator = vm.invoke(&holder, &[]).unwrap();
    let generator = generator.as_generator().unwrap();
    let bump = vm.resume_generator(generator, Resume::Next(Value::Nil)).unwrap();

    assert_eq!(vm.invoke(&bump, &[]).unwrap(), Value::Int(11));
    assert_eq!(vm.invoke(&bump, &[]).unwrap(), Value::Int(12));

    // Resumed on another interpreter, the generator sees the writes
    let mut other = runtime.interpreter();
    let x = other.resume_generator(generator, Resume::Next(Value::Nil)).unwrap();
    assert_eq!(x, Value::Int(12));
}

fn compute() -> Function {
    // async fn compute() { counter += 1; return 42 }
    let mut b = Function::builder().name("compute").is_async(true);
    b.get_global("counter")
        .int(1)
        .op(Opcode::AddInt)
        .set_global("counter");
    b.int(42).op(Opcode::Return);
    b.build().unwrap()
}

#[test]
fn test_promise_awaited_twice_runs_body_once() {
    let (runtime, _) = runtime_with_log();
    runtime.set_global("counter", Value::Int(0));
    define(&runtime, "compute", compute());

    // let p = compute(); return await p + await p
    let mut b = Function::builder().name("main").locals(1);
    b.get_global("compute").op_u8(Opcode::Call, 0).set_local(0);
    b.get_local(0).op(Opcode::Await);
    b.get_local(0).op(Opcode::Await);
    b.op(Opcode::Add).op(Opcode::Return);
    let main = runtime.load(b.build().unwrap()).unwrap();

    assert_eq!(runtime.interpreter().execute(&main).unwrap(), Value::Int(84));
    assert_eq!(runtime.get_global("counter"), Some(Value::Int(1)));
}

#[test]
fn test_async_function_awaits_async_function() {
    let (runtime, _) = runtime_with_log();
    runtime.set_global("counter", Value::Int(0));
    define(&runtime, "compute", compute());
    runtime.define_native("pause", 0, Some(0), |_, _, _| {
        std::thread::sleep(Duration::from_millis(10));
        Ok(Value::Nil)
    });

    // async fn slow() { pause(); return 1 }
    let mut slow = Function::builder().name("slow").is_async(true);
    slow.get_global("pause").op_u8(Opcode::Call, 0).op(Opcode::Pop);
    slow.int(1).op(Opcode::Return);
    define(&runtime, "slow", slow.build().unwrap());

    // async fn outer() { return await slow() + await compute() }
    let mut outer = Function::builder().name("outer").is_async(true);
    outer.get_global("slow").op_u8(Opcode::Call, 0).op(Opcode::Await);
    outer.get_global("compute").op_u8(Opcode::Call, 0).op(Opcode::Await);
    outer.op(Opcode::Add).op(Opcode::Return);
    let outer = define(&runtime, "outer", outer.build().unwrap());

    let mut vm = runtime.interpreter();
    let promise = vm.invoke(&outer, &[]).unwrap();
    let promise = promise.as_promise().unwrap();
    match promise.wait() {
        kestrel_vm::Settlement::Fulfilled(value) => assert_eq!(value, Value::Int(43)),
        kestrel_vm::Settlement::Rejected(thrown) => panic!("rejected: {}", thrown.render()),
    }
}

#[test]
fn test_rejected_promise_throws_at_await() {
    let (runtime, _) = runtime_with_log();

    // async fn fail() { throw Error("nope") }
    let mut fail = Function::builder().name("fail").is_async(true);
    fail.get_global("Error")
        .string("nope")
        .op_u8(Opcode::Call, 1)
        .op(Opcode::Throw);
    define(&runtime, "fail", fail.build().unwrap());

    // try { await fail() } catch (e) { return e.message() }
    let mut b = Function::builder().name("main");
    let from = b.offset();
    b.get_global("fail")
        .op_u8(Opcode::Call, 0)
        .op(Opcode::Await)
        .op(Opcode::Return);
    let to = b.offset();
    let handler = b.offset();
    b.op(Opcode::Pop).invoke("message", 0).op(Opcode::Return);
    b.catch(from, to, handler);
    let main = runtime.load(b.build().unwrap()).unwrap();

    assert_eq!(
        runtime.interpreter().execute(&main).unwrap(),
        Value::string("nope")
    );
}

#[test]
fn test_mutex_held_across_await() {
    let (runtime, _) = runtime_with_log();

    // async fn hold(m, p) { m.lock(); await p; m.unlock(); return 1 }
    let mut b = Function::builder().name("hold").is_async(true).arity(2).locals(2);
    b.get_local(0).invoke("lock", 0).op(Opcode::Pop);
    b.get_local(1).op(Opcode::Await).op(Opcode::Pop);
    b.get_local(0).invoke("unlock", 0).op(Opcode::Pop);
    b.int(1).op(Opcode::Return);
    let hold = define(&runtime, "hold", b.build().unwrap());

    let mutex = Arc::new(VmMutex::new());
    let pending = Promise::new();
    let mut vm = runtime.interpreter();
    let result = vm
        .invoke(
            &hold,
            &[
                Value::Ref(HeapRef::Mutex(mutex.clone())),
                Value::Ref(HeapRef::Promise(pending.clone())),
            ],
        )
        .unwrap();

    while !mutex.is_locked() {
        std::thread::sleep(Duration::from_millis(1));
    }
    std::thread::sleep(Duration::from_millis(50));
    pending.resolve(Value::Nil);

    match result.as_promise().unwrap().wait() {
        kestrel_vm::Settlement::Fulfilled(value) => assert_eq!(value, Value::Int(1)),
        kestrel_vm::Settlement::Rejected(thrown) => panic!("rejected: {}", thrown.render()),
    }
    assert!(!mutex.is_locked());
}

#[test]
fn test_yield_inside_async_rejects() {
    let (runtime, _) = runtime_with_log();

    let mut b = Function::builder().name("confused").is_async(true);
    b.int(1).op(Opcode::Yield).op(Opcode::Return);
    let confused = define(&runtime, "confused", b.build().unwrap());

    let mut vm = runtime.interpreter();
    let promise = vm.invoke(&confused, &[]).unwrap();
    let promise = promise.as_promise().unwrap();
    let kestrel_vm::Settlement::Rejected(thrown) = promise.wait() else {
        panic!("expected the promise to reject");
    };
    let error = thrown.value.as_error().unwrap();
    assert_eq!(&*error.class.name, "ArgumentError");
    assert!(error.message.contains("yield inside async function"));
}

#[test]
fn test_promise_reports_resolution() {
    let (runtime, _) = runtime_with_log();
    runtime.set_global("counter", Value::Int(0));
    let compute = define(&runtime, "compute", compute());

    let mut vm = runtime.interpreter();
    let promise = vm.invoke(&compute, &[]).unwrap();
    assert!(matches!(
        promise.as_promise().unwrap().wait(),
        kestrel_vm::Settlement::Fulfilled(Value::Int(42))
    ));
    assert_eq!(
        vm.invoke_method(&promise, "resolved", &[]).unwrap(),
        Value::Bool(true)
    );
    assert!(matches!(
        vm.invoke_method(&promise, "next", &[]),
        Err(VmError::Argument(_))
    ));
}
