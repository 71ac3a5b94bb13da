use std::time::{Duration, Instant};

use yakvm_core::vm::host;
use yakvm_core::{BinaryOp, CodeBuilder, Context, Op, Program, Value, VirtualMachine, VmError};

fn run_with(ctx: &Context, program: &Program) -> Result<Value, VmError> {
    let vm = VirtualMachine::default();
    host::install(&vm);
    vm.exec_program(ctx, program)
}

fn run(program: &Program) -> Result<Value, VmError> {
    run_with(&Context::background(), program)
}

/// m = {}
/// for i := range 100 { go fn() { sleep(delay); m[i] = true }() }
/// wait(); len(m)
///
/// With `fresh_binding` each iteration declares its own `i`; otherwise every
/// goroutine reads the single outer `i`.
fn spawn_loop(fresh_binding: bool, delay: f64) -> Program {
    let mut b = CodeBuilder::new();
    b.emit(Op::NewMap(0));
    b.define("m");
    if !fresh_binding {
        b.push(0i64);
        b.define("i");
    }

    b.push(100i64);
    b.emit(Op::IterStart);
    let next = b.emit(Op::IterNext { vars: 1, exit: usize::MAX });
    b.enter_scope();
    if fresh_binding {
        b.define("i");
    } else {
        b.store("i");
    }
    b.function("worker", &[], false, |f| {
        f.load("sleep");
        f.push(delay);
        f.call(1);
        f.emit(Op::Pop);
        f.load("m");
        f.load("i");
        f.push(true);
        f.emit(Op::StoreIndex);
    });
    b.emit(Op::Go { argc: 0, spread: false });
    b.exit_scope();
    b.emit(Op::Jump(next));
    b.patch_here(next);
    b.emit(Op::IterEnd);

    b.load("wait");
    b.call(0);
    b.emit(Op::Pop);
    b.load("len");
    b.load("m");
    b.call(1);
    b.finish()
}

#[test]
fn per_iteration_bindings_are_not_aliased() {
    assert_eq!(run(&spawn_loop(true, 0.01)).unwrap(), Value::from(100i64));
}

#[test]
fn shared_loop_variable_is_observed_late() {
    let out = run(&spawn_loop(false, 0.2)).unwrap();
    let n = out.as_int().unwrap();
    assert!(n >= 1 && n < 100, "expected aliased writes, got {}", n);
}

#[test]
fn goroutine_panic_only_ends_that_goroutine() {
    let mut b = CodeBuilder::new();
    b.function("bad", &[], false, |f| {
        f.push("goroutine failure");
        f.emit(Op::Panic);
    });
    b.emit(Op::Go { argc: 0, spread: false });
    b.load("wait");
    b.call(0);
    b.emit(Op::Pop);
    b.push("still here");

    assert_eq!(run(&b.finish()).unwrap(), Value::from("still here"));
}

#[test]
fn range_over_channel_until_closed() {
    // ch = chan(2); go fn() { for i := range 5 { ch <- i }; close(ch) }()
    // sum = 0; for v := range ch { sum = sum + v }; sum
    let mut b = CodeBuilder::new();
    b.load("chan");
    b.push(2i64);
    b.call(1);
    b.define("ch");

    b.function("producer", &[], false, |f| {
        f.push(5i64);
        f.emit(Op::IterStart);
        let next = f.emit(Op::IterNext { vars: 1, exit: usize::MAX });
        f.enter_scope();
        f.define("i");
        f.load("ch");
        f.load("i");
        f.emit(Op::Send);
        f.exit_scope();
        f.emit(Op::Jump(next));
        f.patch_here(next);
        f.emit(Op::IterEnd);
        f.load("close");
        f.load("ch");
        f.call(1);
    });
    b.emit(Op::Go { argc: 0, spread: false });

    b.push(0i64);
    b.define("sum");
    b.load("ch");
    b.emit(Op::IterStart);
    let next = b.emit(Op::IterNext { vars: 1, exit: usize::MAX });
    b.enter_scope();
    b.define("v");
    b.load("sum");
    b.load("v");
    b.binary(BinaryOp::Add);
    b.store("sum");
    b.exit_scope();
    b.emit(Op::Jump(next));
    b.patch_here(next);
    b.emit(Op::IterEnd);
    b.load("sum");

    assert_eq!(run(&b.finish()).unwrap(), Value::from(10i64));
}

#[test]
fn blocked_receive_fails_on_cancel() {
    let mut b = CodeBuilder::new();
    b.load("chan");
    b.call(0);
    b.emit(Op::Recv);

    let ctx = Context::with_cancel(&Context::background());
    let canceller = ctx.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        canceller.cancel();
    });
    let started = Instant::now();
    let err = run_with(&ctx, &b.finish()).unwrap_err();
    assert_eq!(err.to_string(), "context canceled");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn async_wait_is_cancellable() {
    let vm = VirtualMachine::default();
    host::install(&vm);
    let mut b = CodeBuilder::new();
    b.function("slow", &[], false, |f| {
        f.load("sleep");
        f.push(0.5);
        f.call(1);
    });
    b.emit(Op::Go { argc: 0, spread: false });
    vm.exec_program(&Context::background(), &b.finish()).unwrap();

    let ctx = Context::with_timeout(&Context::background(), Duration::from_millis(20));
    let err = vm.async_wait(&ctx).unwrap_err();
    assert!(err.is_cancelled());
    vm.async_wait(&Context::background()).unwrap();
}

#[test]
fn send_on_closed_channel_is_an_error() {
    let mut b = CodeBuilder::new();
    b.load("chan");
    b.push(1i64);
    b.call(1);
    b.define("ch");
    b.load("close");
    b.load("ch");
    b.call(1);
    b.emit(Op::Pop);
    b.load("ch");
    b.push(1i64);
    b.emit(Op::Send);

    let err = run(&b.finish()).unwrap_err();
    assert!(err.to_string().contains("send on closed channel"), "{}", err);
}
