use std::time::{Duration, Instant};

use yakvm_core::vm::host;
use yakvm_core::{BinaryOp, CodeBuilder, Context, Op, Program, Unwind, Value, VirtualMachine, VmError};

fn run_with(ctx: &Context, program: &Program) -> Result<Value, VmError> {
    let vm = VirtualMachine::default();
    host::install(&vm);
    vm.exec_program(ctx, program)
}

fn run(program: &Program) -> Result<Value, VmError> {
    run_with(&Context::background(), program)
}

fn add_to_s(f: &mut CodeBuilder, n: i64) {
    f.load("s");
    f.push(n);
    f.binary(BinaryOp::Add);
    f.store("s");
}

/// for i := range 2 {
///     try {
///         if mode == "break"    { s += 2; break }
///         if mode == "return"   { s += 4; return s }
///         if mode == "continue" { s += 8; continue }
///     } catch e { s += 1 } finally { return s }
/// }
/// return s
fn loop_with_finally(mode: &str) -> Program {
    let mut b = CodeBuilder::new();
    b.function("f", &["mode"], false, |f| {
        f.push(0i64);
        f.define("s");
        f.push(2i64);
        f.emit(Op::IterStart);
        let next = f.emit(Op::IterNext { vars: 0, exit: usize::MAX });
        f.enter_scope();
        f.function("finally", &[], false, |fin| {
            fin.load("s");
            fin.emit(Op::Return);
        });
        let try_begin = f.emit(Op::TryBegin { catch: usize::MAX, finally: true });

        f.load("mode");
        f.push("break");
        f.binary(BinaryOp::Eq);
        let skip = f.jump_forward(Op::JumpIfFalse);
        add_to_s(f, 2);
        let brk = f.break_to(Unwind { target: usize::MAX, scopes: 1, catches: 1, iterators: 1, finallies: 1 });
        f.patch_here(skip);

        f.load("mode");
        f.push("return");
        f.binary(BinaryOp::Eq);
        let skip = f.jump_forward(Op::JumpIfFalse);
        add_to_s(f, 4);
        f.load("s");
        f.emit(Op::Return);
        f.patch_here(skip);

        f.load("mode");
        f.push("continue");
        f.binary(BinaryOp::Eq);
        let skip = f.jump_forward(Op::JumpIfFalse);
        add_to_s(f, 8);
        f.continue_to(Unwind { target: next, scopes: 1, catches: 1, iterators: 0, finallies: 1 });
        f.patch_here(skip);

        f.emit(Op::TryEnd);
        let over = f.jump_forward(Op::Jump);
        f.patch_here(try_begin);
        f.define("e");
        add_to_s(f, 1);
        f.patch_here(over);
        f.emit(Op::Finally);
        f.exit_scope();
        f.emit(Op::Jump(next));

        f.patch_here(next);
        f.emit(Op::IterEnd);
        f.patch_here(brk);
        f.load("s");
        f.emit(Op::Return);
    });
    b.define("f");
    b.load("f");
    b.push(mode);
    b.call(1);
    b.finish()
}

#[test]
fn finally_runs_once_on_every_exit_path() {
    assert_eq!(run(&loop_with_finally("break")).unwrap(), Value::from(2i64));
    assert_eq!(run(&loop_with_finally("return")).unwrap(), Value::from(4i64));
    assert_eq!(run(&loop_with_finally("continue")).unwrap(), Value::from(16i64));
}

/// try { <body> } catch e { <handler> } finally { <finally> }
///
/// The handler starts with the caught value on the stack.
fn try_statement(
    b: &mut CodeBuilder,
    body: impl FnOnce(&mut CodeBuilder),
    handler: impl FnOnce(&mut CodeBuilder),
    finally: impl FnOnce(&mut CodeBuilder),
) {
    b.function("finally", &[], false, finally);
    let try_begin = b.emit(Op::TryBegin { catch: usize::MAX, finally: true });
    body(b);
    b.emit(Op::TryEnd);
    let over = b.jump_forward(Op::Jump);
    b.patch_here(try_begin);
    handler(b);
    b.patch_here(over);
    b.emit(Op::Finally);
}

fn bump(b: &mut CodeBuilder, name: &str) {
    b.load(name);
    b.push(1i64);
    b.binary(BinaryOp::Add);
    b.store(name);
}

fn discard(b: &mut CodeBuilder) {
    b.emit(Op::Pop);
}

#[test]
fn finally_runs_when_the_statement_completes() {
    // c = 0; try { panic(1) } catch e { c++ } finally { c++ }; c
    let mut b = CodeBuilder::new();
    b.push(0i64);
    b.define("c");
    try_statement(
        &mut b,
        |t| {
            t.push(1i64);
            t.emit(Op::Panic);
        },
        |h| {
            discard(h);
            bump(h, "c");
        },
        |f| bump(f, "c"),
    );
    b.load("c");
    assert_eq!(run(&b.finish()).unwrap(), Value::from(2i64));

    // c = 0; try { c++ } catch e {} finally { c++ }; c
    let mut b = CodeBuilder::new();
    b.push(0i64);
    b.define("c");
    try_statement(&mut b, |t| bump(t, "c"), discard, |f| bump(f, "c"));
    b.load("c");
    assert_eq!(run(&b.finish()).unwrap(), Value::from(2i64));
}

#[test]
fn finally_inside_a_loop_runs_every_iteration() {
    // c = 0; for range 3 { try {} finally { c++ } }; c
    let mut b = CodeBuilder::new();
    b.push(0i64);
    b.define("c");
    b.push(3i64);
    b.emit(Op::IterStart);
    let next = b.emit(Op::IterNext { vars: 0, exit: usize::MAX });
    b.enter_scope();
    try_statement(&mut b, |_| {}, discard, |f| bump(f, "c"));
    b.exit_scope();
    b.emit(Op::Jump(next));
    b.patch_here(next);
    b.emit(Op::IterEnd);
    b.load("c");
    assert_eq!(run(&b.finish()).unwrap(), Value::from(3i64));
}

#[test]
fn finally_return_replaces_a_pending_return() {
    // seen = 0; fn f() { try { return 1 } catch e {} finally { seen++; [return 2] } }; [f(), seen]
    let program = |finally_returns: bool| {
        let mut b = CodeBuilder::new();
        b.push(0i64);
        b.define("seen");
        b.function("f", &[], false, |f| {
            try_statement(
                f,
                |t| {
                    t.push(1i64);
                    t.emit(Op::Return);
                },
                discard,
                |fin| {
                    bump(fin, "seen");
                    if finally_returns {
                        fin.push(2i64);
                        fin.emit(Op::Return);
                    }
                },
            );
        });
        b.call(0);
        b.load("seen");
        b.emit(Op::NewList(2));
        b.finish()
    };
    let pair = |a: i64, b: i64| Value::list(vec![Value::from(a), Value::from(b)]);
    assert_eq!(run(&program(true)).unwrap().to_string(), pair(2, 1).to_string());
    assert_eq!(run(&program(false)).unwrap().to_string(), pair(1, 1).to_string());
}

#[test]
fn escaping_errors_run_inner_finally_before_outer_catch() {
    // log = ""
    // try {
    //     try { panic("x") } catch e { panic(e) } finally { log += "f" }
    // } catch e { log += "c" + e }
    // log
    fn append(b: &mut CodeBuilder, text: &str) {
        b.load("log");
        b.push(text);
        b.binary(BinaryOp::Add);
        b.store("log");
    }
    let mut b = CodeBuilder::new();
    b.push("");
    b.define("log");
    let outer = b.emit(Op::TryBegin { catch: usize::MAX, finally: false });
    try_statement(
        &mut b,
        |t| {
            t.push("x");
            t.emit(Op::Panic);
        },
        |h| {
            h.emit(Op::Panic);
        },
        |f| append(f, "f"),
    );
    b.emit(Op::TryEnd);
    let over = b.jump_forward(Op::Jump);
    b.patch_here(outer);
    b.define("e");
    append(&mut b, "c");
    b.load("log");
    b.load("e");
    b.binary(BinaryOp::Add);
    b.store("log");
    b.patch_here(over);
    b.load("log");

    assert_eq!(run(&b.finish()).unwrap(), Value::from("fcx"));
}

#[test]
fn long_sleeps_stop_soon_after_cancellation() {
    let mut b = CodeBuilder::new();
    b.load("sleep");
    b.push(2i64);
    b.call(1);
    let ctx = Context::with_timeout(&Context::background(), Duration::from_millis(400));
    let started = Instant::now();
    let err = run_with(&ctx, &b.finish()).unwrap_err();
    assert!(err.is_cancelled(), "{}", err);
    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
}

/// try { <body> } catch e { caught = e }; caught
fn try_catch(body: impl FnOnce(&mut CodeBuilder)) -> Program {
    let mut b = CodeBuilder::new();
    b.push_undefined();
    b.define("caught");
    b.enter_scope();
    let try_begin = b.emit(Op::TryBegin { catch: usize::MAX, finally: false });
    body(&mut b);
    b.emit(Op::TryEnd);
    let over = b.jump_forward(Op::Jump);
    b.patch_here(try_begin);
    b.store("caught");
    b.patch_here(over);
    b.exit_scope();
    b.load("caught");
    b.finish()
}

#[test]
fn catch_binds_the_panic_value() {
    let program = try_catch(|b| {
        b.push("boom");
        b.emit(Op::Panic);
    });
    assert_eq!(run(&program).unwrap(), Value::from("boom"));
}

#[test]
fn runtime_errors_are_catchable() {
    let program = try_catch(|b| {
        b.push(1i64);
        b.push(0i64);
        b.binary(BinaryOp::Div);
        b.emit(Op::Pop);
    });
    assert_eq!(run(&program).unwrap(), Value::from("runtime error: integer divide by zero"));
}

#[test]
fn errors_cross_frames_to_the_nearest_catch() {
    let program = try_catch(|b| {
        b.function("thrower", &[], false, |f| {
            f.push("deep");
            f.emit(Op::Panic);
        });
        b.call(0);
        b.emit(Op::Pop);
    });
    assert_eq!(run(&program).unwrap(), Value::from("deep"));
}

#[test]
fn uncaught_panic_reaches_the_host() {
    let mut b = CodeBuilder::new();
    b.push("unhandled");
    b.emit(Op::Panic);
    let err = run(&b.finish()).unwrap_err();
    assert!(matches!(err, VmError::Panic(ref v) if *v == Value::from("unhandled")));
}

#[test]
fn failed_assertion_panics_with_message() {
    let mut b = CodeBuilder::new();
    b.push(false);
    b.push("x must be set");
    b.emit(Op::Assert { message: true });
    let err = run(&b.finish()).unwrap_err();
    assert_eq!(err.to_string(), "panic: assert failed: x must be set");
}

/// r = undefined
/// fn g() { defer fn() { r = recover() }(); panic("x") }
/// g(); r
#[test]
fn deferred_recover_swallows_the_error() {
    let mut b = CodeBuilder::new();
    b.push_undefined();
    b.define("r");
    b.function("g", &[], false, |f| {
        f.function("rescue", &[], false, |d| {
            d.emit(Op::Recover);
            d.store("r");
        });
        f.emit(Op::Defer { argc: 0 });
        f.push("x");
        f.emit(Op::Panic);
    });
    b.call(0);
    b.emit(Op::Pop);
    b.load("r");

    assert_eq!(run(&b.finish()).unwrap(), Value::from("x"));
}

#[test]
fn defers_run_lifo_and_errors_in_defers_replace_pending_ones() {
    // log = ""; fn g() { defer add("a"); defer add("b"); defer panic("late"); panic("early") }
    let mut b = CodeBuilder::new();
    b.push("");
    b.define("log");
    b.function("add", &["x"], false, |f| {
        f.load("log");
        f.load("x");
        f.binary(BinaryOp::Add);
        f.store("log");
    });
    b.define("add");
    b.function("g", &[], false, |f| {
        for tag in ["a", "b"] {
            f.load("add");
            f.push(tag);
            f.emit(Op::Defer { argc: 1 });
        }
        f.function("late", &[], false, |d| {
            d.push("late");
            d.emit(Op::Panic);
        });
        f.emit(Op::Defer { argc: 0 });
        f.push("early");
        f.emit(Op::Panic);
    });
    b.define("g");
    b.load("g");
    b.call(0);

    let vm = VirtualMachine::default();
    let err = vm.exec_program(&Context::background(), &b.finish()).unwrap_err();
    assert!(matches!(err, VmError::Panic(ref v) if *v == Value::from("late")));
    let root = vm.root_scope().unwrap();
    assert_eq!(root.get_value_by_name("log"), Some(Value::from("ba")));
}

#[test]
fn recover_without_error_is_undefined() {
    let mut b = CodeBuilder::new();
    b.emit(Op::Recover);
    assert_eq!(run(&b.finish()).unwrap(), Value::undefined());
}

#[test]
fn cancellation_is_not_caught() {
    let program = try_catch(|b| {
        b.load("sleep");
        b.push(30i64);
        b.call(1);
        b.emit(Op::Pop);
    });
    let ctx = Context::with_timeout(&Context::background(), Duration::from_millis(100));
    let started = Instant::now();
    let err = run_with(&ctx, &program).unwrap_err();
    assert!(err.is_cancelled(), "{}", err);
    assert_eq!(err.to_string(), "context deadline exceeded");
    assert!(started.elapsed() < Duration::from_secs(5));
}
