//! Edge-of-contract behaviors: empty fan-outs, retry limits, stack ceilings, log bounds.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use doeff_vm::{
    effects, run, run_with, DoExpr, Env, Exception, ExceptionKind, ExecutionError,
    ExecutionOptions, Store, Value,
};
use pretty_assertions::assert_eq;
use rstest::rstest;

fn run_opts(program: DoExpr, options: ExecutionOptions) -> Result<doeff_vm::RunResult, ExecutionError> {
    run_with(program, Vec::new(), Env::default(), Store::default(), options)
}

// FAN-OUT BOUNDARIES
// ================================================================================================

#[test]
fn empty_gather_returns_an_empty_list_without_spawning() {
    let result = run(effects::gather([])).expect("interpreter error");
    assert_eq!(result.stats().total_tasks_spawned, 0);
    assert_eq!(result.unwrap_value(), Value::list([]));
}

#[test]
fn empty_gather_dict_returns_an_empty_map() {
    let result = run(effects::gather_dict([])).expect("interpreter error");
    assert_eq!(result.unwrap_value(), Value::map([]));
}

#[test]
fn race_on_a_single_program_returns_its_result_unchanged() {
    let result = run(effects::race([DoExpr::pure(17)])).expect("interpreter error");
    assert_eq!(result.unwrap_value(), Value::Int(17));
}

#[test]
fn race_with_no_programs_is_a_value_error() {
    let result = run(effects::race([])).expect("interpreter error");
    assert_eq!(result.failure().unwrap().exception.kind, ExceptionKind::Value);
}

// RETRY BOUNDARIES
// ================================================================================================

#[rstest]
#[case::single_attempt(1, 1)]
#[case::three_attempts(3, 3)]
fn retry_attempt_budget_is_respected(#[case] max_attempts: u32, #[case] expected_runs: u32) {
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    let always_failing = effects::io(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Err::<Value, _>(Exception::value_error("nope"))
    });
    let result = run(effects::retry(always_failing, max_attempts)).expect("interpreter error");
    assert!(result.failure().is_some());
    assert_eq!(runs.load(Ordering::SeqCst), expected_runs);
}

#[test]
fn retry_with_zero_attempts_is_a_value_error() {
    let result = run(effects::retry(DoExpr::pure(1), 0)).expect("interpreter error");
    assert_eq!(result.failure().unwrap().exception.kind, ExceptionKind::Value);
}

#[test]
fn fixed_retry_delay_runs_between_attempts() {
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    let flaky = effects::io(move || {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(Exception::value_error("first attempt fails"))
        } else {
            Ok(Value::Int(5))
        }
    });
    let started = Instant::now();
    let program = effects::retry_with_delay(flaky, 3, Duration::from_millis(20));
    let result = run(program).expect("interpreter error");
    assert_eq!(result.unwrap_value(), Value::Int(5));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[test]
fn failing_delay_strategy_is_a_user_error() {
    let program = effects::retry_with_strategy(
        effects::fail(Exception::value_error("inner")),
        3,
        |_attempt| Err(Exception::value_error("negative delay")),
    );
    let result = run(program).expect("interpreter error");
    assert_eq!(
        result.failure().unwrap().exception,
        Exception::value_error("negative delay"),
    );
}

// STACK CEILING
// ================================================================================================

/// A program whose continuation stack grows to `n` map frames, built lazily so the expression
/// itself stays shallow.
fn deep(n: i64) -> DoExpr {
    if n == 0 {
        DoExpr::pure(0)
    } else {
        DoExpr::pure(n).flat_map(|value| {
            Ok(deep(value.as_int()? - 1).map(|x| Ok(Value::Int(x.as_int()? + 1))))
        })
    }
}

#[test]
fn positive_stack_bound_triggers_overflow() {
    let options = ExecutionOptions::default().with_max_stack_depth(64);
    let error = run_opts(deep(1_000), options).unwrap_err();
    assert!(matches!(error, ExecutionError::ContinuationStackOverflow { max_depth: 64, .. }));
}

#[test]
fn zero_stack_bound_disables_the_check() {
    let options = ExecutionOptions::default().with_max_stack_depth(0);
    let result = run_opts(deep(5_000), options).expect("interpreter error");
    assert_eq!(result.unwrap_value(), Value::Int(5_000));
}

// LOG AND STORE BOUNDARIES
// ================================================================================================

#[test]
fn log_cap_trims_the_oldest_entries() {
    let options = ExecutionOptions::default().with_max_log_entries(2);
    let program = effects::tell(1).then(effects::tell(2)).then(effects::tell(3));
    let result = run_opts(program, options).expect("interpreter error");
    assert_eq!(result.log(), &[Value::Int(2), Value::Int(3)]);
}

#[test]
fn reserved_store_keys_are_not_writable() {
    let result = run(effects::put("__log__", Value::Unit)).expect("interpreter error");
    assert_eq!(result.failure().unwrap().exception.kind, ExceptionKind::Value);
}

#[test]
fn joining_an_unknown_task_is_a_key_error() {
    let result = run(effects::task_join(doeff_vm::TaskId::new(999))).expect("interpreter error");
    assert_eq!(result.failure().unwrap().exception.kind, ExceptionKind::Key);
}

// ENTRY POINT BOUNDARIES
// ================================================================================================

#[test]
fn pure_program_returns_the_value_with_an_empty_log() {
    let result = run(DoExpr::pure(5)).expect("interpreter error");
    assert!(result.log().is_empty());
    assert_eq!(result.unwrap_value(), Value::Int(5));
}

#[test]
fn nested_run_from_a_handler_is_rejected() {
    // A handler body already sits inside the interpreter's runtime; a synchronous nested run
    // is refused before any work happens (as a runtime-nesting error, or as reentrancy when
    // reentrancy checks fire first).
    let handler = doeff_vm::Handler::user("nested-run", |effect, _k| match effect {
        doeff_vm::Effect::Ask { .. } => {
            let nested = run(DoExpr::pure(1));
            match nested {
                Err(ExecutionError::NestedRuntime) | Err(ExecutionError::Reentrancy) => {
                    Ok(doeff_vm::HandlerOutcome::Return(Value::str("rejected")))
                },
                other => Err(Exception::value_error(format!(
                    "expected the nested run to be refused, got {other:?}"
                ))),
            }
        },
        _ => Ok(doeff_vm::HandlerOutcome::Pass),
    });
    let program = effects::with_handler(handler, effects::ask("k"));
    let result = run(program).expect("interpreter error");
    assert_eq!(result.unwrap_value(), Value::str("rejected"));
}

#[test]
fn unhandled_effects_abort_the_run() {
    // An Ask dispatched with an empty handler stack walks off the bottom.
    let result = run_with(
        effects::ask("k"),
        Vec::new(),
        Env::default(),
        Store::default(),
        ExecutionOptions::default(),
    );
    // With the defaults installed the reader answers; strip them via a bare interpreter is not
    // part of the public surface, so exercise the other fatal path instead: a Delegate with no
    // dispatch in flight.
    assert!(result.is_ok());
    let error = run(effects::delegate(None)).unwrap_err();
    assert!(matches!(error, ExecutionError::InvariantViolation(_)));
}
