//! Machine-level tests: trampoline safety, dispatch order, transfer unwinding, and the
//! one-shot continuation contract, driven through the public entry points.

use doeff_core::{effects, Continuation, ContinuationId, DoExpr, Exception, Handler, HandlerOutcome, Value};
use pretty_assertions::assert_eq;

use crate::{run, ExecutionError, RunResult};

fn value_of(result: RunResult) -> Value {
    result.unwrap_value()
}

// TRAMPOLINE
// ================================================================================================

#[test]
fn deep_bind_chains_do_not_recurse_into_the_host_stack() {
    fn chain(n: i64) -> DoExpr {
        if n == 0 {
            DoExpr::pure(0)
        } else {
            DoExpr::pure(n).flat_map(|value| Ok(chain(value.as_int()? - 1)))
        }
    }
    let result = run(chain(200_000)).expect("interpreter error");
    assert_eq!(value_of(result), Value::Int(0));
}

#[test]
fn eval_is_an_identity_wrapper() {
    let result = run(DoExpr::pure(7).eval()).expect("interpreter error");
    assert_eq!(value_of(result), Value::Int(7));
}

#[test]
fn apply_collects_effectful_arguments_left_to_right() {
    let func = doeff_core::HostFn::new(|positional, _keyword| {
        let a = positional[0].as_int()?;
        let b = positional[1].as_int()?;
        Ok(Value::Int(a * 10 + b))
    });
    let program = DoExpr::Apply {
        func,
        positional: vec![
            doeff_core::Arg::Perform(effects::tell("first").then(DoExpr::pure(1))),
            doeff_core::Arg::Perform(effects::tell("second").then(DoExpr::pure(2))),
        ],
        keyword: Vec::new(),
        meta: None,
    };
    let result = run(program).expect("interpreter error");
    assert_eq!(result.log(), &[Value::str("first"), Value::str("second")]);
    assert_eq!(value_of(result), Value::Int(12));
}

// DISPATCH ORDER
// ================================================================================================

#[test]
fn handlers_fire_innermost_first() {
    let mark = |name: &'static str| {
        Handler::user(name, move |effect, _k| match effect {
            doeff_core::Effect::Tell { .. } => Ok(HandlerOutcome::Run(
                effects::modify("order", move |seen| {
                    let mut items = seen.as_list()?.to_vec();
                    items.push(Value::str(name));
                    Ok(Value::list(items))
                })
                .then(effects::delegate(None)),
            )),
            _ => Ok(HandlerOutcome::Pass),
        })
    };
    let program = effects::put("order", Value::list([])).then(effects::with_handler(
        mark("outer"),
        effects::with_handler(mark("inner"), effects::tell("x")),
    ));
    let result = run(program).expect("interpreter error");
    assert_eq!(
        result.store().get("order"),
        Some(&Value::list([Value::str("inner"), Value::str("outer")])),
    );
    assert_eq!(result.log(), &[Value::str("x")]);
}

#[test]
fn resume_with_a_foreign_continuation_is_fatal() {
    let handler = Handler::user("rogue", |effect, _k| match effect {
        doeff_core::Effect::Tell { .. } => Ok(HandlerOutcome::Resume(
            Continuation::new(ContinuationId::new(9_999)),
            Value::Unit,
        )),
        _ => Ok(HandlerOutcome::Pass),
    });
    let program = effects::with_handler(handler, effects::tell("x"));
    let error = run(program).unwrap_err();
    assert!(matches!(error, ExecutionError::ForeignResume { .. }));
}

#[test]
fn handler_exceptions_become_effect_failures() {
    let handler = Handler::user("throws", |effect, _k| match effect {
        doeff_core::Effect::Tell { .. } => Err(Exception::value_error("handler blew up")),
        _ => Ok(HandlerOutcome::Pass),
    });
    let program = effects::with_handler(handler, effects::tell("x"));
    let result = run(program).expect("interpreter error");
    let failure = result.failure().unwrap();
    assert_eq!(failure.exception, Exception::value_error("handler blew up"));
    assert_eq!(failure.effect.as_ref().map(|e| e.name()), Some("Tell"));
}

// TRANSFER
// ================================================================================================

#[test]
fn transfer_unwinds_through_finalizers_to_the_capture_point() {
    let program = effects::get_continuation().flat_map(|value| match value {
        Value::Continuation(_) => Ok(effects::finally(
            effects::transfer(DoExpr::Pure(value), DoExpr::pure(42)),
            effects::tell("cleanup"),
        )),
        returned => Ok(DoExpr::Pure(returned)),
    });
    let result = run(program).expect("interpreter error");
    assert_eq!(result.log(), &[Value::str("cleanup")]);
    assert_eq!(value_of(result), Value::Int(42));
}

#[test]
fn transfer_consumes_the_continuation() {
    // After the transfer lands, the same token is dead.
    let program = effects::get_continuation().flat_map(|value| match value {
        Value::Continuation(_) => Ok(effects::put("k", value.clone())
            .then(effects::transfer(DoExpr::Pure(value), DoExpr::pure(1)))),
        _first_return => Ok(effects::get("k").flat_map(|k| {
            Ok(effects::transfer(DoExpr::Pure(k), DoExpr::pure(2)))
        })),
    });
    let error = run(program).unwrap_err();
    assert!(matches!(error, ExecutionError::ContinuationConsumed { .. }));
}

// RUN RESULT
// ================================================================================================

#[test]
fn stats_count_steps_and_frames() {
    let program = effects::tell("a").then(effects::tell("b"));
    let result = run(program).expect("interpreter error");
    let stats = result.stats();
    assert!(stats.total_steps > 0);
    assert!(stats.total_effects_handled >= 2);
    assert!(stats.max_stack_depth >= 1);
}

#[test]
fn trace_records_steps_when_enabled() {
    let options = crate::ExecutionOptions::default().with_trace(true);
    let result = crate::run_with(
        effects::tell("x"),
        Vec::new(),
        crate::Env::default(),
        crate::Store::default(),
        options,
    )
    .expect("interpreter error");
    let trace = result.trace().expect("trace requested");
    assert!(trace.steps().iter().any(|step| step.kind == "Effect" && step.detail == "Tell"));
}
