//! End-to-end scenarios driving the full machine: reader/state/writer semantics, failure
//! handling, cooperative scheduling, lazy environments, and cancellation.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use doeff_vm::{
    effects, run, run_with, sleep, Env, Exception, ExceptionKind, ExecutionOptions, Handler,
    HandlerOutcome, Store, Value,
};
use pretty_assertions::assert_eq;

fn run_default(program: doeff_vm::DoExpr) -> doeff_vm::RunResult {
    run(program).expect("interpreter error")
}

fn run_in(program: doeff_vm::DoExpr, env: Env) -> doeff_vm::RunResult {
    run_with(
        program,
        Vec::new(),
        env,
        Store::default(),
        ExecutionOptions::default(),
    )
    .expect("interpreter error")
}

// READER / STATE / WRITER
// ================================================================================================

#[test]
fn ask_under_local_sees_the_inner_binding() {
    let program = effects::local(
        [("k".to_string(), Value::Int(2))],
        effects::ask("k"),
    );
    assert_eq!(run_default(program).unwrap_value(), Value::Int(2));
}

#[test]
fn local_falls_back_to_the_outer_environment() {
    let program = effects::local(
        [("other".to_string(), Value::Int(9))],
        effects::ask("k"),
    );
    let env = Env::new([("k".to_string(), Value::Int(7))]);
    assert_eq!(run_in(program, env).unwrap_value(), Value::Int(7));
}

#[test]
fn local_restores_the_environment_on_exit() {
    let program = effects::local([("k".to_string(), Value::Int(2))], effects::ask("k"))
        .then(effects::ask("k"));
    let env = Env::new([("k".to_string(), Value::Int(1))]);
    assert_eq!(run_in(program, env).unwrap_value(), Value::Int(1));
}

#[test]
fn ask_missing_key_is_a_key_error() {
    let result = run_default(effects::ask("absent"));
    assert_eq!(result.failure().unwrap().exception.kind, ExceptionKind::Key);
}

#[test]
fn state_counter_round_trip() {
    let program = effects::put("n", 1)
        .then(effects::modify("n", |v| Ok(Value::Int(v.as_int()? + 1))))
        .then(effects::get("n"));
    let result = run_default(program);
    assert_eq!(result.store().get("n"), Some(&Value::Int(2)));
    assert_eq!(result.unwrap_value(), Value::Int(2));
}

#[test]
fn listen_captures_only_the_body_log() {
    let program = effects::tell("before")
        .then(effects::listen(effects::tell("m")))
        .then(effects::tell("after"));
    let result = run_default(program);
    assert_eq!(
        result.log(),
        &[Value::str("before"), Value::str("m"), Value::str("after")],
    );
}

#[test]
fn listen_returns_the_value_and_the_slice() {
    let program = effects::listen(effects::tell("m").then(doeff_vm::DoExpr::pure(5)));
    let value = run_default(program).unwrap_value();
    assert_eq!(
        value,
        Value::list([Value::Int(5), Value::list([Value::str("m")])]),
    );
}

// FAILURE HANDLING
// ================================================================================================

#[test]
fn catch_then_finally_ordering() {
    let program = effects::finally(
        effects::catch(
            effects::fail(Exception::value_error("x")),
            |_error| Ok(doeff_vm::DoExpr::pure(7)),
        ),
        effects::tell("cleanup"),
    );
    let result = run_default(program);
    assert_eq!(result.log(), &[Value::str("cleanup")]);
    assert_eq!(result.unwrap_value(), Value::Int(7));
}

#[test]
fn finally_runs_on_the_error_path_and_the_error_survives() {
    let program = effects::finally(
        effects::fail(Exception::value_error("boom")),
        effects::tell("cleanup"),
    );
    let result = run_default(program);
    assert_eq!(result.log(), &[Value::str("cleanup")]);
    assert_eq!(
        result.failure().unwrap().exception,
        Exception::value_error("boom"),
    );
}

#[test]
fn failing_finalizer_never_replaces_the_original_error() {
    let program = effects::finally(
        effects::fail(Exception::value_error("original")),
        effects::fail(Exception::other("CleanupError", "late")),
    );
    let result = run_default(program);
    let failure = result.failure().unwrap();
    assert_eq!(failure.exception, Exception::value_error("original"));
    assert_eq!(failure.exception.suppressed.len(), 1);
}

#[test]
fn safe_wraps_both_arms() {
    let ok = run_default(effects::safe(doeff_vm::DoExpr::pure(3))).unwrap_value();
    assert_eq!(ok, Value::ok(Value::Int(3)));

    let err =
        run_default(effects::safe(effects::fail(Exception::value_error("e")))).unwrap_value();
    assert_eq!(err, Value::err(Exception::value_error("e")));
}

#[test]
fn unwrap_inverts_safe() {
    let program = effects::unwrap(effects::safe(doeff_vm::DoExpr::pure(11)));
    assert_eq!(run_default(program).unwrap_value(), Value::Int(11));

    let program = effects::unwrap(effects::safe(effects::fail(Exception::value_error("e"))));
    let result = run_default(program);
    assert_eq!(result.failure().unwrap().exception, Exception::value_error("e"));
}

#[test]
fn recover_substitutes_a_fallback_program() {
    let program = effects::recover(
        effects::fail(Exception::value_error("x")),
        effects::tell("recovered").then(doeff_vm::DoExpr::pure(1)),
    );
    let result = run_default(program);
    assert_eq!(result.log(), &[Value::str("recovered")]);
    assert_eq!(result.unwrap_value(), Value::Int(1));
}

#[test]
fn retry_retries_until_success() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let flaky = effects::io(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
            Err(Exception::value_error("flaky"))
        } else {
            Ok(Value::Int(99))
        }
    });
    let result = run_default(effects::retry(flaky, 5));
    assert_eq!(result.unwrap_value(), Value::Int(99));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[test]
fn retry_surfaces_the_last_error_when_exhausted() {
    let program = effects::retry(effects::fail(Exception::value_error("always")), 3);
    let result = run_default(program);
    assert_eq!(result.failure().unwrap().exception, Exception::value_error("always"));
}

#[test]
fn first_success_resets_state_but_keeps_logs() {
    let attempt = |tag: &str, fail_after: bool| {
        let tag_value = Value::str(tag);
        let base = effects::put("probe", tag_value).then(effects::tell(tag));
        if fail_after {
            base.then(effects::fail(Exception::value_error("attempt failed")))
        } else {
            base.then(effects::get("probe"))
        }
    };
    let program = effects::first_success([
        attempt("first", true),
        attempt("second", false),
    ]);
    let result = run_default(program);
    assert_eq!(result.log(), &[Value::str("first"), Value::str("second")]);
    assert_eq!(result.store().get("probe"), Some(&Value::str("second")));
    assert_eq!(result.unwrap_value(), Value::str("second"));
}

// SCHEDULER
// ================================================================================================

#[test]
fn gather_preserves_input_order_under_skew() {
    let program = effects::gather([
        sleep(Duration::from_millis(30)).then(doeff_vm::DoExpr::pure("a")),
        sleep(Duration::from_millis(5)).then(doeff_vm::DoExpr::pure("b")),
    ]);
    let value = run_default(program).unwrap_value();
    assert_eq!(value, Value::list([Value::str("a"), Value::str("b")]));
}

#[test]
fn gather_merges_logs_in_spawn_order() {
    let program = effects::gather([
        sleep(Duration::from_millis(20)).then(effects::tell("slow")),
        effects::tell("fast"),
    ]);
    let result = run_default(program);
    assert_eq!(result.log(), &[Value::str("slow"), Value::str("fast")]);
}

#[test]
fn gather_dict_recombines_by_key() {
    let program = effects::gather_dict([
        ("a".to_string(), doeff_vm::DoExpr::pure(1)),
        ("b".to_string(), doeff_vm::DoExpr::pure(2)),
    ]);
    let value = run_default(program).unwrap_value();
    assert_eq!(
        value,
        Value::map([
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::Int(2)),
        ]),
    );
}

#[test]
fn gather_fails_fast_and_cancels_siblings() {
    let cancelled_finalizers = Arc::new(AtomicU32::new(0));
    let recorder = cancelled_finalizers.clone();
    let slow = effects::finally(
        sleep(Duration::from_secs(5)),
        effects::io(move || {
            recorder.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Unit)
        }),
    );
    let program = effects::gather([
        slow,
        effects::fail(Exception::value_error("fast failure")),
    ]);
    let result = run_default(program);
    assert_eq!(
        result.failure().unwrap().exception,
        Exception::value_error("fast failure"),
    );
    assert_eq!(cancelled_finalizers.load(Ordering::SeqCst), 1);
}

#[test]
fn spawn_and_join_merge_the_child_store() {
    let child = effects::put("written_by_child", Value::Int(42)).then(effects::tell("child log"));
    let program = effects::spawn(child).flat_map(|handle| {
        Ok(effects::task_join(handle.as_task()?))
    });
    let result = run_default(program);
    assert_eq!(result.store().get("written_by_child"), Some(&Value::Int(42)));
    assert_eq!(result.log(), &[Value::str("child log")]);
}

#[test]
fn tasks_see_their_own_store_not_their_siblings() {
    // Two children mutate the same key; each sees its own snapshot while running.
    let child = |tag: i64| {
        effects::put("slot", Value::Int(tag))
            .then(sleep(Duration::from_millis(5)))
            .then(effects::get("slot"))
    };
    let program = effects::gather([child(1), child(2)]);
    let value = run_default(program).unwrap_value();
    assert_eq!(value, Value::list([Value::Int(1), Value::Int(2)]));
}

#[test]
fn join_reraises_the_child_failure() {
    let child = effects::fail(Exception::value_error("child failed"));
    let program = effects::spawn(child).flat_map(|handle| {
        Ok(effects::task_join(handle.as_task()?))
    });
    let result = run_default(program);
    assert_eq!(
        result.failure().unwrap().exception,
        Exception::value_error("child failed"),
    );
}

#[test]
fn race_returns_the_winner_and_cancels_the_loser_running_its_finalizers() {
    let finalizer_runs = Arc::new(AtomicU32::new(0));
    let recorder = finalizer_runs.clone();
    let slow = effects::finally(
        sleep(Duration::from_secs(5)).then(doeff_vm::DoExpr::pure("slow")),
        effects::io(move || {
            recorder.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Unit)
        }),
    );
    let program = effects::race([slow, doeff_vm::DoExpr::pure("done")]);
    let result = run_default(program);
    assert_eq!(result.unwrap_value(), Value::str("done"));
    assert_eq!(finalizer_runs.load(Ordering::SeqCst), 1);
}

#[test]
fn daemons_are_cancelled_when_their_parent_completes() {
    let finalizer_runs = Arc::new(AtomicU32::new(0));
    let recorder = finalizer_runs.clone();
    let daemon = effects::finally(
        sleep(Duration::from_secs(5)),
        effects::io(move || {
            recorder.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Unit)
        }),
    );
    let parent = effects::spawn_with(daemon, doeff_vm::SpawnBackend::Daemon)
        .then(sleep(Duration::from_millis(5)))
        .then(doeff_vm::DoExpr::pure("parent done"));
    let program =
        effects::spawn(parent).flat_map(|handle| Ok(effects::task_join(handle.as_task()?)));
    let result = run_default(program);
    assert_eq!(result.unwrap_value(), Value::str("parent done"));
    assert_eq!(finalizer_runs.load(Ordering::SeqCst), 1);
}

#[test]
fn timeouts_are_a_race_between_the_body_and_a_sleeping_failure() {
    let slow = sleep(Duration::from_secs(5)).then(doeff_vm::DoExpr::pure("too late"));
    let deadline = sleep(Duration::from_millis(5))
        .then(effects::fail(Exception::timeout("deadline exceeded")));
    let result = run_default(effects::race([slow, deadline]));
    assert_eq!(result.failure().unwrap().exception.kind, ExceptionKind::Timeout);
}

#[test]
fn cancel_of_a_completed_task_is_a_no_op() {
    let program = effects::spawn(doeff_vm::DoExpr::pure(1)).flat_map(|handle| {
        let task = handle.as_task()?;
        Ok(effects::task_join(task)
            .then(effects::task_cancel(task))
            .then(doeff_vm::DoExpr::pure("still fine")))
    });
    assert_eq!(run_default(program).unwrap_value(), Value::str("still fine"));
}

#[test]
fn promises_synchronize_sibling_tasks() {
    let program = effects::create_promise().flat_map(|promise_value| {
        let promise = promise_value.as_promise()?;
        let producer = sleep(Duration::from_millis(5))
            .then(effects::complete_promise(promise, Value::Int(27)));
        Ok(effects::spawn(producer).then(effects::await_promise(promise)))
    });
    assert_eq!(run_default(program).unwrap_value(), Value::Int(27));
}

#[test]
fn external_promises_are_completed_from_host_threads() {
    let program = effects::create_external_promise().flat_map(|pair| {
        let promise = pair.as_list()?[0].as_promise()?;
        let completer = doeff_vm::external_completer(&pair)
            .ok_or_else(|| Exception::type_error("missing completer"))?;
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            completer.complete(Value::str("from outside"));
        });
        Ok(effects::await_promise(promise))
    });
    assert_eq!(run_default(program).unwrap_value(), Value::str("from outside"));
}

#[test]
fn semaphores_serialize_critical_sections() {
    // Two tasks run an acquire/release section around an atomic read-modify-write sequence
    // with a suspension point in the middle; the semaphore keeps the sequence race-free.
    let critical = || {
        effects::acquire_semaphore("lock")
            .then(effects::atomic_get("shared", 0))
            .flat_map(|value| {
                Ok(sleep(Duration::from_millis(3)).then(effects::atomic_update(
                    "shared",
                    move |_| Ok(Value::Int(value.as_int()? + 1)),
                    0,
                )))
            })
            .flat_map(|value| Ok(effects::release_semaphore("lock").then(doeff_vm::DoExpr::Pure(value))))
    };
    let program = effects::create_semaphore("lock", 1)
        .then(effects::gather([critical(), critical()]))
        .then(effects::atomic_get("shared", 0));
    assert_eq!(run_default(program).unwrap_value(), Value::Int(2));
}

#[test]
fn pooled_threads_return_results_through_the_event_channel() {
    let program = effects::thread(doeff_vm::DoExpr::pure(123));
    assert_eq!(run_default(program).unwrap_value(), Value::Int(123));
}

#[test]
fn process_backend_without_executor_is_a_typed_error() {
    let program = effects::spawn_with(doeff_vm::DoExpr::pure(1), doeff_vm::SpawnBackend::Process);
    let result = run_default(program);
    assert_eq!(
        result.failure().unwrap().exception.kind,
        ExceptionKind::Unsupported,
    );
}

// LAZY ENVIRONMENTS
// ================================================================================================

#[test]
fn lazy_ask_evaluates_once_under_concurrent_tasks() {
    // The sleep forces the first evaluator to suspend mid-evaluation, so the sibling asks
    // genuinely wait on the per-key semaphore instead of finding the value already resolved.
    let service = effects::atomic_update("evaluations", |n| Ok(Value::Int(n.as_int()? + 1)), 0)
        .then(sleep(Duration::from_millis(5)))
        .then(doeff_vm::DoExpr::pure(42));
    let env = Env::new([("svc".to_string(), Value::program(service))]);

    let program = effects::gather([
        effects::ask("svc"),
        effects::ask("svc"),
        effects::ask("svc"),
    ])
    .flat_map(|values| {
        Ok(effects::atomic_get("evaluations", 0)
            .map(move |count| Ok(Value::list([values.clone(), count]))))
    });
    let value = run_in(program, env).unwrap_value();
    assert_eq!(
        value,
        Value::list([
            Value::list([Value::Int(42), Value::Int(42), Value::Int(42)]),
            Value::Int(1),
        ]),
    );
}

#[test]
fn lazy_cycle_is_detected() {
    // The lazy value for "a" asks for "a" again while evaluating.
    let env = Env::new([("a".to_string(), Value::program(effects::ask("a")))]);
    let result = run_in(effects::ask("a"), env);
    assert_eq!(result.failure().unwrap().exception.kind, ExceptionKind::Cycle);
}

#[test]
fn failed_lazy_evaluation_can_be_retried_under_safe() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let service = effects::io(move || {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(Exception::value_error("first evaluation fails"))
        } else {
            Ok(Value::Int(7))
        }
    });
    let env = Env::new([("svc".to_string(), Value::program(service))]);
    let program = effects::safe(effects::ask("svc")).then(effects::ask("svc"));
    assert_eq!(run_in(program, env).unwrap_value(), Value::Int(7));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

// HANDLERS AND CONTROL
// ================================================================================================

#[test]
fn user_handlers_shadow_and_resume() {
    let handler = Handler::user("constant-ask", |effect, k| match effect {
        doeff_vm::Effect::Ask { .. } => Ok(HandlerOutcome::Resume(k, Value::Int(99))),
        _ => Ok(HandlerOutcome::Pass),
    });
    let program = effects::with_handler(handler, effects::ask("anything"));
    assert_eq!(run_default(program).unwrap_value(), Value::Int(99));
}

#[test]
fn handler_scope_ends_with_its_body() {
    let handler = Handler::user("constant-ask", |effect, k| match effect {
        doeff_vm::Effect::Ask { .. } => Ok(HandlerOutcome::Resume(k, Value::Int(99))),
        _ => Ok(HandlerOutcome::Pass),
    });
    let program = effects::with_handler(handler, effects::ask("k"))
        .then(effects::safe(effects::ask("k")));
    let value = run_default(program).unwrap_value();
    // Outside the scope the Ask falls through to the reader, which reports a missing key.
    assert_eq!(value, Value::err(Exception::key_error("k")));
}

#[test]
fn delegate_passes_a_rewritten_effect_down() {
    let handler = Handler::user("alias-ask", |effect, _k| match effect {
        doeff_vm::Effect::Ask { key } if key == "alias" => Ok(HandlerOutcome::Delegate(Some(
            doeff_vm::Effect::Ask { key: "target".to_string() },
        ))),
        _ => Ok(HandlerOutcome::Pass),
    });
    let env = Env::new([("target".to_string(), Value::Int(5))]);
    let program = effects::with_handler(handler, effects::ask("alias"));
    assert_eq!(run_in(program, env).unwrap_value(), Value::Int(5));
}

#[test]
fn handler_may_replace_the_effect_with_a_program() {
    let handler = Handler::user("logging-ask", |effect, _k| match effect {
        doeff_vm::Effect::Ask { key } => {
            let key = key.clone();
            Ok(HandlerOutcome::Run(
                effects::tell(format!("asked {key}")).then(effects::delegate(None)),
            ))
        },
        _ => Ok(HandlerOutcome::Pass),
    });
    let env = Env::new([("k".to_string(), Value::Int(3))]);
    let program = effects::with_handler(handler, effects::ask("k"));
    let result = run_in(program, env);
    assert_eq!(result.log(), &[Value::str("asked k")]);
    assert_eq!(result.unwrap_value(), Value::Int(3));
}

#[test]
fn resuming_a_reified_continuation_jumps_to_the_capture_point() {
    let program = effects::create_continuation(|k| {
        Ok(effects::resume_continuation(
            doeff_vm::DoExpr::Pure(k),
            doeff_vm::DoExpr::pure(1),
        ))
    });
    assert_eq!(run_default(program).unwrap_value(), Value::Int(1));
}

#[test]
fn reified_continuations_are_one_shot() {
    // The captured continuation is stashed in the store, resumed once, then resumed again
    // from the capture point's own continuation. The second use must abort the run.
    let program = effects::create_continuation(|k| {
        Ok(effects::put("k", k.clone()).then(effects::resume_continuation(
            doeff_vm::DoExpr::Pure(k),
            doeff_vm::DoExpr::pure(1),
        )))
    })
    .flat_map(|_resumed_with| {
        Ok(effects::get("k").flat_map(|k| {
            Ok(effects::resume_continuation(
                doeff_vm::DoExpr::Pure(k),
                doeff_vm::DoExpr::pure(2),
            ))
        }))
    });
    let error = run(program).unwrap_err();
    assert!(matches!(
        error,
        doeff_vm::ExecutionError::ContinuationConsumed { .. }
    ));
}

#[test]
fn intercept_rewrites_effects_bubbling_up() {
    let transform = doeff_vm::EffectTransform::new(|effect| match effect {
        doeff_vm::Effect::Ask { key } if key == "redirected" => {
            Some(doeff_vm::InterceptOutcome::Effect(doeff_vm::Effect::Ask {
                key: "actual".to_string(),
            }))
        },
        _ => None,
    });
    let env = Env::new([("actual".to_string(), Value::Int(8))]);
    let program = effects::intercept(effects::ask("redirected"), [transform]);
    assert_eq!(run_in(program, env).unwrap_value(), Value::Int(8));
}

// REFLECTION
// ================================================================================================

#[test]
fn call_stack_reflection_sees_the_enclosing_kleisli() {
    let inner = doeff_vm::Kleisli::new("inner", |_args| Ok(effects::program_call_stack()));
    let program = inner.call([]);
    let value = run_default(program).unwrap_value();
    let frames = value.as_list().unwrap();
    assert_eq!(frames.len(), 1);
    match &frames[0] {
        Value::Frame(frame) => assert_eq!(frame.function_name.as_ref(), "inner"),
        other => panic!("expected a frame, got {other:?}"),
    }
}

#[test]
fn call_frame_depth_out_of_range_is_a_user_error() {
    let result = run_default(effects::program_call_frame(10));
    assert_eq!(result.failure().unwrap().exception.kind, ExceptionKind::Index);
}

#[test]
fn get_handlers_lists_defaults_innermost_first() {
    let value = run_default(effects::get_handlers()).unwrap_value();
    let names = value.as_list().unwrap();
    assert_eq!(names[0], Value::str("result_safe"));
    assert!(names.contains(&Value::str("scheduler")));
    assert_eq!(names.last().unwrap(), &Value::str("await"));
}

#[test]
fn failure_reports_name_the_failed_effect_and_the_call_stack() {
    let failing = doeff_vm::Kleisli::new("explode", |_args| {
        Ok(effects::fail(Exception::value_error("bad input")))
    });
    let result = run_default(failing.call([]));
    let report = result.failure().unwrap().display();
    assert!(report.contains("ValueError: bad input"));
    assert!(report.contains("explode"));
}

// MEMO / CACHE / GRAPH / IO
// ================================================================================================

#[test]
fn memo_entries_are_shared_across_tasks() {
    let program = effects::memo_put("key", Value::Int(5))
        .then(effects::spawn(effects::memo_get("key")))
        .flat_map(|handle| Ok(effects::task_join(handle.as_task()?)));
    assert_eq!(run_default(program).unwrap_value(), Value::ok(Value::Int(5)));
}

#[test]
fn memo_miss_is_an_err_value() {
    let value = run_default(effects::memo_get("nope")).unwrap_value();
    assert!(matches!(value, Value::Err(_)));
}

#[test]
fn cache_round_trip_with_ttl() {
    let dir = std::env::temp_dir().join(format!("doeff-test-cache-{}", std::process::id()));
    let options = ExecutionOptions::default().with_cache_db_path(&dir);
    let key = Value::list([Value::str("model"), Value::Int(1)]);
    let program = effects::cache_put(key.clone(), Value::str("weights"), doeff_vm::CachePolicy::forever())
        .then(effects::cache_get(key));
    let result = run_with(program, Vec::new(), Env::default(), Store::default(), options)
        .expect("interpreter error");
    assert_eq!(result.unwrap_value(), Value::str("weights"));
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn graph_snapshot_records_steps_and_annotations() {
    let program = effects::graph_step("double", [Value::Int(2)], Value::Int(4))
        .then(effects::annotate([("stage".to_string(), Value::str("test"))]))
        .then(effects::snapshot());
    let value = run_default(program).unwrap_value();
    let Value::Map(map) = value else { panic!("expected a map snapshot") };
    let steps = map.get("steps").unwrap().as_list().unwrap();
    assert_eq!(steps.len(), 1);
}

#[test]
fn io_can_be_disabled() {
    let options = ExecutionOptions::default().with_io_allowed(false);
    let program = effects::io(|| Ok(Value::Unit));
    let result = run_with(program, Vec::new(), Env::default(), Store::default(), options)
        .expect("interpreter error");
    assert_eq!(
        result.failure().unwrap().exception.kind,
        ExceptionKind::Unsupported,
    );
}

// ASYNC ENTRY POINT
// ================================================================================================

#[tokio::test]
async fn async_run_awaits_host_futures() {
    let program = effects::await_future(|| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Value::Int(64))
        })
    });
    let result = doeff_vm::async_run(program).await.expect("interpreter error");
    assert_eq!(result.unwrap_value(), Value::Int(64));
}

#[tokio::test]
async fn async_escape_crosses_into_the_host_runtime() {
    let program = effects::async_escape(|| Box::pin(async { Ok(Value::str("escaped")) }));
    let result = doeff_vm::async_run(program).await.expect("interpreter error");
    assert_eq!(result.unwrap_value(), Value::str("escaped"));
}

#[tokio::test]
async fn sync_run_inside_a_runtime_is_rejected() {
    let error = run(doeff_vm::DoExpr::pure(1)).unwrap_err();
    assert!(matches!(error, doeff_vm::ExecutionError::NestedRuntime));
}
