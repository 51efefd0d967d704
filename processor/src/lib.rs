//! CESK interpreter for the doeff effects VM.
//!
//! Programs (`DoExpr` trees from `doeff-core`) are reduced one step at a time by a trampolined
//! machine with an explicit continuation stack. Effects dispatch against a stack of handlers;
//! the defaults provide reader/state/writer semantics, failure handling, a cooperative task
//! scheduler with promises and semaphores, memoization, a persistent cache, and a bridge into
//! the host async runtime.

use std::cell::Cell;

use tracing::instrument;

mod continuation;
mod errors;
mod execution_options;
mod handlers;
mod interpreter;
mod profiling;
mod scheduler;
mod store;
mod trace;

#[cfg(test)]
mod tests;

// RE-EXPORTS
// ================================================================================================

pub use doeff_core::{
    effects, Arg, BuiltinHandler, CachePolicy, CallFrame, CallMeta, Continuation, ContinuationId,
    DoExpr, Effect, EffectTransform, Exception, ExceptionKind, Handler, HandlerOutcome,
    InterceptOutcome, Kleisli, OpaqueValue, PromiseId, RetryDelay, SourceLocation, SpawnBackend,
    TaskId, UserHandler, Value,
};
pub use errors::{ExecutionError, Failure, StateSnapshot};
pub use execution_options::{
    ExecutionOptions, CACHE_PATH_ENV, DEFAULT_MAX_STACK_DEPTH, DISABLE_PROFILE_ENV,
};
pub use handlers::default_handlers;
pub use profiling::InterpretationStats;
pub use scheduler::ExternalCompleter;
pub use store::{BoundedLog, Env, Store};
pub use trace::{EffectFrameKind, EffectStackFrame, EffectStackTrace, ExecutionTrace, TraceStep};

use crate::{interpreter::Interpreter, scheduler::task::TaskOutcome};

// RUN RESULT
// ================================================================================================

/// Outcome of one `run`/`async_run` call.
///
/// `Err` carries the failure together with the store and the log as they were at the point of
/// failure; fatal interpreter errors abort the call with [`ExecutionError`] instead and never
/// appear here.
#[derive(Debug)]
pub enum RunResult {
    Ok {
        value: Value,
        store: Store,
        stats: InterpretationStats,
        trace: Option<ExecutionTrace>,
    },
    Err {
        failure: Failure,
        store: Store,
        stats: InterpretationStats,
        trace: Option<ExecutionTrace>,
    },
}

impl RunResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Ok { value, .. } => Some(value),
            Self::Err { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Ok { .. } => None,
            Self::Err { failure, .. } => Some(failure),
        }
    }

    pub fn store(&self) -> &Store {
        match self {
            Self::Ok { store, .. } | Self::Err { store, .. } => store,
        }
    }

    /// The writer log (partial on failure).
    pub fn log(&self) -> &[Value] {
        self.store().log().entries()
    }

    pub fn stats(&self) -> &InterpretationStats {
        match self {
            Self::Ok { stats, .. } | Self::Err { stats, .. } => stats,
        }
    }

    pub fn trace(&self) -> Option<&ExecutionTrace> {
        match self {
            Self::Ok { trace, .. } | Self::Err { trace, .. } => trace.as_ref(),
        }
    }

    /// The success value, or a panic with the rendered failure report. Test helper.
    #[track_caller]
    pub fn unwrap_value(self) -> Value {
        match self {
            Self::Ok { value, .. } => value,
            Self::Err { failure, .. } => panic!("program failed:\n{}", failure.display()),
        }
    }
}

// REENTRANCY GUARD
// ================================================================================================

thread_local! {
    static RUNNING: Cell<usize> = const { Cell::new(0) };
}

struct ReentrancyGuard;

impl ReentrancyGuard {
    fn enter(allow_reentrancy: bool) -> Result<Self, ExecutionError> {
        let depth = RUNNING.with(Cell::get);
        if depth > 0 && !allow_reentrancy {
            return Err(ExecutionError::Reentrancy);
        }
        RUNNING.with(|running| running.set(depth + 1));
        Ok(Self)
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        RUNNING.with(|running| running.set(running.get().saturating_sub(1)));
    }
}

// ENTRY POINTS
// ================================================================================================

/// Runs a program to completion with the default handlers, an empty environment and an empty
/// store.
pub fn run(program: impl Into<DoExpr>) -> Result<RunResult, ExecutionError> {
    run_with(program, Vec::new(), Env::default(), Store::default(), ExecutionOptions::default())
}

/// Runs a program to completion.
///
/// The default handlers are installed below `handlers`, the trampoline is driven until the
/// main task and every sibling settles, and the final store and log are returned alongside
/// the result.
///
/// # Errors
/// Returns an error when called from inside an async runtime (use [`async_run_with`]), on
/// reentrant use from a handler, or when the interpreter hits a fatal condition (unhandled
/// effect, invariant violation, continuation-stack overflow).
#[instrument("run_program", skip_all)]
pub fn run_with(
    program: impl Into<DoExpr>,
    handlers: Vec<Handler>,
    env: Env,
    store: Store,
    options: ExecutionOptions,
) -> Result<RunResult, ExecutionError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(ExecutionError::NestedRuntime);
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|error| {
            ExecutionError::InvariantViolation(format!("failed to build runtime: {error}"))
        })?;
    runtime.block_on(async_run_with(program, handlers, env, store, options))
}

/// Runs a program to completion with the default handlers on the current async runtime.
pub async fn async_run(program: impl Into<DoExpr>) -> Result<RunResult, ExecutionError> {
    async_run_with(program, Vec::new(), Env::default(), Store::default(), ExecutionOptions::default())
        .await
}

/// Async variant of [`run_with`]; `Await` futures and `AsyncEscape` crossings are awaited on
/// the calling runtime.
#[instrument("async_run_program", skip_all)]
pub async fn async_run_with(
    program: impl Into<DoExpr>,
    handlers: Vec<Handler>,
    env: Env,
    store: Store,
    options: ExecutionOptions,
) -> Result<RunResult, ExecutionError> {
    options.validate()?;
    let _guard = ReentrancyGuard::enter(options.allow_reentrancy())?;

    let mut interpreter = Interpreter::new(options);
    let stack = handlers::build_handler_stack(handlers);
    interpreter.install_main(program.into(), stack, env, store);

    let outcome = interpreter.run_to_completion().await;
    interpreter.profiler.report();
    let stats = interpreter.stats;
    let trace = interpreter.trace.take();

    let TaskOutcome { result, store } = outcome?;
    Ok(match result {
        Ok(value) => RunResult::Ok { value, store, stats, trace },
        Err(failure) => RunResult::Err { failure, store, stats, trace },
    })
}

// HELPERS
// ================================================================================================

/// A program that suspends the current task for `duration` without blocking its siblings.
pub fn sleep(duration: std::time::Duration) -> DoExpr {
    effects::await_future(move || {
        Box::pin(async move {
            tokio::time::sleep(duration).await;
            Ok(Value::Unit)
        })
    })
}

/// Extracts the [`ExternalCompleter`] from the value returned by the external-promise effect.
pub fn external_completer(value: &Value) -> Option<ExternalCompleter> {
    match value {
        Value::List(items) => items.iter().find_map(external_completer),
        Value::Opaque(opaque) => opaque.downcast::<ExternalCompleter>().cloned(),
        _ => None,
    }
}

/// Extracts the recorded execution trace from the value returned by `GetTrace`.
pub fn execution_trace(value: &Value) -> Option<ExecutionTrace> {
    match value {
        Value::Opaque(opaque) => opaque.downcast::<ExecutionTrace>().cloned(),
        _ => None,
    }
}
