//! Algebraic-effects virtual machine.
//!
//! This crate is the public face of the doeff workspace: it re-exports the program data model
//! from `doeff-core` and the interpreter from `doeff-processor`. Typical use:
//!
//! ```ignore
//! use doeff_vm::{effects, run};
//!
//! let program = effects::put("n", 1)
//!     .then(effects::modify("n", |v| Ok((v.as_int()? + 1).into())))
//!     .then(effects::get("n"));
//! let result = run(program)?;
//! assert_eq!(result.unwrap_value().as_int()?, 2);
//! ```

pub use doeff_core::{
    effects, here, kleisli, Arg, BuiltinHandler, CachePolicy, CallFrame, CallMeta, Continuation,
    ContinuationId, DoExpr, Effect, EffectTransform, Exception, ExceptionKind, Handler,
    HandlerOutcome, InterceptOutcome, Kleisli, OpaqueValue, PromiseId, RetryDelay,
    SourceLocation, SpawnBackend, TaskId, UserHandler, Value,
};
pub use doeff_processor::{
    async_run, async_run_with, default_handlers, execution_trace, external_completer, run,
    run_with, sleep, BoundedLog, EffectFrameKind, EffectStackFrame, EffectStackTrace, Env,
    ExecutionError, ExecutionOptions, ExecutionTrace, ExternalCompleter, Failure,
    InterpretationStats, RunResult, StateSnapshot, Store, TraceStep, CACHE_PATH_ENV,
    DEFAULT_MAX_STACK_DEPTH, DISABLE_PROFILE_ENV,
};
