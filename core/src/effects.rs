//! Data constructors for the built-in effects.
//!
//! Every function here builds a [`DoExpr`] that performs the corresponding effect; none of them
//! execute anything.

use std::{collections::BTreeMap, time::Duration};

use crate::{
    effect::{CachePolicy, Effect, EffectTransform, RetryDelay, SpawnBackend},
    expr::DoExpr,
    handler::Handler,
    value::{
        AwaitableFn, BindFn, BoxedValueFuture, CatchFn, DelayFn, Exception, IoFn, MapFn,
        PromiseId, TaskId, Value,
    },
};

// READER
// ================================================================================================

pub fn ask(key: impl AsRef<str>) -> DoExpr {
    DoExpr::Perform(Effect::Ask { key: key.as_ref().to_string() })
}

pub fn local(
    env_update: impl IntoIterator<Item = (String, Value)>,
    body: impl Into<DoExpr>,
) -> DoExpr {
    DoExpr::Perform(Effect::Local {
        env_update: env_update.into_iter().collect(),
        body: Box::new(body.into()),
    })
}

// WRITER
// ================================================================================================

pub fn tell(value: impl Into<Value>) -> DoExpr {
    DoExpr::Perform(Effect::Tell { value: value.into() })
}

pub fn listen(body: impl Into<DoExpr>) -> DoExpr {
    DoExpr::Perform(Effect::Listen { body: Box::new(body.into()) })
}

// STATE
// ================================================================================================

pub fn get(key: impl AsRef<str>) -> DoExpr {
    DoExpr::Perform(Effect::Get { key: key.as_ref().to_string() })
}

pub fn put(key: impl AsRef<str>, value: impl Into<Value>) -> DoExpr {
    DoExpr::Perform(Effect::Put {
        key: key.as_ref().to_string(),
        value: value.into(),
    })
}

pub fn modify(
    key: impl AsRef<str>,
    func: impl Fn(Value) -> Result<Value, Exception> + Send + Sync + 'static,
) -> DoExpr {
    DoExpr::Perform(Effect::Modify {
        key: key.as_ref().to_string(),
        func: MapFn::new(func),
    })
}

pub fn atomic_get(key: impl AsRef<str>, default: impl Into<Value>) -> DoExpr {
    DoExpr::Perform(Effect::AtomicGet {
        key: key.as_ref().to_string(),
        default: default.into(),
    })
}

pub fn atomic_update(
    key: impl AsRef<str>,
    func: impl Fn(Value) -> Result<Value, Exception> + Send + Sync + 'static,
    default: impl Into<Value>,
) -> DoExpr {
    DoExpr::Perform(Effect::AtomicUpdate {
        key: key.as_ref().to_string(),
        func: MapFn::new(func),
        default: default.into(),
    })
}

// RESULT
// ================================================================================================

pub fn fail(error: Exception) -> DoExpr {
    DoExpr::Perform(Effect::Fail { error })
}

pub fn catch(
    body: impl Into<DoExpr>,
    handler: impl Fn(Exception) -> Result<DoExpr, Exception> + Send + Sync + 'static,
) -> DoExpr {
    DoExpr::Perform(Effect::Catch {
        body: Box::new(body.into()),
        handler: CatchFn::new(handler),
    })
}

pub fn finally(body: impl Into<DoExpr>, finalizer: impl Into<DoExpr>) -> DoExpr {
    DoExpr::Perform(Effect::Finally {
        body: Box::new(body.into()),
        finalizer: Box::new(finalizer.into()),
    })
}

pub fn recover(body: impl Into<DoExpr>, fallback: impl Into<DoExpr>) -> DoExpr {
    DoExpr::Perform(Effect::Recover {
        body: Box::new(body.into()),
        fallback: Box::new(fallback.into()),
    })
}

pub fn retry(body: impl Into<DoExpr>, max_attempts: u32) -> DoExpr {
    DoExpr::Perform(Effect::Retry {
        body: Box::new(body.into()),
        max_attempts,
        delay: RetryDelay::None,
    })
}

pub fn retry_with_delay(
    body: impl Into<DoExpr>,
    max_attempts: u32,
    delay: Duration,
) -> DoExpr {
    DoExpr::Perform(Effect::Retry {
        body: Box::new(body.into()),
        max_attempts,
        delay: RetryDelay::Fixed(delay),
    })
}

pub fn retry_with_strategy(
    body: impl Into<DoExpr>,
    max_attempts: u32,
    strategy: impl Fn(u32) -> Result<Duration, Exception> + Send + Sync + 'static,
) -> DoExpr {
    DoExpr::Perform(Effect::Retry {
        body: Box::new(body.into()),
        max_attempts,
        delay: RetryDelay::Strategy(DelayFn::new(strategy)),
    })
}

pub fn safe(body: impl Into<DoExpr>) -> DoExpr {
    DoExpr::Perform(Effect::Safe { body: Box::new(body.into()) })
}

pub fn unwrap(result: impl Into<DoExpr>) -> DoExpr {
    DoExpr::Perform(Effect::Unwrap { result: Box::new(result.into()) })
}

pub fn first_success(programs: impl IntoIterator<Item = DoExpr>) -> DoExpr {
    DoExpr::Perform(Effect::FirstSuccess {
        programs: programs.into_iter().collect(),
    })
}

// ASYNC AND SCHEDULING
// ================================================================================================

pub fn await_future(factory: impl Fn() -> BoxedValueFuture + Send + Sync + 'static) -> DoExpr {
    DoExpr::Perform(Effect::Await { awaitable: AwaitableFn::new(factory) })
}

pub fn async_escape(factory: impl Fn() -> BoxedValueFuture + Send + Sync + 'static) -> DoExpr {
    DoExpr::AsyncEscape { awaitable: AwaitableFn::new(factory) }
}

pub fn spawn(body: impl Into<DoExpr>) -> DoExpr {
    DoExpr::Perform(Effect::Spawn {
        body: Box::new(body.into()),
        backend: None,
    })
}

pub fn spawn_with(body: impl Into<DoExpr>, backend: SpawnBackend) -> DoExpr {
    DoExpr::Perform(Effect::Spawn {
        body: Box::new(body.into()),
        backend: Some(backend),
    })
}

pub fn gather(programs: impl IntoIterator<Item = DoExpr>) -> DoExpr {
    DoExpr::Perform(Effect::Gather {
        programs: programs.into_iter().collect(),
    })
}

pub fn gather_dict(entries: impl IntoIterator<Item = (String, DoExpr)>) -> DoExpr {
    DoExpr::Perform(Effect::GatherDict {
        entries: entries.into_iter().collect(),
    })
}

pub fn race(programs: impl IntoIterator<Item = DoExpr>) -> DoExpr {
    DoExpr::Perform(Effect::Race {
        programs: programs.into_iter().collect(),
    })
}

pub fn create_promise() -> DoExpr {
    DoExpr::Perform(Effect::CreatePromise { name: None })
}

pub fn create_named_promise(name: impl AsRef<str>) -> DoExpr {
    DoExpr::Perform(Effect::CreatePromise {
        name: Some(name.as_ref().to_string()),
    })
}

/// Creates a promise plus a thread-safe completer the host can satisfy from outside the run.
pub fn create_external_promise() -> DoExpr {
    DoExpr::Perform(Effect::CreateExternalPromise)
}

pub fn complete_promise(promise: PromiseId, value: impl Into<Value>) -> DoExpr {
    DoExpr::Perform(Effect::CompletePromise {
        promise,
        value: value.into(),
    })
}

pub fn fail_promise(promise: PromiseId, error: Exception) -> DoExpr {
    DoExpr::Perform(Effect::FailPromise { promise, error })
}

pub fn await_promise(promise: PromiseId) -> DoExpr {
    DoExpr::Perform(Effect::AwaitPromise { promise })
}

pub fn task_join(task: TaskId) -> DoExpr {
    DoExpr::Perform(Effect::TaskJoin { task })
}

pub fn task_cancel(task: TaskId) -> DoExpr {
    DoExpr::Perform(Effect::TaskCancel { task })
}

/// Runs `body` on the worker pool and joins its result.
pub fn thread(body: impl Into<DoExpr>) -> DoExpr {
    DoExpr::Perform(Effect::Thread {
        body: Box::new(body.into()),
        await_result: true,
    })
}

/// Runs `body` on the worker pool and yields the task handle without joining.
pub fn thread_detached(body: impl Into<DoExpr>) -> DoExpr {
    DoExpr::Perform(Effect::Thread {
        body: Box::new(body.into()),
        await_result: false,
    })
}

// SEMAPHORES
// ================================================================================================

pub fn create_semaphore(key: impl AsRef<str>, permits: u32) -> DoExpr {
    DoExpr::Perform(Effect::CreateSemaphore {
        key: key.as_ref().to_string(),
        permits,
    })
}

pub fn acquire_semaphore(key: impl AsRef<str>) -> DoExpr {
    DoExpr::Perform(Effect::AcquireSemaphore { key: key.as_ref().to_string() })
}

pub fn release_semaphore(key: impl AsRef<str>) -> DoExpr {
    DoExpr::Perform(Effect::ReleaseSemaphore { key: key.as_ref().to_string() })
}

// MEMO AND CACHE
// ================================================================================================

pub fn memo_get(key: impl AsRef<str>) -> DoExpr {
    DoExpr::Perform(Effect::MemoGet { key: key.as_ref().to_string() })
}

pub fn memo_put(key: impl AsRef<str>, value: impl Into<Value>) -> DoExpr {
    DoExpr::Perform(Effect::MemoPut {
        key: key.as_ref().to_string(),
        value: value.into(),
    })
}

pub fn cache_get(key: impl Into<Value>) -> DoExpr {
    DoExpr::Perform(Effect::CacheGet { key: key.into() })
}

pub fn cache_put(key: impl Into<Value>, value: impl Into<Value>, policy: CachePolicy) -> DoExpr {
    DoExpr::Perform(Effect::CachePut {
        key: key.into(),
        value: value.into(),
        policy,
    })
}

// COMPUTATION GRAPH
// ================================================================================================

pub fn graph_step(
    label: impl AsRef<str>,
    inputs: impl IntoIterator<Item = Value>,
    output: impl Into<Value>,
) -> DoExpr {
    DoExpr::Perform(Effect::GraphStep {
        label: label.as_ref().to_string(),
        inputs: inputs.into_iter().collect(),
        output: output.into(),
    })
}

pub fn annotate(entries: impl IntoIterator<Item = (String, Value)>) -> DoExpr {
    DoExpr::Perform(Effect::GraphAnnotate {
        entries: entries.into_iter().collect::<BTreeMap<_, _>>(),
    })
}

pub fn snapshot() -> DoExpr {
    DoExpr::Perform(Effect::GraphSnapshot)
}

// HOST IO
// ================================================================================================

pub fn io(action: impl Fn() -> Result<Value, Exception> + Send + Sync + 'static) -> DoExpr {
    DoExpr::Perform(Effect::Io { action: IoFn::new(action) })
}

pub fn print_line(message: impl AsRef<str>) -> DoExpr {
    DoExpr::Perform(Effect::Print { message: message.as_ref().to_string() })
}

// REFLECTION
// ================================================================================================

pub fn program_call_stack() -> DoExpr {
    DoExpr::Perform(Effect::ProgramCallStack)
}

pub fn program_call_frame(depth: usize) -> DoExpr {
    DoExpr::Perform(Effect::ProgramCallFrame { depth })
}

pub fn get_handlers() -> DoExpr {
    DoExpr::GetHandlers
}

pub fn get_call_stack() -> DoExpr {
    DoExpr::GetCallStack
}

pub fn get_trace() -> DoExpr {
    DoExpr::GetTrace
}

// CONTROL
// ================================================================================================

pub fn with_handler(handler: impl Into<Handler>, body: impl Into<DoExpr>) -> DoExpr {
    DoExpr::WithHandler {
        handler: handler.into(),
        body: Box::new(body.into()),
        meta: None,
    }
}

pub fn intercept(
    body: impl Into<DoExpr>,
    transforms: impl IntoIterator<Item = EffectTransform>,
) -> DoExpr {
    DoExpr::Perform(Effect::Intercept {
        body: Box::new(body.into()),
        transforms: transforms.into_iter().collect(),
    })
}

pub fn get_continuation() -> DoExpr {
    DoExpr::GetContinuation
}

pub fn create_continuation(
    body: impl Fn(Value) -> Result<DoExpr, Exception> + Send + Sync + 'static,
) -> DoExpr {
    DoExpr::CreateContinuation { body: BindFn::new(body) }
}

pub fn resume(continuation: impl Into<DoExpr>, value: impl Into<DoExpr>) -> DoExpr {
    DoExpr::Resume {
        continuation: Box::new(continuation.into()),
        value: Box::new(value.into()),
    }
}

pub fn transfer(continuation: impl Into<DoExpr>, value: impl Into<DoExpr>) -> DoExpr {
    DoExpr::Transfer {
        continuation: Box::new(continuation.into()),
        value: Box::new(value.into()),
    }
}

pub fn resume_continuation(continuation: impl Into<DoExpr>, value: impl Into<DoExpr>) -> DoExpr {
    DoExpr::ResumeContinuation {
        continuation: Box::new(continuation.into()),
        value: Box::new(value.into()),
    }
}

pub fn delegate(effect: Option<Effect>) -> DoExpr {
    DoExpr::Delegate(effect)
}
