use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use crate::{
    expr::DoExpr,
    value::{
        AwaitableFn, CatchFn, DelayFn, Exception, IoFn, MapFn, PromiseId, TaskId, Value,
    },
};

// SPAWN BACKENDS
// ================================================================================================

/// Where a spawned task runs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SpawnBackend {
    /// Cooperative task in the same runtime.
    #[default]
    Thread,
    /// Cooperative task detached from parent join; cancelled when the run completes.
    Daemon,
    /// Host worker thread running its own interpreter over a snapshot store.
    Pooled,
    /// Out-of-process executor (external collaborator).
    Process,
    /// Distributed executor (external collaborator).
    Ray,
}

impl fmt::Display for SpawnBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Thread => "thread",
            Self::Daemon => "daemon",
            Self::Pooled => "pooled",
            Self::Process => "process",
            Self::Ray => "ray",
        };
        write!(f, "{name}")
    }
}

// RETRY DELAY
// ================================================================================================

/// Backoff policy between retry attempts.
#[derive(Clone, Debug, Default)]
pub enum RetryDelay {
    #[default]
    None,
    Fixed(Duration),
    Strategy(DelayFn),
}

// CACHE POLICY
// ================================================================================================

/// Expiry policy for persistent cache writes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CachePolicy {
    pub ttl: Option<Duration>,
}

impl CachePolicy {
    pub fn forever() -> Self {
        Self { ttl: None }
    }

    pub fn ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

// INTERCEPT TRANSFORMS
// ================================================================================================

/// What an intercept transform rewrote an effect into.
#[derive(Clone, Debug)]
pub enum InterceptOutcome {
    /// Keep dispatching, with this effect instead.
    Effect(Effect),
    /// Stop dispatching and run this program in place of the effect.
    Program(DoExpr),
}

/// A transform applied to effects bubbling out of an `Intercept` scope. Returning `None` leaves
/// the effect untouched; the first transform returning `Some` wins.
#[derive(Clone)]
pub struct EffectTransform(Arc<dyn Fn(&Effect) -> Option<InterceptOutcome> + Send + Sync>);

impl EffectTransform {
    pub fn new(f: impl Fn(&Effect) -> Option<InterceptOutcome> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn apply(&self, effect: &Effect) -> Option<InterceptOutcome> {
        (self.0)(effect)
    }
}

impl fmt::Debug for EffectTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<effect transform>")
    }
}

// EFFECT
// ================================================================================================

/// An effect yielded to the handler stack.
///
/// Effects are immutable records. Program-typed payloads (`Catch.body` and friends) are full
/// programs; everything else is plain data.
#[derive(Clone, Debug)]
pub enum Effect {
    // Reader
    Ask { key: String },
    Local { env_update: BTreeMap<String, Value>, body: Box<DoExpr> },

    // Writer
    Tell { value: Value },
    Listen { body: Box<DoExpr> },

    // State
    Get { key: String },
    Put { key: String, value: Value },
    Modify { key: String, func: MapFn },
    AtomicGet { key: String, default: Value },
    AtomicUpdate { key: String, func: MapFn, default: Value },

    // Result
    Fail { error: Exception },
    Catch { body: Box<DoExpr>, handler: CatchFn },
    Finally { body: Box<DoExpr>, finalizer: Box<DoExpr> },
    Recover { body: Box<DoExpr>, fallback: Box<DoExpr> },
    Retry { body: Box<DoExpr>, max_attempts: u32, delay: RetryDelay },
    Safe { body: Box<DoExpr> },
    Unwrap { result: Box<DoExpr> },
    FirstSuccess { programs: Vec<DoExpr> },

    // Async and scheduling
    Await { awaitable: AwaitableFn },
    Spawn { body: Box<DoExpr>, backend: Option<SpawnBackend> },
    Gather { programs: Vec<DoExpr> },
    GatherDict { entries: Vec<(String, DoExpr)> },
    Race { programs: Vec<DoExpr> },
    CreatePromise { name: Option<String> },
    CreateExternalPromise,
    CompletePromise { promise: PromiseId, value: Value },
    FailPromise { promise: PromiseId, error: Exception },
    AwaitPromise { promise: PromiseId },
    TaskJoin { task: TaskId },
    TaskCancel { task: TaskId },
    Thread { body: Box<DoExpr>, await_result: bool },

    // Semaphores
    CreateSemaphore { key: String, permits: u32 },
    AcquireSemaphore { key: String },
    ReleaseSemaphore { key: String },

    // Memoization and persistent cache
    MemoGet { key: String },
    MemoPut { key: String, value: Value },
    CacheGet { key: Value },
    CachePut { key: Value, value: Value, policy: CachePolicy },

    // Computation graph
    GraphStep { label: String, inputs: Vec<Value>, output: Value },
    GraphAnnotate { entries: BTreeMap<String, Value> },
    GraphSnapshot,

    // Host IO
    Io { action: IoFn },
    Print { message: String },

    // Reflection
    ProgramCallStack,
    ProgramCallFrame { depth: usize },

    // Control
    Intercept { body: Box<DoExpr>, transforms: Vec<EffectTransform> },

    /// Machinery effects emitted by the built-in handlers for their own protocols (lazy
    /// resolution, atomic state, cache serialization). Not part of the public surface.
    #[doc(hidden)]
    Internal(InternalEffect),
}

impl Effect {
    /// The effect's kind tag, used in dispatch errors and trace output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ask { .. } => "Ask",
            Self::Local { .. } => "Local",
            Self::Tell { .. } => "Tell",
            Self::Listen { .. } => "Listen",
            Self::Get { .. } => "Get",
            Self::Put { .. } => "Put",
            Self::Modify { .. } => "Modify",
            Self::AtomicGet { .. } => "AtomicGet",
            Self::AtomicUpdate { .. } => "AtomicUpdate",
            Self::Fail { .. } => "Fail",
            Self::Catch { .. } => "Catch",
            Self::Finally { .. } => "Finally",
            Self::Recover { .. } => "Recover",
            Self::Retry { .. } => "Retry",
            Self::Safe { .. } => "Safe",
            Self::Unwrap { .. } => "Unwrap",
            Self::FirstSuccess { .. } => "FirstSuccess",
            Self::Await { .. } => "Await",
            Self::Spawn { .. } => "Spawn",
            Self::Gather { .. } => "Gather",
            Self::GatherDict { .. } => "GatherDict",
            Self::Race { .. } => "Race",
            Self::CreatePromise { .. } => "CreatePromise",
            Self::CreateExternalPromise => "CreateExternalPromise",
            Self::CompletePromise { .. } => "CompletePromise",
            Self::FailPromise { .. } => "FailPromise",
            Self::AwaitPromise { .. } => "AwaitPromise",
            Self::TaskJoin { .. } => "TaskJoin",
            Self::TaskCancel { .. } => "TaskCancel",
            Self::Thread { .. } => "Thread",
            Self::CreateSemaphore { .. } => "CreateSemaphore",
            Self::AcquireSemaphore { .. } => "AcquireSemaphore",
            Self::ReleaseSemaphore { .. } => "ReleaseSemaphore",
            Self::MemoGet { .. } => "MemoGet",
            Self::MemoPut { .. } => "MemoPut",
            Self::CacheGet { .. } => "CacheGet",
            Self::CachePut { .. } => "CachePut",
            Self::GraphStep { .. } => "GraphStep",
            Self::GraphAnnotate { .. } => "GraphAnnotate",
            Self::GraphSnapshot => "GraphSnapshot",
            Self::Io { .. } => "Io",
            Self::Print { .. } => "Print",
            Self::ProgramCallStack => "ProgramCallStack",
            Self::ProgramCallFrame { .. } => "ProgramCallFrame",
            Self::Intercept { .. } => "Intercept",
            Self::Internal(inner) => inner.name(),
        }
    }
}

// INTERNAL EFFECTS
// ================================================================================================

/// Continuation steps of built-in handler protocols that must pass through the dispatch loop
/// (because the step before them suspends on a semaphore).
#[doc(hidden)]
#[derive(Clone, Debug)]
pub enum InternalEffect {
    /// Lazy-ask: the per-key semaphore is held; resolve or begin evaluating the lazy value.
    LazyResolve { key: String, program: Box<DoExpr> },
    /// Lazy-ask: evaluation finished; record the value and release the semaphore.
    LazyComplete { key: String, value: Value },
    /// Lazy-ask: evaluation failed; clear the pending entry and release the semaphore.
    LazyAbort { key: String },
    /// Atomic state: the per-key semaphore is held; read or update the slot.
    AtomicApply {
        key: String,
        func: Option<MapFn>,
        default: Value,
    },
    /// Persistent cache: the cache semaphore is held; perform the storage operation.
    CacheApply { op: CacheOp },
}

#[doc(hidden)]
#[derive(Clone, Debug)]
pub enum CacheOp {
    Get { key: Value },
    Put { key: Value, value: Value, policy: CachePolicy },
}

impl InternalEffect {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LazyResolve { .. } => "LazyResolve",
            Self::LazyComplete { .. } => "LazyComplete",
            Self::LazyAbort { .. } => "LazyAbort",
            Self::AtomicApply { .. } => "AtomicApply",
            Self::CacheApply { .. } => "CacheApply",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ask { key } => write!(f, "Ask({key:?})"),
            Self::Get { key } => write!(f, "Get({key:?})"),
            Self::Put { key, value } => write!(f, "Put({key:?}, {value})"),
            Self::Tell { value } => write!(f, "Tell({value})"),
            Self::Fail { error } => write!(f, "Fail({error})"),
            other => write!(f, "{}", other.name()),
        }
    }
}
