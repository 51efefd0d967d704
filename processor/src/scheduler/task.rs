use std::{
    collections::BTreeSet,
    sync::Arc,
};

use doeff_core::{CallFrame, DoExpr, Effect, PromiseId, SpawnBackend, TaskId, Value};

use crate::{
    continuation::Kontinuation,
    errors::Failure,
    handlers::HandlerStack,
    store::{Env, Store},
};

// CONTROL
// ================================================================================================

/// The control component of a task's CESK state.
#[derive(Clone, Debug)]
pub(crate) enum Control {
    Program(DoExpr),
    Value(Value),
    /// An effect awaiting dispatch. `below` bounds the handler walk when a `Delegate`
    /// continues an earlier dispatch; `None` starts from the innermost handler.
    Effect { effect: Effect, below: Option<usize> },
    Error(Failure),
}

impl Control {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Program(_) => "Program",
            Self::Value(_) => "Value",
            Self::Effect { .. } => "Effect",
            Self::Error(_) => "Error",
        }
    }
}

// TASK STATE
// ================================================================================================

/// The full CESK state of one cooperative task.
#[derive(Clone, Debug)]
pub(crate) struct TaskState {
    pub control: Control,
    pub env: Env,
    pub store: Store,
    pub k: Kontinuation,
    pub handlers: HandlerStack,
    pub call_stack: Vec<Arc<CallFrame>>,
    /// Reader keys whose lazy values this task is currently evaluating; used to detect cycles.
    pub lazy_in_flight: BTreeSet<String>,
}

impl TaskState {
    pub fn new(
        program: DoExpr,
        env: Env,
        store: Store,
        handlers: HandlerStack,
    ) -> Self {
        Self {
            control: Control::Program(program),
            env,
            store,
            k: Kontinuation::new(),
            handlers,
            call_stack: Vec::new(),
            lazy_in_flight: BTreeSet::new(),
        }
    }
}

// BLOCK REASONS
// ================================================================================================

/// Why a task is suspended. These are the only points at which a task yields to a sibling.
#[derive(Clone, Debug)]
pub(crate) enum BlockReason {
    /// Waiting for one task to complete (`TaskJoin`).
    Join { target: TaskId },
    /// Waiting for every target to complete (`Gather`); delivery preserves `targets` order.
    JoinAll {
        targets: Vec<TaskId>,
        dict_keys: Option<Vec<String>>,
    },
    /// Waiting for the first target to complete (`Race`). Once a winner is known the loser
    /// tasks are cancelled and the parent stays blocked until they finish unwinding.
    JoinAny {
        targets: Vec<TaskId>,
        winner: Option<TaskId>,
    },
    /// Waiting for a promise to be completed.
    Promise { promise: PromiseId },
    /// Waiting in a semaphore's FIFO queue.
    Semaphore { key: String },
}

// TASK
// ================================================================================================

/// Where a task's machine state lives.
#[derive(Debug)]
pub(crate) enum TaskBody {
    /// The task runs in this interpreter; state is present while the task is not executing.
    Local(Box<TaskState>),
    /// State is temporarily checked out by the run loop.
    Running,
    /// The task runs outside this interpreter (pooled worker); completion arrives as an event.
    External,
    /// The task settled; its machine state was folded into the outcome.
    Finished,
}

/// Result of a finished task, kept until every joiner has merged it.
#[derive(Clone, Debug)]
pub(crate) struct TaskOutcome {
    pub result: Result<Value, Failure>,
    pub store: Store,
}

#[derive(Debug)]
pub(crate) enum TaskStatus {
    Ready,
    Running,
    /// Executing outside this interpreter (pooled worker); completion arrives as an event.
    RunningExternal,
    Blocked(BlockReason),
    Done(TaskOutcome),
}

impl TaskStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

/// An independently scheduled program with its own env, store and continuation stack.
#[derive(Debug)]
pub(crate) struct Task {
    pub id: TaskId,
    pub backend: SpawnBackend,
    pub parent: Option<TaskId>,
    pub cancel_requested: bool,
    pub body: TaskBody,
    pub status: TaskStatus,
}

impl Task {
    pub fn local(
        id: TaskId,
        backend: SpawnBackend,
        parent: Option<TaskId>,
        state: TaskState,
    ) -> Self {
        Self {
            id,
            backend,
            parent,
            cancel_requested: false,
            body: TaskBody::Local(Box::new(state)),
            status: TaskStatus::Ready,
        }
    }

    pub fn external(id: TaskId, backend: SpawnBackend, parent: Option<TaskId>) -> Self {
        Self {
            id,
            backend,
            parent,
            cancel_requested: false,
            body: TaskBody::External,
            status: TaskStatus::RunningExternal,
        }
    }

    pub fn is_daemon(&self) -> bool {
        self.backend == SpawnBackend::Daemon
    }

    pub fn outcome(&self) -> Option<&TaskOutcome> {
        match &self.status {
            TaskStatus::Done(outcome) => Some(outcome),
            _ => None,
        }
    }
}
