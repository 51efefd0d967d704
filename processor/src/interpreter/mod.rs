use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
};

use doeff_core::{DoExpr, Effect, Exception, PromiseId, TaskId, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::{
    continuation::{CapturedState, ContinuationTable, FrameKind},
    errors::{ExecutionError, Failure, StateSnapshot},
    execution_options::ExecutionOptions,
    handlers::{cache::CacheStorage, graph::GraphState},
    profiling::{InterpretationStats, Profiler},
    scheduler::{
        task::{BlockReason, Task, TaskBody, TaskOutcome, TaskState, TaskStatus},
        ExternalEvent, PendingKey, PooledJob, PromiseTable, SemaphoreTable,
    },
    store::{Env, Store},
    trace::{EffectFrameKind, EffectStackFrame, EffectStackTrace, ExecutionTrace},
};

pub(crate) mod dispatch;
pub(crate) mod step;

pub(crate) use step::StepFlow;

// MAIN TASK
// ================================================================================================

/// The task id of the root program.
pub(crate) const MAIN_TASK: TaskId = TaskId::new(1);

// INTERPRETER
// ================================================================================================

/// The machine: every task's CESK state, the handler-visible shared tables, and the cooperative
/// scheduler.
///
/// One interpreter serves one `run`/`async_run` call and is discarded with it. Cooperative tasks
/// all execute on the calling thread; the only cross-thread traffic is the external event
/// channel (host futures, pooled workers, external promise completers).
pub struct Interpreter {
    options: ExecutionOptions,

    // Tasks and scheduling
    pub(crate) tasks: BTreeMap<TaskId, Task>,
    pub(crate) ready: VecDeque<TaskId>,
    pub(crate) current: TaskId,
    current_state: Option<Box<TaskState>>,
    next_task_id: u64,
    draining: bool,

    // Shared tables (program-visible, single-threaded by construction: no locks)
    pub(crate) continuations: ContinuationTable,
    pub(crate) promises: PromiseTable,
    pub(crate) semaphores: SemaphoreTable,
    pub(crate) memo: BTreeMap<String, Value>,
    pub(crate) atomic_state: BTreeMap<String, Value>,
    pub(crate) lazy_resolved: BTreeMap<String, Value>,
    pub(crate) graph: GraphState,
    pub(crate) cache: Option<Arc<CacheStorage>>,

    // External events
    pub(crate) events_tx: UnboundedSender<ExternalEvent>,
    events_rx: UnboundedReceiver<ExternalEvent>,
    pub(crate) pending_external: BTreeSet<PendingKey>,
    pub(crate) await_handles: BTreeMap<PromiseId, tokio::task::JoinHandle<()>>,
    pub(crate) pooled_active: usize,
    pub(crate) pooled_queue: VecDeque<PooledJob>,

    // Observability
    pub(crate) stats: InterpretationStats,
    pub(crate) profiler: Profiler,
    pub(crate) trace: Option<ExecutionTrace>,
}

impl Interpreter {
    // CONSTRUCTOR
    // --------------------------------------------------------------------------------------------

    pub(crate) fn new(options: ExecutionOptions) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        let profiler = Profiler::new(options.profiling_enabled());
        let trace = options.trace_enabled().then(ExecutionTrace::default);
        Self {
            options,
            tasks: BTreeMap::new(),
            ready: VecDeque::new(),
            current: MAIN_TASK,
            current_state: None,
            next_task_id: MAIN_TASK.as_u64(),
            draining: false,
            continuations: ContinuationTable::new(),
            promises: PromiseTable::default(),
            semaphores: SemaphoreTable::default(),
            memo: BTreeMap::new(),
            atomic_state: BTreeMap::new(),
            lazy_resolved: BTreeMap::new(),
            graph: GraphState::default(),
            cache: None,
            events_tx,
            events_rx,
            pending_external: BTreeSet::new(),
            await_handles: BTreeMap::new(),
            pooled_active: 0,
            pooled_queue: VecDeque::new(),
            stats: InterpretationStats::default(),
            profiler,
            trace,
        }
    }

    /// Seeds the shared tables of a pooled child interpreter.
    pub(crate) fn seed_shared(
        &mut self,
        memo: BTreeMap<String, Value>,
        cache: Option<Arc<CacheStorage>>,
    ) {
        self.memo = memo;
        self.cache = cache;
    }

    pub(crate) fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    // TASK STATE ACCESS
    // --------------------------------------------------------------------------------------------

    pub(crate) fn state(&self) -> &TaskState {
        self.current_state.as_ref().expect("no task is checked out")
    }

    pub(crate) fn state_mut(&mut self) -> &mut TaskState {
        self.current_state.as_mut().expect("no task is checked out")
    }

    pub(crate) fn alloc_task_id(&mut self) -> TaskId {
        self.next_task_id += 1;
        TaskId::new(self.next_task_id)
    }

    /// Pushes a continuation frame for the current task, enforcing the stack ceiling.
    pub(crate) fn push_frame(&mut self, kind: FrameKind) -> Result<(), ExecutionError> {
        let max_depth = self.options.max_stack_depth();
        let depth = self.state().k.depth();
        if max_depth > 0 && depth >= max_depth {
            let snapshot = self.snapshot();
            return Err(ExecutionError::ContinuationStackOverflow { max_depth, snapshot });
        }
        self.state_mut().k.push(kind);
        self.stats.total_frames_pushed += 1;
        if depth + 1 > self.stats.max_stack_depth {
            self.stats.max_stack_depth = depth + 1;
        }
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> StateSnapshot {
        let state = self.state();
        StateSnapshot {
            task: self.current,
            stack_depth: state.k.depth(),
            frame_kinds: state.k.frame_kind_names(),
            handler_names: state.handlers.iter().map(|h| h.name().to_string()).collect(),
            total_steps: self.stats.total_steps,
        }
    }

    // FAILURE CONSTRUCTION
    // --------------------------------------------------------------------------------------------

    /// Wraps an exception into a failure carrying the current call stack and effect trace.
    pub(crate) fn fail_from(&self, exception: Exception) -> Failure {
        let state = self.state();
        let mut failure = Failure::new(exception)
            .with_call_stack(state.call_stack.clone())
            .with_effect_trace(self.effect_trace_from_k(None));
        if self.options.debug_traceback() {
            failure = failure.with_backtrace();
        }
        failure
    }

    /// As [`Self::fail_from`], for an exception raised while an effect was being handled: the
    /// failure names the effect and the trace ends at its yield point.
    pub(crate) fn fail_from_effect(&self, exception: Exception, effect: Effect) -> Failure {
        let state = self.state();
        let mut failure = Failure::new(exception)
            .with_call_stack(state.call_stack.clone())
            .with_effect_trace(self.effect_trace_from_k(Some(effect.name())))
            .with_effect(effect);
        if self.options.debug_traceback() {
            failure = failure.with_backtrace();
        }
        failure
    }

    /// Builds an effect stack trace from the current continuation stack, outermost first.
    pub(crate) fn effect_trace_from_k(&self, yielded: Option<&'static str>) -> EffectStackTrace {
        let state = self.state();
        let mut frames = Vec::new();
        for frame in state.k.iter_topmost_first().collect::<Vec<_>>().into_iter().rev() {
            match frame.kind() {
                FrameKind::Call { frame: call } => {
                    frames.push(
                        EffectStackFrame::new(
                            EffectFrameKind::KleisliCall,
                            call.function_name.as_ref(),
                        )
                        .with_call_frame(call.clone()),
                    );
                },
                FrameKind::Handler { handler } => {
                    frames.push(EffectStackFrame::new(
                        EffectFrameKind::HandlerBoundary,
                        handler.name(),
                    ));
                },
                FrameKind::Bind { meta: Some(meta), .. } => {
                    frames.push(
                        EffectStackFrame::new(
                            EffectFrameKind::ProgramFlatMap,
                            meta.function_name.as_ref(),
                        )
                        .at(meta.created_at),
                    );
                },
                _ => {},
            }
        }
        if let Some(effect_name) = yielded {
            frames.push(EffectStackFrame::new(EffectFrameKind::EffectYield, effect_name));
        }
        EffectStackTrace::new(frames)
    }

    /// Extends a joined child's failure with the spawn boundary so the report shows both sides.
    pub(crate) fn bridge_child_failure(&self, child: Failure) -> Failure {
        let mut frames = self.effect_trace_from_k(None).frames;
        frames.push(EffectStackFrame::new(EffectFrameKind::SpawnBoundary, "spawn"));
        if let Some(child_trace) = &child.effect_trace {
            frames.extend(child_trace.frames.iter().cloned());
        }
        let mut bridged = child;
        bridged.effect_trace = Some(Arc::new(EffectStackTrace::new(frames)));
        bridged
    }

    // TRACE RECORDING
    // --------------------------------------------------------------------------------------------

    pub(crate) fn record_trace(&mut self, kind: &'static str, detail: impl Into<String>) {
        let task = self.current;
        if let Some(trace) = self.trace.as_mut() {
            trace.record(task, kind, detail);
        }
    }

    pub(crate) fn trace_snapshot(&self) -> ExecutionTrace {
        self.trace.clone().unwrap_or_default()
    }

    // SETUP AND MAIN LOOP
    // --------------------------------------------------------------------------------------------

    /// Installs the root program as the main task.
    pub(crate) fn install_main(
        &mut self,
        program: DoExpr,
        handlers: crate::handlers::HandlerStack,
        env: Env,
        mut store: Store,
    ) {
        store.log_mut().set_max_entries(self.options.max_log_entries());
        let state = TaskState::new(program, env, store, handlers);
        let task = Task::local(MAIN_TASK, doeff_core::SpawnBackend::Thread, None, state);
        self.tasks.insert(MAIN_TASK, task);
        self.ready.push_back(MAIN_TASK);
    }

    /// Drives the machine until the main task and every sibling settles.
    pub(crate) async fn run_to_completion(&mut self) -> Result<TaskOutcome, ExecutionError> {
        loop {
            while let Ok(event) = self.events_rx.try_recv() {
                self.apply_event(event);
            }

            if let Some(task_id) = self.next_ready() {
                self.execute_task_slice(task_id)?;
                if self.main_done() && !self.draining {
                    self.begin_drain();
                }
                if let Some(outcome) = self.finished_outcome() {
                    return Ok(outcome);
                }
                continue;
            }

            if let Some(outcome) = self.finished_outcome() {
                return Ok(outcome);
            }

            if !self.pending_external.is_empty() {
                match self.events_rx.recv().await {
                    Some(event) => self.apply_event(event),
                    None => {
                        return Err(ExecutionError::Deadlock(
                            "external event channel closed while work was pending".into(),
                        ));
                    },
                }
                continue;
            }

            return Err(ExecutionError::Deadlock(self.describe_blocked()));
        }
    }

    fn next_ready(&mut self) -> Option<TaskId> {
        while let Some(task_id) = self.ready.pop_front() {
            if let Some(task) = self.tasks.get(&task_id) {
                if matches!(task.status, TaskStatus::Ready) {
                    return Some(task_id);
                }
            }
        }
        None
    }

    /// Runs one task until it suspends, completes, or fails the run.
    fn execute_task_slice(&mut self, task_id: TaskId) -> Result<(), ExecutionError> {
        if self.current != task_id {
            self.stats.total_task_switches += 1;
            debug!(task = task_id.as_u64(), "switching to task");
        }
        self.current = task_id;
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| ExecutionError::invariant(format!("unknown task {task_id}")))?;
        let state = match std::mem::replace(&mut task.body, TaskBody::Running) {
            TaskBody::Local(state) => state,
            other => {
                task.body = other;
                return Err(ExecutionError::invariant(format!(
                    "task {task_id} has no local state to run"
                )));
            },
        };
        task.status = TaskStatus::Running;
        self.current_state = Some(state);

        loop {
            match self.step() {
                Ok(StepFlow::Continue) => {},
                Ok(StepFlow::Block(reason)) => {
                    self.park_current(reason);
                    break;
                },
                Ok(StepFlow::Done(result)) => {
                    self.finish_current(result);
                    break;
                },
                Err(fatal) => {
                    // Put the state back so drop-time accounting stays coherent, then abort.
                    let state = self.current_state.take().expect("state checked out");
                    if let Some(task) = self.tasks.get_mut(&task_id) {
                        task.body = TaskBody::Local(state);
                    }
                    return Err(fatal);
                },
            }
        }
        Ok(())
    }

    fn park_current(&mut self, reason: BlockReason) {
        let state = self.current_state.take().expect("state checked out");
        let task = self.tasks.get_mut(&self.current).expect("current task exists");
        task.body = TaskBody::Local(state);
        task.status = TaskStatus::Blocked(reason);
    }

    fn finish_current(&mut self, result: Result<Value, Failure>) {
        let state = self.current_state.take().expect("state checked out");
        let task_id = self.current;
        debug!(task = task_id.as_u64(), ok = result.is_ok(), "task finished");
        let outcome = TaskOutcome { result, store: state.store };
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.body = TaskBody::Finished;
            task.status = TaskStatus::Done(outcome);
        }
        self.on_task_done(task_id);
    }

    fn main_done(&self) -> bool {
        self.tasks
            .get(&MAIN_TASK)
            .map(|task| task.status.is_done())
            .unwrap_or(false)
    }

    /// Cancels every still-live task once the main task has settled. Finalizers of the
    /// cancelled tasks run before the run returns.
    fn begin_drain(&mut self) {
        self.draining = true;
        let live: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|task| !task.status.is_done())
            .map(|task| task.id)
            .collect();
        for task_id in live {
            self.cancel_task(task_id);
        }
    }

    /// The main outcome, once the main task and every other task have settled. Pooled tasks
    /// count (their completion event flips them to done); external promises nobody waits on
    /// anymore do not keep the run alive.
    fn finished_outcome(&mut self) -> Option<TaskOutcome> {
        if !self.main_done() {
            return None;
        }
        if !self.tasks.values().all(|task| task.status.is_done()) {
            return None;
        }
        match &self.tasks.get(&MAIN_TASK)?.status {
            TaskStatus::Done(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    fn describe_blocked(&self) -> String {
        let blocked: Vec<String> = self
            .tasks
            .values()
            .filter_map(|task| match &task.status {
                TaskStatus::Blocked(reason) => {
                    Some(format!("task {} blocked on {reason:?}", task.id))
                },
                _ => None,
            })
            .collect();
        if blocked.is_empty() {
            "no task is runnable".to_string()
        } else {
            blocked.join("; ")
        }
    }

    // CONTINUATION CAPTURE
    // --------------------------------------------------------------------------------------------

    /// Captures the current task's continuation into the table.
    pub(crate) fn capture_current(&mut self) -> doeff_core::ContinuationId {
        let state = self.state();
        let captured = CapturedState {
            k: state.k.clone(),
            handlers: state.handlers.clone(),
            env: state.env.clone(),
            call_stack: state.call_stack.clone(),
        };
        self.continuations.capture(captured)
    }

    /// Installs a captured continuation as the current task's state.
    pub(crate) fn install_captured(&mut self, captured: CapturedState) {
        let state = self.state_mut();
        state.k = captured.k;
        state.handlers = captured.handlers;
        state.env = captured.env;
        state.call_stack = captured.call_stack;
    }
}

// POOLED WORKER ENTRY
// ================================================================================================

/// Outcome of a pooled worker run, sent back over the event channel.
#[derive(Debug)]
pub(crate) struct PooledOutcome {
    pub result: Result<Value, Failure>,
    pub store: Store,
    pub memo: BTreeMap<String, Value>,
}

/// Runs a pooled job to completion on the calling (worker) thread with its own interpreter and
/// runtime. The job sees a snapshot store, a copy of the memo table, and the shared cache.
pub(crate) fn run_pooled_job(job: PooledJob) -> PooledOutcome {
    let options = job.options.clone();
    let mut interpreter = Interpreter::new(options);
    interpreter.seed_shared(job.memo, job.cache);
    interpreter.install_main(job.body, job.handlers, job.env, job.store);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return PooledOutcome {
                result: Err(Failure::new(Exception::other(
                    "RuntimeError",
                    format!("failed to start worker runtime: {error}"),
                ))),
                store: Store::default(),
                memo: BTreeMap::new(),
            };
        },
    };

    match runtime.block_on(interpreter.run_to_completion()) {
        Ok(outcome) => PooledOutcome {
            result: outcome.result,
            store: outcome.store,
            memo: interpreter.memo.clone(),
        },
        Err(fatal) => PooledOutcome {
            result: Err(Failure::new(Exception::other(
                "InterpreterError",
                fatal.to_string(),
            ))),
            store: Store::default(),
            memo: interpreter.memo.clone(),
        },
    }
}
