//! The cooperative scheduler.
//!
//! Tasks are programs running in lockstep on the calling thread; switches happen only at
//! suspension points (joins, promise waits, semaphore waits, host futures). Each task owns its
//! env, store and continuation stack; spawning snapshots the parent store, joining merges the
//! child back. The only cross-thread traffic is the external event channel.

pub(crate) mod promise;
pub(crate) mod semaphore;
pub(crate) mod task;

use std::collections::BTreeMap;

use doeff_core::{
    DoExpr, Effect, Exception, PromiseId, SpawnBackend, TaskId, Value,
};
use itertools::Itertools;
use tracing::{debug, warn};

pub use promise::ExternalCompleter;
pub(crate) use promise::{PromiseStatus, PromiseTable};
pub(crate) use semaphore::{AcquireOutcome, SemaphoreTable};

use crate::{
    errors::{ExecutionError, Failure},
    execution_options::ExecutionOptions,
    handlers::cache::CacheStorage,
    interpreter::{dispatch::EffectAction, Interpreter, PooledOutcome},
    store::{Env, Store},
};
use task::{BlockReason, Task, TaskBody, TaskOutcome, TaskState, TaskStatus};

// EXTERNAL EVENTS
// ================================================================================================

/// Work finishing outside the cooperative world: host futures, external promise completions,
/// and pooled workers.
#[derive(Debug)]
pub(crate) enum ExternalEvent {
    PromiseCompleted {
        promise: PromiseId,
        result: Result<Value, Exception>,
    },
    PooledTaskDone {
        task: TaskId,
        outcome: Box<PooledOutcome>,
    },
}

/// Identity of one outstanding piece of external work. Removal is idempotent, which keeps the
/// bookkeeping correct when an abort races a completion.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) enum PendingKey {
    Promise(PromiseId),
    Pooled(TaskId),
}

/// Everything a pooled worker needs to run a child interpreter.
#[derive(Debug)]
pub(crate) struct PooledJob {
    pub task: TaskId,
    pub body: DoExpr,
    pub env: Env,
    pub store: Store,
    pub memo: BTreeMap<String, Value>,
    pub cache: Option<std::sync::Arc<CacheStorage>>,
    pub handlers: crate::handlers::HandlerStack,
    pub options: ExecutionOptions,
}

// SCHEDULER EFFECTS
// ================================================================================================

impl Interpreter {
    pub(crate) fn handle_scheduler_effect(
        &mut self,
        effect: &Effect,
    ) -> Result<EffectAction, ExecutionError> {
        match effect {
            // Spawning
            Effect::Spawn { body, backend } => {
                let backend = backend.unwrap_or(self.options().spawn_default_backend());
                match backend {
                    SpawnBackend::Thread | SpawnBackend::Daemon => {
                        let id = self.spawn_local_task((**body).clone(), backend);
                        Ok(EffectAction::Value(Value::Task(id)))
                    },
                    SpawnBackend::Pooled => {
                        let id = self.spawn_pooled_task((**body).clone());
                        Ok(EffectAction::Value(Value::Task(id)))
                    },
                    SpawnBackend::Process | SpawnBackend::Ray => {
                        Ok(EffectAction::Error(Exception::unsupported(format!(
                            "the {backend} spawn backend requires an external executor",
                        ))))
                    },
                }
            },

            Effect::Thread { body, await_result } => {
                if *await_result && self.take_cancel_flag() {
                    return Ok(EffectAction::Error(Exception::cancelled()));
                }
                let id = self.spawn_pooled_task((**body).clone());
                if *await_result {
                    Ok(EffectAction::Block(BlockReason::Join { target: id }))
                } else {
                    Ok(EffectAction::Value(Value::Task(id)))
                }
            },

            // Structured concurrency
            Effect::Gather { programs } => {
                if programs.is_empty() {
                    return Ok(EffectAction::Value(Value::list([])));
                }
                if self.take_cancel_flag() {
                    return Ok(EffectAction::Error(Exception::cancelled()));
                }
                let targets: Vec<TaskId> = programs
                    .iter()
                    .map(|program| self.spawn_local_task(program.clone(), SpawnBackend::Thread))
                    .collect();
                Ok(EffectAction::Block(BlockReason::JoinAll { targets, dict_keys: None }))
            },

            Effect::GatherDict { entries } => {
                if entries.is_empty() {
                    return Ok(EffectAction::Value(Value::map([])));
                }
                if self.take_cancel_flag() {
                    return Ok(EffectAction::Error(Exception::cancelled()));
                }
                let keys: Vec<String> = entries.iter().map(|(key, _)| key.clone()).collect();
                let targets: Vec<TaskId> = entries
                    .iter()
                    .map(|(_, program)| self.spawn_local_task(program.clone(), SpawnBackend::Thread))
                    .collect();
                Ok(EffectAction::Block(BlockReason::JoinAll {
                    targets,
                    dict_keys: Some(keys),
                }))
            },

            Effect::Race { programs } => {
                if programs.is_empty() {
                    return Ok(EffectAction::Error(Exception::value_error(
                        "Race requires at least one program",
                    )));
                }
                if self.take_cancel_flag() {
                    return Ok(EffectAction::Error(Exception::cancelled()));
                }
                let targets: Vec<TaskId> = programs
                    .iter()
                    .map(|program| self.spawn_local_task(program.clone(), SpawnBackend::Thread))
                    .collect();
                Ok(EffectAction::Block(BlockReason::JoinAny { targets, winner: None }))
            },

            // Join and cancel
            Effect::TaskJoin { task } => {
                if !self.tasks.contains_key(task) {
                    return Ok(EffectAction::Error(Exception::key_error(&format!(
                        "task {task}"
                    ))));
                }
                if self.take_cancel_flag() {
                    return Ok(EffectAction::Error(Exception::cancelled()));
                }
                match self.tasks.get(task).and_then(Task::outcome).cloned() {
                    Some(outcome) => match outcome.result {
                        Ok(value) => {
                            self.state_mut().store.merge_child(outcome.store);
                            Ok(EffectAction::Value(value))
                        },
                        Err(failure) => Ok(EffectAction::Fail(self.bridge_child_failure(failure))),
                    },
                    None => Ok(EffectAction::Block(BlockReason::Join { target: *task })),
                }
            },

            Effect::TaskCancel { task } => {
                if !self.tasks.contains_key(task) {
                    return Ok(EffectAction::Error(Exception::key_error(&format!(
                        "task {task}"
                    ))));
                }
                self.cancel_task(*task);
                Ok(EffectAction::Value(Value::Unit))
            },

            // Promises
            Effect::CreatePromise { name } => {
                let id = self.promises.create(name.clone(), false);
                Ok(EffectAction::Value(Value::Promise(id)))
            },

            Effect::CreateExternalPromise => {
                let id = self.promises.create(None, true);
                self.pending_external.insert(PendingKey::Promise(id));
                let completer = ExternalCompleter { promise: id, sender: self.events_tx.clone() };
                Ok(EffectAction::Value(Value::list([
                    Value::Promise(id),
                    Value::opaque("external_completer", completer),
                ])))
            },

            Effect::CompletePromise { promise, value } => {
                match self.promises.complete(*promise, Ok(value.clone())) {
                    Ok(()) => {
                        self.pending_external.remove(&PendingKey::Promise(*promise));
                        self.wake_promise_waiters(*promise);
                        Ok(EffectAction::Value(Value::Unit))
                    },
                    Err(exception) => Ok(EffectAction::Error(exception)),
                }
            },

            Effect::FailPromise { promise, error } => {
                match self.promises.complete(*promise, Err(error.clone())) {
                    Ok(()) => {
                        self.pending_external.remove(&PendingKey::Promise(*promise));
                        self.wake_promise_waiters(*promise);
                        Ok(EffectAction::Value(Value::Unit))
                    },
                    Err(exception) => Ok(EffectAction::Error(exception)),
                }
            },

            Effect::AwaitPromise { promise } => {
                if self.take_cancel_flag() {
                    return Ok(EffectAction::Error(Exception::cancelled()));
                }
                match self.promises.status(*promise) {
                    None => Ok(EffectAction::Error(Exception::key_error(&format!(
                        "promise {promise}"
                    )))),
                    Some(PromiseStatus::Done(Ok(value))) => {
                        Ok(EffectAction::Value(value.clone()))
                    },
                    Some(PromiseStatus::Done(Err(error))) => {
                        Ok(EffectAction::Error(error.clone()))
                    },
                    Some(PromiseStatus::Pending) => {
                        Ok(EffectAction::Block(BlockReason::Promise { promise: *promise }))
                    },
                }
            },

            // Semaphores
            Effect::CreateSemaphore { key, permits } => {
                self.semaphores.create(key, *permits);
                Ok(EffectAction::Value(Value::Unit))
            },

            Effect::AcquireSemaphore { key } => {
                if self.take_cancel_flag() {
                    return Ok(EffectAction::Error(Exception::cancelled()));
                }
                let current = self.current;
                match self.semaphores.acquire(key, current) {
                    Ok(AcquireOutcome::Granted) => Ok(EffectAction::Value(Value::Unit)),
                    Ok(AcquireOutcome::MustWait) => {
                        Ok(EffectAction::Block(BlockReason::Semaphore { key: key.clone() }))
                    },
                    Err(exception) => Ok(EffectAction::Error(exception)),
                }
            },

            Effect::ReleaseSemaphore { key } => match self.release_semaphore_and_wake(key) {
                Ok(()) => Ok(EffectAction::Value(Value::Unit)),
                Err(exception) => Ok(EffectAction::Error(exception)),
            },

            _ => Ok(EffectAction::Pass),
        }
    }

    // AWAIT
    // --------------------------------------------------------------------------------------------

    /// Bridges `Await` into the host runtime: the future is spawned onto the runtime and its
    /// completion comes back through the event channel as a promise completion, so sibling
    /// tasks keep running while it is pending.
    pub(crate) fn handle_await_effect(
        &mut self,
        effect: &Effect,
    ) -> Result<EffectAction, ExecutionError> {
        let Effect::Await { awaitable } = effect else {
            return Ok(EffectAction::Pass);
        };
        if self.take_cancel_flag() {
            return Ok(EffectAction::Error(Exception::cancelled()));
        }
        let promise = self.promises.create(None, false);
        let future = awaitable.start();
        let sender = self.events_tx.clone();
        let handle = tokio::spawn(async move {
            let result = future.await;
            let _ = sender.send(ExternalEvent::PromiseCompleted { promise, result });
        });
        self.await_handles.insert(promise, handle);
        self.pending_external.insert(PendingKey::Promise(promise));
        Ok(EffectAction::Block(BlockReason::Promise { promise }))
    }

    // SPAWNING
    // --------------------------------------------------------------------------------------------

    pub(crate) fn spawn_local_task(&mut self, body: DoExpr, backend: SpawnBackend) -> TaskId {
        let id = self.alloc_task_id();
        let state = self.state();
        let child = TaskState::new(
            body,
            state.env.clone(),
            state.store.snapshot_for_spawn(),
            state.handlers.clone(),
        );
        self.tasks.insert(id, Task::local(id, backend, Some(self.current), child));
        self.ready.push_back(id);
        self.stats.total_tasks_spawned += 1;
        debug!(task = id.as_u64(), %backend, "spawned task");
        id
    }

    pub(crate) fn spawn_pooled_task(&mut self, body: DoExpr) -> TaskId {
        let id = self.alloc_task_id();
        self.tasks.insert(id, Task::external(id, SpawnBackend::Pooled, Some(self.current)));
        let job = PooledJob {
            task: id,
            body,
            env: self.state().env.clone(),
            store: self.state().store.snapshot_for_spawn(),
            memo: self.memo.clone(),
            cache: self.cache.clone(),
            handlers: self.state().handlers.clone(),
            options: self
                .options()
                .clone()
                .with_profiling(false)
                .with_trace(false),
        };
        self.pending_external.insert(PendingKey::Pooled(id));
        self.stats.total_tasks_spawned += 1;
        if self.pooled_active < self.options().spawn_thread_max_workers() {
            self.launch_pooled(job);
        } else {
            self.pooled_queue.push_back(job);
        }
        id
    }

    pub(crate) fn launch_pooled(&mut self, job: PooledJob) {
        self.pooled_active += 1;
        let sender = self.events_tx.clone();
        let task = job.task;
        debug!(task = task.as_u64(), "launching pooled worker");
        std::thread::spawn(move || {
            let outcome = crate::interpreter::run_pooled_job(job);
            let _ = sender.send(ExternalEvent::PooledTaskDone { task, outcome: Box::new(outcome) });
        });
    }

    // CANCELLATION
    // --------------------------------------------------------------------------------------------

    /// Requests cancellation of a task. Blocked tasks are woken immediately with the cancel
    /// error (they are at a suspension point); runnable tasks get the flag and fail at their
    /// next suspension point. Completed tasks accept cancel as a no-op.
    pub(crate) fn cancel_task(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if task.status.is_done() {
            return;
        }
        task.cancel_requested = true;
        let reason = match &task.status {
            TaskStatus::Blocked(reason) => reason.clone(),
            _ => return,
        };
        match &reason {
            BlockReason::Semaphore { key } => {
                let key = key.clone();
                self.semaphores.remove_waiter(&key, task_id);
            },
            BlockReason::Promise { promise } => {
                self.abort_internal_await(*promise);
            },
            _ => {},
        }
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.cancel_requested = false;
        }
        debug!(task = task_id.as_u64(), "cancelling blocked task");
        self.wake_task(task_id, Err(Failure::new(Exception::cancelled())));
    }

    /// Aborts the host future behind an internal await promise, if it is still in flight.
    fn abort_internal_await(&mut self, promise: PromiseId) {
        if let Some(handle) = self.await_handles.remove(&promise) {
            if !handle.is_finished() {
                handle.abort();
                self.pending_external.remove(&PendingKey::Promise(promise));
            }
        }
    }

    pub(crate) fn take_cancel_flag(&mut self) -> bool {
        if let Some(task) = self.tasks.get_mut(&self.current) {
            if task.cancel_requested {
                task.cancel_requested = false;
                return true;
            }
        }
        false
    }

    // WAKEUPS
    // --------------------------------------------------------------------------------------------

    /// Delivers a result into a parked task and makes it runnable.
    pub(crate) fn wake_task(&mut self, task_id: TaskId, result: Result<Value, Failure>) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if let TaskBody::Local(state) = &mut task.body {
            state.control = match result {
                Ok(value) => task::Control::Value(value),
                Err(failure) => task::Control::Error(failure),
            };
            task.status = TaskStatus::Ready;
            self.ready.push_back(task_id);
        }
    }

    pub(crate) fn wake_promise_waiters(&mut self, promise: PromiseId) {
        let result = match self.promises.status(promise) {
            Some(PromiseStatus::Done(Ok(value))) => Ok(value.clone()),
            Some(PromiseStatus::Done(Err(error))) => {
                Err(Failure::new(error.clone()))
            },
            _ => return,
        };
        let waiters: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|task| {
                matches!(
                    &task.status,
                    TaskStatus::Blocked(BlockReason::Promise { promise: waited })
                        if *waited == promise
                )
            })
            .map(|task| task.id)
            .collect();
        for waiter in waiters {
            self.wake_task(waiter, result.clone());
        }
    }

    /// Reacts to a settled task: daemon children die with their parent, and every join-blocked
    /// task is re-examined.
    pub(crate) fn on_task_done(&mut self, done: TaskId) {
        let daemons: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|task| task.parent == Some(done) && task.is_daemon() && !task.status.is_done())
            .map(|task| task.id)
            .collect();
        for daemon in daemons {
            debug!(task = daemon.as_u64(), "cancelling daemon of finished parent");
            self.cancel_task(daemon);
        }

        let blocked: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|task| {
                matches!(
                    &task.status,
                    TaskStatus::Blocked(
                        BlockReason::Join { .. }
                            | BlockReason::JoinAll { .. }
                            | BlockReason::JoinAny { .. }
                    )
                )
            })
            .map(|task| task.id)
            .collect();
        for task_id in blocked {
            self.try_unblock_join(task_id);
        }
    }

    fn task_done(&self, task_id: TaskId) -> bool {
        self.tasks
            .get(&task_id)
            .map(|task| task.status.is_done())
            .unwrap_or(true)
    }

    fn outcome_of(&self, task_id: TaskId) -> Option<TaskOutcome> {
        self.tasks.get(&task_id).and_then(Task::outcome).cloned()
    }

    fn try_unblock_join(&mut self, task_id: TaskId) {
        let reason = match self.tasks.get(&task_id).map(|task| &task.status) {
            Some(TaskStatus::Blocked(reason)) => reason.clone(),
            _ => return,
        };
        match reason {
            BlockReason::Join { target } => {
                let Some(outcome) = self.outcome_of(target) else {
                    return;
                };
                match outcome.result {
                    Ok(value) => {
                        self.merge_into_parked(task_id, outcome.store);
                        self.wake_task(task_id, Ok(value));
                    },
                    Err(failure) => self.wake_task(task_id, Err(failure)),
                }
            },

            BlockReason::JoinAll { targets, dict_keys } => {
                let any_failed = targets.iter().any(|target| {
                    matches!(self.outcome_of(*target), Some(outcome) if outcome.result.is_err())
                });
                if any_failed {
                    for target in &targets {
                        if !self.task_done(*target) {
                            self.cancel_task(*target);
                        }
                    }
                }
                if !targets.iter().all(|target| self.task_done(*target)) {
                    return;
                }
                self.deliver_join_all(task_id, targets, dict_keys);
            },

            BlockReason::JoinAny { targets, winner } => {
                let winner =
                    winner.or_else(|| targets.iter().copied().find(|t| self.task_done(*t)));
                let Some(winner) = winner else {
                    return;
                };
                for target in &targets {
                    if *target != winner && !self.task_done(*target) {
                        self.cancel_task(*target);
                    }
                }
                if targets.iter().all(|target| self.task_done(*target)) {
                    let Some(outcome) = self.outcome_of(winner) else {
                        return;
                    };
                    match outcome.result {
                        Ok(value) => {
                            self.merge_into_parked(task_id, outcome.store);
                            self.wake_task(task_id, Ok(value));
                        },
                        Err(failure) => self.wake_task(task_id, Err(failure)),
                    }
                } else if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.status =
                        TaskStatus::Blocked(BlockReason::JoinAny { targets, winner: Some(winner) });
                }
            },

            _ => {},
        }
    }

    /// Delivers a settled gather: the first real (non-cancellation) failure wins; otherwise the
    /// child stores merge in input order and the values are returned in input order.
    fn deliver_join_all(
        &mut self,
        task_id: TaskId,
        targets: Vec<TaskId>,
        dict_keys: Option<Vec<String>>,
    ) {
        let outcomes: Vec<TaskOutcome> = targets
            .iter()
            .filter_map(|target| self.outcome_of(*target))
            .collect();
        if outcomes.len() != targets.len() {
            warn!(task = task_id.as_u64(), "gather target vanished before delivery");
            self.wake_task(
                task_id,
                Err(Failure::new(Exception::value_error("gather target vanished"))),
            );
            return;
        }

        let failure = outcomes
            .iter()
            .filter_map(|outcome| outcome.result.as_ref().err())
            .find(|failure| !failure.is_cancelled())
            .or_else(|| outcomes.iter().filter_map(|o| o.result.as_ref().err()).next())
            .cloned();
        if let Some(failure) = failure {
            self.wake_task(task_id, Err(failure));
            return;
        }

        let mut values = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            self.merge_into_parked(task_id, outcome.store);
            values.push(outcome.result.expect("checked above"));
        }
        let value = match dict_keys {
            None => Value::list(values),
            Some(keys) => Value::map(keys.into_iter().zip_eq(values)),
        };
        self.wake_task(task_id, Ok(value));
    }

    fn merge_into_parked(&mut self, task_id: TaskId, child_store: Store) {
        if let Some(task) = self.tasks.get_mut(&task_id) {
            if let TaskBody::Local(state) = &mut task.body {
                state.store.merge_child(child_store);
            }
        }
    }

    // SEMAPHORE WAKEUPS
    // --------------------------------------------------------------------------------------------

    /// Returns a permit and hands it to the oldest waiter still blocked on the key.
    pub(crate) fn release_semaphore_and_wake(&mut self, key: &str) -> Result<(), Exception> {
        let mut next = self.semaphores.release(key)?;
        loop {
            match next {
                Some(waiter) if self.is_blocked_on_semaphore(waiter, key) => {
                    self.wake_task(waiter, Ok(Value::Unit));
                    return Ok(());
                },
                Some(_) => {
                    next = self.semaphores.pass_over(key);
                },
                None => return Ok(()),
            }
        }
    }

    fn is_blocked_on_semaphore(&self, task_id: TaskId, key: &str) -> bool {
        matches!(
            self.tasks.get(&task_id).map(|task| &task.status),
            Some(TaskStatus::Blocked(BlockReason::Semaphore { key: waited })) if waited == key
        )
    }

    // EVENTS
    // --------------------------------------------------------------------------------------------

    pub(crate) fn apply_event(&mut self, event: ExternalEvent) {
        match event {
            ExternalEvent::PromiseCompleted { promise, result } => {
                self.pending_external.remove(&PendingKey::Promise(promise));
                self.await_handles.remove(&promise);
                match self.promises.complete(promise, result) {
                    Ok(()) => self.wake_promise_waiters(promise),
                    // A completer may race an abort or double-complete; late completions lose.
                    Err(_) => {
                        debug!(promise = promise.as_u64(), "ignoring late promise completion");
                    },
                }
            },

            ExternalEvent::PooledTaskDone { task, outcome } => {
                self.pending_external.remove(&PendingKey::Pooled(task));
                self.pooled_active = self.pooled_active.saturating_sub(1);
                let outcome = *outcome;
                for (key, value) in outcome.memo {
                    self.memo.insert(key, value);
                }
                let cancelled = self
                    .tasks
                    .get(&task)
                    .map(|entry| entry.cancel_requested)
                    .unwrap_or(false);
                let result = if cancelled {
                    Err(Failure::new(Exception::cancelled()))
                } else {
                    outcome.result
                };
                if let Some(entry) = self.tasks.get_mut(&task) {
                    entry.status = TaskStatus::Done(TaskOutcome { result, store: outcome.store });
                    entry.body = TaskBody::Finished;
                }
                self.on_task_done(task);
                if self.pooled_active < self.options().spawn_thread_max_workers() {
                    if let Some(job) = self.pooled_queue.pop_front() {
                        self.launch_pooled(job);
                    }
                }
            },
        }
    }
}
