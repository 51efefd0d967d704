//! One reduction of the CESK machine.
//!
//! `step` looks at the current control and the top continuation frame and produces the next
//! state. It never recurses into programs; nesting always goes through frames, which is what
//! makes deep programs safe regardless of host stack size.

use std::{collections::BTreeMap, sync::Arc};

use doeff_core::{
    Arg, CallFrame, DoExpr, Effect, Value,
};

use crate::{
    continuation::{FrameKind, FrameState, PendingOutcome, TransferUnwind},
    errors::{ExecutionError, Failure},
    interpreter::Interpreter,
    scheduler::task::{BlockReason, Control},
};

// STEP FLOW
// ================================================================================================

/// What the run loop should do after one reduction.
#[derive(Debug)]
pub(crate) enum StepFlow {
    Continue,
    Block(BlockReason),
    Done(Result<Value, Failure>),
}

/// Which resume primitive is being applied.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ResumeKind {
    Resume,
    Transfer,
    ResumeContinuation,
}

impl Interpreter {
    // CONTROL HELPERS
    // --------------------------------------------------------------------------------------------

    pub(crate) fn set_value(&mut self, value: Value) {
        self.state_mut().control = Control::Value(value);
    }

    pub(crate) fn set_program(&mut self, program: DoExpr) {
        self.state_mut().control = Control::Program(program);
    }

    pub(crate) fn set_failure(&mut self, failure: Failure) {
        self.state_mut().control = Control::Error(failure);
    }

    pub(crate) fn set_error(&mut self, exception: doeff_core::Exception) {
        let failure = self.fail_from(exception);
        self.set_failure(failure);
    }

    // STEP
    // --------------------------------------------------------------------------------------------

    /// Performs one reduction of the current task.
    pub(crate) fn step(&mut self) -> Result<StepFlow, ExecutionError> {
        self.stats.total_steps += 1;
        let control =
            std::mem::replace(&mut self.state_mut().control, Control::Value(Value::Unit));
        self.profiler.record_step(control.kind());
        match control {
            Control::Program(expr) => self.step_program(expr),
            Control::Value(value) => {
                if self.state().k.is_empty() {
                    return Ok(StepFlow::Done(Ok(value)));
                }
                self.step_value(value)
            },
            Control::Error(failure) => {
                if self.state().k.is_empty() {
                    return Ok(StepFlow::Done(Err(failure)));
                }
                self.step_error(failure)
            },
            Control::Effect { effect, below } => self.dispatch_effect(effect, below),
        }
    }

    // PROGRAM REDUCTION
    // --------------------------------------------------------------------------------------------

    fn step_program(&mut self, expr: DoExpr) -> Result<StepFlow, ExecutionError> {
        self.record_trace("Program", expr.kind());
        match expr {
            DoExpr::Pure(value) => {
                self.set_value(value);
                Ok(StepFlow::Continue)
            },

            DoExpr::Apply { func, positional, keyword, meta: _ } => {
                self.step_apply(func, positional, keyword)
            },

            DoExpr::Eval(inner) => {
                self.set_program(*inner);
                Ok(StepFlow::Continue)
            },

            DoExpr::Map { source, mapper, meta: _ } => {
                self.push_frame(FrameKind::Map { mapper })?;
                self.set_program(*source);
                Ok(StepFlow::Continue)
            },

            DoExpr::FlatMap { source, binder, meta } => {
                let saved_env = self.state().env.clone();
                self.push_frame(FrameKind::Bind { binder, saved_env, meta })?;
                self.set_program(*source);
                Ok(StepFlow::Continue)
            },

            DoExpr::Perform(effect) => {
                self.state_mut().control = Control::Effect { effect, below: None };
                Ok(StepFlow::Continue)
            },

            DoExpr::WithHandler { handler, body, meta: _ } => {
                self.push_frame(FrameKind::Handler { handler: handler.clone() })?;
                self.state_mut().handlers.push(handler);
                self.set_program(*body);
                Ok(StepFlow::Continue)
            },

            DoExpr::Resume { continuation, value } => {
                self.step_resume_like(ResumeKind::Resume, *continuation, *value)
            },

            DoExpr::Transfer { continuation, value } => {
                self.step_resume_like(ResumeKind::Transfer, *continuation, *value)
            },

            DoExpr::ResumeContinuation { continuation, value } => {
                self.step_resume_like(ResumeKind::ResumeContinuation, *continuation, *value)
            },

            DoExpr::Delegate(replacement) => {
                let found = self.state().k.iter_topmost_first().find_map(|frame| {
                    match frame.kind() {
                        FrameKind::Dispatch { effect, below } => {
                            Some((effect.clone(), *below))
                        },
                        _ => None,
                    }
                });
                match found {
                    Some((original, below)) => {
                        let effect = replacement.unwrap_or(original);
                        self.state_mut().control = Control::Effect { effect, below: Some(below) };
                        Ok(StepFlow::Continue)
                    },
                    None => Err(ExecutionError::invariant(
                        "Delegate used outside an effect dispatch",
                    )),
                }
            },

            DoExpr::CreateContinuation { body } => {
                let id = self.capture_current();
                match body.apply(Value::Continuation(id)) {
                    Ok(program) => self.set_program(program),
                    Err(exception) => self.set_error(exception),
                }
                Ok(StepFlow::Continue)
            },

            DoExpr::GetContinuation => {
                let id = self.capture_current();
                self.set_value(Value::Continuation(id));
                Ok(StepFlow::Continue)
            },

            DoExpr::GetHandlers => {
                let names: Vec<Value> = self
                    .state()
                    .handlers
                    .iter()
                    .rev()
                    .map(|handler| Value::str(handler.name()))
                    .collect();
                self.set_value(Value::list(names));
                Ok(StepFlow::Continue)
            },

            DoExpr::GetCallStack => {
                let frames: Vec<Value> = self
                    .state()
                    .call_stack
                    .iter()
                    .map(|frame| Value::Frame(frame.clone()))
                    .collect();
                self.set_value(Value::list(frames));
                Ok(StepFlow::Continue)
            },

            DoExpr::GetTrace => {
                let trace = self.trace_snapshot();
                self.set_value(Value::opaque("execution_trace", trace));
                Ok(StepFlow::Continue)
            },

            DoExpr::AsyncEscape { awaitable } => {
                self.state_mut().control = Control::Effect {
                    effect: Effect::Await { awaitable },
                    below: None,
                };
                Ok(StepFlow::Continue)
            },
        }
    }

    /// Reduces `Apply`: a call with only resolved arguments runs immediately; otherwise the
    /// subprogram arguments are collected left-to-right through a gather frame and the call
    /// happens in a map frame on top of the collected list.
    fn step_apply(
        &mut self,
        func: doeff_core::HostFn,
        positional: Vec<Arg>,
        keyword: Vec<(String, Arg)>,
    ) -> Result<StepFlow, ExecutionError> {
        let all_pure =
            positional.iter().all(Arg::is_pure) && keyword.iter().all(|(_, arg)| arg.is_pure());

        if all_pure {
            let positional: Vec<Value> = positional
                .into_iter()
                .map(|arg| match arg {
                    Arg::Pure(value) => value,
                    Arg::Perform(_) => unreachable!("checked by all_pure"),
                })
                .collect();
            let keyword: BTreeMap<String, Value> = keyword
                .into_iter()
                .map(|(key, arg)| match arg {
                    Arg::Pure(value) => (key, value),
                    Arg::Perform(_) => unreachable!("checked by all_pure"),
                })
                .collect();
            match func.call(positional, keyword) {
                Ok(value) => self.set_value(value),
                Err(exception) => self.set_error(exception),
            }
            return Ok(StepFlow::Continue);
        }

        let arity = positional.len();
        let keys: Vec<String> = keyword.iter().map(|(key, _)| key.clone()).collect();
        let mut items: Vec<DoExpr> = positional
            .into_iter()
            .map(|arg| match arg {
                Arg::Pure(value) => DoExpr::Pure(value),
                Arg::Perform(program) => program,
            })
            .collect();
        items.extend(keyword.into_iter().map(|(_, arg)| match arg {
            Arg::Pure(value) => DoExpr::Pure(value),
            Arg::Perform(program) => program,
        }));

        let mapper = doeff_core::MapFn::new(move |packed: Value| {
            let items = packed.as_list()?;
            let (positional, keyword_values) = items.split_at(arity);
            let keyword: BTreeMap<String, Value> = keys
                .iter()
                .cloned()
                .zip(keyword_values.iter().cloned())
                .collect();
            func.call(positional.to_vec(), keyword)
        });
        self.push_frame(FrameKind::Map { mapper })?;

        let mut remaining: std::collections::VecDeque<DoExpr> = items.into();
        let first = remaining.pop_front().expect("apply has at least one pending argument");
        let saved_env = self.state().env.clone();
        self.push_frame(FrameKind::Gather {
            remaining,
            collected: Vec::new(),
            saved_env,
        })?;
        self.set_program(first);
        Ok(StepFlow::Continue)
    }

    // VALUE REDUCTION
    // --------------------------------------------------------------------------------------------

    fn step_value(&mut self, value: Value) -> Result<StepFlow, ExecutionError> {
        let mut frame = self
            .state_mut()
            .k
            .pop()
            .ok_or_else(|| ExecutionError::invariant("value with empty continuation stack"))?;
        frame.transition(FrameState::Completed)?;
        match frame.into_kind() {
            FrameKind::Bind { binder, saved_env, meta } => {
                self.state_mut().env = saved_env;
                match binder.apply(value.clone()) {
                    Ok(body) => {
                        if let Some(meta) = meta {
                            let args = match &value {
                                Value::List(items) => (**items).clone(),
                                other => vec![other.clone()],
                            };
                            let depth = self.state().call_stack.len();
                            let call =
                                Arc::new(CallFrame::new(&meta, args, BTreeMap::new(), depth));
                            self.state_mut().call_stack.push(call.clone());
                            self.push_frame(FrameKind::Call { frame: call })?;
                        }
                        self.set_program(body);
                    },
                    Err(exception) => self.set_error(exception),
                }
            },

            FrameKind::Map { mapper } => match mapper.apply(value) {
                Ok(mapped) => self.set_value(mapped),
                Err(exception) => self.set_error(exception),
            },

            FrameKind::Handler { .. } => {
                self.state_mut().handlers.pop();
                self.set_value(value);
            },

            FrameKind::Gather { mut remaining, mut collected, saved_env } => {
                collected.push(value);
                match remaining.pop_front() {
                    Some(next) => {
                        self.state_mut().env = saved_env.clone();
                        self.push_frame(FrameKind::Gather { remaining, collected, saved_env })?;
                        self.set_program(next);
                    },
                    None => {
                        self.state_mut().env = saved_env;
                        self.set_value(Value::list(collected));
                    },
                }
            },

            FrameKind::Listen { log_start } => {
                let slice = self.state().store.log().slice_from(log_start);
                self.set_value(Value::list([value, slice.to_value()]));
            },

            FrameKind::Local { restore_env } => {
                self.state_mut().env = restore_env;
                self.set_value(value);
            },

            FrameKind::Safe { saved_env } => {
                self.state_mut().env = saved_env;
                self.set_value(Value::ok(value));
            },

            FrameKind::Finally { finalizer, saved_env } => {
                self.state_mut().env = saved_env;
                self.push_frame(FrameKind::Rethrow { pending: PendingOutcome::Value(value) })?;
                self.set_program(finalizer);
            },

            FrameKind::Catch { .. } => self.set_value(value),

            FrameKind::Call { .. } => {
                self.state_mut().call_stack.pop();
                self.set_value(value);
            },

            FrameKind::Intercept { .. } => self.set_value(value),

            FrameKind::FirstSuccess { .. } => self.set_value(value),

            FrameKind::Rethrow { pending } => match pending {
                PendingOutcome::Value(original) => self.set_value(original),
                PendingOutcome::Error(original) => self.set_failure(original),
                PendingOutcome::Transfer(unwind) => return self.continue_unwind(unwind),
            },

            FrameKind::Dispatch { .. } => self.set_value(value),
        }
        Ok(StepFlow::Continue)
    }

    // ERROR PROPAGATION
    // --------------------------------------------------------------------------------------------

    fn step_error(&mut self, failure: Failure) -> Result<StepFlow, ExecutionError> {
        let final_state = if failure.is_cancelled() {
            FrameState::Cancelled
        } else {
            FrameState::Failed
        };
        let mut frame = self
            .state_mut()
            .k
            .pop()
            .ok_or_else(|| ExecutionError::invariant("error with empty continuation stack"))?;
        frame.transition(final_state)?;
        match frame.into_kind() {
            FrameKind::Bind { saved_env, .. } => {
                self.state_mut().env = saved_env;
                self.set_failure(failure);
            },

            FrameKind::Map { .. } | FrameKind::Listen { .. } | FrameKind::Intercept { .. } => {
                self.set_failure(failure);
            },

            FrameKind::Handler { .. } => {
                self.state_mut().handlers.pop();
                self.set_failure(failure);
            },

            FrameKind::Gather { saved_env, .. } => {
                self.state_mut().env = saved_env;
                self.set_failure(failure);
            },

            FrameKind::Local { restore_env } => {
                self.state_mut().env = restore_env;
                self.set_failure(failure);
            },

            FrameKind::Safe { saved_env } => {
                self.stats.total_exceptions_caught += 1;
                self.state_mut().env = saved_env;
                self.set_value(Value::err(failure.exception));
            },

            FrameKind::Finally { finalizer, saved_env } => {
                self.state_mut().env = saved_env;
                self.push_frame(FrameKind::Rethrow { pending: PendingOutcome::Error(failure) })?;
                self.set_program(finalizer);
            },

            FrameKind::Catch { handler, saved_env } => {
                self.state_mut().env = saved_env;
                match handler.apply(failure.exception.clone()) {
                    Ok(recovery) => {
                        self.stats.total_exceptions_caught += 1;
                        self.set_program(recovery);
                    },
                    Err(exception) => {
                        self.set_error(exception.with_cause(failure.exception));
                    },
                }
            },

            FrameKind::Call { .. } => {
                self.state_mut().call_stack.pop();
                self.set_failure(failure);
            },

            FrameKind::FirstSuccess { mut remaining, saved_user, saved_env } => {
                self.state_mut().store.restore_user(saved_user.clone());
                match remaining.pop_front() {
                    Some(next) => {
                        self.stats.total_exceptions_caught += 1;
                        self.state_mut().env = saved_env.clone();
                        self.push_frame(FrameKind::FirstSuccess {
                            remaining,
                            saved_user,
                            saved_env,
                        })?;
                        self.set_program(next);
                    },
                    None => self.set_failure(failure),
                }
            },

            FrameKind::Rethrow { pending } => match pending {
                // The finalizer itself failed. A normal return turns into this error; an
                // in-flight error keeps propagating with the finalizer's recorded alongside;
                // an abandoned transfer propagates the finalizer error carrying the value.
                PendingOutcome::Value(_) => self.set_failure(failure),
                PendingOutcome::Error(mut original) => {
                    original.exception = original.exception.with_suppressed(failure.exception);
                    self.set_failure(original);
                },
                PendingOutcome::Transfer(unwind) => {
                    let exception = failure.exception.with_payload(unwind.value);
                    self.set_error(exception);
                },
            },

            FrameKind::Dispatch { .. } => self.set_failure(failure),
        }
        Ok(StepFlow::Continue)
    }

    // RESUME / TRANSFER
    // --------------------------------------------------------------------------------------------

    fn step_resume_like(
        &mut self,
        kind: ResumeKind,
        continuation: DoExpr,
        value: DoExpr,
    ) -> Result<StepFlow, ExecutionError> {
        match (continuation, value) {
            (DoExpr::Pure(k_value), DoExpr::Pure(v_value)) => {
                self.apply_resume(kind, k_value, v_value)
            },
            (k_expr, v_expr) => {
                // Resolve both operands, then come back through here with pure positions.
                let rebuilt = k_expr.flat_map(move |k_value| {
                    let v_expr = v_expr.clone();
                    Ok(v_expr.flat_map(move |v_value| {
                        let continuation = Box::new(DoExpr::Pure(k_value.clone()));
                        let value = Box::new(DoExpr::Pure(v_value));
                        Ok(match kind {
                            ResumeKind::Resume => DoExpr::Resume { continuation, value },
                            ResumeKind::Transfer => DoExpr::Transfer { continuation, value },
                            ResumeKind::ResumeContinuation => {
                                DoExpr::ResumeContinuation { continuation, value }
                            },
                        })
                    }))
                });
                self.set_program(rebuilt);
                Ok(StepFlow::Continue)
            },
        }
    }

    fn apply_resume(
        &mut self,
        kind: ResumeKind,
        k_value: Value,
        v_value: Value,
    ) -> Result<StepFlow, ExecutionError> {
        let id = match k_value.as_continuation() {
            Ok(id) => id,
            Err(exception) => {
                self.set_error(exception);
                return Ok(StepFlow::Continue);
            },
        };
        // Consumption happens before any side effect; a second use is fatal.
        let captured = self.continuations.consume(id)?;
        match kind {
            ResumeKind::Resume | ResumeKind::ResumeContinuation => {
                self.install_captured(captured);
                self.set_value(v_value);
                Ok(StepFlow::Continue)
            },
            ResumeKind::Transfer => {
                self.begin_unwind(TransferUnwind { target: captured, value: v_value })
            },
        }
    }

    // TRANSFER UNWINDING
    // --------------------------------------------------------------------------------------------

    /// Unwinds the current continuation stack toward the capture point of a transfer target,
    /// running every `Finally` finalizer on the way. When a finalizer must run, the remaining
    /// unwind is parked in a rethrow frame and resumed after it.
    pub(crate) fn begin_unwind(
        &mut self,
        unwind: TransferUnwind,
    ) -> Result<StepFlow, ExecutionError> {
        loop {
            let at_target = self.state().k.top_id() == unwind.target.top_frame_id();
            if at_target || self.state().k.is_empty() {
                self.install_captured(unwind.target);
                self.set_value(unwind.value);
                return Ok(StepFlow::Continue);
            }
            let mut frame = self.state_mut().k.pop().expect("checked non-empty");
            frame.transition(FrameState::Cancelled)?;
            match frame.into_kind() {
                FrameKind::Handler { .. } => {
                    self.state_mut().handlers.pop();
                },
                FrameKind::Call { .. } => {
                    self.state_mut().call_stack.pop();
                },
                FrameKind::Local { restore_env } => {
                    self.state_mut().env = restore_env;
                },
                FrameKind::Finally { finalizer, saved_env } => {
                    self.state_mut().env = saved_env;
                    self.push_frame(FrameKind::Rethrow {
                        pending: PendingOutcome::Transfer(unwind),
                    })?;
                    self.set_program(finalizer);
                    return Ok(StepFlow::Continue);
                },
                _ => {},
            }
        }
    }

    pub(crate) fn continue_unwind(
        &mut self,
        unwind: TransferUnwind,
    ) -> Result<StepFlow, ExecutionError> {
        self.begin_unwind(unwind)
    }

}
