//! Effect dispatch: matching an effect against the handler stack.
//!
//! Handlers fire strictly innermost-first. `Delegate` and `Pass` move the walk one handler
//! down; reaching the bottom with an unhandled effect aborts the run. A handler that resolves
//! the effect does so through a one-shot continuation token, a replacement program, or a plain
//! value.

use doeff_core::{
    BuiltinHandler, Continuation, Effect, Exception, Handler, HandlerOutcome, InterceptOutcome,
    InternalEffect, Value,
};
use tracing::{debug, warn};

use crate::{
    continuation::FrameKind,
    errors::{ExecutionError, Failure},
    interpreter::{Interpreter, StepFlow},
    scheduler::task::BlockReason,
};

// EFFECT ACTION
// ================================================================================================

/// What a built-in handler decided to do with an effect.
pub(crate) enum EffectAction {
    /// Resolve the effect with this value.
    Value(Value),
    /// Run this program in place of the effect; its value flows into the continuation.
    Program(doeff_core::DoExpr),
    /// The effect's handling raised a user-level error.
    Error(Exception),
    /// The effect's handling surfaced an already-built failure (a joined child's, usually).
    Fail(Failure),
    /// Suspend the current task.
    Block(BlockReason),
    /// Not this handler's effect.
    Pass,
    /// Keep walking with a replacement effect.
    Delegate(Effect),
}

impl Interpreter {
    // DISPATCH
    // --------------------------------------------------------------------------------------------

    /// Dispatches an effect against the handler stack, starting below `below` when a
    /// delegation continues an earlier walk.
    pub(crate) fn dispatch_effect(
        &mut self,
        effect: Effect,
        below: Option<usize>,
    ) -> Result<StepFlow, ExecutionError> {
        self.stats.total_effects_handled += 1;
        self.profiler.record_dispatch(effect.name());
        self.record_trace("Effect", effect.name());

        // Machine-level effects never reach the handler stack.
        let effect = if below.is_none() {
            match self.pre_dispatch(effect)? {
                PreDispatch::Handled(flow) => return Ok(flow),
                PreDispatch::Continue(effect) => effect,
            }
        } else {
            effect
        };

        let mut effect = effect;
        let start = below.unwrap_or_else(|| self.state().handlers.len());
        let mut index = start;
        while index > 0 {
            index -= 1;
            let handler = self.state().handlers[index].clone();
            match handler {
                Handler::Builtin(builtin) => {
                    match self.handle_builtin(builtin, &effect)? {
                        EffectAction::Value(value) => {
                            self.set_value(value);
                            return Ok(StepFlow::Continue);
                        },
                        EffectAction::Program(program) => {
                            self.set_program(program);
                            return Ok(StepFlow::Continue);
                        },
                        EffectAction::Error(exception) => {
                            let failure = self.fail_from_effect(exception, effect);
                            self.set_failure(failure);
                            return Ok(StepFlow::Continue);
                        },
                        EffectAction::Fail(failure) => {
                            self.set_failure(failure);
                            return Ok(StepFlow::Continue);
                        },
                        EffectAction::Block(reason) => return Ok(StepFlow::Block(reason)),
                        EffectAction::Pass => {},
                        EffectAction::Delegate(replacement) => effect = replacement,
                    }
                },
                Handler::User(user) => {
                    debug!(handler = user.name(), effect = effect.name(), "user handler");
                    let token = Continuation::new(self.capture_current());
                    let outcome = match user.handle(&effect, token) {
                        Ok(outcome) => outcome,
                        Err(exception) => {
                            self.continuations.dispose(token.id());
                            let failure = self.fail_from_effect(exception, effect);
                            self.set_failure(failure);
                            return Ok(StepFlow::Continue);
                        },
                    };
                    match outcome {
                        HandlerOutcome::Resume(resumed, value) => {
                            if resumed.id() != token.id() {
                                return Err(ExecutionError::ForeignResume {
                                    handler: user.name().to_string(),
                                });
                            }
                            let captured = self.continuations.consume(resumed.id())?;
                            self.install_captured(captured);
                            self.set_value(value);
                            return Ok(StepFlow::Continue);
                        },
                        HandlerOutcome::Transfer(target, value) => {
                            if target.id() != token.id() {
                                self.continuations.dispose(token.id());
                            }
                            let captured = self.continuations.consume(target.id())?;
                            return self.begin_unwind(crate::continuation::TransferUnwind {
                                target: captured,
                                value,
                            });
                        },
                        HandlerOutcome::Delegate(replacement) => {
                            self.continuations.dispose(token.id());
                            if let Some(replacement) = replacement {
                                effect = replacement;
                            }
                        },
                        HandlerOutcome::Pass => {
                            self.continuations.dispose(token.id());
                        },
                        HandlerOutcome::Run(program) => {
                            // The token stays live: the program may resume it explicitly. If
                            // it never does, its value flows into the dispatch frame below.
                            self.push_frame(FrameKind::Dispatch {
                                effect: effect.clone(),
                                below: index,
                            })?;
                            self.set_program(program);
                            return Ok(StepFlow::Continue);
                        },
                        HandlerOutcome::Return(value) => {
                            self.continuations.dispose(token.id());
                            self.set_value(value);
                            return Ok(StepFlow::Continue);
                        },
                    }
                },
            }
        }

        let handlers_tried = start;
        warn!(effect = effect.name(), "unhandled effect");
        Err(ExecutionError::UnhandledEffect { effect: effect.name(), handlers_tried })
    }

    // PRE-DISPATCH
    // --------------------------------------------------------------------------------------------

    fn pre_dispatch(&mut self, effect: Effect) -> Result<PreDispatch, ExecutionError> {
        // Intercept transforms from enclosing scopes come first.
        let effect = match self.apply_intercepts(effect) {
            InterceptResult::Effect(effect) => effect,
            InterceptResult::Program(program) => {
                self.set_program(program);
                return Ok(PreDispatch::handled());
            },
        };

        match effect {
            Effect::Intercept { body, transforms } => {
                self.push_frame(FrameKind::Intercept { transforms })?;
                self.set_program(*body);
                Ok(PreDispatch::handled())
            },

            Effect::ProgramCallStack => {
                let frames: Vec<Value> = self
                    .state()
                    .call_stack
                    .iter()
                    .map(|frame| Value::Frame(frame.clone()))
                    .collect();
                self.set_value(Value::list(frames));
                Ok(PreDispatch::handled())
            },

            Effect::ProgramCallFrame { depth } => {
                let stack = &self.state().call_stack;
                if depth >= stack.len() {
                    let exception = Exception::index_error(format!(
                        "program call stack depth {depth} out of range (size={})",
                        stack.len(),
                    ));
                    self.set_error(exception);
                } else {
                    let frame = stack[stack.len() - 1 - depth].clone();
                    self.set_value(Value::Frame(frame));
                }
                Ok(PreDispatch::handled())
            },

            Effect::Internal(internal) => {
                let flow = self.handle_internal(internal)?;
                Ok(PreDispatch::Handled(flow))
            },

            other => Ok(PreDispatch::Continue(other)),
        }
    }

    /// Applies intercept transforms found in the continuation stack, topmost scope first.
    /// The first transform producing a program stops the chain; effect rewrites feed the next
    /// transform.
    fn apply_intercepts(&mut self, effect: Effect) -> InterceptResult {
        let mut current = effect;
        let transform_sets: Vec<Vec<doeff_core::EffectTransform>> = self
            .state()
            .k
            .iter_topmost_first()
            .filter_map(|frame| match frame.kind() {
                FrameKind::Intercept { transforms } => Some(transforms.clone()),
                _ => None,
            })
            .collect();
        for transforms in transform_sets {
            for transform in transforms {
                match transform.apply(&current) {
                    None => {},
                    Some(InterceptOutcome::Effect(rewritten)) => {
                        current = rewritten;
                        break;
                    },
                    Some(InterceptOutcome::Program(program)) => {
                        return InterceptResult::Program(program);
                    },
                }
            }
        }
        InterceptResult::Effect(current)
    }

    // BUILT-IN ROUTING
    // --------------------------------------------------------------------------------------------

    fn handle_builtin(
        &mut self,
        builtin: BuiltinHandler,
        effect: &Effect,
    ) -> Result<EffectAction, ExecutionError> {
        match builtin {
            BuiltinHandler::ResultSafe => self.handle_result_effect(effect),
            BuiltinHandler::State => self.handle_state_effect(effect),
            BuiltinHandler::Writer => self.handle_writer_effect(effect),
            BuiltinHandler::Reader => self.handle_reader_effect(effect),
            BuiltinHandler::LazyAsk => self.handle_lazy_ask_effect(effect),
            BuiltinHandler::Scheduler => self.handle_scheduler_effect(effect),
            BuiltinHandler::Io => self.handle_io_effect(effect),
            BuiltinHandler::Memo => self.handle_memo_effect(effect),
            BuiltinHandler::Cache => self.handle_cache_effect(effect),
            BuiltinHandler::Graph => self.handle_graph_effect(effect),
            BuiltinHandler::Await => self.handle_await_effect(effect),
        }
    }

    fn handle_internal(&mut self, internal: InternalEffect) -> Result<StepFlow, ExecutionError> {
        match internal {
            InternalEffect::LazyResolve { .. }
            | InternalEffect::LazyComplete { .. }
            | InternalEffect::LazyAbort { .. } => self.handle_lazy_internal(internal),
            InternalEffect::AtomicApply { key, func, default } => {
                self.handle_atomic_apply(key, func, default)
            },
            InternalEffect::CacheApply { op } => self.handle_cache_apply(op),
        }
    }

}

// SUPPORT TYPES
// ================================================================================================

enum PreDispatch {
    Handled(StepFlow),
    Continue(Effect),
}

impl PreDispatch {
    fn handled() -> Self {
        Self::Handled(StepFlow::Continue)
    }
}

enum InterceptResult {
    Effect(Effect),
    Program(doeff_core::DoExpr),
}
