//! The reader handler and the lazy-ask handler.
//!
//! The reader resolves `Ask` against the environment and delegates program-valued entries to
//! the lazy-ask handler below it. Lazy values are evaluated at most once per run, guarded by a
//! per-key semaphore with one permit; the resolved value is shared by every task. A lazy value
//! whose evaluation re-enters its own key is a cycle error, and a failed evaluation clears the
//! pending entry before releasing the semaphore so callers under `Safe` can retry.

use doeff_core::{effects, DoExpr, Effect, Exception, InternalEffect, Value};

use crate::{
    continuation::FrameKind,
    errors::ExecutionError,
    interpreter::{dispatch::EffectAction, Interpreter, StepFlow},
};

fn lazy_semaphore_key(key: &str) -> String {
    format!("__lazy__:{key}")
}

impl Interpreter {
    // READER
    // --------------------------------------------------------------------------------------------

    pub(crate) fn handle_reader_effect(
        &mut self,
        effect: &Effect,
    ) -> Result<EffectAction, ExecutionError> {
        match effect {
            Effect::Ask { key } => match self.state().env.get(key) {
                Some(Value::Program(_)) => Ok(EffectAction::Delegate(effect.clone())),
                Some(value) => Ok(EffectAction::Value(value.clone())),
                None => Ok(EffectAction::Error(Exception::key_error(key))),
            },

            Effect::Local { env_update, body } => {
                let restore_env = self.state().env.clone();
                self.push_frame(FrameKind::Local { restore_env })?;
                let extended = self.state().env.extended(env_update);
                self.state_mut().env = extended;
                Ok(EffectAction::Program((**body).clone()))
            },

            _ => Ok(EffectAction::Pass),
        }
    }

    // LAZY ASK
    // --------------------------------------------------------------------------------------------

    pub(crate) fn handle_lazy_ask_effect(
        &mut self,
        effect: &Effect,
    ) -> Result<EffectAction, ExecutionError> {
        let Effect::Ask { key } = effect else {
            return Ok(EffectAction::Pass);
        };
        let program = match self.state().env.get(key) {
            Some(Value::Program(program)) => (**program).clone(),
            _ => return Ok(EffectAction::Pass),
        };

        if let Some(resolved) = self.lazy_resolved.get(key) {
            return Ok(EffectAction::Value(resolved.clone()));
        }
        if self.state().lazy_in_flight.contains(key) {
            return Ok(EffectAction::Error(Exception::cycle(key)));
        }

        let semaphore_key = lazy_semaphore_key(key);
        self.semaphores.create(&semaphore_key, 1);
        let resolve = DoExpr::Perform(Effect::Internal(InternalEffect::LazyResolve {
            key: key.clone(),
            program: Box::new(program),
        }));
        Ok(EffectAction::Program(
            effects::acquire_semaphore(&semaphore_key).then(resolve),
        ))
    }

    /// The lazy protocol steps that run while the per-key semaphore is held.
    pub(crate) fn handle_lazy_internal(
        &mut self,
        internal: InternalEffect,
    ) -> Result<StepFlow, ExecutionError> {
        match internal {
            InternalEffect::LazyResolve { key, program } => {
                // A sibling may have resolved the key while this task waited on the semaphore.
                if let Some(resolved) = self.lazy_resolved.get(&key).cloned() {
                    self.release_lazy(&key)?;
                    self.set_value(resolved);
                    return Ok(StepFlow::Continue);
                }
                self.state_mut().lazy_in_flight.insert(key.clone());
                let complete_key = key.clone();
                let abort_key = key.clone();
                let evaluate = program
                    .flat_map(move |value| {
                        Ok(DoExpr::Perform(Effect::Internal(InternalEffect::LazyComplete {
                            key: complete_key.clone(),
                            value,
                        })))
                    });
                let guarded = effects::catch(evaluate, move |error| {
                    Ok(DoExpr::Perform(Effect::Internal(InternalEffect::LazyAbort {
                        key: abort_key.clone(),
                    }))
                    .then(effects::fail(error)))
                });
                self.set_program(guarded);
                Ok(StepFlow::Continue)
            },

            InternalEffect::LazyComplete { key, value } => {
                self.lazy_resolved.insert(key.clone(), value.clone());
                self.state_mut().lazy_in_flight.remove(&key);
                self.release_lazy(&key)?;
                self.set_value(value);
                Ok(StepFlow::Continue)
            },

            InternalEffect::LazyAbort { key } => {
                self.lazy_resolved.remove(&key);
                self.state_mut().lazy_in_flight.remove(&key);
                self.release_lazy(&key)?;
                self.set_value(Value::Unit);
                Ok(StepFlow::Continue)
            },

            other => Err(ExecutionError::invariant(format!(
                "unexpected internal effect {} in lazy-ask",
                other.name(),
            ))),
        }
    }

    fn release_lazy(&mut self, key: &str) -> Result<(), ExecutionError> {
        self.release_semaphore_and_wake(&lazy_semaphore_key(key))
            .map_err(|error| {
                ExecutionError::invariant(format!("lazy semaphore vanished during release: {error}"))
            })
    }
}
