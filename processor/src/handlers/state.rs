//! The state handler: keyed store access plus semaphore-guarded atomic slots.
//!
//! Atomic state is shared between every cooperative task of a run (unlike user store keys,
//! which are snapshot per task). Updates go through a per-key semaphore so read-modify-write
//! sequences stay race-free and contention is visible to the scheduler.

use doeff_core::{effects, DoExpr, Effect, InternalEffect, MapFn, Value};

use crate::{
    errors::ExecutionError,
    interpreter::{dispatch::EffectAction, Interpreter, StepFlow},
};

fn atomic_semaphore_key(key: &str) -> String {
    format!("__atomic__:{key}")
}

impl Interpreter {
    pub(crate) fn handle_state_effect(
        &mut self,
        effect: &Effect,
    ) -> Result<EffectAction, ExecutionError> {
        match effect {
            Effect::Get { key } => match self.state().store.get(key) {
                Some(value) => Ok(EffectAction::Value(value.clone())),
                None => Ok(EffectAction::Error(doeff_core::Exception::key_error(key))),
            },

            Effect::Put { key, value } => {
                match self.state_mut().store.put(key, value.clone()) {
                    Ok(()) => Ok(EffectAction::Value(Value::Unit)),
                    Err(exception) => Ok(EffectAction::Error(exception)),
                }
            },

            Effect::Modify { key, func } => {
                let current = match self.state().store.get(key) {
                    Some(value) => value.clone(),
                    None => {
                        return Ok(EffectAction::Error(doeff_core::Exception::key_error(key)));
                    },
                };
                match func.apply(current) {
                    Ok(updated) => match self.state_mut().store.put(key, updated.clone()) {
                        Ok(()) => Ok(EffectAction::Value(updated)),
                        Err(exception) => Ok(EffectAction::Error(exception)),
                    },
                    Err(exception) => Ok(EffectAction::Error(exception)),
                }
            },

            Effect::AtomicGet { key, default } => {
                Ok(EffectAction::Program(atomic_protocol(key, None, default.clone())))
            },

            Effect::AtomicUpdate { key, func, default } => Ok(EffectAction::Program(
                atomic_protocol(key, Some(func.clone()), default.clone()),
            )),

            _ => Ok(EffectAction::Pass),
        }
    }

    /// Applies an atomic read or update while the per-key semaphore is held, then releases it.
    pub(crate) fn handle_atomic_apply(
        &mut self,
        key: String,
        func: Option<MapFn>,
        default: Value,
    ) -> Result<StepFlow, ExecutionError> {
        let current = self
            .atomic_state
            .get(&key)
            .cloned()
            .unwrap_or_else(|| default.clone());
        let outcome = match func {
            None => {
                self.atomic_state.entry(key.clone()).or_insert(current.clone());
                Ok(current)
            },
            Some(func) => func.apply(current).map(|updated| {
                self.atomic_state.insert(key.clone(), updated.clone());
                updated
            }),
        };
        let semaphore_key = atomic_semaphore_key(&key);
        if let Err(release_error) = self.release_semaphore_and_wake(&semaphore_key) {
            return Err(ExecutionError::invariant(format!(
                "atomic semaphore vanished during release: {release_error}"
            )));
        }
        match outcome {
            Ok(value) => self.set_value(value),
            Err(exception) => self.set_error(exception),
        }
        Ok(StepFlow::Continue)
    }
}

/// Acquire the per-key semaphore, then apply the operation and release.
fn atomic_protocol(key: &str, func: Option<MapFn>, default: Value) -> DoExpr {
    let semaphore_key = atomic_semaphore_key(key);
    effects::create_semaphore(&semaphore_key, 1)
        .then(effects::acquire_semaphore(&semaphore_key))
        .then(DoExpr::Perform(Effect::Internal(InternalEffect::AtomicApply {
            key: key.to_string(),
            func,
            default,
        })))
}
