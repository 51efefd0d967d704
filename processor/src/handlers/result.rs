//! The result-safe handler: failure capture, recovery, retries, and finalization.

use std::collections::VecDeque;

use doeff_core::{effects, DoExpr, Effect, Exception, RetryDelay, Value};

use crate::{
    continuation::FrameKind,
    errors::ExecutionError,
    interpreter::{dispatch::EffectAction, Interpreter},
};

impl Interpreter {
    pub(crate) fn handle_result_effect(
        &mut self,
        effect: &Effect,
    ) -> Result<EffectAction, ExecutionError> {
        match effect {
            Effect::Fail { error } => Ok(EffectAction::Error(error.clone())),

            Effect::Catch { body, handler } => {
                let saved_env = self.state().env.clone();
                self.push_frame(FrameKind::Catch { handler: handler.clone(), saved_env })?;
                Ok(EffectAction::Program((**body).clone()))
            },

            Effect::Finally { body, finalizer } => {
                let saved_env = self.state().env.clone();
                self.push_frame(FrameKind::Finally {
                    finalizer: (**finalizer).clone(),
                    saved_env,
                })?;
                Ok(EffectAction::Program((**body).clone()))
            },

            Effect::Safe { body } => {
                let saved_env = self.state().env.clone();
                self.push_frame(FrameKind::Safe { saved_env })?;
                Ok(EffectAction::Program((**body).clone()))
            },

            Effect::Recover { body, fallback } => {
                let fallback = (**fallback).clone();
                Ok(EffectAction::Program(effects::catch(
                    (**body).clone(),
                    move |_error| Ok(fallback.clone()),
                )))
            },

            Effect::Retry { body, max_attempts, delay } => {
                if *max_attempts == 0 {
                    return Ok(EffectAction::Error(Exception::value_error(
                        "Retry requires max_attempts >= 1",
                    )));
                }
                Ok(EffectAction::Program(build_retry(
                    (**body).clone(),
                    0,
                    *max_attempts,
                    delay.clone(),
                )))
            },

            Effect::Unwrap { result } => {
                Ok(EffectAction::Program((**result).clone().flat_map(|value| match value {
                    Value::Ok(inner) => Ok(DoExpr::Pure((*inner).clone())),
                    Value::Err(error) => Ok(effects::fail((*error).clone())),
                    other => Err(Exception::type_error(format!(
                        "Unwrap expects an Ok or Err value, got {}",
                        other.type_name(),
                    ))),
                })))
            },

            Effect::FirstSuccess { programs } => {
                let mut remaining: VecDeque<DoExpr> = programs.clone().into();
                let Some(first) = remaining.pop_front() else {
                    return Ok(EffectAction::Error(Exception::value_error(
                        "FirstSuccess requires at least one program",
                    )));
                };
                let saved_user = self.state().store.user_snapshot();
                let saved_env = self.state().env.clone();
                self.push_frame(FrameKind::FirstSuccess { remaining, saved_user, saved_env })?;
                Ok(EffectAction::Program(first))
            },

            _ => Ok(EffectAction::Pass),
        }
    }
}

/// Builds the retry program for one attempt. The next attempt (and its backoff) is only
/// constructed if this one fails.
fn build_retry(body: DoExpr, attempt: u32, max_attempts: u32, delay: RetryDelay) -> DoExpr {
    let retry_body = body.clone();
    effects::catch(body, move |error| {
        let next = attempt + 1;
        if next >= max_attempts {
            return Ok(effects::fail(error));
        }
        let rest = build_retry(retry_body.clone(), next, max_attempts, delay.clone());
        Ok(match &delay {
            RetryDelay::None => rest,
            RetryDelay::Fixed(duration) if duration.is_zero() => rest,
            RetryDelay::Fixed(duration) => crate::sleep(*duration).then(rest),
            RetryDelay::Strategy(strategy) => {
                let duration = strategy.delay_for(next)?;
                if duration.is_zero() {
                    rest
                } else {
                    crate::sleep(duration).then(rest)
                }
            },
        })
    })
}
