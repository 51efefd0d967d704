//! The writer handler: the append-only log and `Listen` windows.

use doeff_core::{Effect, Value};

use crate::{
    continuation::FrameKind,
    errors::ExecutionError,
    interpreter::{dispatch::EffectAction, Interpreter},
};

impl Interpreter {
    pub(crate) fn handle_writer_effect(
        &mut self,
        effect: &Effect,
    ) -> Result<EffectAction, ExecutionError> {
        match effect {
            Effect::Tell { value } => {
                self.state_mut().store.log_mut().append(value.clone());
                Ok(EffectAction::Value(Value::Unit))
            },

            Effect::Listen { body } => {
                let log_start = self.state().store.log().len();
                self.push_frame(FrameKind::Listen { log_start })?;
                Ok(EffectAction::Program((**body).clone()))
            },

            _ => Ok(EffectAction::Pass),
        }
    }
}
