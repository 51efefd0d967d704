//! The io handler: host actions and program output.

use doeff_core::{Effect, Exception, Value};

use crate::{
    errors::ExecutionError,
    interpreter::{dispatch::EffectAction, Interpreter},
};

impl Interpreter {
    pub(crate) fn handle_io_effect(
        &mut self,
        effect: &Effect,
    ) -> Result<EffectAction, ExecutionError> {
        match effect {
            Effect::Io { action } => {
                if !self.options().io_allowed() {
                    return Ok(EffectAction::Error(Exception::unsupported(
                        "io is disabled for this run",
                    )));
                }
                match action.run() {
                    Ok(value) => Ok(EffectAction::Value(value)),
                    Err(exception) => Ok(EffectAction::Error(exception)),
                }
            },

            Effect::Print { message } => {
                if !self.options().io_allowed() {
                    return Ok(EffectAction::Error(Exception::unsupported(
                        "io is disabled for this run",
                    )));
                }
                println!("{message}");
                Ok(EffectAction::Value(Value::Unit))
            },

            _ => Ok(EffectAction::Pass),
        }
    }
}
