//! The memo handler: the run-wide memoization table.
//!
//! The table is owned by the interpreter and shared by reference between cooperative tasks;
//! pooled workers receive a copy and their entries are unioned back when they complete.

use doeff_core::{Effect, Exception, Value};

use crate::{
    errors::ExecutionError,
    interpreter::{dispatch::EffectAction, Interpreter},
};

impl Interpreter {
    pub(crate) fn handle_memo_effect(
        &mut self,
        effect: &Effect,
    ) -> Result<EffectAction, ExecutionError> {
        match effect {
            Effect::MemoGet { key } => {
                let value = match self.memo.get(key) {
                    Some(value) => Value::ok(value.clone()),
                    None => Value::err(Exception::key_error(key)),
                };
                Ok(EffectAction::Value(value))
            },

            Effect::MemoPut { key, value } => {
                self.memo.insert(key.clone(), value.clone());
                Ok(EffectAction::Value(Value::Unit))
            },

            _ => Ok(EffectAction::Pass),
        }
    }
}
