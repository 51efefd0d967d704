//! The graph handler: a lightweight record of computation steps and annotations.

use std::collections::BTreeMap;

use doeff_core::{Effect, Value};

use crate::{
    errors::ExecutionError,
    interpreter::{dispatch::EffectAction, Interpreter},
};

// GRAPH STATE
// ================================================================================================

#[derive(Clone, Debug)]
pub(crate) struct GraphStepRecord {
    pub label: String,
    pub inputs: Vec<Value>,
    pub output: Value,
}

/// The computation graph recorded so far: one node per `GraphStep`, plus free-form annotations.
#[derive(Clone, Debug, Default)]
pub(crate) struct GraphState {
    steps: Vec<GraphStepRecord>,
    annotations: BTreeMap<String, Value>,
}

impl GraphState {
    pub fn record_step(&mut self, label: String, inputs: Vec<Value>, output: Value) {
        self.steps.push(GraphStepRecord { label, inputs, output });
    }

    pub fn annotate(&mut self, entries: &BTreeMap<String, Value>) {
        for (key, value) in entries {
            self.annotations.insert(key.clone(), value.clone());
        }
    }

    /// An immutable snapshot of the graph as a plain value.
    pub fn snapshot_value(&self) -> Value {
        let steps: Vec<Value> = self
            .steps
            .iter()
            .map(|step| {
                Value::map([
                    ("label".to_string(), Value::str(&step.label)),
                    ("inputs".to_string(), Value::list(step.inputs.iter().cloned())),
                    ("output".to_string(), step.output.clone()),
                ])
            })
            .collect();
        Value::map([
            ("steps".to_string(), Value::list(steps)),
            (
                "annotations".to_string(),
                Value::map(self.annotations.iter().map(|(k, v)| (k.clone(), v.clone()))),
            ),
        ])
    }
}

// HANDLER
// ================================================================================================

impl Interpreter {
    pub(crate) fn handle_graph_effect(
        &mut self,
        effect: &Effect,
    ) -> Result<EffectAction, ExecutionError> {
        match effect {
            Effect::GraphStep { label, inputs, output } => {
                self.graph.record_step(label.clone(), inputs.clone(), output.clone());
                Ok(EffectAction::Value(output.clone()))
            },

            Effect::GraphAnnotate { entries } => {
                self.graph.annotate(entries);
                Ok(EffectAction::Value(Value::Unit))
            },

            Effect::GraphSnapshot => Ok(EffectAction::Value(self.graph.snapshot_value())),

            _ => Ok(EffectAction::Pass),
        }
    }
}
