use std::{fmt::Write as _, sync::Arc};

use doeff_core::{CallFrame, SourceLocation, TaskId};

// EFFECT STACK TRACE
// ================================================================================================

/// The kind of one effect-stack-trace frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EffectFrameKind {
    /// A named program function call.
    KleisliCall,
    /// An anonymous bind in a program chain.
    ProgramFlatMap,
    /// The effect that was being handled when the failure occurred.
    EffectYield,
    /// A handler installed by `WithHandler`.
    HandlerBoundary,
    /// The boundary between a parent and a spawned child task.
    SpawnBoundary,
}

/// One frame of the effect stack trace.
#[derive(Clone, Debug)]
pub struct EffectStackFrame {
    pub kind: EffectFrameKind,
    pub name: Arc<str>,
    pub location: Option<SourceLocation>,
    pub call_frame: Option<Arc<CallFrame>>,
}

impl EffectStackFrame {
    pub fn new(kind: EffectFrameKind, name: impl AsRef<str>) -> Self {
        Self {
            kind,
            name: Arc::from(name.as_ref()),
            location: None,
            call_frame: None,
        }
    }

    pub fn at(mut self, location: Option<SourceLocation>) -> Self {
        self.location = location;
        self
    }

    pub fn with_call_frame(mut self, frame: Arc<CallFrame>) -> Self {
        self.location = frame.created_at;
        self.call_frame = Some(frame);
        self
    }
}

/// An ordered trace of the effectful frames active at a failure: program calls, effect yields,
/// handler boundaries and spawn boundaries, outermost first.
#[derive(Clone, Debug, Default)]
pub struct EffectStackTrace {
    pub frames: Vec<EffectStackFrame>,
}

impl EffectStackTrace {
    pub fn new(frames: Vec<EffectStackFrame>) -> Self {
        Self { frames }
    }

    /// Renders the trace for human consumption, most recent frame last.
    pub fn render(&self) -> String {
        let mut out = String::from("Effect stack (most recent frame last):\n");
        for frame in &self.frames {
            let line = match frame.kind {
                EffectFrameKind::KleisliCall => match &frame.call_frame {
                    Some(call) => format!("  -> {call}"),
                    None => format!("  -> {}()", frame.name),
                },
                EffectFrameKind::ProgramFlatMap => format!("  .flat_map -> {}", frame.name),
                EffectFrameKind::EffectYield => format!("  * yield {}", frame.name),
                EffectFrameKind::HandlerBoundary => format!("  [handler: {}]", frame.name),
                EffectFrameKind::SpawnBoundary => format!("  [spawn: {}]", frame.name),
            };
            out.push_str(&line);
            if let Some(location) = frame.location {
                let _ = write!(out, "  [{location}]");
            }
            out.push('\n');
        }
        out
    }
}

// EXECUTION TRACE
// ================================================================================================

/// One recorded step of a traced run.
#[derive(Clone, Debug)]
pub struct TraceStep {
    pub task: TaskId,
    pub kind: &'static str,
    pub detail: String,
}

/// Step-by-step record of a run, produced when tracing is enabled.
#[derive(Clone, Debug, Default)]
pub struct ExecutionTrace {
    steps: Vec<TraceStep>,
}

impl ExecutionTrace {
    pub fn record(&mut self, task: TaskId, kind: &'static str, detail: impl Into<String>) {
        self.steps.push(TraceStep { task, kind, detail: detail.into() });
    }

    pub fn steps(&self) -> &[TraceStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_names_each_frame_kind() {
        let trace = EffectStackTrace::new(vec![
            EffectStackFrame::new(EffectFrameKind::KleisliCall, "fetch_user"),
            EffectStackFrame::new(EffectFrameKind::HandlerBoundary, "metrics"),
            EffectStackFrame::new(EffectFrameKind::EffectYield, "Ask"),
        ]);
        let rendered = trace.render();
        assert!(rendered.contains("-> fetch_user()"));
        assert!(rendered.contains("[handler: metrics]"));
        assert!(rendered.contains("* yield Ask"));
    }
}
