//! # Error Architecture
//!
//! Two disjoint tiers, split by who can observe the error:
//!
//! - [`Failure`] is the user-level tier: an [`Exception`] raised by program code or by an effect
//!   handler, together with the effect being handled (if any), a snapshot of the program call
//!   stack, and an optional effect stack trace. Failures propagate through the continuation
//!   stack, can be intercepted by `Catch`/`Safe`/`Recover`, and surface as `RunResult::Err`.
//!
//! - [`ExecutionError`] is the interpreter tier: invariant violations, unhandled effects,
//!   continuation-stack overflow, reentrancy. These abort the run and are not observable from
//!   inside a program; `Safe` never converts them.

use std::{backtrace::Backtrace, fmt, sync::Arc};

use doeff_core::{CallFrame, ContinuationId, Effect, Exception, TaskId};

use crate::trace::EffectStackTrace;

// FAILURE
// ================================================================================================

/// A user-level failure: what went wrong, which effect was being handled, and where the program
/// was at the time.
#[derive(Clone, Debug)]
pub struct Failure {
    pub exception: Exception,
    /// The effect whose handling raised the failure, if any.
    pub effect: Option<Effect>,
    /// The program call stack at the point of failure, innermost last.
    pub call_stack: Vec<Arc<CallFrame>>,
    pub effect_trace: Option<Arc<EffectStackTrace>>,
    /// Host backtrace captured when debug traceback is enabled.
    pub backtrace: Option<Arc<Backtrace>>,
}

impl Failure {
    pub fn new(exception: Exception) -> Self {
        Self {
            exception,
            effect: None,
            call_stack: Vec::new(),
            effect_trace: None,
            backtrace: None,
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effect = Some(effect);
        self
    }

    pub fn with_call_stack(mut self, call_stack: Vec<Arc<CallFrame>>) -> Self {
        self.call_stack = call_stack;
        self
    }

    pub fn with_effect_trace(mut self, trace: EffectStackTrace) -> Self {
        self.effect_trace = Some(Arc::new(trace));
        self
    }

    pub fn with_backtrace(mut self) -> Self {
        self.backtrace = Some(Arc::new(Backtrace::capture()));
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.exception.is_cancelled()
    }

    /// Human-readable report: the exception, the failed effect, and the program call stack
    /// innermost last. Includes the host backtrace when one was captured.
    pub fn display(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{}\n", self.exception));
        if let Some(effect) = &self.effect {
            out.push_str(&format!("  while handling effect {effect}\n"));
        }
        if let Some(cause) = &self.exception.cause {
            out.push_str(&format!("  caused by: {cause}\n"));
        }
        for suppressed in &self.exception.suppressed {
            out.push_str(&format!("  suppressed: {suppressed}\n"));
        }
        if !self.call_stack.is_empty() {
            out.push_str("Program call stack (most recent call last):\n");
            for frame in &self.call_stack {
                match frame.created_at {
                    Some(location) => {
                        out.push_str(&format!("  -> {frame}  [{location}]\n"));
                    },
                    None => out.push_str(&format!("  -> {frame}\n")),
                }
            }
        }
        if let Some(trace) = &self.effect_trace {
            out.push_str(&trace.render());
        }
        if let Some(backtrace) = &self.backtrace {
            out.push_str(&format!("Host backtrace:\n{backtrace}\n"));
        }
        out
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.exception)
    }
}

impl From<Exception> for Failure {
    fn from(exception: Exception) -> Self {
        Self::new(exception)
    }
}

// STATE SNAPSHOT
// ================================================================================================

/// Immutable snapshot of the machine taken when a fatal error aborts the run.
#[derive(Clone, Debug)]
pub struct StateSnapshot {
    pub task: TaskId,
    pub stack_depth: usize,
    /// Frame kinds, innermost first.
    pub frame_kinds: Vec<&'static str>,
    pub handler_names: Vec<String>,
    pub total_steps: u64,
}

impl fmt::Display for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} at step {}, {} frames: [{}]",
            self.task,
            self.total_steps,
            self.stack_depth,
            self.frame_kinds.join(", "),
        )
    }
}

// EXECUTION ERROR
// ================================================================================================

/// Fatal interpreter errors. None of these are observable from inside a program.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("no handler recognized effect {effect} (walked {handlers_tried} handlers)")]
    UnhandledEffect {
        effect: &'static str,
        handlers_tried: usize,
    },
    #[error(
        "continuation stack exceeded the configured limit of {max_depth} frames ({snapshot})"
    )]
    ContinuationStackOverflow {
        max_depth: usize,
        snapshot: StateSnapshot,
    },
    #[error("continuation {id} was already consumed; captured continuations are one-shot")]
    ContinuationConsumed { id: ContinuationId },
    #[error("continuation {id} does not exist in this interpreter")]
    UnknownContinuation { id: ContinuationId },
    #[error("invalid frame state transition: {0}")]
    InvalidFrameState(String),
    #[error("interpreter invariant violated: {0}")]
    InvariantViolation(String),
    #[error("reentrant run() detected; construct the interpreter with allow_reentrancy to permit this")]
    Reentrancy,
    #[error("run() cannot be called from inside an async runtime; use async_run() instead")]
    NestedRuntime,
    #[error("scheduler deadlock: {0}")]
    Deadlock(String),
    #[error("invalid execution options: {0}")]
    InvalidOptions(String),
    #[error("handler {handler} returned Resume with a foreign continuation")]
    ForeignResume { handler: String },
}

impl ExecutionError {
    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::InvariantViolation(detail.into())
    }
}

