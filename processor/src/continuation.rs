use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use doeff_core::{
    BindFn, CallFrame, CallMeta, CatchFn, ContinuationId, DoExpr, Effect, EffectTransform,
    Handler, MapFn, Value,
};

use crate::{
    errors::{ExecutionError, Failure},
    handlers::HandlerStack,
    store::Env,
};

// FRAME IDENTITY
// ================================================================================================

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a continuation frame, used to find the capture point of a continuation
/// during a `Transfer` unwind.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FrameId(u64);

impl FrameId {
    fn next() -> Self {
        Self(NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed))
    }
}

// FRAME LIFECYCLE
// ================================================================================================

/// Lifecycle of a continuation frame. Transitions only move away from `Active`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameState {
    Active,
    Completed,
    Failed,
    Cancelled,
}

// FRAME KINDS
// ================================================================================================

/// What to do with the current value (or error) when it reaches this frame.
#[derive(Clone, Debug)]
pub enum FrameKind {
    /// Monadic bind: feed the value to the binder, run the program it returns.
    Bind {
        binder: BindFn,
        saved_env: Env,
        meta: Option<Arc<CallMeta>>,
    },
    /// Pure projection of the value.
    Map { mapper: MapFn },
    /// Scope marker for an installed handler; pops the handler stack on every exit path.
    Handler { handler: Handler },
    /// Left-to-right evaluation of a program list; emits the collected values as a list.
    Gather {
        remaining: VecDeque<DoExpr>,
        collected: Vec<Value>,
        saved_env: Env,
    },
    /// Extracts the log slice appended while the body ran.
    Listen { log_start: usize },
    /// Restores the reader environment on exit.
    Local { restore_env: Env },
    /// Wraps the outcome in `Ok`/`Err`.
    Safe { saved_env: Env },
    /// Runs the finalizer on every exit path.
    Finally {
        finalizer: DoExpr,
        saved_env: Env,
    },
    /// Diverts errors into the catch handler.
    Catch {
        handler: CatchFn,
        saved_env: Env,
    },
    /// Pure metadata for traceback and reflection; pops the program call stack on exit.
    Call { frame: Arc<CallFrame> },
    /// Applies transforms to effects bubbling up from the body.
    Intercept { transforms: Vec<EffectTransform> },
    /// Sequential attempts; restores user state between failed attempts.
    FirstSuccess {
        remaining: VecDeque<DoExpr>,
        saved_user: BTreeMap<String, Value>,
        saved_env: Env,
    },
    /// Re-installs a pending outcome once an interposed finalizer completes.
    Rethrow { pending: PendingOutcome },
    /// Records the in-flight effect dispatch so `Delegate` can continue the handler walk.
    Dispatch { effect: Effect, below: usize },
}

impl FrameKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "Bind",
            Self::Map { .. } => "Map",
            Self::Handler { .. } => "Handler",
            Self::Gather { .. } => "Gather",
            Self::Listen { .. } => "Listen",
            Self::Local { .. } => "Local",
            Self::Safe { .. } => "Safe",
            Self::Finally { .. } => "Finally",
            Self::Catch { .. } => "Catch",
            Self::Call { .. } => "Call",
            Self::Intercept { .. } => "Intercept",
            Self::FirstSuccess { .. } => "FirstSuccess",
            Self::Rethrow { .. } => "Rethrow",
            Self::Dispatch { .. } => "Dispatch",
        }
    }
}

// PENDING OUTCOME
// ================================================================================================

/// The outcome parked while a `Finally` finalizer runs during an unwind.
#[derive(Clone, Debug)]
pub enum PendingOutcome {
    /// Normal return: re-deliver the value after the finalizer.
    Value(Value),
    /// Error propagation: keep propagating after the finalizer.
    Error(Failure),
    /// Transfer in progress: keep unwinding toward the captured state.
    Transfer(TransferUnwind),
}

/// A transfer that is still unwinding frames toward its capture point.
#[derive(Clone, Debug)]
pub struct TransferUnwind {
    pub target: CapturedState,
    pub value: Value,
}

// FRAME
// ================================================================================================

/// One entry of the continuation stack.
#[derive(Clone, Debug)]
pub struct Frame {
    id: FrameId,
    kind: FrameKind,
    state: FrameState,
}

impl Frame {
    pub fn new(kind: FrameKind) -> Self {
        Self {
            id: FrameId::next(),
            kind,
            state: FrameState::Active,
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }

    pub fn into_kind(self) -> FrameKind {
        self.kind
    }

    pub fn transition(&mut self, next: FrameState) -> Result<(), ExecutionError> {
        if self.state != FrameState::Active {
            return Err(ExecutionError::InvalidFrameState(format!(
                "cannot move {} frame from {:?} to {next:?}",
                self.kind.name(),
                self.state,
            )));
        }
        self.state = next;
        Ok(())
    }
}

// KONTINUATION
// ================================================================================================

/// The continuation stack. The top frame is the only current one.
#[derive(Clone, Debug, Default)]
pub struct Kontinuation {
    frames: Vec<Frame>,
}

impl Kontinuation {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push(&mut self, kind: FrameKind) -> FrameId {
        let frame = Frame::new(kind);
        let id = frame.id;
        self.frames.push(frame);
        id
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn top_id(&self) -> Option<FrameId> {
        self.frames.last().map(|frame| frame.id)
    }

    /// Frames from the top down.
    pub fn iter_topmost_first(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter().rev()
    }

    pub fn frame_kind_names(&self) -> Vec<&'static str> {
        self.frames.iter().rev().map(|frame| frame.kind.name()).collect()
    }
}

// CAPTURED STATE
// ================================================================================================

/// Everything a one-shot continuation restores when resumed: the continuation stack, the
/// handler stack, the reader environment, and the program call stack.
#[derive(Clone, Debug)]
pub struct CapturedState {
    pub k: Kontinuation,
    pub handlers: HandlerStack,
    pub env: Env,
    pub call_stack: Vec<Arc<CallFrame>>,
}

impl CapturedState {
    pub fn top_frame_id(&self) -> Option<FrameId> {
        self.k.top_id()
    }
}

// CONTINUATION TABLE
// ================================================================================================

#[derive(Debug)]
struct ContinuationEntry {
    state: CapturedState,
    consumed: bool,
}

/// The interpreter's arena of captured continuations.
///
/// A [`ContinuationId`] handed to a handler or reified into a value indexes this table.
/// Consumption happens before any side effect of the resume; a second consumption attempt is a
/// fatal error, never a silent no-op.
#[derive(Debug, Default)]
pub struct ContinuationTable {
    entries: BTreeMap<ContinuationId, ContinuationEntry>,
    next_id: u64,
}

impl ContinuationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture(&mut self, state: CapturedState) -> ContinuationId {
        self.next_id += 1;
        let id = ContinuationId::new(self.next_id);
        self.entries.insert(id, ContinuationEntry { state, consumed: false });
        id
    }

    pub fn consume(&mut self, id: ContinuationId) -> Result<CapturedState, ExecutionError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(ExecutionError::UnknownContinuation { id })?;
        if entry.consumed {
            return Err(ExecutionError::ContinuationConsumed { id });
        }
        entry.consumed = true;
        // The tombstone stays so a second use reports consumption, not an unknown id.
        Ok(entry.state.clone())
    }

    /// Drops an unconsumed token once the dispatch that issued it can no longer use it.
    pub fn dispose(&mut self, id: ContinuationId) {
        self.entries.remove(&id);
    }

    pub fn is_live(&self, id: ContinuationId) -> bool {
        self.entries.contains_key(&id)
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn captured() -> CapturedState {
        CapturedState {
            k: Kontinuation::new(),
            handlers: HandlerStack::new(),
            env: Env::default(),
            call_stack: Vec::new(),
        }
    }

    #[test]
    fn frames_get_distinct_ids() {
        let mut k = Kontinuation::new();
        let a = k.push(FrameKind::Map { mapper: MapFn::new(|v| Ok(v)) });
        let b = k.push(FrameKind::Map { mapper: MapFn::new(|v| Ok(v)) });
        assert_ne!(a, b);
        assert_eq!(k.depth(), 2);
    }

    #[test]
    fn frame_state_transitions_are_one_way() {
        let mut frame = Frame::new(FrameKind::Map { mapper: MapFn::new(|v| Ok(v)) });
        frame.transition(FrameState::Completed).unwrap();
        assert!(frame.transition(FrameState::Failed).is_err());
    }

    #[test]
    fn second_consumption_is_fatal() {
        let mut table = ContinuationTable::new();
        let id = table.capture(captured());
        assert!(table.consume(id).is_ok());
        assert!(matches!(
            table.consume(id),
            Err(ExecutionError::ContinuationConsumed { .. })
        ));
    }

    #[test]
    fn dispose_invalidates_a_token() {
        let mut table = ContinuationTable::new();
        let id = table.capture(captured());
        table.dispose(id);
        assert!(!table.is_live(id));
    }
}
