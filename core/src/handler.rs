use std::{fmt, sync::Arc};

use crate::{
    effect::Effect,
    expr::DoExpr,
    value::{ContinuationId, Exception, Value},
};

// CONTINUATION TOKEN
// ================================================================================================

/// A one-shot continuation token handed to handlers during dispatch.
///
/// The token is an index into the interpreter's continuation table plus nothing else; consuming
/// it (via `Resume`, `Transfer` or `ResumeContinuation`) invalidates the table entry, and a
/// second consumption is a fatal invariant error enforced by the interpreter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Continuation {
    id: ContinuationId,
}

impl Continuation {
    pub fn new(id: ContinuationId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> ContinuationId {
        self.id
    }
}

impl From<Continuation> for Value {
    fn from(k: Continuation) -> Self {
        Value::Continuation(k.id)
    }
}

// HANDLER OUTCOME
// ================================================================================================

/// What a handler decided to do with an effect.
#[derive(Clone, Debug)]
pub enum HandlerOutcome {
    /// Return `value` to the continuation; the token must be the one this dispatch delivered.
    Resume(Continuation, Value),
    /// Return `value` to a previously captured continuation, unwinding in-between frames and
    /// running their finalizers.
    Transfer(Continuation, Value),
    /// Pass the effect (or a replacement) to the next handler below.
    Delegate(Option<Effect>),
    /// This handler does not recognize the effect; let the next handler try.
    Pass,
    /// Execute this program in place of the effect; its value flows into the continuation.
    Run(DoExpr),
    /// Resolve the effect with a plain value (shorthand for resuming with it).
    Return(Value),
}

// USER HANDLERS
// ================================================================================================

type HandlerFn =
    dyn Fn(&Effect, Continuation) -> Result<HandlerOutcome, Exception> + Send + Sync;

/// A user-installed handler: a named function from `(effect, k)` to a [`HandlerOutcome`].
#[derive(Clone)]
pub struct UserHandler {
    name: Arc<str>,
    func: Arc<HandlerFn>,
}

impl UserHandler {
    pub fn new(
        name: impl AsRef<str>,
        func: impl Fn(&Effect, Continuation) -> Result<HandlerOutcome, Exception>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self, effect: &Effect, k: Continuation) -> Result<HandlerOutcome, Exception> {
        (self.func)(effect, k)
    }
}

impl fmt::Debug for UserHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<handler {}>", self.name)
    }
}

// BUILT-IN SENTINELS
// ================================================================================================

/// The built-in handlers, identified by name and interpreted natively by the processor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuiltinHandler {
    ResultSafe,
    State,
    Writer,
    Reader,
    LazyAsk,
    Scheduler,
    Io,
    Memo,
    Cache,
    Graph,
    Await,
}

impl BuiltinHandler {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ResultSafe => "result_safe",
            Self::State => "state",
            Self::Writer => "writer",
            Self::Reader => "reader",
            Self::LazyAsk => "lazy_ask",
            Self::Scheduler => "scheduler",
            Self::Io => "io",
            Self::Memo => "memo",
            Self::Cache => "cache",
            Self::Graph => "graph",
            Self::Await => "await",
        }
    }
}

// HANDLER
// ================================================================================================

/// One entry of the handler stack.
#[derive(Clone, Debug)]
pub enum Handler {
    Builtin(BuiltinHandler),
    User(UserHandler),
}

impl Handler {
    pub fn user(
        name: impl AsRef<str>,
        func: impl Fn(&Effect, Continuation) -> Result<HandlerOutcome, Exception>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self::User(UserHandler::new(name, func))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Builtin(b) => b.name(),
            Self::User(u) => u.name(),
        }
    }
}

impl From<BuiltinHandler> for Handler {
    fn from(builtin: BuiltinHandler) -> Self {
        Self::Builtin(builtin)
    }
}

impl From<UserHandler> for Handler {
    fn from(user: UserHandler) -> Self {
        Self::User(user)
    }
}
