use std::{any::Any, collections::BTreeMap, fmt, sync::Arc};

use crate::{expr::DoExpr, meta::CallFrame};

// IDENTIFIERS
// ================================================================================================

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(
    /// Identifies a captured one-shot continuation in the interpreter's continuation table.
    ContinuationId
);
id_newtype!(
    /// Identifies a task owned by the cooperative scheduler.
    TaskId
);
id_newtype!(
    /// Identifies a promise owned by the cooperative scheduler.
    PromiseId
);

// EXCEPTION
// ================================================================================================

/// Classification of user-level errors flowing through programs.
///
/// These are the kinds the default handlers produce themselves; everything raised by user code
/// travels as [`ExceptionKind::Other`] with the name chosen by the raiser.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExceptionKind {
    Value,
    Type,
    Key,
    Index,
    Cancelled,
    Timeout,
    Cycle,
    Unsupported,
    Other(Arc<str>),
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value => write!(f, "ValueError"),
            Self::Type => write!(f, "TypeError"),
            Self::Key => write!(f, "KeyError"),
            Self::Index => write!(f, "IndexError"),
            Self::Cancelled => write!(f, "TaskCancelledError"),
            Self::Timeout => write!(f, "TimeoutError"),
            Self::Cycle => write!(f, "CycleError"),
            Self::Unsupported => write!(f, "UnsupportedError"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

/// A user-level error value.
///
/// Exceptions are ordinary values: they travel through `Fail`, are converted into [`Value::Err`]
/// by `Safe`, and re-raised by `Unwrap`. A finalizer that fails while another error is in flight
/// never replaces it; the secondary error is recorded in `suppressed` instead.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Exception {
    pub kind: ExceptionKind,
    pub message: Arc<str>,
    pub payload: Option<Box<Value>>,
    pub cause: Option<Arc<Exception>>,
    pub suppressed: Vec<Arc<Exception>>,
}

impl Exception {
    pub fn new(kind: ExceptionKind, message: impl AsRef<str>) -> Self {
        Self {
            kind,
            message: Arc::from(message.as_ref()),
            payload: None,
            cause: None,
            suppressed: Vec::new(),
        }
    }

    /// An error with a caller-chosen type name, the usual carrier for user code failures.
    pub fn other(name: impl AsRef<str>, message: impl AsRef<str>) -> Self {
        Self::new(ExceptionKind::Other(Arc::from(name.as_ref())), message)
    }

    pub fn value_error(message: impl AsRef<str>) -> Self {
        Self::new(ExceptionKind::Value, message)
    }

    pub fn type_error(message: impl AsRef<str>) -> Self {
        Self::new(ExceptionKind::Type, message)
    }

    pub fn key_error(key: &str) -> Self {
        Self::new(ExceptionKind::Key, format!("key not found: {key:?}"))
    }

    pub fn index_error(message: impl AsRef<str>) -> Self {
        Self::new(ExceptionKind::Index, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ExceptionKind::Cancelled, "task was cancelled")
    }

    pub fn timeout(message: impl AsRef<str>) -> Self {
        Self::new(ExceptionKind::Timeout, message)
    }

    pub fn cycle(key: &str) -> Self {
        Self::new(
            ExceptionKind::Cycle,
            format!("lazy environment value {key:?} depends on itself"),
        )
    }

    pub fn unsupported(message: impl AsRef<str>) -> Self {
        Self::new(ExceptionKind::Unsupported, message)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(Box::new(payload));
        self
    }

    pub fn with_cause(mut self, cause: Exception) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Records a secondary error raised while this one was already propagating.
    pub fn with_suppressed(mut self, suppressed: Exception) -> Self {
        self.suppressed.push(Arc::new(suppressed));
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ExceptionKind::Cancelled
    }
}

impl PartialEq for Exception {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}

// FUNCTION NEWTYPES
// ================================================================================================

/// The future produced for one `Await`; boxed so effects stay object-safe.
pub type BoxedValueFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, Exception>> + Send>>;

macro_rules! fn_newtype {
    ($(#[$doc:meta])* $name:ident, $label:literal, ($($arg:ty),*) -> $ret:ty) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name(Arc<dyn Fn($($arg),*) -> $ret + Send + Sync>);

        impl $name {
            pub fn new(f: impl Fn($($arg),*) -> $ret + Send + Sync + 'static) -> Self {
                Self(Arc::new(f))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, $label)
            }
        }
    };
}

fn_newtype!(
    /// Pure projection applied by `Map` frames.
    MapFn, "<map fn>", (Value) -> Result<Value, Exception>
);
fn_newtype!(
    /// Monadic binder applied by `FlatMap` frames; returns the next program.
    BindFn, "<bind fn>", (Value) -> Result<DoExpr, Exception>
);
fn_newtype!(
    /// Plain host function invoked by `Apply` once all arguments are resolved.
    HostFn, "<host fn>", (Vec<Value>, BTreeMap<String, Value>) -> Result<Value, Exception>
);
fn_newtype!(
    /// Error handler installed by `Catch`; receives the in-flight exception.
    CatchFn, "<catch fn>", (Exception) -> Result<DoExpr, Exception>
);
fn_newtype!(
    /// Computes the backoff before a retry attempt (0-based attempt index).
    DelayFn, "<delay fn>", (u32) -> Result<std::time::Duration, Exception>
);
fn_newtype!(
    /// Host side effect executed by the `Io` effect.
    IoFn, "<io fn>", () -> Result<Value, Exception>
);
fn_newtype!(
    /// Factory for the host future behind `Await`; a factory keeps effects cloneable.
    AwaitableFn, "<awaitable>", () -> BoxedValueFuture
);

impl MapFn {
    pub fn apply(&self, value: Value) -> Result<Value, Exception> {
        (self.0)(value)
    }
}

impl BindFn {
    pub fn apply(&self, value: Value) -> Result<DoExpr, Exception> {
        (self.0)(value)
    }
}

impl HostFn {
    pub fn call(
        &self,
        positional: Vec<Value>,
        keyword: BTreeMap<String, Value>,
    ) -> Result<Value, Exception> {
        (self.0)(positional, keyword)
    }
}

impl CatchFn {
    pub fn apply(&self, error: Exception) -> Result<DoExpr, Exception> {
        (self.0)(error)
    }
}

impl DelayFn {
    pub fn delay_for(&self, attempt: u32) -> Result<std::time::Duration, Exception> {
        (self.0)(attempt)
    }
}

impl IoFn {
    pub fn run(&self) -> Result<Value, Exception> {
        (self.0)()
    }
}

impl AwaitableFn {
    pub fn start(&self) -> BoxedValueFuture {
        (self.0)()
    }
}

// OPAQUE HOST VALUES
// ================================================================================================

/// A host object carried through programs without the kernel inspecting it.
#[derive(Clone)]
pub struct OpaqueValue {
    name: Arc<str>,
    inner: Arc<dyn Any + Send + Sync>,
}

impl OpaqueValue {
    pub fn new(name: impl AsRef<str>, inner: impl Any + Send + Sync) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            inner: Arc::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for OpaqueValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.name)
    }
}

// VALUE
// ================================================================================================

/// A host value flowing through programs.
///
/// Values are cheaply cloneable; compound variants share their payload behind an `Arc`. The
/// interpreter state is the only mutable object in the system, so values never need interior
/// mutability.
#[derive(Clone, Debug, derive_more::From)]
pub enum Value {
    Unit,
    #[from]
    Bool(bool),
    #[from]
    Int(i64),
    #[from]
    Float(f64),
    Str(Arc<str>),
    List(Arc<Vec<Value>>),
    Map(Arc<BTreeMap<String, Value>>),
    /// Success arm produced by `Safe`, consumed by `Unwrap`.
    Ok(Arc<Value>),
    /// Failure arm produced by `Safe`, consumed by `Unwrap`.
    Err(Arc<Exception>),
    /// A deferred program; reader environments use this for lazy values.
    Program(Arc<DoExpr>),
    /// A reified one-shot continuation.
    Continuation(ContinuationId),
    /// A handle for a spawned task.
    Task(TaskId),
    /// A handle for a promise.
    Promise(PromiseId),
    /// A snapshot of one program call frame (reflection).
    Frame(Arc<CallFrame>),
    Opaque(OpaqueValue),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Self::Str(Arc::from(s.as_ref()))
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Self::List(Arc::new(items.into_iter().collect()))
    }

    pub fn map(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self::Map(Arc::new(entries.into_iter().collect()))
    }

    pub fn ok(value: Value) -> Self {
        Self::Ok(Arc::new(value))
    }

    pub fn err(error: Exception) -> Self {
        Self::Err(Arc::new(error))
    }

    pub fn program(expr: DoExpr) -> Self {
        Self::Program(Arc::new(expr))
    }

    pub fn opaque(name: impl AsRef<str>, inner: impl Any + Send + Sync) -> Self {
        Self::Opaque(OpaqueValue::new(name, inner))
    }

    /// A short name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Ok(_) => "ok",
            Self::Err(_) => "err",
            Self::Program(_) => "program",
            Self::Continuation(_) => "continuation",
            Self::Task(_) => "task",
            Self::Promise(_) => "promise",
            Self::Frame(_) => "frame",
            Self::Opaque(_) => "opaque",
        }
    }

    pub fn as_bool(&self) -> Result<bool, Exception> {
        match self {
            Self::Bool(b) => Ok(*b),
            other => Err(type_mismatch("bool", other)),
        }
    }

    pub fn as_int(&self) -> Result<i64, Exception> {
        match self {
            Self::Int(n) => Ok(*n),
            other => Err(type_mismatch("int", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str, Exception> {
        match self {
            Self::Str(s) => Ok(s),
            other => Err(type_mismatch("str", other)),
        }
    }

    pub fn as_list(&self) -> Result<&[Value], Exception> {
        match self {
            Self::List(items) => Ok(items),
            other => Err(type_mismatch("list", other)),
        }
    }

    pub fn as_task(&self) -> Result<TaskId, Exception> {
        match self {
            Self::Task(id) => Ok(*id),
            other => Err(type_mismatch("task", other)),
        }
    }

    pub fn as_promise(&self) -> Result<PromiseId, Exception> {
        match self {
            Self::Promise(id) => Ok(*id),
            other => Err(type_mismatch("promise", other)),
        }
    }

    pub fn as_continuation(&self) -> Result<ContinuationId, Exception> {
        match self {
            Self::Continuation(id) => Ok(*id),
            other => Err(type_mismatch("continuation", other)),
        }
    }

    pub fn as_program(&self) -> Result<&DoExpr, Exception> {
        match self {
            Self::Program(p) => Ok(p),
            other => Err(type_mismatch("program", other)),
        }
    }
}

fn type_mismatch(expected: &str, got: &Value) -> Exception {
    Exception::type_error(format!("expected {expected}, got {}", got.type_name()))
}

impl Default for Value {
    fn default() -> Self {
        Self::Unit
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Int(n.into())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(Arc::from(s.as_str()))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(Arc::new(items))
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Self::Unit
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Unit, Self::Unit) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Ok(a), Self::Ok(b)) => a == b,
            (Self::Err(a), Self::Err(b)) => a == b,
            (Self::Program(a), Self::Program(b)) => Arc::ptr_eq(a, b),
            (Self::Continuation(a), Self::Continuation(b)) => a == b,
            (Self::Task(a), Self::Task(b)) => a == b,
            (Self::Promise(a), Self::Promise(b)) => a == b,
            (Self::Frame(a), Self::Frame(b)) => Arc::ptr_eq(a, b),
            (Self::Opaque(a), Self::Opaque(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => write!(f, "()"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            },
            Self::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key:?}: {value}")?;
                }
                write!(f, "}}")
            },
            Self::Ok(v) => write!(f, "Ok({v})"),
            Self::Err(e) => write!(f, "Err({e})"),
            Self::Program(_) => write!(f, "<program>"),
            Self::Continuation(id) => write!(f, "<continuation {id}>"),
            Self::Task(id) => write!(f, "<task {id}>"),
            Self::Promise(id) => write!(f, "<promise {id}>"),
            Self::Frame(frame) => write!(f, "<frame {}>", frame.function_name),
            Self::Opaque(o) => write!(f, "{o:?}"),
        }
    }
}

// TESTS
// ================================================================================================
