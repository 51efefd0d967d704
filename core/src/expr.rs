use std::sync::Arc;

use crate::{
    effect::Effect,
    handler::Handler,
    meta::CallMeta,
    value::{AwaitableFn, BindFn, Exception, HostFn, MapFn, Value},
};

// ARGUMENTS
// ================================================================================================

/// An argument position of `Apply`: either an already-computed value or a subprogram whose
/// result is substituted before the call.
#[derive(Clone, Debug)]
pub enum Arg {
    Pure(Value),
    Perform(DoExpr),
}

impl Arg {
    pub fn is_pure(&self) -> bool {
        matches!(self, Self::Pure(_))
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Pure(value)
    }
}

impl From<DoExpr> for Arg {
    fn from(expr: DoExpr) -> Self {
        match expr {
            DoExpr::Pure(value) => Self::Pure(value),
            other => Self::Perform(other),
        }
    }
}

// PROGRAM EXPRESSIONS
// ================================================================================================

/// A program: a recursive, structurally immutable tagged value.
///
/// `DoExpr` is pure data; nothing here executes. The processor reduces one expression at a time
/// against the continuation stack and the handler stack.
#[derive(Clone, Debug)]
pub enum DoExpr {
    /// An already-computed value.
    Pure(Value),
    /// Call a plain host function once every argument is resolved.
    Apply {
        func: HostFn,
        positional: Vec<Arg>,
        keyword: Vec<(String, Arg)>,
        meta: Option<Arc<CallMeta>>,
    },
    /// Evaluate a subprogram and yield its value (identity wrapper, used for ordering).
    Eval(Box<DoExpr>),
    /// Pure projection of the source program's value.
    Map {
        source: Box<DoExpr>,
        mapper: MapFn,
        meta: Option<Arc<CallMeta>>,
    },
    /// Monadic bind.
    FlatMap {
        source: Box<DoExpr>,
        binder: BindFn,
        meta: Option<Arc<CallMeta>>,
    },
    /// Yield an effect to the handler stack.
    Perform(Effect),
    /// Push a handler for the duration of `body`.
    WithHandler {
        handler: Handler,
        body: Box<DoExpr>,
        meta: Option<Arc<CallMeta>>,
    },
    /// Return a value to a continuation. One-shot.
    Resume {
        continuation: Box<DoExpr>,
        value: Box<DoExpr>,
    },
    /// Pass the in-flight effect (or a replacement) to the next handler below.
    Delegate(Option<Effect>),
    /// Like `Resume`, but abandon the current frames and unwind in-between, running finalizers.
    Transfer {
        continuation: Box<DoExpr>,
        value: Box<DoExpr>,
    },
    /// Capture the current continuation as a value and evaluate `body(k)`.
    CreateContinuation { body: BindFn },
    /// Resume a previously captured continuation. One-shot.
    ResumeContinuation {
        continuation: Box<DoExpr>,
        value: Box<DoExpr>,
    },
    /// Reify the current continuation and yield it as the current value.
    GetContinuation,
    /// Yield the names of the installed handlers, innermost first.
    GetHandlers,
    /// Yield the current program call stack.
    GetCallStack,
    /// Yield the recorded execution trace.
    GetTrace,
    /// Cross into host-async land; only permitted under the async entry point.
    AsyncEscape { awaitable: AwaitableFn },
}

impl DoExpr {
    // CONSTRUCTORS
    // --------------------------------------------------------------------------------------------

    pub fn pure(value: impl Into<Value>) -> Self {
        Self::Pure(value.into())
    }

    pub fn unit() -> Self {
        Self::Pure(Value::Unit)
    }

    pub fn perform(effect: Effect) -> Self {
        Self::Perform(effect)
    }

    pub fn fail(error: Exception) -> Self {
        Self::Perform(Effect::Fail { error })
    }

    /// A host call with resolved-value arguments.
    pub fn apply(func: HostFn, positional: Vec<Arg>) -> Self {
        Self::Apply {
            func,
            positional,
            keyword: Vec::new(),
            meta: None,
        }
    }

    // COMBINATORS
    // --------------------------------------------------------------------------------------------

    pub fn map(self, mapper: impl Fn(Value) -> Result<Value, Exception> + Send + Sync + 'static) -> Self {
        Self::Map {
            source: Box::new(self),
            mapper: MapFn::new(mapper),
            meta: None,
        }
    }

    pub fn flat_map(
        self,
        binder: impl Fn(Value) -> Result<DoExpr, Exception> + Send + Sync + 'static,
    ) -> Self {
        Self::FlatMap {
            source: Box::new(self),
            binder: BindFn::new(binder),
            meta: None,
        }
    }

    /// Sequencing: run `self`, discard its value, then run `next`.
    pub fn then(self, next: impl Into<DoExpr>) -> Self {
        let next = next.into();
        self.flat_map(move |_| Ok(next.clone()))
    }

    pub fn eval(self) -> Self {
        Self::Eval(Box::new(self))
    }

    pub fn with_meta(self, meta: CallMeta) -> Self {
        let meta = Some(Arc::new(meta));
        match self {
            Self::Apply {
                func,
                positional,
                keyword,
                ..
            } => Self::Apply {
                func,
                positional,
                keyword,
                meta,
            },
            Self::Map { source, mapper, .. } => Self::Map { source, mapper, meta },
            Self::FlatMap { source, binder, .. } => Self::FlatMap { source, binder, meta },
            Self::WithHandler { handler, body, .. } => Self::WithHandler { handler, body, meta },
            other => other,
        }
    }

    /// A short tag for trace output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pure(_) => "Pure",
            Self::Apply { .. } => "Apply",
            Self::Eval(_) => "Eval",
            Self::Map { .. } => "Map",
            Self::FlatMap { .. } => "FlatMap",
            Self::Perform(_) => "Perform",
            Self::WithHandler { .. } => "WithHandler",
            Self::Resume { .. } => "Resume",
            Self::Delegate(_) => "Delegate",
            Self::Transfer { .. } => "Transfer",
            Self::CreateContinuation { .. } => "CreateContinuation",
            Self::ResumeContinuation { .. } => "ResumeContinuation",
            Self::GetContinuation => "GetContinuation",
            Self::GetHandlers => "GetHandlers",
            Self::GetCallStack => "GetCallStack",
            Self::GetTrace => "GetTrace",
            Self::AsyncEscape { .. } => "AsyncEscape",
        }
    }
}

impl From<Value> for DoExpr {
    fn from(value: Value) -> Self {
        Self::Pure(value)
    }
}

impl From<Effect> for DoExpr {
    fn from(effect: Effect) -> Self {
        Self::Perform(effect)
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pure_args_collapse() {
        let arg: Arg = DoExpr::pure(5).into();
        assert!(arg.is_pure());
        let arg: Arg = DoExpr::Perform(Effect::Get { key: "k".into() }).into();
        assert!(!arg.is_pure());
    }

    #[test]
    fn then_discards_the_first_value() {
        let expr = DoExpr::pure(1).then(DoExpr::pure(2));
        match expr {
            DoExpr::FlatMap { source, binder, .. } => {
                assert!(matches!(*source, DoExpr::Pure(Value::Int(1))));
                let next = binder.apply(Value::Unit).unwrap();
                assert!(matches!(next, DoExpr::Pure(Value::Int(2))));
            },
            other => panic!("unexpected expression: {}", other.kind()),
        }
    }
}
