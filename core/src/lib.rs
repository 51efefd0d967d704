//! Program data model for the doeff effects VM.
//!
//! This crate defines what programs *are*: the [`DoExpr`] expression language, the [`Effect`]
//! records interpreted by handler stacks, the [`Value`] universe flowing between them, and the
//! [`Kleisli`] bridge that turns named host functions into call expressions. Execution lives in
//! the companion processor crate.

pub mod effect;
pub mod effects;
pub mod expr;
pub mod handler;
pub mod kleisli;
pub mod meta;
pub mod value;

// RE-EXPORTS
// ================================================================================================

pub use effect::{CachePolicy, Effect, EffectTransform, InterceptOutcome, RetryDelay, SpawnBackend};
#[doc(hidden)]
pub use effect::{CacheOp, InternalEffect};
pub use expr::{Arg, DoExpr};
pub use handler::{BuiltinHandler, Continuation, Handler, HandlerOutcome, UserHandler};
pub use kleisli::Kleisli;
pub use meta::{CallFrame, CallMeta, SourceLocation};
pub use value::{
    AwaitableFn, BindFn, BoxedValueFuture, CatchFn, ContinuationId, DelayFn, Exception,
    ExceptionKind, HostFn, IoFn, MapFn, OpaqueValue, PromiseId, TaskId, Value,
};
