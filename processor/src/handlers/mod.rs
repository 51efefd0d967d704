//! The default handlers.
//!
//! Each module implements one built-in sentinel as methods on the interpreter. Every handler
//! answers `Pass` for effects it does not recognize, so dispatch keeps walking down the stack.

pub(crate) mod cache;
pub(crate) mod graph;
pub(crate) mod io;
pub(crate) mod memo;
pub(crate) mod reader;
pub(crate) mod result;
pub(crate) mod state;
pub(crate) mod writer;

use doeff_core::{BuiltinHandler, Handler};
use smallvec::SmallVec;

/// The runtime handler stack. Stays inline for the common case of the defaults plus a handful
/// of user handlers.
pub(crate) type HandlerStack = SmallVec<[Handler; 16]>;

/// The canonical default handler list, innermost first: result-safe, state, writer, reader,
/// lazy-ask, scheduler, then the auxiliary io/memo/cache/graph handlers. The await handler is
/// appended (outermost) by the entry points.
pub fn default_handlers() -> Vec<Handler> {
    vec![
        Handler::Builtin(BuiltinHandler::ResultSafe),
        Handler::Builtin(BuiltinHandler::State),
        Handler::Builtin(BuiltinHandler::Writer),
        Handler::Builtin(BuiltinHandler::Reader),
        Handler::Builtin(BuiltinHandler::LazyAsk),
        Handler::Builtin(BuiltinHandler::Scheduler),
        Handler::Builtin(BuiltinHandler::Io),
        Handler::Builtin(BuiltinHandler::Memo),
        Handler::Builtin(BuiltinHandler::Cache),
        Handler::Builtin(BuiltinHandler::Graph),
    ]
}

/// Builds the runtime handler stack: defaults at the bottom (outermost), user handlers above
/// them (innermost). The stack keeps the innermost handler at the end.
pub(crate) fn build_handler_stack(user_handlers: Vec<Handler>) -> HandlerStack {
    let mut stack = HandlerStack::new();
    stack.push(Handler::Builtin(BuiltinHandler::Await));
    let mut defaults = default_handlers();
    defaults.reverse();
    stack.extend(defaults);
    stack.extend(user_handlers.into_iter().rev());
    stack
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_list_is_innermost_first() {
        let handlers = default_handlers();
        let names: Vec<&str> = handlers.iter().map(|h| h.name()).collect();
        assert_eq!(
            names[..6],
            ["result_safe", "state", "writer", "reader", "lazy_ask", "scheduler"],
        );
    }

    #[test]
    fn user_handlers_sit_above_the_defaults() {
        let stack = build_handler_stack(vec![
            Handler::user("first", |_, _| Ok(doeff_core::HandlerOutcome::Pass)),
            Handler::user("second", |_, _| Ok(doeff_core::HandlerOutcome::Pass)),
        ]);
        // Innermost handler is last; the first user handler in the list dispatches first.
        assert_eq!(stack.last().unwrap().name(), "first");
        assert_eq!(stack[stack.len() - 2].name(), "second");
        assert_eq!(stack.first().unwrap().name(), "await");
    }
}
