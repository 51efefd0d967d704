use std::{collections::BTreeMap, fmt};

use doeff_core::{Exception, PromiseId, Value};
use tokio::sync::mpsc::UnboundedSender;

use super::ExternalEvent;

// PROMISE TABLE
// ================================================================================================

#[derive(Clone, Debug)]
pub(crate) enum PromiseStatus {
    Pending,
    Done(Result<Value, Exception>),
}

#[derive(Debug)]
pub(crate) struct Promise {
    pub name: Option<String>,
    pub status: PromiseStatus,
    pub external: bool,
}

/// Promises owned by the scheduler. Wakeups are driven by the scheduler scanning blocked tasks,
/// so the table only stores completion results.
#[derive(Debug, Default)]
pub(crate) struct PromiseTable {
    entries: BTreeMap<PromiseId, Promise>,
    next_id: u64,
}

impl PromiseTable {
    pub fn create(&mut self, name: Option<String>, external: bool) -> PromiseId {
        self.next_id += 1;
        let id = PromiseId::new(self.next_id);
        self.entries.insert(id, Promise { name, status: PromiseStatus::Pending, external });
        id
    }

    pub fn status(&self, id: PromiseId) -> Option<&PromiseStatus> {
        self.entries.get(&id).map(|promise| &promise.status)
    }

    /// Completes a promise. Completing one that is already done or unknown is a user error.
    pub fn complete(
        &mut self,
        id: PromiseId,
        result: Result<Value, Exception>,
    ) -> Result<(), Exception> {
        let promise = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| Exception::key_error(&format!("promise {id}")))?;
        match promise.status {
            PromiseStatus::Pending => {
                promise.status = PromiseStatus::Done(result);
                Ok(())
            },
            PromiseStatus::Done(_) => Err(Exception::value_error(format!(
                "promise {id} was already completed"
            ))),
        }
    }
}

// EXTERNAL COMPLETER
// ================================================================================================

/// Thread-safe handle for completing a promise from outside the run.
///
/// Created by the `CreateExternalPromise` effect and handed to host code; `complete` and `fail`
/// may be called from any thread. Completion is delivered through the scheduler's event channel,
/// so the waiting task wakes at its suspension point like any other.
#[derive(Clone)]
pub struct ExternalCompleter {
    pub(crate) promise: PromiseId,
    pub(crate) sender: UnboundedSender<ExternalEvent>,
}

impl ExternalCompleter {
    pub fn promise_id(&self) -> PromiseId {
        self.promise
    }

    /// Returns false if the run already finished.
    pub fn complete(&self, value: Value) -> bool {
        self.sender
            .send(ExternalEvent::PromiseCompleted {
                promise: self.promise,
                result: Ok(value),
            })
            .is_ok()
    }

    /// Returns false if the run already finished.
    pub fn fail(&self, error: Exception) -> bool {
        self.sender
            .send(ExternalEvent::PromiseCompleted {
                promise: self.promise,
                result: Err(error),
            })
            .is_ok()
    }
}

impl fmt::Debug for ExternalCompleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<external completer for promise {}>", self.promise)
    }
}

// TESTS
// ================================================================================================
