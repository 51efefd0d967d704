use std::{collections::BTreeMap, sync::Arc};

use doeff_core::{Exception, Value};

// RESERVED KEYS
// ================================================================================================

/// Store slot holding the writer log.
pub const LOG_KEY: &str = "__log__";
/// Store slot holding the process-wide memoization table.
pub const MEMO_KEY: &str = "__memo__";
/// Store slot holding the persistent cache backend.
pub const CACHE_STORAGE_KEY: &str = "__cache_storage__";
/// Store slot holding atomic state.
pub const ATOMIC_STATE_KEY: &str = "__atomic_state__";

const RESERVED_PREFIX: &str = "__";

// BOUNDED LOG
// ================================================================================================

/// Append-only writer log that keeps at most `max_entries` items.
///
/// The cap survives `copy`, `spawn_empty` and `slice`; when it is exceeded the oldest entries
/// are trimmed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoundedLog {
    entries: Vec<Value>,
    max_entries: Option<usize>,
}

impl BoundedLog {
    pub fn new(max_entries: Option<usize>) -> Self {
        Self { entries: Vec::new(), max_entries }
    }

    pub fn max_entries(&self) -> Option<usize> {
        self.max_entries
    }

    pub fn set_max_entries(&mut self, max_entries: Option<usize>) {
        self.max_entries = max_entries;
        self.trim();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, entry: Value) {
        self.entries.push(entry);
        self.trim();
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = Value>) {
        self.entries.extend(entries);
        self.trim();
    }

    pub fn entries(&self) -> &[Value] {
        &self.entries
    }

    /// The entries appended since `start`, with the retention cap preserved.
    pub fn slice_from(&self, start: usize) -> BoundedLog {
        let start = start.min(self.entries.len());
        Self {
            entries: self.entries[start..].to_vec(),
            max_entries: self.max_entries,
        }
    }

    /// An empty log with the same retention semantics, for a freshly spawned task.
    pub fn spawn_empty(&self) -> BoundedLog {
        Self::new(self.max_entries)
    }

    pub fn to_value(&self) -> Value {
        Value::list(self.entries.iter().cloned())
    }

    fn trim(&mut self) {
        if let Some(max) = self.max_entries {
            let overflow = self.entries.len().saturating_sub(max);
            if overflow > 0 {
                self.entries.drain(..overflow);
            }
        }
    }
}

// READER ENVIRONMENT
// ================================================================================================

/// The reader environment: an immutable keyed map with copy-on-extend semantics.
#[derive(Clone, Debug, Default)]
pub struct Env {
    entries: Arc<BTreeMap<String, Value>>,
}

impl Env {
    pub fn new(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            entries: Arc::new(entries.into_iter().collect()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// A new environment with `updates` merged over this one.
    pub fn extended(&self, updates: &BTreeMap<String, Value>) -> Self {
        if updates.is_empty() {
            return self.clone();
        }
        let mut merged = (*self.entries).clone();
        for (key, value) in updates {
            merged.insert(key.clone(), value.clone());
        }
        Self { entries: Arc::new(merged) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// STORE
// ================================================================================================

/// Per-task mutable state: user keys plus the writer log.
///
/// The reserved slots named by [`MEMO_KEY`], [`CACHE_STORAGE_KEY`] and [`ATOMIC_STATE_KEY`] are
/// owned by the interpreter and shared between cooperative tasks; they are not part of the
/// per-task snapshot. User code cannot write any `__`-prefixed key.
#[derive(Clone, Debug, Default)]
pub struct Store {
    user: BTreeMap<String, Value>,
    log: BoundedLog,
}

impl Store {
    pub fn new(user: impl IntoIterator<Item = (String, Value)>, max_log_entries: Option<usize>) -> Self {
        Self {
            user: user.into_iter().collect(),
            log: BoundedLog::new(max_log_entries),
        }
    }

    // USER KEYS
    // --------------------------------------------------------------------------------------------

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.user.get(key)
    }

    pub fn put(&mut self, key: &str, value: Value) -> Result<(), Exception> {
        if key.starts_with(RESERVED_PREFIX) {
            return Err(Exception::value_error(format!(
                "store keys beginning with {RESERVED_PREFIX:?} are reserved: {key:?}"
            )));
        }
        self.user.insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.user.remove(key)
    }

    pub fn user_entries(&self) -> &BTreeMap<String, Value> {
        &self.user
    }

    pub(crate) fn user_snapshot(&self) -> BTreeMap<String, Value> {
        self.user.clone()
    }

    pub(crate) fn restore_user(&mut self, snapshot: BTreeMap<String, Value>) {
        self.user = snapshot;
    }

    // LOG
    // --------------------------------------------------------------------------------------------

    pub fn log(&self) -> &BoundedLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut BoundedLog {
        &mut self.log
    }

    // SNAPSHOT AND MERGE
    // --------------------------------------------------------------------------------------------

    /// The store a spawned child starts from: a deep copy of the user keys and an empty log
    /// with the same retention cap.
    pub fn snapshot_for_spawn(&self) -> Store {
        Store {
            user: self.user.clone(),
            log: self.log.spawn_empty(),
        }
    }

    /// Merges a joined child into this store: child user keys win, child log entries are
    /// appended after the parent's.
    pub fn merge_child(&mut self, child: Store) {
        for (key, value) in child.user {
            self.user.insert(key, value);
        }
        self.log.extend(child.log.entries.iter().cloned());
    }
}

// TESTS
// ================================================================================================
