use std::path::PathBuf;

use doeff_core::SpawnBackend;

use crate::errors::ExecutionError;

// CONSTANTS
// ================================================================================================

/// Default ceiling for the continuation stack. High enough for deeply recursive programs, low
/// enough to fire long before the host stack is at risk (the trampoline itself never recurses).
pub const DEFAULT_MAX_STACK_DEPTH: usize = 10_000;

/// Environment variable naming the persistent cache location.
pub const CACHE_PATH_ENV: &str = "DOEFF_CACHE_PATH";

/// Environment variable that disables step profiling even when enabled in options.
pub const DISABLE_PROFILE_ENV: &str = "DOEFF_DISABLE_PROFILE";

// EXECUTION OPTIONS
// ================================================================================================

/// Configuration recognized by [`crate::run`] and [`crate::async_run`].
#[derive(Clone, Debug)]
pub struct ExecutionOptions {
    max_log_entries: Option<usize>,
    max_stack_depth: usize,
    allow_reentrancy: bool,
    spawn_default_backend: SpawnBackend,
    spawn_thread_max_workers: usize,
    cache_db_path: Option<PathBuf>,
    profiling_enabled: bool,
    debug_traceback: bool,
    trace: bool,
    io_allowed: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_log_entries: None,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            allow_reentrancy: false,
            spawn_default_backend: SpawnBackend::Thread,
            spawn_thread_max_workers: 4,
            cache_db_path: std::env::var_os(CACHE_PATH_ENV).map(PathBuf::from),
            profiling_enabled: false,
            debug_traceback: false,
            trace: false,
            io_allowed: true,
        }
    }
}

impl ExecutionOptions {
    // BUILDERS
    // --------------------------------------------------------------------------------------------

    /// Caps the writer log; older entries are trimmed once the cap is exceeded.
    pub fn with_max_log_entries(mut self, max_entries: usize) -> Self {
        self.max_log_entries = Some(max_entries);
        self
    }

    /// Sets the continuation-stack ceiling. A value of 0 disables the check.
    pub fn with_max_stack_depth(mut self, max_depth: usize) -> Self {
        self.max_stack_depth = max_depth;
        self
    }

    pub fn with_reentrancy_allowed(mut self, allowed: bool) -> Self {
        self.allow_reentrancy = allowed;
        self
    }

    pub fn with_spawn_default_backend(mut self, backend: SpawnBackend) -> Self {
        self.spawn_default_backend = backend;
        self
    }

    pub fn with_spawn_thread_max_workers(mut self, workers: usize) -> Self {
        self.spawn_thread_max_workers = workers;
        self
    }

    pub fn with_cache_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_db_path = Some(path.into());
        self
    }

    /// Emits a step-timing summary to stderr when the run completes. Ignored when the
    /// `DOEFF_DISABLE_PROFILE` environment variable is set.
    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.profiling_enabled = enabled;
        self
    }

    /// Captures a host backtrace into every failure. Expensive; intended for debugging.
    pub fn with_debug_traceback(mut self, enabled: bool) -> Self {
        self.debug_traceback = enabled;
        self
    }

    /// Records an execution trace returned through the run result.
    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.trace = enabled;
        self
    }

    pub fn with_io_allowed(mut self, allowed: bool) -> Self {
        self.io_allowed = allowed;
        self
    }

    // VALIDATION
    // --------------------------------------------------------------------------------------------

    pub fn validate(&self) -> Result<(), ExecutionError> {
        if self.spawn_thread_max_workers == 0 {
            return Err(ExecutionError::InvalidOptions(
                "spawn_thread_max_workers must be at least 1".into(),
            ));
        }
        Ok(())
    }

    // ACCESSORS
    // --------------------------------------------------------------------------------------------

    pub fn max_log_entries(&self) -> Option<usize> {
        self.max_log_entries
    }

    pub fn max_stack_depth(&self) -> usize {
        self.max_stack_depth
    }

    pub fn allow_reentrancy(&self) -> bool {
        self.allow_reentrancy
    }

    pub fn spawn_default_backend(&self) -> SpawnBackend {
        self.spawn_default_backend
    }

    pub fn spawn_thread_max_workers(&self) -> usize {
        self.spawn_thread_max_workers
    }

    pub fn cache_db_path(&self) -> Option<&PathBuf> {
        self.cache_db_path.as_ref()
    }

    pub fn profiling_enabled(&self) -> bool {
        self.profiling_enabled && std::env::var_os(DISABLE_PROFILE_ENV).is_none()
    }

    pub fn debug_traceback(&self) -> bool {
        self.debug_traceback
    }

    pub fn trace_enabled(&self) -> bool {
        self.trace
    }

    pub fn io_allowed(&self) -> bool {
        self.io_allowed
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_workers_is_rejected() {
        let options = ExecutionOptions::default().with_spawn_thread_max_workers(0);
        assert!(options.validate().is_err());
    }

    #[test]
    fn zero_stack_depth_disables_the_check() {
        let options = ExecutionOptions::default().with_max_stack_depth(0);
        assert!(options.validate().is_ok());
        assert_eq!(options.max_stack_depth(), 0);
    }
}
