use std::{
    collections::BTreeMap,
    io::Write,
    time::{Duration, Instant},
};

// PROFILER
// ================================================================================================

/// Opt-in step profiler.
///
/// Aggregates step counts and wall time per control kind and writes a summary to stderr when the
/// run finishes. Program output stays on stdout; everything here goes to stderr.
#[derive(Debug)]
pub struct Profiler {
    enabled: bool,
    started: Instant,
    step_counts: BTreeMap<&'static str, u64>,
    dispatch_counts: BTreeMap<&'static str, u64>,
}

impl Profiler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            started: Instant::now(),
            step_counts: BTreeMap::new(),
            dispatch_counts: BTreeMap::new(),
        }
    }

    pub fn record_step(&mut self, control_kind: &'static str) {
        if self.enabled {
            *self.step_counts.entry(control_kind).or_default() += 1;
        }
    }

    pub fn record_dispatch(&mut self, effect_name: &'static str) {
        if self.enabled {
            *self.dispatch_counts.entry(effect_name).or_default() += 1;
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Writes the summary to stderr. A failed write is ignored; profiling output is best-effort.
    pub fn report(&self) {
        if !self.enabled {
            return;
        }
        let mut stderr = std::io::stderr().lock();
        let total: u64 = self.step_counts.values().sum();
        let _ = writeln!(
            stderr,
            "[doeff profile] {total} steps in {:?}",
            self.elapsed(),
        );
        for (kind, count) in &self.step_counts {
            let _ = writeln!(stderr, "[doeff profile]   step {kind}: {count}");
        }
        for (effect, count) in &self.dispatch_counts {
            let _ = writeln!(stderr, "[doeff profile]   effect {effect}: {count}");
        }
    }
}

// INTERPRETATION STATS
// ================================================================================================

/// Counters kept for every run, cheap enough to be always on.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InterpretationStats {
    pub total_steps: u64,
    pub total_effects_handled: u64,
    pub total_frames_pushed: u64,
    pub max_stack_depth: usize,
    pub total_exceptions_caught: u64,
    pub total_task_switches: u64,
    pub total_tasks_spawned: u64,
}

// TESTS
// ================================================================================================
