//! Fuzzing engine configuration.
//!
//! Mirrors the options table in the external-interfaces design: every row is a field
//! here, defaulted the way libFuzzer/realmfuzzer default them (mostly "0 = unlimited").
//! `Options` is cloned into every process proxy and into the adapter client stub on
//! `Runner::configure`, exactly as the original copies its `OptionsPtr` around.

use serde::{Deserialize, Serialize};

/// Exit-code-to-fault-kind mapping plus every other tunable the runner or a process
/// proxy consults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// Stop after this many runs. `0` means unlimited.
    pub runs: u64,
    /// Stop after this many nanoseconds of wall-clock time. `0` means unlimited.
    pub max_total_time_ns: u64,
    /// Cap on a single input's length in bytes.
    pub max_input_size: usize,
    /// Number of mutations applied to a chosen base input before a new base is picked.
    pub mutation_depth: u32,
    /// Enable the leak-detection heuristic (rerun suspected-leak inputs under full
    /// leak checking).
    pub detect_leaks: bool,
    /// Treat a non-zero, otherwise-unmapped exit code as a fault.
    pub detect_exits: bool,
    /// Per-run timeout in nanoseconds. `0` means no per-run limit.
    pub run_limit_ns: u64,
    /// Bound on a single allocation, enforced target-side. Informational here.
    pub malloc_limit: u64,
    /// Periodic allocator purge interval, enforced target-side. Informational here.
    pub purge_interval_ns: u64,
    /// Process RSS cap, enforced target-side. Informational here.
    pub oom_limit: u64,
    /// Exit code that maps to `FuzzResult::BadMalloc`.
    pub malloc_exitcode: i32,
    /// Exit code that maps to `FuzzResult::Death`.
    pub death_exitcode: i32,
    /// Exit code that maps to `FuzzResult::Leak`.
    pub leak_exitcode: i32,
    /// Exit code that maps to `FuzzResult::Oom`.
    pub oom_exitcode: i32,
    /// PRNG seed, used both for mutation and for entropic corpus selection.
    pub seed: u64,
    /// Disables the entropic ("smaller input, more features") corpus-selection
    /// heuristic in favor of uniform random choice. Exposed so tests can produce
    /// reproducible sequences — see Open Question in the design notes.
    pub disable_entropic: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            runs: 0,
            max_total_time_ns: 0,
            max_input_size: 1 << 20,
            mutation_depth: 5,
            detect_leaks: false,
            detect_exits: false,
            run_limit_ns: 20 * 1_000_000_000,
            malloc_limit: 0,
            purge_interval_ns: 0,
            oom_limit: 0,
            malloc_exitcode: 2000,
            death_exitcode: 2001,
            leak_exitcode: 2002,
            oom_exitcode: 2003,
            seed: 0,
            disable_entropic: false,
        }
    }
}

/// Reserved, never-assigned target ids. `INVALID` marks "no process"; `TIMEOUT_SENTINEL`
/// marks a synthetic artifact produced when a per-run deadline elapses before any real
/// process responds.
pub const INVALID_TARGET_ID: u64 = 0;
pub const TIMEOUT_TARGET_ID: u64 = u64::MAX;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unlimited_by_zero() {
        let options = Options::default();
        assert_eq!(options.runs, 0);
        assert_eq!(options.max_total_time_ns, 0);
    }

    #[test]
    fn reserved_ids_are_distinct() {
        assert_ne!(INVALID_TARGET_ID, TIMEOUT_TARGET_ID);
    }
}
