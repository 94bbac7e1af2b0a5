//! Configuration knobs for the storage stack and the background GC worker.
//! There is no environment-variable parsing layer here; this crate's
//! embedder wires these up directly; no VM binding exists in this crate
//! to read env vars from.

use std::time::Duration;

/// The three knobs a freshly created collected space needs: the Address
/// Book's per-table capacity, the Memory Space's default block size, and
/// the PRNG seed.
#[derive(Debug, Clone, Copy)]
pub struct CollectedSpaceConfig {
    /// Fixed capacity of every Address Table the book creates.
    pub table_cap: usize,
    /// Minimum net capacity of a freshly created Memory Block.
    pub default_block_bytes: usize,
    /// Seed for the Memory Space's block-placement PRNG.
    pub seed: u64,
}

impl Default for CollectedSpaceConfig {
    fn default() -> Self {
        CollectedSpaceConfig {
            table_cap: 256,
            default_block_bytes: 1 << 16,
            seed: 0x1234_5678_9abc_def0,
        }
    }
}

/// Configuration for the optional background GC worker.
#[derive(Debug, Clone, Copy)]
pub struct GcWorkerSpec {
    /// Cycle period: how long the worker sleeps between checks.
    pub delay: Duration,
    /// Whether to run `try_full_shift` after each mark-sweep pass.
    pub shift: bool,
    /// Number of `malloc_object`/`malloc_root` calls observed since the
    /// last collection before the worker triggers another one.
    pub shift_trigger: u64,
}

impl Default for GcWorkerSpec {
    fn default() -> Self {
        GcWorkerSpec {
            delay: Duration::from_millis(100),
            shift: true,
            shift_trigger: 1024,
        }
    }
}
