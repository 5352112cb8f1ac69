//! Chunk sizing
//!
//! Converts a benchmark speed estimate and a target chunk duration into a
//! keyspace slice size. The fluctuation band lets the last chunk absorb a
//! small remainder instead of producing a tiny tail chunk, and slow hashes
//! get a minimum slice floor so chunks never degenerate to a handful of
//! candidates.

use std::time::Duration;

/// Inputs to [`plan_chunk`].
#[derive(Debug, Clone)]
pub struct ChunkParams {
    /// Benchmark estimate for this (agent, attack, hash type, binary).
    pub hashes_per_second: u64,
    /// Target wall time for the chunk.
    pub target_duration: Duration,
    /// Keyspace left to dispatch for the job.
    pub remaining: i64,
    /// Tail-absorption band in percent (0..=100).
    pub fluctuation_pct: u8,
    /// Minimum slice size; raised for slow hashes.
    pub min_chunk: i64,
    /// Multiplier for rule-split jobs: candidates tried per wordlist line.
    pub per_position_multiplier: i64,
}

impl ChunkParams {
    pub fn new(hashes_per_second: u64, target_duration: Duration, remaining: i64) -> Self {
        Self {
            hashes_per_second,
            target_duration,
            remaining,
            fluctuation_pct: 0,
            min_chunk: 1,
            per_position_multiplier: 1,
        }
    }
}

/// Compute the slice size for one chunk.
///
/// The base size is `hps · T`, divided by the per-position multiplier when a
/// single keyspace position expands to several candidates (rule-split). The
/// result is clamped to `[min_chunk, remaining]`, and when the leftover after
/// this chunk would fall inside the fluctuation band the chunk absorbs it.
pub fn plan_chunk(params: &ChunkParams) -> i64 {
    if params.remaining <= 0 {
        return 0;
    }

    let secs = params.target_duration.as_secs().max(1);
    let budget = (params.hashes_per_second.max(1)).saturating_mul(secs);
    let budget = i64::try_from(budget).unwrap_or(i64::MAX);

    let multiplier = params.per_position_multiplier.max(1);
    let mut size = (budget / multiplier).max(1);

    size = size.max(params.min_chunk.max(1));
    size = size.min(params.remaining);

    // Absorb a small tail rather than leaving a sliver behind.
    let leftover = params.remaining - size;
    let band = size.saturating_mul(i64::from(params.fluctuation_pct)) / 100;
    if leftover > 0 && leftover <= band {
        size = params.remaining;
    }

    size
}
