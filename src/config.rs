//! Runtime settings
//!
//! Every tunable the scheduling core consumes lives here. Loops take a
//! [`Settings`] snapshot per tick from the [`SettingsStore`] instead of
//! reading ambient global state, so a settings change lands cleanly on the
//! next tick.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::ConfigError;

/// Overflow allocation policy: how leftover idle agents are spread across
/// equal-priority jobs once every job has taken its `max_agents`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowMode {
    /// Oldest job at the priority absorbs all remaining agents.
    #[default]
    Fifo,
    /// One agent at a time, cycling across jobs in created-at order.
    RoundRobin,
}

/// Runtime knobs consumed by the scheduling core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Target wall time per chunk.
    #[serde(with = "humantime_serde")]
    pub default_chunk_duration: Duration,
    /// Tail-absorption band in percent (0..=100).
    pub chunk_fluctuation_percentage: u8,
    /// Minimum slice size applied to slow hashes.
    pub slow_hash_min_chunk: i64,
    /// Per-agent parallelism cap.
    pub max_concurrent_jobs_per_agent: u32,
    /// Expected progress cadence from agents; feeds the stall threshold.
    #[serde(with = "humantime_serde")]
    pub progress_reporting_interval: Duration,
    /// Benchmark cache TTL.
    #[serde(with = "humantime_serde")]
    pub benchmark_cache_duration: Duration,
    /// Whether stale benchmark entries may be used while a refresh runs.
    pub benchmark_stale_ok: bool,
    /// Bound on a speedtest task; an unanswered probe is re-sent after this.
    #[serde(with = "humantime_serde")]
    pub speedtest_timeout: Duration,
    /// How long a disconnected agent keeps its tasks.
    #[serde(with = "humantime_serde")]
    pub reconnect_grace_period: Duration,
    /// Per-task requeue budget.
    pub max_chunk_retry_attempts: u32,
    /// Consecutive task failures before an agent is quarantined.
    pub agent_failure_threshold: u32,
    /// Resend budget for unacknowledged assignments.
    pub assignment_retry_attempts: u32,
    pub rule_split_enabled: bool,
    /// Workload ratio over the chunk duration that activates splitting.
    pub rule_split_threshold: f64,
    pub rule_split_min_rules: i64,
    pub rule_split_max_chunks: u32,
    pub rule_chunk_temp_dir: PathBuf,
    pub agent_overflow_allocation_mode: OverflowMode,
    /// Master switch for agent schedule windows.
    pub agent_scheduling_enabled: bool,
    /// Inclusive upper bound on job priority.
    pub max_priority: u8,
    /// Global enable for priority preemption.
    pub job_interruption_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_chunk_duration: Duration::from_secs(600),
            chunk_fluctuation_percentage: 20,
            slow_hash_min_chunk: 1_000,
            max_concurrent_jobs_per_agent: 1,
            progress_reporting_interval: Duration::from_secs(5),
            benchmark_cache_duration: Duration::from_secs(72 * 3600),
            benchmark_stale_ok: true,
            speedtest_timeout: Duration::from_secs(180),
            reconnect_grace_period: Duration::from_secs(5 * 60),
            max_chunk_retry_attempts: 3,
            agent_failure_threshold: 5,
            assignment_retry_attempts: 3,
            rule_split_enabled: true,
            rule_split_threshold: 2.0,
            rule_split_min_rules: 100,
            rule_split_max_chunks: 8,
            rule_chunk_temp_dir: std::env::temp_dir().join("crackhive-rule-chunks"),
            agent_overflow_allocation_mode: OverflowMode::Fifo,
            agent_scheduling_enabled: true,
            max_priority: 10,
            job_interruption_enabled: true,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let settings: Settings =
            toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_fluctuation_percentage > 100 {
            return Err(ConfigError::Invalid(
                "chunk_fluctuation_percentage must be 0..=100".to_string(),
            ));
        }
        if self.max_priority == 0 {
            return Err(ConfigError::Invalid("max_priority must be at least 1".to_string()));
        }
        if self.rule_split_max_chunks < 2 {
            return Err(ConfigError::Invalid(
                "rule_split_max_chunks must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shared settings handle; loops take one snapshot per tick.
pub struct SettingsStore {
    inner: RwLock<Settings>,
}

impl SettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub fn snapshot(&self) -> Settings {
        self.inner.read().clone()
    }

    pub fn update(&self, settings: Settings) {
        *self.inner.write() = settings;
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}
