//! Job-related types and data structures
//!
//! A job is a user-submitted attack plan against one hashlist. The scheduler
//! partitions its keyspace into tasks and reconciles progress back into the
//! aggregate counters carried here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AttackMode, FileId, HashlistId, JobId};
use crate::keyspace::AttackPlan;

/// Job lifecycle status.
///
/// Lattice: pending → running → {paused|completed|failed|cancelled};
/// paused ↔ running; completed/failed/cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the transition `self → to` is allowed by the status lattice.
    ///
    /// A queued job may be cancelled or failed before it ever runs; everything
    /// else goes through `running`.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            (Pending, Running) | (Pending, Cancelled) | (Pending, Failed) => true,
            (Running, Paused)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled) => true,
            (Paused, Running) | (Paused, Cancelled) | (Paused, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Unresolved attack specification as submitted by the user.
///
/// File references are resolved (and line counts captured) at admission;
/// the resolved form is [`AttackPlan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AttackSpec {
    Dictionary {
        wordlist_id: FileId,
        rule_id: Option<FileId>,
    },
    Combination {
        left_wordlist_id: FileId,
        right_wordlist_id: FileId,
    },
    BruteForce {
        mask: String,
        custom_charsets: Vec<String>,
        /// Inclusive (min, max) mask lengths for increment mode.
        increment: Option<(u32, u32)>,
    },
    HybridWordlistMask {
        wordlist_id: FileId,
        mask: String,
        custom_charsets: Vec<String>,
    },
    HybridMaskWordlist {
        mask: String,
        custom_charsets: Vec<String>,
        wordlist_id: FileId,
    },
    /// Candidate file is the hashlist's association map (line i → hash i).
    Association,
}

impl AttackSpec {
    pub fn attack_mode(&self) -> AttackMode {
        match self {
            AttackSpec::Dictionary { .. } => AttackMode::Dictionary,
            AttackSpec::Combination { .. } => AttackMode::Combination,
            AttackSpec::BruteForce { .. } => AttackMode::BruteForce,
            AttackSpec::HybridWordlistMask { .. } => AttackMode::HybridWordlistMask,
            AttackSpec::HybridMaskWordlist { .. } => AttackMode::HybridMaskWordlist,
            AttackSpec::Association => AttackMode::Association,
        }
    }
}

/// Job submission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub owner: String,
    pub hashlist_id: HashlistId,
    pub attack: AttackSpec,
    /// Cracking-binary version pointer; `"default"` resolves at admission.
    pub binary_version: String,
    /// 1..=max_priority, higher first.
    pub priority: u8,
    /// 0 = unlimited.
    pub max_agents: u32,
    pub allow_preempt: bool,
    /// Per-job override of the target chunk duration.
    pub chunk_duration_secs: Option<u32>,
}

/// Reference to one content-addressed rule sub-file of a rule-split job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleChunkRef {
    pub index: u32,
    /// Content hash of the sub-file bytes; doubles as the on-disk name.
    pub chunk_id: String,
    pub line_count: i64,
}

/// A user-submitted attack plan with its scheduling state and the aggregate
/// counters owned by the progress reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner: String,
    pub hashlist_id: HashlistId,
    pub attack_mode: AttackMode,
    /// Original submission, kept for task assignment payloads.
    pub spec: AttackSpec,
    /// Resolved plan with captured line counts; source of keyspace math.
    pub plan: AttackPlan,
    pub hash_type: u32,
    /// Slow-hash flag from the hashlist service; raises the chunk floor.
    pub slow_hash: bool,
    pub binary_version: String,
    pub priority: u8,
    /// 0 = unlimited.
    pub max_agents: u32,
    pub allow_preempt: bool,
    pub chunk_duration_secs: Option<u32>,
    /// Total candidate count; saturated at `i64::MAX` when `unbounded`.
    pub effective_keyspace: i64,
    pub unbounded: bool,
    /// Written only by the progress reconciler.
    pub processed_keyspace: i64,
    /// Written only by the progress reconciler.
    pub dispatched_keyspace: i64,
    /// Written only by the progress reconciler.
    pub progress_percent: f64,
    pub status: JobStatus,
    pub uses_rule_splitting: bool,
    pub rule_chunks: Vec<RuleChunkRef>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Target chunk duration for this job, falling back to the system default.
    pub fn chunk_duration(&self, default_secs: u64) -> std::time::Duration {
        std::time::Duration::from_secs(self.chunk_duration_secs.map(u64::from).unwrap_or(default_secs))
    }

    /// Total line count of all rule sub-files.
    pub fn total_rule_lines(&self) -> i64 {
        self.rule_chunks.iter().map(|c| c.line_count).sum()
    }
}
