//! Task-related types and data structures
//!
//! A task is one contiguous keyspace slice dispatched to one agent. Tasks are
//! the ground truth the progress reconciler rebuilds job aggregates from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentId, JobId, TaskId};

/// Task lifecycle status.
///
/// `completed`, `failed` and `cancelled` are terminal. `reclaimed` marks a
/// slice whose agent went away: the record is inactive (late progress for it
/// is dropped) and its unprocessed remainder lives on as a new pending task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    Reclaimed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the slice is currently held by an agent.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Reclaimed => "reclaimed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "reclaimed" => Ok(TaskStatus::Reclaimed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// A contiguous keyspace slice dispatched to (at most) one agent.
///
/// `[keyspace_start, keyspace_end)` is half-open. The effective range is set
/// when the engine-reported keyspace differs from the theoretical one
/// (rule-split and association attacks); aggregate sums prefer it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub agent_id: Option<AgentId>,
    pub keyspace_start: i64,
    pub keyspace_end: i64,
    pub effective_start: Option<i64>,
    pub effective_end: Option<i64>,
    pub keyspace_processed: i64,
    pub effective_processed: i64,
    pub rule_chunk_index: Option<u32>,
    pub status: TaskStatus,
    pub retry_count: u32,
    /// Highest progress sequence number applied; duplicates are dropped.
    pub last_seq: i64,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
}

impl Task {
    /// New unassigned slice over `[start, end)`.
    pub fn pending(job_id: JobId, start: i64, end: i64) -> Self {
        Self {
            id: TaskId::new(),
            job_id,
            agent_id: None,
            keyspace_start: start,
            keyspace_end: end,
            effective_start: None,
            effective_end: None,
            keyspace_processed: 0,
            effective_processed: 0,
            rule_chunk_index: None,
            status: TaskStatus::Pending,
            retry_count: 0,
            last_seq: 0,
            cancel_reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_progress_at: None,
        }
    }

    pub fn range_len(&self) -> i64 {
        self.keyspace_end - self.keyspace_start
    }

    /// Coverage this slice contributes to dispatched keyspace: the effective
    /// range when defined, the raw range otherwise.
    pub fn coverage(&self) -> i64 {
        match (self.effective_start, self.effective_end) {
            (Some(start), Some(end)) => end - start,
            _ => self.range_len(),
        }
    }

    /// Progress this slice contributes to processed keyspace.
    pub fn processed_contribution(&self) -> i64 {
        if self.effective_processed > 0 {
            self.effective_processed
        } else {
            self.keyspace_processed
        }
    }

    /// Unprocessed remainder of the raw range.
    pub fn residual_len(&self) -> i64 {
        (self.keyspace_end - self.keyspace_start - self.keyspace_processed).max(0)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}
