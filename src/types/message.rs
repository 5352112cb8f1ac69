//! Wire messages exchanged with agents
//!
//! Both directions are at-least-once: progress and crack messages carry
//! monotonic task-scoped sequence numbers and duplicates are dropped at the
//! task store; assignments are acked and re-sent until the retry budget runs
//! out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentId, AttackSpec, HashlistId, JobId, RuleChunkRef, TaskId};

/// Everything an agent needs to start executing one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub hashlist_id: HashlistId,
    pub attack: AttackSpec,
    pub hash_type: u32,
    pub binary_version: String,
    pub keyspace_start: i64,
    pub keyspace_end: i64,
    /// Set for rule-split jobs; names the sub-file the agent must use in
    /// place of the original rules file.
    pub rule_chunk: Option<RuleChunkRef>,
    /// Expected progress cadence; feeds the server-side stall threshold.
    pub report_interval_secs: u64,
}

/// Messages pushed from the server to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AssignTask {
        assignment: TaskAssignment,
    },
    CancelTask {
        task_id: TaskId,
        reason: String,
    },
    /// Bounded-duration benchmark run; the result releases pending real work
    /// for this (attack mode, hash type, binary) triple.
    Speedtest {
        attack_mode: super::AttackMode,
        hash_type: u32,
        binary_version: String,
        duration_secs: u64,
    },
    SyncFiles {
        manifest: Vec<FileManifestEntry>,
    },
    DebugToggle {
        enabled: bool,
    },
}

/// One entry of a file-sync manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileManifestEntry {
    pub name: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Hardware snapshot carried on heartbeats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareStats {
    pub gpu_temps_c: Vec<f32>,
    pub gpu_utilization_pct: Vec<f32>,
    pub memory_used_mb: u64,
}

/// Final counters reported with task completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSummary {
    pub keyspace_processed: i64,
    pub effective_processed: i64,
    pub cracked_count: u32,
}

/// Messages received from an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Heartbeat {
        stats: HardwareStats,
    },
    /// Acknowledges receipt of an `AssignTask`.
    TaskAck {
        task_id: TaskId,
    },
    Progress {
        task_id: TaskId,
        /// Monotonic per-task sequence number; the store drops `seq ≤ stored`.
        seq: i64,
        keyspace_processed: i64,
        effective_processed: i64,
        hashes_per_second: u64,
        timestamp: DateTime<Utc>,
    },
    Crack {
        task_id: TaskId,
        hash: String,
        plaintext: String,
        username: Option<String>,
        domain: Option<String>,
    },
    TaskCompleted {
        task_id: TaskId,
        summary: TaskSummary,
    },
    TaskFailed {
        task_id: TaskId,
        reason: String,
    },
    BenchmarkResult {
        attack_mode: super::AttackMode,
        hash_type: u32,
        binary_version: String,
        hashes_per_second: u64,
    },
    LogChunk {
        task_id: Option<TaskId>,
        content: String,
    },
}

impl AgentMessage {
    /// Short tag for logging without dumping payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentMessage::Heartbeat { .. } => "heartbeat",
            AgentMessage::TaskAck { .. } => "task_ack",
            AgentMessage::Progress { .. } => "progress",
            AgentMessage::Crack { .. } => "crack",
            AgentMessage::TaskCompleted { .. } => "task_completed",
            AgentMessage::TaskFailed { .. } => "task_failed",
            AgentMessage::BenchmarkResult { .. } => "benchmark_result",
            AgentMessage::LogChunk { .. } => "log_chunk",
        }
    }
}

/// Inbound envelope: which agent said what.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub agent_id: AgentId,
    pub message: AgentMessage,
}

/// One cracked hash as handed to the hashlist ingest sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrackEntry {
    pub hash: String,
    pub plaintext: String,
    pub username: Option<String>,
    pub domain: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_message_round_trips_as_json() {
        let msg = ServerMessage::CancelTask {
            task_id: TaskId::new(),
            reason: "preempted".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"cancel_task\""));
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        match back {
            ServerMessage::CancelTask { reason, .. } => assert_eq!(reason, "preempted"),
            _ => panic!("expected CancelTask"),
        }
    }

    #[test]
    fn progress_message_round_trips_as_json() {
        let msg = AgentMessage::Progress {
            task_id: TaskId::new(),
            seq: 7,
            keyspace_processed: 4_096,
            effective_processed: 0,
            hashes_per_second: 1_000_000,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: AgentMessage = serde_json::from_str(&json).unwrap();
        match back {
            AgentMessage::Progress { seq, keyspace_processed, .. } => {
                assert_eq!(seq, 7);
                assert_eq!(keyspace_processed, 4_096);
            }
            _ => panic!("expected Progress"),
        }
    }
}
