//! Error types for the cracking orchestrator

use thiserror::Error;

use super::{AgentId, JobId, TaskId};

/// Top-level orchestrator error type
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("keyspace error: {0}")]
    Keyspace(#[from] KeyspaceError),

    #[error("rule split error: {0}")]
    RuleSplit(#[from] RuleSplitError),

    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Persistence-layer errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("job not found: {job_id}")]
    JobNotFound { job_id: JobId },

    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: TaskId },

    #[error("agent not found: {agent_id}")]
    AgentNotFound { agent_id: AgentId },

    #[error("invalid job transition for {job_id}: {from} → {to}")]
    InvalidTransition {
        job_id: JobId,
        from: String,
        to: String,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e.to_string())
    }
}

/// Job admission failures; an admission error keeps the job out of
/// scheduling entirely.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("unresolved file reference: {0}")]
    UnresolvedFile(String),

    #[error("hashlist unavailable: {0}")]
    HashlistUnavailable(String),

    #[error("computed keyspace is zero")]
    ZeroKeyspace,

    #[error("invalid mask: {0}")]
    InvalidMask(String),

    #[error("invalid priority {got}, maximum is {max}")]
    InvalidPriority { got: u8, max: u8 },

    #[error(
        "association map line count {map_lines} does not match hash count {hash_count}"
    )]
    AssociationMismatch { map_lines: i64, hash_count: i64 },

    #[error("rule splitting failed: {0}")]
    RuleSplit(#[from] RuleSplitError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Scheduler-loop errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("tick already in progress")]
    TickInProgress,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("scheduler shutdown in progress")]
    ShuttingDown,
}

/// Transport-layer errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("agent not connected: {agent_id}")]
    AgentNotConnected { agent_id: AgentId },

    #[error("send failed to agent {agent_id}: {reason}")]
    SendFailed { agent_id: AgentId, reason: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport is shutting down")]
    ShuttingDown,
}

/// Recovery-manager errors
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("sweep already in progress")]
    SweepInProgress,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Keyspace-model errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyspaceError {
    #[error("invalid mask: {0}")]
    InvalidMask(String),

    #[error("custom charset ?{index} referenced but not provided")]
    MissingCustomCharset { index: u8 },

    #[error("increment range {min}..={max} exceeds mask length {mask_len}")]
    InvalidIncrement { min: u32, max: u32, mask_len: u32 },
}

/// Rule-splitter errors
#[derive(Error, Debug)]
pub enum RuleSplitError {
    #[error("rules file is empty")]
    EmptyRules,

    #[error("requested {requested} chunks for {rules} rules")]
    TooManyChunks { requested: u32, rules: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by external collaborator services
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("invalid input: {0}")]
    Invalid(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid setting: {0}")]
    Invalid(String),
}
