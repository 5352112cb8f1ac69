//! Agent-related types and data structures

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use super::AgentId;

/// Agent lifecycle status.
///
/// `error` is the quarantine state entered after too many consecutive task
/// failures; it requires a manual reset. `disabled` is operator-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Active,
    Inactive,
    Error,
    Disabled,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Active => "active",
            AgentStatus::Inactive => "inactive",
            AgentStatus::Error => "error",
            AgentStatus::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AgentStatus::Pending),
            "active" => Ok(AgentStatus::Active),
            "inactive" => Ok(AgentStatus::Inactive),
            "error" => Ok(AgentStatus::Error),
            "disabled" => Ok(AgentStatus::Disabled),
            other => Err(format!("unknown agent status: {}", other)),
        }
    }
}

/// Compute backend used to drive a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceBackend {
    Cuda,
    Hip,
    OpenCl,
    Metal,
}

/// One (physical device, backend) pairing reported by an agent.
///
/// The same GPU typically shows up once per backend; exactly one record per
/// `device_id` may be active at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: u32,
    pub name: String,
    pub backend: DeviceBackend,
    pub active: bool,
}

/// One weekly availability window.
///
/// Times are wall-clock in the agent's declared timezone. A window whose
/// `start > end` crosses midnight into the following day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub day: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Weekly schedule for an agent, evaluated in the agent's own timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSchedule {
    pub enabled: bool,
    /// IANA timezone name, e.g. `"Europe/Berlin"`.
    pub timezone: String,
    pub windows: Vec<ScheduleWindow>,
}

impl Default for AgentSchedule {
    fn default() -> Self {
        Self {
            enabled: false,
            timezone: "UTC".to_string(),
            windows: Vec::new(),
        }
    }
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub status: AgentStatus,
    pub enabled: bool,
    pub devices: Vec<DeviceRecord>,
    /// Hash types this agent can run; empty means unrestricted.
    pub supported_hash_types: Vec<u32>,
    /// Binary versions already synced to the agent.
    pub binary_versions: Vec<String>,
    pub schedule: AgentSchedule,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            name: name.into(),
            status: AgentStatus::Active,
            enabled: true,
            devices: Vec::new(),
            supported_hash_types: Vec::new(),
            binary_versions: Vec::new(),
            schedule: AgentSchedule::default(),
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn supports_hash_type(&self, hash_type: u32) -> bool {
        self.supported_hash_types.is_empty() || self.supported_hash_types.contains(&hash_type)
    }

    pub fn has_binary(&self, version: &str) -> bool {
        self.binary_versions.iter().any(|v| v == version)
    }
}
