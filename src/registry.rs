//! Agent registry
//!
//! Persisted agent records plus a short-lived in-memory index of connection
//! state. The scheduler consults [`AgentRegistry::eligible`] on its own tick;
//! transport only records connect/disconnect/heartbeat facts here — there are
//! no callbacks into scheduling state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;

use crate::config::Settings;
use crate::store::db::{parse_ts, ts, Database, OptionalExt};
use crate::types::{Agent, AgentId, AgentSchedule, AgentStatus, Job, StoreError};

const AGENT_COLS: &str = "id, name, status, enabled, devices_json, hash_types_json, \
     binary_versions_json, schedule_json, consecutive_failures, created_at, updated_at";

/// Live (non-persisted) connection state of one agent.
#[derive(Debug, Clone)]
struct LiveAgent {
    connected: bool,
    last_heartbeat: DateTime<Utc>,
    disconnected_at: Option<DateTime<Utc>>,
    /// Set once the disconnect sweep has reclaimed this agent's tasks.
    disconnect_handled: bool,
}

/// Registry of workers: durable records plus the live connection index.
pub struct AgentRegistry {
    db: Arc<Database>,
    live: DashMap<AgentId, LiveAgent>,
}

impl AgentRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            live: DashMap::new(),
        }
    }

    /// Persist (insert or update) an agent record.
    pub async fn register(&self, agent: &Agent) -> Result<(), StoreError> {
        let devices_json = serde_json::to_string(&agent.devices)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let hash_types_json = serde_json::to_string(&agent.supported_hash_types)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let binaries_json = serde_json::to_string(&agent.binary_versions)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let schedule_json = serde_json::to_string(&agent.schedule)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let conn = self.db.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO agents (id, name, status, enabled, devices_json, \
             hash_types_json, binary_versions_json, schedule_json, consecutive_failures, \
             created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            rusqlite::params![
                agent.id.to_string(),
                agent.name,
                agent.status.as_str(),
                agent.enabled as i32,
                devices_json,
                hash_types_json,
                binaries_json,
                schedule_json,
                agent.consecutive_failures,
                ts(agent.created_at),
                ts(agent.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get(&self, agent_id: AgentId) -> Result<Agent, StoreError> {
        let conn = self.db.conn.lock().await;
        get_agent(&conn, agent_id)
    }

    pub async fn list(&self) -> Result<Vec<Agent>, StoreError> {
        let conn = self.db.conn.lock().await;
        let sql = format!("SELECT {AGENT_COLS} FROM agents ORDER BY name, id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_agent)?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row??);
        }
        Ok(agents)
    }

    /// Connected agents in a stable order (by name, then id).
    pub async fn online_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let agents = self.list().await?;
        Ok(agents
            .into_iter()
            .filter(|a| self.is_connected(a.id))
            .collect())
    }

    // ── Live connection index ─────────────────────────────────────────

    pub fn mark_connected(&self, agent_id: AgentId) {
        let now = Utc::now();
        self.live.insert(
            agent_id,
            LiveAgent {
                connected: true,
                last_heartbeat: now,
                disconnected_at: None,
                disconnect_handled: false,
            },
        );
    }

    pub fn mark_disconnected(&self, agent_id: AgentId) {
        if let Some(mut entry) = self.live.get_mut(&agent_id) {
            if entry.connected {
                entry.connected = false;
                entry.disconnected_at = Some(Utc::now());
                entry.disconnect_handled = false;
            }
        }
    }

    pub fn touch_heartbeat(&self, agent_id: AgentId) {
        if let Some(mut entry) = self.live.get_mut(&agent_id) {
            entry.last_heartbeat = Utc::now();
        }
    }

    pub fn is_connected(&self, agent_id: AgentId) -> bool {
        self.live
            .get(&agent_id)
            .map(|e| e.connected)
            .unwrap_or(false)
    }

    /// Whether the agent is connected and has heartbeated within
    /// `staleness`.
    pub fn is_heartbeating(&self, agent_id: AgentId, staleness: Duration) -> bool {
        match self.live.get(&agent_id) {
            Some(entry) if entry.connected => {
                let age = (Utc::now() - entry.last_heartbeat)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                age <= staleness
            }
            _ => false,
        }
    }

    /// Agents disconnected for longer than `grace` whose tasks have not been
    /// reclaimed yet.
    pub fn expired_disconnects(&self, grace: Duration) -> Vec<AgentId> {
        let now = Utc::now();
        self.live
            .iter()
            .filter_map(|entry| {
                if entry.connected || entry.disconnect_handled {
                    return None;
                }
                let since = entry.disconnected_at?;
                let age = (now - since).to_std().unwrap_or(Duration::ZERO);
                (age >= grace).then(|| *entry.key())
            })
            .collect()
    }

    pub fn mark_disconnect_handled(&self, agent_id: AgentId) {
        if let Some(mut entry) = self.live.get_mut(&agent_id) {
            entry.disconnect_handled = true;
        }
    }

    // ── Failure policy ────────────────────────────────────────────────

    /// Record one explicit task failure. Returns the new counter and whether
    /// this failure pushed the agent into quarantine.
    pub async fn record_failure(
        &self,
        agent_id: AgentId,
        threshold: u32,
    ) -> Result<(u32, bool), StoreError> {
        let conn = self.db.conn.lock().await;
        let agent = get_agent(&conn, agent_id)?;
        let failures = agent.consecutive_failures + 1;
        let quarantined = failures >= threshold && agent.status != AgentStatus::Error;
        let status = if failures >= threshold {
            AgentStatus::Error
        } else {
            agent.status
        };
        conn.execute(
            "UPDATE agents SET consecutive_failures = ?1, status = ?2, updated_at = ?3 \
             WHERE id = ?4",
            rusqlite::params![failures, status.as_str(), ts(Utc::now()), agent_id.to_string()],
        )?;
        if quarantined {
            tracing::warn!(
                "agent {} quarantined after {} consecutive failures",
                agent_id,
                failures
            );
        }
        Ok((failures, quarantined))
    }

    /// Any completed task resets the consecutive-failure counter.
    pub async fn record_success(&self, agent_id: AgentId) -> Result<(), StoreError> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "UPDATE agents SET consecutive_failures = 0, updated_at = ?1 WHERE id = ?2",
            rusqlite::params![ts(Utc::now()), agent_id.to_string()],
        )?;
        Ok(())
    }

    /// Manual operator reset out of the `error` state.
    pub async fn reset_error(&self, agent_id: AgentId) -> Result<(), StoreError> {
        let conn = self.db.conn.lock().await;
        let agent = get_agent(&conn, agent_id)?;
        if agent.status != AgentStatus::Error {
            return Ok(());
        }
        conn.execute(
            "UPDATE agents SET status = 'active', consecutive_failures = 0, updated_at = ?1 \
             WHERE id = ?2",
            rusqlite::params![ts(Utc::now()), agent_id.to_string()],
        )?;
        tracing::info!("agent {} reset out of error state", agent_id);
        Ok(())
    }

    pub async fn set_status(&self, agent_id: AgentId, status: AgentStatus) -> Result<(), StoreError> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "UPDATE agents SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), ts(Utc::now()), agent_id.to_string()],
        )?;
        Ok(())
    }

    // ── Eligibility ───────────────────────────────────────────────────

    /// Whether `agent` may take work from `job` right now.
    pub fn eligible(&self, agent: &Agent, job: &Job, now: DateTime<Utc>, settings: &Settings) -> bool {
        if !agent.enabled || agent.status != AgentStatus::Active {
            return false;
        }
        if !self.is_connected(agent.id) {
            return false;
        }
        if settings.agent_scheduling_enabled && !schedule_allows(&agent.schedule, now) {
            return false;
        }
        if !agent.supports_hash_type(job.hash_type) {
            return false;
        }
        if !agent.binary_versions.is_empty() && !agent.has_binary(&job.binary_version) {
            return false;
        }
        // An agent that has reported devices must have one active.
        if !agent.devices.is_empty() && !agent.devices.iter().any(|d| d.active) {
            return false;
        }
        true
    }
}

/// Evaluate a weekly schedule against the wall clock in the agent's own
/// timezone. Windows whose start is later than their end cross midnight into
/// the following day.
pub fn schedule_allows(schedule: &AgentSchedule, now: DateTime<Utc>) -> bool {
    if !schedule.enabled {
        return true;
    }
    if schedule.windows.is_empty() {
        return false;
    }

    let tz: chrono_tz::Tz = match schedule.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!(
                "agent schedule has unknown timezone {:?}; evaluating in UTC",
                schedule.timezone
            );
            chrono_tz::UTC
        }
    };
    let local = now.with_timezone(&tz);
    let weekday = local.weekday();
    let time = local.time();

    for window in &schedule.windows {
        if window.start <= window.end {
            if window.day == weekday && time >= window.start && time < window.end {
                return true;
            }
        } else {
            // Crosses midnight: [day start, day+1 end).
            if window.day == weekday && time >= window.start {
                return true;
            }
            if window.day.succ() == weekday && time < window.end {
                return true;
            }
        }
    }
    false
}

// ── Row-mapping helpers ───────────────────────────────────────────────

fn get_agent(conn: &rusqlite::Connection, agent_id: AgentId) -> Result<Agent, StoreError> {
    let sql = format!("SELECT {AGENT_COLS} FROM agents WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let result = stmt
        .query_row(rusqlite::params![agent_id.to_string()], row_to_agent)
        .optional()?;
    match result {
        Some(agent) => agent,
        None => Err(StoreError::AgentNotFound { agent_id }),
    }
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Agent, StoreError>> {
    let id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let status_str: String = row.get(2)?;
    let enabled: i32 = row.get(3)?;
    let devices_json: String = row.get(4)?;
    let hash_types_json: String = row.get(5)?;
    let binaries_json: String = row.get(6)?;
    let schedule_json: String = row.get(7)?;
    let consecutive_failures: u32 = row.get(8)?;
    let created_str: String = row.get(9)?;
    let updated_str: String = row.get(10)?;

    Ok((|| -> Result<Agent, StoreError> {
        let id: AgentId = id_str
            .parse()
            .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?;
        let status: AgentStatus = status_str.parse().map_err(StoreError::Serialization)?;
        let devices = serde_json::from_str(&devices_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let supported_hash_types = serde_json::from_str(&hash_types_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let binary_versions = serde_json::from_str(&binaries_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let schedule = serde_json::from_str(&schedule_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(Agent {
            id,
            name,
            status,
            enabled: enabled != 0,
            devices,
            supported_hash_types,
            binary_versions,
            schedule,
            consecutive_failures,
            created_at: parse_ts(&created_str)?,
            updated_at: parse_ts(&updated_str)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone, Weekday};
    use crate::types::ScheduleWindow;

    fn window(day: Weekday, start: (u32, u32), end: (u32, u32)) -> ScheduleWindow {
        ScheduleWindow {
            day,
            start: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
        }
    }

    fn schedule(timezone: &str, windows: Vec<ScheduleWindow>) -> AgentSchedule {
        AgentSchedule {
            enabled: true,
            timezone: timezone.to_string(),
            windows,
        }
    }

    #[tokio::test]
    async fn register_and_reload_round_trips() {
        let registry = AgentRegistry::new(Database::open_in_memory().unwrap());
        let mut agent = Agent::new("rig-01");
        agent.supported_hash_types = vec![0, 1000];
        agent.binary_versions = vec!["7.0.0".to_string()];
        registry.register(&agent).await.unwrap();

        let loaded = registry.get(agent.id).await.unwrap();
        assert_eq!(loaded.name, "rig-01");
        assert_eq!(loaded.supported_hash_types, vec![0, 1000]);
        assert!(loaded.has_binary("7.0.0"));
    }

    #[tokio::test]
    async fn failure_threshold_quarantines_until_reset() {
        let registry = AgentRegistry::new(Database::open_in_memory().unwrap());
        let agent = Agent::new("flaky");
        registry.register(&agent).await.unwrap();

        let (count, quarantined) = registry.record_failure(agent.id, 3).await.unwrap();
        assert_eq!((count, quarantined), (1, false));
        registry.record_failure(agent.id, 3).await.unwrap();
        let (count, quarantined) = registry.record_failure(agent.id, 3).await.unwrap();
        assert_eq!((count, quarantined), (3, true));
        assert_eq!(registry.get(agent.id).await.unwrap().status, AgentStatus::Error);

        // Further failures do not re-announce quarantine.
        let (_, again) = registry.record_failure(agent.id, 3).await.unwrap();
        assert!(!again);

        registry.reset_error(agent.id).await.unwrap();
        let reset = registry.get(agent.id).await.unwrap();
        assert_eq!(reset.status, AgentStatus::Active);
        assert_eq!(reset.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn success_resets_failure_counter() {
        let registry = AgentRegistry::new(Database::open_in_memory().unwrap());
        let agent = Agent::new("recovers");
        registry.register(&agent).await.unwrap();

        registry.record_failure(agent.id, 5).await.unwrap();
        registry.record_failure(agent.id, 5).await.unwrap();
        registry.record_success(agent.id).await.unwrap();
        assert_eq!(registry.get(agent.id).await.unwrap().consecutive_failures, 0);
    }

    #[test]
    fn schedule_window_within_day() {
        // Wednesday 2026-01-07 10:00 UTC.
        let now = Utc.with_ymd_and_hms(2026, 1, 7, 10, 0, 0).unwrap();
        let sched = schedule("UTC", vec![window(Weekday::Wed, (9, 0), (17, 0))]);
        assert!(schedule_allows(&sched, now));

        let evening = Utc.with_ymd_and_hms(2026, 1, 7, 18, 0, 0).unwrap();
        assert!(!schedule_allows(&sched, evening));
    }

    #[test]
    fn schedule_window_crossing_midnight() {
        let sched = schedule("UTC", vec![window(Weekday::Wed, (22, 0), (6, 0))]);

        // Wednesday 23:00 — inside.
        let late = Utc.with_ymd_and_hms(2026, 1, 7, 23, 0, 0).unwrap();
        assert!(schedule_allows(&sched, late));
        // Thursday 05:00 — still inside the Wednesday window.
        let early = Utc.with_ymd_and_hms(2026, 1, 8, 5, 0, 0).unwrap();
        assert!(schedule_allows(&sched, early));
        // Thursday 07:00 — outside.
        let after = Utc.with_ymd_and_hms(2026, 1, 8, 7, 0, 0).unwrap();
        assert!(!schedule_allows(&sched, after));
    }

    #[test]
    fn schedule_evaluates_in_agent_timezone() {
        // 01:00 UTC on Thursday is 20:00 Wednesday in Chicago (UTC-5 in
        // January): the agent's Wednesday-evening window applies.
        let now = Utc.with_ymd_and_hms(2026, 1, 8, 1, 0, 0).unwrap();
        let sched = schedule(
            "America/Chicago",
            vec![window(Weekday::Wed, (18, 0), (22, 0))],
        );
        assert!(schedule_allows(&sched, now));

        let utc_sched = schedule("UTC", vec![window(Weekday::Wed, (18, 0), (22, 0))]);
        assert!(!schedule_allows(&utc_sched, now));
    }

    #[test]
    fn disabled_schedule_always_allows() {
        let mut sched = schedule("UTC", vec![]);
        sched.enabled = false;
        assert!(schedule_allows(&sched, Utc::now()));

        // Enabled with no windows never allows.
        sched.enabled = true;
        assert!(!schedule_allows(&sched, Utc::now()));
    }

    #[test]
    fn connection_index_tracks_disconnect_grace() {
        let registry = AgentRegistry::new(Database::open_in_memory().unwrap());
        let agent_id = AgentId::new();

        registry.mark_connected(agent_id);
        assert!(registry.is_connected(agent_id));
        assert!(registry.expired_disconnects(Duration::ZERO).is_empty());

        registry.mark_disconnected(agent_id);
        assert!(!registry.is_connected(agent_id));
        // Grace not yet elapsed.
        assert!(registry
            .expired_disconnects(Duration::from_secs(3600))
            .is_empty());
        // Zero grace: immediately expired.
        assert_eq!(registry.expired_disconnects(Duration::ZERO), vec![agent_id]);

        registry.mark_disconnect_handled(agent_id);
        assert!(registry.expired_disconnects(Duration::ZERO).is_empty());

        // Reconnect clears the disconnect state.
        registry.mark_connected(agent_id);
        assert!(registry.is_connected(agent_id));
    }
}
