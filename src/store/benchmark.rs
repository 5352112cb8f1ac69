//! Benchmark cache
//!
//! Per (agent, attack mode, hash type, binary) speed estimates with a TTL.
//! Missing entries block scheduling for that agent×attack pair only and
//! trigger a bounded speedtest task; stale entries may keep scheduling alive
//! while a refresh probe runs. In-flight probes are tracked in memory so a
//! lost benchmark result re-probes after its timeout instead of wedging the
//! pair forever.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::db::{parse_ts, ts, Database, OptionalExt};
use crate::types::{AgentId, AttackMode, StoreError};

/// Cache key: one agent running one attack shape on one binary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BenchmarkKey {
    pub agent_id: AgentId,
    pub attack_mode: AttackMode,
    pub hash_type: u32,
    pub binary_version: String,
}

/// Lookup result, classified against the TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchmarkStatus {
    Fresh { hashes_per_second: u64 },
    Stale { hashes_per_second: u64 },
    Missing,
}

/// SQLite-backed benchmark cache with in-memory probe tracking.
pub struct BenchmarkStore {
    db: Arc<Database>,
    probes: DashMap<BenchmarkKey, DateTime<Utc>>,
}

impl BenchmarkStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            probes: DashMap::new(),
        }
    }

    /// Look up the cached speed for `key`, classified against `ttl`.
    pub async fn lookup(
        &self,
        key: &BenchmarkKey,
        ttl: Duration,
    ) -> Result<BenchmarkStatus, StoreError> {
        let conn = self.db.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT hashes_per_second, captured_at FROM benchmarks \
                 WHERE agent_id = ?1 AND attack_mode = ?2 AND hash_type = ?3 \
                 AND binary_version = ?4",
                rusqlite::params![
                    key.agent_id.to_string(),
                    key.attack_mode.engine_mode(),
                    key.hash_type,
                    key.binary_version
                ],
                |row| {
                    let hps: i64 = row.get(0)?;
                    let captured: String = row.get(1)?;
                    Ok((hps, captured))
                },
            )
            .optional()?;

        match row {
            None => Ok(BenchmarkStatus::Missing),
            Some((hps, captured)) => {
                let captured = parse_ts(&captured)?;
                let age = (Utc::now() - captured)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                let hashes_per_second = hps.max(0) as u64;
                if age > ttl {
                    Ok(BenchmarkStatus::Stale { hashes_per_second })
                } else {
                    Ok(BenchmarkStatus::Fresh { hashes_per_second })
                }
            }
        }
    }

    /// Record a benchmark result and release any in-flight probe.
    pub async fn record(&self, key: &BenchmarkKey, hashes_per_second: u64) -> Result<(), StoreError> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO benchmarks \
             (agent_id, attack_mode, hash_type, binary_version, hashes_per_second, captured_at) \
             VALUES (?1,?2,?3,?4,?5,?6)",
            rusqlite::params![
                key.agent_id.to_string(),
                key.attack_mode.engine_mode(),
                key.hash_type,
                key.binary_version,
                hashes_per_second as i64,
                ts(Utc::now())
            ],
        )?;
        drop(conn);
        self.probes.remove(key);
        Ok(())
    }

    /// Whether a speedtest should be sent for `key` now. Marks the probe as
    /// in flight; a probe older than `timeout` is considered lost and
    /// re-armed.
    pub fn begin_probe(&self, key: &BenchmarkKey, timeout: Duration) -> bool {
        let now = Utc::now();
        match self.probes.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let age = (now - *entry.get()).to_std().unwrap_or(Duration::ZERO);
                if age > timeout {
                    *entry.get_mut() = now;
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Mean cached speed across agents for an attack shape; used by
    /// admission to estimate single-agent runtime.
    pub async fn mean_hps(
        &self,
        attack_mode: AttackMode,
        hash_type: u32,
        binary_version: &str,
    ) -> Result<Option<u64>, StoreError> {
        let conn = self.db.conn.lock().await;
        let mean: Option<f64> = conn.query_row(
            "SELECT AVG(hashes_per_second) FROM benchmarks \
             WHERE attack_mode = ?1 AND hash_type = ?2 AND binary_version = ?3",
            rusqlite::params![attack_mode.engine_mode(), hash_type, binary_version],
            |row| row.get(0),
        )?;
        Ok(mean.map(|m| m.max(0.0) as u64))
    }
}
