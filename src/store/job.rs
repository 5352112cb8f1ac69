//! Job store
//!
//! Holds job intent plus the aggregates the progress reconciler writes.
//! Admission resolves file references, computes the effective keyspace and
//! decides rule splitting; after that the job's scheduling state only moves
//! through [`JobStore::transition`]'s fixed lattice. Nothing but the
//! reconciler calls [`JobStore::update_aggregates`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::benchmark::BenchmarkStore;
use super::db::{parse_ts, parse_ts_opt, ts, ts_opt, Database, OptionalExt};
use crate::config::Settings;
use crate::keyspace::{AttackPlan, IncrementRange, Mask};
use crate::rules::{RuleChunk, RuleSplitter};
use crate::services::{FileInfo, ServiceSet};
use crate::types::{
    AdmissionError, AttackSpec, HashlistId, Job, JobId, JobSpec, JobStatus, RuleChunkRef,
    StoreError,
};

const JOB_COLS: &str = "id, owner, hashlist_id, attack_mode, spec_json, plan_json, hash_type, \
     slow_hash, binary_version, priority, max_agents, allow_preempt, chunk_duration_secs, \
     effective_keyspace, unbounded, processed_keyspace, dispatched_keyspace, progress_percent, \
     status, uses_rule_splitting, rule_chunks_json, last_error, created_at, updated_at, \
     completed_at";

/// One reconciler-produced aggregate update.
#[derive(Debug, Clone, PartialEq)]
pub struct JobAggregate {
    pub job_id: JobId,
    pub processed: i64,
    pub dispatched: i64,
    pub percent: f64,
}

/// SQLite-backed store for jobs.
pub struct JobStore {
    db: Arc<Database>,
}

impl JobStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Admit a job: resolve its file references, compute the effective
    /// keyspace, decide rule splitting and persist it as `pending`. A job
    /// that fails admission never enters scheduling.
    pub async fn admit(
        &self,
        spec: JobSpec,
        services: &ServiceSet,
        benchmarks: &BenchmarkStore,
        splitter: &RuleSplitter,
        settings: &Settings,
    ) -> Result<Job, AdmissionError> {
        if spec.priority == 0 || spec.priority > settings.max_priority {
            return Err(AdmissionError::InvalidPriority {
                got: spec.priority,
                max: settings.max_priority,
            });
        }

        let info = services
            .hashlists
            .get_hashlist(spec.hashlist_id)
            .await
            .map_err(|e| AdmissionError::HashlistUnavailable(e.to_string()))?;

        let binary_version = services
            .binaries
            .resolve_version(&spec.binary_version)
            .await
            .map_err(|e| AdmissionError::UnresolvedFile(e.to_string()))?;

        let unresolved = |e: crate::types::ServiceError| AdmissionError::UnresolvedFile(e.to_string());

        // Resolve the plan; keep the rules file around for a possible split.
        let mut rule_file: Option<FileInfo> = None;
        let plan = match &spec.attack {
            AttackSpec::Dictionary {
                wordlist_id,
                rule_id,
            } => {
                let wordlist = services.files.wordlist(*wordlist_id).await.map_err(unresolved)?;
                let rule_count = match rule_id {
                    Some(id) => {
                        let rules = services.files.rules(*id).await.map_err(unresolved)?;
                        let count = rules.line_count;
                        rule_file = Some(rules);
                        count
                    }
                    None => 0,
                };
                AttackPlan::Dictionary {
                    wordlist_lines: wordlist.line_count,
                    rule_count,
                }
            }
            AttackSpec::Combination {
                left_wordlist_id,
                right_wordlist_id,
            } => {
                let left = services
                    .files
                    .wordlist(*left_wordlist_id)
                    .await
                    .map_err(unresolved)?;
                let right = services
                    .files
                    .wordlist(*right_wordlist_id)
                    .await
                    .map_err(unresolved)?;
                AttackPlan::Combination {
                    left_lines: left.line_count,
                    right_lines: right.line_count,
                }
            }
            AttackSpec::BruteForce {
                mask,
                custom_charsets,
                increment,
            } => {
                let mask = Mask::parse(mask, custom_charsets)
                    .map_err(|e| AdmissionError::InvalidMask(e.to_string()))?;
                let increment = increment
                    .map(|(min_len, max_len)| {
                        if min_len == 0 || min_len > max_len || max_len > mask.len() {
                            Err(AdmissionError::InvalidMask(format!(
                                "increment range {min_len}..={max_len} invalid for mask length {}",
                                mask.len()
                            )))
                        } else {
                            Ok(IncrementRange { min_len, max_len })
                        }
                    })
                    .transpose()?;
                AttackPlan::BruteForce { mask, increment }
            }
            AttackSpec::HybridWordlistMask {
                wordlist_id,
                mask,
                custom_charsets,
            } => {
                let wordlist = services.files.wordlist(*wordlist_id).await.map_err(unresolved)?;
                let mask = Mask::parse(mask, custom_charsets)
                    .map_err(|e| AdmissionError::InvalidMask(e.to_string()))?;
                AttackPlan::HybridWordlistMask {
                    wordlist_lines: wordlist.line_count,
                    mask,
                }
            }
            AttackSpec::HybridMaskWordlist {
                mask,
                custom_charsets,
                wordlist_id,
            } => {
                let wordlist = services.files.wordlist(*wordlist_id).await.map_err(unresolved)?;
                let mask = Mask::parse(mask, custom_charsets)
                    .map_err(|e| AdmissionError::InvalidMask(e.to_string()))?;
                AttackPlan::HybridMaskWordlist {
                    mask,
                    wordlist_lines: wordlist.line_count,
                }
            }
            AttackSpec::Association => {
                let map = services
                    .files
                    .association_map(spec.hashlist_id)
                    .await
                    .map_err(unresolved)?;
                if map.line_count != info.hash_count {
                    return Err(AdmissionError::AssociationMismatch {
                        map_lines: map.line_count,
                        hash_count: info.hash_count,
                    });
                }
                self.record_association_map(spec.hashlist_id, &map).await?;
                AttackPlan::Association {
                    hash_count: info.hash_count,
                }
            }
        };

        let rule_chunks = self
            .plan_rule_split(&spec, &plan, rule_file.as_ref(), &binary_version, info.hash_type, benchmarks, splitter, settings)
            .await?;

        let mut spec = spec;
        spec.binary_version = binary_version;
        let job = self.build_job(spec, plan, info.hash_type, info.slow_hash, rule_chunks)?;
        self.insert(&job).await?;

        tracing::info!(
            "admitted job {} ({} on hashlist {}, keyspace {}{})",
            job.id,
            job.attack_mode,
            job.hashlist_id,
            job.effective_keyspace,
            if job.unbounded { ", unbounded" } else { "" }
        );
        Ok(job)
    }

    /// Decide whether a dictionary job gets rule-split and produce its
    /// sub-files. Splitting activates when the estimated single-agent
    /// runtime exceeds `rule_split_threshold` target chunk durations.
    #[allow(clippy::too_many_arguments)]
    async fn plan_rule_split(
        &self,
        spec: &JobSpec,
        plan: &AttackPlan,
        rule_file: Option<&FileInfo>,
        binary_version: &str,
        hash_type: u32,
        benchmarks: &BenchmarkStore,
        splitter: &RuleSplitter,
        settings: &Settings,
    ) -> Result<Vec<RuleChunkRef>, AdmissionError> {
        let (rule_file, rule_count) = match (rule_file, plan) {
            (Some(file), AttackPlan::Dictionary { rule_count, .. }) => (file, *rule_count),
            _ => return Ok(Vec::new()),
        };
        if !settings.rule_split_enabled || rule_count < settings.rule_split_min_rules {
            return Ok(Vec::new());
        }

        let keyspace = plan.keyspace();
        let est_hps = benchmarks
            .mean_hps(plan.attack_mode(), hash_type, binary_version)
            .await?
            .unwrap_or(1_000_000)
            .max(1);
        let chunk_secs = spec
            .chunk_duration_secs
            .map(|s| Duration::from_secs(u64::from(s)))
            .unwrap_or(settings.default_chunk_duration)
            .as_secs()
            .max(1) as f64;
        let est_secs = keyspace.total as f64 / est_hps as f64;
        if est_secs <= settings.rule_split_threshold * chunk_secs {
            return Ok(Vec::new());
        }

        let wanted = (est_secs / chunk_secs).ceil() as u32;
        let chunk_count = wanted.clamp(2, settings.rule_split_max_chunks);
        let chunks = splitter.split(&rule_file.path, chunk_count).await?;
        self.record_rule_chunks(&chunks).await?;

        tracing::info!(
            "rule-splitting {} rules into {} chunks (estimated {:.0}s single-agent runtime)",
            rule_count,
            chunks.len(),
            est_secs
        );
        Ok(chunks.iter().map(RuleChunk::as_ref).collect())
    }

    /// Build the persisted job record from a resolved plan.
    pub fn build_job(
        &self,
        spec: JobSpec,
        plan: AttackPlan,
        hash_type: u32,
        slow_hash: bool,
        rule_chunks: Vec<RuleChunkRef>,
    ) -> Result<Job, AdmissionError> {
        let keyspace = plan.keyspace();
        if keyspace.total == 0 {
            return Err(AdmissionError::ZeroKeyspace);
        }
        let now = Utc::now();
        Ok(Job {
            id: JobId::new(),
            owner: spec.owner,
            hashlist_id: spec.hashlist_id,
            attack_mode: spec.attack.attack_mode(),
            spec: spec.attack,
            plan,
            hash_type,
            slow_hash,
            binary_version: spec.binary_version,
            priority: spec.priority,
            max_agents: spec.max_agents,
            allow_preempt: spec.allow_preempt,
            chunk_duration_secs: spec.chunk_duration_secs,
            effective_keyspace: keyspace.total,
            unbounded: keyspace.unbounded,
            processed_keyspace: 0,
            dispatched_keyspace: 0,
            progress_percent: 0.0,
            status: JobStatus::Pending,
            uses_rule_splitting: !rule_chunks.is_empty(),
            rule_chunks,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    pub async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let spec_json = serde_json::to_string(&job.spec)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let plan_json = serde_json::to_string(&job.plan)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let chunks_json = serde_json::to_string(&job.rule_chunks)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let conn = self.db.conn.lock().await;
        conn.execute(
            "INSERT INTO jobs (id, owner, hashlist_id, attack_mode, spec_json, plan_json, \
             hash_type, slow_hash, binary_version, priority, max_agents, allow_preempt, \
             chunk_duration_secs, effective_keyspace, unbounded, processed_keyspace, \
             dispatched_keyspace, progress_percent, status, uses_rule_splitting, \
             rule_chunks_json, last_error, created_at, updated_at, completed_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,\
             ?21,?22,?23,?24,?25)",
            rusqlite::params![
                job.id.to_string(),
                job.owner,
                job.hashlist_id.to_string(),
                job.attack_mode.engine_mode(),
                spec_json,
                plan_json,
                job.hash_type,
                job.slow_hash as i32,
                job.binary_version,
                job.priority,
                job.max_agents,
                job.allow_preempt as i32,
                job.chunk_duration_secs,
                job.effective_keyspace,
                job.unbounded as i32,
                job.processed_keyspace,
                job.dispatched_keyspace,
                job.progress_percent,
                job.status.as_str(),
                job.uses_rule_splitting as i32,
                chunks_json,
                job.last_error,
                ts(job.created_at),
                ts(job.updated_at),
                ts_opt(job.completed_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get(&self, job_id: JobId) -> Result<Job, StoreError> {
        let conn = self.db.conn.lock().await;
        get_job(&conn, job_id)
    }

    pub async fn list(&self, status_filter: Option<JobStatus>) -> Result<Vec<Job>, StoreError> {
        let conn = self.db.conn.lock().await;
        let (sql, params): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = match status_filter {
            Some(status) => (
                format!("SELECT {JOB_COLS} FROM jobs WHERE status = ?1 ORDER BY created_at"),
                vec![Box::new(status.as_str().to_string())],
            ),
            None => (
                format!("SELECT {JOB_COLS} FROM jobs ORDER BY created_at"),
                vec![],
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), row_to_job)?;
        collect_jobs(rows)
    }

    /// Schedulable jobs in scheduling order: priority descending, then
    /// created-at ascending.
    pub async fn candidates(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.db.conn.lock().await;
        let sql = format!(
            "SELECT {JOB_COLS} FROM jobs WHERE status IN ('pending', 'running') \
             ORDER BY priority DESC, created_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_job)?;
        collect_jobs(rows)
    }

    /// Jobs the reconciler looks at: everything non-terminal plus failures
    /// and recent completions, so a last progress flush still lands.
    pub async fn reconcilable(&self, completed_window: Duration) -> Result<Vec<Job>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(completed_window).unwrap_or(chrono::Duration::zero());
        let conn = self.db.conn.lock().await;
        let sql = format!(
            "SELECT {JOB_COLS} FROM jobs WHERE status IN ('pending', 'running', 'paused', 'failed') \
             OR (status = 'completed' AND completed_at > ?1) ORDER BY created_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![ts(cutoff)], row_to_job)?;
        collect_jobs(rows)
    }

    /// Move a job through the status lattice. Idempotent for same-status
    /// transitions; anything the lattice forbids is an error.
    pub async fn transition(&self, job_id: JobId, to: JobStatus) -> Result<Job, StoreError> {
        let conn = self.db.conn.lock().await;
        let job = get_job(&conn, job_id)?;
        if job.status == to {
            return Ok(job);
        }
        if !job.status.can_transition(to) {
            return Err(StoreError::InvalidTransition {
                job_id,
                from: job.status.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        let completed_at = if to.is_terminal() { Some(now) } else { None };
        conn.execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2, completed_at = ?3 WHERE id = ?4",
            rusqlite::params![to.as_str(), ts(now), ts_opt(completed_at), job_id.to_string()],
        )?;
        tracing::info!("job {} transitioned {} → {}", job_id, job.status, to);
        get_job(&conn, job_id)
    }

    pub async fn set_last_error(&self, job_id: JobId, message: &str) -> Result<(), StoreError> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "UPDATE jobs SET last_error = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![message, ts(Utc::now()), job_id.to_string()],
        )?;
        Ok(())
    }

    /// Write reconciled aggregates in one transaction. The progress
    /// reconciler is the only caller; scheduler and transport never touch
    /// these columns.
    pub async fn update_aggregates(&self, aggregates: &[JobAggregate]) -> Result<(), StoreError> {
        if aggregates.is_empty() {
            return Ok(());
        }
        let mut conn = self.db.conn.lock().await;
        let tx = conn.transaction()?;
        let now = ts(Utc::now());
        for agg in aggregates {
            tx.execute(
                "UPDATE jobs SET processed_keyspace = ?1, dispatched_keyspace = ?2, \
                 progress_percent = ?3, updated_at = ?4 WHERE id = ?5",
                rusqlite::params![
                    agg.processed,
                    agg.dispatched,
                    agg.percent,
                    now,
                    agg.job_id.to_string()
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn record_rule_chunks(&self, chunks: &[RuleChunk]) -> Result<(), StoreError> {
        let conn = self.db.conn.lock().await;
        let now = ts(Utc::now());
        for chunk in chunks {
            conn.execute(
                "INSERT OR IGNORE INTO rule_chunks (chunk_id, path, line_count, created_at) \
                 VALUES (?1,?2,?3,?4)",
                rusqlite::params![
                    chunk.id,
                    chunk.path.display().to_string(),
                    chunk.line_count,
                    now
                ],
            )?;
        }
        Ok(())
    }

    async fn record_association_map(
        &self,
        hashlist_id: HashlistId,
        map: &FileInfo,
    ) -> Result<(), StoreError> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO association_maps (hashlist_id, path, line_count, created_at) \
             VALUES (?1,?2,?3,?4)",
            rusqlite::params![
                hashlist_id.to_string(),
                map.path.display().to_string(),
                map.line_count,
                ts(Utc::now())
            ],
        )?;
        Ok(())
    }
}

// ── Row-mapping helpers ───────────────────────────────────────────────

fn get_job(conn: &rusqlite::Connection, job_id: JobId) -> Result<Job, StoreError> {
    let sql = format!("SELECT {JOB_COLS} FROM jobs WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let result = stmt
        .query_row(rusqlite::params![job_id.to_string()], row_to_job)
        .optional()?;
    match result {
        Some(job) => job,
        None => Err(StoreError::JobNotFound { job_id }),
    }
}

fn collect_jobs(
    rows: impl Iterator<Item = rusqlite::Result<Result<Job, StoreError>>>,
) -> Result<Vec<Job>, StoreError> {
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row??);
    }
    Ok(jobs)
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Job, StoreError>> {
    let id_str: String = row.get(0)?;
    let owner: String = row.get(1)?;
    let hashlist_str: String = row.get(2)?;
    let attack_mode_raw: u8 = row.get(3)?;
    let spec_json: String = row.get(4)?;
    let plan_json: String = row.get(5)?;
    let hash_type: u32 = row.get(6)?;
    let slow_hash: i32 = row.get(7)?;
    let binary_version: String = row.get(8)?;
    let priority: u8 = row.get(9)?;
    let max_agents: u32 = row.get(10)?;
    let allow_preempt: i32 = row.get(11)?;
    let chunk_duration_secs: Option<u32> = row.get(12)?;
    let effective_keyspace: i64 = row.get(13)?;
    let unbounded: i32 = row.get(14)?;
    let processed_keyspace: i64 = row.get(15)?;
    let dispatched_keyspace: i64 = row.get(16)?;
    let progress_percent: f64 = row.get(17)?;
    let status_str: String = row.get(18)?;
    let uses_rule_splitting: i32 = row.get(19)?;
    let chunks_json: String = row.get(20)?;
    let last_error: Option<String> = row.get(21)?;
    let created_str: String = row.get(22)?;
    let updated_str: String = row.get(23)?;
    let completed_str: Option<String> = row.get(24)?;

    Ok((|| -> Result<Job, StoreError> {
        let id: JobId = id_str
            .parse()
            .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?;
        let hashlist_id: HashlistId = hashlist_str
            .parse()
            .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?;
        let attack_mode = crate::types::AttackMode::from_engine_mode(attack_mode_raw)
            .ok_or_else(|| {
                StoreError::Serialization(format!("unknown attack mode {attack_mode_raw}"))
            })?;
        let spec: AttackSpec = serde_json::from_str(&spec_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let plan: AttackPlan = serde_json::from_str(&plan_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let rule_chunks: Vec<RuleChunkRef> = serde_json::from_str(&chunks_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let status: JobStatus = status_str.parse().map_err(StoreError::Serialization)?;

        Ok(Job {
            id,
            owner,
            hashlist_id,
            attack_mode,
            spec,
            plan,
            hash_type,
            slow_hash: slow_hash != 0,
            binary_version,
            priority,
            max_agents,
            allow_preempt: allow_preempt != 0,
            chunk_duration_secs,
            effective_keyspace,
            unbounded: unbounded != 0,
            processed_keyspace,
            dispatched_keyspace,
            progress_percent,
            status,
            uses_rule_splitting: uses_rule_splitting != 0,
            rule_chunks,
            last_error,
            created_at: parse_ts(&created_str)?,
            updated_at: parse_ts(&updated_str)?,
            completed_at: parse_ts_opt(completed_str)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{FileInfo, HashlistInfo, ServiceSet};
    use crate::types::FileId;
    use std::io::Write;

    fn dictionary_spec(wordlist_id: FileId, hashlist_id: HashlistId) -> JobSpec {
        JobSpec {
            owner: "tester".to_string(),
            hashlist_id,
            attack: AttackSpec::Dictionary {
                wordlist_id,
                rule_id: None,
            },
            binary_version: "default".to_string(),
            priority: 5,
            max_agents: 0,
            allow_preempt: false,
            chunk_duration_secs: None,
        }
    }

    struct AdmissionFixture {
        services: ServiceSet,
        files: std::sync::Arc<crate::services::InMemoryFiles>,
        hashlist_id: HashlistId,
        tempdir: tempfile::TempDir,
    }

    fn fixture() -> AdmissionFixture {
        let (services, hashlists, files, _notifier) = ServiceSet::in_memory();
        let hashlist_id = HashlistId::new();
        hashlists.insert(HashlistInfo {
            id: hashlist_id,
            hash_count: 1_000,
            uncracked_count: 1_000,
            hash_type: 0,
            mixed_work_factors: false,
            slow_hash: false,
        });
        AdmissionFixture {
            services,
            files,
            hashlist_id,
            tempdir: tempfile::tempdir().unwrap(),
        }
    }

    fn write_lines(dir: &std::path::Path, name: &str, lines: usize) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        for i in 0..lines {
            writeln!(f, "line{}", i).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn admit_resolves_keyspace_and_inserts_pending() {
        let fx = fixture();
        let db = Database::open_in_memory().unwrap();
        let store = JobStore::new(db.clone());
        let benchmarks = BenchmarkStore::new(db.clone());
        let splitter = RuleSplitter::new(fx.tempdir.path().join("chunks"));

        let wordlist_id = FileId::new();
        fx.files.insert_wordlist(FileInfo {
            id: wordlist_id,
            path: write_lines(fx.tempdir.path(), "words.txt", 100),
            line_count: 1_000_000,
        });

        let job = store
            .admit(
                dictionary_spec(wordlist_id, fx.hashlist_id),
                &fx.services,
                &benchmarks,
                &splitter,
                &Settings::default(),
            )
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.effective_keyspace, 1_000_000);
        assert!(!job.uses_rule_splitting);
        assert_eq!(job.binary_version, "7.0.0");

        let loaded = store.get(job.id).await.unwrap();
        assert_eq!(loaded.effective_keyspace, 1_000_000);
        assert_eq!(loaded.owner, "tester");
    }

    #[tokio::test]
    async fn admit_rejects_bad_priority_and_unknown_files() {
        let fx = fixture();
        let db = Database::open_in_memory().unwrap();
        let store = JobStore::new(db.clone());
        let benchmarks = BenchmarkStore::new(db.clone());
        let splitter = RuleSplitter::new(fx.tempdir.path().join("chunks"));
        let settings = Settings::default();

        let mut spec = dictionary_spec(FileId::new(), fx.hashlist_id);
        spec.priority = 99;
        assert!(matches!(
            store
                .admit(spec, &fx.services, &benchmarks, &splitter, &settings)
                .await,
            Err(AdmissionError::InvalidPriority { .. })
        ));

        // Unresolved wordlist reference.
        let spec = dictionary_spec(FileId::new(), fx.hashlist_id);
        assert!(matches!(
            store
                .admit(spec, &fx.services, &benchmarks, &splitter, &settings)
                .await,
            Err(AdmissionError::UnresolvedFile(_))
        ));
    }

    #[tokio::test]
    async fn admit_rejects_association_line_count_mismatch() {
        let fx = fixture();
        let db = Database::open_in_memory().unwrap();
        let store = JobStore::new(db.clone());
        let benchmarks = BenchmarkStore::new(db.clone());
        let splitter = RuleSplitter::new(fx.tempdir.path().join("chunks"));

        fx.files.insert_association_map(
            fx.hashlist_id,
            FileInfo {
                id: FileId::new(),
                path: write_lines(fx.tempdir.path(), "assoc.txt", 999),
                line_count: 999, // hashlist has 1,000 hashes
            },
        );

        let mut spec = dictionary_spec(FileId::new(), fx.hashlist_id);
        spec.attack = AttackSpec::Association;
        assert!(matches!(
            store
                .admit(spec, &fx.services, &benchmarks, &splitter, &Settings::default())
                .await,
            Err(AdmissionError::AssociationMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn admit_splits_large_rule_jobs() {
        let fx = fixture();
        let db = Database::open_in_memory().unwrap();
        let store = JobStore::new(db.clone());
        let benchmarks = BenchmarkStore::new(db.clone());
        let splitter = RuleSplitter::new(fx.tempdir.path().join("chunks"));
        let mut settings = Settings::default();
        settings.rule_split_max_chunks = 5;

        let wordlist_id = FileId::new();
        let rule_id = FileId::new();
        fx.files.insert_wordlist(FileInfo {
            id: wordlist_id,
            path: write_lines(fx.tempdir.path(), "words.txt", 10),
            line_count: 1_000_000,
        });
        fx.files.insert_rules(FileInfo {
            id: rule_id,
            path: write_lines(fx.tempdir.path(), "big.rule", 50_000),
            line_count: 50_000,
        });

        let mut spec = dictionary_spec(wordlist_id, fx.hashlist_id);
        spec.attack = AttackSpec::Dictionary {
            wordlist_id,
            rule_id: Some(rule_id),
        };
        // 1M words × 50k rules at the 1 MH/s fallback estimate is far beyond
        // the split threshold.
        let job = store
            .admit(spec, &fx.services, &benchmarks, &splitter, &settings)
            .await
            .unwrap();

        assert!(job.uses_rule_splitting);
        assert_eq!(job.rule_chunks.len(), 5);
        assert_eq!(job.total_rule_lines(), 50_000);
        assert_eq!(job.effective_keyspace, 1_000_000 * 50_000);
        let sizes: Vec<i64> = job.rule_chunks.iter().map(|c| c.line_count).collect();
        let min = sizes.iter().min().unwrap();
        let max = sizes.iter().max().unwrap();
        assert!(max - min <= 1);
    }

    #[tokio::test]
    async fn small_rule_sets_are_not_split() {
        let fx = fixture();
        let db = Database::open_in_memory().unwrap();
        let store = JobStore::new(db.clone());
        let benchmarks = BenchmarkStore::new(db.clone());
        let splitter = RuleSplitter::new(fx.tempdir.path().join("chunks"));

        let wordlist_id = FileId::new();
        let rule_id = FileId::new();
        fx.files.insert_wordlist(FileInfo {
            id: wordlist_id,
            path: write_lines(fx.tempdir.path(), "words.txt", 10),
            line_count: 1_000,
        });
        fx.files.insert_rules(FileInfo {
            id: rule_id,
            path: write_lines(fx.tempdir.path(), "small.rule", 64),
            line_count: 64,
        });

        let mut spec = dictionary_spec(wordlist_id, fx.hashlist_id);
        spec.attack = AttackSpec::Dictionary {
            wordlist_id,
            rule_id: Some(rule_id),
        };
        let job = store
            .admit(
                spec,
                &fx.services,
                &benchmarks,
                &splitter,
                &Settings::default(),
            )
            .await
            .unwrap();
        assert!(!job.uses_rule_splitting);
        assert_eq!(job.effective_keyspace, 64_000);
    }

    #[tokio::test]
    async fn transition_enforces_lattice() {
        let db = Database::open_in_memory().unwrap();
        let store = JobStore::new(db.clone());
        let plan = AttackPlan::Dictionary {
            wordlist_lines: 10,
            rule_count: 0,
        };
        let spec = dictionary_spec(FileId::new(), HashlistId::new());
        let job = store.build_job(spec, plan, 0, false, Vec::new()).unwrap();
        store.insert(&job).await.unwrap();

        store.transition(job.id, JobStatus::Running).await.unwrap();
        store.transition(job.id, JobStatus::Paused).await.unwrap();
        store.transition(job.id, JobStatus::Running).await.unwrap();
        let done = store.transition(job.id, JobStatus::Completed).await.unwrap();
        assert!(done.completed_at.is_some());

        // Terminal absorbs: same-status is a no-op, anything else errors.
        store.transition(job.id, JobStatus::Completed).await.unwrap();
        assert!(matches!(
            store.transition(job.id, JobStatus::Running).await,
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn candidates_are_priority_then_fifo_ordered() {
        let db = Database::open_in_memory().unwrap();
        let store = JobStore::new(db.clone());
        let plan = AttackPlan::Dictionary {
            wordlist_lines: 10,
            rule_count: 0,
        };

        let mut ids = Vec::new();
        for priority in [3u8, 9, 3] {
            let mut spec = dictionary_spec(FileId::new(), HashlistId::new());
            spec.priority = priority;
            let job = store
                .build_job(spec, plan.clone(), 0, false, Vec::new())
                .unwrap();
            store.insert(&job).await.unwrap();
            ids.push(job.id);
            // Distinct created_at for deterministic FIFO order.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let candidates = store.candidates().await.unwrap();
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].id, ids[1]); // priority 9 first
        assert_eq!(candidates[1].id, ids[0]); // then the older priority-3 job
        assert_eq!(candidates[2].id, ids[2]);
    }

    #[tokio::test]
    async fn update_aggregates_is_batched() {
        let db = Database::open_in_memory().unwrap();
        let store = JobStore::new(db.clone());
        let plan = AttackPlan::Dictionary {
            wordlist_lines: 1_000,
            rule_count: 0,
        };
        let job_a = store
            .build_job(dictionary_spec(FileId::new(), HashlistId::new()), plan.clone(), 0, false, Vec::new())
            .unwrap();
        let job_b = store
            .build_job(dictionary_spec(FileId::new(), HashlistId::new()), plan, 0, false, Vec::new())
            .unwrap();
        store.insert(&job_a).await.unwrap();
        store.insert(&job_b).await.unwrap();

        store
            .update_aggregates(&[
                JobAggregate {
                    job_id: job_a.id,
                    processed: 100,
                    dispatched: 500,
                    percent: 10.0,
                },
                JobAggregate {
                    job_id: job_b.id,
                    processed: 1_000,
                    dispatched: 1_000,
                    percent: 100.0,
                },
            ])
            .await
            .unwrap();

        let a = store.get(job_a.id).await.unwrap();
        assert_eq!((a.processed_keyspace, a.dispatched_keyspace), (100, 500));
        let b = store.get(job_b.id).await.unwrap();
        assert_eq!(b.progress_percent, 100.0);
    }
}
