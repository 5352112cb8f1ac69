//! Task store
//!
//! Durable record of every dispatched keyspace slice. All mutations run in a
//! single lock scope on the shared connection; per-task updates are monotonic
//! and sequence-guarded, terminations are idempotent, and partial slices are
//! settled by truncating the stored range to the processed prefix and
//! rematerializing the remainder as a new pending task. That keeps per-job
//! ranges disjoint, so coverage sums can never double-count.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::db::{parse_ts, parse_ts_opt, ts, ts_opt, Database, OptionalExt};
use crate::types::{
    AgentId, Job, JobId, JobStatus, StoreError, Task, TaskId, TaskStatus, TaskSummary,
};

const TASK_COLS: &str = "id, job_id, agent_id, keyspace_start, keyspace_end, effective_start, \
     effective_end, keyspace_processed, effective_processed, rule_chunk_index, status, \
     retry_count, last_seq, cancel_reason, created_at, started_at, completed_at, last_progress_at";

/// Result of applying one progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    Applied,
    /// Sequence number not greater than the stored one.
    Duplicate,
    /// Processed count went backwards; dropped.
    Regression,
    /// Task is terminal or reclaimed; late report dropped.
    Inactive,
}

/// Result of settling a partially processed slice.
#[derive(Debug, Clone)]
pub enum RequeueOutcome {
    /// Nothing to do: task already settled, or no residual remained.
    Settled,
    /// Residual range rematerialized as this new pending task.
    Requeued(Task),
    /// Residual would exceed the retry budget; no replacement was created.
    RetriesExhausted,
}

/// SQLite-backed store for dispatched keyspace slices.
pub struct TaskStore {
    db: Arc<Database>,
}

impl TaskStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub(crate) fn db_handle(&self) -> Arc<Database> {
        self.db.clone()
    }

    /// Insert a task record (pending or pre-assigned).
    pub async fn create(&self, task: &Task) -> Result<(), StoreError> {
        let conn = self.db.conn.lock().await;
        insert_task(&conn, task)
    }

    pub async fn get(&self, task_id: TaskId) -> Result<Task, StoreError> {
        let conn = self.db.conn.lock().await;
        get_task(&conn, task_id)
    }

    pub async fn tasks_for_job(&self, job_id: JobId) -> Result<Vec<Task>, StoreError> {
        let conn = self.db.conn.lock().await;
        let sql = format!(
            "SELECT {TASK_COLS} FROM tasks WHERE job_id = ?1 ORDER BY created_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![job_id.to_string()], row_to_task)?;
        collect_tasks(rows)
    }

    /// All slices currently held by agents.
    pub async fn active_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let conn = self.db.conn.lock().await;
        let sql = format!(
            "SELECT {TASK_COLS} FROM tasks WHERE status IN ('assigned', 'running') \
             ORDER BY created_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_task)?;
        collect_tasks(rows)
    }

    pub async fn active_tasks_for_agent(&self, agent_id: AgentId) -> Result<Vec<Task>, StoreError> {
        let conn = self.db.conn.lock().await;
        let sql = format!(
            "SELECT {TASK_COLS} FROM tasks \
             WHERE agent_id = ?1 AND status IN ('assigned', 'running') ORDER BY created_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![agent_id.to_string()], row_to_task)?;
        collect_tasks(rows)
    }

    pub async fn active_count_for_job(&self, job_id: JobId) -> Result<i64, StoreError> {
        let conn = self.db.conn.lock().await;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE job_id = ?1 AND status IN ('assigned', 'running')",
            rusqlite::params![job_id.to_string()],
            |row| row.get(0),
        )?)
    }

    pub async fn active_count_for_agent(&self, agent_id: AgentId) -> Result<i64, StoreError> {
        let conn = self.db.conn.lock().await;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE agent_id = ?1 AND status IN ('assigned', 'running')",
            rusqlite::params![agent_id.to_string()],
            |row| row.get(0),
        )?)
    }

    /// Count of slices that still need work or are in flight.
    pub async fn open_count_for_job(&self, job_id: JobId) -> Result<i64, StoreError> {
        let conn = self.db.conn.lock().await;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE job_id = ?1 \
             AND status IN ('pending', 'assigned', 'running')",
            rusqlite::params![job_id.to_string()],
            |row| row.get(0),
        )?)
    }

    pub async fn pending_count_for_job(&self, job_id: JobId) -> Result<i64, StoreError> {
        let conn = self.db.conn.lock().await;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE job_id = ?1 AND status = 'pending'",
            rusqlite::params![job_id.to_string()],
            |row| row.get(0),
        )?)
    }

    /// High-water mark of dispatched coverage on the raw keyspace axis.
    pub async fn dispatch_cursor(&self, job_id: JobId) -> Result<i64, StoreError> {
        let conn = self.db.conn.lock().await;
        Ok(conn.query_row(
            "SELECT COALESCE(MAX(keyspace_end), 0) FROM tasks WHERE job_id = ?1",
            rusqlite::params![job_id.to_string()],
            |row| row.get(0),
        )?)
    }

    /// Number of rule chunks already materialized as tasks.
    pub async fn rule_chunks_dispatched(&self, job_id: JobId) -> Result<i64, StoreError> {
        let conn = self.db.conn.lock().await;
        Ok(conn.query_row(
            "SELECT COALESCE(MAX(rule_chunk_index) + 1, 0) FROM tasks \
             WHERE job_id = ?1 AND rule_chunk_index IS NOT NULL",
            rusqlite::params![job_id.to_string()],
            |row| row.get(0),
        )?)
    }

    /// Active slices of running jobs joined with the owning job's priority,
    /// lowest priority first — the preemption victim order.
    pub async fn preemption_victims(&self) -> Result<Vec<(Task, u8)>, StoreError> {
        let conn = self.db.conn.lock().await;
        let sql = format!(
            "SELECT {}, j.priority FROM tasks t \
             JOIN jobs j ON j.id = t.job_id \
             WHERE t.status IN ('assigned', 'running') AND j.status = 'running' \
             ORDER BY j.priority ASC, t.created_at ASC",
            TASK_COLS
                .split(", ")
                .map(|c| format!("t.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let task = row_to_task(row)?;
            let priority: u8 = row.get(18)?;
            Ok((task, priority))
        })?;

        let mut victims = Vec::new();
        for row in rows {
            let (task, priority) = row?;
            victims.push((task?, priority));
        }
        Ok(victims)
    }

    /// Reserve the next contiguous unassigned range of `job` for `agent`.
    ///
    /// Pending residual slices are handed out first (oldest first); after
    /// that a fresh range is carved at the dispatch cursor — one rule chunk
    /// per task for rule-split jobs, `size_hint` candidates otherwise.
    /// Returns `None` when the job has nothing left to dispatch.
    pub async fn claim(
        &self,
        job: &Job,
        size_hint: i64,
        agent_id: AgentId,
    ) -> Result<Option<Task>, StoreError> {
        let conn = self.db.conn.lock().await;
        let now = Utc::now();

        // 1) Re-dispatch a pending slice if one exists.
        let sql = format!(
            "SELECT {TASK_COLS} FROM tasks \
             WHERE job_id = ?1 AND status = 'pending' ORDER BY created_at LIMIT 1"
        );
        let pending = {
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_row(rusqlite::params![job.id.to_string()], row_to_task)
                .optional()?
        };
        if let Some(task) = pending {
            let mut task = task?;
            conn.execute(
                "UPDATE tasks SET agent_id = ?1, status = 'assigned', started_at = ?2 \
                 WHERE id = ?3",
                rusqlite::params![agent_id.to_string(), ts(now), task.id.to_string()],
            )?;
            task.agent_id = Some(agent_id);
            task.status = TaskStatus::Assigned;
            task.started_at = Some(now);
            return Ok(Some(task));
        }

        // 2) Carve a fresh range.
        let task = if job.uses_rule_splitting {
            let next_index: i64 = conn.query_row(
                "SELECT COALESCE(MAX(rule_chunk_index) + 1, 0) FROM tasks \
                 WHERE job_id = ?1 AND rule_chunk_index IS NOT NULL",
                rusqlite::params![job.id.to_string()],
                |row| row.get(0),
            )?;
            if next_index as usize >= job.rule_chunks.len() {
                return Ok(None);
            }
            let wordlist_lines = job
                .plan
                .wordlist_lines()
                .unwrap_or(job.effective_keyspace);
            let chunk = &job.rule_chunks[next_index as usize];
            let preceding_lines: i64 = job
                .rule_chunks
                .iter()
                .take(next_index as usize)
                .map(|c| c.line_count)
                .sum();
            let effective_start = wordlist_lines.saturating_mul(preceding_lines);
            let effective_end =
                effective_start.saturating_add(wordlist_lines.saturating_mul(chunk.line_count));

            let mut task = Task::pending(job.id, 0, wordlist_lines);
            task.rule_chunk_index = Some(chunk.index);
            task.effective_start = Some(effective_start);
            task.effective_end = Some(effective_end);
            task
        } else {
            let cursor: i64 = conn.query_row(
                "SELECT COALESCE(MAX(keyspace_end), 0) FROM tasks WHERE job_id = ?1",
                rusqlite::params![job.id.to_string()],
                |row| row.get(0),
            )?;
            match job.plan.next_slice(cursor, size_hint) {
                None => return Ok(None),
                Some(range) => Task::pending(job.id, range.start, range.end),
            }
        };

        let mut task = task;
        task.agent_id = Some(agent_id);
        task.status = TaskStatus::Assigned;
        task.started_at = Some(now);
        insert_task(&conn, &task)?;
        Ok(Some(task))
    }

    /// Apply one progress report. Updates are monotonic per task: stale
    /// sequence numbers and regressions are dropped (and logged), reports
    /// for settled tasks are ignored.
    pub async fn apply_progress(
        &self,
        task_id: TaskId,
        seq: i64,
        keyspace_processed: i64,
        effective_processed: i64,
        reported_at: DateTime<Utc>,
    ) -> Result<ProgressOutcome, StoreError> {
        let conn = self.db.conn.lock().await;
        let task = get_task(&conn, task_id)?;

        if !task.is_active() {
            tracing::debug!(
                "dropping progress for {} task {}",
                task.status,
                task_id
            );
            return Ok(ProgressOutcome::Inactive);
        }
        if seq <= task.last_seq {
            tracing::debug!(
                "dropping duplicate progress seq {} (stored {}) for task {}",
                seq,
                task.last_seq,
                task_id
            );
            return Ok(ProgressOutcome::Duplicate);
        }
        if keyspace_processed < task.keyspace_processed
            || effective_processed < task.effective_processed
        {
            tracing::warn!(
                "dropping progress regression for task {}: {} < {}",
                task_id,
                keyspace_processed,
                task.keyspace_processed
            );
            return Ok(ProgressOutcome::Regression);
        }

        let range_len = task.range_len();
        let mut processed = keyspace_processed;
        if processed > range_len {
            tracing::warn!(
                "task {} reported {} processed for a range of {}; clamping",
                task_id,
                processed,
                range_len
            );
            processed = range_len;
        }
        let mut effective = effective_processed;
        let coverage = task.coverage();
        if effective > coverage {
            effective = coverage;
        }

        conn.execute(
            "UPDATE tasks SET keyspace_processed = ?1, effective_processed = ?2, \
             last_seq = ?3, status = 'running', last_progress_at = ?4 WHERE id = ?5",
            rusqlite::params![
                processed,
                effective,
                seq,
                ts(reported_at),
                task_id.to_string()
            ],
        )?;
        Ok(ProgressOutcome::Applied)
    }

    /// Mark a slice completed. Idempotent; a completion for an already
    /// settled task is ignored. The full range counts as processed.
    pub async fn complete(
        &self,
        task_id: TaskId,
        summary: &TaskSummary,
    ) -> Result<Task, StoreError> {
        let conn = self.db.conn.lock().await;
        let task = get_task(&conn, task_id)?;
        if task.is_terminal() || task.status == TaskStatus::Reclaimed {
            return Ok(task);
        }

        let range_len = task.range_len();
        let coverage = task.coverage();
        if summary.keyspace_processed != 0 && summary.keyspace_processed != range_len {
            tracing::debug!(
                "task {} completion reported {} of {} candidates; recording full range",
                task_id,
                summary.keyspace_processed,
                range_len
            );
        }

        let now = Utc::now();
        conn.execute(
            "UPDATE tasks SET status = 'completed', keyspace_processed = ?1, \
             effective_processed = ?2, completed_at = ?3, last_progress_at = ?3 WHERE id = ?4",
            rusqlite::params![range_len, coverage, ts(now), task_id.to_string()],
        )?;
        get_task(&conn, task_id)
    }

    /// Cancel a slice (user cancel or preemption). Idempotent. When
    /// `requeue` is set and the slice was partially processed, the stored
    /// range is truncated and the remainder comes back as a pending task;
    /// the returned task is that residual.
    pub async fn cancel(
        &self,
        task_id: TaskId,
        reason: &str,
        requeue: bool,
    ) -> Result<Option<Task>, StoreError> {
        let outcome = self
            .settle(task_id, TaskStatus::Cancelled, Some(reason), requeue, false, u32::MAX)
            .await?;
        match outcome {
            RequeueOutcome::Requeued(task) => Ok(Some(task)),
            _ => Ok(None),
        }
    }

    /// Settle a slice reported failed by its agent. The residual is requeued
    /// with an incremented retry count unless the budget is exhausted.
    pub async fn fail(
        &self,
        task_id: TaskId,
        reason: &str,
        max_retries: u32,
    ) -> Result<RequeueOutcome, StoreError> {
        self.settle(task_id, TaskStatus::Failed, Some(reason), true, true, max_retries)
            .await
    }

    /// Reclaim a stalled or orphaned slice. Idempotent: reclaiming an
    /// already settled task is a no-op.
    pub async fn reclaim(
        &self,
        task_id: TaskId,
        max_retries: u32,
    ) -> Result<RequeueOutcome, StoreError> {
        self.settle(task_id, TaskStatus::Reclaimed, None, true, true, max_retries)
            .await
    }

    /// Return an assigned-but-never-started slice to the pending pool, e.g.
    /// when the assignment was never acknowledged.
    pub async fn release(&self, task_id: TaskId) -> Result<(), StoreError> {
        let conn = self.db.conn.lock().await;
        let task = get_task(&conn, task_id)?;
        if task.status != TaskStatus::Assigned || task.keyspace_processed > 0 {
            return Ok(());
        }
        conn.execute(
            "UPDATE tasks SET agent_id = NULL, status = 'pending', started_at = NULL WHERE id = ?1",
            rusqlite::params![task_id.to_string()],
        )?;
        Ok(())
    }

    async fn settle(
        &self,
        task_id: TaskId,
        new_status: TaskStatus,
        reason: Option<&str>,
        requeue: bool,
        bump_retry: bool,
        max_retries: u32,
    ) -> Result<RequeueOutcome, StoreError> {
        let conn = self.db.conn.lock().await;
        let task = get_task(&conn, task_id)?;
        if task.is_terminal() || task.status == TaskStatus::Reclaimed {
            return Ok(RequeueOutcome::Settled);
        }

        let now = Utc::now();
        let processed = task.keyspace_processed.min(task.range_len());
        let new_end = task.keyspace_start + processed;
        let old_end = task.keyspace_end;

        let (eff_new_end, eff_old_end) = match (task.effective_start, task.effective_end) {
            (Some(start), Some(end)) => {
                let eff = task.effective_processed.min(end - start);
                (Some(start + eff), Some(end))
            }
            _ => (None, None),
        };

        // Truncate the stored range to the processed prefix so the residual
        // slice never overlaps it.
        conn.execute(
            "UPDATE tasks SET status = ?1, keyspace_end = ?2, effective_end = ?3, \
             cancel_reason = ?4, completed_at = ?5 WHERE id = ?6",
            rusqlite::params![
                new_status.as_str(),
                new_end,
                eff_new_end,
                reason,
                ts(now),
                task_id.to_string()
            ],
        )?;

        if !requeue || new_end >= old_end {
            return Ok(RequeueOutcome::Settled);
        }

        // A terminal job does not get its residuals back.
        let job_status: String = conn.query_row(
            "SELECT status FROM jobs WHERE id = ?1",
            rusqlite::params![task.job_id.to_string()],
            |row| row.get(0),
        )?;
        let job_status: JobStatus = job_status
            .parse()
            .map_err(StoreError::Serialization)?;
        if job_status.is_terminal() {
            tracing::debug!(
                "not requeuing residual of task {}: job {} is {}",
                task_id,
                task.job_id,
                job_status
            );
            return Ok(RequeueOutcome::Settled);
        }

        let retry_count = task.retry_count + u32::from(bump_retry);
        if bump_retry && retry_count > max_retries {
            tracing::warn!(
                "task {} exhausted its retry budget ({} attempts)",
                task_id,
                max_retries
            );
            return Ok(RequeueOutcome::RetriesExhausted);
        }

        let mut residual = Task::pending(task.job_id, new_end, old_end);
        residual.rule_chunk_index = task.rule_chunk_index;
        residual.retry_count = retry_count;
        if let (Some(eff_cursor), Some(eff_end)) = (eff_new_end, eff_old_end) {
            residual.effective_start = Some(eff_cursor);
            residual.effective_end = Some(eff_end);
        }
        insert_task(&conn, &residual)?;

        tracing::info!(
            "requeued residual [{}, {}) of task {} as task {}",
            residual.keyspace_start,
            residual.keyspace_end,
            task_id,
            residual.id
        );
        Ok(RequeueOutcome::Requeued(residual))
    }
}

// ── Row-mapping helpers ───────────────────────────────────────────────

fn insert_task(conn: &rusqlite::Connection, task: &Task) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO tasks (id, job_id, agent_id, keyspace_start, keyspace_end, \
         effective_start, effective_end, keyspace_processed, effective_processed, \
         rule_chunk_index, status, retry_count, last_seq, cancel_reason, created_at, \
         started_at, completed_at, last_progress_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
        rusqlite::params![
            task.id.to_string(),
            task.job_id.to_string(),
            task.agent_id.map(|a| a.to_string()),
            task.keyspace_start,
            task.keyspace_end,
            task.effective_start,
            task.effective_end,
            task.keyspace_processed,
            task.effective_processed,
            task.rule_chunk_index,
            task.status.as_str(),
            task.retry_count,
            task.last_seq,
            task.cancel_reason,
            ts(task.created_at),
            ts_opt(task.started_at),
            ts_opt(task.completed_at),
            ts_opt(task.last_progress_at),
        ],
    )?;
    Ok(())
}

fn get_task(conn: &rusqlite::Connection, task_id: TaskId) -> Result<Task, StoreError> {
    let sql = format!("SELECT {TASK_COLS} FROM tasks WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let result = stmt
        .query_row(rusqlite::params![task_id.to_string()], row_to_task)
        .optional()?;
    match result {
        Some(task) => task,
        None => Err(StoreError::TaskNotFound { task_id }),
    }
}

fn collect_tasks(
    rows: impl Iterator<Item = rusqlite::Result<Result<Task, StoreError>>>,
) -> Result<Vec<Task>, StoreError> {
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row??);
    }
    Ok(tasks)
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Task, StoreError>> {
    let id_str: String = row.get(0)?;
    let job_id_str: String = row.get(1)?;
    let agent_id_str: Option<String> = row.get(2)?;
    let keyspace_start: i64 = row.get(3)?;
    let keyspace_end: i64 = row.get(4)?;
    let effective_start: Option<i64> = row.get(5)?;
    let effective_end: Option<i64> = row.get(6)?;
    let keyspace_processed: i64 = row.get(7)?;
    let effective_processed: i64 = row.get(8)?;
    let rule_chunk_index: Option<u32> = row.get(9)?;
    let status_str: String = row.get(10)?;
    let retry_count: u32 = row.get(11)?;
    let last_seq: i64 = row.get(12)?;
    let cancel_reason: Option<String> = row.get(13)?;
    let created_str: String = row.get(14)?;
    let started_str: Option<String> = row.get(15)?;
    let completed_str: Option<String> = row.get(16)?;
    let progress_str: Option<String> = row.get(17)?;

    Ok((|| -> Result<Task, StoreError> {
        let id: TaskId = id_str
            .parse()
            .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?;
        let job_id: JobId = job_id_str
            .parse()
            .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?;
        let agent_id = agent_id_str
            .map(|s| {
                s.parse::<AgentId>()
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .transpose()?;
        let status: TaskStatus = status_str.parse().map_err(StoreError::Serialization)?;

        Ok(Task {
            id,
            job_id,
            agent_id,
            keyspace_start,
            keyspace_end,
            effective_start,
            effective_end,
            keyspace_processed,
            effective_processed,
            rule_chunk_index,
            status,
            retry_count,
            last_seq,
            cancel_reason,
            created_at: parse_ts(&created_str)?,
            started_at: parse_ts_opt(started_str)?,
            completed_at: parse_ts_opt(completed_str)?,
            last_progress_at: parse_ts_opt(progress_str)?,
        })
    })())
}
