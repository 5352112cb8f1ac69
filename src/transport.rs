//! Transport layer
//!
//! Bidirectional message dispatch between the server and its agents. The
//! outer connection handling (WebSocket endpoint, auth, file distribution)
//! lives outside this crate; transport terminates at typed duplex channels.
//! Delivery is at-least-once in both directions: assignments are tracked
//! until acked and re-sent up to a budget, inbound progress is coalesced
//! per task (latest wins) before reaching the task store, and crack events
//! are forwarded immediately — they are never dropped by backpressure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::time::interval;

use crate::config::SettingsStore;
use crate::registry::AgentRegistry;
use crate::services::{HashlistService, NotificationEvent, NotificationService};
use crate::store::{BenchmarkKey, BenchmarkStore, JobStore, RequeueOutcome, TaskStore};
use crate::types::{
    AgentId, AgentMessage, CrackEntry, JobId, JobStatus, ServerMessage, TaskAssignment, TaskId,
    TransportError,
};

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const ACK_RESEND_INTERVAL: Duration = Duration::from_secs(10);

/// Counters for transport health output.
#[derive(Debug, Clone, Default)]
pub struct TransportMetrics {
    pub assignments_sent: u64,
    pub assignments_resent: u64,
    pub assignments_abandoned: u64,
    pub progress_applied: u64,
    pub progress_dropped: u64,
    pub cracks_recorded: u64,
}

#[derive(Debug, Clone)]
struct PendingAssignment {
    agent_id: AgentId,
    assignment: TaskAssignment,
    attempts: u32,
    last_sent: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct BufferedProgress {
    seq: i64,
    keyspace_processed: i64,
    effective_processed: i64,
    reported_at: DateTime<Utc>,
}

/// Message dispatch hub for all connected agents.
pub struct Transport {
    registry: Arc<AgentRegistry>,
    tasks: Arc<TaskStore>,
    jobs: Arc<JobStore>,
    benchmarks: Arc<BenchmarkStore>,
    hashlists: Arc<dyn HashlistService>,
    notifier: Arc<dyn NotificationService>,
    settings: Arc<SettingsStore>,
    connections: DashMap<AgentId, mpsc::UnboundedSender<ServerMessage>>,
    pending_acks: Mutex<HashMap<TaskId, PendingAssignment>>,
    progress_buffer: Mutex<HashMap<TaskId, BufferedProgress>>,
    first_crack_seen: Mutex<HashSet<JobId>>,
    metrics: RwLock<TransportMetrics>,
    shutdown_notify: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
}

impl Transport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        tasks: Arc<TaskStore>,
        jobs: Arc<JobStore>,
        benchmarks: Arc<BenchmarkStore>,
        hashlists: Arc<dyn HashlistService>,
        notifier: Arc<dyn NotificationService>,
        settings: Arc<SettingsStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            tasks,
            jobs,
            benchmarks,
            hashlists,
            notifier,
            settings,
            connections: DashMap::new(),
            pending_acks: Mutex::new(HashMap::new()),
            progress_buffer: Mutex::new(HashMap::new()),
            first_crack_seen: Mutex::new(HashSet::new()),
            metrics: RwLock::new(TransportMetrics::default()),
            shutdown_notify: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(true)),
        })
    }

    /// Start the progress-flush and assignment-resend loops.
    pub fn start(self: &Arc<Self>) {
        let transport = self.clone();
        let shutdown = self.shutdown_notify.clone();
        tokio::spawn(async move {
            let mut ticker = interval(FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !*transport.is_running.read() {
                            break;
                        }
                        transport.flush_progress().await;
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });

        let transport = self.clone();
        let shutdown = self.shutdown_notify.clone();
        tokio::spawn(async move {
            let mut ticker = interval(ACK_RESEND_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !*transport.is_running.read() {
                            break;
                        }
                        transport.resend_unacked().await;
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });
    }

    pub async fn shutdown(&self) {
        *self.is_running.write() = false;
        self.shutdown_notify.notify_waiters();
        // A final flush so buffered progress is not lost on clean shutdown.
        self.flush_progress().await;
        self.connections.clear();
        tracing::info!("transport shut down");
    }

    pub fn metrics(&self) -> TransportMetrics {
        self.metrics.read().clone()
    }

    // ── Connections ───────────────────────────────────────────────────

    /// Register an agent connection; the returned receiver is the agent's
    /// outbound message stream. A reconnect replaces the previous channel.
    pub fn connect_agent(&self, agent_id: AgentId) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.connections.insert(agent_id, sender);
        self.registry.mark_connected(agent_id);
        tracing::info!("agent {} connected", agent_id);
        receiver
    }

    pub fn disconnect_agent(&self, agent_id: AgentId) {
        self.connections.remove(&agent_id);
        self.registry.mark_disconnected(agent_id);
        tracing::info!("agent {} disconnected", agent_id);
    }

    /// Send one message to an agent.
    pub fn send(&self, agent_id: AgentId, message: ServerMessage) -> Result<(), TransportError> {
        let sender = self
            .connections
            .get(&agent_id)
            .ok_or(TransportError::AgentNotConnected { agent_id })?;
        sender.send(message).map_err(|e| TransportError::SendFailed {
            agent_id,
            reason: e.to_string(),
        })
    }

    /// Send a task assignment and track it until the agent acks.
    pub fn assign(&self, agent_id: AgentId, assignment: TaskAssignment) -> Result<(), TransportError> {
        let task_id = assignment.task_id;
        self.pending_acks.lock().insert(
            task_id,
            PendingAssignment {
                agent_id,
                assignment: assignment.clone(),
                attempts: 1,
                last_sent: Utc::now(),
            },
        );
        match self.send(agent_id, ServerMessage::AssignTask { assignment }) {
            Ok(()) => {
                self.metrics.write().assignments_sent += 1;
                Ok(())
            }
            Err(e) => {
                self.pending_acks.lock().remove(&task_id);
                Err(e)
            }
        }
    }

    /// Push a file-sync manifest to an agent.
    pub fn sync_files(
        &self,
        agent_id: AgentId,
        manifest: Vec<crate::types::FileManifestEntry>,
    ) -> Result<(), TransportError> {
        self.send(agent_id, ServerMessage::SyncFiles { manifest })
    }

    /// Toggle verbose logging on an agent.
    pub fn set_debug(&self, agent_id: AgentId, enabled: bool) -> Result<(), TransportError> {
        self.send(agent_id, ServerMessage::DebugToggle { enabled })
    }

    /// Best-effort stop signal; the store-side cancellation has already
    /// happened by the time this is sent.
    pub fn cancel_task(&self, agent_id: AgentId, task_id: TaskId, reason: &str) {
        self.pending_acks.lock().remove(&task_id);
        if let Err(e) = self.send(
            agent_id,
            ServerMessage::CancelTask {
                task_id,
                reason: reason.to_string(),
            },
        ) {
            tracing::debug!("cancel for task {} not delivered: {}", task_id, e);
        }
    }

    // ── Inbound ───────────────────────────────────────────────────────

    /// Apply one message received from an agent.
    pub async fn handle_message(
        &self,
        agent_id: AgentId,
        message: AgentMessage,
    ) -> Result<(), TransportError> {
        tracing::trace!("{} from agent {}", message.kind(), agent_id);
        // Any inbound traffic proves liveness.
        self.registry.touch_heartbeat(agent_id);

        match message {
            AgentMessage::Heartbeat { stats } => {
                tracing::trace!(
                    "heartbeat from {} ({} MB in use)",
                    agent_id,
                    stats.memory_used_mb
                );
            }
            AgentMessage::TaskAck { task_id } => {
                self.pending_acks.lock().remove(&task_id);
            }
            AgentMessage::Progress {
                task_id,
                seq,
                keyspace_processed,
                effective_processed,
                hashes_per_second: _,
                timestamp,
            } => {
                self.buffer_progress(task_id, seq, keyspace_processed, effective_processed, timestamp);
            }
            AgentMessage::Crack {
                task_id,
                hash,
                plaintext,
                username,
                domain,
            } => {
                self.record_crack(task_id, CrackEntry {
                    hash,
                    plaintext,
                    username,
                    domain,
                })
                .await?;
            }
            AgentMessage::TaskCompleted { task_id, summary } => {
                self.pending_acks.lock().remove(&task_id);
                // Land any buffered progress before settling the slice.
                self.flush_task(task_id).await;
                let task = self.tasks.complete(task_id, &summary).await?;
                self.registry.record_success(agent_id).await?;
                tracing::info!(
                    "task {} completed by agent {} ({} candidates)",
                    task_id,
                    agent_id,
                    task.range_len()
                );
                if summary.cracked_count > 0 {
                    self.notify_job(task.job_id, |job| NotificationEvent::TaskCompletedWithCracks {
                        job_id: job,
                        cracked: summary.cracked_count,
                    })
                    .await;
                }
            }
            AgentMessage::TaskFailed { task_id, reason } => {
                self.pending_acks.lock().remove(&task_id);
                self.flush_task(task_id).await;
                self.apply_task_failure(agent_id, task_id, &reason).await?;
            }
            AgentMessage::BenchmarkResult {
                attack_mode,
                hash_type,
                binary_version,
                hashes_per_second,
            } => {
                let key = BenchmarkKey {
                    agent_id,
                    attack_mode,
                    hash_type,
                    binary_version,
                };
                self.benchmarks.record(&key, hashes_per_second).await?;
                tracing::debug!(
                    "benchmark for {}: {} H/s on {} type {}",
                    agent_id,
                    hashes_per_second,
                    attack_mode,
                    hash_type
                );
            }
            AgentMessage::LogChunk { task_id, content } => {
                tracing::debug!(
                    "agent {} log ({}): {}",
                    agent_id,
                    task_id.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string()),
                    content.trim_end()
                );
            }
        }
        Ok(())
    }

    fn buffer_progress(
        &self,
        task_id: TaskId,
        seq: i64,
        keyspace_processed: i64,
        effective_processed: i64,
        reported_at: DateTime<Utc>,
    ) {
        let frame = BufferedProgress {
            seq,
            keyspace_processed,
            effective_processed,
            reported_at,
        };
        let superseded = {
            let mut buffer = self.progress_buffer.lock();
            match buffer.entry(task_id) {
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    // Bounded queue per task: older updates are superseded.
                    if seq > slot.get().seq {
                        slot.insert(frame);
                        false
                    } else {
                        true
                    }
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(frame);
                    false
                }
            }
        };
        if superseded {
            self.metrics.write().progress_dropped += 1;
        }
    }

    /// Drain the whole progress buffer into the task store.
    pub async fn flush_progress(&self) {
        let drained: Vec<(TaskId, BufferedProgress)> = {
            let mut buffer = self.progress_buffer.lock();
            buffer.drain().collect()
        };
        for (task_id, frame) in drained {
            self.apply_buffered(task_id, frame).await;
        }
    }

    async fn flush_task(&self, task_id: TaskId) {
        let frame = self.progress_buffer.lock().remove(&task_id);
        if let Some(frame) = frame {
            self.apply_buffered(task_id, frame).await;
        }
    }

    async fn apply_buffered(&self, task_id: TaskId, frame: BufferedProgress) {
        match self
            .tasks
            .apply_progress(
                task_id,
                frame.seq,
                frame.keyspace_processed,
                frame.effective_processed,
                frame.reported_at,
            )
            .await
        {
            Ok(crate::store::ProgressOutcome::Applied) => {
                self.metrics.write().progress_applied += 1;
            }
            Ok(_) => {
                self.metrics.write().progress_dropped += 1;
            }
            Err(e) => {
                tracing::error!("failed to apply progress for task {}: {}", task_id, e);
            }
        }
    }

    async fn record_crack(&self, task_id: TaskId, crack: CrackEntry) -> Result<(), TransportError> {
        let task = self.tasks.get(task_id).await?;
        let job = self.jobs.get(task.job_id).await?;

        match self.hashlists.record_cracks(job.hashlist_id, &[crack]).await {
            Ok(new) => {
                if new > 0 {
                    self.metrics.write().cracks_recorded += new;
                    let first = self.first_crack_seen.lock().insert(job.id);
                    if first {
                        let _ = self
                            .notifier
                            .notify(&job.owner, NotificationEvent::FirstCrack { job_id: job.id })
                            .await;
                    }
                }
            }
            Err(e) => {
                // Cracks must not be lost: surface loudly, the agent re-sends.
                tracing::error!("crack ingest failed for job {}: {}", job.id, e);
            }
        }
        Ok(())
    }

    async fn apply_task_failure(
        &self,
        agent_id: AgentId,
        task_id: TaskId,
        reason: &str,
    ) -> Result<(), TransportError> {
        let settings = self.settings.snapshot();
        let outcome = self
            .tasks
            .fail(task_id, reason, settings.max_chunk_retry_attempts)
            .await?;
        tracing::warn!("task {} failed on agent {}: {}", task_id, agent_id, reason);

        if let RequeueOutcome::RetriesExhausted = outcome {
            let task = self.tasks.get(task_id).await?;
            self.jobs
                .set_last_error(task.job_id, &format!("task retry budget exhausted: {reason}"))
                .await?;
            match self.jobs.transition(task.job_id, JobStatus::Failed).await {
                Ok(job) => {
                    let _ = self
                        .notifier
                        .notify(
                            &job.owner,
                            NotificationEvent::JobFailed {
                                job_id: job.id,
                                reason: reason.to_string(),
                            },
                        )
                        .await;
                }
                Err(e) => tracing::debug!("job {} not failed: {}", task.job_id, e),
            }
        }

        // Explicit task_failed reports feed the consecutive-failure policy.
        let (_, quarantined) = self
            .registry
            .record_failure(agent_id, settings.agent_failure_threshold)
            .await?;
        if quarantined {
            let _ = self
                .notifier
                .notify(
                    "operators",
                    NotificationEvent::AgentError {
                        agent_id,
                        reason: format!("quarantined after consecutive failures: {reason}"),
                    },
                )
                .await;
            self.reclaim_agent_tasks(agent_id, &settings).await;
        }
        Ok(())
    }

    /// Requeue everything a quarantined agent still holds so other agents
    /// pick the residuals up.
    async fn reclaim_agent_tasks(&self, agent_id: AgentId, settings: &crate::config::Settings) {
        let tasks = match self.tasks.active_tasks_for_agent(agent_id).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!("failed to list tasks of quarantined agent {}: {}", agent_id, e);
                return;
            }
        };
        for task in tasks {
            self.cancel_task(agent_id, task.id, "agent quarantined");
            if let Err(e) = self
                .tasks
                .reclaim(task.id, settings.max_chunk_retry_attempts)
                .await
            {
                tracing::error!("failed to reclaim task {} from {}: {}", task.id, agent_id, e);
            }
        }
    }

    async fn notify_job(
        &self,
        job_id: JobId,
        event: impl FnOnce(JobId) -> NotificationEvent,
    ) {
        match self.jobs.get(job_id).await {
            Ok(job) => {
                let _ = self.notifier.notify(&job.owner, event(job.id)).await;
            }
            Err(e) => tracing::debug!("notification skipped for job {}: {}", job_id, e),
        }
    }

    /// Re-send unacked assignments; give up (and release the slice) once the
    /// retry budget is exhausted.
    pub async fn resend_unacked(&self) {
        let settings = self.settings.snapshot();
        let now = Utc::now();
        let resend_after = chrono::Duration::from_std(ACK_RESEND_INTERVAL)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));

        let mut resend = Vec::new();
        let mut abandoned = Vec::new();
        {
            let mut pending = self.pending_acks.lock();
            pending.retain(|task_id, entry| {
                if now - entry.last_sent < resend_after {
                    return true;
                }
                if entry.attempts >= settings.assignment_retry_attempts {
                    tracing::warn!(
                        "assignment for task {} unacked after {} attempts; releasing",
                        task_id,
                        entry.attempts
                    );
                    abandoned.push(*task_id);
                    return false;
                }
                entry.attempts += 1;
                entry.last_sent = now;
                resend.push(entry.clone());
                true
            });
        }

        for task_id in abandoned {
            self.metrics.write().assignments_abandoned += 1;
            if let Err(e) = self.tasks.release(task_id).await {
                tracing::error!("failed to release unacked task {}: {}", task_id, e);
            }
        }
        for entry in resend {
            let task_id = entry.assignment.task_id;
            self.metrics.write().assignments_resent += 1;
            if let Err(e) = self.send(
                entry.agent_id,
                ServerMessage::AssignTask {
                    assignment: entry.assignment,
                },
            ) {
                tracing::debug!("resend of task {} failed: {}", task_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::AttackPlan;
    use crate::services::{HashlistInfo, ServiceSet};
    use crate::store::Database;
    use crate::types::{Agent, AttackSpec, FileId, HashlistId, JobSpec, TaskStatus, TaskSummary};

    struct Harness {
        transport: Arc<Transport>,
        tasks: Arc<TaskStore>,
        registry: Arc<AgentRegistry>,
        hashlists: Arc<crate::services::InMemoryHashlists>,
        notifier: Arc<crate::services::RecordingNotifier>,
        job: crate::types::Job,
        hashlist_id: HashlistId,
    }

    async fn harness() -> Harness {
        let db = Database::open_in_memory().unwrap();
        let (services, hashlists, _files, notifier) = ServiceSet::in_memory();
        let hashlist_id = HashlistId::new();
        hashlists.insert(HashlistInfo {
            id: hashlist_id,
            hash_count: 100,
            uncracked_count: 100,
            hash_type: 0,
            mixed_work_factors: false,
            slow_hash: false,
        });

        let registry = Arc::new(AgentRegistry::new(db.clone()));
        let tasks = Arc::new(TaskStore::new(db.clone()));
        let jobs = Arc::new(JobStore::new(db.clone()));
        let benchmarks = Arc::new(BenchmarkStore::new(db.clone()));
        let settings = Arc::new(SettingsStore::default());

        let spec = JobSpec {
            owner: "tester".to_string(),
            hashlist_id,
            attack: AttackSpec::Dictionary {
                wordlist_id: FileId::new(),
                rule_id: None,
            },
            binary_version: "7.0.0".to_string(),
            priority: 5,
            max_agents: 0,
            allow_preempt: false,
            chunk_duration_secs: None,
        };
        let plan = AttackPlan::Dictionary {
            wordlist_lines: 1_000,
            rule_count: 0,
        };
        let job = jobs.build_job(spec, plan, 0, false, Vec::new()).unwrap();
        jobs.insert(&job).await.unwrap();
        let job = jobs.transition(job.id, JobStatus::Running).await.unwrap();

        let transport = Transport::new(
            registry.clone(),
            tasks.clone(),
            jobs.clone(),
            benchmarks,
            services.hashlists.clone(),
            services.notifier.clone(),
            settings,
        );

        Harness {
            transport,
            tasks,
            registry,
            hashlists,
            notifier,
            job,
            hashlist_id,
        }
    }

    #[tokio::test]
    async fn assignment_requires_connection_and_tracks_ack() {
        let h = harness().await;
        let agent = Agent::new("rig");
        h.registry.register(&agent).await.unwrap();

        let task = h
            .tasks
            .claim(&h.job, 1_000, agent.id)
            .await
            .unwrap()
            .unwrap();
        let assignment = TaskAssignment {
            task_id: task.id,
            job_id: h.job.id,
            hashlist_id: h.hashlist_id,
            attack: h.job.spec.clone(),
            hash_type: 0,
            binary_version: "7.0.0".to_string(),
            keyspace_start: task.keyspace_start,
            keyspace_end: task.keyspace_end,
            rule_chunk: None,
            report_interval_secs: 5,
        };

        // Not connected yet.
        assert!(h.transport.assign(agent.id, assignment.clone()).is_err());

        let mut rx = h.transport.connect_agent(agent.id);
        h.transport.assign(agent.id, assignment).unwrap();
        match rx.recv().await.unwrap() {
            ServerMessage::AssignTask { assignment } => assert_eq!(assignment.task_id, task.id),
            other => panic!("expected AssignTask, got {:?}", other),
        }

        // Ack clears the pending entry.
        h.transport
            .handle_message(agent.id, AgentMessage::TaskAck { task_id: task.id })
            .await
            .unwrap();
        assert!(h.transport.pending_acks.lock().is_empty());
    }

    #[tokio::test]
    async fn progress_batches_keep_latest_per_task() {
        let h = harness().await;
        let agent = Agent::new("rig");
        h.registry.register(&agent).await.unwrap();
        h.transport.connect_agent(agent.id);
        let task = h
            .tasks
            .claim(&h.job, 1_000, agent.id)
            .await
            .unwrap()
            .unwrap();

        for (seq, processed) in [(1i64, 100i64), (2, 250), (3, 400)] {
            h.transport
                .handle_message(
                    agent.id,
                    AgentMessage::Progress {
                        task_id: task.id,
                        seq,
                        keyspace_processed: processed,
                        effective_processed: 0,
                        hashes_per_second: 10_000,
                        timestamp: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }

        // Only the latest frame reaches the store.
        h.transport.flush_progress().await;
        let stored = h.tasks.get(task.id).await.unwrap();
        assert_eq!(stored.keyspace_processed, 400);
        assert_eq!(stored.last_seq, 3);
        assert_eq!(h.transport.metrics().progress_applied, 1);
    }

    #[tokio::test]
    async fn completion_flushes_progress_and_resets_failures() {
        let h = harness().await;
        let agent = Agent::new("rig");
        h.registry.register(&agent).await.unwrap();
        h.transport.connect_agent(agent.id);
        h.registry.record_failure(agent.id, 10).await.unwrap();
        let task = h
            .tasks
            .claim(&h.job, 1_000, agent.id)
            .await
            .unwrap()
            .unwrap();

        h.transport
            .handle_message(
                agent.id,
                AgentMessage::TaskCompleted {
                    task_id: task.id,
                    summary: TaskSummary {
                        keyspace_processed: 1_000,
                        effective_processed: 0,
                        cracked_count: 2,
                    },
                },
            )
            .await
            .unwrap();

        let stored = h.tasks.get(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(
            h.registry.get(agent.id).await.unwrap().consecutive_failures,
            0
        );
        let events = h.notifier.events();
        assert!(events.iter().any(|(_, e)| matches!(
            e,
            NotificationEvent::TaskCompletedWithCracks { cracked: 2, .. }
        )));
    }

    #[tokio::test]
    async fn cracks_are_recorded_and_first_crack_notified_once() {
        let h = harness().await;
        let agent = Agent::new("rig");
        h.registry.register(&agent).await.unwrap();
        h.transport.connect_agent(agent.id);
        let task = h
            .tasks
            .claim(&h.job, 1_000, agent.id)
            .await
            .unwrap()
            .unwrap();

        for hash in ["aaa", "aaa", "bbb"] {
            h.transport
                .handle_message(
                    agent.id,
                    AgentMessage::Crack {
                        task_id: task.id,
                        hash: hash.to_string(),
                        plaintext: "hunter2".to_string(),
                        username: None,
                        domain: None,
                    },
                )
                .await
                .unwrap();
        }

        assert_eq!(h.hashlists.cracked_hashes(h.hashlist_id).len(), 2);
        let first_cracks = h
            .notifier
            .events()
            .into_iter()
            .filter(|(_, e)| matches!(e, NotificationEvent::FirstCrack { .. }))
            .count();
        assert_eq!(first_cracks, 1);
    }

    #[tokio::test]
    async fn repeated_failures_quarantine_agent_and_requeue_tasks() {
        let h = harness().await;
        let agent = Agent::new("flaky");
        h.registry.register(&agent).await.unwrap();
        h.transport.connect_agent(agent.id);

        // Failure threshold is 5 by default; fail five distinct slices.
        for _ in 0..5 {
            let task = h
                .tasks
                .claim(&h.job, 100, agent.id)
                .await
                .unwrap()
                .unwrap();
            h.transport
                .handle_message(
                    agent.id,
                    AgentMessage::TaskFailed {
                        task_id: task.id,
                        reason: "GPU fell off the bus".to_string(),
                    },
                )
                .await
                .unwrap();
        }

        let stored = h.registry.get(agent.id).await.unwrap();
        assert_eq!(stored.status, crate::types::AgentStatus::Error);
        assert!(h
            .notifier
            .events()
            .iter()
            .any(|(_, e)| matches!(e, NotificationEvent::AgentError { .. })));
    }

    #[tokio::test]
    async fn benchmark_results_update_the_cache() {
        let h = harness().await;
        let agent = Agent::new("rig");
        h.registry.register(&agent).await.unwrap();
        h.transport.connect_agent(agent.id);

        h.transport
            .handle_message(
                agent.id,
                AgentMessage::BenchmarkResult {
                    attack_mode: crate::types::AttackMode::Dictionary,
                    hash_type: 0,
                    binary_version: "7.0.0".to_string(),
                    hashes_per_second: 123_456,
                },
            )
            .await
            .unwrap();

        let key = BenchmarkKey {
            agent_id: agent.id,
            attack_mode: crate::types::AttackMode::Dictionary,
            hash_type: 0,
            binary_version: "7.0.0".to_string(),
        };
        let status = h
            .transport
            .benchmarks
            .lookup(&key, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(
            status,
            crate::store::BenchmarkStatus::Fresh {
                hashes_per_second: 123_456
            }
        );
    }
}
