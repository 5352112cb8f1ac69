//! Scheduler loop
//!
//! The periodic matcher at the heart of the orchestrator. Each tick is a
//! pure function of current store state and externally idempotent: select
//! candidate jobs in (priority desc, created-at asc) order, preempt
//! lower-priority work for starved preempting jobs, hand eligible idle
//! agents benchmark-sized slices up to each job's agent budget, spread
//! leftover agents by the overflow policy, and dispatch assignments through
//! the transport. Assignments are durable once the task store records them;
//! message emission is best-effort and retried by the transport.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::interval;

use crate::chunk::{plan_chunk, ChunkParams};
use crate::config::{Settings, SettingsStore};
use crate::registry::AgentRegistry;
use crate::services::{HashlistService, NotificationEvent, NotificationService};
use crate::store::{BenchmarkKey, BenchmarkStatus, BenchmarkStore, JobStore, TaskStore};
use crate::transport::Transport;
use crate::types::{
    Agent, AgentId, Job, JobId, JobStatus, SchedulerError, ServerMessage, TaskAssignment,
};

pub mod allocation;

use allocation::OverflowRotation;

/// Configuration for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Hard deadline per tick.
    pub tick_deadline: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            tick_deadline: Duration::from_secs(15),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub assigned: usize,
    pub preempted: usize,
    pub speedtests: usize,
    pub completed_jobs: usize,
}

/// Counters for scheduler health output.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
    pub ticks: u64,
    pub ticks_skipped: u64,
    pub tasks_assigned: u64,
    pub tasks_preempted: u64,
    pub speedtests_sent: u64,
    pub jobs_completed: u64,
}

enum AssignOutcome {
    Assigned,
    /// No usable benchmark for this agent×attack pair yet.
    NeedsBenchmark,
    /// The transport could not reach the agent; the slice was released.
    DispatchFailed,
    /// The job has nothing left to dispatch.
    Exhausted,
}

/// The periodic job/agent matcher.
pub struct Scheduler {
    jobs: Arc<JobStore>,
    tasks: Arc<TaskStore>,
    benchmarks: Arc<BenchmarkStore>,
    registry: Arc<AgentRegistry>,
    transport: Arc<Transport>,
    hashlists: Arc<dyn HashlistService>,
    notifier: Arc<dyn NotificationService>,
    settings: Arc<SettingsStore>,
    config: SchedulerConfig,
    tick_lock: tokio::sync::Mutex<()>,
    metrics: RwLock<SchedulerMetrics>,
    shutdown_notify: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<JobStore>,
        tasks: Arc<TaskStore>,
        benchmarks: Arc<BenchmarkStore>,
        registry: Arc<AgentRegistry>,
        transport: Arc<Transport>,
        hashlists: Arc<dyn HashlistService>,
        notifier: Arc<dyn NotificationService>,
        settings: Arc<SettingsStore>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs,
            tasks,
            benchmarks,
            registry,
            transport,
            hashlists,
            notifier,
            settings,
            config,
            tick_lock: tokio::sync::Mutex::new(()),
            metrics: RwLock::new(SchedulerMetrics::default()),
            shutdown_notify: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(true)),
        })
    }

    /// Start the background tick loop.
    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        let shutdown = self.shutdown_notify.clone();
        let tick = self.config.tick_interval;
        let deadline = self.config.tick_deadline;

        tokio::spawn(async move {
            let mut ticker = interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !*scheduler.is_running.read() {
                            break;
                        }
                        match tokio::time::timeout(deadline, scheduler.tick()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => tracing::error!("scheduler tick failed: {}", e),
                            Err(_) => tracing::warn!(
                                "scheduler tick exceeded {:?}; abandoned",
                                deadline
                            ),
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });
    }

    pub fn shutdown(&self) {
        *self.is_running.write() = false;
        self.shutdown_notify.notify_waiters();
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.read().clone()
    }

    /// One scheduling pass. Single-flight: a tick that finds the previous
    /// one still running is skipped.
    pub async fn tick(&self) -> Result<TickSummary, SchedulerError> {
        let _guard = match self.tick_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.metrics.write().ticks_skipped += 1;
                tracing::debug!("scheduler tick skipped: previous tick still running");
                return Ok(TickSummary::default());
            }
        };
        self.metrics.write().ticks += 1;

        let settings = self.settings.snapshot();
        let now = Utc::now();
        let mut summary = TickSummary::default();

        // Step 1 — candidate jobs, with terminal bookkeeping folded in.
        let candidates = self.jobs.candidates().await?;
        let runnable = self.finalize_jobs(candidates, &mut summary).await?;

        let agents = self.registry.online_agents().await?;
        let cap = i64::from(settings.max_concurrent_jobs_per_agent.max(1));
        let mut counts: HashMap<AgentId, i64> = HashMap::new();
        for agent in &agents {
            counts.insert(agent.id, self.tasks.active_count_for_agent(agent.id).await?);
        }

        let mut order: Vec<JobId> = Vec::with_capacity(runnable.len());
        let mut jobs_by_id: HashMap<JobId, Job> = HashMap::new();
        for job in runnable {
            order.push(job.id);
            jobs_by_id.insert(job.id, job);
        }

        // Step 2 — preemption for starved high-priority jobs.
        if settings.job_interruption_enabled {
            self.preempt_for_starved(
                &order,
                &jobs_by_id,
                &agents,
                &mut counts,
                cap,
                now,
                &settings,
                &mut summary,
            )
            .await?;
        }

        // Step 3 — per-job budgeted assignment.
        let mut exhausted: HashSet<JobId> = HashSet::new();
        for job_id in &order {
            let Some(job) = jobs_by_id.get(job_id).cloned() else {
                continue;
            };
            let active = self.tasks.active_count_for_job(job.id).await?;
            let mut budget = if job.max_agents == 0 {
                usize::MAX
            } else {
                (i64::from(job.max_agents) - active).max(0) as usize
            };
            if budget == 0 {
                continue;
            }

            for agent in &agents {
                if budget == 0 {
                    break;
                }
                if counts[&agent.id] >= cap {
                    continue;
                }
                if !self.registry.eligible(agent, &job, now, &settings) {
                    continue;
                }
                match self.try_assign(&job, agent, &settings, &mut summary).await {
                    Ok(AssignOutcome::Assigned) => {
                        budget -= 1;
                        if let Some(count) = counts.get_mut(&agent.id) {
                            *count += 1;
                        }
                        self.mark_started(&mut jobs_by_id, job.id).await;
                    }
                    Ok(AssignOutcome::Exhausted) => {
                        exhausted.insert(job.id);
                        break;
                    }
                    Ok(AssignOutcome::NeedsBenchmark) | Ok(AssignOutcome::DispatchFailed) => {}
                    Err(e) => {
                        tracing::error!("assignment for job {} failed: {}", job.id, e);
                    }
                }
            }
        }

        // Step 4 — overflow allocation across equal-priority jobs.
        self.allocate_overflow(
            &order,
            &mut jobs_by_id,
            &mut exhausted,
            &agents,
            &mut counts,
            cap,
            now,
            &settings,
            &mut summary,
        )
        .await;

        let mut metrics = self.metrics.write();
        metrics.tasks_assigned += summary.assigned as u64;
        metrics.tasks_preempted += summary.preempted as u64;
        metrics.speedtests_sent += summary.speedtests as u64;
        metrics.jobs_completed += summary.completed_jobs as u64;
        drop(metrics);

        if summary != TickSummary::default() {
            tracing::debug!(
                "tick: {} assigned, {} preempted, {} speedtests, {} jobs completed",
                summary.assigned,
                summary.preempted,
                summary.speedtests,
                summary.completed_jobs
            );
        }
        Ok(summary)
    }

    /// Filter candidates down to jobs with dispatchable work, completing the
    /// ones that are done (keyspace exhausted or every hash cracked).
    async fn finalize_jobs(
        &self,
        candidates: Vec<Job>,
        summary: &mut TickSummary,
    ) -> Result<Vec<Job>, SchedulerError> {
        let mut runnable = Vec::new();
        for job in candidates {
            // Completion by crack-out: nothing left to look for.
            if job.status == JobStatus::Running {
                if let Ok(info) = self.hashlists.get_hashlist(job.hashlist_id).await {
                    if info.uncracked_count == 0 {
                        self.finish_cracked_job(&job, summary).await;
                        continue;
                    }
                }
            }

            let pending = self.tasks.pending_count_for_job(job.id).await?;
            let undispatched = self.undispatched(&job).await?;
            if pending == 0 && undispatched == 0 {
                // Fully dispatched. Completed once everything in flight
                // lands; unbounded jobs only end by user action.
                if job.status == JobStatus::Running
                    && !job.unbounded
                    && self.tasks.open_count_for_job(job.id).await? == 0
                {
                    self.complete_job(&job, summary).await;
                }
                continue;
            }
            runnable.push(job);
        }
        Ok(runnable)
    }

    /// Keyspace not yet covered by any task, in the job's dispatch unit.
    async fn undispatched(&self, job: &Job) -> Result<i64, SchedulerError> {
        if job.uses_rule_splitting {
            let dispatched = self.tasks.rule_chunks_dispatched(job.id).await?;
            Ok((job.rule_chunks.len() as i64 - dispatched).max(0))
        } else {
            let cursor = self.tasks.dispatch_cursor(job.id).await?;
            Ok((job.plan.keyspace().total - cursor).max(0))
        }
    }

    async fn complete_job(&self, job: &Job, summary: &mut TickSummary) {
        match self.jobs.transition(job.id, JobStatus::Completed).await {
            Ok(done) => {
                summary.completed_jobs += 1;
                tracing::info!("job {} completed", done.id);
                let _ = self
                    .notifier
                    .notify(&done.owner, NotificationEvent::JobCompleted { job_id: done.id })
                    .await;
            }
            Err(e) => tracing::debug!("job {} not completed: {}", job.id, e),
        }
    }

    /// Every hash is cracked: stop outstanding slices and complete the job.
    async fn finish_cracked_job(&self, job: &Job, summary: &mut TickSummary) {
        match self.tasks.tasks_for_job(job.id).await {
            Ok(tasks) => {
                for task in tasks {
                    if task.is_active() || task.status == crate::types::TaskStatus::Pending {
                        if let Some(agent_id) = task.agent_id {
                            self.transport.cancel_task(agent_id, task.id, "hashlist cracked");
                        }
                        if let Err(e) = self.tasks.cancel(task.id, "hashlist cracked", false).await
                        {
                            tracing::error!("failed to cancel task {}: {}", task.id, e);
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!("failed to list tasks of cracked-out job {}: {}", job.id, e);
                return;
            }
        }
        self.complete_job(job, summary).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn preempt_for_starved(
        &self,
        order: &[JobId],
        jobs_by_id: &HashMap<JobId, Job>,
        agents: &[Agent],
        counts: &mut HashMap<AgentId, i64>,
        cap: i64,
        now: DateTime<Utc>,
        settings: &Settings,
        summary: &mut TickSummary,
    ) -> Result<(), SchedulerError> {
        let victims = self.tasks.preemption_victims().await?;
        if victims.is_empty() {
            return Ok(());
        }
        let mut used = vec![false; victims.len()];

        for job_id in order {
            let job = match jobs_by_id.get(job_id) {
                Some(job) => job,
                None => continue,
            };
            if !job.allow_preempt {
                continue;
            }
            let has_idle = agents.iter().any(|a| {
                counts.get(&a.id).copied().unwrap_or(0) < cap
                    && self.registry.eligible(a, job, now, settings)
            });
            if has_idle {
                continue;
            }

            let active = self.tasks.active_count_for_job(job.id).await?;
            let want = if job.max_agents == 0 {
                1
            } else {
                (i64::from(job.max_agents) - active).max(0) as usize
            };
            if want == 0 {
                continue;
            }

            let mut taken = 0usize;
            for (i, (task, victim_priority)) in victims.iter().enumerate() {
                if taken >= want {
                    break;
                }
                if used[i] {
                    continue;
                }
                // Victims are sorted by priority ascending; nothing
                // preemptable remains past our own priority.
                if *victim_priority >= job.priority {
                    break;
                }
                let victim_agent_id = match task.agent_id {
                    Some(id) => id,
                    None => continue,
                };
                let victim_agent = match agents.iter().find(|a| a.id == victim_agent_id) {
                    Some(agent) => agent,
                    None => continue,
                };
                // Only free an agent the starved job can actually use.
                if !self.registry.eligible(victim_agent, job, now, settings) {
                    continue;
                }

                if let Err(e) = self.tasks.cancel(task.id, "preempted", true).await {
                    tracing::error!("failed to preempt task {}: {}", task.id, e);
                    continue;
                }
                self.transport
                    .cancel_task(victim_agent_id, task.id, "preempted");
                if let Some(count) = counts.get_mut(&victim_agent_id) {
                    *count = (*count - 1).max(0);
                }
                used[i] = true;
                taken += 1;
                summary.preempted += 1;
                tracing::info!(
                    "preempted task {} (priority {}) for job {} (priority {})",
                    task.id,
                    victim_priority,
                    job.id,
                    job.priority
                );
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn allocate_overflow(
        &self,
        order: &[JobId],
        jobs_by_id: &mut HashMap<JobId, Job>,
        exhausted: &mut HashSet<JobId>,
        agents: &[Agent],
        counts: &mut HashMap<AgentId, i64>,
        cap: i64,
        now: DateTime<Utc>,
        settings: &Settings,
        summary: &mut TickSummary,
    ) {
        // Group the (priority desc, created asc) order into equal-priority
        // runs; higher priorities soak up leftovers first.
        let mut groups: Vec<Vec<JobId>> = Vec::new();
        let mut last_priority: Option<u8> = None;
        for job_id in order {
            if exhausted.contains(job_id) {
                continue;
            }
            let priority = match jobs_by_id.get(job_id) {
                Some(job) => job.priority,
                None => continue,
            };
            match groups.last_mut() {
                Some(group) if last_priority == Some(priority) => group.push(*job_id),
                _ => {
                    groups.push(vec![*job_id]);
                    last_priority = Some(priority);
                }
            }
        }

        for group in groups {
            let mut rotation =
                OverflowRotation::new(settings.agent_overflow_allocation_mode, group);
            if rotation.is_empty() {
                continue;
            }
            for agent in agents {
                while counts.get(&agent.id).copied().unwrap_or(0) < cap {
                    let mut assigned = false;
                    for job_id in rotation.try_order() {
                        let job = match jobs_by_id.get(&job_id) {
                            Some(job) => job.clone(),
                            None => continue,
                        };
                        if !self.registry.eligible(agent, &job, now, settings) {
                            continue;
                        }
                        match self.try_assign(&job, agent, settings, summary).await {
                            Ok(AssignOutcome::Assigned) => {
                                if let Some(count) = counts.get_mut(&agent.id) {
                                    *count += 1;
                                }
                                self.mark_started(jobs_by_id, job.id).await;
                                rotation.note_assigned(job_id);
                                assigned = true;
                                break;
                            }
                            Ok(AssignOutcome::Exhausted) => {
                                exhausted.insert(job_id);
                                rotation.remove(job_id);
                            }
                            Ok(AssignOutcome::NeedsBenchmark)
                            | Ok(AssignOutcome::DispatchFailed) => {}
                            Err(e) => {
                                tracing::error!("overflow assignment failed: {}", e);
                            }
                        }
                    }
                    if !assigned {
                        break;
                    }
                }
                if rotation.is_empty() {
                    break;
                }
            }
        }
    }

    /// Size a slice for one agent and claim it. Missing benchmarks trigger a
    /// speedtest and block this agent×attack pair only.
    async fn try_assign(
        &self,
        job: &Job,
        agent: &Agent,
        settings: &Settings,
        summary: &mut TickSummary,
    ) -> Result<AssignOutcome, SchedulerError> {
        let key = BenchmarkKey {
            agent_id: agent.id,
            attack_mode: job.attack_mode,
            hash_type: job.hash_type,
            binary_version: job.binary_version.clone(),
        };
        let hps = match self
            .benchmarks
            .lookup(&key, settings.benchmark_cache_duration)
            .await?
        {
            BenchmarkStatus::Fresh { hashes_per_second } => hashes_per_second,
            BenchmarkStatus::Stale { hashes_per_second } => {
                self.request_speedtest(agent.id, &key, settings, summary);
                if settings.benchmark_stale_ok {
                    hashes_per_second
                } else {
                    return Ok(AssignOutcome::NeedsBenchmark);
                }
            }
            BenchmarkStatus::Missing => {
                self.request_speedtest(agent.id, &key, settings, summary);
                return Ok(AssignOutcome::NeedsBenchmark);
            }
        };

        let pending = self.tasks.pending_count_for_job(job.id).await?;
        let (remaining, multiplier) = if job.uses_rule_splitting {
            // Chunk unit: (wordlist range × rule chunk); one keyspace
            // position tries one sub-rule set's worth of candidates.
            let wordlist = job.plan.wordlist_lines().unwrap_or(job.effective_keyspace);
            let per_chunk_rules =
                (job.total_rule_lines() / job.rule_chunks.len().max(1) as i64).max(1);
            (wordlist, per_chunk_rules)
        } else {
            let cursor = self.tasks.dispatch_cursor(job.id).await?;
            ((job.plan.keyspace().total - cursor).max(0), 1)
        };
        if remaining == 0 && pending == 0 {
            return Ok(AssignOutcome::Exhausted);
        }

        let params = ChunkParams {
            hashes_per_second: hps,
            target_duration: job.chunk_duration(settings.default_chunk_duration.as_secs()),
            remaining: remaining.max(1),
            fluctuation_pct: settings.chunk_fluctuation_percentage,
            min_chunk: if job.slow_hash {
                settings.slow_hash_min_chunk
            } else {
                1
            },
            per_position_multiplier: multiplier,
        };
        let size = plan_chunk(&params).max(1);

        let task = match self.tasks.claim(job, size, agent.id).await? {
            Some(task) => task,
            None => return Ok(AssignOutcome::Exhausted),
        };

        let rule_chunk = task
            .rule_chunk_index
            .and_then(|i| job.rule_chunks.get(i as usize).cloned());
        let assignment = TaskAssignment {
            task_id: task.id,
            job_id: job.id,
            hashlist_id: job.hashlist_id,
            attack: job.spec.clone(),
            hash_type: job.hash_type,
            binary_version: job.binary_version.clone(),
            keyspace_start: task.keyspace_start,
            keyspace_end: task.keyspace_end,
            rule_chunk,
            report_interval_secs: settings.progress_reporting_interval.as_secs(),
        };

        match self.transport.assign(agent.id, assignment) {
            Ok(()) => {
                summary.assigned += 1;
                tracing::info!(
                    "assigned task {} [{}, {}) of job {} to agent {}",
                    task.id,
                    task.keyspace_start,
                    task.keyspace_end,
                    job.id,
                    agent.id
                );
                Ok(AssignOutcome::Assigned)
            }
            Err(e) => {
                tracing::warn!(
                    "dispatch of task {} to agent {} failed: {}; releasing",
                    task.id,
                    agent.id,
                    e
                );
                if let Err(release_err) = self.tasks.release(task.id).await {
                    tracing::error!("release of task {} failed: {}", task.id, release_err);
                }
                Ok(AssignOutcome::DispatchFailed)
            }
        }
    }

    fn request_speedtest(
        &self,
        agent_id: AgentId,
        key: &BenchmarkKey,
        settings: &Settings,
        summary: &mut TickSummary,
    ) {
        if !self.benchmarks.begin_probe(key, settings.speedtest_timeout) {
            return;
        }
        let message = ServerMessage::Speedtest {
            attack_mode: key.attack_mode,
            hash_type: key.hash_type,
            binary_version: key.binary_version.clone(),
            duration_secs: settings.speedtest_timeout.as_secs(),
        };
        match self.transport.send(agent_id, message) {
            Ok(()) => {
                summary.speedtests += 1;
                tracing::debug!(
                    "speedtest requested from agent {} for {} type {}",
                    agent_id,
                    key.attack_mode,
                    key.hash_type
                );
            }
            Err(e) => tracing::debug!("speedtest request to {} failed: {}", agent_id, e),
        }
    }

    /// First assignment moves a pending job to running.
    async fn mark_started(&self, jobs_by_id: &mut HashMap<JobId, Job>, job_id: JobId) {
        let needs_start = jobs_by_id
            .get(&job_id)
            .map(|j| j.status == JobStatus::Pending)
            .unwrap_or(false);
        if !needs_start {
            return;
        }
        match self.jobs.transition(job_id, JobStatus::Running).await {
            Ok(updated) => {
                let _ = self
                    .notifier
                    .notify(&updated.owner, NotificationEvent::JobStarted { job_id })
                    .await;
                jobs_by_id.insert(job_id, updated);
            }
            Err(e) => tracing::debug!("job {} not started: {}", job_id, e),
        }
    }
}
