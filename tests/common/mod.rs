//! Shared harness for end-to-end scheduler tests: an in-memory orchestrator
//! plus scripted agents that answer assignments the way a real worker would.

#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedReceiver;

use crackhive::services::{FileInfo, HashlistInfo, InMemoryFiles, InMemoryHashlists};
use crackhive::{
    services::RecordingNotifier, Agent, AgentMessage, AttackSpec, FileId, HashlistId, JobSpec,
    Orchestrator, OrchestratorConfig, ServerMessage, ServiceSet, Settings, TaskSummary,
};

pub struct TestEnv {
    pub orchestrator: Orchestrator,
    pub hashlists: Arc<InMemoryHashlists>,
    pub files: Arc<InMemoryFiles>,
    pub notifier: Arc<RecordingNotifier>,
    pub hashlist_id: HashlistId,
    pub tempdir: tempfile::TempDir,
}

pub fn env_with_settings(mut settings: Settings) -> TestEnv {
    let (services, hashlists, files, notifier) = ServiceSet::in_memory();
    let tempdir = tempfile::tempdir().unwrap();
    settings.rule_chunk_temp_dir = tempdir.path().join("chunks");

    let hashlist_id = HashlistId::new();
    hashlists.insert(HashlistInfo {
        id: hashlist_id,
        hash_count: 1_000,
        uncracked_count: 1_000,
        hash_type: 0,
        mixed_work_factors: false,
        slow_hash: false,
    });

    let config = OrchestratorConfig {
        db_path: None,
        settings,
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(config, services).unwrap();

    TestEnv {
        orchestrator,
        hashlists,
        files,
        notifier,
        hashlist_id,
        tempdir,
    }
}

pub fn write_lines(dir: &std::path::Path, name: &str, lines: usize) -> PathBuf {
    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    for i in 0..lines {
        writeln!(f, "entry{}", i).unwrap();
    }
    path
}

/// Register a wordlist. Only the reported line count matters to the core.
pub fn wordlist(env: &TestEnv, line_count: i64) -> FileId {
    let id = FileId::new();
    env.files.insert_wordlist(FileInfo {
        id,
        path: write_lines(env.tempdir.path(), &format!("wl-{id}.txt"), 16),
        line_count,
    });
    id
}

/// Register a rules file with real content (the splitter reads it).
pub fn rules_file(env: &TestEnv, lines: usize) -> FileId {
    let id = FileId::new();
    env.files.insert_rules(FileInfo {
        id,
        path: write_lines(env.tempdir.path(), &format!("rules-{id}.rule"), lines),
        line_count: lines as i64,
    });
    id
}

pub fn dictionary_job(env: &TestEnv, wordlist_id: FileId, priority: u8, max_agents: u32) -> JobSpec {
    JobSpec {
        owner: "operator".to_string(),
        hashlist_id: env.hashlist_id,
        attack: AttackSpec::Dictionary {
            wordlist_id,
            rule_id: None,
        },
        binary_version: "default".to_string(),
        priority,
        max_agents,
        allow_preempt: false,
        chunk_duration_secs: None,
    }
}

/// A scripted worker: registered, connected and benchmarked, with its
/// outbound message stream in hand.
pub struct FakeAgent {
    pub agent: Agent,
    pub rx: UnboundedReceiver<ServerMessage>,
}

pub async fn connect_agent(env: &TestEnv, name: &str, hps: u64) -> FakeAgent {
    let mut agent = Agent::new(name);
    agent.binary_versions = vec!["7.0.0".to_string()];
    env.orchestrator.registry.register(&agent).await.unwrap();
    let rx = env.orchestrator.transport.connect_agent(agent.id);

    let key = crackhive::store::BenchmarkKey {
        agent_id: agent.id,
        attack_mode: crackhive::AttackMode::Dictionary,
        hash_type: 0,
        binary_version: "7.0.0".to_string(),
    };
    env.orchestrator.benchmarks.record(&key, hps).await.unwrap();

    FakeAgent { agent, rx }
}

/// Drain the agent's queue, acknowledging and instantly completing every
/// assignment. `crack_positions` are effective keyspace positions of
/// plantable hashes: any assignment whose effective range contains one
/// reports it cracked as `hash-<position>`. Returns completed task count.
pub async fn drain_and_complete(env: &TestEnv, worker: &mut FakeAgent, crack_positions: &[i64]) -> usize {
    let mut completed = 0;
    while let Ok(message) = worker.rx.try_recv() {
        let assignment = match message {
            ServerMessage::AssignTask { assignment } => assignment,
            _ => continue,
        };
        let task_id = assignment.task_id;
        env.orchestrator
            .transport
            .handle_message(worker.agent.id, AgentMessage::TaskAck { task_id })
            .await
            .unwrap();

        // Effective coverage comes from the stored slice, the way a worker
        // derives it from wordlist × sub-rules.
        let task = env.orchestrator.tasks.get(task_id).await.unwrap();
        let (eff_start, eff_end) = match (task.effective_start, task.effective_end) {
            (Some(s), Some(e)) => (s, e),
            _ => (task.keyspace_start, task.keyspace_end),
        };

        let mut cracked = 0u32;
        for &position in crack_positions {
            if position >= eff_start && position < eff_end {
                env.orchestrator
                    .transport
                    .handle_message(
                        worker.agent.id,
                        AgentMessage::Crack {
                            task_id,
                            hash: format!("hash-{position}"),
                            plaintext: format!("plain-{position}"),
                            username: None,
                            domain: None,
                        },
                    )
                    .await
                    .unwrap();
                cracked += 1;
            }
        }

        env.orchestrator
            .transport
            .handle_message(
                worker.agent.id,
                AgentMessage::TaskCompleted {
                    task_id,
                    summary: TaskSummary {
                        keyspace_processed: task.range_len(),
                        effective_processed: eff_end - eff_start,
                        cracked_count: cracked,
                    },
                },
            )
            .await
            .unwrap();
        completed += 1;
    }
    completed
}

/// Send one progress report for the given task.
pub async fn report_progress(env: &TestEnv, worker: &FakeAgent, task_id: crackhive::TaskId, seq: i64, processed: i64) {
    env.orchestrator
        .transport
        .handle_message(
            worker.agent.id,
            AgentMessage::Progress {
                task_id,
                seq,
                keyspace_processed: processed,
                effective_processed: 0,
                hashes_per_second: 10_000,
                timestamp: Utc::now(),
            },
        )
        .await
        .unwrap();
    env.orchestrator.transport.flush_progress().await;
}
