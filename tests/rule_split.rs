//! Rule-split equivalence: a dictionary job split across N rule chunks must
//! crack the same hashes and process the same effective keyspace as the
//! N=1 run on identical input.

mod common;

use common::*;
use crackhive::{AttackSpec, JobStatus, Settings};
use std::collections::HashSet;
use std::time::Duration;

const WORDLIST_LINES: i64 = 1_000;
const RULE_LINES: usize = 50_000;
const EFFECTIVE: i64 = WORDLIST_LINES * RULE_LINES as i64;

/// Effective positions where crackable hashes are planted — scattered so
/// different rule chunks own different ones.
const CRACK_POSITIONS: [i64; 4] = [5, 10_000_001, 23_456_789, 49_999_999];

fn split_settings(enabled: bool) -> Settings {
    let mut settings = Settings::default();
    settings.default_chunk_duration = Duration::from_secs(10);
    settings.max_concurrent_jobs_per_agent = 1;
    settings.rule_split_enabled = enabled;
    settings.rule_split_min_rules = 100;
    settings.rule_split_max_chunks = 5;
    settings.rule_split_threshold = 2.0;
    settings
}

fn rule_job(env: &TestEnv) -> crackhive::JobSpec {
    let wordlist_id = wordlist(env, WORDLIST_LINES);
    let rule_id = rules_file(env, RULE_LINES);
    let mut spec = dictionary_job(env, wordlist_id, 5, 0);
    spec.attack = AttackSpec::Dictionary {
        wordlist_id,
        rule_id: Some(rule_id),
    };
    spec
}

async fn run_to_completion(env: &TestEnv, workers: &mut [FakeAgent]) {
    for _ in 0..6 {
        env.orchestrator.scheduler.tick().await.unwrap();
        for worker in workers.iter_mut() {
            drain_and_complete(env, worker, &CRACK_POSITIONS).await;
        }
        env.orchestrator.reconciler.run_once().await.unwrap();
    }
}

#[tokio::test]
async fn rule_split_runs_five_parallel_chunks_over_one_wordlist_range() {
    let env = env_with_settings(split_settings(true));
    let job = env.orchestrator.admit_job(rule_job(&env)).await.unwrap();

    assert!(job.uses_rule_splitting);
    assert_eq!(job.rule_chunks.len(), 5);
    assert_eq!(job.effective_keyspace, EFFECTIVE);
    // Sub-file sizes balanced within one line (50,000 / 5 exactly here).
    for chunk in &job.rule_chunks {
        assert_eq!(chunk.line_count, 10_000);
    }

    let mut workers = Vec::new();
    for name in ["w1", "w2", "w3", "w4", "w5"] {
        workers.push(connect_agent(&env, name, 10_000_000).await);
    }
    env.orchestrator.scheduler.tick().await.unwrap();

    let tasks = env.orchestrator.tasks.tasks_for_job(job.id).await.unwrap();
    assert_eq!(tasks.len(), 5);

    let mut chunk_indexes = HashSet::new();
    let mut effective_ranges = Vec::new();
    for task in &tasks {
        // Every chunk task spans the same wordlist range.
        assert_eq!(task.keyspace_start, 0);
        assert_eq!(task.keyspace_end, WORDLIST_LINES);
        chunk_indexes.insert(task.rule_chunk_index.unwrap());
        effective_ranges.push((task.effective_start.unwrap(), task.effective_end.unwrap()));
    }
    assert_eq!(chunk_indexes.len(), 5);

    // The effective ranges partition [0, EFFECTIVE) with no overlap.
    effective_ranges.sort();
    let mut cursor = 0;
    for (start, end) in effective_ranges {
        assert_eq!(start, cursor);
        cursor = end;
    }
    assert_eq!(cursor, EFFECTIVE);
}

#[tokio::test]
async fn split_and_unsplit_runs_crack_the_same_hashes() {
    // Split run: five chunks across five agents.
    let split_env = env_with_settings(split_settings(true));
    let split_job = split_env.orchestrator.admit_job(rule_job(&split_env)).await.unwrap();
    let mut split_workers = Vec::new();
    for name in ["w1", "w2", "w3", "w4", "w5"] {
        split_workers.push(connect_agent(&split_env, name, 10_000_000).await);
    }
    run_to_completion(&split_env, &mut split_workers).await;

    // Unsplit run: one agent fast enough to take the whole keyspace.
    let plain_env = env_with_settings(split_settings(false));
    let plain_job = plain_env.orchestrator.admit_job(rule_job(&plain_env)).await.unwrap();
    assert!(!plain_job.uses_rule_splitting);
    let mut plain_workers = vec![connect_agent(&plain_env, "solo", 5_000_000).await];
    run_to_completion(&plain_env, &mut plain_workers).await;

    // Both runs finish their whole effective keyspace...
    for (env, job) in [(&split_env, &split_job), (&plain_env, &plain_job)] {
        let done = env.orchestrator.jobs.get(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.processed_keyspace, EFFECTIVE);
        assert_eq!(done.dispatched_keyspace, EFFECTIVE);
    }

    // ...and crack exactly the same set.
    let split_cracked = split_env.hashlists.cracked_hashes(split_env.hashlist_id);
    let plain_cracked = plain_env.hashlists.cracked_hashes(plain_env.hashlist_id);
    assert_eq!(split_cracked.len(), CRACK_POSITIONS.len());
    assert_eq!(split_cracked, plain_cracked);
}
