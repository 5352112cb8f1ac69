//! Durable entity stores backed by SQLite
//!
//! One [`Database`] handle owns the connection and schema; the entity stores
//! (jobs, tasks, benchmarks) share it. Every mutating operation runs inside a
//! single lock scope on the connection, which is what gives the scheduler its
//! transactional single-operation guarantees.

pub mod benchmark;
pub mod db;
pub mod job;
pub mod task;

pub use benchmark::{BenchmarkKey, BenchmarkStatus, BenchmarkStore};
pub use db::Database;
pub use job::{JobAggregate, JobStore};
pub use task::{ProgressOutcome, RequeueOutcome, TaskStore};
