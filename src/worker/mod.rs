//! Worker system for draining the spool.
//!
//! Workers run as independent tokio tasks that communicate only through the
//! durable queue, so one slow download never blocks the others.
//!
//! # Architecture
//!
//! - Each worker claims one item at a time, processes it and settles it with
//!   `complete` or `fail` according to the error class
//! - An empty queue puts the worker into a bounded exponential idle backoff
//! - A maintenance task periodically returns abandoned claims to pending
//! - On shutdown workers stop claiming; an item being processed is finished
//!
//! # Module Structure
//!
//! - [`config`]: Pool size, visibility timeout and idle backoff
//! - [`worker`]: The claim-process-settle loop
//! - [`pool`]: Spawning workers and the maintenance task

mod config;
mod pool;
#[allow(clippy::module_inception)]
mod worker;

pub use config::{
    DEFAULT_RECLAIM_INTERVAL_SECS, DEFAULT_VISIBILITY_TIMEOUT_SECS, DEFAULT_WORKER_COUNT,
    WorkerConfig,
};
pub use pool::{WorkerPool, run_maintenance};
pub use worker::{WorkOutcome, Worker};
