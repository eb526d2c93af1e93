//! Attachment Sync - crash-safe incremental mirroring of email attachments.
//!
//! A poller discovers attachments on conversations updated since the last
//! checkpoint and enqueues them in a durable spool; a pool of workers claims
//! items and downloads each one to a deterministic path. Delivery is
//! at-least-once; downloads are idempotent.

pub mod config;
pub mod persistence;
pub mod poller;
pub mod processor;
pub mod server;
pub mod source;
pub mod spool;
pub mod types;
pub mod worker;

#[cfg(test)]
mod test_utils;
