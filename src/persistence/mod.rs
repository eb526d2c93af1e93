//! Durable local state: fsync helpers and the poll checkpoint.
//!
//! All writes that must survive a crash go through the write-to-temp,
//! fsync, rename, fsync-directory sequence in [`fsync`].

pub mod checkpoint;
pub mod fsync;

pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, LoadError, SCHEMA_VERSION, parse_process_after,
};
