//! Filesystem metadata mining pipeline.
//!
//! This crate is the indexing core of the Scour desktop search engine. It
//! discovers files and directories under host-configured roots, follows
//! live filesystem changes, and drives per-file metadata extraction into a
//! SPARQL-like semantic store so the store converges to mirror the
//! filesystem.
//!
//! The moving parts:
//!
//! - a bulk [`crawler`] that enumerates directory trees under host
//!   predicates,
//! - a live [`monitor`] producing typed create/update/delete/move events,
//! - four per-kind work queues drained in strict priority order
//!   (deletions always win),
//! - a bounded pool of in-flight extraction jobs, each with its own
//!   cancellation flag and mutation buffer,
//! - a throttled scheduler that feeds the pool one item per tick and
//!   reconciles moves, including recursive URI rewrites when a directory
//!   is renamed.
//!
//! Everything runs on one coordinator task; the host talks to it through a
//! cloneable [`MinerHandle`] and a set of policy predicates and hooks
//! supplied at construction. The store is abstract: anything implementing
//! [`Store`] works, and all durable state lives there. Queue contents are
//! in-memory only; a fresh crawl rebuilds steady state after a restart.

pub mod config;
pub mod crawler;
pub mod events;
pub mod file_ref;
pub mod miner;
pub mod monitor;
pub mod policy;
pub mod sparql;
pub mod store;

mod pool;
mod queues;

pub use config::MinerConfig;
pub use crawler::DirectoryTask;
pub use events::{CrawlCounters, FinishedSummary, FsEvent};
pub use file_ref::FileRef;
pub use miner::{IndexMiner, MinerError, MinerHandle, MinerHooks, MinerStatus};
pub use monitor::{FsMonitor, Monitor, MonitorError};
pub use policy::IndexingPolicy;
pub use pool::CancelFlag;
pub use sparql::MutationBuilder;
pub use store::{Store, StoreError};
