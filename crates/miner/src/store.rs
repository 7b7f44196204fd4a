//! Contract for the backing semantic store.
//!
//! The store is an opaque SPARQL-like endpoint; the pipeline only needs
//! three operations. Each batch update is atomic at the store, and `commit`
//! makes previously applied batches durable. Implementations decide how
//! rows come back: one `Vec<String>` per row, one string per bound
//! variable, in selection order.

use std::error::Error;
use std::fmt;
use std::future::Future;

/// Errors surfaced by a [`Store`] implementation.
#[derive(Debug, Clone)]
pub enum StoreError {
    Query(String),
    Update(String),
    Commit(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Query(msg) => write!(f, "store query failed: {msg}"),
            StoreError::Update(msg) => write!(f, "store update failed: {msg}"),
            StoreError::Commit(msg) => write!(f, "store commit failed: {msg}"),
        }
    }
}

impl Error for StoreError {}

/// Asynchronous SPARQL-like endpoint consumed by the mining pipeline.
///
/// The coordinator runs probes and updates as detached tasks, so the
/// returned futures must be `Send` and the store itself shareable.
pub trait Store: Send + Sync + 'static {
    /// Run a `SELECT` and return its rows.
    fn query(&self, sparql: &str) -> impl Future<Output = Result<Vec<Vec<String>>, StoreError>> + Send;

    /// Apply one batch of update statements atomically.
    fn batch_update(&self, sparql: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Make applied batches durable.
    fn commit(&self) -> impl Future<Output = Result<(), StoreError>> + Send;
}
