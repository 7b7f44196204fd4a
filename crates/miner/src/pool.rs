//! Bounded pool of in-flight extraction jobs.
//!
//! One job per file, hard-capped at the configured limit. Each job owns a
//! cancellation flag and the mutation buffer the extractor writes into.
//! Cancelled files leave a tombstone so a completion notification that
//! races the cancellation is dropped silently instead of being reported as
//! a contract violation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::file_ref::FileRef;
use crate::sparql::MutationBuilder;

/// Shared cancellation flag handed to the extractor alongside a job.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// An extraction in flight: created when the scheduler dequeues a
/// created/updated item, removed when the extractor reports completion or
/// the job is cancelled.
pub(crate) struct ProcessJob {
    pub file: FileRef,
    pub cancel: CancelFlag,
    pub builder: MutationBuilder,
}

/// In-flight job table with a hard occupancy cap.
pub(crate) struct ProcessingPool {
    jobs: HashMap<FileRef, ProcessJob>,
    limit: usize,
    tombstones: HashSet<FileRef>,
}

impl ProcessingPool {
    /// A limit below one makes no sense; clamp rather than reject.
    pub fn new(limit: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            limit: limit.max(1),
            tombstones: HashSet::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.limit
    }

    pub fn contains(&self, file: &FileRef) -> bool {
        self.jobs.contains_key(file)
    }

    /// Open a job for `file`. Returns `None` when the pool is full or the
    /// file already has one in flight.
    pub fn begin(&mut self, file: FileRef) -> Option<&ProcessJob> {
        if self.is_full() || self.jobs.contains_key(&file) {
            return None;
        }
        let job = ProcessJob {
            file: file.clone(),
            cancel: CancelFlag::new(),
            builder: MutationBuilder::new(),
        };
        self.jobs.insert(file.clone(), job);
        self.jobs.get(&file)
    }

    /// Close the job for `file`, handing its state back to the caller.
    pub fn finish(&mut self, file: &FileRef) -> Option<ProcessJob> {
        self.jobs.remove(file)
    }

    /// Fire cancellation for every job at or below `root` and remove it,
    /// leaving a tombstone per cancelled file. Returns the cancelled files.
    pub fn cancel_below(&mut self, root: &FileRef) -> Vec<FileRef> {
        let doomed: Vec<FileRef> = self
            .jobs
            .keys()
            .filter(|f| *f == root || f.has_prefix(root))
            .cloned()
            .collect();
        for file in &doomed {
            if let Some(job) = self.jobs.remove(file) {
                job.cancel.cancel();
                self.tombstones.insert(file.clone());
            }
        }
        doomed
    }

    /// Consume the tombstone for `file` if one exists. A true result means
    /// a late completion for a cancelled job and should be dropped quietly.
    pub fn take_tombstone(&mut self, file: &FileRef) -> bool {
        self.tombstones.remove(file)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
