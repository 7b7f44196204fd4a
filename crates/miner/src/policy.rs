//! Host-supplied indexing policy.
//!
//! The host decides what gets indexed. Each extension point accepts any
//! number of predicates; they AND-combine with early exit on the first
//! refusal, and an empty chain accepts everything. The policy is shared
//! between the crawl thread and the coordinator loop, so predicates must be
//! `Send + Sync`.

use crate::file_ref::FileRef;

type FilePredicate = Box<dyn Fn(&FileRef) -> bool + Send + Sync>;
type ContentsPredicate = Box<dyn Fn(&FileRef, &[FileRef]) -> bool + Send + Sync>;

/// Predicate record consulted before any file or directory enters the
/// pipeline.
#[derive(Default)]
pub struct IndexingPolicy {
    file_checks: Vec<FilePredicate>,
    directory_checks: Vec<FilePredicate>,
    contents_checks: Vec<ContentsPredicate>,
    monitor_checks: Vec<FilePredicate>,
    locked_checks: Vec<FilePredicate>,
}

impl IndexingPolicy {
    /// A policy that accepts every file and directory, monitors every
    /// directory, and considers nothing locked.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a predicate deciding whether a file should be indexed.
    pub fn check_file(mut self, predicate: impl Fn(&FileRef) -> bool + Send + Sync + 'static) -> Self {
        self.file_checks.push(Box::new(predicate));
        self
    }

    /// Add a predicate deciding whether a directory should be indexed and
    /// enumerated.
    pub fn check_directory(mut self, predicate: impl Fn(&FileRef) -> bool + Send + Sync + 'static) -> Self {
        self.directory_checks.push(Box::new(predicate));
        self
    }

    /// Add a predicate that sees a directory together with its direct
    /// children and may veto the whole subtree. Used to skip backup and
    /// cache directories that are only recognizable by their contents.
    pub fn check_directory_contents(
        mut self,
        predicate: impl Fn(&FileRef, &[FileRef]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.contents_checks.push(Box::new(predicate));
        self
    }

    /// Add a predicate deciding whether a directory gets a change watch.
    pub fn monitor_directory(mut self, predicate: impl Fn(&FileRef) -> bool + Send + Sync + 'static) -> Self {
        self.monitor_checks.push(Box::new(predicate));
        self
    }

    /// Add a predicate reporting a file as externally locked. Locked files
    /// stay at the head of their queue and are retried on a later tick.
    pub fn file_locked(mut self, predicate: impl Fn(&FileRef) -> bool + Send + Sync + 'static) -> Self {
        self.locked_checks.push(Box::new(predicate));
        self
    }

    pub(crate) fn accepts_file(&self, file: &FileRef) -> bool {
        self.file_checks.iter().all(|p| p(file))
    }

    pub(crate) fn accepts_directory(&self, dir: &FileRef) -> bool {
        self.directory_checks.iter().all(|p| p(dir))
    }

    pub(crate) fn accepts_contents(&self, dir: &FileRef, children: &[FileRef]) -> bool {
        self.contents_checks.iter().all(|p| p(dir, children))
    }

    pub(crate) fn wants_monitor(&self, dir: &FileRef) -> bool {
        self.monitor_checks.iter().all(|p| p(dir))
    }

    pub(crate) fn is_locked(&self, file: &FileRef) -> bool {
        !self.locked_checks.is_empty() && self.locked_checks.iter().any(|p| p(file))
    }
}

// ── Tests ────────────────────────────────────────────────────────────
