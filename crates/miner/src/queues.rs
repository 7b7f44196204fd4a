//! Per-kind work queues feeding the scheduler.
//!
//! Four FIFOs, drained in strict priority order: deletions first so that a
//! file which was created and then deleted can never produce a spurious
//! insert, then creations, updates, and moves. Within one queue arrival
//! order is preserved.

use std::collections::VecDeque;

use crate::file_ref::FileRef;

/// An entry waiting in the moved queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MovedItem {
    pub from: FileRef,
    pub to: FileRef,
    pub is_dir: bool,
}

/// One dequeued unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum QueueEvent {
    Deleted { file: FileRef, is_dir: bool },
    Created { file: FileRef, is_dir: bool },
    Updated { file: FileRef, is_dir: bool },
    Moved(MovedItem),
}

impl QueueEvent {
    /// The file the scheduler acts on; for moves, the source.
    pub fn file(&self) -> &FileRef {
        match self {
            QueueEvent::Deleted { file, .. }
            | QueueEvent::Created { file, .. }
            | QueueEvent::Updated { file, .. } => file,
            QueueEvent::Moved(item) => &item.from,
        }
    }

    /// Whether the event concerns a directory.
    pub fn is_dir(&self) -> bool {
        match self {
            QueueEvent::Deleted { is_dir, .. }
            | QueueEvent::Created { is_dir, .. }
            | QueueEvent::Updated { is_dir, .. } => *is_dir,
            QueueEvent::Moved(item) => item.is_dir,
        }
    }
}

/// The four per-kind FIFOs.
#[derive(Default)]
pub(crate) struct WorkQueues {
    deleted: VecDeque<(FileRef, bool)>,
    created: VecDeque<(FileRef, bool)>,
    updated: VecDeque<(FileRef, bool)>,
    moved: VecDeque<MovedItem>,
}

impl WorkQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_deleted(&mut self, file: FileRef, is_dir: bool) {
        self.deleted.push_back((file, is_dir));
    }

    pub fn push_created(&mut self, file: FileRef, is_dir: bool) {
        self.created.push_back((file, is_dir));
    }

    pub fn push_updated(&mut self, file: FileRef, is_dir: bool) {
        self.updated.push_back((file, is_dir));
    }

    pub fn push_moved(&mut self, item: MovedItem) {
        self.moved.push_back(item);
    }

    /// Put an event back at the head of its queue. Used when the scheduler
    /// finds the file externally locked and wants to retry it next tick.
    pub fn push_front(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::Deleted { file, is_dir } => self.deleted.push_front((file, is_dir)),
            QueueEvent::Created { file, is_dir } => self.created.push_front((file, is_dir)),
            QueueEvent::Updated { file, is_dir } => self.updated.push_front((file, is_dir)),
            QueueEvent::Moved(item) => self.moved.push_front(item),
        }
    }

    /// Dequeue the next event by priority: deleted, created, updated, moved.
    pub fn pop_next(&mut self) -> Option<QueueEvent> {
        if let Some((file, is_dir)) = self.deleted.pop_front() {
            return Some(QueueEvent::Deleted { file, is_dir });
        }
        if let Some((file, is_dir)) = self.created.pop_front() {
            return Some(QueueEvent::Created { file, is_dir });
        }
        if let Some((file, is_dir)) = self.updated.pop_front() {
            return Some(QueueEvent::Updated { file, is_dir });
        }
        self.moved.pop_front().map(QueueEvent::Moved)
    }

    /// Drop every created/updated entry equal to or below `root`. Returns
    /// how many entries were removed. Deletions and moves stay queued.
    pub fn purge_below(&mut self, root: &FileRef) -> usize {
        let before = self.created.len() + self.updated.len();
        self.created.retain(|(f, _)| f != root && !f.has_prefix(root));
        self.updated.retain(|(f, _)| f != root && !f.has_prefix(root));
        before - (self.created.len() + self.updated.len())
    }

    pub fn len(&self) -> usize {
        self.deleted.len() + self.created.len() + self.updated.len() + self.moved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn deleted_len(&self) -> usize {
        self.deleted.len()
    }

    pub fn created_len(&self) -> usize {
        self.created.len()
    }

    pub fn updated_len(&self) -> usize {
        self.updated.len()
    }

    pub fn moved_len(&self) -> usize {
        self.moved.len()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
