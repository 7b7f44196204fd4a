//! Live filesystem change monitoring.
//!
//! The coordinator drives the [`Monitor`] control surface (one watch per
//! accepted directory); events flow back over a channel as normalized
//! [`FsEvent`]s. [`FsMonitor`] implements the surface on top of `notify`
//! with non-recursive per-directory watches, so the watched set exactly
//! mirrors what the indexing policy accepted.

use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;

use crate::events::FsEvent;
use crate::file_ref::FileRef;

/// Errors from the monitoring backend.
#[derive(Debug)]
pub enum MonitorError {
    Backend(notify::Error),
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::Backend(e) => write!(f, "monitor backend error: {e}"),
        }
    }
}

impl Error for MonitorError {}

impl From<notify::Error> for MonitorError {
    fn from(err: notify::Error) -> Self {
        MonitorError::Backend(err)
    }
}

/// Control half of the change-notification collaborator.
///
/// The event half is a channel of [`FsEvent`]s handed to the coordinator at
/// construction; implementations own whatever backend produces them.
pub trait Monitor: Send {
    /// Subscribe to changes in one directory (non-recursive).
    fn watch(&mut self, dir: &FileRef) -> Result<(), MonitorError>;

    /// Drop the watch on one directory.
    fn unwatch(&mut self, dir: &FileRef);

    /// Drop the watch on `root` and on everything below it.
    fn unwatch_below(&mut self, root: &FileRef);

    /// Whether a directory currently holds a watch.
    fn is_watching(&self, dir: &FileRef) -> bool;

    /// Number of active watches.
    fn watch_count(&self) -> usize;
}

// ── FsMonitor ────────────────────────────────────────────────────────

/// OS-backed monitor: one `notify` watch per indexed directory.
pub struct FsMonitor {
    watcher: RecommendedWatcher,
    watched: Arc<Mutex<HashSet<PathBuf>>>,
}

impl FsMonitor {
    /// Build a monitor that emits events into `events`.
    ///
    /// The backend callback runs on notify's thread; events cross into the
    /// coordinator loop through the unbounded channel.
    pub fn new(events: UnboundedSender<FsEvent>) -> Result<Self, MonitorError> {
        let watched = Arc::new(Mutex::new(HashSet::new()));
        let lookup = Arc::clone(&watched);

        let watcher = notify::recommended_watcher(move |result: Result<Event, notify::Error>| match result {
            Ok(event) => {
                let is_watched = |p: &Path| lookup.lock().map(|set| set.contains(p)).unwrap_or(false);
                for translated in translate(&event, &is_watched) {
                    if events.send(translated).is_err() {
                        break;
                    }
                }
            }
            Err(e) => log::warn!("Monitor: backend error: {e}"),
        })?;

        Ok(Self { watcher, watched })
    }
}

impl Monitor for FsMonitor {
    fn watch(&mut self, dir: &FileRef) -> Result<(), MonitorError> {
        self.watcher.watch(dir.path(), RecursiveMode::NonRecursive)?;
        if let Ok(mut set) = self.watched.lock() {
            set.insert(dir.path().to_path_buf());
        }
        log::debug!("Monitor: watching {dir}");
        Ok(())
    }

    fn unwatch(&mut self, dir: &FileRef) {
        if let Err(e) = self.watcher.unwatch(dir.path()) {
            log::debug!("Monitor: unwatch {dir}: {e}");
        }
        if let Ok(mut set) = self.watched.lock() {
            set.remove(dir.path());
        }
    }

    fn unwatch_below(&mut self, root: &FileRef) {
        let doomed: Vec<PathBuf> = match self.watched.lock() {
            Ok(set) => set
                .iter()
                .filter(|p| {
                    let watched = FileRef::new(p.as_path());
                    &watched == root || watched.has_prefix(root)
                })
                .cloned()
                .collect(),
            Err(_) => return,
        };
        for path in doomed {
            self.unwatch(&FileRef::new(&path));
        }
    }

    fn is_watching(&self, dir: &FileRef) -> bool {
        self.watched
            .lock()
            .map(|set| set.contains(dir.path()))
            .unwrap_or(false)
    }

    fn watch_count(&self) -> usize {
        self.watched.lock().map(|set| set.len()).unwrap_or(0)
    }
}

// ── Event translation ────────────────────────────────────────────────

/// Normalize one raw backend event into zero or more typed events.
///
/// Rename events carrying both endpoints become `Moved`, with
/// `source_monitored` answering whether the source's parent directory holds
/// a watch. Half renames degrade: a lone "renamed from" is a deletion, a
/// lone "renamed to" a creation.
fn translate(event: &Event, is_watched: &dyn Fn(&Path) -> bool) -> Vec<FsEvent> {
    match &event.kind {
        EventKind::Create(kind) => event
            .paths
            .iter()
            .map(|p| FsEvent::Created {
                file: FileRef::new(p),
                is_dir: created_is_dir(*kind, p),
            })
            .collect(),

        EventKind::Remove(kind) => event
            .paths
            .iter()
            .map(|p| FsEvent::Deleted {
                file: FileRef::new(p),
                is_dir: matches!(kind, RemoveKind::Folder),
            })
            .collect(),

        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both => paired_move(event, is_watched).into_iter().collect(),
            RenameMode::From => event
                .paths
                .iter()
                .map(|p| FsEvent::Deleted {
                    file: FileRef::new(p),
                    is_dir: false,
                })
                .collect(),
            RenameMode::To => event
                .paths
                .iter()
                .map(|p| FsEvent::Created {
                    file: FileRef::new(p),
                    is_dir: stat_is_dir(p),
                })
                .collect(),
            // Some backends report renames without telling which side;
            // a two-path event still pairs up, otherwise treat as update.
            _ => {
                if event.paths.len() == 2 {
                    paired_move(event, is_watched).into_iter().collect()
                } else {
                    updates(event)
                }
            }
        },

        EventKind::Modify(_) => updates(event),

        // Access events and backend chatter carry no indexable change.
        _ => Vec::new(),
    }
}

fn paired_move(event: &Event, is_watched: &dyn Fn(&Path) -> bool) -> Option<FsEvent> {
    let from = event.paths.first()?;
    let to = event.paths.get(1)?;
    let source_monitored = from.parent().map(is_watched).unwrap_or(false);
    Some(FsEvent::Moved {
        from: FileRef::new(from),
        to: FileRef::new(to),
        is_dir: stat_is_dir(to),
        source_monitored,
    })
}

fn updates(event: &Event) -> Vec<FsEvent> {
    event
        .paths
        .iter()
        .map(|p| FsEvent::Updated {
            file: FileRef::new(p),
            is_dir: stat_is_dir(p),
        })
        .collect()
}

fn created_is_dir(kind: CreateKind, path: &Path) -> bool {
    match kind {
        CreateKind::Folder => true,
        CreateKind::File => false,
        _ => stat_is_dir(path),
    }
}

fn stat_is_dir(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

// ── Tests ────────────────────────────────────────────────────────────
