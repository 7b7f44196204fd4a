//! Bulk crawl driver.
//!
//! Executes one [`DirectoryTask`] on a dedicated thread: breadth-first over
//! an explicit visit queue, one `read_dir` per directory, host predicates
//! applied per child, and a contents veto that can drop a whole subtree
//! after its direct children have been seen. Results stream back to the
//! coordinator as one report per enumerated directory plus a terminal
//! summary.
//!
//! The thread only enumerates; whether an item actually enters the work
//! queues is decided by the coordinator (it still has to consult the store
//! for freshness).

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::events::CrawlCounters;
use crate::file_ref::FileRef;
use crate::policy::IndexingPolicy;

/// A root the host asked to index, queued until the crawl driver picks it up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryTask {
    pub root: FileRef,
    pub recurse: bool,
}

/// Messages from the crawl thread to the coordinator. Reports carry the
/// generation of the crawl that produced them so reports from a cancelled
/// crawl can be discarded.
#[derive(Debug)]
pub(crate) enum CrawlReport {
    /// One directory has been enumerated. `children` holds the accepted
    /// direct children; the directory's own event is only due when it is
    /// the task root (otherwise its parent's report already named it).
    Directory {
        generation: u64,
        dir: FileRef,
        is_root: bool,
        children: Vec<(FileRef, bool)>,
    },
    Finished {
        generation: u64,
        counters: CrawlCounters,
        was_cancelled: bool,
    },
}

/// Control surface for a running crawl.
pub(crate) struct CrawlHandle {
    cancelled: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl CrawlHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }
}

/// Start crawling `task` on a background thread.
pub(crate) fn crawl(
    generation: u64,
    task: DirectoryTask,
    policy: Arc<IndexingPolicy>,
    reports: UnboundedSender<CrawlReport>,
) -> CrawlHandle {
    let cancelled = Arc::new(AtomicBool::new(false));
    let paused = Arc::new(AtomicBool::new(false));

    let handle = CrawlHandle {
        cancelled: Arc::clone(&cancelled),
        paused: Arc::clone(&paused),
    };

    let spawned = thread::Builder::new().name("miner-crawl".into()).spawn(move || {
        run_crawl(generation, task, &policy, &reports, &cancelled, &paused);
    });
    if let Err(e) = spawned {
        log::error!("Crawler: failed to spawn crawl thread: {e}");
        handle.cancel();
    }

    handle
}

// ── Crawl loop ───────────────────────────────────────────────────────

fn run_crawl(
    generation: u64,
    task: DirectoryTask,
    policy: &IndexingPolicy,
    reports: &UnboundedSender<CrawlReport>,
    cancelled: &AtomicBool,
    paused: &AtomicBool,
) {
    let mut counters = CrawlCounters::default();
    let mut visit = VecDeque::new();

    let root_is_dir = std::fs::symlink_metadata(task.root.path())
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !root_is_dir {
        log::warn!("Crawler: {} is not a directory, nothing to crawl", task.root);
        finish(generation, reports, counters, cancelled);
        return;
    }
    if !policy.accepts_directory(&task.root) {
        counters.directories_ignored += 1;
        finish(generation, reports, counters, cancelled);
        return;
    }

    counters.directories_found += 1;
    visit.push_back(task.root.clone());

    while let Some(dir) = visit.pop_front() {
        if cancelled.load(Ordering::Relaxed) {
            break;
        }
        while paused.load(Ordering::Relaxed) && !cancelled.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(50));
        }

        let entries = match std::fs::read_dir(dir.path()) {
            Ok(rd) => rd,
            Err(e) => {
                log::warn!("Crawler: cannot enumerate {dir}: {e}");
                continue;
            }
        };

        // Enumerate every direct child before filtering; the contents veto
        // must see the full set, rejected children included.
        let mut all_children = Vec::new();
        let mut candidates = Vec::new();
        for entry in entries.flatten() {
            let child = FileRef::new(entry.path());
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            all_children.push(child.clone());
            candidates.push((child, is_dir));
        }

        if !policy.accepts_contents(&dir, &all_children) {
            log::debug!("Crawler: contents of {dir} vetoed, skipping subtree");
            for (_, is_dir) in &candidates {
                if *is_dir {
                    counters.directories_ignored += 1;
                } else {
                    counters.files_ignored += 1;
                }
            }
            let report = CrawlReport::Directory {
                generation,
                dir: dir.clone(),
                is_root: dir == task.root,
                children: Vec::new(),
            };
            if reports.send(report).is_err() {
                return;
            }
            continue;
        }

        let mut accepted = Vec::new();
        for (child, is_dir) in candidates {
            let keep = if is_dir {
                policy.accepts_directory(&child)
            } else {
                policy.accepts_file(&child)
            };
            if !keep {
                if is_dir {
                    counters.directories_ignored += 1;
                } else {
                    counters.files_ignored += 1;
                }
                continue;
            }
            if is_dir {
                counters.directories_found += 1;
                if task.recurse {
                    visit.push_back(child.clone());
                }
            } else {
                counters.files_found += 1;
            }
            accepted.push((child, is_dir));
        }

        let report = CrawlReport::Directory {
            generation,
            dir: dir.clone(),
            is_root: dir == task.root,
            children: accepted,
        };
        if reports.send(report).is_err() {
            return;
        }
    }

    finish(generation, reports, counters, cancelled);
}

fn finish(
    generation: u64,
    reports: &UnboundedSender<CrawlReport>,
    counters: CrawlCounters,
    cancelled: &AtomicBool,
) {
    let _ = reports.send(CrawlReport::Finished {
        generation,
        counters,
        was_cancelled: cancelled.load(Ordering::Relaxed),
    });
}

// ── Tests ────────────────────────────────────────────────────────────
