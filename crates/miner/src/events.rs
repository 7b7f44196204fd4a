//! Typed filesystem events and the run counters they feed.

use std::time::Duration;

use serde::Serialize;

use crate::file_ref::FileRef;

/// A normalized per-file event, as produced by the live monitor or by the
/// bulk crawl once a directory has been enumerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Created {
        file: FileRef,
        is_dir: bool,
    },
    Updated {
        file: FileRef,
        is_dir: bool,
    },
    Deleted {
        file: FileRef,
        is_dir: bool,
    },
    Moved {
        from: FileRef,
        to: FileRef,
        is_dir: bool,
        /// Whether the source side of the move came from a watched directory.
        /// When false, the event degrades to a plain discovery of the target.
        source_monitored: bool,
    },
}

/// Found/ignored tallies for one crawl run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CrawlCounters {
    pub directories_found: u64,
    pub directories_ignored: u64,
    pub files_found: u64,
    pub files_ignored: u64,
}

impl CrawlCounters {
    /// Fold another tally into this one.
    pub fn add(&mut self, other: &CrawlCounters) {
        self.directories_found += other.directories_found;
        self.directories_ignored += other.directories_ignored;
        self.files_found += other.files_found;
        self.files_ignored += other.files_ignored;
    }
}

/// Payload of the `finished` notification, fired once per transition from
/// an active crawl to the idle state.
#[derive(Debug, Clone, Serialize)]
pub struct FinishedSummary {
    pub elapsed: Duration,
    pub directories_found: u64,
    pub directories_ignored: u64,
    pub files_found: u64,
    pub files_ignored: u64,
}

impl FinishedSummary {
    pub(crate) fn new(elapsed: Duration, counters: &CrawlCounters) -> Self {
        Self {
            elapsed,
            directories_found: counters.directories_found,
            directories_ignored: counters.directories_ignored,
            files_found: counters.files_found,
            files_ignored: counters.files_ignored,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut total = CrawlCounters::default();
        total.add(&CrawlCounters {
            directories_found: 2,
            directories_ignored: 1,
            files_found: 3,
            files_ignored: 0,
        });
        total.add(&CrawlCounters {
            directories_found: 1,
            directories_ignored: 0,
            files_found: 4,
            files_ignored: 2,
        });
        assert_eq!(total.directories_found, 3);
        assert_eq!(total.directories_ignored, 1);
        assert_eq!(total.files_found, 7);
        assert_eq!(total.files_ignored, 2);
    }
}
