//! The mining coordinator.
//!
//! One tokio task owns every queue, the processing pool, and the crawl and
//! monitor plumbing; control traffic, crawl reports, monitor events, and
//! store-operation completions all arrive over channels and are handled
//! strictly one at a time, so there is no shared mutable state anywhere in
//! the pipeline. Store probes, batch updates, and commits run as detached
//! tasks that post their outcome back onto the loop.
//!
//! Dispatch follows a single armed tick: at most one scheduler timer exists
//! at any moment, delayed by `throttle × max_tick_delay_ms`. Each tick
//! dispatches one queue item by priority (deleted, created, updated, moved)
//! and re-arms itself while work remains.

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::MinerConfig;
use crate::crawler::{self, CrawlHandle, CrawlReport, DirectoryTask};
use crate::events::{CrawlCounters, FinishedSummary, FsEvent};
use crate::file_ref::FileRef;
use crate::monitor::Monitor;
use crate::policy::IndexingPolicy;
use crate::pool::{CancelFlag, ProcessingPool};
use crate::queues::{MovedItem, QueueEvent, WorkQueues};
use crate::sparql::{self, MutationBuilder};
use crate::store::Store;

// ── Public surface ───────────────────────────────────────────────────

/// Error returned by handle operations after the pipeline has stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MinerError {
    Shutdown,
}

impl fmt::Display for MinerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MinerError::Shutdown => write!(f, "mining pipeline has shut down"),
        }
    }
}

impl Error for MinerError {}

/// Host callbacks invoked from the coordinator loop.
pub struct MinerHooks {
    /// Metadata extraction entry point. Return true to accept the file and
    /// commit to calling `notify_file` for it eventually (sync or async);
    /// return false to decline, discarding anything already written to the
    /// builder.
    pub process_file: Box<dyn FnMut(&FileRef, &MutationBuilder, &CancelFlag) -> bool + Send>,
    /// Fired exactly once per transition from an active crawl to idle.
    pub finished: Box<dyn FnMut(&FinishedSummary) + Send>,
    /// Progress in `[0, 1]`, reported at most once per second.
    pub progress: Box<dyn FnMut(f64) + Send>,
}

impl Default for MinerHooks {
    fn default() -> Self {
        Self {
            process_file: Box::new(|file, _, _| {
                log::debug!("Miner: no extractor registered, declining {file}");
                false
            }),
            finished: Box::new(|_| {}),
            progress: Box::new(|_| {}),
        }
    }
}

/// Point-in-time snapshot of the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct MinerStatus {
    pub crawling: bool,
    pub paused: bool,
    pub throttle: f64,
    pub progress: f64,
    pub queued_deleted: usize,
    pub queued_created: usize,
    pub queued_updated: usize,
    pub queued_moved: usize,
    pub pool_in_flight: usize,
    pub watched_directories: usize,
    pub run: CrawlCounters,
    pub totals: CrawlCounters,
}

// ── Messages ─────────────────────────────────────────────────────────

enum Control {
    AddDirectory { root: FileRef, recurse: bool },
    RemoveDirectory { root: FileRef },
    SetThrottle(f64),
    GetThrottle(oneshot::Sender<f64>),
    Pause,
    Resume,
    NotifyFile { file: FileRef, error: Option<String> },
    GetStatus(oneshot::Sender<MinerStatus>),
    Shutdown,
}

/// Outcome of a detached store operation, posted back onto the loop.
enum Completion {
    DeleteDone { updated: bool },
    UpdateDone { ok: bool },
    MoveDone { follow_up: MoveFollowUp, updated: bool },
    CommitDone,
}

/// What a resolved move asks the coordinator to do next.
enum MoveFollowUp {
    None,
    Created { file: FileRef, is_dir: bool },
    Deleted { file: FileRef, is_dir: bool },
    SeedTask { root: FileRef },
}

// ── Handle ───────────────────────────────────────────────────────────

/// Cloneable control handle for a running [`IndexMiner`].
#[derive(Clone)]
pub struct MinerHandle {
    control: UnboundedSender<Control>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MinerHandle {
    fn send(&self, msg: Control) -> Result<(), MinerError> {
        self.control.send(msg).map_err(|_| MinerError::Shutdown)
    }

    /// Queue a root for crawling. A recursive task descends the whole
    /// subtree; a non-recursive one indexes a single level.
    pub fn add_directory(&self, root: impl Into<FileRef>, recurse: bool) -> Result<(), MinerError> {
        self.send(Control::AddDirectory {
            root: root.into(),
            recurse,
        })
    }

    /// Stop indexing a root: purges queued work under it, cancels in-flight
    /// jobs, drops pending crawl tasks, and releases its watches.
    pub fn remove_directory(&self, root: impl Into<FileRef>) -> Result<(), MinerError> {
        self.send(Control::RemoveDirectory { root: root.into() })
    }

    /// Set the pacing factor in `[0, 1]`. Takes effect immediately, even
    /// for an already scheduled dispatch.
    pub fn set_throttle(&self, throttle: f64) -> Result<(), MinerError> {
        self.send(Control::SetThrottle(throttle))
    }

    pub async fn get_throttle(&self) -> Result<f64, MinerError> {
        let (tx, rx) = oneshot::channel();
        self.send(Control::GetThrottle(tx))?;
        rx.await.map_err(|_| MinerError::Shutdown)
    }

    /// Pause dispatching. The crawler pauses too; in-flight jobs drain
    /// naturally.
    pub fn pause(&self) -> Result<(), MinerError> {
        self.send(Control::Pause)
    }

    pub fn resume(&self) -> Result<(), MinerError> {
        self.send(Control::Resume)
    }

    /// Extractor completion callback: `None` submits the accumulated
    /// mutation as a batch update, `Some(error)` drops the job.
    pub fn notify_file(&self, file: impl Into<FileRef>, error: Option<String>) -> Result<(), MinerError> {
        self.send(Control::NotifyFile {
            file: file.into(),
            error,
        })
    }

    pub async fn status(&self) -> Result<MinerStatus, MinerError> {
        let (tx, rx) = oneshot::channel();
        self.send(Control::GetStatus(tx))?;
        rx.await.map_err(|_| MinerError::Shutdown)
    }

    pub async fn progress(&self) -> Result<f64, MinerError> {
        Ok(self.status().await?.progress)
    }

    /// Request shutdown and wait for the pipeline to drain. In-flight work
    /// gets a grace period (5 s by default); whatever is still pending
    /// after that is abandoned with an error log.
    pub async fn shutdown(&self) -> Result<(), MinerError> {
        self.send(Control::Shutdown)?;
        self.join().await;
        Ok(())
    }

    /// Wait for the coordinator task to end.
    pub async fn join(&self) {
        let handle = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

// ── Coordinator ──────────────────────────────────────────────────────

struct ActiveCrawl {
    handle: CrawlHandle,
    root: FileRef,
    generation: u64,
}

/// The mining pipeline: crawl + monitor fused into ordered per-file work,
/// throttled and dispatched into a bounded extraction pool against a store.
pub struct IndexMiner<S: Store> {
    config: MinerConfig,
    policy: Arc<IndexingPolicy>,
    hooks: MinerHooks,
    store: Arc<S>,
    monitor: Box<dyn Monitor>,

    queues: WorkQueues,
    pool: ProcessingPool,

    pending_tasks: VecDeque<DirectoryTask>,
    active_crawl: Option<ActiveCrawl>,
    crawl_generation: u64,
    crawling: bool,
    run_active: bool,
    been_crawled: bool,
    crawl_started: Option<Instant>,

    paused: bool,
    throttle: f64,
    shutting_down: bool,

    move_in_flight: bool,
    pending_ops: usize,
    updates_since_commit: u64,

    total_items: u64,
    progress_floor: f64,
    last_progress_emit: Option<Instant>,

    run_counters: CrawlCounters,
    total_counters: CrawlCounters,

    tick_deadline: Option<Instant>,

    completion_tx: UnboundedSender<Completion>,
    crawl_tx: UnboundedSender<CrawlReport>,
}

impl<S: Store> IndexMiner<S> {
    /// Start the pipeline on the current tokio runtime and return its
    /// control handle. `events` is the monitor's event channel.
    pub fn spawn(
        config: MinerConfig,
        policy: IndexingPolicy,
        hooks: MinerHooks,
        store: S,
        monitor: Box<dyn Monitor>,
        events: UnboundedReceiver<FsEvent>,
    ) -> MinerHandle {
        let config = config.sanitized();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (crawl_tx, crawl_rx) = mpsc::unbounded_channel();

        let miner = IndexMiner {
            throttle: config.throttle,
            pool: ProcessingPool::new(config.pool_limit),
            policy: Arc::new(policy),
            hooks,
            store: Arc::new(store),
            monitor,
            queues: WorkQueues::new(),
            pending_tasks: VecDeque::new(),
            active_crawl: None,
            crawl_generation: 0,
            crawling: false,
            run_active: false,
            been_crawled: false,
            crawl_started: None,
            paused: false,
            shutting_down: false,
            move_in_flight: false,
            pending_ops: 0,
            updates_since_commit: 0,
            total_items: 0,
            progress_floor: 0.0,
            last_progress_emit: None,
            run_counters: CrawlCounters::default(),
            total_counters: CrawlCounters::default(),
            tick_deadline: None,
            completion_tx,
            crawl_tx,
            config,
        };

        let task = tokio::spawn(miner.run(control_rx, crawl_rx, events, completion_rx));
        MinerHandle {
            control: control_tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn run(
        mut self,
        mut control_rx: UnboundedReceiver<Control>,
        mut crawl_rx: UnboundedReceiver<CrawlReport>,
        mut monitor_rx: UnboundedReceiver<FsEvent>,
        mut completion_rx: UnboundedReceiver<Completion>,
    ) {
        log::info!("Miner: pipeline started (pool limit {})", self.pool.limit());

        loop {
            let deadline = self.tick_deadline;
            let tick = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                msg = control_rx.recv() => {
                    match msg {
                        Some(msg) => {
                            if self.handle_control(msg) {
                                break;
                            }
                        }
                        // Every handle clone is gone: nothing can drive or
                        // join the pipeline anymore, so stop instead of
                        // leaking the task.
                        None => break,
                    }
                }
                Some(report) = crawl_rx.recv() => self.handle_crawl_report(report).await,
                Some(event) = monitor_rx.recv() => self.handle_monitor_event(event).await,
                Some(done) = completion_rx.recv() => self.handle_completion(done).await,
                _ = tick => {
                    self.tick_deadline = None;
                    self.tick();
                }
            }
        }

        self.drain(&mut control_rx, &mut completion_rx).await;
        log::info!("Miner: pipeline stopped");
    }

    /// Shutdown phase: let in-flight jobs and store operations finish under
    /// a watchdog, then make the last updates durable.
    async fn drain(
        &mut self,
        control_rx: &mut UnboundedReceiver<Control>,
        completion_rx: &mut UnboundedReceiver<Completion>,
    ) {
        self.shutting_down = true;
        if let Some(active) = &self.active_crawl {
            active.handle.cancel();
        }
        self.pending_tasks.clear();

        let watchdog = Instant::now() + Duration::from_millis(self.config.shutdown_grace_ms);
        while !self.pool.is_empty() || self.pending_ops > 0 {
            tokio::select! {
                _ = tokio::time::sleep_until(watchdog) => {
                    log::error!(
                        "Miner: shutdown watchdog expired with {} jobs and {} store operations in flight",
                        self.pool.len(),
                        self.pending_ops,
                    );
                    return;
                }
                Some(msg) = control_rx.recv() => {
                    if let Control::NotifyFile { file, error } = msg {
                        self.handle_notify_file(file, error);
                    }
                }
                Some(done) = completion_rx.recv() => self.handle_completion(done).await,
            }
        }

        if self.updates_since_commit > 0 {
            self.updates_since_commit = 0;
            if let Err(e) = self.store.commit().await {
                log::error!("Miner: final commit failed: {e}");
            }
        }
    }

    // ── Control handling ─────────────────────────────────────────────

    fn handle_control(&mut self, msg: Control) -> bool {
        match msg {
            Control::AddDirectory { root, recurse } => {
                log::info!("Miner: add directory {root} (recurse: {recurse})");
                self.schedule_task(root, recurse);
            }
            Control::RemoveDirectory { root } => self.remove_directory(root),
            Control::SetThrottle(throttle) => self.set_throttle(throttle),
            Control::GetThrottle(reply) => {
                let _ = reply.send(self.throttle);
            }
            Control::Pause => self.pause(),
            Control::Resume => self.resume(),
            Control::NotifyFile { file, error } => self.handle_notify_file(file, error),
            Control::GetStatus(reply) => {
                let _ = reply.send(self.status());
            }
            Control::Shutdown => return true,
        }
        false
    }

    fn schedule_task(&mut self, root: FileRef, recurse: bool) {
        self.pending_tasks.push_back(DirectoryTask { root, recurse });
        if !self.run_active {
            self.start_run();
        }
        self.crawling = true;
        self.start_next_crawl_if_idle();
    }

    /// Transition idle → active: counters and progress start over.
    fn start_run(&mut self) {
        self.run_active = true;
        self.run_counters = CrawlCounters::default();
        self.total_items = 0;
        self.progress_floor = 0.0;
        self.last_progress_emit = None;
        self.crawl_started = Some(Instant::now());
    }

    fn start_next_crawl_if_idle(&mut self) {
        if self.active_crawl.is_some() {
            return;
        }
        if let Some(task) = self.pending_tasks.pop_front() {
            self.crawl_generation += 1;
            let root = task.root.clone();
            let handle = crawler::crawl(
                self.crawl_generation,
                task,
                Arc::clone(&self.policy),
                self.crawl_tx.clone(),
            );
            if self.paused {
                handle.set_paused(true);
            }
            self.active_crawl = Some(ActiveCrawl {
                handle,
                root,
                generation: self.crawl_generation,
            });
        } else {
            self.crawling = false;
        }
    }

    fn remove_directory(&mut self, root: FileRef) {
        log::info!("Miner: remove directory {root}");
        self.pending_tasks
            .retain(|t| t.root != root && !t.root.has_prefix(&root));

        let crawling_below = self
            .active_crawl
            .as_ref()
            .is_some_and(|active| active.root == root || active.root.has_prefix(&root));
        if crawling_below {
            if let Some(active) = self.active_crawl.take() {
                active.handle.cancel();
            }
            self.start_next_crawl_if_idle();
        }

        let purged = self.queues.purge_below(&root);
        let cancelled = self.pool.cancel_below(&root);
        if purged > 0 || !cancelled.is_empty() {
            log::debug!(
                "Miner: removed {purged} queued items and {} in-flight jobs under {root}",
                cancelled.len(),
            );
        }
        self.monitor.unwatch_below(&root);
        self.arm_tick();
        self.check_idle();
    }

    fn set_throttle(&mut self, throttle: f64) {
        self.throttle = throttle.clamp(0.0, 1.0);
        log::debug!("Miner: throttle set to {:.2}", self.throttle);
        if self.tick_deadline.is_some() {
            // Tear down the pending timer so the new cadence applies now
            self.tick_deadline = None;
            self.arm_tick();
        }
    }

    fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        if let Some(active) = &self.active_crawl {
            active.handle.set_paused(true);
        }
        self.tick_deadline = None;
        log::info!("Miner: paused");
    }

    fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        if let Some(active) = &self.active_crawl {
            active.handle.set_paused(false);
        }
        if !self.queues.is_empty() {
            self.arm_tick();
        }
        log::info!("Miner: resumed");
    }

    fn handle_notify_file(&mut self, file: FileRef, error: Option<String>) {
        if self.pool.take_tombstone(&file) {
            log::debug!("Miner: dropping completion for cancelled job {file}");
            return;
        }
        let Some(job) = self.pool.finish(&file) else {
            log::error!("Miner: extractor completion for {file} with no job in flight");
            return;
        };
        match error {
            Some(err) => {
                log::info!("Miner: extraction failed for {file}: {err}");
                self.maybe_emit_progress();
            }
            None => {
                let update = sparql::extraction_update(&job.file, &job.builder);
                self.spawn_update(job.file, update);
            }
        }
        // A pool slot opened up
        self.arm_tick();
        self.check_idle();
    }

    fn status(&self) -> MinerStatus {
        MinerStatus {
            crawling: self.crawling,
            paused: self.paused,
            throttle: self.throttle,
            progress: self.progress(),
            queued_deleted: self.queues.deleted_len(),
            queued_created: self.queues.created_len(),
            queued_updated: self.queues.updated_len(),
            queued_moved: self.queues.moved_len(),
            pool_in_flight: self.pool.len(),
            watched_directories: self.monitor.watch_count(),
            run: self.run_counters,
            totals: self.total_counters,
        }
    }

    // ── Crawl reports ────────────────────────────────────────────────

    fn is_current_generation(&self, generation: u64) -> bool {
        self.active_crawl
            .as_ref()
            .is_some_and(|a| a.generation == generation)
    }

    async fn handle_crawl_report(&mut self, report: CrawlReport) {
        match report {
            CrawlReport::Directory {
                generation,
                dir,
                is_root,
                children,
            } => {
                if !self.is_current_generation(generation) {
                    return;
                }
                if self.policy.wants_monitor(&dir)
                    && let Err(e) = self.monitor.watch(&dir)
                {
                    log::warn!("Miner: cannot watch {dir}: {e}");
                }
                if is_root {
                    self.enqueue_created(dir, true).await;
                }
                for (child, is_dir) in children {
                    self.enqueue_created(child, is_dir).await;
                }
            }
            CrawlReport::Finished {
                generation,
                counters,
                was_cancelled,
            } => {
                if !self.is_current_generation(generation) {
                    return;
                }
                log::info!(
                    "Miner: crawl finished: {} directories, {} files{}",
                    counters.directories_found,
                    counters.files_found,
                    if was_cancelled { " (cancelled)" } else { "" },
                );
                self.run_counters.add(&counters);
                self.total_counters.add(&counters);
                self.active_crawl = None;
                self.start_next_crawl_if_idle();
                self.arm_tick();
                self.check_idle();
            }
        }
    }

    // ── Monitor events ───────────────────────────────────────────────

    async fn handle_monitor_event(&mut self, event: FsEvent) {
        match event {
            FsEvent::Created { file, is_dir } => {
                if is_dir {
                    if self.policy.accepts_directory(&file) {
                        self.schedule_task(file, true);
                    } else {
                        log::debug!("Miner: created directory {file} rejected by policy");
                    }
                } else if self.policy.accepts_file(&file) {
                    self.enqueue_created(file, false).await;
                }
            }
            FsEvent::Updated { file, is_dir } => {
                let accepted = if is_dir {
                    self.policy.accepts_directory(&file)
                } else {
                    self.policy.accepts_file(&file)
                };
                if accepted {
                    self.enqueue_updated(file, is_dir).await;
                }
            }
            FsEvent::Deleted { file, is_dir } => {
                if is_dir {
                    self.monitor.unwatch_below(&file);
                }
                self.queues.push_deleted(file, is_dir);
                self.total_items += 1;
                self.arm_tick();
            }
            FsEvent::Moved {
                from,
                to,
                is_dir,
                source_monitored,
            } => {
                if is_dir {
                    self.monitor.unwatch_below(&from);
                }
                if !source_monitored {
                    // The source was never ours; this is a plain discovery
                    // of the target.
                    if is_dir {
                        if self.policy.accepts_directory(&to) {
                            self.schedule_task(to, true);
                        }
                    } else if self.policy.accepts_file(&to) {
                        self.enqueue_created(to, false).await;
                    }
                } else {
                    self.queues.push_moved(MovedItem { from, to, is_dir });
                    self.total_items += 1;
                    self.arm_tick();
                }
            }
        }
    }

    // ── Enqueueing with freshness check ──────────────────────────────

    async fn enqueue_created(&mut self, file: FileRef, is_dir: bool) {
        if self.is_already_fresh(&file).await {
            return;
        }
        self.queues.push_created(file, is_dir);
        self.total_items += 1;
        self.arm_tick();
    }

    async fn enqueue_updated(&mut self, file: FileRef, is_dir: bool) {
        if self.is_already_fresh(&file).await {
            return;
        }
        self.queues.push_updated(file, is_dir);
        self.total_items += 1;
        self.arm_tick();
    }

    /// True when the store already records the file's current mtime, so
    /// re-extracting it would change nothing.
    async fn is_already_fresh(&mut self, file: &FileRef) -> bool {
        let Some(mtime) = file.modified_time() else {
            log::debug!("Miner: {file} vanished before enqueue");
            return true;
        };
        let query = sparql::mtime_match_query(&file.uri(), &sparql::format_mtime_utc(mtime));
        match self.store.query(&query).await {
            Ok(rows) => {
                let fresh = !rows.is_empty();
                if fresh {
                    log::debug!("Miner: {file} already up to date, skipping");
                }
                fresh
            }
            Err(e) => {
                log::error!("Miner: freshness query for {file} failed: {e}");
                false
            }
        }
    }

    // ── Scheduler ────────────────────────────────────────────────────

    fn tick_delay(&self) -> Duration {
        if self.throttle <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_millis((self.throttle * self.config.max_tick_delay_ms as f64) as u64)
        }
    }

    /// Install the scheduler timer unless one is present or dispatching is
    /// suspended. At most one timer exists at any time.
    fn arm_tick(&mut self) {
        if self.paused || self.shutting_down || self.move_in_flight || self.tick_deadline.is_some() {
            return;
        }
        self.tick_deadline = Some(Instant::now() + self.tick_delay());
    }

    fn tick(&mut self) {
        if self.paused || self.shutting_down || self.move_in_flight {
            return;
        }
        if self.pool.is_full() {
            // Re-armed when a job completes
            return;
        }
        let Some(event) = self.queues.pop_next() else {
            self.check_idle();
            return;
        };

        if self.policy.is_locked(event.file()) {
            log::debug!("Miner: {} is locked, retrying later", event.file());
            self.queues.push_front(event);
            // Stay scheduled, but not in a busy loop
            self.tick_deadline = Some(Instant::now() + self.tick_delay().max(Duration::from_millis(100)));
            return;
        }

        match event {
            QueueEvent::Deleted { file, .. } => self.dispatch_deleted(file),
            QueueEvent::Created { .. } | QueueEvent::Updated { .. } => self.dispatch_extraction(event),
            QueueEvent::Moved(item) => self.dispatch_move(item),
        }
        self.arm_tick();
        self.maybe_emit_progress();
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    fn dispatch_deleted(&mut self, file: FileRef) {
        self.pending_ops += 1;
        let store = Arc::clone(&self.store);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let uri = file.uri();
            let present = match store.query(&sparql::presence_query(&uri)).await {
                Ok(rows) => !rows.is_empty(),
                Err(e) => {
                    log::error!("Miner: presence query for {file} failed: {e}");
                    false
                }
            };
            let mut updated = false;
            if present {
                match store.batch_update(&sparql::delete_resource(&uri)).await {
                    Ok(()) => updated = true,
                    Err(e) => log::error!("Miner: delete for {file} failed: {e}"),
                }
            } else {
                log::debug!("Miner: {file} not in store, delete skipped");
            }
            let _ = tx.send(Completion::DeleteDone { updated });
        });
    }

    /// Open an extraction job for a created/updated queue entry.
    fn dispatch_extraction(&mut self, event: QueueEvent) {
        let file = event.file().clone();
        if self.pool.contains(&file) {
            // One job per file; the change will be picked up again once the
            // current extraction completes.
            log::debug!("Miner: {file} already being processed, requeueing");
            self.queues.push_updated(file, event.is_dir());
            return;
        }
        let (builder, cancel) = match self.pool.begin(file.clone()) {
            Some(job) => (job.builder.clone(), job.cancel.clone()),
            None => {
                // Pool filled up; put the event back unchanged and wait for
                // a slot to free.
                self.queues.push_front(event);
                return;
            }
        };
        let accepted = (self.hooks.process_file)(&file, &builder, &cancel);
        if !accepted {
            log::debug!("Miner: extractor declined {file}");
            self.pool.finish(&file);
            self.maybe_emit_progress();
        }
    }

    fn dispatch_move(&mut self, item: MovedItem) {
        // Queue dispatch is suspended until the move resolves; descendant
        // rewrites must not interleave with other mutations.
        self.move_in_flight = true;
        self.pending_ops += 1;
        let store = Arc::clone(&self.store);
        let policy = Arc::clone(&self.policy);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let (follow_up, updated) = resolve_move(store.as_ref(), &policy, &item).await;
            let _ = tx.send(Completion::MoveDone { follow_up, updated });
        });
    }

    fn spawn_update(&mut self, file: FileRef, update: String) {
        self.pending_ops += 1;
        let store = Arc::clone(&self.store);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let ok = match store.batch_update(&update).await {
                Ok(()) => true,
                Err(e) => {
                    log::error!("Miner: update for {file} failed: {e}");
                    false
                }
            };
            let _ = tx.send(Completion::UpdateDone { ok });
        });
    }

    fn spawn_commit(&mut self) {
        self.updates_since_commit = 0;
        self.pending_ops += 1;
        let store = Arc::clone(&self.store);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = store.commit().await {
                log::error!("Miner: commit failed: {e}");
            }
            let _ = tx.send(Completion::CommitDone);
        });
    }

    // ── Completions ──────────────────────────────────────────────────

    async fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::UpdateDone { ok } => {
                self.pending_ops -= 1;
                if ok {
                    self.note_update_applied();
                }
                self.maybe_emit_progress();
            }
            Completion::DeleteDone { updated } => {
                self.pending_ops -= 1;
                if updated {
                    self.note_update_applied();
                }
                self.maybe_emit_progress();
            }
            Completion::MoveDone { follow_up, updated } => {
                self.pending_ops -= 1;
                self.move_in_flight = false;
                if updated {
                    self.note_update_applied();
                }
                match follow_up {
                    MoveFollowUp::None => {}
                    MoveFollowUp::Created { file, is_dir } => {
                        self.enqueue_created(file, is_dir).await;
                    }
                    MoveFollowUp::Deleted { file, is_dir } => {
                        self.queues.push_deleted(file, is_dir);
                        self.total_items += 1;
                    }
                    MoveFollowUp::SeedTask { root } => self.schedule_task(root, true),
                }
                self.maybe_emit_progress();
            }
            Completion::CommitDone => {
                self.pending_ops -= 1;
            }
        }
        self.arm_tick();
        self.check_idle();
    }

    /// A batch update landed: in live mode every update commits right away,
    /// during the initial crawl durability waits for `process_stop`.
    fn note_update_applied(&mut self) {
        self.updates_since_commit += 1;
        if self.been_crawled {
            self.spawn_commit();
        }
    }

    // ── Idle transition ──────────────────────────────────────────────

    fn check_idle(&mut self) {
        if !self.run_active || self.crawling || self.move_in_flight {
            return;
        }
        if !self.queues.is_empty() || !self.pool.is_empty() || self.pending_ops > 0 {
            return;
        }
        self.process_stop();
    }

    /// Active → idle: log the run, commit if anything changed, pin progress
    /// at 1.0, and fire `finished` exactly once.
    fn process_stop(&mut self) {
        self.run_active = false;
        self.been_crawled = true;
        let elapsed = self
            .crawl_started
            .take()
            .map(|started| started.elapsed())
            .unwrap_or_default();
        let summary = FinishedSummary::new(elapsed, &self.run_counters);
        log::info!(
            "Miner: finished in {:.2?}: {} directories ({} ignored), {} files ({} ignored)",
            summary.elapsed,
            summary.directories_found,
            summary.directories_ignored,
            summary.files_found,
            summary.files_ignored,
        );
        if self.updates_since_commit > 0 {
            self.spawn_commit();
        }
        self.progress_floor = 1.0;
        (self.hooks.progress)(1.0);
        self.last_progress_emit = Some(Instant::now());
        (self.hooks.finished)(&summary);
    }

    // ── Progress ─────────────────────────────────────────────────────

    fn progress(&self) -> f64 {
        if self.total_items == 0 {
            return if self.run_active { 0.0 } else { self.progress_floor.max(0.0) };
        }
        let total = self.total_items as f64;
        let remaining = ((self.queues.len() + self.pool.len()) as f64).min(total);
        ((total - remaining) / total).clamp(0.0, 1.0).max(self.progress_floor)
    }

    fn maybe_emit_progress(&mut self) {
        let current = self.progress();
        self.progress_floor = self.progress_floor.max(current);
        let due = self
            .last_progress_emit
            .map(|at| at.elapsed() >= Duration::from_millis(self.config.progress_interval_ms))
            .unwrap_or(true);
        if due {
            (self.hooks.progress)(self.progress_floor);
            self.last_progress_emit = Some(Instant::now());
        }
    }
}

// ── Move resolution ──────────────────────────────────────────────────

/// Decompose a move over (source in store?) × (target accepted by policy?).
async fn resolve_move<S: Store>(
    store: &S,
    policy: &IndexingPolicy,
    item: &MovedItem,
) -> (MoveFollowUp, bool) {
    let source_uri = item.from.uri();
    let source_in_store = match store.query(&sparql::presence_query(&source_uri)).await {
        Ok(rows) => !rows.is_empty(),
        Err(e) => {
            log::error!("Miner: presence query for {} failed: {e}", item.from);
            false
        }
    };
    let target_accepted = if item.is_dir {
        policy.accepts_directory(&item.to)
    } else {
        policy.accepts_file(&item.to)
    };

    match (source_in_store, target_accepted) {
        (false, false) => {
            log::debug!("Miner: move {} -> {} touches nothing tracked", item.from, item.to);
            (MoveFollowUp::None, false)
        }
        (false, true) => {
            if item.is_dir {
                (MoveFollowUp::SeedTask { root: item.to.clone() }, false)
            } else {
                (
                    MoveFollowUp::Created {
                        file: item.to.clone(),
                        is_dir: false,
                    },
                    false,
                )
            }
        }
        (true, false) => (
            MoveFollowUp::Deleted {
                file: item.from.clone(),
                is_dir: item.is_dir,
            },
            false,
        ),
        (true, true) => rename_in_place(store, item).await,
    }
}

/// Both endpoints tracked: rewrite the source's recorded name and every
/// descendant URI in one combined batch.
async fn rename_in_place<S: Store>(store: &S, item: &MovedItem) -> (MoveFollowUp, bool) {
    if !item.to.exists_on_disk() {
        log::debug!("Miner: move target {} is already gone, deleting source", item.to);
        return (
            MoveFollowUp::Deleted {
                file: item.from.clone(),
                is_dir: item.is_dir,
            },
            false,
        );
    }

    let source_uri = item.from.uri();
    let target_uri = item.to.uri();

    // Depth-first descent over recorded containment. Children are rebuilt
    // by string substitution, so anything not under the source URI cannot
    // be rewritten and is skipped.
    let mut rewrites: Vec<(String, String)> = Vec::new();
    let mut stack = vec![source_uri.clone()];
    while let Some(container) = stack.pop() {
        let rows = match store.query(&sparql::children_query(&container)).await {
            Ok(rows) => rows,
            Err(e) => {
                log::error!("Miner: child query under {container} failed, abandoning move: {e}");
                return (MoveFollowUp::None, false);
            }
        };
        let mut level = Vec::new();
        for row in rows {
            let Some(child) = row.first() else { continue };
            if !child.starts_with(&source_uri) {
                log::warn!("Miner: child {child} is not under {source_uri}, skipping rewrite");
                continue;
            }
            let rewritten = format!("{target_uri}{}", &child[source_uri.len()..]);
            rewrites.push((child.clone(), rewritten));
            level.push(child.clone());
        }
        // Reverse so siblings are visited in row order
        for child in level.into_iter().rev() {
            stack.push(child);
        }
    }

    let batch = sparql::rename_batch(&source_uri, &target_uri, &item.to.display_name(), &rewrites);
    match store.batch_update(&batch).await {
        Ok(()) => (MoveFollowUp::None, true),
        Err(e) => {
            log::error!("Miner: rename of {} failed: {e}", item.from);
            (MoveFollowUp::None, false)
        }
    }
}
