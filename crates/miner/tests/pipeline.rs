//! End-to-end pipeline scenarios against an in-memory store double.
//!
//! The store records every update and commit, answers presence/mtime/child
//! queries from a resource table, and applies the pipeline's own update
//! templates so multi-step flows (rename, move round-trips) see their own
//! effects.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use scour_miner::{
    CancelFlag, FileRef, FinishedSummary, FsEvent, IndexMiner, IndexingPolicy, MinerConfig,
    MinerHandle, MinerHooks, Monitor, MonitorError, Store, StoreError,
};

// ── In-memory store double ───────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Resource {
    file_name: Option<String>,
    mtime: Option<String>,
    container: Option<String>,
}

#[derive(Default)]
struct StoreInner {
    resources: HashMap<String, Resource>,
    updates: Vec<String>,
    commits: usize,
}

#[derive(Clone, Default)]
struct MemStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemStore {
    fn updates(&self) -> Vec<String> {
        self.inner.lock().unwrap().updates.clone()
    }

    fn commits(&self) -> usize {
        self.inner.lock().unwrap().commits
    }

    fn resources(&self) -> HashMap<String, Resource> {
        self.inner.lock().unwrap().resources.clone()
    }

    fn seed(&self, uri: &str, resource: Resource) {
        self.inner
            .lock()
            .unwrap()
            .resources
            .insert(uri.to_string(), resource);
    }

    fn run_query(&self, q: &str) -> Vec<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        // Presence probe
        if let Some(uri) = extract_between(q, "FILTER(?s = <", ">") {
            return if inner.resources.contains_key(uri) {
                vec![vec![uri.to_string()]]
            } else {
                Vec::new()
            };
        }
        // Mtime match
        if q.contains("nfo:fileLastModified") {
            let ts = extract_between(q, "nfo:fileLastModified \"", "\"").unwrap_or_default();
            let uri = extract_between(q, "FILTER(?file = <", ">").unwrap_or_default();
            let matched = inner
                .resources
                .get(uri)
                .is_some_and(|r| r.mtime.as_deref() == Some(ts));
            return if matched {
                vec![vec![uri.to_string()]]
            } else {
                Vec::new()
            };
        }
        // Children of a container
        if let Some(uri) = extract_between(q, "nfo:belongsToContainer <", ">") {
            let mut rows: Vec<Vec<String>> = inner
                .resources
                .iter()
                .filter(|(_, r)| r.container.as_deref() == Some(uri))
                .map(|(k, _)| vec![k.clone()])
                .collect();
            rows.sort();
            return rows;
        }
        Vec::new()
    }

    fn apply_update(&self, q: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.updates.push(q.to_string());

        if q.starts_with("DROP GRAPH <") {
            let uri = extract_between(q, "DROP GRAPH <", ">").unwrap_or_default().to_string();
            inner.resources.remove(&uri);
            if let Some((subject, resource)) = parse_insert_resource(q) {
                inner.resources.insert(subject, resource);
            }
        } else if q.contains("nfo:fileName ?o") {
            apply_rename(&mut inner, q);
        } else if q.starts_with("DELETE FROM <") {
            let uri = extract_between(q, "DELETE FROM <", ">").unwrap_or_default().to_string();
            let prefix = format!("{uri}/");
            inner.resources.retain(|key, r| {
                key != &uri && !r.container.as_deref().is_some_and(|c| c.starts_with(&prefix))
            });
        }
    }
}

fn extract_between<'a>(s: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = s.find(start)? + start.len();
    let len = s[from..].find(end)?;
    Some(&s[from..from + len])
}

fn parse_insert_resource(q: &str) -> Option<(String, Resource)> {
    let mut subject = None;
    let mut resource = Resource::default();
    for line in q.lines() {
        let line = line.trim().trim_end_matches('.').trim();
        if !line.starts_with('<') {
            continue;
        }
        let subj = extract_between(line, "<", ">")?.to_string();
        let rest = line[line.find('>')? + 1..].trim();
        let Some((predicate, object)) = rest.split_once(' ') else {
            continue;
        };
        match predicate {
            "nfo:fileName" => resource.file_name = Some(object.trim_matches('"').to_string()),
            "nfo:fileLastModified" => resource.mtime = Some(object.trim_matches('"').to_string()),
            "nfo:belongsToContainer" => {
                resource.container = Some(object.trim_matches(|c| c == '<' || c == '>').to_string())
            }
            _ => {}
        }
        subject = Some(subj);
    }
    subject.map(|s| (s, resource))
}

fn apply_rename(inner: &mut StoreInner, q: &str) {
    let src = extract_between(q, "DELETE FROM <", ">").unwrap_or_default().to_string();
    let dst = extract_between(q, "INSERT INTO <", ">").unwrap_or_default().to_string();
    let new_name = extract_between(q, "nfo:fileName \"", "\"").map(str::to_string);

    if let Some(mut moved) = inner.resources.remove(&src) {
        if let Some(name) = new_name {
            moved.file_name = Some(name);
        }
        inner.resources.insert(dst.clone(), moved);
    }

    for line in q.lines() {
        let line = line.trim();
        let Some(idx) = line.find(" tracker:uri ") else {
            continue;
        };
        let child = line[..idx].trim_matches(|c| c == '<' || c == '>').to_string();
        let rewritten = line[idx + " tracker:uri ".len()..]
            .trim()
            .trim_end_matches('.')
            .trim()
            .trim_matches(|c| c == '<' || c == '>')
            .to_string();
        if let Some(mut moved) = inner.resources.remove(&child) {
            if let Some(container) = &moved.container
                && container.starts_with(&src)
            {
                moved.container = Some(format!("{dst}{}", &container[src.len()..]));
            }
            inner.resources.insert(rewritten, moved);
        }
    }
}

impl Store for MemStore {
    fn query(&self, sparql: &str) -> impl Future<Output = Result<Vec<Vec<String>>, StoreError>> + Send {
        let rows = self.run_query(sparql);
        async move { Ok(rows) }
    }

    fn batch_update(&self, sparql: &str) -> impl Future<Output = Result<(), StoreError>> + Send {
        self.apply_update(sparql);
        async move { Ok(()) }
    }

    fn commit(&self) -> impl Future<Output = Result<(), StoreError>> + Send {
        self.inner.lock().unwrap().commits += 1;
        async move { Ok(()) }
    }
}

// ── Monitor stub ─────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct StubMonitor {
    watched: Arc<Mutex<HashSet<FileRef>>>,
}

impl Monitor for StubMonitor {
    fn watch(&mut self, dir: &FileRef) -> Result<(), MonitorError> {
        self.watched.lock().unwrap().insert(dir.clone());
        Ok(())
    }

    fn unwatch(&mut self, dir: &FileRef) {
        self.watched.lock().unwrap().remove(dir);
    }

    fn unwatch_below(&mut self, root: &FileRef) {
        self.watched
            .lock()
            .unwrap()
            .retain(|d| d != root && !d.has_prefix(root));
    }

    fn is_watching(&self, dir: &FileRef) -> bool {
        self.watched.lock().unwrap().contains(dir)
    }

    fn watch_count(&self) -> usize {
        self.watched.lock().unwrap().len()
    }
}

// ── Test rig ─────────────────────────────────────────────────────────

struct Rig {
    handle: MinerHandle,
    store: MemStore,
    monitor: StubMonitor,
    events_tx: UnboundedSender<FsEvent>,
    finished_rx: UnboundedReceiver<FinishedSummary>,
    progress_log: Arc<Mutex<Vec<f64>>>,
}

/// An extractor that stats the file, writes name/mtime/container triples,
/// and notifies completion synchronously. Declines missing files and,
/// unless `index_directories`, directories.
fn extracting_hooks(
    handle_cell: Arc<OnceLock<MinerHandle>>,
    index_directories: bool,
    finished_tx: UnboundedSender<FinishedSummary>,
    progress_log: Arc<Mutex<Vec<f64>>>,
) -> MinerHooks {
    MinerHooks {
        process_file: Box::new(move |file, builder, _cancel| {
            let Ok(meta) = std::fs::symlink_metadata(file.path()) else {
                return false;
            };
            if meta.is_dir() && !index_directories {
                return false;
            }
            let uri = file.uri();
            builder.insert_string(&uri, "nfo:fileName", &file.display_name());
            if let Ok(mtime) = meta.modified() {
                builder.insert_date(&uri, "nfo:fileLastModified", mtime);
            }
            if let Some(parent) = file.parent() {
                builder.insert_iri(&uri, "nfo:belongsToContainer", &parent.uri());
            }
            if let Some(handle) = handle_cell.get() {
                let _ = handle.notify_file(file.clone(), None);
            }
            true
        }),
        finished: Box::new(move |summary| {
            let _ = finished_tx.send(summary.clone());
        }),
        progress: Box::new(move |p| {
            progress_log.lock().unwrap().push(p);
        }),
    }
}

fn spawn_rig(config: MinerConfig, policy: IndexingPolicy, index_directories: bool) -> Rig {
    let store = MemStore::default();
    let monitor = StubMonitor::default();
    let (events_tx, events_rx) = unbounded_channel();
    let (finished_tx, finished_rx) = unbounded_channel();
    let progress_log = Arc::new(Mutex::new(Vec::new()));
    let handle_cell = Arc::new(OnceLock::new());

    let hooks = extracting_hooks(
        Arc::clone(&handle_cell),
        index_directories,
        finished_tx,
        Arc::clone(&progress_log),
    );
    let handle = IndexMiner::spawn(
        config,
        policy,
        hooks,
        store.clone(),
        Box::new(monitor.clone()),
        events_rx,
    );
    let _ = handle_cell.set(handle.clone());

    Rig {
        handle,
        store,
        monitor,
        events_tx,
        finished_rx,
        progress_log,
    }
}

async fn wait_finished(rx: &mut UnboundedReceiver<FinishedSummary>) -> FinishedSummary {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for finished")
        .expect("pipeline ended unexpectedly")
}

/// Wait until every control message sent so far has been handled. The
/// control channel is FIFO, so any request/reply round-trip is a fence.
async fn sync_control(handle: &MinerHandle) {
    let _ = handle.get_throttle().await;
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn create_test_tree(dir: &std::path::Path) {
    let sub = dir.join("sub");
    std::fs::create_dir_all(&sub).unwrap();
    std::fs::write(dir.join("a.txt"), "a").unwrap();
    std::fs::write(dir.join("b.txt"), "b").unwrap();
    std::fs::write(sub.join("c.txt"), "c").unwrap();
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn bulk_crawl_indexes_every_file() {
    let tree = tempfile::tempdir().unwrap();
    create_test_tree(tree.path());

    let mut rig = spawn_rig(MinerConfig::default(), IndexingPolicy::new(), false);
    rig.handle.add_directory(tree.path(), true).unwrap();

    let summary = wait_finished(&mut rig.finished_rx).await;
    assert_eq!(summary.directories_found, 2);
    assert_eq!(summary.files_found, 3);
    assert_eq!(summary.directories_ignored, 0);
    assert_eq!(summary.files_ignored, 0);

    // Three files, three graph replacements, one commit at stop
    wait_until("first commit", || rig.store.commits() == 1).await;
    let updates = rig.store.updates();
    assert_eq!(updates.len(), 3);
    assert!(updates.iter().all(|u| u.starts_with("DROP GRAPH <")));

    let resources = rig.store.resources();
    assert_eq!(resources.len(), 3);
    let c_uri = FileRef::new(tree.path().join("sub/c.txt")).uri();
    let c = &resources[&c_uri];
    assert_eq!(c.file_name.as_deref(), Some("c.txt"));
    assert_eq!(
        c.container.as_deref(),
        Some(FileRef::new(tree.path().join("sub")).uri().as_str())
    );

    // Progress is monotone and ends pinned at 1.0
    let progress = rig.progress_log.lock().unwrap().clone();
    assert_eq!(progress.last().copied(), Some(1.0));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_rescan_is_a_no_op() {
    let tree = tempfile::tempdir().unwrap();
    create_test_tree(tree.path());

    let mut rig = spawn_rig(MinerConfig::default(), IndexingPolicy::new(), false);
    rig.handle.add_directory(tree.path(), true).unwrap();
    wait_finished(&mut rig.finished_rx).await;
    wait_until("first commit", || rig.store.commits() == 1).await;
    let updates_after_first = rig.store.updates().len();

    // Second pass: every file's recorded mtime still matches
    rig.handle.add_directory(tree.path(), true).unwrap();
    let summary = wait_finished(&mut rig.finished_rx).await;
    assert_eq!(summary.files_found, 3);
    assert_eq!(summary.directories_found, 2);

    assert_eq!(rig.store.updates().len(), updates_after_first, "no new updates");
    assert_eq!(rig.store.commits(), 1, "commit count must not grow");
    assert_eq!(rig.handle.progress().await.unwrap(), 1.0);

    // Touching one file invalidates exactly that one freshness check
    let touched = tree.path().join("a.txt");
    let new_mtime = filetime::FileTime::from_unix_time(2_000_000_000, 0);
    filetime::set_file_mtime(&touched, new_mtime).unwrap();

    rig.handle.add_directory(tree.path(), true).unwrap();
    wait_finished(&mut rig.finished_rx).await;
    wait_until("re-extraction lands", || {
        rig.store.updates().len() == updates_after_first + 1
    })
    .await;
    wait_until("second commit", || rig.store.commits() == 2).await;
    let last = rig.store.updates().pop().unwrap();
    assert!(last.contains(&FileRef::new(&touched).uri()));
}

#[tokio::test(flavor = "multi_thread")]
async fn live_delete_issues_delete_and_commit() {
    let tree = tempfile::tempdir().unwrap();
    create_test_tree(tree.path());

    let mut rig = spawn_rig(MinerConfig::default(), IndexingPolicy::new(), false);
    rig.handle.add_directory(tree.path(), true).unwrap();
    wait_finished(&mut rig.finished_rx).await;
    wait_until("first commit", || rig.store.commits() == 1).await;

    let doomed = FileRef::new(tree.path().join("a.txt"));
    let doomed_uri = doomed.uri();
    std::fs::remove_file(doomed.path()).unwrap();
    rig.events_tx
        .send(FsEvent::Deleted {
            file: doomed.clone(),
            is_dir: false,
        })
        .unwrap();

    // In steady state every update commits immediately
    wait_until("delete committed", || rig.store.commits() == 2).await;
    let last = rig.store.updates().pop().unwrap();
    assert!(last.starts_with(&format!("DELETE FROM <{doomed_uri}>")));
    assert!(last.contains(&format!("fn:starts-with(?p, \"{doomed_uri}/\")")));
    assert!(!rig.store.resources().contains_key(&doomed_uri));
}

#[tokio::test(flavor = "multi_thread")]
async fn directory_rename_rewrites_children() {
    let tree = tempfile::tempdir().unwrap();
    create_test_tree(tree.path());

    let mut rig = spawn_rig(MinerConfig::default(), IndexingPolicy::new(), true);
    rig.handle.add_directory(tree.path(), true).unwrap();
    wait_finished(&mut rig.finished_rx).await;

    let sub = FileRef::new(tree.path().join("sub"));
    let new = FileRef::new(tree.path().join("new"));
    let old_child = FileRef::new(tree.path().join("sub/c.txt")).uri();
    let new_child = FileRef::new(tree.path().join("new/c.txt")).uri();

    std::fs::rename(sub.path(), new.path()).unwrap();
    rig.events_tx
        .send(FsEvent::Moved {
            from: sub.clone(),
            to: new.clone(),
            is_dir: true,
            source_monitored: true,
        })
        .unwrap();

    wait_until("rename applied", || {
        rig.store.resources().contains_key(&new.uri())
    })
    .await;

    let last = rig.store.updates().pop().unwrap();
    assert!(last.contains(&format!(
        "DELETE FROM <{}> {{ <{}> nfo:fileName ?o }}",
        sub.uri(),
        sub.uri()
    )));
    assert!(last.contains(&format!("INSERT INTO <{}>", new.uri())));
    assert!(last.contains("nfo:fileName \"new\""));
    assert!(last.contains(&format!("<{old_child}> tracker:uri <{new_child}>")));

    let resources = rig.store.resources();
    assert!(!resources.contains_key(&sub.uri()));
    assert!(!resources.contains_key(&old_child));
    let child = &resources[&new_child];
    assert_eq!(child.container.as_deref(), Some(new.uri().as_str()));
}

#[tokio::test(flavor = "multi_thread")]
async fn move_roundtrip_restores_store() {
    let tree = tempfile::tempdir().unwrap();
    create_test_tree(tree.path());

    let mut rig = spawn_rig(MinerConfig::default(), IndexingPolicy::new(), true);
    rig.handle.add_directory(tree.path(), true).unwrap();
    wait_finished(&mut rig.finished_rx).await;
    let pristine = rig.store.resources();

    let sub = FileRef::new(tree.path().join("sub"));
    let new = FileRef::new(tree.path().join("new"));

    std::fs::rename(sub.path(), new.path()).unwrap();
    rig.events_tx
        .send(FsEvent::Moved {
            from: sub.clone(),
            to: new.clone(),
            is_dir: true,
            source_monitored: true,
        })
        .unwrap();
    wait_until("first move applied", || {
        rig.store.resources().contains_key(&new.uri())
    })
    .await;

    std::fs::rename(new.path(), sub.path()).unwrap();
    rig.events_tx
        .send(FsEvent::Moved {
            from: new.clone(),
            to: sub.clone(),
            is_dir: true,
            source_monitored: true,
        })
        .unwrap();
    wait_until("second move applied", || {
        rig.store.resources().contains_key(&sub.uri())
    })
    .await;

    assert_eq!(rig.store.resources(), pristine);
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_limit_bounds_concurrency() {
    let tree = tempfile::tempdir().unwrap();
    for i in 0..5 {
        std::fs::write(tree.path().join(format!("f{i}.txt")), "x").unwrap();
    }

    let store = MemStore::default();
    let monitor = StubMonitor::default();
    let (_events_tx, events_rx) = unbounded_channel();
    let (finished_tx, mut finished_rx) = unbounded_channel();
    let handle_cell: Arc<OnceLock<MinerHandle>> = Arc::new(OnceLock::new());

    let in_flight = Arc::new(Mutex::new(0usize));
    let max_in_flight = Arc::new(Mutex::new(0usize));

    let hooks = MinerHooks {
        process_file: {
            let handle_cell = Arc::clone(&handle_cell);
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            Box::new(move |file, builder, _cancel| {
                let Ok(meta) = std::fs::symlink_metadata(file.path()) else {
                    return false;
                };
                if meta.is_dir() {
                    return false;
                }
                builder.insert_string(&file.uri(), "nfo:fileName", &file.display_name());
                {
                    let mut current = in_flight.lock().unwrap();
                    *current += 1;
                    let mut max = max_in_flight.lock().unwrap();
                    *max = (*max).max(*current);
                }
                let handle_cell = Arc::clone(&handle_cell);
                let in_flight = Arc::clone(&in_flight);
                let file = file.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    *in_flight.lock().unwrap() -= 1;
                    if let Some(handle) = handle_cell.get() {
                        let _ = handle.notify_file(file, None);
                    }
                });
                true
            })
        },
        finished: Box::new(move |summary| {
            let _ = finished_tx.send(summary.clone());
        }),
        progress: Box::new(|_| {}),
    };

    let config = MinerConfig {
        pool_limit: 2,
        ..MinerConfig::default()
    };
    let handle = IndexMiner::spawn(
        config,
        IndexingPolicy::new(),
        hooks,
        store.clone(),
        Box::new(monitor),
        events_rx,
    );
    let _ = handle_cell.set(handle.clone());

    handle.add_directory(tree.path(), true).unwrap();
    wait_finished(&mut finished_rx).await;

    wait_until("all five updates", || store.updates().len() == 5).await;
    assert_eq!(*max_in_flight.lock().unwrap(), 2, "pool must stay saturated at its cap");
    assert_eq!(store.resources().len(), 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn throttle_change_applies_immediately() {
    let tree = tempfile::tempdir().unwrap();
    for i in 0..10 {
        std::fs::write(tree.path().join(format!("f{i}.txt")), "x").unwrap();
    }

    let config = MinerConfig {
        throttle: 1.0,
        max_tick_delay_ms: 400,
        ..MinerConfig::default()
    };
    let mut rig = spawn_rig(config, IndexingPolicy::new(), false);
    assert_eq!(rig.handle.get_throttle().await.unwrap(), 1.0);

    rig.handle.add_directory(tree.path(), true).unwrap();
    // At full throttle, roughly one dispatch per 400 ms
    wait_until("first dispatch", || !rig.store.updates().is_empty()).await;

    let accelerate_at = std::time::Instant::now();
    rig.handle.set_throttle(0.0).unwrap();
    assert_eq!(rig.handle.get_throttle().await.unwrap(), 0.0);

    wait_finished(&mut rig.finished_rx).await;
    assert!(
        accelerate_at.elapsed() < Duration::from_secs(2),
        "remaining items must dispatch without the old delay"
    );
    assert_eq!(rig.store.updates().len(), 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn deletions_dispatch_before_creations() {
    let tree = tempfile::tempdir().unwrap();
    std::fs::write(tree.path().join("x.txt"), "x").unwrap();

    let rig = spawn_rig(MinerConfig::default(), IndexingPolicy::new(), false);
    let gone = FileRef::new(tree.path().join("y.txt"));
    rig.store.seed(
        &gone.uri(),
        Resource {
            file_name: Some("y.txt".into()),
            ..Resource::default()
        },
    );

    rig.handle.pause().unwrap();
    sync_control(&rig.handle).await;
    rig.events_tx
        .send(FsEvent::Created {
            file: FileRef::new(tree.path().join("x.txt")),
            is_dir: false,
        })
        .unwrap();
    rig.events_tx
        .send(FsEvent::Deleted {
            file: gone.clone(),
            is_dir: false,
        })
        .unwrap();

    wait_until("both queued", || {
        let status = futures_status(&rig.handle);
        status.map(|s| s.queued_created == 1 && s.queued_deleted == 1).unwrap_or(false)
    })
    .await;
    rig.handle.resume().unwrap();

    wait_until("both dispatched", || rig.store.updates().len() == 2).await;
    let updates = rig.store.updates();
    assert!(
        updates[0].starts_with(&format!("DELETE FROM <{}>", gone.uri())),
        "the deletion must be dispatched first"
    );
    assert!(updates[1].starts_with("DROP GRAPH <"));
}

/// Synchronous status probe for use inside `wait_until` closures.
fn futures_status(handle: &MinerHandle) -> Option<scour_miner::MinerStatus> {
    let handle = handle.clone();
    let (tx, rx) = std::sync::mpsc::channel();
    tokio::spawn(async move {
        if let Ok(status) = handle.status().await {
            let _ = tx.send(status);
        }
    });
    rx.recv_timeout(Duration::from_secs(1)).ok()
}

#[tokio::test(flavor = "multi_thread")]
async fn create_then_delete_leaves_no_trace() {
    let tree = tempfile::tempdir().unwrap();
    let mut rig = spawn_rig(MinerConfig::default(), IndexingPolicy::new(), false);
    rig.handle.add_directory(tree.path(), true).unwrap();
    wait_finished(&mut rig.finished_rx).await;

    let flash = FileRef::new(tree.path().join("flash.txt"));
    std::fs::write(flash.path(), "x").unwrap();

    rig.handle.pause().unwrap();
    sync_control(&rig.handle).await;
    rig.events_tx
        .send(FsEvent::Created {
            file: flash.clone(),
            is_dir: false,
        })
        .unwrap();
    wait_until("creation queued", || {
        futures_status(&rig.handle)
            .map(|s| s.queued_created == 1)
            .unwrap_or(false)
    })
    .await;

    std::fs::remove_file(flash.path()).unwrap();
    rig.events_tx
        .send(FsEvent::Deleted {
            file: flash.clone(),
            is_dir: false,
        })
        .unwrap();
    rig.handle.resume().unwrap();

    wait_until("queues drained", || {
        futures_status(&rig.handle)
            .map(|s| {
                s.queued_created == 0 && s.queued_deleted == 0 && s.pool_in_flight == 0
            })
            .unwrap_or(false)
    })
    .await;

    // The stale creation found the file gone and produced nothing
    let flash_uri = flash.uri();
    assert!(!rig.store.resources().contains_key(&flash_uri));
    assert!(!rig.store.updates().iter().any(|u| u.contains(&flash_uri)));
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_directory_purges_queues_and_jobs() {
    let tree = tempfile::tempdir().unwrap();
    create_test_tree(tree.path());

    let store = MemStore::default();
    let monitor = StubMonitor::default();
    let (_events_tx, events_rx) = unbounded_channel();
    let (finished_tx, mut finished_rx) = unbounded_channel();
    let handle_cell: Arc<OnceLock<MinerHandle>> = Arc::new(OnceLock::new());

    // Extractor that accepts everything and holds each job until released
    let held: Arc<Mutex<Vec<(FileRef, CancelFlag)>>> = Arc::new(Mutex::new(Vec::new()));
    let hooks = MinerHooks {
        process_file: {
            let held = Arc::clone(&held);
            Box::new(move |file, builder, cancel| {
                builder.insert_string(&file.uri(), "nfo:fileName", &file.display_name());
                held.lock().unwrap().push((file.clone(), cancel.clone()));
                true
            })
        },
        finished: Box::new(move |summary| {
            let _ = finished_tx.send(summary.clone());
        }),
        progress: Box::new(|_| {}),
    };

    let config = MinerConfig {
        pool_limit: 8,
        ..MinerConfig::default()
    };
    let handle = IndexMiner::spawn(
        config,
        IndexingPolicy::new(),
        hooks,
        store.clone(),
        Box::new(monitor.clone()),
        events_rx,
    );
    let _ = handle_cell.set(handle.clone());

    handle.add_directory(tree.path(), true).unwrap();
    // Root, a.txt, b.txt, sub, sub/c.txt all enter the pool and hold
    wait_until("all jobs held", || held.lock().unwrap().len() == 5).await;

    let sub = FileRef::new(tree.path().join("sub"));
    handle.remove_directory(sub.path()).unwrap();
    wait_until("cancellation lands", || {
        held.lock()
            .unwrap()
            .iter()
            .any(|(f, cancel)| f.has_prefix(&sub) && cancel.is_cancelled())
    })
    .await;

    let snapshot = held.lock().unwrap().clone();
    for (file, cancel) in &snapshot {
        let under_sub = *file == sub || file.has_prefix(&sub);
        assert_eq!(
            cancel.is_cancelled(),
            under_sub,
            "only jobs under the removed root are cancelled ({file})"
        );
    }
    assert!(!monitor.is_watching(&sub), "watch on the removed subtree is released");

    // Late completions: cancelled ones vanish silently, live ones land
    for (file, _) in snapshot {
        let _ = handle.notify_file(file, None);
    }
    wait_finished(&mut finished_rx).await;

    let resources = store.resources();
    let c_uri = FileRef::new(tree.path().join("sub/c.txt")).uri();
    assert!(!resources.contains_key(&c_uri));
    assert!(!resources.contains_key(&sub.uri()));
    assert!(resources.contains_key(&FileRef::new(tree.path().join("a.txt")).uri()));
}

#[tokio::test(flavor = "multi_thread")]
async fn monitor_watches_follow_policy() {
    let tree = tempfile::tempdir().unwrap();
    create_test_tree(tree.path());

    let mut rig = spawn_rig(MinerConfig::default(), IndexingPolicy::new(), false);
    rig.handle.add_directory(tree.path(), true).unwrap();
    wait_finished(&mut rig.finished_rx).await;
    assert_eq!(rig.monitor.watch_count(), 2, "root and sub are watched");

    rig.handle.remove_directory(tree.path()).unwrap();
    wait_until("watches released", || rig.monitor.watch_count() == 0).await;

    // A policy that refuses monitoring gets no watches at all
    let tree2 = tempfile::tempdir().unwrap();
    create_test_tree(tree2.path());
    let mut quiet = spawn_rig(
        MinerConfig::default(),
        IndexingPolicy::new().monitor_directory(|_| false),
        false,
    );
    quiet.handle.add_directory(tree2.path(), true).unwrap();
    wait_finished(&mut quiet.finished_rx).await;
    assert_eq!(quiet.monitor.watch_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_drains_and_joins() {
    let tree = tempfile::tempdir().unwrap();
    create_test_tree(tree.path());

    let mut rig = spawn_rig(MinerConfig::default(), IndexingPolicy::new(), false);
    rig.handle.add_directory(tree.path(), true).unwrap();
    wait_finished(&mut rig.finished_rx).await;

    rig.handle.shutdown().await.unwrap();
    assert_eq!(
        rig.handle.add_directory(tree.path(), true),
        Err(scour_miner::MinerError::Shutdown)
    );
}
