mod common;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rtrelay::config::{Config, SnapshotHandle, WatcherConfig};
use rtrelay::events::EventBus;
use rtrelay::models::{DicomObject, Node, PlanOutcome, Rule, SendFailure, LOCAL_IMPORT_IDENTITY};
use rtrelay::sender::{Orchestrator, StoreTransport, TransportSession};
use rtrelay::watcher::FolderWatcher;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use common::{plan_set, Fixture};

#[derive(Debug, Default)]
struct Counting {
    fail: bool,
    stored: Arc<AtomicUsize>,
}

struct CountingSession {
    stored: Arc<AtomicUsize>,
}

#[async_trait]
impl StoreTransport for Counting {
    async fn open(
        &self,
        _node: &Node,
        _objects: &[&DicomObject],
    ) -> Result<Box<dyn TransportSession>, SendFailure> {
        if self.fail {
            return Err(SendFailure::DestinationUnreachable("connection refused".into()));
        }
        Ok(Box::new(CountingSession {
            stored: self.stored.clone(),
        }))
    }

    async fn echo(&self, _node: &Node) -> Result<(), SendFailure> {
        Ok(())
    }
}

#[async_trait]
impl TransportSession for CountingSession {
    async fn store(&mut self, _object: &DicomObject) -> Result<(), SendFailure> {
        self.stored.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<(), SendFailure> {
        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}

struct Setup {
    _tmp: tempfile::TempDir,
    watch_dir: PathBuf,
    failed_dir: PathBuf,
    watcher: FolderWatcher,
    stored: Arc<AtomicUsize>,
}

async fn setup(with_rule: bool, fail: bool, empty_dir_grace_secs: u64) -> Setup {
    let tmp = tempfile::tempdir().unwrap();
    let watch_dir = tmp.path().join("import");

    let mut config = Config::default();
    config.nodes.push(Node {
        name: "archive".into(),
        enabled: true,
        ae_title: "ARCHIVE".into(),
        calling_ae_title: None,
        host: "127.0.0.1".into(),
        port: 104,
    });
    if with_rule {
        config.forwarding.rules.push(Rule {
            name: "imports".into(),
            enabled: true,
            source_ae: LOCAL_IMPORT_IDENTITY.into(),
            plan_label_match: String::new(),
            targets: vec!["archive".into()],
        });
    }
    let watcher_config = WatcherConfig {
        enabled: true,
        watch_dir: watch_dir.clone(),
        inactivity_timeout_secs: 13,
        empty_dir_grace_secs,
        ..WatcherConfig::default()
    };
    let failed_dir = watcher_config.failed_dir();

    let transport = Counting {
        fail,
        ..Counting::default()
    };
    let stored = transport.stored.clone();
    let events = EventBus::default();
    let orchestrator = Orchestrator::new(
        Arc::new(transport),
        2,
        events.clone(),
        CancellationToken::new(),
    );
    let watcher = FolderWatcher::new(
        watcher_config,
        SnapshotHandle::new(config),
        orchestrator,
        events,
    );
    watcher.prepare().await.expect("folders created");

    Setup {
        _tmp: tmp,
        watch_dir,
        failed_dir,
        watcher,
        stored,
    }
}

fn write_plan(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    plan_set(prefix, "Import_1")
        .iter()
        .enumerate()
        .map(|(i, f)| f.write_to(dir, &format!("obj{}.dcm", i)))
        .collect()
}

fn files_under(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

#[tokio::test]
async fn quiet_bucket_is_forwarded_and_deleted() {
    let mut s = setup(true, false, 0).await;
    let case = s.watch_dir.join("case1");
    let files = write_plan(&case, "1.2.3.400");
    let now = SystemTime::now();

    let report = s.watcher.scan_once(now).await.unwrap();
    assert_eq!(report.discovered, 4);
    assert!(report.dispatched.is_empty());

    let report = s.watcher.scan_once(now + secs(12)).await.unwrap();
    assert_eq!(report.discovered, 0);
    assert!(report.dispatched.is_empty());

    let report = s.watcher.scan_once(now + secs(14)).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].outcome, PlanOutcome::Forwarded);
    assert_eq!(report.dispatched[0].object_count, 4);
    assert_eq!(s.stored.load(Ordering::SeqCst), 4);
    assert!(files.iter().all(|f| !f.exists()));
    assert!(!case.exists(), "emptied folder should be removed");
    assert_eq!(s.watcher.pending_files(), 0);

    let report = s.watcher.scan_once(now + secs(40)).await.unwrap();
    assert!(report.dispatched.is_empty());
}

#[tokio::test]
async fn new_file_restarts_the_timer() {
    let mut s = setup(true, false, 180).await;
    let case = s.watch_dir.join("case1");
    write_plan(&case, "1.2.3.401");
    let now = SystemTime::now();
    s.watcher.scan_once(now).await.unwrap();

    Fixture::new("CT", "1.2.3.401.9").write_to(&case, "late.dcm");
    let report = s.watcher.scan_once(now + secs(10)).await.unwrap();
    assert_eq!(report.discovered, 1);

    let report = s.watcher.scan_once(now + secs(14)).await.unwrap();
    assert!(report.dispatched.is_empty(), "late file keeps the bucket open");

    let report = s.watcher.scan_once(now + secs(24)).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].object_count, 5);
}

#[tokio::test]
async fn deleted_file_leaves_the_bucket() {
    let mut s = setup(true, false, 180).await;
    let files = write_plan(&s.watch_dir.join("case1"), "1.2.3.402");
    let now = SystemTime::now();
    s.watcher.scan_once(now).await.unwrap();

    std::fs::remove_file(&files[0]).unwrap();
    let report = s.watcher.scan_once(now + secs(5)).await.unwrap();
    assert_eq!(report.removed, 1);

    let report = s.watcher.scan_once(now + secs(20)).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].object_count, 3);
}

#[tokio::test]
async fn failed_bucket_moves_to_failed_folder_with_record() {
    let mut s = setup(true, true, 180).await;
    write_plan(&s.watch_dir.join("case1"), "1.2.3.403");
    let now = SystemTime::now();
    s.watcher.scan_once(now).await.unwrap();

    let report = s.watcher.scan_once(now + secs(14)).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].outcome, PlanOutcome::Failed);

    let pending: Vec<_> = files_under(&s.watch_dir)
        .into_iter()
        .filter(|p| !p.starts_with(&s.failed_dir))
        .collect();
    assert!(pending.is_empty(), "left behind: {:?}", pending);

    let failed = files_under(&s.failed_dir);
    let objects = failed
        .iter()
        .filter(|p| p.extension().is_some_and(|e| e == "dcm"))
        .count();
    assert_eq!(objects, 4);
    let record = failed
        .iter()
        .find(|p| p.file_name().is_some_and(|n| n == "failure.txt"))
        .expect("failure record written");
    let text = std::fs::read_to_string(record).unwrap();
    assert!(text.contains("archive: FAILED"));
    assert!(s.failed_dir.join("errors.log").exists());

    // The failed folder is never picked up again.
    let report = s.watcher.scan_once(now + secs(60)).await.unwrap();
    assert_eq!(report.discovered, 0);
    assert!(report.dispatched.is_empty());
}

#[tokio::test]
async fn bucket_without_rule_is_parked_in_place() {
    let mut s = setup(false, false, 180).await;
    let files = write_plan(&s.watch_dir.join("case1"), "1.2.3.404");
    let now = SystemTime::now();
    s.watcher.scan_once(now).await.unwrap();

    let report = s.watcher.scan_once(now + secs(14)).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.parked.len(), 1);
    assert!(files.iter().all(|f| f.exists()));

    let report = s.watcher.scan_once(now + secs(60)).await.unwrap();
    assert!(report.parked.is_empty(), "parked bucket is not re-evaluated until it changes");
    assert_eq!(s.stored.load(Ordering::SeqCst), 0);
    assert_eq!(s.watcher.pending_files(), 4);
}

#[tokio::test]
async fn unreadable_file_is_quarantined_after_timeout() {
    let mut s = setup(true, false, 180).await;
    let junk = s.watch_dir.join("junk.dcm");
    std::fs::write(&junk, b"not a dicom file").unwrap();
    std::fs::write(s.watch_dir.join("notes.txt"), b"ignored").unwrap();
    let now = SystemTime::now();

    let report = s.watcher.scan_once(now).await.unwrap();
    assert_eq!(report.discovered, 0);
    assert!(report.quarantined.is_empty());

    let report = s.watcher.scan_once(now + secs(14)).await.unwrap();
    assert_eq!(report.quarantined.len(), 1);
    assert!(!junk.exists());
    assert!(report.quarantined[0].starts_with(s.failed_dir.join("unreadable")));
    assert!(s.watch_dir.join("notes.txt").exists());
}
