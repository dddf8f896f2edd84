//! Watch-folder import
//!
//! The watcher owns all of its state and is driven by one task, so every
//! cycle sees a consistent view. A cycle:
//!
//! 1. walks the watch root (skipping the failed folder) and notices new,
//!    changed and deleted files;
//! 2. parses new files and groups them per patient/study with origin
//!    `IMPORT_FOLDER`;
//! 3. dispatches every bucket that has been quiet for the inactivity timeout;
//! 4. deletes the files of fully forwarded buckets, moves failed ones to the
//!    failed folder with a written record, and parks buckets no rule wants;
//! 5. removes empty sub-folders older than the grace period.

mod record;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::future::join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::assembler::{CompletionPolicy, PlanAssembler};
use crate::config::{Snapshot, SnapshotHandle, WatcherConfig};
use crate::events::{EventBus, RelayEvent};
use crate::models::{DicomObject, DispatchReport, Origin, PlanKey, PlanOutcome};
use crate::sender::Orchestrator;
use crate::storage::{self, StorageError};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch folder {path} is not readable: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("watch folder scan task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What one scan cycle did
#[derive(Debug, Default)]
pub struct ScanReport {
    /// New or changed files that parsed
    pub discovered: usize,
    pub removed: usize,
    pub dispatched: Vec<DispatchReport>,
    pub parked: Vec<PlanKey>,
    pub quarantined: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
struct SeenFile {
    modified: SystemTime,
    size: u64,
    /// Bucket holding the file; `None` while it does not parse
    key: Option<PlanKey>,
    first_seen: SystemTime,
    /// Set after a delete or move failed; cleared when the file changes
    ignored: bool,
}

#[derive(Debug)]
struct Bucket {
    files: BTreeSet<PathBuf>,
    last_activity: SystemTime,
    parked: bool,
}

pub struct FolderWatcher {
    config: WatcherConfig,
    failed_dir: PathBuf,
    snapshots: SnapshotHandle,
    orchestrator: Orchestrator,
    events: EventBus,
    assembler: PlanAssembler,
    files: HashMap<PathBuf, SeenFile>,
    buckets: HashMap<PlanKey, Bucket>,
}

impl FolderWatcher {
    pub fn new(
        config: WatcherConfig,
        snapshots: SnapshotHandle,
        orchestrator: Orchestrator,
        events: EventBus,
    ) -> Self {
        let failed_dir = config.failed_dir();
        Self {
            config,
            failed_dir,
            snapshots,
            orchestrator,
            events,
            assembler: PlanAssembler::new(CompletionPolicy::Inactivity),
            files: HashMap::new(),
            buckets: HashMap::new(),
        }
    }

    pub fn watch_dir(&self) -> &Path {
        &self.config.watch_dir
    }

    pub fn failed_dir(&self) -> &Path {
        &self.failed_dir
    }

    /// Files currently grouped in buckets
    pub fn pending_files(&self) -> usize {
        self.buckets.values().map(|b| b.files.len()).sum()
    }

    /// Create the watch and failed folders
    pub async fn prepare(&self) -> Result<(), WatchError> {
        for dir in [&self.config.watch_dir, &self.failed_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| WatchError::RootUnreadable {
                    path: dir.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Scan on the configured interval until shutdown
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), WatchError> {
        self.prepare().await?;
        info!(
            "Watching {} every {:?} (inactivity timeout {:?})",
            self.config.watch_dir.display(),
            self.config.scan_interval(),
            self.config.inactivity_timeout()
        );

        let mut ticker = tokio::time::interval(self.config.scan_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once(SystemTime::now()).await {
                        error!("Watch folder scan failed: {}", e);
                    }
                }
            }
        }
        info!("Folder watcher stopped");
        Ok(())
    }

    /// Run one scan cycle as of `now`
    pub async fn scan_once(&mut self, now: SystemTime) -> Result<ScanReport, WatchError> {
        let snapshot = self.snapshots.current();
        let mut report = ScanReport::default();

        let present = self.walk().await?;

        let gone: Vec<PathBuf> = self
            .files
            .keys()
            .filter(|p| !present.contains_key(*p))
            .cloned()
            .collect();
        for path in gone {
            self.forget(&path, now).await;
            report.removed += 1;
        }

        for (path, (modified, size)) in present {
            let unchanged = self
                .files
                .get(&path)
                .is_some_and(|seen| seen.modified == modified && seen.size == size);
            if unchanged {
                continue;
            }
            let first_seen = match self.files.get(&path) {
                Some(seen) => seen.first_seen,
                None => now,
            };
            self.forget(&path, now).await;

            match DicomObject::load(&path).await {
                Ok(object) => {
                    let result = self.assembler.ingest(object, Origin::LocalImport).await;
                    let activity = modified.max(now);
                    let bucket = self.buckets.entry(result.key.clone()).or_insert_with(|| Bucket {
                        files: BTreeSet::new(),
                        last_activity: activity,
                        parked: false,
                    });
                    bucket.files.insert(path.clone());
                    bucket.last_activity = bucket.last_activity.max(activity);
                    bucket.parked = false;
                    self.files.insert(
                        path,
                        SeenFile {
                            modified,
                            size,
                            key: Some(result.key),
                            first_seen,
                            ignored: false,
                        },
                    );
                    report.discovered += 1;
                }
                Err(e) => {
                    debug!("{} is not readable yet: {}", path.display(), e);
                    self.files.insert(
                        path,
                        SeenFile {
                            modified,
                            size,
                            key: None,
                            first_seen,
                            ignored: false,
                        },
                    );
                }
            }
        }

        self.quarantine_unreadable(now, &mut report).await;
        self.dispatch_quiet(now, &snapshot, &mut report).await;
        self.remove_empty_dirs(now).await;
        Ok(report)
    }

    /// Candidate files below the watch root with their mtime and size
    async fn walk(&self) -> Result<HashMap<PathBuf, (SystemTime, u64)>, WatchError> {
        let root = self.config.watch_dir.clone();
        let failed_dir = self.failed_dir.clone();
        let extensions = self.config.file_extensions.clone();
        tokio::task::spawn_blocking(move || walk_tree(&root, &failed_dir, &extensions)).await?
    }

    /// Drop a file from tracking and from its bucket
    async fn forget(&mut self, path: &Path, now: SystemTime) {
        let Some(seen) = self.files.remove(path) else {
            return;
        };
        let Some(key) = seen.key else {
            return;
        };
        self.assembler.remove_path(&key, path).await;
        if let Some(bucket) = self.buckets.get_mut(&key) {
            bucket.files.remove(path);
            bucket.last_activity = bucket.last_activity.max(now);
            bucket.parked = false;
            if bucket.files.is_empty() {
                self.buckets.remove(&key);
            }
        }
    }

    fn quiet_since(&self, since: SystemTime, now: SystemTime) -> bool {
        now.duration_since(since)
            .is_ok_and(|quiet| quiet >= self.config.inactivity_timeout())
    }

    /// Move files that stayed unparseable past the inactivity timeout
    async fn quarantine_unreadable(&mut self, now: SystemTime, report: &mut ScanReport) {
        let stale: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|(_, seen)| seen.key.is_none() && !seen.ignored)
            .filter(|(_, seen)| self.quiet_since(seen.modified.max(seen.first_seen), now))
            .map(|(path, _)| path.clone())
            .collect();

        for path in stale {
            let reason = match DicomObject::load(&path).await {
                Ok(_) => {
                    // Became readable without changing size or mtime; pick it up next cycle.
                    self.files.remove(&path);
                    continue;
                }
                Err(e) => e.to_string(),
            };
            match record::quarantine_file(&self.failed_dir, &path, &reason).await {
                Ok(dest) => {
                    self.files.remove(&path);
                    self.events.emit(RelayEvent::FileQuarantined {
                        path: path.clone(),
                        reason,
                    });
                    report.quarantined.push(dest);
                }
                Err(e) => {
                    error!("Cannot move unreadable {}: {}", path.display(), e);
                    self.ignore_until_changed(&path);
                }
            }
        }
    }

    async fn dispatch_quiet(&mut self, now: SystemTime, snapshot: &Arc<Snapshot>, report: &mut ScanReport) {
        let quiet: Vec<PlanKey> = self
            .buckets
            .iter()
            .filter(|(_, b)| !b.parked && self.quiet_since(b.last_activity, now))
            .map(|(k, _)| k.clone())
            .collect();

        let mut ready = Vec::new();
        for key in quiet {
            let Some(plan) = self.assembler.snapshot(&key).await else {
                self.buckets.remove(&key);
                continue;
            };
            if snapshot.rules.evaluate(&plan).destinations.is_empty() {
                if let Some(bucket) = self.buckets.get_mut(&key) {
                    bucket.parked = true;
                    self.events.emit(RelayEvent::BucketParked {
                        plan: key.clone(),
                        files: bucket.files.len(),
                    });
                }
                report.parked.push(key);
                continue;
            }
            if let Some(plan) = self.assembler.complete_by_inactivity(&key).await {
                ready.push(plan);
            }
        }
        if ready.is_empty() {
            return;
        }

        let orchestrator = &self.orchestrator;
        let reports = join_all(
            ready
                .into_iter()
                .map(|plan| orchestrator.forward(&snapshot.rules, plan)),
        )
        .await;

        for dispatch in reports {
            self.finish_bucket(&dispatch).await;
            report.dispatched.push(dispatch);
        }
    }

    /// Clean up after a dispatched bucket
    async fn finish_bucket(&mut self, dispatch: &DispatchReport) {
        let Some(bucket) = self.buckets.remove(&dispatch.plan_key) else {
            return;
        };
        self.events.emit(RelayEvent::BucketDispatched {
            plan: dispatch.plan_key.clone(),
            files: bucket.files.len(),
            outcome: dispatch.outcome,
        });

        if dispatch.outcome == PlanOutcome::Forwarded {
            for path in &bucket.files {
                match storage::remove_file(path).await {
                    Ok(()) => {
                        self.files.remove(path);
                    }
                    Err(e) => {
                        error!("Forwarded file could not be deleted: {}", e);
                        self.ignore_until_changed(path);
                    }
                }
            }
            return;
        }

        let moved = record::quarantine_bucket(
            &self.failed_dir,
            &self.config.watch_dir,
            dispatch,
            &bucket.files,
        )
        .await;
        for (path, result) in moved {
            match result {
                Ok(_) => {
                    self.files.remove(&path);
                }
                Err(e) => {
                    error!("Failed bucket file could not be moved: {}", e);
                    self.ignore_until_changed(&path);
                }
            }
        }
    }

    fn ignore_until_changed(&mut self, path: &Path) {
        if let Some(seen) = self.files.get_mut(path) {
            seen.key = None;
            seen.ignored = true;
        }
    }

    /// Remove empty folders below the watch root that are older than the grace period
    async fn remove_empty_dirs(&self, now: SystemTime) {
        let root = self.config.watch_dir.clone();
        let failed_dir = self.failed_dir.clone();
        let grace = self.config.empty_dir_grace();
        let swept =
            tokio::task::spawn_blocking(move || remove_empty_dirs(&root, &failed_dir, grace, now));
        if let Err(e) = swept.await {
            warn!("Empty folder sweep failed: {}", e);
        }
    }
}

fn walk_tree(
    root: &Path,
    failed_dir: &Path,
    extensions: &[String],
) -> Result<HashMap<PathBuf, (SystemTime, u64)>, WatchError> {
    std::fs::read_dir(root).map_err(|source| WatchError::RootUnreadable {
        path: root.to_path_buf(),
        source,
    })?;

    let mut present = HashMap::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.path() != failed_dir);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry in watch folder: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_candidate(extensions, entry.path()) {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => {
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                present.insert(entry.into_path(), (modified, meta.len()));
            }
            Err(e) => warn!("Cannot stat {}: {}", entry.path().display(), e),
        }
    }
    Ok(present)
}

/// Dot files are in-progress copies; an empty extension list accepts everything else
fn is_candidate(extensions: &[String], path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') {
        return false;
    }
    if extensions.is_empty() {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            extensions
                .iter()
                .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(ext))
        })
}

fn remove_empty_dirs(root: &Path, failed_dir: &Path, grace: std::time::Duration, now: SystemTime) {
    let walker = WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_entry(|e| e.path() != failed_dir);

    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_dir() {
            continue;
        }
        let old_enough = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age >= grace);
        if !old_enough {
            continue;
        }
        let is_empty = std::fs::read_dir(entry.path())
            .map(|mut d| d.next().is_none())
            .unwrap_or(false);
        if is_empty {
            match std::fs::remove_dir(entry.path()) {
                Ok(()) => debug!("Removed empty folder {}", entry.path().display()),
                Err(e) => debug!("Could not remove {}: {}", entry.path().display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sender::DimseTransport;
    use std::time::Duration;

    fn watcher(extensions: &[&str]) -> FolderWatcher {
        let config = WatcherConfig {
            watch_dir: PathBuf::from("/import"),
            file_extensions: extensions.iter().map(|e| e.to_string()).collect(),
            ..WatcherConfig::default()
        };
        let orchestrator = Orchestrator::new(
            Arc::new(DimseTransport::new(Config::default().dimse_config())),
            1,
            EventBus::default(),
            CancellationToken::new(),
        );
        FolderWatcher::new(
            config,
            SnapshotHandle::new(Config::default()),
            orchestrator,
            EventBus::default(),
        )
    }

    #[test]
    fn test_candidate_filter() {
        let w = watcher(&["dcm", ".DCM2"]);
        let exts = &w.config.file_extensions;
        assert!(is_candidate(exts, Path::new("/import/a/plan.dcm")));
        assert!(is_candidate(exts, Path::new("/import/a/plan.DCM")));
        assert!(is_candidate(exts, Path::new("/import/a/plan.dcm2")));
        assert!(!is_candidate(exts, Path::new("/import/a/notes.txt")));
        assert!(!is_candidate(exts, Path::new("/import/a/.incoming-x.dcm")));
        assert!(!is_candidate(exts, Path::new("/import/a/noextension")));

        assert!(is_candidate(&[], Path::new("/import/IM0001")));
    }

    #[tokio::test]
    async fn test_walk_skips_failed_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("import");
        let failed = root.join("failed");
        std::fs::create_dir_all(root.join("case")).unwrap();
        std::fs::create_dir_all(&failed).unwrap();
        std::fs::write(root.join("case/plan.dcm"), b"x").unwrap();
        std::fs::write(root.join("case/notes.txt"), b"x").unwrap();
        std::fs::write(failed.join("old.dcm"), b"x").unwrap();

        let mut w = watcher(&["dcm"]);
        w.config.watch_dir = root.clone();
        w.failed_dir = failed;
        let present = w.walk().await.unwrap();
        assert_eq!(present.keys().collect::<Vec<_>>(), vec![&root.join("case/plan.dcm")]);

        w.config.watch_dir = tmp.path().join("missing");
        assert!(matches!(w.walk().await, Err(WatchError::RootUnreadable { .. })));
    }

    #[tokio::test]
    async fn test_empty_dirs_removed_after_grace() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let failed = root.join("failed");
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::create_dir_all(root.join("full")).unwrap();
        std::fs::create_dir_all(&failed).unwrap();
        std::fs::write(root.join("full/plan.dcm"), b"x").unwrap();

        let now = SystemTime::now();
        let mut w = watcher(&["dcm"]);
        w.config.watch_dir = root.clone();
        w.failed_dir = failed.clone();

        w.config.empty_dir_grace_secs = 3600;
        w.remove_empty_dirs(now).await;
        assert!(root.join("a/b").is_dir());

        w.config.empty_dir_grace_secs = 0;
        w.remove_empty_dirs(now + Duration::from_secs(1)).await;
        assert!(!root.join("a").exists());
        assert!(root.join("full").is_dir());
        assert!(failed.is_dir());
    }

    #[test]
    fn test_quiet_window() {
        let w = watcher(&["dcm"]);
        let t = SystemTime::now();
        assert!(!w.quiet_since(t, t + Duration::from_secs(12)));
        assert!(w.quiet_since(t, t + Duration::from_secs(13)));
        // Clock behind the file: never quiet.
        assert!(!w.quiet_since(t + Duration::from_secs(5), t));
    }

    #[test]
    fn test_failed_dir_defaults_under_watch_dir() {
        let w = watcher(&["dcm"]);
        assert_eq!(w.failed_dir(), Path::new("/import/failed"));
    }
}
