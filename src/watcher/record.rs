//! Failed folder bookkeeping

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{error, warn};

use crate::models::DispatchReport;
use crate::storage::layout::sanitize;
use crate::storage::{FilesystemStorage, StorageBackend, StorageError};

const ERRORS_LOG: &str = "errors.log";
const FAILURE_RECORD: &str = "failure.txt";
const DISPATCH_REPORT: &str = "dispatch.json";
const UNREADABLE_DIR: &str = "unreadable";

/// Folder for one failed bucket: `<timestamp>_<patient>_<study>`
pub(crate) fn bucket_folder(dispatch: &DispatchReport) -> PathBuf {
    PathBuf::from(format!(
        "{}_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        sanitize(&dispatch.plan_key.patient_id),
        sanitize(&dispatch.plan_key.study_uid)
    ))
}

pub(crate) fn failure_record(dispatch: &DispatchReport, files: usize) -> String {
    let mut lines = vec![
        format!("Plan: {}", dispatch.plan_key),
        format!("Label: {}", dispatch.label),
        format!("Origin: {}", dispatch.origin),
        format!("Time: {}", Utc::now().to_rfc3339()),
        format!("Outcome: {}", dispatch.outcome),
        format!("Files: {}", files),
        format!("Matched rules: {}", dispatch.matched_rules.join(", ")),
        "Destinations:".to_string(),
    ];
    lines.extend(dispatch.summary_lines().into_iter().map(|l| format!("  {}", l)));
    lines.push(String::new());
    lines.join("\n")
}

fn relative_to(path: &Path, root: &Path) -> PathBuf {
    match path.strip_prefix(root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
        _ => path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("object.dcm")),
    }
}

/// Move the files of a failed bucket into their own folder, keeping their
/// layout below the watch root, and write the failure record next to them
pub(crate) async fn quarantine_bucket(
    failed_dir: &Path,
    watch_dir: &Path,
    dispatch: &DispatchReport,
    files: &BTreeSet<PathBuf>,
) -> Vec<(PathBuf, Result<PathBuf, StorageError>)> {
    let storage = match FilesystemStorage::new(failed_dir) {
        Ok(storage) => storage,
        Err(e) => {
            let message = e.to_string();
            return files
                .iter()
                .map(|p| (p.clone(), Err(StorageError::Config(message.clone()))))
                .collect();
        }
    };

    let folder = bucket_folder(dispatch);
    let mut moved = Vec::with_capacity(files.len());
    for path in files {
        let dest = folder.join(relative_to(path, watch_dir));
        moved.push((path.clone(), storage.move_into(path, &dest).await));
    }

    let record = failure_record(dispatch, files.len());
    if let Err(e) = storage
        .write_atomic(&folder.join(FAILURE_RECORD), record.into_bytes())
        .await
    {
        error!("Cannot write failure record for {}: {}", dispatch.plan_key, e);
    }
    match serde_json::to_vec_pretty(dispatch) {
        Ok(json) => {
            if let Err(e) = storage.write_atomic(&folder.join(DISPATCH_REPORT), json).await {
                error!("Cannot write {} for {}: {}", DISPATCH_REPORT, dispatch.plan_key, e);
            }
        }
        Err(e) => error!("Cannot encode dispatch report for {}: {}", dispatch.plan_key, e),
    }

    let line = format!(
        "{} {} '{}' {}: failed nodes [{}] -> {}",
        Utc::now().to_rfc3339(),
        dispatch.plan_key,
        dispatch.label,
        dispatch.outcome,
        dispatch.failed_nodes().join(", "),
        folder.display()
    );
    if let Err(e) = storage.append_line(Path::new(ERRORS_LOG), &line).await {
        error!("Cannot append to {}: {}", ERRORS_LOG, e);
    }
    warn!(plan = %dispatch.plan_key, "Moved failed bucket to {}", storage.subpath_path(&folder).display());
    moved
}

/// Move a file that never parsed into the failed folder
pub(crate) async fn quarantine_file(
    failed_dir: &Path,
    path: &Path,
    reason: &str,
) -> Result<PathBuf, StorageError> {
    let storage = FilesystemStorage::new(failed_dir)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "object.dcm".to_string());
    let dest = Path::new(UNREADABLE_DIR).join(format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), name));
    let moved = storage.move_into(path, &dest).await?;

    let line = format!(
        "{} {} unreadable: {}",
        Utc::now().to_rfc3339(),
        path.display(),
        reason
    );
    if let Err(e) = storage.append_line(Path::new(ERRORS_LOG), &line).await {
        error!("Cannot append to {}: {}", ERRORS_LOG, e);
    }
    warn!("Quarantined unreadable file {}: {}", path.display(), reason);
    Ok(moved)
}
