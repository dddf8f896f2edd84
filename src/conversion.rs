//! Optional multi-frame to single-frame conversion
//!
//! The converter is an external executable. It is invoked as
//! `<tool> <args..> --out-dir <dir> <input>` and must write one Part 10 file
//! per frame into `<dir>`. Any failure leaves the original object in place.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use dimse::types::uids;
use tracing::{debug, info, warn};

use crate::config::ConversionConfig;
use crate::models::{DicomObject, Modality};
use crate::storage::{self, layout, FilesystemStorage, StorageBackend};

#[derive(Debug)]
pub enum Conversion {
    /// The original was replaced by these objects, already stored under the root
    Converted(Vec<DicomObject>),
    /// Conversion does not apply or no tool is available
    Unchanged,
    /// The tool ran and failed; the original is kept
    Failed(String),
}

#[async_trait]
pub trait Converter: Send + Sync + Debug {
    /// Convert `object`, storing results under `root`
    async fn try_convert(&self, object: &DicomObject, root: &Path) -> Conversion;
}

/// Used when conversion is disabled
#[derive(Debug, Default)]
pub struct NoopConverter;

#[async_trait]
impl Converter for NoopConverter {
    async fn try_convert(&self, _object: &DicomObject, _root: &Path) -> Conversion {
        Conversion::Unchanged
    }
}

/// Build the converter described by `[conversion]`
pub fn from_config(config: &ConversionConfig) -> Box<dyn Converter> {
    match (&config.tool, config.enabled) {
        (Some(tool), true) if tool.exists() => Box::new(ExternalConverter {
            tool: tool.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }),
        (Some(tool), true) => {
            tracing::warn!(
                "Conversion tool {} not found; multi-frame objects are kept as received",
                tool.display()
            );
            Box::new(NoopConverter)
        }
        _ => Box::new(NoopConverter),
    }
}

#[derive(Debug)]
pub struct ExternalConverter {
    pub tool: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
}

/// Objects the external tool is run for
pub fn needs_conversion(object: &DicomObject) -> bool {
    object.modality == Modality::Imaging
        && (object.is_multi_frame()
            || object.sop_class_uid == uids::ENHANCED_MR_IMAGE_STORAGE
            || object.sop_class_uid == uids::ENHANCED_MR_COLOR_IMAGE_STORAGE)
}

impl ExternalConverter {
    async fn run_tool(&self, input: &Path, out_dir: &Path) -> Result<(), String> {
        let mut command = tokio::process::Command::new(&self.tool);
        command
            .args(&self.args)
            .arg("--out-dir")
            .arg(out_dir)
            .arg(input)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| format!("timed out after {:?}", self.timeout))?
            .map_err(|e| format!("failed to start {}: {}", self.tool.display(), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("exited with {}: {}", output.status, stderr.trim()));
        }
        debug!("Converter output: {}", String::from_utf8_lossy(&output.stdout).trim());
        Ok(())
    }

    async fn store_outputs(&self, out_dir: &Path, root: &Path) -> Result<Vec<DicomObject>, String> {
        let mut produced = Vec::new();
        let mut entries = tokio::fs::read_dir(out_dir)
            .await
            .map_err(|e| format!("cannot list converter output: {}", e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| e.to_string())? {
            let path = entry.path();
            if path.is_file() {
                let object = DicomObject::load(&path).await.map_err(|e| e.to_string())?;
                produced.push(object);
            }
        }
        if produced.is_empty() {
            return Err("converter produced no files".to_string());
        }

        let storage = FilesystemStorage::new(root).map_err(|e| e.to_string())?;
        move_outputs(&storage, produced).await
    }
}

/// Move converted objects under `storage`; on failure none of them is left behind
async fn move_outputs(
    storage: &FilesystemStorage,
    produced: Vec<DicomObject>,
) -> Result<Vec<DicomObject>, String> {
    let mut stored: Vec<DicomObject> = Vec::with_capacity(produced.len());
    for mut object in produced {
        match storage
            .move_into(&object.path, &layout::object_relative_path(&object))
            .await
        {
            Ok(dest) => {
                object.path = dest;
                stored.push(object);
            }
            Err(e) => {
                for moved in &stored {
                    if let Err(e) = storage::remove_file(&moved.path).await {
                        warn!("Converted output {} could not be removed: {}", moved.path.display(), e);
                    }
                }
                return Err(format!("cannot store {}: {}", object.instance_uid, e));
            }
        }
    }
    Ok(stored)
}

#[async_trait]
impl Converter for ExternalConverter {
    async fn try_convert(&self, object: &DicomObject, root: &Path) -> Conversion {
        if !needs_conversion(object) {
            return Conversion::Unchanged;
        }
        let parent = object.path.parent().unwrap_or(root);
        let out_dir = match tempfile::Builder::new().prefix(".convert-").tempdir_in(parent) {
            Ok(dir) => dir,
            Err(e) => return Conversion::Failed(format!("cannot create output folder: {}", e)),
        };

        if let Err(reason) = self.run_tool(&object.path, out_dir.path()).await {
            return Conversion::Failed(reason);
        }
        match self.store_outputs(out_dir.path(), root).await {
            Ok(converted) => {
                if let Err(e) = storage::remove_file(&object.path).await {
                    tracing::warn!("Converted original could not be removed: {}", e);
                }
                info!(
                    "Converted {} into {} single-frame objects",
                    object.instance_uid,
                    converted.len()
                );
                Conversion::Converted(converted)
            }
            Err(reason) => Conversion::Failed(reason),
        }
    }
}
