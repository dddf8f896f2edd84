//! DICOM Part 10 file helpers
//!
//! Received data sets are kept as raw bytes. These helpers wrap them in a
//! preamble and file meta group without re-encoding, and split existing
//! files back into meta group and data set bytes.

use bytes::Bytes;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::{FileMetaTable, InMemDicomObject};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;

use crate::error::{DimseError, Result};
use crate::types::DatasetMetadata;

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";
/// Tag, VR, length and value of (0002,0000)
const GROUP_LENGTH_ELEMENT_LEN: usize = 12;

/// A Part 10 file split into its meta group and untouched data set bytes
#[derive(Debug, Clone)]
pub struct Part10File {
    pub meta: FileMetaTable,
    pub dataset: Bytes,
}

impl Part10File {
    /// Transfer syntax UID without padding
    pub fn transfer_syntax(&self) -> &str {
        self.meta.transfer_syntax.trim_end_matches(['\0', ' '])
    }
}

/// Split raw file bytes; the preamble is optional
pub fn split(raw: Bytes) -> Result<Part10File> {
    let start = if raw.len() >= PREAMBLE_LEN + MAGIC.len()
        && &raw[PREAMBLE_LEN..PREAMBLE_LEN + MAGIC.len()] == MAGIC
    {
        PREAMBLE_LEN
    } else if raw.starts_with(MAGIC) {
        0
    } else {
        return Err(DimseError::DicomParsing(
            "not a DICOM Part 10 file (missing DICM prefix)".into(),
        ));
    };

    let meta = FileMetaTable::from_reader(&raw[start..])
        .or_else(|_| FileMetaTable::from_reader(&raw[start + MAGIC.len()..]))
        .map_err(|e| DimseError::DicomParsing(format!("invalid file meta group: {}", e)))?;

    let offset = start + MAGIC.len() + GROUP_LENGTH_ELEMENT_LEN + meta.information_group_length as usize;
    if offset > raw.len() {
        return Err(DimseError::DicomParsing(format!(
            "file meta group length {} runs past end of file",
            meta.information_group_length
        )));
    }

    Ok(Part10File {
        meta,
        dataset: raw.slice(offset..),
    })
}

/// Build a Part 10 file around data set bytes encoded in `transfer_syntax`
pub fn encode(
    dataset: &[u8],
    sop_class_uid: &str,
    sop_instance_uid: &str,
    transfer_syntax: &str,
) -> Result<Vec<u8>> {
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(transfer_syntax)
        .implementation_class_uid(crate::IMPLEMENTATION_CLASS_UID)
        .implementation_version_name(crate::IMPLEMENTATION_VERSION_NAME)
        .build()
        .map_err(|e| DimseError::DicomObject(format!("cannot build file meta group: {}", e)))?;

    let mut group = Vec::with_capacity(256);
    meta.write(&mut group)
        .map_err(|e| DimseError::DicomObject(format!("cannot write file meta group: {}", e)))?;

    let mut out = Vec::with_capacity(PREAMBLE_LEN + MAGIC.len() + group.len() + dataset.len());
    out.extend_from_slice(&[0u8; PREAMBLE_LEN]);
    if !group.starts_with(MAGIC) {
        out.extend_from_slice(MAGIC);
    }
    out.extend_from_slice(&group);
    out.extend_from_slice(dataset);
    Ok(out)
}

/// Parse data set bytes with the given transfer syntax
pub fn parse_dataset(dataset: &[u8], transfer_syntax: &str) -> Result<InMemDicomObject> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax)
        .ok_or_else(|| DimseError::NotSupported(format!("transfer syntax {}", transfer_syntax)))?;

    InMemDicomObject::read_dataset_with_ts(dataset, ts)
        .map_err(|e| DimseError::DicomParsing(e.to_string()))
}

/// Extract metadata from data set bytes
pub fn dataset_metadata(dataset: &[u8], transfer_syntax: &str) -> Result<DatasetMetadata> {
    let object = parse_dataset(dataset, transfer_syntax)?;
    let mut metadata = DatasetMetadata::from_dataset(&object);
    metadata.transfer_syntax = Some(transfer_syntax.to_string());
    metadata.size_bytes = Some(dataset.len() as u64);
    Ok(metadata)
}

/// Read a Part 10 file from disk and extract its metadata
pub async fn read_metadata(path: &std::path::Path) -> Result<(Part10File, DatasetMetadata)> {
    let raw = tokio::fs::read(path).await?;
    let file = split(Bytes::from(raw))?;
    let mut metadata = dataset_metadata(&file.dataset, file.transfer_syntax())?;
    // Fall back to the meta group when the data set lacks the identifiers
    if metadata.sop_class_uid.is_none() {
        metadata.sop_class_uid = Some(
            file.meta
                .media_storage_sop_class_uid
                .trim_end_matches(['\0', ' '])
                .to_string(),
        );
    }
    if metadata.sop_instance_uid.is_none() {
        metadata.sop_instance_uid = Some(
            file.meta
                .media_storage_sop_instance_uid
                .trim_end_matches(['\0', ' '])
                .to_string(),
        );
    }
    Ok((file, metadata))
}
