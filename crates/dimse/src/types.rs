//! Common types for DIMSE operations

use bytes::Bytes;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// UIDs used by the store/forward subset.
pub mod uids {
    pub const VERIFICATION: &str = "1.2.840.10008.1.1";

    pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
    pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
    pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";
    pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

    pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
    pub const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
    pub const ENHANCED_MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4.1";
    pub const ENHANCED_MR_COLOR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4.3";
    pub const PET_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.128";
    pub const SPATIAL_REGISTRATION_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.66.1";
    pub const DEFORMABLE_SPATIAL_REGISTRATION_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.66.3";
    pub const RT_DOSE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.481.2";
    pub const RT_STRUCTURE_SET_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.481.3";
    pub const RT_PLAN_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.481.5";
    pub const RT_ION_PLAN_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.481.8";
}

/// Represents a DICOM dataset as either in-memory bytes or a file path
///
/// The bytes are the dataset only (no preamble or file meta group), encoded
/// in the transfer syntax recorded in the metadata.
#[derive(Debug, Clone)]
pub enum DatasetStream {
    /// DICOM dataset in memory
    Memory {
        /// Raw dataset bytes
        data: Bytes,
        /// Associated metadata
        metadata: DatasetMetadata,
    },
    /// DICOM dataset stored inside a Part 10 file
    File {
        /// Path to the Part 10 file
        path: PathBuf,
        /// Associated metadata
        metadata: DatasetMetadata,
        /// Whether to delete the file when dropped
        delete_on_drop: bool,
    },
}

/// Metadata associated with a DICOM dataset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// Unique identifier for this dataset
    pub id: Uuid,

    /// Transfer syntax UID
    pub transfer_syntax: Option<String>,

    /// SOP Class UID
    pub sop_class_uid: Option<String>,

    /// SOP Instance UID
    pub sop_instance_uid: Option<String>,

    /// Study Instance UID
    pub study_instance_uid: Option<String>,

    /// Series Instance UID
    pub series_instance_uid: Option<String>,

    /// Patient ID
    pub patient_id: Option<String>,

    /// Patient name
    pub patient_name: Option<String>,

    /// Modality attribute (CT, MR, RTPLAN, ...)
    pub modality: Option<String>,

    /// RT Plan Label, present on RT Plan objects
    pub rt_plan_label: Option<String>,

    /// Number of frames, for multi-frame objects
    pub number_of_frames: Option<u32>,

    /// Whether the dataset carries Pixel Data
    pub has_pixel_data: bool,

    /// Timestamp when dataset was received/created
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,

    /// Size of the dataset in bytes
    pub size_bytes: Option<u64>,
}

/// DIMSE command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimseCommand {
    /// C-ECHO command
    Echo,
    /// C-STORE command
    Store,
}

/// DIMSE operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    /// Operation completed successfully
    Success,
    /// Operation is pending (more responses to follow)
    Pending,
    /// Operation cancelled by user
    Cancel,
    /// Operation failed with error
    Failure(u16), // DICOM status code
    /// Warning occurred during operation
    Warning(u16), // DICOM status code
}

impl DimseStatus {
    /// Out of resources: the SCP could not persist the object
    pub const OUT_OF_RESOURCES: DimseStatus = DimseStatus::Failure(0xA700);
    /// Dataset does not match SOP class
    pub const DATASET_MISMATCH: DimseStatus = DimseStatus::Failure(0xA900);
    /// Cannot understand: the dataset could not be parsed
    pub const CANNOT_UNDERSTAND: DimseStatus = DimseStatus::Failure(0xC000);
    /// Refused: SOP class not supported
    pub const SOP_CLASS_NOT_SUPPORTED: DimseStatus = DimseStatus::Failure(0x0122);
    /// Generic processing failure
    pub const PROCESSING_FAILURE: DimseStatus = DimseStatus::Failure(0x0110);

    /// Map a status code from a response command set
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => DimseStatus::Success,
            0xFF00 | 0xFF01 => DimseStatus::Pending,
            0xFE00 => DimseStatus::Cancel,
            0x0001 | 0xB000..=0xBFFF => DimseStatus::Warning(code),
            _ => DimseStatus::Failure(code),
        }
    }

    /// Status code to put on the wire
    pub fn code(&self) -> u16 {
        match self {
            DimseStatus::Success => 0x0000,
            DimseStatus::Pending => 0xFF00,
            DimseStatus::Cancel => 0xFE00,
            DimseStatus::Failure(code) | DimseStatus::Warning(code) => *code,
        }
    }

    /// Success and warning both mean the peer accepted the object
    pub fn is_accepted(&self) -> bool {
        matches!(self, DimseStatus::Success | DimseStatus::Warning(_))
    }
}

impl std::fmt::Display for DimseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DimseStatus::Success => write!(f, "Success (0x0000)"),
            DimseStatus::Pending => write!(f, "Pending (0xFF00)"),
            DimseStatus::Cancel => write!(f, "Cancel (0xFE00)"),
            DimseStatus::Failure(code) => write!(f, "Failure (0x{:04X})", code),
            DimseStatus::Warning(code) => write!(f, "Warning (0x{:04X})", code),
        }
    }
}

impl DatasetStream {
    /// Create a new in-memory dataset
    pub fn from_bytes(data: Bytes, metadata: DatasetMetadata) -> Self {
        Self::Memory { data, metadata }
    }

    /// Create a new file-based dataset
    pub fn from_file(path: PathBuf, metadata: DatasetMetadata, delete_on_drop: bool) -> Self {
        Self::File {
            path,
            metadata,
            delete_on_drop,
        }
    }

    /// Get the metadata for this dataset
    pub fn metadata(&self) -> &DatasetMetadata {
        match self {
            Self::Memory { metadata, .. } => metadata,
            Self::File { metadata, .. } => metadata,
        }
    }

    /// Get mutable metadata for this dataset
    pub fn metadata_mut(&mut self) -> &mut DatasetMetadata {
        match self {
            Self::Memory { metadata, .. } => metadata,
            Self::File { metadata, .. } => metadata,
        }
    }

    /// Dataset bytes, loading them from the Part 10 file if necessary
    pub async fn to_bytes(&self) -> crate::error::Result<Bytes> {
        match self {
            Self::Memory { data, .. } => Ok(data.clone()),
            Self::File { path, .. } => {
                let raw = tokio::fs::read(path).await?;
                let file = crate::part10::split(Bytes::from(raw))?;
                Ok(file.dataset)
            }
        }
    }
}

impl DatasetMetadata {
    /// Create new metadata with a unique ID and current timestamp
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Some(chrono::Utc::now()),
            ..Default::default()
        }
    }

    /// Extract the identifying attributes from a parsed dataset
    pub fn from_dataset(object: &InMemDicomObject) -> Self {
        let text = |tag| {
            object
                .element(tag)
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|s| s.trim_end_matches(['\0', ' ']).trim_start().to_string())
                .filter(|s| !s.is_empty())
        };

        let number_of_frames = text(tags::NUMBER_OF_FRAMES).and_then(|s| s.parse::<u32>().ok());

        Self {
            sop_class_uid: text(tags::SOP_CLASS_UID),
            sop_instance_uid: text(tags::SOP_INSTANCE_UID),
            study_instance_uid: text(tags::STUDY_INSTANCE_UID),
            series_instance_uid: text(tags::SERIES_INSTANCE_UID),
            patient_id: text(tags::PATIENT_ID),
            patient_name: text(tags::PATIENT_NAME),
            modality: text(tags::MODALITY),
            rt_plan_label: text(tags::RT_PLAN_LABEL),
            number_of_frames,
            has_pixel_data: object.element(tags::PIXEL_DATA).is_ok(),
            ..Self::new()
        }
    }
}

// Implement Drop for DatasetStream to handle file cleanup
impl Drop for DatasetStream {
    fn drop(&mut self) {
        if let DatasetStream::File {
            path,
            delete_on_drop,
            ..
        } = self
        {
            if *delete_on_drop {
                if let Err(e) = std::fs::remove_file(&*path) {
                    tracing::warn!("Failed to delete temporary DICOM file {:?}: {}", path, e);
                }
            }
        }
    }
}
