use std::path::{Path, PathBuf};

use dimse::types::uids;
use dimse::DatasetMetadata;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Patient ID used when an object carries none
pub const UNKNOWN_PATIENT: &str = "UNKNOWN_PATIENT";
const UNKNOWN_SERIES: &str = "UNKNOWN_SERIES";

/// Functional category of an object, in send order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Modality {
    Imaging,
    StructureSet,
    Plan,
    Dose,
    Other,
}

impl Modality {
    /// Classify by the Modality attribute, falling back to the SOP class
    pub fn from_dicom(modality: Option<&str>, sop_class_uid: Option<&str>) -> Self {
        match modality.map(|m| m.trim().to_ascii_uppercase()).as_deref() {
            Some("CT" | "MR" | "PT" | "CBCT") => return Modality::Imaging,
            Some("RTSTRUCT") => return Modality::StructureSet,
            Some("RTPLAN" | "RTIONPLAN") => return Modality::Plan,
            Some("RTDOSE") => return Modality::Dose,
            Some(m) if !m.is_empty() => return Modality::Other,
            _ => {}
        }

        match sop_class_uid {
            Some(
                uids::CT_IMAGE_STORAGE
                | uids::MR_IMAGE_STORAGE
                | uids::ENHANCED_MR_IMAGE_STORAGE
                | uids::ENHANCED_MR_COLOR_IMAGE_STORAGE
                | uids::PET_IMAGE_STORAGE,
            ) => Modality::Imaging,
            Some(uids::RT_STRUCTURE_SET_STORAGE) => Modality::StructureSet,
            Some(uids::RT_PLAN_STORAGE | uids::RT_ION_PLAN_STORAGE) => Modality::Plan,
            Some(uids::RT_DOSE_STORAGE) => Modality::Dose,
            _ => Modality::Other,
        }
    }

    /// Position in the send order; lower goes first
    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Imaging => "imaging",
            Modality::StructureSet => "structure-set",
            Modality::Plan => "plan",
            Modality::Dose => "dose",
            Modality::Other => "other",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural problems that make a file unusable
#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("missing required attribute {0}")]
    MissingAttribute(&'static str),

    #[error("unreadable DICOM file {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

/// One received or watched file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DicomObject {
    pub modality: Modality,
    /// Modality attribute as found in the file (CT, RTPLAN, ...)
    pub modality_code: String,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub study_uid: String,
    pub series_uid: String,
    pub instance_uid: String,
    pub sop_class_uid: String,
    pub transfer_syntax: String,
    pub plan_label: Option<String>,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub has_pixel_data: bool,
    pub number_of_frames: u32,
}

impl DicomObject {
    /// Build from parsed metadata; the file at `path` holds the object
    pub fn from_metadata(path: impl Into<PathBuf>, meta: &DatasetMetadata) -> Result<Self, ObjectError> {
        let study_uid = meta
            .study_instance_uid
            .clone()
            .ok_or(ObjectError::MissingAttribute("StudyInstanceUID"))?;
        let instance_uid = meta
            .sop_instance_uid
            .clone()
            .ok_or(ObjectError::MissingAttribute("SOPInstanceUID"))?;
        let sop_class_uid = meta
            .sop_class_uid
            .clone()
            .ok_or(ObjectError::MissingAttribute("SOPClassUID"))?;
        let transfer_syntax = meta
            .transfer_syntax
            .clone()
            .ok_or(ObjectError::MissingAttribute("TransferSyntaxUID"))?;

        let modality = Modality::from_dicom(meta.modality.as_deref(), Some(&sop_class_uid));
        let modality_code = meta
            .modality
            .clone()
            .unwrap_or_else(|| modality.as_str().to_ascii_uppercase());

        Ok(Self {
            modality,
            modality_code,
            patient_id: meta
                .patient_id
                .clone()
                .unwrap_or_else(|| UNKNOWN_PATIENT.to_string()),
            patient_name: meta.patient_name.clone(),
            study_uid,
            series_uid: meta
                .series_instance_uid
                .clone()
                .unwrap_or_else(|| UNKNOWN_SERIES.to_string()),
            instance_uid,
            sop_class_uid,
            transfer_syntax,
            plan_label: meta.rt_plan_label.clone(),
            path: path.into(),
            size_bytes: meta.size_bytes.unwrap_or_default(),
            has_pixel_data: meta.has_pixel_data,
            number_of_frames: meta.number_of_frames.unwrap_or(1),
        })
    }

    /// Read and validate a Part 10 file from disk
    pub async fn load(path: &Path) -> Result<Self, ObjectError> {
        let (_, meta) = dimse::part10::read_metadata(path)
            .await
            .map_err(|e| ObjectError::Unreadable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Self::from_metadata(path, &meta)
    }

    /// Metadata view handed to the DIMSE layer when sending
    pub fn dataset_metadata(&self) -> DatasetMetadata {
        DatasetMetadata {
            transfer_syntax: Some(self.transfer_syntax.clone()),
            sop_class_uid: Some(self.sop_class_uid.clone()),
            sop_instance_uid: Some(self.instance_uid.clone()),
            study_instance_uid: Some(self.study_uid.clone()),
            series_instance_uid: Some(self.series_uid.clone()),
            patient_id: Some(self.patient_id.clone()),
            modality: Some(self.modality_code.clone()),
            size_bytes: Some(self.size_bytes),
            ..DatasetMetadata::new()
        }
    }

    pub fn is_multi_frame(&self) -> bool {
        self.number_of_frames > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modality_precedence() {
        let mut all = vec![
            Modality::Other,
            Modality::Dose,
            Modality::Plan,
            Modality::StructureSet,
            Modality::Imaging,
        ];
        all.sort();
        assert_eq!(
            all,
            vec![
                Modality::Imaging,
                Modality::StructureSet,
                Modality::Plan,
                Modality::Dose,
                Modality::Other
            ]
        );
    }

    #[test]
    fn test_modality_classification() {
        assert_eq!(Modality::from_dicom(Some("CT"), None), Modality::Imaging);
        assert_eq!(Modality::from_dicom(Some("rtplan"), None), Modality::Plan);
        assert_eq!(Modality::from_dicom(Some("REG"), None), Modality::Other);
        assert_eq!(
            Modality::from_dicom(None, Some(uids::RT_DOSE_STORAGE)),
            Modality::Dose
        );
        assert_eq!(Modality::from_dicom(Some(""), None), Modality::Other);
    }

    #[test]
    fn test_from_metadata_requires_identity() {
        let mut meta = DatasetMetadata::new();
        meta.sop_instance_uid = Some("1.2.3".into());
        meta.sop_class_uid = Some(uids::CT_IMAGE_STORAGE.into());
        meta.transfer_syntax = Some(uids::EXPLICIT_VR_LITTLE_ENDIAN.into());
        assert!(matches!(
            DicomObject::from_metadata("/tmp/x.dcm", &meta),
            Err(ObjectError::MissingAttribute("StudyInstanceUID"))
        ));

        meta.study_instance_uid = Some("1.2".into());
        let object = DicomObject::from_metadata("/tmp/x.dcm", &meta).unwrap();
        assert_eq!(object.patient_id, UNKNOWN_PATIENT);
        assert_eq!(object.modality, Modality::Imaging);
        assert_eq!(object.modality_code, "IMAGING");
    }
}
