//! C-STORE status codes for local failures
//!
//! - `0xA700`: the object could not be written (out of resources)
//! - `0xC000`: the object is missing identifying attributes (cannot understand)
//! - `0x0110`: anything else (processing failure)

use dimse::types::DimseStatus;

use crate::models::ObjectError;
use crate::storage::StorageError;

pub fn object_error_to_dimse(error: &ObjectError) -> DimseStatus {
    match error {
        ObjectError::MissingAttribute(_) | ObjectError::Unreadable { .. } => {
            DimseStatus::CANNOT_UNDERSTAND
        }
    }
}

pub fn storage_error_to_dimse(error: &StorageError) -> DimseStatus {
    match error {
        StorageError::Io { .. } | StorageError::Config(_) => DimseStatus::OUT_OF_RESOURCES,
        StorageError::Path(_) => DimseStatus::PROCESSING_FAILURE,
    }
}
