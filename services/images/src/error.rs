use thiserror::Error;
use uuid::Uuid;

use crate::batch::ItemFailure;

pub type ImageResult<T> = Result<T, ImageError>;

/// Errors surfaced by the image lifecycle components
#[derive(Error, Debug)]
pub enum ImageError {
    /// Payload failed size/type validation before any network call
    #[error("Image {position} is invalid: {reason}")]
    InvalidImage { position: usize, reason: String },

    /// Transport or auth failure talking to object storage
    #[error("Object storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The object store reported the key as missing
    #[error("Stored image not found: {0}")]
    ObjectNotFound(String),

    /// The metadata store rejected an insert/update/delete
    #[error("Failed to write image metadata: {0}")]
    MetadataWriteFailed(String),

    /// The metadata store could not be read
    #[error("Failed to read image metadata: {0}")]
    MetadataUnavailable(String),

    #[error("Image {0} not found")]
    ImageNotFound(Uuid),

    #[error("Invalid display order {order} for image {image_id}")]
    InvalidOrder { image_id: Uuid, order: i32 },

    /// Appending would push display orders past `i32::MAX`
    #[error("No display order left for {count} new images on discovery {discovery_id}")]
    OrderExhausted { discovery_id: Uuid, count: usize },

    /// Some items of a best-effort batch failed while others succeeded
    #[error("{} of {total} images failed: {}", failures.len(), summarize(failures))]
    PartialBatchFailure {
        failures: Vec<ItemFailure>,
        total: usize,
    },
}

impl ImageError {
    /// Short machine-readable code used in API responses and metrics labels
    pub fn code(&self) -> &'static str {
        match self {
            ImageError::InvalidImage { .. } => "INVALID_IMAGE",
            ImageError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            ImageError::ObjectNotFound(_) => "OBJECT_NOT_FOUND",
            ImageError::MetadataWriteFailed(_) => "METADATA_WRITE_FAILED",
            ImageError::MetadataUnavailable(_) => "METADATA_UNAVAILABLE",
            ImageError::ImageNotFound(_) => "NOT_FOUND",
            ImageError::InvalidOrder { .. } | ImageError::OrderExhausted { .. } => "INVALID_ORDER",
            ImageError::PartialBatchFailure { .. } => "PARTIAL_BATCH_FAILURE",
        }
    }
}

fn summarize(failures: &[ItemFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.id, f.error))
        .collect::<Vec<_>>()
        .join(", ")
}
