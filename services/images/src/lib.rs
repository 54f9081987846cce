//! Discovery Image Service
//!
//! Stores the photos attached to a discovery and hands out time-limited
//! URLs for displaying them. Image bytes live in a private S3-compatible
//! bucket; PostgreSQL holds one row per image with its order, EXIF block
//! and the most recently issued signed URL.
//!
//! ## Features
//!
//! - **All-or-nothing uploads**: a batch is validated before anything is
//!   written, and a failed upload removes whatever the batch already stored
//! - **Signed URL caching**: URLs are cached on the image row and only
//!   re-signed when they are about to expire
//! - **Partial failure reporting**: listing, reordering and bulk removal
//!   report failures per image instead of failing the whole request
//! - **Fail-closed removal**: a row is only deleted once its object is gone
//!
//! ## Architecture
//!
//! ```text
//!   HTTP API
//! ┌──────────────┐
//! │ Discovery    │
//! │ Images       │
//! └──────────────┘
//!     │      │
//!     ▼      ▼
//! ┌────────┐ ┌──────────────┐       ┌──────────────┐
//! │ Upload │ │ Image        │──────▶│ Signed URL   │
//! │Pipeline│ │ Repository   │       │ Cache        │
//! └────────┘ └──────────────┘       └──────────────┘
//!     │         │        │             │       │
//!     ▼         ▼        ▼             ▼       ▼
//! ┌──────────────────┐ ┌─────────────────────────┐
//! │ Object Store     │ │ Image Record Store      │
//! │ (S3 bucket)      │ │ (PostgreSQL)            │
//! └──────────────────┘ └─────────────────────────┘
//! ```

pub mod api;
pub mod batch;
pub mod config;
pub mod error;
pub mod keys;
pub mod metadata_store;
pub mod object_store;
pub mod repository;
pub mod service;
pub mod upload;
pub mod url_cache;

#[cfg(test)]
mod testing;

pub use batch::{BatchOutcome, ItemFailure};
pub use config::Config;
pub use error::{ImageError, ImageResult};
pub use keys::ObjectKey;
pub use metadata_store::{ImageRecord, ImageRecordStore, PgImageStore};
pub use object_store::{ObjectStore, S3ObjectStore, SignedUrl};
pub use repository::{ImageRepository, NewImage};
pub use service::{DiscoveryImages, ImageOrder};
pub use upload::{ImagePayload, ImagePolicy, UploadPipeline};
pub use url_cache::{SignedUrlCache, UrlPolicy};
