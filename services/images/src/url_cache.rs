use crate::batch::{BatchOutcome, ItemFailure};
use crate::config::ImagesConfig;
use crate::error::ImageResult;
use crate::keys::ObjectKey;
use crate::metadata_store::{ImageRecord, ImageRecordStore};
use crate::object_store::{ObjectStore, SignedUrl};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Validity window of issued URLs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrlPolicy {
    pub ttl: Duration,
    /// URLs within this distance of expiry are refreshed early
    pub refresh_margin: Duration,
}

impl UrlPolicy {
    pub fn from_config(config: &ImagesConfig) -> Self {
        Self {
            ttl: config.signed_url_ttl(),
            refresh_margin: config.refresh_margin(),
        }
    }

    /// Whether `record` needs a new URL at `now`.
    ///
    /// Stale when no URL is cached, or when more than `ttl - refresh_margin`
    /// has passed since the reference instant.
    pub fn is_stale(&self, record: &ImageRecord, now: DateTime<Utc>) -> bool {
        if record.image_url.is_none() {
            return true;
        }
        let usable = self.ttl.saturating_sub(self.refresh_margin);
        match now.signed_duration_since(record.url_reference_time()).to_std() {
            Ok(elapsed) => elapsed > usable,
            // Reference instant ahead of our clock
            Err(_) => false,
        }
    }
}

impl Default for UrlPolicy {
    fn default() -> Self {
        Self::from_config(&ImagesConfig::default())
    }
}

/// Keeps the cached display URL of each image record usable.
///
/// Fresh records pass through without any storage call; stale ones get a
/// new URL which is written back so the next read is cheap again.
pub struct SignedUrlCache {
    objects: Arc<dyn ObjectStore>,
    records: Arc<dyn ImageRecordStore>,
    policy: UrlPolicy,
    concurrency: usize,
}

impl SignedUrlCache {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        records: Arc<dyn ImageRecordStore>,
        policy: UrlPolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            objects,
            records,
            policy,
            concurrency: concurrency.max(1),
        }
    }

    /// Issue a URL for a key that is about to be attached
    pub async fn issue(&self, key: &ObjectKey) -> ImageResult<SignedUrl> {
        self.objects.signed_get_url(key, self.policy.ttl).await
    }

    /// Return `record` with a usable URL, refreshing it when stale
    #[instrument(skip(self, record), fields(image_id = %record.id))]
    pub async fn resolve(&self, record: ImageRecord) -> ImageResult<ImageRecord> {
        if !self.policy.is_stale(&record, Utc::now()) {
            metrics::counter!("images.url.cache_hits").increment(1);
            return Ok(record);
        }

        let signed_url = self.issue(&record.image_key).await?;
        metrics::counter!("images.url.refreshed").increment(1);

        // The cache only saves future signing calls; losing the write is harmless.
        if let Err(e) = self.records.update_signed_url(record.id, &signed_url).await {
            warn!(
                image_id = %record.id,
                error = %e,
                "Failed to cache refreshed signed URL"
            );
            metrics::counter!("images.url.writeback_failed").increment(1);
        }

        debug!(
            image_id = %record.id,
            expires_at = %signed_url.expires_at(),
            "Signed URL refreshed"
        );

        Ok(record.with_signed_url(&signed_url))
    }

    /// Resolve every record; failures are reported per item, in input order
    pub async fn resolve_all(&self, records: Vec<ImageRecord>) -> BatchOutcome<ImageRecord> {
        let items: Vec<_> = stream::iter(records)
            .map(|record| async move {
                let id = record.id;
                self.resolve(record)
                    .await
                    .map_err(|error| ItemFailure { id, error })
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        BatchOutcome::new(items)
    }
}
