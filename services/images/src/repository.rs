use crate::batch::{BatchOutcome, ItemFailure};
use crate::error::{ImageError, ImageResult};
use crate::keys::ObjectKey;
use crate::metadata_store::{ImageRecord, ImageRecordStore};
use crate::object_store::ObjectStore;
use crate::url_cache::SignedUrlCache;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// An uploaded object about to be attached to a discovery
#[derive(Debug, Clone)]
pub struct NewImage {
    pub key: ObjectKey,
    pub exif: Option<serde_json::Value>,
}

impl From<ObjectKey> for NewImage {
    fn from(key: ObjectKey) -> Self {
        Self { key, exif: None }
    }
}

/// Owns the discovery -> images mapping and keeps rows and objects in step.
///
/// Objects are written before rows reference them. Removal deletes the
/// object first and keeps the row when that fails, so a row never points
/// at bytes known to be gone.
pub struct ImageRepository {
    objects: Arc<dyn ObjectStore>,
    records: Arc<dyn ImageRecordStore>,
    urls: Arc<SignedUrlCache>,
    concurrency: usize,
}

impl ImageRepository {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        records: Arc<dyn ImageRecordStore>,
        urls: Arc<SignedUrlCache>,
        concurrency: usize,
    ) -> Self {
        Self {
            objects,
            records,
            urls,
            concurrency: concurrency.max(1),
        }
    }

    /// Create one row per image, appended after the discovery's current
    /// highest order. Existing rows keep their order.
    #[instrument(skip(self, images), fields(count = images.len()))]
    pub async fn attach(
        &self,
        discovery_id: Uuid,
        images: Vec<NewImage>,
    ) -> ImageResult<Vec<ImageRecord>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let first_order = match self.records.max_order(discovery_id).await? {
            Some(max) => max.checked_add(1),
            None => Some(0),
        };
        let first_order = first_order
            .filter(|first| {
                i32::try_from(images.len() - 1)
                    .ok()
                    .and_then(|last| first.checked_add(last))
                    .is_some()
            })
            .ok_or(ImageError::OrderExhausted {
                discovery_id,
                count: images.len(),
            })?;

        // URLs issued up front make the first read free; a missing one is
        // simply issued on that read instead.
        let issues: Vec<_> = images
            .iter()
            .map(|image| async move {
                match self.urls.issue(&image.key).await {
                    Ok(url) => Some(url),
                    Err(e) => {
                        warn!(key = %image.key, error = %e, "Failed to pre-issue signed URL");
                        None
                    }
                }
            })
            .collect();
        let signed_urls: Vec<_> = stream::iter(issues)
            .buffered(self.concurrency)
            .collect()
            .await;

        let created_at = Utc::now();
        let records: Vec<ImageRecord> = images
            .into_iter()
            .zip(signed_urls)
            .enumerate()
            .map(|(position, (image, signed_url))| {
                ImageRecord::new(
                    discovery_id,
                    image.key,
                    first_order + position as i32,
                    signed_url.as_ref(),
                    image.exif,
                    created_at,
                )
            })
            .collect();

        self.records.insert_images(&records).await?;

        info!(
            discovery_id = %discovery_id,
            count = records.len(),
            first_order = first_order,
            "Images attached to discovery"
        );

        Ok(records)
    }

    /// Images of a discovery in display order, each with a usable URL.
    ///
    /// Images whose URL could not be issued are reported in place.
    #[instrument(skip(self))]
    pub async fn list_for_discovery(&self, discovery_id: Uuid) -> ImageResult<BatchOutcome<ImageRecord>> {
        let records = self.records.list_images(discovery_id).await?;
        let outcome = self.urls.resolve_all(records).await;

        if !outcome.is_complete() {
            warn!(
                discovery_id = %discovery_id,
                failed = outcome.failures().count(),
                total = outcome.len(),
                "Some image URLs could not be resolved"
            );
        }

        Ok(outcome)
    }

    /// Apply new display orders. Updates are independent; the outcome lists
    /// which ones persisted.
    #[instrument(skip(self, new_order), fields(count = new_order.len()))]
    pub async fn reorder(
        &self,
        discovery_id: Uuid,
        new_order: Vec<(Uuid, i32)>,
    ) -> ImageResult<BatchOutcome<Uuid>> {
        if let Some(&(image_id, order)) = new_order.iter().find(|(_, order)| *order < 0) {
            return Err(ImageError::InvalidOrder { image_id, order });
        }

        let items: Vec<_> = stream::iter(new_order)
            .map(|(image_id, order)| async move {
                self.records
                    .update_order(discovery_id, image_id, order)
                    .await
                    .map(|()| image_id)
                    .map_err(|error| ItemFailure { id: image_id, error })
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        Ok(BatchOutcome::new(items))
    }

    /// Delete an image's object, then its row. A missing row is a no-op.
    #[instrument(skip(self))]
    pub async fn remove(&self, image_id: Uuid) -> ImageResult<()> {
        let Some(record) = self.records.get_image(image_id).await? else {
            debug!(image_id = %image_id, "Image already removed");
            return Ok(());
        };

        self.remove_record(&record).await
    }

    /// Remove every image of a discovery, image by image, with the same
    /// fail-closed ordering as [`ImageRepository::remove`].
    #[instrument(skip(self))]
    pub async fn remove_all_for_discovery(&self, discovery_id: Uuid) -> ImageResult<BatchOutcome<Uuid>> {
        let records = self.records.list_images(discovery_id).await?;

        let items: Vec<_> = stream::iter(records)
            .map(|record| async move {
                self.remove_record(&record)
                    .await
                    .map(|()| record.id)
                    .map_err(|error| ItemFailure { id: record.id, error })
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let outcome = BatchOutcome::new(items);
        info!(
            discovery_id = %discovery_id,
            removed = outcome.succeeded().count(),
            failed = outcome.failures().count(),
            "Discovery images removed"
        );

        Ok(outcome)
    }

    async fn remove_record(&self, record: &ImageRecord) -> ImageResult<()> {
        if let Err(e) = self.objects.delete(&record.image_key).await {
            warn!(
                image_id = %record.id,
                key = %record.image_key,
                error = %e,
                "Object delete failed, keeping image row"
            );
            metrics::counter!("images.remove.storage_failed").increment(1);
            return Err(e);
        }

        // Bytes are gone; a failure here leaves an orphaned-but-harmless row
        // for the next attempt, which deletes the (absent) object idempotently.
        self.records.delete_image(record.id).await?;
        metrics::counter!("images.removed").increment(1);

        debug!(image_id = %record.id, key = %record.image_key, "Image removed");
        Ok(())
    }
}
