//! Consumer-facing image operations for discovery records.

use crate::batch::BatchOutcome;
use crate::config::ImagesConfig;
use crate::error::ImageResult;
use crate::metadata_store::{ImageRecord, ImageRecordStore};
use crate::object_store::ObjectStore;
use crate::repository::{ImageRepository, NewImage};
use crate::upload::{ImagePayload, ImagePolicy, UploadPipeline};
use crate::url_cache::{SignedUrlCache, UrlPolicy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Requested display position of one image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageOrder {
    pub id: Uuid,
    pub order: i32,
}

/// Entry point used by the API layer
pub struct DiscoveryImages {
    uploads: UploadPipeline,
    repository: ImageRepository,
}

impl DiscoveryImages {
    /// Wire the pipeline, URL cache and repository around the given stores
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        records: Arc<dyn ImageRecordStore>,
        config: &ImagesConfig,
    ) -> Self {
        let concurrency = config.storage_concurrency;
        let urls = Arc::new(SignedUrlCache::new(
            objects.clone(),
            records.clone(),
            UrlPolicy::from_config(config),
            concurrency,
        ));

        Self {
            uploads: UploadPipeline::new(
                objects.clone(),
                ImagePolicy::from_config(config),
                concurrency,
            ),
            repository: ImageRepository::new(objects, records, urls, concurrency),
        }
    }

    /// Upload `payloads` and attach them to `discovery_id` in the given order
    #[instrument(skip(self, payloads), fields(count = payloads.len()))]
    pub async fn create_with_images(
        &self,
        owner_id: Uuid,
        discovery_id: Uuid,
        payloads: Vec<ImagePayload>,
    ) -> ImageResult<Vec<ImageRecord>> {
        let keys = self.uploads.upload(&payloads, owner_id, discovery_id).await?;

        let images: Vec<NewImage> = keys
            .iter()
            .cloned()
            .zip(payloads)
            .map(|(key, payload)| NewImage {
                key,
                exif: payload.exif,
            })
            .collect();

        match self.repository.attach(discovery_id, images).await {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!(
                    discovery_id = %discovery_id,
                    error = %e,
                    "Attaching uploaded images failed, removing uploaded objects"
                );
                self.uploads.discard(&keys.iter().collect::<Vec<_>>()).await;
                Err(e)
            }
        }
    }

    /// Images of a discovery in display order. Items whose URL could not be
    /// refreshed are reported in place rather than failing the listing.
    pub async fn list_with_images(&self, discovery_id: Uuid) -> ImageResult<BatchOutcome<ImageRecord>> {
        self.repository.list_for_discovery(discovery_id).await
    }

    /// Apply display orders; any failed update is reported as
    /// `PartialBatchFailure`.
    pub async fn reorder_images(&self, discovery_id: Uuid, order: Vec<ImageOrder>) -> ImageResult<()> {
        let updates = order.into_iter().map(|o| (o.id, o.order)).collect();
        self.repository
            .reorder(discovery_id, updates)
            .await?
            .into_result()
            .map(|_| ())
    }

    pub async fn remove_image(&self, image_id: Uuid) -> ImageResult<()> {
        self.repository.remove(image_id).await
    }

    /// Remove every image of a discovery; returns how many were removed
    pub async fn delete_all_images(&self, discovery_id: Uuid) -> ImageResult<usize> {
        self.repository
            .remove_all_for_discovery(discovery_id)
            .await?
            .into_result()
            .map(|removed| removed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ImageError;
    use crate::testing::{MemoryImageStore, MemoryObjectStore};
    use bytes::Bytes;

    fn service() -> (Arc<MemoryObjectStore>, Arc<MemoryImageStore>, DiscoveryImages) {
        let objects = Arc::new(MemoryObjectStore::new());
        let records = Arc::new(MemoryImageStore::new());
        let service = DiscoveryImages::new(objects.clone(), records.clone(), &ImagesConfig::default());
        (objects, records, service)
    }

    fn payload(bytes: &'static [u8]) -> ImagePayload {
        ImagePayload::new(Bytes::from_static(bytes), "image/jpeg")
    }

    #[tokio::test]
    async fn test_create_then_list_round_trip() {
        let (objects, _, service) = service();
        let owner = Uuid::new_v4();
        let discovery = Uuid::new_v4();

        let created = service
            .create_with_images(
                owner,
                discovery,
                vec![
                    payload(b"a"),
                    payload(b"b").with_exif(serde_json::json!({ "Orientation": 6 })),
                ],
            )
            .await
            .unwrap();

        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|r| r.image_key.belongs_to(owner, discovery)));
        assert!(created.iter().all(|r| r.image_url.is_some()));
        assert_eq!(created[1].exif_data.as_ref().unwrap()["Orientation"], 6);

        let signs = objects.sign_calls();
        let listed = service
            .list_with_images(discovery)
            .await
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(listed, created);
        assert_eq!(objects.sign_calls(), signs);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_batch_without_side_effects() {
        let (objects, records, service) = service();

        let err = service
            .create_with_images(
                Uuid::new_v4(),
                Uuid::new_v4(),
                vec![payload(b"a"), ImagePayload::new(Bytes::from_static(b"%PDF"), "application/pdf")],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ImageError::InvalidImage { position: 1, .. }));
        assert_eq!(objects.put_calls(), 0);
        assert_eq!(records.row_count(), 0);
    }

    #[tokio::test]
    async fn test_create_cleans_up_objects_when_attach_fails() {
        let (objects, records, service) = service();
        records.fail_inserts();

        let err = service
            .create_with_images(Uuid::new_v4(), Uuid::new_v4(), vec![payload(b"a"), payload(b"b")])
            .await
            .unwrap_err();

        assert!(matches!(err, ImageError::MetadataWriteFailed(_)));
        assert_eq!(objects.put_calls(), 2);
        assert_eq!(objects.object_count(), 0);
    }

    #[tokio::test]
    async fn test_reorder_surfaces_partial_failure() {
        let (_, records, service) = service();
        let discovery = Uuid::new_v4();
        let created = service
            .create_with_images(Uuid::new_v4(), discovery, vec![payload(b"a"), payload(b"b")])
            .await
            .unwrap();
        records.fail_order_update_of(created[1].id);

        let err = service
            .reorder_images(
                discovery,
                vec![
                    ImageOrder { id: created[0].id, order: 1 },
                    ImageOrder { id: created[1].id, order: 0 },
                ],
            )
            .await
            .unwrap_err();

        match err {
            ImageError::PartialBatchFailure { failures, total } => {
                assert_eq!(total, 2);
                assert_eq!(failures[0].id, created[1].id);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(records.row(created[0].id).unwrap().image_order, 1);
    }

    #[tokio::test]
    async fn test_delete_all_images_counts_removed() {
        let (objects, records, service) = service();
        let discovery = Uuid::new_v4();
        service
            .create_with_images(Uuid::new_v4(), discovery, vec![payload(b"a"), payload(b"b")])
            .await
            .unwrap();

        assert_eq!(service.delete_all_images(discovery).await.unwrap(), 2);
        assert_eq!(objects.object_count(), 0);
        assert_eq!(records.row_count(), 0);
        assert_eq!(service.delete_all_images(discovery).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_image_is_fail_closed() {
        let (objects, records, service) = service();
        let created = service
            .create_with_images(Uuid::new_v4(), Uuid::new_v4(), vec![payload(b"a")])
            .await
            .unwrap();
        objects.fail_delete_of(&created[0].image_key);

        assert!(service.remove_image(created[0].id).await.is_err());
        assert!(records.row(created[0].id).is_some());
    }
}
