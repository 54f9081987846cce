use crate::config::ImagesConfig;
use crate::error::{ImageError, ImageResult};
use crate::keys::{extension_for, normalize_content_type, ObjectKey};
use crate::object_store::{ObjectMetadata, ObjectStore};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Raw image handed over by camera capture or the gallery picker
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub bytes: Bytes,
    pub content_type: String,
    pub file_name: Option<String>,
    /// EXIF block extracted on the device, stored verbatim
    pub exif: Option<serde_json::Value>,
}

impl ImagePayload {
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
            file_name: None,
            exif: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_exif(mut self, exif: serde_json::Value) -> Self {
        self.exif = Some(exif);
        self
    }
}

/// Size and type rules applied before anything is uploaded
#[derive(Debug, Clone)]
pub struct ImagePolicy {
    pub max_bytes: usize,
    pub allowed_content_types: Vec<String>,
}

impl ImagePolicy {
    pub fn from_config(config: &ImagesConfig) -> Self {
        Self {
            max_bytes: config.max_image_bytes,
            allowed_content_types: config
                .allowed_content_types
                .iter()
                .map(|t| normalize_content_type(t))
                .collect(),
        }
    }

    /// Check one payload; `position` is its index in the batch
    pub fn validate(&self, position: usize, payload: &ImagePayload) -> ImageResult<()> {
        let invalid = |reason: String| ImageError::InvalidImage { position, reason };

        if payload.bytes.is_empty() {
            return Err(invalid("image is empty".to_string()));
        }
        if payload.bytes.len() > self.max_bytes {
            return Err(invalid(format!(
                "image is {} bytes, limit is {} bytes",
                payload.bytes.len(),
                self.max_bytes
            )));
        }
        let content_type = normalize_content_type(&payload.content_type);
        if !self.allowed_content_types.contains(&content_type) {
            return Err(invalid(format!(
                "unsupported content type {:?}",
                payload.content_type
            )));
        }
        Ok(())
    }
}

impl Default for ImagePolicy {
    fn default() -> Self {
        Self::from_config(&ImagesConfig::default())
    }
}

/// Validates, keys and uploads image batches.
///
/// Batches are all-or-nothing: nothing is uploaded unless every payload
/// passes validation, and a failed upload removes the objects already
/// written by the same batch.
pub struct UploadPipeline {
    store: Arc<dyn ObjectStore>,
    policy: ImagePolicy,
    concurrency: usize,
}

impl UploadPipeline {
    pub fn new(store: Arc<dyn ObjectStore>, policy: ImagePolicy, concurrency: usize) -> Self {
        Self {
            store,
            policy,
            concurrency: concurrency.max(1),
        }
    }

    /// Upload `payloads` for `owner_id`/`discovery_id`.
    ///
    /// Returned keys are in payload order.
    #[instrument(skip(self, payloads), fields(count = payloads.len()))]
    pub async fn upload(
        &self,
        payloads: &[ImagePayload],
        owner_id: Uuid,
        discovery_id: Uuid,
    ) -> ImageResult<Vec<ObjectKey>> {
        for (position, payload) in payloads.iter().enumerate() {
            self.policy.validate(position, payload)?;
        }

        let start = Instant::now();
        let now = Utc::now();
        let keys: Vec<ObjectKey> = payloads
            .iter()
            .map(|p| {
                let ext = extension_for(p.file_name.as_deref(), &p.content_type);
                ObjectKey::generate(owner_id, discovery_id, &ext, now)
            })
            .collect();

        let uploads: Vec<_> = payloads
            .iter()
            .zip(keys.iter())
            .map(|(payload, key)| {
                let metadata = object_metadata(owner_id, discovery_id, payload);
                let content_type = normalize_content_type(&payload.content_type);
                async move {
                    self.store
                        .put(key, payload.bytes.clone(), &content_type, &metadata)
                        .await
                }
            })
            .collect();
        let results: Vec<ImageResult<()>> = stream::iter(uploads)
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut first_error = None;
        let mut uploaded = Vec::new();
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(()) => uploaded.push(key),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => debug!(key = %key, error = %e, "Additional upload failure in batch"),
            }
        }

        if let Some(error) = first_error {
            warn!(
                error = %error,
                uploaded = uploaded.len(),
                "Image batch upload failed, removing uploaded objects"
            );
            self.discard(&uploaded).await;
            metrics::counter!("images.upload.failed_batches").increment(1);
            return Err(error);
        }

        let total_bytes: usize = payloads.iter().map(|p| p.bytes.len()).sum();
        metrics::counter!("images.uploaded").increment(keys.len() as u64);
        metrics::counter!("images.bytes.uploaded").increment(total_bytes as u64);
        metrics::histogram!("images.upload.duration_seconds").record(start.elapsed().as_secs_f64());

        info!(
            owner_id = %owner_id,
            discovery_id = %discovery_id,
            count = keys.len(),
            size_bytes = total_bytes,
            "Image batch uploaded"
        );

        Ok(keys)
    }

    /// Best-effort removal of objects whose batch was abandoned
    pub(crate) async fn discard(&self, keys: &[&ObjectKey]) {
        stream::iter(keys.iter().copied())
            .for_each_concurrent(self.concurrency, |key| async move {
                if let Err(e) = self.store.delete(key).await {
                    warn!(key = %key, error = %e, "Failed to remove object from aborted batch");
                }
            })
            .await;
    }
}

fn object_metadata(owner_id: Uuid, discovery_id: Uuid, payload: &ImagePayload) -> ObjectMetadata {
    let mut metadata = ObjectMetadata::new();
    metadata.insert("user-id".to_string(), owner_id.to_string());
    metadata.insert("discovery-id".to_string(), discovery_id.to_string());
    metadata.insert("uploaded-at".to_string(), Utc::now().to_rfc3339());
    if let Some(ref name) = payload.file_name {
        // Object metadata travels as HTTP headers.
        let ascii: String = name
            .chars()
            .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
            .collect();
        metadata.insert("original-name".to_string(), ascii);
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryObjectStore;
    use tokio_test::assert_err;

    fn pipeline(store: Arc<MemoryObjectStore>) -> UploadPipeline {
        UploadPipeline::new(store, ImagePolicy::default(), 4)
    }

    fn jpeg(bytes: &'static [u8]) -> ImagePayload {
        ImagePayload::new(Bytes::from_static(bytes), "image/jpeg")
    }

    #[tokio::test]
    async fn test_keys_follow_payload_order() {
        let store = Arc::new(MemoryObjectStore::new());
        let owner = Uuid::new_v4();
        let discovery = Uuid::new_v4();

        let payloads = vec![
            jpeg(b"first"),
            ImagePayload::new(Bytes::from_static(b"second"), "image/png"),
            jpeg(b"third").with_file_name("IMG_0003.HEIC"),
        ];
        let keys = pipeline(store.clone())
            .upload(&payloads, owner, discovery)
            .await
            .unwrap();

        assert_eq!(keys.len(), 3);
        for (key, expected) in keys.iter().zip([&b"first"[..], b"second", b"third"]) {
            assert!(key.belongs_to(owner, discovery));
            assert_eq!(store.object(key).unwrap().body, Bytes::from(expected));
        }
        assert_eq!(keys[1].extension(), Some("png"));
        assert_eq!(keys[2].extension(), Some("heic"));
        assert_eq!(store.put_calls(), 3);
    }

    #[tokio::test]
    async fn test_invalid_member_fails_batch_before_any_put() {
        let store = Arc::new(MemoryObjectStore::new());
        let oversized = ImagePayload::new(vec![0u8; 10 * 1024 * 1024 + 1], "image/jpeg");

        let err = pipeline(store.clone())
            .upload(&[jpeg(b"ok"), oversized], Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(err, ImageError::InvalidImage { position: 1, .. }), "{err:?}");
        assert_eq!(store.put_calls(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_type_rejected() {
        let store = Arc::new(MemoryObjectStore::new());
        let gif = ImagePayload::new(Bytes::from_static(b"GIF89a"), "image/gif");

        let err = pipeline(store.clone())
            .upload(&[gif], Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(err, ImageError::InvalidImage { position: 0, .. }));
        assert_eq!(store.put_calls(), 0);
    }

    #[test]
    fn test_policy_accepts_content_type_variants() {
        let policy = ImagePolicy::default();
        assert!(policy.validate(0, &jpeg(b"x")).is_ok());
        assert!(policy
            .validate(0, &ImagePayload::new(Bytes::from_static(b"x"), "IMAGE/HEIF"))
            .is_ok());
        assert!(policy
            .validate(0, &ImagePayload::new(Bytes::from_static(b"x"), "image/jpg; q=1"))
            .is_ok());
        assert!(policy.validate(0, &jpeg(b"")).is_err());
    }

    #[tokio::test]
    async fn test_failed_put_removes_uploaded_objects() {
        let store = Arc::new(MemoryObjectStore::new());
        store.fail_put_of(b"broken");

        let result = pipeline(store.clone())
            .upload(
                &[jpeg(b"good-1"), jpeg(b"broken"), jpeg(b"good-2")],
                Uuid::new_v4(),
                Uuid::new_v4(),
            )
            .await;

        let err = assert_err!(result);
        assert!(matches!(err, ImageError::StorageUnavailable(_)));
        assert_eq!(store.put_calls(), 3);
        assert_eq!(store.object_count(), 0);
    }

    #[tokio::test]
    async fn test_object_metadata_records_ownership() {
        let store = Arc::new(MemoryObjectStore::new());
        let owner = Uuid::new_v4();
        let discovery = Uuid::new_v4();

        let keys = pipeline(store.clone())
            .upload(&[jpeg(b"a").with_file_name("café.jpg")], owner, discovery)
            .await
            .unwrap();

        let stored = store.object(&keys[0]).unwrap();
        assert_eq!(stored.content_type, "image/jpeg");
        assert_eq!(stored.metadata["user-id"], owner.to_string());
        assert_eq!(stored.metadata["discovery-id"], discovery.to_string());
        assert_eq!(stored.metadata["original-name"], "caf_.jpg");
        assert!(stored.metadata.contains_key("uploaded-at"));
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let store = Arc::new(MemoryObjectStore::new());
        let keys = pipeline(store.clone())
            .upload(&[], Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();
        assert!(keys.is_empty());
        assert_eq!(store.put_calls(), 0);
    }
}
