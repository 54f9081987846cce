use crate::config::S3Config;
use crate::error::{ImageError, ImageResult};
use crate::keys::ObjectKey;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument};

/// User metadata stored alongside an object
pub type ObjectMetadata = BTreeMap<String, String>;

/// Time-limited credentialed URL granting read access to one object.
///
/// A refreshed URL is a new credential; nothing about its format is assumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedUrl {
    pub url: String,
    pub issued_at: DateTime<Utc>,
    #[serde(skip)]
    pub ttl: Duration,
}

impl SignedUrl {
    pub fn new(url: impl Into<String>, issued_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            url: url.into(),
            issued_at,
            ttl,
        }
    }

    /// Instant after which the URL must not be handed out
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero())
    }
}

/// Single-bucket object storage.
///
/// Implementations never retry; callers own retry policy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `body` under `key`, overwriting any existing object
    async fn put(
        &self,
        key: &ObjectKey,
        body: Bytes,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> ImageResult<()>;

    /// Issue a read URL valid for `ttl`. Existence is not checked.
    async fn signed_get_url(&self, key: &ObjectKey, ttl: Duration) -> ImageResult<SignedUrl>;

    /// Remove `key`; a missing key is not an error
    async fn delete(&self, key: &ObjectKey) -> ImageResult<()>;
}

/// S3-compatible object store (AWS S3, R2, MinIO)
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    in_flight: Arc<Semaphore>,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config, max_in_flight: usize) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for R2/MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            s3_config_builder = s3_config_builder.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "image-service-static",
            ));
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            max_in_flight = max_in_flight,
            "S3 object store initialized"
        );

        Ok(Self::from_client(client, config.bucket.clone(), max_in_flight))
    }

    /// Wrap an already configured client
    pub fn from_client(client: S3Client, bucket: String, max_in_flight: usize) -> Self {
        Self {
            client,
            bucket,
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn permit(&self) -> ImageResult<tokio::sync::SemaphorePermit<'_>> {
        self.in_flight
            .acquire()
            .await
            .map_err(|_| ImageError::StorageUnavailable("object store is shutting down".to_string()))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body, metadata), fields(key = %key, size_bytes = body.len()))]
    async fn put(
        &self,
        key: &ObjectKey,
        body: Bytes,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> ImageResult<()> {
        let _permit = self.permit().await?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .body(ByteStream::from(body))
            .content_type(content_type);

        for (name, value) in metadata {
            request = request.metadata(name, value);
        }

        request
            .send()
            .await
            .map_err(|e| storage_unavailable("upload", key, e))?;

        debug!(key = %key, "Object uploaded");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn signed_get_url(&self, key: &ObjectKey, ttl: Duration) -> ImageResult<SignedUrl> {
        let presigning_config = PresigningConfig::expires_in(ttl).map_err(|e| {
            ImageError::StorageUnavailable(format!("Invalid presigning window {ttl:?}: {e}"))
        })?;

        let _permit = self.permit().await?;

        // Taken before signing so the recorded window never outlives the credential.
        let issued_at = Utc::now();

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .presigned(presigning_config)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    ImageError::ObjectNotFound(key.to_string())
                } else {
                    storage_unavailable("presign", key, e)
                }
            })?;

        Ok(SignedUrl::new(presigned.uri().to_string(), issued_at, ttl))
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &ObjectKey) -> ImageResult<()> {
        let _permit = self.permit().await?;

        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
        {
            Ok(_) => {
                debug!(key = %key, "Object deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(key = %key, "Object already absent");
                Ok(())
            }
            Err(e) => Err(storage_unavailable("delete", key, e)),
        }
    }
}

fn is_not_found<E, R>(err: &SdkError<E, R>) -> bool
where
    E: aws_sdk_s3::error::ProvideErrorMetadata,
{
    match err {
        SdkError::ServiceError(service_err) => {
            matches!(service_err.err().code(), Some("NoSuchKey") | Some("NotFound"))
        }
        _ => false,
    }
}

fn storage_unavailable<E>(operation: &str, key: &ObjectKey, err: E) -> ImageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ImageError::StorageUnavailable(format!(
        "Failed to {operation} {key}: {}",
        DisplayErrorContext(err)
    ))
}
