use crate::config::DatabaseConfig;
use crate::error::{ImageError, ImageResult};
use crate::keys::ObjectKey;
use crate::object_store::SignedUrl;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// One image attached to a discovery (`discovery_images` row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ImageRecord {
    /// Unique image ID
    pub id: Uuid,
    /// Owning discovery
    pub discovery_id: Uuid,
    /// Durable object storage key
    pub image_key: ObjectKey,
    /// Cached signed URL for display
    pub image_url: Option<String>,
    /// When `image_url` was issued; rows written before this column existed
    /// fall back to `created_at`
    pub url_issued_at: Option<DateTime<Utc>>,
    /// Display position within the discovery
    pub image_order: i32,
    /// EXIF metadata captured at upload
    pub exif_data: Option<serde_json::Value>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Build a not-yet-persisted record
    pub fn new(
        discovery_id: Uuid,
        image_key: ObjectKey,
        image_order: i32,
        signed_url: Option<&SignedUrl>,
        exif_data: Option<serde_json::Value>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            discovery_id,
            image_key,
            image_url: signed_url.map(|u| u.url.clone()),
            url_issued_at: signed_url.map(|u| u.issued_at),
            image_order,
            exif_data,
            created_at,
        }
    }

    /// Issuance instant the cached URL is judged against
    pub fn url_reference_time(&self) -> DateTime<Utc> {
        self.url_issued_at.unwrap_or(self.created_at)
    }

    /// Replace the cached URL with a freshly issued one
    pub fn with_signed_url(mut self, signed_url: &SignedUrl) -> Self {
        self.image_url = Some(signed_url.url.clone());
        self.url_issued_at = Some(signed_url.issued_at);
        self
    }
}

/// Persistence seam for `discovery_images`
#[async_trait]
pub trait ImageRecordStore: Send + Sync {
    /// Insert all records or none
    async fn insert_images(&self, records: &[ImageRecord]) -> ImageResult<()>;

    async fn get_image(&self, image_id: Uuid) -> ImageResult<Option<ImageRecord>>;

    /// Records of one discovery ordered by `image_order`
    async fn list_images(&self, discovery_id: Uuid) -> ImageResult<Vec<ImageRecord>>;

    /// Highest `image_order` in use, if the discovery has images
    async fn max_order(&self, discovery_id: Uuid) -> ImageResult<Option<i32>>;

    /// Cache a freshly issued URL on the row
    async fn update_signed_url(&self, image_id: Uuid, signed_url: &SignedUrl) -> ImageResult<()>;

    /// Move one image; `ImageNotFound` when it is not part of `discovery_id`
    async fn update_order(&self, discovery_id: Uuid, image_id: Uuid, order: i32) -> ImageResult<()>;

    /// Returns whether a row was removed
    async fn delete_image(&self, image_id: Uuid) -> ImageResult<bool>;

    /// Connectivity probe for readiness checks
    async fn ping(&self) -> ImageResult<()> {
        Ok(())
    }
}

/// Postgres-backed image metadata
pub struct PgImageStore {
    pool: PgPool,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, discovery_id, image_key, image_url, url_issued_at,
           image_order, exif_data, created_at
    FROM discovery_images
"#;

impl PgImageStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

fn write_failed(action: &str, err: sqlx::Error) -> ImageError {
    ImageError::MetadataWriteFailed(format!("{action}: {err}"))
}

fn read_failed(action: &str, err: sqlx::Error) -> ImageError {
    ImageError::MetadataUnavailable(format!("{action}: {err}"))
}

#[async_trait]
impl ImageRecordStore for PgImageStore {
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn insert_images(&self, records: &[ImageRecord]) -> ImageResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| write_failed("begin transaction", e))?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO discovery_images (
                    id, discovery_id, image_key, image_url, url_issued_at,
                    image_order, exif_data, created_at
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8
                )
                "#,
            )
            .bind(record.id)
            .bind(record.discovery_id)
            .bind(&record.image_key)
            .bind(&record.image_url)
            .bind(record.url_issued_at)
            .bind(record.image_order)
            .bind(&record.exif_data)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| write_failed("insert image record", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| write_failed("commit transaction", e))?;

        debug!(count = records.len(), "Image records inserted");
        Ok(())
    }

    async fn get_image(&self, image_id: Uuid) -> ImageResult<Option<ImageRecord>> {
        sqlx::query_as::<_, ImageRecord>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(image_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| read_failed("query image", e))
    }

    #[instrument(skip(self))]
    async fn list_images(&self, discovery_id: Uuid) -> ImageResult<Vec<ImageRecord>> {
        sqlx::query_as::<_, ImageRecord>(&format!(
            "{SELECT_COLUMNS} WHERE discovery_id = $1 ORDER BY image_order ASC, created_at ASC, id ASC"
        ))
        .bind(discovery_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| read_failed("list images", e))
    }

    async fn max_order(&self, discovery_id: Uuid) -> ImageResult<Option<i32>> {
        let row: (Option<i32>,) =
            sqlx::query_as("SELECT MAX(image_order) FROM discovery_images WHERE discovery_id = $1")
                .bind(discovery_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| read_failed("query max image order", e))?;

        Ok(row.0)
    }

    async fn update_signed_url(&self, image_id: Uuid, signed_url: &SignedUrl) -> ImageResult<()> {
        let result = sqlx::query(
            "UPDATE discovery_images SET image_url = $2, url_issued_at = $3 WHERE id = $1",
        )
        .bind(image_id)
        .bind(&signed_url.url)
        .bind(signed_url.issued_at)
        .execute(&self.pool)
        .await
        .map_err(|e| write_failed("cache signed URL", e))?;

        if result.rows_affected() == 0 {
            return Err(ImageError::ImageNotFound(image_id));
        }
        Ok(())
    }

    async fn update_order(&self, discovery_id: Uuid, image_id: Uuid, order: i32) -> ImageResult<()> {
        let result = sqlx::query(
            "UPDATE discovery_images SET image_order = $3 WHERE id = $1 AND discovery_id = $2",
        )
        .bind(image_id)
        .bind(discovery_id)
        .bind(order)
        .execute(&self.pool)
        .await
        .map_err(|e| write_failed("update image order", e))?;

        if result.rows_affected() == 0 {
            return Err(ImageError::ImageNotFound(image_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_image(&self, image_id: Uuid) -> ImageResult<bool> {
        let result = sqlx::query("DELETE FROM discovery_images WHERE id = $1")
            .bind(image_id)
            .execute(&self.pool)
            .await
            .map_err(|e| write_failed("delete image record", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> ImageResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| read_failed("ping", e))
    }
}
