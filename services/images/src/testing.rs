//! In-memory fakes with failure injection for unit tests.

use crate::error::{ImageError, ImageResult};
use crate::keys::ObjectKey;
use crate::metadata_store::{ImageRecord, ImageRecordStore};
use crate::object_store::{ObjectMetadata, ObjectStore, SignedUrl};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
    pub metadata: ObjectMetadata,
}

/// Object store that keeps objects in a map and counts calls
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<ObjectKey, StoredObject>>,
    failing_bodies: Mutex<HashSet<Bytes>>,
    failing_deletes: Mutex<HashSet<ObjectKey>>,
    puts: AtomicUsize,
    signs: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object as if it had been uploaded earlier
    pub fn insert_object(&self, key: &ObjectKey) {
        self.objects.lock().unwrap().insert(
            key.clone(),
            StoredObject {
                body: Bytes::from_static(b"seed"),
                content_type: "image/jpeg".to_string(),
                metadata: ObjectMetadata::new(),
            },
        );
    }

    /// Remove an object behind the client's back
    pub fn remove_object(&self, key: &ObjectKey) {
        self.objects.lock().unwrap().remove(key);
    }

    pub fn object(&self, key: &ObjectKey) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Uploads of exactly this body fail with `StorageUnavailable`
    pub fn fail_put_of(&self, body: &'static [u8]) {
        self.failing_bodies
            .lock()
            .unwrap()
            .insert(Bytes::from_static(body));
    }

    pub fn fail_delete_of(&self, key: &ObjectKey) {
        self.failing_deletes.lock().unwrap().insert(key.clone());
    }

    pub fn put_calls(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn sign_calls(&self) -> usize {
        self.signs.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &ObjectKey,
        body: Bytes,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> ImageResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.failing_bodies.lock().unwrap().contains(&body) {
            return Err(ImageError::StorageUnavailable(format!(
                "simulated upload failure for {key}"
            )));
        }
        self.objects.lock().unwrap().insert(
            key.clone(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    async fn signed_get_url(&self, key: &ObjectKey, ttl: Duration) -> ImageResult<SignedUrl> {
        let n = self.signs.fetch_add(1, Ordering::SeqCst);
        if !self.contains(key) {
            return Err(ImageError::ObjectNotFound(key.to_string()));
        }
        Ok(SignedUrl::new(
            format!("https://signed.test/{key}?v={n}"),
            Utc::now(),
            ttl,
        ))
    }

    async fn delete(&self, key: &ObjectKey) -> ImageResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.failing_deletes.lock().unwrap().contains(key) {
            return Err(ImageError::StorageUnavailable(format!(
                "simulated delete failure for {key}"
            )));
        }
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Metadata store backed by a map
#[derive(Default)]
pub struct MemoryImageStore {
    rows: Mutex<HashMap<Uuid, ImageRecord>>,
    fail_inserts: AtomicBool,
    fail_url_writes: AtomicBool,
    fail_deletes: AtomicBool,
    failing_order_updates: Mutex<HashSet<Uuid>>,
    url_writes: AtomicUsize,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row directly, bypassing the repository
    pub fn seed(&self, record: ImageRecord) {
        self.rows.lock().unwrap().insert(record.id, record);
    }

    pub fn row(&self, image_id: Uuid) -> Option<ImageRecord> {
        self.rows.lock().unwrap().get(&image_id).cloned()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn fail_inserts(&self) {
        self.fail_inserts.store(true, Ordering::SeqCst);
    }

    pub fn fail_url_writes(&self) {
        self.fail_url_writes.store(true, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    pub fn fail_order_update_of(&self, image_id: Uuid) {
        self.failing_order_updates.lock().unwrap().insert(image_id);
    }

    pub fn url_writes(&self) -> usize {
        self.url_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageRecordStore for MemoryImageStore {
    async fn insert_images(&self, records: &[ImageRecord]) -> ImageResult<()> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(ImageError::MetadataWriteFailed(
                "simulated insert failure".to_string(),
            ));
        }
        let mut rows = self.rows.lock().unwrap();
        for record in records {
            rows.insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn get_image(&self, image_id: Uuid) -> ImageResult<Option<ImageRecord>> {
        Ok(self.row(image_id))
    }

    async fn list_images(&self, discovery_id: Uuid) -> ImageResult<Vec<ImageRecord>> {
        let mut records: Vec<ImageRecord> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.discovery_id == discovery_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.image_order, r.created_at, r.id));
        Ok(records)
    }

    async fn max_order(&self, discovery_id: Uuid) -> ImageResult<Option<i32>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.discovery_id == discovery_id)
            .map(|r| r.image_order)
            .max())
    }

    async fn update_signed_url(&self, image_id: Uuid, signed_url: &SignedUrl) -> ImageResult<()> {
        self.url_writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_url_writes.load(Ordering::SeqCst) {
            return Err(ImageError::MetadataWriteFailed(
                "simulated URL write failure".to_string(),
            ));
        }
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(&image_id)
            .ok_or(ImageError::ImageNotFound(image_id))?;
        row.image_url = Some(signed_url.url.clone());
        row.url_issued_at = Some(signed_url.issued_at);
        Ok(())
    }

    async fn update_order(&self, discovery_id: Uuid, image_id: Uuid, order: i32) -> ImageResult<()> {
        if self.failing_order_updates.lock().unwrap().contains(&image_id) {
            return Err(ImageError::MetadataWriteFailed(format!(
                "simulated order update failure for {image_id}"
            )));
        }
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&image_id) {
            Some(row) if row.discovery_id == discovery_id => {
                row.image_order = order;
                Ok(())
            }
            _ => Err(ImageError::ImageNotFound(image_id)),
        }
    }

    async fn delete_image(&self, image_id: Uuid) -> ImageResult<bool> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ImageError::MetadataWriteFailed(
                "simulated delete failure".to_string(),
            ));
        }
        Ok(self.rows.lock().unwrap().remove(&image_id).is_some())
    }
}
