use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::DbConfig;
use crate::normalization::image_url::ImageId;
use crate::util::db::Db;

/// Open-schema metadata payload as returned by the Images API.
pub type Metadata = Map<String, Value>;

/// A persisted metadata record, keyed by image id.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadataRecord {
    pub image_id: ImageId,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageMetadataRecord {
    /// New record with both timestamps set to `now`.
    pub fn new(image_id: ImageId, metadata: Metadata, now: DateTime<Utc>) -> Self {
        Self {
            image_id,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Flat document view: `imageId`, the metadata fields, then the timestamps.
    /// Reserved keys win over metadata keys of the same name.
    pub fn to_document(&self) -> Value {
        let mut doc = Map::with_capacity(self.metadata.len() + 3);
        for (k, v) in &self.metadata {
            doc.insert(k.clone(), v.clone());
        }
        doc.insert("imageId".into(), Value::String(self.image_id.to_string()));
        doc.insert("createdAt".into(), Value::String(self.created_at.to_rfc3339()));
        doc.insert("updatedAt".into(), Value::String(self.updated_at.to_rfc3339()));
        Value::Object(doc)
    }
}

/// Storage used by the backfill: parent records are read, metadata records are
/// checked and inserted. Nothing is updated or deleted.
#[async_trait::async_trait]
pub trait ImageStore: Send + Sync {
    /// Image URL lists of every parent record whose list is non-empty.
    async fn load_image_lists(&self) -> Result<Vec<Vec<String>>>;

    async fn metadata_exists(&self, image_id: &ImageId) -> Result<bool>;

    async fn insert_metadata(&self, record: &ImageMetadataRecord) -> Result<()>;

    async fn close(&self);
}

/// Postgres-backed store. `cars.images` is a JSONB array of URLs and
/// `image_metadata.document` holds the flat document of each record.
#[derive(Clone)]
pub struct PgImageStore {
    db: Db,
}

impl PgImageStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn connect(cfg: &DbConfig) -> Result<Self> {
        Ok(Self::new(Db::connect(cfg).await?))
    }
}

fn string_items(images: &Value) -> Vec<String> {
    images
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl ImageStore for PgImageStore {
    async fn load_image_lists(&self) -> Result<Vec<Vec<String>>> {
        let rows: Vec<Value> = sqlx::query_scalar(
            r#"SELECT images FROM cars
               WHERE images IS NOT NULL
                 AND jsonb_typeof(images) = 'array'
                 AND jsonb_array_length(images) > 0"#,
        )
        .persistent(false)
        .fetch_all(&self.db.pool)
        .await
        .context("load cars with images")?;

        let lists: Vec<Vec<String>> = rows
            .iter()
            .map(string_items)
            .filter(|l| !l.is_empty())
            .collect();
        debug!(parents = lists.len(), "loaded image lists");
        Ok(lists)
    }

    async fn metadata_exists(&self, image_id: &ImageId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM image_metadata WHERE image_id = $1)",
        )
        .persistent(false)
        .bind(image_id.as_str())
        .fetch_one(&self.db.pool)
        .await
        .with_context(|| format!("existence check for image {image_id}"))?;
        Ok(exists)
    }

    async fn insert_metadata(&self, record: &ImageMetadataRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO image_metadata (image_id, document, created_at, updated_at)
               VALUES ($1, $2, $3, $4)"#,
        )
        .persistent(false)
        .bind(record.image_id.as_str())
        .bind(record.to_document())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.db.pool)
        .await
        .with_context(|| format!("insert metadata for image {}", record.image_id))?;
        Ok(())
    }

    async fn close(&self) {
        self.db.close().await;
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Inner {
        parents: Vec<Vec<String>>,
        records: Vec<ImageMetadataRecord>,
        documents: Vec<Value>,
        fail_inserts: HashSet<String>,
        fail_load: bool,
        exists_checks: usize,
        closed: bool,
    }

    /// In-memory store with failure injection for exercising the backfill.
    #[derive(Default)]
    pub(crate) struct MemoryImageStore {
        inner: Mutex<Inner>,
    }

    impl MemoryImageStore {
        pub(crate) fn with_parents(parents: Vec<Vec<String>>) -> Self {
            let store = Self::default();
            store.inner.lock().unwrap().parents = parents;
            store
        }

        pub(crate) fn seed_record(&self, image_id: &str) {
            self.inner.lock().unwrap().records.push(ImageMetadataRecord::new(
                ImageId::new(image_id),
                Metadata::new(),
                Utc::now(),
            ));
        }

        pub(crate) fn fail_insert_for(&self, image_id: &str) {
            self.inner
                .lock()
                .unwrap()
                .fail_inserts
                .insert(image_id.to_string());
        }

        pub(crate) fn fail_load(&self) {
            self.inner.lock().unwrap().fail_load = true;
        }

        pub(crate) fn reopen(&self) {
            self.inner.lock().unwrap().closed = false;
        }

        pub(crate) fn records(&self) -> Vec<ImageMetadataRecord> {
            self.inner.lock().unwrap().records.clone()
        }

        /// Documents as they were written, in insert order.
        pub(crate) fn documents(&self) -> Vec<Value> {
            self.inner.lock().unwrap().documents.clone()
        }

        pub(crate) fn record_ids(&self) -> Vec<String> {
            let mut ids: Vec<String> = self
                .records()
                .into_iter()
                .map(|r| r.image_id.to_string())
                .collect();
            ids.sort();
            ids
        }

        pub(crate) fn exists_checks(&self) -> usize {
            self.inner.lock().unwrap().exists_checks
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.inner.lock().unwrap().closed
        }
    }

    #[async_trait::async_trait]
    impl ImageStore for MemoryImageStore {
        async fn load_image_lists(&self) -> Result<Vec<Vec<String>>> {
            let inner = self.inner.lock().unwrap();
            anyhow::ensure!(!inner.closed, "store is closed");
            anyhow::ensure!(!inner.fail_load, "cars collection unavailable");
            Ok(inner
                .parents
                .iter()
                .filter(|p| !p.is_empty())
                .cloned()
                .collect())
        }

        async fn metadata_exists(&self, image_id: &ImageId) -> Result<bool> {
            let mut inner = self.inner.lock().unwrap();
            anyhow::ensure!(!inner.closed, "store is closed");
            inner.exists_checks += 1;
            Ok(inner.records.iter().any(|r| &r.image_id == image_id))
        }

        async fn insert_metadata(&self, record: &ImageMetadataRecord) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            anyhow::ensure!(!inner.closed, "store is closed");
            if inner.fail_inserts.contains(record.image_id.as_str()) {
                anyhow::bail!("duplicate key on image {}", record.image_id);
            }
            inner.documents.push(record.to_document());
            inner.records.push(record.clone());
            Ok(())
        }

        async fn close(&self) {
            self.inner.lock().unwrap().closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_spreads_metadata_between_id_and_timestamps() {
        let now = Utc::now();
        let mut metadata = Metadata::new();
        metadata.insert("make".into(), json!("Porsche"));
        metadata.insert("year".into(), json!(1973));
        metadata.insert("imageId".into(), json!("spoofed"));
        let record = ImageMetadataRecord::new(ImageId::new("abc"), metadata, now);

        let doc = record.to_document();
        assert_eq!(doc["imageId"], json!("abc"));
        assert_eq!(doc["make"], json!("Porsche"));
        assert_eq!(doc["year"], json!(1973));
        assert_eq!(doc["createdAt"], doc["updatedAt"]);
        assert_eq!(record.created_at, record.updated_at);
    }

    #[test]
    fn image_lists_keep_only_non_blank_strings() {
        let v = json!(["https://a/1", 7, null, "  ", "https://a/2"]);
        assert_eq!(string_items(&v), vec!["https://a/1", "https://a/2"]);
        assert!(string_items(&json!({"not": "an array"})).is_empty());
    }
}
