//! Cloudflare image metadata backfill.
//!
//! Collects every image URL referenced by a car, derives the Cloudflare image
//! id, and stores the Images API metadata for ids that have no record yet.
//! Batches run strictly one after another with a fixed pause in between; inside
//! a batch the lookups run concurrently. Re-running is safe because every id is
//! checked for an existing record before it is fetched.

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use tracing::{error, info, instrument, warn};

use crate::config::MigrationConfig;
use crate::database_ops::cloudflare::FetchOutcome;
use crate::database_ops::image_store::{ImageMetadataRecord, ImageStore};
use crate::normalization::image_url::{extract_image_id, ImageId};

/// Anything that can look up metadata for one image id.
#[async_trait::async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_metadata(&self, image_id: &ImageId) -> FetchOutcome;
}

/// Per-batch counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub urls: usize,
    pub unparseable: usize,
    pub already_present: usize,
    pub requested: usize,
    pub stored: usize,
    pub fetch_failed: usize,
    pub insert_failed: usize,
}

impl BatchReport {
    fn absorb(&mut self, other: &BatchReport) {
        self.urls += other.urls;
        self.unparseable += other.unparseable;
        self.already_present += other.already_present;
        self.requested += other.requested;
        self.stored += other.stored;
        self.fetch_failed += other.fetch_failed;
        self.insert_failed += other.insert_failed;
    }
}

/// Outcome of a whole run. Logged once at the end.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationSummary {
    pub parents: usize,
    pub unique_images: usize,
    pub batches: usize,
    pub delays: usize,
    pub totals: BatchReport,
    pub failed: Option<String>,
}

impl MigrationSummary {
    fn log(&self) {
        info!(
            parents = self.parents,
            unique_images = self.unique_images,
            batches = self.batches,
            stored = self.totals.stored,
            already_present = self.totals.already_present,
            unparseable = self.totals.unparseable,
            fetch_failed = self.totals.fetch_failed,
            insert_failed = self.totals.insert_failed,
            failed = self.failed.is_some(),
            "image metadata backfill summary"
        );
    }
}

/// Flatten every parent's image list into one de-duplicated working set.
pub fn unique_image_urls(lists: &[Vec<String>]) -> Vec<String> {
    lists
        .iter()
        .flatten()
        .cloned()
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

/// Process one batch of image URLs.
///
/// URLs without an id and ids that already have a record are skipped. The rest
/// are fetched concurrently and every non-empty result is inserted. A failed
/// insert is logged and does not stop the batch. Only storage read errors are
/// returned.
#[instrument(skip_all, fields(batch_len = batch.len()))]
pub async fn process_batch(
    store: &dyn ImageStore,
    source: &dyn MetadataSource,
    batch: &[String],
) -> Result<BatchReport> {
    let mut report = BatchReport {
        urls: batch.len(),
        ..BatchReport::default()
    };

    let mut pending: Vec<ImageId> = Vec::with_capacity(batch.len());
    for url in batch {
        let Some(image_id) = extract_image_id(url) else {
            warn!(%url, "could not extract image id from url");
            report.unparseable += 1;
            continue;
        };
        if store.metadata_exists(&image_id).await? {
            info!(%image_id, "metadata already exists");
            report.already_present += 1;
            continue;
        }
        pending.push(image_id);
    }

    if pending.is_empty() {
        return Ok(report);
    }
    report.requested = pending.len();

    let outcomes = join_all(pending.iter().map(|id| source.fetch_metadata(id))).await;

    for (image_id, outcome) in pending.into_iter().zip(outcomes) {
        let Some(metadata) = outcome.into_metadata() else {
            report.fetch_failed += 1;
            continue;
        };
        let record = ImageMetadataRecord::new(image_id, metadata, Utc::now());
        match store.insert_metadata(&record).await {
            Ok(()) => {
                info!(image_id = %record.image_id, "stored metadata");
                report.stored += 1;
            }
            Err(e) => {
                error!(image_id = %record.image_id, error = %format!("{e:#}"), "error storing metadata");
                report.insert_failed += 1;
            }
        }
    }
    Ok(report)
}

async fn migrate(
    store: &dyn ImageStore,
    source: &dyn MetadataSource,
    cfg: &MigrationConfig,
    summary: &mut MigrationSummary,
) -> Result<()> {
    let lists = store.load_image_lists().await?;
    summary.parents = lists.len();
    info!(parents = lists.len(), "found cars with images");

    let urls = unique_image_urls(&lists);
    summary.unique_images = urls.len();
    info!(unique_images = urls.len(), "found unique images");

    let batch_size = cfg.batch_size.max(1);
    let total_batches = urls.len().div_ceil(batch_size);
    for (idx, batch) in urls.chunks(batch_size).enumerate() {
        info!(batch = idx + 1, total_batches, size = batch.len(), "processing batch");
        let report = process_batch(store, source, batch).await?;
        summary.batches += 1;
        summary.totals.absorb(&report);

        if idx + 1 < total_batches {
            info!(delay_ms = cfg.batch_delay.as_millis() as u64, "waiting before next batch");
            tokio::time::sleep(cfg.batch_delay).await;
            summary.delays += 1;
        }
    }
    Ok(())
}

/// Run the whole backfill. Errors are logged, never returned, and the store
/// is closed on every path.
pub async fn run_migration(
    store: &dyn ImageStore,
    source: &dyn MetadataSource,
    cfg: &MigrationConfig,
) -> MigrationSummary {
    let mut summary = MigrationSummary::default();
    match migrate(store, source, cfg, &mut summary).await {
        Ok(()) => info!("migration completed successfully"),
        Err(e) => {
            let msg = format!("{e:#}");
            error!(error = %msg, "migration failed");
            summary.failed = Some(msg);
        }
    }
    store.close().await;
    info!("disconnected from storage");
    summary.log();
    summary
}
