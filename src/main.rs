use anyhow::{Context, Result};
use image_metadata_backfill::config::MigrationConfig;
use image_metadata_backfill::database_ops::cloudflare::CloudflareImagesProvider;
use image_metadata_backfill::database_ops::image_metadata::run_migration;
use image_metadata_backfill::database_ops::image_store::PgImageStore;
use image_metadata_backfill::logging;
use image_metadata_backfill::util::env as env_util;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    logging::init_tracing(logging::DEFAULT_FILTER)?;

    let cfg = MigrationConfig::from_env();
    info!(
        batch_size = cfg.batch_size,
        batch_delay_ms = cfg.batch_delay.as_millis() as u64,
        api_base = %cfg.api.api_base,
        "starting image metadata backfill"
    );

    // Missing Cloudflare credentials abort the run before anything is touched.
    let provider = CloudflareImagesProvider::new(&cfg.api).context("cloudflare configuration")?;
    let store = PgImageStore::connect(&cfg.db).await?;

    // Per-image and run-level failures are logged inside; the exit code stays 0.
    run_migration(&store, &provider, &cfg).await;
    Ok(())
}
