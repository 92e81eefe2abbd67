use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Row,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::config::DbConfig;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(cfg), fields(max_connections = cfg.max_connections))]
    pub async fn connect(cfg: &DbConfig) -> Result<Self> {
        let mut connect_options =
            PgConnectOptions::from_str(&cfg.url).context("invalid database URL")?;

        // Ensure TLS is enabled when DSN contains sslmode=require
        if cfg.url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        // PgBouncer txn mode safe
        connect_options = connect_options.statement_cache_capacity(0);

        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .context("connect to database")?;
        info!("connected to db");

        if cfg.auto_migrate {
            info!("running migrations (AUTO_MIGRATE=on)");
            run_migrations(&pool, Path::new("./migrations")).await?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Numbered `NNNN_description.sql` files in version order; anything else is ignored.
fn migration_files(dir: &Path) -> Result<Vec<(i64, String, PathBuf)>> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(fname) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some((version, desc)) = parse_migration_name(fname) {
            candidates.push((version, desc, path));
        }
    }
    candidates.sort_by_key(|(v, _, _)| *v);
    Ok(candidates)
}

fn parse_migration_name(fname: &str) -> Option<(i64, String)> {
    let stem = fname.strip_suffix(".sql")?;
    let (num, desc) = stem.split_once('_')?;
    if num.is_empty() || !num.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((num.parse().ok()?, desc.to_string()))
}

// Lightweight runner; raw_sql keeps statements unprepared for PgBouncer.
async fn run_migrations(pool: &PgPool, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS _sqlx_migrations (
            version BIGINT PRIMARY KEY,
            description TEXT,
            installed_at TIMESTAMPTZ DEFAULT now()
         )",
    )
    .execute(pool)
    .await?;

    let mut applied: HashSet<i64> = HashSet::new();
    for r in sqlx::raw_sql("SELECT version FROM _sqlx_migrations")
        .fetch_all(pool)
        .await?
    {
        applied.insert(r.try_get::<i64, _>(0)?);
    }

    for (version, desc, path) in migration_files(dir)? {
        if !applied.insert(version) {
            continue;
        }
        let sql = std::fs::read_to_string(&path)?;
        info!(version, file = ?path, "applying migration");
        sqlx::raw_sql(&sql)
            .execute(pool)
            .await
            .with_context(|| format!("migration {version} failed"))?;
        sqlx::query("INSERT INTO _sqlx_migrations(version, description) VALUES ($1, $2)")
            .persistent(false)
            .bind(version)
            .bind(desc)
            .execute(pool)
            .await?;
    }
    info!("migrations up-to-date");
    Ok(())
}
