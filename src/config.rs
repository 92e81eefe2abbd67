use std::fmt;
use std::time::Duration;

use crate::util::env::{db_url, env_flag, env_opt, env_parse, env_parse_opt};

pub const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";
pub const DEFAULT_BATCH_SIZE: usize = 3;
pub const DEFAULT_BATCH_DELAY_MS: u64 = 1000;
pub const DEFAULT_RATE_LIMIT_PAUSE_SECS: u64 = 5;

/// Storage connection settings.
#[derive(Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub auto_migrate: bool,
}

impl fmt::Debug for DbConfig {
    // SECURITY: the DSN may carry credentials; never print it.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("auto_migrate", &self.auto_migrate)
            .finish()
    }
}

/// Cloudflare Images API settings. Credentials stay optional here; the
/// provider refuses to build without them.
#[derive(Clone)]
pub struct ApiConfig {
    pub account_id: Option<String>,
    pub api_token: Option<String>,
    pub api_base: String,
    pub timeout: Option<Duration>,
    pub rate_limit_pause: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            account_id: None,
            api_token: None,
            api_base: DEFAULT_API_BASE.to_string(),
            timeout: None,
            rate_limit_pause: Duration::from_secs(DEFAULT_RATE_LIMIT_PAUSE_SECS),
        }
    }
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("account_id", &self.account_id)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .field("timeout", &self.timeout)
            .field("rate_limit_pause", &self.rate_limit_pause)
            .finish()
    }
}

/// Everything the backfill needs, built once at startup and passed by reference.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub db: DbConfig,
    pub api: ApiConfig,
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            db: DbConfig {
                url: crate::util::env::DEFAULT_DB_URL.to_string(),
                max_connections: 5,
                auto_migrate: false,
            },
            api: ApiConfig::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: Duration::from_millis(DEFAULT_BATCH_DELAY_MS),
        }
    }
}

impl MigrationConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.db.url = db_url();
        cfg.db.max_connections = env_parse("DB_MAX_CONNECTIONS", 5u32).max(1);
        cfg.db.auto_migrate = env_flag("AUTO_MIGRATE", false);

        cfg.api.account_id = env_opt("CLOUDFLARE_ACCOUNT_ID");
        cfg.api.api_token = env_opt("CLOUDFLARE_API_TOKEN");
        if let Some(base) = env_opt("CLOUDFLARE_API_BASE") {
            cfg.api.api_base = base.trim_end_matches('/').to_string();
        }
        cfg.api.timeout = env_parse_opt::<u64>("CF_TIMEOUT_SECS").map(Duration::from_secs);

        cfg.batch_size = env_parse("BACKFILL_BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1);
        cfg.batch_delay =
            Duration::from_millis(env_parse("BACKFILL_BATCH_DELAY_MS", DEFAULT_BATCH_DELAY_MS));
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cloudflare_rate_limits() {
        let cfg = MigrationConfig::default();
        assert_eq!(cfg.batch_size, 3);
        assert_eq!(cfg.batch_delay, Duration::from_secs(1));
        assert_eq!(cfg.api.rate_limit_pause, Duration::from_secs(5));
        assert_eq!(cfg.api.api_base, "https://api.cloudflare.com/client/v4");
        assert!(cfg.db.url.starts_with("postgres://localhost:5432"));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let mut cfg = MigrationConfig::default();
        cfg.db.url = "postgres://user:hunter2@db/x".into();
        cfg.api.api_token = Some("tok-secret".into());
        let shown = format!("{cfg:?}");
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("tok-secret"));
    }
}
