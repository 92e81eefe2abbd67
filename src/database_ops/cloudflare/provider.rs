use anyhow::{anyhow, Context, Result};
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{error, instrument, warn};

use crate::config::ApiConfig;
use crate::database_ops::image_store::Metadata;
use crate::normalization::image_url::ImageId;

/// What a single metadata lookup came back with.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// HTTP 200 with `success: true`; carries `result.metadata`.
    Found(Metadata),
    /// HTTP 200 but `success` was not true, or the body was not JSON.
    Unsuccessful,
    /// HTTP 429. The caller already waited out the pause; the image is dropped.
    RateLimited,
    /// Any other status code.
    HttpStatus(u16),
    /// Connection or transport failure.
    Transport(String),
}

impl FetchOutcome {
    /// Metadata worth persisting; empty payloads count as nothing.
    pub fn into_metadata(self) -> Option<Metadata> {
        match self {
            FetchOutcome::Found(m) if !m.is_empty() => Some(m),
            _ => None,
        }
    }
}

/// Images API response envelope. Only the fields the backfill reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageEnvelope {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub result: Option<ImageDetails>,
    #[serde(default)]
    pub errors: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageDetails {
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

/// Interpret a decoded 200 body of shape `{success, result: {metadata}}`.
pub fn interpret_body(body: ImageEnvelope) -> FetchOutcome {
    if body.success != Some(true) {
        return FetchOutcome::Unsuccessful;
    }
    let metadata = body.result.and_then(|r| r.metadata).unwrap_or_default();
    FetchOutcome::Found(metadata)
}

/// Cloudflare Images client (`GET /accounts/{account}/images/v1/{id}`).
///
/// Construction validates the credentials, so a built provider can always
/// issue requests.
#[derive(Clone)]
pub struct CloudflareImagesProvider {
    base_url: String,
    account_id: String,
    api_token: String,
    rate_limit_pause: Duration,
    http: Client,
}

impl std::fmt::Debug for CloudflareImagesProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareImagesProvider")
            .field("base_url", &self.base_url)
            .field("account_id", &self.account_id)
            .field("api_token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

fn required(value: Option<&str>, key: &str) -> Result<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Cloudflare credentials not set: {key} is missing"))
}

impl CloudflareImagesProvider {
    pub fn new(cfg: &ApiConfig) -> Result<Self> {
        let account_id = required(cfg.account_id.as_deref(), "CLOUDFLARE_ACCOUNT_ID")?;
        let api_token = required(cfg.api_token.as_deref(), "CLOUDFLARE_API_TOKEN")?;
        let base_url = cfg.api_base.trim_end_matches('/').to_string();

        let mut builder = Client::builder().user_agent("image-metadata-backfill/0.1");
        if let Some(timeout) = cfg.timeout {
            builder = builder.timeout(timeout);
        }
        // Loopback test server; an ambient HTTP_PROXY must not intercept it.
        #[cfg(test)]
        {
            builder = builder.no_proxy();
        }
        let http = builder.build().context("cloudflare: build http client")?;

        Ok(Self {
            base_url,
            account_id,
            api_token,
            rate_limit_pause: cfg.rate_limit_pause,
            http,
        })
    }

    pub fn image_endpoint(&self, image_id: &ImageId) -> String {
        format!(
            "{}/accounts/{}/images/v1/{}",
            self.base_url, self.account_id, image_id
        )
    }

    /// One GET per call. Every failure is logged and folded into the outcome.
    #[instrument(skip_all, fields(image_id = %image_id))]
    pub async fn fetch_metadata(&self, image_id: &ImageId) -> FetchOutcome {
        let resp = match self
            .http
            .get(self.image_endpoint(image_id))
            .bearer_auth(&self.api_token)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "exception fetching metadata");
                return FetchOutcome::Transport(e.to_string());
            }
        };

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(
                pause_ms = self.rate_limit_pause.as_millis() as u64,
                "rate limit hit; pausing and dropping image for this run"
            );
            tokio::time::sleep(self.rate_limit_pause).await;
            return FetchOutcome::RateLimited;
        }
        if status != StatusCode::OK {
            error!(status = status.as_u16(), "error fetching metadata");
            return FetchOutcome::HttpStatus(status.as_u16());
        }

        let body: ImageEnvelope = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "undecodable metadata response");
                return FetchOutcome::Unsuccessful;
            }
        };
        let errors = body.errors.clone().unwrap_or(Value::Null);
        let outcome = interpret_body(body);
        if outcome == FetchOutcome::Unsuccessful {
            error!(status = status.as_u16(), %errors, "metadata request reported success=false");
        }
        outcome
    }
}
