use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tracing::debug;

use super::{Run, RunEvent, RunFilter, RunPatch, RunQuery, RunStore};
use crate::config::{STORE_KEY_ENV, StoreConfig};
use crate::errors::{ConfigError, StoreError};

/// Run store backed by the shared REST endpoint.
pub struct HttpRunStore {
    client: reqwest::Client,
    runs_url: String,
    events_url: String,
}

impl HttpRunStore {
    /// Build a client with the service key as default auth headers.
    ///
    /// Settings that cannot be turned into a client are configuration errors.
    pub fn new(config: &StoreConfig) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        let key = key_header(&config.service_key)?;
        let bearer = key_header(&format!("Bearer {}", config.service_key))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("runclaim/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "store".to_string(),
                message: format!("failed to build HTTP client: {}", e),
            })?;

        let base = format!(
            "{}/{}",
            config.base_url.trim_end_matches('/'),
            config.rest_path.trim_matches('/')
        );
        Ok(Self {
            client,
            runs_url: format!("{}/{}", base, config.runs_table),
            events_url: format!("{}/{}", base, config.events_table),
        })
    }

    async fn read_rows(resp: reqwest::Response) -> Result<Vec<Run>, StoreError> {
        let resp = Self::check_status(resp).await?;
        let body = resp.text().await.map_err(StoreError::Transport)?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&body).map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn key_header(value: &str) -> Result<HeaderValue, ConfigError> {
    HeaderValue::from_str(value).map_err(|e| ConfigError::InvalidValue {
        field: STORE_KEY_ENV.to_string(),
        message: format!("not usable as an HTTP header value: {}", e),
    })
}

#[async_trait]
impl RunStore for HttpRunStore {
    async fn get(&self, query: &RunQuery) -> Result<Vec<Run>, StoreError> {
        let pairs = query.to_query_pairs();
        debug!(url = %self.runs_url, ?pairs, "store get");
        let resp = self
            .client
            .get(&self.runs_url)
            .query(&pairs)
            .send()
            .await
            .map_err(StoreError::Transport)?;
        Self::read_rows(resp).await
    }

    async fn conditional_patch(
        &self,
        filter: &RunFilter,
        patch: &RunPatch,
    ) -> Result<Vec<Run>, StoreError> {
        let pairs = filter.to_query_pairs();
        debug!(url = %self.runs_url, ?pairs, "store conditional patch");
        let resp = self
            .client
            .patch(&self.runs_url)
            .query(&pairs)
            .header("Prefer", "return=representation")
            .json(patch)
            .send()
            .await
            .map_err(StoreError::Transport)?;
        Self::read_rows(resp).await
    }

    async fn insert_event(&self, event: &RunEvent) -> Result<(), StoreError> {
        let resp = self
            .client
            .post(&self.events_url)
            .query(&[("on_conflict", "event_hash")])
            .header("Prefer", "resolution=ignore-duplicates,return=minimal")
            .json(event)
            .send()
            .await
            .map_err(StoreError::Transport)?;
        Self::check_status(resp).await?;
        Ok(())
    }
}
