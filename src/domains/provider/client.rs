use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::domains::sync::types::{BackfillWindow, ChangesPage, ProviderRecord};
use crate::errors::{ProviderError, ProviderResult};

/// A health data provider exposing history reads and a change-token API
#[async_trait]
pub trait HealthProvider: Send + Sync {
    /// Stable identifier, e.g. "health_connect"
    fn provider_id(&self) -> &str;

    /// Read every record of `record_type` inside the window
    async fn read_backfill(
        &self,
        record_type: &str,
        window: &BackfillWindow,
    ) -> ProviderResult<Vec<ProviderRecord>>;

    /// Obtain a fresh resumption token positioned at "now"
    async fn get_resumption_token(&self, record_type: &str) -> ProviderResult<String>;

    /// Fetch the next page of changes after `token`
    async fn poll_changes(&self, token: &str) -> ProviderResult<ChangesPage>;
}

/// HTTP implementation of HealthProvider
pub struct RestHealthProvider {
    client: Client,
    id: String,
    base_url: String,
    api_key: Option<String>,
    call_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RecordsPage {
    records: Vec<ProviderRecord>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    record_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

impl RestHealthProvider {
    pub fn new(config: &ProviderConfig, call_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(call_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            id: config.id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            call_timeout,
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    fn map_transport(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(self.call_timeout.as_secs())
        } else if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else {
            ProviderError::Unreachable(format!("{}: {}", self.id, e))
        }
    }

    async fn check_status(&self, response: reqwest::Response) -> ProviderResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to get error details".to_string());
        Err(map_status(status, error_text))
    }
}

fn map_status(status: StatusCode, message: String) -> ProviderError {
    match status {
        StatusCode::GONE => ProviderError::TokenExpired,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::PermissionRevoked(message),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::Unreachable(format!("rate limited: {}", message)),
        s if s.is_server_error() => ProviderError::Unreachable(format!("{}: {}", s, message)),
        s => ProviderError::Rejected(format!("{}: {}", s, message)),
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

#[async_trait]
impl HealthProvider for RestHealthProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn read_backfill(
        &self,
        record_type: &str,
        window: &BackfillWindow,
    ) -> ProviderResult<Vec<ProviderRecord>> {
        debug!("[{}] Reading {} backfill {} .. {}", self.id, record_type, window.start, window.end);

        let url = format!("{}/records/{}", self.base_url, record_type);
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("start", rfc3339(window.start)), ("end", rfc3339(window.end))];
            if let Some(token) = &page_token {
                query.push(("page_token", token.clone()));
            }

            let response = self
                .authorized(self.client.get(&url).query(&query))
                .send()
                .await
                .map_err(|e| self.map_transport(e))?;
            let page = self
                .check_status(response)
                .await?
                .json::<RecordsPage>()
                .await
                .map_err(|e| ProviderError::Decode(e.to_string()))?;

            records.extend(page.records);
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        Ok(records)
    }

    async fn get_resumption_token(&self, record_type: &str) -> ProviderResult<String> {
        let url = format!("{}/changes/token", self.base_url);
        let response = self
            .authorized(self.client.post(&url).json(&TokenRequest { record_type }))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let body = self
            .check_status(response)
            .await?
            .json::<TokenResponse>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(body.token)
    }

    async fn poll_changes(&self, token: &str) -> ProviderResult<ChangesPage> {
        let url = format!("{}/changes", self.base_url);
        let response = self
            .authorized(self.client.get(&url).query(&[("token", token)]))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        self.check_status(response)
            .await?
            .json::<ChangesPage>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}
