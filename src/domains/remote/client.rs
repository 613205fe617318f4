use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

use crate::config::RemoteStoreConfig;
use crate::domains::sync::utils::validate_identifier;
use crate::errors::{RemoteError, RemoteResult};

/// Equality filter over remote table columns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteFilter {
    pub conditions: Vec<(String, String)>,
}

impl RemoteFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.conditions.push((column.to_string(), value.to_string()));
        self
    }

    /// Whether a JSON row satisfies every condition
    pub fn matches(&self, row: &Value) -> bool {
        self.conditions.iter().all(|(column, expected)| match row.get(column) {
            Some(Value::String(s)) => s == expected,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == *expected,
        })
    }

    fn to_query(&self) -> Vec<(String, String)> {
        self.conditions
            .iter()
            .map(|(column, value)| (column.clone(), format!("eq.{}", value)))
            .collect()
    }
}

/// Remote table store with merge-on-conflict upserts
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert rows, merging into any existing row with the same conflict key
    async fn upsert(&self, table: &str, rows: &[Value], conflict_key: &[&str]) -> RemoteResult<()>;

    /// Delete matching rows. Returns how many rows were removed; zero is not an error.
    async fn delete(&self, table: &str, filter: &RemoteFilter) -> RemoteResult<usize>;

    /// Read matching rows
    async fn read(&self, table: &str, filter: &RemoteFilter) -> RemoteResult<Vec<Value>>;
}

/// REST implementation speaking the PostgREST dialect
pub struct RestRemoteStore {
    client: Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
    call_timeout: Duration,
}

impl RestRemoteStore {
    pub fn new(config: &RemoteStoreConfig, call_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(call_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            access_token: config.access_token.clone(),
            call_timeout,
        }
    }

    /// Get the authorization header
    fn auth_header(&self) -> String {
        format!("Bearer {}", self.access_token.as_deref().unwrap_or(&self.api_key))
    }

    fn table_url(&self, table: &str) -> RemoteResult<String> {
        validate_identifier("table", table).map_err(|e| RemoteError::Rejected {
            status: StatusCode::BAD_REQUEST.as_u16(),
            message: e.to_string(),
        })?;
        Ok(format!("{}/rest/v1/{}", self.base_url, table))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Authorization", self.auth_header())
    }

    fn map_transport(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.call_timeout.as_secs())
        } else {
            RemoteError::Transport(e.to_string())
        }
    }

    async fn check_status(&self, response: reqwest::Response) -> RemoteResult<reqwest::Response> {
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

fn map_status(status: StatusCode, message: String) -> RemoteError {
    if status == StatusCode::NOT_FOUND {
        RemoteError::NotFound(message)
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RemoteError::Server { status: status.as_u16(), message }
    } else {
        RemoteError::Rejected { status: status.as_u16(), message }
    }
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
    async fn upsert(&self, table: &str, rows: &[Value], conflict_key: &[&str]) -> RemoteResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let url = self.table_url(table)?;
        debug!("Upserting {} rows into {} on ({})", rows.len(), table, conflict_key.join(","));

        let response = self
            .request(reqwest::Method::POST, &url)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .query(&[("on_conflict", conflict_key.join(","))])
            .json(rows)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        self.check_status(response).await?;
        Ok(())
    }

    async fn delete(&self, table: &str, filter: &RemoteFilter) -> RemoteResult<usize> {
        let url = self.table_url(table)?;
        let response = self
            .request(reqwest::Method::DELETE, &url)
            .header("Prefer", "return=representation")
            .query(&filter.to_query())
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let deleted = match self.check_status(response).await {
            Ok(response) => response
                .json::<Vec<Value>>()
                .await
                .map_err(|e| RemoteError::Decode(e.to_string()))?
                .len(),
            Err(RemoteError::NotFound(_)) => 0,
            Err(e) => return Err(e),
        };
        Ok(deleted)
    }

    async fn read(&self, table: &str, filter: &RemoteFilter) -> RemoteResult<Vec<Value>> {
        let url = self.table_url(table)?;
        let mut query = filter.to_query();
        query.push(("select".to_string(), "*".to_string()));

        let response = self
            .request(reqwest::Method::GET, &url)
            .query(&query)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        self.check_status(response)
            .await?
            .json::<Vec<Value>>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}
