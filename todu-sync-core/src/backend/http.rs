//! Backend reached over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::protocol::{ApplyResponse, EDITS_PATH, HEALTH_PATH, RECORDS_PATH};
use super::{Applied, ApplyError, Backend};
use crate::model::{Edit, Record, RecordId};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct HttpBackend {
    server_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(server_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            server_url: server_url.into(),
            api_key: api_key.into(),
            client,
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn url(&self, path: &str) -> String {
        build_url(&self.server_url, path)
    }

    /// Fetches the server copy of a record, tombstones included.
    ///
    /// Returns `Ok(None)` when the server has never seen the record.
    pub async fn fetch(&self, record_id: &RecordId) -> Result<Option<Record>, ApplyError> {
        let path = format!("{}/{}", RECORDS_PATH, record_id);
        let response = self
            .client
            .get(self.url(&path))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| ApplyError::Transient(e.to_string()))?;

        match response.status() {
            StatusCode::OK => response
                .json::<Record>()
                .await
                .map(Some)
                .map_err(|e| ApplyError::Transient(e.to_string())),
            StatusCode::NOT_FOUND => Ok(None),
            other => Err(ApplyError::Transient(format!(
                "Server returned status {}",
                other
            ))),
        }
    }
}

fn build_url(server_url: &str, path: &str) -> String {
    let base_url = if server_url.starts_with("http://") || server_url.starts_with("https://") {
        server_url.to_string()
    } else {
        format!("http://{}", server_url)
    };
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500..=599)
}

fn is_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

#[async_trait]
impl Backend for HttpBackend {
    async fn apply(&self, edit: &Edit) -> Result<Applied, ApplyError> {
        let response = self
            .client
            .post(self.url(EDITS_PATH))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(edit)
            .send()
            .await
            .map_err(|e| {
                // Only the server can reject an edit; a request that never
                // got an answer stays queued.
                if !is_network_error(&e) {
                    tracing::warn!(error = %e, "sync request failed before reaching the server");
                }
                ApplyError::Transient(e.to_string())
            })?;

        let status = response.status();
        if is_retryable_status(status) {
            return Err(ApplyError::Transient(format!(
                "Server returned status {}",
                status
            )));
        }

        match status {
            StatusCode::OK | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY
            | StatusCode::BAD_REQUEST => {}
            other => {
                // Auth and routing failures keep the edit queued.
                tracing::warn!(status = %other, "unexpected response from sync server");
                return Err(ApplyError::Transient(format!(
                    "Server returned status {}",
                    other
                )));
            }
        }

        let body: ApplyResponse = response
            .json()
            .await
            .map_err(|e| ApplyError::Transient(e.to_string()))?;

        match body {
            ApplyResponse::Applied(applied) => Ok(applied),
            ApplyResponse::Rejected(rejection) => Err(ApplyError::Rejected(rejection)),
        }
    }
}

/// Checks whether the sync server answers its health endpoint.
pub async fn check_server(server_url: &str) -> bool {
    let client = reqwest::Client::new();
    match client
        .get(build_url(server_url, HEALTH_PATH))
        .timeout(HEALTH_TIMEOUT)
        .send()
        .await
    {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}
