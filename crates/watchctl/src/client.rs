//! HTTP client for the watchd aggregation API.
//!
//! Thin wrapper around reqwest; each method maps to one endpoint and
//! deserializes the JSON body into the shared core types.

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use thiserror::Error;
use watch_core::{ExecutionRecord, TestStatus};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: watchd serve\n  → or set WATCHD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("daemon busy: {0} (retry shortly)")]
    Busy(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure watchd is running\n  → or start the supervisor: watchd supervise"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// One module as listed by the API.
#[derive(Debug, Deserialize)]
pub struct ModuleSummary {
    pub id: String,
    pub name: String,
}

/// One test case with its most recent status.
#[derive(Debug, Deserialize)]
pub struct TestCaseSummary {
    pub test_name: String,
    pub last_status: TestStatus,
}

/// History response body.
#[derive(Debug, Deserialize)]
pub struct HistoryResponse {
    pub history: Vec<ExecutionRecord>,
    #[serde(default)]
    pub warning: Option<String>,
}

/// Counts returned by an update call.
#[derive(Debug, Deserialize)]
pub struct UpdateResponse {
    pub added: usize,
    pub duplicates: usize,
    pub pruned: usize,
    pub skipped_lines: usize,
    #[serde(default)]
    pub warning: Option<String>,
}

/// Health response body.
#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub modules: Vec<String>,
    pub timestamp: String,
}

/// Error response from the API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Default total timeout for the daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for the readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for watchd.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Returns the daemon address (for error messages).
    pub fn addr(&self) -> &str {
        &self.base_url
    }

    /// Check if the daemon is healthy by probing /api/health.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/api/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon to become ready with exponential backoff.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        let timeout_ms = DEFAULT_READY_TIMEOUT_MS;
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }

                    eprintln!(
                        "waiting for daemon at {} (retrying in {}ms)",
                        self.base_url, backoff_ms
                    );

                    let remaining = timeout_ms.saturating_sub(elapsed);
                    let sleep_ms = backoff_ms.min(remaining);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;

                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    /// Handle an error response from the API.
    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();

        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| "unknown error".to_string());

        match status {
            404 => ClientError::ModuleNotFound(message),
            503 => ClientError::Busy(message),
            _ => ClientError::HttpError { status, message },
        }
    }

    /// List modules.
    /// GET /api/modules
    pub async fn modules(&self) -> Result<Vec<ModuleSummary>, ClientError> {
        let url = format!("{}/api/modules", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// List test cases for a module.
    /// GET /api/modules/{id}/test-cases
    pub async fn test_cases(&self, module: &str) -> Result<Vec<TestCaseSummary>, ClientError> {
        let url = format!(
            "{}/api/modules/{}/test-cases",
            self.base_url,
            urlencoding::encode(module)
        );
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// 7-day history for one test case.
    /// GET /api/modules/{id}/test-cases/{test}/history
    pub async fn history(&self, module: &str, test_name: &str) -> Result<HistoryResponse, ClientError> {
        let url = format!(
            "{}/api/modules/{}/test-cases/{}/history",
            self.base_url,
            urlencoding::encode(module),
            urlencoding::encode(test_name)
        );
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Trigger a parse+merge for one module.
    /// POST /api/modules/{id}/update
    pub async fn update(&self, module: &str) -> Result<UpdateResponse, ClientError> {
        let url = format!(
            "{}/api/modules/{}/update",
            self.base_url,
            urlencoding::encode(module)
        );
        let response = self.http.post(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Trigger a parse+merge for every module.
    /// POST /api/update-all
    pub async fn update_all(&self) -> Result<serde_json::Value, ClientError> {
        let url = format!("{}/api/update-all", self.base_url);
        let response = self.http.post(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Health probe.
    /// GET /api/health
    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let url = format!("{}/api/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Download a module's raw log file.
    /// GET /api/modules/{id}/download-log
    ///
    /// Returns the suggested filename (from Content-Disposition) and the
    /// raw bytes.
    pub async fn download_log(&self, module: &str) -> Result<(String, Vec<u8>), ClientError> {
        let url = format!(
            "{}/api/modules/{}/download-log",
            self.base_url,
            urlencoding::encode(module)
        );
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let filename = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split("filename=").nth(1))
            .map(|v| v.trim_matches('"').to_string())
            .unwrap_or_else(|| format!("{module}.log"));

        let bytes = response.bytes().await?;
        Ok((filename, bytes.to_vec()))
    }
}
