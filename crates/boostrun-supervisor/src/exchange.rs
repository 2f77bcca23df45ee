//! Prediction exchange with a ready serving worker.

use std::time::Duration;

use boostrun_core::ExchangeRequest;
use tracing::debug;

use crate::error::SupervisorError;

/// HTTP client used for every request to a worker.
///
/// Workers listen on loopback; proxies from the environment are ignored, and
/// connections are not pooled so a restarted worker on the same port is
/// always reached fresh.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, SupervisorError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .no_proxy()
        .pool_max_idle_per_host(0)
        .build()?;
    Ok(client)
}

/// Sends prediction requests to a serving worker.
#[derive(Debug, Clone)]
pub struct ExchangeClient {
    inner: reqwest::Client,
    endpoint: String,
}

impl ExchangeClient {
    /// Client for the worker at `endpoint`, bounding each request by `timeout`.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, SupervisorError> {
        Ok(Self {
            inner: http_client(timeout)?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Base URL of the worker.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST `request` and return the worker's scalar prediction.
    pub async fn exchange(&self, request: &ExchangeRequest) -> Result<f32, SupervisorError> {
        let url = format!("{}/", self.endpoint);
        debug!(url = %url, channels = request.len(), "POST prediction request");

        let response = self.inner.post(&url).json(request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status != reqwest::StatusCode::OK {
            return Err(SupervisorError::Protocol(format!(
                "HTTP {}: {}",
                status,
                body.trim()
            )));
        }

        parse_prediction(&body)
    }
}

/// Parse a worker response body as a single finite number.
pub fn parse_prediction(body: &str) -> Result<f32, SupervisorError> {
    let trimmed = body.trim();
    match trimmed.parse::<f32>() {
        Ok(value) if value.is_finite() => Ok(value),
        Ok(value) => Err(SupervisorError::Protocol(format!(
            "prediction is not finite: {}",
            value
        ))),
        Err(_) => Err(SupervisorError::Protocol(format!(
            "expected a number, got '{}'",
            trimmed
        ))),
    }
}
