//! Readiness probing of serving workers.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SupervisorError;
use crate::exchange::http_client;

/// Body a healthy worker answers its health check with.
const READY_BODY: &str = "OK";

/// How a readiness wait ended without timing out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The worker answered its health check.
    Ready { attempts: u32 },
    /// The wait was cancelled, typically because the worker exited.
    Cancelled { attempts: u32 },
}

/// Polls a worker's health check until it answers.
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    client: reqwest::Client,
    endpoint: String,
    interval: Duration,
    timeout: Duration,
}

impl ReadinessProber {
    /// Prober for the worker at `endpoint`.
    ///
    /// `request_timeout` bounds each probe, `interval` is the pause between
    /// probes and `timeout` bounds the whole wait.
    pub fn new(
        endpoint: impl Into<String>,
        interval: Duration,
        timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, SupervisorError> {
        Ok(Self {
            client: http_client(request_timeout)?,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            interval,
            timeout,
        })
    }

    /// Endpoint being probed.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Probe once. Connection errors and unexpected answers count as not ready.
    pub async fn check(&self) -> bool {
        let url = format!("{}/", self.endpoint);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %url, error = %e, "Health check failed");
                return false;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            debug!(url = %url, status = %response.status(), "Health check not OK");
            return false;
        }

        match response.text().await {
            Ok(body) => body.trim() == READY_BODY,
            Err(e) => {
                debug!(url = %url, error = %e, "Failed to read health check body");
                false
            }
        }
    }

    /// Probe until the worker is ready, `cancel` fires or the timeout expires.
    pub async fn await_ready(&self, cancel: &CancellationToken) -> Result<ProbeOutcome, SupervisorError> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let ready = tokio::select! {
                _ = cancel.cancelled() => return Ok(ProbeOutcome::Cancelled { attempts }),
                result = tokio::time::timeout_at(deadline, self.check()) => match result {
                    Ok(ready) => ready,
                    Err(_) => false,
                },
            };

            if ready {
                info!(
                    endpoint = %self.endpoint,
                    attempts = attempts,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Worker ready"
                );
                return Ok(ProbeOutcome::Ready { attempts });
            }

            if Instant::now() >= deadline {
                return Err(SupervisorError::ReadinessTimeout {
                    endpoint: self.endpoint.clone(),
                    waited: started.elapsed(),
                });
            }

            debug!(endpoint = %self.endpoint, attempt = attempts, "Worker not ready yet");

            tokio::select! {
                _ = cancel.cancelled() => return Ok(ProbeOutcome::Cancelled { attempts }),
                _ = tokio::time::sleep_until(deadline.min(Instant::now() + self.interval)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{serve_stub, unused_port};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn prober(port: u16, timeout: Duration) -> ReadinessProber {
        ReadinessProber::new(
            format!("http://127.0.0.1:{}", port),
            Duration::from_millis(20),
            timeout,
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_ready_worker() {
        let stub = serve_stub(Router::new().route("/", get(|| async { "OK\n" }))).await;

        let outcome = prober(stub.port(), Duration::from_secs(5))
            .await_ready(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ProbeOutcome::Ready { attempts: 1 });
    }

    #[tokio::test]
    async fn test_becomes_ready_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        (StatusCode::SERVICE_UNAVAILABLE, "loading")
                    } else {
                        (StatusCode::OK, "OK")
                    }
                }
            }),
        );
        let stub = serve_stub(router).await;

        let outcome = prober(stub.port(), Duration::from_secs(5))
            .await_ready(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ProbeOutcome::Ready { attempts: 3 });
    }

    #[tokio::test]
    async fn test_wrong_body_is_not_ready() {
        let stub = serve_stub(Router::new().route("/", get(|| async { "starting" }))).await;
        assert!(!prober(stub.port(), Duration::from_secs(1)).check().await);
    }

    #[tokio::test]
    async fn test_times_out_without_listener() {
        let port = unused_port();

        let err = prober(port, Duration::from_millis(200))
            .await_ready(&CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            SupervisorError::ReadinessTimeout { endpoint, waited } => {
                assert_eq!(endpoint, format!("http://127.0.0.1:{}", port));
                assert!(waited >= Duration::from_millis(200));
            }
            other => panic!("expected ReadinessTimeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_probing() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = prober(unused_port(), Duration::from_secs(30))
            .await_ready(&cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, ProbeOutcome::Cancelled { .. }));
    }
}
