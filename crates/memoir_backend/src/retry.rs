//! Bounded retry with exponential backoff for text-backend HTTP calls.
//!
//! The loop itself is transport-agnostic: each attempt is classified by
//! the caller as done, transient, or fatal, so HTTP status handling lives
//! in `classify_response` and the loop can be tested without a server.

use std::future::Future;
use std::time::Duration;

use memoir_core::config::LlmConfig;
use reqwest::{Response, StatusCode};
use thiserror::Error;

/// Outcome of one attempt.
pub enum Attempt<T> {
    /// Usable result; stop.
    Done(T),
    /// Failure worth another attempt (rate limit, 5xx, network error).
    Transient(String),
    /// Definitive rejection; retrying would only repeat it.
    Fatal(String),
}

/// How a bounded retry run ultimately failed.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("{provider} rejected the request: {detail}")]
    Rejected { provider: String, detail: String },
    #[error("{provider} unavailable after {attempts} attempts: {detail}")]
    Exhausted {
        provider: String,
        attempts: u32,
        detail: String,
    },
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Attempt budget comes from the LLM config; the backoff shape is
    /// fixed here.
    pub fn from_llm(cfg: &LlmConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before the attempt after `attempt` (1-based), with jitter.
    fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let backed_off = (self.initial_delay.as_secs_f64() * factor)
            .min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(backed_off) + jitter()
    }
}

/// Run `operation` until it reports `Done` or `Fatal`, or the attempt
/// budget runs out.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    provider: &str,
    operation: F,
) -> Result<T, RetryError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut last_detail = String::from("no attempt ran");

    for attempt in 1..=config.max_attempts {
        match operation().await {
            Attempt::Done(value) => {
                if attempt > 1 {
                    tracing::info!(provider, attempt, "request succeeded after retry");
                }
                return Ok(value);
            }
            Attempt::Fatal(detail) => {
                return Err(RetryError::Rejected {
                    provider: provider.to_string(),
                    detail,
                });
            }
            Attempt::Transient(detail) => {
                tracing::warn!(
                    provider,
                    attempt,
                    max_attempts = config.max_attempts,
                    detail = %detail,
                    "transient backend failure"
                );
                last_detail = detail;
            }
        }

        if attempt < config.max_attempts {
            tokio::time::sleep(config.delay_after(attempt)).await;
        }
    }

    Err(RetryError::Exhausted {
        provider: provider.to_string(),
        attempts: config.max_attempts,
        detail: last_detail,
    })
}

/// Classify an HTTP response: 2xx carries the draft, 408/429/5xx are
/// worth retrying, other statuses and malformed sends are final.
pub async fn classify_response(response: reqwest::Result<Response>) -> Attempt<Response> {
    match response {
        Ok(response) if response.status().is_success() => Attempt::Done(response),
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let detail = format!("{}: {}", status, body.chars().take(200).collect::<String>());
            if is_transient_status(status) {
                Attempt::Transient(detail)
            } else {
                Attempt::Fatal(detail)
            }
        }
        Err(e) => Attempt::Transient(e.to_string()),
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// 0-250ms of clock noise so concurrent clients desynchronize.
fn jitter() -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    Duration::from_millis(u64::from(nanos % 250))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_factor: 2.0,
        }
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let calls = AtomicUsize::new(0);
        let got = with_retry(&fast_config(3), "test", || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                n if n < 2 => Attempt::Transient("brief outage".to_string()),
                n => Attempt::Done(n),
            }
        })
        .await
        .unwrap();
        assert_eq!(got, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_failures_stop_immediately() {
        let calls = AtomicUsize::new(0);
        let err = with_retry(&fast_config(3), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Attempt::<()>::Fatal("bad request".to_string())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RetryError::Rejected { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_reports_the_last_failure() {
        let calls = AtomicUsize::new(0);
        let err = with_retry(&fast_config(2), "test", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Attempt::<()>::Transient(format!("outage {}", n))
        })
        .await
        .unwrap_err();
        match err {
            RetryError::Exhausted { attempts, detail, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(detail, "outage 1");
            }
            other => panic!("expected exhaustion, got {}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn client_errors_are_not_transient() {
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
    }
}
