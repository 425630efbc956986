//! Callback delivery: signs and POSTs a task's payload, classifies the
//! response, and records delivery telemetry on the task.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use sha2::Sha256;
use tracing::debug;

use super::breaker::CircuitBreaker;
use super::task::Task;

type HmacSha256 = Hmac<Sha256>;

/// Per-request timeout bounds.
const MIN_TIMEOUT_SECONDS: i32 = 5;
const MAX_TIMEOUT_SECONDS: i32 = 300;

/// Cap on stored error text so telemetry columns stay small.
const MAX_ERROR_LEN: usize = 512;

#[derive(Debug, Clone, Default)]
pub struct DelivererConfig {
    /// HMAC-SHA256 signing secret; empty disables the `X-Signature` header.
    pub secret: Option<String>,
    /// Fallback timeout when a task carries none of its own.
    pub default_timeout: Option<Duration>,
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 2xx response.
    Delivered { status: u16 },
    /// 5xx, 429, or a transport error; the caller retries.
    Transient { status: Option<u16>, error: String },
    /// Any other non-2xx; never retried.
    Permanent { status: u16, error: String },
    /// The URL's breaker rejected the attempt; no HTTP call was made.
    CircuitOpen,
}

impl DeliveryOutcome {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryOutcome::Transient { .. } | DeliveryOutcome::CircuitOpen
        )
    }
}

enum StatusClass {
    Success,
    Transient,
    Permanent,
}

fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        429 => StatusClass::Transient,
        500..=599 => StatusClass::Transient,
        _ => StatusClass::Permanent,
    }
}

fn truncate_error(mut error: String) -> String {
    if error.len() > MAX_ERROR_LEN {
        error.truncate(MAX_ERROR_LEN);
    }
    error
}

pub struct CallbackDeliverer {
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    config: DelivererConfig,
}

impl CallbackDeliverer {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        config: DelivererConfig,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            breaker,
            config,
        })
    }

    /// `sha256=<hex>` signature over the raw payload bytes.
    pub fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn request_timeout(&self, task: &Task) -> Duration {
        if task.callback_timeout_seconds > 0 {
            let secs = task
                .callback_timeout_seconds
                .clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS);
            return Duration::from_secs(secs as u64);
        }
        self.config
            .default_timeout
            .unwrap_or(Duration::from_secs(30))
    }

    /// Attempt one delivery for `task`, updating its callback telemetry.
    ///
    /// A [`DeliveryOutcome::CircuitOpen`] result made no HTTP call and does
    /// not count towards `callback_attempts`. The caller persists the task.
    pub async fn deliver(&self, task: &mut Task) -> DeliveryOutcome {
        let url = task.callback_url.clone();

        if self.breaker.is_open(&url).await {
            debug!(task_id = %task.id, url, "delivery short-circuited");
            return DeliveryOutcome::CircuitOpen;
        }

        let mut request = self
            .client
            .post(&url)
            .timeout(self.request_timeout(task))
            .header(CONTENT_TYPE, "application/json")
            .header("X-Task-ID", task.id.to_string())
            .header("X-Task-Name", task.name.clone())
            .header("X-Retry-Count", task.retry_count.to_string())
            .body(task.payload.clone());

        if let Some(secret) = self.config.secret.as_deref().filter(|s| !s.is_empty()) {
            request = request.header("X-Signature", Self::sign(secret, &task.payload));
        }

        let outcome = match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match classify_status(status) {
                    StatusClass::Success => DeliveryOutcome::Delivered { status },
                    StatusClass::Transient => DeliveryOutcome::Transient {
                        status: Some(status),
                        error: format!("callback returned {}", status),
                    },
                    StatusClass::Permanent => DeliveryOutcome::Permanent {
                        status,
                        error: format!("callback returned {}", status),
                    },
                }
            }
            Err(err) => DeliveryOutcome::Transient {
                status: None,
                error: truncate_error(format!("callback request failed: {}", err)),
            },
        };

        task.callback_attempts += 1;
        task.last_callback_at = Some(Utc::now());
        match &outcome {
            DeliveryOutcome::Delivered { status } => {
                task.last_callback_status = Some(*status as i32);
                task.last_callback_error = None;
                self.breaker.record_success(&url).await;
            }
            DeliveryOutcome::Transient { status, error } => {
                task.last_callback_status = status.map(|s| s as i32);
                task.last_callback_error = Some(error.clone());
                self.breaker.record_failure(&url).await;
            }
            DeliveryOutcome::Permanent { status, error } => {
                task.last_callback_status = Some(*status as i32);
                task.last_callback_error = Some(error.clone());
                self.breaker.record_failure(&url).await;
            }
            DeliveryOutcome::CircuitOpen => unreachable!("checked before the request"),
        }

        outcome
    }
}
