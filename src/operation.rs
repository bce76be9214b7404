//! Long-running operations.
//!
//! Some endpoints return an operation resource instead of a direct result;
//! the caller then polls it until `done`. [`poll_operation`] implements the
//! poll loop generically over a fetch function with interval backoff, an
//! optional progress callback fed each poll's metadata, a deadline, and
//! cooperative cancellation.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::{Error, Result};

/// Structured failure attached to a finished operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationError {
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

/// A long-running operation resource.
///
/// Terminal when `done` is true, at which point exactly one of `response`
/// and `error` is populated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Operation {
    /// Resource name (`operations/...`).
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub response: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<OperationError>,
}

impl Operation {
    /// Whether polling can stop.
    pub fn is_terminal(&self) -> bool {
        self.done
    }

    /// The successful response payload, or the operation's error.
    pub fn into_result(self) -> Result<serde_json::Value> {
        if !self.done {
            return Err(Error::validation(format!(
                "operation {} is not finished",
                self.name
            )));
        }
        if let Some(error) = self.error {
            let status = error.code.unwrap_or(500).clamp(0, u16::MAX as i32) as u16;
            let message = error.message.unwrap_or_else(|| "operation failed".to_string());
            return Err(Error::Http {
                status,
                message: message.clone(),
                body: serde_json::json!({"error": {"message": message, "details": error.details}})
                    .to_string(),
            });
        }
        self.response
            .ok_or_else(|| Error::validation("finished operation carries neither response nor error"))
    }
}

/// Poll pacing and bounds.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// First interval between polls.
    pub initial_interval: Duration,
    /// Interval growth per poll.
    pub multiplier: f64,
    /// Interval ceiling.
    pub max_interval: Duration,
    /// Overall deadline; `None` polls until terminal or cancelled.
    pub deadline: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 1.5,
            max_interval: Duration::from_secs(30),
            deadline: None,
        }
    }
}

/// Cancellation handle for a poll loop. Clones share the signal.
#[derive(Debug, Clone, Default)]
pub struct PollToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl PollToken {
    /// Creates an un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the poll loop to stop at the next opportunity.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Polls until the operation is terminal.
///
/// `fetch` is called once per round with the zero-based attempt index; the
/// progress callback sees each non-terminal poll's metadata. The deadline
/// expiring returns [`Error::Timeout`]; cancellation returns a validation
/// error and stops promptly, even mid-sleep.
pub async fn poll_operation<F, Fut>(
    mut fetch: F,
    config: PollConfig,
    mut on_progress: Option<Box<dyn FnMut(&serde_json::Value) + Send>>,
    token: &PollToken,
) -> Result<Operation>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Operation>>,
{
    let started = Instant::now();
    let mut interval = config.initial_interval;

    for attempt in 0.. {
        if token.is_cancelled() {
            return Err(Error::validation("operation polling cancelled"));
        }
        if let Some(deadline) = config.deadline {
            if started.elapsed() >= deadline {
                return Err(Error::timeout());
            }
        }

        let operation = fetch(attempt).await?;
        if operation.is_terminal() {
            debug!(name = %operation.name, attempt, "operation finished");
            return Ok(operation);
        }
        if let (Some(on_progress), Some(metadata)) =
            (on_progress.as_mut(), operation.metadata.as_ref())
        {
            on_progress(metadata);
        }

        // Sleep the interval, but wake immediately on cancellation.
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = token.notify.notified() => {}
        }
        interval = Duration::from_secs_f64(
            (interval.as_secs_f64() * config.multiplier)
                .min(config.max_interval.as_secs_f64()),
        );
    }
    unreachable!("poll loop only exits by return");
}
