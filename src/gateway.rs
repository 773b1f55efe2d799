use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::{Instant, sleep};

use crate::config::GatewayConfig;

const TOKEN_WINDOW: Duration = Duration::from_secs(1);

const RETRYABLE_MARKERS: &[&str] = &[
    "429",
    "too many requests",
    "rate limit",
    "timeout",
    "timed out",
    "network",
    "connection reset",
    "connection refused",
    "connection closed",
    "econnreset",
    "fetch failed",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
    "internal server error",
];

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request {id} was cancelled before it started")]
    Cancelled { id: String },
    #[error("request {id} failed after {attempts} attempts: {error:#}")]
    Exhausted {
        id: String,
        attempts: u32,
        error: anyhow::Error,
    },
    #[error("request {id} failed: {error:#}")]
    Failed { id: String, error: anyhow::Error },
    #[error("gateway is closed")]
    Closed,
}

#[derive(Debug, Error)]
#[error("http status {status}: {body}")]
pub struct HttpStatusError {
    pub status: u16,
    pub body: String,
}

pub async fn check_status(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(HttpStatusError {
        status: status.as_u16(),
        body: body.chars().take(512).collect(),
    }
    .into())
}

pub fn is_retryable(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(http) = cause.downcast_ref::<HttpStatusError>() {
            return http.status == 429 || (500..600).contains(&http.status);
        }
        if let Some(request) = cause.downcast_ref::<reqwest::Error>() {
            if let Some(status) = request.status() {
                return status.as_u16() == 429 || status.is_server_error();
            }
            if request.is_timeout() || request.is_connect() || request.is_request() {
                return true;
            }
        }
    }
    let message = format!("{err:#}").to_lowercase();
    RETRYABLE_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct CallStats {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct GatewayStatus {
    pub in_flight: usize,
    pub queued: usize,
    pub capacity: usize,
    pub calls: HashMap<String, CallStats>,
}

pub struct RequestGateway {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    rate: usize,
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    semaphore_retry: Duration,
    starts: Mutex<VecDeque<Instant>>,
    turn: tokio::sync::Mutex<()>,
    queued: AtomicUsize,
    generation: watch::Sender<u64>,
    stats: Mutex<HashMap<String, CallStats>>,
}

impl RequestGateway {
    pub fn new(config: &GatewayConfig) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            capacity: config.max_concurrent,
            rate: config.requests_per_second as usize,
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            semaphore_retry: Duration::from_millis(config.semaphore_retry_ms),
            starts: Mutex::new(VecDeque::new()),
            turn: tokio::sync::Mutex::new(()),
            queued: AtomicUsize::new(0),
            generation,
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `call` under the gateway's limits, retrying retryable failures
    /// with exponential backoff. `id` names the call site.
    pub async fn execute<T, F, Fut>(&self, id: &str, call: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run(id, self.max_retries, call).await
    }

    /// Same admission rules as [`execute`](Self::execute) but never retries.
    /// Used where a repeated call could be ambiguous, such as submitting a
    /// signed transaction.
    pub async fn execute_once<T, F, Fut>(&self, id: &str, call: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run(id, 0, call).await
    }

    async fn run<T, F, Fut>(
        &self,
        id: &str,
        max_retries: u32,
        mut call: F,
    ) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut cancelled = self.generation.subscribe();
        cancelled.borrow_and_update();
        let mut attempt: u32 = 0;
        loop {
            let permit = self.admit(id, &mut cancelled).await?;
            self.update_stats(id, |stats| stats.started += 1);
            let result = call().await;
            drop(permit);
            let err = match result {
                Ok(value) => {
                    self.update_stats(id, |stats| stats.succeeded += 1);
                    return Ok(value);
                }
                Err(err) => err,
            };
            let message = format!("{err:#}");
            self.update_stats(id, |stats| {
                stats.failed += 1;
                stats.last_error = Some(message.clone());
            });
            if !is_retryable(&err) {
                tracing::debug!(id, error = %message, "non-retryable failure");
                return Err(GatewayError::Failed {
                    id: id.to_string(),
                    error: err,
                });
            }
            if attempt >= max_retries {
                tracing::warn!(id, attempts = attempt + 1, error = %message, "retries exhausted");
                return Err(GatewayError::Exhausted {
                    id: id.to_string(),
                    attempts: attempt + 1,
                    error: err,
                });
            }
            let delay = self.backoff(attempt);
            tracing::debug!(id, attempt, delay_ms = delay.as_millis() as u64, error = %message, "retrying");
            self.update_stats(id, |stats| stats.retried += 1);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancelled.changed() => {
                    return Err(GatewayError::Cancelled { id: id.to_string() });
                }
            }
            attempt += 1;
        }
    }

    pub fn clear_queue(&self) {
        let pending = self.queued.load(Ordering::SeqCst);
        self.generation.send_modify(|generation| *generation += 1);
        tracing::info!(pending, "gateway queue cleared");
    }

    pub fn status(&self) -> GatewayStatus {
        let calls = self
            .stats
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        GatewayStatus {
            in_flight: self.capacity - self.semaphore.available_permits(),
            queued: self.queued.load(Ordering::SeqCst),
            capacity: self.capacity,
            calls,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    async fn admit(
        &self,
        id: &str,
        cancelled: &mut watch::Receiver<u64>,
    ) -> Result<OwnedSemaphorePermit, GatewayError> {
        let _queued = QueuedGuard::new(&self.queued);
        let _turn = tokio::select! {
            turn = self.turn.lock() => turn,
            _ = cancelled.changed() => {
                return Err(GatewayError::Cancelled { id: id.to_string() });
            }
        };
        loop {
            let wait = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => match self.try_take_token() {
                    Ok(()) => return Ok(permit),
                    Err(until_token) => until_token.min(self.semaphore_retry),
                },
                Err(tokio::sync::TryAcquireError::Closed) => return Err(GatewayError::Closed),
                Err(tokio::sync::TryAcquireError::NoPermits) => self.semaphore_retry,
            };
            tokio::select! {
                _ = sleep(wait) => {}
                _ = cancelled.changed() => {
                    return Err(GatewayError::Cancelled { id: id.to_string() });
                }
            }
        }
    }

    fn try_take_token(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let Ok(mut starts) = self.starts.lock() else {
            return Err(self.semaphore_retry);
        };
        while let Some(front) = starts.front() {
            if now.duration_since(*front) >= TOKEN_WINDOW {
                starts.pop_front();
            } else {
                break;
            }
        }
        if starts.len() < self.rate {
            starts.push_back(now);
            return Ok(());
        }
        let oldest = starts.front().copied().unwrap_or(now);
        Err((oldest + TOKEN_WINDOW).saturating_duration_since(now))
    }

    fn update_stats(&self, id: &str, update: impl FnOnce(&mut CallStats)) {
        if let Ok(mut guard) = self.stats.lock() {
            update(guard.entry(id.to_string()).or_default());
        }
    }
}

struct QueuedGuard<'a>(&'a AtomicUsize);

impl<'a> QueuedGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
