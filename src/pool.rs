use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval, timeout};

use crate::config::RpcConfig;
use crate::errors::ThroneError;
use crate::events::{Event, EventBus, EventType};
use crate::gateway::{RequestGateway, check_status};

#[async_trait]
pub trait EndpointProbe: Send + Sync {
    async fn probe(&self, url: &str) -> anyhow::Result<()>;
}

pub struct RpcHealthProbe {
    http: reqwest::Client,
    gateway: Arc<RequestGateway>,
}

impl RpcHealthProbe {
    pub fn new(http: reqwest::Client, gateway: Arc<RequestGateway>) -> Self {
        Self { http, gateway }
    }
}

#[async_trait]
impl EndpointProbe for RpcHealthProbe {
    async fn probe(&self, url: &str) -> anyhow::Result<()> {
        let body = json!({"jsonrpc": "2.0", "id": 1, "method": "getHealth"});
        let response: serde_json::Value = self
            .gateway
            .execute(&format!("rpc-health:{url}"), || {
                let request = self.http.post(url).json(&body);
                async move {
                    let response = check_status(request.send().await?).await?;
                    Ok(response.json::<serde_json::Value>().await?)
                }
            })
            .await?;
        match response.get("result").and_then(|value| value.as_str()) {
            Some("ok") => Ok(()),
            _ => Err(anyhow::anyhow!(
                "unhealthy response: {}",
                response.get("error").cloned().unwrap_or(response.clone())
            )),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct EndpointHealthRecord {
    pub url: String,
    pub priority: usize,
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct ConnectionPool {
    probe: Arc<dyn EndpointProbe>,
    probe_timeout: Duration,
    latency_budget: Duration,
    check_interval: Duration,
    health: Mutex<Vec<EndpointHealthRecord>>,
    current: watch::Sender<Arc<str>>,
    events: EventBus,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(
        config: &RpcConfig,
        probe: Arc<dyn EndpointProbe>,
        events: EventBus,
    ) -> Result<Self, ThroneError> {
        Self::with_candidates(config.candidate_urls(), config, probe, events)
    }

    pub fn with_candidates(
        candidates: Vec<String>,
        config: &RpcConfig,
        probe: Arc<dyn EndpointProbe>,
        events: EventBus,
    ) -> Result<Self, ThroneError> {
        let Some(first) = candidates.first() else {
            return Err(ThroneError::Configuration(
                "no rpc endpoints configured".into(),
            ));
        };
        let (current, _) = watch::channel(Arc::<str>::from(first.as_str()));
        let health = candidates
            .iter()
            .enumerate()
            .map(|(priority, url)| EndpointHealthRecord {
                url: url.clone(),
                priority,
                healthy: false,
                latency_ms: None,
                last_checked: None,
                last_error: None,
            })
            .collect();
        Ok(Self {
            probe,
            probe_timeout: config.probe_timeout(),
            latency_budget: config.latency_budget(),
            check_interval: config.health_check_interval(),
            health: Mutex::new(health),
            current,
            events,
            task: Mutex::new(None),
        })
    }

    pub fn current_url(&self) -> Arc<str> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<str>> {
        self.current.subscribe()
    }

    pub fn health(&self) -> Vec<EndpointHealthRecord> {
        self.health
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub async fn check_health(&self) -> Arc<str> {
        let urls: Vec<String> = self.health().into_iter().map(|record| record.url).collect();
        let probes = urls.iter().map(|url| async move {
            let started = Instant::now();
            let result = timeout(self.probe_timeout, self.probe.probe(url)).await;
            let latency = started.elapsed();
            match result {
                Ok(Ok(())) if latency <= self.latency_budget => (true, Some(latency), None),
                Ok(Ok(())) => (
                    false,
                    Some(latency),
                    Some(format!("latency {}ms over budget", latency.as_millis())),
                ),
                Ok(Err(err)) => (false, Some(latency), Some(format!("{err:#}"))),
                Err(_) => (false, None, Some("probe timed out".to_string())),
            }
        });
        let outcomes = join_all(probes).await;
        let checked_at = Utc::now();
        let selected = {
            let Ok(mut records) = self.health.lock() else {
                return self.current_url();
            };
            for (record, (healthy, latency, error)) in records.iter_mut().zip(outcomes) {
                record.healthy = healthy;
                record.latency_ms = latency.map(|value| value.as_millis() as u64);
                record.last_checked = Some(checked_at);
                record.last_error = error;
            }
            records
                .iter()
                .filter(|record| record.healthy)
                .min_by_key(|record| record.priority)
                .map(|record| record.url.clone())
        };
        match selected {
            Some(url) => self.select(&url),
            None => {
                tracing::warn!(
                    current = %self.current_url(),
                    "no healthy rpc endpoint, keeping current selection"
                );
            }
        }
        self.current_url()
    }

    fn select(&self, url: &str) {
        let previous = self.current_url();
        if previous.as_ref() == url {
            return;
        }
        self.current.send_replace(Arc::from(url));
        tracing::info!(from = %previous, to = %url, "rpc endpoint switched");
        self.events.emit(Event::new(
            EventType::EndpointSwitched,
            "pool",
            json!({"from": previous.as_ref(), "to": url}),
        ));
    }

    pub fn start(self: &Arc<Self>) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_some() {
            return;
        }
        let pool = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(pool.check_interval);
            loop {
                ticker.tick().await;
                pool.check_health().await;
            }
        }));
    }

    pub fn stop(&self) {
        if let Ok(mut task) = self.task.lock()
            && let Some(handle) = task.take()
        {
            handle.abort();
        }
    }
}

