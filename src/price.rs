use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use serde_json::Value;
use tokio::time::{Instant, timeout};

use crate::config::PriceConfig;
use crate::endpoints;
use crate::gateway::{RequestGateway, check_status};

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PriceSourceTag {
    Primary,
    Secondary,
    Fallback,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct PriceQuote {
    pub key: String,
    pub usd: f64,
    pub source: PriceSourceTag,
    pub cached: bool,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct PriceDetails {
    pub key: String,
    pub usd: f64,
    pub change_24h_pct: Option<f64>,
    pub volume_24h: Option<f64>,
    pub market_cap: Option<f64>,
    pub source: PriceSourceTag,
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_price(&self, mint: &str) -> Result<f64>;

    async fn fetch_details(&self, mint: &str) -> Result<PriceDetails> {
        Err(anyhow!("{} does not provide market details for {mint}", self.name()))
    }
}

fn as_price(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.parse::<f64>().ok(),
        _ => None,
    }
    .filter(|price| price.is_finite() && *price > 0.0)
}

pub struct JupiterPriceSource {
    http: reqwest::Client,
    gateway: Arc<RequestGateway>,
    url: String,
}

impl JupiterPriceSource {
    pub fn new(http: reqwest::Client, gateway: Arc<RequestGateway>, url: impl Into<String>) -> Self {
        Self {
            http,
            gateway,
            url: url.into(),
        }
    }
}

#[async_trait]
impl PriceSource for JupiterPriceSource {
    fn name(&self) -> &str {
        "jupiter"
    }

    async fn fetch_price(&self, mint: &str) -> Result<f64> {
        let body: Value = self
            .gateway
            .execute("price:jupiter", || {
                let request = self.http.get(&self.url).query(&[("ids", mint)]);
                async move {
                    let response = check_status(request.send().await?).await?;
                    Ok(response.json::<Value>().await?)
                }
            })
            .await?;
        as_price(&body["data"][mint]["price"])
            .ok_or_else(|| anyhow!("jupiter has no price for {mint}"))
    }
}

pub struct CoinGeckoPriceSource {
    http: reqwest::Client,
    gateway: Arc<RequestGateway>,
    url: String,
}

impl CoinGeckoPriceSource {
    pub fn new(http: reqwest::Client, gateway: Arc<RequestGateway>, url: impl Into<String>) -> Self {
        Self {
            http,
            gateway,
            url: url.into(),
        }
    }

    async fn query(&self, mint: &str) -> Result<Value> {
        let id = endpoints::coingecko_id_for_mint(mint)
            .ok_or_else(|| anyhow!("coingecko does not track {mint}"))?;
        let body: Value = self
            .gateway
            .execute("price:coingecko", || {
                let request = self.http.get(&self.url).query(&[
                    ("ids", id),
                    ("vs_currencies", "usd"),
                    ("include_24hr_change", "true"),
                    ("include_24hr_vol", "true"),
                    ("include_market_cap", "true"),
                ]);
                async move {
                    let response = check_status(request.send().await?).await?;
                    Ok(response.json::<Value>().await?)
                }
            })
            .await?;
        body.get(id)
            .cloned()
            .ok_or_else(|| anyhow!("coingecko returned no entry for {id}"))
    }
}

#[async_trait]
impl PriceSource for CoinGeckoPriceSource {
    fn name(&self) -> &str {
        "coingecko"
    }

    async fn fetch_price(&self, mint: &str) -> Result<f64> {
        let entry = self.query(mint).await?;
        as_price(&entry["usd"]).ok_or_else(|| anyhow!("coingecko has no usd price for {mint}"))
    }

    async fn fetch_details(&self, mint: &str) -> Result<PriceDetails> {
        let entry = self.query(mint).await?;
        let usd =
            as_price(&entry["usd"]).ok_or_else(|| anyhow!("coingecko has no usd price for {mint}"))?;
        Ok(PriceDetails {
            key: mint.to_string(),
            usd,
            change_24h_pct: entry["usd_24h_change"].as_f64(),
            volume_24h: entry["usd_24h_vol"].as_f64(),
            market_cap: entry["usd_market_cap"].as_f64(),
            source: PriceSourceTag::Secondary,
        })
    }
}

pub fn normalize_token(token: &str) -> String {
    let trimmed = token.trim();
    if let Some(mint) = endpoints::mint_for_symbol(trimmed) {
        return mint.to_string();
    }
    if endpoints::parse_pubkey(trimmed).is_some() {
        return trimmed.to_string();
    }
    trimmed.to_uppercase()
}

type PendingQuote = Shared<BoxFuture<'static, PriceQuote>>;

struct Sources {
    primary: Arc<dyn PriceSource>,
    secondary: Arc<dyn PriceSource>,
    source_timeout: Duration,
    sol_fallback_usd: f64,
    fallback_usd: f64,
}

impl Sources {
    fn fallback_for(&self, key: &str) -> f64 {
        if key == endpoints::SOL_MINT {
            self.sol_fallback_usd
        } else if endpoints::STABLE_MINTS.contains(&key) {
            1.0
        } else {
            self.fallback_usd
        }
    }

    async fn resolve(&self, key: &str) -> PriceQuote {
        let chain = [
            (&self.primary, PriceSourceTag::Primary),
            (&self.secondary, PriceSourceTag::Secondary),
        ];
        for (source, tag) in chain {
            match timeout(self.source_timeout, source.fetch_price(key)).await {
                Ok(Ok(usd)) => {
                    return PriceQuote {
                        key: key.to_string(),
                        usd,
                        source: tag,
                        cached: false,
                        fetched_at: Utc::now(),
                    };
                }
                Ok(Err(err)) => {
                    tracing::warn!(source = source.name(), key, error = %format!("{err:#}"), "price source failed");
                }
                Err(_) => {
                    tracing::warn!(source = source.name(), key, "price source timed out");
                }
            }
        }
        let usd = self.fallback_for(key);
        tracing::warn!(key, usd, "all price sources failed, using fallback");
        PriceQuote {
            key: key.to_string(),
            usd,
            source: PriceSourceTag::Fallback,
            cached: false,
            fetched_at: Utc::now(),
        }
    }

    async fn resolve_details(&self, key: &str) -> PriceDetails {
        for source in [&self.primary, &self.secondary] {
            if let Ok(Ok(details)) = timeout(self.source_timeout, source.fetch_details(key)).await {
                return details;
            }
        }
        let quote = self.resolve(key).await;
        PriceDetails {
            key: key.to_string(),
            usd: quote.usd,
            change_24h_pct: None,
            volume_24h: None,
            market_cap: None,
            source: quote.source,
        }
    }
}

#[derive(Default)]
struct OracleState {
    quotes: HashMap<String, (Instant, PriceQuote)>,
    details: HashMap<String, (Instant, PriceDetails)>,
    in_flight: HashMap<String, PendingQuote>,
}

pub struct PriceOracle {
    sources: Arc<Sources>,
    ttl: Duration,
    state: Arc<Mutex<OracleState>>,
}

impl PriceOracle {
    pub fn new(
        config: &PriceConfig,
        primary: Arc<dyn PriceSource>,
        secondary: Arc<dyn PriceSource>,
    ) -> Self {
        Self {
            sources: Arc::new(Sources {
                primary,
                secondary,
                source_timeout: config.source_timeout(),
                sol_fallback_usd: config.sol_fallback_usd,
                fallback_usd: config.fallback_usd,
            }),
            ttl: config.cache_ttl(),
            state: Arc::new(Mutex::new(OracleState::default())),
        }
    }

    pub async fn get_price(&self, token: &str) -> f64 {
        self.quote(token).await.usd
    }

    pub async fn quote(&self, token: &str) -> PriceQuote {
        let key = normalize_token(token);
        match self.cached_or_pending(&key) {
            Ok(quote) => quote,
            Err(pending) => pending.await,
        }
    }

    fn state(&self) -> MutexGuard<'_, OracleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached_or_pending(&self, key: &str) -> Result<PriceQuote, PendingQuote> {
        let mut state = self.state();
        if let Some((at, quote)) = state.quotes.get(key)
            && at.elapsed() < self.ttl
        {
            return Ok(PriceQuote {
                cached: true,
                ..quote.clone()
            });
        }
        if let Some(pending) = state.in_flight.get(key) {
            return Err(pending.clone());
        }
        let pending = self.spawn_fetch(key.to_string());
        state.in_flight.insert(key.to_string(), pending.clone());
        Err(pending)
    }

    fn spawn_fetch(&self, key: String) -> PendingQuote {
        let sources = Arc::clone(&self.sources);
        let state = Arc::clone(&self.state);
        async move {
            let quote = sources.resolve(&key).await;
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.in_flight.remove(&key);
            if quote.source != PriceSourceTag::Fallback {
                state
                    .quotes
                    .insert(key.clone(), (Instant::now(), quote.clone()));
            }
            quote
        }
        .boxed()
        .shared()
    }

    fn cached_details(&self, key: &str) -> Option<PriceDetails> {
        self.state()
            .details
            .get(key)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, details)| details.clone())
    }

    pub async fn get_details(&self, token: &str) -> PriceDetails {
        let key = normalize_token(token);
        if let Some(details) = self.cached_details(&key) {
            return details;
        }
        let details = self.sources.resolve_details(&key).await;
        if details.source != PriceSourceTag::Fallback {
            self.state()
                .details
                .insert(key, (Instant::now(), details.clone()));
        }
        details
    }

    pub fn clear_cache(&self) {
        let mut state = self.state();
        state.quotes.clear();
        state.details.clear();
    }
}
