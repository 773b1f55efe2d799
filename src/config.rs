use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;
use url::Url;

use crate::endpoints;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file missing")]
    Missing,
    #[error("failed to read configuration: {0}")]
    Read(std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn validate_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let parsed = Url::parse(value)
        .map_err(|err| ConfigError::Invalid(format!("{field} is not a valid url: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid(format!(
            "{field} must use http or https"
        )));
    }
    Ok(())
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TreasuryConfig {
    pub address: String,
}

impl TreasuryConfig {
    pub fn pubkey(&self) -> Result<Pubkey, ConfigError> {
        Pubkey::from_str(self.address.trim()).map_err(|_| {
            ConfigError::Invalid(format!(
                "treasury address {} is not a valid public key",
                self.address
            ))
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.pubkey().map(|_| ())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RpcConfig {
    #[serde(default)]
    pub primary_url: Option<String>,
    #[serde(default)]
    pub custom_url: Option<String>,
    #[serde(default = "default_fallback_urls")]
    pub fallback_urls: Vec<String>,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_latency_budget_ms")]
    pub latency_budget_ms: u64,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_confirmation_poll_ms")]
    pub confirmation_poll_ms: u64,
}

fn default_fallback_urls() -> Vec<String> {
    endpoints::PUBLIC_RPC_URLS
        .iter()
        .map(|url| url.to_string())
        .collect()
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_latency_budget_ms() -> u64 {
    2_000
}

fn default_confirmation_timeout_secs() -> u64 {
    60
}

fn default_confirmation_poll_ms() -> u64 {
    1_000
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            primary_url: None,
            custom_url: None,
            fallback_urls: default_fallback_urls(),
            health_check_interval_secs: default_health_check_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            latency_budget_ms: default_latency_budget_ms(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            confirmation_poll_ms: default_confirmation_poll_ms(),
        }
    }
}

impl RpcConfig {
    pub fn candidate_urls(&self) -> Vec<String> {
        let primary = std::env::var("SPENDTHRONE_RPC_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.primary_url.clone());
        let mut urls: Vec<String> = Vec::new();
        for url in primary
            .into_iter()
            .chain(self.custom_url.clone())
            .chain(self.fallback_urls.iter().cloned())
        {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        urls
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn latency_budget(&self) -> Duration {
        Duration::from_millis(self.latency_budget_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn confirmation_poll(&self) -> Duration {
        Duration::from_millis(self.confirmation_poll_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.primary_url {
            validate_url("rpc.primary_url", url)?;
        }
        if let Some(url) = &self.custom_url {
            validate_url("rpc.custom_url", url)?;
        }
        for url in &self.fallback_urls {
            validate_url("rpc.fallback_urls", url)?;
        }
        if self.primary_url.is_none() && self.custom_url.is_none() && self.fallback_urls.is_empty()
        {
            return Err(ConfigError::Invalid(
                "at least one rpc endpoint must be configured".into(),
            ));
        }
        if self.health_check_interval_secs < 1 {
            return Err(ConfigError::Invalid(
                "health_check_interval_secs must be at least 1".into(),
            ));
        }
        if self.latency_budget_ms == 0 || self.latency_budget_ms > self.probe_timeout_ms {
            return Err(ConfigError::Invalid(
                "latency_budget_ms must be positive and not exceed probe_timeout_ms".into(),
            ));
        }
        if self.confirmation_timeout_secs < 5 {
            return Err(ConfigError::Invalid(
                "confirmation_timeout_secs must be at least 5".into(),
            ));
        }
        if self.confirmation_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "confirmation_poll_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_semaphore_retry_ms")]
    pub semaphore_retry_ms: u64,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_requests_per_second() -> u32 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_semaphore_retry_ms() -> u64 {
    50
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            requests_per_second: default_requests_per_second(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            semaphore_retry_ms: default_semaphore_retry_ms(),
        }
    }
}

impl GatewayConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.max_concurrent) {
            return Err(ConfigError::Invalid(
                "max_concurrent must be between 1 and 100".into(),
            ));
        }
        if !(1..=1_000).contains(&self.requests_per_second) {
            return Err(ConfigError::Invalid(
                "requests_per_second must be between 1 and 1000".into(),
            ));
        }
        if self.max_retries > 10 {
            return Err(ConfigError::Invalid("max_retries must not exceed 10".into()));
        }
        if self.base_backoff_ms == 0 || self.base_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "base_backoff_ms must be positive and not exceed max_backoff_ms".into(),
            ));
        }
        if self.semaphore_retry_ms == 0 {
            return Err(ConfigError::Invalid(
                "semaphore_retry_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PriceConfig {
    #[serde(default = "default_price_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_source_timeout_ms")]
    pub source_timeout_ms: u64,
    #[serde(default = "default_primary_price_url")]
    pub primary_url: String,
    #[serde(default = "default_secondary_price_url")]
    pub secondary_url: String,
    #[serde(default = "default_sol_fallback_usd")]
    pub sol_fallback_usd: f64,
    #[serde(default)]
    pub fallback_usd: f64,
}

fn default_price_cache_ttl_secs() -> u64 {
    30
}

fn default_source_timeout_ms() -> u64 {
    3_000
}

fn default_primary_price_url() -> String {
    endpoints::JUPITER_PRICE_URL.into()
}

fn default_secondary_price_url() -> String {
    endpoints::COINGECKO_PRICE_URL.into()
}

fn default_sol_fallback_usd() -> f64 {
    150.0
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_price_cache_ttl_secs(),
            source_timeout_ms: default_source_timeout_ms(),
            primary_url: default_primary_price_url(),
            secondary_url: default_secondary_price_url(),
            sol_fallback_usd: default_sol_fallback_usd(),
            fallback_usd: 0.0,
        }
    }
}

impl PriceConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_url("price.primary_url", &self.primary_url)?;
        validate_url("price.secondary_url", &self.secondary_url)?;
        if self.source_timeout_ms < 100 {
            return Err(ConfigError::Invalid(
                "source_timeout_ms must be at least 100".into(),
            ));
        }
        if self.sol_fallback_usd <= 0.0 {
            return Err(ConfigError::Invalid(
                "sol_fallback_usd must be positive".into(),
            ));
        }
        if self.fallback_usd < 0.0 {
            return Err(ConfigError::Invalid(
                "fallback_usd must not be negative".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SwapConfig {
    #[serde(default = "default_swap_api_url")]
    pub api_url: String,
    #[serde(default = "default_slippage_bps")]
    pub default_slippage_bps: u16,
    #[serde(default = "default_swap_fee_lamports")]
    pub fee_lamports: u64,
    #[serde(default = "default_platform_fee_bps")]
    pub platform_fee_bps: u16,
}

fn default_swap_api_url() -> String {
    endpoints::JUPITER_SWAP_API_URL.into()
}

fn default_slippage_bps() -> u16 {
    50
}

fn default_swap_fee_lamports() -> u64 {
    100_000
}

fn default_platform_fee_bps() -> u16 {
    50
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            api_url: default_swap_api_url(),
            default_slippage_bps: default_slippage_bps(),
            fee_lamports: default_swap_fee_lamports(),
            platform_fee_bps: default_platform_fee_bps(),
        }
    }
}

impl SwapConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        validate_url("swap.api_url", &self.api_url)?;
        if self.default_slippage_bps == 0 || self.default_slippage_bps > 5_000 {
            return Err(ConfigError::Invalid(
                "default_slippage_bps must be between 1 and 5000".into(),
            ));
        }
        if self.platform_fee_bps > 1_000 {
            return Err(ConfigError::Invalid(
                "platform_fee_bps must not exceed 1000".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SacrificeConfig {
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

fn default_batch_limit() -> usize {
    20
}

impl Default for SacrificeConfig {
    fn default() -> Self {
        Self {
            batch_limit: default_batch_limit(),
        }
    }
}

impl SacrificeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=25).contains(&self.batch_limit) {
            return Err(ConfigError::Invalid(
                "batch_limit must be between 1 and 25".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgrest,
}

impl Default for StoreBackend {
    fn default() -> Self {
        Self::Memory
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_store_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_local_ledger_path")]
    pub local_ledger_path: PathBuf,
}

fn default_store_key_env() -> String {
    "SPENDTHRONE_STORE_KEY".into()
}

fn default_local_ledger_path() -> PathBuf {
    PathBuf::from("data/local_ledger.json")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: None,
            api_key_env: default_store_key_env(),
            local_ledger_path: default_local_ledger_path(),
        }
    }
}

impl StoreConfig {
    pub fn api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.api_key_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "store api key missing: set {}",
                    self.api_key_env
                ))
            })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match (self.backend, &self.url) {
            (StoreBackend::Postgrest, None) => Err(ConfigError::Invalid(
                "store.url is required for the postgrest backend".into(),
            )),
            (StoreBackend::Postgrest, Some(url)) => validate_url("store.url", url),
            (StoreBackend::Memory, _) => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TierConfig {
    pub name: String,
    pub min_usd: f64,
}

pub fn default_tiers() -> Vec<TierConfig> {
    [
        ("Peasant", 0.0),
        ("Squire", 50.0),
        ("Knight", 100.0),
        ("Baron", 500.0),
        ("Duke", 1_000.0),
        ("Monarch", 10_000.0),
    ]
    .into_iter()
    .map(|(name, min_usd)| TierConfig {
        name: name.into(),
        min_usd,
    })
    .collect()
}

fn validate_tiers(tiers: &[TierConfig]) -> Result<(), ConfigError> {
    let Some(first) = tiers.first() else {
        return Err(ConfigError::Invalid("at least one tier is required".into()));
    };
    if first.min_usd != 0.0 {
        return Err(ConfigError::Invalid(
            "the lowest tier must start at 0".into(),
        ));
    }
    for pair in tiers.windows(2) {
        if pair[1].min_usd <= pair[0].min_usd {
            return Err(ConfigError::Invalid(
                "tier thresholds must be strictly ascending".into(),
            ));
        }
    }
    if tiers.iter().any(|tier| tier.name.trim().is_empty()) {
        return Err(ConfigError::Invalid("tier names must be provided".into()));
    }
    Ok(())
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_public_url")]
    pub public_url: String,
    #[serde(default = "default_preset_amounts")]
    pub preset_amounts: Vec<f64>,
    #[serde(default = "default_referral_scan_limit")]
    pub referral_scan_limit: usize,
    #[serde(default = "default_referral_share_pct")]
    pub referral_share_pct: f64,
    #[serde(default = "default_webhook_secret_env")]
    pub webhook_secret_env: String,
}

fn default_bind() -> String {
    "0.0.0.0:8080".into()
}

fn default_public_url() -> String {
    "https://spendthrone.xyz".into()
}

fn default_preset_amounts() -> Vec<f64> {
    vec![0.1, 0.5, 1.0]
}

fn default_referral_scan_limit() -> usize {
    1_000
}

fn default_referral_share_pct() -> f64 {
    10.0
}

fn default_webhook_secret_env() -> String {
    "SPENDTHRONE_WEBHOOK_SECRET".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: default_public_url(),
            preset_amounts: default_preset_amounts(),
            referral_scan_limit: default_referral_scan_limit(),
            referral_share_pct: default_referral_share_pct(),
            webhook_secret_env: default_webhook_secret_env(),
        }
    }
}

impl ServerConfig {
    pub fn webhook_secret(&self) -> Option<String> {
        std::env::var(&self.webhook_secret_env)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "server.bind {} is not a socket address",
                self.bind
            )));
        }
        validate_url("server.public_url", &self.public_url)?;
        if self
            .preset_amounts
            .iter()
            .any(|amount| !amount.is_finite() || *amount <= 0.0)
        {
            return Err(ConfigError::Invalid(
                "preset_amounts must be positive".into(),
            ));
        }
        if !(1..=1_000).contains(&self.referral_scan_limit) {
            return Err(ConfigError::Invalid(
                "referral_scan_limit must be between 1 and 1000".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.referral_share_pct) {
            return Err(ConfigError::Invalid(
                "referral_share_pct must be between 0 and 100".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MonitoringConfig {
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ThroneConfig {
    pub name: String,
    pub treasury: TreasuryConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub price: PriceConfig,
    #[serde(default)]
    pub swap: SwapConfig,
    #[serde(default)]
    pub sacrifice: SacrificeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(skip)]
    pub loaded_at: Option<DateTime<Utc>>,
}

impl ThroneConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::Missing);
        }
        let content = fs::read_to_string(path).map_err(ConfigError::Read)?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: ThroneConfig = serde_yaml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        config.loaded_at = Some(Utc::now());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name must be provided".into()));
        }
        self.treasury.validate()?;
        self.rpc.validate()?;
        self.gateway.validate()?;
        self.price.validate()?;
        self.swap.validate()?;
        self.sacrifice.validate()?;
        self.store.validate()?;
        validate_tiers(&self.tiers)?;
        self.server.validate()?;
        Ok(())
    }
}
