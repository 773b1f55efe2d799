use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use serde_json::{Value, json};
use solana_sdk::pubkey::Pubkey;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use crate::{
    config::{StoreBackend, ThroneConfig},
    errors::ThroneError,
    events::EventBus,
    gateway::RequestGateway,
    interfaces::LeaderboardStore,
    leaderboard::LeaderboardService,
    local_ledger::LocalLedger,
    pool::{ConnectionPool, RpcHealthProbe},
    price::{CoinGeckoPriceSource, JupiterPriceSource, PriceOracle, PriceSource},
    recorder::DepositRecorder,
    referrals::{ReferralStats, referral_stats},
    rpc::{ChainRpc, HttpChainRpc},
    settlement::{SettlementExecutor, SettlementSettings},
    store::{MemoryStore, PostgrestStore},
    swap::{JupiterClient, SwapAggregator},
    webhook::WebhookProcessor,
};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);
const USER_AGENT: &str = "spendthrone/0.1";

pub struct ThroneComponents {
    pub events: EventBus,
    pub gateway: Arc<RequestGateway>,
    pub pool: Option<Arc<ConnectionPool>>,
    pub rpc: Arc<dyn ChainRpc>,
    pub aggregator: Arc<dyn SwapAggregator>,
    pub primary_price: Arc<dyn PriceSource>,
    pub secondary_price: Arc<dyn PriceSource>,
    pub store: Arc<dyn LeaderboardStore>,
    pub ledger: Arc<LocalLedger>,
}

impl ThroneComponents {
    pub fn from_config(config: &ThroneConfig) -> Result<Self, ThroneError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| ThroneError::Configuration(format!("http client: {err}")))?;
        let events = EventBus::default();
        let gateway = Arc::new(RequestGateway::new(&config.gateway));
        let probe = Arc::new(RpcHealthProbe::new(http.clone(), gateway.clone()));
        let pool = Arc::new(ConnectionPool::new(&config.rpc, probe, events.clone())?);
        let rpc: Arc<dyn ChainRpc> = Arc::new(HttpChainRpc::new(
            http.clone(),
            pool.clone(),
            gateway.clone(),
        ));
        let aggregator: Arc<dyn SwapAggregator> = Arc::new(JupiterClient::new(
            http.clone(),
            gateway.clone(),
            &config.swap,
        ));
        let primary_price: Arc<dyn PriceSource> = Arc::new(JupiterPriceSource::new(
            http.clone(),
            gateway.clone(),
            config.price.primary_url.clone(),
        ));
        let secondary_price: Arc<dyn PriceSource> = Arc::new(CoinGeckoPriceSource::new(
            http.clone(),
            gateway.clone(),
            config.price.secondary_url.clone(),
        ));
        let store: Arc<dyn LeaderboardStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Postgrest => {
                let url = config.store.url.clone().ok_or_else(|| {
                    ThroneError::Configuration("store.url is required for postgrest".into())
                })?;
                let api_key = config
                    .store
                    .api_key()
                    .map_err(|err| ThroneError::Configuration(err.to_string()))?;
                Arc::new(PostgrestStore::new(http, gateway.clone(), url, api_key))
            }
        };
        let ledger = Arc::new(LocalLedger::open(&config.store.local_ledger_path)?);
        Ok(Self {
            events,
            gateway,
            pool: Some(pool),
            rpc,
            aggregator,
            primary_price,
            secondary_price,
            store,
            ledger,
        })
    }
}

pub struct ThroneService {
    config: ThroneConfig,
    treasury: Pubkey,
    events: EventBus,
    gateway: Arc<RequestGateway>,
    pool: Option<Arc<ConnectionPool>>,
    rpc: Arc<dyn ChainRpc>,
    ledger: Arc<LocalLedger>,
    oracle: Arc<PriceOracle>,
    recorder: Arc<DepositRecorder>,
    executor: Arc<SettlementExecutor>,
    leaderboard: Arc<LeaderboardService>,
    webhook: Arc<WebhookProcessor>,
    running: AtomicBool,
    reconcile_task: Mutex<Option<JoinHandle<()>>>,
}

impl ThroneService {
    pub fn new(config: ThroneConfig) -> Result<Self, ThroneError> {
        let components = ThroneComponents::from_config(&config)?;
        Self::from_components(config, components)
    }

    pub fn from_components(
        config: ThroneConfig,
        components: ThroneComponents,
    ) -> Result<Self, ThroneError> {
        let settings = SettlementSettings::from_config(&config)
            .map_err(|err| ThroneError::Configuration(err.to_string()))?;
        let treasury = settings.treasury;
        let ThroneComponents {
            events,
            gateway,
            pool,
            rpc,
            aggregator,
            primary_price,
            secondary_price,
            store,
            ledger,
        } = components;
        let oracle = Arc::new(PriceOracle::new(&config.price, primary_price, secondary_price));
        let recorder = Arc::new(DepositRecorder::new(
            store.clone(),
            ledger.clone(),
            events.clone(),
        ));
        let executor = Arc::new(SettlementExecutor::new(
            rpc.clone(),
            aggregator,
            oracle.clone(),
            recorder.clone(),
            events.clone(),
            settings,
        ));
        let leaderboard = Arc::new(LeaderboardService::new(
            store,
            ledger.clone(),
            events.clone(),
            config.tiers.clone(),
        ));
        let webhook = Arc::new(WebhookProcessor::new(
            recorder.clone(),
            oracle.clone(),
            treasury.to_string(),
        ));
        Ok(Self {
            config,
            treasury,
            events,
            gateway,
            pool,
            rpc,
            ledger,
            oracle,
            recorder,
            executor,
            leaderboard,
            webhook,
            running: AtomicBool::new(false),
            reconcile_task: Mutex::new(None),
        })
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pool) = &self.pool {
            pool.start();
        }
        let recorder = self.recorder.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(RECONCILE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                recorder.reconcile().await;
            }
        });
        *self
            .reconcile_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        tracing::info!(name = %self.config.name, treasury = %self.treasury, "throne service started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(pool) = &self.pool {
            pool.stop();
        }
        if let Some(handle) = self
            .reconcile_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.gateway.clear_queue();
        tracing::info!("throne service stopped");
    }

    pub async fn referrals(&self, referrer: &Pubkey) -> Result<ReferralStats, ThroneError> {
        let stats = referral_stats(
            self.rpc.as_ref(),
            &self.treasury,
            referrer,
            self.config.server.referral_scan_limit,
            self.config.server.referral_share_pct,
        )
        .await?;
        Ok(stats)
    }

    pub fn status(&self) -> Value {
        json!({
            "name": self.config.name,
            "running": self.running.load(Ordering::SeqCst),
            "treasury": self.treasury.to_string(),
            "endpoint": self.pool.as_ref().map(|pool| pool.current_url().to_string()),
            "endpoints": self.pool.as_ref().map(|pool| pool.health()),
            "gateway": self.gateway.status(),
            "pending_local_deposits": self.ledger.pending().len(),
        })
    }

    pub fn config(&self) -> &ThroneConfig {
        &self.config
    }

    pub fn treasury(&self) -> &Pubkey {
        &self.treasury
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn rpc(&self) -> Arc<dyn ChainRpc> {
        self.rpc.clone()
    }

    pub fn oracle(&self) -> Arc<PriceOracle> {
        self.oracle.clone()
    }

    pub fn recorder(&self) -> Arc<DepositRecorder> {
        self.recorder.clone()
    }

    pub fn executor(&self) -> Arc<SettlementExecutor> {
        self.executor.clone()
    }

    pub fn leaderboard(&self) -> Arc<LeaderboardService> {
        self.leaderboard.clone()
    }

    pub fn webhook(&self) -> Arc<WebhookProcessor> {
        self.webhook.clone()
    }
}

impl Drop for ThroneService {
    fn drop(&mut self) {
        self.stop();
    }
}
