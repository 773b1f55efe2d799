#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::json;
use solana_sdk::hash::Hash;
use solana_sdk::message::{Message, VersionedMessage};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::system_instruction;
use solana_sdk::instruction::InstructionError;
use solana_sdk::transaction::{TransactionError, VersionedTransaction};
use tokio::sync::Mutex;

use spendthrone::config::{GatewayConfig, ThroneConfig};
use spendthrone::engine::{ThroneComponents, ThroneService};
use spendthrone::events::EventBus;
use spendthrone::gateway::RequestGateway;
use spendthrone::interfaces::{
    InsertOutcome, LeaderboardDelta, LeaderboardEntry, LeaderboardStore, ProfileProof,
    ProfileUpdate, StoreError, TransactionRecord,
};
use spendthrone::local_ledger::LocalLedger;
use spendthrone::price::PriceSource;
use solana_client::rpc_response::RpcConfirmedTransactionStatusWithSignature;
use solana_transaction_status::{
    EncodedConfirmedTransactionWithStatusMeta, TransactionConfirmationStatus, TransactionStatus,
};
use spendthrone::rpc::{ChainRpc, LatestBlockhash, TokenAccountInfo};
use spendthrone::store::MemoryStore;
use spendthrone::swap::{QuoteRequest, SwapAggregator, SwapQuote};

pub const TREASURY: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";

pub fn test_config() -> ThroneConfig {
    let yaml = format!(
        r#"
name: Test Throne
treasury:
  address: {TREASURY}
rpc:
  confirmation_timeout_secs: 5
  confirmation_poll_ms: 100
price:
  source_timeout_ms: 200
  sol_fallback_usd: 150.0
swap:
  fee_lamports: 5000
sacrifice:
  batch_limit: 20
"#
    );
    ThroneConfig::load_from_str(&yaml).unwrap()
}

pub fn treasury() -> Pubkey {
    TREASURY.parse().unwrap()
}

pub fn confirmed() -> TransactionStatus {
    TransactionStatus {
        slot: 42,
        confirmations: Some(1),
        status: Ok(()),
        err: None,
        confirmation_status: Some(TransactionConfirmationStatus::Confirmed),
    }
}

pub fn processing() -> TransactionStatus {
    TransactionStatus {
        confirmations: Some(0),
        confirmation_status: Some(TransactionConfirmationStatus::Processed),
        ..confirmed()
    }
}

// A confirmed native transfer as `getTransaction` reports it, with the
// recipient's balance raised by `lamports`.
pub fn transfer_receipt(
    payer: &Pubkey,
    recipient: &Pubkey,
    lamports: u64,
) -> EncodedConfirmedTransactionWithStatusMeta {
    let message = Message::new(
        &[system_instruction::transfer(payer, recipient, lamports)],
        Some(payer),
    );
    let transaction = solana_sdk::transaction::Transaction::new_unsigned(message);
    let encoded = STANDARD.encode(bincode::serialize(&transaction).unwrap());
    serde_json::from_value(json!({
        "slot": 7,
        "blockTime": null,
        "transaction": [encoded, "base64"],
        "meta": {
            "err": null,
            "status": {"Ok": null},
            "fee": 5000,
            "preBalances": [5_000_000_000u64, 1_000, 1],
            "postBalances": [5_000_000_000u64 - 5_000 - lamports, 1_000 + lamports, 1]
        }
    }))
    .unwrap()
}

pub fn signature_entry(
    signature: &Signature,
    memo: Option<String>,
    failed: bool,
) -> RpcConfirmedTransactionStatusWithSignature {
    RpcConfirmedTransactionStatusWithSignature {
        signature: signature.to_string(),
        slot: 1,
        err: failed.then(|| {
            TransactionError::InstructionError(0, InstructionError::Custom(1))
        }),
        memo,
        block_time: None,
        confirmation_status: Some(TransactionConfirmationStatus::Confirmed),
    }
}

// Scripted chain. Statuses are served in order; once the script runs out
// `default_status` is returned for every poll.
pub struct StubRpc {
    pub balance: u64,
    pub blockhash: Hash,
    pub statuses: Mutex<VecDeque<Option<TransactionStatus>>>,
    pub default_status: Option<TransactionStatus>,
    pub sent: Mutex<Vec<VersionedTransaction>>,
    pub token_accounts: Vec<TokenAccountInfo>,
    pub signatures: Vec<RpcConfirmedTransactionStatusWithSignature>,
    pub transactions: HashMap<Signature, EncodedConfirmedTransactionWithStatusMeta>,
    pub status_polls: AtomicUsize,
}

impl StubRpc {
    pub fn confirming(balance: u64) -> Self {
        Self {
            balance,
            blockhash: Hash::new_unique(),
            statuses: Mutex::new(VecDeque::new()),
            default_status: Some(confirmed()),
            sent: Mutex::new(Vec::new()),
            token_accounts: Vec::new(),
            signatures: Vec::new(),
            transactions: HashMap::new(),
            status_polls: AtomicUsize::new(0),
        }
    }

    pub fn never_confirming(balance: u64) -> Self {
        Self {
            default_status: None,
            ..Self::confirming(balance)
        }
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl ChainRpc for StubRpc {
    async fn latest_blockhash(&self) -> Result<LatestBlockhash> {
        Ok(LatestBlockhash {
            blockhash: self.blockhash,
            last_valid_block_height: 1_000,
        })
    }

    async fn send_transaction(&self, transaction: &VersionedTransaction) -> Result<Signature> {
        let signature = transaction
            .signatures
            .first()
            .copied()
            .ok_or_else(|| anyhow!("unsigned transaction"))?;
        self.sent.lock().await.push(transaction.clone());
        Ok(signature)
    }

    async fn signature_status(&self, _signature: &Signature) -> Result<Option<TransactionStatus>> {
        self.status_polls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.statuses.lock().await.pop_front();
        Ok(scripted.unwrap_or_else(|| self.default_status.clone()))
    }

    async fn balance(&self, _address: &Pubkey) -> Result<u64> {
        Ok(self.balance)
    }

    async fn token_accounts_by_owner(&self, _owner: &Pubkey) -> Result<Vec<TokenAccountInfo>> {
        Ok(self.token_accounts.clone())
    }

    async fn signatures_for_address(
        &self,
        _address: &Pubkey,
        limit: usize,
    ) -> Result<Vec<RpcConfirmedTransactionStatusWithSignature>> {
        Ok(self.signatures.iter().take(limit).cloned().collect())
    }

    async fn transaction(
        &self,
        signature: &Signature,
    ) -> Result<Option<EncodedConfirmedTransactionWithStatusMeta>> {
        // The upstream type is not `Clone`; copy it through its serde wire format.
        self.transactions
            .get(signature)
            .map(|tx| Ok(serde_json::from_value(serde_json::to_value(tx)?)?))
            .transpose()
    }
}

// Fixed price after an optional delay; `None` fails every fetch.
pub struct StubPriceSource {
    pub name: &'static str,
    pub price: Option<f64>,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl StubPriceSource {
    pub fn fixed(name: &'static str, price: f64) -> Self {
        Self {
            name,
            price: Some(price),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &'static str) -> Self {
        Self {
            price: None,
            ..Self::fixed(name, 0.0)
        }
    }

    pub fn slow(name: &'static str, price: f64, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::fixed(name, price)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceSource for StubPriceSource {
    fn name(&self) -> &str {
        self.name
    }

    async fn fetch_price(&self, mint: &str) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.price
            .ok_or_else(|| anyhow!("{} has no price for {mint}", self.name))
    }
}

// Returns a prebuilt transaction that moves one lamport from the user to
// the destination, standing in for the aggregator's swap.
pub struct StubAggregator {
    pub out_amount: u64,
    pub destinations: Mutex<Vec<Pubkey>>,
}

impl StubAggregator {
    pub fn new(out_amount: u64) -> Self {
        Self {
            out_amount,
            destinations: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SwapAggregator for StubAggregator {
    async fn quote(&self, request: &QuoteRequest) -> Result<SwapQuote> {
        Ok(SwapQuote {
            input_mint: request.input_mint.to_string(),
            output_mint: request.output_mint.to_string(),
            in_amount: request.amount,
            out_amount: self.out_amount,
            slippage_bps: request.slippage_bps,
            price_impact_pct: 0.01,
            raw: json!({"inAmount": request.amount.to_string()}),
        })
    }

    async fn swap_transaction(
        &self,
        _quote: &SwapQuote,
        user: &Pubkey,
        destination: &Pubkey,
    ) -> Result<VersionedTransaction> {
        self.destinations.lock().await.push(*destination);
        let message = Message::new_with_blockhash(
            &[system_instruction::transfer(user, destination, 1)],
            Some(user),
            &Hash::new_unique(),
        );
        Ok(VersionedTransaction {
            signatures: vec![Signature::default()],
            message: VersionedMessage::Legacy(message),
        })
    }
}

// Memory store that can be taken offline.
#[derive(Default)]
pub struct SwitchableStore {
    pub inner: MemoryStore,
    pub offline: AtomicBool,
    // Commits deposits but reports the store unreachable, as when the
    // response is lost after the write landed.
    pub lose_ack: AtomicBool,
}

impl SwitchableStore {
    pub fn offline() -> Self {
        let store = Self::default();
        store.offline.store(true, Ordering::SeqCst);
        store
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaderboardStore for SwitchableStore {
    async fn record_deposit(
        &self,
        record: &TransactionRecord,
        delta: &LeaderboardDelta,
    ) -> Result<InsertOutcome, StoreError> {
        self.check()?;
        let outcome = self.inner.record_deposit(record, delta).await?;
        if self.lose_ack.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("response lost".into()));
        }
        Ok(outcome)
    }

    async fn top_entries(&self, limit: usize) -> Result<Vec<LeaderboardEntry>, StoreError> {
        self.check()?;
        self.inner.top_entries(limit).await
    }

    async fn entry(&self, wallet: &str) -> Result<Option<LeaderboardEntry>, StoreError> {
        self.check()?;
        self.inner.entry(wallet).await
    }

    async fn count_greater(&self, usd: f64) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.count_greater(usd).await
    }

    async fn update_profile(
        &self,
        wallet: &str,
        update: &ProfileUpdate,
        proof: &ProfileProof,
    ) -> Result<LeaderboardEntry, StoreError> {
        self.check()?;
        self.inner.update_profile(wallet, update, proof).await
    }

    async fn reset_entry(&self, wallet: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.reset_entry(wallet).await
    }
}

pub struct Harness {
    pub service: Arc<ThroneService>,
    pub rpc: Arc<StubRpc>,
    pub store: Arc<SwitchableStore>,
    pub ledger: Arc<LocalLedger>,
    pub primary: Arc<StubPriceSource>,
    pub secondary: Arc<StubPriceSource>,
    pub aggregator: Arc<StubAggregator>,
    pub events: EventBus,
}

pub struct HarnessBuilder {
    pub rpc: StubRpc,
    pub store: SwitchableStore,
    pub primary: StubPriceSource,
    pub secondary: StubPriceSource,
    pub aggregator: StubAggregator,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            rpc: StubRpc::confirming(10_000_000_000),
            store: SwitchableStore::default(),
            primary: StubPriceSource::fixed("primary", 200.0),
            secondary: StubPriceSource::fixed("secondary", 190.0),
            aggregator: StubAggregator::new(1_000_000),
        }
    }
}

impl HarnessBuilder {
    pub fn build(self) -> Harness {
        let config = test_config();
        let events = EventBus::default();
        let rpc = Arc::new(self.rpc);
        let store = Arc::new(self.store);
        let ledger = Arc::new(LocalLedger::in_memory());
        let primary = Arc::new(self.primary);
        let secondary = Arc::new(self.secondary);
        let aggregator = Arc::new(self.aggregator);
        let components = ThroneComponents {
            events: events.clone(),
            gateway: Arc::new(RequestGateway::new(&GatewayConfig::default())),
            pool: None,
            rpc: rpc.clone(),
            aggregator: aggregator.clone(),
            primary_price: primary.clone(),
            secondary_price: secondary.clone(),
            store: store.clone(),
            ledger: ledger.clone(),
        };
        let service = Arc::new(ThroneService::from_components(config, components).unwrap());
        Harness {
            service,
            rpc,
            store,
            ledger,
            primary,
            secondary,
            aggregator,
            events,
        }
    }
}

pub fn harness() -> Harness {
    HarnessBuilder::default().build()
}
