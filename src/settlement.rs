use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use solana_sdk::instruction::Instruction;
use solana_sdk::message::{Message, VersionedMessage};
use solana_sdk::native_token::lamports_to_sol;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::system_instruction;
use tokio::time::{Instant, sleep};
use uuid::Uuid;

use crate::config::{ConfigError, ThroneConfig};
use crate::endpoints;
use crate::errors::ThroneError;
use crate::events::{Event, EventBus, EventType};
use crate::price::PriceOracle;
use crate::recorder::{Deposit, DepositRecorder, RecordOutcome};
use crate::rpc::{ChainRpc, confirmed_status};
use crate::sacrifice;
use crate::swap::{QuoteRequest, SwapAggregator, append_fee_transfer};
use crate::wallet::WalletSigner;

pub const FEE_RESERVE_LAMPORTS: u64 = 10_000;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStage {
    Idle,
    Quoting,
    Building,
    Signing,
    Submitting,
    Confirming,
    Recorded,
    Failed,
}

impl fmt::Display for SettlementStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Quoting => "quoting",
            Self::Building => "building",
            Self::Signing => "signing",
            Self::Submitting => "submitting",
            Self::Confirming => "confirming",
            Self::Recorded => "recorded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransferRequest {
    pub lamports: u64,
    pub message: Option<String>,
    pub link: Option<String>,
    pub referrer: Option<Pubkey>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SwapRequest {
    pub input_mint: Pubkey,
    pub input_decimals: u8,
    pub output_mint: Pubkey,
    pub amount: u64,
    pub slippage_bps: Option<u16>,
    pub message: Option<String>,
    pub link: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SacrificeRequest {
    pub message: Option<String>,
    pub link: Option<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SettlementOutcome {
    pub attempt_id: Uuid,
    pub settled: bool,
    pub signature: String,
    pub amount: f64,
    pub asset: String,
    pub usd_value: f64,
    pub record: RecordOutcome,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SettlementSettings {
    pub treasury: Pubkey,
    pub swap_fee_lamports: u64,
    pub default_slippage_bps: u16,
    pub batch_limit: usize,
    pub confirmation_timeout: Duration,
    pub confirmation_poll: Duration,
}

impl SettlementSettings {
    pub fn from_config(config: &ThroneConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            treasury: config.treasury.pubkey()?,
            swap_fee_lamports: config.swap.fee_lamports,
            default_slippage_bps: config.swap.default_slippage_bps,
            batch_limit: config.sacrifice.batch_limit,
            confirmation_timeout: config.rpc.confirmation_timeout(),
            confirmation_poll: config.rpc.confirmation_poll(),
        })
    }
}

pub fn transfer_instructions(
    payer: &Pubkey,
    treasury: &Pubkey,
    lamports: u64,
    message: Option<&str>,
    referrer: Option<&Pubkey>,
) -> Vec<Instruction> {
    let mut instructions = vec![system_instruction::transfer(payer, treasury, lamports)];
    if let Some(text) = message.map(str::trim).filter(|text| !text.is_empty()) {
        instructions.push(spl_memo::build_memo(text.as_bytes(), &[]));
    }
    if let Some(referrer) = referrer {
        instructions.push(spl_memo::build_memo(referral_memo(referrer).as_bytes(), &[]));
    }
    instructions
}

pub fn referral_memo(referrer: &Pubkey) -> String {
    format!("Ref: {referrer}")
}

struct Settled {
    amount: f64,
    asset: String,
    price_token: String,
    message: Option<String>,
    link: Option<String>,
}

struct Attempt {
    id: Uuid,
    kind: &'static str,
    wallet: String,
    stage: SettlementStage,
    events: EventBus,
}

impl Attempt {
    fn new(kind: &'static str, wallet: &Pubkey, events: &EventBus) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            wallet: wallet.to_string(),
            stage: SettlementStage::Idle,
            events: events.clone(),
        }
    }

    fn advance(&mut self, stage: SettlementStage) {
        tracing::debug!(attempt = %self.id, kind = self.kind, from = %self.stage, to = %stage, "settlement stage");
        self.stage = stage;
        self.events.emit(Event::new(
            EventType::SettlementStage,
            "settlement",
            json!({
                "attempt_id": self.id.to_string(),
                "kind": self.kind,
                "wallet": self.wallet,
                "stage": stage,
            }),
        ));
    }

    fn fail(&mut self, err: ThroneError) -> ThroneError {
        tracing::warn!(attempt = %self.id, kind = self.kind, stage = %self.stage, error = %err, "settlement failed");
        let failed_at = self.stage;
        self.advance(SettlementStage::Failed);
        self.events.emit(Event::new(
            EventType::SettlementFailed,
            "settlement",
            json!({
                "attempt_id": self.id.to_string(),
                "kind": self.kind,
                "wallet": self.wallet,
                "stage": failed_at,
                "error": err.to_string(),
            }),
        ));
        err
    }
}

pub struct SettlementExecutor {
    rpc: Arc<dyn ChainRpc>,
    aggregator: Arc<dyn SwapAggregator>,
    oracle: Arc<PriceOracle>,
    recorder: Arc<DepositRecorder>,
    events: EventBus,
    settings: SettlementSettings,
}

impl SettlementExecutor {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        aggregator: Arc<dyn SwapAggregator>,
        oracle: Arc<PriceOracle>,
        recorder: Arc<DepositRecorder>,
        events: EventBus,
        settings: SettlementSettings,
    ) -> Self {
        Self {
            rpc,
            aggregator,
            oracle,
            recorder,
            events,
            settings,
        }
    }

    pub fn treasury(&self) -> &Pubkey {
        &self.settings.treasury
    }

    pub async fn transfer(
        &self,
        wallet: &dyn WalletSigner,
        request: TransferRequest,
    ) -> Result<SettlementOutcome, ThroneError> {
        let payer = wallet.pubkey();
        let mut attempt = Attempt::new("transfer", &payer, &self.events);
        if request.lamports == 0 {
            return Err(attempt.fail(ThroneError::InvalidRequest(
                "amount must be greater than zero".into(),
            )));
        }
        attempt.advance(SettlementStage::Building);
        let message = match self.build_transfer(&payer, &request).await {
            Ok(message) => message,
            Err(err) => return Err(attempt.fail(err)),
        };
        let settled = Settled {
            amount: lamports_to_sol(request.lamports),
            asset: "SOL".into(),
            price_token: endpoints::SOL_MINT.into(),
            message: request.message,
            link: request.link,
        };
        self.finish(&mut attempt, wallet, message, settled).await
    }

    async fn build_transfer(
        &self,
        payer: &Pubkey,
        request: &TransferRequest,
    ) -> Result<VersionedMessage, ThroneError> {
        let required = request.lamports.saturating_add(FEE_RESERVE_LAMPORTS);
        let available = self
            .rpc
            .balance(payer)
            .await
            .map_err(|err| ThroneError::Network(format!("{err:#}")))?;
        if available < required {
            return Err(ThroneError::InsufficientFunds {
                required,
                available,
            });
        }
        let instructions = transfer_instructions(
            payer,
            &self.settings.treasury,
            request.lamports,
            request.message.as_deref(),
            request.referrer.as_ref(),
        );
        let blockhash = self
            .rpc
            .latest_blockhash()
            .await
            .map_err(|err| ThroneError::Network(format!("{err:#}")))?;
        Ok(VersionedMessage::Legacy(Message::new_with_blockhash(
            &instructions,
            Some(payer),
            &blockhash.blockhash,
        )))
    }

    pub async fn swap(
        &self,
        wallet: &dyn WalletSigner,
        request: SwapRequest,
    ) -> Result<SettlementOutcome, ThroneError> {
        let payer = wallet.pubkey();
        let mut attempt = Attempt::new("swap", &payer, &self.events);
        if request.amount == 0 {
            return Err(attempt.fail(ThroneError::InvalidRequest(
                "amount must be greater than zero".into(),
            )));
        }
        if request.input_mint == request.output_mint {
            return Err(attempt.fail(ThroneError::InvalidRequest(
                "input and output mints must differ".into(),
            )));
        }
        attempt.advance(SettlementStage::Quoting);
        let quote_request = QuoteRequest {
            input_mint: request.input_mint,
            output_mint: request.output_mint,
            amount: request.amount,
            slippage_bps: request
                .slippage_bps
                .unwrap_or(self.settings.default_slippage_bps),
        };
        let quote = match self.aggregator.quote(&quote_request).await {
            Ok(quote) => quote,
            Err(err) => return Err(attempt.fail(ThroneError::Swap(format!("{err:#}")))),
        };
        tracing::info!(
            attempt = %attempt.id,
            in_amount = quote.in_amount,
            out_amount = quote.out_amount,
            price_impact_pct = quote.price_impact_pct,
            "swap quoted"
        );

        attempt.advance(SettlementStage::Building);
        let destination = spl_associated_token_account::get_associated_token_address(
            &self.settings.treasury,
            &request.output_mint,
        );
        let built = self
            .aggregator
            .swap_transaction(&quote, &payer, &destination)
            .await
            .and_then(|transaction| {
                append_fee_transfer(
                    &transaction,
                    &payer,
                    &self.settings.treasury,
                    self.settings.swap_fee_lamports,
                )
            });
        let message = match built {
            Ok(message) => message,
            Err(err) => return Err(attempt.fail(ThroneError::Swap(format!("{err:#}")))),
        };

        let input_mint = request.input_mint.to_string();
        let settled = Settled {
            amount: request.amount as f64 / 10f64.powi(i32::from(request.input_decimals)),
            asset: endpoints::symbol_for_mint(&input_mint)
                .map(str::to_string)
                .unwrap_or_else(|| input_mint.clone()),
            price_token: input_mint,
            message: request.message,
            link: request.link,
        };
        self.finish(&mut attempt, wallet, message, settled).await
    }

    pub async fn sacrifice(
        &self,
        wallet: &dyn WalletSigner,
        request: SacrificeRequest,
    ) -> Result<SettlementOutcome, ThroneError> {
        let payer = wallet.pubkey();
        let mut attempt = Attempt::new("sacrifice", &payer, &self.events);
        attempt.advance(SettlementStage::Building);
        let (message, reclaimed) = match self.build_sacrifice(&payer).await {
            Ok(built) => built,
            Err(err) => return Err(attempt.fail(err)),
        };
        let settled = Settled {
            amount: lamports_to_sol(reclaimed),
            asset: "SOL".into(),
            price_token: endpoints::SOL_MINT.into(),
            message: request.message,
            link: request.link,
        };
        self.finish(&mut attempt, wallet, message, settled).await
    }

    async fn build_sacrifice(&self, payer: &Pubkey) -> Result<(VersionedMessage, u64), ThroneError> {
        let candidates = sacrifice::scan(self.rpc.as_ref(), payer)
            .await
            .map_err(|err| ThroneError::Network(format!("{err:#}")))?;
        let plan = sacrifice::plan(&candidates, self.settings.batch_limit);
        if plan.selected.is_empty() {
            return Err(ThroneError::InvalidRequest(
                "wallet has no empty token accounts".into(),
            ));
        }
        tracing::info!(
            wallet = %payer,
            closing = plan.selected.len(),
            remaining = plan.remaining,
            lamports = plan.total_reclaimed,
            "sacrifice planned"
        );
        let instructions = sacrifice::build_instructions(&plan, payer, &self.settings.treasury)?;
        let blockhash = self
            .rpc
            .latest_blockhash()
            .await
            .map_err(|err| ThroneError::Network(format!("{err:#}")))?;
        let message = Message::new_with_blockhash(&instructions, Some(payer), &blockhash.blockhash);
        Ok((VersionedMessage::Legacy(message), plan.total_reclaimed))
    }

    async fn finish(
        &self,
        attempt: &mut Attempt,
        wallet: &dyn WalletSigner,
        message: VersionedMessage,
        settled: Settled,
    ) -> Result<SettlementOutcome, ThroneError> {
        attempt.advance(SettlementStage::Signing);
        let transaction = match wallet.sign_transaction(message).await {
            Ok(transaction) => transaction,
            Err(err) => return Err(attempt.fail(err)),
        };

        attempt.advance(SettlementStage::Submitting);
        let signature = match self.rpc.send_transaction(&transaction).await {
            Ok(signature) => signature,
            Err(err) => {
                return Err(attempt.fail(ThroneError::Network(format!(
                    "submitting transaction: {err:#}"
                ))));
            }
        };
        tracing::info!(attempt = %attempt.id, signature = %signature, "transaction submitted");

        attempt.advance(SettlementStage::Confirming);
        if let Err(err) = self.confirm(&signature).await {
            return Err(attempt.fail(err));
        }

        let price = self.oracle.get_price(&settled.price_token).await;
        let deposit = Deposit {
            wallet: attempt.wallet.clone(),
            amount: settled.amount,
            asset: settled.asset,
            signature: signature.to_string(),
            usd_value: settled.amount * price,
            message: settled.message,
            link: settled.link,
            timestamp: Utc::now(),
        };
        let record = self.recorder.record(&deposit).await;
        attempt.advance(SettlementStage::Recorded);
        Ok(SettlementOutcome {
            attempt_id: attempt.id,
            settled: true,
            signature: deposit.signature,
            amount: deposit.amount,
            asset: deposit.asset,
            usd_value: deposit.usd_value,
            record,
        })
    }

    /// Polls until the signature is confirmed, fails on-chain, or the
    /// confirmation timeout passes.
    pub async fn confirm(&self, signature: &Signature) -> Result<(), ThroneError> {
        let started = Instant::now();
        let deadline = started + self.settings.confirmation_timeout;
        loop {
            let status = self.rpc.signature_status(signature).await.map_err(|err| {
                ThroneError::Network(format!("confirming {signature}: {err:#}"))
            })?;
            if let Some(status) = status {
                if let Some(err) = &status.err {
                    return Err(ThroneError::OnChain {
                        signature: signature.to_string(),
                        reason: err.to_string(),
                    });
                }
                if confirmed_status(&status) {
                    tracing::info!(signature = %signature, slot = status.slot, "transaction confirmed");
                    return Ok(());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ThroneError::ConfirmationTimeout {
                    signature: signature.to_string(),
                    waited_secs: now.duration_since(started).as_secs(),
                });
            }
            sleep(self.settings.confirmation_poll.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_includes_memos_in_order() {
        let payer = Pubkey::new_unique();
        let treasury = Pubkey::new_unique();
        let referrer = Pubkey::new_unique();
        let instructions =
            transfer_instructions(&payer, &treasury, 1_000, Some("long live"), Some(&referrer));
        assert_eq!(instructions.len(), 3);
        assert_eq!(instructions[1].data, b"long live".to_vec());
        assert_eq!(
            instructions[2].data,
            format!("Ref: {referrer}").into_bytes()
        );

        let bare = transfer_instructions(&payer, &treasury, 1_000, Some("  "), None);
        assert_eq!(bare.len(), 1);
    }
}
