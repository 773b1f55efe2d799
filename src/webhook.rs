use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use solana_sdk::native_token::lamports_to_sol;

use crate::endpoints;
use crate::price::PriceOracle;
use crate::recorder::{Deposit, DepositRecorder};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeTransfer {
    #[serde(default)]
    pub from_user_account: Option<String>,
    #[serde(default)]
    pub to_user_account: Option<String>,
    #[serde(default)]
    pub amount: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransfer {
    #[serde(default)]
    pub from_user_account: Option<String>,
    #[serde(default)]
    pub to_user_account: Option<String>,
    #[serde(default)]
    pub mint: String,
    #[serde(default)]
    pub token_amount: f64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedTransaction {
    pub signature: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub fee_payer: Option<String>,
    #[serde(default)]
    pub transaction_error: Option<Value>,
    #[serde(default)]
    pub native_transfers: Vec<NativeTransfer>,
    #[serde(default)]
    pub token_transfers: Vec<TokenTransfer>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TreasuryReceipt {
    pub sender: String,
    pub amount: f64,
    pub mint: String,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct WebhookSummary {
    pub received: usize,
    pub recorded: usize,
    pub duplicates: usize,
    pub degraded: usize,
    pub skipped: usize,
}

pub fn treasury_receipts(event: &EnhancedTransaction, treasury: &str) -> Vec<TreasuryReceipt> {
    let fallback_sender = event.fee_payer.clone().unwrap_or_default();
    let native = event
        .native_transfers
        .iter()
        .filter(|transfer| transfer.to_user_account.as_deref() == Some(treasury))
        .filter(|transfer| transfer.from_user_account.as_deref() != Some(treasury))
        .filter(|transfer| transfer.amount > 0)
        .map(|transfer| TreasuryReceipt {
            sender: transfer
                .from_user_account
                .clone()
                .unwrap_or_else(|| fallback_sender.clone()),
            amount: lamports_to_sol(transfer.amount),
            mint: endpoints::SOL_MINT.to_string(),
        });
    let tokens = event
        .token_transfers
        .iter()
        .filter(|transfer| transfer.to_user_account.as_deref() == Some(treasury))
        .filter(|transfer| transfer.from_user_account.as_deref() != Some(treasury))
        .filter(|transfer| transfer.token_amount > 0.0)
        .map(|transfer| TreasuryReceipt {
            sender: transfer
                .from_user_account
                .clone()
                .unwrap_or_else(|| fallback_sender.clone()),
            amount: transfer.token_amount,
            mint: transfer.mint.clone(),
        });
    native.chain(tokens).collect()
}

pub struct WebhookProcessor {
    recorder: Arc<DepositRecorder>,
    oracle: Arc<PriceOracle>,
    treasury: String,
}

impl WebhookProcessor {
    pub fn new(recorder: Arc<DepositRecorder>, oracle: Arc<PriceOracle>, treasury: String) -> Self {
        Self {
            recorder,
            oracle,
            treasury,
        }
    }

    pub async fn handle(&self, events: &[Value]) -> WebhookSummary {
        let mut summary = WebhookSummary {
            received: events.len(),
            ..WebhookSummary::default()
        };
        for raw in events {
            let event: EnhancedTransaction = match serde_json::from_value(raw.clone()) {
                Ok(event) => event,
                Err(err) => {
                    tracing::debug!(error = %err, "skipping malformed webhook event");
                    summary.skipped += 1;
                    continue;
                }
            };
            if event.transaction_error.as_ref().is_some_and(|err| !err.is_null()) {
                summary.skipped += 1;
                continue;
            }
            let receipts = treasury_receipts(&event, &self.treasury);
            if receipts.is_empty() {
                summary.skipped += 1;
                continue;
            }
            let mut usd_value = 0.0;
            let mut largest: Option<(f64, &TreasuryReceipt)> = None;
            for receipt in &receipts {
                let usd = receipt.amount * self.oracle.get_price(&receipt.mint).await;
                usd_value += usd;
                if largest.is_none_or(|(best, _)| usd > best) {
                    largest = Some((usd, receipt));
                }
            }
            let Some((_, primary)) = largest else {
                summary.skipped += 1;
                continue;
            };
            let deposit = Deposit {
                wallet: primary.sender.clone(),
                amount: primary.amount,
                asset: endpoints::symbol_for_mint(&primary.mint)
                    .map(str::to_string)
                    .unwrap_or_else(|| primary.mint.clone()),
                signature: event.signature.clone(),
                usd_value,
                message: None,
                link: None,
                timestamp: event_time(&event).unwrap_or_else(Utc::now),
            };
            let outcome = self.recorder.record(&deposit).await;
            if outcome.duplicate {
                summary.duplicates += 1;
            } else if outcome.recorded {
                summary.recorded += 1;
            } else {
                summary.degraded += 1;
            }
        }
        tracing::info!(
            received = summary.received,
            recorded = summary.recorded,
            duplicates = summary.duplicates,
            degraded = summary.degraded,
            "webhook processed"
        );
        summary
    }
}

pub fn event_time(event: &EnhancedTransaction) -> Option<DateTime<Utc>> {
    event
        .timestamp
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TREASURY: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";

    #[test]
    fn extracts_only_inbound_transfers() {
        let event: EnhancedTransaction = serde_json::from_value(json!({
            "signature": "sig",
            "timestamp": 1_700_000_000,
            "feePayer": "payer",
            "nativeTransfers": [
                {"fromUserAccount": "payer", "toUserAccount": TREASURY, "amount": 500_000_000u64},
                {"fromUserAccount": TREASURY, "toUserAccount": "elsewhere", "amount": 1_000},
                {"fromUserAccount": "payer", "toUserAccount": "elsewhere", "amount": 7}
            ],
            "tokenTransfers": [
                {"fromUserAccount": "payer", "toUserAccount": TREASURY,
                 "mint": endpoints::USDC_MINT, "tokenAmount": 12.5}
            ]
        }))
        .unwrap();
        let receipts = treasury_receipts(&event, TREASURY);
        assert_eq!(receipts.len(), 2);
        assert_eq!(receipts[0].amount, 0.5);
        assert_eq!(receipts[0].sender, "payer");
        assert_eq!(receipts[1].mint, endpoints::USDC_MINT);
        assert_eq!(event_time(&event).map(|at| at.timestamp()), Some(1_700_000_000));
    }
}
