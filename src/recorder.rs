use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::events::{Event, EventBus, EventType};
use crate::interfaces::{InsertOutcome, LeaderboardStore, StoreError, TransactionRecord};
use crate::local_ledger::{LocalLedger, PendingDeposit};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Deposit {
    pub wallet: String,
    pub amount: f64,
    pub asset: String,
    pub signature: String,
    pub usd_value: f64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Deposit {
    fn pending(&self) -> PendingDeposit {
        PendingDeposit {
            record: TransactionRecord {
                signature: self.signature.clone(),
                wallet_address: self.wallet.clone(),
                amount: self.amount,
                token_symbol: self.asset.clone(),
                usd_value: self.usd_value,
                message: self.message.clone(),
                timestamp: self.timestamp,
            },
            link: self.link.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct RecordOutcome {
    pub recorded: bool,
    pub duplicate: bool,
    pub local: bool,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct ReconcileReport {
    pub replayed: usize,
    pub duplicates: usize,
    pub still_pending: usize,
}

pub struct DepositRecorder {
    store: Arc<dyn LeaderboardStore>,
    ledger: Arc<LocalLedger>,
    events: EventBus,
}

impl DepositRecorder {
    pub fn new(store: Arc<dyn LeaderboardStore>, ledger: Arc<LocalLedger>, events: EventBus) -> Self {
        Self {
            store,
            ledger,
            events,
        }
    }

    pub async fn record(&self, deposit: &Deposit) -> RecordOutcome {
        let pending = deposit.pending();
        let applied = self.apply(&pending).await;
        match applied {
            Ok(InsertOutcome::Inserted) => {
                tracing::info!(
                    wallet = %deposit.wallet,
                    signature = %deposit.signature,
                    asset = %deposit.asset,
                    usd = deposit.usd_value,
                    "deposit recorded"
                );
                self.emit(EventType::DepositRecorded, deposit);
                RecordOutcome {
                    recorded: true,
                    ..RecordOutcome::default()
                }
            }
            Ok(InsertOutcome::Duplicate) => {
                tracing::info!(signature = %deposit.signature, "deposit already recorded");
                self.emit(EventType::DepositDuplicate, deposit);
                RecordOutcome {
                    recorded: true,
                    duplicate: true,
                    ..RecordOutcome::default()
                }
            }
            Err(err) => {
                tracing::warn!(
                    wallet = %deposit.wallet,
                    signature = %deposit.signature,
                    error = %err,
                    "durable store failed, keeping deposit locally"
                );
                let local = match self.ledger.add_pending(pending) {
                    Ok(_) => true,
                    Err(ledger_err) => {
                        tracing::error!(
                            signature = %deposit.signature,
                            error = %format!("{ledger_err:#}"),
                            "local ledger write failed"
                        );
                        false
                    }
                };
                self.events.emit(Event::new(
                    EventType::RecordDegraded,
                    "recorder",
                    json!({
                        "wallet": deposit.wallet,
                        "signature": deposit.signature,
                        "error": err.to_string(),
                        "local": local,
                    }),
                ));
                RecordOutcome {
                    recorded: false,
                    duplicate: false,
                    local,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    async fn apply(&self, pending: &PendingDeposit) -> Result<InsertOutcome, StoreError> {
        self.store
            .record_deposit(&pending.record, &pending.delta())
            .await
    }

    fn emit(&self, event_type: EventType, deposit: &Deposit) {
        self.events.emit(Event::new(
            event_type,
            "recorder",
            json!({
                "wallet": deposit.wallet,
                "signature": deposit.signature,
                "asset": deposit.asset,
                "usd_value": deposit.usd_value,
            }),
        ));
    }

    /// Replays locally captured deposits. A deposit whose earlier write
    /// landed without an acknowledgement comes back as a duplicate and is
    /// dropped without counting it again.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for pending in self.ledger.pending() {
            let signature = pending.record.signature.clone();
            let applied = match self.apply(&pending).await {
                Ok(InsertOutcome::Inserted) => {
                    report.replayed += 1;
                    true
                }
                Ok(InsertOutcome::Duplicate) => {
                    report.duplicates += 1;
                    true
                }
                Err(err) => {
                    tracing::debug!(signature = %signature, error = %err, "replay deferred");
                    report.still_pending += 1;
                    false
                }
            };
            if applied && let Err(err) = self.ledger.remove_pending(&signature) {
                tracing::warn!(signature = %signature, error = %format!("{err:#}"), "could not drop replayed deposit");
            }
        }
        if report.replayed + report.duplicates > 0 {
            tracing::info!(
                replayed = report.replayed,
                duplicates = report.duplicates,
                pending = report.still_pending,
                "local deposits reconciled"
            );
        }
        report
    }
}
