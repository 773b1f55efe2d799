use thiserror::Error;

use crate::gateway::GatewayError;
use crate::interfaces::StoreError;

#[derive(Debug, Error)]
pub enum ThroneError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("insufficient funds: need {required} lamports, wallet holds {available}")]
    InsufficientFunds { required: u64, available: u64 },
    #[error("wallet error: {0}")]
    Wallet(String),
    #[error("swap error: {0}")]
    Swap(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("transaction {signature} failed on-chain: {reason}")]
    OnChain { signature: String, reason: String },
    #[error("transaction {signature} was not confirmed within {waited_secs}s")]
    ConfirmationTimeout { signature: String, waited_secs: u64 },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<GatewayError> for ThroneError {
    fn from(err: GatewayError) -> Self {
        Self::Network(err.to_string())
    }
}

