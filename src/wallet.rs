use std::fs;
use std::path::Path;

use async_trait::async_trait;
use solana_sdk::message::VersionedMessage;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::transaction::VersionedTransaction;

use crate::errors::ThroneError;

pub const KEYPAIR_ENV: &str = "SPENDTHRONE_KEYPAIR";
pub const KEYPAIR_FILE_ENV: &str = "SPENDTHRONE_KEYPAIR_FILE";

#[async_trait]
pub trait WalletSigner: Send + Sync {
    fn pubkey(&self) -> Pubkey;

    async fn sign_transaction(
        &self,
        message: VersionedMessage,
    ) -> Result<VersionedTransaction, ThroneError>;
}

pub struct KeypairWallet {
    keypair: Keypair,
    source: String,
}

impl KeypairWallet {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            source: "inline".into(),
        }
    }

    pub fn resolve(path: Option<&Path>) -> Result<Self, ThroneError> {
        if let Ok(inline) = std::env::var(KEYPAIR_ENV)
            && !inline.trim().is_empty()
        {
            return Ok(Self {
                keypair: parse_keypair(&inline)?,
                source: KEYPAIR_ENV.into(),
            });
        }
        if let Ok(file) = std::env::var(KEYPAIR_FILE_ENV)
            && !file.trim().is_empty()
        {
            return Self::from_file(Path::new(file.trim()));
        }
        match path {
            Some(path) => Self::from_file(path),
            None => Err(ThroneError::Configuration(format!(
                "no keypair found: set {KEYPAIR_ENV} or {KEYPAIR_FILE_ENV}"
            ))),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ThroneError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            ThroneError::Configuration(format!("reading keypair {}: {err}", path.display()))
        })?;
        Ok(Self {
            keypair: parse_keypair(&contents)?,
            source: path.display().to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn sign_message(&self, message: &[u8]) -> Signature {
        self.keypair.sign_message(message)
    }
}

pub fn parse_keypair(contents: &str) -> Result<Keypair, ThroneError> {
    let bytes: Vec<u8> = serde_json::from_str(contents.trim()).map_err(|err| {
        ThroneError::Configuration(format!("keypair is not a json byte array: {err}"))
    })?;
    Keypair::from_bytes(&bytes)
        .map_err(|err| ThroneError::Configuration(format!("invalid keypair bytes: {err}")))
}

#[async_trait]
impl WalletSigner for KeypairWallet {
    fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    async fn sign_transaction(
        &self,
        message: VersionedMessage,
    ) -> Result<VersionedTransaction, ThroneError> {
        VersionedTransaction::try_new(message, &[&self.keypair])
            .map_err(|err| ThroneError::Wallet(err.to_string()))
    }
}
