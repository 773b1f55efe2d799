use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CustomLink {
    pub label: String,
    pub url: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CustomSection {
    pub title: String,
    pub body: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LeaderboardEntry {
    pub wallet_address: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub total_usd_value: f64,
    #[serde(default)]
    pub transaction_count: u64,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub custom_links: Vec<CustomLink>,
    #[serde(default)]
    pub custom_sections: Vec<CustomSection>,
}

impl LeaderboardEntry {
    pub fn new(wallet_address: impl Into<String>) -> Self {
        Self {
            wallet_address: wallet_address.into(),
            display_name: None,
            total_usd_value: 0.0,
            transaction_count: 0,
            last_activity: None,
            message: None,
            link: None,
            custom_links: Vec::new(),
            custom_sections: Vec::new(),
        }
    }

    pub fn apply_deposit(&mut self, delta: &LeaderboardDelta) {
        if delta.usd_value.is_finite() && delta.usd_value > 0.0 {
            self.total_usd_value += delta.usd_value;
        }
        self.transaction_count += 1;
        self.last_activity = Some(
            self.last_activity
                .map_or(delta.at, |last| last.max(delta.at)),
        );
        if delta.message.is_some() {
            self.message = delta.message.clone();
        }
        if delta.link.is_some() {
            self.link = delta.link.clone();
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LeaderboardDelta {
    pub wallet_address: String,
    pub usd_value: f64,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

impl LeaderboardDelta {
    pub fn new(wallet_address: impl Into<String>, usd_value: f64, at: DateTime<Utc>) -> Self {
        Self {
            wallet_address: wallet_address.into(),
            usd_value,
            at,
            message: None,
            link: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TransactionRecord {
    pub signature: String,
    pub wallet_address: String,
    pub amount: f64,
    pub token_symbol: String,
    pub usd_value: f64,
    #[serde(default)]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SacrificeCandidate {
    pub address: solana_sdk::pubkey::Pubkey,
    pub mint: String,
    pub lamports: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub custom_links: Option<Vec<CustomLink>>,
    #[serde(default)]
    pub custom_sections: Option<Vec<CustomSection>>,
}

impl ProfileUpdate {
    pub fn apply(&self, entry: &mut LeaderboardEntry) {
        if let Some(name) = &self.display_name {
            entry.display_name = Some(name.clone());
        }
        if let Some(message) = &self.message {
            entry.message = Some(message.clone());
        }
        if let Some(link) = &self.link {
            entry.link = Some(link.clone());
        }
        if let Some(links) = &self.custom_links {
            entry.custom_links = links.clone();
        }
        if let Some(sections) = &self.custom_sections {
            entry.custom_sections = sections.clone();
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ProfileProof {
    pub message: String,
    pub signature: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected by store: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[async_trait]
pub trait LeaderboardStore: Send + Sync {
    /// Stores the transaction and applies `delta` to its wallet's entry as
    /// one unit keyed by `record.signature`. A signature that is already
    /// stored yields `Duplicate` and leaves every total untouched, so a call
    /// whose acknowledgement was lost can be repeated.
    async fn record_deposit(
        &self,
        record: &TransactionRecord,
        delta: &LeaderboardDelta,
    ) -> Result<InsertOutcome, StoreError>;

    async fn top_entries(&self, limit: usize) -> Result<Vec<LeaderboardEntry>, StoreError>;

    async fn entry(&self, wallet: &str) -> Result<Option<LeaderboardEntry>, StoreError>;

    async fn count_greater(&self, usd: f64) -> Result<u64, StoreError>;

    async fn update_profile(
        &self,
        wallet: &str,
        update: &ProfileUpdate,
        proof: &ProfileProof,
    ) -> Result<LeaderboardEntry, StoreError>;

    async fn reset_entry(&self, wallet: &str) -> Result<(), StoreError>;
}
