use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::gateway::{GatewayError, HttpStatusError, RequestGateway, check_status};
use crate::interfaces::{
    InsertOutcome, LeaderboardDelta, LeaderboardEntry, LeaderboardStore, ProfileProof,
    ProfileUpdate, StoreError, TransactionRecord,
};

pub fn sort_entries(entries: &mut [LeaderboardEntry]) {
    entries.sort_by(|a, b| {
        b.total_usd_value
            .total_cmp(&a.total_usd_value)
            .then_with(|| match (a.last_activity, b.last_activity) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.wallet_address.cmp(&b.wallet_address))
    });
}

#[derive(Default)]
struct MemoryState {
    users: HashSet<String>,
    transactions: HashMap<String, TransactionRecord>,
    entries: HashMap<String, LeaderboardEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transaction(&self, signature: &str) -> Option<TransactionRecord> {
        self.state.lock().await.transactions.get(signature).cloned()
    }
}

#[async_trait]
impl LeaderboardStore for MemoryStore {
    async fn record_deposit(
        &self,
        record: &TransactionRecord,
        delta: &LeaderboardDelta,
    ) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if state.transactions.contains_key(&record.signature) {
            return Ok(InsertOutcome::Duplicate);
        }
        let wallet = delta.wallet_address.as_str();
        state.users.insert(wallet.to_string());
        state
            .transactions
            .insert(record.signature.clone(), record.clone());
        state
            .entries
            .entry(wallet.to_string())
            .or_insert_with(|| LeaderboardEntry::new(wallet))
            .apply_deposit(delta);
        Ok(InsertOutcome::Inserted)
    }

    async fn top_entries(&self, limit: usize) -> Result<Vec<LeaderboardEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state.entries.values().cloned().collect();
        sort_entries(&mut entries);
        entries.truncate(limit);
        Ok(entries)
    }

    async fn entry(&self, wallet: &str) -> Result<Option<LeaderboardEntry>, StoreError> {
        Ok(self.state.lock().await.entries.get(wallet).cloned())
    }

    async fn count_greater(&self, usd: f64) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .values()
            .filter(|entry| entry.total_usd_value > usd)
            .count() as u64)
    }

    async fn update_profile(
        &self,
        wallet: &str,
        update: &ProfileUpdate,
        _proof: &ProfileProof,
    ) -> Result<LeaderboardEntry, StoreError> {
        let mut state = self.state.lock().await;
        state.users.insert(wallet.to_string());
        let entry = state
            .entries
            .entry(wallet.to_string())
            .or_insert_with(|| LeaderboardEntry::new(wallet));
        update.apply(entry);
        Ok(entry.clone())
    }

    async fn reset_entry(&self, wallet: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(wallet)
            .ok_or_else(|| StoreError::NotFound(wallet.to_string()))?;
        entry.total_usd_value = 0.0;
        entry.transaction_count = 0;
        Ok(())
    }
}

pub struct PostgrestStore {
    http: reqwest::Client,
    gateway: Arc<RequestGateway>,
    base_url: String,
    api_key: String,
}

impl PostgrestStore {
    pub fn new(
        http: reqwest::Client,
        gateway: Arc<RequestGateway>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http,
            gateway,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/{path}", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn fetch_json(
        &self,
        op: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Value, StoreError> {
        self.gateway
            .execute(&format!("store:{op}"), || {
                let request = build();
                async move {
                    let response = check_status(request.send().await?).await?;
                    let text = response.text().await?;
                    if text.trim().is_empty() {
                        return Ok(Value::Null);
                    }
                    Ok(serde_json::from_str::<Value>(&text)?)
                }
            })
            .await
            .map_err(store_error)
    }

    fn entry_eq(wallet: &str) -> [(&'static str, String); 1] {
        [("wallet_address", format!("eq.{wallet}"))]
    }
}

fn store_error(err: GatewayError) -> StoreError {
    let status = match &err {
        GatewayError::Failed { error, .. } | GatewayError::Exhausted { error, .. } => error
            .chain()
            .find_map(|cause| cause.downcast_ref::<HttpStatusError>())
            .map(|http| http.status),
        _ => None,
    };
    match status {
        Some(status) if (400..500).contains(&status) && status != 429 => {
            StoreError::Invalid(err.to_string())
        }
        _ => StoreError::Unavailable(err.to_string()),
    }
}

fn parse_entry(value: Value) -> Result<Option<LeaderboardEntry>, StoreError> {
    let row = match value {
        Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
        Value::Array(_) | Value::Null => return Ok(None),
        row => row,
    };
    serde_json::from_value(row)
        .map(Some)
        .map_err(|err| StoreError::Invalid(format!("malformed leaderboard row: {err}")))
}

fn parse_record_outcome(value: &Value) -> Result<InsertOutcome, StoreError> {
    let inserted = match value {
        Value::Bool(inserted) => Some(*inserted),
        Value::Array(rows) => rows.first().and_then(|row| match row {
            Value::Bool(inserted) => Some(*inserted),
            row => row.get("record_deposit").and_then(Value::as_bool),
        }),
        row => row.get("record_deposit").and_then(Value::as_bool),
    };
    match inserted {
        Some(true) => Ok(InsertOutcome::Inserted),
        Some(false) => Ok(InsertOutcome::Duplicate),
        None => Err(StoreError::Invalid(format!(
            "unexpected record_deposit response {value}"
        ))),
    }
}

fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl LeaderboardStore for PostgrestStore {
    async fn record_deposit(
        &self,
        record: &TransactionRecord,
        delta: &LeaderboardDelta,
    ) -> Result<InsertOutcome, StoreError> {
        // record_deposit inserts the transaction row and bumps the wallet's
        // totals in one statement, skipping the bump when the signature
        // already exists. It answers true only for a fresh insert.
        let body = json!({
            "p_signature": record.signature,
            "p_wallet_address": delta.wallet_address,
            "p_amount": record.amount,
            "p_token_symbol": record.token_symbol,
            "p_usd_value": delta.usd_value,
            "p_message": delta.message,
            "p_link": delta.link,
            "p_timestamp": delta.at,
        });
        let value = self
            .fetch_json("record_deposit", || {
                self.request(Method::POST, "rpc/record_deposit").json(&body)
            })
            .await?;
        parse_record_outcome(&value)
    }

    async fn top_entries(&self, limit: usize) -> Result<Vec<LeaderboardEntry>, StoreError> {
        let limit = limit.to_string();
        let value = self
            .fetch_json("top_entries", || {
                self.request(Method::GET, "leaderboard").query(&[
                    ("select", "*"),
                    ("order", "total_usd_value.desc,last_activity.asc,wallet_address.asc"),
                    ("limit", limit.as_str()),
                ])
            })
            .await?;
        let mut entries: Vec<LeaderboardEntry> = match value {
            Value::Null => Vec::new(),
            rows => serde_json::from_value(rows)
                .map_err(|err| StoreError::Invalid(format!("malformed leaderboard: {err}")))?,
        };
        sort_entries(&mut entries);
        Ok(entries)
    }

    async fn entry(&self, wallet: &str) -> Result<Option<LeaderboardEntry>, StoreError> {
        let value = self
            .fetch_json("entry", || {
                self.request(Method::GET, "leaderboard")
                    .query(&Self::entry_eq(wallet))
                    .query(&[("limit", "1")])
            })
            .await?;
        parse_entry(value)
    }

    async fn count_greater(&self, usd: f64) -> Result<u64, StoreError> {
        let filter = format!("gt.{usd}");
        self.gateway
            .execute("store:count_greater", || {
                let request = self
                    .request(Method::GET, "leaderboard")
                    .query(&[("select", "wallet_address"), ("total_usd_value", filter.as_str())])
                    .header("Prefer", "count=exact")
                    .header("Range", "0-0");
                async move {
                    let response = check_status(request.send().await?).await?;
                    let header = response
                        .headers()
                        .get("content-range")
                        .and_then(|value| value.to_str().ok())
                        .ok_or_else(|| anyhow!("count response missing content-range"))?;
                    parse_content_range_total(header)
                        .ok_or_else(|| anyhow!("unparseable content-range {header}"))
                }
            })
            .await
            .map_err(store_error)
    }

    async fn update_profile(
        &self,
        wallet: &str,
        update: &ProfileUpdate,
        proof: &ProfileProof,
    ) -> Result<LeaderboardEntry, StoreError> {
        let body = json!({
            "p_wallet_address": wallet,
            "p_signed_message": proof.message,
            "p_signature": proof.signature,
            "p_display_name": update.display_name,
            "p_message": update.message,
            "p_link": update.link,
            "p_custom_links": update.custom_links,
            "p_custom_sections": update.custom_sections,
        });
        let value = self
            .fetch_json("update_profile", || {
                self.request(Method::POST, "rpc/update_profile_secure")
                    .json(&body)
            })
            .await?;
        match parse_entry(value)? {
            Some(entry) => Ok(entry),
            None => self
                .entry(wallet)
                .await?
                .ok_or_else(|| StoreError::NotFound(wallet.to_string())),
        }
    }

    async fn reset_entry(&self, wallet: &str) -> Result<(), StoreError> {
        let body = json!({"total_usd_value": 0.0, "transaction_count": 0});
        let value = self
            .fetch_json("reset_entry", || {
                self.request(Method::PATCH, "leaderboard")
                    .query(&Self::entry_eq(wallet))
                    .header("Prefer", "return=representation")
                    .json(&body)
            })
            .await?;
        match parse_entry(value)? {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(wallet.to_string())),
        }
    }
}
