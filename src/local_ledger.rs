use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::interfaces::{LeaderboardDelta, LeaderboardEntry, ProfileUpdate, TransactionRecord};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PendingDeposit {
    pub record: TransactionRecord,
    #[serde(default)]
    pub link: Option<String>,
}

impl PendingDeposit {
    pub fn delta(&self) -> LeaderboardDelta {
        LeaderboardDelta {
            wallet_address: self.record.wallet_address.clone(),
            usd_value: self.record.usd_value,
            at: self.record.timestamp,
            message: self.record.message.clone(),
            link: self.link.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LeaderboardSnapshot {
    pub entries: Vec<LeaderboardEntry>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct LedgerData {
    #[serde(default)]
    pending: Vec<PendingDeposit>,
    #[serde(default)]
    profiles: HashMap<String, ProfileUpdate>,
    #[serde(default)]
    snapshot: Option<LeaderboardSnapshot>,
}

pub struct LocalLedger {
    path: Option<PathBuf>,
    data: Mutex<LedgerData>,
}

impl LocalLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading local ledger {}", path.display()))?;
            serde_json::from_str(&content).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), error = %err, "local ledger unreadable, starting empty");
                LedgerData::default()
            })
        } else {
            LedgerData::default()
        };
        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(LedgerData::default()),
        }
    }

    fn data(&self) -> MutexGuard<'_, LedgerData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, data: &LedgerData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, serde_json::to_vec_pretty(data)?)
            .with_context(|| format!("writing {}", staging.display()))?;
        fs::rename(&staging, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    pub fn add_pending(&self, deposit: PendingDeposit) -> Result<bool> {
        let mut data = self.data();
        if data
            .pending
            .iter()
            .any(|pending| pending.record.signature == deposit.record.signature)
        {
            return Ok(false);
        }
        data.pending.push(deposit);
        self.persist(&data)?;
        Ok(true)
    }

    pub fn pending(&self) -> Vec<PendingDeposit> {
        self.data().pending.clone()
    }

    pub fn pending_for(&self, wallet: &str) -> Vec<PendingDeposit> {
        self.data()
            .pending
            .iter()
            .filter(|pending| pending.record.wallet_address == wallet)
            .cloned()
            .collect()
    }

    pub fn remove_pending(&self, signature: &str) -> Result<()> {
        let mut data = self.data();
        let before = data.pending.len();
        data.pending
            .retain(|pending| pending.record.signature != signature);
        if data.pending.len() != before {
            self.persist(&data)?;
        }
        Ok(())
    }

    pub fn set_profile(&self, wallet: &str, update: &ProfileUpdate) -> Result<()> {
        let mut data = self.data();
        let merged = data.profiles.entry(wallet.to_string()).or_default();
        if update.display_name.is_some() {
            merged.display_name = update.display_name.clone();
        }
        if update.message.is_some() {
            merged.message = update.message.clone();
        }
        if update.link.is_some() {
            merged.link = update.link.clone();
        }
        if update.custom_links.is_some() {
            merged.custom_links = update.custom_links.clone();
        }
        if update.custom_sections.is_some() {
            merged.custom_sections = update.custom_sections.clone();
        }
        self.persist(&data)
    }

    pub fn profile(&self, wallet: &str) -> Option<ProfileUpdate> {
        self.data().profiles.get(wallet).cloned()
    }

    pub fn clear_profile(&self, wallet: &str) -> Result<()> {
        let mut data = self.data();
        if data.profiles.remove(wallet).is_some() {
            self.persist(&data)?;
        }
        Ok(())
    }

    pub fn save_snapshot(&self, entries: &[LeaderboardEntry]) -> Result<()> {
        let mut data = self.data();
        data.snapshot = Some(LeaderboardSnapshot {
            entries: entries.to_vec(),
            taken_at: Utc::now(),
        });
        self.persist(&data)
    }

    pub fn snapshot(&self) -> Option<LeaderboardSnapshot> {
        self.data().snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deposit(signature: &str) -> PendingDeposit {
        PendingDeposit {
            record: TransactionRecord {
                signature: signature.into(),
                wallet_address: "wallet".into(),
                amount: 0.5,
                token_symbol: "SOL".into(),
                usd_value: 75.0,
                message: None,
                timestamp: Utc::now(),
            },
            link: None,
        }
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.json");
        let ledger = LocalLedger::open(&path).unwrap();
        assert!(ledger.add_pending(deposit("a")).unwrap());
        assert!(!ledger.add_pending(deposit("a")).unwrap());
        ledger
            .set_profile(
                "wallet",
                &ProfileUpdate {
                    display_name: Some("Queen".into()),
                    ..ProfileUpdate::default()
                },
            )
            .unwrap();
        ledger
            .save_snapshot(&[LeaderboardEntry::new("wallet")])
            .unwrap();

        let reopened = LocalLedger::open(&path).unwrap();
        assert_eq!(reopened.pending_for("wallet").len(), 1);
        assert_eq!(reopened.pending()[0].delta().usd_value, 75.0);
        assert_eq!(
            reopened.profile("wallet").unwrap().display_name.as_deref(),
            Some("Queen")
        );
        assert_eq!(reopened.snapshot().unwrap().entries.len(), 1);

        reopened.remove_pending("a").unwrap();
        assert!(LocalLedger::open(&path).unwrap().pending().is_empty());
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        fs::write(&path, "{not json").unwrap();
        let ledger = LocalLedger::open(&path).unwrap();
        assert!(ledger.pending().is_empty());
    }
}
