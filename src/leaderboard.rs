use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use url::Url;

use crate::config::TierConfig;
use crate::errors::ThroneError;
use crate::events::{Event, EventBus, EventType};
use crate::interfaces::{LeaderboardEntry, LeaderboardStore, ProfileProof, ProfileUpdate, StoreError};
use crate::local_ledger::LocalLedger;
use crate::store::sort_entries;

pub const PROFILE_MESSAGE_PREFIX: &str = "SpendThrone profile update for";
pub const PROFILE_PROOF_WINDOW_SECS: i64 = 300;
pub const DEFAULT_PAGE_SIZE: usize = 100;
const SYNTHETIC_ENTRIES: usize = 10;
const MAX_DISPLAY_NAME: usize = 32;
const MAX_MESSAGE: usize = 280;
const MAX_CUSTOM_LINKS: usize = 5;
const MAX_CUSTOM_SECTIONS: usize = 5;

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct RankedEntry {
    pub rank: u64,
    pub tier: String,
    #[serde(flatten)]
    pub entry: LeaderboardEntry,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReadSource {
    Live,
    Snapshot,
    Synthetic,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct LeaderboardPage {
    pub source: ReadSource,
    pub entries: Vec<RankedEntry>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct WalletStanding {
    pub source: ReadSource,
    pub entry: Option<RankedEntry>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ProfileOutcome {
    pub entry: LeaderboardEntry,
    pub local: bool,
}

pub fn tier_for_value(tiers: &[TierConfig], value: f64) -> &str {
    let lowest = tiers.first().map(|tier| tier.name.as_str()).unwrap_or_default();
    if value.is_nan() || value < 0.0 {
        return lowest;
    }
    tiers
        .iter()
        .rev()
        .find(|tier| value >= tier.min_usd)
        .map(|tier| tier.name.as_str())
        .unwrap_or(lowest)
}

pub fn rank_sorted(entries: Vec<LeaderboardEntry>, tiers: &[TierConfig]) -> Vec<RankedEntry> {
    let mut ranked: Vec<RankedEntry> = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let rank = match ranked.last() {
            Some(previous) if previous.entry.total_usd_value == entry.total_usd_value => {
                previous.rank
            }
            _ => index as u64 + 1,
        };
        ranked.push(RankedEntry {
            rank,
            tier: tier_for_value(tiers, entry.total_usd_value).to_string(),
            entry,
        });
    }
    ranked
}

pub fn synthetic_entries(count: usize) -> Vec<LeaderboardEntry> {
    (1..=count)
        .map(|position| LeaderboardEntry {
            display_name: Some(format!("Pretender #{position}")),
            total_usd_value: (10_000.0 / position as f64 * 100.0).round() / 100.0,
            transaction_count: (count + 1 - position) as u64,
            ..LeaderboardEntry::new(format!("pretender-{position:02}"))
        })
        .collect()
}

pub fn profile_message(wallet: &str, unix_ts: i64) -> String {
    format!("{PROFILE_MESSAGE_PREFIX} {wallet} at {unix_ts}")
}

pub fn verify_profile_proof(
    wallet: &str,
    proof: &ProfileProof,
    now: DateTime<Utc>,
) -> Result<(), ThroneError> {
    let invalid = |reason: &str| ThroneError::InvalidRequest(format!("profile proof {reason}"));
    let rest = proof
        .message
        .strip_prefix(PROFILE_MESSAGE_PREFIX)
        .ok_or_else(|| invalid("has an unexpected message"))?;
    let (signed_wallet, timestamp) = rest
        .trim()
        .split_once(" at ")
        .ok_or_else(|| invalid("has an unexpected message"))?;
    if signed_wallet != wallet {
        return Err(invalid("was signed for another wallet"));
    }
    let timestamp: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| invalid("has an unreadable timestamp"))?;
    if (now.timestamp() - timestamp).abs() > PROFILE_PROOF_WINDOW_SECS {
        return Err(invalid("has expired"));
    }
    let pubkey = Pubkey::from_str(wallet).map_err(|_| invalid("names an invalid wallet"))?;
    let signature =
        Signature::from_str(proof.signature.trim()).map_err(|_| invalid("has a malformed signature"))?;
    if !signature.verify(pubkey.as_ref(), proof.message.as_bytes()) {
        return Err(invalid("signature does not match"));
    }
    Ok(())
}

fn validate_link(field: &str, link: &str) -> Result<(), ThroneError> {
    let parsed = Url::parse(link)
        .map_err(|_| ThroneError::InvalidRequest(format!("{field} is not a valid url")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ThroneError::InvalidRequest(format!(
            "{field} must use http or https"
        )));
    }
    Ok(())
}

pub fn validate_profile(update: &ProfileUpdate) -> Result<(), ThroneError> {
    if let Some(name) = &update.display_name
        && (name.trim().is_empty() || name.chars().count() > MAX_DISPLAY_NAME)
    {
        return Err(ThroneError::InvalidRequest(format!(
            "display name must be 1 to {MAX_DISPLAY_NAME} characters"
        )));
    }
    if let Some(message) = &update.message
        && message.chars().count() > MAX_MESSAGE
    {
        return Err(ThroneError::InvalidRequest(format!(
            "message must be at most {MAX_MESSAGE} characters"
        )));
    }
    if let Some(link) = &update.link {
        validate_link("link", link)?;
    }
    if let Some(links) = &update.custom_links {
        if links.len() > MAX_CUSTOM_LINKS {
            return Err(ThroneError::InvalidRequest(format!(
                "at most {MAX_CUSTOM_LINKS} custom links"
            )));
        }
        for link in links {
            validate_link("custom link", &link.url)?;
        }
    }
    if let Some(sections) = &update.custom_sections
        && sections.len() > MAX_CUSTOM_SECTIONS
    {
        return Err(ThroneError::InvalidRequest(format!(
            "at most {MAX_CUSTOM_SECTIONS} custom sections"
        )));
    }
    Ok(())
}

pub struct LeaderboardService {
    store: Arc<dyn LeaderboardStore>,
    ledger: Arc<LocalLedger>,
    events: EventBus,
    tiers: Vec<TierConfig>,
}

impl LeaderboardService {
    pub fn new(
        store: Arc<dyn LeaderboardStore>,
        ledger: Arc<LocalLedger>,
        events: EventBus,
        tiers: Vec<TierConfig>,
    ) -> Self {
        Self {
            store,
            ledger,
            events,
            tiers,
        }
    }

    pub fn tier_for_value(&self, value: f64) -> &str {
        tier_for_value(&self.tiers, value)
    }

    pub async fn top(&self, limit: usize, current: Option<&str>) -> LeaderboardPage {
        match self.store.top_entries(limit).await {
            Ok(entries) => {
                // Only full pages replace the snapshot.
                if limit >= DEFAULT_PAGE_SIZE
                    && let Err(err) = self.ledger.save_snapshot(&entries)
                {
                    tracing::debug!(error = %format!("{err:#}"), "leaderboard snapshot not saved");
                }
                LeaderboardPage {
                    source: ReadSource::Live,
                    entries: rank_sorted(entries, &self.tiers),
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "leaderboard store unavailable, serving degraded read");
                let (source, mut entries) = self.fallback_entries();
                if let Some(wallet) = current {
                    self.merge_local(&mut entries, wallet);
                }
                sort_entries(&mut entries);
                entries.truncate(limit);
                LeaderboardPage {
                    source,
                    entries: rank_sorted(entries, &self.tiers),
                }
            }
        }
    }

    pub async fn standing(&self, wallet: &str) -> WalletStanding {
        match self.live_standing(wallet).await {
            Ok(entry) => WalletStanding {
                source: ReadSource::Live,
                entry,
            },
            Err(err) => {
                tracing::warn!(wallet, error = %err, "rank lookup degraded");
                let (source, mut entries) = self.fallback_entries();
                self.merge_local(&mut entries, wallet);
                let entry = entries
                    .iter()
                    .find(|entry| entry.wallet_address == wallet)
                    .cloned()
                    .map(|entry| {
                        let greater = entries
                            .iter()
                            .filter(|other| other.total_usd_value > entry.total_usd_value)
                            .count() as u64;
                        self.ranked(entry, greater + 1)
                    });
                WalletStanding { source, entry }
            }
        }
    }

    async fn live_standing(&self, wallet: &str) -> Result<Option<RankedEntry>, StoreError> {
        let Some(entry) = self.store.entry(wallet).await? else {
            return Ok(None);
        };
        let greater = self.store.count_greater(entry.total_usd_value).await?;
        Ok(Some(self.ranked(entry, greater + 1)))
    }

    fn ranked(&self, entry: LeaderboardEntry, rank: u64) -> RankedEntry {
        RankedEntry {
            rank,
            tier: self.tier_for_value(entry.total_usd_value).to_string(),
            entry,
        }
    }

    fn fallback_entries(&self) -> (ReadSource, Vec<LeaderboardEntry>) {
        match self.ledger.snapshot() {
            Some(snapshot) => (ReadSource::Snapshot, snapshot.entries),
            None => (ReadSource::Synthetic, synthetic_entries(SYNTHETIC_ENTRIES)),
        }
    }

    fn merge_local(&self, entries: &mut Vec<LeaderboardEntry>, wallet: &str) {
        let pending = self.ledger.pending_for(wallet);
        let profile = self.ledger.profile(wallet);
        if pending.is_empty() && profile.is_none() {
            return;
        }
        let index = match entries
            .iter()
            .position(|entry| entry.wallet_address == wallet)
        {
            Some(index) => index,
            None => {
                entries.push(LeaderboardEntry::new(wallet));
                entries.len() - 1
            }
        };
        let entry = &mut entries[index];
        for deposit in &pending {
            entry.apply_deposit(&deposit.delta());
        }
        if let Some(profile) = profile {
            profile.apply(entry);
        }
    }

    pub async fn update_profile(
        &self,
        wallet: &str,
        update: &ProfileUpdate,
        proof: &ProfileProof,
    ) -> Result<ProfileOutcome, ThroneError> {
        verify_profile_proof(wallet, proof, Utc::now())?;
        validate_profile(update)?;
        match self.store.update_profile(wallet, update, proof).await {
            Ok(entry) => {
                if let Err(err) = self.ledger.clear_profile(wallet) {
                    tracing::debug!(wallet, error = %format!("{err:#}"), "local profile not cleared");
                }
                self.emit_profile(wallet, false);
                Ok(ProfileOutcome { entry, local: false })
            }
            Err(err) if err.is_unavailable() => {
                tracing::warn!(wallet, error = %err, "profile kept locally");
                self.ledger.set_profile(wallet, update)?;
                let mut entries = self
                    .ledger
                    .snapshot()
                    .map(|snapshot| snapshot.entries)
                    .unwrap_or_default();
                entries.retain(|entry| entry.wallet_address == wallet);
                self.merge_local(&mut entries, wallet);
                let entry = entries
                    .pop()
                    .unwrap_or_else(|| LeaderboardEntry::new(wallet));
                self.emit_profile(wallet, true);
                Ok(ProfileOutcome { entry, local: true })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn emit_profile(&self, wallet: &str, local: bool) {
        self.events.emit(Event::new(
            EventType::ProfileUpdated,
            "leaderboard",
            json!({"wallet": wallet, "local": local}),
        ));
    }

    pub async fn reset_entry(&self, wallet: &str) -> Result<(), ThroneError> {
        self.store.reset_entry(wallet).await?;
        tracing::info!(wallet, "leaderboard entry reset");
        self.events.emit(Event::new(
            EventType::LeaderboardReset,
            "leaderboard",
            json!({"wallet": wallet}),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_tiers;
    use solana_sdk::signature::{Keypair, Signer};

    fn entry(wallet: &str, total: f64) -> LeaderboardEntry {
        LeaderboardEntry {
            total_usd_value: total,
            ..LeaderboardEntry::new(wallet)
        }
    }

    #[test]
    fn ties_share_competition_rank() {
        let ranked = rank_sorted(
            vec![
                entry("a", 100.0),
                entry("b", 50.0),
                entry("c", 50.0),
                entry("d", 10.0),
            ],
            &default_tiers(),
        );
        let ranks: Vec<_> = ranked.iter().map(|entry| entry.rank).collect();
        assert_eq!(ranks, [1, 2, 2, 4]);
        assert_eq!(ranked[0].tier, "Knight");
        assert_eq!(ranked[3].tier, "Peasant");
    }

    #[test]
    fn tiers_follow_thresholds() {
        let tiers = default_tiers();
        assert_eq!(tier_for_value(&tiers, 0.0), "Peasant");
        assert_eq!(tier_for_value(&tiers, 49.99), "Peasant");
        assert_eq!(tier_for_value(&tiers, 50.0), "Squire");
        assert_eq!(tier_for_value(&tiers, 999.0), "Baron");
        assert_eq!(tier_for_value(&tiers, 10_000.0), "Monarch");
        assert_eq!(tier_for_value(&tiers, -5.0), "Peasant");
        assert_eq!(tier_for_value(&tiers, f64::NAN), "Peasant");
        assert_eq!(tier_for_value(&tiers, f64::INFINITY), "Monarch");
    }

    #[test]
    fn synthetic_board_is_deterministic_and_ordered() {
        let first = synthetic_entries(5);
        assert_eq!(first, synthetic_entries(5));
        assert!(
            first
                .windows(2)
                .all(|pair| pair[0].total_usd_value > pair[1].total_usd_value)
        );
    }

    #[test]
    fn verifies_profile_proofs() {
        let keypair = Keypair::new();
        let wallet = keypair.pubkey().to_string();
        let now = Utc::now();
        let message = profile_message(&wallet, now.timestamp());
        let proof = ProfileProof {
            signature: keypair.sign_message(message.as_bytes()).to_string(),
            message,
        };
        assert!(verify_profile_proof(&wallet, &proof, now).is_ok());
        assert!(
            verify_profile_proof(&wallet, &proof, now + chrono::Duration::minutes(6)).is_err()
        );
        let other = Keypair::new().pubkey().to_string();
        assert!(verify_profile_proof(&other, &proof, now).is_err());

        let forged = ProfileProof {
            signature: Keypair::new()
                .sign_message(proof.message.as_bytes())
                .to_string(),
            ..proof
        };
        assert!(verify_profile_proof(&wallet, &forged, now).is_err());
    }

    #[test]
    fn rejects_bad_profile_fields() {
        let long_name = ProfileUpdate {
            display_name: Some("x".repeat(40)),
            ..ProfileUpdate::default()
        };
        assert!(validate_profile(&long_name).is_err());
        let bad_link = ProfileUpdate {
            link: Some("javascript:alert(1)".into()),
            ..ProfileUpdate::default()
        };
        assert!(validate_profile(&bad_link).is_err());
        let fine = ProfileUpdate {
            display_name: Some("Sovereign".into()),
            link: Some("https://example.com".into()),
            ..ProfileUpdate::default()
        };
        assert!(validate_profile(&fine).is_ok());
    }
}
