use std::str::FromStr;

use anyhow::Result;
use futures::{StreamExt, stream};
use serde::Serialize;
use solana_sdk::native_token::lamports_to_sol;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;

use crate::rpc::{ChainRpc, lamports_received};
use crate::settlement::referral_memo;

const FETCH_CONCURRENCY: usize = 4;

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReferralStats {
    pub referral_count: usize,
    pub total_referral_volume: f64,
    pub earnings: f64,
}

pub fn memo_mentions(memo: &str, referrer: &Pubkey) -> bool {
    let wanted = referral_memo(referrer);
    memo.split("; ").any(|part| {
        let part = part.trim();
        let body = match part.strip_prefix('[') {
            Some(rest) => rest.split_once("] ").map_or(part, |(_, body)| body),
            None => part,
        };
        body == wanted
    })
}

pub async fn referral_stats(
    rpc: &dyn ChainRpc,
    treasury: &Pubkey,
    referrer: &Pubkey,
    scan_limit: usize,
    share_pct: f64,
) -> Result<ReferralStats> {
    let signatures = rpc.signatures_for_address(treasury, scan_limit).await?;
    let referred: Vec<Signature> = signatures
        .into_iter()
        .filter(|info| info.err.is_none())
        .filter(|info| {
            info.memo
                .as_deref()
                .is_some_and(|memo| memo_mentions(memo, referrer))
        })
        .filter_map(|info| match Signature::from_str(&info.signature) {
            Ok(signature) => Some(signature),
            Err(err) => {
                tracing::debug!(signature = %info.signature, error = %err, "unparseable signature");
                None
            }
        })
        .collect();
    let treasury = *treasury;
    let received: Vec<u64> = stream::iter(referred.clone())
        .map(move |signature| async move {
            match rpc.transaction(&signature).await {
                Ok(Some(transaction)) => lamports_received(&transaction, &treasury),
                Ok(None) => 0,
                Err(err) => {
                    tracing::debug!(signature = %signature, error = %format!("{err:#}"), "referral transaction unavailable");
                    0
                }
            }
        })
        .buffer_unordered(FETCH_CONCURRENCY)
        .collect()
        .await;
    let volume = lamports_to_sol(received.iter().sum());
    Ok(ReferralStats {
        referral_count: referred.len(),
        total_referral_volume: volume,
        earnings: volume * share_pct / 100.0,
    })
}
