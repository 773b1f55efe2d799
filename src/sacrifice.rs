use anyhow::Result;
use serde::Serialize;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;

use crate::interfaces::SacrificeCandidate;
use crate::rpc::{ChainRpc, TokenAccountInfo};

#[derive(Clone, Debug, PartialEq)]
pub struct SacrificePlan {
    pub selected: Vec<SacrificeCandidate>,
    pub total_reclaimed: u64,
    pub remaining: usize,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SacrificeSummary {
    pub candidates: usize,
    pub reclaimable_lamports: u64,
}

pub fn candidates(accounts: &[TokenAccountInfo]) -> Vec<SacrificeCandidate> {
    accounts
        .iter()
        .filter(|account| account.amount == 0)
        .map(|account| SacrificeCandidate {
            address: account.address,
            mint: account.mint.clone(),
            lamports: account.lamports,
        })
        .collect()
}

pub async fn scan(rpc: &dyn ChainRpc, owner: &Pubkey) -> Result<Vec<SacrificeCandidate>> {
    let accounts = rpc.token_accounts_by_owner(owner).await?;
    let found = candidates(&accounts);
    tracing::debug!(owner = %owner, accounts = accounts.len(), candidates = found.len(), "sacrifice scan");
    Ok(found)
}

pub fn summarize(candidates: &[SacrificeCandidate]) -> SacrificeSummary {
    SacrificeSummary {
        candidates: candidates.len(),
        reclaimable_lamports: candidates.iter().map(|candidate| candidate.lamports).sum(),
    }
}

pub fn plan(candidates: &[SacrificeCandidate], batch_limit: usize) -> SacrificePlan {
    let take = batch_limit.min(candidates.len());
    let selected = candidates[..take].to_vec();
    SacrificePlan {
        total_reclaimed: selected.iter().map(|candidate| candidate.lamports).sum(),
        remaining: candidates.len() - take,
        selected,
    }
}

pub fn memo_text(closed: usize) -> String {
    format!("SpendThrone sacrifice: closed {closed} token accounts")
}

pub fn build_instructions(
    plan: &SacrificePlan,
    owner: &Pubkey,
    treasury: &Pubkey,
) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::with_capacity(plan.selected.len() + 1);
    for candidate in &plan.selected {
        instructions.push(spl_token::instruction::close_account(
            &spl_token::id(),
            &candidate.address,
            treasury,
            owner,
            &[],
        )?);
    }
    instructions.push(spl_memo::build_memo(
        memo_text(plan.selected.len()).as_bytes(),
        &[owner],
    ));
    Ok(instructions)
}
