use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde_json::{Value, json};
use solana_sdk::hash::Hash;
use solana_sdk::instruction::{AccountMeta, CompiledInstruction, Instruction};
use solana_sdk::message::{Message, MessageHeader, VersionedMessage};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::system_instruction;
use solana_sdk::transaction::VersionedTransaction;

use crate::config::SwapConfig;
use crate::gateway::{RequestGateway, check_status};

#[derive(Clone, Debug, PartialEq)]
pub struct QuoteRequest {
    pub input_mint: Pubkey,
    pub output_mint: Pubkey,
    pub amount: u64,
    pub slippage_bps: u16,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SwapQuote {
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount: u64,
    pub out_amount: u64,
    pub slippage_bps: u16,
    pub price_impact_pct: f64,
    pub raw: Value,
}

fn amount_field(value: &Value, field: &str) -> Result<u64> {
    match &value[field] {
        Value::String(text) => Ok(text.parse()?),
        Value::Number(number) => number
            .as_u64()
            .ok_or_else(|| anyhow!("{field} is not an unsigned amount")),
        _ => Err(anyhow!("quote missing {field}")),
    }
}

pub fn parse_quote(raw: Value) -> Result<SwapQuote> {
    if let Some(error) = raw.get("error").and_then(|value| value.as_str()) {
        bail!("aggregator rejected quote: {error}");
    }
    Ok(SwapQuote {
        input_mint: raw["inputMint"].as_str().unwrap_or_default().to_string(),
        output_mint: raw["outputMint"].as_str().unwrap_or_default().to_string(),
        in_amount: amount_field(&raw, "inAmount")?,
        out_amount: amount_field(&raw, "outAmount")?,
        slippage_bps: raw["slippageBps"].as_u64().unwrap_or_default() as u16,
        price_impact_pct: match &raw["priceImpactPct"] {
            Value::String(text) => text.parse().unwrap_or_default(),
            value => value.as_f64().unwrap_or_default(),
        },
        raw,
    })
}

#[async_trait]
pub trait SwapAggregator: Send + Sync {
    async fn quote(&self, request: &QuoteRequest) -> Result<SwapQuote>;

    async fn swap_transaction(
        &self,
        quote: &SwapQuote,
        user: &Pubkey,
        destination: &Pubkey,
    ) -> Result<VersionedTransaction>;
}

pub struct JupiterClient {
    http: reqwest::Client,
    gateway: Arc<RequestGateway>,
    api_url: String,
    platform_fee_bps: u16,
}

impl JupiterClient {
    pub fn new(http: reqwest::Client, gateway: Arc<RequestGateway>, config: &SwapConfig) -> Self {
        Self {
            http,
            gateway,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            platform_fee_bps: config.platform_fee_bps,
        }
    }
}

#[async_trait]
impl SwapAggregator for JupiterClient {
    async fn quote(&self, request: &QuoteRequest) -> Result<SwapQuote> {
        let url = format!("{}/quote", self.api_url);
        let params = [
            ("inputMint", request.input_mint.to_string()),
            ("outputMint", request.output_mint.to_string()),
            ("amount", request.amount.to_string()),
            ("slippageBps", request.slippage_bps.to_string()),
            ("platformFeeBps", self.platform_fee_bps.to_string()),
            ("asLegacyTransaction", "true".to_string()),
        ];
        let raw: Value = self
            .gateway
            .execute("swap:quote", || {
                let request = self.http.get(&url).query(&params);
                async move {
                    let response = check_status(request.send().await?).await?;
                    Ok(response.json::<Value>().await?)
                }
            })
            .await?;
        parse_quote(raw)
    }

    async fn swap_transaction(
        &self,
        quote: &SwapQuote,
        user: &Pubkey,
        destination: &Pubkey,
    ) -> Result<VersionedTransaction> {
        let url = format!("{}/swap", self.api_url);
        let body = json!({
            "quoteResponse": quote.raw,
            "userPublicKey": user.to_string(),
            "wrapAndUnwrapSol": true,
            "feeAccount": destination.to_string(),
            "destinationTokenAccount": destination.to_string(),
            "asLegacyTransaction": true,
            "dynamicComputeUnitLimit": true,
        });
        let response: Value = self
            .gateway
            .execute("swap:build", || {
                let request = self.http.post(&url).json(&body);
                async move {
                    let response = check_status(request.send().await?).await?;
                    Ok(response.json::<Value>().await?)
                }
            })
            .await?;
        let encoded = response
            .get("swapTransaction")
            .and_then(|value| value.as_str())
            .ok_or_else(|| anyhow!("aggregator returned no swap transaction"))?;
        decode_transaction(encoded)
    }
}

pub fn decode_transaction(encoded: &str) -> Result<VersionedTransaction> {
    let bytes = BASE64.decode(encoded.trim())?;
    Ok(bincode::deserialize(&bytes)?)
}

fn is_signer(header: &MessageHeader, index: usize) -> bool {
    index < header.num_required_signatures as usize
}

fn is_writable(header: &MessageHeader, key_count: usize, index: usize) -> bool {
    let signers = header.num_required_signatures as usize;
    if index < signers {
        index < signers.saturating_sub(header.num_readonly_signed_accounts as usize)
    } else {
        index < key_count.saturating_sub(header.num_readonly_unsigned_accounts as usize)
    }
}

fn decompile(
    header: &MessageHeader,
    keys: &[Pubkey],
    instructions: &[CompiledInstruction],
) -> Result<Vec<Instruction>> {
    let key = |index: u8| {
        keys.get(index as usize)
            .copied()
            .ok_or_else(|| anyhow!("instruction references missing account {index}"))
    };
    instructions
        .iter()
        .map(|compiled| {
            let accounts = compiled
                .accounts
                .iter()
                .map(|&index| {
                    Ok(AccountMeta {
                        pubkey: key(index)?,
                        is_signer: is_signer(header, index as usize),
                        is_writable: is_writable(header, keys.len(), index as usize),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Instruction {
                program_id: key(compiled.program_id_index)?,
                accounts,
                data: compiled.data.clone(),
            })
        })
        .collect()
}

pub fn append_instructions(
    transaction: &VersionedTransaction,
    payer: &Pubkey,
    extra: Vec<Instruction>,
) -> Result<VersionedMessage> {
    let (header, keys, instructions, blockhash): (_, _, _, Hash) = match &transaction.message {
        VersionedMessage::Legacy(message) => (
            message.header,
            message.account_keys.as_slice(),
            message.instructions.as_slice(),
            message.recent_blockhash,
        ),
        VersionedMessage::V0(message) => {
            if !message.address_table_lookups.is_empty() {
                bail!("swap transaction uses address lookup tables");
            }
            (
                message.header,
                message.account_keys.as_slice(),
                message.instructions.as_slice(),
                message.recent_blockhash,
            )
        }
    };
    let mut rebuilt = decompile(&header, keys, instructions)?;
    rebuilt.extend(extra);
    Ok(VersionedMessage::Legacy(Message::new_with_blockhash(
        &rebuilt,
        Some(payer),
        &blockhash,
    )))
}

pub fn append_fee_transfer(
    transaction: &VersionedTransaction,
    payer: &Pubkey,
    treasury: &Pubkey,
    lamports: u64,
) -> Result<VersionedMessage> {
    append_instructions(
        transaction,
        payer,
        vec![system_instruction::transfer(payer, treasury, lamports)],
    )
}
