use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use solana_account_decoder::UiAccountData;
use solana_account_decoder::parse_token::TokenAccountType;
use solana_client::client_error::{ClientError, ClientErrorKind, Result as ClientResult};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_client::{GetConfirmedSignaturesForAddress2Config, RpcClientConfig};
use solana_client::rpc_config::{RpcSendTransactionConfig, RpcTransactionConfig};
use solana_client::rpc_request::{RpcError, RpcRequest, RpcResponseErrorData, TokenAccountsFilter};
use solana_client::rpc_response::{RpcConfirmedTransactionStatusWithSignature, RpcKeyedAccount};
use solana_client::rpc_sender::{RpcSender, RpcTransportStats};
use solana_sdk::commitment_config::{CommitmentConfig, CommitmentLevel};
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use solana_transaction_status::option_serializer::OptionSerializer;
use solana_transaction_status::{
    EncodedConfirmedTransactionWithStatusMeta, TransactionStatus, UiTransactionEncoding,
};
use thiserror::Error;

use crate::gateway::{GatewayError, RequestGateway, check_status};
use crate::pool::ConnectionPool;

#[derive(Clone, Debug, PartialEq)]
pub struct LatestBlockhash {
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TokenAccountInfo {
    pub address: Pubkey,
    pub mint: String,
    pub owner: String,
    pub amount: u64,
    pub decimals: u8,
    pub lamports: u64,
}

#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn latest_blockhash(&self) -> Result<LatestBlockhash>;
    async fn send_transaction(&self, transaction: &VersionedTransaction) -> Result<Signature>;
    async fn signature_status(&self, signature: &Signature) -> Result<Option<TransactionStatus>>;
    async fn balance(&self, address: &Pubkey) -> Result<u64>;
    async fn token_accounts_by_owner(&self, owner: &Pubkey) -> Result<Vec<TokenAccountInfo>>;
    async fn signatures_for_address(
        &self,
        address: &Pubkey,
        limit: usize,
    ) -> Result<Vec<RpcConfirmedTransactionStatusWithSignature>>;
    async fn transaction(
        &self,
        signature: &Signature,
    ) -> Result<Option<EncodedConfirmedTransactionWithStatusMeta>>;
}

pub fn confirmed_status(status: &TransactionStatus) -> bool {
    status.satisfies_commitment(CommitmentConfig::confirmed())
}

#[derive(Debug, Error)]
#[error("rpc error {code}: {message}")]
struct JsonRpcFailure {
    code: i64,
    message: String,
}

/// Carries every JSON-RPC call through the request gateway. The endpoint is
/// read from the pool on each attempt, so a failover chosen by the health
/// monitor applies to the next retry. `sendTransaction` is never retried.
pub struct GatewaySender {
    http: reqwest::Client,
    pool: Arc<ConnectionPool>,
    gateway: Arc<RequestGateway>,
    request_id: AtomicU64,
}

impl GatewaySender {
    pub fn new(
        http: reqwest::Client,
        pool: Arc<ConnectionPool>,
        gateway: Arc<RequestGateway>,
    ) -> Self {
        Self {
            http,
            pool,
            gateway,
            request_id: AtomicU64::new(1),
        }
    }
}

fn client_error(request: RpcRequest, err: GatewayError) -> ClientError {
    let failure = match &err {
        GatewayError::Failed { error, .. } | GatewayError::Exhausted { error, .. } => error
            .chain()
            .find_map(|cause| cause.downcast_ref::<JsonRpcFailure>()),
        _ => None,
    };
    let kind = match failure {
        Some(failure) => ClientErrorKind::RpcError(RpcError::RpcResponseError {
            code: failure.code,
            message: failure.message.clone(),
            data: RpcResponseErrorData::Empty,
        }),
        None => ClientErrorKind::Custom(err.to_string()),
    };
    ClientError::new_with_request(kind, request)
}

#[async_trait]
impl RpcSender for GatewaySender {
    async fn send(&self, request: RpcRequest, params: Value) -> ClientResult<Value> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = request.build_request_json(id, params);
        let call_site = format!("rpc:{request}");
        let send = || {
            let url = self.pool.current_url();
            let call = self.http.post(url.as_ref()).json(&body);
            async move {
                let response = check_status(call.send().await?).await?;
                let mut payload: Value = response.json().await?;
                if let Some(error) = payload.get("error") {
                    let failure = JsonRpcFailure {
                        code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                        message: error
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown rpc error")
                            .to_string(),
                    };
                    return Err(anyhow::Error::new(failure).context(format!("via {url}")));
                }
                payload
                    .get_mut("result")
                    .map(Value::take)
                    .ok_or_else(|| anyhow!("rpc response from {url} missing result"))
            }
        };
        let result = if matches!(request, RpcRequest::SendTransaction) {
            self.gateway.execute_once(&call_site, send).await
        } else {
            self.gateway.execute(&call_site, send).await
        };
        result.map_err(|err| client_error(request, err))
    }

    fn get_transport_stats(&self) -> RpcTransportStats {
        RpcTransportStats::default()
    }

    fn url(&self) -> String {
        self.pool.current_url().to_string()
    }
}

pub struct HttpChainRpc {
    client: RpcClient,
}

impl HttpChainRpc {
    pub fn new(
        http: reqwest::Client,
        pool: Arc<ConnectionPool>,
        gateway: Arc<RequestGateway>,
    ) -> Self {
        let sender = GatewaySender::new(http, pool, gateway);
        Self {
            client: RpcClient::new_sender(
                sender,
                RpcClientConfig::with_commitment(CommitmentConfig::confirmed()),
            ),
        }
    }
}

#[async_trait]
impl ChainRpc for HttpChainRpc {
    async fn latest_blockhash(&self) -> Result<LatestBlockhash> {
        let (blockhash, last_valid_block_height) = self
            .client
            .get_latest_blockhash_with_commitment(CommitmentConfig::confirmed())
            .await
            .context("getLatestBlockhash")?;
        Ok(LatestBlockhash {
            blockhash,
            last_valid_block_height,
        })
    }

    async fn send_transaction(&self, transaction: &VersionedTransaction) -> Result<Signature> {
        let config = RpcSendTransactionConfig {
            skip_preflight: false,
            preflight_commitment: Some(CommitmentLevel::Confirmed),
            encoding: Some(UiTransactionEncoding::Base64),
            max_retries: Some(5),
            ..RpcSendTransactionConfig::default()
        };
        Ok(self
            .client
            .send_transaction_with_config(transaction, config)
            .await
            .context("sendTransaction")?)
    }

    async fn signature_status(&self, signature: &Signature) -> Result<Option<TransactionStatus>> {
        let response = self
            .client
            .get_signature_statuses(&[*signature])
            .await
            .context("getSignatureStatuses")?;
        Ok(response.value.into_iter().next().flatten())
    }

    async fn balance(&self, address: &Pubkey) -> Result<u64> {
        let response = self
            .client
            .get_balance_with_commitment(address, CommitmentConfig::confirmed())
            .await
            .context("getBalance")?;
        Ok(response.value)
    }

    async fn token_accounts_by_owner(&self, owner: &Pubkey) -> Result<Vec<TokenAccountInfo>> {
        let response = self
            .client
            .get_token_accounts_by_owner_with_commitment(
                owner,
                TokenAccountsFilter::ProgramId(spl_token::id()),
                CommitmentConfig::confirmed(),
            )
            .await
            .context("getTokenAccountsByOwner")?;
        response.value.iter().map(token_account).collect()
    }

    async fn signatures_for_address(
        &self,
        address: &Pubkey,
        limit: usize,
    ) -> Result<Vec<RpcConfirmedTransactionStatusWithSignature>> {
        let config = GetConfirmedSignaturesForAddress2Config {
            limit: Some(limit),
            commitment: Some(CommitmentConfig::confirmed()),
            ..GetConfirmedSignaturesForAddress2Config::default()
        };
        Ok(self
            .client
            .get_signatures_for_address_with_config(address, config)
            .await
            .context("getSignaturesForAddress")?)
    }

    async fn transaction(
        &self,
        signature: &Signature,
    ) -> Result<Option<EncodedConfirmedTransactionWithStatusMeta>> {
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            max_supported_transaction_version: Some(0),
        };
        // Unknown signatures come back as null, which the typed helper
        // reports as a decode error.
        Ok(self
            .client
            .send::<Option<EncodedConfirmedTransactionWithStatusMeta>>(
                RpcRequest::GetTransaction,
                json!([signature.to_string(), config]),
            )
            .await
            .context("getTransaction")?)
    }
}

pub fn token_account(keyed: &RpcKeyedAccount) -> Result<TokenAccountInfo> {
    let UiAccountData::Json(parsed) = &keyed.account.data else {
        return Err(anyhow!("token account {} is not jsonParsed", keyed.pubkey));
    };
    let TokenAccountType::Account(account) =
        serde_json::from_value::<TokenAccountType>(parsed.parsed.clone())
            .with_context(|| format!("token account {}", keyed.pubkey))?
    else {
        return Err(anyhow!("{} is not a token account", keyed.pubkey));
    };
    Ok(TokenAccountInfo {
        address: Pubkey::from_str(&keyed.pubkey)?,
        amount: account.token_amount.amount.parse().unwrap_or_default(),
        decimals: account.token_amount.decimals,
        mint: account.mint,
        owner: account.owner,
        lamports: keyed.account.lamports,
    })
}

pub fn lamports_received(
    transaction: &EncodedConfirmedTransactionWithStatusMeta,
    address: &Pubkey,
) -> u64 {
    let (Some(decoded), Some(meta)) = (
        transaction.transaction.transaction.decode(),
        transaction.transaction.meta.as_ref(),
    ) else {
        return 0;
    };
    let mut keys: Vec<String> = decoded
        .message
        .static_account_keys()
        .iter()
        .map(Pubkey::to_string)
        .collect();
    if let OptionSerializer::Some(loaded) = &meta.loaded_addresses {
        keys.extend(loaded.writable.iter().cloned());
        keys.extend(loaded.readonly.iter().cloned());
    }
    let address = address.to_string();
    let Some(index) = keys.iter().position(|key| *key == address) else {
        return 0;
    };
    match (meta.pre_balances.get(index), meta.post_balances.get(index)) {
        (Some(pre), Some(post)) => post.saturating_sub(*pre),
        _ => 0,
    }
}
