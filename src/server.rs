use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::map_response,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Deserialize;
use serde_json::{Value, json};
use solana_sdk::message::Message;
use solana_sdk::native_token::sol_to_lamports;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::transaction::Transaction;

use crate::engine::ThroneService;
use crate::errors::ThroneError;
use crate::interfaces::{ProfileProof, ProfileUpdate, StoreError};
use crate::leaderboard::DEFAULT_PAGE_SIZE;
use crate::settlement::transfer_instructions;

const MAX_LIMIT: usize = 1_000;

#[derive(Clone)]
pub struct AppState {
    service: Arc<ThroneService>,
    webhook_secret: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ThroneError> for ApiError {
    fn from(err: ThroneError) -> Self {
        let status = match &err {
            ThroneError::InvalidRequest(_)
            | ThroneError::InsufficientFunds { .. }
            | ThroneError::Store(StoreError::Invalid(_)) => StatusCode::BAD_REQUEST,
            ThroneError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ThroneError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ThroneError::Network(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(service: Arc<ThroneService>) -> Router {
    let secret = service.config().server.webhook_secret();
    router_with_secret(service, secret)
}

/// Webhook intake is mounted only when a shared secret is configured; the
/// events it receives are recorded without an on-chain lookup.
pub fn router_with_secret(service: Arc<ThroneService>, webhook_secret: Option<String>) -> Router {
    let webhook_secret = webhook_secret.filter(|secret| !secret.trim().is_empty());
    let mut routes = Router::new()
        .route(
            "/actions/join",
            get(join_action).post(join_transaction).options(preflight),
        )
        .route("/actions.json", get(actions_rules))
        .route("/referrals", get(referrals));
    if webhook_secret.is_some() {
        routes = routes.route("/webhooks/helius", post(helius_webhook));
    } else {
        tracing::warn!("no webhook secret configured, webhook intake disabled");
    }
    let state = AppState {
        service,
        webhook_secret,
    };
    routes
        .route("/leaderboard", get(leaderboard))
        .route("/leaderboard/:wallet", get(wallet_standing))
        .route("/leaderboard/:wallet/profile", post(update_profile))
        .route("/status", get(status))
        .layer(map_response(action_headers))
        .with_state(state)
}

async fn action_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET,POST,PUT,OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, Content-Encoding, Accept-Encoding"),
    );
    headers.insert("X-Action-Version", HeaderValue::from_static("2.1.3"));
    headers.insert(
        "X-Blockchain-Ids",
        HeaderValue::from_static("solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp"),
    );
    response
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Default, Deserialize)]
pub struct JoinQuery {
    pub amount: Option<String>,
    #[serde(rename = "ref")]
    pub referrer: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JoinBody {
    pub account: String,
}

fn parse_pubkey(value: &str, what: &str) -> ApiResult<Pubkey> {
    Pubkey::from_str(value.trim()).map_err(|_| ApiError::bad_request(format!("invalid {what}")))
}

fn parse_referrer(raw: Option<&str>) -> ApiResult<Option<Pubkey>> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| parse_pubkey(value, "referral address"))
        .transpose()
}

async fn join_action(
    State(state): State<AppState>,
    Query(query): Query<JoinQuery>,
) -> ApiResult<Json<Value>> {
    let server = &state.service.config().server;
    let referral = parse_referrer(query.referrer.as_deref())?
        .map(|referrer| format!("&ref={referrer}"))
        .unwrap_or_default();
    let mut actions: Vec<Value> = server
        .preset_amounts
        .iter()
        .map(|amount| {
            json!({
                "type": "transaction",
                "label": format!("{amount} SOL"),
                "href": format!("/actions/join?amount={amount}{referral}"),
            })
        })
        .collect();
    actions.push(json!({
        "type": "transaction",
        "label": "Pay tribute",
        "href": format!("/actions/join?amount={{amount}}{referral}"),
        "parameters": [{
            "name": "amount",
            "label": "Enter a SOL amount",
            "required": true,
        }],
    }));
    Ok(Json(json!({
        "type": "action",
        "icon": format!("{}/throne.png", server.public_url.trim_end_matches('/')),
        "title": "Join the SpendThrone",
        "description": "Send SOL to the treasury and climb the leaderboard.",
        "label": "Pay tribute",
        "links": { "actions": actions },
    })))
}

async fn join_transaction(
    State(state): State<AppState>,
    Query(query): Query<JoinQuery>,
    Json(body): Json<JoinBody>,
) -> ApiResult<Json<Value>> {
    let payer = parse_pubkey(&body.account, "account")?;
    let amount = query
        .amount
        .as_deref()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|amount| amount.is_finite() && *amount > 0.0)
        .ok_or_else(|| ApiError::bad_request("amount must be a positive number"))?;
    let lamports = sol_to_lamports(amount);
    if lamports == 0 {
        return Err(ApiError::bad_request("amount is below one lamport"));
    }
    let referrer = parse_referrer(query.referrer.as_deref())?;
    let service = &state.service;
    let instructions = transfer_instructions(
        &payer,
        service.treasury(),
        lamports,
        None,
        referrer.as_ref(),
    );
    let blockhash = service
        .rpc()
        .latest_blockhash()
        .await
        .map_err(|err| ApiError::from(ThroneError::Network(format!("{err:#}"))))?;
    let message = Message::new_with_blockhash(&instructions, Some(&payer), &blockhash.blockhash);
    let transaction = Transaction::new_unsigned(message);
    let bytes = bincode::serialize(&transaction)
        .map_err(|err| ApiError::from(ThroneError::Other(err.into())))?;
    tracing::info!(payer = %payer, lamports, referrer = ?referrer, "join transaction built");
    Ok(Json(json!({
        "transaction": STANDARD.encode(bytes),
        "message": format!("Tribute of {amount} SOL to the throne"),
    })))
}

async fn actions_rules() -> Json<Value> {
    Json(json!({
        "rules": [
            { "pathPattern": "/join", "apiPath": "/actions/join" },
            { "pathPattern": "/actions/**", "apiPath": "/actions/**" },
        ]
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralQuery {
    pub public_key: Option<String>,
}

async fn referrals(
    State(state): State<AppState>,
    Query(query): Query<ReferralQuery>,
) -> ApiResult<Json<Value>> {
    let Some(raw) = query.public_key.as_deref() else {
        return Err(ApiError::bad_request("publicKey is required"));
    };
    let referrer = parse_pubkey(raw, "publicKey")?;
    let stats = state.service.referrals(&referrer).await?;
    Ok(Json(json!(stats)))
}

fn authorized(headers: &HeaderMap, secret: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .is_some_and(|value| value == secret || value.strip_prefix("Bearer ") == Some(secret))
}

async fn helius_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    if !state
        .webhook_secret
        .as_deref()
        .is_some_and(|secret| authorized(&headers, secret))
    {
        tracing::warn!("webhook rejected: bad authorization");
        return Err(ApiError {
            status: StatusCode::UNAUTHORIZED,
            message: "unauthorized".into(),
        });
    }
    let events = match body {
        Value::Array(events) => events,
        Value::Object(event) => vec![Value::Object(event)],
        _ => return Err(ApiError::bad_request("expected an array of events")),
    };
    let summary = state.service.webhook().handle(&events).await;
    Ok(Json(json!(summary)))
}

#[derive(Debug, Default, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<usize>,
    pub wallet: Option<String>,
}

async fn leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_LIMIT);
    let page = state
        .service
        .leaderboard()
        .top(limit, query.wallet.as_deref())
        .await;
    Json(json!(page))
}

async fn wallet_standing(
    State(state): State<AppState>,
    Path(wallet): Path<String>,
) -> ApiResult<Json<Value>> {
    let standing = state.service.leaderboard().standing(&wallet).await;
    if standing.entry.is_none() {
        return Err(ApiError {
            status: StatusCode::NOT_FOUND,
            message: format!("{wallet} has not paid tribute"),
        });
    }
    Ok(Json(json!(standing)))
}

#[derive(Debug, Deserialize)]
pub struct ProfileBody {
    pub update: ProfileUpdate,
    pub proof: ProfileProof,
}

async fn update_profile(
    State(state): State<AppState>,
    Path(wallet): Path<String>,
    Json(body): Json<ProfileBody>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .service
        .leaderboard()
        .update_profile(&wallet, &body.update, &body.proof)
        .await?;
    Ok(Json(json!(outcome)))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(state.service.status())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_accepts_raw_and_bearer_secret() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("s3cret"));
        assert!(authorized(&headers, "s3cret"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert!(authorized(&headers, "s3cret"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("other"));
        assert!(!authorized(&headers, "s3cret"));
        assert!(!authorized(&HeaderMap::new(), "s3cret"));
    }

    #[test]
    fn empty_referrer_is_ignored() {
        assert!(matches!(parse_referrer(Some("  ")), Ok(None)));
        assert!(parse_referrer(Some("nope")).is_err());
        let key = Pubkey::new_unique().to_string();
        assert!(matches!(parse_referrer(Some(&key)), Ok(Some(_))));
    }
}
