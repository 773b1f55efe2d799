mod common;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use common::{Harness, TREASURY, harness, treasury};
use serde_json::{Value, json};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::transaction::Transaction;
use spendthrone::interfaces::LeaderboardStore;
use spendthrone::server::{router, router_with_secret};
use tower::ServiceExt;

fn app(harness: &Harness) -> Router {
    router_with_secret(harness.service.clone(), None)
}

async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn join_descriptor_lists_presets_and_carries_the_referrer() {
    let harness = harness();
    let referrer = Pubkey::new_unique();
    let response = app(&harness)
        .oneshot(get(&format!("/actions/join?ref={referrer}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert!(response.headers().contains_key("x-action-version"));
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();

    let actions = body["links"]["actions"].as_array().unwrap();
    assert_eq!(actions.len(), 4);
    assert!(
        actions
            .iter()
            .all(|action| action["href"].as_str().unwrap().ends_with(&format!("&ref={referrer}")))
    );
    assert_eq!(actions[3]["parameters"][0]["name"], "amount");
}

#[tokio::test]
async fn join_post_returns_an_unsigned_transfer_to_the_treasury() {
    let harness = harness();
    let payer = Pubkey::new_unique();
    let referrer = Pubkey::new_unique();
    let (status, body) = call(
        app(&harness),
        post_json(
            &format!("/actions/join?amount=0.25&ref={referrer}"),
            json!({"account": payer.to_string()}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let bytes = STANDARD
        .decode(body["transaction"].as_str().unwrap())
        .unwrap();
    let transaction: Transaction = bincode::deserialize(&bytes).unwrap();
    assert_eq!(transaction.message.account_keys[0], payer);
    assert!(transaction.message.account_keys.contains(&treasury()));
    assert_eq!(transaction.message.recent_blockhash, harness.rpc.blockhash);
    assert!(
        transaction
            .signatures
            .iter()
            .all(|signature| *signature == Default::default())
    );
    // Transfer plus referral memo.
    assert_eq!(transaction.message.instructions.len(), 2);
    assert_eq!(harness.rpc.sent_count().await, 0);
}

#[tokio::test]
async fn join_post_rejects_bad_input() {
    let harness = harness();
    let account = json!({"account": Pubkey::new_unique().to_string()});
    for uri in ["/actions/join", "/actions/join?amount=-1", "/actions/join?amount=abc"] {
        let (status, body) = call(app(&harness), post_json(uri, account.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert!(body["message"].is_string());
    }
    let (status, _) = call(
        app(&harness),
        post_json("/actions/join?amount=1", json!({"account": "not-a-key"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn actions_rules_map_the_join_path() {
    let harness = harness();
    let (status, body) = call(app(&harness), get("/actions.json")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rules"][0]["apiPath"], "/actions/join");
}

#[tokio::test]
async fn leaderboard_routes_report_standing() {
    let harness = harness();
    let wallet = Pubkey::new_unique().to_string();
    let mut deposit = spendthrone::recorder::Deposit {
        wallet: wallet.clone(),
        amount: 1.0,
        asset: "SOL".into(),
        signature: "route-sig".into(),
        usd_value: 1_200.0,
        message: Some("hail".into()),
        link: None,
        timestamp: chrono::Utc::now(),
    };
    assert!(harness.service.recorder().record(&deposit).await.recorded);
    deposit.signature = "route-sig-2".into();
    deposit.wallet = Pubkey::new_unique().to_string();
    deposit.usd_value = 5.0;
    harness.service.recorder().record(&deposit).await;

    let (status, body) = call(app(&harness), get("/leaderboard?limit=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "live");
    assert_eq!(body["entries"].as_array().unwrap().len(), 1);
    assert_eq!(body["entries"][0]["wallet_address"], wallet.as_str());
    assert_eq!(body["entries"][0]["rank"], 1);

    let (status, body) = call(app(&harness), get(&format!("/leaderboard/{wallet}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entry"]["total_usd_value"], 1_200.0);

    let stranger = Pubkey::new_unique();
    let (status, _) = call(app(&harness), get(&format!("/leaderboard/{stranger}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn referrals_require_a_public_key() {
    let harness = harness();
    let (status, _) = call(app(&harness), get("/referrals")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let referrer = Pubkey::new_unique();
    let (status, body) = call(
        app(&harness),
        get(&format!("/referrals?publicKey={referrer}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["referralCount"], 0);
}

#[tokio::test]
async fn webhook_checks_the_shared_secret() {
    let harness = harness();
    let sender = Pubkey::new_unique().to_string();
    let event = json!({
        "signature": "hooked",
        "nativeTransfers": [
            {"fromUserAccount": sender, "toUserAccount": TREASURY, "amount": 100_000_000u64}
        ]
    });
    let secured = router_with_secret(harness.service.clone(), Some("s3cret".into()));

    let (status, _) = call(
        secured.clone(),
        post_json("/webhooks/helius", json!([event.clone()])),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::post("/webhooks/helius")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::from(event.to_string()))
        .unwrap();
    let (status, body) = call(secured, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], 1);
    assert_eq!(body["recorded"], 1);
}

#[tokio::test]
async fn webhook_is_not_mounted_without_a_secret() {
    let harness = harness();
    let sender = Pubkey::new_unique().to_string();
    let event = json!({
        "signature": "forged",
        "nativeTransfers": [
            {"fromUserAccount": sender, "toUserAccount": TREASURY, "amount": 100_000_000u64}
        ]
    });
    for secret in [None, Some(String::new())] {
        let (status, _) = call(
            router_with_secret(harness.service.clone(), secret),
            post_json("/webhooks/helius", json!([event.clone()])),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
    assert!(harness.store.inner.entry(&sender).await.unwrap().is_none());
}

#[tokio::test]
async fn status_reports_the_treasury() {
    let harness = harness();
    let (status, body) = call(router(harness.service.clone()), get("/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["treasury"], TREASURY);
    assert_eq!(body["pending_local_deposits"], 0);
}
