mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration, Utc};
use common::harness;
use solana_sdk::pubkey::Pubkey;
use spendthrone::interfaces::LeaderboardStore;
use spendthrone::leaderboard::{DEFAULT_PAGE_SIZE, ReadSource};
use spendthrone::recorder::Deposit;

fn deposit(wallet: &str, signature: String, usd: f64, minutes_ago: i64) -> Deposit {
    Deposit {
        wallet: wallet.to_string(),
        amount: usd / 200.0,
        asset: "SOL".into(),
        signature,
        usd_value: usd,
        message: None,
        link: None,
        timestamp: Utc::now() - Duration::minutes(minutes_ago),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn totals_only_grow_under_concurrent_deposits() {
    let harness = harness();
    let wallets: Vec<String> = (0..4).map(|_| Pubkey::new_unique().to_string()).collect();
    let per_wallet = 25;
    let done = Arc::new(AtomicBool::new(false));

    let watcher = {
        let store = harness.store.clone();
        let wallets = wallets.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut last: HashMap<String, (f64, u64)> = HashMap::new();
            while !done.load(Ordering::SeqCst) {
                for wallet in &wallets {
                    let Some(entry) = store.inner.entry(wallet).await.unwrap() else {
                        continue;
                    };
                    let seen = last.entry(wallet.clone()).or_insert((0.0, 0));
                    assert!(entry.total_usd_value >= seen.0, "{wallet} total went down");
                    assert!(entry.transaction_count >= seen.1, "{wallet} count went down");
                    *seen = (entry.total_usd_value, entry.transaction_count);
                }
                tokio::task::yield_now().await;
            }
        })
    };

    let mut writers = Vec::new();
    for round in 0..per_wallet {
        for (index, wallet) in wallets.iter().enumerate() {
            let recorder = harness.service.recorder();
            let deposit = deposit(
                wallet,
                format!("sig-{index}-{round}"),
                (index + 1) as f64 * 10.0,
                0,
            );
            writers.push(tokio::spawn(async move { recorder.record(&deposit).await }));
        }
    }
    // Replays of already recorded signatures race the first writes.
    for (index, wallet) in wallets.iter().enumerate() {
        let recorder = harness.service.recorder();
        let deposit = deposit(wallet, format!("sig-{index}-0"), (index + 1) as f64 * 10.0, 0);
        writers.push(tokio::spawn(async move { recorder.record(&deposit).await }));
    }
    for writer in writers {
        assert!(writer.await.unwrap().recorded);
    }
    done.store(true, Ordering::SeqCst);
    watcher.await.unwrap();

    for (index, wallet) in wallets.iter().enumerate() {
        let entry = harness.store.inner.entry(wallet).await.unwrap().unwrap();
        assert_eq!(entry.total_usd_value, (index + 1) as f64 * 10.0 * per_wallet as f64);
        assert_eq!(entry.transaction_count, per_wallet as u64);
    }
}

#[tokio::test]
async fn live_ranks_count_strictly_greater_totals() {
    let harness = harness();
    let recorder = harness.service.recorder();
    let totals = [500.0, 300.0, 300.0, 100.0, 300.0, 100.0, 50.0];
    let wallets: Vec<String> = totals
        .iter()
        .map(|_| Pubkey::new_unique().to_string())
        .collect();
    for (index, (wallet, usd)) in wallets.iter().zip(totals).enumerate() {
        let outcome = recorder
            .record(&deposit(wallet, format!("rank-{index}"), usd, index as i64))
            .await;
        assert!(outcome.recorded);
    }

    let page = harness.service.leaderboard().top(DEFAULT_PAGE_SIZE, None).await;
    assert_eq!(page.source, ReadSource::Live);
    assert_eq!(page.entries.len(), totals.len());
    let ranks: Vec<u64> = page.entries.iter().map(|ranked| ranked.rank).collect();
    assert_eq!(ranks, [1, 2, 2, 2, 5, 5, 7]);

    for ranked in &page.entries {
        let greater = totals
            .iter()
            .filter(|total| **total > ranked.entry.total_usd_value)
            .count() as u64;
        assert_eq!(ranked.rank, greater + 1);

        let standing = harness
            .service
            .leaderboard()
            .standing(&ranked.entry.wallet_address)
            .await;
        assert_eq!(standing.source, ReadSource::Live);
        assert_eq!(standing.entry.unwrap().rank, ranked.rank);
    }

    // Tied totals list the earliest activity first.
    let tied: Vec<&str> = page.entries[1..4]
        .iter()
        .map(|ranked| ranked.entry.wallet_address.as_str())
        .collect();
    assert_eq!(tied, [wallets[4].as_str(), wallets[2].as_str(), wallets[1].as_str()]);
}

#[tokio::test]
async fn short_pages_do_not_replace_the_snapshot() {
    let harness = harness();
    let recorder = harness.service.recorder();
    for index in 0..6 {
        let wallet = Pubkey::new_unique().to_string();
        recorder
            .record(&deposit(&wallet, format!("snap-{index}"), 10.0 * (index + 1) as f64, 0))
            .await;
    }
    let leaderboard = harness.service.leaderboard();

    assert_eq!(leaderboard.top(3, None).await.entries.len(), 3);
    assert!(harness.ledger.snapshot().is_none());

    assert_eq!(leaderboard.top(DEFAULT_PAGE_SIZE, None).await.entries.len(), 6);
    leaderboard.top(2, None).await;
    assert_eq!(harness.ledger.snapshot().unwrap().entries.len(), 6);

    harness.store.set_offline(true);
    let degraded = leaderboard.top(DEFAULT_PAGE_SIZE, None).await;
    assert_eq!(degraded.source, ReadSource::Snapshot);
    assert_eq!(degraded.entries.len(), 6);
}
