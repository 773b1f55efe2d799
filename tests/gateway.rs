use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use spendthrone::config::GatewayConfig;
use spendthrone::gateway::{GatewayError, RequestGateway};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

fn gateway(max_concurrent: usize, requests_per_second: u32) -> Arc<RequestGateway> {
    Arc::new(RequestGateway::new(&GatewayConfig {
        max_concurrent,
        requests_per_second,
        max_retries: 3,
        base_backoff_ms: 500,
        max_backoff_ms: 10_000,
        semaphore_retry_ms: 50,
    }))
}

#[tokio::test(start_paused = true)]
async fn in_flight_calls_never_exceed_capacity() {
    let gateway = gateway(3, 1_000);
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for index in 0..20 {
        let gateway = gateway.clone();
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            gateway
                .execute(&format!("test:slot:{index}"), || {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(100)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(index)
                    }
                })
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(gateway.status().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn starts_per_second_stay_within_budget() {
    let gateway = gateway(10, 4);
    let starts = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for _ in 0..12 {
        let gateway = gateway.clone();
        let starts = starts.clone();
        handles.push(tokio::spawn(async move {
            gateway
                .execute("test:rate", || {
                    let starts = starts.clone();
                    async move {
                        starts.lock().await.push(Instant::now());
                        Ok(())
                    }
                })
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    let starts = starts.lock().await.clone();
    assert_eq!(starts.len(), 12);
    for start in &starts {
        let window = starts
            .iter()
            .filter(|other| **other >= *start && other.duration_since(*start) < Duration::from_secs(1))
            .count();
        assert!(window <= 4, "{window} starts inside one second");
    }
    let first = starts.iter().min().copied().unwrap();
    let last = starts.iter().max().copied().unwrap();
    assert!(last.duration_since(first) >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn retries_back_off_without_holding_a_slot() {
    let gateway = gateway(1, 1_000);
    let flaky_calls = Arc::new(AtomicUsize::new(0));
    let flaky = {
        let gateway = gateway.clone();
        let flaky_calls = flaky_calls.clone();
        tokio::spawn(async move {
            gateway
                .execute("test:flaky", || {
                    let attempt = flaky_calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt == 0 {
                            Err(anyhow::anyhow!("service unavailable"))
                        } else {
                            Ok("flaky")
                        }
                    }
                })
                .await
        })
    };
    sleep(Duration::from_millis(10)).await;
    let started = Instant::now();
    let quick = gateway
        .execute("test:quick", || async { Ok("quick") })
        .await
        .unwrap();
    assert_eq!(quick, "quick");
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(flaky.await.unwrap().unwrap(), "flaky");
    let status = gateway.status();
    assert_eq!(status.calls["test:flaky"].retried, 1);
    assert_eq!(status.calls["test:quick"].succeeded, 1);
    assert_eq!(status.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn clear_queue_rejects_waiting_callers() {
    let gateway = gateway(1, 1_000);
    let holder = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway
                .execute("test:holder", || async {
                    sleep(Duration::from_secs(10)).await;
                    Ok(())
                })
                .await
        })
    };
    sleep(Duration::from_millis(10)).await;
    let waiter = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.execute("test:waiter", || async { Ok(()) }).await })
    };
    sleep(Duration::from_millis(100)).await;
    assert_eq!(gateway.status().queued, 1);
    gateway.clear_queue();
    assert!(matches!(
        waiter.await.unwrap(),
        Err(GatewayError::Cancelled { .. })
    ));
    assert!(holder.await.unwrap().is_ok());
}
