use std::sync::Arc;
use std::time::Duration;
use tripwire::rate_limit::{Decision, DenyReason, RateLimiter, TokenBucket, TokenBucketConfig};
use tripwire::{CounterStore, InMemoryCounterStore, ManualClock};

fn bucket(rate: u64, capacity: u64) -> (TokenBucket, InMemoryCounterStore, ManualClock) {
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let store = InMemoryCounterStore::new().with_clock(clock.clone());
    let config = TokenBucketConfig::new("gateway", rate, capacity).unwrap();
    let bucket = TokenBucket::new(Arc::new(store.clone()), config).with_clock(clock.clone());
    (bucket, store, clock)
}

async fn admitted(bucket: &TokenBucket, attempts: usize) -> usize {
    let mut allowed = 0;
    for _ in 0..attempts {
        if bucket.allow().await {
            allowed += 1;
        }
    }
    allowed
}

#[tokio::test]
async fn burst_then_one_per_second() {
    let (bucket, _store, clock) = bucket(1, 5);

    assert_eq!(admitted(&bucket, 5).await, 5);
    assert!(!bucket.allow().await);

    clock.advance(Duration::from_millis(999));
    assert!(!bucket.allow().await, "no refill inside the same second");

    clock.advance(Duration::from_millis(1));
    assert_eq!(admitted(&bucket, 3).await, 1);

    for _ in 0..4 {
        clock.advance(Duration::from_secs(1));
        assert_eq!(admitted(&bucket, 3).await, 1);
    }
}

#[tokio::test]
async fn idle_time_refills_up_to_capacity() {
    let (bucket, store, clock) = bucket(1, 5);
    assert_eq!(admitted(&bucket, 5).await, 5);

    clock.advance(Duration::from_secs(3));
    assert_eq!(admitted(&bucket, 10).await, 3);

    clock.advance(Duration::from_secs(3600));
    assert_eq!(admitted(&bucket, 10).await, 5);
    assert_eq!(store.get(bucket.tokens_key()).await.unwrap(), Some(0));
}

#[tokio::test]
async fn persisted_state_survives_new_limiter_instances() {
    let (first, store, clock) = bucket(2, 4);
    assert_eq!(admitted(&first, 3).await, 3);

    let restarted = TokenBucket::new(
        Arc::new(store.clone()),
        TokenBucketConfig::new("gateway", 2, 4).unwrap(),
    )
    .with_clock(clock.clone());
    assert_eq!(admitted(&restarted, 4).await, 1);

    clock.advance(Duration::from_secs(1));
    assert_eq!(admitted(&restarted, 4).await, 2);
}

#[tokio::test]
async fn dormant_state_expires_and_resets() {
    let (bucket, store, clock) = bucket(1, 5);
    assert_eq!(admitted(&bucket, 5).await, 5);

    clock.advance(Duration::from_secs(24 * 60 * 60));
    assert_eq!(store.get(bucket.tokens_key()).await.unwrap(), None);
    assert_eq!(store.get(bucket.last_time_key()).await.unwrap(), None);
    assert_eq!(bucket.acquire().await, Decision::Allowed { remaining: 4 });
}

#[tokio::test]
async fn concurrent_callers_never_overdraw() {
    let (bucket, store, _clock) = bucket(1, 10);
    let bucket = Arc::new(bucket);

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let b = bucket.clone();
            tokio::spawn(async move { b.allow().await })
        })
        .collect();
    let results = futures::future::join_all(handles).await;
    let allowed = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();

    assert_eq!(allowed, 10);
    assert_eq!(store.get(bucket.tokens_key()).await.unwrap(), Some(0));
}

#[tokio::test]
async fn outage_denies_with_retry_hint() {
    let (bucket, store, _clock) = bucket(1, 5);
    store.set_offline(true);
    match bucket.acquire().await {
        Decision::Denied { wait, reason } => {
            assert_eq!(reason, DenyReason::StoreUnavailable);
            assert!(wait > Duration::ZERO);
        }
        other => panic!("expected denial, got {other:?}"),
    }
}
