use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tripwire::{
    BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, InMemoryCounterStore, ResilienceLayer,
    TokenBucket, TokenBucketConfig,
};

use futures::future::Ready;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{Service, ServiceBuilder};

// A simple service that just returns its input.
#[derive(Clone)]
struct EchoService;

impl Service<&'static str> for EchoService {
    type Response = &'static str;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: &'static str) -> Self::Future {
        futures::future::ready(Ok(req))
    }
}

// A service that always fails.
#[derive(Clone)]
struct FailingService {
    calls: Arc<AtomicUsize>,
}

impl Service<&'static str> for FailingService {
    type Response = &'static str;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: &'static str) -> Self::Future {
        self.calls.fetch_add(1, Ordering::Relaxed);
        futures::future::ready(Err(std::io::Error::other("boom")))
    }
}

fn layer(failure_threshold: u64) -> ResilienceLayer {
    let store = Arc::new(InMemoryCounterStore::new());
    // Large bucket so the limiter never denies during a run.
    let limiter =
        TokenBucket::new(store.clone(), TokenBucketConfig::new("bench", 1_000_000_000, 1_000_000_000).unwrap());
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(failure_threshold)
        .half_open_timeout(Duration::from_secs(30))
        .build()
        .unwrap();
    let registry = BreakerRegistry::new();
    registry.register(CircuitBreaker::new("user_service", config, store));
    ResilienceLayer::new(Arc::new(limiter), registry)
}

fn token_bucket_acquire(c: &mut Criterion) {
    use tripwire::RateLimiter;

    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(InMemoryCounterStore::new());
    let bucket =
        TokenBucket::new(store, TokenBucketConfig::new("bench", 1_000_000_000, 1_000_000_000).unwrap());

    c.bench_function("token_bucket_acquire_in_memory", |b| {
        b.to_async(&rt).iter(|| async { black_box(bucket.acquire().await) });
    });
}

fn admission_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let svc = ServiceBuilder::new().layer(layer(10)).service(EchoService);

    c.bench_function("admission_closed_breaker", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box("/user/info"))).await;
        });
    });
}

fn admission_open_breaker(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    // Opens on the first failure; the rest measures the rejection path.
    let svc = ServiceBuilder::new()
        .layer(layer(1))
        .service(FailingService { calls: Arc::new(AtomicUsize::new(0)) });

    c.bench_function("admission_open_breaker", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box("/user/info"))).await;
        });
    });
}

criterion_group!(benches, token_bucket_acquire, admission_success, admission_open_breaker);
criterion_main!(benches);
