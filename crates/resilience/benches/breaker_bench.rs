use std::sync::Arc;
use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use resilience::{
    CircuitBreaker, CircuitBreakerConfig, Classify, PolicyExecutor, ResiliencePolicy, RetryPolicy,
};

#[derive(Debug)]
struct Never;

impl std::fmt::Display for Never {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "never")
    }
}

impl Classify for Never {
    fn is_transient(&self) -> bool {
        true
    }
}

fn bench_acquire_and_record(c: &mut Criterion) {
    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default());

    c.bench_function("circuit_breaker/acquire_success", |b| {
        b.iter(|| {
            breaker.try_acquire().unwrap().success();
        });
    });
}

fn bench_rejection_while_open(c: &mut Criterion) {
    let breaker = CircuitBreaker::new(
        "bench-open",
        CircuitBreakerConfig::default()
            .with_sliding_window(1, 1)
            .with_wait_duration(Duration::from_secs(3600)),
    );
    breaker.try_acquire().unwrap().failure();

    c.bench_function("circuit_breaker/reject_open", |b| {
        b.iter(|| {
            let _ = breaker.try_acquire();
        });
    });
}

fn bench_executor_happy_path(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let executor = PolicyExecutor::new(
        Arc::new(CircuitBreaker::new("bench-exec", CircuitBreakerConfig::default())),
        ResiliencePolicy::new(RetryPolicy::default()),
    );

    c.bench_function("policy_executor/execute_ok", |b| {
        b.iter(|| {
            rt.block_on(async {
                executor
                    .execute(|| async { Ok::<_, Never>(42) })
                    .await
                    .unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_acquire_and_record,
    bench_rejection_while_open,
    bench_executor_happy_path
);
criterion_main!(benches);
