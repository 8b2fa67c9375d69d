//! Per-provider circuit breakers.
//!
//! The registry is built once per worker process and shared by every fetch job,
//! so consecutive failures accumulate across cycles rather than per call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use gpuwatch_core::ReliabilityTier;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub open_for: Duration,
}

impl BreakerPolicy {
    pub fn for_tier(tier: ReliabilityTier) -> Self {
        match tier {
            ReliabilityTier::Enterprise => Self {
                failure_threshold: 3,
                open_for: Duration::from_secs(5 * 60),
            },
            ReliabilityTier::Standard => Self {
                failure_threshold: 4,
                open_for: Duration::from_secs(5 * 60),
            },
            ReliabilityTier::Community => Self {
                failure_threshold: 5,
                open_for: Duration::from_secs(10 * 60),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    policy: BreakerPolicy,
    failure_count: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerInner {
    fn state(&self, now: Instant) -> BreakerState {
        match self.open_until {
            Some(until) if now < until => BreakerState::Open,
            Some(_) => BreakerState::HalfOpen,
            None => BreakerState::Closed,
        }
    }
}

/// Call outcome when the wrapped operation was not allowed to run, or failed.
#[derive(Debug, PartialEq)]
pub enum BreakerError<E> {
    /// The provider's breaker rejected the call without invoking it.
    Open { provider: String },
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { provider } => write!(f, "circuit_open:{provider}"),
            Self::Inner(err) => err.fmt(f),
        }
    }
}

/// Admission granted by `try_acquire`.
enum Permit {
    Normal,
    Trial,
}

pub struct CircuitBreaker {
    provider: String,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, policy: BreakerPolicy) -> Self {
        Self {
            provider: provider.into(),
            inner: Mutex::new(BreakerInner {
                policy,
                failure_count: 0,
                open_until: None,
                trial_in_flight: false,
            }),
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state(Instant::now())
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.lock().await.failure_count
    }

    async fn try_acquire(&self) -> Option<Permit> {
        let mut inner = self.inner.lock().await;
        match inner.state(Instant::now()) {
            BreakerState::Closed => Some(Permit::Normal),
            BreakerState::Open => None,
            BreakerState::HalfOpen if inner.trial_in_flight => None,
            BreakerState::HalfOpen => {
                inner.trial_in_flight = true;
                info!(provider = %self.provider, "circuit half-open, allowing trial call");
                Some(Permit::Trial)
            }
        }
    }

    async fn record(&self, permit: Permit, success: bool) {
        let mut inner = self.inner.lock().await;
        if matches!(permit, Permit::Trial) {
            inner.trial_in_flight = false;
        }
        if success {
            if inner.open_until.is_some() {
                info!(provider = %self.provider, "circuit closed after successful trial");
            }
            inner.failure_count = 0;
            inner.open_until = None;
            return;
        }

        inner.failure_count += 1;
        let reopen = matches!(permit, Permit::Trial);
        if reopen || inner.failure_count >= inner.policy.failure_threshold {
            inner.open_until = Some(Instant::now() + inner.policy.open_for);
            warn!(
                provider = %self.provider,
                failures = inner.failure_count,
                open_for_secs = inner.policy.open_for.as_secs(),
                "circuit opened"
            );
        }
    }

    /// Runs `op` unless the breaker is open. Every `Err` from `op` counts as a failure.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(permit) = self.try_acquire().await else {
            return Err(BreakerError::Open {
                provider: self.provider.clone(),
            });
        };
        let result = op().await;
        self.record(permit, result.is_ok()).await;
        result.map_err(BreakerError::Inner)
    }
}

/// Long-lived provider slug -> breaker map.
#[derive(Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the provider's breaker, creating it with the tier policy on first use.
    pub async fn breaker_for(&self, provider_slug: &str, tier: ReliabilityTier) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(provider_slug.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(provider_slug, BreakerPolicy::for_tier(tier)))
            })
            .clone()
    }

    pub async fn state_of(&self, provider_slug: &str) -> Option<BreakerState> {
        let breaker = self.breakers.lock().await.get(provider_slug).cloned()?;
        Some(breaker.state().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicU32) -> Result<(), BreakerError<&'static str>> {
        breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("boom")
            })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker, calls: &AtomicU32) -> Result<(), BreakerError<&'static str>> {
        breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await
    }

    #[test]
    fn tier_policies() {
        assert_eq!(BreakerPolicy::for_tier(ReliabilityTier::Enterprise).failure_threshold, 3);
        assert_eq!(BreakerPolicy::for_tier(ReliabilityTier::Standard).failure_threshold, 4);
        let community = BreakerPolicy::for_tier(ReliabilityTier::Community);
        assert_eq!(community.failure_threshold, 5);
        assert_eq!(community.open_for, Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn enterprise_breaker_opens_on_third_failure_and_probes_once() {
        let registry = CircuitBreakerRegistry::new();
        let breaker = registry.breaker_for("p", ReliabilityTier::Enterprise).await;
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            assert_eq!(fail(&breaker, &calls).await, Err(BreakerError::Inner("boom")));
            assert_eq!(breaker.state().await, BreakerState::Closed);
        }
        assert_eq!(fail(&breaker, &calls).await, Err(BreakerError::Inner("boom")));
        assert_eq!(breaker.state().await, BreakerState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let rejected = succeed(&breaker, &calls).await.unwrap_err();
        assert_eq!(rejected.to_string(), "circuit_open:p");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);

        // Trial fails: straight back to open.
        assert!(matches!(fail(&breaker, &calls).await, Err(BreakerError::Inner(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(breaker.state().await, BreakerState::Open);

        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        succeed(&breaker, &calls).await.unwrap();
        assert_eq!(breaker.state().await, BreakerState::Closed);
        assert_eq!(breaker.failure_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_a_single_trial() {
        let breaker = Arc::new(CircuitBreaker::new(
            "p",
            BreakerPolicy {
                failure_threshold: 1,
                open_for: Duration::from_secs(60),
            },
        ));
        let calls = AtomicU32::new(0);
        fail(&breaker, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(60)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        let _ = release_rx.await;
                        Ok::<_, &'static str>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        let concurrent = succeed(&breaker, &calls).await;
        assert!(matches!(concurrent, Err(BreakerError::Open { .. })));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn registry_reuses_breakers_across_lookups() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.breaker_for("runpod", ReliabilityTier::Community).await;
        let b = registry.breaker_for("runpod", ReliabilityTier::Enterprise).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.state_of("runpod").await, Some(BreakerState::Closed));
        assert_eq!(registry.state_of("unknown").await, None);
    }
}
