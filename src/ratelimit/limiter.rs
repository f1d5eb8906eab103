//! Core rate limiter implementation.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, trace};

use super::clock::{Clock, SystemClock};
use super::decision::{CheckOutcome, Decision};
use super::key::{CounterKey, KeyGenerator, RequestInfo};
use super::observer::{DecisionObserver, ViolationLogger};
use super::policy::{PolicyRegistry, RateLimitPolicy, RouteClass};
use crate::config::RatekeeperConfig;
use crate::error::Result;
use crate::store::{CounterStore, RuntimeSelector, SelectedStore};

/// The rate limiter: classifies a request, derives its counter key and
/// records it in the selected store.
///
/// `check` never fails. Any internal fault, including a panic in a store or
/// key function, resolves to an allowing decision and an error log, so the
/// limiter cannot itself take the service down.
pub struct RateLimiter {
    registry: Arc<PolicyRegistry>,
    keys: KeyGenerator,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn DecisionObserver>>,
}

impl RateLimiter {
    /// Create a rate limiter over an already selected store chain.
    pub fn new(registry: PolicyRegistry, selected: SelectedStore) -> Self {
        Self::with_store(registry, selected.store)
    }

    /// Create a rate limiter over an explicit store.
    pub fn with_store(registry: PolicyRegistry, store: Arc<dyn CounterStore>) -> Self {
        Self {
            registry: Arc::new(registry),
            keys: KeyGenerator::new(),
            store,
            clock: Arc::new(SystemClock),
            observers: Vec::new(),
        }
    }

    /// Build the limiter a configuration describes: policies, store chain
    /// and the violation logger.
    pub fn from_config(config: &RatekeeperConfig) -> Result<Self> {
        let registry = config.policy_registry()?;
        let selected = RuntimeSelector::select(&config.store);

        Ok(Self::new(registry, selected)
            .with_observer(Arc::new(ViolationLogger::new(&config.logging))))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn DecisionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Name of the store chain in use.
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Check a request against the policy its route resolves to.
    pub async fn check(&self, request: &RequestInfo) -> CheckOutcome {
        let class = self.registry.classify(&request.method, &request.path).class;
        self.check_class(request, class).await
    }

    /// Check a request against a specific class's policy, regardless of its
    /// route. Used for account-scoped throttles inside handlers.
    pub async fn check_class(&self, request: &RequestInfo, class: RouteClass) -> CheckOutcome {
        let now_ms = self.clock.now_ms();

        let outcome = match AssertUnwindSafe(self.evaluate(request, class, now_ms))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(
                    policy = %class,
                    "Rate limiter panicked, allowing request"
                );
                self.fail_open(request, class, now_ms)
            }
        };

        self.notify(&outcome, request);
        outcome
    }

    async fn evaluate(&self, request: &RequestInfo, class: RouteClass, now_ms: u64) -> CheckOutcome {
        let policy = self.registry.policy(class);
        let key = self.keys.key(request, &policy);

        trace!(
            key = %key,
            policy = %class,
            limit = policy.limit,
            window_ms = policy.window_ms(),
            "Checking rate limit"
        );

        let (decision, failed_open) = match self
            .store
            .record_and_check(&key, policy.window, policy.limit, now_ms)
            .await
        {
            Ok(decision) => (decision, false),
            Err(err) => {
                error!(
                    key = %key.hashed(),
                    policy = %class,
                    error = %err,
                    "Rate limit store failed, allowing request"
                );
                (Decision::fail_open(policy.limit, now_ms, policy.window_ms()), true)
            }
        };

        if !decision.allowed {
            debug!(key = %key, policy = %class, "Rate limit exceeded");
        }

        outcome(decision, &policy, key, now_ms, failed_open)
    }

    fn fail_open(&self, request: &RequestInfo, class: RouteClass, now_ms: u64) -> CheckOutcome {
        let policy = self.registry.policy(class);
        let key = CounterKey::new(policy.name(), &self.keys.client_address(request));
        let decision = Decision::fail_open(policy.limit, now_ms, policy.window_ms());
        outcome(decision, &policy, key, now_ms, true)
    }

    fn notify(&self, outcome: &CheckOutcome, request: &RequestInfo) {
        for observer in &self.observers {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                observer.observe(outcome, request)
            }));
            if result.is_err() {
                error!(policy = %outcome.class, "Decision observer panicked");
            }
        }
    }
}

fn outcome(
    decision: Decision,
    policy: &RateLimitPolicy,
    key: CounterKey,
    now_ms: u64,
    failed_open: bool,
) -> CheckOutcome {
    CheckOutcome {
        retry_after_secs: (!decision.allowed).then(|| decision.retry_after_secs(now_ms)),
        decision,
        class: policy.class,
        key,
        message: policy.message.clone(),
        now_ms,
        failed_open,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::key::REAL_IP;
    use crate::ratelimit::policy::{CustomKeyFn, KeyStrategy};
    use crate::store::testing::{FailingStore, MemoryCommandService};
    use crate::store::{FallbackStore, LocalFallbackStore, LocalStoreConfig, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    fn registry() -> PolicyRegistry {
        PolicyRegistry::builtin()
            .with_policy(RateLimitPolicy::new(
                RouteClass::Api,
                Duration::from_secs(60),
                5,
                "Too many API requests",
            ))
            .with_policy(RateLimitPolicy::new(
                RouteClass::Auth,
                Duration::from_secs(60),
                5,
                "Too many authentication attempts",
            ))
    }

    fn remote_limiter(service: Arc<MemoryCommandService>, clock: Arc<ManualClock>) -> RateLimiter {
        let selected = RuntimeSelector::select_with_transport(&Default::default(), service);
        RateLimiter::new(registry(), selected).with_clock(clock)
    }

    fn api_request(ip: &str) -> RequestInfo {
        RequestInfo::new("GET", "/api/bookings").with_header(REAL_IP, ip)
    }

    #[tokio::test]
    async fn test_scenarios_a_b_c() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = remote_limiter(Arc::new(MemoryCommandService::new()), clock.clone());
        let request = api_request("10.0.0.1");

        // A: five allowed, remaining counts down.
        for expected in [4, 3, 2, 1, 0] {
            let outcome = limiter.check(&request).await;
            assert!(outcome.allowed());
            assert_eq!(outcome.decision.remaining, expected);
            assert_eq!(outcome.retry_after_secs, None);
        }

        // B: sixth denied.
        let outcome = limiter.check(&request).await;
        assert!(!outcome.allowed());
        assert_eq!(outcome.decision.remaining, 0);
        assert_eq!(outcome.retry_after_secs, Some(60));
        assert_eq!(outcome.message, "Too many API requests");
        assert_eq!(outcome.class, RouteClass::Api);

        // C: window elapsed.
        clock.set(61_000);
        let outcome = limiter.check(&request).await;
        assert!(outcome.allowed());
        assert_eq!(outcome.decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_scenario_d_remote_fault_falls_back_once() {
        let clock = Arc::new(ManualClock::new(0));
        let failing = Arc::new(FailingStore::default());
        let local = Arc::new(LocalFallbackStore::new(LocalStoreConfig::default()));
        let chain = Arc::new(FallbackStore::new(failing.clone(), local.clone()));
        let limiter = RateLimiter::with_store(registry(), chain.clone()).with_clock(clock);

        let warnings = StoreWarnings::default();
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(warnings.clone()),
        );

        let outcome = limiter.check(&api_request("10.0.0.1")).await;

        assert!(outcome.allowed());
        assert!(!outcome.failed_open);
        assert_eq!(failing.calls(), 1);
        assert_eq!(chain.fallbacks(), 1);
        assert_eq!(local.len(), 1);
        assert_eq!(warnings.count(), 1);

        limiter.check(&api_request("10.0.0.1")).await;
        assert_eq!(warnings.count(), 2);
    }

    /// Counts warn-level events emitted by the store module.
    #[derive(Clone, Default)]
    struct StoreWarnings(Arc<AtomicUsize>);

    impl StoreWarnings {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for StoreWarnings {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let meta = event.metadata();
            if *meta.level() == tracing::Level::WARN && meta.target() == "ratekeeper::store" {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn test_scenario_d_remote_timeout_falls_back() {
        let clock = Arc::new(ManualClock::new(0));
        let service = Arc::new(MemoryCommandService::new());
        service.set_delay(Some(Duration::from_secs(10)));

        let mut config = crate::config::StoreConfig::default();
        config.remote.timeout_ms = 50;
        let selected = RuntimeSelector::select_with_transport(&config, service.clone());
        let limiter = RateLimiter::new(registry(), selected).with_clock(clock);

        let started = std::time::Instant::now();
        let outcome = limiter.check(&api_request("10.0.0.1")).await;

        assert!(outcome.allowed());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test]
    async fn test_scenario_e_policies_do_not_share_counters() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = remote_limiter(Arc::new(MemoryCommandService::new()), clock);

        let auth = RequestInfo::new("POST", "/api/auth/login").with_header(REAL_IP, "10.0.0.9");
        for _ in 0..5 {
            limiter.check(&auth).await;
        }
        assert!(!limiter.check(&auth).await.allowed());

        let outcome = limiter.check(&api_request("10.0.0.9")).await;
        assert!(outcome.allowed());
        assert_eq!(outcome.decision.remaining, 4);
        assert_eq!(outcome.key.as_str(), "api:10.0.0.9");
    }

    #[tokio::test]
    async fn test_total_store_failure_fails_open() {
        let limiter = RateLimiter::with_store(
            registry(),
            Arc::new(FallbackStore::new(
                Arc::new(FailingStore::default()),
                Arc::new(FailingStore::default()),
            )),
        )
        .with_clock(Arc::new(ManualClock::new(1_000)));

        for _ in 0..20 {
            let outcome = limiter.check(&api_request("10.0.0.1")).await;
            assert!(outcome.allowed());
            assert!(outcome.failed_open);
            assert_eq!(outcome.decision.reset_time_ms, 61_000);
        }
    }

    struct PanickingStore;

    #[async_trait]
    impl CounterStore for PanickingStore {
        async fn record_and_check(
            &self,
            _key: &CounterKey,
            _window: Duration,
            _limit: u64,
            _now_ms: u64,
        ) -> std::result::Result<Decision, StoreError> {
            panic!("store bug");
        }

        fn name(&self) -> &'static str {
            "panicking"
        }
    }

    #[tokio::test]
    async fn test_store_panic_fails_open() {
        let limiter = RateLimiter::with_store(registry(), Arc::new(PanickingStore))
            .with_clock(Arc::new(ManualClock::new(0)));

        let outcome = limiter.check(&api_request("10.0.0.1")).await;
        assert!(outcome.allowed());
        assert!(outcome.failed_open);
        assert_eq!(outcome.key.as_str(), "api:10.0.0.1");
    }

    #[tokio::test]
    async fn test_custom_key_panic_fails_open() {
        let registry = registry().with_custom_key(
            RouteClass::Api,
            CustomKeyFn::new(|_req: &RequestInfo| panic!("bad key fn")),
        );
        let limiter = RateLimiter::with_store(registry, Arc::new(LocalFallbackStore::default()));

        let outcome = limiter.check(&api_request("10.0.0.1")).await;
        assert!(outcome.allowed());
        assert!(outcome.failed_open);
    }

    struct PanickingObserver;

    impl DecisionObserver for PanickingObserver {
        fn observe(&self, _outcome: &CheckOutcome, _request: &RequestInfo) {
            panic!("observer bug");
        }
    }

    #[tokio::test]
    async fn test_observer_panic_does_not_change_decision() {
        let logger = Arc::new(ViolationLogger::default());
        let limiter = RateLimiter::with_store(registry(), Arc::new(LocalFallbackStore::default()))
            .with_clock(Arc::new(ManualClock::new(0)))
            .with_observer(Arc::new(PanickingObserver))
            .with_observer(logger.clone());

        for _ in 0..5 {
            assert!(limiter.check(&api_request("10.0.0.1")).await.allowed());
        }
        assert!(!limiter.check(&api_request("10.0.0.1")).await.allowed());

        // remaining 1 and 0 are within ceil(5 * 0.1) = 1.
        assert_eq!(logger.warnings(), 2);
        assert_eq!(logger.denials(), 1);
    }

    #[tokio::test]
    async fn test_account_scoped_check_ignores_ip() {
        let registry = registry().with_policy(
            RateLimitPolicy::new(RouteClass::Auth, Duration::from_secs(900), 3, "locked")
                .with_key_strategy(KeyStrategy::Account),
        );
        let limiter = RateLimiter::with_store(registry, Arc::new(LocalFallbackStore::default()))
            .with_clock(Arc::new(ManualClock::new(0)));

        for i in 0..3 {
            let request = RequestInfo::new("POST", "/api/profile/password")
                .with_header(REAL_IP, &format!("10.0.0.{}", i))
                .with_subject("user-7", Some("password-change".into()));
            assert!(limiter.check_class(&request, RouteClass::Auth).await.allowed());
        }

        let request = RequestInfo::new("POST", "/api/profile/password")
            .with_header(REAL_IP, "192.168.1.1")
            .with_subject("user-7", Some("password-change".into()));
        let outcome = limiter.check_class(&request, RouteClass::Auth).await;
        assert!(!outcome.allowed());
        assert_eq!(outcome.key.as_str(), "auth:user:user-7:password-change");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_checks_through_limiter() {
        let service = Arc::new(MemoryCommandService::new());
        let limiter = Arc::new(remote_limiter(service, Arc::new(ManualClock::new(0))));

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check(&api_request("10.0.0.1")).await.allowed() })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    async fn test_unmatched_route_uses_general_policy() {
        let limiter = RateLimiter::with_store(registry(), Arc::new(LocalFallbackStore::default()));
        let outcome = limiter.check(&RequestInfo::new("GET", "/about")).await;

        assert_eq!(outcome.class, RouteClass::General);
        assert_eq!(outcome.decision.limit, 100);
        assert_eq!(outcome.key.as_str(), "general:unknown");
    }
}
