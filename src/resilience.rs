//! Resilience pipeline
//!
//! A composed policy stack applied around every execution attempt,
//! outermost first: retry, per-attempt timeout, circuit breaker, bulkhead,
//! rate limiter. Pipelines are built from a frozen options snapshot, cached
//! per logical connection name, and evicted on change notification. The
//! breaker, bulkhead, and limiter state inside a cached pipeline is shared
//! by every execution targeting that connection.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DbResilienceOptions;
use crate::error::{Error, Result, TransientClassifier};
use crate::monitor::OptionsMonitor;
use crate::query::CommandKind;

/// Safety cap on a single computed backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

// ============================================================================
// Execution context
// ============================================================================

/// Per-execution ambient state, created once per top-level call and shared
/// across every retry attempt within it.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Diagnostic key; defaults to the command text when blank
    pub operation_key: String,
    /// Logical connection name the execution targets
    pub connection_name: String,
    /// Command text (redact before logging)
    pub command_text: String,
    /// Text vs stored procedure
    pub command_kind: CommandKind,
    /// Opaque tag from the query definition
    pub tag: Option<String>,
    /// Caller cancellation; attempts run under child tokens of this
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    /// Create a context for one execution. A blank operation key falls back
    /// to the command text.
    pub fn new(
        connection_name: impl Into<String>,
        command_text: impl Into<String>,
        command_kind: CommandKind,
        tag: Option<String>,
        cancellation: CancellationToken,
    ) -> Self {
        let command_text = command_text.into();
        Self {
            operation_key: command_text.clone(),
            connection_name: connection_name.into(),
            command_text,
            command_kind,
            tag,
            cancellation,
        }
    }

    /// Override the diagnostic operation key; blank keys are ignored.
    pub fn with_operation_key(mut self, key: impl AsRef<str>) -> Self {
        let key = key.as_ref();
        if !key.trim().is_empty() {
            self.operation_key = key.to_string();
        }
        self
    }
}

// ============================================================================
// Retry
// ============================================================================

#[derive(Debug, Clone)]
struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    backoff_exponent: f64,
    use_jitter: bool,
}

impl RetryPolicy {
    /// Backoff before the retry following failed attempt `n` (1-based):
    /// `base_delay * backoff_exponent^(n-1)`, with optional full jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_exponent.powi(attempt.saturating_sub(1) as i32);
        let mut secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() {
            return MAX_BACKOFF;
        }
        if self.use_jitter {
            secs *= rand::random::<f64>();
        }
        Duration::from_secs_f64(secs.max(0.0)).min(MAX_BACKOFF)
    }
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    /// Timestamps of transient failures inside the sampling window
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
}

/// Rolling-window circuit breaker.
///
/// Opens after `failure_threshold` transient failures within
/// `sampling_window`; stays open for `break_duration`, then admits
/// half-open probes. A probe success closes the circuit, a probe failure
/// re-opens it.
struct CircuitBreaker {
    failure_threshold: u32,
    sampling_window: Duration,
    break_duration: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    fn new(failure_threshold: u32, sampling_window: Duration, break_duration: Duration) -> Self {
        Self {
            failure_threshold,
            sampling_window,
            break_duration,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
            }),
        }
    }

    fn allow(&self, connection_name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.break_duration {
                    inner.state = BreakerState::HalfOpen;
                    debug!(connection = connection_name, "circuit breaker half-open");
                    Ok(())
                } else {
                    Err(Error::circuit_open(format!(
                        "circuit breaker open for \"{connection_name}\""
                    )))
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failures.clear();
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
        }
    }

    fn record_failure(&self, connection_name: &str) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    connection = connection_name,
                    "circuit breaker re-opened by half-open probe failure"
                );
            }
            BreakerState::Closed => {
                let now = Instant::now();
                inner.failures.push_back(now);
                while let Some(front) = inner.failures.front() {
                    if now.duration_since(*front) > self.sampling_window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() as u32 >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    inner.failures.clear();
                    warn!(
                        connection = connection_name,
                        threshold = self.failure_threshold,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }
}

// ============================================================================
// Bulkhead
// ============================================================================

/// Concurrency limiter: `max_concurrent` permits plus a bounded wait queue.
/// Overflow beyond `max_queued` waiters is rejected immediately.
struct Bulkhead {
    permits: Arc<Semaphore>,
    max_queued: usize,
    queued: AtomicUsize,
}

struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Bulkhead {
    fn new(max_concurrent: usize, max_queued: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_queued,
            queued: AtomicUsize::new(0),
        }
    }

    async fn acquire(&self, connection_name: &str) -> Result<tokio::sync::OwnedSemaphorePermit> {
        if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            return Ok(permit);
        }

        // Claim a queue slot or reject; the slot is released on drop even
        // when the wait is cancelled from outside.
        let mut current = self.queued.load(Ordering::Acquire);
        loop {
            if current >= self.max_queued {
                return Err(Error::overloaded(format!(
                    "bulkhead queue full for \"{connection_name}\""
                )));
            }
            match self.queued.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        let _slot = QueueSlot(&self.queued);

        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::overloaded("bulkhead closed"))
    }
}

// ============================================================================
// Rate limiter
// ============================================================================

struct BucketInner {
    tokens: u64,
    last_refill: Instant,
}

/// Token bucket: `permit_limit` tokens, replenished in full every
/// `replenishment_period`. An empty bucket rejects instead of waiting.
struct TokenBucket {
    capacity: u64,
    period: Duration,
    inner: Mutex<BucketInner>,
}

impl TokenBucket {
    fn new(capacity: u64, period: Duration) -> Self {
        Self {
            capacity,
            period,
            inner: Mutex::new(BucketInner {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn try_acquire(&self, connection_name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.last_refill.elapsed() >= self.period {
            inner.tokens = self.capacity;
            inner.last_refill = Instant::now();
        }
        if inner.tokens == 0 {
            return Err(Error::overloaded(format!(
                "rate limit exceeded for \"{connection_name}\""
            )));
        }
        inner.tokens -= 1;
        Ok(())
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Snapshot of pipeline counters
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Attempts started (including first attempts)
    pub attempts: u64,
    /// Retries performed after transient failures
    pub retries: u64,
}

#[derive(Debug, Default)]
struct AtomicPipelineStats {
    attempts: AtomicU64,
    retries: AtomicU64,
}

/// A composed resilience policy stack. Immutable after build; safe to share
/// across concurrent executions.
pub struct ResiliencePipeline {
    retry: Option<RetryPolicy>,
    attempt_timeout: Option<Duration>,
    breaker: Option<CircuitBreaker>,
    bulkhead: Option<Bulkhead>,
    limiter: Option<TokenBucket>,
    classifier: Arc<dyn TransientClassifier>,
    stats: AtomicPipelineStats,
}

impl ResiliencePipeline {
    /// Build a pipeline from a frozen options snapshot.
    ///
    /// `enabled = false` yields an empty pipeline: the body runs exactly
    /// once with no policies applied.
    pub fn from_options(
        options: &DbResilienceOptions,
        classifier: Arc<dyn TransientClassifier>,
    ) -> Self {
        if !options.enabled {
            return Self::disabled(classifier);
        }
        Self {
            retry: (options.retry.max_attempts > 0).then(|| RetryPolicy {
                max_attempts: options.retry.max_attempts,
                base_delay: options.retry.base_delay(),
                backoff_exponent: options.retry.backoff_exponent,
                use_jitter: options.retry.use_jitter,
            }),
            attempt_timeout: options.timeout.enabled.then(|| options.timeout.per_attempt()),
            breaker: options.circuit_breaker.enabled.then(|| {
                CircuitBreaker::new(
                    options.circuit_breaker.failure_threshold,
                    options.circuit_breaker.sampling_window(),
                    options.circuit_breaker.break_duration(),
                )
            }),
            bulkhead: options.bulkhead.enabled.then(|| {
                Bulkhead::new(
                    options.bulkhead.max_concurrent as usize,
                    options.bulkhead.max_queued as usize,
                )
            }),
            limiter: options.rate_limiter.enabled.then(|| {
                TokenBucket::new(
                    u64::from(options.rate_limiter.permit_limit),
                    options.rate_limiter.replenishment_period(),
                )
            }),
            classifier,
            stats: AtomicPipelineStats::default(),
        }
    }

    /// An empty pipeline: no policies, body runs once.
    pub fn disabled(classifier: Arc<dyn TransientClassifier>) -> Self {
        Self {
            retry: None,
            attempt_timeout: None,
            breaker: None,
            bulkhead: None,
            limiter: None,
            classifier,
            stats: AtomicPipelineStats::default(),
        }
    }

    /// Snapshot of the attempt/retry counters
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
        }
    }

    /// Run `body` under the policy stack.
    ///
    /// The body may be invoked multiple times (retries); each invocation
    /// receives a fresh child token of the context's cancellation token,
    /// additionally cancelled when the per-attempt timeout fires. On retry
    /// exhaustion the last attempt's failure surfaces.
    pub async fn execute<T, F, Fut>(&self, ctx: &ExecutionContext, mut body: F) -> Result<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let total_attempts = self.retry.as_ref().map(|r| r.max_attempts.max(1)).unwrap_or(1);
        let mut attempt = 1_u32;
        loop {
            if ctx.cancellation.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);

            let err = match self.run_attempt(ctx, &mut body).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let policy = match &self.retry {
                Some(policy)
                    if attempt < total_attempts && self.classifier.is_transient(&err) =>
                {
                    policy
                }
                _ => return Err(err),
            };

            let delay = policy.delay_for(attempt);
            debug!(
                operation = %ctx.operation_key,
                connection = %ctx.connection_name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure; retrying"
            );
            self.stats.retries.fetch_add(1, Ordering::Relaxed);

            tokio::select! {
                _ = ctx.cancellation.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn run_attempt<T, F, Fut>(&self, ctx: &ExecutionContext, body: &mut F) -> Result<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = ctx.cancellation.child_token();
        let name = ctx.connection_name.as_str();

        let inner = async {
            if let Some(breaker) = &self.breaker {
                breaker.allow(name)?;
            }
            let _permit = match &self.bulkhead {
                Some(bulkhead) => Some(bulkhead.acquire(name).await?),
                None => None,
            };
            if let Some(limiter) = &self.limiter {
                limiter.try_acquire(name)?;
            }

            let result = body(token.clone()).await;

            // The breaker samples only outcomes that reached it; attempts
            // abandoned by the outer timeout are not recorded.
            if let Some(breaker) = &self.breaker {
                match &result {
                    Ok(_) => breaker.record_success(),
                    Err(err) if self.classifier.is_transient(err) => breaker.record_failure(name),
                    Err(_) => {}
                }
            }
            result
        };

        match self.attempt_timeout {
            Some(cap) => {
                tokio::select! {
                    result = inner => result,
                    _ = tokio::time::sleep(cap) => {
                        token.cancel();
                        Err(Error::timeout(format!(
                            "attempt exceeded {} ms",
                            cap.as_millis()
                        )))
                    }
                }
            }
            None => inner.await,
        }
    }
}

impl std::fmt::Debug for ResiliencePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResiliencePipeline")
            .field("retry", &self.retry.is_some())
            .field("attempt_timeout", &self.attempt_timeout)
            .field("breaker", &self.breaker.is_some())
            .field("bulkhead", &self.bulkhead.is_some())
            .field("limiter", &self.limiter.is_some())
            .finish()
    }
}

// ============================================================================
// Provider
// ============================================================================

/// Builds and caches one pipeline per logical connection name from the
/// current resilience options snapshot.
pub struct PipelineProvider {
    options: Arc<OptionsMonitor<DbResilienceOptions>>,
    classifier: Arc<dyn TransientClassifier>,
    pipelines: RwLock<HashMap<String, Arc<ResiliencePipeline>>>,
}

impl PipelineProvider {
    /// Create a provider over the given options monitor
    pub fn new(
        options: Arc<OptionsMonitor<DbResilienceOptions>>,
        classifier: Arc<dyn TransientClassifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            classifier,
            pipelines: RwLock::new(HashMap::new()),
        })
    }

    /// The cached pipeline for `name`, built lazily from the current
    /// snapshot.
    pub fn get_pipeline(&self, name: &str) -> Arc<ResiliencePipeline> {
        let key = name.to_ascii_lowercase();
        {
            let pipelines = self.pipelines.read();
            if let Some(pipeline) = pipelines.get(&key) {
                return pipeline.clone();
            }
        }
        let mut pipelines = self.pipelines.write();
        if let Some(pipeline) = pipelines.get(&key) {
            return pipeline.clone();
        }
        let snapshot = self.options.current();
        let pipeline = Arc::new(ResiliencePipeline::from_options(
            &snapshot,
            self.classifier.clone(),
        ));
        debug!(connection = name, "resilience pipeline built");
        pipelines.insert(key, pipeline.clone());
        pipeline
    }

    /// Evict the cached pipeline for one name
    pub fn invalidate(&self, name: &str) {
        self.pipelines.write().remove(&name.to_ascii_lowercase());
    }

    /// Evict every cached pipeline; wired to the options change event.
    pub fn invalidate_all(&self) {
        let mut pipelines = self.pipelines.write();
        if !pipelines.is_empty() {
            debug!(count = pipelines.len(), "resilience pipelines invalidated");
        }
        pipelines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BulkheadOptions, CircuitBreakerOptions, RateLimiterOptions, RetryOptions, TimeoutOptions,
    };
    use crate::error::DefaultTransientClassifier;
    use std::sync::atomic::AtomicU32;

    fn classifier() -> Arc<dyn TransientClassifier> {
        Arc::new(DefaultTransientClassifier)
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            "defaultDatabase",
            "SELECT 1",
            CommandKind::Text,
            None,
            CancellationToken::new(),
        )
    }

    fn retry_only(max_attempts: u32) -> ResiliencePipeline {
        let options = DbResilienceOptions {
            retry: RetryOptions {
                max_attempts,
                base_delay_ms: 1,
                backoff_exponent: 1.0,
                use_jitter: false,
            },
            timeout: TimeoutOptions {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        ResiliencePipeline::from_options(&options, classifier())
    }

    #[test]
    fn test_context_operation_key_defaults_to_command_text() {
        let ctx = ctx();
        assert_eq!(ctx.operation_key, "SELECT 1");

        let ctx = ctx.with_operation_key("nightly-rollup");
        assert_eq!(ctx.operation_key, "nightly-rollup");
    }

    #[test]
    fn test_backoff_formula() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            backoff_exponent: 2.0,
            use_jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            backoff_exponent: 2.0,
            use_jitter: true,
        };
        for attempt in 1..=4 {
            let delay = policy.delay_for(attempt);
            let full = Duration::from_millis(100 * 2_u64.pow(attempt - 1));
            assert!(delay <= full, "jittered delay must not exceed the full backoff");
        }
    }

    #[tokio::test]
    async fn test_retry_law() {
        // First n attempts transient, (n+1)-th succeeds: success iff
        // n + 1 <= max_attempts.
        for (failures, max_attempts, expect_ok) in
            [(0, 1, true), (1, 2, true), (2, 2, false), (3, 5, true)]
        {
            let pipeline = retry_only(max_attempts);
            let calls = AtomicU32::new(0);
            let result = pipeline
                .execute(&ctx(), |_token| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < failures {
                            Err(Error::transient("blip"))
                        } else {
                            Ok(n)
                        }
                    }
                })
                .await;
            assert_eq!(
                result.is_ok(),
                expect_ok,
                "failures={failures} max_attempts={max_attempts}"
            );
            if !expect_ok {
                assert!(matches!(result.unwrap_err(), Error::Transient { .. }));
                assert_eq!(calls.load(Ordering::SeqCst), max_attempts);
            }
        }
    }

    #[tokio::test]
    async fn test_retry_counts_observed_in_stats() {
        let pipeline = retry_only(2);
        let calls = AtomicU32::new(0);
        let value = pipeline
            .execute(&ctx(), |_token| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::transient("blip"))
                    } else {
                        Ok(42_i64)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        let stats = pipeline.stats();
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.retries, 1);
    }

    #[tokio::test]
    async fn test_non_transient_not_retried() {
        for err in [
            Error::unknown("syntax error"),
            Error::overloaded("queue full"),
            Error::circuit_open("open"),
            Error::Cancelled,
        ] {
            let pipeline = retry_only(5);
            let calls = AtomicU32::new(0);
            let category = err.category();
            let mut err = Some(err);
            let result: Result<()> = pipeline
                .execute(&ctx(), |_token| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let err = err.take().expect("body must run exactly once");
                    async move { Err(err) }
                })
                .await;
            assert_eq!(result.unwrap_err().category(), category);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_disabled_pipeline_runs_body_once() {
        let options = DbResilienceOptions {
            enabled: false,
            ..Default::default()
        };
        let pipeline = ResiliencePipeline::from_options(&options, classifier());
        let calls = AtomicU32::new(0);
        let result: Result<()> = pipeline
            .execute(&ctx(), |_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::transient("blip")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_yields_timeout_error_and_cancels_attempt() {
        let options = DbResilienceOptions {
            retry: RetryOptions {
                max_attempts: 0,
                ..Default::default()
            },
            timeout: TimeoutOptions {
                enabled: true,
                per_attempt_ms: 20,
            },
            ..Default::default()
        };
        let pipeline = ResiliencePipeline::from_options(&options, classifier());

        let result: Result<()> = pipeline
            .execute(&ctx(), |token| async move {
                tokio::select! {
                    _ = token.cancelled() => Err(Error::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(()),
                }
            })
            .await;
        assert!(matches!(result.unwrap_err(), Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_timeout_is_retried() {
        let options = DbResilienceOptions {
            retry: RetryOptions {
                max_attempts: 2,
                base_delay_ms: 1,
                backoff_exponent: 1.0,
                use_jitter: false,
            },
            timeout: TimeoutOptions {
                enabled: true,
                per_attempt_ms: 20,
            },
            ..Default::default()
        };
        let pipeline = ResiliencePipeline::from_options(&options, classifier());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result = pipeline
            .execute(&ctx(), move |_token| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        // First attempt hangs past the per-attempt cap
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 1);
        assert_eq!(pipeline.stats().retries, 1);
    }

    #[tokio::test]
    async fn test_cancellation_between_attempts_stops_retries() {
        let options = DbResilienceOptions {
            retry: RetryOptions {
                max_attempts: 10,
                base_delay_ms: 200,
                backoff_exponent: 1.0,
                use_jitter: false,
            },
            timeout: TimeoutOptions {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let pipeline = ResiliencePipeline::from_options(&options, classifier());
        let token = CancellationToken::new();
        let ctx = ExecutionContext::new(
            "defaultDatabase",
            "SELECT 1",
            CommandKind::Text,
            None,
            token.clone(),
        );

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let calls = AtomicU32::new(0);
        let result: Result<()> = pipeline
            .execute(&ctx, |_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::transient("blip")) }
            })
            .await;
        assert!(matches!(result.unwrap_err(), Error::Cancelled));
        // Cancelled during the first backoff sleep
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_then_half_open_then_closes() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(10), Duration::from_millis(30));

        breaker.allow("db").unwrap();
        breaker.record_failure("db");
        breaker.allow("db").unwrap();
        breaker.record_failure("db");

        // Threshold reached: open
        assert!(matches!(
            breaker.allow("db").unwrap_err(),
            Error::CircuitOpen { .. }
        ));

        // After the break duration a probe is admitted
        std::thread::sleep(Duration::from_millis(50));
        breaker.allow("db").unwrap();
        breaker.record_success();
        breaker.allow("db").unwrap();
    }

    #[tokio::test]
    async fn test_breaker_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10), Duration::from_millis(20));
        breaker.record_failure("db");
        assert!(breaker.allow("db").is_err());

        std::thread::sleep(Duration::from_millis(40));
        breaker.allow("db").unwrap(); // half-open probe
        breaker.record_failure("db");
        assert!(breaker.allow("db").is_err());
    }

    #[test]
    fn test_breaker_window_prunes_old_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(20), Duration::from_secs(10));
        breaker.record_failure("db");
        breaker.record_failure("db");
        std::thread::sleep(Duration::from_millis(40));
        // Earlier failures fell out of the sampling window
        breaker.record_failure("db");
        breaker.allow("db").unwrap();
    }

    #[tokio::test]
    async fn test_bulkhead_rejects_overflow() {
        let bulkhead = Bulkhead::new(1, 0);
        let held = bulkhead.acquire("db").await.unwrap();

        // No permits free and no queue capacity: immediate rejection
        let err = bulkhead.acquire("db").await.unwrap_err();
        assert!(matches!(err, Error::Overloaded { .. }));

        drop(held);
        bulkhead.acquire("db").await.unwrap();
    }

    #[tokio::test]
    async fn test_bulkhead_queues_up_to_bound() {
        let bulkhead = Arc::new(Bulkhead::new(1, 1));
        let held = bulkhead.acquire("db").await.unwrap();

        let queued = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire("db").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Queue slot taken by the spawned waiter; a second waiter overflows
        let err = bulkhead.acquire("db").await.unwrap_err();
        assert!(matches!(err, Error::Overloaded { .. }));

        drop(held);
        queued.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rate_limiter_rejects_until_replenished() {
        let bucket = TokenBucket::new(2, Duration::from_millis(30));
        bucket.try_acquire("db").unwrap();
        bucket.try_acquire("db").unwrap();
        assert!(matches!(
            bucket.try_acquire("db").unwrap_err(),
            Error::Overloaded { .. }
        ));

        std::thread::sleep(Duration::from_millis(50));
        bucket.try_acquire("db").unwrap();
    }

    #[tokio::test]
    async fn test_breaker_inside_pipeline_fails_fast() {
        let options = DbResilienceOptions {
            retry: RetryOptions {
                max_attempts: 0,
                ..Default::default()
            },
            timeout: TimeoutOptions {
                enabled: false,
                ..Default::default()
            },
            circuit_breaker: CircuitBreakerOptions {
                enabled: true,
                failure_threshold: 1,
                sampling_window_ms: 10_000,
                break_duration_ms: 10_000,
            },
            ..Default::default()
        };
        let pipeline = ResiliencePipeline::from_options(&options, classifier());

        let result: Result<()> = pipeline
            .execute(&ctx(), |_token| async { Err(Error::transient("down")) })
            .await;
        assert!(matches!(result.unwrap_err(), Error::Transient { .. }));

        // Circuit is now open: the body never runs
        let calls = AtomicU32::new(0);
        let result: Result<()> = pipeline
            .execute(&ctx(), |_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result.unwrap_err(), Error::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_limiter_inside_pipeline() {
        let options = DbResilienceOptions {
            retry: RetryOptions {
                max_attempts: 0,
                ..Default::default()
            },
            timeout: TimeoutOptions {
                enabled: false,
                ..Default::default()
            },
            rate_limiter: RateLimiterOptions {
                enabled: true,
                permit_limit: 1,
                replenishment_period_ms: 60_000,
            },
            ..Default::default()
        };
        let pipeline = ResiliencePipeline::from_options(&options, classifier());

        pipeline
            .execute(&ctx(), |_token| async { Ok(()) })
            .await
            .unwrap();
        let result: Result<()> = pipeline.execute(&ctx(), |_token| async { Ok(()) }).await;
        assert!(matches!(result.unwrap_err(), Error::Overloaded { .. }));
    }

    #[tokio::test]
    async fn test_bulkhead_inside_pipeline_limits_concurrency() {
        let options = DbResilienceOptions {
            retry: RetryOptions {
                max_attempts: 0,
                ..Default::default()
            },
            timeout: TimeoutOptions {
                enabled: false,
                ..Default::default()
            },
            bulkhead: BulkheadOptions {
                enabled: true,
                max_concurrent: 1,
                max_queued: 0,
            },
            ..Default::default()
        };
        let pipeline = Arc::new(ResiliencePipeline::from_options(&options, classifier()));

        let slow = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .execute(&ctx(), |_token| async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result: Result<()> = pipeline.execute(&ctx(), |_token| async { Ok(()) }).await;
        assert!(matches!(result.unwrap_err(), Error::Overloaded { .. }));
        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_provider_caches_and_invalidates() {
        let monitor = OptionsMonitor::new(DbResilienceOptions::default());
        let provider = PipelineProvider::new(monitor.clone(), classifier());

        let a = provider.get_pipeline("reports");
        let b = provider.get_pipeline("REPORTS");
        assert!(Arc::ptr_eq(&a, &b));

        provider.invalidate_all();
        let c = provider.get_pipeline("reports");
        assert!(!Arc::ptr_eq(&a, &c));

        provider.invalidate("reports");
        let d = provider.get_pipeline("reports");
        assert!(!Arc::ptr_eq(&c, &d));
    }
}
