//! Exponential-backoff retry engine.
//!
//! Three entry points share one attempt loop:
//! - [`retry_with_backoff`] retries on error kinds,
//! - [`retry_http_request`] additionally retries on response status codes,
//! - [`retry_database_operation`] retries every non-caller fault with a
//!   tighter delay ceiling.
//!
//! Transient attempts log at `warn`; only the final failure logs at `error`.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use marketops_core::{config::RetrySettings, Error, ErrorKind, Result, StatusResponse};

/// Statuses retried by default.
pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];

/// Maximum extra delay added by jitter, as a fraction of the base delay.
const JITTER_FRACTION: f64 = 0.1;

const TOO_MANY_REQUESTS: u16 = 429;

/// Which error kinds are worth another attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryableKinds {
    /// Every kind except caller faults and circuit-open rejections.
    All,
    /// Only the listed kinds.
    Only(HashSet<ErrorKind>),
}

/// Retry policy. Built once and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    exponential_base: f64,
    jitter: bool,
    retryable_kinds: RetryableKinds,
    retryable_status_codes: HashSet<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            retryable_kinds: RetryableKinds::Only(
                [ErrorKind::Transport, ErrorKind::Timeout].into_iter().collect(),
            ),
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.into_iter().collect(),
        }
    }
}

impl RetryConfig {
    /// Default policy for outbound HTTP calls.
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy for document-store calls. Drivers raise heterogeneous errors,
    /// so every kind is retried, with a 5 second ceiling.
    pub fn for_database() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            retryable_kinds: RetryableKinds::All,
            ..Self::default()
        }
    }

    /// Build from externally supplied settings.
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::default()
            .with_max_attempts(settings.max_attempts)
            .with_initial_delay(secs_to_delay(settings.initial_delay_secs))
            .with_max_delay(secs_to_delay(settings.max_delay_secs))
            .with_exponential_base(settings.exponential_base)
            .with_jitter(settings.jitter)
            .with_retryable_status_codes(settings.retryable_status_codes.iter().copied())
    }

    /// Total attempts, including the first. Values below 1 become 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Growth factor between attempts. Non-finite or negative values become 1.
    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = if base.is_finite() && base >= 0.0 {
            base
        } else {
            1.0
        };
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Retry only the listed error kinds.
    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_kinds = RetryableKinds::Only(kinds.into_iter().collect());
        self
    }

    /// Retry every error kind that is not a caller fault.
    pub fn retry_all_kinds(mut self) -> Self {
        self.retryable_kinds = RetryableKinds::All;
        self
    }

    pub fn with_retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    pub fn retryable_kinds(&self) -> &RetryableKinds {
        &self.retryable_kinds
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// Whether `error` may be retried based on its kind alone.
    ///
    /// Caller faults and circuit-open rejections never are.
    pub fn is_retryable(&self, error: &Error) -> bool {
        if error.is_caller_fault() {
            return false;
        }
        match error.kind() {
            ErrorKind::CircuitOpen | ErrorKind::RetryExhausted => false,
            kind => match &self.retryable_kinds {
                RetryableKinds::All => true,
                RetryableKinds::Only(kinds) => kinds.contains(&kind),
            },
        }
    }

    /// Delay after failed attempt `attempt` (1-based), without jitter:
    /// `min(initial × base^(attempt-1), max_delay)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        secs_to_delay(secs).min(self.max_delay)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if self.jitter {
            delay + delay.mul_f64(rand::random::<f64>() * JITTER_FRACTION)
        } else {
            delay
        }
    }
}

/// Convert seconds to a delay. Negative, zero and NaN clamp to zero.
pub fn secs_to_delay(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return secs.is_finite().then(|| secs_to_delay(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let remaining = at.with_timezone(&Utc) - Utc::now();
    Some(remaining.to_std().unwrap_or(Duration::ZERO))
}

enum Verdict<T> {
    Return(Result<T>),
    Retry {
        error: Error,
        retry_after: Option<Duration>,
    },
}

/// Retry `operation` with exponential backoff.
///
/// Errors whose kind is not retryable are returned as-is after a single
/// invocation. When every attempt fails, the last error is wrapped in
/// `Error::RetryExhausted`.
pub async fn retry_with_backoff<T, F, Fut>(operation: F, config: &RetryConfig, name: &str) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    run_attempts(operation, config, name, |outcome| match outcome {
        Err(error) if config.is_retryable(&error) => Verdict::Retry {
            error,
            retry_after: None,
        },
        other => Verdict::Return(other),
    })
    .await
}

/// Retry an HTTP call, treating retryable status codes as failures.
///
/// A status in the config's retryable set is retried whether it arrives as a
/// successful response or as `Error::UpstreamStatus`; on 429 a `Retry-After`
/// hint replaces the computed delay (bounded by `max_delay`). Any other
/// status is returned to the caller unchanged.
pub async fn retry_http_request<R, F, Fut>(operation: F, config: &RetryConfig, name: &str) -> Result<R>
where
    R: StatusResponse,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    run_attempts(operation, config, name, |outcome| match outcome {
        Ok(response) if config.is_retryable_status(response.status()) => {
            let status = response.status();
            let retry_after = if status == TOO_MANY_REQUESTS {
                response.header("retry-after").and_then(parse_retry_after)
            } else {
                None
            };
            Verdict::Retry {
                error: Error::UpstreamStatus {
                    status,
                    body: String::new(),
                    retry_after,
                },
                retry_after,
            }
        }
        Err(error) => match error.upstream_status() {
            Some(status) if config.is_retryable_status(status) => Verdict::Retry {
                retry_after: if status == TOO_MANY_REQUESTS {
                    error.retry_after()
                } else {
                    None
                },
                error,
            },
            Some(_) => Verdict::Return(Err(error)),
            None if config.is_retryable(&error) => Verdict::Retry {
                error,
                retry_after: None,
            },
            None => Verdict::Return(Err(error)),
        },
        ok => Verdict::Return(ok),
    })
    .await
}

/// Retry a document-store call with [`RetryConfig::for_database`].
pub async fn retry_database_operation<T, F, Fut>(operation: F, name: &str) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_backoff(operation, &RetryConfig::for_database(), name).await
}

async fn run_attempts<T, F, Fut, C>(
    mut operation: F,
    config: &RetryConfig,
    name: &str,
    classify: C,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Fn(Result<T>) -> Verdict<T>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        match classify(operation().await) {
            Verdict::Return(Ok(value)) => {
                if attempt > 1 {
                    tracing::info!(operation = name, attempts = attempt, "Operation succeeded after retry");
                }
                record_outcome(name, "success", started);
                return Ok(value);
            }
            Verdict::Return(Err(error)) => {
                tracing::debug!(operation = name, attempt, error = %error, "Non-retryable failure");
                record_outcome(name, "non_retryable", started);
                return Err(error);
            }
            Verdict::Retry { error, retry_after } => {
                if attempt >= config.max_attempts {
                    tracing::error!(
                        operation = name,
                        attempts = attempt,
                        error = %error,
                        "Retries exhausted"
                    );
                    record_outcome(name, "exhausted", started);
                    return Err(Error::RetryExhausted {
                        operation: name.to_string(),
                        attempts: attempt,
                        source: Box::new(error),
                    });
                }

                let delay = match retry_after {
                    Some(hint) => hint.min(config.max_delay),
                    None => config.jittered_delay(attempt),
                };

                tracing::warn!(
                    operation = name,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Retryable failure, backing off"
                );
                metrics::counter!("retry_attempts_total", "operation" => name.to_string()).increment(1);

                pause(delay).await;
            }
        }
    }
}

/// Suspend for `delay`; a zero delay still yields to the scheduler.
async fn pause(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delay).await;
    }
}

fn record_outcome(name: &str, outcome: &'static str, started: Instant) {
    metrics::counter!(
        "retry_operations_total",
        "operation" => name.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("retry_operation_duration_seconds", "operation" => name.to_string())
        .record(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketops_core::HttpResponse;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryConfig {
        RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(false)
    }

    #[test]
    fn test_backoff_schedule_is_capped() {
        let config = no_jitter();
        let delays: Vec<u64> = (1..=5).map(|k| config.backoff_delay(k).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_negative_settings_clamp_to_zero() {
        let settings = RetrySettings {
            max_attempts: 0,
            initial_delay_secs: -3.0,
            max_delay_secs: f64::NAN,
            ..RetrySettings::default()
        };
        let config = RetryConfig::from_settings(&settings);
        assert_eq!(config.max_attempts(), 1);
        assert_eq!(config.initial_delay(), Duration::ZERO);
        assert_eq!(config.backoff_delay(3), Duration::ZERO);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("0.5"), Some(Duration::from_millis(500)));
        assert_eq!(parse_retry_after("-4"), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<()> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::transport("connection refused")) }
            },
            &no_jitter(),
            "exhaust",
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert_eq!(err.attempts(), Some(3));
        // 1s after attempt 1, 2s after attempt 2, nothing after the last.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_invoked_once() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Storage("disk full".into())) }
            },
            &no_jitter(),
            "non_retryable",
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Storage);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);

        let value = retry_with_backoff(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(Error::Timeout("read timed out".into()))
                    } else {
                        Ok(n)
                    }
                }
            },
            &no_jitter(),
            "recovers",
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_config() {
        let calls = AtomicU32::new(0);
        let config = no_jitter().with_max_attempts(1);

        let err = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::transport("reset")) }
            },
            &config,
            "single",
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_open_never_retried() {
        let calls = AtomicU32::new(0);
        let config = no_jitter().retry_all_kinds();

        let err = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(Error::CircuitOpen {
                        name: "meta_ads".into(),
                        retry_after: Duration::from_secs(30),
                    })
                }
            },
            &config,
            "open",
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_still_completes() {
        let calls = AtomicU32::new(0);
        let config = no_jitter().with_initial_delay(Duration::ZERO).with_max_attempts(4);

        let err = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::transport("reset")) }
            },
            &config,
            "zero_delay",
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts(), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_http_retries_retryable_status_then_succeeds() {
        let calls = AtomicU32::new(0);

        let response = retry_http_request(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(HttpResponse::new(if n < 3 { 503 } else { 200 })) }
            },
            &no_jitter(),
            "http_ok",
        )
        .await
        .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_http_non_retryable_status_returned_as_is() {
        let calls = AtomicU32::new(0);

        let response = retry_http_request(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(HttpResponse::new(404)) }
            },
            &no_jitter(),
            "http_404",
        )
        .await
        .unwrap();

        assert_eq!(response.status(), 404);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_http_429_honors_retry_after() {
        let calls = AtomicU32::new(0);
        let config = no_jitter().with_max_delay(Duration::from_secs(30));
        let started = Instant::now();

        let response = retry_http_request(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        Ok(HttpResponse::new(429).with_header("Retry-After", "7"))
                    } else {
                        Ok(HttpResponse::new(200))
                    }
                }
            },
            &config,
            "http_429",
        )
        .await
        .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_http_upstream_error_exhausts_with_status() {
        let err = retry_http_request(
            || async {
                Err::<HttpResponse, _>(Error::UpstreamStatus {
                    status: 502,
                    body: "bad gateway".into(),
                    retry_after: None,
                })
            },
            &no_jitter(),
            "http_502",
        )
        .await
        .unwrap_err();

        assert_eq!(err.attempts(), Some(3));
        assert_eq!(err.upstream_status(), Some(502));
    }

    #[tokio::test(start_paused = true)]
    async fn test_database_retries_storage_but_not_security() {
        let calls = AtomicU32::new(0);
        let value = retry_database_operation(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        Err(Error::storage("pool timeout"))
                    } else {
                        Ok("doc")
                    }
                }
            },
            "db_find",
        )
        .await
        .unwrap();
        assert_eq!(value, "doc");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let calls = AtomicU32::new(0);
        let err = retry_database_operation(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(Error::security(
                        marketops_core::ViolationKind::TenantMismatch,
                        "org_b",
                    ))
                }
            },
            "db_guard",
        )
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::Security);
    }
}
