//! Retry and circuit-breaker primitives.
//!
//! Implements retry-with-exponential-backoff (with optional jitter and a
//! per-call timeout) and a three-state circuit breaker. The runtime manager
//! composes both around sandbox boot and process spawn, where transient
//! failures are common.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

// ─────────────────────────────────────────────────────────────────────────────
// Error classification
// ─────────────────────────────────────────────────────────────────────────────

/// Coarse classification of operation failures, used to decide retryability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The operation exceeded its allotted time.
    Timeout,
    /// The sandbox runtime is not available for the operation.
    Unavailable,
    /// A process failed to start.
    Spawn,
    /// Filesystem or stream I/O failure.
    Io,
    /// Anything else.
    Other,
}

/// Implemented by error types that can be classified for retry decisions.
pub trait ClassifyError {
    fn kind(&self) -> ErrorKind;
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry
// ─────────────────────────────────────────────────────────────────────────────

/// Options controlling [`retry`].
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Cap applied to the computed backoff delay.
    pub max_delay: Duration,
    /// Multiplier per failed attempt (typically 2.0).
    pub backoff_multiplier: f64,
    /// Multiply each delay by a uniform random factor in [0.5, 1.0].
    pub jitter: bool,
    /// Race each attempt against this timeout.
    pub timeout: Option<Duration>,
    /// If non-empty, an error whose kind is not listed aborts immediately.
    pub retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            timeout: None,
            retryable_kinds: Vec::new(),
        }
    }
}

impl RetryOptions {
    /// Backoff delay before retrying after `attempt` failures (1-indexed).
    ///
    /// `initial_delay * backoff_multiplier^(attempt-1)`, capped at
    /// `max_delay`. Jitter is applied separately by the retry loop.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(exp.min(self.max_delay.as_secs_f64()))
    }

    fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable_kinds.is_empty() || self.retryable_kinds.contains(&kind)
    }
}

/// Failure modes of [`retry`] and [`retry_with_circuit_breaker`].
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// Every attempt failed; carries the last operation error.
    #[error("{last} (after {attempts} attempts)")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },
    /// The final attempt timed out.
    #[error("operation timed out after {timeout:?} (attempt {attempts})")]
    TimedOut { attempts: u32, timeout: Duration },
    /// The error kind is excluded from retry; aborted without further attempts.
    #[error("not retryable: {last}")]
    NotRetryable {
        #[source]
        last: E,
    },
    /// The circuit breaker rejected the attempt without running the operation.
    #[error("circuit breaker is open")]
    CircuitOpen,
}

enum Attempt<E> {
    Failed(E),
    TimedOut(Duration),
}

impl<E: ClassifyError> Attempt<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            Attempt::Failed(e) => e.kind(),
            Attempt::TimedOut(_) => ErrorKind::Timeout,
        }
    }
}

async fn run_attempt<T, E, F, Fut>(operation: &mut F, timeout: Option<Duration>) -> Result<T, Attempt<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, operation()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Attempt::Failed(e)),
            Err(_) => Err(Attempt::TimedOut(limit)),
        },
        None => operation().await.map_err(Attempt::Failed),
    }
}

fn apply_jitter(delay: Duration, jitter: bool) -> Duration {
    if !jitter {
        return delay;
    }
    let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

fn attempt_to_error<E: std::error::Error>(attempt: Attempt<E>, attempts: u32) -> RetryError<E> {
    match attempt {
        Attempt::Failed(last) => RetryError::Exhausted { attempts, last },
        Attempt::TimedOut(timeout) => RetryError::TimedOut { attempts, timeout },
    }
}

/// Run `operation` up to `options.max_attempts` times with exponential backoff.
///
/// A non-retryable error kind aborts immediately; the last error is surfaced
/// once attempts are exhausted.
pub async fn retry<T, E, F, Fut>(mut operation: F, options: &RetryOptions) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + ClassifyError + 'static,
{
    let mut attempt = 1u32;
    loop {
        match run_attempt(&mut operation, options.timeout).await {
            Ok(value) => return Ok(value),
            Err(failure) => {
                if !options.is_retryable(failure.kind()) {
                    return Err(match failure {
                        Attempt::Failed(last) => RetryError::NotRetryable { last },
                        Attempt::TimedOut(timeout) => RetryError::TimedOut { attempts: attempt, timeout },
                    });
                }
                if attempt >= options.max_attempts {
                    return Err(attempt_to_error(failure, attempt));
                }
                let delay = apply_jitter(options.delay_for(attempt), options.jitter);
                tracing::debug!(
                    attempt,
                    max_attempts = options.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Circuit breaker
// ─────────────────────────────────────────────────────────────────────────────

/// Circuit state: whether wrapped operations may attempt execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; consecutive failures are counted.
    Closed,
    /// Failing fast; no attempts until the reset timeout elapses.
    Open,
    /// Probing; successes close the circuit, any failure reopens it.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    circuit: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure_at: Option<Instant>,
}

/// Three-state circuit breaker guarding an unreliable operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                circuit: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                last_failure_at: None,
            }),
        }
    }

    /// Current circuit state, accounting for reset-timeout expiry.
    pub async fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().await;
        self.refresh(&mut inner);
        inner.circuit
    }

    /// Transition Open → HalfOpen once the reset timeout has elapsed.
    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.circuit == CircuitState::Open {
            let elapsed = inner
                .last_failure_at
                .map(|at| at.elapsed() >= self.reset_timeout)
                .unwrap_or(true);
            if elapsed {
                tracing::debug!("circuit breaker reset timeout elapsed, entering half-open");
                inner.circuit = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
            }
        }
    }

    /// Whether an attempt may proceed right now. `false` means fail fast.
    pub async fn acquire(&self) -> bool {
        let mut inner = self.inner.lock().await;
        self.refresh(&mut inner);
        inner.circuit != CircuitState::Open
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.circuit {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.success_threshold {
                    tracing::info!("circuit breaker closed after successful probes");
                    inner.circuit = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_failure_at = Some(Instant::now());
        match inner.circuit {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                    inner.circuit = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("circuit breaker reopened by half-open failure");
                inner.circuit = CircuitState::Open;
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Run `operation` through the breaker, recording the outcome.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        if !self.acquire().await {
            return Err(RetryError::CircuitOpen);
        }
        match operation().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(last) => {
                self.record_failure().await;
                Err(RetryError::Exhausted { attempts: 1, last })
            }
        }
    }
}

/// [`retry`] with each attempt gated by `breaker`.
///
/// An open circuit fails fast without consuming the remaining attempts:
/// callers can distinguish "still recovering" ([`RetryError::CircuitOpen`])
/// from "gave up" ([`RetryError::Exhausted`]).
pub async fn retry_with_circuit_breaker<T, E, F, Fut>(
    mut operation: F,
    options: &RetryOptions,
    breaker: &CircuitBreaker,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + ClassifyError + 'static,
{
    let mut attempt = 1u32;
    loop {
        if !breaker.acquire().await {
            return Err(RetryError::CircuitOpen);
        }
        match run_attempt(&mut operation, options.timeout).await {
            Ok(value) => {
                breaker.record_success().await;
                return Ok(value);
            }
            Err(failure) => {
                breaker.record_failure().await;
                if !options.is_retryable(failure.kind()) {
                    return Err(match failure {
                        Attempt::Failed(last) => RetryError::NotRetryable { last },
                        Attempt::TimedOut(timeout) => RetryError::TimedOut { attempts: attempt, timeout },
                    });
                }
                if attempt >= options.max_attempts {
                    return Err(attempt_to_error(failure, attempt));
                }
                let delay = apply_jitter(options.delay_for(attempt), options.jitter);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
