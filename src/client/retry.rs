//! Bounded, cancellable retries for outbound unary calls.
//!
//! Errors are classified by gRPC status code: transient codes are retried
//! after a jittered exponential backoff, everything else (including errors
//! that carry no status code) is returned immediately. The last attempt's
//! error is returned unchanged once attempts run out.
//!
//! The wrapped call may not be idempotent. Only route calls through
//! [`RetryPolicy`] whose side effects tolerate at-least-once delivery.

use std::future::{Future, pending};
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use tracing::{debug, warn};

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Retryable,
    NonRetryable,
}

/// Classify a gRPC status code.
#[must_use]
pub const fn classify(code: Code) -> Retryability {
    match code {
        Code::Unavailable
        | Code::DeadlineExceeded
        | Code::ResourceExhausted
        | Code::Aborted
        | Code::Unknown
        | Code::Internal => Retryability::Retryable,
        Code::Ok
        | Code::Cancelled
        | Code::InvalidArgument
        | Code::NotFound
        | Code::AlreadyExists
        | Code::PermissionDenied
        | Code::Unauthenticated
        | Code::FailedPrecondition
        | Code::OutOfRange
        | Code::Unimplemented
        | Code::DataLoss => Retryability::NonRetryable,
    }
}

/// Errors that may carry a gRPC status code.
pub trait GrpcError {
    fn grpc_code(&self) -> Option<Code>;

    fn retryability(&self) -> Retryability {
        self.grpc_code()
            .map_or(Retryability::NonRetryable, classify)
    }
}

impl GrpcError for Status {
    fn grpc_code(&self) -> Option<Code> {
        Some(self.code())
    }
}

impl GrpcError for anyhow::Error {
    fn grpc_code(&self) -> Option<Code> {
        self.chain()
            .find_map(|e| e.downcast_ref::<Status>())
            .map(Status::code)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryConfigError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("backoff_multiplier must be greater than 1, got {0}")]
    Multiplier(f64),
    #[error("jitter must be within [0, 1], got {0}")]
    Jitter(f64),
    #[error("initial_backoff {initial:?} exceeds max_backoff {max:?}")]
    BackoffRange { initial: Duration, max: Duration },
}

/// Retry tuning. Immutable once validated.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff_multiplier: f64,
    jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// # Errors
    /// Returns [`RetryConfigError`] when a value is out of range.
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
        jitter: f64,
    ) -> Result<Self, RetryConfigError> {
        if max_attempts == 0 {
            return Err(RetryConfigError::ZeroAttempts);
        }
        if !(backoff_multiplier > 1.0 && backoff_multiplier.is_finite()) {
            return Err(RetryConfigError::Multiplier(backoff_multiplier));
        }
        if !(0.0..=1.0).contains(&jitter) {
            return Err(RetryConfigError::Jitter(jitter));
        }
        if initial_backoff > max_backoff {
            return Err(RetryConfigError::BackoffRange {
                initial: initial_backoff,
                max: max_backoff,
            });
        }

        Ok(Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            jitter,
        })
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    #[must_use]
    pub const fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    #[must_use]
    pub const fn jitter(&self) -> f64 {
        self.jitter
    }
}

/// Cancellation and deadline of one logical call, shared by all its attempts.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub const fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if one is set.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Drive `fut` unless the call is cancelled or its deadline passes first.
    async fn run<T>(&self, fut: impl Future<Output = T>) -> Result<T, Status> {
        let deadline = async {
            match self.deadline {
                Some(at) => sleep_until(at).await,
                None => pending().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Status::cancelled("call cancelled")),
            () = deadline => Err(Status::deadline_exceeded("call deadline exceeded")),
            output = fut => Ok(output),
        }
    }
}

/// Retry loop around a single outbound unary call.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff before the retry following 0-based `attempt`, without jitter.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let cap = self.config.max_backoff.as_nanos() as f64;
        let exp = attempt.min(i32::MAX as u32) as i32;
        let nanos = (self.config.initial_backoff.as_nanos() as f64
            * self.config.backoff_multiplier.powi(exp))
        .min(cap);
        Duration::from_nanos(nanos as u64)
    }

    /// [`Self::backoff`] perturbed by up to `±jitter` of itself, never negative.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if self.config.jitter == 0.0 || base.is_zero() {
            return base;
        }

        let base_nanos = base.as_nanos() as f64;
        let spread = base_nanos * self.config.jitter;
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_nanos((base_nanos + offset).max(0.0) as u64)
    }

    /// Invoke `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Every attempt receives a fresh request carrying a clone of `message`
    /// and `metadata`, plus a `grpc-timeout` for whatever remains of the
    /// context's deadline. Both the attempt and the backoff sleep yield
    /// `Cancelled` / `DeadlineExceeded` as soon as `ctx` fires.
    ///
    /// # Errors
    /// The first non-retryable error, the final attempt's error, or the
    /// context's error if it fires first.
    pub async fn call<M, R, E, F, Fut>(
        &self,
        ctx: &CallContext,
        message: &M,
        metadata: &MetadataMap,
        mut call: F,
    ) -> Result<R, E>
    where
        M: Clone,
        E: GrpcError + From<Status>,
        F: FnMut(tonic::Request<M>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let max_attempts = self.config.max_attempts;
        let mut attempt = 0;

        loop {
            let mut request = tonic::Request::new(message.clone());
            *request.metadata_mut() = metadata.clone();
            if let Some(remaining) = ctx.remaining() {
                request.set_timeout(remaining);
            }

            let err = match ctx.run(call(request)).await.map_err(E::from)? {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if attempt + 1 >= max_attempts {
                debug!(attempts = attempt + 1, "Retry attempts exhausted");
                return Err(err);
            }

            let code = err.grpc_code();
            if err.retryability() == Retryability::NonRetryable {
                debug!(attempt, code = ?code, "Non-retryable error");
                return Err(err);
            }

            let delay = self.jittered_backoff(attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts,
                code = ?code,
                backoff_ms = delay.as_millis(),
                "Retrying call"
            );
            metrics::counter!("grpc_client_retries_total", "code" => format!("{code:?}"))
                .increment(1);

            ctx.run(sleep(delay)).await.map_err(E::from)?;
            attempt += 1;
        }
    }
}
