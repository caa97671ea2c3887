//! Resilient fetching on top of a single [`ImageProvider`].
//!
//! [`ResilientFetcher`] issues one upstream call per attempt and picks the
//! wait before the next attempt from the failure class:
//!
//! - **429 rate limited**: `initial_wait * 2^attempt` (zero-based), never
//!   shorter than a `Retry-After` hint.
//! - **503 model loading**: exactly the server's `estimated_time`, or
//!   [`RetryPolicy::cold_start_default_wait`] when absent.
//! - **other status / transport failure**: `initial_wait`.
//!
//! Every outcome, including bad input and cancellation, comes back as a
//! [`FetchOutcome`]; nothing is propagated as an error.

use crate::error::{DreamPixelError, Result};
use crate::image::{GeneratedImage, GenerationRequest, ImageProvider};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default number of attempts per fetch.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default base wait between attempts.
pub const DEFAULT_INITIAL_WAIT: Duration = Duration::from_secs(1);
/// Wait used for a cold start when the upstream gives no estimate.
pub const DEFAULT_COLD_START_WAIT: Duration = Duration::from_secs(5);

const BACKOFF_MULTIPLIER: u32 = 2;

const MAX_ATTEMPTS_ENV_VAR: &str = "DREAMPIXEL_MAX_ATTEMPTS";
const INITIAL_WAIT_ENV_VAR: &str = "DREAMPIXEL_INITIAL_WAIT_SECS";

/// How many times to call the upstream and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Must be at least 1.
    pub max_attempts: u32,
    /// Base wait; doubled per attempt for rate-limit responses.
    pub initial_wait: Duration,
    /// Cold-start wait when the upstream does not send `estimated_time`.
    pub cold_start_default_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_wait: DEFAULT_INITIAL_WAIT,
            cold_start_default_wait: DEFAULT_COLD_START_WAIT,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempt budget and base wait.
    pub fn new(max_attempts: u32, initial_wait: Duration) -> Self {
        Self {
            max_attempts,
            initial_wait,
            ..Self::default()
        }
    }

    /// Reads `DREAMPIXEL_MAX_ATTEMPTS` and `DREAMPIXEL_INITIAL_WAIT_SECS`,
    /// keeping defaults for unset variables.
    pub fn from_env() -> Result<Self> {
        let mut policy = Self::default();

        if let Ok(raw) = std::env::var(MAX_ATTEMPTS_ENV_VAR) {
            policy.max_attempts = raw.trim().parse().map_err(|_| {
                DreamPixelError::InvalidRequest(format!(
                    "{MAX_ATTEMPTS_ENV_VAR} must be a positive integer, got '{raw}'"
                ))
            })?;
        }
        if let Ok(raw) = std::env::var(INITIAL_WAIT_ENV_VAR) {
            policy.initial_wait = raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .ok_or_else(|| {
                    DreamPixelError::InvalidRequest(format!(
                        "{INITIAL_WAIT_ENV_VAR} must be a non-negative number, got '{raw}'"
                    ))
                })?;
        }

        policy.validate()?;
        Ok(policy)
    }

    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the base wait.
    pub fn with_initial_wait(mut self, wait: Duration) -> Self {
        self.initial_wait = wait;
        self
    }

    /// Sets the cold-start fallback wait.
    pub fn with_cold_start_default_wait(mut self, wait: Duration) -> Self {
        self.cold_start_default_wait = wait;
        self
    }

    /// Checks the policy before use.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DreamPixelError::InvalidRequest(
                "max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Wait after a rate-limited attempt with zero-based index `attempt`.
    ///
    /// This is the backoff alone. When the 429 carries a `Retry-After`
    /// header the fetcher waits for the larger of the two, so the actual
    /// wait can exceed `initial_wait * 2^attempt`.
    pub fn rate_limit_wait(&self, attempt: u32) -> Duration {
        BACKOFF_MULTIPLIER
            .checked_pow(attempt)
            .and_then(|factor| self.initial_wait.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// Wait after a cold-start response.
    pub fn cold_start_wait(&self, estimated_time: Option<Duration>) -> Duration {
        estimated_time.unwrap_or(self.cold_start_default_wait)
    }
}

/// Terminal failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The request or policy was malformed; no call was made.
    InvalidArgument,
    /// Attempts ran out while the upstream kept answering 429.
    RateLimited,
    /// Attempts ran out while the model was still loading.
    UpstreamUnavailable,
    /// Attempts ran out on connection errors or timeouts.
    TransportError,
    /// The upstream answered with some other error.
    UpstreamError,
    /// The caller cancelled the fetch.
    Cancelled,
}

impl FailureKind {
    /// Classifies a provider error.
    pub fn of(err: &DreamPixelError) -> Self {
        match err {
            DreamPixelError::InvalidRequest(_) => Self::InvalidArgument,
            DreamPixelError::RateLimited { .. } => Self::RateLimited,
            DreamPixelError::ModelLoading { .. } => Self::UpstreamUnavailable,
            DreamPixelError::Network(_) | DreamPixelError::Timeout(_) => Self::TransportError,
            DreamPixelError::Cancelled => Self::Cancelled,
            DreamPixelError::Api { .. }
            | DreamPixelError::Auth(_)
            | DreamPixelError::Decode(_)
            | DreamPixelError::Io(_)
            | DreamPixelError::Json(_) => Self::UpstreamError,
        }
    }

    /// Returns a short identifier, e.g. `"rate_limited"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::RateLimited => "rate_limited",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::TransportError => "transport_error",
            Self::UpstreamError => "upstream_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a fetch gave up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {reason}")]
pub struct FetchFailure {
    /// Failure class.
    pub kind: FailureKind,
    /// Human-readable detail, including the last upstream error.
    pub reason: String,
    /// Upstream calls made before giving up.
    pub attempts: u32,
}

/// Result of a fetch: either image bytes or a terminal failure.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The upstream returned an image.
    Success(GeneratedImage),
    /// The fetch gave up.
    Failure(FetchFailure),
}

impl FetchOutcome {
    /// Builds a failure outcome.
    pub fn failure(kind: FailureKind, reason: impl Into<String>, attempts: u32) -> Self {
        Self::Failure(FetchFailure {
            kind,
            reason: reason.into(),
            attempts,
        })
    }

    /// Builds a failure outcome classified from a provider error.
    pub fn from_error(err: &DreamPixelError, attempts: u32) -> Self {
        Self::failure(FailureKind::of(err), err.to_string(), attempts)
    }

    /// Returns true on success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns the image on success.
    pub fn image(&self) -> Option<&GeneratedImage> {
        match self {
            Self::Success(image) => Some(image),
            Self::Failure(_) => None,
        }
    }

    /// Returns the failure, if any.
    pub fn failure_detail(&self) -> Option<&FetchFailure> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure),
        }
    }

    /// Converts into a `Result` for `?`-style callers.
    pub fn into_result(self) -> std::result::Result<GeneratedImage, FetchFailure> {
        match self {
            Self::Success(image) => Ok(image),
            Self::Failure(failure) => Err(failure),
        }
    }
}

/// A wait the fetcher is about to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// Waiting after a 429.
    RateLimitWait {
        /// Zero-based index of the attempt that was rate limited.
        attempt: u32,
        /// How long the fetcher will sleep.
        wait: Duration,
    },
    /// Waiting for the upstream model to load.
    ColdStartWait {
        /// Zero-based index of the attempt that hit the cold start.
        attempt: u32,
        /// How long the fetcher will sleep.
        wait: Duration,
    },
    /// Waiting after some other retryable failure.
    RetryWait {
        /// Zero-based index of the failed attempt.
        attempt: u32,
        /// How long the fetcher will sleep.
        wait: Duration,
        /// The error that caused the retry.
        error: String,
    },
}

impl FetchEvent {
    /// Returns the wait duration.
    pub fn wait(&self) -> Duration {
        match self {
            Self::RateLimitWait { wait, .. }
            | Self::ColdStartWait { wait, .. }
            | Self::RetryWait { wait, .. } => *wait,
        }
    }

    /// Returns the zero-based attempt index that triggered the wait.
    pub fn attempt(&self) -> u32 {
        match self {
            Self::RateLimitWait { attempt, .. }
            | Self::ColdStartWait { attempt, .. }
            | Self::RetryWait { attempt, .. } => *attempt,
        }
    }
}

/// Callback invoked before every wait.
pub type FetchObserver = Arc<dyn Fn(&FetchEvent) + Send + Sync>;

/// Anything that turns a request into a shared [`FetchOutcome`].
///
/// Implemented by [`ResilientFetcher`] and by decorators such as
/// [`CachedFetcher`](crate::cache::CachedFetcher).
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Fetches an image for `request`.
    async fn fetch(&self, request: &GenerationRequest) -> Arc<FetchOutcome>;

    /// Token that aborts in-progress fetches when cancelled.
    fn cancellation_token(&self) -> CancellationToken;
}

#[async_trait]
impl<F: Fetch + ?Sized> Fetch for Arc<F> {
    async fn fetch(&self, request: &GenerationRequest) -> Arc<FetchOutcome> {
        (**self).fetch(request).await
    }

    fn cancellation_token(&self) -> CancellationToken {
        (**self).cancellation_token()
    }
}

/// Retrying client around one [`ImageProvider`].
pub struct ResilientFetcher<P> {
    provider: P,
    policy: RetryPolicy,
    observer: Option<FetchObserver>,
    cancel: CancellationToken,
}

impl<P: ImageProvider> ResilientFetcher<P> {
    /// Wraps `provider` with the given retry policy.
    pub fn new(provider: P, policy: RetryPolicy) -> Self {
        Self {
            provider,
            policy,
            observer: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Registers a callback for wait events.
    pub fn with_observer(mut self, observer: impl Fn(&FetchEvent) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Uses `token` for cancellation instead of a private one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Returns the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the wrapped provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Runs the attempt loop for `request`.
    pub async fn execute(&self, request: &GenerationRequest) -> FetchOutcome {
        if let Err(e) = self.policy.validate().and_then(|_| request.validate()) {
            tracing::debug!(error = %e, "rejecting request before any upstream call");
            return FetchOutcome::from_error(&e, 0);
        }

        let max_attempts = self.policy.max_attempts;
        let mut last_error = None;

        for attempt in 0..max_attempts {
            let attempts_made = attempt + 1;

            if self.cancel.is_cancelled() {
                return cancelled(attempt);
            }

            // the call is on the wire once polled, so it counts as made
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return cancelled(attempts_made),
                result = self.provider.generate(request) => result,
            };

            let err = match result {
                Ok(image) => {
                    tracing::debug!(
                        attempt = attempts_made,
                        bytes = image.size(),
                        provider = self.provider.name(),
                        "fetch succeeded"
                    );
                    return FetchOutcome::Success(image);
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                tracing::warn!(attempt = attempts_made, "giving up on non-retryable error: {err}");
                return FetchOutcome::from_error(&err, attempts_made);
            }

            if attempts_made == max_attempts {
                last_error = Some(err);
                break;
            }

            let event = self.wait_event(attempt, &err);
            let wait = event.wait();
            tracing::warn!(
                attempt = attempts_made,
                max_attempts,
                wait_ms = wait.as_millis() as u64,
                "retrying after transient error: {err}"
            );
            if let Some(observer) = &self.observer {
                observer(&event);
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return cancelled(attempts_made),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        match last_error {
            Some(err) => {
                tracing::error!(attempts = max_attempts, "fetch failed: {err}");
                FetchOutcome::failure(
                    FailureKind::of(&err),
                    format!(
                        "failed after {max_attempts} attempt{}: {err}",
                        if max_attempts == 1 { "" } else { "s" }
                    ),
                    max_attempts,
                )
            }
            None => FetchOutcome::failure(FailureKind::UpstreamError, "no attempts were made", 0),
        }
    }

    fn wait_event(&self, attempt: u32, err: &DreamPixelError) -> FetchEvent {
        match err {
            DreamPixelError::RateLimited { .. } => {
                let backoff = self.policy.rate_limit_wait(attempt);
                FetchEvent::RateLimitWait {
                    attempt,
                    wait: err.retry_after().map_or(backoff, |hint| hint.max(backoff)),
                }
            }
            DreamPixelError::ModelLoading { .. } => FetchEvent::ColdStartWait {
                attempt,
                wait: self.policy.cold_start_wait(err.retry_after()),
            },
            other => FetchEvent::RetryWait {
                attempt,
                wait: self.policy.initial_wait,
                error: other.to_string(),
            },
        }
    }
}

fn cancelled(attempts: u32) -> FetchOutcome {
    tracing::info!(attempts, "fetch cancelled");
    FetchOutcome::from_error(&DreamPixelError::Cancelled, attempts)
}

#[async_trait]
impl<P: ImageProvider> Fetch for ResilientFetcher<P> {
    async fn fetch(&self, request: &GenerationRequest) -> Arc<FetchOutcome> {
        Arc::new(self.execute(request).await)
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// One-shot fetch against a Hugging Face style endpoint.
///
/// Builder errors (bad URL, blank credential) come back as
/// [`FailureKind::InvalidArgument`] with zero attempts.
#[cfg(feature = "huggingface")]
pub async fn fetch(
    request: &GenerationRequest,
    endpoint: &str,
    credentials: &str,
    policy: RetryPolicy,
) -> FetchOutcome {
    let provider = match crate::image::providers::HuggingFaceProvider::builder()
        .endpoint(endpoint)
        .api_key(credentials)
        .build()
    {
        Ok(provider) => provider,
        Err(e) => return FetchOutcome::failure(FailureKind::InvalidArgument, e.to_string(), 0),
    };
    ResilientFetcher::new(provider, policy).execute(request).await
}
