//! Generating several variations of one prompt.
//!
//! Member `k` (1-based) fetches `base.with_variation(k)`, so each member has
//! its own retry budget and its own cache key. Progress is modelled as an
//! explicit [`BatchState`] machine driven by [`BatchGenerator::run`]:
//!
//! ```text
//! Idle -> Generating { current: 1..=n, total: n } -> Complete | Failed
//! ```

use crate::fetch::{FailureKind, Fetch, FetchFailure, FetchOutcome};
use crate::image::{GeneratedImage, GenerationRequest};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// Maximum images per batch (hard limit).
pub const MAX_BATCH_SIZE: u32 = 10;
/// Maximum concurrent upstream calls (hard limit).
pub const MAX_CONCURRENCY: usize = 4;
/// Default pause between sequential members.
pub const DEFAULT_INTER_REQUEST_PAUSE: Duration = Duration::from_secs(1);

/// What to do when a member fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchPolicy {
    /// Abort the batch at the first failed member.
    #[default]
    StopOnFirstFailure,
    /// Run every member and keep whatever succeeded.
    CollectSuccesses,
}

/// Progress of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchState {
    /// Nothing started yet.
    Idle,
    /// Waiting on member `current` of `total`.
    Generating {
        /// 1-based member index.
        current: u32,
        /// Batch size.
        total: u32,
    },
    /// Finished with at least one image.
    Complete {
        /// Members that produced an image.
        succeeded: u32,
        /// Members that failed.
        failed: u32,
    },
    /// Aborted, or nothing succeeded.
    Failed {
        /// 1-based index of the first failed member.
        index: u32,
        /// Failure detail.
        reason: String,
    },
}

impl BatchState {
    /// Returns true for `Complete` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Failed { .. })
    }
}

/// Notifications emitted while a batch runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    /// The batch moved to a new state.
    StateChanged(BatchState),
    /// A member finished.
    MemberFinished {
        /// 1-based member index.
        index: u32,
        /// Whether it produced an image.
        success: bool,
    },
}

/// Callback invoked for each [`BatchEvent`].
pub type BatchObserver = Arc<dyn Fn(&BatchEvent) + Send + Sync>;

/// One finished member of a batch.
#[derive(Debug, Clone)]
pub struct BatchMember {
    /// 1-based member index.
    pub index: u32,
    /// The request that was sent.
    pub request: GenerationRequest,
    /// What came back.
    pub outcome: Arc<FetchOutcome>,
}

/// Result of [`BatchGenerator::run`].
#[derive(Debug, Clone)]
pub struct BatchReport {
    /// Terminal state.
    pub state: BatchState,
    /// Members that were issued, in index order.
    pub members: Vec<BatchMember>,
}

impl BatchReport {
    /// Images from successful members, in index order.
    pub fn images(&self) -> impl Iterator<Item = (u32, &GeneratedImage)> {
        self.members
            .iter()
            .filter_map(|m| m.outcome.image().map(|image| (m.index, image)))
    }

    /// Failures, in index order.
    pub fn failures(&self) -> impl Iterator<Item = (u32, &FetchFailure)> {
        self.members
            .iter()
            .filter_map(|m| m.outcome.failure_detail().map(|f| (m.index, f)))
    }

    /// Number of members that produced an image.
    pub fn succeeded(&self) -> u32 {
        self.images().count() as u32
    }

    /// Returns true when the batch ended in `Complete`.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, BatchState::Complete { .. })
    }
}

/// Drives a batch of variations through any [`Fetch`] implementation.
pub struct BatchGenerator<F> {
    fetcher: F,
    base: GenerationRequest,
    count: u32,
    policy: BatchPolicy,
    pause: Duration,
    concurrency: usize,
    observer: Option<BatchObserver>,
}

impl<F: Fetch> BatchGenerator<F> {
    /// Creates a sequential, stop-on-first-failure batch of `count`
    /// variations (clamped to `1..=MAX_BATCH_SIZE`).
    pub fn new(fetcher: F, base: GenerationRequest, count: u32) -> Self {
        Self {
            fetcher,
            base,
            count: count.clamp(1, MAX_BATCH_SIZE),
            policy: BatchPolicy::default(),
            pause: DEFAULT_INTER_REQUEST_PAUSE,
            concurrency: 1,
            observer: None,
        }
    }

    /// Sets the partial-failure policy.
    pub fn with_policy(mut self, policy: BatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the pause between sequential members.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Allows up to `n` members in flight (clamped to `1..=MAX_CONCURRENCY`).
    ///
    /// Only [`BatchPolicy::CollectSuccesses`] runs members concurrently.
    /// Under [`BatchPolicy::StopOnFirstFailure`] no member may start before
    /// the previous one has succeeded, so that policy always runs one at a
    /// time.
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.clamp(1, MAX_CONCURRENCY);
        self
    }

    /// Registers a callback for batch events.
    pub fn with_observer(mut self, observer: impl Fn(&BatchEvent) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Returns the clamped batch size.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns the wrapped fetcher.
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Runs the batch to a terminal state.
    pub async fn run(&self) -> BatchReport {
        let total = self.count;
        let concurrency = self.effective_concurrency();
        let cancel = self.fetcher.cancellation_token();
        let mut state = BatchState::Idle;
        let mut members = Vec::with_capacity(total as usize);

        tracing::info!(
            total,
            concurrency,
            policy = ?self.policy,
            "starting batch"
        );

        let fetcher = &self.fetcher;
        let base = &self.base;
        let pending = futures::stream::iter(1..=total)
            .map(move |index| {
                let request = base.with_variation(index);
                async move {
                    let outcome = fetcher.fetch(&request).await;
                    (index, request, outcome)
                }
            })
            .buffered(concurrency);
        futures::pin_mut!(pending);

        self.transition(&mut state, BatchState::Generating { current: 1, total });

        while let Some((index, request, outcome)) = pending.next().await {
            let failure = outcome.failure_detail().cloned();
            self.emit(&BatchEvent::MemberFinished {
                index,
                success: failure.is_none(),
            });
            members.push(BatchMember {
                index,
                request,
                outcome,
            });

            if let Some(failure) = failure {
                tracing::warn!(index, total, "batch member failed: {failure}");
                if self.policy == BatchPolicy::StopOnFirstFailure
                    || failure.kind == FailureKind::Cancelled
                {
                    self.transition(
                        &mut state,
                        BatchState::Failed {
                            index,
                            reason: failure.to_string(),
                        },
                    );
                    return BatchReport { state, members };
                }
            }

            if index == total {
                break;
            }

            if concurrency == 1 && !self.pause.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        self.transition(
                            &mut state,
                            BatchState::Failed {
                                index: index + 1,
                                reason: FailureKind::Cancelled.to_string(),
                            },
                        );
                        return BatchReport { state, members };
                    }
                    _ = tokio::time::sleep(self.pause) => {}
                }
            }

            self.transition(
                &mut state,
                BatchState::Generating {
                    current: index + 1,
                    total,
                },
            );
        }

        let report = BatchReport {
            state: self.final_state(&members),
            members,
        };
        self.transition(&mut state, report.state.clone());
        debug_assert!(state.is_terminal());
        report
    }

    fn effective_concurrency(&self) -> usize {
        match self.policy {
            BatchPolicy::CollectSuccesses => self.concurrency,
            BatchPolicy::StopOnFirstFailure => {
                if self.concurrency > 1 {
                    tracing::debug!(
                        requested = self.concurrency,
                        "stop-on-first-failure batches run sequentially"
                    );
                }
                1
            }
        }
    }

    fn final_state(&self, members: &[BatchMember]) -> BatchState {
        let succeeded = members.iter().filter(|m| m.outcome.is_success()).count() as u32;
        let failed = members.len() as u32 - succeeded;

        if succeeded > 0 {
            return BatchState::Complete { succeeded, failed };
        }

        let reasons: Vec<String> = members
            .iter()
            .filter_map(|m| {
                m.outcome
                    .failure_detail()
                    .map(|f| format!("image {}: {}", m.index, f))
            })
            .collect();
        BatchState::Failed {
            index: members.first().map_or(1, |m| m.index),
            reason: format!(
                "all {} generations failed:\n{}",
                members.len(),
                reasons.join("\n")
            ),
        }
    }

    fn transition(&self, state: &mut BatchState, next: BatchState) {
        tracing::debug!(from = ?state, to = ?next, "batch state change");
        *state = next;
        self.emit(&BatchEvent::StateChanged(state.clone()));
    }

    fn emit(&self, event: &BatchEvent) {
        if let Some(observer) = &self.observer {
            observer(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{GenerationMetadata, ImageFormat};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    struct FakeFetch {
        failing: HashSet<u32>,
        delay: Duration,
        seen: Mutex<Vec<String>>,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
        cancel: CancellationToken,
    }

    impl FakeFetch {
        fn new(failing: impl IntoIterator<Item = u32>) -> Self {
            Self {
                failing: failing.into_iter().collect(),
                delay: Duration::from_millis(100),
                seen: Mutex::new(Vec::new()),
                in_flight: AtomicU32::new(0),
                max_in_flight: AtomicU32::new(0),
                cancel: CancellationToken::new(),
            }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetch for FakeFetch {
        async fn fetch(&self, request: &GenerationRequest) -> Arc<FetchOutcome> {
            self.seen.lock().unwrap().push(request.prompt.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let index = request.variation.unwrap_or_default();
            if self.failing.contains(&index) {
                return Arc::new(FetchOutcome::failure(
                    FailureKind::UpstreamError,
                    "failed after 3 attempts: API error: 500 - boom",
                    3,
                ));
            }
            Arc::new(FetchOutcome::Success(GeneratedImage::new(
                vec![index as u8],
                ImageFormat::Png,
                GenerationMetadata::default(),
            )))
        }

        fn cancellation_token(&self) -> CancellationToken {
            self.cancel.clone()
        }
    }

    fn state_log() -> (Arc<Mutex<Vec<BatchState>>>, impl Fn(&BatchEvent) + Send + Sync) {
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        (states, move |event: &BatchEvent| {
            if let BatchEvent::StateChanged(state) = event {
                sink.lock().unwrap().push(state.clone());
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_batch_completes() {
        let (states, observer) = state_log();
        let batch = BatchGenerator::new(FakeFetch::new([]), GenerationRequest::new("A fox"), 3)
            .with_observer(observer);

        let report = batch.run().await;

        assert_eq!(
            report.state,
            BatchState::Complete {
                succeeded: 3,
                failed: 0
            }
        );
        assert!(report.state.is_terminal());
        assert!(!BatchState::Idle.is_terminal());
        assert!(!BatchState::Generating { current: 1, total: 3 }.is_terminal());
        assert_eq!(
            batch.fetcher().seen(),
            vec!["A fox Variation 1", "A fox Variation 2", "A fox Variation 3"]
        );
        assert_eq!(batch.fetcher().max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(
            states.lock().unwrap().as_slice(),
            &[
                BatchState::Generating { current: 1, total: 3 },
                BatchState::Generating { current: 2, total: 3 },
                BatchState::Generating { current: 3, total: 3 },
                BatchState::Complete {
                    succeeded: 3,
                    failed: 0
                },
            ]
        );
        let indices: Vec<u32> = report.images().map(|(i, _)| i).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_batch_pauses_between_members() {
        let batch = BatchGenerator::new(FakeFetch::new([]), GenerationRequest::new("A fox"), 3)
            .with_pause(Duration::from_secs(2));

        let start = tokio::time::Instant::now();
        batch.run().await;

        // three 100ms calls plus two pauses
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(4300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(4400), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_first_failure_skips_remaining() {
        let batch = BatchGenerator::new(FakeFetch::new([2]), GenerationRequest::new("A fox"), 4);

        let report = batch.run().await;

        assert!(matches!(report.state, BatchState::Failed { index: 2, .. }));
        assert!(report.state.is_terminal());
        assert_eq!(report.members.len(), 2);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(batch.fetcher().seen().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_first_failure_ignores_concurrency() {
        let (states, observer) = state_log();
        let batch = BatchGenerator::new(FakeFetch::new([1]), GenerationRequest::new("A fox"), 4)
            .with_concurrency(4)
            .with_observer(observer);

        let report = batch.run().await;

        assert!(matches!(report.state, BatchState::Failed { index: 1, .. }));
        assert_eq!(batch.fetcher().seen(), vec!["A fox Variation 1"]);
        assert_eq!(batch.fetcher().max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(report.members.len(), 1);
        assert!(states.lock().unwrap().last().is_some_and(BatchState::is_terminal));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_successes_runs_everything() {
        let batch = BatchGenerator::new(FakeFetch::new([2, 4]), GenerationRequest::new("A fox"), 4)
            .with_policy(BatchPolicy::CollectSuccesses);

        let report = batch.run().await;

        assert_eq!(
            report.state,
            BatchState::Complete {
                succeeded: 2,
                failed: 2
            }
        );
        let failed: Vec<u32> = report.failures().map(|(i, _)| i).collect();
        assert_eq!(failed, vec![2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_successes_with_no_successes_fails() {
        let batch = BatchGenerator::new(FakeFetch::new([1, 2]), GenerationRequest::new("A fox"), 2)
            .with_policy(BatchPolicy::CollectSuccesses);

        let report = batch.run().await;

        match report.state {
            BatchState::Failed { index, reason } => {
                assert_eq!(index, 1);
                assert!(reason.starts_with("all 2 generations failed"), "{reason}");
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_capped() {
        let batch = BatchGenerator::new(FakeFetch::new([]), GenerationRequest::new("A fox"), 10)
            .with_concurrency(16)
            .with_policy(BatchPolicy::CollectSuccesses);

        let report = batch.run().await;

        assert_eq!(report.succeeded(), 10);
        assert_eq!(
            batch.fetcher().max_in_flight.load(Ordering::SeqCst),
            MAX_CONCURRENCY as u32
        );
        let indices: Vec<u32> = report.members.iter().map(|m| m.index).collect();
        assert_eq!(indices, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_is_clamped() {
        let batch = BatchGenerator::new(FakeFetch::new([]), GenerationRequest::new("A fox"), 0);
        assert_eq!(batch.count(), 1);

        let batch = BatchGenerator::new(FakeFetch::new([]), GenerationRequest::new("A fox"), 50);
        assert_eq!(batch.count(), MAX_BATCH_SIZE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_pause_fails_batch() {
        let fetch = FakeFetch::new([]);
        let token = fetch.cancel.clone();
        let batch = BatchGenerator::new(fetch, GenerationRequest::new("A fox"), 3)
            .with_pause(Duration::from_secs(30));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            token.cancel();
        });

        let report = batch.run().await;

        assert!(matches!(report.state, BatchState::Failed { index: 2, .. }));
        assert_eq!(report.members.len(), 1);
    }
}
