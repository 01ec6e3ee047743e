//! Bounded-concurrency batch execution with retry, backoff and timeouts.
//!
//! ## Overview
//!
//! [`BatchProcessor::process_batch`] spawns one tokio task per item. A
//! shared semaphore caps how many run at once and results flow back over an
//! mpsc channel. Every call is wrapped in a timeout and retried with
//! exponential backoff (`retry_delay × 2^attempt`). An item that exhausts
//! its retries becomes a [`BatchFailure`]; a failure never aborts the batch.
//!
//! Two other modes share the same retry wrapper:
//! - [`BatchProcessor::process_throttled`] runs strictly one item at a time
//!   with a fixed delay between items
//! - [`BatchProcessor::smart_batch`] picks sequential, throttled or parallel
//!   execution from the item count and an estimated rate

use crate::config::BatchConfig;
use crate::error::{Result, VisionError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Batches this small always run sequentially in [`BatchProcessor::smart_batch`].
const SMALL_BATCH: usize = 3;
const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_millis(100);

/// Receives `(completed, total)` after every finished item.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Concurrency for `n` items: `clamp(ceil(n / 10), 2, 8)`, capped by the
/// number of CPUs.
#[must_use = "returns the concurrency limit"]
pub fn auto_concurrency(n: usize) -> usize {
    n.div_ceil(10).clamp(2, 8).min(num_cpus::get()).max(1)
}

/// An item that failed after every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub index: usize,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Mean wall time of successful items, retries included
    pub avg_time: Duration,
}

/// Outcome of a batch run.
#[derive(Debug)]
pub struct BatchResult<R> {
    /// `(index, value)` pairs in ascending index order
    pub successes: Vec<(usize, R)>,
    /// Failures in ascending index order
    pub failures: Vec<BatchFailure>,
    pub duration: Duration,
    pub stats: BatchStats,
}

impl<R> BatchResult<R> {
    /// Successful values in index order, dropping the indices.
    #[must_use = "returns the successful values"]
    pub fn into_values(self) -> Vec<R> {
        self.successes.into_iter().map(|(_, r)| r).collect()
    }
}

enum Outcome<R> {
    Success { value: R, elapsed: Duration },
    Failure { error: String, attempts: u32 },
}

/// Accumulates outcomes and drives progress reporting.
struct Tally<R> {
    successes: Vec<(usize, R)>,
    failures: Vec<BatchFailure>,
    timings: Vec<Duration>,
    tracker: ProgressTracker,
    progress: Option<ProgressCallback>,
}

impl<R> Tally<R> {
    fn new(total: usize, progress: Option<ProgressCallback>) -> Self {
        Self {
            successes: Vec::with_capacity(total),
            failures: Vec::new(),
            timings: Vec::with_capacity(total),
            tracker: ProgressTracker::new(total),
            progress,
        }
    }

    fn record(&mut self, index: usize, outcome: Outcome<R>) {
        match outcome {
            Outcome::Success { value, elapsed } => {
                self.timings.push(elapsed);
                self.successes.push((index, value));
            }
            Outcome::Failure { error, attempts } => {
                self.failures.push(BatchFailure {
                    index,
                    error,
                    attempts,
                });
            }
        }
        self.tracker.increment(1);
        if let Some(callback) = &self.progress {
            callback(self.tracker.completed(), self.tracker.total());
        }
    }

    fn finish(mut self, total: usize, duration: Duration) -> BatchResult<R> {
        self.tracker.finish();
        self.successes.sort_by_key(|(i, _)| *i);
        self.failures.sort_by_key(|f| f.index);
        let avg_time = match u32::try_from(self.timings.len()) {
            Ok(n) if n > 0 => self.timings.iter().sum::<Duration>() / n,
            _ => Duration::ZERO,
        };
        let stats = BatchStats {
            total,
            succeeded: self.successes.len(),
            failed: self.failures.len(),
            avg_time,
        };
        info!(
            total,
            succeeded = stats.succeeded,
            failed = stats.failed,
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "Batch finished"
        );
        BatchResult {
            successes: self.successes,
            failures: self.failures,
            duration,
            stats,
        }
    }
}

async fn run_with_retry<T, R, F, Fut>(processor: &F, item: T, index: usize, config: &BatchConfig) -> Outcome<R>
where
    T: Clone,
    F: Fn(T, usize) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let start = Instant::now();
    let limit = config.timeout();
    let mut attempt: u32 = 0;
    loop {
        let result = match timeout(limit, processor(item.clone(), index)).await {
            Ok(result) => result,
            Err(_) => Err(VisionError::Timeout(format!("item {index} exceeded {limit:?}"))),
        };
        match result {
            Ok(value) => {
                return Outcome::Success {
                    value,
                    elapsed: start.elapsed(),
                }
            }
            Err(e) if attempt < config.retry_attempts => {
                let delay = config.retry_delay() * 2u32.saturating_pow(attempt);
                warn!(index, attempt = attempt + 1, error = %e, ?delay, "Batch item failed, retrying");
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(index, attempts = attempt + 1, error = %e, "Batch item failed permanently");
                return Outcome::Failure {
                    error: e.to_string(),
                    attempts: attempt + 1,
                };
            }
        }
    }
}

/// Runs async work over a list of items.
#[derive(Clone, Default)]
pub struct BatchProcessor {
    config: BatchConfig,
    progress: Option<ProgressCallback>,
}

impl BatchProcessor {
    #[must_use = "creates a batch processor"]
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            progress: None,
        }
    }

    /// Invoke `callback(completed, total)` after each item.
    #[must_use = "returns the processor with a progress callback"]
    pub fn with_progress(mut self, callback: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    #[must_use = "returns the batch configuration"]
    pub const fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Effective concurrency for `n` items.
    #[must_use = "returns the concurrency limit"]
    pub fn concurrency_for(&self, n: usize) -> usize {
        self.config
            .max_concurrency
            .unwrap_or_else(|| auto_concurrency(n))
            .max(1)
    }

    /// Process items concurrently, at most [`Self::concurrency_for`] at a time.
    pub async fn process_batch<T, R, F, Fut>(&self, items: Vec<T>, processor: F) -> BatchResult<R>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(T, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let start = Instant::now();
        let total = items.len();
        let max_concurrency = self.concurrency_for(total);
        info!(total, max_concurrency, "Batch started");

        let (tx, mut rx) = mpsc::channel(100);
        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let processor = Arc::new(processor);

        for (index, item) in items.into_iter().enumerate() {
            let tx = tx.clone();
            let semaphore = semaphore.clone();
            let processor = processor.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let outcome = run_with_retry(processor.as_ref(), item, index, &config).await;
                let _ = tx.send((index, outcome)).await;
            });
        }
        drop(tx);

        let mut tally = Tally::new(total, self.progress.clone());
        while let Some((index, outcome)) = rx.recv().await {
            tally.record(index, outcome);
        }
        tally.finish(total, start.elapsed())
    }

    /// Process items one at a time, sleeping `delay` between items.
    pub async fn process_throttled<T, R, F, Fut>(&self, items: Vec<T>, processor: F, delay: Duration) -> BatchResult<R>
    where
        T: Clone,
        F: Fn(T, usize) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let start = Instant::now();
        let total = items.len();
        info!(total, ?delay, "Throttled batch started");

        let mut tally = Tally::new(total, self.progress.clone());
        for (index, item) in items.into_iter().enumerate() {
            let outcome = run_with_retry(&processor, item, index, &self.config).await;
            tally.record(index, outcome);
            if index + 1 < total {
                sleep(delay).await;
            }
        }
        tally.finish(total, start.elapsed())
    }

    /// Choose an execution strategy for the batch.
    ///
    /// - at most three items run sequentially
    /// - when the estimated rate (`60 000 / estimated_item_time` items per
    ///   minute) exceeds `rate_limit_per_minute`, items are throttled with a
    ///   `ceil(60 000 / rate_limit_per_minute)` ms delay
    /// - otherwise items run in parallel
    pub async fn smart_batch<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        processor: F,
        estimated_item_time: Duration,
        rate_limit_per_minute: u32,
    ) -> BatchResult<R>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(T, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        if items.len() <= SMALL_BATCH {
            debug!(items = items.len(), "Small batch, running sequentially");
            let sequential = Self {
                config: BatchConfig {
                    max_concurrency: Some(1),
                    ..self.config.clone()
                },
                progress: self.progress.clone(),
            };
            return sequential.process_batch(items, processor).await;
        }

        let item_ms = estimated_item_time.as_secs_f64() * 1000.0;
        let items_per_minute = if item_ms > 0.0 { 60_000.0 / item_ms } else { f64::INFINITY };
        let rate = rate_limit_per_minute.max(1);
        if items_per_minute > f64::from(rate) {
            let delay = Duration::from_millis(60_000_u64.div_ceil(u64::from(rate)));
            info!(?delay, rate_limit_per_minute = rate, "Rate limiting enabled");
            return self.process_throttled(items, processor, delay).await;
        }

        self.process_batch(items, processor).await
    }
}

/// Map items concurrently, returning only the successes in index order.
pub async fn parallel_map<T, R, F, Fut>(items: Vec<T>, mapper: F, max_concurrency: Option<usize>) -> Vec<R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(T, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let processor = BatchProcessor::new(BatchConfig {
        max_concurrency: Some(max_concurrency.unwrap_or_else(|| auto_concurrency(items.len()))),
        ..BatchConfig::default()
    });
    let result = processor.process_batch(items, mapper).await;
    if !result.failures.is_empty() {
        warn!(failed = result.failures.len(), "Items failed in parallel map");
    }
    result.into_values()
}

/// Rate-limited progress logging with an ETA.
#[derive(Debug)]
pub struct ProgressTracker {
    total: usize,
    completed: usize,
    started: Instant,
    last_report: Option<Instant>,
    interval: Duration,
}

impl ProgressTracker {
    #[must_use = "creates a progress tracker"]
    pub fn new(total: usize) -> Self {
        Self::with_interval(total, DEFAULT_REPORT_INTERVAL)
    }

    #[must_use = "creates a progress tracker"]
    pub fn with_interval(total: usize, interval: Duration) -> Self {
        Self {
            total,
            completed: 0,
            started: Instant::now(),
            last_report: None,
            interval,
        }
    }

    #[inline]
    #[must_use = "returns the completed count"]
    pub const fn completed(&self) -> usize {
        self.completed
    }

    #[inline]
    #[must_use = "returns the total count"]
    pub const fn total(&self) -> usize {
        self.total
    }

    /// Record `count` finished items, logging at most once per interval.
    pub fn increment(&mut self, count: usize) {
        self.completed += count;
        let now = Instant::now();
        if self.last_report.map_or(true, |t| now - t >= self.interval) {
            self.report();
            self.last_report = Some(now);
        }
    }

    /// Items per second so far.
    #[allow(clippy::cast_precision_loss)]
    #[must_use = "returns the completion rate"]
    pub fn rate(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.completed as f64 / secs
        } else {
            0.0
        }
    }

    /// Estimated time to completion, unknown until the rate is measurable.
    #[allow(clippy::cast_precision_loss)]
    #[must_use = "returns the estimated time remaining"]
    pub fn eta(&self) -> Option<Duration> {
        let rate = self.rate();
        (rate > 0.0).then(|| {
            let remaining = self.total.saturating_sub(self.completed) as f64;
            Duration::from_secs_f64(remaining / rate)
        })
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn report(&self) {
        let percent = if self.total == 0 {
            100.0
        } else {
            self.completed as f64 * 100.0 / self.total as f64
        };
        info!(
            completed = self.completed,
            total = self.total,
            percent = format!("{percent:.0}"),
            rate = format!("{:.2}/s", self.rate()),
            eta = ?self.eta(),
            "Batch progress"
        );
    }

    pub fn finish(&self) {
        let elapsed = self.started.elapsed();
        let avg = match u32::try_from(self.completed) {
            Ok(n) if n > 0 => elapsed / n,
            _ => Duration::ZERO,
        };
        debug!(
            completed = self.completed,
            total = self.total,
            ?elapsed,
            ?avg,
            "Progress tracker finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn config(retries: u32) -> BatchConfig {
        BatchConfig {
            max_concurrency: Some(4),
            retry_attempts: retries,
            retry_delay_ms: 1000,
            timeout_ms: 60_000,
        }
    }

    #[test]
    fn test_auto_concurrency() {
        let cpus = num_cpus::get();
        assert_eq!(auto_concurrency(1), 2.min(cpus));
        assert_eq!(auto_concurrency(35), 4.min(cpus));
        assert_eq!(auto_concurrency(1000), 8.min(cpus));
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_are_index_ordered() {
        let processor = BatchProcessor::new(config(0));
        let result = processor
            .process_batch(vec![30_u64, 10, 20], |ms, _| async move {
                sleep(Duration::from_millis(ms)).await;
                Ok(ms)
            })
            .await;
        assert_eq!(result.successes, vec![(0, 30), (1, 10), (2, 20)]);
        assert_eq!(result.stats.succeeded, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flaky_item_succeeds_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = Instant::now();
        let result = BatchProcessor::new(config(2))
            .process_batch(vec![7_u32], move |item, _| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(VisionError::Inference("flaky".to_string()))
                    } else {
                        Ok(item)
                    }
                }
            })
            .await;
        assert_eq!(result.into_values(), vec![7]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_records_attempts() {
        let result = BatchProcessor::new(config(2))
            .process_batch(vec![1_u32, 2], |item, _| async move {
                if item == 2 {
                    Err(VisionError::Inference("down".to_string()))
                } else {
                    Ok(item)
                }
            })
            .await;
        assert_eq!(result.successes, vec![(0, 1)]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].index, 1);
        assert_eq!(result.failures[0].attempts, 3);
        assert!(result.failures[0].error.contains("down"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cfg = BatchConfig {
            timeout_ms: 500,
            ..config(1)
        };
        let result = BatchProcessor::new(cfg)
            .process_batch(vec![()], |(), _| async move {
                sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].attempts, 2);
        assert!(result.failures[0].error.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (f, p) = (in_flight.clone(), peak.clone());
        let cfg = BatchConfig {
            max_concurrency: Some(2),
            ..config(0)
        };
        let result = BatchProcessor::new(cfg)
            .process_batch((0..6).collect::<Vec<u32>>(), move |item, _| {
                let (f, p) = (f.clone(), p.clone());
                async move {
                    let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(100)).await;
                    f.fetch_sub(1, Ordering::SeqCst);
                    Ok(item)
                }
            })
            .await;
        assert_eq!(result.stats.succeeded, 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_is_sequential() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (f, p) = (in_flight.clone(), peak.clone());
        let start = Instant::now();
        let result = BatchProcessor::new(config(0))
            .process_throttled(
                vec![1_u32, 2, 3],
                move |item, _| {
                    let (f, p) = (f.clone(), p.clone());
                    async move {
                        let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                        p.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(10)).await;
                        f.fetch_sub(1, Ordering::SeqCst);
                        Ok(item)
                    }
                },
                Duration::from_millis(500),
            )
            .await;
        assert_eq!(result.into_values(), vec![1, 2, 3]);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        // two gaps, none after the last item
        assert!(start.elapsed() >= Duration::from_millis(1030));
        assert!(start.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_smart_batch_throttles_fast_items() {
        let start = Instant::now();
        let result = BatchProcessor::new(config(0))
            .smart_batch(
                vec![1_u32, 2, 3, 4],
                |item, _| async move { Ok(item) },
                Duration::from_millis(100),
                60,
            )
            .await;
        assert_eq!(result.stats.succeeded, 4);
        // 600 items/min > 60, so 1s between items
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_callback_and_parallel_map() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let processor = BatchProcessor::new(config(0)).with_progress(move |done, total| {
            assert!(done <= total);
            s.fetch_add(1, Ordering::SeqCst);
        });
        let result = processor
            .process_batch(vec![1_u32, 2, 3], |i, _| async move { Ok(i * 2) })
            .await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(result.into_values(), vec![2, 4, 6]);

        let doubled = parallel_map(
            vec![1_u32, 2, 3],
            |i, _| async move {
                if i == 2 {
                    Err(VisionError::Inference("no".to_string()))
                } else {
                    Ok(i * 2)
                }
            },
            None,
        )
        .await;
        assert_eq!(doubled, vec![2, 6]);
    }

    #[test]
    fn test_progress_tracker_counts() {
        let mut tracker = ProgressTracker::with_interval(4, Duration::ZERO);
        tracker.increment(1);
        tracker.increment(2);
        assert_eq!(tracker.completed(), 3);
        assert_eq!(tracker.total(), 4);
    }
}
