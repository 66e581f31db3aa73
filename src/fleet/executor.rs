//! Bounded parallel executor
//!
//! Runs one operation against every record of a [`Collection`] with at most
//! `N` operations in flight. Every record is attempted exactly once and
//! reported exactly once: a failure, a per-record timeout or cancellation
//! of the batch becomes that record's result and never skips a sibling.
//!
//! Results come back in collection order whatever the completion order, so
//! a limit of 1 and a limit of `len()` produce identical reports.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::collection::Collection;
use super::lifecycle::LifecycleError;
use super::record::{RecordRef, ResourceRecord};
use crate::backend::BackendError;

/// Errors in executor setup
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Concurrency limit must be at least 1")]
    ZeroConcurrency,
}

/// Maximum operations in flight; never zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Concurrency(usize);

impl Concurrency {
    pub fn new(limit: usize) -> Result<Self, ExecutorError> {
        if limit == 0 {
            return Err(ExecutorError::ZeroConcurrency);
        }
        Ok(Self(limit))
    }

    /// One at a time, in collection order
    pub fn sequential() -> Self {
        Self(1)
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

/// How a batch is run
#[derive(Debug, Clone)]
pub struct ParallelOptions {
    pub concurrency: Concurrency,

    /// Per-record bound on the whole operation
    pub timeout: Option<Duration>,

    /// Aborts records still queued or in flight
    pub cancel: CancellationToken,
}

impl ParallelOptions {
    pub fn new(concurrency: Concurrency) -> Self {
        Self {
            concurrency,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Why one record's operation failed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("instance not running")]
    NotRunning,

    #[error("exited with status {code}: {stderr}")]
    ExitStatus { code: i32, stderr: String },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Backend(BackendError),
}

impl From<BackendError> for RecordError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Timeout(d) => RecordError::Timeout(d),
            BackendError::NotRunning(_) => RecordError::NotRunning,
            other => RecordError::Backend(other),
        }
    }
}

/// A failed record and its cause
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFailure {
    pub record: RecordRef,
    pub error: RecordError,
}

impl fmt::Display for RecordFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.record, self.error)
    }
}

/// Composite error holding every per-record failure of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateError {
    /// Records attempted
    pub total: usize,
    pub failures: Vec<RecordFailure>,
}

impl AggregateError {
    pub fn failed_refs(&self) -> Vec<&RecordRef> {
        self.failures.iter().map(|f| &f.record).collect()
    }

    /// Failures of several batches over the same `total` records
    ///
    /// Returns `None` when no batch failed. A record failing in more than
    /// one batch keeps one entry per failure but is counted once.
    pub fn merge(
        total: usize,
        errors: impl IntoIterator<Item = AggregateError>,
    ) -> Option<AggregateError> {
        let failures: Vec<RecordFailure> = errors.into_iter().flat_map(|e| e.failures).collect();
        if failures.is_empty() {
            return None;
        }
        Some(AggregateError { total, failures })
    }

    /// Distinct records with at least one failure
    pub fn failed_count(&self) -> usize {
        let mut seen: Vec<&RecordRef> = Vec::with_capacity(self.failures.len());
        for failure in &self.failures {
            if !seen.contains(&&failure.record) {
                seen.push(&failure.record);
            }
        }
        seen.len()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} records failed", self.failed_count(), self.total)?;
        for failure in &self.failures {
            write!(f, "\n  {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Result of the operation on one record
#[derive(Debug, Clone)]
pub struct RecordOutcome<T> {
    pub record: Arc<ResourceRecord>,
    pub result: Result<T, RecordError>,
}

impl<T> RecordOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-record results of a batch, in collection order
#[derive(Debug, Clone)]
pub struct BatchReport<T> {
    outcomes: Vec<RecordOutcome<T>>,
}

impl<T> BatchReport<T> {
    pub fn outcomes(&self) -> &[RecordOutcome<T>] {
        &self.outcomes
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(RecordOutcome::is_ok)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = (&Arc<ResourceRecord>, &T)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|v| (&o.record, v)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&Arc<ResourceRecord>, &RecordError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (&o.record, e)))
    }

    /// Present iff at least one record failed
    pub fn aggregate_error(&self) -> Option<AggregateError> {
        let failures: Vec<RecordFailure> = self
            .failed()
            .map(|(record, error)| RecordFailure {
                record: record.reference(),
                error: error.clone(),
            })
            .collect();
        if failures.is_empty() {
            return None;
        }
        Some(AggregateError {
            total: self.outcomes.len(),
            failures,
        })
    }

    /// Split into every per-record result plus the aggregate error
    pub fn into_parts(self) -> (Vec<RecordOutcome<T>>, Option<AggregateError>) {
        let error = self.aggregate_error();
        (self.outcomes, error)
    }

    /// Successful values, or the aggregate error when anything failed
    pub fn into_result(self) -> Result<Vec<(Arc<ResourceRecord>, T)>, AggregateError> {
        if let Some(error) = self.aggregate_error() {
            return Err(error);
        }
        Ok(self
            .outcomes
            .into_iter()
            .filter_map(|o| o.result.ok().map(|v| (o.record, v)))
            .collect())
    }
}

/// Run `op` against every record in `collection`
///
/// At most `options.concurrency` operations are in flight. Each record is
/// bounded by `options.timeout` independently. Once `options.cancel` fires,
/// queued records and records still in flight report
/// [`RecordError::Cancelled`].
pub async fn run_parallel<T, F, Fut>(
    collection: &Collection,
    options: &ParallelOptions,
    op: F,
) -> BatchReport<T>
where
    F: Fn(Arc<ResourceRecord>) -> Fut,
    Fut: Future<Output = Result<T, RecordError>>,
{
    let total = collection.len();
    let limit = options.concurrency.get();
    debug!(total, limit, "Starting parallel batch");

    let mut indexed: Vec<(usize, RecordOutcome<T>)> =
        stream::iter(collection.iter().cloned().enumerate())
            .map(|(index, record)| {
                let cancel = options.cancel.clone();
                let timeout = options.timeout;
                let op = &op;
                async move {
                    let result = if cancel.is_cancelled() {
                        Err(RecordError::Cancelled)
                    } else {
                        let work = bounded(op(record.clone()), timeout);
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => Err(RecordError::Cancelled),
                            result = work => result,
                        }
                    };
                    if let Err(e) = &result {
                        debug!(record = %record.label(), error = %e, "Record failed");
                    }
                    (index, RecordOutcome { record, result })
                }
            })
            .buffer_unordered(limit)
            .collect()
            .await;

    indexed.sort_by_key(|(index, _)| *index);
    let report = BatchReport {
        outcomes: indexed.into_iter().map(|(_, outcome)| outcome).collect(),
    };

    let failed = report.failed().count();
    if failed > 0 {
        info!(total, failed, "Parallel batch finished with failures");
    } else {
        debug!(total, "Parallel batch finished");
    }
    report
}

async fn bounded<T, Fut>(fut: Fut, timeout: Option<Duration>) -> Result<T, RecordError>
where
    Fut: Future<Output = Result<T, RecordError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(RecordError::Timeout(limit))),
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::record::BackendType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collection(n: u32) -> Collection {
        (1..=n)
            .map(|i| ResourceRecord::instance(BackendType::Memory, "mydc", i, format!("i-{i}")))
            .collect()
    }

    fn options(limit: usize) -> ParallelOptions {
        ParallelOptions::new(Concurrency::new(limit).unwrap())
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert_eq!(Concurrency::new(0), Err(ExecutorError::ZeroConcurrency));
        assert_eq!(Concurrency::sequential().get(), 1);
    }

    #[tokio::test]
    async fn test_all_attempt_with_failures() {
        let records = collection(6);
        let report = run_parallel(&records, &options(3), |record| async move {
            match record.node_no() {
                Some(n) if n % 2 == 0 => Err(RecordError::ExitStatus {
                    code: 1,
                    stderr: "boom".to_string(),
                }),
                n => Ok(n),
            }
        })
        .await;

        assert_eq!(report.len(), 6);
        assert_eq!(report.succeeded().count(), 3);
        let err = report.aggregate_error().unwrap();
        assert_eq!(err.total, 6);
        let failed: Vec<Option<u32>> = err.failures.iter().map(|f| f.record.node_no).collect();
        assert_eq!(failed, vec![Some(2), Some(4), Some(6)]);
        assert!(err.to_string().starts_with("3 of 6 records failed"));
    }

    #[tokio::test]
    async fn test_merge_counts_each_record_once() {
        let records = collection(3);
        let fail_two = |record: Arc<ResourceRecord>| async move {
            match record.node_no() {
                Some(2) => Err(RecordError::NotRunning),
                _ => Ok(()),
            }
        };
        let first = run_parallel(&records, &options(2), fail_two).await;
        let second = run_parallel(&records, &options(2), fail_two).await;

        let merged = AggregateError::merge(
            records.len(),
            [first.aggregate_error(), second.aggregate_error()]
                .into_iter()
                .flatten(),
        )
        .unwrap();
        assert_eq!(merged.failures.len(), 2);
        assert!(merged.to_string().starts_with("1 of 3 records failed"));
        assert!(AggregateError::merge(3, Vec::new()).is_none());
    }

    #[tokio::test]
    async fn test_no_aggregate_error_when_all_succeed() {
        let report = run_parallel(&collection(3), &options(2), |_| async { Ok(()) }).await;
        assert!(report.is_success());
        assert!(report.aggregate_error().is_none());
        assert_eq!(report.into_result().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_collection() {
        let report: BatchReport<()> =
            run_parallel(&Collection::empty(), &options(4), |_| async { Ok(()) }).await;
        assert!(report.is_empty());
        assert!(report.aggregate_error().is_none());
    }

    #[tokio::test]
    async fn test_respects_concurrency_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let report = run_parallel(&collection(10), &options(3), |_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(report.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_outcomes_in_collection_order() {
        let report = run_parallel(&collection(5), &options(5), |record| async move {
            // later nodes finish first
            let n = record.node_no().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(u64::from(10 * (6 - n)))).await;
            Ok(n)
        })
        .await;
        let values: Vec<u32> = report.succeeded().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_slow_record_times_out_alone() {
        let opts = options(2).with_timeout(Some(Duration::from_millis(30)));
        let report = run_parallel(&collection(4), &opts, |record| async move {
            if record.node_no() == Some(1) {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Ok(())
        })
        .await;

        let failed: Vec<_> = report.failed().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0.node_no(), Some(1));
        assert!(matches!(failed[0].1, RecordError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_cancellation_reports_every_record() {
        let cancel = CancellationToken::new();
        let opts = options(1).with_cancel(cancel.clone());
        let trigger = cancel.clone();

        let report = run_parallel(&collection(4), &opts, move |record| {
            let trigger = trigger.clone();
            async move {
                if record.node_no() == Some(2) {
                    trigger.cancel();
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok(())
            }
        })
        .await;

        assert_eq!(report.len(), 4);
        let results: Vec<bool> = report.outcomes().iter().map(|o| o.is_ok()).collect();
        assert_eq!(results, vec![true, false, false, false]);
        assert!(report
            .failed()
            .all(|(_, e)| matches!(e, RecordError::Cancelled)));
    }

    #[test]
    fn test_backend_errors_map_to_record_errors() {
        assert_eq!(
            RecordError::from(BackendError::Timeout(Duration::from_secs(1))),
            RecordError::Timeout(Duration::from_secs(1))
        );
        assert_eq!(
            RecordError::from(BackendError::NotRunning("x".into())),
            RecordError::NotRunning
        );
    }
}
