use crate::error::TrackerError;
use crate::stats::{self, LatencyStats};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// A matched request/response pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub rtt: Duration,
    /// 1-based position in the order responses were matched.
    pub ordinal: usize,
    /// Mean over the first `ordinal` samples, including this one.
    pub running_mean: Duration,
}

/// Outcome of a measurement run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub sent: u64,
    pub received: u64,
    pub lost: u64,
    pub latency: Option<LatencyStats>,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, Instant>,
    samples: Vec<Duration>,
    total: Duration,
    closed: bool,
}

/// Correlates asynchronously delivered responses with the requests that
/// caused them, by opaque id.
///
/// Shared between the sending loop and the delivery consumer through an
/// `Arc`. Every operation takes the lock briefly and never across an await.
/// Once [`close`](Self::close)d, `begin` is refused and `complete` ignores
/// late stragglers; entries still pending at that point count as lost.
#[derive(Default)]
pub struct CorrelationTracker {
    inner: Mutex<Inner>,
    drained: Notify,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, id: impl Into<String>) -> Result<(), TrackerError> {
        self.begin_at(id, Instant::now())
    }

    /// Record `id` as in flight since `sent_at`.
    ///
    /// A duplicate pending id is refused and the original timestamp kept.
    pub fn begin_at(&self, id: impl Into<String>, sent_at: Instant) -> Result<(), TrackerError> {
        let id = id.into();
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TrackerError::Closed);
        }
        if inner.pending.contains_key(&id) {
            return Err(TrackerError::DuplicateId(id));
        }
        inner.pending.insert(id, sent_at);
        Ok(())
    }

    pub fn complete(&self, id: &str) -> Option<Sample> {
        self.complete_at(id, Instant::now())
    }

    /// Match `id` against the pending table.
    ///
    /// Unknown, already completed and post-close ids yield `None` and leave
    /// the tracker untouched.
    pub fn complete_at(&self, id: &str, completed_at: Instant) -> Option<Sample> {
        let (sample, drained) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return None;
            }
            let sent_at = inner.pending.remove(id)?;
            let rtt = completed_at.saturating_duration_since(sent_at);
            inner.samples.push(rtt);
            inner.total += rtt;
            let ordinal = inner.samples.len();
            let sample = Sample {
                rtt,
                ordinal,
                running_mean: inner.total / u32::try_from(ordinal).unwrap_or(u32::MAX),
            };
            (sample, inner.pending.is_empty())
        };

        if drained {
            self.drained.notify_waiters();
        }
        Some(sample)
    }

    /// Drop `id` without producing a sample, for requests that never left.
    ///
    /// The request still counts as sent, so it ends up as lost.
    pub fn abandon(&self, id: &str) -> bool {
        let (removed, drained) = {
            let mut inner = self.inner.lock();
            let removed = inner.pending.remove(id).is_some();
            (removed, removed && inner.pending.is_empty())
        };
        if drained {
            self.drained.notify_waiters();
        }
        removed
    }

    pub fn outstanding_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn received(&self) -> usize {
        self.inner.lock().samples.len()
    }

    /// Mean of the samples matched so far, for progress output.
    pub fn running_mean_ms(&self) -> Option<f64> {
        let inner = self.inner.lock();
        if inner.samples.is_empty() {
            return None;
        }
        Some(stats::as_millis_f64(inner.total) / inner.samples.len() as f64)
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        // Wake any waiter so it re-checks and returns.
        self.drained.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Wait until no request is pending or `timeout` elapses.
    ///
    /// Returns `true` if the table drained in time.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not missed.
            notified.as_mut().enable();

            if self.outstanding_count() == 0 {
                return true;
            }
            if self.is_closed() {
                return false;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.outstanding_count() == 0;
            }
        }
    }

    /// Reduce the matched samples into a [`Summary`].
    ///
    /// `sent_count` comes from the caller since the tracker never knows the
    /// intended total.
    pub fn summarize(&self, sent_count: u64) -> Summary {
        let inner = self.inner.lock();
        let received = inner.samples.len() as u64;
        Summary {
            sent: sent_count,
            received,
            lost: sent_count.saturating_sub(received),
            latency: LatencyStats::from_durations(&inner.samples),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_rtt_is_completion_minus_send() {
        let tracker = CorrelationTracker::new();
        let t0 = Instant::now();
        tracker.begin_at("a", t0).unwrap();

        let sample = tracker
            .complete_at("a", t0 + Duration::from_millis(42))
            .unwrap();
        assert_eq!(sample.rtt, Duration::from_millis(42));
        assert_eq!(sample.ordinal, 1);
        assert_eq!(tracker.outstanding_count(), 0);
    }

    #[test]
    fn test_rtt_never_negative() {
        let tracker = CorrelationTracker::new();
        let t0 = Instant::now() + Duration::from_millis(5);
        tracker.begin_at("a", t0).unwrap();

        let sample = tracker.complete_at("a", Instant::now()).unwrap();
        assert_eq!(sample.rtt, Duration::ZERO);
    }

    #[test]
    fn test_wall_clock_rtt() {
        let tracker = CorrelationTracker::new();
        tracker.begin("a").unwrap();
        thread::sleep(Duration::from_millis(5));
        let sample = tracker.complete("a").unwrap();
        assert!(sample.rtt >= Duration::from_millis(5));
    }

    #[test]
    fn test_second_complete_is_noop() {
        let tracker = CorrelationTracker::new();
        tracker.begin("a").unwrap();
        assert!(tracker.complete("a").is_some());

        assert!(tracker.complete("a").is_none());
        assert!(tracker.complete("never-begun").is_none());

        let summary = tracker.summarize(1);
        assert_eq!(summary.received, 1);
        assert_eq!(summary.lost, 0);
    }

    #[test]
    fn test_duplicate_id_is_refused() {
        let tracker = CorrelationTracker::new();
        let t0 = Instant::now();
        tracker.begin_at("a", t0).unwrap();

        let err = tracker
            .begin_at("a", t0 + Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err, TrackerError::DuplicateId("a".to_string()));

        // Original timestamp is kept.
        let sample = tracker
            .complete_at("a", t0 + Duration::from_millis(10))
            .unwrap();
        assert_eq!(sample.rtt, Duration::from_millis(10));
    }

    #[test]
    fn test_pending_ids_count_as_lost() {
        let tracker = CorrelationTracker::new();
        for id in ["a", "b", "c", "d"] {
            tracker.begin(id).unwrap();
        }
        tracker.complete("b");
        tracker.complete("d");
        tracker.close();

        assert_eq!(tracker.outstanding_count(), 2);
        let summary = tracker.summarize(4);
        assert_eq!(summary.sent, 4);
        assert_eq!(summary.received, 2);
        assert_eq!(summary.lost, 2);
        assert_eq!(summary.received + summary.lost, summary.sent);
        assert_eq!(summary.latency.unwrap().count, 2);
    }

    #[test]
    fn test_abandoned_request_is_lost() {
        let tracker = CorrelationTracker::new();
        tracker.begin("a").unwrap();
        tracker.begin("b").unwrap();

        assert!(tracker.abandon("a"));
        assert!(!tracker.abandon("a"));
        assert!(tracker.complete("a").is_none());
        assert!(tracker.complete("b").is_some());

        let summary = tracker.summarize(2);
        assert_eq!(summary.received, 1);
        assert_eq!(summary.lost, 1);
        assert_eq!(tracker.outstanding_count(), 0);
    }

    #[test]
    fn test_closed_tracker_ignores_calls() {
        let tracker = CorrelationTracker::new();
        tracker.begin("a").unwrap();
        tracker.close();

        assert_eq!(tracker.begin("b"), Err(TrackerError::Closed));
        assert!(tracker.complete("a").is_none());
        assert_eq!(tracker.received(), 0);
        assert_eq!(tracker.outstanding_count(), 1);
    }

    #[test]
    fn test_empty_summary() {
        let tracker = CorrelationTracker::new();
        let summary = tracker.summarize(0);
        assert_eq!(summary.sent, 0);
        assert_eq!(summary.received, 0);
        assert_eq!(summary.lost, 0);
        assert_eq!(summary.latency, None);
    }

    #[test]
    fn test_running_mean() {
        let tracker = CorrelationTracker::new();
        assert_eq!(tracker.running_mean_ms(), None);

        let t0 = Instant::now();
        tracker.begin_at("a", t0).unwrap();
        tracker.begin_at("b", t0).unwrap();
        tracker.complete_at("a", t0 + Duration::from_millis(10));
        tracker.complete_at("b", t0 + Duration::from_millis(30));

        let mean = tracker.running_mean_ms().unwrap();
        assert!((mean - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_carries_running_mean() {
        let tracker = CorrelationTracker::new();
        let t0 = Instant::now();
        tracker.begin_at("a", t0).unwrap();
        tracker.begin_at("b", t0).unwrap();

        let first = tracker
            .complete_at("a", t0 + Duration::from_millis(10))
            .unwrap();
        let second = tracker
            .complete_at("b", t0 + Duration::from_millis(30))
            .unwrap();

        assert_eq!(first.running_mean, Duration::from_millis(10));
        assert_eq!(second.ordinal, 2);
        assert_eq!(second.running_mean, Duration::from_millis(20));
    }

    #[test]
    fn test_running_mean_matches_ordinal_under_contention() {
        const IDS: usize = 400;
        let tracker = Arc::new(CorrelationTracker::new());
        let t0 = Instant::now();
        // Request i takes i ms, so the mean of any n samples lies in [0, IDS) ms
        // and the last one must equal the overall mean.
        for i in 0..IDS {
            tracker.begin_at(format!("req-{i}"), t0).unwrap();
        }

        let workers: Vec<_> = (0..4)
            .map(|w| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    (w..IDS)
                        .step_by(4)
                        .filter_map(|i| {
                            tracker.complete_at(
                                &format!("req-{i}"),
                                t0 + Duration::from_millis(i as u64),
                            )
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut samples: Vec<Sample> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        samples.sort_by_key(|s| s.ordinal);

        let ordinals: Vec<usize> = samples.iter().map(|s| s.ordinal).collect();
        assert_eq!(ordinals, (1..=IDS).collect::<Vec<_>>());

        // Rebuild each running mean from the samples in ordinal order.
        let mut total = Duration::ZERO;
        for sample in &samples {
            total += sample.rtt;
            assert_eq!(sample.running_mean, total / sample.ordinal as u32);
        }
        let mean = tracker.running_mean_ms().unwrap();
        assert!((stats::as_millis_f64(samples[IDS - 1].running_mean) - mean).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_wait_drained_wakes_on_last_completion() {
        let tracker = Arc::new(CorrelationTracker::new());
        tracker.begin("a").unwrap();

        let completer = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            completer.complete("a");
        });

        let start = Instant::now();
        assert!(tracker.wait_drained(Duration::from_secs(5)).await);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wait_drained_times_out() {
        let tracker = CorrelationTracker::new();
        tracker.begin("a").unwrap();

        let start = Instant::now();
        assert!(!tracker.wait_drained(Duration::from_millis(50)).await);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_drained_on_empty_table() {
        let tracker = CorrelationTracker::new();
        assert!(tracker.wait_drained(Duration::ZERO).await);
    }

    #[test]
    fn test_concurrent_begin_and_complete() {
        const IDS: usize = 2_000;
        const CONSUMERS: usize = 4;

        for _ in 0..5 {
            let tracker = Arc::new(CorrelationTracker::new());
            let ids: Vec<String> = (0..IDS).map(|i| format!("req-{i}")).collect();

            let producer = {
                let tracker = tracker.clone();
                let ids = ids.clone();
                thread::spawn(move || {
                    for id in ids {
                        tracker.begin(id).unwrap();
                    }
                })
            };

            let consumers: Vec<_> = (0..CONSUMERS)
                .map(|_| {
                    let tracker = tracker.clone();
                    let mut order = ids.clone();
                    order.shuffle(&mut rand::thread_rng());
                    thread::spawn(move || {
                        let mut matched = 0usize;
                        while tracker.received() < IDS {
                            for id in &order {
                                if tracker.complete(id).is_some() {
                                    matched += 1;
                                }
                            }
                        }
                        matched
                    })
                })
                .collect();

            producer.join().unwrap();
            let matched: usize = consumers.into_iter().map(|c| c.join().unwrap()).sum();

            assert_eq!(matched, IDS);
            assert_eq!(tracker.received(), IDS);
            assert_eq!(tracker.outstanding_count(), 0);
            let summary = tracker.summarize(IDS as u64);
            assert_eq!(summary.lost, 0);
        }
    }
}
