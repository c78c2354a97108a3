//! Reply correlation with bounded polling.
//!
//! Each outstanding request is a record keyed by its message id. The first
//! caller of [`Correlator::wait`] starts one timer task for the record; every
//! waiter subscribes to the same completion signal, so all of them observe
//! the same outcome at the same moment.
//!
//! A record becomes terminal exactly once: either a reply is recorded
//! (`replied`, outcome `true`) or the timer exhausts its attempts or the
//! request is cancelled (`timedout`, outcome `false`). Whichever happens
//! first wins; the other is a no-op.

use crate::error::{HandshakeError, Result};
use crate::messages::{Reply, RequestEnvelope};
use crate::sync::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::debug;

/// Default number of polls before a request times out.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default delay between polls.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Shortest delay between polls. Smaller intervals are raised to this.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// How long to wait for a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    /// Delay between polls, never below [`MIN_INTERVAL`].
    pub fn period(&self) -> Duration {
        self.interval.max(MIN_INTERVAL)
    }

    /// Worst-case wait.
    pub fn budget(&self) -> Duration {
        self.period().saturating_mul(self.max_attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_INTERVAL)
    }
}

struct Record {
    envelope: Mutex<RequestEnvelope>,
    outcome: watch::Sender<Option<bool>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Record {
    fn new(envelope: RequestEnvelope) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            envelope: Mutex::new(envelope),
            outcome,
            timer: Mutex::new(None),
        }
    }

    fn is_resolved(&self) -> bool {
        lock(&self.envelope).is_resolved()
    }

    /// Apply a terminal update unless one already happened.
    fn resolve(&self, outcome: bool, apply: impl FnOnce(&mut RequestEnvelope)) -> bool {
        {
            let mut envelope = lock(&self.envelope);
            if envelope.is_resolved() {
                return false;
            }
            apply(&mut envelope);
            self.outcome.send_replace(Some(outcome));
        }
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
        true
    }

    fn start_timer(self: &Arc<Self>, mid: &str, policy: RetryPolicy) {
        let mut timer = lock(&self.timer);
        if timer.is_some() || self.is_resolved() {
            return;
        }

        let record = Arc::clone(self);
        let mid = mid.to_string();
        *timer = Some(tokio::spawn(async move {
            let period = policy.period();
            let Some(first) = Instant::now().checked_add(period) else {
                if record.resolve(false, |envelope| envelope.timedout = true) {
                    debug!(%mid, ?period, "Poll interval out of range, timing out");
                }
                return;
            };
            let mut polls = interval_at(first, period);
            for _ in 0..policy.max_attempts {
                polls.tick().await;
                if record.is_resolved() {
                    return;
                }
            }
            if record.resolve(false, |envelope| envelope.timedout = true) {
                debug!(%mid, attempts = policy.max_attempts, "Request timed out");
            }
        }));
    }
}

/// Matches replies to outstanding requests by message id.
#[derive(Default)]
pub struct Correlator {
    records: Mutex<HashMap<String, Arc<Record>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new request.
    ///
    /// Fails if a request with the same id is still unresolved. A resolved
    /// record that was never taken is replaced.
    pub fn register(&self, envelope: RequestEnvelope) -> Result<()> {
        let mut records = lock(&self.records);
        if let Some(existing) = records.get(&envelope.mid)
            && !existing.is_resolved()
        {
            return Err(HandshakeError::DuplicateMid(envelope.mid));
        }
        records.insert(envelope.mid.clone(), Arc::new(Record::new(envelope)));
        Ok(())
    }

    /// Whether `mid` is tracked and unresolved.
    pub fn is_outstanding(&self, mid: &str) -> bool {
        self.get(mid).is_some_and(|record| !record.is_resolved())
    }

    /// Number of unresolved requests.
    pub fn outstanding(&self) -> usize {
        lock(&self.records)
            .values()
            .filter(|record| !record.is_resolved())
            .count()
    }

    /// Record a reply for its `mid`.
    ///
    /// Returns `false` without touching anything when the id is unknown or
    /// the request already resolved.
    pub fn record_reply(&self, reply: &Reply) -> bool {
        self.record_reply_with(reply, |_| {})
    }

    /// [`Correlator::record_reply`], running `accept` only if the reply
    /// wins.
    ///
    /// `accept` runs before any waiter is woken, so state it sets is visible
    /// to them. It must not touch this correlator.
    pub fn record_reply_with(&self, reply: &Reply, accept: impl FnOnce(&Reply)) -> bool {
        let Some(record) = self.get(&reply.mid) else {
            debug!(mid = %reply.mid, "Ignoring reply for unknown mid");
            return false;
        };
        record.resolve(true, |envelope| {
            accept(reply);
            envelope.replied = true;
            envelope.response = Some(reply.clone());
        })
    }

    /// Wait until `mid` is replied to or times out.
    ///
    /// Returns `true` if a reply was recorded. The first waiter's policy
    /// drives the timer; later waiters join it. Unknown ids resolve `false`.
    pub async fn wait(&self, mid: &str, policy: RetryPolicy) -> bool {
        let Some(record) = self.get(mid) else {
            return false;
        };
        let mut outcome = record.outcome.subscribe();
        record.start_timer(mid, policy);

        match outcome.wait_for(Option::is_some).await {
            Ok(resolved) => (*resolved).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// [`Correlator::wait`] with the default policy.
    pub async fn wait_default(&self, mid: &str) -> bool {
        self.wait(mid, RetryPolicy::default()).await
    }

    /// Resolve an outstanding request as timed out right away.
    ///
    /// Used when the channel the reply would arrive on has closed.
    pub fn cancel(&self, mid: &str) -> bool {
        let cancelled = self
            .get(mid)
            .is_some_and(|record| record.resolve(false, |envelope| envelope.timedout = true));
        if cancelled {
            debug!(%mid, "Request cancelled");
        }
        cancelled
    }

    /// Stop tracking `mid` and return its final envelope.
    ///
    /// An unresolved request is resolved as timed out first so no waiter is
    /// left behind.
    pub fn take(&self, mid: &str) -> Option<RequestEnvelope> {
        let record = lock(&self.records).remove(mid)?;
        record.resolve(false, |envelope| envelope.timedout = true);
        let envelope = lock(&record.envelope).clone();
        Some(envelope)
    }

    /// Snapshot of a tracked envelope.
    pub fn envelope(&self, mid: &str) -> Option<RequestEnvelope> {
        self.get(mid).map(|record| lock(&record.envelope).clone())
    }

    fn get(&self, mid: &str) -> Option<Arc<Record>> {
        lock(&self.records).get(mid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn envelope(mid: &str) -> RequestEnvelope {
        RequestEnvelope::new("u1", "token").with_mid(mid)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_before_budget() {
        let correlator = Arc::new(Correlator::new());
        correlator.register(envelope("m1")).unwrap();

        let waiter = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.wait_default("m1").await })
        };

        sleep(Duration::from_millis(250)).await;
        let start = Instant::now();
        assert!(correlator.record_reply(&Reply::verified("m1", "K")));

        assert!(waiter.await.unwrap());
        // Resolves on the reply, not at the end of the budget.
        assert!(start.elapsed() < DEFAULT_INTERVAL);

        let stored = correlator.take("m1").unwrap();
        assert!(stored.replied);
        assert!(!stored.timedout);
        assert_eq!(stored.response.unwrap().key.as_deref(), Some("K"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_marks_record() {
        let correlator = Correlator::new();
        correlator.register(envelope("m1")).unwrap();

        let start = Instant::now();
        let replied = correlator
            .wait("m1", RetryPolicy::new(3, Duration::from_millis(100)))
            .await;

        assert!(!replied);
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_millis(400));

        let stored = correlator.envelope("m1").unwrap();
        assert!(stored.timedout);
        assert!(!stored.replied);
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_after_timeout_is_ignored() {
        let correlator = Correlator::new();
        correlator.register(envelope("m1")).unwrap();

        assert!(!correlator.wait("m1", RetryPolicy::new(1, Duration::from_millis(10))).await);
        assert!(!correlator.record_reply(&Reply::verified("m1", "K")));

        let stored = correlator.take("m1").unwrap();
        assert!(stored.timedout);
        assert!(stored.response.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_runs_only_for_winning_reply() {
        let correlator = Correlator::new();
        correlator.register(envelope("m1")).unwrap();

        let accepted = Mutex::new(Vec::new());
        assert!(!correlator.wait("m1", RetryPolicy::new(1, Duration::from_millis(10))).await);
        assert!(!correlator.record_reply_with(&Reply::verified("m1", "late"), |reply| {
            lock(&accepted).push(reply.key.clone());
        }));
        assert!(lock(&accepted).is_empty());

        correlator.register(envelope("m2")).unwrap();
        assert!(correlator.record_reply_with(&Reply::verified("m2", "K"), |reply| {
            lock(&accepted).push(reply.key.clone());
        }));
        assert!(!correlator.record_reply_with(&Reply::verified("m2", "again"), |reply| {
            lock(&accepted).push(reply.key.clone());
        }));
        assert_eq!(*lock(&accepted), vec![Some("K".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_same_outcome() {
        let correlator = Arc::new(Correlator::new());
        correlator.register(envelope("m1")).unwrap();

        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let correlator = Arc::clone(&correlator);
                tokio::spawn(async move { correlator.wait_default("m1").await })
            })
            .collect();

        sleep(Duration::from_millis(450)).await;
        correlator.record_reply(&Reply::verified("m1", "K"));

        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_timeout() {
        let correlator = Arc::new(Correlator::new());
        correlator.register(envelope("m1")).unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let correlator = Arc::clone(&correlator);
                tokio::spawn(async move { correlator.wait_default("m1").await })
            })
            .collect();

        for waiter in waiters {
            assert!(!waiter.await.unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_mid_mutates_nothing() {
        let correlator = Correlator::new();
        correlator.register(envelope("m1")).unwrap();

        assert!(!correlator.record_reply(&Reply::verified("other", "K")));

        let stored = correlator.envelope("m1").unwrap();
        assert!(!stored.replied);
        assert!(stored.response.is_none());
        assert!(correlator.is_outstanding("m1"));
        assert!(!correlator.wait_default("other").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_resolves_waiters() {
        let correlator = Arc::new(Correlator::new());
        correlator.register(envelope("m1")).unwrap();

        let waiter = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.wait_default("m1").await })
        };
        sleep(Duration::from_millis(10)).await;

        let start = Instant::now();
        assert!(correlator.cancel("m1"));
        assert!(!waiter.await.unwrap());
        assert!(start.elapsed() < DEFAULT_INTERVAL);

        // Already resolved.
        assert!(!correlator.cancel("m1"));
        assert!(correlator.envelope("m1").unwrap().timedout);
    }

    #[tokio::test]
    async fn test_duplicate_mid_rejected() {
        let correlator = Correlator::new();
        correlator.register(envelope("m1")).unwrap();

        let result = correlator.register(envelope("m1"));
        assert!(matches!(result, Err(HandshakeError::DuplicateMid(_))));

        correlator.cancel("m1");
        correlator.register(envelope("m1")).unwrap();
        assert!(correlator.is_outstanding("m1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_at_last_poll_times_out() {
        let correlator = Arc::new(Correlator::new());
        correlator.register(envelope("m1")).unwrap();
        let policy = RetryPolicy::new(3, Duration::from_millis(100));

        let waiter = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.wait("m1", policy).await })
        };

        // Let the third poll run at exactly 300ms before replying.
        sleep(policy.budget()).await;
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        assert!(!correlator.record_reply(&Reply::verified("m1", "K")));
        assert!(!waiter.await.unwrap());
        assert!(correlator.envelope("m1").unwrap().timedout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_just_before_last_poll_wins() {
        let correlator = Arc::new(Correlator::new());
        correlator.register(envelope("m1")).unwrap();
        let policy = RetryPolicy::new(3, Duration::from_millis(100));

        let waiter = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.wait("m1", policy).await })
        };

        sleep(policy.budget() - Duration::from_millis(1)).await;
        assert!(correlator.record_reply(&Reply::verified("m1", "K")));
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_bounded() {
        let correlator = Correlator::new();
        correlator.register(envelope("m1")).unwrap();

        let policy = RetryPolicy::new(3, Duration::ZERO);
        assert_eq!(policy.interval, MIN_INTERVAL);

        let replied =
            tokio::time::timeout(Duration::from_secs(2), correlator.wait("m1", policy)).await;
        assert_eq!(replied, Ok(false));
        assert!(correlator.envelope("m1").unwrap().timedout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_literal_is_bounded() {
        let correlator = Correlator::new();
        correlator.register(envelope("m1")).unwrap();

        // Built without `new`, so nothing clamped the interval.
        let policy = RetryPolicy {
            max_attempts: 2,
            interval: Duration::ZERO,
        };
        let replied =
            tokio::time::timeout(Duration::from_secs(2), correlator.wait("m1", policy)).await;
        assert_eq!(replied, Ok(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_interval_does_not_hang() {
        let correlator = Correlator::new();
        correlator.register(envelope("m1")).unwrap();

        let policy = RetryPolicy::new(1, Duration::MAX);
        assert_eq!(policy.budget(), Duration::MAX);

        let replied =
            tokio::time::timeout(Duration::from_secs(2), correlator.wait("m1", policy)).await;
        assert_eq!(replied, Ok(false));
    }

    #[test]
    fn test_default_budget() {
        assert_eq!(RetryPolicy::default().budget(), Duration::from_secs(1));
    }
}
