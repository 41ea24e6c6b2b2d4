//! Time usage accumulation
//!
//! A local one-second clock is turned into bounded, monotonic increments of a
//! persisted usage ledger.
//!
//! ## Accounting
//!
//! ```text
//! tick ──► local_remainder += 1
//!           │
//!           └─ local_remainder ≥ LUMP ──► server_total += lumps × LUMP (optimistic)
//!                                          flush lumps × LUMP (+ retry backlog)
//!                                          local_remainder %= LUMP
//! ```
//!
//! The displayed total is `server_total + local_remainder` and never moves
//! backwards. A failed flush goes to the retry backlog and rides along with
//! the next lump; `server_total` is never rolled back. A sub-lump remainder
//! left when the timer stops is dropped unless configured otherwise.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::ProgressionError;
use crate::events::{EventBus, ProgressionEvent};

// ============================================================================
// Keys and Ledger
// ============================================================================

/// Ledger key: one activity of one learner's plan
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageKey {
    pub user_id: String,
    pub plan_id: String,
    pub activity_id: String,
}

impl UsageKey {
    pub fn new(
        user_id: impl Into<String>,
        plan_id: impl Into<String>,
        activity_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            plan_id: plan_id.into(),
            activity_id: activity_id.into(),
        }
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.plan_id, self.activity_id)
    }
}

/// Persistent usage sink, implemented by the application shell
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Add seconds to a key, returning the new cumulative total
    async fn add_usage(&self, key: &UsageKey, seconds: u64) -> Result<u64, ProgressionError>;

    /// Current cumulative total for a key
    async fn total(&self, key: &UsageKey) -> Result<u64, ProgressionError>;
}

/// Ledger kept in memory (tests and CLI simulation)
#[derive(Default)]
pub struct InMemoryUsageLedger {
    totals: DashMap<UsageKey, u64>,
}

impl InMemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageLedger for InMemoryUsageLedger {
    async fn add_usage(&self, key: &UsageKey, seconds: u64) -> Result<u64, ProgressionError> {
        let mut total = self.totals.entry(key.clone()).or_insert(0);
        *total += seconds;
        Ok(*total)
    }

    async fn total(&self, key: &UsageKey) -> Result<u64, ProgressionError> {
        Ok(self.totals.get(key).map(|t| *t).unwrap_or(0))
    }
}

// ============================================================================
// Pure Accounting
// ============================================================================

/// Local accounting state for one key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageState {
    /// Last confirmed total plus optimistically flushed lumps
    pub server_total: u64,
    /// Seconds accrued since the last lump
    pub local_remainder: u64,
    /// Seconds from failed flushes awaiting retry
    pub retry_backlog: u64,
}

/// Result of advancing the clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickOutcome {
    pub state: UsageState,
    /// Seconds to send to the ledger, if any
    pub flush: Option<u64>,
    pub display_seconds: u64,
}

/// What remains when a timer stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Teardown {
    pub state: UsageState,
    pub final_flush: Option<u64>,
    pub dropped_seconds: u64,
}

impl UsageState {
    pub fn new(server_total: u64) -> Self {
        Self {
            server_total,
            ..Default::default()
        }
    }

    pub fn display_seconds(&self) -> u64 {
        self.server_total + self.local_remainder
    }

    /// Queue a failed flush for retry. The optimistic total is kept.
    pub fn flush_failed(&mut self, seconds: u64) {
        self.retry_backlog += seconds;
    }

    /// Adopt a total confirmed by the ledger without ever moving backwards
    pub fn flush_confirmed(&mut self, ledger_total: u64) {
        self.server_total = self.server_total.max(ledger_total);
    }

    /// Close the accounting. The sub-lump remainder is dropped unless
    /// `flush_remainder` is set; pending retries are always flushed.
    pub fn teardown(mut self, flush_remainder: bool) -> Teardown {
        let mut final_flush = std::mem::take(&mut self.retry_backlog);
        let remainder = std::mem::take(&mut self.local_remainder);
        let dropped_seconds = if flush_remainder {
            self.server_total += remainder;
            final_flush += remainder;
            0
        } else {
            remainder
        };

        Teardown {
            state: self,
            final_flush: (final_flush > 0).then_some(final_flush),
            dropped_seconds,
        }
    }
}

/// Advance the clock by one second
pub fn tick(state: UsageState, lump_size: u64) -> TickOutcome {
    advance(state, 1, lump_size)
}

/// Advance the clock by `elapsed` seconds
pub fn advance(state: UsageState, elapsed: u64, lump_size: u64) -> TickOutcome {
    let mut next = state;
    next.local_remainder += elapsed;

    let mut flush = None;
    if lump_size > 0 && next.local_remainder >= lump_size {
        let lumps = next.local_remainder / lump_size;
        let amount = lumps * lump_size;

        next.server_total += amount;
        next.local_remainder %= lump_size;
        flush = Some(amount + std::mem::take(&mut next.retry_backlog));
    }

    TickOutcome {
        state: next,
        flush,
        display_seconds: next.display_seconds(),
    }
}

// ============================================================================
// Usage Session
// ============================================================================

enum FlushResult {
    Confirmed { total: u64 },
    Failed { seconds: u64 },
}

/// Accounting for one mounted activity, flushing asynchronously to a ledger
pub struct UsageSession {
    key: UsageKey,
    state: UsageState,
    lump_size: u64,
    ledger: Arc<dyn UsageLedger>,
    events: Option<Arc<EventBus>>,
    results_tx: mpsc::UnboundedSender<FlushResult>,
    results_rx: mpsc::UnboundedReceiver<FlushResult>,
    in_flight: Vec<JoinHandle<()>>,
}

impl UsageSession {
    pub fn new(
        key: UsageKey,
        server_total: u64,
        lump_size: u64,
        ledger: Arc<dyn UsageLedger>,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            key,
            state: UsageState::new(server_total),
            lump_size: lump_size.max(1),
            ledger,
            events: None,
            results_tx,
            results_rx,
            in_flight: Vec::new(),
        }
    }

    /// Emit flush events on the given bus
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn key(&self) -> &UsageKey {
        &self.key
    }

    pub fn state(&self) -> UsageState {
        self.state
    }

    pub fn display_seconds(&self) -> u64 {
        self.state.display_seconds()
    }

    /// Handle one clock tick. Must run inside a tokio runtime.
    pub fn on_tick(&mut self) -> TickOutcome {
        self.apply_results();

        let outcome = tick(self.state, self.lump_size);
        self.state = outcome.state;
        if let Some(seconds) = outcome.flush {
            self.spawn_flush(seconds);
        }
        outcome
    }

    /// Wait for in-flight flushes and apply their results
    pub async fn settle(&mut self) {
        for handle in self.in_flight.drain(..) {
            let _ = handle.await;
        }
        self.apply_results();
    }

    /// Stop accounting. A final flush, if any, is sent but its result is
    /// not observed.
    pub fn finish(mut self, flush_remainder: bool) -> Teardown {
        self.apply_results();
        let teardown = self.state.teardown(flush_remainder);
        if let Some(seconds) = teardown.final_flush {
            self.spawn_flush(seconds);
        }
        if teardown.dropped_seconds > 0 {
            debug!(
                key = %self.key,
                dropped = teardown.dropped_seconds,
                "Dropping sub-lump usage remainder"
            );
        }
        teardown
    }

    fn apply_results(&mut self) {
        while let Ok(result) = self.results_rx.try_recv() {
            match result {
                FlushResult::Confirmed { total } => self.state.flush_confirmed(total),
                FlushResult::Failed { seconds } => self.state.flush_failed(seconds),
            }
        }
        self.in_flight.retain(|h| !h.is_finished());
    }

    fn spawn_flush(&mut self, seconds: u64) {
        let ledger = Arc::clone(&self.ledger);
        let key = self.key.clone();
        let events = self.events.clone();
        let results_tx = self.results_tx.clone();
        let flush_id = uuid::Uuid::new_v4().to_string();

        let handle = tokio::spawn(async move {
            let result = match ledger.add_usage(&key, seconds).await {
                Ok(total) => {
                    debug!(key = %key, seconds = seconds, total = total, "Usage flushed");
                    if let Some(events) = &events {
                        events.emit(ProgressionEvent::UsageFlushed {
                            key: key.clone(),
                            flush_id,
                            seconds,
                            total,
                        });
                    }
                    FlushResult::Confirmed { total }
                }
                Err(e) => {
                    warn!(key = %key, seconds = seconds, error = %e, "Usage flush failed, will retry");
                    if let Some(events) = &events {
                        events.emit(ProgressionEvent::UsageFlushFailed {
                            key: key.clone(),
                            flush_id,
                            seconds,
                            error: e.to_string(),
                        });
                    }
                    FlushResult::Failed { seconds }
                }
            };
            // Receiver is gone once the session has finished
            let _ = results_tx.send(result);
        });
        self.in_flight.push(handle);
    }
}

// ============================================================================
// Timers
// ============================================================================

/// Tracks which keys have a running timer
#[derive(Clone, Default)]
pub struct TimerRegistry {
    active: Arc<DashMap<UsageKey, u64>>,
    next_id: Arc<AtomicU64>,
}

/// Registration held by a running timer; unregisters on drop
pub struct TimerGuard {
    active: Arc<DashMap<UsageKey, u64>>,
    key: UsageKey,
    id: u64,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the timer slot for a key
    pub fn register(&self, key: &UsageKey) -> Result<TimerGuard, ProgressionError> {
        match self.active.entry(key.clone()) {
            Entry::Occupied(_) => Err(ProgressionError::DuplicateTimer(key.to_string())),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                slot.insert(id);
                Ok(TimerGuard {
                    active: Arc::clone(&self.active),
                    key: key.clone(),
                    id,
                })
            }
        }
    }

    pub fn is_running(&self, key: &UsageKey) -> bool {
        self.active.contains_key(key)
    }

    pub fn running_count(&self) -> usize {
        self.active.len()
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.active.remove_if(&self.key, |_, id| *id == self.id);
    }
}

/// Periodic tick driver for one mounted activity.
///
/// Dropping a timer without [`UsageTimer::stop`] still closes its accounting:
/// the retry backlog is flushed and the sub-lump tail is dropped, with a
/// warning.
pub struct UsageTimer {
    key: UsageKey,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<Option<UsageSession>>>,
    _guard: TimerGuard,
}

impl UsageTimer {
    /// Start ticking `session` every `interval`.
    ///
    /// Fails with [`ProgressionError::DuplicateTimer`] if a timer for the
    /// same key is already running.
    pub fn start(
        registry: &TimerRegistry,
        session: UsageSession,
        interval: Duration,
    ) -> Result<Self, ProgressionError> {
        let key = session.key().clone();
        let guard = registry.register(&key)?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut session = session;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            // The sender is dropped without a signal when the timer is dropped
            let stopped = loop {
                tokio::select! {
                    signal = &mut shutdown_rx => break signal.is_ok(),
                    _ = ticker.tick() => {
                        session.on_tick();
                    }
                }
            };
            if stopped {
                return Some(session);
            }

            let key = session.key().clone();
            let teardown = session.finish(false);
            warn!(
                key = %key,
                flushed = ?teardown.final_flush,
                dropped = teardown.dropped_seconds,
                "Usage timer dropped without stop"
            );
            None
        });

        info!(key = %key, interval_ms = interval.as_millis() as u64, "Usage timer started");

        Ok(Self {
            key,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
            _guard: guard,
        })
    }

    pub fn key(&self) -> &UsageKey {
        &self.key
    }

    /// Stop the timer and close its accounting
    pub async fn stop(mut self, flush_remainder: bool) -> Result<Teardown, ProgressionError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let handle = self
            .handle
            .take()
            .ok_or_else(|| ProgressionError::Internal("usage timer already stopped".into()))?;
        let session = handle
            .await
            .map_err(|e| ProgressionError::Internal(format!("usage timer task failed: {}", e)))?
            .ok_or_else(|| ProgressionError::Internal("usage timer closed without stop".into()))?;

        let teardown = session.finish(flush_remainder);
        info!(
            key = %self.key,
            total = teardown.state.server_total,
            dropped = teardown.dropped_seconds,
            "Usage timer stopped"
        );
        Ok(teardown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::Notify;

    const LUMP: u64 = 15;

    fn key() -> UsageKey {
        UsageKey::new("user-1", "plan-1", "act-1")
    }

    /// Ledger whose first write fails
    #[derive(Default)]
    struct FailOnceLedger {
        failed: AtomicBool,
        inner: InMemoryUsageLedger,
    }

    #[async_trait]
    impl UsageLedger for FailOnceLedger {
        async fn add_usage(&self, key: &UsageKey, seconds: u64) -> Result<u64, ProgressionError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(ProgressionError::Ledger("unavailable".into()));
            }
            self.inner.add_usage(key, seconds).await
        }

        async fn total(&self, key: &UsageKey) -> Result<u64, ProgressionError> {
            self.inner.total(key).await
        }
    }

    #[test]
    fn test_tick_below_lump_accrues_locally() {
        let outcome = tick(UsageState::new(100), LUMP);
        assert_eq!(outcome.flush, None);
        assert_eq!(outcome.state.local_remainder, 1);
        assert_eq!(outcome.display_seconds, 101);
    }

    #[test]
    fn test_remainder_31_flushes_two_lumps() {
        let before = UsageState {
            server_total: 0,
            local_remainder: 30,
            retry_backlog: 0,
        };
        let outcome = tick(before, LUMP);
        assert_eq!(outcome.flush, Some(30));
        assert_eq!(outcome.state.server_total, 30);
        assert_eq!(outcome.state.local_remainder, 1);
        assert_eq!(outcome.display_seconds, before.display_seconds() + 1);
    }

    #[test]
    fn test_display_is_monotonic() {
        let mut state = UsageState::new(7);
        let mut last = state.display_seconds();
        for _ in 0..100 {
            let outcome = tick(state, LUMP);
            assert!(outcome.display_seconds > last);
            last = outcome.display_seconds;
            state = outcome.state;
        }
        assert_eq!(state.server_total, 7 + 90);
        assert_eq!(state.local_remainder, 10);
    }

    #[test]
    fn test_failed_flush_rides_with_next_lump() {
        let mut state = UsageState::new(0);
        for _ in 0..LUMP {
            state = tick(state, LUMP).state;
        }
        state.flush_failed(15);
        assert_eq!(state.server_total, 15);
        assert_eq!(state.display_seconds(), 15);

        let mut flushed = None;
        for _ in 0..LUMP {
            let outcome = tick(state, LUMP);
            state = outcome.state;
            flushed = flushed.or(outcome.flush);
        }
        assert_eq!(flushed, Some(30));
        assert_eq!(state.retry_backlog, 0);
        assert_eq!(state.server_total, 30);
    }

    #[test]
    fn test_confirmed_total_never_regresses() {
        let mut state = UsageState::new(45);
        state.flush_confirmed(30);
        assert_eq!(state.server_total, 45);
        state.flush_confirmed(60);
        assert_eq!(state.server_total, 60);
    }

    #[test]
    fn test_teardown_lossy_tail() {
        let state = UsageState {
            server_total: 30,
            local_remainder: 9,
            retry_backlog: 0,
        };
        let lossy = state.teardown(false);
        assert_eq!(lossy.dropped_seconds, 9);
        assert_eq!(lossy.final_flush, None);
        assert_eq!(lossy.state.server_total, 30);

        let flushed = state.teardown(true);
        assert_eq!(flushed.dropped_seconds, 0);
        assert_eq!(flushed.final_flush, Some(9));
        assert_eq!(flushed.state.server_total, 39);
    }

    #[tokio::test]
    async fn test_session_retries_after_failed_flush() {
        let ledger = Arc::new(FailOnceLedger::default());
        let mut session = UsageSession::new(key(), 0, LUMP, ledger.clone());

        for _ in 0..LUMP {
            session.on_tick();
        }
        session.settle().await;
        assert_eq!(session.state().retry_backlog, 15);
        assert_eq!(session.display_seconds(), 15);
        assert_eq!(ledger.total(&key()).await.unwrap(), 0);

        for _ in 0..LUMP {
            session.on_tick();
        }
        session.settle().await;
        assert_eq!(session.state().retry_backlog, 0);
        assert_eq!(session.state().server_total, 30);
        assert_eq!(ledger.total(&key()).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_session_emits_flush_events() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let ledger = Arc::new(InMemoryUsageLedger::new());
        let mut session = UsageSession::new(key(), 0, LUMP, ledger).with_events(bus.clone());

        for _ in 0..LUMP {
            session.on_tick();
        }
        session.settle().await;

        match rx.recv().await.unwrap() {
            ProgressionEvent::UsageFlushed { seconds, total, .. } => {
                assert_eq!(seconds, 15);
                assert_eq!(total, 15);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    /// Ledger that holds every write until released, then fails it
    #[derive(Default)]
    struct StalledLedger {
        release: Notify,
        calls: AtomicUsize,
        completed: AtomicUsize,
    }

    #[async_trait]
    impl UsageLedger for StalledLedger {
        async fn add_usage(
            &self,
            _key: &UsageKey,
            _seconds: u64,
        ) -> Result<u64, ProgressionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Err(ProgressionError::Ledger("timed out".into()))
        }

        async fn total(&self, _key: &UsageKey) -> Result<u64, ProgressionError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_flush_result_after_finish_is_discarded() {
        let ledger = Arc::new(StalledLedger::default());
        let mut session = UsageSession::new(key(), 0, LUMP, ledger.clone());

        for _ in 0..LUMP + 3 {
            session.on_tick();
        }
        while ledger.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let teardown = session.finish(false);
        assert_eq!(teardown.state.server_total, 15);
        assert_eq!(teardown.state.retry_backlog, 0);
        assert_eq!(teardown.final_flush, None);
        assert_eq!(teardown.dropped_seconds, 3);

        // The late failure has no session to land in and triggers no retry
        ledger.release.notify_one();
        while ledger.completed.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registry_rejects_duplicate_timer() {
        let registry = TimerRegistry::new();
        let guard = registry.register(&key()).unwrap();
        assert!(matches!(
            registry.register(&key()),
            Err(ProgressionError::DuplicateTimer(_))
        ));
        assert!(registry.is_running(&key()));

        drop(guard);
        assert!(!registry.is_running(&key()));
        assert!(registry.register(&key()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_and_stops_once() {
        let registry = TimerRegistry::new();
        let ledger = Arc::new(InMemoryUsageLedger::new());
        let session = UsageSession::new(key(), 0, LUMP, ledger.clone());

        let timer = UsageTimer::start(&registry, session, Duration::from_secs(1)).unwrap();
        let second = UsageSession::new(key(), 0, LUMP, ledger.clone());
        assert!(UsageTimer::start(&registry, second, Duration::from_secs(1)).is_err());

        tokio::time::sleep(Duration::from_millis(32_500)).await;

        let teardown = timer.stop(false).await.unwrap();
        assert_eq!(teardown.state.server_total, 30);
        assert_eq!(teardown.dropped_seconds, 2);
        assert_eq!(ledger.total(&key()).await.unwrap(), 30);
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_timer_flushes_retry_backlog() {
        let registry = TimerRegistry::new();
        let ledger = Arc::new(FailOnceLedger::default());
        let session = UsageSession::new(key(), 0, LUMP, ledger.clone());
        let timer = UsageTimer::start(&registry, session, Duration::from_secs(1)).unwrap();

        // First lump fails and waits in the backlog
        tokio::time::sleep(Duration::from_millis(20_500)).await;
        assert_eq!(ledger.total(&key()).await.unwrap(), 0);

        drop(timer);
        for _ in 0..100 {
            if ledger.total(&key()).await.unwrap() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ledger.total(&key()).await.unwrap(), 15);
        assert!(!registry.is_running(&key()));
    }
}
