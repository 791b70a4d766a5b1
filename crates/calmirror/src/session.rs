//! Client-side revalidation layer: a keyed, short-lived cache consulted
//! before any engine round trip.
//!
//! Each user session owns one slot. Reads are served from the slot while it
//! is fresh; stale reads return immediately and refresh in the background
//! (stale-while-revalidate); concurrent refreshes collapse into a single
//! in-flight synchronize call per slot.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::warn;

use crate::cache::EventStore;
use crate::engine::{EventSource, SyncEngine};
use crate::types::Event;

/// Minutes after which a stored record is considered stale.
pub const STALE_AFTER_MINUTES: i64 = 5;

/// Last successful read. Replaced wholesale on every revalidation, never
/// partially merged.
#[derive(Debug, Clone)]
pub struct ClientCacheRecord {
    pub events: Vec<Event>,
    pub fetched_at: DateTime<Utc>,
}

/// Snapshot returned to the UI layer.
#[derive(Debug, Clone)]
pub struct EventsSnapshot {
    pub events: Vec<Event>,
    pub is_stale: bool,
    pub is_revalidating: bool,
    pub last_fetch: Option<DateTime<Utc>>,
    /// Last failure or degraded-freshness signal. A failure never discards
    /// the previous record; stale data plus this signal beats no data.
    pub error: Option<String>,
}

#[derive(Default)]
struct SlotState {
    record: Option<ClientCacheRecord>,
    revalidating: bool,
    last_error: Option<String>,
}

#[derive(Default)]
struct SessionSlot {
    state: Mutex<SlotState>,
    /// Serializes revalidations for this slot (single-flight).
    flight: tokio::sync::Mutex<()>,
}

/// Keyed ownership table of per-session client caches, in front of the
/// sync engine. Slots are created on first request and dropped on
/// `teardown` (sign-out).
pub struct SessionCache<P, S> {
    engine: Arc<SyncEngine<P, S>>,
    stale_after: Duration,
    slots: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

impl<P, S> SessionCache<P, S>
where
    P: EventSource + 'static,
    S: EventStore + 'static,
{
    pub fn new(engine: Arc<SyncEngine<P, S>>) -> Self {
        Self::with_stale_after(engine, Duration::minutes(STALE_AFTER_MINUTES))
    }

    pub fn with_stale_after(engine: Arc<SyncEngine<P, S>>, stale_after: Duration) -> Self {
        Self {
            engine,
            stale_after,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Read events for a user session.
    ///
    /// Fresh slot: returns immediately, no synchronize call. Stale slot:
    /// returns the stored record immediately and revalidates in the
    /// background. Empty slot or `force_refresh`: awaits a revalidation,
    /// coalescing with any already in flight. `force_refresh` requests a
    /// full resync from the engine.
    pub async fn get_events(&self, user_id: &str, force_refresh: bool) -> EventsSnapshot {
        let slot = self.slot(user_id);
        let requested_at = Utc::now();

        if !force_refresh {
            let mut state = slot.state.lock();
            if let Some(record) = &state.record {
                if !self.is_stale(record, requested_at) {
                    return snapshot(&state, false);
                }
                if !state.revalidating {
                    state.revalidating = true;
                    let engine = Arc::clone(&self.engine);
                    let slot = Arc::clone(&slot);
                    let user = user_id.to_string();
                    tokio::spawn(async move {
                        revalidate(engine, slot, &user, false, requested_at).await;
                    });
                }
                return snapshot(&state, true);
            }
        }

        revalidate(
            Arc::clone(&self.engine),
            Arc::clone(&slot),
            user_id,
            force_refresh,
            requested_at,
        )
        .await;

        let state = slot.state.lock();
        let is_stale = state
            .record
            .as_ref()
            .is_some_and(|record| self.is_stale(record, Utc::now()));
        snapshot(&state, is_stale)
    }

    /// Drop a user's session slot (sign-out lifecycle), along with the
    /// engine's serialization lock for that user.
    pub fn teardown(&self, user_id: &str) {
        self.slots.lock().remove(user_id);
        self.engine.forget_user(user_id);
    }

    fn is_stale(&self, record: &ClientCacheRecord, now: DateTime<Utc>) -> bool {
        now - record.fetched_at >= self.stale_after
    }

    fn slot(&self, user_id: &str) -> Arc<SessionSlot> {
        self.slots
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }
}

fn snapshot(state: &SlotState, is_stale: bool) -> EventsSnapshot {
    EventsSnapshot {
        events: state
            .record
            .as_ref()
            .map(|r| r.events.clone())
            .unwrap_or_default(),
        is_stale,
        is_revalidating: state.revalidating,
        last_fetch: state.record.as_ref().map(|r| r.fetched_at),
        error: state.last_error.clone(),
    }
}

/// Run (or coalesce into) one revalidation for a slot. A flight that
/// completed after `requested_at` already satisfies this request, so no
/// second synchronize call is issued. Completed flights always commit
/// their result (last-writer-wins on the record).
async fn revalidate<P, S>(
    engine: Arc<SyncEngine<P, S>>,
    slot: Arc<SessionSlot>,
    user_id: &str,
    force_full: bool,
    requested_at: DateTime<Utc>,
) where
    P: EventSource,
    S: EventStore,
{
    let _flight = slot.flight.lock().await;

    {
        let mut state = slot.state.lock();
        if state
            .record
            .as_ref()
            .is_some_and(|record| record.fetched_at >= requested_at)
        {
            state.revalidating = false;
            return;
        }
        state.revalidating = true;
    }

    let result = engine.synchronize(user_id, force_full).await;

    let mut state = slot.state.lock();
    state.revalidating = false;
    match result {
        Ok(outcome) => {
            state.last_error = outcome.warning.clone();
            state.record = Some(ClientCacheRecord {
                events: outcome.events,
                fetched_at: Utc::now(),
            });
        }
        Err(err) => {
            warn!(user_id, %err, "revalidation failed, keeping previous record");
            state.last_error = Some(err.user_message().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use crate::cache::SqliteEventStore;
    use crate::error::ProviderError;
    use crate::types::{EventStatus, EventTime, EventWindow};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Source that counts calls and can be made to block on a semaphore.
    struct GatedSource {
        calls: Arc<AtomicUsize>,
        gate: Arc<tokio::sync::Semaphore>,
        fail: Arc<AtomicBool>,
    }

    impl EventSource for GatedSource {
        async fn list_events(
            &self,
            _time_min: DateTime<Utc>,
            _time_max: DateTime<Utc>,
            _changed_since: Option<DateTime<Utc>>,
            _max_results: u32,
        ) -> Result<EventWindow, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ProviderError::Unauthorized);
            }
            let permit = self.gate.acquire().await.map_err(|_| {
                ProviderError::Api("gate closed".to_string())
            })?;
            permit.forget();
            Ok(EventWindow {
                events: vec![event("e1")],
                summary: "Test Calendar".to_string(),
            })
        }
    }

    fn event(id: &str) -> Event {
        let start = Utc::now() + Duration::hours(2);
        Event {
            id: id.to_string(),
            summary: Some("Meeting".to_string()),
            description: None,
            location: None,
            start: Some(EventTime::DateTime(start)),
            end: Some(EventTime::DateTime(start + Duration::hours(1))),
            status: EventStatus::Confirmed,
            link: None,
        }
    }

    struct Fixture {
        cache: SessionCache<GatedSource, SqliteEventStore>,
        calls: Arc<AtomicUsize>,
        gate: Arc<tokio::sync::Semaphore>,
        fail: Arc<AtomicBool>,
    }

    fn fixture(stale_after: Duration, permits: usize) -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Semaphore::new(permits));
        let fail = Arc::new(AtomicBool::new(false));
        let source = GatedSource {
            calls: Arc::clone(&calls),
            gate: Arc::clone(&gate),
            fail: Arc::clone(&fail),
        };
        let engine = Arc::new(SyncEngine::new(
            source,
            SqliteEventStore::in_memory().unwrap(),
        ));
        Fixture {
            cache: SessionCache::with_stale_after(engine, stale_after),
            calls,
            gate,
            fail,
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_first_request_issues_one_call() {
        let fx = fixture(Duration::minutes(5), 1);

        let snap = fx.cache.get_events("u1", false).await;

        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(snap.events.len(), 1);
        assert!(!snap.is_revalidating);
        assert!(!snap.is_stale);
        assert!(snap.last_fetch.is_some());
    }

    #[tokio::test]
    async fn test_fresh_request_issues_no_call() {
        let fx = fixture(Duration::minutes(5), 1);

        fx.cache.get_events("u1", false).await;
        let snap = fx.cache.get_events("u1", false).await;

        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert!(!snap.is_stale);
    }

    #[tokio::test]
    async fn test_stale_serves_immediately_and_revalidates_once() {
        // Zero staleness: every stored record is immediately stale.
        let fx = fixture(Duration::zero(), 1);

        let first_fetch = fx.cache.get_events("u1", false).await.last_fetch;

        // Stale read: served from the record while one background call
        // starts and blocks on the gate.
        let snap = fx.cache.get_events("u1", false).await;
        assert_eq!(snap.events.len(), 1);
        assert!(snap.is_stale);

        wait_until(|| fx.calls.load(Ordering::SeqCst) == 2).await;

        // Concurrent request during the in-flight window: no extra call.
        let snap = fx.cache.get_events("u1", false).await;
        assert!(snap.is_revalidating);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);

        // Release the gate; the background result commits.
        fx.gate.add_permits(1);
        wait_until(|| {
            let slot = fx.cache.slot("u1");
            let state = slot.state.lock();
            !state.revalidating
        })
        .await;

        let snap = fx.cache.get_events("u1", false).await;
        assert!(snap.last_fetch > first_fetch);
    }

    #[tokio::test]
    async fn test_concurrent_empty_requests_single_flight() {
        let fx = fixture(Duration::minutes(5), 0);

        let first = tokio::spawn({
            let cache = Arc::new(fx.cache);
            let cache2 = Arc::clone(&cache);
            async move {
                let a = cache.get_events("u1", false);
                let b = cache2.get_events("u1", false);
                tokio::join!(a, b)
            }
        });

        // Both requests are in flight against a closed gate; exactly one
        // reached the source.
        wait_until(|| fx.calls.load(Ordering::SeqCst) == 1).await;
        fx.gate.add_permits(1);

        let (a, b) = first.await.unwrap();
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.events.len(), 1);
        assert_eq!(b.events.len(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_fresh_record() {
        let fx = fixture(Duration::minutes(5), 2);

        fx.cache.get_events("u1", false).await;
        fx.cache.get_events("u1", true).await;

        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_record() {
        let fx = fixture(Duration::minutes(5), 2);

        let snap = fx.cache.get_events("u1", false).await;
        assert_eq!(snap.events.len(), 1);

        fx.fail.store(true, Ordering::SeqCst);
        let snap = fx.cache.get_events("u1", true).await;

        // The failed refresh left the old record in place with an error
        // signal beside it.
        assert_eq!(snap.events.len(), 1);
        assert!(snap.error.is_some());
        assert!(!snap.is_revalidating);
    }

    #[tokio::test]
    async fn test_teardown_drops_slot() {
        let fx = fixture(Duration::minutes(5), 2);

        fx.cache.get_events("u1", false).await;
        fx.cache.teardown("u1");
        fx.cache.get_events("u1", false).await;

        // A fresh slot means a fresh synchronize call.
        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let fx = fixture(Duration::minutes(5), 2);

        fx.cache.get_events("u1", false).await;
        fx.cache.get_events("u2", false).await;

        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
    }
}
