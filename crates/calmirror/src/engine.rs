//! Synchronization engine: full vs. incremental resync decisions, delta
//! reconciliation into the persistent cache, and cache fallback when the
//! provider is unreachable.
//!
//! Failure order is fixed: incremental attempt -> full sync -> cache
//! fallback -> error. Credential failures skip the ladder entirely.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::EventStore;
use crate::client::CalendarClient;
use crate::error::{ProviderError, StoreError, SyncError};
use crate::types::{window_order, Event, EventWindow};

/// Length of the synchronized window, from now.
pub const SYNC_WINDOW_DAYS: i64 = 5;
/// Cached events whose start is older than this are dropped during cleanup.
pub const RETENTION_DAYS: i64 = 7;
/// Subtracted from `last_sync_at` on incremental fetches; covers clock skew
/// and provider change-timestamp granularity at the cost of a little
/// redundant work.
pub const CHANGED_SINCE_BACKOFF_SECS: i64 = 60;
/// Page size requested from the provider.
pub const PAGE_LIMIT: u32 = 50;

/// Source of remote calendar events.
pub trait EventSource: Send + Sync {
    /// Fetch events in `[time_min, time_max]`. With `changed_since` set,
    /// only items changed since then, including explicit cancellation
    /// markers; without it, cancelled events are absent.
    fn list_events(
        &self,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
        changed_since: Option<DateTime<Utc>>,
        max_results: u32,
    ) -> impl Future<Output = Result<EventWindow, ProviderError>> + Send;
}

impl EventSource for CalendarClient {
    fn list_events(
        &self,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
        changed_since: Option<DateTime<Utc>>,
        max_results: u32,
    ) -> impl Future<Output = Result<EventWindow, ProviderError>> + Send {
        CalendarClient::list_events(self, time_min, time_max, changed_since, max_results)
    }
}

/// How a synchronize call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
    CacheFallback,
}

/// Reconciliation counters for one synchronize call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub upserted: usize,
    pub deleted: usize,
    pub cleaned_up: usize,
}

/// Result of one synchronize call.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub events: Vec<Event>,
    pub mode: SyncMode,
    pub stats: SyncStats,
    /// Set when the result is degraded (cache fallback).
    pub warning: Option<String>,
}

impl SyncOutcome {
    /// Whether the events were served from the cache because the provider
    /// was unreachable.
    pub fn from_cache(&self) -> bool {
        self.mode == SyncMode::CacheFallback
    }

    pub fn full_sync(&self) -> bool {
        self.mode == SyncMode::Full
    }

    /// Number of changed items applied to the cache.
    pub fn updated(&self) -> usize {
        self.stats.upserted + self.stats.deleted
    }
}

/// Engine tuning knobs, defaulting to the canonical constants.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub window: Duration,
    pub retention: Duration,
    pub changed_since_backoff: Duration,
    pub page_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window: Duration::days(SYNC_WINDOW_DAYS),
            retention: Duration::days(RETENTION_DAYS),
            changed_since_backoff: Duration::seconds(CHANGED_SINCE_BACKOFF_SECS),
            page_limit: PAGE_LIMIT,
        }
    }
}

/// Orchestrates synchronization between the provider and the store.
pub struct SyncEngine<P, S> {
    source: P,
    store: S,
    config: SyncConfig,
    user_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<P, S> SyncEngine<P, S>
where
    P: EventSource,
    S: EventStore,
{
    pub fn new(source: P, store: S) -> Self {
        Self::with_config(source, store, SyncConfig::default())
    }

    pub fn with_config(source: P, store: S, config: SyncConfig) -> Self {
        Self {
            source,
            store,
            config,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Read the cached window without contacting the provider.
    pub fn read_window(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        self.store.query_window(user_id, start, end)
    }

    /// Synchronize one user's window and return the reconciled events.
    ///
    /// Two-phase contract with the store: `last_sync_at` advances before the
    /// corresponding event batch is written. A crash between the two leaves
    /// the metadata describing an earlier-than-actual state, so the next
    /// call redoes a little work instead of missing deltas.
    ///
    /// Calls for the same user are serialized; different users run
    /// concurrently.
    ///
    /// # Errors
    ///
    /// `Unauthorized` if the provider rejects the credential (no fallback);
    /// `UpstreamUnavailable` if the provider is down and the cached window
    /// is empty; `StoreUnavailable` if the store fails while producing the
    /// returned window.
    pub async fn synchronize(
        &self,
        user_id: &str,
        force_full: bool,
    ) -> Result<SyncOutcome, SyncError> {
        let lock = self.user_lock(user_id);
        let _serialized = lock.lock().await;

        let now = Utc::now();
        let window_end = now + self.config.window;

        let mut stats = SyncStats::default();
        match self
            .store
            .delete_events_before(user_id, now - self.config.retention)
        {
            Ok(removed) => stats.cleaned_up = removed,
            Err(err) => warn!(user_id, %err, "cache cleanup failed"),
        }

        let last_sync_at = if force_full {
            None
        } else {
            match self.store.sync_metadata(user_id) {
                Ok(meta) => meta.map(|m| m.last_sync_at),
                Err(err) => {
                    warn!(user_id, %err, "sync metadata unreadable, selecting full sync");
                    None
                }
            }
        };

        if let Some(last_sync_at) = last_sync_at {
            let since = last_sync_at - self.config.changed_since_backoff;
            match self
                .source
                .list_events(now, window_end, Some(since), self.config.page_limit)
                .await
            {
                Ok(window) => {
                    return self.apply_incremental(user_id, now, window_end, window.events, stats)
                }
                // The only non-recoverable provider error is a credential
                // failure.
                Err(err) if !err.is_recoverable() => return Err(SyncError::Unauthorized),
                Err(err) => {
                    debug!(user_id, %err, "incremental fetch failed, falling back to full sync");
                }
            }
        }

        self.full_sync(user_id, now, window_end, stats).await
    }

    /// Merge an incremental delta batch into the cache and return the
    /// re-read window.
    fn apply_incremental(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        window_end: DateTime<Utc>,
        changed: Vec<Event>,
        mut stats: SyncStats,
    ) -> Result<SyncOutcome, SyncError> {
        // Metadata first; see the two-phase contract on `synchronize`.
        if let Err(err) = self.store.put_sync_metadata(user_id, now, None) {
            warn!(user_id, %err, "sync metadata write failed");
        }

        if !changed.is_empty() {
            let (cancelled, active): (Vec<Event>, Vec<Event>) =
                changed.into_iter().partition(|e| e.is_cancelled());
            let cancelled_ids: Vec<String> = cancelled.into_iter().map(|e| e.id).collect();

            if !active.is_empty() {
                self.store.upsert_events(user_id, &active)?;
                stats.upserted = active.len();
            }
            if !cancelled_ids.is_empty() {
                self.store.delete_events(user_id, &cancelled_ids)?;
                stats.deleted = cancelled_ids.len();
            }
        }

        let events = self.store.query_window(user_id, now, window_end)?;
        Ok(SyncOutcome {
            events,
            mode: SyncMode::Incremental,
            stats,
            warning: None,
        })
    }

    /// Unfiltered fetch of the whole window, with cache fallback when the
    /// provider fails.
    async fn full_sync(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        window_end: DateTime<Utc>,
        mut stats: SyncStats,
    ) -> Result<SyncOutcome, SyncError> {
        match self
            .source
            .list_events(now, window_end, None, self.config.page_limit)
            .await
        {
            Ok(window) => {
                if let Err(err) = self.store.put_sync_metadata(user_id, now, None) {
                    warn!(user_id, %err, "sync metadata write failed");
                }

                let mut events = window.events;
                self.store.upsert_events(user_id, &events)?;
                stats.upserted = events.len();

                events.sort_by(window_order);
                Ok(SyncOutcome {
                    events,
                    mode: SyncMode::Full,
                    stats,
                    warning: None,
                })
            }
            Err(err) if !err.is_recoverable() => Err(SyncError::Unauthorized),
            Err(err) => {
                warn!(user_id, %err, "full fetch failed, serving cached window");
                let cached = self.store.query_window(user_id, now, window_end)?;
                if cached.is_empty() {
                    Err(SyncError::UpstreamUnavailable(err.to_string()))
                } else {
                    Ok(SyncOutcome {
                        events: cached,
                        mode: SyncMode::CacheFallback,
                        stats,
                        warning: Some(
                            "calendar provider unreachable; showing cached events".to_string(),
                        ),
                    })
                }
            }
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.user_locks
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the serialization lock for a user who signed out. No-op while a
    /// synchronize call for that user is still in flight; the next call then
    /// re-creates the entry.
    pub fn forget_user(&self, user_id: &str) {
        let mut locks = self.user_locks.lock();
        if locks
            .get(user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(user_id);
        }
    }
}
