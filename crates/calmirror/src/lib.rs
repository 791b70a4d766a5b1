//! Locally cached, periodically refreshed mirror of a remote calendar.
//!
//! The sync engine decides between full and incremental resynchronization,
//! merges provider deltas (updates and cancellations) into a SQLite cache,
//! and serves the cached window when the provider is unreachable. A
//! client-side session layer adds time-based staleness with single-flight
//! revalidation on top.

pub mod cache;
pub mod client;
pub mod engine;
pub mod error;
pub mod session;
pub mod types;

pub use cache::{EventStore, SqliteEventStore};
pub use client::CalendarClient;
pub use engine::{EventSource, SyncConfig, SyncEngine, SyncMode, SyncOutcome, SyncStats};
pub use error::{ProviderError, StoreError, SyncError};
pub use session::{ClientCacheRecord, EventsSnapshot, SessionCache};
pub use types::{Event, EventStatus, EventTime, EventWindow, SyncMetadata};
