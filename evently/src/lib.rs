//! # Event Sourcing Aggregates
//!
//! `evently` derives domain object state exclusively from an ordered,
//! immutable log of domain events. It persists that log with optimistic
//! concurrency control and reconstructs aggregates on demand, optionally
//! starting from a snapshot.
//!
//! ## Core Concepts
//!
//! - **[`Aggregate`]**: the domain state of a consistency boundary. State only
//!   changes by applying events.
//! - **[`AggregateRoot`]**: wraps an [`Aggregate`] with its identity, version
//!   and the events raised since the last save.
//! - **[`Event`]**: the typed payload of a fact, with one type tag per kind.
//! - **[`DomainEvent`]**: an event envelope carrying the aggregate id and the
//!   per-aggregate `event_version` that orders the log.
//! - **[`EventStore`]**: durable, append-only, version-checked event storage.
//! - **[`SnapshotStore`](snapshot::SnapshotStore)**: one snapshot per
//!   aggregate, used to skip replaying old history.
//! - **[`Repository`](repository::Repository)**: loads and saves aggregates.
//!
//! ## Example
//!
//! ```rust,no_run
//! use evently::{Aggregate, AggregateRoot, Error, Event, Result};
//! use serde::{Deserialize, Serialize};
//! use uuid::Uuid;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! pub struct Opened {
//!     pub initial_balance: u64,
//! }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! pub struct Debited {
//!     pub amount: u64,
//! }
//!
//! #[derive(Debug, Clone, Event)]
//! pub enum AccountEvent {
//!     #[event(name = "AccountOpened")]
//!     Opened(Opened),
//!     #[event(name = "AccountDebited")]
//!     Debited(Debited),
//! }
//!
//! #[derive(Debug, Clone, Default)]
//! pub struct Account {
//!     balance: u64,
//! }
//!
//! impl Aggregate for Account {
//!     type Id = Uuid;
//!     type Event = AccountEvent;
//!     const TYPE: &'static str = "Account";
//!
//!     fn apply(&mut self, event: &Self::Event) -> Result<()> {
//!         match event {
//!             AccountEvent::Opened(e) => self.balance = e.initial_balance,
//!             AccountEvent::Debited(e) => {
//!                 self.balance = self
//!                     .balance
//!                     .checked_sub(e.amount)
//!                     .ok_or_else(|| Error::Domain("insufficient funds".into()))?;
//!             }
//!         }
//!         Ok(())
//!     }
//! }
//!
//! use evently::repository::{GenericRepository, Repository};
//! use evently::store::{in_memory::InMemoryEventStore, in_memory_snapshot::InMemorySnapshotStore};
//! use std::sync::Arc;
//!
//! async fn account_example() -> Result<()> {
//!     let event_store = Arc::new(InMemoryEventStore::<Account>::new()?);
//!     let repo = GenericRepository::new(event_store, None::<Arc<InMemorySnapshotStore<Account>>>);
//!
//!     let mut account = AggregateRoot::<Account>::new(Uuid::new_v4());
//!     account.raise_event(AccountEvent::Opened(Opened { initial_balance: 10 }))?;
//!     account.raise_event(AccountEvent::Debited(Debited { amount: 4 }))?;
//!     repo.save(&mut account).await?;
//!
//!     let loaded = repo.load(account.id()).await?;
//!     assert_eq!(loaded.version(), 2);
//!     Ok(())
//! }
//! ```
#![deny(missing_docs)]

// Lets the `Event` derive expand to `::evently::...` paths inside this crate.
extern crate self as evently;

use std::{fmt::Debug, time::Duration};

pub use async_trait::async_trait;
use uuid::Uuid;

pub mod aggregate;
pub mod event;
pub mod repository;
pub mod snapshot;
pub mod store;

pub use aggregate::{Aggregate, AggregateRoot};
pub use event::{Decoder, DomainEvent, Event, EventMetadata, EventRecord, EventRegistry};
#[cfg(feature = "derive")]
pub use evently_derive::Event;

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}

/// The error type for this crate.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// An event was applied to an aggregate it does not belong to.
    #[error("event for aggregate {found} applied to aggregate {expected}")]
    AggregateIdMismatch {
        /// The id of the aggregate receiving the event.
        expected: String,
        /// The aggregate id recorded on the event.
        found: String,
    },
    /// Neither a snapshot nor any event exists for the aggregate.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(String),
    /// The optimistic concurrency check failed. The caller must reload,
    /// re-run its domain logic and save again.
    #[error(
        "version conflict on aggregate {aggregate_id}: expected version {expected}, found {actual:?}"
    )]
    AggregateVersionConflict {
        /// The aggregate that had the conflict.
        aggregate_id: String,
        /// The version the writer expected.
        expected: i64,
        /// The durable version, when the store could observe it.
        actual: Option<i64>,
    },
    /// An event sequence has a gap or a duplicate version.
    #[error("invalid event version on aggregate {aggregate_id}: expected {expected}, found {found}")]
    EventVersionInvalid {
        /// The aggregate whose history is invalid.
        aggregate_id: String,
        /// The version that should have come next.
        expected: i64,
        /// The version that was found instead.
        found: i64,
    },
    /// The backing store could not be reached or failed to execute a query.
    #[error("event store unavailable: {0}")]
    EventStoreUnavailable(String),
    /// A payload could not be encoded or decoded for its event type.
    #[error("failed to serialize {event_type}: {reason}")]
    EventSerializationFailed {
        /// The event type (or snapshot owner) being serialized.
        event_type: String,
        /// The underlying serializer message.
        reason: String,
    },
    /// A stored event carries a type tag with no registered decoder.
    #[error("unknown event type {event_type} for aggregate type {aggregate_type}")]
    UnknownEventType {
        /// The aggregate type the event was read for.
        aggregate_type: String,
        /// The unrecognized type tag.
        event_type: String,
    },
    /// A declared event type has no decoder in the registry.
    #[error("event type {0} is declared but has no registered decoder")]
    UnregisteredEventType(String),
    /// The aggregate type does not implement the snapshot hooks.
    #[error("aggregate type {0} does not support snapshots")]
    SnapshotNotSupported(String),
    /// The aggregate rejected a state transition.
    #[error("domain error: {0}")]
    Domain(String),
    /// A store operation did not finish within the configured deadline. The
    /// outcome is unknown; re-read the aggregate version before retrying.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    /// Events were saved but the follow-up snapshot could not be written.
    #[error("events saved up to version {version} but snapshot failed: {reason}")]
    SnapshotWrite {
        /// The durable version of the aggregate.
        version: i64,
        /// Why the snapshot failed.
        reason: String,
    },
    /// The operation requires an aggregate without pending events.
    #[error("aggregate {0} has uncommitted events")]
    UncommittedEvents(String),
}

/// How a caller should react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Reload the aggregate, re-derive events and try again.
    Reload,
    /// The same request may be retried as-is, with backoff.
    Verbatim,
    /// Retrying cannot help.
    Never,
}

impl Error {
    /// Classifies the error for callers deciding whether to retry.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::AggregateVersionConflict { .. } | Self::Timeout(_) => RetryPolicy::Reload,
            Self::EventStoreUnavailable(_) => RetryPolicy::Verbatim,
            _ => RetryPolicy::Never,
        }
    }

    pub(crate) fn store(e: impl std::fmt::Display) -> Self {
        Self::EventStoreUnavailable(e.to_string())
    }

    pub(crate) fn serialization(event_type: impl Into<String>, e: impl std::fmt::Display) -> Self {
        Self::EventSerializationFailed {
            event_type: event_type.into(),
            reason: e.to_string(),
        }
    }
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Uniquely identifies an aggregate instance.
pub trait AggregateId:
    Eq + std::hash::Hash + Clone + Send + Sync + ToString + Debug + std::fmt::Display + 'static
{
    /// Creates a new, unique aggregate ID.
    fn new() -> Self;
}

impl AggregateId for Uuid {
    fn new() -> Self {
        Uuid::new_v4()
    }
}

impl AggregateId for String {
    fn new() -> Self {
        Uuid::new_v4().to_string()
    }
}

/// The trait for event stores.
///
/// Streams are keyed by the string form of the aggregate id. Every method
/// surfaces backend failures as [`Error::EventStoreUnavailable`] and never
/// retries internally.
#[async_trait]
pub trait EventStore<A: Aggregate>: Send + Sync {
    /// Appends `events` to the stream of `id`.
    ///
    /// This operation must be atomic. It fails with
    /// [`Error::AggregateVersionConflict`] if the durable version is not
    /// `expected_version`, and persists nothing if any event fails.
    async fn save_events(
        &self,
        id: &A::Id,
        events: &[DomainEvent<A::Event>],
        expected_version: i64,
    ) -> Result<()>;

    /// Loads the full event stream for `id`, ordered by `event_version`.
    async fn load_events(&self, id: &A::Id) -> Result<Vec<DomainEvent<A::Event>>> {
        self.load_events_from_version(id, 0).await
    }

    /// Loads the events of `id` with `event_version > from_version`. This is
    /// used to hydrate an aggregate after restoring it from a snapshot.
    async fn load_events_from_version(
        &self,
        id: &A::Id,
        from_version: i64,
    ) -> Result<Vec<DomainEvent<A::Event>>>;

    /// Returns the durable version of `id`, or 0 if it has no events.
    async fn get_aggregate_version(&self, id: &A::Id) -> Result<i64>;

    /// Lists events of this aggregate type tagged `event_type`, across all
    /// aggregates, most recent `occurred_at` first.
    async fn events_by_type(
        &self,
        event_type: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DomainEvent<A::Event>>>;
}
