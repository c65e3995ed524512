//! The store module contains the implementations of the event and snapshot
//! stores.

use crate::{Aggregate, DomainEvent, Error, EventRecord, Result};

// The in-memory implementations are compiled when the `in-memory` feature is
// enabled (this is the default).
#[cfg(feature = "in-memory")]
/// An in-memory event store.
pub mod in_memory;

#[cfg(feature = "in-memory")]
/// An in-memory snapshot store.
pub mod in_memory_snapshot;

// SQLx / Postgres implementation compiled when the `postgres-storage` feature
// is enabled.
#[cfg(feature = "postgres-storage")]
pub mod sqlx_postgres;

/// Validates and encodes a batch before anything is written.
///
/// Every event must belong to `aggregate_id` and the versions must run
/// contiguously from `expected_version + 1`.
pub(crate) fn prepare_batch<A: Aggregate>(
    aggregate_id: &str,
    events: &[DomainEvent<A::Event>],
    expected_version: i64,
) -> Result<Vec<EventRecord>> {
    events
        .iter()
        .zip(expected_version + 1..)
        .map(|(event, version)| {
            if event.aggregate_id() != aggregate_id {
                return Err(Error::AggregateIdMismatch {
                    expected: aggregate_id.to_owned(),
                    found: event.aggregate_id().to_owned(),
                });
            }
            if event.event_version() != version {
                return Err(Error::EventVersionInvalid {
                    aggregate_id: aggregate_id.to_owned(),
                    expected: version,
                    found: event.event_version(),
                });
            }
            event.to_record()
        })
        .collect()
}

pub(crate) fn conflict(aggregate_id: &str, expected: i64, actual: Option<i64>) -> Error {
    tracing::warn!(
        aggregate.id = aggregate_id,
        expected,
        actual,
        "optimistic concurrency conflict"
    );
    Error::AggregateVersionConflict {
        aggregate_id: aggregate_id.to_owned(),
        expected,
        actual,
    }
}
