//! The snapshot module contains the snapshot record and the trait for
//! storing snapshots.
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Aggregate, Result};

/// A point-in-time copy of an aggregate's state.
///
/// A snapshot taken at version `V` is only ever combined with events whose
/// `event_version > V`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateSnapshot {
    aggregate_id: String,
    aggregate_type: String,
    version: i64,
    snapshot_data: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl AggregateSnapshot {
    /// Creates a new snapshot record.
    pub fn new(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        version: i64,
        snapshot_data: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            version,
            snapshot_data,
            created_at,
        }
    }

    /// Returns the aggregate ID.
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// Returns the aggregate kind tag.
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    /// Returns the version of the aggregate when this snapshot was taken.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Returns the serialized state.
    pub fn data(&self) -> &[u8] {
        &self.snapshot_data
    }

    /// Returns when the snapshot was taken.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// A snapshot store is responsible for persisting and loading snapshots.
///
/// Snapshots are an optimization to reduce the time it takes to hydrate an
/// aggregate. Instead of replaying all events from the beginning of time, an
/// aggregate can be restored from a recent snapshot and then only replay the
/// events that occurred after it.
#[async_trait]
pub trait SnapshotStore<A: Aggregate>: Send + Sync {
    /// Saves a snapshot, replacing the one already kept for the aggregate
    /// unless that one is newer.
    async fn save_snapshot(&self, snapshot: &AggregateSnapshot) -> Result<()>;

    /// Loads the latest snapshot for an aggregate, `None` if there is none.
    async fn load_snapshot(&self, aggregate_id: &A::Id) -> Result<Option<AggregateSnapshot>>;
}
