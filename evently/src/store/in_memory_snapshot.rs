//! An in-memory snapshot store.
use std::{marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use tracing::instrument;

use crate::{
    Aggregate, Result,
    snapshot::{AggregateSnapshot, SnapshotStore},
};

/// An in-memory, thread-safe snapshot store.
///
/// This is useful for testing or for applications that do not require a
/// persistent snapshot store.
#[derive(Debug)]
pub struct InMemorySnapshotStore<A: Aggregate> {
    snapshots: Arc<DashMap<String, AggregateSnapshot>>,
    _phantom: PhantomData<A>,
}

impl<A: Aggregate> Default for InMemorySnapshotStore<A> {
    fn default() -> Self {
        Self {
            snapshots: Arc::new(DashMap::new()),
            _phantom: PhantomData,
        }
    }
}

impl<A: Aggregate> Clone for InMemorySnapshotStore<A> {
    fn clone(&self) -> Self {
        Self {
            snapshots: Arc::clone(&self.snapshots),
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<A> SnapshotStore<A> for InMemorySnapshotStore<A>
where
    A: Aggregate,
{
    #[instrument(skip(self, snapshot), fields(aggregate_id = snapshot.aggregate_id(), version = snapshot.version()))]
    async fn save_snapshot(&self, snapshot: &AggregateSnapshot) -> Result<()> {
        match self.snapshots.entry(snapshot.aggregate_id().to_owned()) {
            Entry::Occupied(mut existing) => {
                if existing.get().version() <= snapshot.version() {
                    existing.insert(snapshot.clone());
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(snapshot.clone());
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id))]
    async fn load_snapshot(&self, aggregate_id: &A::Id) -> Result<Option<AggregateSnapshot>> {
        Ok(self
            .snapshots
            .get(&aggregate_id.to_string())
            .map(|r| r.clone()))
    }
}
