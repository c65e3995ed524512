//! An in-memory event store, useful for testing and development.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use tracing::{debug, instrument};

use crate::{
    Aggregate, DomainEvent, EventRecord, EventRegistry, EventStore, Result,
    store::{conflict, prepare_batch},
};

// Type aliases to keep complex generic types readable and satisfy clippy::type-complexity.
type EventStream = Vec<EventRecord>;

/// Thread-safe map keyed by aggregate_id
type StoreMap = DashMap<String, EventStream>;

/// An in-memory, thread-safe event store.
///
/// Events are kept in their encoded form and decoded through the registry on
/// every read, exactly like a persistent store. The map entry lock makes the
/// version check and the append a single step.
pub struct InMemoryEventStore<A: Aggregate> {
    events: Arc<StoreMap>,
    registry: EventRegistry<A::Event>,
}

impl<A: Aggregate> InMemoryEventStore<A> {
    /// Creates an empty store, building the decoder registry for `A::Event`.
    pub fn new() -> Result<Self> {
        Ok(Self {
            events: Arc::new(DashMap::new()),
            registry: EventRegistry::build()?,
        })
    }

    fn decode_all<'a, I>(&self, records: I) -> Result<Vec<DomainEvent<A::Event>>>
    where
        I: IntoIterator<Item = &'a EventRecord>,
    {
        records
            .into_iter()
            .map(|record| self.registry.decode(record.clone()))
            .collect()
    }
}

impl<A: Aggregate> Clone for InMemoryEventStore<A> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
            registry: self.registry.clone(),
        }
    }
}

#[async_trait]
impl<A> EventStore<A> for InMemoryEventStore<A>
where
    A: Aggregate,
{
    #[instrument(skip(self, events), fields(id = %id, count = events.len()))]
    async fn save_events(
        &self,
        id: &A::Id,
        events: &[DomainEvent<A::Event>],
        expected_version: i64,
    ) -> Result<()> {
        let aggregate_id = id.to_string();
        let records = prepare_batch::<A>(&aggregate_id, events, expected_version)?;
        if records.is_empty() {
            return Ok(());
        }

        // Unknown ids get no entry unless the append goes through.
        match self.events.entry(aggregate_id.clone()) {
            Entry::Occupied(mut stream) => {
                let current_version = stream.get().last().map_or(0, |e| e.event_version);
                if current_version != expected_version {
                    return Err(conflict(&aggregate_id, expected_version, Some(current_version)));
                }
                stream.get_mut().extend(records);
            }
            Entry::Vacant(slot) => {
                if expected_version != 0 {
                    return Err(conflict(&aggregate_id, expected_version, Some(0)));
                }
                slot.insert(records);
            }
        }
        debug!(version = expected_version + events.len() as i64, "events appended");
        Ok(())
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn load_events_from_version(
        &self,
        id: &A::Id,
        from_version: i64,
    ) -> Result<Vec<DomainEvent<A::Event>>> {
        match self.events.get(&id.to_string()) {
            Some(stream) => {
                self.decode_all(stream.iter().filter(|e| e.event_version > from_version))
            }
            None => Ok(Vec::new()),
        }
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn get_aggregate_version(&self, id: &A::Id) -> Result<i64> {
        Ok(self
            .events
            .get(&id.to_string())
            .and_then(|stream| stream.last().map(|e| e.event_version))
            .unwrap_or(0))
    }

    #[instrument(skip(self))]
    async fn events_by_type(
        &self,
        event_type: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DomainEvent<A::Event>>> {
        let mut matching: Vec<EventRecord> = self
            .events
            .iter()
            .flat_map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.aggregate_type == A::TYPE && e.event_type == event_type)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        matching.sort_by(|a, b| {
            b.occurred_at
                .cmp(&a.occurred_at)
                .then(b.event_version.cmp(&a.event_version))
        });

        self.decode_all(matching.iter().skip(offset).take(limit))
    }
}
