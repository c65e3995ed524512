//! Aggregates and the bookkeeping that keeps their state a fold over events.
use std::fmt::Debug;

use chrono::Utc;

use crate::{
    AggregateId, DomainEvent, Error, Event, EventMetadata, Result, snapshot::AggregateSnapshot,
};

/// The domain state of a consistency boundary.
///
/// State only changes through [`Aggregate::apply`], which must be
/// deterministic: the same events in the same order always produce the same
/// state. [`AggregateRoot`] tracks identity, version and pending events
/// around it.
pub trait Aggregate: Clone + Debug + Default + Send + Sync + 'static {
    /// The type of the aggregate's unique identifier.
    type Id: AggregateId;
    /// The type of events that this aggregate produces and consumes.
    type Event: Event;

    /// The aggregate kind tag stored with every event, e.g. `"User"`.
    const TYPE: &'static str;

    /// Applies an event to the aggregate, changing its state.
    ///
    /// Returns [`Error::Domain`] when the event is not a valid transition
    /// from the current state.
    fn apply(&mut self, event: &Self::Event) -> Result<()>;

    /// Serializes the current state for a snapshot.
    fn snapshot(&self) -> Result<Vec<u8>> {
        Err(Error::SnapshotNotSupported(Self::TYPE.to_owned()))
    }

    /// Restores state previously produced by [`Aggregate::snapshot`].
    fn restore(data: &[u8]) -> Result<Self> {
        let _ = data;
        Err(Error::SnapshotNotSupported(Self::TYPE.to_owned()))
    }
}

/// An aggregate instance: identity, version, state and uncommitted events.
#[derive(Debug, Clone)]
pub struct AggregateRoot<A: Aggregate> {
    id: A::Id,
    version: i64,
    state: A,
    uncommitted: Vec<DomainEvent<A::Event>>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Creates a blank aggregate at version 0.
    pub fn new(id: A::Id) -> Self {
        Self {
            id,
            version: 0,
            state: A::default(),
            uncommitted: Vec::new(),
        }
    }

    /// Restores an aggregate from a snapshot taken at `snapshot.version()`.
    pub fn from_snapshot(id: A::Id, snapshot: &AggregateSnapshot) -> Result<Self> {
        let expected = id.to_string();
        if snapshot.aggregate_id() != expected {
            return Err(Error::AggregateIdMismatch {
                expected,
                found: snapshot.aggregate_id().to_owned(),
            });
        }
        Ok(Self {
            id,
            version: snapshot.version(),
            state: A::restore(snapshot.data())?,
            uncommitted: Vec::new(),
        })
    }

    /// Returns the unique identifier of the aggregate.
    pub fn id(&self) -> &A::Id {
        &self.id
    }

    /// Returns the aggregate kind tag.
    pub fn aggregate_type(&self) -> &'static str {
        A::TYPE
    }

    /// Returns the version of the last applied event, 0 if none.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Returns the current state.
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Consumes the aggregate and returns its state.
    pub fn into_state(self) -> A {
        self.state
    }

    /// Records a new event with no correlation data.
    pub fn raise_event(&mut self, event: A::Event) -> Result<()> {
        self.raise_event_with(event, EventMetadata::default())
    }

    /// Records a new event at `version + 1`.
    ///
    /// The event is applied to a copy of the state first. If that fails the
    /// event is discarded and the aggregate is left untouched.
    pub fn raise_event_with(&mut self, event: A::Event, metadata: EventMetadata) -> Result<()> {
        let event = DomainEvent::new(
            self.id.to_string(),
            A::TYPE,
            self.version + 1,
            event,
            metadata,
        );

        let mut next = self.state.clone();
        next.apply(event.payload())?;

        self.state = next;
        self.version = event.event_version();
        self.uncommitted.push(event);
        Ok(())
    }

    /// Applies a recorded event to the state without touching the version.
    pub fn apply(&mut self, event: &DomainEvent<A::Event>) -> Result<()> {
        let expected = self.id.to_string();
        if event.aggregate_id() != expected {
            return Err(Error::AggregateIdMismatch {
                expected,
                found: event.aggregate_id().to_owned(),
            });
        }
        if event.event_type() != event.payload().event_type() {
            return Err(Error::UnknownEventType {
                aggregate_type: A::TYPE.to_owned(),
                event_type: event.event_type().to_owned(),
            });
        }
        self.state.apply(event.payload())
    }

    /// Replays stored events in order.
    ///
    /// Each event must carry exactly `version + 1`; a gap or duplicate fails
    /// with [`Error::EventVersionInvalid`].
    pub fn load_from_history<I>(&mut self, events: I) -> Result<()>
    where
        I: IntoIterator<Item = DomainEvent<A::Event>>,
    {
        if !self.uncommitted.is_empty() {
            return Err(Error::UncommittedEvents(self.id.to_string()));
        }
        for event in events {
            let expected = self.version + 1;
            if event.event_version() != expected {
                return Err(Error::EventVersionInvalid {
                    aggregate_id: self.id.to_string(),
                    expected,
                    found: event.event_version(),
                });
            }
            self.apply(&event)?;
            self.version = event.event_version();
        }
        Ok(())
    }

    /// Returns a copy of the events raised since the last save.
    pub fn uncommitted_events(&self) -> Vec<DomainEvent<A::Event>> {
        self.uncommitted.clone()
    }

    /// Returns whether any raised event is still unsaved.
    pub fn has_uncommitted_events(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Drops the pending events once they are durable.
    pub fn clear_uncommitted_events(&mut self) {
        self.uncommitted.clear();
    }

    /// Captures the current state as a snapshot.
    ///
    /// Only a fully saved aggregate can be snapshotted, so the snapshot
    /// never covers events that are not in the store.
    pub fn take_snapshot(&self) -> Result<AggregateSnapshot> {
        if self.has_uncommitted_events() {
            return Err(Error::UncommittedEvents(self.id.to_string()));
        }
        Ok(AggregateSnapshot::new(
            self.id.to_string(),
            A::TYPE,
            self.version,
            self.state.snapshot()?,
            Utc::now(),
        ))
    }
}
