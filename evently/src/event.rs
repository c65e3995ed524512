//! Domain events, their stored form, and the per-type decoder registry.
use std::{collections::HashMap, fmt::Debug};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// The typed payload of a domain event.
///
/// Implement this on an enum with one variant per event kind. The
/// `Event` derive macro generates every method from the variants.
pub trait Event: Clone + Debug + Send + Sync + 'static {
    /// Every type tag this event declares.
    const EVENT_TYPES: &'static [&'static str];

    /// Returns the type tag of this event, e.g. `"UserCreated"`.
    fn event_type(&self) -> &'static str;

    /// Serializes the payload into the opaque bytes kept by the store.
    fn encode(&self) -> serde_json::Result<Vec<u8>>;

    /// Registers one decoder per type tag.
    fn register_decoders(registry: &mut EventRegistry<Self>);
}

/// Correlation data carried alongside an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Ties together every event caused by the same originating request.
    pub correlation_id: Option<Uuid>,
    /// The event or command that directly caused this event.
    pub causation_id: Option<Uuid>,
}

impl EventMetadata {
    /// Metadata correlated to `correlation_id`.
    pub fn correlated(correlation_id: Uuid) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            causation_id: None,
        }
    }

    /// Sets the causation id.
    #[must_use]
    pub fn caused_by(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }
}

/// An immutable fact that happened to an aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent<E: Event> {
    event_id: Uuid,
    event_type: String,
    aggregate_id: String,
    aggregate_type: String,
    event_version: i64,
    occurred_at: DateTime<Utc>,
    metadata: EventMetadata,
    payload: E,
}

impl<E: Event> DomainEvent<E> {
    /// Creates a new event with a fresh id, stamped with the current time.
    pub fn new(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        event_version: i64,
        payload: E,
        metadata: EventMetadata,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: payload.event_type().to_owned(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            event_version,
            occurred_at: Utc::now(),
            metadata,
            payload,
        }
    }

    /// Returns the unique id of this event.
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }
    /// Returns the type tag of this event.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }
    /// Returns the id of the aggregate this event belongs to.
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }
    /// Returns the type of the aggregate this event belongs to.
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }
    /// Returns the position of this event in its aggregate's stream.
    pub fn event_version(&self) -> i64 {
        self.event_version
    }
    /// Returns when the event was recorded.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
    /// Returns the correlation data.
    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
    /// Returns the event payload itself.
    pub fn payload(&self) -> &E {
        &self.payload
    }
    /// Consumes the event and returns the payload.
    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Encodes the event into its stored form.
    pub fn to_record(&self) -> Result<EventRecord> {
        let event_data = self
            .payload
            .encode()
            .map_err(|e| Error::serialization(&self.event_type, e))?;
        Ok(EventRecord {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            event_version: self.event_version,
            event_data,
            correlation_id: self.metadata.correlation_id,
            causation_id: self.metadata.causation_id,
            occurred_at: self.occurred_at,
        })
    }
}

/// An event as persisted: envelope columns plus opaque `event_data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Unique event id.
    pub event_id: Uuid,
    /// Type tag used to pick a decoder.
    pub event_type: String,
    /// Owning aggregate.
    pub aggregate_id: String,
    /// Owning aggregate's type.
    pub aggregate_type: String,
    /// Position in the aggregate's stream.
    pub event_version: i64,
    /// Encoded payload.
    pub event_data: Vec<u8>,
    /// See [`EventMetadata::correlation_id`].
    pub correlation_id: Option<Uuid>,
    /// See [`EventMetadata::causation_id`].
    pub causation_id: Option<Uuid>,
    /// When the event was recorded.
    pub occurred_at: DateTime<Utc>,
}

/// Decodes the stored bytes of one event type.
pub type Decoder<E> = fn(&[u8]) -> serde_json::Result<E>;

/// Maps each event type tag to its decoder.
///
/// Stores build one registry when they are constructed, so a type tag
/// without a decoder is caught at startup instead of on first replay.
#[derive(Debug, Clone)]
pub struct EventRegistry<E: Event> {
    decoders: HashMap<&'static str, Decoder<E>>,
}

impl<E: Event> EventRegistry<E> {
    /// Builds the registry for `E` and checks it covers exactly
    /// [`Event::EVENT_TYPES`].
    pub fn build() -> Result<Self> {
        let mut registry = Self {
            decoders: HashMap::with_capacity(E::EVENT_TYPES.len()),
        };
        E::register_decoders(&mut registry);

        if let Some(missing) = E::EVENT_TYPES
            .iter()
            .find(|t| !registry.decoders.contains_key(*t))
        {
            return Err(Error::UnregisteredEventType((*missing).to_owned()));
        }
        if let Some(extra) = registry
            .decoders
            .keys()
            .find(|t| !E::EVENT_TYPES.contains(*t))
        {
            return Err(Error::UnknownEventType {
                aggregate_type: std::any::type_name::<E>().to_owned(),
                event_type: (*extra).to_owned(),
            });
        }
        Ok(registry)
    }

    /// Registers `decoder` for `event_type`, replacing any previous one.
    pub fn register(&mut self, event_type: &'static str, decoder: Decoder<E>) -> &mut Self {
        self.decoders.insert(event_type, decoder);
        self
    }

    /// Returns whether a decoder exists for `event_type`.
    pub fn contains(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// Decodes a stored record into a typed event.
    pub fn decode(&self, record: EventRecord) -> Result<DomainEvent<E>> {
        let decoder =
            self.decoders
                .get(record.event_type.as_str())
                .ok_or_else(|| Error::UnknownEventType {
                    aggregate_type: record.aggregate_type.clone(),
                    event_type: record.event_type.clone(),
                })?;
        let payload =
            decoder(&record.event_data).map_err(|e| Error::serialization(&record.event_type, e))?;
        if payload.event_type() != record.event_type {
            return Err(Error::serialization(
                &record.event_type,
                format!("decoder produced a {} event", payload.event_type()),
            ));
        }

        Ok(DomainEvent {
            event_id: record.event_id,
            event_type: record.event_type,
            aggregate_id: record.aggregate_id,
            aggregate_type: record.aggregate_type,
            event_version: record.event_version,
            occurred_at: record.occurred_at,
            metadata: EventMetadata {
                correlation_id: record.correlation_id,
                causation_id: record.causation_id,
            },
            payload,
        })
    }
}
