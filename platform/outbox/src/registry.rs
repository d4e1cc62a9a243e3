//! Event-type registry
//!
//! Maps a domain event's type tag to the aggregate type, broker topic and
//! envelope subject it is published with. Repositories hand their pending
//! domain events to [`EventRegistry::to_records`] instead of switching on
//! concrete event types; a new event type is one `register` call.

use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;

use event_bus::{EnvelopeError, EnvelopeFactory, EventEnvelope};

use crate::{OutboxError, OutboxRecord, DEFAULT_MAX_RETRIES};

/// A fact recorded by an aggregate, waiting to be written to the outbox
pub trait DomainEvent: Send + Sync + 'static {
    /// Type tag, e.g. `wms.order.received`
    fn event_type(&self) -> &'static str;

    fn aggregate_id(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

type BuildFn = Box<
    dyn Fn(&EnvelopeFactory, &dyn DomainEvent) -> Result<Option<EventEnvelope>, EnvelopeError>
        + Send
        + Sync,
>;

struct Registration {
    aggregate_type: String,
    topic: String,
    build: BuildFn,
}

pub struct EventRegistry {
    factory: EnvelopeFactory,
    max_retries: u32,
    entries: HashMap<&'static str, Registration>,
}

impl EventRegistry {
    pub fn new(factory: EnvelopeFactory) -> Self {
        Self {
            factory,
            max_retries: DEFAULT_MAX_RETRIES,
            entries: HashMap::new(),
        }
    }

    /// Retry budget stamped on every record built by this registry
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Register `E` under `event_type`. `subject` builds the envelope subject.
    pub fn register<E>(
        &mut self,
        event_type: &'static str,
        aggregate_type: impl Into<String>,
        topic: impl Into<String>,
        subject: fn(&E) -> String,
    ) -> &mut Self
    where
        E: DomainEvent + Serialize,
    {
        let build: BuildFn = Box::new(move |factory: &EnvelopeFactory, event: &dyn DomainEvent| {
            let Some(concrete) = event.as_any().downcast_ref::<E>() else {
                return Ok(None);
            };
            factory
                .build(event_type, &subject(concrete), concrete)
                .map(Some)
        });

        self.entries.insert(
            event_type,
            Registration {
                aggregate_type: aggregate_type.into(),
                topic: topic.into(),
                build,
            },
        );
        self
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.entries.contains_key(event_type)
    }

    pub fn topic_for(&self, event_type: &str) -> Option<&str> {
        self.entries.get(event_type).map(|r| r.topic.as_str())
    }

    pub fn to_record(&self, event: &dyn DomainEvent) -> Result<OutboxRecord, OutboxError> {
        let event_type = event.event_type();
        let registration = self
            .entries
            .get(event_type)
            .ok_or_else(|| OutboxError::UnregisteredEventType(event_type.to_string()))?;

        let envelope = (registration.build)(&self.factory, event)?
            .ok_or_else(|| OutboxError::EventTypeMismatch(event_type.to_string()))?;

        Ok(OutboxRecord::from_envelope(
            registration.aggregate_type.clone(),
            event.aggregate_id(),
            registration.topic.clone(),
            envelope,
        )
        .with_max_retries(self.max_retries))
    }

    /// Build records for `events`, preserving their order. Fails on the
    /// first event that cannot be built; nothing should be saved then.
    pub fn to_records(
        &self,
        events: &[Box<dyn DomainEvent>],
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        events.iter().map(|e| self.to_record(e.as_ref())).collect()
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&&str> = self.entries.keys().collect();
        types.sort();
        f.debug_struct("EventRegistry")
            .field("source", &self.factory.source())
            .field("event_types", &types)
            .finish()
    }
}
