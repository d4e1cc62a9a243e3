//! Event Envelope Factory

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::envelope::{EventEnvelope, CONTENT_TYPE_JSON, SPEC_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to serialize payload for {event_type}: {source}")]
    Serialization {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("event type cannot be empty")]
    MissingEventType,
}

/// Builds envelopes for one producing service
///
/// Deterministic apart from `id` (fresh UUID v4) and `time` (now, UTC).
#[derive(Debug, Clone)]
pub struct EnvelopeFactory {
    source: String,
}

impl EnvelopeFactory {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Wrap `payload` in a new envelope.
    ///
    /// A payload that fails to serialize is an error; the caller must not
    /// persist the originating write without a valid envelope.
    pub fn build<T: Serialize + ?Sized>(
        &self,
        event_type: &str,
        subject: &str,
        payload: &T,
    ) -> Result<EventEnvelope, EnvelopeError> {
        if event_type.is_empty() {
            return Err(EnvelopeError::MissingEventType);
        }

        let data = serde_json::to_value(payload).map_err(|source| EnvelopeError::Serialization {
            event_type: event_type.to_string(),
            source,
        })?;

        Ok(EventEnvelope {
            specversion: SPEC_VERSION.to_string(),
            id: Uuid::new_v4(),
            source: self.source.clone(),
            event_type: event_type.to_string(),
            time: Utc::now(),
            subject: subject.to_string(),
            datacontenttype: CONTENT_TYPE_JSON.to_string(),
            data,
            correlation_id: None,
            workflow_id: None,
            wave_number: None,
        })
    }

    /// Same as [`EnvelopeFactory::build`], carrying correlation extensions
    pub fn build_correlated<T: Serialize + ?Sized>(
        &self,
        event_type: &str,
        subject: &str,
        payload: &T,
        correlation_id: Option<String>,
        workflow_id: Option<String>,
    ) -> Result<EventEnvelope, EnvelopeError> {
        let mut envelope = self.build(event_type, subject, payload)?;
        envelope.correlation_id = correlation_id;
        envelope.workflow_id = workflow_id;
        Ok(envelope)
    }
}
