//! # Event Envelope
//!
//! CloudEvents 1.0 wrapper for every domain event published on the platform.
//!
//! - `id`: unique per event, the dedup key for consumers
//! - `source`: producing service (e.g. `/wms/order-service`)
//! - `type`: event type tag (e.g. `wms.order.received`)
//! - `time`: UTC instant the envelope was built
//! - `subject`: the aggregate the event is about (e.g. `order/ORD-1`)
//! - `data`: JSON payload
//!
//! `wmscorrelationid`, `wmsworkflowid` and `wmswavenumber` are platform
//! extension attributes, omitted when unset.
//!
//! Envelopes are built once by [`crate::EnvelopeFactory`] and never mutated
//! afterwards; the outbox stores them serialized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SPEC_VERSION: &str = "1.0";
pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub specversion: String,

    pub id: Uuid,

    pub source: String,

    #[serde(rename = "type")]
    pub event_type: String,

    pub time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject: String,

    pub datacontenttype: String,

    pub data: serde_json::Value,

    #[serde(
        rename = "wmscorrelationid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,

    #[serde(rename = "wmsworkflowid", default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    #[serde(rename = "wmswavenumber", default, skip_serializing_if = "Option::is_none")]
    pub wave_number: Option<String>,
}

impl EventEnvelope {
    /// `subject` formatted as `<kind>/<id>` is split into its two halves
    pub fn subject_parts(&self) -> Option<(&str, &str)> {
        self.subject.split_once('/')
    }
}

/// Validate a raw envelope received off the wire
///
/// # Validation Rules
///
/// - `specversion` must be `"1.0"`
/// - `id` must be a UUID
/// - `source` and `type` must be non-empty strings
/// - `time` must be an RFC 3339 timestamp
/// - `data` must be present (it may be `null`)
pub fn validate_envelope(envelope: &serde_json::Value) -> Result<(), String> {
    let spec = envelope
        .get("specversion")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid specversion")?;
    if spec != SPEC_VERSION {
        return Err(format!("Unsupported specversion: {spec}"));
    }

    let id = envelope
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid id")?;
    Uuid::parse_str(id).map_err(|_| format!("id is not a UUID: {id}"))?;

    for field in ["source", "type"] {
        let value = envelope
            .get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("Missing or invalid {field}"))?;
        if value.is_empty() {
            return Err(format!("{field} cannot be empty"));
        }
    }

    let time = envelope
        .get("time")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid time")?;
    DateTime::parse_from_rfc3339(time).map_err(|_| format!("time is not RFC 3339: {time}"))?;

    if envelope.get("data").is_none() {
        return Err("Missing data".to_string());
    }

    Ok(())
}
