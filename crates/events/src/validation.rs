//! Structural validation of inbound events.
//!
//! Validation never runs as a gate in front of the job store: unknown and
//! malformed events are persisted like any other and then fail each processing
//! attempt with the error produced here, which becomes the job's `last_error`.

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::envelope::WebsiteEventEnvelope;
use crate::event::{
    LEAD_SUBMITTED, LeadSubmitted, VALUATION_REQUESTED, ValuationRequested, WebsiteEvent,
};

/// Why an event cannot be turned into a [`WebsiteEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown_event_type: {0}")]
    UnknownEventType(String),

    #[error("unsupported_version: {event_type} v{version}")]
    UnsupportedVersion { event_type: String, version: u32 },

    #[error("invalid_payload: {event_type}: {reason}")]
    InvalidPayload { event_type: String, reason: String },
}

impl ValidationError {
    /// Stable machine-readable code (the prefix of the `Display` output).
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::UnknownEventType(_) => "unknown_event_type",
            ValidationError::UnsupportedVersion { .. } => "unsupported_version",
            ValidationError::InvalidPayload { .. } => "invalid_payload",
        }
    }

    fn invalid(event_type: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            event_type: event_type.to_string(),
            reason: reason.into(),
        }
    }
}

/// Validate an envelope into its typed event.
pub fn validate(envelope: &WebsiteEventEnvelope) -> Result<WebsiteEvent, ValidationError> {
    parse_event(envelope.event_type(), envelope.version(), envelope.payload())
}

/// Validate a persisted `(event_type, version, payload)` triple.
pub fn parse_event(
    event_type: &str,
    version: u32,
    payload: &JsonValue,
) -> Result<WebsiteEvent, ValidationError> {
    match event_type {
        LEAD_SUBMITTED => {
            require_version(event_type, version)?;
            let lead: LeadSubmitted = decode(event_type, payload)?;
            check_email(event_type, &lead.email)?;
            Ok(WebsiteEvent::LeadSubmitted(lead))
        }
        VALUATION_REQUESTED => {
            require_version(event_type, version)?;
            let valuation: ValuationRequested = decode(event_type, payload)?;
            check_email(event_type, &valuation.email)?;
            if valuation.address.trim().is_empty() {
                return Err(ValidationError::invalid(event_type, "address is empty"));
            }
            Ok(WebsiteEvent::ValuationRequested(valuation))
        }
        other => Err(ValidationError::UnknownEventType(other.to_string())),
    }
}

fn require_version(event_type: &str, version: u32) -> Result<(), ValidationError> {
    if version == 1 {
        Ok(())
    } else {
        Err(ValidationError::UnsupportedVersion {
            event_type: event_type.to_string(),
            version,
        })
    }
}

fn decode<T: DeserializeOwned>(event_type: &str, payload: &JsonValue) -> Result<T, ValidationError> {
    if !payload.is_object() {
        return Err(ValidationError::invalid(event_type, "payload is not an object"));
    }
    T::deserialize(payload).map_err(|e| ValidationError::invalid(event_type, e.to_string()))
}

fn check_email(event_type: &str, email: &str) -> Result<(), ValidationError> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(ValidationError::invalid(event_type, "email is not a valid address")),
    }
}
