//! Website events: the envelope producers hand us, the typed events the
//! handlers consume, and the idempotency key that deduplicates them.

pub mod envelope;
pub mod event;
pub mod event_key;
pub mod validation;

pub use envelope::{TenantContext, WebsiteEventEnvelope};
pub use event::{
    Event, LEAD_SUBMITTED, LeadSubmitted, VALUATION_REQUESTED, ValuationRequested, WebsiteEvent,
};
pub use event_key::{TIME_BUCKET_SECS, derive_event_key};
pub use validation::{ValidationError, parse_event, validate};
