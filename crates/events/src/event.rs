use serde::{Deserialize, Serialize};

/// Discriminator of a lead submitted through a contact or listing form.
pub const LEAD_SUBMITTED: &str = "lead.submitted";

/// Discriminator of a valuation requested through a valuation widget.
pub const VALUATION_REQUESTED: &str = "valuation.requested";

/// A typed website event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "lead.submitted").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;
}

/// Payload of `lead.submitted` (v1).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadSubmitted {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    /// Listing the lead asked about, when submitted from a listing page.
    #[serde(default)]
    pub listing_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Free-form marker of the surface that produced the lead.
    #[serde(default)]
    pub source: Option<String>,
}

/// Payload of `valuation.requested` (v1).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuationRequested {
    pub email: String,
    pub address: String,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub property_type: Option<String>,
}

/// Every event type the ingestion queue knows how to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebsiteEvent {
    LeadSubmitted(LeadSubmitted),
    ValuationRequested(ValuationRequested),
}

impl Event for WebsiteEvent {
    fn event_type(&self) -> &'static str {
        match self {
            WebsiteEvent::LeadSubmitted(_) => LEAD_SUBMITTED,
            WebsiteEvent::ValuationRequested(_) => VALUATION_REQUESTED,
        }
    }

    fn version(&self) -> u32 {
        1
    }
}

impl WebsiteEvent {
    /// Contact email carried by the event, as submitted.
    pub fn contact_email(&self) -> &str {
        match self {
            WebsiteEvent::LeadSubmitted(e) => &e.email,
            WebsiteEvent::ValuationRequested(e) => &e.email,
        }
    }
}
