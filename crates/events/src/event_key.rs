//! Idempotency key derivation.
//!
//! The key, not any transport-level message id, is the deduplication boundary
//! of the ingestion queue: two submissions of the same user action must derive
//! the same key, distinct occurrences must not.
//!
//! Field set per event type:
//!
//! | event | parts |
//! |---|---|
//! | any, with producer key | tenant, type, `client`, producer key |
//! | `lead.submitted` | tenant, type, email, listing id or `-`, time bucket |
//! | `valuation.requested` | tenant, type, email, normalized address, time bucket |
//! | unknown / malformed | tenant, type, canonical payload JSON, time bucket |
//!
//! Emails are trimmed and lowercased; addresses are lowercased with `,`/`.`
//! removed and whitespace collapsed. The time bucket is `occurred_at` floored to
//! [`TIME_BUCKET_SECS`].

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::envelope::WebsiteEventEnvelope;
use crate::event::WebsiteEvent;
use crate::validation::validate;

/// Width of the occurrence-time bucket folded into derived keys.
pub const TIME_BUCKET_SECS: i64 = 600;

const SEPARATOR: u8 = 0x1f;

/// Derive the idempotency key of an envelope.
pub fn derive_event_key(envelope: &WebsiteEventEnvelope) -> String {
    let tenant = envelope.tenant_id().as_str();
    let event_type = envelope.event_type();

    if let Some(client_key) = envelope.idempotency_key() {
        return render(event_type, &[tenant, event_type, "client", client_key]);
    }

    let bucket = time_bucket(envelope.occurred_at()).to_string();

    match validate(envelope) {
        Ok(WebsiteEvent::LeadSubmitted(lead)) => {
            let email = normalize_email(&lead.email);
            let listing = lead
                .listing_id
                .as_deref()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .unwrap_or("-");
            render(event_type, &[tenant, event_type, &email, listing, &bucket])
        }
        Ok(WebsiteEvent::ValuationRequested(valuation)) => {
            let email = normalize_email(&valuation.email);
            let address = normalize_address(&valuation.address);
            render(event_type, &[tenant, event_type, &email, &address, &bucket])
        }
        Err(_) => {
            let canonical = canonical_json(envelope.payload());
            render(event_type, &[tenant, event_type, &canonical, &bucket])
        }
    }
}

fn render(event_type: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            hasher.update([SEPARATOR]);
        }
        hasher.update(part.as_bytes());
    }
    format!("{event_type}:{}", hex::encode(hasher.finalize()))
}

fn time_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(TIME_BUCKET_SECS)
}

fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn normalize_address(raw: &str) -> String {
    raw.to_lowercase()
        .replace([',', '.'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// JSON rendering with object keys sorted at every level.
fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
