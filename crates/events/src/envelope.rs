use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use leadflow_core::TenantId;

/// Tenant context resolved by the surface that emitted the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantContext {
    pub tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }
}

/// Envelope for an inbound website event.
///
/// This is the unit producers hand to `enqueue`.
///
/// Notes:
/// - **Multi-tenancy** is carried here via `tenant`.
/// - `occurred_at` is business time reported by the producer, not arrival time.
/// - `payload` is kept as raw JSON; it is only interpreted by [`crate::validate`],
///   so unknown or malformed events still travel intact into the job store.
/// - `idempotency_key`, when the producer has one (e.g. a form submission id
///   reused across client retries), takes precedence over derived fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawWebsiteEvent")]
pub struct WebsiteEventEnvelope {
    event_type: String,
    version: u32,
    occurred_at: DateTime<Utc>,
    tenant: TenantContext,
    payload: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    idempotency_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWebsiteEvent {
    event_type: String,
    #[serde(default = "default_version")]
    version: u32,
    occurred_at: DateTime<Utc>,
    tenant: TenantContext,
    #[serde(default)]
    payload: JsonValue,
    #[serde(default)]
    idempotency_key: Option<String>,
}

fn default_version() -> u32 {
    1
}

impl From<RawWebsiteEvent> for WebsiteEventEnvelope {
    fn from(raw: RawWebsiteEvent) -> Self {
        Self::new(
            raw.event_type,
            raw.version,
            raw.occurred_at,
            raw.tenant.tenant_id,
            raw.payload,
        )
        .with_idempotency_key_opt(raw.idempotency_key)
    }
}

impl WebsiteEventEnvelope {
    pub fn new(
        event_type: impl Into<String>,
        version: u32,
        occurred_at: DateTime<Utc>,
        tenant_id: TenantId,
        payload: JsonValue,
    ) -> Self {
        Self {
            event_type: normalize_event_type(&event_type.into()),
            version,
            occurred_at,
            tenant: TenantContext::new(tenant_id),
            payload,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(self, key: impl Into<String>) -> Self {
        self.with_idempotency_key_opt(Some(key.into()))
    }

    fn with_idempotency_key_opt(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant.tenant_id
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    pub fn into_payload(self) -> JsonValue {
        self.payload
    }
}

fn normalize_event_type(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_and_normalizes_producer_json() {
        let envelope: WebsiteEventEnvelope = serde_json::from_value(json!({
            "eventType": "  Lead.Submitted ",
            "occurredAt": "2026-03-01T10:15:00Z",
            "tenant": { "tenantId": "acme" },
            "payload": { "email": "a@example.com" },
            "idempotencyKey": "   "
        }))
        .unwrap();

        assert_eq!(envelope.event_type(), "lead.submitted");
        assert_eq!(envelope.version(), 1);
        assert_eq!(envelope.tenant_id().as_str(), "acme");
        assert_eq!(envelope.idempotency_key(), None);
    }

    #[test]
    fn rejects_envelope_without_tenant() {
        let result = serde_json::from_value::<WebsiteEventEnvelope>(json!({
            "eventType": "lead.submitted",
            "occurredAt": "2026-03-01T10:15:00Z",
            "tenant": { "tenantId": "" },
            "payload": {}
        }));
        assert!(result.is_err());
    }
}
