//! Strongly-typed identifiers used across the workspace.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Upper bound on tenant identifier length (matches the column width).
pub const MAX_TENANT_ID_LEN: usize = 128;

/// Identifier of a tenant (multi-tenant boundary).
///
/// Tenants are addressed by the opaque string handed to us by tenant
/// resolution (a slug or a UUID rendered as text). The value is trimmed and
/// must be non-empty, at most [`MAX_TENANT_ID_LEN`] bytes, and free of control
/// characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        let trimmed = value.trim();

        if trimmed.is_empty() {
            return Err(DomainError::invalid_id("TenantId: must not be empty"));
        }
        if trimmed.len() > MAX_TENANT_ID_LEN {
            return Err(DomainError::invalid_id(format!(
                "TenantId: longer than {MAX_TENANT_ID_LEN} bytes"
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(DomainError::invalid_id(
                "TenantId: contains control characters",
            ));
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for TenantId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for TenantId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_is_trimmed() {
        let id = TenantId::new("  acme-realty ").unwrap();
        assert_eq!(id.as_str(), "acme-realty");
    }

    #[test]
    fn tenant_id_rejects_empty_and_oversized_values() {
        assert!(TenantId::new("   ").is_err());
        assert!(TenantId::new("a".repeat(MAX_TENANT_ID_LEN + 1)).is_err());
        assert!(TenantId::new("bad\nid").is_err());
    }

    #[test]
    fn tenant_id_deserialization_validates() {
        let ok: TenantId = serde_json::from_str("\"t-1\"").unwrap();
        assert_eq!(ok.to_string(), "t-1");

        let err = serde_json::from_str::<TenantId>("\"\"");
        assert!(err.is_err());
    }
}
