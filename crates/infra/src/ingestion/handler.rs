//! Event handlers invoked by the batch processor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use leadflow_core::TenantId;
use leadflow_events::{Event, WebsiteEvent};

use super::types::JobId;

/// What a handler knows about the job it is running for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerContext {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub event_key: String,
    /// 1-based attempt number of this run.
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Handler failure. Every variant counts as a failed attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// Worth retrying (downstream timeout, rate limit, ...).
    #[error("transient: {0}")]
    Transient(String),
    /// Will not succeed on retry; still retried until the budget is spent.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }
}

/// Side-effecting consumer of one website event type.
///
/// Delivery is at-least-once: a handler may see the same job again after a
/// stale reclaim, so it must be idempotent on `HandlerContext::event_key`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, event: &WebsiteEvent)
    -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> EventHandler for Arc<H>
where
    H: EventHandler + ?Sized,
{
    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &WebsiteEvent,
    ) -> Result<(), HandlerError> {
        (**self).handle(ctx, event).await
    }
}

/// Event type → handler lookup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `event_type`.
    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(event_type.into(), Arc::new(handler));
        self
    }

    pub fn with(
        mut self,
        event_type: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) -> Self {
        self.register(event_type, handler);
        self
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_type).cloned()
    }

    /// Handler for a typed event.
    pub fn for_event(&self, event: &WebsiteEvent) -> Option<Arc<dyn EventHandler>> {
        self.get(event.event_type())
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut types: Vec<_> = self.event_types().collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("event_types", &types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_events::{LEAD_SUBMITTED, LeadSubmitted, VALUATION_REQUESTED};

    struct Noop;

    #[async_trait]
    impl EventHandler for Noop {
        async fn handle(&self, _: &HandlerContext, _: &WebsiteEvent) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn lookup_is_by_event_type() {
        let registry = HandlerRegistry::new().with(LEAD_SUBMITTED, Noop);

        let event = WebsiteEvent::LeadSubmitted(LeadSubmitted {
            email: "a@b.io".into(),
            ..Default::default()
        });
        assert!(registry.for_event(&event).is_some());
        assert!(registry.get(VALUATION_REQUESTED).is_none());
        assert_eq!(
            format!("{registry:?}"),
            "HandlerRegistry { event_types: [\"lead.submitted\"] }"
        );
    }
}
