use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    CreateScenario,
    DeleteScenario,
    PromoteBaseline,
    Simulate,
    AdjustForecast,
    SaveSnapshot,
    MarkAlertRead,
    ResolveAlert,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::CreateScenario => "create_scenario",
            AuditAction::DeleteScenario => "delete_scenario",
            AuditAction::PromoteBaseline => "promote_baseline",
            AuditAction::Simulate => "simulate",
            AuditAction::AdjustForecast => "adjust_forecast",
            AuditAction::SaveSnapshot => "save_snapshot",
            AuditAction::MarkAlertRead => "mark_alert_read",
            AuditAction::ResolveAlert => "resolve_alert",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured audit record of a committed mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub actor: String,
    pub action: AuditAction,
    /// Resource kind, e.g. `scenario` or `forecast`.
    pub resource: String,
    pub resource_id: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        actor: impl Into<String>,
        action: AuditAction,
        resource: impl Into<String>,
        resource_id: impl ToString,
    ) -> Self {
        Self {
            actor: actor.into(),
            action,
            resource: resource.into(),
            resource_id: resource_id.to_string(),
            timestamp: Utc::now(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Receives audit events; the engine keeps no audit history itself.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> crate::error::Result<()>;
}

/// Writes events to the `log` facade under the `audit` target.
#[derive(Debug, Default)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, event: AuditEvent) -> crate::error::Result<()> {
        let details = serde_json::to_string(&event.details)?;
        info!(
            target: "audit",
            "{} {} {}:{} at {} {}",
            event.actor,
            event.action,
            event.resource,
            event.resource_id,
            event.timestamp.to_rfc3339(),
            details
        );
        Ok(())
    }
}

/// Keeps events in memory, mostly for tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, action: AuditAction) -> usize {
        self.events().iter().filter(|e| e.action == action).count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> crate::error::Result<()> {
        self.events
            .lock()
            .map_err(|_| {
                crate::error::TreasuryError::Collaborator("audit sink lock poisoned".to_string())
            })?
            .push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_sink_collects_in_order() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditEvent::new("alice", AuditAction::Simulate, "scenario", "s-1"))
            .unwrap();
        sink.record(
            AuditEvent::new("bob", AuditAction::AdjustForecast, "forecast", "f-1")
                .with_details(json!({ "version": 2 })),
        )
        .unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].actor, "alice");
        assert_eq!(events[1].details["version"], 2);
        assert_eq!(sink.count(AuditAction::Simulate), 1);
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = AuditEvent::new("alice", AuditAction::SaveSnapshot, "snapshot", 42);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], "save_snapshot");
        assert_eq!(value["resourceId"], "42");
        assert!(LogAuditSink.record(event).is_ok());
    }
}
