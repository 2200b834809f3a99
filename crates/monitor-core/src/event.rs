use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::incident::Incident;
use crate::result::ProbeResult;

/// Kind of a broadcast event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    /// A probe completed.
    ProbeResult,
    /// The detector opened an incident.
    IncidentOpened,
    /// An existing incident changed without resolving.
    IncidentUpdated,
    /// The detector resolved an incident.
    IncidentResolved,
    /// An endpoint was registered.
    EndpointCreated,
    /// An endpoint definition changed.
    EndpointUpdated,
    /// An endpoint was removed.
    EndpointDeleted,
    /// Idle-connection heartbeat.
    Ping,
}

impl EventType {
    /// Wire name of the event type, as used in the SSE `event:` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ProbeResult => "probe-result",
            EventType::IncidentOpened => "incident-opened",
            EventType::IncidentUpdated => "incident-updated",
            EventType::IncidentResolved => "incident-resolved",
            EventType::EndpointCreated => "endpoint-created",
            EventType::EndpointUpdated => "endpoint-updated",
            EventType::EndpointDeleted => "endpoint-deleted",
            EventType::Ping => "ping",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event before the hub stamps it with an id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventPayload {
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// JSON payload delivered to subscribers.
    pub data: Value,
}

impl EventPayload {
    /// Payload for a completed probe.
    pub fn probe_result(result: &ProbeResult) -> Self {
        EventPayload {
            event_type: EventType::ProbeResult,
            data: serde_json::to_value(result).unwrap_or_default(),
        }
    }

    /// Payload for an incident transition.
    pub fn incident(event_type: EventType, incident: &Incident) -> Self {
        EventPayload {
            event_type,
            data: serde_json::to_value(incident).unwrap_or_default(),
        }
    }

    /// Payload for an endpoint registration or update.
    pub fn endpoint(event_type: EventType, endpoint: &Endpoint) -> Self {
        EventPayload {
            event_type,
            data: serde_json::to_value(endpoint).unwrap_or_default(),
        }
    }

    /// Payload for an endpoint removal; carries only the id.
    pub fn endpoint_deleted(endpoint_id: &str) -> Self {
        EventPayload {
            event_type: EventType::EndpointDeleted,
            data: serde_json::json!({ "id": endpoint_id }),
        }
    }

    /// Heartbeat payload.
    pub fn ping(ts: DateTime<Utc>) -> Self {
        EventPayload {
            event_type: EventType::Ping,
            data: serde_json::json!({ "ts": ts.to_rfc3339() }),
        }
    }
}

/// A stamped broadcast event as delivered to subscribers.
///
/// Ids are strictly increasing within a hub instance; delivery to a single
/// subscriber is in id order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Monotonically increasing hub-assigned id.
    pub id: u64,
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Stamping time.
    pub timestamp: DateTime<Utc>,
    /// JSON payload.
    pub data: Value,
}
