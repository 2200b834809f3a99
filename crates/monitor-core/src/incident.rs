use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::result::ErrorKind;

/// Severity tag attached to an incident.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Low,
    /// Default for auto-opened incidents.
    #[default]
    Medium,
    /// Significant outage.
    High,
    /// Total outage.
    Critical,
}

/// A surfaced failure episode for one endpoint.
///
/// While unresolved, the detector opens no further auto-incident for the
/// same endpoint. `resolved_at`, when set, is never before `opened_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Incident {
    /// Incident identifier.
    pub id: Uuid,
    /// Affected endpoint.
    pub endpoint_id: String,
    /// Short human-readable title.
    pub title: String,
    /// Longer description.
    pub description: String,
    /// Severity tag.
    #[serde(default)]
    pub severity: Severity,
    /// Whether the detector opened this incident. The detector never
    /// resolves incidents it did not open.
    pub auto: bool,
    /// Opening time.
    pub opened_at: DateTime<Utc>,
    /// Resolution time, absent while the incident is open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    /// Open an auto-detected incident for `endpoint_id` after a streak of
    /// `failures` consecutive failures ending in `last_error`.
    pub fn auto_opened(
        endpoint_id: &str,
        endpoint_name: &str,
        last_error: ErrorKind,
        failures: u32,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Incident {
            id: Uuid::new_v4(),
            endpoint_id: endpoint_id.to_string(),
            title: format!("{endpoint_name} is down"),
            description: format!(
                "{endpoint_name} failed {failures} consecutive checks (last error: {last_error})"
            ),
            severity: Severity::Medium,
            auto: true,
            opened_at,
            resolved_at: None,
        }
    }

    /// Whether the incident is still open.
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Mark the incident resolved. The resolution time is clamped so it
    /// never precedes `opened_at`.
    pub fn resolve(&mut self, at: DateTime<Utc>) {
        self.resolved_at = Some(at.max(self.opened_at));
    }
}
