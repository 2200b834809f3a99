#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared domain model for the Watchtower monitoring engine: endpoints,
//! probe results, incidents, broadcast events, and the persistent-store
//! interface the engine consumes.

/// Monitoring targets and their validation rules.
pub mod endpoint;
/// Broadcast event types and payload constructors.
pub mod event;
/// Surfaced failure episodes.
pub mod incident;
/// Probe outcomes and the probe error taxonomy.
pub mod result;
/// Persistent-store interface and the in-memory implementation.
pub mod store;

pub use endpoint::{ConfigError, Endpoint, EndpointPatch, HttpMethod};
pub use event::{Event, EventPayload, EventType};
pub use incident::{Incident, Severity};
pub use result::{ErrorKind, ProbeResult};
pub use store::{MemoryStore, MonitorStore, StoreError};
