#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Monitoring engine for Watchtower: per-endpoint probe scheduling, a
//! bounded worker pool executing HTTP probes, incident detection from
//! result streams, and a live event hub with per-subscriber buffering.

/// Public configuration, event, and error types for the engine.
pub mod api;
/// Event hub, subscriptions, and SSE wire framing.
pub mod hub;

mod detector;
mod engine;
mod pipeline;
mod probe;
mod scheduler;
mod validate;
mod worker;

pub use api::{
    EngineConfig, EngineError, EngineEvent, ProbeJob, ResultCallback, SkipReason, StatusSnapshot,
};
pub use engine::Engine;
pub use hub::{Broadcaster, SSE_HEADERS, Subscription, sse_frame};
