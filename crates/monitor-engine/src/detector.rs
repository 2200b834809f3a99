use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use watchtower_core::event::{EventPayload, EventType};
use watchtower_core::incident::Incident;
use watchtower_core::result::ProbeResult;
use watchtower_core::store::MonitorStore;

use crate::api::EngineEvent;
use crate::engine::EngineCounters;
use crate::hub::HubHandle;

pub(crate) enum DetectorMsg {
    /// A validated probe result for a known endpoint.
    Observation {
        endpoint_name: String,
        result: ProbeResult,
    },
    /// Resume tracking an incident that was open before this run.
    Adopt { incident: Incident },
    /// The endpoint was removed; drop its health state.
    Forget { endpoint_id: String },
}

/// Per-endpoint streak counters. Counters reset on every incident
/// transition; at most one auto-incident is open per endpoint.
#[derive(Debug, Default)]
struct HealthState {
    consecutive_failures: u32,
    consecutive_successes: u32,
    open_incident: Option<Incident>,
    /// The open incident never reached the store; reconciled on a later
    /// observation or transition.
    persist_pending: bool,
    last_transition: Option<DateTime<Utc>>,
}

enum Transition {
    Open { failures: u32 },
    Resolve { incident: Incident, was_pending: bool },
    None,
}

struct Detector {
    store: Arc<dyn MonitorStore>,
    hub: HubHandle,
    event_tx: broadcast::Sender<EngineEvent>,
    counters: Arc<EngineCounters>,
    fail_threshold: u32,
    recovery_threshold: u32,
    states: HashMap<String, HealthState>,
}

/// Spawn the detector worker. It exits when every sender is gone.
pub(crate) fn spawn(
    store: Arc<dyn MonitorStore>,
    hub: HubHandle,
    event_tx: broadcast::Sender<EngineEvent>,
    counters: Arc<EngineCounters>,
    fail_threshold: u32,
    recovery_threshold: u32,
) -> (mpsc::Sender<DetectorMsg>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(256);
    let detector = Detector {
        store,
        hub,
        event_tx,
        counters,
        fail_threshold,
        recovery_threshold,
        states: HashMap::new(),
    };
    let join = tokio::spawn(detector.run(rx));
    (tx, join)
}

impl Detector {
    async fn run(mut self, mut rx: mpsc::Receiver<DetectorMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                DetectorMsg::Observation {
                    endpoint_name,
                    result,
                } => self.observe(endpoint_name, result).await,
                DetectorMsg::Adopt { incident } => self.adopt(incident),
                DetectorMsg::Forget { endpoint_id } => self.forget(&endpoint_id),
            }
        }
        debug!("detector loop exited");
    }

    fn adopt(&mut self, incident: Incident) {
        if !incident.auto || !incident.is_open() {
            return;
        }
        let state = self.states.entry(incident.endpoint_id.clone()).or_default();
        if state.open_incident.is_none() {
            info!(endpoint = %incident.endpoint_id, incident = %incident.id, "adopted open incident");
            state.open_incident = Some(incident);
            self.counters.open_incidents.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn forget(&mut self, endpoint_id: &str) {
        if let Some(state) = self.states.remove(endpoint_id) {
            debug!(
                endpoint = %endpoint_id,
                last_transition = ?state.last_transition,
                "dropping health state"
            );
            if state.open_incident.is_some() {
                self.counters.open_incidents.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    async fn observe(&mut self, endpoint_name: String, result: ProbeResult) {
        self.reconcile(&result.endpoint_id).await;

        let fail_threshold = self.fail_threshold;
        let recovery_threshold = self.recovery_threshold;
        let state = self.states.entry(result.endpoint_id.clone()).or_default();

        let transition = if result.success {
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
            if state.open_incident.is_some() && state.consecutive_successes >= recovery_threshold {
                state.consecutive_successes = 0;
                state.last_transition = Some(result.checked_at);
                let was_pending = state.persist_pending;
                state.persist_pending = false;
                match state.open_incident.take() {
                    Some(incident) => Transition::Resolve {
                        incident,
                        was_pending,
                    },
                    None => Transition::None,
                }
            } else {
                Transition::None
            }
        } else {
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
            if state.open_incident.is_none() && state.consecutive_failures >= fail_threshold {
                let failures = state.consecutive_failures;
                state.consecutive_failures = 0;
                state.last_transition = Some(result.checked_at);
                Transition::Open { failures }
            } else {
                Transition::None
            }
        };

        match transition {
            Transition::None => {}
            Transition::Open { failures } => {
                let incident = Incident::auto_opened(
                    &result.endpoint_id,
                    &endpoint_name,
                    result.error_kind,
                    failures,
                    Utc::now(),
                );
                info!(
                    endpoint = %result.endpoint_id,
                    incident = %incident.id,
                    failures,
                    "opening incident"
                );
                let persisted = self.persist_open(&incident).await;
                let state = self.states.entry(result.endpoint_id.clone()).or_default();
                state.persist_pending = !persisted;
                state.open_incident = Some(incident.clone());
                self.counters.open_incidents.fetch_add(1, Ordering::Relaxed);
                self.hub
                    .broadcast(EventPayload::incident(EventType::IncidentOpened, &incident));
            }
            Transition::Resolve {
                mut incident,
                was_pending,
            } => {
                incident.resolve(Utc::now());
                let downtime_secs = incident
                    .resolved_at
                    .map(|at| (at - incident.opened_at).num_seconds())
                    .unwrap_or(0);
                info!(
                    endpoint = %result.endpoint_id,
                    incident = %incident.id,
                    downtime_secs,
                    "resolving incident"
                );
                self.persist_resolution(&incident, was_pending).await;
                self.counters.open_incidents.fetch_sub(1, Ordering::Relaxed);
                self.hub
                    .broadcast(EventPayload::incident(EventType::IncidentResolved, &incident));
            }
        }
    }

    /// If the endpoint's open incident never reached the store, retry the
    /// insert once per observation until it lands.
    async fn reconcile(&mut self, endpoint_id: &str) {
        let Some(state) = self.states.get_mut(endpoint_id) else { return };
        if !state.persist_pending {
            return;
        }
        let Some(incident) = state.open_incident.clone() else {
            state.persist_pending = false;
            return;
        };
        if self.store.insert_incident(&incident).await.is_ok() {
            info!(incident = %incident.id, "reconciled unpersisted incident");
            if let Some(state) = self.states.get_mut(endpoint_id) {
                state.persist_pending = false;
            }
            self.hub
                .broadcast(EventPayload::incident(EventType::IncidentUpdated, &incident));
        }
    }

    /// Persist a newly opened incident, retrying once. Returns whether the
    /// write landed; on `false` the incident lives in memory until
    /// reconciled.
    async fn persist_open(&self, incident: &Incident) -> bool {
        for attempt in 0..2u8 {
            match self.store.insert_incident(incident).await {
                Ok(()) => return true,
                Err(err) => {
                    warn!(incident = %incident.id, attempt, error = %err, "failed to persist incident");
                }
            }
        }
        let _ = self.event_tx.send(EngineEvent::Warning {
            message: format!(
                "incident {} for endpoint {} held in memory; store writes are failing",
                incident.id, incident.endpoint_id
            ),
        });
        false
    }

    async fn persist_resolution(&self, incident: &Incident, was_pending: bool) {
        for attempt in 0..2u8 {
            let res = if was_pending {
                // First write for this incident; it reaches the store
                // already resolved.
                self.store.insert_incident(incident).await
            } else {
                self.store.update_incident(incident).await
            };
            match res {
                Ok(()) => return,
                Err(err) => {
                    warn!(incident = %incident.id, attempt, error = %err, "failed to persist resolution");
                }
            }
        }
        let _ = self.event_tx.send(EngineEvent::Warning {
            message: format!("resolution of incident {} was not persisted", incident.id),
        });
    }
}
