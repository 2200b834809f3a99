use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use watchtower_core::endpoint::{Endpoint, EndpointPatch};

use crate::api::{EngineError, EngineEvent, ProbeJob, SkipReason};
use crate::engine::EngineCounters;

/// Upper bound on the deterministic startup offset.
const MAX_STARTUP_JITTER: Duration = Duration::from_secs(5);

pub(crate) enum SchedulerCommand {
    Register {
        endpoint: Endpoint,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Update {
        id: String,
        patch: EndpointPatch,
        reply: oneshot::Sender<Result<UpdateOutcome, EngineError>>,
    },
    Unregister {
        id: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    /// The pipeline observed a result for this endpoint; a new job may be
    /// emitted at the next tick.
    ResultObserved { endpoint_id: String },
    Shutdown,
}

/// Whether an update actually changed the registered definition.
pub(crate) enum UpdateOutcome {
    Changed(Endpoint),
    Unchanged,
}

#[derive(Debug)]
struct Slot {
    endpoint: Endpoint,
    /// Pending timer; `None` while the endpoint is disabled.
    next_fire: Option<Instant>,
    /// At most one probe per endpoint is in flight at any instant.
    inflight: bool,
}

/// Deterministic pseudo-random startup offset in
/// `[0, min(interval, MAX_STARTUP_JITTER))`, keyed by endpoint id.
pub(crate) fn startup_jitter(endpoint_id: &str, interval: Duration) -> Duration {
    let cap = interval.min(MAX_STARTUP_JITTER);
    let cap_ms = cap.as_millis() as u64;
    if cap_ms == 0 {
        return Duration::ZERO;
    }
    let mut hasher = DefaultHasher::new();
    endpoint_id.hash(&mut hasher);
    let mut rng = StdRng::seed_from_u64(hasher.finish());
    Duration::from_millis(rng.gen_range(0..cap_ms))
}

struct Scheduler {
    slots: BTreeMap<String, Slot>,
    job_tx: mpsc::Sender<ProbeJob>,
    event_tx: broadcast::Sender<EngineEvent>,
    counters: Arc<EngineCounters>,
    min_interval: Duration,
}

/// Spawn the scheduler control loop. The returned sender is the only way
/// to touch the registry; the loop exclusively owns it.
pub(crate) fn spawn(
    job_tx: mpsc::Sender<ProbeJob>,
    event_tx: broadcast::Sender<EngineEvent>,
    counters: Arc<EngineCounters>,
    min_interval: Duration,
) -> (mpsc::Sender<SchedulerCommand>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let scheduler = Scheduler {
        slots: BTreeMap::new(),
        job_tx,
        event_tx,
        counters,
        min_interval,
    };
    let join = tokio::spawn(scheduler.run(rx));
    (tx, join)
}

impl Scheduler {
    async fn run(mut self, mut rx: mpsc::Receiver<SchedulerCommand>) {
        loop {
            let next_deadline = self.next_deadline();

            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        None | Some(SchedulerCommand::Shutdown) => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                _ = async {
                    match next_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.fire_due(Instant::now());
                }
            }
        }
        debug!("scheduler loop exited");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter(|slot| slot.endpoint.enabled)
            .filter_map(|slot| slot.next_fire)
            .min()
    }

    /// Fire every due timer, id-ascending for determinism, and reschedule
    /// each at `now + current interval`.
    fn fire_due(&mut self, now: Instant) {
        let due: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                slot.endpoint.enabled && slot.next_fire.is_some_and(|at| at <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            let Some(slot) = self.slots.get_mut(&id) else { continue };

            if slot.inflight {
                // Skip-if-overdue: the previous probe has not been
                // observed yet, so the pending tick is dropped.
                self.counters.jobs_skipped.fetch_add(1, Ordering::Relaxed);
                debug!(endpoint = %id, "skipping overdue probe");
                let _ = self.event_tx.send(EngineEvent::JobSkipped {
                    endpoint_id: id.clone(),
                    reason: SkipReason::Overdue,
                });
            } else {
                let job = ProbeJob {
                    endpoint: slot.endpoint.clone(),
                    scheduled_at: Utc::now(),
                    correlation_id: Uuid::new_v4(),
                };
                match self.job_tx.try_send(job) {
                    Ok(()) => slot.inflight = true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.counters.jobs_skipped.fetch_add(1, Ordering::Relaxed);
                        warn!(endpoint = %id, "job queue full, dropping probe");
                        let _ = self.event_tx.send(EngineEvent::JobSkipped {
                            endpoint_id: id.clone(),
                            reason: SkipReason::QueueFull,
                        });
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        // Pool is gone; the engine is shutting down.
                    }
                }
            }

            slot.next_fire = Some(now + slot.endpoint.interval());
        }
    }

    fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::Register { endpoint, reply } => {
                let _ = reply.send(self.register(endpoint));
            }
            SchedulerCommand::Update { id, patch, reply } => {
                let _ = reply.send(self.update(&id, &patch));
            }
            SchedulerCommand::Unregister { id, reply } => {
                let _ = reply.send(self.unregister(&id));
            }
            SchedulerCommand::ResultObserved { endpoint_id } => {
                if let Some(slot) = self.slots.get_mut(&endpoint_id) {
                    slot.inflight = false;
                }
            }
            SchedulerCommand::Shutdown => {}
        }
    }

    fn register(&mut self, endpoint: Endpoint) -> Result<(), EngineError> {
        if self.slots.contains_key(&endpoint.id) {
            return Err(EngineError::AlreadyRegistered(endpoint.id));
        }

        let next_fire = endpoint
            .enabled
            .then(|| Instant::now() + startup_jitter(&endpoint.id, endpoint.interval()));
        debug!(endpoint = %endpoint.id, enabled = endpoint.enabled, "endpoint registered");
        self.slots.insert(
            endpoint.id.clone(),
            Slot {
                endpoint,
                next_fire,
                inflight: false,
            },
        );
        self.counters
            .registered_endpoints
            .store(self.slots.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn update(&mut self, id: &str, patch: &EndpointPatch) -> Result<UpdateOutcome, EngineError> {
        let Some(slot) = self.slots.get_mut(id) else {
            return Err(EngineError::UnknownEndpoint(id.to_string()));
        };

        let updated = patch.apply(&slot.endpoint);
        updated.validate(self.min_interval)?;
        if updated == slot.endpoint {
            return Ok(UpdateOutcome::Unchanged);
        }

        let schedule_changed = updated.interval_secs != slot.endpoint.interval_secs
            || updated.enabled != slot.endpoint.enabled;
        if schedule_changed {
            if updated.enabled {
                let candidate = Instant::now() + updated.interval();
                slot.next_fire = Some(match slot.next_fire {
                    Some(pending) => pending.min(candidate),
                    None => candidate,
                });
            } else {
                slot.next_fire = None;
            }
        }
        debug!(endpoint = %id, "endpoint updated");
        slot.endpoint = updated.clone();
        Ok(UpdateOutcome::Changed(updated))
    }

    fn unregister(&mut self, id: &str) -> Result<(), EngineError> {
        if self.slots.remove(id).is_none() {
            return Err(EngineError::UnknownEndpoint(id.to_string()));
        }
        debug!(endpoint = %id, "endpoint unregistered");
        self.counters
            .registered_endpoints
            .store(self.slots.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}
