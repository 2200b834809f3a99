use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use watchtower_core::endpoint::{Endpoint, EndpointPatch};
use watchtower_core::event::{EventPayload, EventType};
use watchtower_core::result::ProbeResult;
use watchtower_core::store::MonitorStore;

use crate::api::{EngineConfig, EngineError, EngineEvent, ResultCallback, StatusSnapshot};
use crate::detector::{self, DetectorMsg};
use crate::hub::{self, Broadcaster, HubHandle, Subscription};
use crate::pipeline::{self, PipelineCommand, PipelineDeps, RecentResults};
use crate::probe::ProbeClient;
use crate::scheduler::{self, SchedulerCommand, UpdateOutcome};
use crate::worker::{WorkerOutput, WorkerPool};

/// Lock-free counters behind [`StatusSnapshot`]; written by the core
/// tasks, read by anyone.
#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    pub(crate) registered_endpoints: AtomicU64,
    pub(crate) results_seen: AtomicU64,
    pub(crate) results_persisted: AtomicU64,
    pub(crate) persist_failures: AtomicU64,
    pub(crate) results_discarded: AtomicU64,
    pub(crate) jobs_skipped: AtomicU64,
    pub(crate) open_incidents: AtomicU64,
}

impl EngineCounters {
    fn reset(&self) {
        self.registered_endpoints.store(0, Ordering::Relaxed);
        self.results_seen.store(0, Ordering::Relaxed);
        self.results_persisted.store(0, Ordering::Relaxed);
        self.persist_failures.store(0, Ordering::Relaxed);
        self.results_discarded.store(0, Ordering::Relaxed);
        self.jobs_skipped.store(0, Ordering::Relaxed);
        self.open_incidents.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self, running: bool) -> StatusSnapshot {
        StatusSnapshot {
            running,
            registered_endpoints: self.registered_endpoints.load(Ordering::Relaxed),
            results_seen: self.results_seen.load(Ordering::Relaxed),
            results_persisted: self.results_persisted.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            results_discarded: self.results_discarded.load(Ordering::Relaxed),
            jobs_skipped: self.jobs_skipped.load(Ordering::Relaxed),
            open_incidents: self.open_incidents.load(Ordering::Relaxed),
        }
    }
}

struct RunningCore {
    scheduler_tx: mpsc::Sender<SchedulerCommand>,
    pipeline_ctrl_tx: mpsc::UnboundedSender<PipelineCommand>,
    detector_tx: mpsc::Sender<DetectorMsg>,
    hub: HubHandle,
    pool: WorkerPool,
    scheduler_join: JoinHandle<()>,
    pipeline_join: JoinHandle<()>,
    detector_join: JoinHandle<()>,
    hub_join: JoinHandle<()>,
}

struct EngineState {
    callback: Option<ResultCallback>,
    core: Option<RunningCore>,
}

/// The monitoring engine facade.
///
/// Owns the scheduler registry, the worker pool, the result pipeline, the
/// incident detector, and the event hub; wires them together on `start`
/// and tears them down in dependency order on `stop`. Every method is safe
/// to call from any task; effects are serialized internally.
pub struct Engine {
    store: Arc<dyn MonitorStore>,
    cfg: EngineConfig,
    event_tx: broadcast::Sender<EngineEvent>,
    counters: Arc<EngineCounters>,
    recent: RecentResults,
    broadcaster: Broadcaster,
    running: AtomicBool,
    state: Mutex<EngineState>,
}

impl Engine {
    /// Create a stopped engine over `store`. Zero-valued config knobs are
    /// clamped back to their defaults.
    pub fn new(cfg: EngineConfig, store: Arc<dyn MonitorStore>) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Engine {
            store,
            cfg: cfg.normalized(),
            event_tx,
            counters: Arc::new(EngineCounters::default()),
            recent: RecentResults::default(),
            broadcaster: Broadcaster::default(),
            running: AtomicBool::new(false),
            state: Mutex::new(EngineState {
                callback: None,
                core: None,
            }),
        }
    }

    /// Whether the engine is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to the engine's lifecycle/diagnostics stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Current health counters.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.counters.snapshot(self.is_running())
    }

    /// Event entry point for the result callback; valid before `start`
    /// and across restarts.
    pub fn broadcaster(&self) -> Broadcaster {
        self.broadcaster.clone()
    }

    /// Install the result callback. Set-once, and only before `start`.
    pub async fn set_result_callback(&self, callback: ResultCallback) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.core.is_some() || state.callback.is_some() {
            return Err(EngineError::CallbackUnavailable);
        }
        state.callback = Some(callback);
        Ok(())
    }

    /// Load the enabled endpoint set from the store and bring up the core
    /// tasks. Calling `start` on a running engine is a no-op.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.core.is_some() {
            return Ok(());
        }

        let probe = Arc::new(
            ProbeClient::build(&self.cfg).map_err(|err| EngineError::Startup(err.to_string()))?,
        );

        self.counters.reset();
        if let Ok(mut recent) = self.recent.lock() {
            recent.clear();
        }

        let (hub, hub_join) = hub::spawn(self.cfg.event_buffer, self.cfg.ping_interval);
        self.broadcaster.attach(&hub);

        let (detector_tx, detector_join) = detector::spawn(
            self.store.clone(),
            hub.clone(),
            self.event_tx.clone(),
            self.counters.clone(),
            self.cfg.fail_threshold,
            self.cfg.recovery_threshold,
        );

        let (result_tx, result_rx) = mpsc::channel::<WorkerOutput>(self.cfg.result_queue_size);
        let pool = WorkerPool::spawn(
            self.cfg.worker_count,
            self.cfg.job_queue_size,
            probe,
            result_tx,
        );

        let (scheduler_tx, scheduler_join) = scheduler::spawn(
            pool.submitter(),
            self.event_tx.clone(),
            self.counters.clone(),
            self.cfg.min_interval,
        );

        let (pipeline_ctrl_tx, pipeline_ctrl_rx) = mpsc::unbounded_channel();
        let pipeline_join = pipeline::spawn(
            result_rx,
            pipeline_ctrl_rx,
            PipelineDeps {
                store: self.store.clone(),
                scheduler_tx: scheduler_tx.clone(),
                detector_tx: detector_tx.clone(),
                callback: state.callback.clone(),
                recent: self.recent.clone(),
                counters: self.counters.clone(),
                event_tx: self.event_tx.clone(),
            },
        );

        let endpoints = match self.store.list_enabled_endpoints().await {
            Ok(endpoints) => endpoints,
            Err(err) => {
                warn!(error = %err, "could not load endpoints from store; starting empty");
                let _ = self.event_tx.send(EngineEvent::Warning {
                    message: format!("could not load endpoints from store: {err}"),
                });
                Vec::new()
            }
        };

        let mut registered = 0usize;
        for mut endpoint in endpoints {
            endpoint.normalize();
            if let Err(err) = endpoint.validate(self.cfg.min_interval) {
                warn!(endpoint = %endpoint.id, error = %err, "skipping invalid endpoint from store");
                continue;
            }

            // Resume tracking incidents left open by a previous run so the
            // detector does not open duplicates.
            match self.store.open_incidents(&endpoint.id).await {
                Ok(incidents) => {
                    for incident in incidents.into_iter().filter(|i| i.auto) {
                        let _ = detector_tx.send(DetectorMsg::Adopt { incident }).await;
                    }
                }
                Err(err) => {
                    warn!(endpoint = %endpoint.id, error = %err, "could not list open incidents");
                }
            }

            let _ = pipeline_ctrl_tx.send(PipelineCommand::EndpointAdded(endpoint.id.clone()));
            let (reply, reply_rx) = oneshot::channel();
            if scheduler_tx
                .send(SchedulerCommand::Register {
                    endpoint,
                    reply,
                })
                .await
                .is_ok()
                && matches!(reply_rx.await, Ok(Ok(())))
            {
                registered += 1;
            }
        }

        state.core = Some(RunningCore {
            scheduler_tx,
            pipeline_ctrl_tx,
            detector_tx,
            hub,
            pool,
            scheduler_join,
            pipeline_join,
            detector_join,
            hub_join,
        });
        self.running.store(true, Ordering::SeqCst);
        info!(endpoints = registered, "engine started");
        let _ = self.event_tx.send(EngineEvent::Started);
        Ok(())
    }

    /// Tear the core down in dependency order (scheduler, pool, pipeline,
    /// detector, hub) under the configured shutdown deadline. Calling
    /// `stop` on a stopped engine is a no-op; `start` may be called again
    /// afterwards.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let Some(core) = state.core.take() else {
            return Ok(());
        };
        let RunningCore {
            scheduler_tx,
            pipeline_ctrl_tx,
            detector_tx,
            hub,
            pool,
            scheduler_join,
            pipeline_join,
            detector_join,
            hub_join,
        } = core;

        let _ = self.event_tx.send(EngineEvent::StopRequested);
        let deadline = Instant::now() + self.cfg.shutdown_deadline;

        // No new jobs.
        let _ = scheduler_tx.send(SchedulerCommand::Shutdown).await;
        join_within(scheduler_join, deadline).await;
        drop(scheduler_tx);

        // Drain in-flight probes; past the deadline they are canceled.
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !pool.close(remaining).await {
            warn!("worker pool drain exceeded the shutdown deadline");
        }

        // The pool dropped every result sender; the pipeline drains and
        // exits, which in turn releases the detector.
        drop(pipeline_ctrl_tx);
        join_within(pipeline_join, deadline).await;
        drop(detector_tx);
        join_within(detector_join, deadline).await;

        // Last out: close every subscriber channel.
        hub.shutdown();
        self.broadcaster.detach();
        join_within(hub_join, deadline).await;

        self.running.store(false, Ordering::SeqCst);
        info!("engine stopped");
        let _ = self.event_tx.send(EngineEvent::Stopped);
        Ok(())
    }

    /// Validate and register a new endpoint; takes effect atomically from
    /// the scheduler's perspective.
    pub async fn add_endpoint(&self, mut endpoint: Endpoint) -> Result<(), EngineError> {
        endpoint.normalize();
        endpoint.validate(self.cfg.min_interval)?;

        let state = self.state.lock().await;
        let Some(core) = state.core.as_ref() else {
            return Err(EngineError::NotRunning);
        };

        let (reply, reply_rx) = oneshot::channel();
        core.scheduler_tx
            .send(SchedulerCommand::Register {
                endpoint: endpoint.clone(),
                reply,
            })
            .await
            .map_err(|_| EngineError::NotRunning)?;
        reply_rx.await.map_err(|_| EngineError::NotRunning)??;

        let _ = core
            .pipeline_ctrl_tx
            .send(PipelineCommand::EndpointAdded(endpoint.id.clone()));
        core.hub
            .broadcast(EventPayload::endpoint(EventType::EndpointCreated, &endpoint));
        Ok(())
    }

    /// Apply a partial update to a registered endpoint. An unchanged
    /// definition causes no scheduler churn and no event. Ids unknown to
    /// the scheduler fall back to the store, so endpoints created while
    /// the engine was stopped can be enabled live.
    pub async fn update_endpoint(&self, id: &str, patch: EndpointPatch) -> Result<(), EngineError> {
        let state = self.state.lock().await;
        let Some(core) = state.core.as_ref() else {
            return Err(EngineError::NotRunning);
        };

        let (reply, reply_rx) = oneshot::channel();
        core.scheduler_tx
            .send(SchedulerCommand::Update {
                id: id.to_string(),
                patch: patch.clone(),
                reply,
            })
            .await
            .map_err(|_| EngineError::NotRunning)?;

        match reply_rx.await.map_err(|_| EngineError::NotRunning)? {
            Ok(UpdateOutcome::Changed(updated)) => {
                core.hub
                    .broadcast(EventPayload::endpoint(EventType::EndpointUpdated, &updated));
                Ok(())
            }
            Ok(UpdateOutcome::Unchanged) => Ok(()),
            Err(EngineError::UnknownEndpoint(_)) => {
                let Some(stored) = self.store.get_endpoint(id).await? else {
                    return Err(EngineError::UnknownEndpoint(id.to_string()));
                };
                let updated = patch.apply(&stored);
                updated.validate(self.cfg.min_interval)?;

                let (reply, reply_rx) = oneshot::channel();
                core.scheduler_tx
                    .send(SchedulerCommand::Register {
                        endpoint: updated.clone(),
                        reply,
                    })
                    .await
                    .map_err(|_| EngineError::NotRunning)?;
                reply_rx.await.map_err(|_| EngineError::NotRunning)??;

                let _ = core
                    .pipeline_ctrl_tx
                    .send(PipelineCommand::EndpointAdded(updated.id.clone()));
                core.hub
                    .broadcast(EventPayload::endpoint(EventType::EndpointUpdated, &updated));
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Cancel the endpoint's timer and drop its pipeline state. A probe
    /// already in flight completes; its result is discarded.
    pub async fn remove_endpoint(&self, id: &str) -> Result<(), EngineError> {
        let state = self.state.lock().await;
        let Some(core) = state.core.as_ref() else {
            return Err(EngineError::NotRunning);
        };

        let (reply, reply_rx) = oneshot::channel();
        core.scheduler_tx
            .send(SchedulerCommand::Unregister {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| EngineError::NotRunning)?;
        reply_rx.await.map_err(|_| EngineError::NotRunning)??;

        let _ = core
            .pipeline_ctrl_tx
            .send(PipelineCommand::EndpointRemoved(id.to_string()));
        core.hub.broadcast(EventPayload::endpoint_deleted(id));
        Ok(())
    }

    /// Up to `n` most recent results for an endpoint, newest first.
    /// Answers from the in-memory ring; never touches the store.
    pub fn get_recent(&self, endpoint_id: &str, n: usize) -> Vec<ProbeResult> {
        let Ok(recent) = self.recent.lock() else {
            return Vec::new();
        };
        recent
            .get(endpoint_id)
            .map(|ring| ring.iter().rev().take(n).cloned().collect())
            .unwrap_or_default()
    }

    /// Register a live event subscriber, optionally filtered by type.
    pub async fn subscribe_stream(
        &self,
        filter: Option<HashSet<EventType>>,
    ) -> Result<Subscription, EngineError> {
        let state = self.state.lock().await;
        let Some(core) = state.core.as_ref() else {
            return Err(EngineError::NotRunning);
        };
        core.hub.subscribe(filter).await.ok_or(EngineError::NotRunning)
    }
}

async fn join_within(mut join: JoinHandle<()>, deadline: Instant) {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if tokio::time::timeout(remaining, &mut join).await.is_err() {
        join.abort();
        let _ = join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use watchtower_core::endpoint::HttpMethod;
    use watchtower_core::store::MemoryStore;

    fn test_config() -> EngineConfig {
        EngineConfig {
            min_interval: Duration::ZERO,
            ping_interval: Duration::from_secs(3600),
            ..EngineConfig::default()
        }
    }

    fn endpoint(id: &str, url: &str, interval_secs: u64) -> Endpoint {
        Endpoint {
            id: id.to_string(),
            name: format!("{id} name"),
            url: url.parse().expect("test url"),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            body: None,
            expected_status: 200,
            timeout_secs: 5,
            interval_secs,
            enabled: true,
        }
    }

    async fn wait_for<F>(mut probe: F, timeout: Duration) -> bool
    where
        F: AsyncFnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if probe().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn lifecycle_calls_are_idempotent_and_restartable() {
        let engine = Engine::new(test_config(), Arc::new(MemoryStore::new()));
        assert!(!engine.is_running());

        engine.stop().await.expect("stop while stopped is a no-op");
        engine.start().await.expect("start");
        assert!(engine.is_running());
        engine.start().await.expect("start while running is a no-op");

        engine.stop().await.expect("stop");
        assert!(!engine.is_running());
        engine.stop().await.expect("second stop is a no-op");

        engine.start().await.expect("start after stop");
        assert!(engine.is_running());
        engine.stop().await.expect("final stop");
    }

    #[tokio::test]
    async fn mutations_require_a_running_engine() {
        let engine = Engine::new(test_config(), Arc::new(MemoryStore::new()));
        let err = engine
            .add_endpoint(endpoint("ep-1", "http://example.com/", 1))
            .await
            .expect_err("stopped engine");
        assert!(matches!(err, EngineError::NotRunning));
        assert!(matches!(
            engine.remove_endpoint("ep-1").await,
            Err(EngineError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn invalid_endpoints_are_rejected_at_the_boundary() {
        let engine = Engine::new(test_config(), Arc::new(MemoryStore::new()));
        engine.start().await.expect("start");

        let mut bad = endpoint("ep-1", "http://example.com/", 1);
        bad.expected_status = 42;
        assert!(matches!(
            engine.add_endpoint(bad).await,
            Err(EngineError::Config(_))
        ));

        engine.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn probes_flow_from_store_loaded_and_added_endpoints() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200).body("ok");
            })
            .await;

        let store = Arc::new(MemoryStore::new());
        store
            .put_endpoint(endpoint("ep-seeded", &server.url("/health"), 1))
            .await;

        let engine = Engine::new(test_config(), store.clone());

        let seen: Arc<StdMutex<Vec<EventPayload>>> = Arc::default();
        let sink = seen.clone();
        let broadcaster = engine.broadcaster();
        engine
            .set_result_callback(Arc::new(move |payload| {
                if let Ok(mut guard) = sink.lock() {
                    guard.push(payload.clone());
                }
                broadcaster.send(payload);
            }))
            .await
            .expect("set callback");

        engine.start().await.expect("start");
        engine
            .add_endpoint(endpoint("ep-live", &server.url("/health"), 1))
            .await
            .expect("add endpoint");

        let store_probe = store.clone();
        assert!(
            wait_for(
                async || {
                    !store_probe.results_for("ep-seeded").await.is_empty()
                        && !store_probe.results_for("ep-live").await.is_empty()
                },
                Duration::from_secs(15),
            )
            .await,
            "both endpoints should produce persisted results"
        );

        let recent = engine.get_recent("ep-seeded", 5);
        assert!(!recent.is_empty());
        assert!(recent[0].success);
        assert!(!seen.lock().expect("seen").is_empty());

        let snapshot = engine.snapshot();
        assert!(snapshot.running);
        assert_eq!(snapshot.registered_endpoints, 2);
        assert!(snapshot.results_persisted >= 2);

        engine.stop().await.expect("stop");
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn results_for_endpoints_removed_mid_probe_are_discarded() {
        let server = MockServer::start_async().await;
        let slow = server
            .mock_async(|when, then| {
                when.method(GET).path("/slow");
                then.status(200).delay(Duration::from_millis(1500));
            })
            .await;

        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(test_config(), store.clone());
        engine.start().await.expect("start");

        let mut stream = engine.subscribe_stream(None).await.expect("stream");
        let observed: Arc<StdMutex<Vec<EventType>>> = Arc::default();
        let observed_sink = observed.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if let Ok(mut guard) = observed_sink.lock() {
                    guard.push(event.event_type);
                }
            }
        });

        engine
            .add_endpoint(endpoint("ep-gone", &server.url("/slow"), 1))
            .await
            .expect("add endpoint");

        // Wait until the probe is actually in flight, then remove the
        // endpoint underneath it.
        let in_flight = wait_for(
            async || slow.hits_async().await >= 1,
            Duration::from_secs(10),
        )
        .await;
        assert!(in_flight, "probe never started");
        engine.remove_endpoint("ep-gone").await.expect("remove");

        // Let the in-flight probe complete and its result be processed.
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(store.results_for("ep-gone").await.is_empty());
        assert_eq!(engine.snapshot().results_discarded, 1);
        assert!(engine.get_recent("ep-gone", 10).is_empty());
        let types = observed.lock().expect("observed").clone();
        assert!(types.contains(&EventType::EndpointCreated));
        assert!(types.contains(&EventType::EndpointDeleted));
        assert!(
            !types.contains(&EventType::ProbeResult),
            "no probe-result event may be emitted for a discarded result"
        );

        engine.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn the_result_callback_is_set_once_and_only_before_start() {
        let engine = Engine::new(test_config(), Arc::new(MemoryStore::new()));
        engine
            .set_result_callback(Arc::new(|_| {}))
            .await
            .expect("first set");
        assert!(matches!(
            engine.set_result_callback(Arc::new(|_| {})).await,
            Err(EngineError::CallbackUnavailable)
        ));

        let engine = Engine::new(test_config(), Arc::new(MemoryStore::new()));
        engine.start().await.expect("start");
        assert!(matches!(
            engine.set_result_callback(Arc::new(|_| {})).await,
            Err(EngineError::CallbackUnavailable)
        ));
        engine.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn updating_an_endpoint_known_only_to_the_store_registers_it() {
        let store = Arc::new(MemoryStore::new());
        let mut offline = endpoint("ep-offline", "http://example.com/", 60);
        offline.enabled = false;
        store.put_endpoint(offline).await;

        let engine = Engine::new(test_config(), store);
        engine.start().await.expect("start");
        // Disabled endpoints are not loaded at start; the update falls
        // back to the store and registers the patched definition.
        engine
            .update_endpoint(
                "ep-offline",
                EndpointPatch {
                    enabled: Some(true),
                    ..EndpointPatch::default()
                },
            )
            .await
            .expect("update via store fallback");
        assert_eq!(engine.snapshot().registered_endpoints, 1);

        assert!(matches!(
            engine
                .update_endpoint("ep-missing", EndpointPatch::default())
                .await,
            Err(EngineError::UnknownEndpoint(_))
        ));

        engine.stop().await.expect("stop");
    }
}
