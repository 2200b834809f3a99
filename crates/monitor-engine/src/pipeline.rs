use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::sync::atomic::Ordering;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use watchtower_core::event::EventPayload;
use watchtower_core::result::ProbeResult;
use watchtower_core::store::MonitorStore;

use crate::api::{EngineEvent, ResultCallback};
use crate::detector::DetectorMsg;
use crate::engine::EngineCounters;
use crate::scheduler::SchedulerCommand;
use crate::worker::WorkerOutput;

/// Results retained per endpoint for status queries.
pub(crate) const RECENT_CAPACITY: usize = 100;

/// Per-endpoint ring of recent results; writers are the pipeline, readers
/// are status handlers.
pub(crate) type RecentResults = Arc<Mutex<HashMap<String, VecDeque<ProbeResult>>>>;

pub(crate) enum PipelineCommand {
    EndpointAdded(String),
    EndpointRemoved(String),
}

pub(crate) struct PipelineDeps {
    pub(crate) store: Arc<dyn MonitorStore>,
    pub(crate) scheduler_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) detector_tx: mpsc::Sender<DetectorMsg>,
    pub(crate) callback: Option<ResultCallback>,
    pub(crate) recent: RecentResults,
    pub(crate) counters: Arc<EngineCounters>,
    pub(crate) event_tx: broadcast::Sender<EngineEvent>,
}

/// Spawn the single-writer result stage. It exits once the worker pool
/// has dropped every result sender and the buffer is drained.
pub(crate) fn spawn(
    result_rx: mpsc::Receiver<WorkerOutput>,
    ctrl_rx: mpsc::UnboundedReceiver<PipelineCommand>,
    deps: PipelineDeps,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(result_rx, ctrl_rx, deps))
}

async fn run(
    mut result_rx: mpsc::Receiver<WorkerOutput>,
    mut ctrl_rx: mpsc::UnboundedReceiver<PipelineCommand>,
    deps: PipelineDeps,
) {
    let mut known: HashSet<String> = HashSet::new();
    let mut ctrl_open = true;

    loop {
        tokio::select! {
            output = result_rx.recv() => {
                match output {
                    None => break,
                    Some(output) => handle_result(output, &known, &deps).await,
                }
            }
            cmd = ctrl_rx.recv(), if ctrl_open => {
                match cmd {
                    None => ctrl_open = false,
                    Some(PipelineCommand::EndpointAdded(id)) => {
                        known.insert(id);
                    }
                    Some(PipelineCommand::EndpointRemoved(id)) => {
                        known.remove(&id);
                        if let Ok(mut recent) = deps.recent.lock() {
                            recent.remove(&id);
                        }
                        let _ = deps
                            .detector_tx
                            .send(DetectorMsg::Forget { endpoint_id: id })
                            .await;
                    }
                }
            }
        }
    }
    debug!("result pipeline exited");
}

async fn handle_result(output: WorkerOutput, known: &HashSet<String>, deps: &PipelineDeps) {
    let WorkerOutput { endpoint, result } = output;
    deps.counters.results_seen.fetch_add(1, Ordering::Relaxed);

    // Unblock the endpoint's scheduler slot regardless of what happens to
    // the result itself.
    let _ = deps
        .scheduler_tx
        .send(SchedulerCommand::ResultObserved {
            endpoint_id: result.endpoint_id.clone(),
        })
        .await;

    if !known.contains(&result.endpoint_id) {
        // The endpoint was removed while this probe was in flight.
        deps.counters.results_discarded.fetch_add(1, Ordering::Relaxed);
        debug!(endpoint = %result.endpoint_id, "discarding result for unknown endpoint");
        return;
    }

    if let Ok(mut recent) = deps.recent.lock() {
        let ring = recent.entry(result.endpoint_id.clone()).or_default();
        ring.push_back(result.clone());
        while ring.len() > RECENT_CAPACITY {
            ring.pop_front();
        }
    }

    // Persistence is best-effort; monitoring must not stall on a storage
    // outage.
    match deps.store.insert_result(&result).await {
        Ok(()) => {
            deps.counters.results_persisted.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            deps.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
            warn!(endpoint = %result.endpoint_id, error = %err, "failed to persist probe result");
            let _ = deps.event_tx.send(EngineEvent::Warning {
                message: format!("probe result for {} not persisted: {err}", result.endpoint_id),
            });
        }
    }

    let _ = deps
        .detector_tx
        .send(DetectorMsg::Observation {
            endpoint_name: endpoint.name.clone(),
            result: result.clone(),
        })
        .await;

    if let Some(callback) = &deps.callback {
        callback(EventPayload::probe_result(&result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use uuid::Uuid;
    use watchtower_core::endpoint::{Endpoint, HttpMethod};
    use watchtower_core::event::EventType;
    use watchtower_core::result::ErrorKind;
    use watchtower_core::store::MemoryStore;

    fn output(endpoint_id: &str, response_time_ms: u64) -> WorkerOutput {
        WorkerOutput {
            endpoint: Endpoint {
                id: endpoint_id.to_string(),
                name: format!("{endpoint_id} name"),
                url: "http://example.com/".parse().expect("test url"),
                method: HttpMethod::Get,
                headers: BTreeMap::new(),
                body: None,
                expected_status: 200,
                timeout_secs: 5,
                interval_secs: 60,
                enabled: true,
            },
            result: ProbeResult {
                endpoint_id: endpoint_id.to_string(),
                correlation_id: Uuid::new_v4(),
                checked_at: Utc::now(),
                status: Some(200),
                response_time_ms,
                success: true,
                error_kind: ErrorKind::None,
                error_message: None,
                body_sample: None,
            },
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        result_tx: mpsc::Sender<WorkerOutput>,
        ctrl_tx: mpsc::UnboundedSender<PipelineCommand>,
        scheduler_rx: mpsc::Receiver<SchedulerCommand>,
        detector_rx: mpsc::Receiver<DetectorMsg>,
        callback_seen: Arc<Mutex<Vec<EventPayload>>>,
        recent: RecentResults,
        counters: Arc<EngineCounters>,
        _join: tokio::task::JoinHandle<()>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let (result_tx, result_rx) = mpsc::channel(64);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (scheduler_tx, scheduler_rx) = mpsc::channel(64);
        let (detector_tx, detector_rx) = mpsc::channel(64);
        let (event_tx, _) = broadcast::channel(64);
        let recent: RecentResults = Arc::default();
        let counters = Arc::new(EngineCounters::default());

        let callback_seen: Arc<Mutex<Vec<EventPayload>>> = Arc::default();
        let seen = callback_seen.clone();
        let callback: ResultCallback = Arc::new(move |payload| {
            if let Ok(mut guard) = seen.lock() {
                guard.push(payload);
            }
        });

        let join = spawn(
            result_rx,
            ctrl_rx,
            PipelineDeps {
                store: store.clone(),
                scheduler_tx,
                detector_tx,
                callback: Some(callback),
                recent: recent.clone(),
                counters: counters.clone(),
                event_tx,
            },
        );

        Harness {
            store,
            result_tx,
            ctrl_tx,
            scheduler_rx,
            detector_rx,
            callback_seen,
            recent,
            counters,
            _join: join,
        }
    }

    #[tokio::test]
    async fn known_results_are_persisted_forwarded_and_broadcast() {
        let mut h = harness();
        h.ctrl_tx
            .send(PipelineCommand::EndpointAdded("ep-1".to_string()))
            .expect("ctrl");

        h.result_tx.send(output("ep-1", 7)).await.expect("result");

        // The scheduler hears about the observation first.
        let observed = h.scheduler_rx.recv().await.expect("scheduler msg");
        assert!(matches!(
            observed,
            SchedulerCommand::ResultObserved { ref endpoint_id } if endpoint_id == "ep-1"
        ));

        let forwarded = h.detector_rx.recv().await.expect("detector msg");
        match forwarded {
            DetectorMsg::Observation { endpoint_name, result } => {
                assert_eq!(endpoint_name, "ep-1 name");
                assert!(result.success);
            }
            _ => panic!("unexpected detector message"),
        }

        assert_eq!(h.store.results_for("ep-1").await.len(), 1);
        let payloads = h.callback_seen.lock().expect("callback log").clone();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].event_type, EventType::ProbeResult);
        assert_eq!(h.counters.results_persisted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn results_for_removed_endpoints_are_discarded() {
        let mut h = harness();
        // "ep-1" was never added (or already removed).
        h.result_tx.send(output("ep-1", 7)).await.expect("result");

        // The scheduler is still unblocked.
        assert!(h.scheduler_rx.recv().await.is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.store.results().await.is_empty());
        assert!(h.callback_seen.lock().expect("callback log").is_empty());
        assert!(h.detector_rx.try_recv().is_err());
        assert_eq!(h.counters.results_discarded.load(Ordering::Relaxed), 1);
        let recent = h.recent.lock().expect("recent");
        assert!(recent.is_empty());
    }

    #[tokio::test]
    async fn the_ring_buffer_keeps_the_last_hundred_results() {
        let mut h = harness();
        h.ctrl_tx
            .send(PipelineCommand::EndpointAdded("ep-1".to_string()))
            .expect("ctrl");

        for n in 0..(RECENT_CAPACITY as u64 + 20) {
            h.result_tx.send(output("ep-1", n)).await.expect("result");
        }
        // Drain the scheduler notifications to let the loop make progress.
        for _ in 0..(RECENT_CAPACITY + 20) {
            let _ = h.scheduler_rx.recv().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let recent = h.recent.lock().expect("recent");
        let ring = recent.get("ep-1").expect("ring");
        assert_eq!(ring.len(), RECENT_CAPACITY);
        // Oldest entries were evicted; the newest is last.
        assert_eq!(ring.front().expect("front").response_time_ms, 20);
        assert_eq!(
            ring.back().expect("back").response_time_ms,
            RECENT_CAPACITY as u64 + 19
        );
    }

    #[tokio::test]
    async fn a_failing_store_degrades_but_does_not_stall() {
        let mut h = harness();
        h.store.fail_results(true);
        h.ctrl_tx
            .send(PipelineCommand::EndpointAdded("ep-1".to_string()))
            .expect("ctrl");

        h.result_tx.send(output("ep-1", 7)).await.expect("result");

        // Detector and callback still see the in-memory result.
        assert!(h.scheduler_rx.recv().await.is_some());
        assert!(matches!(
            h.detector_rx.recv().await,
            Some(DetectorMsg::Observation { .. })
        ));
        assert_eq!(h.callback_seen.lock().expect("callback log").len(), 1);
        assert_eq!(h.counters.persist_failures.load(Ordering::Relaxed), 1);
        assert_eq!(h.counters.results_persisted.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn removal_clears_the_ring_and_notifies_the_detector() {
        let mut h = harness();
        h.ctrl_tx
            .send(PipelineCommand::EndpointAdded("ep-1".to_string()))
            .expect("ctrl");
        h.result_tx.send(output("ep-1", 7)).await.expect("result");
        let _ = h.scheduler_rx.recv().await;
        let _ = h.detector_rx.recv().await;

        h.ctrl_tx
            .send(PipelineCommand::EndpointRemoved("ep-1".to_string()))
            .expect("ctrl");

        match h.detector_rx.recv().await.expect("detector msg") {
            DetectorMsg::Forget { endpoint_id } => assert_eq!(endpoint_id, "ep-1"),
            _ => panic!("expected forget"),
        }
        let recent = h.recent.lock().expect("recent");
        assert!(!recent.contains_key("ep-1"));
    }
}
