use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tracing::debug;

use watchtower_core::endpoint::Endpoint;
use watchtower_core::result::{ErrorKind, ProbeResult};

use crate::api::ProbeJob;
use crate::probe::{ProbeClient, ProbeOutcome};
use crate::validate;

/// A finished probe, paired with the endpoint snapshot the job carried so
/// downstream stages never need a registry lookup.
#[derive(Debug)]
pub(crate) struct WorkerOutput {
    pub(crate) endpoint: Endpoint,
    pub(crate) result: ProbeResult,
}

/// Fixed-size probe worker pool over a bounded job queue.
///
/// Workers never share mutable state; they pull jobs off the shared
/// channel, run probe + validator, and push onto the result channel.
pub(crate) struct WorkerPool {
    job_tx: mpsc::Sender<ProbeJob>,
    cancel_tx: watch::Sender<bool>,
    join: JoinSet<()>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        worker_count: usize,
        job_queue_size: usize,
        probe: Arc<ProbeClient>,
        result_tx: mpsc::Sender<WorkerOutput>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<ProbeJob>(job_queue_size.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut join = JoinSet::new();
        for _ in 0..worker_count.max(1) {
            let job_rx = job_rx.clone();
            let cancel_rx = cancel_rx.clone();
            let probe = probe.clone();
            let result_tx = result_tx.clone();
            join.spawn(run_worker(job_rx, cancel_rx, probe, result_tx));
        }

        WorkerPool {
            job_tx,
            cancel_tx,
            join,
        }
    }

    /// Sender the scheduler uses for non-blocking submission; a full queue
    /// is the backpressure signal.
    pub(crate) fn submitter(&self) -> mpsc::Sender<ProbeJob> {
        self.job_tx.clone()
    }

    /// Number of running workers; constant between start and stop.
    pub(crate) fn worker_count(&self) -> usize {
        self.join.len()
    }

    /// Close the queue, drain in-flight work, and join every worker.
    ///
    /// Returns `false` if the drain exceeded `deadline` and in-flight
    /// probes had to be canceled.
    pub(crate) async fn close(mut self, deadline: Duration) -> bool {
        drop(self.job_tx);
        let drained = tokio::time::timeout(deadline, async {
            while self.join.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            let _ = self.cancel_tx.send(true);
            while self.join.join_next().await.is_some() {}
        }
        drained
    }
}

async fn run_worker(
    job_rx: Arc<Mutex<mpsc::Receiver<ProbeJob>>>,
    mut cancel: watch::Receiver<bool>,
    probe: Arc<ProbeClient>,
    result_tx: mpsc::Sender<WorkerOutput>,
) {
    loop {
        if *cancel.borrow() {
            break;
        }

        // Only one worker waits on the queue at a time; the lock is
        // released before the probe executes.
        let job = {
            let mut rx = job_rx.lock().await;
            tokio::select! {
                job = rx.recv() => job,
                _ = cancel.changed() => None,
            }
        };
        let Some(job) = job else { break };

        let started = Instant::now();
        let result = tokio::select! {
            outcome = probe.run(&job.endpoint) => finish(&job, outcome),
            _ = cancel.changed() => canceled(&job, started),
        };

        debug!(
            endpoint = %job.endpoint.id,
            success = result.success,
            kind = %result.error_kind,
            elapsed_ms = result.response_time_ms,
            "probe finished"
        );

        let output = WorkerOutput {
            endpoint: job.endpoint,
            result,
        };
        if result_tx.send(output).await.is_err() {
            break;
        }
    }
}

fn finish(job: &ProbeJob, outcome: ProbeOutcome) -> ProbeResult {
    let success = validate::is_success(
        outcome.error_kind,
        outcome.status,
        job.endpoint.expected_status,
    );
    ProbeResult {
        endpoint_id: job.endpoint.id.clone(),
        correlation_id: job.correlation_id,
        checked_at: outcome.checked_at,
        status: outcome.status,
        response_time_ms: outcome.response_time_ms,
        success,
        error_kind: outcome.error_kind,
        error_message: outcome.error_message,
        body_sample: outcome.body_sample,
    }
}

fn canceled(job: &ProbeJob, started: Instant) -> ProbeResult {
    ProbeResult {
        endpoint_id: job.endpoint.id.clone(),
        correlation_id: job.correlation_id,
        checked_at: Utc::now(),
        status: None,
        response_time_ms: started.elapsed().as_millis() as u64,
        success: false,
        error_kind: ErrorKind::Canceled,
        error_message: Some("probe canceled by engine shutdown".to_string()),
        body_sample: None,
    }
}
