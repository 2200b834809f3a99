use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::incident::Incident;
use crate::result::ProbeResult;

/// Recoverable failure of a store operation.
///
/// The engine treats every store failure as a warning condition and keeps
/// running; nothing here stops monitoring.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backend rejected or could not complete the call.
    #[error("store backend error: {0}")]
    Backend(String),
    /// The backend cannot be reached at all.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence operations the engine consumes.
///
/// The storage backend itself lives outside the core; this trait is the
/// seam it plugs into.
#[async_trait]
pub trait MonitorStore: Send + Sync {
    /// Endpoints that should be scheduled at engine start.
    async fn list_enabled_endpoints(&self) -> Result<Vec<Endpoint>, StoreError>;

    /// Look up one endpoint by id.
    async fn get_endpoint(&self, id: &str) -> Result<Option<Endpoint>, StoreError>;

    /// Persist one probe result.
    async fn insert_result(&self, result: &ProbeResult) -> Result<(), StoreError>;

    /// Persist a newly opened incident.
    async fn insert_incident(&self, incident: &Incident) -> Result<(), StoreError>;

    /// Persist an incident mutation (resolution or reconciliation).
    async fn update_incident(&self, incident: &Incident) -> Result<(), StoreError>;

    /// Unresolved incidents for one endpoint.
    async fn open_incidents(&self, endpoint_id: &str) -> Result<Vec<Incident>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    endpoints: BTreeMap<String, Endpoint>,
    results: Vec<ProbeResult>,
    incidents: Vec<Incident>,
}

/// In-memory [`MonitorStore`], used by the CLI daemon and the test suites.
///
/// Failure injection flags make the store misbehave on demand so the
/// pipeline's and detector's degradation paths can be exercised.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    fail_results: AtomicBool,
    fail_incidents: AtomicBool,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `endpoints`.
    pub fn with_endpoints(endpoints: Vec<Endpoint>) -> Self {
        let mut inner = MemoryInner::default();
        for ep in endpoints {
            inner.endpoints.insert(ep.id.clone(), ep);
        }
        MemoryStore {
            inner: RwLock::new(inner),
            fail_results: AtomicBool::new(false),
            fail_incidents: AtomicBool::new(false),
        }
    }

    /// Insert or replace one endpoint.
    pub async fn put_endpoint(&self, endpoint: Endpoint) {
        let mut inner = self.inner.write().await;
        inner.endpoints.insert(endpoint.id.clone(), endpoint);
    }

    /// Make every `insert_result` call fail until reset.
    pub fn fail_results(&self, fail: bool) {
        self.fail_results.store(fail, Ordering::SeqCst);
    }

    /// Make every incident insert/update call fail until reset.
    pub fn fail_incidents(&self, fail: bool) {
        self.fail_incidents.store(fail, Ordering::SeqCst);
    }

    /// All persisted results, insertion order.
    pub async fn results(&self) -> Vec<ProbeResult> {
        self.inner.read().await.results.clone()
    }

    /// Persisted results for one endpoint, insertion order.
    pub async fn results_for(&self, endpoint_id: &str) -> Vec<ProbeResult> {
        self.inner
            .read()
            .await
            .results
            .iter()
            .filter(|r| r.endpoint_id == endpoint_id)
            .cloned()
            .collect()
    }

    /// All persisted incidents, insertion order.
    pub async fn incidents(&self) -> Vec<Incident> {
        self.inner.read().await.incidents.clone()
    }

    /// Look up one incident by id.
    pub async fn incident(&self, id: Uuid) -> Option<Incident> {
        self.inner.read().await.incidents.iter().find(|i| i.id == id).cloned()
    }
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn list_enabled_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.endpoints.values().filter(|ep| ep.enabled).cloned().collect())
    }

    async fn get_endpoint(&self, id: &str) -> Result<Option<Endpoint>, StoreError> {
        Ok(self.inner.read().await.endpoints.get(id).cloned())
    }

    async fn insert_result(&self, result: &ProbeResult) -> Result<(), StoreError> {
        if self.fail_results.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("result writes disabled".to_string()));
        }
        self.inner.write().await.results.push(result.clone());
        Ok(())
    }

    async fn insert_incident(&self, incident: &Incident) -> Result<(), StoreError> {
        if self.fail_incidents.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("incident writes disabled".to_string()));
        }
        let mut inner = self.inner.write().await;
        if inner.incidents.iter().any(|i| i.id == incident.id) {
            return Err(StoreError::Backend(format!("duplicate incident {}", incident.id)));
        }
        inner.incidents.push(incident.clone());
        Ok(())
    }

    async fn update_incident(&self, incident: &Incident) -> Result<(), StoreError> {
        if self.fail_incidents.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("incident writes disabled".to_string()));
        }
        let mut inner = self.inner.write().await;
        match inner.incidents.iter_mut().find(|i| i.id == incident.id) {
            Some(slot) => {
                *slot = incident.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(format!("unknown incident {}", incident.id))),
        }
    }

    async fn open_incidents(&self, endpoint_id: &str) -> Result<Vec<Incident>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .incidents
            .iter()
            .filter(|i| i.endpoint_id == endpoint_id && i.is_open())
            .cloned()
            .collect())
    }
}
