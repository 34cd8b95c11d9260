//! Supplier registry: transports and session state for every known supplier.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::session::{SessionConfig, SupplierSession, SupplierState};
use crate::domain::events::PipelineEvent;
use crate::domain::ports::{EventPublisher, SupplierTransport};
use crate::domain::types::SupplierId;
use crate::error::{Error, Result};
use crate::metrics::PipelineMetrics;

struct Entry {
    transport: Arc<dyn SupplierTransport>,
    session: Mutex<SupplierSession>,
}

/// Result of probing offline suppliers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub probed: Vec<SupplierId>,
    pub reconnected: Vec<SupplierId>,
}

pub struct SupplierRegistry {
    config: SessionConfig,
    order: RwLock<Vec<SupplierId>>,
    entries: DashMap<SupplierId, Arc<Entry>>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<PipelineMetrics>,
}

impl SupplierRegistry {
    pub fn new(
        config: SessionConfig,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<PipelineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            order: RwLock::new(Vec::new()),
            entries: DashMap::new(),
            events,
            metrics,
        })
    }

    /// Register a supplier. It starts `Pending`.
    pub fn add(&self, transport: Arc<dyn SupplierTransport>) -> Result<()> {
        let id = transport.supplier_id().clone();
        let mut order = self.order.write();
        if self.entries.contains_key(&id) {
            return Err(Error::Config(format!("supplier {} registered twice", id)));
        }
        self.entries.insert(
            id.clone(),
            Arc::new(Entry {
                transport,
                session: Mutex::new(SupplierSession::new()),
            }),
        );
        debug!(supplier = %id, "Supplier registered");
        order.push(id);
        Ok(())
    }

    /// Supplier ids in registration order.
    pub fn ids(&self) -> Vec<SupplierId> {
        self.order.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn transport(&self, id: &SupplierId) -> Option<Arc<dyn SupplierTransport>> {
        self.entries.get(id).map(|e| e.transport.clone())
    }

    pub fn state(&self, id: &SupplierId) -> Option<SupplierState> {
        self.entry(id).map(|e| e.session.lock().state())
    }

    /// Every supplier with its state, in registration order.
    pub fn states(&self) -> Vec<(SupplierId, SupplierState)> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.state(&id).map(|state| (id, state)))
            .collect()
    }

    /// Known and not offline.
    pub fn is_available(&self, id: &SupplierId) -> bool {
        self.state(id).is_some_and(|s| s.is_available())
    }

    /// Liveness of each position of a backup's supplier list.
    pub fn alive_mask(&self, suppliers: &[SupplierId]) -> Vec<bool> {
        suppliers.iter().map(|id| self.is_available(id)).collect()
    }

    pub fn offline_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.session.lock().state() == SupplierState::Offline)
            .count()
    }

    // =========================================================================
    // Session Updates
    // =========================================================================

    pub async fn record_ack(&self, id: &SupplierId) {
        let change = self
            .entry(id)
            .and_then(|e| e.session.lock().on_ack(Instant::now()));
        if let Some(state) = change {
            self.changed(id, state).await;
        }
    }

    pub async fn record_failure(&self, id: &SupplierId, error: &Error) {
        let change = self.entry(id).and_then(|e| {
            let mut session = e.session.lock();
            let change = session.on_failure(&self.config, Instant::now());
            debug!(
                supplier = %id,
                failures = session.consecutive_failures(),
                "Supplier request failed: {}",
                error
            );
            change
        });
        if let Some(state) = change {
            self.changed(id, state).await;
        }
    }

    pub async fn disconnect(&self, id: &SupplierId) {
        let change = self
            .entry(id)
            .and_then(|e| e.session.lock().disconnect(&self.config, Instant::now()));
        if let Some(state) = change {
            self.changed(id, state).await;
        }
    }

    /// Offline suppliers whose next probe time has passed.
    pub fn due_probes(&self, now: Instant) -> Vec<SupplierId> {
        self.ids()
            .into_iter()
            .filter(|id| {
                self.entry(id)
                    .is_some_and(|e| e.session.lock().probe_due(now))
            })
            .collect()
    }

    /// Probe one supplier. Returns whether it answered.
    pub async fn probe(&self, id: &SupplierId) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        let answered = matches!(
            tokio::time::timeout(self.config.probe_timeout, entry.transport.probe()).await,
            Ok(Ok(()))
        );
        if answered {
            self.record_ack(id).await;
        } else {
            entry
                .session
                .lock()
                .on_probe_failed(&self.config, Instant::now());
            debug!(supplier = %id, "Probe failed");
        }
        answered
    }

    /// Probe every offline supplier that is due.
    pub async fn probe_due(&self) -> ProbeReport {
        let mut report = ProbeReport::default();
        for id in self.due_probes(Instant::now()) {
            if self.probe(&id).await {
                report.reconnected.push(id.clone());
            }
            report.probed.push(id);
        }
        report
    }

    fn entry(&self, id: &SupplierId) -> Option<Arc<Entry>> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    async fn changed(&self, id: &SupplierId, state: SupplierState) {
        match state {
            SupplierState::Offline => warn!(supplier = %id, "Supplier went offline"),
            _ => info!(supplier = %id, "Supplier is {}", state),
        }
        self.metrics
            .suppliers_offline
            .set(self.offline_count() as i64);
        if let Err(e) = self
            .events
            .publish(PipelineEvent::supplier_status_changed(id.clone(), state.as_str()))
            .await
        {
            warn!("Failed to publish event: {}", e);
        }
    }
}

impl std::fmt::Debug for SupplierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupplierRegistry")
            .field("suppliers", &self.entries.len())
            .finish()
    }
}
