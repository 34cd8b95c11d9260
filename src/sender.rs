//! Data Sender
//!
//! Drains local fragments to their suppliers. Fragments that become
//! `local ∧ ¬remote` in the [`FragmentMatrix`] are queued in priority order
//! (block number, then index, then kind) and sent with at most
//! `per_supplier_concurrency` requests in flight per supplier.
//!
//! The remote flag is set only after an `Ack` naming the sent fragment.
//! Failures and timeouts put the fragment back with exponential backoff and
//! count against the supplier's session.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backup::{BackupCatalog, BackupStatus};
use crate::domain::ports::{StoreReply, SupplierTransport};
use crate::domain::types::{BackupId, Fragment, FragmentName, SupplierId};
use crate::error::{Error, Result};
use crate::matrix::{FragmentMatrix, MatrixChange};
use crate::metrics::PipelineMetrics;
use crate::supplier::SupplierRegistry;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// In-flight sends per supplier
    pub per_supplier_concurrency: usize,
    /// Transport timeout for one store request
    pub send_timeout: Duration,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            per_supplier_concurrency: 4,
            send_timeout: Duration::from_secs(60),
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_max: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

/// Queue key; orders by fragment name first so lower blocks go out first.
type SendKey = (FragmentName, BackupId);

#[derive(Debug, Clone, Copy)]
struct Pending {
    attempt: u32,
    not_before: Option<Instant>,
}

#[derive(Default)]
struct SendQueue {
    queued: BTreeMap<SendKey, Pending>,
    in_flight: HashSet<SendKey>,
    per_supplier: HashMap<SupplierId, usize>,
}

enum SendResult {
    Acked,
    /// The local file is gone; nothing to send
    Vanished,
    Failed(Error),
}

struct Attempt {
    key: SendKey,
    supplier: SupplierId,
    attempt: u32,
    result: SendResult,
}

/// Fragment sender service.
pub struct DataSender {
    config: SenderConfig,
    local_root: PathBuf,
    matrix: Arc<FragmentMatrix>,
    catalog: Arc<BackupCatalog>,
    registry: Arc<SupplierRegistry>,
    metrics: Arc<PipelineMetrics>,
    queue: Mutex<SendQueue>,
    wake: Notify,
    shutdown: CancellationToken,
    peak_in_flight: AtomicUsize,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DataSender {
    /// `local_root` is the root of the local fragment tree.
    pub fn new(
        config: SenderConfig,
        local_root: PathBuf,
        matrix: Arc<FragmentMatrix>,
        catalog: Arc<BackupCatalog>,
        registry: Arc<SupplierRegistry>,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Arc<Self>> {
        if config.per_supplier_concurrency == 0 {
            return Err(Error::Config(
                "supplier send concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Arc::new(Self {
            config,
            local_root,
            matrix,
            catalog,
            registry,
            metrics,
            queue: Mutex::new(SendQueue::default()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            peak_in_flight: AtomicUsize::new(0),
            task: Mutex::new(None),
        }))
    }

    /// Subscribe to the matrix and run the send loop on the runtime.
    pub fn start(self: &Arc<Self>) {
        let changes = self.matrix.subscribe();
        let handle = tokio::spawn(self.clone().run(changes));
        *self.task.lock() = Some(handle);
    }

    /// Stop taking new work, wait for in-flight sends, then stop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Data sender task failed: {}", e);
            }
        }
    }

    /// Re-check the queue now.
    pub fn kick(&self) {
        self.wake.notify_one();
    }

    /// Queue one fragment. Returns false if it is already queued or in flight.
    pub fn enqueue(&self, backup_id: &BackupId, fragment: FragmentName) -> bool {
        let key = (fragment, backup_id.clone());
        let mut queue = self.queue.lock();
        if queue.in_flight.contains(&key) || queue.queued.contains_key(&key) {
            return false;
        }
        queue.queued.insert(
            key,
            Pending {
                attempt: 0,
                not_before: None,
            },
        );
        drop(queue);
        self.wake.notify_one();
        true
    }

    /// Queue every unsent local fragment of a backup.
    pub fn enqueue_pending(&self, backup_id: &BackupId) -> usize {
        let Some(snapshot) = self.matrix.snapshot(backup_id) else {
            return 0;
        };
        snapshot
            .blocks
            .iter()
            .flat_map(|(n, row)| row.unsent(*n))
            .filter(|name| self.enqueue(backup_id, *name))
            .count()
    }

    /// Drop every queued fragment of a backup. In-flight sends complete.
    pub fn forget_backup(&self, backup_id: &BackupId) -> usize {
        let mut queue = self.queue.lock();
        let before = queue.queued.len();
        queue.queued.retain(|(_, id), _| id != backup_id);
        before - queue.queued.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().queued.len()
    }

    pub fn in_flight(&self) -> usize {
        self.queue.lock().in_flight.len()
    }

    /// Highest number of concurrent sends seen for any single supplier.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Loop
    // =========================================================================

    #[instrument(skip_all)]
    async fn run(self: Arc<Self>, mut changes: mpsc::UnboundedReceiver<MatrixChange>) {
        info!(
            "Data sender started with {} sends per supplier",
            self.config.per_supplier_concurrency
        );
        let mut sends: JoinSet<Attempt> = JoinSet::new();

        loop {
            self.dispatch(&mut sends);
            let retry_at = self.next_retry();

            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                Some(change) = changes.recv() => self.on_change(change),

                _ = self.wake.notified() => {}

                Some(joined) = sends.join_next(), if !sends.is_empty() => match joined {
                    Ok(attempt) => self.complete(attempt).await,
                    Err(e) => warn!("Send task failed: {}", e),
                },

                _ = sleep_until(retry_at), if retry_at.is_some() => {}
            }
        }

        debug!("Draining {} in-flight sends", sends.len());
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok(attempt) => self.complete(attempt).await,
                Err(e) => warn!("Send task failed: {}", e),
            }
        }
        info!("Data sender stopped");
    }

    fn on_change(&self, change: MatrixChange) {
        if change.local && !change.remote {
            self.enqueue(&change.backup_id, change.fragment);
        } else {
            self.queue
                .lock()
                .queued
                .remove(&(change.fragment, change.backup_id));
        }
    }

    /// Start every send allowed by the per-supplier caps.
    fn dispatch(&self, sends: &mut JoinSet<Attempt>) {
        let now = Instant::now();
        let mut supplier_lists: HashMap<BackupId, Option<Vec<SupplierId>>> = HashMap::new();
        let mut queue = self.queue.lock();
        let mut started = Vec::new();
        let mut orphaned = Vec::new();

        for (key, pending) in queue.queued.iter() {
            if pending.not_before.is_some_and(|at| at > now) {
                continue;
            }
            let (fragment, backup_id) = key;
            let suppliers = supplier_lists
                .entry(backup_id.clone())
                .or_insert_with(|| {
                    self.catalog
                        .get(backup_id)
                        .filter(|s| matches!(s.status, BackupStatus::Running | BackupStatus::Done))
                        .map(|s| s.suppliers)
                });
            let Some(supplier) = suppliers
                .as_ref()
                .and_then(|list| list.get(fragment.index))
                .cloned()
            else {
                orphaned.push(key.clone());
                continue;
            };
            if !self.registry.is_available(&supplier) {
                continue;
            }
            let busy = queue.per_supplier.get(&supplier).copied().unwrap_or(0)
                + started.iter().filter(|(_, s, _)| *s == supplier).count();
            if busy >= self.config.per_supplier_concurrency {
                continue;
            }
            started.push((key.clone(), supplier, pending.attempt));
        }

        for key in orphaned {
            debug!("{}/{} has no active backup; dropping", key.1, key.0);
            queue.queued.remove(&key);
        }

        for (key, supplier, attempt) in started {
            let Some(transport) = self.registry.transport(&supplier) else {
                continue;
            };
            queue.queued.remove(&key);
            queue.in_flight.insert(key.clone());
            let count = queue.per_supplier.entry(supplier.clone()).or_insert(0);
            *count += 1;
            self.peak_in_flight.fetch_max(*count, Ordering::SeqCst);

            let path = key.0.path_in(&key.1.local_dir(&self.local_root));
            let timeout = self.config.send_timeout;
            sends.spawn(async move {
                let result = send_one(transport, &key, path, timeout).await;
                Attempt {
                    key,
                    supplier,
                    attempt,
                    result,
                }
            });
        }
    }

    async fn complete(&self, attempt: Attempt) {
        let Attempt {
            key,
            supplier,
            attempt,
            result,
        } = attempt;
        {
            let mut queue = self.queue.lock();
            queue.in_flight.remove(&key);
            if let Some(count) = queue.per_supplier.get_mut(&supplier) {
                *count = count.saturating_sub(1);
            }
        }
        let (fragment, backup_id) = &key;

        match result {
            SendResult::Acked => {
                self.metrics.fragments_sent.with_label_values(&["ok"]).inc();
                self.registry.record_ack(&supplier).await;
                match self.matrix.mark_remote(
                    backup_id,
                    fragment.block_number,
                    fragment.kind,
                    fragment.index,
                    true,
                ) {
                    Ok(_) => debug!(supplier = %supplier, "Sent {}/{}", backup_id, fragment),
                    Err(e) => debug!("Acked {}/{} no longer tracked: {}", backup_id, fragment, e),
                }
            }
            SendResult::Vanished => {
                debug!("{}/{} is no longer local", backup_id, fragment);
            }
            SendResult::Failed(e) => {
                self.metrics
                    .fragments_sent
                    .with_label_values(&["failed"])
                    .inc();
                if !matches!(e, Error::Io(_)) {
                    self.registry.record_failure(&supplier, &e).await;
                }
                let attempt = attempt + 1;
                let delay = self.backoff(attempt);
                warn!(
                    supplier = %supplier,
                    attempt,
                    "Send of {}/{} failed, retrying in {:?}: {}",
                    backup_id,
                    fragment,
                    delay,
                    e
                );
                self.queue.lock().queued.insert(
                    key,
                    Pending {
                        attempt,
                        not_before: Some(Instant::now() + delay),
                    },
                );
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        (self.config.retry_backoff_base * factor).min(self.config.retry_backoff_max)
    }

    fn next_retry(&self) -> Option<Instant> {
        let now = Instant::now();
        self.queue
            .lock()
            .queued
            .values()
            .filter_map(|p| p.not_before)
            .filter(|at| *at > now)
            .min()
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn send_one(
    transport: Arc<dyn SupplierTransport>,
    key: &SendKey,
    path: PathBuf,
    timeout: Duration,
) -> SendResult {
    let (name, backup_id) = key;
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SendResult::Vanished,
        Err(e) => return SendResult::Failed(e.into()),
    };
    let fragment = Fragment::new(backup_id.clone(), *name, bytes);
    let supplier = transport.supplier_id().to_string();

    match tokio::time::timeout(timeout, transport.store(fragment)).await {
        Ok(Ok(StoreReply::Ack { name: acked })) if acked == *name => SendResult::Acked,
        Ok(Ok(StoreReply::Ack { name: acked })) => SendResult::Failed(Error::SupplierRejected {
            supplier,
            fragment: name.to_string(),
            reason: format!("ack names {}", acked),
        }),
        Ok(Ok(StoreReply::Fail { reason })) => SendResult::Failed(Error::SupplierRejected {
            supplier,
            fragment: name.to_string(),
            reason,
        }),
        Ok(Err(e)) => SendResult::Failed(e),
        Err(_) => SendResult::Failed(Error::SendTimeout {
            supplier,
            operation: format!("store {}", name),
        }),
    }
}

impl std::fmt::Debug for DataSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSender")
            .field("queued", &self.queued())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
