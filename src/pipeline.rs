//! Pipeline
//!
//! Composition root wiring every component of one backup owner together.
//!
//! ```text
//!  producer ──▶ PipeWriter ─▶ BackupJob ─▶ RaidWorker ─▶ fragments/
//!                                              │
//!                                      FragmentMatrix ◀──┐
//!                                        │      │        │
//!                               DataSender    BackupMonitor ─▶ fetch/rebuild
//!                                   │               │
//!                                   ▼               ▼
//!                              SupplierRegistry (transports + sessions)
//! ```
//!
//! State lives under one directory:
//!
//! - `catalog.json` - backup catalog
//! - `matrix.json` - fragment matrix
//! - `fragments/` - local fragment tree
//! - `tmp/` - sealed block temp files and restore targets

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::backup::{BackupCatalog, BackupDeps, BackupHandle, BackupJob, BackupState, BackupStatus};
use crate::config::PipelineConfig;
use crate::domain::ports::{BlockCipher, EventPublisher, SupplierTransport};
use crate::domain::types::{BackupId, SupplierId};
use crate::ec::EccMap;
use crate::error::{Error, Result};
use crate::matrix::{FragmentMatrix, MatrixStats};
use crate::metrics::PipelineMetrics;
use crate::monitor::{BackupMonitor, CycleReport, MonitorDeps};
use crate::pipe::{block_pipe, PipeWriter};
use crate::raid::RaidWorker;
use crate::restore::{RestoreDeps, RestoreHandle, RestoreWorker};
use crate::sender::DataSender;
use crate::supplier::{SupplierRegistry, SupplierState};

const CATALOG_FILE: &str = "catalog.json";
const MATRIX_FILE: &str = "matrix.json";

/// Catalog entry joined with matrix statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BackupSummary {
    #[serde(flatten)]
    pub state: BackupState,
    pub blocks: usize,
    pub local_fragments: usize,
    pub remote_fragments: usize,
    pub fully_remote_blocks: usize,
}

impl BackupSummary {
    fn new(state: BackupState, stats: Option<MatrixStats>) -> Self {
        let stats = stats.unwrap_or_default();
        Self {
            state,
            blocks: stats.blocks,
            local_fragments: stats.local_fragments,
            remote_fragments: stats.remote_fragments,
            fully_remote_blocks: stats.fully_remote_blocks,
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    local_root: PathBuf,
    temp_dir: PathBuf,
    cipher: Arc<dyn BlockCipher>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<PipelineMetrics>,
    matrix: Arc<FragmentMatrix>,
    catalog: Arc<BackupCatalog>,
    raid: Arc<RaidWorker>,
    registry: Arc<SupplierRegistry>,
    sender: Arc<DataSender>,
    monitor: Arc<BackupMonitor>,
    shutdown: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Open (or create) the pipeline state under `state_dir`.
    ///
    /// Local fragment flags are rebuilt from the fragment tree for every
    /// cataloged backup. Backups left running by a previous process are
    /// marked aborted.
    pub fn open(
        config: PipelineConfig,
        state_dir: impl AsRef<Path>,
        cipher: Arc<dyn BlockCipher>,
        events: Arc<dyn EventPublisher>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let state_dir = state_dir.as_ref();
        let local_root = state_dir.join("fragments");
        let temp_dir = state_dir.join("tmp");
        std::fs::create_dir_all(&local_root)?;
        std::fs::create_dir_all(&temp_dir)?;

        let metrics = Arc::new(PipelineMetrics::new()?);
        let matrix = FragmentMatrix::open(state_dir.join(MATRIX_FILE), config.matrix_flush_interval())?;
        let catalog = Arc::new(BackupCatalog::open(state_dir.join(CATALOG_FILE))?);
        recover(&catalog, &matrix, &local_root)?;

        let raid = RaidWorker::new(config.raid_worker(), metrics.clone())?;
        let registry = SupplierRegistry::new(config.session(), events.clone(), metrics.clone());
        let sender = DataSender::new(
            config.sender(),
            local_root.clone(),
            matrix.clone(),
            catalog.clone(),
            registry.clone(),
            metrics.clone(),
        )?;
        let monitor = BackupMonitor::new(
            config.monitor(),
            MonitorDeps {
                raid: raid.clone(),
                matrix: matrix.clone(),
                catalog: catalog.clone(),
                registry: registry.clone(),
                sender: sender.clone(),
                events: events.clone(),
                metrics: metrics.clone(),
            },
            local_root.clone(),
        )?;

        info!(
            "Pipeline opened at {} with ecc {} and {} raid workers",
            state_dir.display(),
            config.ecc_scheme,
            raid.pool_size()
        );
        Ok(Arc::new(Self {
            config,
            local_root,
            temp_dir,
            cipher,
            events,
            metrics,
            matrix,
            catalog,
            raid,
            registry,
            sender,
            monitor,
            shutdown: CancellationToken::new(),
            flusher: Mutex::new(None),
        }))
    }

    pub fn add_supplier(&self, transport: Arc<dyn SupplierTransport>) -> Result<()> {
        self.registry.add(transport)
    }

    /// Start the data sender, the monitor loop and the matrix flusher.
    pub fn start(&self) {
        self.sender.start();
        self.monitor.start();
        let flusher = tokio::spawn(self.matrix.clone().run_flusher(self.shutdown.clone()));
        *self.flusher.lock() = Some(flusher);
    }

    // =========================================================================
    // Backup
    // =========================================================================

    /// Start a backup placed on the first `k` registered suppliers.
    ///
    /// The producer writes the archive into the returned pipe and calls
    /// `mark_finished` at the end of the stream.
    #[instrument(skip(self), fields(backup_id = %backup_id))]
    pub fn start_backup(&self, backup_id: BackupId) -> Result<(PipeWriter, BackupHandle)> {
        let ecc = self.config.eccmap()?;
        let suppliers = self.registry.ids();
        if suppliers.len() < ecc.supplier_count() {
            return Err(Error::Config(format!(
                "ecc {} needs {} suppliers, {} registered",
                ecc,
                ecc.supplier_count(),
                suppliers.len()
            )));
        }
        let placement = suppliers[..ecc.supplier_count()].to_vec();
        self.catalog
            .create(BackupState::new(backup_id.clone(), ecc.name(), placement))?;

        let (writer, reader) = block_pipe(self.config.block_size);
        let job = BackupJob::new(
            backup_id.clone(),
            self.config.backup_job()?,
            BackupDeps {
                cipher: self.cipher.clone(),
                raid: self.raid.clone(),
                matrix: self.matrix.clone(),
                catalog: self.catalog.clone(),
                events: self.events.clone(),
                metrics: self.metrics.clone(),
            },
            reader,
            backup_id.local_dir(&self.local_root),
            self.temp_dir.clone(),
        );
        Ok((writer, job.spawn()))
    }

    // =========================================================================
    // Restore
    // =========================================================================

    /// Restore a backup into `out`.
    pub fn restore<W>(&self, backup_id: BackupId, out: W) -> Result<RestoreHandle>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if self.catalog.get(&backup_id).is_none() {
            return Err(Error::BackupNotFound(backup_id.to_string()));
        }
        let worker = RestoreWorker::new(
            backup_id,
            self.config.restore(),
            RestoreDeps {
                cipher: self.cipher.clone(),
                raid: self.raid.clone(),
                matrix: self.matrix.clone(),
                catalog: self.catalog.clone(),
                registry: self.registry.clone(),
                events: self.events.clone(),
                metrics: self.metrics.clone(),
            },
            self.local_root.clone(),
            self.temp_dir.clone(),
        );
        Ok(worker.spawn(out))
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Forget a backup everywhere: sender queue, matrix, local fragments,
    /// suppliers and catalog.
    #[instrument(skip(self), fields(backup_id = %backup_id))]
    pub async fn delete_backup(&self, backup_id: &BackupId) -> Result<()> {
        let state = self
            .catalog
            .get(backup_id)
            .ok_or_else(|| Error::BackupNotFound(backup_id.to_string()))?;
        if state.status == BackupStatus::Running {
            return Err(Error::Config(format!("{} is still running", backup_id)));
        }

        self.sender.forget_backup(backup_id);
        self.matrix.remove_backup(backup_id);

        let dir = backup_id.local_dir(&self.local_root);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        for supplier in &state.suppliers {
            let Some(transport) = self.registry.transport(supplier) else {
                continue;
            };
            if let Err(e) = transport.remove_backup(backup_id).await {
                warn!(supplier = %supplier, "Cannot remove {} from supplier: {}", backup_id, e);
            }
        }

        self.catalog.remove(backup_id)?;
        info!("Deleted backup");
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn backups(&self) -> Vec<BackupSummary> {
        self.catalog
            .list()
            .into_iter()
            .map(|state| {
                let stats = self.matrix.stats(&state.id);
                BackupSummary::new(state, stats)
            })
            .collect()
    }

    pub fn backup(&self, backup_id: &BackupId) -> Option<BackupSummary> {
        let state = self.catalog.get(backup_id)?;
        Some(BackupSummary::new(state, self.matrix.stats(backup_id)))
    }

    pub fn suppliers(&self) -> Vec<(SupplierId, SupplierState)> {
        self.registry.states()
    }

    /// Run one monitor cycle now.
    pub async fn run_monitor_cycle(&self) -> CycleReport {
        self.monitor.run_cycle().await
    }

    /// Queue every unsent fragment of active backups and wait until the
    /// sender has nothing queued or in flight.
    ///
    /// Fragments whose supplier is offline stay queued, so callers bound
    /// this with a timeout.
    pub async fn flush_sends(&self) {
        loop {
            for state in self.catalog.list() {
                if matches!(state.status, BackupStatus::Running | BackupStatus::Done) {
                    self.sender.enqueue_pending(&state.id);
                }
            }
            if self.sender.queued() == 0 && self.sender.in_flight() == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn matrix(&self) -> &Arc<FragmentMatrix> {
        &self.matrix
    }

    pub fn catalog(&self) -> &Arc<BackupCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<SupplierRegistry> {
        &self.registry
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn eccmap(&self) -> Result<EccMap> {
        self.config.eccmap()
    }

    /// Stop in dependency order: the sender drains, the monitor stops, the
    /// raid pool stops and the matrix is flushed.
    pub async fn shutdown(&self) {
        info!("Shutting down pipeline");
        self.sender.shutdown().await;
        self.monitor.shutdown().await;
        self.raid.shutdown().await;

        self.shutdown.cancel();
        let flusher = self.flusher.lock().take();
        if let Some(flusher) = flusher {
            if let Err(e) = flusher.await {
                warn!("Matrix flusher task failed: {}", e);
            }
        }
        if let Err(e) = self.matrix.close() {
            warn!("Final matrix flush failed: {}", e);
        }
        info!("Pipeline stopped");
    }
}

/// Bring matrix and catalog back in line after a restart.
fn recover(catalog: &BackupCatalog, matrix: &FragmentMatrix, local_root: &Path) -> Result<()> {
    for state in catalog.list() {
        if state.status == BackupStatus::Running {
            warn!("Backup {} was interrupted; marking aborted", state.id);
            catalog.set_status(&state.id, BackupStatus::Aborted)?;
        }
        let ecc = EccMap::by_name(&state.ecc_scheme)?;
        matrix.register_backup(&state.id, ecc.data_count(), ecc.parity_count())?;
        matrix.scan_local(&state.id, &state.id.local_dir(local_root))?;
    }
    Ok(())
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("local_root", &self.local_root)
            .field("ecc_scheme", &self.config.ecc_scheme)
            .field("suppliers", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AesGcmBlockCipher, InMemoryEventCollector, InMemorySupplier};
    use assert_matches::assert_matches;

    fn config() -> PipelineConfig {
        PipelineConfig {
            block_size: 64,
            ecc_scheme: "2x2".to_string(),
            raid_pool_size: Some(2),
            matrix_flush_interval_ms: 10,
            ..Default::default()
        }
    }

    fn open(dir: &Path) -> (Arc<Pipeline>, Arc<InMemoryEventCollector>) {
        let events = Arc::new(InMemoryEventCollector::new());
        let cipher = Arc::new(AesGcmBlockCipher::new(&[7u8; 32]));
        let pipeline = Pipeline::open(config(), dir, cipher, events.clone()).unwrap();
        (pipeline, events)
    }

    fn id() -> BackupId {
        "alice:0/F1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_start_backup_needs_enough_suppliers() {
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, _) = open(tmp.path());
        pipeline
            .add_supplier(Arc::new(InMemorySupplier::new("s0")))
            .unwrap();
        assert_matches!(pipeline.start_backup(id()), Err(Error::Config(_)));
        assert!(pipeline.catalog().get(&id()).is_none());
    }

    #[tokio::test]
    async fn test_backup_restore_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, events) = open(tmp.path());
        let suppliers: Vec<_> = (0..2)
            .map(|i| Arc::new(InMemorySupplier::new(format!("s{}", i))))
            .collect();
        for supplier in &suppliers {
            pipeline.add_supplier(supplier.clone()).unwrap();
        }
        pipeline.start();

        let input: Vec<u8> = (0..200u8).collect();
        let (writer, handle) = pipeline.start_backup(id()).unwrap();
        let producer = input.clone();
        tokio::task::spawn_blocking(move || {
            writer.write(&producer).unwrap();
            writer.mark_finished();
        });
        assert!(handle.wait().await.unwrap().is_done());
        pipeline.flush_sends().await;

        let summary = pipeline.backup(&id()).unwrap();
        assert_eq!(summary.state.status, BackupStatus::Done);
        assert_eq!(summary.blocks, 4);
        assert!(suppliers[0].fragment_count() > 0);

        let mut out = Vec::new();
        let (client, mut server) = tokio::io::duplex(256);
        let restore = pipeline.restore(id(), client).unwrap();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut out)
            .await
            .unwrap();
        assert!(restore.wait().await.unwrap().is_done());
        assert_eq!(out, input);
        assert_eq!(events.events_of_type("backup-done").len(), 1);

        pipeline.delete_backup(&id()).await.unwrap();
        assert!(pipeline.catalog().get(&id()).is_none());
        assert!(!pipeline.matrix().contains(&id()));
        assert!(!id().local_dir(pipeline.local_root()).exists());
        assert_eq!(suppliers[0].fragment_count(), 0);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_reopen_recovers_state() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let (pipeline, _) = open(tmp.path());
            for i in 0..2 {
                pipeline
                    .add_supplier(Arc::new(InMemorySupplier::new(format!("s{}", i))))
                    .unwrap();
            }
            let (writer, handle) = pipeline.start_backup(id()).unwrap();
            writer.write(b"persisted").unwrap();
            writer.mark_finished();
            assert!(handle.wait().await.unwrap().is_done());
            pipeline.shutdown().await;
        }

        let (pipeline, _) = open(tmp.path());
        let summary = pipeline.backup(&id()).unwrap();
        assert_eq!(summary.state.status, BackupStatus::Done);
        assert_eq!(summary.local_fragments, 4);

        let mut out = Vec::new();
        let outcome = RestoreWorker::new(
            id(),
            Default::default(),
            RestoreDeps {
                cipher: pipeline.cipher.clone(),
                raid: pipeline.raid.clone(),
                matrix: pipeline.matrix.clone(),
                catalog: pipeline.catalog.clone(),
                registry: pipeline.registry.clone(),
                events: pipeline.events.clone(),
                metrics: pipeline.metrics.clone(),
            },
            pipeline.local_root.clone(),
            pipeline.temp_dir.clone(),
        )
        .run(&mut out)
        .await
        .unwrap();
        assert!(outcome.is_done());
        assert_eq!(out, b"persisted");
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_unknown_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, _) = open(tmp.path());
        assert_matches!(
            pipeline.delete_backup(&id()).await,
            Err(Error::BackupNotFound(_))
        );
    }
}
