//! Backup Monitor
//!
//! Periodic control loop reconciling the fragment matrix with the ecc policy
//! of every active backup. Each cycle:
//!
//! 1. probes offline suppliers that are due,
//! 2. queues unsent local fragments with the [`DataSender`],
//! 3. fetches fragments back when an alive supplier lacks one of its own,
//! 4. rebuilds the missing fragments from what is now local,
//! 5. purges local copies of blocks held in full by alive suppliers,
//! 6. marks blocks whose missing fragments exceed the correctable bound.
//!
//! Besides the interval, a matrix change that leaves a fragment absent
//! schedules an early cycle after a short debounce.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backup::{BackupCatalog, BackupState, BackupStatus};
use crate::config::PurgePolicy;
use crate::domain::events::PipelineEvent;
use crate::domain::ports::EventPublisher;
use crate::domain::types::{BackupId, FragmentKind, Presence, SupplierId};
use crate::ec::EccMap;
use crate::error::{Error, Result};
use crate::matrix::{BlockRow, FragmentMatrix, MatrixChange};
use crate::metrics::PipelineMetrics;
use crate::raid::{RaidTask, RaidWorker, RebuildRequest};
use crate::sender::DataSender;
use crate::supplier::{FetchScope, FragmentFetcher, SupplierRegistry};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between cycles
    pub interval: Duration,
    pub purge_policy: PurgePolicy,
    /// Rebuild tasks submitted per cycle
    pub max_rebuilds_per_cycle: usize,
    pub fetch_timeout: Duration,
    /// Delay between a matrix change and the early cycle it triggers
    pub kick_debounce: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            purge_policy: PurgePolicy::Never,
            max_rebuilds_per_cycle: 1,
            fetch_timeout: Duration::from_secs(60),
            kick_debounce: Duration::from_millis(500),
        }
    }
}

/// Services the monitor works with.
#[derive(Clone)]
pub struct MonitorDeps {
    pub raid: Arc<RaidWorker>,
    pub matrix: Arc<FragmentMatrix>,
    pub catalog: Arc<BackupCatalog>,
    pub registry: Arc<SupplierRegistry>,
    pub sender: Arc<DataSender>,
    pub events: Arc<dyn EventPublisher>,
    pub metrics: Arc<PipelineMetrics>,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub backups_checked: usize,
    pub suppliers_probed: usize,
    pub suppliers_reconnected: usize,
    pub sends_enqueued: usize,
    pub fragments_fetched: usize,
    /// Acknowledged fragments a supplier no longer holds
    pub fragments_lost: usize,
    pub rebuilds: usize,
    pub fragments_rebuilt: usize,
    pub fragments_purged: usize,
    pub at_risk_blocks: usize,
    pub newly_at_risk: usize,
    /// Backups with more dead suppliers than the ecc tolerates before
    /// replacing them
    pub suppliers_to_replace: Vec<(BackupId, Vec<SupplierId>)>,
}

// =============================================================================
// Monitor
// =============================================================================

pub struct BackupMonitor {
    config: MonitorConfig,
    deps: MonitorDeps,
    local_root: PathBuf,
    fetcher: FragmentFetcher,
    kick: Notify,
    shutdown: CancellationToken,
    cycle_lock: tokio::sync::Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BackupMonitor {
    pub fn new(config: MonitorConfig, deps: MonitorDeps, local_root: PathBuf) -> Result<Arc<Self>> {
        if config.interval.is_zero() {
            return Err(Error::Config("monitor interval must be positive".to_string()));
        }
        let fetcher = FragmentFetcher::new(
            deps.registry.clone(),
            deps.matrix.clone(),
            deps.metrics.clone(),
            config.fetch_timeout,
        );
        Ok(Arc::new(Self {
            config,
            deps,
            local_root,
            fetcher,
            kick: Notify::new(),
            shutdown: CancellationToken::new(),
            cycle_lock: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        }))
    }

    /// Run the monitor loop on the runtime.
    pub fn start(self: &Arc<Self>) {
        let changes = self.deps.matrix.subscribe();
        let handle = tokio::spawn(self.clone().run(changes));
        *self.task.lock() = Some(handle);
    }

    /// Stop after the current cycle.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Monitor task failed: {}", e);
            }
        }
    }

    /// Run a cycle soon.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    async fn run(self: Arc<Self>, mut changes: mpsc::UnboundedReceiver<MatrixChange>) {
        info!("Backup monitor started, interval {:?}", self.config.interval);
        let mut tick = tokio::time::interval(self.config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut kick_at: Option<Instant> = None;

        loop {
            let due = kick_at.unwrap_or_else(Instant::now);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                _ = tick.tick() => {
                    kick_at = None;
                    self.run_cycle().await;
                }

                Some(change) = changes.recv() => {
                    if !change.local && !change.remote && kick_at.is_none() {
                        kick_at = Some(Instant::now() + self.config.kick_debounce);
                    }
                }

                _ = self.kick.notified() => {
                    kick_at.get_or_insert_with(|| Instant::now() + self.config.kick_debounce);
                }

                _ = tokio::time::sleep_until(due), if kick_at.is_some() => {
                    kick_at = None;
                    self.run_cycle().await;
                }
            }
        }
        info!("Backup monitor stopped");
    }

    /// One reconciliation pass over every running or done backup.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> CycleReport {
        let _cycle = self.cycle_lock.lock().await;
        self.deps.metrics.monitor_cycles.inc();

        let probes = self.deps.registry.probe_due().await;
        let mut report = CycleReport {
            suppliers_probed: probes.probed.len(),
            suppliers_reconnected: probes.reconnected.len(),
            ..Default::default()
        };
        if !probes.reconnected.is_empty() {
            self.deps.sender.kick();
        }

        for state in self.deps.catalog.list() {
            if !matches!(state.status, BackupStatus::Running | BackupStatus::Done) {
                continue;
            }
            report.backups_checked += 1;
            if let Err(e) = self.check_backup(&state, &mut report).await {
                warn!(backup_id = %state.id, "Monitor check failed: {}", e);
            }
        }

        let at_risk: usize = self
            .deps
            .catalog
            .list()
            .iter()
            .map(|s| s.at_risk_blocks.len())
            .sum();
        self.deps.metrics.at_risk_blocks.set(at_risk as i64);

        if report.rebuilds > 0 || report.fragments_purged > 0 || report.newly_at_risk > 0 {
            info!(
                rebuilds = report.rebuilds,
                rebuilt = report.fragments_rebuilt,
                purged = report.fragments_purged,
                at_risk = report.at_risk_blocks,
                "Monitor cycle finished"
            );
        } else {
            debug!(backups = report.backups_checked, "Monitor cycle finished");
        }
        report
    }

    async fn check_backup(&self, state: &BackupState, report: &mut CycleReport) -> Result<()> {
        let ecc = EccMap::by_name(&state.ecc_scheme)?;
        if !self.deps.matrix.contains(&state.id) {
            return Ok(());
        }
        let alive = self.deps.registry.alive_mask(&state.suppliers);
        let dir = state.id.local_dir(&self.local_root);

        report.sends_enqueued += self.deps.sender.enqueue_pending(&state.id);
        self.check_suppliers(state, &ecc, &alive, report);

        // Fetch and rebuild blocks where an alive supplier lacks its fragment.
        let mut rebuilds: Vec<(u64, RaidTask)> = Vec::new();
        for block_number in self.block_numbers(state) {
            if report.rebuilds >= self.config.max_rebuilds_per_cycle {
                break;
            }
            let Some(row) = self.deps.matrix.block(&state.id, block_number) else {
                continue;
            };
            if owed(&row, &alive) == 0 {
                continue;
            }
            let fetched = self
                .fetcher
                .fetch_block(&state.id, &state.suppliers, block_number, FetchScope::Acked, &dir)
                .await?;
            report.fragments_fetched += fetched.fetched;
            report.fragments_lost += fetched.lost;

            let Some(row) = self.deps.matrix.block(&state.id, block_number) else {
                continue;
            };
            if row.local.count() < ecc.data_count() {
                continue;
            }
            let task = self.deps.raid.submit_rebuild(RebuildRequest {
                backup_id: state.id.clone(),
                block_number,
                ecc: ecc.clone(),
                alive: alive.clone(),
                remote: row.remote,
                local: row.local,
                dir: dir.clone(),
            })?;
            rebuilds.push((block_number, task));
            report.rebuilds += 1;
        }

        for (block_number, task) in rebuilds {
            match task.wait().await.into_rebuilt() {
                Ok(outcome) => {
                    for name in &outcome.written {
                        self.deps.matrix.mark_local(
                            &state.id,
                            block_number,
                            name.kind,
                            name.index,
                            true,
                        )?;
                    }
                    report.fragments_rebuilt += outcome.written.len();
                    self.deps
                        .metrics
                        .fragments_rebuilt
                        .inc_by(outcome.written.len() as u64);
                    if outcome.any_new_data {
                        debug!(block_number, "Rebuilt {} fragments", outcome.written.len());
                        self.publish(PipelineEvent::block_rebuilt(
                            state.id.clone(),
                            block_number,
                            outcome.reconstructed.count(),
                        ))
                        .await;
                    }
                }
                Err(e) => warn!(block_number, "Rebuild of {} failed: {}", state.id, e),
            }
        }

        for block_number in self.block_numbers(state) {
            let row = self.deps.matrix.block(&state.id, block_number);
            self.check_risk(state, &ecc, &alive, block_number, row.as_ref(), report)
                .await?;
            if let Some(row) = row {
                self.purge(state, &alive, block_number, &row, report).await?;
            }
        }
        Ok(())
    }

    /// Blocks to look at: every block of a finished backup, otherwise the
    /// blocks the matrix knows.
    fn block_numbers(&self, state: &BackupState) -> Vec<u64> {
        match state.total_blocks {
            Some(total) if state.is_done() => (0..total).collect(),
            _ => self
                .deps
                .matrix
                .snapshot(&state.id)
                .map(|s| s.blocks.keys().copied().collect())
                .unwrap_or_default(),
        }
    }

    fn check_suppliers(
        &self,
        state: &BackupState,
        ecc: &EccMap,
        alive: &[bool],
        report: &mut CycleReport,
    ) {
        let dead: Vec<SupplierId> = state
            .suppliers
            .iter()
            .zip(alive)
            .filter(|(_, alive)| !**alive)
            .map(|(id, _)| id.clone())
            .collect();
        if dead.len() > ecc.fire_hire_errors() {
            warn!(
                backup_id = %state.id,
                dead = dead.len(),
                tolerated = ecc.fire_hire_errors(),
                "Too many dead suppliers; replace them"
            );
            report.suppliers_to_replace.push((state.id.clone(), dead));
        }
    }

    async fn check_risk(
        &self,
        state: &BackupState,
        ecc: &EccMap,
        alive: &[bool],
        block_number: u64,
        row: Option<&BlockRow>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let missing = match row {
            Some(row) => unusable(row, alive),
            None => ecc.total_count(),
        };
        let at_risk = missing > ecc.correctable_missing();
        let changed = self
            .deps
            .catalog
            .set_at_risk(&state.id, block_number, at_risk)?;
        if at_risk {
            report.at_risk_blocks += 1;
            if changed {
                report.newly_at_risk += 1;
                warn!(
                    backup_id = %state.id,
                    block_number,
                    missing,
                    correctable = ecc.correctable_missing(),
                    "Block at risk"
                );
                self.publish(PipelineEvent::block_at_risk(
                    state.id.clone(),
                    block_number,
                    missing,
                    ecc.correctable_missing(),
                ))
                .await;
            }
        }
        Ok(())
    }

    async fn purge(
        &self,
        state: &BackupState,
        alive: &[bool],
        block_number: u64,
        row: &BlockRow,
        report: &mut CycleReport,
    ) -> Result<()> {
        if self.config.purge_policy != PurgePolicy::WhenFullyRemote
            || !row.remote.is_full()
            || !alive.iter().all(|a| *a)
            || row.local.count() == 0
        {
            return Ok(());
        }
        let dir = state.id.local_dir(&self.local_root);
        for name in row.local.names(block_number) {
            match tokio::fs::remove_file(name.path_in(&dir)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Cannot purge {}: {}", name, e);
                    continue;
                }
            }
            self.deps
                .matrix
                .mark_local(&state.id, block_number, name.kind, name.index, false)?;
            self.deps.metrics.fragments_purged.inc();
            report.fragments_purged += 1;
        }
        debug!(block_number, "Purged local copies of {}", state.id);
        Ok(())
    }

    async fn publish(&self, event: PipelineEvent) {
        if let Err(e) = self.deps.events.publish(event).await {
            warn!("Failed to publish event: {}", e);
        }
    }
}

impl std::fmt::Debug for BackupMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupMonitor")
            .field("config", &self.config)
            .field("local_root", &self.local_root)
            .finish()
    }
}

/// Fragments whose alive supplier holds them neither remotely nor locally.
fn owed(row: &BlockRow, alive: &[bool]) -> usize {
    count_positions(row, |kind, i| {
        alive.get(i).copied().unwrap_or(false)
            && !row.local.get(kind, i)
            && !row.remote.get(kind, i)
    })
}

/// Fragments usable from nowhere: not local and not held by an alive supplier.
fn unusable(row: &BlockRow, alive: &[bool]) -> usize {
    count_positions(row, |kind, i| {
        let on_alive = row.remote.get(kind, i) && alive.get(i).copied().unwrap_or(false);
        !row.local.get(kind, i) && !on_alive
    })
}

fn count_positions<F: Fn(FragmentKind, usize) -> bool>(row: &BlockRow, f: F) -> usize {
    let Presence { data, parity } = &row.local;
    let data = (0..data.len()).filter(|&i| f(FragmentKind::Data, i)).count();
    let parity = (0..parity.len())
        .filter(|&j| f(FragmentKind::Parity, j))
        .count();
    data + parity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AesGcmBlockCipher, InMemoryEventCollector, InMemorySupplier};
    use crate::backup::{BackupDeps, BackupJob, BackupJobConfig};
    use crate::domain::ports::SupplierTransport;
    use crate::domain::types::FragmentName;
    use crate::pipe::block_pipe;
    use crate::raid::RaidWorkerConfig;
    use crate::sender::SenderConfig;
    use crate::supplier::SessionConfig;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        deps: MonitorDeps,
        events: Arc<InMemoryEventCollector>,
        suppliers: Vec<Arc<InMemorySupplier>>,
        monitor: Arc<BackupMonitor>,
        id: BackupId,
    }

    async fn fixture(scheme: &str, purge_policy: PurgePolicy) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("local");
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let events = Arc::new(InMemoryEventCollector::new());
        let matrix = FragmentMatrix::in_memory();
        let catalog = Arc::new(BackupCatalog::in_memory());
        let registry = SupplierRegistry::new(SessionConfig::default(), events.clone(), metrics.clone());
        let raid = RaidWorker::new(RaidWorkerConfig { pool_size: 2 }, metrics.clone()).unwrap();
        let ecc = EccMap::by_name(scheme).unwrap();

        let mut suppliers = Vec::new();
        for i in 0..ecc.supplier_count() {
            let supplier = Arc::new(InMemorySupplier::new(format!("s{:02}", i)));
            registry.add(supplier.clone()).unwrap();
            suppliers.push(supplier);
        }
        let sender = DataSender::new(
            SenderConfig::default(),
            root.clone(),
            matrix.clone(),
            catalog.clone(),
            registry.clone(),
            metrics.clone(),
        )
        .unwrap();
        let deps = MonitorDeps {
            raid: raid.clone(),
            matrix: matrix.clone(),
            catalog: catalog.clone(),
            registry: registry.clone(),
            sender,
            events: events.clone(),
            metrics: metrics.clone(),
        };
        let monitor = BackupMonitor::new(
            MonitorConfig {
                purge_policy,
                max_rebuilds_per_cycle: 4,
                ..Default::default()
            },
            deps.clone(),
            root.clone(),
        )
        .unwrap();

        // Back up one small block.
        let id: BackupId = "alice:0/F1".parse().unwrap();
        catalog
            .create(BackupState::new(id.clone(), ecc.name(), registry.ids()))
            .unwrap();
        let (writer, reader) = block_pipe(1024);
        writer.write(b"monitored bytes").unwrap();
        writer.mark_finished();
        let job = BackupJob::new(
            id.clone(),
            BackupJobConfig {
                block_size: 64,
                ecc,
                max_in_flight_blocks: 2,
                ..Default::default()
            },
            BackupDeps {
                cipher: Arc::new(AesGcmBlockCipher::new(&AesGcmBlockCipher::generate_key())),
                raid,
                matrix,
                catalog,
                events: events.clone(),
                metrics,
            },
            reader,
            id.local_dir(&root),
            tmp.path().join("tmp"),
        );
        assert!(job.run().await.is_done());

        Fixture {
            _tmp: tmp,
            root,
            deps,
            events,
            suppliers,
            monitor,
            id,
        }
    }

    async fn send_all(fx: &Fixture) {
        fx.deps.sender.start();
        fx.deps.sender.enqueue_pending(&fx.id);
        for _ in 0..500 {
            if fx
                .deps
                .matrix
                .block(&fx.id, 0)
                .is_some_and(|row| row.remote.is_full())
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("block 0 never became fully remote");
    }

    // =========================================================================
    // Risk And Purge
    // =========================================================================

    #[tokio::test]
    async fn test_unsent_backup_not_at_risk() {
        let fx = fixture("4x4", PurgePolicy::Never).await;
        let report = fx.monitor.run_cycle().await;
        assert_eq!(report.backups_checked, 1);
        assert_eq!(report.sends_enqueued, 8);
        assert_eq!(report.at_risk_blocks, 0);
        assert!(report.suppliers_to_replace.is_empty());
    }

    #[tokio::test]
    async fn test_purge_when_fully_remote() {
        let fx = fixture("4x4", PurgePolicy::WhenFullyRemote).await;
        send_all(&fx).await;

        let report = fx.monitor.run_cycle().await;
        assert_eq!(report.fragments_purged, 8);
        let row = fx.deps.matrix.block(&fx.id, 0).unwrap();
        assert_eq!(row.local.count(), 0);
        assert!(row.remote.is_full());
        assert!(!FragmentName::data(0, 0)
            .path_in(&fx.id.local_dir(&fx.root))
            .exists());
        fx.deps.sender.shutdown().await;
    }

    #[tokio::test]
    async fn test_dead_suppliers_mark_block_at_risk() {
        let fx = fixture("4x4", PurgePolicy::WhenFullyRemote).await;
        send_all(&fx).await;
        fx.monitor.run_cycle().await;

        for supplier in &fx.suppliers[..2] {
            supplier.set_online(false);
            fx.deps.registry.disconnect(supplier.supplier_id()).await;
        }
        let report = fx.monitor.run_cycle().await;
        assert_eq!(report.at_risk_blocks, 1);
        assert_eq!(report.newly_at_risk, 1);
        assert_eq!(report.suppliers_to_replace.len(), 1);
        assert_eq!(fx.events.events_of_type("block-at-risk").len(), 1);
        assert!(fx
            .deps
            .catalog
            .get(&fx.id)
            .unwrap()
            .at_risk_blocks
            .contains(&0));

        let again = fx.monitor.run_cycle().await;
        assert_eq!(again.newly_at_risk, 0);
        fx.deps.sender.shutdown().await;
    }

    // =========================================================================
    // Healing
    // =========================================================================

    #[tokio::test]
    async fn test_lost_remote_fragment_is_rebuilt_and_resent() {
        let fx = fixture("4x4", PurgePolicy::WhenFullyRemote).await;
        send_all(&fx).await;
        fx.monitor.run_cycle().await;

        let lost = FragmentName::data(0, 2);
        assert!(fx.suppliers[2].drop_fragment(&fx.id, &lost));
        fx.deps
            .matrix
            .mark_remote(&fx.id, 0, lost.kind, lost.index, false)
            .unwrap();

        let report = fx.monitor.run_cycle().await;
        assert_eq!(report.rebuilds, 1);
        assert!(report.fragments_fetched >= 4);
        assert!(report.fragments_rebuilt >= 1);
        assert_eq!(fx.events.events_of_type("block-rebuilt").len(), 1);

        for _ in 0..500 {
            if fx.suppliers[2].holds(&fx.id, &lost) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fx.suppliers[2].holds(&fx.id, &lost));
        fx.deps.sender.shutdown().await;
    }

    #[tokio::test]
    async fn test_rebuild_skipped_below_data_count_local() {
        let fx = fixture("4x4", PurgePolicy::WhenFullyRemote).await;
        send_all(&fx).await;
        fx.monitor.run_cycle().await;

        for (i, supplier) in fx.suppliers.iter().enumerate() {
            if i != 0 {
                supplier.drop_fragment(&fx.id, &FragmentName::data(0, i));
            }
            supplier.drop_fragment(&fx.id, &FragmentName::parity(0, i));
        }
        fx.deps
            .matrix
            .mark_remote(&fx.id, 0, FragmentKind::Data, 2, false)
            .unwrap();

        let report = fx.monitor.run_cycle().await;
        assert_eq!(fx.deps.matrix.block(&fx.id, 0).unwrap().local.count(), 1);
        assert_eq!(report.rebuilds, 0);
        assert_eq!(report.fragments_rebuilt, 0);
        assert!(fx.events.events_of_type("block-rebuilt").is_empty());
        fx.deps.sender.shutdown().await;
    }

    #[test]
    fn test_owed_and_unusable_counts() {
        let mut row = BlockRow {
            local: Presence::empty(2, 2),
            remote: Presence::full(2, 2),
        };
        row.remote.set(FragmentKind::Data, 0, false);
        row.local.set(FragmentKind::Parity, 0, true);
        let alive = [true, false];

        assert_eq!(owed(&row, &alive), 1);
        // Data 0 nowhere; Data 1 and Parity 1 only on a dead supplier.
        assert_eq!(unusable(&row, &alive), 3);
    }
}
