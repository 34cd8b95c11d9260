//! Restore Worker
//!
//! Reverse of the backup job. For block 0, 1, ... it makes enough fragments
//! local (fetching from alive suppliers when needed), reassembles the sealed
//! block with a raid `read`, decrypts it and writes the plaintext to the
//! consumer. The block whose header carries `is_last` ends the restore.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backup::{BackupCatalog, BackupState};
use crate::block::{self, Block, SealedBlock};
use crate::domain::events::PipelineEvent;
use crate::domain::ports::{BlockCipher, EventPublisher};
use crate::domain::types::BackupId;
use crate::ec::EccMap;
use crate::error::{Error, Result};
use crate::matrix::FragmentMatrix;
use crate::metrics::PipelineMetrics;
use crate::raid::{RaidWorker, ReadRequest};
use crate::supplier::{FetchScope, FragmentFetcher, SupplierRegistry};

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub fetch_timeout: Duration,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(60),
        }
    }
}

/// Services a restore works with.
#[derive(Clone)]
pub struct RestoreDeps {
    pub cipher: Arc<dyn BlockCipher>,
    pub raid: Arc<RaidWorker>,
    pub matrix: Arc<FragmentMatrix>,
    pub catalog: Arc<BackupCatalog>,
    pub registry: Arc<SupplierRegistry>,
    pub events: Arc<dyn EventPublisher>,
    pub metrics: Arc<PipelineMetrics>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Done { blocks: u64, bytes: u64 },
    Failed { block_number: u64, reason: String },
    Aborted,
}

impl RestoreOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, RestoreOutcome::Done { .. })
    }
}

enum Stop {
    Aborted,
    Failed(String),
}

impl From<Error> for Stop {
    fn from(e: Error) -> Self {
        Stop::Failed(e.to_string())
    }
}

impl From<std::io::Error> for Stop {
    fn from(e: std::io::Error) -> Self {
        Error::from(e).into()
    }
}

/// Control handle for a running restore.
#[derive(Debug)]
pub struct RestoreHandle {
    backup_id: BackupId,
    abort: CancellationToken,
    join: JoinHandle<Result<RestoreOutcome>>,
}

impl RestoreHandle {
    pub fn backup_id(&self) -> &BackupId {
        &self.backup_id
    }

    /// Cancel outstanding fetches and raid tasks; the consumer sees EOF.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Token that aborts the restore when cancelled; usable after `wait`
    /// takes the handle.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub async fn wait(self) -> Result<RestoreOutcome> {
        self.join.await.map_err(|e| {
            Error::Internal(format!("restore task for {} failed: {}", self.backup_id, e))
        })?
    }
}

pub struct RestoreWorker {
    backup_id: BackupId,
    config: RestoreConfig,
    deps: RestoreDeps,
    local_root: PathBuf,
    temp_dir: PathBuf,
    abort: CancellationToken,
}

impl RestoreWorker {
    pub fn new(
        backup_id: BackupId,
        config: RestoreConfig,
        deps: RestoreDeps,
        local_root: PathBuf,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            backup_id,
            config,
            deps,
            local_root,
            temp_dir,
            abort: CancellationToken::new(),
        }
    }

    /// Run the restore on the runtime, writing into `out`.
    pub fn spawn<W>(self, mut out: W) -> RestoreHandle
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let backup_id = self.backup_id.clone();
        let abort = self.abort.clone();
        RestoreHandle {
            backup_id,
            abort,
            join: tokio::spawn(async move { self.run(&mut out).await }),
        }
    }

    /// Restore every block into `out`, then shut `out` down.
    ///
    /// Returns `Err` only when the consumer cannot be written to or the
    /// backup is unknown.
    #[instrument(skip(self, out), fields(backup_id = %self.backup_id))]
    pub async fn run<W: AsyncWrite + Unpin>(self, out: &mut W) -> Result<RestoreOutcome> {
        let state = self
            .deps
            .catalog
            .get(&self.backup_id)
            .ok_or_else(|| Error::BackupNotFound(self.backup_id.to_string()))?;
        let ecc = EccMap::by_name(&state.ecc_scheme)?;
        if !state.is_done() {
            warn!("Restoring backup in state {}", state.status);
        }
        info!("Restore started with ecc {}", ecc);

        let fetcher = FragmentFetcher::new(
            self.deps.registry.clone(),
            self.deps.matrix.clone(),
            self.deps.metrics.clone(),
            self.config.fetch_timeout,
        );
        let mut block_number = 0u64;
        let mut bytes = 0u64;

        let outcome = loop {
            if let Some(total) = state.total_blocks {
                if block_number >= total {
                    break RestoreOutcome::Failed {
                        block_number,
                        reason: format!("no last block among {} blocks", total),
                    };
                }
            }
            let block = tokio::select! {
                _ = self.abort.cancelled() => Err(Stop::Aborted),
                block = self.restore_block(&state, &ecc, &fetcher, block_number) => block,
            };
            match block {
                Ok(block) => {
                    out.write_all(&block.data).await?;
                    bytes += block.data.len() as u64;
                    self.deps.metrics.bytes_restored.inc_by(block.data.len() as u64);
                    debug!(block_number, is_last = block.is_last, "Block restored");
                    if block.is_last {
                        break RestoreOutcome::Done {
                            blocks: block_number + 1,
                            bytes,
                        };
                    }
                    block_number += 1;
                }
                Err(Stop::Aborted) => break RestoreOutcome::Aborted,
                Err(Stop::Failed(reason)) => {
                    break RestoreOutcome::Failed {
                        block_number,
                        reason,
                    }
                }
            }
        };

        out.flush().await?;
        out.shutdown().await?;

        match &outcome {
            RestoreOutcome::Done { blocks, bytes } => {
                info!("Restore done: {} blocks, {} bytes", blocks, bytes);
                self.publish(PipelineEvent::restore_done(self.backup_id.clone(), *blocks))
                    .await;
            }
            RestoreOutcome::Failed {
                block_number,
                reason,
            } => {
                warn!(block_number, "Restore failed: {}", reason);
                self.publish(PipelineEvent::restore_failed(
                    self.backup_id.clone(),
                    *block_number,
                    reason.clone(),
                ))
                .await;
            }
            RestoreOutcome::Aborted => info!("Restore aborted"),
        }
        Ok(outcome)
    }

    async fn restore_block(
        &self,
        state: &BackupState,
        ecc: &EccMap,
        fetcher: &FragmentFetcher,
        block_number: u64,
    ) -> std::result::Result<Block, Stop> {
        let dir = self.backup_id.local_dir(&self.local_root);

        if !self.readable(ecc, block_number) {
            fetcher
                .fetch_block(&self.backup_id, &state.suppliers, block_number, FetchScope::Acked, &dir)
                .await?;
        }
        if !self.readable(ecc, block_number) {
            fetcher
                .fetch_block(&self.backup_id, &state.suppliers, block_number, FetchScope::All, &dir)
                .await?;
        }

        let target = self
            .temp_dir
            .join(format!("{}-{}.restore", self.backup_id.slug(), block_number));
        let request = ReadRequest {
            target_path: target.clone(),
            ecc: ecc.clone(),
            backup_id: self.backup_id.clone(),
            block_number,
            in_dir: dir.clone(),
        };

        let mut attempt = 1;
        loop {
            let task = self.deps.raid.submit_read(request.clone())?;
            let task_id = task.id;
            let result = tokio::select! {
                result = task.wait() => result,
                _ = self.abort.cancelled() => {
                    self.deps.raid.cancel(task_id);
                    return Err(Stop::Aborted);
                }
            };
            match result.into_read() {
                Ok(read) => {
                    debug!(
                        block_number,
                        recovered = read.recovered_data,
                        "Block reassembled"
                    );
                    break;
                }
                // Local copies can be purged between the fetch and the read.
                Err(Error::InsufficientFragments { .. }) if attempt == 1 => {
                    attempt += 1;
                    fetcher
                        .fetch_block(
                            &self.backup_id,
                            &state.suppliers,
                            block_number,
                            FetchScope::All,
                            &dir,
                        )
                        .await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let framed = tokio::fs::read(&target).await?;
        if let Err(e) = tokio::fs::remove_file(&target).await {
            warn!("Cannot remove {}: {}", target.display(), e);
        }
        let sealed = SealedBlock::from_bytes(block::unframe(&framed)?)?;
        let cipher = self.deps.cipher.clone();
        let block = tokio::task::spawn_blocking(move || cipher.open(&sealed))
            .await
            .map_err(|e| Stop::Failed(format!("decrypt task failed: {}", e)))??;

        if block.backup_id != self.backup_id || block.block_number != block_number {
            return Err(Stop::Failed(format!(
                "fragments of block {} hold {} block {}",
                block_number, block.backup_id, block.block_number
            )));
        }
        Ok(block)
    }

    fn readable(&self, ecc: &EccMap, block_number: u64) -> bool {
        self.deps
            .matrix
            .block(&self.backup_id, block_number)
            .is_some_and(|row| ecc.is_fixable(&row.local.data, &row.local.parity))
    }

    async fn publish(&self, event: PipelineEvent) {
        if let Err(e) = self.deps.events.publish(event).await {
            warn!("Failed to publish event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AesGcmBlockCipher, InMemoryEventCollector, InMemorySupplier};
    use crate::backup::{BackupDeps, BackupJob, BackupJobConfig};
    use crate::domain::ports::SupplierTransport;
    use crate::domain::types::{Fragment, FragmentName};
    use crate::pipe::block_pipe;
    use crate::raid::RaidWorkerConfig;
    use crate::supplier::SessionConfig;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        root: PathBuf,
        deps: RestoreDeps,
        events: Arc<InMemoryEventCollector>,
        suppliers: Vec<Arc<InMemorySupplier>>,
        id: BackupId,
    }

    async fn backed_up(input: &[u8], block_size: usize) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("local");
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let events = Arc::new(InMemoryEventCollector::new());
        let matrix = FragmentMatrix::in_memory();
        let catalog = Arc::new(BackupCatalog::in_memory());
        let registry = SupplierRegistry::new(SessionConfig::default(), events.clone(), metrics.clone());
        let raid = RaidWorker::new(RaidWorkerConfig { pool_size: 2 }, metrics.clone()).unwrap();
        let cipher: Arc<dyn BlockCipher> =
            Arc::new(AesGcmBlockCipher::new(&AesGcmBlockCipher::generate_key()));
        let ecc = EccMap::by_name("2x2").unwrap();

        let mut suppliers = Vec::new();
        for i in 0..2 {
            let supplier = Arc::new(InMemorySupplier::new(format!("s{}", i)));
            registry.add(supplier.clone()).unwrap();
            suppliers.push(supplier);
        }

        let id: BackupId = "alice:0/F1".parse().unwrap();
        catalog
            .create(BackupState::new(id.clone(), ecc.name(), registry.ids()))
            .unwrap();
        let (writer, reader) = block_pipe(input.len().max(1));
        writer.write(input).unwrap();
        writer.mark_finished();
        let job = BackupJob::new(
            id.clone(),
            BackupJobConfig {
                block_size,
                ecc,
                max_in_flight_blocks: 2,
                ..Default::default()
            },
            BackupDeps {
                cipher: cipher.clone(),
                raid: raid.clone(),
                matrix: matrix.clone(),
                catalog: catalog.clone(),
                events: events.clone(),
                metrics: metrics.clone(),
            },
            reader,
            id.local_dir(&root),
            tmp.path().join("tmp"),
        );
        assert!(job.run().await.is_done());

        Fixture {
            tmp,
            root,
            deps: RestoreDeps {
                cipher,
                raid,
                matrix,
                catalog,
                registry,
                events: events.clone(),
                metrics,
            },
            events,
            suppliers,
            id,
        }
    }

    fn worker(fx: &Fixture) -> RestoreWorker {
        RestoreWorker::new(
            fx.id.clone(),
            RestoreConfig::default(),
            fx.deps.clone(),
            fx.root.clone(),
            fx.tmp.path().join("restore-tmp"),
        )
    }

    /// Hand every local fragment to its supplier, then drop the local copy.
    async fn move_to_suppliers(fx: &Fixture) {
        let dir = fx.id.local_dir(&fx.root);
        let snapshot = fx.deps.matrix.snapshot(&fx.id).unwrap();
        for (n, row) in &snapshot.blocks {
            for name in row.local.names(*n) {
                let bytes = std::fs::read(name.path_in(&dir)).unwrap();
                fx.suppliers[name.index]
                    .store(Fragment::new(fx.id.clone(), name, bytes))
                    .await
                    .unwrap();
                fx.deps
                    .matrix
                    .mark_remote(&fx.id, *n, name.kind, name.index, true)
                    .unwrap();
                std::fs::remove_file(name.path_in(&dir)).unwrap();
                fx.deps
                    .matrix
                    .mark_local(&fx.id, *n, name.kind, name.index, false)
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_restore_from_local_fragments() {
        let input: Vec<u8> = (0..300u32).map(|i| (i * 7 % 251) as u8).collect();
        let fx = backed_up(&input, 128).await;

        let mut out = Vec::new();
        let outcome = worker(&fx).run(&mut out).await.unwrap();
        assert_eq!(outcome, RestoreOutcome::Done { blocks: 3, bytes: 300 });
        assert_eq!(out, input);
        assert_eq!(fx.events.events_of_type("restore-done").len(), 1);
    }

    #[tokio::test]
    async fn test_restore_fetches_from_suppliers() {
        let input = b"fragments held remotely".to_vec();
        let fx = backed_up(&input, 1024).await;
        move_to_suppliers(&fx).await;

        // One supplier gone: its data and parity are both missing.
        fx.suppliers[1].set_online(false);
        let mut out = Vec::new();
        let outcome = worker(&fx).run(&mut out).await.unwrap();
        assert!(outcome.is_done());
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn test_restore_fails_with_insufficient_fragments() {
        let fx = backed_up(b"doomed", 1024).await;
        move_to_suppliers(&fx).await;
        for supplier in &fx.suppliers {
            supplier.drop_fragment(&fx.id, &FragmentName::data(0, supplier_index(supplier)));
        }
        fx.suppliers[0].set_online(false);

        let mut out = Vec::new();
        let outcome = worker(&fx).run(&mut out).await.unwrap();
        assert_matches!(outcome, RestoreOutcome::Failed { block_number: 0, .. });
        assert!(out.is_empty());
        assert_eq!(fx.events.events_of_type("restore-failed").len(), 1);
    }

    fn supplier_index(supplier: &InMemorySupplier) -> usize {
        supplier.supplier_id().as_str()[1..].parse().unwrap()
    }

    #[tokio::test]
    async fn test_abort_while_fetching() {
        let fx = backed_up(b"slow suppliers", 1024).await;
        move_to_suppliers(&fx).await;
        for supplier in &fx.suppliers {
            supplier.set_latency(Duration::from_secs(30));
        }

        let (client, mut server) = tokio::io::duplex(1024);
        let handle = worker(&fx).spawn(client);
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert_eq!(handle.wait().await.unwrap(), RestoreOutcome::Aborted);
        let mut received = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut received)
            .await
            .unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_backup() {
        let fx = backed_up(b"x", 1024).await;
        let worker = RestoreWorker::new(
            "bob:0/F9".parse().unwrap(),
            RestoreConfig::default(),
            fx.deps.clone(),
            fx.root.clone(),
            fx.tmp.path().join("restore-tmp"),
        );
        let mut out = Vec::new();
        assert_matches!(worker.run(&mut out).await, Err(Error::BackupNotFound(_)));
    }
}
