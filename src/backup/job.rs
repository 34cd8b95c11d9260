//! Backup State Machine
//!
//! Pulls bytes from a [`PipeReader`], cuts them into blocks, seals each
//! block and hands it to the raid pool. Phases:
//!
//! ```text
//! AtStartup ──▶ Read ──▶ Encrypt ──▶ Raid ──▶ Read ... ──▶ Done
//!                 │          │         │
//!                 └──────────┴─────────┴──────────────────▶ Aborted
//! ```
//!
//! The job goes back to `Read` as soon as a `make` is submitted, so several
//! blocks can be in flight up to `max_in_flight_blocks`.
//!
//! A block is last only when it is shorter than the block size. An input
//! whose length is an exact multiple of the block size therefore ends with
//! an empty last block; empty input produces exactly one empty last block.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::catalog::{BackupCatalog, BackupStatus};
use crate::block::{self, Block};
use crate::config::DEFAULT_BLOCK_SIZE;
use crate::domain::events::PipelineEvent;
use crate::domain::ports::{BlockCipher, EventPublisher};
use crate::domain::types::BackupId;
use crate::ec::EccMap;
use crate::error::{Error, Result};
use crate::matrix::FragmentMatrix;
use crate::metrics::PipelineMetrics;
use crate::pipe::PipeReader;
use crate::raid::{MakeRequest, RaidOutput, RaidWorker, RaidWorkerConfig, TaskKind, TaskResult};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for one backup job
#[derive(Debug, Clone)]
pub struct BackupJobConfig {
    /// Plaintext bytes per block
    pub block_size: usize,

    /// Erasure code for every block of the backup
    pub ecc: EccMap,

    /// Blocks allowed in ENCRYPT or RAID at once
    pub max_in_flight_blocks: usize,

    /// Written into block headers
    pub creator_id: String,

    /// Attempts at writing a block temp file
    pub temp_write_attempts: u32,

    /// Attempts at making a block before the backup fails
    pub make_attempts: u32,
}

impl Default for BackupJobConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            ecc: EccMap::default(),
            max_in_flight_blocks: RaidWorkerConfig::default().pool_size,
            creator_id: "fragvault".to_string(),
            temp_write_attempts: 2,
            make_attempts: 2,
        }
    }
}

// =============================================================================
// Observable Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    AtStartup,
    Read,
    Encrypt,
    Raid,
    Done,
    Aborted,
}

/// Per-block result delivered to the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockResult {
    Made { fragments: usize },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReport {
    pub backup_id: BackupId,
    pub block_number: u64,
    pub is_last: bool,
    pub result: BlockResult,
}

/// Terminal result of a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Done { total_blocks: u64 },
    /// Stopped on request
    Aborted { reason: String },
    /// Stopped by a fatal error
    Failed { reason: String },
}

impl BackupOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, BackupOutcome::Done { .. })
    }
}

/// Services a backup job works with.
#[derive(Clone)]
pub struct BackupDeps {
    pub cipher: Arc<dyn BlockCipher>,
    pub raid: Arc<RaidWorker>,
    pub matrix: Arc<FragmentMatrix>,
    pub catalog: Arc<BackupCatalog>,
    pub events: Arc<dyn EventPublisher>,
    pub metrics: Arc<PipelineMetrics>,
}

// =============================================================================
// Handle
// =============================================================================

/// Control handle for a running backup.
#[derive(Debug)]
pub struct BackupHandle {
    backup_id: BackupId,
    abort: CancellationToken,
    phase: watch::Receiver<BackupPhase>,
    peak_in_flight: Arc<AtomicUsize>,
    join: JoinHandle<BackupOutcome>,
}

impl BackupHandle {
    pub fn backup_id(&self) -> &BackupId {
        &self.backup_id
    }

    /// Ask the job to stop; it cleans up and reports `Aborted`.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Token that aborts the job when cancelled; usable after `wait` takes
    /// the handle.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn phase(&self) -> BackupPhase {
        *self.phase.borrow()
    }

    /// Highest number of blocks observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Wait for the terminal outcome.
    pub async fn wait(self) -> Result<BackupOutcome> {
        self.join
            .await
            .map_err(|e| Error::Internal(format!("backup task for {} failed: {}", self.backup_id, e)))
    }
}

// =============================================================================
// Job
// =============================================================================

enum Stop {
    Requested,
    Failed(String),
}

struct InFlight {
    block_number: u64,
    is_last: bool,
    request: MakeRequest,
    attempt: u32,
}

struct Progress {
    in_flight: JoinSet<(InFlight, TaskResult)>,
    temp_paths: HashMap<u64, PathBuf>,
}

impl Progress {
    fn new() -> Self {
        Self {
            in_flight: JoinSet::new(),
            temp_paths: HashMap::new(),
        }
    }
}

/// Block-producing state machine for one backup.
pub struct BackupJob {
    backup_id: BackupId,
    source_path: Option<String>,
    config: BackupJobConfig,
    deps: BackupDeps,
    reader: PipeReader,
    out_dir: PathBuf,
    temp_dir: PathBuf,
    abort: CancellationToken,
    reports: Option<mpsc::UnboundedSender<BlockReport>>,
    phase: watch::Sender<BackupPhase>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl BackupJob {
    /// `out_dir` receives fragments, `temp_dir` the sealed block files.
    pub fn new(
        backup_id: BackupId,
        config: BackupJobConfig,
        deps: BackupDeps,
        reader: PipeReader,
        out_dir: PathBuf,
        temp_dir: PathBuf,
    ) -> Self {
        let (phase, _) = watch::channel(BackupPhase::AtStartup);
        Self {
            backup_id,
            source_path: None,
            config,
            deps,
            reader,
            out_dir,
            temp_dir,
            abort: CancellationToken::new(),
            reports: None,
            phase,
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_source_path(mut self, source_path: impl Into<String>) -> Self {
        self.source_path = Some(source_path.into());
        self
    }

    /// Deliver a [`BlockReport`] for every finished block.
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<BlockReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Run the job on the runtime.
    pub fn spawn(self) -> BackupHandle {
        let backup_id = self.backup_id.clone();
        let abort = self.abort.clone();
        let phase = self.phase.subscribe();
        let peak_in_flight = self.peak_in_flight.clone();
        BackupHandle {
            backup_id,
            abort,
            phase,
            peak_in_flight,
            join: tokio::spawn(self.run()),
        }
    }

    /// Drive the backup to completion.
    #[instrument(skip(self), fields(backup_id = %self.backup_id))]
    pub async fn run(self) -> BackupOutcome {
        self.set_phase(BackupPhase::AtStartup);
        info!(
            "Backup started with ecc {} and block size {}",
            self.config.ecc, self.config.block_size
        );
        self.publish(PipelineEvent::backup_started(
            self.backup_id.clone(),
            self.source_path.clone(),
        ))
        .await;

        let mut progress = Progress::new();
        let outcome = match self.drive(&mut progress).await {
            Ok(total_blocks) => BackupOutcome::Done { total_blocks },
            Err(stop) => {
                self.clean_up(&mut progress).await;
                match stop {
                    Stop::Requested => BackupOutcome::Aborted {
                        reason: "abort requested".to_string(),
                    },
                    Stop::Failed(reason) => BackupOutcome::Failed { reason },
                }
            }
        };

        self.finish(&outcome).await;
        outcome
    }

    async fn drive(&self, progress: &mut Progress) -> std::result::Result<u64, Stop> {
        let ecc = &self.config.ecc;
        self.deps
            .matrix
            .register_backup(&self.backup_id, ecc.data_count(), ecc.parity_count())
            .map_err(|e| Stop::Failed(e.to_string()))?;

        let block_size = self.config.block_size;
        let mut buffer = BytesMut::new();
        let mut eof = false;
        let mut next_block = 0u64;
        let mut last_submitted = false;
        self.set_phase(BackupPhase::Read);

        loop {
            if self.abort.is_cancelled() {
                return Err(Stop::Requested);
            }
            if last_submitted && progress.in_flight.is_empty() {
                return Ok(next_block);
            }

            let block_ready = !last_submitted && (buffer.len() >= block_size || eof);
            if block_ready && progress.in_flight.len() < self.config.max_in_flight_blocks {
                let chunk = buffer.split_to(buffer.len().min(block_size));
                let is_last = eof && buffer.is_empty() && chunk.len() < block_size;
                self.produce_block(progress, next_block, chunk.to_vec(), is_last)
                    .await?;
                next_block += 1;
                last_submitted = is_last;
                self.set_phase(BackupPhase::Read);
                continue;
            }

            let want_read = !eof && buffer.len() < block_size;
            tokio::select! {
                _ = self.abort.cancelled() => return Err(Stop::Requested),

                read = self.reader.read(block_size - buffer.len()), if want_read => match read {
                    Ok(bytes) if bytes.is_empty() => {
                        if self.abort.is_cancelled() {
                            return Err(Stop::Requested);
                        }
                        if !self.reader.finished_cleanly() {
                            return Err(Stop::Failed(
                                "producer closed the stream before finishing".to_string(),
                            ));
                        }
                        eof = true;
                    }
                    Ok(bytes) => buffer.extend_from_slice(&bytes),
                    Err(e) => return Err(Stop::Failed(format!("pipe read failed: {}", e))),
                },

                Some(joined) = progress.in_flight.join_next(), if !progress.in_flight.is_empty() => {
                    self.complete_block(progress, joined).await?;
                }
            }
        }
    }

    /// ENCRYPT then RAID for one block.
    async fn produce_block(
        &self,
        progress: &mut Progress,
        block_number: u64,
        data: Vec<u8>,
        is_last: bool,
    ) -> std::result::Result<(), Stop> {
        self.set_phase(BackupPhase::Encrypt);
        let in_flight = progress.in_flight.len() + 1;
        self.peak_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        self.deps.metrics.bytes_backed_up.inc_by(data.len() as u64);

        let block = Block::new(
            self.config.creator_id.clone(),
            self.backup_id.clone(),
            block_number,
            is_last,
            data,
        );
        let cipher = self.deps.cipher.clone();
        let sealed = tokio::task::spawn_blocking(move || cipher.seal(&block))
            .await
            .map_err(|e| Stop::Failed(format!("encrypt task failed: {}", e)))?
            .map_err(|e| {
                error!(block_number, "Block encryption failed: {}", e);
                Stop::Failed(format!("block {} encryption failed: {}", block_number, e))
            })?;

        self.set_phase(BackupPhase::Raid);
        let temp_path = self
            .temp_dir
            .join(format!("{}-{}.block", self.backup_id.slug(), block_number));
        self.write_temp(&temp_path, &block::frame(&sealed.to_bytes()))
            .await
            .map_err(|e| {
                error!(block_number, "Cannot write block temp file: {}", e);
                Stop::Failed(format!("block {} temp file: {}", block_number, e))
            })?;
        progress.temp_paths.insert(block_number, temp_path.clone());

        let request = MakeRequest {
            block_path: temp_path,
            ecc: self.config.ecc.clone(),
            backup_id: self.backup_id.clone(),
            block_number,
            out_dir: self.out_dir.clone(),
        };
        self.submit(
            progress,
            InFlight {
                block_number,
                is_last,
                request,
                attempt: 1,
            },
        )?;
        debug!(block_number, is_last, "block-raid-started");
        Ok(())
    }

    async fn write_temp(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut attempt = 1;
        loop {
            let result = async {
                tokio::fs::create_dir_all(&self.temp_dir).await?;
                tokio::fs::write(path, bytes).await
            }
            .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.temp_write_attempts => {
                    warn!("Retrying temp write of {}: {}", path.display(), e);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn submit(&self, progress: &mut Progress, job: InFlight) -> std::result::Result<(), Stop> {
        let task = self
            .deps
            .raid
            .submit_make(job.request.clone())
            .map_err(|e| Stop::Failed(format!("cannot submit make: {}", e)))?;
        progress.in_flight.spawn(async move {
            let result = task.wait().await;
            (job, result)
        });
        Ok(())
    }

    async fn complete_block(
        &self,
        progress: &mut Progress,
        joined: std::result::Result<(InFlight, TaskResult), JoinError>,
    ) -> std::result::Result<(), Stop> {
        let (mut job, result) =
            joined.map_err(|e| Stop::Failed(format!("raid wait failed: {}", e)))?;
        let block_number = job.block_number;

        match result {
            TaskResult::Ok(RaidOutput::Made(made)) => {
                self.remove_temp(progress, block_number).await;
                self.deps
                    .matrix
                    .mark_block_local(&self.backup_id, block_number)
                    .map_err(|e| Stop::Failed(e.to_string()))?;
                debug!(block_number, fragments = made.new_fragments(), "block-raid-done");
                self.report(block_number, job.is_last, BlockResult::Made {
                    fragments: made.new_fragments(),
                });
                Ok(())
            }
            TaskResult::Ok(other) => Err(Stop::Failed(format!(
                "unexpected raid output for block {}: {:?}",
                block_number, other
            ))),
            TaskResult::Failed(e) if job.attempt < self.config.make_attempts => {
                warn!(block_number, "Make failed, retrying: {}", e);
                job.attempt += 1;
                self.submit(progress, job)
            }
            TaskResult::Failed(e) => {
                error!(block_number, "Make failed: {}", e);
                let reason = e.to_string();
                self.publish(PipelineEvent::raid_make_failed(
                    self.backup_id.clone(),
                    block_number,
                    reason.clone(),
                ))
                .await;
                self.report(block_number, job.is_last, BlockResult::Failed {
                    reason: reason.clone(),
                });
                Err(Stop::Failed(format!("block {} make failed: {}", block_number, reason)))
            }
            TaskResult::Cancelled if self.abort.is_cancelled() => Err(Stop::Requested),
            TaskResult::Cancelled => Err(Stop::Failed(format!(
                "make for block {} was cancelled",
                block_number
            ))),
        }
    }

    async fn remove_temp(&self, progress: &mut Progress, block_number: u64) {
        if let Some(path) = progress.temp_paths.remove(&block_number) {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Cannot remove temp file {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Abort path: close the pipe, cancel outstanding makes and drop temp files.
    async fn clean_up(&self, progress: &mut Progress) {
        self.reader.close();
        for path in progress.temp_paths.values() {
            self.deps.raid.cancel_by_path(TaskKind::Make, path);
        }
        while let Some(joined) = progress.in_flight.join_next().await {
            // A make that finished before the cancel still left its fragments.
            if let Ok((job, TaskResult::Ok(RaidOutput::Made(_)))) = joined {
                if let Err(e) = self
                    .deps
                    .matrix
                    .mark_block_local(&self.backup_id, job.block_number)
                {
                    warn!("Cannot record block {}: {}", job.block_number, e);
                }
            }
        }
        let blocks: Vec<u64> = progress.temp_paths.keys().copied().collect();
        for block_number in blocks {
            self.remove_temp(progress, block_number).await;
        }
    }

    async fn finish(&self, outcome: &BackupOutcome) {
        let catalog = &self.deps.catalog;
        let (update, event) = match outcome {
            BackupOutcome::Done { total_blocks } => {
                info!("Backup done with {} blocks", total_blocks);
                self.set_phase(BackupPhase::Done);
                (
                    catalog.mark_done(&self.backup_id, *total_blocks).map(|_| ()),
                    PipelineEvent::backup_done(
                        self.backup_id.clone(),
                        self.source_path.clone(),
                        *total_blocks,
                    ),
                )
            }
            BackupOutcome::Aborted { reason } | BackupOutcome::Failed { reason } => {
                let status = if matches!(outcome, BackupOutcome::Aborted { .. }) {
                    BackupStatus::Aborted
                } else {
                    BackupStatus::Failed
                };
                warn!("Backup {}: {}", status, reason);
                self.set_phase(BackupPhase::Aborted);
                (
                    catalog.set_status(&self.backup_id, status).map(|_| ()),
                    PipelineEvent::backup_aborted(
                        self.backup_id.clone(),
                        self.source_path.clone(),
                        reason.clone(),
                    ),
                )
            }
        };
        if let Err(e) = update {
            warn!("Cannot update catalog for {}: {}", self.backup_id, e);
        }
        self.publish(event).await;
    }

    fn set_phase(&self, phase: BackupPhase) {
        self.phase.send_replace(phase);
    }

    fn report(&self, block_number: u64, is_last: bool, result: BlockResult) {
        if let Some(reports) = &self.reports {
            let _ = reports.send(BlockReport {
                backup_id: self.backup_id.clone(),
                block_number,
                is_last,
                result,
            });
        }
    }

    async fn publish(&self, event: PipelineEvent) {
        if let Err(e) = self.deps.events.publish(event).await {
            warn!("Failed to publish event: {}", e);
        }
    }
}
