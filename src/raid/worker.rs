//! Raid Worker Pool
//!
//! A fixed pool of OS threads consuming a FIFO queue of make, read and
//! rebuild tasks. Each submission returns a [`RaidTask`] handle that resolves
//! to exactly one [`TaskResult`]. Tasks can be cancelled by id or by the
//! `(kind, path)` key that identifies the block they work on.
//!
//! ```text
//!   submit ──▶ [ FIFO queue ] ──▶ raid-worker-0 ─┐
//!                              ──▶ raid-worker-1 ─┼──▶ oneshot result
//!                              ──▶ raid-worker-N ─┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::tasks::{
    self, MakeOutcome, MakeRequest, ReadOutcome, ReadRequest, RebuildOutcome, RebuildRequest,
};
use crate::error::{Error, Result};
use crate::metrics::PipelineMetrics;

/// Identifier assigned at submission.
pub type TaskId = u64;

// =============================================================================
// Task Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Make,
    Read,
    Rebuild,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Make => "make",
            TaskKind::Read => "read",
            TaskKind::Rebuild => "rebuild",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work accepted by the pool.
#[derive(Debug, Clone)]
pub enum RaidRequest {
    Make(MakeRequest),
    Read(ReadRequest),
    Rebuild(RebuildRequest),
}

impl RaidRequest {
    pub fn kind(&self) -> TaskKind {
        match self {
            RaidRequest::Make(_) => TaskKind::Make,
            RaidRequest::Read(_) => TaskKind::Read,
            RaidRequest::Rebuild(_) => TaskKind::Rebuild,
        }
    }

    /// Path identifying the block this task works on.
    pub fn key_path(&self) -> &Path {
        match self {
            RaidRequest::Make(r) => &r.block_path,
            RaidRequest::Read(r) => &r.target_path,
            RaidRequest::Rebuild(r) => &r.dir,
        }
    }

    fn run(&self, cancel: &AtomicBool) -> Result<RaidOutput> {
        match self {
            RaidRequest::Make(r) => tasks::make_block(r, cancel).map(RaidOutput::Made),
            RaidRequest::Read(r) => tasks::read_block(r, cancel).map(RaidOutput::Read),
            RaidRequest::Rebuild(r) => tasks::rebuild_block(r, cancel).map(RaidOutput::Rebuilt),
        }
    }
}

/// Successful task output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaidOutput {
    Made(MakeOutcome),
    Read(ReadOutcome),
    Rebuilt(RebuildOutcome),
}

/// Terminal result of one task.
#[derive(Debug)]
pub enum TaskResult {
    Ok(RaidOutput),
    Failed(Error),
    Cancelled,
}

impl TaskResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, TaskResult::Ok(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskResult::Cancelled)
    }

    fn label(&self) -> &'static str {
        match self {
            TaskResult::Ok(_) => "ok",
            TaskResult::Failed(_) => "failed",
            TaskResult::Cancelled => "cancelled",
        }
    }

    /// Collapse into a `Result`, mapping cancellation to [`Error::Cancelled`].
    pub fn into_result(self) -> Result<RaidOutput> {
        match self {
            TaskResult::Ok(output) => Ok(output),
            TaskResult::Failed(e) => Err(e),
            TaskResult::Cancelled => Err(Error::Cancelled),
        }
    }

    pub fn into_made(self) -> Result<MakeOutcome> {
        match self.into_result()? {
            RaidOutput::Made(o) => Ok(o),
            other => Err(Error::Internal(format!("expected make output, got {:?}", other))),
        }
    }

    pub fn into_read(self) -> Result<ReadOutcome> {
        match self.into_result()? {
            RaidOutput::Read(o) => Ok(o),
            other => Err(Error::Internal(format!("expected read output, got {:?}", other))),
        }
    }

    pub fn into_rebuilt(self) -> Result<RebuildOutcome> {
        match self.into_result()? {
            RaidOutput::Rebuilt(o) => Ok(o),
            other => Err(Error::Internal(format!(
                "expected rebuild output, got {:?}",
                other
            ))),
        }
    }
}

/// Handle to a submitted task.
#[derive(Debug)]
pub struct RaidTask {
    pub id: TaskId,
    pub kind: TaskKind,
    cancel: Arc<AtomicBool>,
    rx: oneshot::Receiver<TaskResult>,
}

impl RaidTask {
    /// Request cancellation of this task.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Wait for the task's single result.
    pub async fn wait(self) -> TaskResult {
        self.rx
            .await
            .unwrap_or(TaskResult::Failed(Error::WorkerShutdown))
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct RaidWorkerConfig {
    /// Worker threads
    pub pool_size: usize,
}

impl Default for RaidWorkerConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            pool_size: (cpus / 2).max(1),
        }
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

struct Job {
    id: TaskId,
    request: RaidRequest,
    cancel: Arc<AtomicBool>,
    reply: oneshot::Sender<TaskResult>,
}

#[derive(Debug)]
struct JobEntry {
    kind: TaskKind,
    key_path: PathBuf,
    cancel: Arc<AtomicBool>,
}

struct PoolState {
    jobs: DashMap<TaskId, JobEntry>,
    queued: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    metrics: Arc<PipelineMetrics>,
}

/// Fixed-size pool executing raid tasks off the async runtime.
pub struct RaidWorker {
    config: RaidWorkerConfig,
    state: Arc<PoolState>,
    next_id: AtomicU64,
    sender: Mutex<Option<Sender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl RaidWorker {
    /// Start the pool.
    pub fn new(config: RaidWorkerConfig, metrics: Arc<PipelineMetrics>) -> Result<Arc<Self>> {
        if config.pool_size == 0 {
            return Err(Error::Config("raid pool size must be at least 1".to_string()));
        }

        let (tx, rx) = channel::unbounded::<Job>();
        let state = Arc::new(PoolState {
            jobs: DashMap::new(),
            queued: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            metrics,
        });

        let mut threads = Vec::with_capacity(config.pool_size);
        for i in 0..config.pool_size {
            let rx = rx.clone();
            let state = state.clone();
            let handle = std::thread::Builder::new()
                .name(format!("raid-worker-{}", i))
                .spawn(move || worker_loop(rx, state))?;
            threads.push(handle);
        }

        info!("Started raid worker pool with {} threads", config.pool_size);

        Ok(Arc::new(Self {
            config,
            state,
            next_id: AtomicU64::new(1),
            sender: Mutex::new(Some(tx)),
            threads: Mutex::new(threads),
        }))
    }

    /// Queue a task.
    pub fn submit(&self, request: RaidRequest) -> Result<RaidTask> {
        let sender = self.sender.lock().clone().ok_or(Error::WorkerShutdown)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let kind = request.kind();
        let cancel = Arc::new(AtomicBool::new(false));
        let (reply, rx) = oneshot::channel();

        self.state.jobs.insert(
            id,
            JobEntry {
                kind,
                key_path: request.key_path().to_path_buf(),
                cancel: cancel.clone(),
            },
        );
        self.state.queued.fetch_add(1, Ordering::SeqCst);

        let job = Job {
            id,
            request,
            cancel: cancel.clone(),
            reply,
        };
        if sender.send(job).is_err() {
            self.state.jobs.remove(&id);
            self.state.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::WorkerShutdown);
        }

        debug!("Queued raid {} task {}", kind, id);
        Ok(RaidTask {
            id,
            kind,
            cancel,
            rx,
        })
    }

    pub fn submit_make(&self, request: MakeRequest) -> Result<RaidTask> {
        self.submit(RaidRequest::Make(request))
    }

    pub fn submit_read(&self, request: ReadRequest) -> Result<RaidTask> {
        self.submit(RaidRequest::Read(request))
    }

    pub fn submit_rebuild(&self, request: RebuildRequest) -> Result<RaidTask> {
        self.submit(RaidRequest::Rebuild(request))
    }

    /// Cancel a task by id. Returns false if it already finished.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.state.jobs.get(&id) {
            Some(entry) => {
                entry.cancel.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Cancel every queued or running task of `kind` keyed on `path`.
    pub fn cancel_by_path(&self, kind: TaskKind, path: &Path) -> usize {
        let mut cancelled = 0;
        for entry in self.state.jobs.iter() {
            if entry.kind == kind && entry.key_path == path {
                entry.cancel.store(true, Ordering::Relaxed);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!("Cancelled {} raid {} tasks for {}", cancelled, kind, path.display());
        }
        cancelled
    }

    /// Tasks waiting for a thread.
    pub fn pending(&self) -> usize {
        self.state.queued.load(Ordering::SeqCst)
    }

    /// Tasks currently executing.
    pub fn running(&self) -> usize {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Highest number of concurrently executing tasks observed.
    pub fn peak_running(&self) -> usize {
        self.state.peak_running.load(Ordering::SeqCst)
    }

    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    /// Cancel everything, stop accepting work and join the threads.
    pub async fn shutdown(&self) {
        for entry in self.state.jobs.iter() {
            entry.cancel.store(true, Ordering::Relaxed);
        }
        self.sender.lock().take();

        let threads: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        if threads.is_empty() {
            return;
        }
        let joined = tokio::task::spawn_blocking(move || {
            for handle in threads {
                if handle.join().is_err() {
                    warn!("Raid worker thread panicked");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            warn!("Failed to join raid worker threads: {}", e);
        }
        info!("Raid worker pool stopped");
    }
}

impl Drop for RaidWorker {
    fn drop(&mut self) {
        for entry in self.state.jobs.iter() {
            entry.cancel.store(true, Ordering::Relaxed);
        }
        self.sender.lock().take();
    }
}

fn worker_loop(rx: Receiver<Job>, state: Arc<PoolState>) {
    while let Ok(job) = rx.recv() {
        state.queued.fetch_sub(1, Ordering::SeqCst);
        let kind = job.request.kind();

        let result = if job.cancel.load(Ordering::Relaxed) {
            TaskResult::Cancelled
        } else {
            let now = state.running.fetch_add(1, Ordering::SeqCst) + 1;
            state.peak_running.fetch_max(now, Ordering::SeqCst);
            state.metrics.raid_running.inc();

            let outcome = job.request.run(&job.cancel);

            state.metrics.raid_running.dec();
            state.running.fetch_sub(1, Ordering::SeqCst);

            match outcome {
                Ok(output) => TaskResult::Ok(output),
                Err(Error::Cancelled) => TaskResult::Cancelled,
                Err(_) if job.cancel.load(Ordering::Relaxed) => TaskResult::Cancelled,
                Err(e) => {
                    warn!("Raid {} task {} failed: {}", kind, job.id, e);
                    TaskResult::Failed(e)
                }
            }
        };

        state
            .metrics
            .raid_tasks
            .with_label_values(&[kind.as_str(), result.label()])
            .inc();
        if kind == TaskKind::Make && result.is_ok() {
            state.metrics.blocks_made.inc();
        }

        state.jobs.remove(&job.id);
        // Receiver may have been dropped by an aborted caller.
        let _ = job.reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block;
    use crate::domain::types::BackupId;
    use crate::ec::EccMap;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn pool(size: usize) -> Arc<RaidWorker> {
        RaidWorker::new(
            RaidWorkerConfig { pool_size: size },
            Arc::new(PipelineMetrics::new().unwrap()),
        )
        .unwrap()
    }

    fn make_request(tmp: &TempDir, name: &str, payload_len: usize, scheme: &str) -> MakeRequest {
        let source = tmp.path().join(name);
        std::fs::write(&source, block::frame(&vec![0x5A; payload_len])).unwrap();
        let backup_id: BackupId = "alice:0/F1".parse().unwrap();
        MakeRequest {
            block_path: source,
            ecc: EccMap::by_name(scheme).unwrap(),
            out_dir: tmp.path().join(name).with_extension("frags"),
            backup_id,
            block_number: 0,
        }
    }

    // =========================================================================
    // Submission Tests
    // =========================================================================

    #[tokio::test]
    async fn test_make_resolves_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = pool(2);
        let task = worker.submit_make(make_request(&tmp, "b0", 100, "4x4")).unwrap();
        assert_eq!(task.kind, TaskKind::Make);

        let made = task.wait().await.into_made().unwrap();
        assert_eq!(made.new_fragments(), 8);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_task_reports_error() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = pool(1);
        let mut request = make_request(&tmp, "b0", 10, "2x2");
        request.block_path = tmp.path().join("does-not-exist");
        let result = worker.submit_make(request).unwrap().wait().await;
        assert_matches!(result, TaskResult::Failed(Error::Io(_)));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = pool(1);

        let blocker = worker
            .submit_make(make_request(&tmp, "big", 8_000_000, "64x64"))
            .unwrap();
        let victim_req = make_request(&tmp, "small", 1_000_000, "64x64");
        let out_dir = victim_req.out_dir.clone();
        let victim = worker.submit_make(victim_req).unwrap();

        assert!(worker.cancel(victim.id));
        assert!(blocker.wait().await.is_ok());
        assert!(victim.wait().await.is_cancelled());
        assert!(!out_dir.exists());
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_by_path() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = pool(1);

        let blocker = worker
            .submit_make(make_request(&tmp, "big", 8_000_000, "64x64"))
            .unwrap();
        let req = make_request(&tmp, "keyed", 1_000, "4x4");
        let key = req.block_path.clone();
        let task = worker.submit_make(req).unwrap();

        assert_eq!(worker.cancel_by_path(TaskKind::Read, &key), 0);
        assert_eq!(worker.cancel_by_path(TaskKind::Make, &key), 1);
        assert!(task.wait().await.is_cancelled());
        blocker.wait().await;
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_size_bounds_concurrency() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = pool(2);
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                worker
                    .submit_make(make_request(&tmp, &format!("b{}", i), 200_000, "18x18"))
                    .unwrap()
            })
            .collect();
        for task in tasks {
            assert!(task.wait().await.is_ok());
        }
        assert!(worker.peak_running() <= 2);
        assert!(worker.peak_running() >= 1);
        assert_eq!(worker.running(), 0);
        assert_eq!(worker.pending(), 0);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = pool(1);
        worker.shutdown().await;
        assert_matches!(
            worker.submit_make(make_request(&tmp, "late", 10, "2x2")),
            Err(Error::WorkerShutdown)
        );
    }

    #[test]
    fn test_zero_pool_rejected() {
        let result = RaidWorker::new(
            RaidWorkerConfig { pool_size: 0 },
            Arc::new(PipelineMetrics::new().unwrap()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
