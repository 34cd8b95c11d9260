//! Pipeline Integration Tests
//!
//! Backup, send, purge, supplier loss and restore through the public
//! [`Pipeline`] API with in-memory suppliers.

use std::sync::Arc;
use std::time::Duration;

use fragvault::adapters::{AesGcmBlockCipher, InMemoryEventCollector, InMemorySupplier};
use fragvault::backup::{BackupOutcome, BackupStatus};
use fragvault::block::{self, SealedBlock};
use fragvault::config::PurgePolicy;
use fragvault::domain::SupplierTransport;
use fragvault::metrics::PipelineMetrics;
use fragvault::raid::{RaidWorker, RaidWorkerConfig, ReadRequest};
use fragvault::restore::RestoreOutcome;
use fragvault::{BackupId, EccMap, Pipeline, PipelineConfig};
use tempfile::TempDir;

struct Harness {
    _tmp: TempDir,
    pipeline: Arc<Pipeline>,
    events: Arc<InMemoryEventCollector>,
    suppliers: Vec<Arc<InMemorySupplier>>,
}

impl Harness {
    fn new(scheme: &str, block_size: usize, purge: PurgePolicy) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            block_size,
            ecc_scheme: scheme.to_string(),
            raid_pool_size: Some(2),
            local_purge_policy: purge,
            monitor_interval_secs: 3600,
            matrix_flush_interval_ms: 10,
            ..Default::default()
        };
        let events = Arc::new(InMemoryEventCollector::new());
        let cipher = Arc::new(AesGcmBlockCipher::new(&AesGcmBlockCipher::generate_key()));
        let pipeline = Pipeline::open(config, tmp.path(), cipher, events.clone()).unwrap();

        let count = EccMap::by_name(scheme).unwrap().supplier_count();
        let suppliers: Vec<_> = (0..count)
            .map(|i| Arc::new(InMemorySupplier::new(format!("supplier-{:02}", i))))
            .collect();
        for supplier in &suppliers {
            pipeline.add_supplier(supplier.clone()).unwrap();
        }
        pipeline.start();
        Self {
            _tmp: tmp,
            pipeline,
            events,
            suppliers,
        }
    }

    async fn backup(&self, id: &BackupId, input: &[u8]) -> BackupOutcome {
        let (writer, handle) = self.pipeline.start_backup(id.clone()).unwrap();
        let input = input.to_vec();
        tokio::task::spawn_blocking(move || {
            writer.write(&input).unwrap();
            writer.mark_finished();
        });
        let outcome = handle.wait().await.unwrap();
        tokio::time::timeout(Duration::from_secs(30), self.pipeline.flush_sends())
            .await
            .unwrap();
        outcome
    }

    async fn restore(&self, id: &BackupId) -> (RestoreOutcome, Vec<u8>) {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let handle = self.pipeline.restore(id.clone(), client).unwrap();
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut out)
            .await
            .unwrap();
        (handle.wait().await.unwrap(), out)
    }

    /// Take the first `count` suppliers offline.
    async fn kill(&self, count: usize) {
        for supplier in &self.suppliers[..count] {
            supplier.set_online(false);
            self.pipeline
                .registry()
                .disconnect(supplier.supplier_id())
                .await;
        }
    }

    async fn shutdown(self) {
        self.pipeline.shutdown().await;
    }
}

fn id(version: &str) -> BackupId {
    format!("alice:home/docs/{}", version).parse().unwrap()
}

// =============================================================================
// Round Trips
// =============================================================================

#[tokio::test]
async fn test_tiny_input_round_trip() {
    let fx = Harness::new("18x18", 1024, PurgePolicy::Never);
    let input: Vec<u8> = (0..10).map(|_| rand::random::<u8>()).collect();

    assert!(fx.backup(&id("v1"), &input).await.is_done());
    let summary = fx.pipeline.backup(&id("v1")).unwrap();
    assert_eq!(summary.blocks, 1);
    assert_eq!(summary.local_fragments, 36);
    assert_eq!(summary.remote_fragments, 36);

    let (outcome, out) = fx.restore(&id("v1")).await;
    assert_eq!(outcome, RestoreOutcome::Done { blocks: 1, bytes: 10 });
    assert_eq!(out, input);
    assert_eq!(fx.events.events_of_type("restore-done").len(), 1);
    fx.shutdown().await;
}

#[tokio::test]
async fn test_empty_input_single_empty_block() {
    let fx = Harness::new("4x4", 64, PurgePolicy::Never);
    assert_eq!(
        fx.backup(&id("empty"), b"").await,
        BackupOutcome::Done { total_blocks: 1 }
    );

    let (outcome, out) = fx.restore(&id("empty")).await;
    assert_eq!(outcome, RestoreOutcome::Done { blocks: 1, bytes: 0 });
    assert!(out.is_empty());
    fx.shutdown().await;
}

#[tokio::test]
async fn test_exact_multiple_gets_trailing_empty_last_block() {
    let fx = Harness::new("4x4", 64, PurgePolicy::Never);
    let input: Vec<u8> = (0..128u8).collect();
    assert_eq!(
        fx.backup(&id("exact"), &input).await,
        BackupOutcome::Done { total_blocks: 3 }
    );

    let tmp = tempfile::tempdir().unwrap();
    let raid = RaidWorker::new(
        RaidWorkerConfig { pool_size: 1 },
        Arc::new(PipelineMetrics::new().unwrap()),
    )
    .unwrap();
    let mut headers = Vec::new();
    for block_number in 0..3 {
        let target = tmp.path().join(format!("block-{}", block_number));
        raid.submit_read(ReadRequest {
            target_path: target.clone(),
            ecc: EccMap::by_name("4x4").unwrap(),
            backup_id: id("exact"),
            block_number,
            in_dir: id("exact").local_dir(fx.pipeline.local_root()),
        })
        .unwrap()
        .wait()
        .await
        .into_read()
        .unwrap();
        let framed = std::fs::read(&target).unwrap();
        headers.push(
            SealedBlock::from_bytes(block::unframe(&framed).unwrap())
                .unwrap()
                .header,
        );
    }
    assert_eq!(
        headers.iter().map(|h| (h.is_last, h.length)).collect::<Vec<_>>(),
        vec![(false, 64), (false, 64), (true, 0)]
    );

    let (_, out) = fx.restore(&id("exact")).await;
    assert_eq!(out, input);
    raid.shutdown().await;
    fx.shutdown().await;
}

// =============================================================================
// Supplier Loss After Purge
// =============================================================================

#[tokio::test]
async fn test_five_dead_suppliers_after_purge() {
    let fx = Harness::new("18x18", 256, PurgePolicy::WhenFullyRemote);
    let input: Vec<u8> = (0..1000u32).map(|i| (i * 31 % 256) as u8).collect();
    assert!(fx.backup(&id("v1"), &input).await.is_done());

    fx.pipeline.run_monitor_cycle().await;
    let summary = fx.pipeline.backup(&id("v1")).unwrap();
    assert_eq!(summary.local_fragments, 0);
    assert_eq!(summary.fully_remote_blocks, summary.blocks);

    fx.kill(5).await;
    let (outcome, out) = fx.restore(&id("v1")).await;
    assert!(outcome.is_done());
    assert_eq!(out, input);
    fx.shutdown().await;
}

#[tokio::test]
async fn test_fourteen_dead_suppliers_at_risk() {
    let fx = Harness::new("18x18", 1024, PurgePolicy::WhenFullyRemote);
    assert!(fx.backup(&id("v1"), b"lost to the void").await.is_done());
    fx.pipeline.run_monitor_cycle().await;
    assert_eq!(fx.pipeline.backup(&id("v1")).unwrap().local_fragments, 0);

    fx.kill(14).await;
    let report = fx.pipeline.run_monitor_cycle().await;
    assert_eq!(report.newly_at_risk, 1);
    let state = fx.pipeline.catalog().get(&id("v1")).unwrap();
    assert!(state.at_risk_blocks.contains(&0));
    assert!(!fx.events.events_of_type("block-at-risk").is_empty());

    let (outcome, out) = fx.restore(&id("v1")).await;
    assert!(matches!(outcome, RestoreOutcome::Failed { block_number: 0, .. }));
    assert!(out.is_empty());
    fx.shutdown().await;
}

#[tokio::test]
async fn test_sixty_four_with_ten_dead_suppliers() {
    let fx = Harness::new("64x64", 4096, PurgePolicy::WhenFullyRemote);
    let input: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();
    assert!(fx.backup(&id("big"), &input).await.is_done());
    fx.pipeline.run_monitor_cycle().await;

    fx.kill(10).await;
    let (outcome, out) = fx.restore(&id("big")).await;
    assert!(outcome.is_done());
    assert_eq!(out, input);
    fx.shutdown().await;
}

// =============================================================================
// Abort
// =============================================================================

#[tokio::test]
async fn test_abort_marks_backup_aborted() {
    let fx = Harness::new("2x2", 64, PurgePolicy::Never);
    let (writer, handle) = fx.pipeline.start_backup(id("aborted")).unwrap();
    writer.write(b"partial").unwrap();
    handle.abort();

    assert!(matches!(
        handle.wait().await.unwrap(),
        BackupOutcome::Aborted { .. }
    ));
    assert_eq!(
        fx.pipeline.catalog().get(&id("aborted")).unwrap().status,
        BackupStatus::Aborted
    );
    assert!(matches!(
        writer.write(b"more"),
        Err(fragvault::Error::PipeClosed)
    ));
    fx.shutdown().await;
}
