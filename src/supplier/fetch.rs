//! Fetching fragments back from suppliers into the local fragment tree.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::SupplierRegistry;
use crate::domain::ports::FetchReply;
use crate::domain::types::{BackupId, FragmentKind, FragmentName, Presence, SupplierId};
use crate::error::{Error, Result};
use crate::matrix::FragmentMatrix;
use crate::metrics::PipelineMetrics;

/// Which fragments to ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchScope {
    /// Only fragments the supplier acknowledged
    Acked,
    /// Every fragment the supplier's position should hold
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    /// Written locally after verification
    pub fetched: usize,
    /// Acknowledged earlier but no longer held by the supplier
    pub lost: usize,
    /// Corrupt, unreachable or timed out
    pub failed: usize,
}

impl FetchSummary {
    fn merge(&mut self, other: FetchSummary) {
        self.fetched += other.fetched;
        self.lost += other.lost;
        self.failed += other.failed;
    }
}

/// Pulls missing local fragments of a block from alive suppliers.
#[derive(Clone)]
pub struct FragmentFetcher {
    registry: Arc<SupplierRegistry>,
    matrix: Arc<FragmentMatrix>,
    metrics: Arc<PipelineMetrics>,
    timeout: Duration,
}

impl FragmentFetcher {
    pub fn new(
        registry: Arc<SupplierRegistry>,
        matrix: Arc<FragmentMatrix>,
        metrics: Arc<PipelineMetrics>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            matrix,
            metrics,
            timeout,
        }
    }

    /// Fetch every fragment of `block_number` that is not local into `dir`.
    ///
    /// Supplier at position `i` is asked for `Data i` and `Parity i`.
    /// Fragments are verified before they are written and marked local.
    pub async fn fetch_block(
        &self,
        backup_id: &BackupId,
        suppliers: &[SupplierId],
        block_number: u64,
        scope: FetchScope,
        dir: &Path,
    ) -> Result<FetchSummary> {
        let row = self.matrix.block(backup_id, block_number);
        let (local, remote) = match &row {
            Some(row) => (Some(&row.local), Some(&row.remote)),
            None => (None, None),
        };
        let held = |p: Option<&Presence>, kind, i| p.is_some_and(|p| p.get(kind, i));

        let mut requests = JoinSet::new();
        for (index, supplier) in suppliers.iter().enumerate() {
            if !self.registry.is_available(supplier) {
                continue;
            }
            let Some(transport) = self.registry.transport(supplier) else {
                continue;
            };
            for kind in [FragmentKind::Data, FragmentKind::Parity] {
                let acked = held(remote, kind, index);
                if held(local, kind, index) || (scope == FetchScope::Acked && !acked) {
                    continue;
                }
                let name = FragmentName::new(block_number, index, kind);
                let transport = transport.clone();
                let backup_id = backup_id.clone();
                let supplier = supplier.clone();
                let timeout = self.timeout;
                requests.spawn(async move {
                    let reply = tokio::time::timeout(timeout, transport.fetch(&backup_id, &name))
                        .await
                        .unwrap_or_else(|_| {
                            Err(Error::SendTimeout {
                                supplier: supplier.to_string(),
                                operation: format!("fetch {}", name),
                            })
                        });
                    (supplier, name, acked, reply)
                });
            }
        }

        let mut summary = FetchSummary::default();
        while let Some(joined) = requests.join_next().await {
            let (supplier, name, acked, reply) =
                joined.map_err(|e| Error::Internal(format!("fetch task failed: {}", e)))?;
            summary.merge(
                self.accept(backup_id, &supplier, name, acked, reply, dir)
                    .await?,
            );
        }
        if summary.fetched > 0 || summary.lost > 0 {
            debug!(
                block_number,
                fetched = summary.fetched,
                lost = summary.lost,
                "Fetched fragments for {}",
                backup_id
            );
        }
        Ok(summary)
    }

    async fn accept(
        &self,
        backup_id: &BackupId,
        supplier: &SupplierId,
        name: FragmentName,
        acked: bool,
        reply: Result<FetchReply>,
        dir: &Path,
    ) -> Result<FetchSummary> {
        let mut summary = FetchSummary::default();
        match reply {
            Ok(FetchReply::Data(fragment)) => {
                self.registry.record_ack(supplier).await;
                if fragment.name != name || fragment.backup_id != *backup_id {
                    warn!(supplier = %supplier, "Asked for {} but got {}", name, fragment.name);
                    summary.failed += 1;
                    return Ok(summary);
                }
                match fragment.write_verified(dir).await {
                    Ok(_) => {
                        self.matrix.mark_local(
                            backup_id,
                            name.block_number,
                            name.kind,
                            name.index,
                            true,
                        )?;
                        self.metrics.fragments_fetched.inc();
                        summary.fetched += 1;
                    }
                    Err(e @ Error::ChecksumMismatch { .. }) => {
                        warn!(supplier = %supplier, "Discarding fetched fragment: {}", e);
                        self.forget_remote(backup_id, name, acked)?;
                        summary.failed += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(FetchReply::NotFound) => {
                self.registry.record_ack(supplier).await;
                if acked {
                    warn!(supplier = %supplier, "Supplier lost {}/{}", backup_id, name);
                    self.forget_remote(backup_id, name, acked)?;
                    summary.lost += 1;
                }
            }
            Err(e) => {
                self.registry.record_failure(supplier, &e).await;
                summary.failed += 1;
            }
        }
        Ok(summary)
    }

    fn forget_remote(&self, backup_id: &BackupId, name: FragmentName, acked: bool) -> Result<()> {
        if acked {
            self.matrix.mark_remote(
                backup_id,
                name.block_number,
                name.kind,
                name.index,
                false,
            )?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FragmentFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentFetcher")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, InMemorySupplier};
    use crate::domain::ports::SupplierTransport;
    use crate::domain::types::Fragment;
    use crate::supplier::SessionConfig;

    struct Fixture {
        _tmp: tempfile::TempDir,
        dir: std::path::PathBuf,
        matrix: Arc<FragmentMatrix>,
        suppliers: Vec<Arc<InMemorySupplier>>,
        ids: Vec<SupplierId>,
        fetcher: FragmentFetcher,
        id: BackupId,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("backup");
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let matrix = FragmentMatrix::in_memory();
        let registry = SupplierRegistry::new(
            SessionConfig::default(),
            Arc::new(InMemoryEventCollector::new()),
            metrics.clone(),
        );
        let id: BackupId = "alice:0/F1".parse().unwrap();
        matrix.register_backup(&id, 2, 2).unwrap();

        let mut suppliers = Vec::new();
        for i in 0..2 {
            let supplier = Arc::new(InMemorySupplier::new(format!("s{}", i)));
            for name in [FragmentName::data(0, i), FragmentName::parity(0, i)] {
                supplier
                    .store(Fragment::new(id.clone(), name, name.to_string().into_bytes()))
                    .await
                    .unwrap();
                matrix
                    .mark_remote(&id, 0, name.kind, name.index, true)
                    .unwrap();
            }
            registry.add(supplier.clone()).unwrap();
            suppliers.push(supplier);
        }
        let ids = registry.ids();
        let fetcher = FragmentFetcher::new(registry, matrix.clone(), metrics, Duration::from_secs(5));
        Fixture {
            _tmp: tmp,
            dir,
            matrix,
            suppliers,
            ids,
            fetcher,
            id,
        }
    }

    #[tokio::test]
    async fn test_fetch_marks_local() {
        let fx = fixture().await;
        let summary = fx
            .fetcher
            .fetch_block(&fx.id, &fx.ids, 0, FetchScope::Acked, &fx.dir)
            .await
            .unwrap();
        assert_eq!(summary.fetched, 4);
        assert!(fx.matrix.block(&fx.id, 0).unwrap().local.is_full());
        assert_eq!(
            std::fs::read(FragmentName::parity(0, 1).path_in(&fx.dir)).unwrap(),
            b"0-1-Parity"
        );
    }

    #[tokio::test]
    async fn test_lost_and_corrupt_fragments_clear_remote() {
        let fx = fixture().await;
        fx.suppliers[0].drop_fragment(&fx.id, &FragmentName::data(0, 0));
        fx.suppliers[1].corrupt(&fx.id, &FragmentName::parity(0, 1));

        let summary = fx
            .fetcher
            .fetch_block(&fx.id, &fx.ids, 0, FetchScope::Acked, &fx.dir)
            .await
            .unwrap();
        assert_eq!(summary, FetchSummary { fetched: 2, lost: 1, failed: 1 });

        let row = fx.matrix.block(&fx.id, 0).unwrap();
        assert!(!row.remote.get(FragmentKind::Data, 0));
        assert!(!row.remote.get(FragmentKind::Parity, 1));
        assert!(!FragmentName::parity(0, 1).path_in(&fx.dir).exists());
    }

    #[tokio::test]
    async fn test_offline_supplier_not_asked() {
        let fx = fixture().await;
        fx.suppliers[1].set_online(false);
        fx.fetcher.registry.disconnect(&fx.ids[1]).await;

        let summary = fx
            .fetcher
            .fetch_block(&fx.id, &fx.ids, 0, FetchScope::All, &fx.dir)
            .await
            .unwrap();
        assert_eq!(summary, FetchSummary { fetched: 2, lost: 0, failed: 0 });
    }
}
