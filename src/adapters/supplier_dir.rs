//! Directory Supplier
//!
//! A supplier backed by a local directory, one per supplier. Fragments are
//! stored under the backup's directory layout with a `.sum` sidecar holding
//! the SHA-256 received with the fragment, so corruption at rest is caught
//! when the owner verifies a fetched fragment.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::domain::ports::{FetchReply, StoreReply, SupplierTransport};
use crate::domain::types::{BackupId, Checksum, Fragment, FragmentName, SupplierId};
use crate::error::{Error, Result};

const SUM_SUFFIX: &str = ".sum";

#[derive(Debug, Clone)]
pub struct DirectorySupplier {
    id: SupplierId,
    root: PathBuf,
}

impl DirectorySupplier {
    pub fn new(id: SupplierId, root: impl Into<PathBuf>) -> Self {
        Self {
            id,
            root: root.into(),
        }
    }

    /// Suppliers for every subdirectory of `root`, sorted by name.
    pub fn discover(root: &Path) -> Result<Vec<Self>> {
        let mut suppliers = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                suppliers.push(Self::new(SupplierId::new(name), entry.path()));
            }
        }
        suppliers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(suppliers)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn unavailable(&self, reason: impl std::fmt::Display) -> Error {
        Error::SupplierUnavailable {
            supplier: self.id.to_string(),
            reason: reason.to_string(),
        }
    }

    fn sum_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(SUM_SUFFIX);
        PathBuf::from(name)
    }
}

#[async_trait]
impl SupplierTransport for DirectorySupplier {
    fn supplier_id(&self) -> &SupplierId {
        &self.id
    }

    async fn store(&self, fragment: Fragment) -> Result<StoreReply> {
        if let Err(e) = fragment.verify() {
            return Ok(StoreReply::Fail {
                reason: e.to_string(),
            });
        }
        let dir = fragment.backup_id.local_dir(&self.root);
        let path = fragment.write_verified(&dir).await.map_err(|e| self.unavailable(e))?;
        tokio::fs::write(Self::sum_path(&path), fragment.checksum)
            .await
            .map_err(|e| self.unavailable(e))?;
        debug!(supplier = %self.id, "Stored {}/{}", fragment.backup_id, fragment.name);
        Ok(StoreReply::Ack {
            name: fragment.name,
        })
    }

    async fn fetch(&self, backup_id: &BackupId, name: &FragmentName) -> Result<FetchReply> {
        let path = name.path_in(&backup_id.local_dir(&self.root));
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FetchReply::NotFound),
            Err(e) => return Err(self.unavailable(e)),
        };
        let mut fragment = Fragment::new(backup_id.clone(), *name, bytes);
        if let Ok(sum) = tokio::fs::read(Self::sum_path(&path)).await {
            if let Ok(stored) = Checksum::try_from(sum.as_slice()) {
                fragment.checksum = stored;
            }
        }
        Ok(FetchReply::Data(fragment))
    }

    async fn list(&self, backup_id: &BackupId) -> Result<BTreeSet<FragmentName>> {
        let dir = backup_id.local_dir(&self.root);
        let mut names = BTreeSet::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(self.unavailable(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.unavailable(e))? {
            if let Some(Ok(name)) = entry.file_name().to_str().map(str::parse::<FragmentName>) {
                names.insert(name);
            }
        }
        Ok(names)
    }

    async fn probe(&self) -> Result<()> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(self.unavailable("root is not a directory")),
            Err(e) => Err(self.unavailable(e)),
        }
    }

    async fn remove_backup(&self, backup_id: &BackupId) -> Result<()> {
        let dir = backup_id.local_dir(&self.root);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.unavailable(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn backup() -> BackupId {
        "alice:0/F1".parse().unwrap()
    }

    fn supplier(tmp: &tempfile::TempDir) -> DirectorySupplier {
        let root = tmp.path().join("s0");
        std::fs::create_dir_all(&root).unwrap();
        DirectorySupplier::new(SupplierId::new("s0"), root)
    }

    #[tokio::test]
    async fn test_store_fetch_list() {
        let tmp = tempfile::tempdir().unwrap();
        let supplier = supplier(&tmp);
        let name = FragmentName::parity(3, 1);

        let reply = supplier
            .store(Fragment::new(backup(), name, b"payload".to_vec()))
            .await
            .unwrap();
        assert_eq!(reply, StoreReply::Ack { name });

        let listed = supplier.list(&backup()).await.unwrap();
        assert_eq!(listed.into_iter().collect::<Vec<_>>(), vec![name]);

        let fetched = supplier.fetch(&backup(), &name).await.unwrap();
        assert_matches!(fetched, FetchReply::Data(f) if &f.bytes[..] == b"payload");

        let missing = supplier
            .fetch(&backup(), &FragmentName::data(3, 0))
            .await
            .unwrap();
        assert_eq!(missing, FetchReply::NotFound);
    }

    #[tokio::test]
    async fn test_bad_checksum_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let supplier = supplier(&tmp);
        let mut fragment = Fragment::new(backup(), FragmentName::data(0, 0), b"abc".to_vec());
        fragment.checksum = [0u8; 32];
        assert_matches!(
            supplier.store(fragment).await.unwrap(),
            StoreReply::Fail { .. }
        );
        assert!(supplier.list(&backup()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corruption_at_rest_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let supplier = supplier(&tmp);
        let name = FragmentName::data(0, 0);
        supplier
            .store(Fragment::new(backup(), name, b"original".to_vec()))
            .await
            .unwrap();
        let path = name.path_in(&backup().local_dir(supplier.root()));
        std::fs::write(&path, b"tampered").unwrap();

        match supplier.fetch(&backup(), &name).await.unwrap() {
            FetchReply::Data(fragment) => assert!(fragment.verify().is_err()),
            FetchReply::NotFound => panic!("fragment should exist"),
        }
    }

    #[tokio::test]
    async fn test_probe_and_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let supplier = supplier(&tmp);
        assert!(supplier.probe().await.is_ok());

        supplier
            .store(Fragment::new(backup(), FragmentName::data(0, 0), b"x".to_vec()))
            .await
            .unwrap();
        supplier.remove_backup(&backup()).await.unwrap();
        assert!(supplier.list(&backup()).await.unwrap().is_empty());

        let gone = DirectorySupplier::new(SupplierId::new("gone"), tmp.path().join("nope"));
        assert_matches!(gone.probe().await, Err(Error::SupplierUnavailable { .. }));
    }

    #[test]
    fn test_discover_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["s2", "s0", "s1"] {
            std::fs::create_dir_all(tmp.path().join(name)).unwrap();
        }
        std::fs::write(tmp.path().join("not-a-dir"), b"").unwrap();
        let found = DirectorySupplier::discover(tmp.path()).unwrap();
        let ids: Vec<String> = found.iter().map(|s| s.supplier_id().to_string()).collect();
        assert_eq!(ids, vec!["s0", "s1", "s2"]);
    }
}
