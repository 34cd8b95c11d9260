//! In-Memory Supplier
//!
//! Supplier kept in process memory with an online switch and optional
//! latency. Used by tests to simulate dead, slow and lossy suppliers.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::ports::{FetchReply, StoreReply, SupplierTransport};
use crate::domain::types::{BackupId, Fragment, FragmentName, SupplierId};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct InMemorySupplier {
    id: SupplierId,
    online: AtomicBool,
    refuse_stores: AtomicBool,
    latency: Mutex<Duration>,
    fragments: Mutex<HashMap<(BackupId, FragmentName), Fragment>>,
    stores: AtomicUsize,
    concurrent_stores: AtomicUsize,
    peak_concurrent_stores: AtomicUsize,
}

/// Decrements the concurrent store count when a store ends.
struct StoreGuard<'a>(&'a AtomicUsize);

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemorySupplier {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: SupplierId::new(id),
            online: AtomicBool::new(true),
            refuse_stores: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            fragments: Mutex::new(HashMap::new()),
            stores: AtomicUsize::new(0),
            concurrent_stores: AtomicUsize::new(0),
            peak_concurrent_stores: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Answer stores with `Fail` instead of `Ack`.
    pub fn set_refuse_stores(&self, refuse: bool) {
        self.refuse_stores.store(refuse, Ordering::SeqCst);
    }

    pub fn holds(&self, backup_id: &BackupId, name: &FragmentName) -> bool {
        self.fragments
            .lock()
            .contains_key(&(backup_id.clone(), *name))
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.lock().len()
    }

    /// Lose a stored fragment.
    pub fn drop_fragment(&self, backup_id: &BackupId, name: &FragmentName) -> bool {
        self.fragments
            .lock()
            .remove(&(backup_id.clone(), *name))
            .is_some()
    }

    /// Flip bytes of a stored fragment without updating its checksum.
    pub fn corrupt(&self, backup_id: &BackupId, name: &FragmentName) -> bool {
        let mut fragments = self.fragments.lock();
        match fragments.get_mut(&(backup_id.clone(), *name)) {
            Some(fragment) => {
                let mut bytes = fragment.bytes.to_vec();
                if bytes.is_empty() {
                    bytes.push(0xFF);
                } else {
                    bytes[0] ^= 0xFF;
                }
                fragment.bytes = bytes.into();
                true
            }
            None => false,
        }
    }

    /// Completed store requests.
    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    /// Highest number of stores observed at once.
    pub fn peak_concurrent_stores(&self) -> usize {
        self.peak_concurrent_stores.load(Ordering::SeqCst)
    }

    async fn reachable(&self) -> Result<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::SupplierUnavailable {
                supplier: self.id.to_string(),
                reason: "offline".to_string(),
            })
        }
    }
}

#[async_trait]
impl SupplierTransport for InMemorySupplier {
    fn supplier_id(&self) -> &SupplierId {
        &self.id
    }

    async fn store(&self, fragment: Fragment) -> Result<StoreReply> {
        let now = self.concurrent_stores.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = StoreGuard(&self.concurrent_stores);
        self.peak_concurrent_stores.fetch_max(now, Ordering::SeqCst);

        self.reachable().await?;
        self.stores.fetch_add(1, Ordering::SeqCst);
        if self.refuse_stores.load(Ordering::SeqCst) {
            return Ok(StoreReply::Fail {
                reason: "quota exceeded".to_string(),
            });
        }
        if let Err(e) = fragment.verify() {
            return Ok(StoreReply::Fail {
                reason: e.to_string(),
            });
        }
        let name = fragment.name;
        self.fragments
            .lock()
            .insert((fragment.backup_id.clone(), name), fragment);
        Ok(StoreReply::Ack { name })
    }

    async fn fetch(&self, backup_id: &BackupId, name: &FragmentName) -> Result<FetchReply> {
        self.reachable().await?;
        Ok(self
            .fragments
            .lock()
            .get(&(backup_id.clone(), *name))
            .cloned()
            .map(FetchReply::Data)
            .unwrap_or(FetchReply::NotFound))
    }

    async fn list(&self, backup_id: &BackupId) -> Result<BTreeSet<FragmentName>> {
        self.reachable().await?;
        Ok(self
            .fragments
            .lock()
            .keys()
            .filter(|(id, _)| id == backup_id)
            .map(|(_, name)| *name)
            .collect())
    }

    async fn probe(&self) -> Result<()> {
        self.reachable().await
    }

    async fn remove_backup(&self, backup_id: &BackupId) -> Result<()> {
        self.reachable().await?;
        self.fragments.lock().retain(|(id, _), _| id != backup_id);
        Ok(())
    }
}
