//! Domain Value Objects
//!
//! Identifiers and fragment records shared by every pipeline component.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

// =============================================================================
// Backup Identifier
// =============================================================================

/// Backup identifier of the form `customer:path/version`.
///
/// `path` may itself contain `/`; the version is the last segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackupId {
    customer: String,
    path_id: String,
    version: String,
}

impl BackupId {
    /// Build an id from its parts.
    pub fn new(
        customer: impl Into<String>,
        path_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self> {
        let id = Self {
            customer: customer.into(),
            path_id: path_id.into(),
            version: version.into(),
        };
        id.validate()?;
        Ok(id)
    }

    fn validate(&self) -> Result<()> {
        let invalid = || Error::InvalidBackupId(self.to_string());
        if self.customer.is_empty() || self.path_id.is_empty() || self.version.is_empty() {
            return Err(invalid());
        }
        if self.customer.contains('/') || self.version.contains(':') {
            return Err(invalid());
        }
        let unsafe_segment = |s: &str| {
            Path::new(s)
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        };
        if unsafe_segment(&self.customer)
            || unsafe_segment(&self.path_id)
            || unsafe_segment(&self.version)
        {
            return Err(invalid());
        }
        Ok(())
    }

    pub fn customer(&self) -> &str {
        &self.customer
    }

    pub fn path_id(&self) -> &str {
        &self.path_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Directory holding this backup's fragments: `<root>/<customer>/<path>/<version>`.
    pub fn local_dir(&self, root: &Path) -> PathBuf {
        let mut dir = root.join(&self.customer);
        for segment in self.path_id.split('/').filter(|s| !s.is_empty()) {
            dir.push(segment);
        }
        dir.push(&self.version);
        dir
    }

    /// File-name safe rendering, used for temp files.
    pub fn slug(&self) -> String {
        self.to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.customer, self.path_id, self.version)
    }
}

impl FromStr for BackupId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidBackupId(s.to_string());
        let (customer, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (path_id, version) = rest.rsplit_once('/').ok_or_else(invalid)?;
        Self::new(customer, path_id, version).map_err(|_| invalid())
    }
}

impl TryFrom<String> for BackupId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<BackupId> for String {
    fn from(id: BackupId) -> Self {
        id.to_string()
    }
}

// =============================================================================
// Supplier Identifier
// =============================================================================

/// Supplier identifier (value object).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SupplierId(pub String);

impl SupplierId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SupplierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SupplierId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// Fragment Naming
// =============================================================================

/// Whether a fragment is original data or a parity combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FragmentKind {
    Data,
    Parity,
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FragmentKind::Data => write!(f, "Data"),
            FragmentKind::Parity => write!(f, "Parity"),
        }
    }
}

impl FromStr for FragmentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Data" => Ok(FragmentKind::Data),
            "Parity" => Ok(FragmentKind::Parity),
            other => Err(Error::BlockFormat(format!("unknown fragment kind {}", other))),
        }
    }
}

/// On-disk fragment name `<blockNumber>-<index>-<Data|Parity>`.
///
/// Ordered by block, then index, then kind, which is the send priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentName {
    pub block_number: u64,
    pub index: usize,
    pub kind: FragmentKind,
}

impl FragmentName {
    pub fn new(block_number: u64, index: usize, kind: FragmentKind) -> Self {
        Self {
            block_number,
            index,
            kind,
        }
    }

    pub fn data(block_number: u64, index: usize) -> Self {
        Self::new(block_number, index, FragmentKind::Data)
    }

    pub fn parity(block_number: u64, index: usize) -> Self {
        Self::new(block_number, index, FragmentKind::Parity)
    }

    /// Path of this fragment inside a backup directory.
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.to_string())
    }
}

impl fmt::Display for FragmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.block_number, self.index, self.kind)
    }
}

impl FromStr for FragmentName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::BlockFormat(format!("invalid fragment name {}", s));
        let mut parts = s.splitn(3, '-');
        let block_number = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(bad)?;
        let index = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(bad)?;
        let kind = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        Ok(Self::new(block_number, index, kind))
    }
}

// =============================================================================
// Presence Bitmaps
// =============================================================================

/// Per-block presence flags for data and parity fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub data: Vec<bool>,
    pub parity: Vec<bool>,
}

impl Presence {
    /// All fragments present.
    pub fn full(data_count: usize, parity_count: usize) -> Self {
        Self {
            data: vec![true; data_count],
            parity: vec![true; parity_count],
        }
    }

    /// All fragments absent.
    pub fn empty(data_count: usize, parity_count: usize) -> Self {
        Self {
            data: vec![false; data_count],
            parity: vec![false; parity_count],
        }
    }

    pub fn get(&self, kind: FragmentKind, index: usize) -> bool {
        let bits = match kind {
            FragmentKind::Data => &self.data,
            FragmentKind::Parity => &self.parity,
        };
        bits.get(index).copied().unwrap_or(false)
    }

    /// Set a flag; returns whether it changed. Out-of-range indices are ignored.
    pub fn set(&mut self, kind: FragmentKind, index: usize, present: bool) -> bool {
        let bits = match kind {
            FragmentKind::Data => &mut self.data,
            FragmentKind::Parity => &mut self.parity,
        };
        match bits.get_mut(index) {
            Some(bit) if *bit != present => {
                *bit = present;
                true
            }
            _ => false,
        }
    }

    /// Number of present fragments.
    pub fn count(&self) -> usize {
        self.data.iter().chain(self.parity.iter()).filter(|b| **b).count()
    }

    /// Number of absent fragments.
    pub fn missing(&self) -> usize {
        self.data.len() + self.parity.len() - self.count()
    }

    pub fn is_full(&self) -> bool {
        self.missing() == 0
    }

    /// Names of present fragments for `block_number`.
    pub fn names(&self, block_number: u64) -> Vec<FragmentName> {
        let data = self
            .data
            .iter()
            .enumerate()
            .filter(|(_, p)| **p)
            .map(|(i, _)| FragmentName::data(block_number, i));
        let parity = self
            .parity
            .iter()
            .enumerate()
            .filter(|(_, p)| **p)
            .map(|(i, _)| FragmentName::parity(block_number, i));
        data.chain(parity).collect()
    }
}

// =============================================================================
// Fragment
// =============================================================================

/// SHA-256 over fragment bytes.
pub type Checksum = [u8; 32];

/// Compute a fragment checksum.
pub fn checksum(bytes: &[u8]) -> Checksum {
    Sha256::digest(bytes).into()
}

/// A fragment in transit between the owner and a supplier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub backup_id: BackupId,
    pub name: FragmentName,
    pub bytes: Bytes,
    pub checksum: Checksum,
}

impl Fragment {
    /// Wrap bytes, computing their checksum.
    pub fn new(backup_id: BackupId, name: FragmentName, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let checksum = checksum(&bytes);
        Self {
            backup_id,
            name,
            bytes,
            checksum,
        }
    }

    /// Check that bytes still match the carried checksum.
    pub fn verify(&self) -> Result<()> {
        if checksum(&self.bytes) == self.checksum {
            Ok(())
        } else {
            Err(Error::ChecksumMismatch {
                fragment: format!("{}/{}", self.backup_id, self.name),
            })
        }
    }

    /// Verify, then write to `dir` via a temp file and rename.
    pub async fn write_verified(&self, dir: &Path) -> Result<PathBuf> {
        self.verify()?;
        tokio::fs::create_dir_all(dir).await?;
        let path = self.name.path_in(dir);
        let tmp = dir.join(format!(".{}.incoming", self.name));
        tokio::fs::write(&tmp, &self.bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }
}
