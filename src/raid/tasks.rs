//! Raid Tasks
//!
//! The three CPU-bound operations run by the raid pool, working on files:
//!
//! - `make`: split a framed block file into data fragments and write parity
//! - `read`: reassemble the framed block from whatever fragments survive
//! - `rebuild`: regenerate missing local fragments from local survivors
//!
//! Fragment files are staged under hidden names and renamed into place only
//! once every fragment of the operation is written, so a failed or cancelled
//! task leaves nothing behind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, instrument};

use crate::block;
use crate::domain::types::{BackupId, FragmentKind, FragmentName, Presence};
use crate::ec::{codec, EccMap};
use crate::error::{Error, Result};

// =============================================================================
// Requests
// =============================================================================

/// Split and encode one block.
#[derive(Debug, Clone)]
pub struct MakeRequest {
    /// Framed block file (`<len>:<sealed block>`)
    pub block_path: PathBuf,
    pub ecc: EccMap,
    pub backup_id: BackupId,
    pub block_number: u64,
    pub out_dir: PathBuf,
}

/// Decode and reassemble one block.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    /// Where the framed block is written
    pub target_path: PathBuf,
    pub ecc: EccMap,
    pub backup_id: BackupId,
    pub block_number: u64,
    pub in_dir: PathBuf,
}

/// Recompute missing fragments of one block from local survivors.
#[derive(Debug, Clone)]
pub struct RebuildRequest {
    pub backup_id: BackupId,
    pub block_number: u64,
    pub ecc: EccMap,
    /// Liveness per supplier position
    pub alive: Vec<bool>,
    pub remote: Presence,
    pub local: Presence,
    /// Backup directory holding local fragments
    pub dir: PathBuf,
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of a successful `make`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MakeOutcome {
    pub data_fragments: usize,
    pub parity_fragments: usize,
    pub fragment_len: usize,
}

impl MakeOutcome {
    /// Fragments created by this make (k + m).
    pub fn new_fragments(&self) -> usize {
        self.data_fragments + self.parity_fragments
    }

    /// Fragments present locally afterwards (k + m).
    pub fn local_fragments(&self) -> usize {
        self.new_fragments()
    }
}

/// Result of a successful `read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Data fragments that had to be recovered from parity
    pub recovered_data: usize,
    /// Bytes written to the target
    pub bytes_written: usize,
}

/// Result of a `rebuild`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildOutcome {
    /// Some fragment is now local while its alive supplier lacks it
    pub any_new_data: bool,
    /// Local presence after the rebuild
    pub local: Presence,
    /// Fragments that are local and owed to their alive supplier
    pub reconstructed: Presence,
    /// Fragment files written by this rebuild
    pub written: Vec<FragmentName>,
}

impl RebuildOutcome {
    pub fn local_data(&self) -> &[bool] {
        &self.local.data
    }

    pub fn local_parity(&self) -> &[bool] {
        &self.local.parity
    }

    pub fn reconstructed_data(&self) -> &[bool] {
        &self.reconstructed.data
    }

    pub fn reconstructed_parity(&self) -> &[bool] {
        &self.reconstructed.parity
    }
}

// =============================================================================
// Staging
// =============================================================================

/// Fragment files written under temporary names until committed.
struct StagedFiles {
    dir: PathBuf,
    staged: Vec<(PathBuf, PathBuf)>,
    committed: bool,
}

impl StagedFiles {
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            staged: Vec::new(),
            committed: false,
        }
    }

    fn write(&mut self, name: &FragmentName, bytes: &[u8], cancel: &AtomicBool) -> Result<()> {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        let final_path = name.path_in(&self.dir);
        let tmp = self.dir.join(format!(".{}.partial", name));
        std::fs::write(&tmp, bytes)?;
        self.staged.push((tmp, final_path));
        Ok(())
    }

    fn commit(mut self, cancel: &AtomicBool) -> Result<()> {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        for (tmp, final_path) in &self.staged {
            std::fs::rename(tmp, final_path)?;
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedFiles {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for (tmp, final_path) in &self.staged {
            let _ = std::fs::remove_file(tmp);
            let _ = std::fs::remove_file(final_path);
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn load_fragments(
    dir: &Path,
    block_number: u64,
    map: &EccMap,
    wanted: Option<&Presence>,
) -> Result<(Vec<Option<Vec<u8>>>, Vec<Option<Vec<u8>>>)> {
    let want = |kind, i| wanted.map(|w| w.get(kind, i)).unwrap_or(true);

    let mut data = Vec::with_capacity(map.data_count());
    for i in 0..map.data_count() {
        data.push(if want(FragmentKind::Data, i) {
            read_optional(&FragmentName::data(block_number, i).path_in(dir))?
        } else {
            None
        });
    }
    let mut parity = Vec::with_capacity(map.parity_count());
    for j in 0..map.parity_count() {
        parity.push(if want(FragmentKind::Parity, j) {
            read_optional(&FragmentName::parity(block_number, j).path_in(dir))?
        } else {
            None
        });
    }
    Ok((data, parity))
}

// =============================================================================
// Operations
// =============================================================================

/// Split a framed block file into `k` data and `m` parity fragment files.
#[instrument(skip(req, cancel), fields(backup_id = %req.backup_id, block_number = req.block_number))]
pub fn make_block(req: &MakeRequest, cancel: &AtomicBool) -> Result<MakeOutcome> {
    let content = std::fs::read(&req.block_path)?;
    let framed = block::framed_len(&content)?;
    let encoded = codec::encode(&req.ecc, &content[..framed], cancel)?;

    std::fs::create_dir_all(&req.out_dir)?;
    let mut staged = StagedFiles::new(&req.out_dir);
    for (i, bytes) in encoded.data.iter().enumerate() {
        staged.write(&FragmentName::data(req.block_number, i), bytes, cancel)?;
    }
    for (j, bytes) in encoded.parity.iter().enumerate() {
        staged.write(&FragmentName::parity(req.block_number, j), bytes, cancel)?;
    }
    staged.commit(cancel)?;

    debug!(
        "Made block {} into {}+{} fragments of {} bytes",
        req.block_number,
        encoded.data.len(),
        encoded.parity.len(),
        encoded.fragment_len()
    );

    Ok(MakeOutcome {
        data_fragments: encoded.data.len(),
        parity_fragments: encoded.parity.len(),
        fragment_len: encoded.fragment_len(),
    })
}

/// Reassemble a framed block from the fragments present in `in_dir`.
#[instrument(skip(req, cancel), fields(backup_id = %req.backup_id, block_number = req.block_number))]
pub fn read_block(req: &ReadRequest, cancel: &AtomicBool) -> Result<ReadOutcome> {
    let (mut data, mut parity) = load_fragments(&req.in_dir, req.block_number, &req.ecc, None)?;
    let available = data.iter().chain(parity.iter()).flatten().count();

    let plan = codec::recover(&req.ecc, &mut data, &mut parity, false, cancel)?;
    if !plan.is_complete() {
        return Err(Error::InsufficientFragments {
            block_number: req.block_number,
            available,
            required: req.ecc.data_count(),
        });
    }

    let joined = codec::join(&data)?;
    let framed = block::framed_len(&joined)?;

    if let Some(parent) = req.target_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = req.target_path.with_extension("reading");
    std::fs::write(&tmp, &joined[..framed])?;
    if cancel.load(Ordering::Relaxed) {
        let _ = std::fs::remove_file(&tmp);
        return Err(Error::Cancelled);
    }
    std::fs::rename(&tmp, &req.target_path)?;

    Ok(ReadOutcome {
        recovered_data: plan.steps.len(),
        bytes_written: framed,
    })
}

/// Regenerate missing local fragments and report which ones are owed to
/// alive suppliers.
///
/// A fragment is owed when its supplier is alive and does not hold it
/// remotely. Only local files are consulted.
#[instrument(skip(req, cancel), fields(backup_id = %req.backup_id, block_number = req.block_number))]
pub fn rebuild_block(req: &RebuildRequest, cancel: &AtomicBool) -> Result<RebuildOutcome> {
    let map = &req.ecc;
    let alive = |i: usize| req.alive.get(i).copied().unwrap_or(false);

    let (mut data, mut parity) =
        load_fragments(&req.dir, req.block_number, map, Some(&req.local))?;
    let plan = codec::recover(map, &mut data, &mut parity, true, cancel)?;

    let mut written = Vec::new();
    if !plan.is_noop() {
        std::fs::create_dir_all(&req.dir)?;
        let mut staged = StagedFiles::new(&req.dir);
        for step in &plan.steps {
            let name = FragmentName::data(req.block_number, step.data_index);
            if let Some(bytes) = &data[step.data_index] {
                staged.write(&name, bytes, cancel)?;
                written.push(name);
            }
        }
        for &j in &plan.rebuilt_parity {
            let name = FragmentName::parity(req.block_number, j);
            if let Some(bytes) = &parity[j] {
                staged.write(&name, bytes, cancel)?;
                written.push(name);
            }
        }
        staged.commit(cancel)?;
    }

    let local = Presence {
        data: data.iter().map(Option::is_some).collect(),
        parity: parity.iter().map(Option::is_some).collect(),
    };
    let owed = |kind: FragmentKind, i: usize| {
        alive(i) && !req.remote.get(kind, i) && local.get(kind, i)
    };
    let reconstructed = Presence {
        data: (0..map.data_count())
            .map(|i| owed(FragmentKind::Data, i))
            .collect(),
        parity: (0..map.parity_count())
            .map(|j| owed(FragmentKind::Parity, j))
            .collect(),
    };
    let any_new_data = reconstructed.count() > 0;

    debug!(
        "Rebuild of block {} wrote {} fragments, {} owed to suppliers",
        req.block_number,
        written.len(),
        reconstructed.count()
    );

    Ok(RebuildOutcome {
        any_new_data,
        local,
        reconstructed,
        written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    const BLOCK: u64 = 5;

    fn never() -> AtomicBool {
        AtomicBool::new(false)
    }

    fn backup() -> BackupId {
        "alice@somehost.com:0/F12345678".parse().unwrap()
    }

    /// Write a framed source block and make it; returns (tempdir, source, out_dir).
    fn made(scheme: &str, payload: &[u8]) -> (TempDir, PathBuf, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        std::fs::write(&source, block::frame(payload)).unwrap();
        let out_dir = backup().local_dir(&tmp.path().join("backups"));
        let req = MakeRequest {
            block_path: source.clone(),
            ecc: EccMap::by_name(scheme).unwrap(),
            backup_id: backup(),
            block_number: BLOCK,
            out_dir: out_dir.clone(),
        };
        let outcome = make_block(&req, &never()).unwrap();
        let n = req.ecc.supplier_count();
        assert_eq!(outcome.new_fragments(), 2 * n);
        assert_eq!(outcome.local_fragments(), 2 * n);
        (tmp, source, out_dir)
    }

    fn kill_suppliers(dir: &Path, dead: usize) {
        for i in 0..dead {
            std::fs::remove_file(FragmentName::data(BLOCK, i).path_in(dir)).unwrap();
            std::fs::remove_file(FragmentName::parity(BLOCK, i).path_in(dir)).unwrap();
        }
    }

    fn read(scheme: &str, tmp: &TempDir, dir: &Path) -> Result<Vec<u8>> {
        let target = tmp.path().join("destination");
        let req = ReadRequest {
            target_path: target.clone(),
            ecc: EccMap::by_name(scheme).unwrap(),
            backup_id: backup(),
            block_number: BLOCK,
            in_dir: dir.to_path_buf(),
        };
        read_block(&req, &never())?;
        Ok(std::fs::read(target).unwrap())
    }

    fn rebuild(scheme: &str, dir: &Path, dead: usize) -> RebuildOutcome {
        let map = EccMap::by_name(scheme).unwrap();
        let n = map.supplier_count();
        let pattern: Vec<bool> = (0..n).map(|i| i >= dead).collect();
        let req = RebuildRequest {
            backup_id: backup(),
            block_number: BLOCK,
            ecc: map,
            alive: vec![true; n],
            remote: Presence {
                data: pattern.clone(),
                parity: pattern.clone(),
            },
            local: Presence {
                data: pattern.clone(),
                parity: pattern,
            },
            dir: dir.to_path_buf(),
        };
        rebuild_block(&req, &never()).unwrap()
    }

    /// Make, kill `dead` suppliers, optionally rebuild, then read.
    fn scenario(scheme: &str, dead: usize, try_rebuild: bool) -> (Option<bool>, bool) {
        let payload: Vec<u8> = (0..50u8).map(|b| b.wrapping_mul(7)).collect();
        let (tmp, source, dir) = made(scheme, &payload);
        kill_suppliers(&dir, dead);
        let new_data = try_rebuild.then(|| rebuild(scheme, &dir, dead).any_new_data);
        let read_ok = match read(scheme, &tmp, &dir) {
            Ok(bytes) => bytes == std::fs::read(&source).unwrap(),
            Err(Error::InsufficientFragments { .. }) => false,
            Err(e) => panic!("unexpected read error: {}", e),
        };
        (new_data, read_ok)
    }

    // =========================================================================
    // Make / Read Tests
    // =========================================================================

    #[test]
    fn test_make_writes_every_fragment() {
        let (_tmp, _source, dir) = made("4x4", b"hello world");
        for i in 0..4 {
            assert!(FragmentName::data(BLOCK, i).path_in(&dir).exists());
            assert!(FragmentName::parity(BLOCK, i).path_in(&dir).exists());
        }
        let leftovers = std::fs::read_dir(&dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with('.')
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_make_is_deterministic() {
        let (_a, _sa, dir_a) = made("7x7", b"same bytes every time");
        let (_b, _sb, dir_b) = made("7x7", b"same bytes every time");
        for i in 0..7 {
            let name = FragmentName::parity(BLOCK, i);
            assert_eq!(
                std::fs::read(name.path_in(&dir_a)).unwrap(),
                std::fs::read(name.path_in(&dir_b)).unwrap()
            );
        }
    }

    #[test]
    fn test_read_reproduces_make_input() {
        let (tmp, source, dir) = made("18x18", &[0xAB; 10]);
        let restored = read("18x18", &tmp, &dir).unwrap();
        assert_eq!(restored, std::fs::read(source).unwrap());
    }

    #[test]
    fn test_make_rejects_unframed_input() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        std::fs::write(&source, b"no frame here").unwrap();
        let req = MakeRequest {
            block_path: source,
            ecc: EccMap::by_name("2x2").unwrap(),
            backup_id: backup(),
            block_number: 0,
            out_dir: tmp.path().join("out"),
        };
        assert_matches!(make_block(&req, &never()), Err(Error::BlockFormat(_)));
    }

    #[test]
    fn test_cancelled_make_leaves_no_files() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        std::fs::write(&source, block::frame(&vec![1u8; 1_000_000])).unwrap();
        let out_dir = tmp.path().join("out");
        let req = MakeRequest {
            block_path: source,
            ecc: EccMap::by_name("64x64").unwrap(),
            backup_id: backup(),
            block_number: 0,
            out_dir: out_dir.clone(),
        };
        let cancel = AtomicBool::new(true);
        assert_matches!(make_block(&req, &cancel), Err(Error::Cancelled));
        let count = std::fs::read_dir(&out_dir).map(|d| d.count()).unwrap_or(0);
        assert_eq!(count, 0);
    }

    // =========================================================================
    // Dead Supplier Scenarios
    // =========================================================================

    #[test]
    fn test_two_by_two_dead_suppliers() {
        assert_eq!(scenario("2x2", 0, true), (Some(false), true));
        assert_eq!(scenario("2x2", 1, false), (None, true));
        assert_eq!(scenario("2x2", 1, true), (Some(true), true));
        assert_eq!(scenario("2x2", 2, true), (Some(false), false));
    }

    #[test]
    fn test_four_by_four_dead_suppliers() {
        assert_eq!(scenario("4x4", 2, false), (None, true));
        assert_eq!(scenario("4x4", 2, true), (Some(true), true));
        assert_eq!(scenario("4x4", 3, true), (Some(false), false));
    }

    #[test]
    fn test_seven_by_seven_four_dead() {
        let (_, read_ok) = scenario("7x7", 4, true);
        assert!(!read_ok);
    }

    /// Ten dead suppliers take both fragments of each position, so the rebuild
    /// recovers some data but the block stays unreadable.
    #[test]
    fn test_eighteen_dead_suppliers() {
        assert_eq!(scenario("18x18", 5, true), (Some(true), true));
        assert_eq!(scenario("18x18", 10, true), (Some(true), false));
        assert_eq!(scenario("18x18", 14, true), (Some(false), false));
    }

    #[test]
    fn test_sixty_four_dead_suppliers() {
        assert_eq!(scenario("64x64", 10, false), (None, true));
        assert_eq!(scenario("64x64", 10, true), (Some(true), true));
        assert_eq!(scenario("64x64", 23, true), (Some(true), false));
    }

    // =========================================================================
    // Rebuild Tests
    // =========================================================================

    #[test]
    fn test_rebuild_restores_lost_files() {
        let (_tmp, _source, dir) = made("18x18", b"rebuild me please");
        kill_suppliers(&dir, 5);
        let outcome = rebuild("18x18", &dir, 5);

        assert!(outcome.local.is_full());
        assert_eq!(outcome.written.len(), 10);
        for i in 0..5 {
            assert!(outcome.reconstructed_data()[i]);
            assert!(outcome.reconstructed_parity()[i]);
            assert!(FragmentName::data(BLOCK, i).path_in(&dir).exists());
        }
        assert!(!outcome.reconstructed_data()[5]);
    }

    #[test]
    fn test_rebuild_with_nothing_missing_is_noop() {
        let (_tmp, _source, dir) = made("13x13", b"already complete");
        let outcome = rebuild("13x13", &dir, 0);
        assert!(!outcome.any_new_data);
        assert!(outcome.written.is_empty());
        assert!(outcome.local.is_full());
    }

    #[test]
    fn test_rebuild_ignores_dead_suppliers_for_new_data() {
        let (_tmp, _source, dir) = made("4x4", b"dead owners");
        kill_suppliers(&dir, 1);
        let map = EccMap::by_name("4x4").unwrap();
        let pattern = vec![false, true, true, true];
        let req = RebuildRequest {
            backup_id: backup(),
            block_number: BLOCK,
            ecc: map,
            alive: pattern.clone(),
            remote: Presence {
                data: pattern.clone(),
                parity: pattern.clone(),
            },
            local: Presence {
                data: pattern.clone(),
                parity: pattern,
            },
            dir: dir.clone(),
        };
        let outcome = rebuild_block(&req, &never()).unwrap();
        // Fragments are regenerated locally but nobody alive is owed them.
        assert!(outcome.local.is_full());
        assert!(!outcome.any_new_data);
    }
}
