//! XOR codec
//!
//! Splits a payload into `k` equal data fragments and derives the parity
//! fragments of an [`EccMap`]. Work is chunked so that a cancellation flag is
//! observed at least every [`YIELD_BYTES`] processed bytes.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::ec::eccmap::{EccMap, RecoveryPlan};
use crate::error::{Error, Result};

/// Parity is computed over words of this many bytes.
pub const WORD_SIZE: usize = 4;

/// Bytes processed between cancellation checks. Multiple of [`WORD_SIZE`].
pub const YIELD_BYTES: usize = 10_000;

/// Data and parity fragments of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBlock {
    pub data: Vec<Vec<u8>>,
    pub parity: Vec<Vec<u8>>,
}

impl EncodedBlock {
    /// Length shared by every fragment.
    pub fn fragment_len(&self) -> usize {
        self.data.first().map(Vec::len).unwrap_or(0)
    }
}

/// Payload length after zero padding to a multiple of `k * WORD_SIZE`.
pub fn padded_len(payload_len: usize, data_count: usize) -> usize {
    let unit = data_count * WORD_SIZE;
    payload_len.div_ceil(unit) * unit
}

/// Length of each fragment for a payload of `payload_len` bytes.
pub fn fragment_len(payload_len: usize, data_count: usize) -> usize {
    padded_len(payload_len, data_count) / data_count
}

/// XOR `src` into `dst`, checking `cancel` between chunks.
pub fn xor_into(dst: &mut [u8], src: &[u8], cancel: &AtomicBool) -> Result<()> {
    if dst.len() != src.len() {
        return Err(Error::BlockFormat(format!(
            "fragment length mismatch: {} vs {}",
            dst.len(),
            src.len()
        )));
    }
    for (d, s) in dst.chunks_mut(YIELD_BYTES).zip(src.chunks(YIELD_BYTES)) {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        for (a, b) in d.iter_mut().zip(s) {
            *a ^= *b;
        }
    }
    Ok(())
}

/// Split `payload` into data fragments and compute every parity.
pub fn encode(map: &EccMap, payload: &[u8], cancel: &AtomicBool) -> Result<EncodedBlock> {
    let k = map.data_count();
    let seg = fragment_len(payload.len(), k);

    let data: Vec<Vec<u8>> = (0..k)
        .map(|i| {
            let start = (i * seg).min(payload.len());
            let end = ((i + 1) * seg).min(payload.len());
            let mut chunk = Vec::with_capacity(seg);
            chunk.extend_from_slice(&payload[start..end]);
            chunk.resize(seg, 0);
            chunk
        })
        .collect();

    let mut parity = Vec::with_capacity(map.parity_count());
    for j in 0..map.parity_count() {
        parity.push(compute_parity(map, j, &data, cancel)?);
    }

    debug!(
        "Encoded {} bytes into {}+{} fragments of {} bytes",
        payload.len(),
        k,
        map.parity_count(),
        seg
    );

    Ok(EncodedBlock { data, parity })
}

fn compute_parity(
    map: &EccMap,
    parity: usize,
    data: &[Vec<u8>],
    cancel: &AtomicBool,
) -> Result<Vec<u8>> {
    let seg = data.first().map(Vec::len).unwrap_or(0);
    let mut buf = vec![0u8; seg];
    for &d in map.datas_for_parity(parity) {
        xor_into(&mut buf, &data[d], cancel)?;
    }
    Ok(buf)
}

/// Recover missing fragments in place.
///
/// Missing data is peeled according to [`EccMap::plan_recovery`]. When
/// `rebuild_parity` is set, missing parities whose inputs are all present
/// afterwards are recomputed too. Returns the plan that was applied.
pub fn recover(
    map: &EccMap,
    data: &mut [Option<Vec<u8>>],
    parity: &mut [Option<Vec<u8>>],
    rebuild_parity: bool,
    cancel: &AtomicBool,
) -> Result<RecoveryPlan> {
    if data.len() != map.data_count() || parity.len() != map.parity_count() {
        return Err(Error::Internal(format!(
            "expected {}+{} fragment slots, got {}+{}",
            map.data_count(),
            map.parity_count(),
            data.len(),
            parity.len()
        )));
    }

    let mut lengths = data.iter().chain(parity.iter()).flatten().map(Vec::len);
    if let Some(first) = lengths.next() {
        if lengths.any(|l| l != first) {
            return Err(Error::BlockFormat(
                "fragments of one block differ in length".to_string(),
            ));
        }
    }

    let data_bits: Vec<bool> = data.iter().map(Option::is_some).collect();
    let parity_bits: Vec<bool> = parity.iter().map(Option::is_some).collect();
    let plan = map.plan_recovery(&data_bits, &parity_bits);

    for step in &plan.steps {
        let mut buf = parity[step.parity_index]
            .clone()
            .ok_or_else(|| Error::Internal("recovery step uses absent parity".to_string()))?;
        for &d in map.datas_for_parity(step.parity_index) {
            if d == step.data_index {
                continue;
            }
            let src = data[d]
                .as_deref()
                .ok_or_else(|| Error::Internal("recovery step uses absent data".to_string()))?;
            xor_into(&mut buf, src, cancel)?;
        }
        data[step.data_index] = Some(buf);
    }

    if rebuild_parity && !plan.rebuilt_parity.is_empty() {
        let full: Vec<Vec<u8>> = data.iter().map(|d| d.clone().unwrap_or_default()).collect();
        for &j in &plan.rebuilt_parity {
            parity[j] = Some(compute_parity(map, j, &full, cancel)?);
        }
    }

    Ok(plan)
}

/// Concatenate data fragments in index order.
pub fn join(data: &[Option<Vec<u8>>]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.iter().flatten().map(Vec::len).sum());
    for (i, fragment) in data.iter().enumerate() {
        let fragment = fragment
            .as_deref()
            .ok_or_else(|| Error::Internal(format!("data fragment {} missing at join", i)))?;
        out.extend_from_slice(fragment);
    }
    Ok(out)
}
