//! Blocks
//!
//! A block is a plaintext chunk of the archive stream and the unit of
//! encryption and erasure coding. Sealed blocks serialize to a fixed-order
//! binary record:
//!
//! ```text
//! "FVB1" | creatorId | backupId | blockNumber u64 | isLast u8 |
//! sessionKeyType | length u64 | wrappedKey | iv | ciphertext
//! ```
//!
//! Strings and byte fields are prefixed with their length as u32 big-endian.
//! The raid `make` input wraps that record as `<ASCII length>:<bytes>`.

use bytes::{Buf, BufMut};

use crate::domain::types::BackupId;
use crate::error::{Error, Result};

/// Leading magic of a serialized sealed block.
pub const BLOCK_MAGIC: &[u8; 4] = b"FVB1";

// =============================================================================
// Plaintext Block
// =============================================================================

/// A plaintext block pulled from the pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub creator_id: String,
    pub backup_id: BackupId,
    pub block_number: u64,
    pub is_last: bool,
    pub data: Vec<u8>,
}

impl Block {
    pub fn new(
        creator_id: impl Into<String>,
        backup_id: BackupId,
        block_number: u64,
        is_last: bool,
        data: Vec<u8>,
    ) -> Self {
        Self {
            creator_id: creator_id.into(),
            backup_id,
            block_number,
            is_last,
            data,
        }
    }

    /// Header describing this block once sealed with `session_key_type`.
    pub fn header(&self, session_key_type: &str) -> BlockHeader {
        BlockHeader {
            creator_id: self.creator_id.clone(),
            backup_id: self.backup_id.clone(),
            block_number: self.block_number,
            is_last: self.is_last,
            session_key_type: session_key_type.to_string(),
            length: self.data.len() as u64,
        }
    }
}

// =============================================================================
// Sealed Block
// =============================================================================

/// Clear-text header of a sealed block; authenticated as associated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub creator_id: String,
    pub backup_id: BackupId,
    pub block_number: u64,
    pub is_last: bool,
    pub session_key_type: String,
    /// Plaintext length in bytes
    pub length: u64,
}

impl BlockHeader {
    /// Canonical header bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        self.write_to(&mut buf);
        buf
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        put_field(buf, self.creator_id.as_bytes());
        put_field(buf, self.backup_id.to_string().as_bytes());
        buf.put_u64(self.block_number);
        buf.put_u8(u8::from(self.is_last));
        put_field(buf, self.session_key_type.as_bytes());
        buf.put_u64(self.length);
    }

    fn read_from(buf: &mut &[u8]) -> Result<Self> {
        let creator_id = get_string(buf, "creatorId")?;
        let backup_id = get_string(buf, "backupId")?
            .parse()
            .map_err(|_| Error::BlockFormat("invalid backupId".to_string()))?;
        let block_number = get_u64(buf, "blockNumber")?;
        let is_last = match get_u8(buf, "isLast")? {
            0 => false,
            1 => true,
            other => return Err(Error::BlockFormat(format!("isLast flag {}", other))),
        };
        let session_key_type = get_string(buf, "sessionKeyType")?;
        let length = get_u64(buf, "length")?;
        Ok(Self {
            creator_id,
            backup_id,
            block_number,
            is_last,
            session_key_type,
            length,
        })
    }
}

/// An encrypted block ready for erasure coding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlock {
    pub header: BlockHeader,
    /// Session key wrapped for the backup key
    pub wrapped_key: Vec<u8>,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl SealedBlock {
    /// Serialize in the fixed field order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            96 + self.wrapped_key.len() + self.iv.len() + self.ciphertext.len(),
        );
        buf.put_slice(BLOCK_MAGIC);
        self.header.write_to(&mut buf);
        put_field(&mut buf, &self.wrapped_key);
        put_field(&mut buf, &self.iv);
        put_field(&mut buf, &self.ciphertext);
        buf
    }

    /// Parse bytes produced by [`SealedBlock::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;
        if buf.remaining() < BLOCK_MAGIC.len() || &buf[..BLOCK_MAGIC.len()] != BLOCK_MAGIC {
            return Err(Error::BlockFormat("missing block magic".to_string()));
        }
        buf.advance(BLOCK_MAGIC.len());

        let header = BlockHeader::read_from(&mut buf)?;
        let wrapped_key = get_field(&mut buf, "wrappedKey")?;
        let iv = get_field(&mut buf, "iv")?;
        let ciphertext = get_field(&mut buf, "ciphertext")?;
        if buf.has_remaining() {
            return Err(Error::BlockFormat(format!(
                "{} trailing bytes after block",
                buf.remaining()
            )));
        }

        Ok(Self {
            header,
            wrapped_key,
            iv,
            ciphertext,
        })
    }
}

// =============================================================================
// Raid Input Framing
// =============================================================================

/// Wrap a serialized block as `<ASCII length>:<bytes>`.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let prefix = format!("{}:", payload.len());
    let mut out = Vec::with_capacity(prefix.len() + payload.len());
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Length of the framed content at the start of `bytes`, ignoring padding.
pub fn framed_len(bytes: &[u8]) -> Result<usize> {
    let colon = bytes
        .iter()
        .take(20)
        .position(|b| *b == b':')
        .ok_or_else(|| Error::BlockFormat("missing length prefix".to_string()))?;
    let digits = &bytes[..colon];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(Error::BlockFormat("invalid length prefix".to_string()));
    }
    let len: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::BlockFormat("invalid length prefix".to_string()))?;
    let total = colon + 1 + len;
    if total > bytes.len() {
        return Err(Error::BlockFormat(format!(
            "length prefix {} exceeds {} available bytes",
            len,
            bytes.len() - colon - 1
        )));
    }
    Ok(total)
}

/// Payload inside a frame, ignoring any trailing padding.
pub fn unframe(bytes: &[u8]) -> Result<&[u8]> {
    let total = framed_len(bytes)?;
    let colon = bytes
        .iter()
        .position(|b| *b == b':')
        .ok_or_else(|| Error::BlockFormat("missing length prefix".to_string()))?;
    Ok(&bytes[colon + 1..total])
}

// =============================================================================
// Field Helpers
// =============================================================================

fn put_field(buf: &mut Vec<u8>, field: &[u8]) {
    buf.put_u32(field.len() as u32);
    buf.put_slice(field);
}

fn need(buf: &&[u8], n: usize, field: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::BlockFormat(format!("truncated {}", field)));
    }
    Ok(())
}

fn get_u8(buf: &mut &[u8], field: &str) -> Result<u8> {
    need(buf, 1, field)?;
    Ok(buf.get_u8())
}

fn get_u64(buf: &mut &[u8], field: &str) -> Result<u64> {
    need(buf, 8, field)?;
    Ok(buf.get_u64())
}

fn get_field(buf: &mut &[u8], field: &str) -> Result<Vec<u8>> {
    need(buf, 4, field)?;
    let len = buf.get_u32() as usize;
    need(buf, len, field)?;
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

fn get_string(buf: &mut &[u8], field: &str) -> Result<String> {
    String::from_utf8(get_field(buf, field)?)
        .map_err(|_| Error::BlockFormat(format!("{} is not UTF-8", field)))
}
