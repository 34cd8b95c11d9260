//! AES-256-GCM Block Cipher
//!
//! Implements the `BlockCipher` port. Every block is encrypted under a fresh
//! random session key; the session key is wrapped with the backup key as
//! `[12-byte nonce][ciphertext with 16-byte tag]`. The block header is bound
//! to the ciphertext as associated data.

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use crate::block::{Block, SealedBlock};
use crate::domain::ports::BlockCipher;
use crate::error::{Error, Result};

/// Session key type recorded in sealed headers.
pub const SESSION_KEY_TYPE: &str = "AES-256-GCM";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM sealing with per-block session keys.
pub struct AesGcmBlockCipher {
    backup_key: Aes256Gcm,
}

impl AesGcmBlockCipher {
    pub fn new(backup_key: &[u8; KEY_LEN]) -> Self {
        Self {
            backup_key: Aes256Gcm::new(backup_key.into()),
        }
    }

    /// Load a raw 32-byte key file.
    pub fn from_key_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            Error::Crypto(format!(
                "key file {} must hold {} bytes, found {}",
                path.display(),
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self::new(&key))
    }

    /// Random backup key.
    pub fn generate_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    fn wrap_key(&self, session_key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let wrapped = self
            .backup_key
            .encrypt(Nonce::from_slice(&nonce_bytes), session_key.as_slice())
            .map_err(|e| Error::Crypto(format!("session key wrap: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + wrapped.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&wrapped);
        Ok(out)
    }

    fn unwrap_key(&self, wrapped: &[u8]) -> Result<[u8; KEY_LEN]> {
        if wrapped.len() != NONCE_LEN + KEY_LEN + TAG_LEN {
            return Err(Error::Crypto("wrapped session key has wrong length".to_string()));
        }
        let (nonce, ciphertext) = wrapped.split_at(NONCE_LEN);
        let key = self
            .backup_key
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Crypto("session key unwrap failed".to_string()))?;
        key.as_slice()
            .try_into()
            .map_err(|_| Error::Crypto("unwrapped session key has wrong length".to_string()))
    }
}

impl BlockCipher for AesGcmBlockCipher {
    fn session_key_type(&self) -> &str {
        SESSION_KEY_TYPE
    }

    fn seal(&self, block: &Block) -> Result<SealedBlock> {
        let mut rng = rand::thread_rng();
        let mut session_key = [0u8; KEY_LEN];
        rng.fill_bytes(&mut session_key);
        let mut iv = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut iv);

        let header = block.header(SESSION_KEY_TYPE);
        let aad = header.to_bytes();
        let session = Aes256Gcm::new((&session_key).into());
        let ciphertext = session
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &block.data,
                    aad: &aad,
                },
            )
            .map_err(|e| Error::Crypto(format!("AES-GCM encrypt: {e}")))?;

        Ok(SealedBlock {
            header,
            wrapped_key: self.wrap_key(&session_key)?,
            iv: iv.to_vec(),
            ciphertext,
        })
    }

    fn open(&self, sealed: &SealedBlock) -> Result<Block> {
        if sealed.header.session_key_type != SESSION_KEY_TYPE {
            return Err(Error::Crypto(format!(
                "unsupported session key type {}",
                sealed.header.session_key_type
            )));
        }
        if sealed.iv.len() != NONCE_LEN {
            return Err(Error::Crypto("iv has wrong length".to_string()));
        }

        let session_key = self.unwrap_key(&sealed.wrapped_key)?;
        let session = Aes256Gcm::new((&session_key).into());
        let aad = sealed.header.to_bytes();
        let data = session
            .decrypt(
                Nonce::from_slice(&sealed.iv),
                Payload {
                    msg: &sealed.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Crypto("block decryption failed".to_string()))?;

        if data.len() as u64 != sealed.header.length {
            return Err(Error::Crypto(format!(
                "decrypted {} bytes, header says {}",
                data.len(),
                sealed.header.length
            )));
        }

        Ok(Block {
            creator_id: sealed.header.creator_id.clone(),
            backup_id: sealed.header.backup_id.clone(),
            block_number: sealed.header.block_number,
            is_last: sealed.header.is_last,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(data: &[u8]) -> Block {
        Block::new("alice@host", "alice:0/F1".parse().unwrap(), 4, false, data.to_vec())
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = AesGcmBlockCipher::new(&[0x11; 32]);
        let original = block(b"secret message");
        let sealed = cipher.seal(&original).unwrap();

        assert_eq!(sealed.header.length, 14);
        assert_eq!(sealed.header.session_key_type, SESSION_KEY_TYPE);
        assert_ne!(sealed.ciphertext[..14], original.data[..]);

        let parsed = SealedBlock::from_bytes(&sealed.to_bytes()).unwrap();
        assert_eq!(cipher.open(&parsed).unwrap(), original);
    }

    #[test]
    fn test_empty_block_roundtrip() {
        let cipher = AesGcmBlockCipher::new(&[0x11; 32]);
        let mut original = block(b"");
        original.is_last = true;
        let sealed = cipher.seal(&original).unwrap();
        assert_eq!(cipher.open(&sealed).unwrap(), original);
    }

    #[test]
    fn test_fresh_session_key_per_block() {
        let cipher = AesGcmBlockCipher::new(&[0x11; 32]);
        let a = cipher.seal(&block(b"same")).unwrap();
        let b = cipher.seal(&block(b"same")).unwrap();
        assert_ne!(a.wrapped_key, b.wrapped_key);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_backup_key_fails() {
        let sealed = AesGcmBlockCipher::new(&[0x11; 32])
            .seal(&block(b"data"))
            .unwrap();
        let other = AesGcmBlockCipher::new(&[0x22; 32]);
        assert!(matches!(other.open(&sealed), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_tampered_header_fails() {
        let cipher = AesGcmBlockCipher::new(&[0x11; 32]);
        let mut sealed = cipher.seal(&block(b"data")).unwrap();
        sealed.header.is_last = true;
        assert!(cipher.open(&sealed).is_err());
    }

    #[test]
    fn test_key_file_length_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, [1u8; 16]).unwrap();
        assert!(AesGcmBlockCipher::from_key_file(&path).is_err());

        std::fs::write(&path, AesGcmBlockCipher::generate_key()).unwrap();
        assert!(AesGcmBlockCipher::from_key_file(&path).is_ok());
    }
}
