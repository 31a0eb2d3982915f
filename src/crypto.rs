//! Per-account keys, AEAD encryption, content hashing, and the rolling
//! checksum used for content-defined chunking.
//!
//! The original store kept cipher contexts and hashing secrets as process
//! globals; here they're plain values threaded explicitly through EFC and
//! DR so tests can run in parallel with distinct keys.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const NONCE_LEN: usize = 12;
pub const STRONG_HASH_LEN: usize = 8;
/// AES-GCM authentication tag length, appended after the ciphertext.
pub const TAG_LEN: usize = 16;
/// Fixed overhead an AEAD-encrypted blob carries over its plaintext: the
/// nonce prefix plus the trailing tag. A literal block-index entry's
/// `encoded_size` minus this constant recovers the plaintext chunk length
/// without needing to store it separately on the wire.
pub const AEAD_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Per-account symmetric keys. Attribute blocks and file chunks use
/// independent keys so that compromising one doesn't expose the other.
#[derive(Clone)]
pub struct AccountKeys {
    attributes_key: [u8; 32],
    file_data_key: [u8; 32],
}

impl AccountKeys {
    pub fn new(attributes_key: [u8; 32], file_data_key: [u8; 32]) -> Self {
        AccountKeys {
            attributes_key,
            file_data_key,
        }
    }

    /// Encrypts `plaintext` with the attributes key and a fresh random
    /// nonce, returning `nonce || ciphertext_with_tag`.
    pub fn encrypt_attributes(&self, plaintext: &[u8]) -> Result<Vec<u8>, crate::error::EfcError> {
        encrypt_with_fresh_nonce(&self.attributes_key, plaintext)
    }

    pub fn decrypt_attributes(&self, blob: &[u8]) -> Result<Vec<u8>, crate::error::EfcError> {
        decrypt(&self.attributes_key, blob)
    }

    /// Encrypts one chunk of plaintext file content with the file-data key.
    pub fn encrypt_chunk(&self, plaintext: &[u8]) -> Result<Vec<u8>, crate::error::EfcError> {
        encrypt_with_fresh_nonce(&self.file_data_key, plaintext)
    }

    pub fn decrypt_chunk(&self, blob: &[u8]) -> Result<Vec<u8>, crate::error::EfcError> {
        decrypt(&self.file_data_key, blob)
    }
}

fn encrypt_with_fresh_nonce(key_bytes: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, crate::error::EfcError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| crate::error::EfcError::EncryptionFailed)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(key_bytes: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>, crate::error::EfcError> {
    if blob.len() < NONCE_LEN {
        return Err(crate::error::EfcError::Truncated);
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| crate::error::EfcError::DecryptionFailed)
}

/// Strong hash of plaintext content, truncated to the 8 bytes the block
/// index stores per chunk.
pub fn strong_hash(data: &[u8]) -> [u8; STRONG_HASH_LEN] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; STRONG_HASH_LEN];
    out.copy_from_slice(&digest[..STRONG_HASH_LEN]);
    out
}

/// Cheap hash of the three attributes a client can check without decrypting
/// the attribute block, used by directory entries as an unchanged-contents
/// shortcut.
pub fn attribute_hash(uid: u32, gid: u32, mode: u16) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(uid.to_be_bytes());
    hasher.update(gid.to_be_bytes());
    hasher.update(mode.to_be_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

/// rsync-style rolling checksum over a sliding window of plaintext bytes.
///
/// `a` is the sum of the bytes in the window, `b` is the sum weighted by
/// position; both are implicitly taken modulo 2^16, matching the reference
/// algorithm this is ported from. [`Self::value`] combines them into the
/// single `u32` recorded in a block index entry.
#[derive(Debug, Clone, Copy)]
pub struct RollingChecksum {
    a: u16,
    b: u16,
}

impl RollingChecksum {
    /// Computes the checksum from scratch over `window`.
    pub fn new(window: &[u8]) -> Self {
        let mut a: u16 = 0;
        let mut b: u16 = 0;
        let len = window.len();
        for (i, &byte) in window.iter().enumerate() {
            // weight is `len - i`, matching the reference's descending
            // countdown from `Length` to `1`.
            let weight = (len - i) as u16;
            a = a.wrapping_add(byte as u16);
            b = b.wrapping_add(weight.wrapping_mul(byte as u16));
        }
        RollingChecksum { a, b }
    }

    /// Rolls the window forward by `skip` bytes: `start_of_this_block` and
    /// `last_of_next_block` are the bytes leaving and entering the window,
    /// `length` is the window length.
    pub fn roll_forward(
        &mut self,
        start_of_this_block: &[u8],
        last_of_next_block: &[u8],
        length: u16,
        skip: usize,
    ) {
        let mut sum_begin: u16 = 0;
        for i in 0..skip {
            let j = start_of_this_block[i] as u16;
            let k = last_of_next_block[i] as u16;
            sum_begin = sum_begin.wrapping_add(j);
            self.a = self.a.wrapping_add(k.wrapping_sub(j));
            self.b = self.b.wrapping_add(self.a);
        }
        self.b = self.b.wrapping_sub(length.wrapping_mul(sum_begin));
    }

    /// The combined 32-bit value stored in a block-index entry.
    pub fn value(&self) -> u32 {
        ((self.b as u32) << 16) | (self.a as u32)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let keys = AccountKeys::new([1u8; 32], [2u8; 32]);
        let plaintext = b"hello, backup store";
        let blob = keys.encrypt_chunk(plaintext).unwrap();
        assert_ne!(&blob[NONCE_LEN..], plaintext.as_slice());
        let out = keys.decrypt_chunk(&blob).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn decrypt_rejects_tampered_ciphertext() {
        let keys = AccountKeys::new([1u8; 32], [2u8; 32]);
        let mut blob = keys.encrypt_chunk(b"original content").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(keys.decrypt_chunk(&blob).is_err());
    }

    #[test]
    fn strong_hash_is_deterministic() {
        assert_eq!(strong_hash(b"abc"), strong_hash(b"abc"));
        assert_ne!(strong_hash(b"abc"), strong_hash(b"abd"));
    }

    #[test]
    fn rolling_checksum_matches_fresh_computation_after_roll() {
        let data = b"AAAABBBBCCCCDDDD";
        let window = 4usize;
        let mut rc = RollingChecksum::new(&data[0..window]);
        // roll forward by one byte: drop data[0], add data[window]
        rc.roll_forward(
            &data[0..1],
            &data[window..window + 1],
            window as u16,
            1,
        );
        let fresh = RollingChecksum::new(&data[1..1 + window]);
        assert_eq!(rc.value(), fresh.value());
    }
}
