//! Reassembling a full file from an older version plus a patch
//! (`combine_plaintext`), and the server-side reverse-diff that turns an
//! older full file into a patch over the newer one it was just combined
//! into.

use super::blockindex::BlockRef;
use super::chunker;
use super::EncodedFile;
use crate::crypto::AccountKeys;
use crate::error::EfcError;

/// Decrypts every literal chunk of a full (non-patch) encoded file, in
/// block-index order, so dependent patches can resolve back-references
/// against it by block number.
pub fn decode_literal_chunks(
    file: &EncodedFile,
    keys: &AccountKeys,
) -> Result<Vec<Vec<u8>>, EfcError> {
    file.chunks.iter().map(|c| keys.decrypt_chunk(c)).collect()
}

/// Reassembles the plaintext content described by `patch`'s block index:
/// literal entries decrypt from `patch`'s own chunk stream in order,
/// back-reference entries copy from `previous_chunks` (the older object's
/// already-decoded plaintext, indexed by block number).
pub fn combine_plaintext(
    patch: &EncodedFile,
    previous_chunks: &[Vec<u8>],
    keys: &AccountKeys,
) -> Result<Vec<u8>, EfcError> {
    let mut out = Vec::new();
    let mut literal = patch.chunks.iter();
    for entry in &patch.block_index {
        match entry.block {
            BlockRef::Literal { .. } => {
                let enc = literal.next().ok_or(EfcError::BlockIndexMismatch)?;
                out.extend_from_slice(&keys.decrypt_chunk(enc)?);
            }
            BlockRef::BackReference {
                previous_block_number,
            } => {
                let chunk = previous_chunks
                    .get(previous_block_number as usize)
                    .ok_or(EfcError::BlockIndexMismatch)?;
                out.extend_from_slice(chunk);
            }
        }
    }
    if literal.next().is_some() {
        return Err(EfcError::BlockIndexMismatch);
    }
    Ok(out)
}

/// Server-side reverse-diff: after combining the client's patch against
/// `previous_plaintext` into a new standalone object, re-encode
/// `previous_plaintext` as a patch referencing the new object's block
/// index. Returns `Ok(None)` when nothing in the old content matches the
/// new one closely enough to be worth a patch — the caller then stores
/// `previous` as a second full file and flags the directory entry
/// `reversedDiffIsCompletelyDifferent` with no dependency link.
pub fn reverse_diff(
    previous_plaintext: &[u8],
    previous_attrs_blob: Vec<u8>,
    new_block_index: &[super::blockindex::BlockIndexEntry],
    container_id: u64,
    new_object_id: u64,
    keys: &AccountKeys,
) -> Result<Option<EncodedFile>, EfcError> {
    let table = chunker::build_checksum_table(new_block_index);
    let matches = chunker::find_matches(previous_plaintext, chunker::DEFAULT_CDC_MIN, chunker::DEFAULT_CDC_MAX, &table);
    if matches.is_empty() {
        return Ok(None);
    }
    Ok(Some(super::encode_with_matches(
        previous_plaintext,
        previous_attrs_blob,
        &matches,
        container_id,
        new_object_id,
        keys,
    )?))
}
