//! Encoded file codec: plaintext <-> encoded-file stream, the format at
//! the heart of the client's upload path and the server's structural
//! verification of it.
//!
//! An [`EncodedFile`] never holds plaintext file content once the literal
//! chunks are encrypted — only [`patch::decode_literal_chunks`] and
//! [`attrs::FileAttributes::decrypt`] bring plaintext back, and both need
//! the account's keys to do it.

pub mod attrs;
pub mod blockindex;
pub mod chunker;
pub mod patch;

pub use attrs::FileAttributes;
pub use blockindex::{BlockIndexEntry, BlockRef};

use crate::crypto::{strong_hash, AccountKeys, RollingChecksum};
use crate::error::EfcError;
use crate::wire::{U32Be, U64Be};
use std::io::{Read, Write};

/// First four bytes of a current-format file object.
pub const FILE_MAGIC_V1: u32 = 0x6669_6c65; // 'file'
/// First four bytes of the legacy format, readable but never written.
pub const FILE_MAGIC_V0: u32 = 0x4649_4c45; // 'FILE'

/// What a 4-byte object-file magic identifies it as, used by the
/// consistency checker's phase-1 scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    FileV1,
    FileV0,
    Directory,
    Unknown,
}

pub fn classify_magic(magic: u32) -> ObjectKind {
    match magic {
        FILE_MAGIC_V1 => ObjectKind::FileV1,
        FILE_MAGIC_V0 => ObjectKind::FileV0,
        crate::dr::DIR_MAGIC => ObjectKind::Directory,
        _ => ObjectKind::Unknown,
    }
}

/// An encoded file, either full (`other_file_id == 0`) or a patch against
/// an older object. Chunks here are already-encrypted bytes: only the
/// literal ones (see [`BlockRef::Literal`]) have bytes in `chunks`, in the
/// same relative order they appear in `block_index`.
#[derive(Debug, Clone)]
pub struct EncodedFile {
    pub container_id: u64,
    pub other_file_id: u64,
    pub attrs_blob: Vec<u8>,
    pub chunks: Vec<Vec<u8>>,
    pub block_index: Vec<BlockIndexEntry>,
}

impl EncodedFile {
    pub fn is_patch(&self) -> bool {
        self.other_file_id != 0
    }
}

/// Encodes `plaintext` as a fresh, standalone full file.
pub fn encode_full(
    plaintext: &[u8],
    attrs: &FileAttributes,
    keys: &AccountKeys,
    container_id: u64,
) -> Result<EncodedFile, EfcError> {
    let mut chunks = Vec::new();
    let mut block_index = Vec::new();
    for plain_chunk in chunker::fixed_size_chunks(plaintext, chunker::DEFAULT_FIXED_CHUNK_SIZE) {
        let encrypted = keys.encrypt_chunk(plain_chunk)?;
        block_index.push(BlockIndexEntry {
            rolling_checksum: RollingChecksum::new(plain_chunk).value(),
            strong_hash: strong_hash(plain_chunk),
            block: BlockRef::Literal {
                encoded_size: encrypted.len() as u32,
            },
        });
        chunks.push(encrypted);
    }
    Ok(EncodedFile {
        container_id,
        other_file_id: 0,
        attrs_blob: attrs.encrypt(keys)?,
        chunks,
        block_index,
    })
}

/// Encodes `plaintext` as a patch against `previous_object_id`, using
/// `previous_index` (that object's own block index, fetched from the
/// server) to find content it can back-reference instead of re-sending.
pub fn encode_patch(
    plaintext: &[u8],
    attrs: &FileAttributes,
    keys: &AccountKeys,
    container_id: u64,
    previous_object_id: u64,
    previous_index: &[BlockIndexEntry],
) -> Result<EncodedFile, EfcError> {
    let table = chunker::build_checksum_table(previous_index);
    let matches = chunker::find_matches(plaintext, chunker::DEFAULT_CDC_MIN, chunker::DEFAULT_CDC_MAX, &table);
    let attrs_blob = attrs.encrypt(keys)?;
    encode_with_matches(plaintext, attrs_blob, &matches, container_id, previous_object_id, keys)
}

/// Shared by `encode_patch` (client side) and `patch::reverse_diff`
/// (server side): stitches the literal spans between `matches` into
/// ordinary encrypted chunks and the matches themselves into
/// back-reference block-index entries, preserving file order.
pub(crate) fn encode_with_matches(
    plaintext: &[u8],
    attrs_blob: Vec<u8>,
    matches: &[chunker::Match],
    container_id: u64,
    other_file_id: u64,
    keys: &AccountKeys,
) -> Result<EncodedFile, EfcError> {
    let mut chunks = Vec::new();
    let mut block_index = Vec::new();
    let mut cursor = 0usize;

    let mut push_literal_span = |span: &[u8],
                                  chunks: &mut Vec<Vec<u8>>,
                                  block_index: &mut Vec<BlockIndexEntry>|
     -> Result<(), EfcError> {
        for plain_chunk in chunker::fixed_size_chunks(span, chunker::DEFAULT_CDC_MAX) {
            let encrypted = keys.encrypt_chunk(plain_chunk)?;
            block_index.push(BlockIndexEntry {
                rolling_checksum: RollingChecksum::new(plain_chunk).value(),
                strong_hash: strong_hash(plain_chunk),
                block: BlockRef::Literal {
                    encoded_size: encrypted.len() as u32,
                },
            });
            chunks.push(encrypted);
        }
        Ok(())
    };

    for m in matches {
        if m.offset > cursor {
            push_literal_span(&plaintext[cursor..m.offset], &mut chunks, &mut block_index)?;
        }
        let span = &plaintext[m.offset..m.offset + m.length];
        block_index.push(BlockIndexEntry {
            rolling_checksum: RollingChecksum::new(span).value(),
            strong_hash: strong_hash(span),
            block: BlockRef::BackReference {
                previous_block_number: m.previous_block_number,
            },
        });
        cursor = m.offset + m.length;
    }
    if cursor < plaintext.len() {
        push_literal_span(&plaintext[cursor..], &mut chunks, &mut block_index)?;
    }

    Ok(EncodedFile {
        container_id,
        other_file_id,
        attrs_blob,
        chunks,
        block_index,
    })
}

/// Decodes a full (non-patch) encoded file back into attributes and
/// plaintext content. Patches must go through [`patch::combine_plaintext`]
/// against their previous version instead.
pub fn decode_full(file: &EncodedFile, keys: &AccountKeys) -> Result<(FileAttributes, Vec<u8>), EfcError> {
    if file.is_patch() {
        return Err(EfcError::NoPreviousVersionForPatch);
    }
    let attrs = FileAttributes::decrypt(&file.attrs_blob, keys)?;
    let mut content = Vec::new();
    for (chunk, entry) in file.chunks.iter().zip(&file.block_index) {
        if entry.is_back_reference() {
            return Err(EfcError::BlockIndexMismatch);
        }
        content.extend_from_slice(&keys.decrypt_chunk(chunk)?);
    }
    Ok((attrs, content))
}

/// Writes the wire form: magic, header, attributes, chunks in file order,
/// then the block index. The chunk loop has no explicit count; a reader
/// knows it has reached the block index when the next `u32` it reads is
/// [`blockindex::BLOCK_INDEX_MAGIC`] instead of a chunk length.
pub fn write_stream<W: Write>(file: &EncodedFile, w: &mut W) -> std::io::Result<()> {
    U32Be(FILE_MAGIC_V1).write_to(w)?;
    U64Be(file.container_id).write_to(w)?;
    U64Be(file.other_file_id).write_to(w)?;
    U32Be(file.attrs_blob.len() as u32).write_to(w)?;
    w.write_all(&file.attrs_blob)?;
    for chunk in &file.chunks {
        U32Be(chunk.len() as u32).write_to(w)?;
        w.write_all(chunk)?;
    }
    blockindex::write_block_index(w, &file.block_index)
}

pub fn read_stream<R: Read>(r: &mut R) -> Result<EncodedFile, EfcError> {
    let magic = U32Be::read_from(r).map_err(|_| EfcError::Truncated)?.get();
    if magic != FILE_MAGIC_V1 {
        return Err(EfcError::BadMagic);
    }
    let container_id = U64Be::read_from(r).map_err(|_| EfcError::Truncated)?.get();
    let other_file_id = U64Be::read_from(r).map_err(|_| EfcError::Truncated)?.get();
    let attrs_len = U32Be::read_from(r).map_err(|_| EfcError::Truncated)?.get() as usize;
    let mut attrs_blob = vec![0u8; attrs_len];
    r.read_exact(&mut attrs_blob)
        .map_err(|_| EfcError::AttributesBlockCorrupt)?;

    let mut chunks = Vec::new();
    let block_index = loop {
        let field = U32Be::read_from(r).map_err(|_| EfcError::Truncated)?.get();
        if field == blockindex::BLOCK_INDEX_MAGIC {
            break blockindex::read_block_index_body(r)?;
        }
        let mut chunk = vec![0u8; field as usize];
        r.read_exact(&mut chunk).map_err(|_| EfcError::Truncated)?;
        chunks.push(chunk);
    };

    Ok(EncodedFile {
        container_id,
        other_file_id,
        attrs_blob,
        chunks,
        block_index,
    })
}

/// Structural result of [`verify`]: doesn't decrypt anything, just confirms
/// the stream is well-formed enough for the server to store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyInfo {
    pub other_file_id: u64,
    pub num_chunks: usize,
    pub num_block_index_entries: usize,
}

/// Structural verification suitable for the server, which never holds the
/// keys to decrypt anything: magic, header, attributes-block framing,
/// every declared chunk length fits inside the remaining stream, and the
/// block index tail is present.
pub fn verify(bytes: &[u8]) -> Result<VerifyInfo, EfcError> {
    let mut cursor = std::io::Cursor::new(bytes);
    let magic = U32Be::read_from(&mut cursor)
        .map_err(|_| EfcError::Truncated)?
        .get();
    if magic != FILE_MAGIC_V1 && magic != FILE_MAGIC_V0 {
        return Err(EfcError::BadMagic);
    }
    let _container_id = U64Be::read_from(&mut cursor).map_err(|_| EfcError::Truncated)?;
    let other_file_id = U64Be::read_from(&mut cursor)
        .map_err(|_| EfcError::Truncated)?
        .get();
    let attrs_len = U32Be::read_from(&mut cursor)
        .map_err(|_| EfcError::Truncated)?
        .get() as u64;
    let pos = cursor.position();
    if pos + attrs_len > bytes.len() as u64 {
        return Err(EfcError::AttributesBlockCorrupt);
    }
    cursor.set_position(pos + attrs_len);

    let mut num_chunks = 0usize;
    let num_block_index_entries = loop {
        let field = U32Be::read_from(&mut cursor)
            .map_err(|_| EfcError::Truncated)?
            .get();
        if field == blockindex::BLOCK_INDEX_MAGIC {
            let num = U64Be::read_from(&mut cursor)
                .map_err(|_| EfcError::Truncated)?
                .get();
            let remaining = bytes.len() as u64 - cursor.position();
            let entry_len = 4 + crate::crypto::STRONG_HASH_LEN as u64 + 8;
            if num * entry_len > remaining {
                return Err(EfcError::BlockIndexMismatch);
            }
            break num as usize;
        }
        let chunk_len = field as u64;
        let pos = cursor.position();
        if pos + chunk_len > bytes.len() as u64 {
            return Err(EfcError::Truncated);
        }
        cursor.set_position(pos + chunk_len);
        num_chunks += 1;
    };

    Ok(VerifyInfo {
        other_file_id,
        num_chunks,
        num_block_index_entries,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn keys() -> AccountKeys {
        AccountKeys::new([5u8; 32], [6u8; 32])
    }

    fn attrs() -> FileAttributes {
        FileAttributes {
            uid: 1,
            gid: 1,
            mode: 0o600,
            mtime: 10,
            attr_mtime: 10,
            symlink_target: None,
            xattrs: Vec::new(),
        }
    }

    #[test]
    fn full_file_encodes_verifies_and_decodes() {
        let keys = keys();
        let plaintext: Vec<u8> = (0..57u32).map(|i| i as u8).collect();
        let encoded = encode_full(&plaintext, &attrs(), &keys, 1).unwrap();

        let mut bytes = Vec::new();
        write_stream(&encoded, &mut bytes).unwrap();

        let info = verify(&bytes).unwrap();
        assert_eq!(info.other_file_id, 0);

        let mut cursor = &bytes[..];
        let read_back = read_stream(&mut cursor).unwrap();
        let (decoded_attrs, content) = decode_full(&read_back, &keys).unwrap();
        assert_eq!(content, plaintext);
        assert_eq!(decoded_attrs, attrs());
    }

    #[test]
    fn patch_against_previous_combines_back_to_the_new_content() {
        let keys = keys();
        let version_a = vec![b'A'; 4096];
        let mut version_b = version_a.clone();
        version_b.extend_from_slice(b"BBBB");

        let full_a = encode_full(&version_a, &attrs(), &keys, 1).unwrap();
        let patch_b = encode_patch(&version_b, &attrs(), &keys, 1, 2, &full_a.block_index).unwrap();
        assert!(patch_b.is_patch());
        // Version A's only chunk (4096 bytes) is an exact prefix of B, so
        // the patch must back-reference it rather than re-sending it.
        assert!(patch_b.block_index[0].is_back_reference());

        let previous_chunks = patch::decode_literal_chunks(&full_a, &keys).unwrap();
        let combined = patch::combine_plaintext(&patch_b, &previous_chunks, &keys).unwrap();
        assert_eq!(combined, version_b);
    }

    #[test]
    fn verify_rejects_bad_magic() {
        let mut bytes = vec![0u8; 32];
        bytes[0] = 0xff;
        assert_eq!(verify(&bytes), Err(EfcError::BadMagic));
    }

    #[test]
    fn verify_rejects_truncated_stream() {
        let keys = keys();
        let encoded = encode_full(b"hello", &attrs(), &keys, 1).unwrap();
        let mut bytes = Vec::new();
        write_stream(&encoded, &mut bytes).unwrap();
        bytes.truncate(bytes.len() - 4);
        assert!(verify(&bytes).is_err());
    }
}
