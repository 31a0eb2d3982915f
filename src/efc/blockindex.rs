//! The trailing per-chunk table inside an encoded file stream: one entry
//! per logical chunk, each either a literal encrypted chunk or a
//! back-reference into a previous version.

use crate::crypto::STRONG_HASH_LEN;
use crate::error::EfcError;
use crate::wire::{U32Be, U64Be};
use std::io::{Read, Write};

pub const BLOCK_INDEX_MAGIC: u32 = 0x6269_6478; // 'bidx'

/// High bit of the wire `encoded_size` field marks a back-reference rather
/// than a literal chunk length.
const BACKREF_BIT: u64 = 1 << 63;

/// What a block index entry points at: bytes actually present in this
/// object's chunk stream, or a block number inside an older object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Literal { encoded_size: u32 },
    BackReference { previous_block_number: u64 },
}

/// One row of the block index: the rolling checksum and strong hash of the
/// plaintext chunk (recorded for every chunk, literal or not, so a future
/// version can diff against this one), and where its bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub rolling_checksum: u32,
    pub strong_hash: [u8; STRONG_HASH_LEN],
    pub block: BlockRef,
}

impl BlockIndexEntry {
    fn encoded_size_field(&self) -> u64 {
        match self.block {
            BlockRef::Literal { encoded_size } => encoded_size as u64,
            BlockRef::BackReference {
                previous_block_number,
            } => BACKREF_BIT | previous_block_number,
        }
    }

    fn from_field(rolling_checksum: u32, strong_hash: [u8; STRONG_HASH_LEN], field: u64) -> Self {
        let block = if field & BACKREF_BIT != 0 {
            BlockRef::BackReference {
                previous_block_number: field & !BACKREF_BIT,
            }
        } else {
            BlockRef::Literal {
                encoded_size: field as u32,
            }
        };
        BlockIndexEntry {
            rolling_checksum,
            strong_hash,
            block,
        }
    }

    pub fn is_back_reference(&self) -> bool {
        matches!(self.block, BlockRef::BackReference { .. })
    }

    /// The plaintext length of the chunk this entry describes, recovered
    /// from the AEAD-wrapped `encoded_size` without a dedicated wire field.
    /// `None` for a back-reference, whose entry doesn't carry a size at all
    /// (its length is whatever the referenced previous block's was).
    pub fn plaintext_len(&self) -> Option<usize> {
        match self.block {
            BlockRef::Literal { encoded_size } => {
                Some(encoded_size as usize - crate::crypto::AEAD_OVERHEAD)
            }
            BlockRef::BackReference { .. } => None,
        }
    }
}

pub fn write_block_index<W: Write>(w: &mut W, entries: &[BlockIndexEntry]) -> std::io::Result<()> {
    U32Be(BLOCK_INDEX_MAGIC).write_to(w)?;
    U64Be(entries.len() as u64).write_to(w)?;
    for e in entries {
        U32Be(e.rolling_checksum).write_to(w)?;
        w.write_all(&e.strong_hash)?;
        U64Be(e.encoded_size_field()).write_to(w)?;
    }
    Ok(())
}

/// Reads a block index whose magic has already been consumed by the caller
/// (the outer stream reader needs to peek that `u32` to know the chunk
/// loop has ended, see `efc::read_stream`).
pub fn read_block_index_body<R: Read>(r: &mut R) -> Result<Vec<BlockIndexEntry>, EfcError> {
    let num = U64Be::read_from(r)
        .map_err(|_| EfcError::Truncated)?
        .get();
    let mut entries = Vec::with_capacity(num as usize);
    for _ in 0..num {
        let rolling = U32Be::read_from(r).map_err(|_| EfcError::Truncated)?.get();
        let mut strong = [0u8; STRONG_HASH_LEN];
        r.read_exact(&mut strong).map_err(|_| EfcError::Truncated)?;
        let field = U64Be::read_from(r).map_err(|_| EfcError::Truncated)?.get();
        entries.push(BlockIndexEntry::from_field(rolling, strong, field));
    }
    Ok(entries)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrips_literal_and_backref_entries() {
        let entries = vec![
            BlockIndexEntry {
                rolling_checksum: 0xabcd,
                strong_hash: [1u8; STRONG_HASH_LEN],
                block: BlockRef::Literal { encoded_size: 4096 },
            },
            BlockIndexEntry {
                rolling_checksum: 0x1234,
                strong_hash: [2u8; STRONG_HASH_LEN],
                block: BlockRef::BackReference {
                    previous_block_number: 7,
                },
            },
        ];
        let mut buf = Vec::new();
        write_block_index(&mut buf, &entries).unwrap();
        let mut cursor = &buf[..];
        let magic = U32Be::read_from(&mut cursor).unwrap().get();
        assert_eq!(magic, BLOCK_INDEX_MAGIC);
        let back = read_block_index_body(&mut cursor).unwrap();
        assert_eq!(back, entries);
    }

    #[test]
    fn plaintext_len_recovers_size_for_literal_only() {
        let literal = BlockIndexEntry {
            rolling_checksum: 0,
            strong_hash: [0u8; STRONG_HASH_LEN],
            block: BlockRef::Literal {
                encoded_size: 4096 + crate::crypto::AEAD_OVERHEAD as u32,
            },
        };
        assert_eq!(literal.plaintext_len(), Some(4096));

        let backref = BlockIndexEntry {
            rolling_checksum: 0,
            strong_hash: [0u8; STRONG_HASH_LEN],
            block: BlockRef::BackReference {
                previous_block_number: 3,
            },
        };
        assert_eq!(backref.plaintext_len(), None);
    }
}
