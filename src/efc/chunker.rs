//! Splitting plaintext content into chunks: the default fixed-size
//! chunker, and the content-defined chunker that finds patch opportunities
//! against a previous version's block index.

use super::blockindex::BlockIndexEntry;
use crate::crypto::{strong_hash, RollingChecksum, STRONG_HASH_LEN};
use std::collections::HashMap;

pub const DEFAULT_FIXED_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_CDC_MIN: usize = 1024;
pub const DEFAULT_CDC_MAX: usize = 16384;

/// Splits `data` into fixed-size chunks, the last one possibly short.
pub fn fixed_size_chunks(data: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    if chunk_size == 0 || data.is_empty() {
        return if data.is_empty() { Vec::new() } else { vec![data] };
    }
    data.chunks(chunk_size).collect()
}

/// Candidates for one previous-version block length: rolling checksum to
/// block-number/strong-hash pairs.
type WindowTable = HashMap<u32, Vec<(u64, [u8; STRONG_HASH_LEN])>>;

/// A previous version's chunk identity, grouped by the plaintext length of
/// the block it came from — a match can only ever be found by scanning
/// with a window the same size as the block it is meant to reproduce, so
/// the table is keyed on that length first and checksum second.
pub type ChecksumTable = HashMap<usize, WindowTable>;

/// Builds the lookup table an encoder diffs new content against, from a
/// previous version's block index alone — no previous plaintext is needed,
/// matching spec.md §4.3 ("the server has offered a previous-version block
/// index"). Back-reference entries are skipped: their plaintext length
/// isn't recorded on the wire, and the previous version handed to an
/// encoder is always the current (full) object, whose own index is all
/// literal entries.
pub fn build_checksum_table(previous_index: &[BlockIndexEntry]) -> ChecksumTable {
    let mut table: ChecksumTable = HashMap::new();
    for (i, entry) in previous_index.iter().enumerate() {
        let Some(len) = entry.plaintext_len() else {
            continue;
        };
        table
            .entry(len)
            .or_default()
            .entry(entry.rolling_checksum)
            .or_default()
            .push((i as u64, entry.strong_hash));
    }
    table
}

/// A span of `data` that matched a previous version's chunk.
#[derive(Debug, Clone, Copy)]
pub struct Match {
    pub offset: usize,
    pub length: usize,
    pub previous_block_number: u64,
}

/// Scans `data` once per distinct block length present in `table` (longest
/// first), each pass sliding a window exactly that block's size — a block's
/// rolling checksum and strong hash can only ever agree with a span of the
/// same length it was computed over. Matches from every pass are then
/// merged by earliest offset, preferring the longest match at a given
/// offset, dropping any that overlaps one already kept. A span that grows
/// past `max` bytes without a hit is left for the caller to chunk as
/// ordinary literal content (see `efc::encode_with_matches`).
pub fn find_matches(data: &[u8], min: usize, max: usize, table: &ChecksumTable) -> Vec<Match> {
    let mut windows: Vec<usize> = table.keys().copied().filter(|&w| w > 0 && w <= data.len()).collect();
    windows.sort_unstable_by(|a, b| b.cmp(a));

    let mut candidates = Vec::new();
    for window in windows {
        let window_table = &table[&window];
        candidates.extend(scan_window(data, window, min, max, window_table));
    }

    candidates.sort_by(|a, b| a.offset.cmp(&b.offset).then(b.length.cmp(&a.length)));
    let mut matches = Vec::new();
    let mut next_free = 0usize;
    for m in candidates {
        if m.offset >= next_free {
            next_free = m.offset + m.length;
            matches.push(m);
        }
    }
    matches
}

/// A single fixed-window scan, one previous-version block length at a time.
fn scan_window(data: &[u8], window: usize, min: usize, max: usize, table: &WindowTable) -> Vec<Match> {
    let mut matches = Vec::new();

    let mut last_cut = 0usize;
    let mut pos = 0usize;
    let mut rc = RollingChecksum::new(&data[pos..pos + window]);

    while pos + window <= data.len() {
        let span_so_far = pos + window - last_cut;
        if span_so_far >= min {
            if let Some(hit) = lookup(&data[pos..pos + window], &rc, table) {
                matches.push(Match {
                    offset: pos,
                    length: window,
                    previous_block_number: hit,
                });
                last_cut = pos + window;
                pos = last_cut;
                if pos + window > data.len() {
                    break;
                }
                rc = RollingChecksum::new(&data[pos..pos + window]);
                continue;
            }
        }
        if span_so_far >= max {
            // Force a cut so unmatched spans stay bounded; the caller
            // chunks the literal bytes up to here independently.
            last_cut = pos + 1;
        }
        if pos + 1 + window > data.len() {
            break;
        }
        rc.roll_forward(&data[pos..pos + 1], &data[pos + window..pos + window + 1], window as u16, 1);
        pos += 1;
    }

    matches
}

fn lookup(window: &[u8], rc: &RollingChecksum, table: &WindowTable) -> Option<u64> {
    let candidates = table.get(&rc.value())?;
    let hash = strong_hash(window);
    candidates
        .iter()
        .find(|(_, h)| *h == hash)
        .map(|(block, _)| *block)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::efc::blockindex::BlockRef;

    /// A literal block-index entry as `encode_full` would actually emit:
    /// `encoded_size` is the AEAD-wrapped length, so `plaintext_len()`
    /// recovers `chunk.len()` exactly.
    fn literal_entry(chunk: &[u8]) -> BlockIndexEntry {
        BlockIndexEntry {
            rolling_checksum: RollingChecksum::new(chunk).value(),
            strong_hash: strong_hash(chunk),
            block: BlockRef::Literal {
                encoded_size: (chunk.len() + crate::crypto::AEAD_OVERHEAD) as u32,
            },
        }
    }

    #[test]
    fn fixed_chunks_cover_the_whole_input_with_a_short_last_chunk() {
        let data = vec![0u8; 4100];
        let chunks = fixed_size_chunks(&data, DEFAULT_FIXED_CHUNK_SIZE);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), DEFAULT_FIXED_CHUNK_SIZE);
        assert_eq!(chunks[1].len(), 4);
    }

    #[test]
    fn recovers_plaintext_len_of_a_literal_entry_from_its_encoded_size() {
        let entry = literal_entry(&vec![b'A'; DEFAULT_FIXED_CHUNK_SIZE]);
        assert_eq!(entry.plaintext_len(), Some(DEFAULT_FIXED_CHUNK_SIZE));
    }

    #[test]
    fn finds_a_match_at_the_previous_version_s_own_block_size() {
        // The window a real previous version offers is a whole fixed-size
        // chunk (4096 bytes here), not an arbitrary small span: this is the
        // scenario the hardcoded 64-byte scan window used to miss entirely.
        let previous_chunk = vec![b'A'; DEFAULT_FIXED_CHUNK_SIZE];
        let previous_index = vec![literal_entry(&previous_chunk)];
        let table = build_checksum_table(&previous_index);

        let mut data = previous_chunk.clone();
        data.extend_from_slice(b"BBBB");

        let matches = find_matches(&data, 1, DEFAULT_CDC_MAX, &table);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].offset, 0);
        assert_eq!(matches[0].length, DEFAULT_FIXED_CHUNK_SIZE);
        assert_eq!(matches[0].previous_block_number, 0);
    }

    #[test]
    fn finds_matches_of_differing_previous_block_sizes_in_one_scan() {
        // A previous version's final chunk is shorter than the rest; the
        // scanner must try both lengths, not just the modal one.
        let full_chunk = vec![b'A'; DEFAULT_FIXED_CHUNK_SIZE];
        let short_chunk = b"TAIL".to_vec();
        let previous_index = vec![literal_entry(&full_chunk), literal_entry(&short_chunk)];
        let table = build_checksum_table(&previous_index);
        assert_eq!(table.len(), 2);

        let mut data = b"XXXX".to_vec();
        data.extend_from_slice(&short_chunk);
        data.extend_from_slice(&full_chunk);

        let matches = find_matches(&data, 1, DEFAULT_CDC_MAX, &table);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].offset, 4);
        assert_eq!(matches[0].length, short_chunk.len());
        assert_eq!(matches[0].previous_block_number, 1);
        assert_eq!(matches[1].offset, 4 + short_chunk.len());
        assert_eq!(matches[1].length, DEFAULT_FIXED_CHUNK_SIZE);
        assert_eq!(matches[1].previous_block_number, 0);
    }

    #[test]
    fn finds_no_matches_against_an_empty_table() {
        let table = ChecksumTable::new();
        let data = b"some content that matches nothing".to_vec();
        assert!(find_matches(&data, 1, DEFAULT_CDC_MAX, &table).is_empty());
    }
}
