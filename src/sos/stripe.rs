//! Pure block-splitting math shared by the writer and the reader: how a
//! payload is divided into stripe-1 (even blocks), stripe-2 (odd blocks)
//! and parity (XOR of both, plus an 8-byte size trailer).

/// Splits `payload` into fixed-size blocks, the last one possibly short.
pub fn blocks(payload: &[u8], block_size: usize) -> Vec<&[u8]> {
    payload.chunks(block_size).collect()
}

/// Builds stripe-1, stripe-2 and parity (with its trailing 8-byte size
/// field) from a full payload.
pub fn build_stripes(payload: &[u8], block_size: usize) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let blks = blocks(payload, block_size);
    let mut stripe1 = Vec::new();
    let mut stripe2 = Vec::new();
    let mut parity = Vec::new();

    let mut i = 0;
    while i < blks.len() {
        let even = blks[i];
        stripe1.extend_from_slice(even);
        let odd = blks.get(i + 1).copied().unwrap_or(&[]);
        stripe2.extend_from_slice(odd);
        parity.extend_from_slice(&xor_blocks(even, odd));
        i += 2;
    }

    parity.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    (stripe1, stripe2, parity)
}

fn xor_blocks(a: &[u8], b: &[u8]) -> Vec<u8> {
    let len = a.len().max(b.len());
    let mut out = vec![0u8; len];
    for (i, slot) in out.iter_mut().enumerate() {
        let av = a.get(i).copied().unwrap_or(0);
        let bv = b.get(i).copied().unwrap_or(0);
        *slot = av ^ bv;
    }
    out
}

/// Reconstructs the full payload from stripe-1 and parity (stripe-2
/// missing), given the original total length recorded in parity's trailer.
pub fn reconstruct_from_stripe1_and_parity(
    stripe1: &[u8],
    parity_with_trailer: &[u8],
    block_size: usize,
    total_len: u64,
) -> Vec<u8> {
    let parity = strip_trailer(parity_with_trailer);
    reconstruct(stripe1, parity, block_size, total_len, true)
}

/// Reconstructs the full payload from stripe-2 and parity (stripe-1
/// missing).
pub fn reconstruct_from_stripe2_and_parity(
    stripe2: &[u8],
    parity_with_trailer: &[u8],
    block_size: usize,
    total_len: u64,
) -> Vec<u8> {
    let parity = strip_trailer(parity_with_trailer);
    reconstruct(stripe2, parity, block_size, total_len, false)
}

fn strip_trailer(parity_with_trailer: &[u8]) -> &[u8] {
    let cut = parity_with_trailer.len().saturating_sub(8);
    &parity_with_trailer[..cut]
}

/// Reads the 8-byte total-length trailer out of a parity file.
pub fn total_len_from_parity(parity_with_trailer: &[u8]) -> Option<u64> {
    if parity_with_trailer.len() < 8 {
        return None;
    }
    let cut = parity_with_trailer.len() - 8;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&parity_with_trailer[cut..]);
    Some(u64::from_be_bytes(buf))
}

fn reconstruct(
    present: &[u8],
    parity: &[u8],
    block_size: usize,
    total_len: u64,
    present_is_stripe1: bool,
) -> Vec<u8> {
    let present_blocks = blocks(present, block_size);
    let parity_blocks = blocks(parity, block_size);
    let mut out = Vec::with_capacity(total_len as usize);

    for j in 0..parity_blocks.len() {
        let present_block = present_blocks.get(j).copied().unwrap_or(&[]);
        let recovered = xor_blocks(present_block, parity_blocks[j]);
        if present_is_stripe1 {
            out.extend_from_slice(present_block);
            out.extend_from_slice(&recovered);
        } else {
            out.extend_from_slice(&recovered);
            out.extend_from_slice(present_block);
        }
    }

    out.truncate(total_len as usize);
    out
}

/// Interleaves stripe-1 and stripe-2 back into the original payload when
/// both are present: neither needs padding since `chunks()` never pads, so
/// the exact original length falls out of the two stripes' own lengths.
pub fn interleave(stripe1: &[u8], stripe2: &[u8], block_size: usize) -> Vec<u8> {
    let b1 = blocks(stripe1, block_size);
    let b2 = blocks(stripe2, block_size);
    let mut out = Vec::with_capacity(stripe1.len() + stripe2.len());
    for j in 0..b1.len().max(b2.len()) {
        if let Some(blk) = b1.get(j) {
            out.extend_from_slice(blk);
        }
        if let Some(blk) = b2.get(j) {
            out.extend_from_slice(blk);
        }
    }
    out
}

/// Number of striping-unit blocks a stripe file occupies, rounding up.
pub fn block_count(stripe_len: usize, block_size: usize) -> u64 {
    if block_size == 0 {
        return 0;
    }
    ((stripe_len + block_size - 1) / block_size) as u64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrips_even_length_payload() {
        let payload: Vec<u8> = (0..64u32).map(|i| i as u8).collect();
        let (s1, s2, parity) = build_stripes(&payload, 8);
        let total = total_len_from_parity(&parity).unwrap();
        assert_eq!(total, payload.len() as u64);
        let from1 = reconstruct_from_stripe1_and_parity(&s1, &parity, 8, total);
        assert_eq!(from1, payload);
        let from2 = reconstruct_from_stripe2_and_parity(&s2, &parity, 8, total);
        assert_eq!(from2, payload);
    }

    #[test]
    fn roundtrips_odd_block_count_payload() {
        let payload: Vec<u8> = (0..57u32).map(|i| i as u8).collect();
        let (s1, s2, parity) = build_stripes(&payload, 8);
        let total = total_len_from_parity(&parity).unwrap();
        let from1 = reconstruct_from_stripe1_and_parity(&s1, &parity, 8, total);
        assert_eq!(from1, payload);
        let from2 = reconstruct_from_stripe2_and_parity(&s2, &parity, 8, total);
        assert_eq!(from2, payload);
    }

    #[test]
    fn interleave_reconstructs_exactly_when_both_stripes_present() {
        let payload: Vec<u8> = (0..57u32).map(|i| i as u8).collect();
        let (s1, s2, _parity) = build_stripes(&payload, 8);
        assert_eq!(interleave(&s1, &s2, 8), payload);
    }

    #[test]
    fn block_count_rounds_up() {
        assert_eq!(block_count(0, 1024), 0);
        assert_eq!(block_count(1, 1024), 1);
        assert_eq!(block_count(1024, 1024), 1);
        assert_eq!(block_count(1025, 1024), 2);
    }
}
