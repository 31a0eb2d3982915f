//! Property tests for the striping math in `sos::stripe`: arbitrary payload
//! lengths and block sizes, reconstructed after losing either data stripe,
//! plus the block-count accounting the session and checker both rely on.

use coldvault::sos::stripe::{block_count, build_stripes, interleave, reconstruct_from_stripe1_and_parity, reconstruct_from_stripe2_and_parity, total_len_from_parity};
use proptest::collection::vec;
use proptest::prelude::*;

fn block_size_strategy() -> impl Strategy<Value = usize> {
    1usize..=64
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Losing stripe-1 is always survivable: stripe-2 plus parity reproduce
    /// the exact original payload, for any length and any block size.
    #[test]
    fn reconstructs_after_losing_stripe1(
        payload in vec(any::<u8>(), 0..2000),
        block_size in block_size_strategy(),
    ) {
        let (_s1, s2, parity) = build_stripes(&payload, block_size);
        let total = total_len_from_parity(&parity).unwrap();
        prop_assert_eq!(total, payload.len() as u64);
        let recovered = reconstruct_from_stripe2_and_parity(&s2, &parity, block_size, total);
        prop_assert_eq!(recovered, payload);
    }

    /// Losing stripe-2 is symmetric: stripe-1 plus parity reproduce it too.
    #[test]
    fn reconstructs_after_losing_stripe2(
        payload in vec(any::<u8>(), 0..2000),
        block_size in block_size_strategy(),
    ) {
        let (s1, _s2, parity) = build_stripes(&payload, block_size);
        let total = total_len_from_parity(&parity).unwrap();
        let recovered = reconstruct_from_stripe1_and_parity(&s1, &parity, block_size, total);
        prop_assert_eq!(recovered, payload);
    }

    /// With neither stripe lost, interleaving them directly (no parity
    /// needed) reproduces the payload too.
    #[test]
    fn interleave_reconstructs_with_no_loss(
        payload in vec(any::<u8>(), 0..2000),
        block_size in block_size_strategy(),
    ) {
        let (s1, s2, _parity) = build_stripes(&payload, block_size);
        prop_assert_eq!(interleave(&s1, &s2, block_size), payload);
    }

    /// The block size accounting a stored object reports is the sum of the
    /// ceiling block counts of whichever stripe files are present -- never
    /// negative, never more than one block short of `len/block_size`.
    #[test]
    fn block_count_is_a_tight_ceiling(
        len in 0usize..100_000,
        block_size in 1usize..=4096,
    ) {
        let blocks = block_count(len, block_size);
        prop_assert!(blocks * block_size as u64 >= len as u64);
        if len > 0 {
            prop_assert!((blocks - 1) * block_size as u64 < len as u64);
        } else {
            prop_assert_eq!(blocks, 0);
        }
    }

    /// Total stored block count (stripe1 + stripe2 + parity-with-trailer)
    /// never exceeds roughly double the unstriped ceiling plus the trailer's
    /// own one extra block, since each data stripe holds about half the
    /// payload.
    #[test]
    fn striped_block_count_matches_building_blocks(
        payload in vec(any::<u8>(), 0..2000),
        block_size in block_size_strategy(),
    ) {
        let (s1, s2, parity) = build_stripes(&payload, block_size);
        let total_blocks = block_count(s1.len(), block_size)
            + block_count(s2.len(), block_size)
            + block_count(parity.len(), block_size);
        // Parity is the same length as the larger of the two data stripes
        // plus an 8-byte trailer, so its own block ceiling is never smaller
        // than either data stripe's.
        prop_assert!(total_blocks >= block_count(s1.len(), block_size));
        prop_assert!(total_blocks >= block_count(s2.len(), block_size));
    }
}
