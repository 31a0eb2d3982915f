//! Property tests for the encoded-file codec: any full file that round-trips
//! through `verify`/`read_stream` decodes back to exactly what was encoded,
//! and a server-side reverse-diff, whenever one is found, always combines
//! back to the exact previous content it was built from.

use coldvault::crypto::AccountKeys;
use coldvault::efc::{self, patch, FileAttributes};
use proptest::collection::vec;
use proptest::prelude::*;

fn keys() -> AccountKeys {
    AccountKeys::new([1u8; 32], [2u8; 32])
}

fn attrs(mtime: u64) -> FileAttributes {
    FileAttributes {
        uid: 0,
        gid: 0,
        mode: 0o600,
        mtime,
        attr_mtime: mtime,
        symlink_target: None,
        xattrs: Vec::new(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(192))]

    /// Any plaintext, encoded as a full file and sent through the wire
    /// format, passes structural verification and decodes back exactly.
    #[test]
    fn verify_accepts_and_decode_full_recovers_any_content(
        plaintext in vec(any::<u8>(), 0..6000),
        container_id in 1u64..10_000,
        mtime in 0u64..4_000_000_000,
    ) {
        let encoded = efc::encode_full(&plaintext, &attrs(mtime), &keys(), container_id).unwrap();
        let mut bytes = Vec::new();
        efc::write_stream(&encoded, &mut bytes).unwrap();

        let info = efc::verify(&bytes).unwrap();
        prop_assert_eq!(info.other_file_id, 0);
        prop_assert_eq!(info.num_chunks, encoded.chunks.len());
        prop_assert_eq!(info.num_block_index_entries, encoded.block_index.len());

        let decoded = efc::read_stream(&mut std::io::Cursor::new(&bytes[..])).unwrap();
        prop_assert!(!decoded.is_patch());
        let (decoded_attrs, content) = efc::decode_full(&decoded, &keys()).unwrap();
        prop_assert_eq!(content, plaintext);
        prop_assert_eq!(decoded_attrs, attrs(mtime));
    }

    /// A patch encoded against a previous version's block index always
    /// combines back to exactly the new content it was built from, whether
    /// or not it actually found anything to back-reference.
    #[test]
    fn encode_patch_always_combines_back_to_the_new_content(
        previous in vec(any::<u8>(), 0..4000),
        new_content in vec(any::<u8>(), 0..4000),
    ) {
        let full_previous = efc::encode_full(&previous, &attrs(1), &keys(), 1).unwrap();
        let patch_file = efc::encode_patch(&new_content, &attrs(2), &keys(), 1, 2, &full_previous.block_index).unwrap();
        prop_assert!(patch_file.is_patch());

        let previous_chunks = patch::decode_literal_chunks(&full_previous, &keys()).unwrap();
        let combined = patch::combine_plaintext(&patch_file, &previous_chunks, &keys()).unwrap();
        prop_assert_eq!(combined, new_content);
    }

    /// Whenever the previous version's entire content reappears as one of
    /// the new version's fixed-size chunks, reverse-diff is guaranteed to
    /// find it and must hand back a real back-reference patch that combines
    /// back to exactly the previous content -- never `None`, never
    /// something that recombines to the wrong bytes.
    #[test]
    fn reverse_diff_always_finds_a_previous_version_that_is_a_whole_chunk_of_the_new_one(
        shared in vec(any::<u8>(), 4096),
        suffix in vec(any::<u8>(), 0..2000),
    ) {
        let mut new_content = shared.clone();
        new_content.extend_from_slice(&suffix);

        let new_full = efc::encode_full(&new_content, &attrs(2), &keys(), 1).unwrap();
        let previous_attrs_blob = attrs(1).encrypt(&keys()).unwrap();

        let reverse = patch::reverse_diff(&shared, previous_attrs_blob, &new_full.block_index, 1, 99, &keys()).unwrap();
        let reverse_file = reverse.expect("the shared chunk must be found as a back-reference");
        prop_assert!(reverse_file.is_patch());
        prop_assert!(reverse_file.block_index[0].is_back_reference());

        let new_chunks = patch::decode_literal_chunks(&new_full, &keys()).unwrap();
        let recombined = patch::combine_plaintext(&reverse_file, &new_chunks, &keys()).unwrap();
        prop_assert_eq!(recombined, shared);
    }

    /// The server's reverse-diff, run against an arbitrary previous version
    /// and an arbitrary new version's block index: whenever it finds enough
    /// to build a patch, that patch combines back to exactly the previous
    /// content, never to something else.
    #[test]
    fn reverse_diff_when_found_recovers_the_exact_previous_content(
        previous in vec(any::<u8>(), 0..4000),
        new_content in vec(any::<u8>(), 0..4000),
    ) {
        let new_full = efc::encode_full(&new_content, &attrs(2), &keys(), 1).unwrap();
        let previous_attrs_blob = attrs(1).encrypt(&keys()).unwrap();

        let reverse = patch::reverse_diff(&previous, previous_attrs_blob, &new_full.block_index, 1, 99, &keys()).unwrap();
        if let Some(reverse_file) = reverse {
            prop_assert!(reverse_file.is_patch());
            let new_chunks = patch::decode_literal_chunks(&new_full, &keys()).unwrap();
            let recombined = patch::combine_plaintext(&reverse_file, &new_chunks, &keys()).unwrap();
            prop_assert_eq!(recombined, previous);
        }
    }
}
