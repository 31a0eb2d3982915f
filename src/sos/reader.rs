//! Reading an object back: finding it in whichever of the three on-disk
//! states it's currently in, and transparently reconstructing a missing
//! stripe from its surviving sibling and parity.

use super::{stripe, StripeState};
use crate::config::DiscSet;
use crate::error::SosError;
use std::fs;
use std::io::Cursor;
use std::path::Path;

/// A fully-materialized, seekable view of an object's payload. The store
/// objects this spec covers are bounded in size, so "seekable" is realized
/// as an in-memory `Cursor` over the reconstructed bytes rather than a
/// partial/streaming reconstruction.
pub struct Reader {
    pub state: StripeState,
    cursor: Cursor<Vec<u8>>,
}

impl Reader {
    pub fn into_bytes(self) -> Vec<u8> {
        self.cursor.into_inner()
    }
}

impl std::io::Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        std::io::Read::read(&mut self.cursor, buf)
    }
}

impl std::io::Seek for Reader {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        std::io::Seek::seek(&mut self.cursor, pos)
    }
}

pub fn open_read(
    disc_set: &DiscSet,
    rel_path: &Path,
    block_size: usize,
) -> Result<Reader, SosError> {
    let write_path = super::write_path(disc_set.disc(0), rel_path);
    if write_path.exists() {
        let bytes = fs::read(&write_path).map_err(|e| SosError::Io(e.to_string()))?;
        return Ok(Reader {
            state: StripeState::Write,
            cursor: Cursor::new(bytes),
        });
    }

    let roles = super::roles_for(rel_path);
    let s1_path = super::stripe_path(disc_set.disc(roles.stripe1_disc), rel_path);
    let s2_path = super::stripe_path(disc_set.disc(roles.stripe2_disc), rel_path);
    let parity_path = super::stripe_path(disc_set.disc(roles.parity_disc), rel_path);

    let s1 = try_read_or_quarantine(disc_set.disc(roles.stripe1_disc), rel_path, &s1_path);
    let s2 = try_read_or_quarantine(disc_set.disc(roles.stripe2_disc), rel_path, &s2_path);
    let parity = try_read_or_quarantine(disc_set.disc(roles.parity_disc), rel_path, &parity_path);

    match (s1, s2, parity) {
        (None, None, _) | (None, _, None) | (_, None, None) => {
            Err(SosError::BothStripesUnreadable)
        }
        (Some(s1), Some(s2), _) => Ok(Reader {
            state: StripeState::Striped,
            cursor: Cursor::new(stripe::interleave(&s1, &s2, block_size)),
        }),
        (Some(s1), None, Some(parity)) => {
            let total_len = stripe::total_len_from_parity(&parity)
                .ok_or(SosError::FileIsDamagedNotRecoverable)?;
            let payload =
                stripe::reconstruct_from_stripe1_and_parity(&s1, &parity, block_size, total_len);
            Ok(Reader {
                state: StripeState::StripedDegraded,
                cursor: Cursor::new(payload),
            })
        }
        (None, Some(s2), Some(parity)) => {
            let total_len = stripe::total_len_from_parity(&parity)
                .ok_or(SosError::FileIsDamagedNotRecoverable)?;
            let payload =
                stripe::reconstruct_from_stripe2_and_parity(&s2, &parity, block_size, total_len);
            Ok(Reader {
                state: StripeState::StripedDegraded,
                cursor: Cursor::new(payload),
            })
        }
    }
}

/// Reads a stripe file. A genuine I/O error while reading (as opposed to
/// a clean "not found") quarantines the offending file so later opens
/// don't keep retrying a corrupt stripe.
fn try_read_or_quarantine(disc: &Path, rel_path: &Path, path: &Path) -> Option<Vec<u8>> {
    match fs::read(path) {
        Ok(data) => Some(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(_) => {
            quarantine(disc, rel_path, path);
            None
        }
    }
}

fn quarantine(disc: &Path, rel_path: &Path, path: &Path) {
    let dest = super::quarantine_path(disc, rel_path);
    if let Some(parent) = dest.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let _ = fs::rename(path, dest);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sos::writer::open_write;
    use tempfile::tempdir;

    fn disc_set(dir: &tempfile::TempDir) -> DiscSet {
        DiscSet {
            discs: [
                dir.path().join("d0"),
                dir.path().join("d1"),
                dir.path().join("d2"),
            ],
        }
    }

    #[test]
    fn reads_back_a_non_raid_write() {
        let dir = tempdir().unwrap();
        let ds = disc_set(&dir);
        let rel = Path::new("acct/o02");
        let payload = b"hello world".to_vec();
        let mut w = open_write(&ds, rel, 8).unwrap();
        w.write_all(&payload).unwrap();
        w.commit(false).unwrap();

        let reader = open_read(&ds, rel, 8).unwrap();
        assert_eq!(reader.state, StripeState::Write);
        assert_eq!(reader.into_bytes(), payload);
    }

    #[test]
    fn roundtrips_through_raid_transform() {
        let dir = tempdir().unwrap();
        let ds = disc_set(&dir);
        let rel = Path::new("acct/o02");
        let payload: Vec<u8> = (0..57u32).map(|i| i as u8).collect();
        let mut w = open_write(&ds, rel, 8).unwrap();
        w.write_all(&payload).unwrap();
        w.commit(true).unwrap();

        let reader = open_read(&ds, rel, 8).unwrap();
        assert_eq!(reader.state, StripeState::Striped);
        assert_eq!(reader.into_bytes(), payload);
    }

    #[test]
    fn degraded_read_reconstructs_after_one_stripe_is_deleted() {
        let dir = tempdir().unwrap();
        let ds = disc_set(&dir);
        let rel = Path::new("acct/o02");
        let payload: Vec<u8> = (0..57u32).map(|i| i as u8).collect();
        let mut w = open_write(&ds, rel, 8).unwrap();
        w.write_all(&payload).unwrap();
        w.commit(true).unwrap();

        let roles = super::super::roles_for(rel);
        let victim = super::super::stripe_path(ds.disc(roles.stripe1_disc), rel);
        fs::remove_file(&victim).unwrap();

        let reader = open_read(&ds, rel, 8).unwrap();
        assert_eq!(reader.state, StripeState::StripedDegraded);
        assert_eq!(reader.into_bytes(), payload);
    }

    #[test]
    fn fails_when_two_stripes_are_gone() {
        let dir = tempdir().unwrap();
        let ds = disc_set(&dir);
        let rel = Path::new("acct/o02");
        let payload: Vec<u8> = (0..57u32).map(|i| i as u8).collect();
        let mut w = open_write(&ds, rel, 8).unwrap();
        w.write_all(&payload).unwrap();
        w.commit(true).unwrap();

        let roles = super::super::roles_for(rel);
        fs::remove_file(super::super::stripe_path(ds.disc(roles.stripe1_disc), rel)).unwrap();
        fs::remove_file(super::super::stripe_path(ds.disc(roles.stripe2_disc), rel)).unwrap();

        let err = open_read(&ds, rel, 8).unwrap_err();
        assert_eq!(err, SosError::BothStripesUnreadable);
    }
}
