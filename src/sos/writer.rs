//! Committing a byte stream to the store: write to a temp file, atomically
//! rename into place, optionally transform into three RAID stripes.

use crate::config::DiscSet;
use crate::error::SosError;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

/// A fresh write in progress. Bytes are accumulated into a temp file next
/// to the eventual destination so a crash mid-write leaves only a stray
/// temp, never a half-written object.
pub struct Writer {
    disc_set: DiscSet,
    rel_path: PathBuf,
    temp_path: PathBuf,
    file: File,
    block_size: usize,
}

pub fn open_write(
    disc_set: &DiscSet,
    rel_path: &std::path::Path,
    block_size: usize,
) -> Result<Writer, SosError> {
    let temp_path = super::write_temp_path(disc_set.disc(0), rel_path);
    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent).map_err(|e| SosError::Io(e.to_string()))?;
    }
    let file = File::create(&temp_path).map_err(|e| SosError::Io(e.to_string()))?;
    Ok(Writer {
        disc_set: disc_set.clone(),
        rel_path: rel_path.to_path_buf(),
        temp_path,
        file,
        block_size,
    })
}

impl Writer {
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), SosError> {
        self.file
            .write_all(data)
            .map_err(|e| SosError::Io(e.to_string()))
    }

    /// Finishes the write. `transform` requests the non-RAID temp be
    /// split into three discs' worth of stripes; otherwise the object
    /// stays a single write file.
    pub fn commit(mut self, transform: bool) -> Result<(), SosError> {
        self.file.sync_all().map_err(|e| SosError::Io(e.to_string()))?;
        drop(self.file);

        let write_path = super::write_path(self.disc_set.disc(0), &self.rel_path);
        if let Some(parent) = write_path.parent() {
            fs::create_dir_all(parent).map_err(|e| SosError::Io(e.to_string()))?;
        }
        fs::rename(&self.temp_path, &write_path).map_err(|e| SosError::Io(e.to_string()))?;

        if transform {
            self.transform_to_raid(&write_path)?;
        }
        Ok(())
    }

    fn transform_to_raid(&self, write_path: &std::path::Path) -> Result<(), SosError> {
        let payload = fs::read(write_path).map_err(|e| SosError::Io(e.to_string()))?;
        let (stripe1, stripe2, parity) =
            super::stripe::build_stripes(&payload, self.block_size);

        let roles = super::roles_for(&self.rel_path);
        write_stripe_file(
            self.disc_set.disc(roles.stripe1_disc),
            &self.rel_path,
            &stripe1,
        )?;
        write_stripe_file(
            self.disc_set.disc(roles.stripe2_disc),
            &self.rel_path,
            &stripe2,
        )?;
        write_stripe_file(
            self.disc_set.disc(roles.parity_disc),
            &self.rel_path,
            &parity,
        )?;

        fs::remove_file(write_path).map_err(|e| SosError::Io(e.to_string()))?;
        Ok(())
    }
}

fn write_stripe_file(
    disc: &std::path::Path,
    rel_path: &std::path::Path,
    data: &[u8],
) -> Result<(), SosError> {
    let path = super::stripe_path(disc, rel_path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SosError::Io(e.to_string()))?;
    }
    let mut f = File::create(&path).map_err(|e| SosError::Io(e.to_string()))?;
    f.write_all(data).map_err(|e| SosError::Io(e.to_string()))?;
    f.sync_all().map_err(|e| SosError::Io(e.to_string()))?;
    Ok(())
}

pub(crate) fn read_to_vec(path: &std::path::Path) -> io::Result<Vec<u8>> {
    fs::read(path)
}
