//! Plaintext file-attribute structure and its encrypted wire encoding.
//!
//! Always the xattr-superset layout named in spec.md's Open Questions: an
//! empty `xattrs` list serializes as a zero count rather than omitting the
//! block outright, so there is exactly one on-disk shape to parse.

use crate::crypto::AccountKeys;
use crate::error::EfcError;
use crate::wire::{read_blob, read_blob16, write_blob, write_blob16, U16Be, U32Be, U64Be};
use std::io::Cursor;

/// Tag byte prefixed to the encrypted attribute blob. Only one layout
/// exists today; the tag leaves room for a future one without breaking
/// objects already on disk.
const ENCODING_GENERIC_UNIX: u8 = 1;

/// A single extended attribute, kept sorted by name on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedAttribute {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

/// Decrypted file attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub mtime: u64,
    pub attr_mtime: u64,
    pub symlink_target: Option<Vec<u8>>,
    pub xattrs: Vec<ExtendedAttribute>,
}

impl FileAttributes {
    fn serialize_plaintext(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        U32Be(self.uid).write_to(&mut buf).unwrap();
        U32Be(self.gid).write_to(&mut buf).unwrap();
        U16Be(self.mode).write_to(&mut buf).unwrap();
        U64Be(self.mtime).write_to(&mut buf).unwrap();
        U64Be(self.attr_mtime).write_to(&mut buf).unwrap();
        match &self.symlink_target {
            Some(target) => {
                buf.push(1);
                write_blob16(&mut buf, target).unwrap();
            }
            None => buf.push(0),
        }
        let mut sorted = self.xattrs.clone();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        U32Be(sorted.len() as u32).write_to(&mut buf).unwrap();
        for attr in &sorted {
            write_blob16(&mut buf, &attr.name).unwrap();
            write_blob(&mut buf, &attr.value).unwrap();
        }
        buf
    }

    fn deserialize_plaintext(data: &[u8]) -> Result<Self, EfcError> {
        let mut cursor = Cursor::new(data);
        let err = |_| EfcError::AttributesBlockCorrupt;
        let uid = U32Be::read_from(&mut cursor).map_err(err)?.get();
        let gid = U32Be::read_from(&mut cursor).map_err(err)?.get();
        let mode = U16Be::read_from(&mut cursor).map_err(err)?.get();
        let mtime = U64Be::read_from(&mut cursor).map_err(err)?.get();
        let attr_mtime = U64Be::read_from(&mut cursor).map_err(err)?.get();
        let mut has_symlink = [0u8; 1];
        std::io::Read::read_exact(&mut cursor, &mut has_symlink).map_err(err)?;
        let symlink_target = if has_symlink[0] != 0 {
            Some(read_blob16(&mut cursor).map_err(err)?)
        } else {
            None
        };
        let count = U32Be::read_from(&mut cursor).map_err(err)?.get();
        let mut xattrs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = read_blob16(&mut cursor).map_err(err)?;
            let value = read_blob(&mut cursor).map_err(err)?;
            xattrs.push(ExtendedAttribute { name, value });
        }
        Ok(FileAttributes {
            uid,
            gid,
            mode,
            mtime,
            attr_mtime,
            symlink_target,
            xattrs,
        })
    }

    /// Encrypts this structure with the account's attributes key, prefixed
    /// by the one-byte encoding tag.
    pub fn encrypt(&self, keys: &AccountKeys) -> Result<Vec<u8>, EfcError> {
        let plaintext = self.serialize_plaintext();
        let mut out = Vec::with_capacity(1 + plaintext.len() + crate::crypto::AEAD_OVERHEAD);
        out.push(ENCODING_GENERIC_UNIX);
        out.extend(keys.encrypt_attributes(&plaintext)?);
        Ok(out)
    }

    /// Decrypts an attribute blob produced by [`Self::encrypt`].
    pub fn decrypt(blob: &[u8], keys: &AccountKeys) -> Result<Self, EfcError> {
        let (tag, rest) = blob.split_first().ok_or(EfcError::AttributesBlockCorrupt)?;
        if *tag != ENCODING_GENERIC_UNIX {
            return Err(EfcError::UnknownEncoding);
        }
        let plaintext = keys.decrypt_attributes(rest)?;
        Self::deserialize_plaintext(&plaintext)
    }

    /// The cheap attribute-hash shortcut recorded on a directory entry so a
    /// client can skip re-uploading content when only attributes differ.
    pub fn shortcut_hash(&self) -> u64 {
        crate::crypto::attribute_hash(self.uid, self.gid, self.mode)
    }
}
