//! Network-byte-order primitives for on-disk and on-wire integers.
//!
//! Every multi-byte integer in a store file or a protocol frame is big
//! endian. Wrapping each width in its own newtype makes an accidental
//! host-order write a compile error instead of a corrupt store.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

macro_rules! be_newtype {
    ($name:ident, $inner:ty, $read:ident, $write:ident) => {
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub $inner);

        impl $name {
            pub fn get(self) -> $inner {
                self.0
            }

            pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
                Ok($name(r.$read::<BigEndian>()?))
            }

            pub fn write_to<W: Write>(self, w: &mut W) -> io::Result<()> {
                w.$write::<BigEndian>(self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(v: $inner) -> Self {
                $name(v)
            }
        }

        impl From<$name> for $inner {
            fn from(v: $name) -> Self {
                v.0
            }
        }
    };
}

be_newtype!(U64Be, u64, read_u64, write_u64);
be_newtype!(U32Be, u32, read_u32, write_u32);
be_newtype!(U16Be, u16, read_u16, write_u16);

/// Reads a single byte, used for framing bytes and one-byte tags.
pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    r.read_u8()
}

/// Writes a single byte.
pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_u8(v)
}

/// Reads a `u32`-length-prefixed byte blob.
pub fn read_blob<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = U32Be::read_from(r)?.get() as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Writes a `u32`-length-prefixed byte blob.
pub fn write_blob<W: Write>(w: &mut W, data: &[u8]) -> io::Result<()> {
    U32Be(data.len() as u32).write_to(w)?;
    w.write_all(data)
}

/// Reads a `u16`-length-prefixed byte blob (used for directory-entry names).
pub fn read_blob16<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = U16Be::read_from(r)?.get() as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Writes a `u16`-length-prefixed byte blob.
pub fn write_blob16<W: Write>(w: &mut W, data: &[u8]) -> io::Result<()> {
    U16Be(data.len() as u16).write_to(w)?;
    w.write_all(data)
}
