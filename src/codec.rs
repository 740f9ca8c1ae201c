//! Length-prefixed binary codec for the index tree.
//!
//! The wire format is documented in full at the top of the crate's design
//! notes: a one-byte kind tag (`F`/`D`), length-prefixed strings, and
//! fixed-width big-endian metadata fields for directories. This module knows
//! nothing about the in-memory arena the [`crate::index::Index`] uses; it
//! only round-trips a plain recursive [`Entry`] tree, which keeps it
//! independently testable.

use crate::error::{Error, Result};
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use std::io::{Read, Write};

const KIND_FILE: u8 = b'F';
const KIND_DIR: u8 = b'D';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    File {
        name: String,
        opaque_name: String,
    },
    Directory {
        name: String,
        opaque_name: String,
        uid: u32,
        gid: u32,
        mode: u32,
        atime: u64,
        mtime: u64,
        ctime: u64,
        children: Vec<Entry>,
    },
}

impl Entry {
    pub fn name(&self) -> &str {
        match self {
            Entry::File { name, .. } | Entry::Directory { name, .. } => name,
        }
    }

    pub fn opaque_name(&self) -> &str {
        match self {
            Entry::File { opaque_name, .. } | Entry::Directory { opaque_name, .. } => opaque_name,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Entry::Directory { .. })
    }
}

trait ReadEntryExt: Read {
    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32::<BE>()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|err| Error::Format(format!("non-utf8 string: {err}")))
    }
}

trait WriteEntryExt: Write {
    fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_u32::<BE>(s.len() as u32)?;
        self.write_all(s.as_bytes())?;
        Ok(())
    }
}

impl<R: Read + ?Sized> ReadEntryExt for R {}
impl<W: Write + ?Sized> WriteEntryExt for W {}

/// Encodes `entry` (recursively, depth-first) into `writer`.
pub fn encode_entry<W: Write>(writer: &mut W, entry: &Entry) -> Result<()> {
    match entry {
        Entry::File { name, opaque_name } => {
            writer.write_u8(KIND_FILE)?;
            writer.write_string(name)?;
            writer.write_string(opaque_name)?;
        }
        Entry::Directory {
            name,
            opaque_name,
            uid,
            gid,
            mode,
            atime,
            mtime,
            ctime,
            children,
        } => {
            writer.write_u8(KIND_DIR)?;
            writer.write_string(name)?;
            writer.write_string(opaque_name)?;
            writer.write_u32::<BE>(*uid)?;
            writer.write_u32::<BE>(*gid)?;
            writer.write_u32::<BE>(*mode)?;
            writer.write_u64::<BE>(*atime)?;
            writer.write_u64::<BE>(*mtime)?;
            writer.write_u64::<BE>(*ctime)?;
            writer.write_u64::<BE>(children.len() as u64)?;
            for child in children {
                encode_entry(writer, child)?;
            }
        }
    }
    Ok(())
}

/// Decodes a single entry (recursively) from `reader`.
///
/// Trailing bytes after the root are never an error here; the caller
/// (the envelope's decrypted length) is the authority on where the stream
/// ends.
pub fn decode_entry<R: Read>(reader: &mut R) -> Result<Entry> {
    let kind = reader.read_u8()?;
    let name = reader.read_string()?;
    let opaque_name = reader.read_string()?;

    match kind {
        KIND_FILE => Ok(Entry::File { name, opaque_name }),
        KIND_DIR => {
            let uid = reader.read_u32::<BE>()?;
            let gid = reader.read_u32::<BE>()?;
            let mode = reader.read_u32::<BE>()?;
            let atime = reader.read_u64::<BE>()?;
            let mtime = reader.read_u64::<BE>()?;
            let ctime = reader.read_u64::<BE>()?;
            let child_count = reader.read_u64::<BE>()?;

            let mut children = Vec::with_capacity(child_count as usize);
            for _ in 0..child_count {
                children.push(decode_entry(reader)?);
            }

            Ok(Entry::Directory {
                name,
                opaque_name,
                uid,
                gid,
                mode,
                atime,
                mtime,
                ctime,
                children,
            })
        }
        other => Err(Error::Format(format!("unknown entry kind byte: {other:#x}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Entry {
        Entry::Directory {
            name: "/".into(),
            opaque_name: "/".into(),
            uid: 1000,
            gid: 1000,
            mode: 0o755,
            atime: 1,
            mtime: 2,
            ctime: 3,
            children: vec![
                Entry::File {
                    name: "a.txt".into(),
                    opaque_name: "x".repeat(64),
                },
                Entry::Directory {
                    name: "sub".into(),
                    opaque_name: "sub".into(),
                    uid: 0,
                    gid: 0,
                    mode: 0o700,
                    atime: 4,
                    mtime: 5,
                    ctime: 6,
                    children: vec![Entry::File {
                        name: "b.bin".into(),
                        opaque_name: "y".repeat(64),
                    }],
                },
            ],
        }
    }

    #[test]
    fn round_trips_a_nested_tree() {
        let tree = sample_tree();
        let mut buf = Vec::new();
        encode_entry(&mut buf, &tree).unwrap();

        let decoded = decode_entry(&mut buf.as_slice()).unwrap();
        assert_eq!(tree, decoded);
    }

    #[test]
    fn round_trips_an_empty_root() {
        let tree = Entry::Directory {
            name: "/".into(),
            opaque_name: "/".into(),
            uid: 0,
            gid: 0,
            mode: 0o755,
            atime: 0,
            mtime: 0,
            ctime: 0,
            children: vec![],
        };
        let mut buf = Vec::new();
        encode_entry(&mut buf, &tree).unwrap();
        assert_eq!(decode_entry(&mut buf.as_slice()).unwrap(), tree);
    }

    #[test]
    fn rejects_unknown_kind_byte() {
        let mut buf = Vec::new();
        buf.write_u8(b'X').unwrap();
        buf.write_string("n").unwrap();
        buf.write_string("o").unwrap();

        let err = decode_entry(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn tolerates_trailing_bytes_after_root() {
        let tree = Entry::File {
            name: "f".into(),
            opaque_name: "o".into(),
        };
        let mut buf = Vec::new();
        encode_entry(&mut buf, &tree).unwrap();
        buf.extend_from_slice(b"garbage-past-the-end");

        let decoded = decode_entry(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, tree);
    }
}
