//! Directory listing payload (`fileName` frames)
//!
//! Layout after the 4-byte identifier, all integers big-endian:
//! `path_len u32 | path | (kind u8, name_len u16, name)*`

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{FmError, Result};
use crate::protocol_core::Identifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File = 0,
    Directory = 1,
}

impl EntryKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(EntryKind::File),
            1 => Some(EntryKind::Directory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Full `fileName` frame, identifier included. Names longer than `u16::MAX`
/// bytes cannot be represented and are skipped.
pub fn encode_listing(path: &str, entries: &[DirEntry]) -> Bytes {
    let mut out = BytesMut::with_capacity(8 + path.len() + entries.len() * 16);
    out.put_slice(Identifier::FileName.bytes());
    out.put_u32(path.len() as u32);
    out.put_slice(path.as_bytes());
    for e in entries {
        let Ok(len) = u16::try_from(e.name.len()) else {
            continue;
        };
        out.put_u8(e.kind as u8);
        out.put_u16(len);
        out.put_slice(e.name.as_bytes());
    }
    out.freeze()
}

/// Parse the payload that follows the identifier. Truncation, an unknown kind
/// byte or non-UTF-8 text is an error, never an empty listing.
pub fn parse_listing(payload: &[u8]) -> Result<(String, Vec<DirEntry>)> {
    let mut cur = Cursor { buf: payload, pos: 0 };

    let path_len = u32::from_be_bytes(cur.take_array("path length")?) as usize;
    let path = cur.take_str(path_len, "path")?;

    let mut entries = Vec::new();
    while !cur.is_empty() {
        let [kind] = cur.take_array::<1>("entry kind")?;
        let kind = EntryKind::from_byte(kind).ok_or_else(|| {
            FmError::Decode(format!("unknown entry kind {} at byte {}", kind, cur.pos - 1))
        })?;
        let name_len = u16::from_be_bytes(cur.take_array("name length")?) as usize;
        let name = cur.take_str(name_len, "entry name")?;
        entries.push(DirEntry { name, kind });
    }
    Ok((path, entries))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.buf.len());
        let Some(end) = end else {
            return Err(FmError::Decode(format!(
                "listing truncated reading {} ({} bytes at offset {}, {} available)",
                what,
                n,
                self.pos,
                self.buf.len().saturating_sub(self.pos)
            )));
        };
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn take_str(&mut self, n: usize, what: &str) -> Result<String> {
        let raw = self.take(n, what)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| FmError::Decode(format!("{} is not UTF-8", what)))
    }
}
