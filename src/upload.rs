//! Upload header and fixed-size chunk slicing
//!
//! Header frame: `0x02 | size u64 BE | destination path`. The chunks that follow
//! are raw frames of at most `CHUNK_SIZE` bytes, sent until `size` bytes went out.

use bytes::{BufMut, Bytes, BytesMut};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{FmError, Result};
use crate::protocol::{opcode, CHUNK_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHeader {
    /// Remote directory, `""` for the root
    pub path: String,
    pub file_name: String,
    pub size: u64,
}

impl UploadHeader {
    /// `{path}/{file_name}` with exactly one separator between them
    pub fn destination(&self) -> String {
        format!("{}/{}", self.path.trim_end_matches('/'), self.file_name)
    }
}

pub fn build_header(header: &UploadHeader) -> Bytes {
    let dest = header.destination();
    let mut out = BytesMut::with_capacity(1 + 8 + dest.len());
    out.put_u8(opcode::UPLOAD);
    out.put_u64(header.size);
    out.put_slice(dest.as_bytes());
    out.freeze()
}

/// Inverse of `build_header`; the whole frame including the opcode byte.
pub fn parse_header(frame: &[u8]) -> Result<UploadHeader> {
    if frame.first() != Some(&opcode::UPLOAD) {
        return Err(FmError::decode("not an upload header"));
    }
    let size = frame
        .get(1..9)
        .ok_or_else(|| FmError::decode("upload header shorter than its size field"))?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(size);
    let dest = std::str::from_utf8(&frame[9..])
        .map_err(|_| FmError::decode("upload destination is not UTF-8"))?;
    let (path, file_name) = dest.rsplit_once('/').unwrap_or(("", dest));
    if file_name.is_empty() {
        return Err(FmError::decode("upload destination has no file name"));
    }
    Ok(UploadHeader {
        path: path.to_string(),
        file_name: file_name.to_string(),
        size: u64::from_be_bytes(raw),
    })
}

/// `(offset, len)` of every chunk of a `size`-byte file. Empty for a 0-byte file.
pub fn chunk_ranges(size: u64, chunk_size: usize) -> impl Iterator<Item = (u64, usize)> {
    let step = chunk_size.max(1) as u64;
    (0..size)
        .step_by(step as usize)
        .map(move |offset| (offset, (size - offset).min(step) as usize))
}

/// Reads a local file one chunk at a time. Each read completes before the
/// next starts, so chunks come out in file order.
pub struct FileChunker {
    file: File,
    size: u64,
    offset: u64,
    ranges: Box<dyn Iterator<Item = (u64, usize)> + Send>,
}

impl FileChunker {
    pub async fn open(path: &Path) -> Result<(Self, UploadMeta)> {
        let file = File::open(path).await?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(FmError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| FmError::decode("local path has no file name"))?;
        let size = meta.len();
        Ok((
            Self {
                file,
                size,
                offset: 0,
                ranges: Box::new(chunk_ranges(size, CHUNK_SIZE)),
            },
            UploadMeta { file_name, size },
        ))
    }

    /// Re-cut whatever is left of the file.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        let start = self.offset;
        self.ranges = Box::new(
            chunk_ranges(self.size - start, chunk_size).map(move |(o, n)| (start + o, n)),
        );
        self
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next slice, `None` once every range has been read.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let Some((offset, len)) = self.ranges.next() else {
            return Ok(None);
        };
        let mut buf = BytesMut::zeroed(len);
        self.file.read_exact(&mut buf).await?;
        self.offset = offset + len as u64;
        Ok(Some(buf.freeze()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMeta {
    pub file_name: String,
    pub size: u64,
}
