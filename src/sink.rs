//! Where finished downloads go

use bytes::Bytes;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{FmError, Result};

pub trait DownloadSink: Send + Sync {
    /// Save one assembled download under `file_name`, returning where it went.
    fn save(&self, file_name: &str, blob: &[u8]) -> Result<PathBuf>;
}

/// Saves into a local directory. The blob goes to a temporary file next to the
/// destination first and is renamed into place, so a partial file never shows
/// up under the real name.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl DownloadSink for DirectorySink {
    fn save(&self, file_name: &str, blob: &[u8]) -> Result<PathBuf> {
        let name = safe_file_name(file_name)?;
        std::fs::create_dir_all(&self.dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(blob)?;
        tmp.flush()?;
        let dest = self.dir.join(name);
        tmp.persist(&dest).map_err(|e| FmError::Io(e.error))?;
        Ok(dest)
    }
}

/// Keeps downloads in memory; handy for embedding and tests.
#[derive(Default)]
pub struct MemorySink {
    saved: Mutex<Vec<(String, Bytes)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<(String, Bytes)> {
        self.saved.lock().clone()
    }
}

impl DownloadSink for MemorySink {
    fn save(&self, file_name: &str, blob: &[u8]) -> Result<PathBuf> {
        self.saved
            .lock()
            .push((file_name.to_string(), Bytes::copy_from_slice(blob)));
        Ok(PathBuf::from(file_name))
    }
}

/// Last path component of a server-supplied name; `""`, `.` and `..` are refused.
pub fn safe_file_name(name: &str) -> Result<&str> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match base {
        "" | "." | ".." => Err(FmError::Decode(format!("unusable file name {:?}", name))),
        _ if base.contains('\0') => Err(FmError::decode("file name contains NUL byte")),
        _ => Ok(base),
    }
}
