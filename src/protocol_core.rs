//! Frame codec shared by the session controller and the agent
//!
//! Commands travel client -> server as `[opcode][argument]`. Responses start
//! with one of four 4-byte identifiers; everything that follows a `file` frame
//! until the announced size is reached is a raw continuation chunk.

use bytes::{BufMut, Bytes, BytesMut};
use std::path::{Component, Path, PathBuf};

use crate::error::{FmError, Result};
use crate::protocol::{ident, opcode, CANCELLED_MESSAGE, MAX_FRAME_SIZE};
use crate::upload::UploadHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    List,
    Download,
}

impl Opcode {
    pub fn byte(self) -> u8 {
        match self {
            Opcode::List => opcode::LIST,
            Opcode::Download => opcode::DOWNLOAD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identifier {
    File,
    FileName,
    Error,
    Complete,
}

impl Identifier {
    pub const ALL: [Identifier; 4] = [
        Identifier::File,
        Identifier::FileName,
        Identifier::Error,
        Identifier::Complete,
    ];

    pub fn bytes(self) -> &'static [u8; 4] {
        match self {
            Identifier::File => ident::FILE,
            Identifier::FileName => ident::FILE_NAME,
            Identifier::Error => ident::ERROR,
            Identifier::Complete => ident::COMPLETE,
        }
    }
}

/// A command as the agent sees it after decoding one client frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List(String),
    Download(String),
    Upload(UploadHeader),
    Cancel,
}

/// `[opcode][utf8 argument]`, no length prefix: one WebSocket message is one frame.
pub fn encode_command(op: Opcode, arg: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(1 + arg.len());
    out.put_u8(op.byte());
    out.put_slice(arg.as_bytes());
    out.freeze()
}

pub fn encode_cancel() -> Bytes {
    Bytes::from_static(&[opcode::CANCEL])
}

pub fn decode_command(frame: &[u8]) -> Result<Command> {
    let (&op, rest) = frame
        .split_first()
        .ok_or_else(|| FmError::decode("empty command frame"))?;
    let text = |bytes: &[u8]| {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| FmError::decode("command argument is not UTF-8"))
    };
    match op {
        opcode::LIST => Ok(Command::List(text(rest)?)),
        opcode::DOWNLOAD => Ok(Command::Download(text(rest)?)),
        opcode::UPLOAD => Ok(Command::Upload(crate::upload::parse_header(frame)?)),
        opcode::CANCEL => Ok(Command::Cancel),
        other => Err(FmError::Decode(format!("unknown opcode {}", other))),
    }
}

/// Match the leading 4 bytes against the identifier set. Anything else,
/// including frames shorter than 4 bytes, is a raw continuation chunk.
pub fn decode_identifier(frame: &[u8]) -> Option<Identifier> {
    let head: &[u8; 4] = frame.get(..4)?.try_into().ok()?;
    Identifier::ALL.into_iter().find(|id| id.bytes() == head)
}

pub fn identified_frame(id: Identifier, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + payload.len());
    out.put_slice(id.bytes());
    out.put_slice(payload);
    out.freeze()
}

pub fn error_frame(msg: &str) -> Bytes {
    identified_frame(Identifier::Error, msg.as_bytes())
}

pub fn cancel_ack_frame() -> Bytes {
    error_frame(CANCELLED_MESSAGE)
}

/// Exact match only: a chunk that merely starts with the ack is data.
pub fn is_cancel_ack(frame: &[u8]) -> bool {
    frame.len() == 4 + CANCELLED_MESSAGE.len()
        && decode_identifier(frame) == Some(Identifier::Error)
        && &frame[4..] == CANCELLED_MESSAGE.as_bytes()
}

/// Text of an `error` frame. Invalid UTF-8 is replaced rather than rejected so
/// the user still sees something.
pub fn error_message(frame: &[u8]) -> String {
    String::from_utf8_lossy(frame.get(4..).unwrap_or_default()).into_owned()
}

/// Leading header of a `file` frame: total size, then the first chunk.
pub fn split_file_frame(frame: &[u8]) -> Result<(u64, &[u8])> {
    let size = frame
        .get(4..12)
        .ok_or_else(|| FmError::decode("file frame shorter than its size header"))?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(size);
    Ok((u64::from_be_bytes(raw), &frame[12..]))
}

pub fn file_frame(total: u64, first_chunk: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(12 + first_chunk.len());
    out.put_slice(Identifier::File.bytes());
    out.put_u64(total);
    out.put_slice(first_chunk);
    out.freeze()
}

pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(FmError::Decode(format!(
            "frame payload too large: {} bytes (max: {})",
            size, MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

/// Resolve a `/`-joined wire path to a location under `root`.
///
/// The wire path is always relative to the served root, a leading `/` is
/// accepted and ignored. Rejects NUL bytes and `..`, and after resolving
/// symlinks of existing paths (or of the parent for new files) requires the
/// result to stay under the canonical root.
pub fn resolve_wire_path(root: &Path, wire: &str) -> anyhow::Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if wire.contains('\0') {
        anyhow::bail!("path contains NUL byte");
    }

    let mut safe = PathBuf::new();
    for component in Path::new(wire.trim_start_matches('/')).components() {
        match component {
            CurDir => {}
            Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    anyhow::bail!("path component contains colon (potential ADS attack)");
                }
                safe.push(s);
            }
            ParentDir | RootDir | Prefix(_) => {
                anyhow::bail!("path contains disallowed component: {:?}", component);
            }
        }
    }

    let root = root.canonicalize()?;
    let joined = root.join(&safe);
    let final_path = if joined.exists() {
        joined.canonicalize()?
    } else {
        match (joined.parent(), joined.file_name()) {
            (Some(parent), Some(name)) if parent.exists() => parent.canonicalize()?.join(name),
            _ => joined,
        }
    };

    if !final_path.starts_with(&root) {
        anyhow::bail!("path {:?} escapes root {:?}", wire, root);
    }
    Ok(final_path)
}

/// Inverse of `resolve_wire_path` for display: `/a/b`, or `""` for the root itself.
pub fn wire_path_of(root: &Path, full: &Path) -> String {
    let rel = full.strip_prefix(root).unwrap_or(full);
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    parts.iter().map(|p| format!("/{}", p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_identifier_matches_only_exact_bytes() {
        for id in Identifier::ALL {
            let frame = identified_frame(id, b"payload");
            assert_eq!(decode_identifier(&frame), Some(id));

            // flip every single byte of the prefix in turn
            for i in 0..4 {
                let mut bad = frame.to_vec();
                bad[i] ^= 0x01;
                assert_eq!(decode_identifier(&bad), None, "{:?} byte {}", id, i);
            }
        }
    }

    #[test]
    fn test_identifier_needs_four_bytes() {
        assert_eq!(decode_identifier(b""), None);
        assert_eq!(decode_identifier(b"NZT"), None);
        assert_eq!(decode_identifier(b"NZUP"), Some(Identifier::Complete));
    }

    #[test]
    fn test_list_command_round_trip() {
        for path in ["/a/b", "", "/ünïcode dir"] {
            let frame = encode_command(Opcode::List, path);
            assert_eq!(frame[0], opcode::LIST);
            assert_eq!(&frame[1..], path.as_bytes());
            assert_eq!(decode_command(&frame).unwrap(), Command::List(path.to_string()));
        }
    }

    #[test]
    fn test_download_and_cancel_commands() {
        let frame = encode_command(Opcode::Download, "/root/a.txt");
        assert_eq!(
            decode_command(&frame).unwrap(),
            Command::Download("/root/a.txt".into())
        );
        assert_eq!(decode_command(&encode_cancel()).unwrap(), Command::Cancel);
    }

    #[test]
    fn test_decode_command_rejects_garbage() {
        assert!(decode_command(b"").is_err());
        assert!(decode_command(&[9, b'x']).is_err());
        assert!(decode_command(&[opcode::LIST, 0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_error_frame_text() {
        let frame = error_frame("permission denied");
        assert_eq!(decode_identifier(&frame), Some(Identifier::Error));
        assert_eq!(error_message(&frame), "permission denied");
        assert!(!is_cancel_ack(&frame));
        assert!(is_cancel_ack(&cancel_ack_frame()));
    }

    #[test]
    fn test_cancel_ack_needs_the_exact_frame() {
        let ack = cancel_ack_frame();
        assert_eq!(ack.len(), 22);
        assert!(is_cancel_ack(b"NERRtransfer cancelled"));

        let mut longer = ack.to_vec();
        longer.push(b'!');
        assert!(!is_cancel_ack(&longer));
        assert!(!is_cancel_ack(&ack[..21]));
        assert!(!is_cancel_ack(b"NZTDtransfer cancelled"));
        assert!(!is_cancel_ack(b"NERRTransfer cancelled"));
    }

    #[test]
    fn test_file_frame_header() {
        let frame = file_frame(10, b"hello");
        let (total, first) = split_file_frame(&frame).unwrap();
        assert_eq!(total, 10);
        assert_eq!(first, b"hello");
        assert!(split_file_frame(b"NZTD\x00\x01").is_err());
    }

    #[test]
    fn test_validate_frame_size() {
        assert!(validate_frame_size(0).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE + 1).is_err());
    }

    #[test]
    fn test_resolve_wire_path_safe_paths() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();
        fs::create_dir(root.join("docs")).unwrap();

        assert_eq!(resolve_wire_path(&root, "").unwrap(), root);
        assert_eq!(resolve_wire_path(&root, "/").unwrap(), root);
        assert_eq!(resolve_wire_path(&root, "/docs").unwrap(), root.join("docs"));
        assert_eq!(
            resolve_wire_path(&root, "docs/./new.txt").unwrap(),
            root.join("docs/new.txt")
        );
    }

    #[test]
    fn test_resolve_wire_path_unsafe_paths() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        assert!(resolve_wire_path(root, "../etc/passwd").is_err());
        assert!(resolve_wire_path(root, "/docs/../../etc").is_err());
        assert!(resolve_wire_path(root, "file\0.txt").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_wire_path_symlink_escape() {
        let outside = TempDir::new().unwrap();
        let temp_dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("out")).unwrap();

        assert!(resolve_wire_path(temp_dir.path(), "/out").is_err());
    }

    #[test]
    fn test_wire_path_of() {
        let root = Path::new("/srv/files");
        assert_eq!(wire_path_of(root, root), "");
        assert_eq!(wire_path_of(root, &root.join("a/b")), "/a/b");
    }
}
