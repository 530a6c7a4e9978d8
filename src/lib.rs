//! dashfm library
//!
//! Client session, transfer reassembly and wire codec for the monitoring
//! dashboard's remote file manager, plus a small reference agent.

pub mod cli;
pub mod config;
pub mod error;
pub mod link;
pub mod listing;
pub mod logger;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod reassembler;
pub mod server;
pub mod session;
pub mod sink;
pub mod upload;
pub mod url;

pub use error::{FmError, Result};
pub use link::{Link, LinkEvent, RemoteEnd};
pub use listing::{DirEntry, EntryKind};
pub use session::{Session, SessionEvent, SessionHandle, SessionOptions, SessionState};
