//! Error taxonomy shared by the codec, the reassembler and the session controller

use std::io;

pub type Result<T> = std::result::Result<T, FmError>;

#[derive(Debug, thiserror::Error)]
pub enum FmError {
    /// Socket failed or closed underneath us
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with an `error` frame; the text is shown verbatim
    #[error("{0}")]
    Protocol(String),

    /// Bytes on the wire did not match the v1 contract
    #[error("decode error: {0}")]
    Decode(String),

    /// The reassembler reported a failure while buffering chunks
    #[error("reassembler error: {0}")]
    Worker(String),

    /// Another transfer owns the connection right now
    #[error("busy: {0}")]
    Busy(&'static str),

    #[error("session closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FmError {
    pub fn decode(msg: impl Into<String>) -> Self {
        FmError::Decode(msg.into())
    }

    /// Short label used in notices and log lines
    pub fn kind(&self) -> &'static str {
        match self {
            FmError::Transport(_) => "transport",
            FmError::Protocol(_) => "protocol",
            FmError::Decode(_) => "decode",
            FmError::Worker(_) => "worker",
            FmError::Busy(_) => "busy",
            FmError::Closed => "closed",
            FmError::Io(_) => "io",
        }
    }
}
