//! Shared protocol constants for the file-manager wire contract (v1)

// Wire contract version, bumped whenever a frame layout below changes
pub const VERSION: u16 = 1;

// Maximum inbound frame size (64MB) - prevents DoS via memory exhaustion
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// Upload/download chunk size (1MB), the last chunk of a file may be shorter
pub const CHUNK_SIZE: usize = 1024 * 1024;

// Maximum entries the agent puts in one listing frame
pub const MAX_LIST_ENTRIES: usize = 10_000;

// Client -> server command opcodes (first byte of every command frame)
pub mod opcode {
    pub const LIST: u8 = 0;
    pub const DOWNLOAD: u8 = 1;
    // payload: size u64 BE | destination path
    pub const UPLOAD: u8 = 2;
    // no payload, acknowledged with ident::ERROR + CANCELLED_MESSAGE
    pub const CANCEL: u8 = 3;
}

// Server -> client identifiers (first 4 bytes of the first frame of a response)
pub mod ident {
    // payload: total size u64 BE | first chunk bytes
    pub const FILE: &[u8; 4] = b"NZTD";
    // payload: path_len u32 BE | path | (kind u8, name_len u16 BE, name)*
    pub const FILE_NAME: &[u8; 4] = b"NZFN";
    // payload: UTF-8 message
    pub const ERROR: &[u8; 4] = b"NERR";
    // no payload
    pub const COMPLETE: &[u8; 4] = b"NZUP";
}

// Message carried by the error frame that acknowledges a Cancel.
// Raw chunks carry no header, so a drained chunk that is byte-for-byte
// `NERRtransfer cancelled` (22 bytes) also ends the drain. Only that exact
// frame matches; the agent's chunks are CHUNK_SIZE except a file's last one.
pub const CANCELLED_MESSAGE: &str = "transfer cancelled";

// Path prefix of the session-scoped WebSocket endpoint on the dashboard
pub const WS_PATH_PREFIX: &str = "/api/v1/ws/file/";

pub mod timeouts {
    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5000;

    // Progress tick interval for UI updates (ms)
    pub const PROGRESS_TICK_MS: u64 = 120;

    // How long the CLI waits for the first listing after connecting (ms)
    pub const FIRST_LISTING_MS: u64 = 10_000;
}
