//! WebSocket URL of a file-manager session

use anyhow::{bail, Result};

use crate::protocol::WS_PATH_PREFIX;

/// Build `ws(s)://host[:port][/base]/api/v1/ws/file/{session_id}` from the
/// dashboard base URL. `http` maps to `ws` and `https` to `wss`; a base that is
/// already `ws`/`wss` is kept.
pub fn session_ws_url(base: &str, session_id: &str) -> Result<String> {
    let base = base.trim();
    let session_id = session_id.trim();
    if session_id.is_empty() || session_id.contains(['/', '?', '#']) {
        bail!("invalid session id {:?}", session_id);
    }

    let lower = base.to_ascii_lowercase();
    let Some(scheme_end) = lower.find("://") else {
        bail!("dashboard URL needs a scheme: {}", base);
    };
    let scheme = match &lower[..scheme_end] {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => bail!("unsupported scheme {:?} in {}", other, base),
    };
    let rest = base[scheme_end + 3..].trim_end_matches('/');
    if rest.is_empty() || rest.starts_with('/') {
        bail!("dashboard URL has no host: {}", base);
    }
    Ok(format!("{}://{}{}{}", scheme, rest, WS_PATH_PREFIX, session_id))
}
