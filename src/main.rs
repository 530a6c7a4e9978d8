//! dashfm - command-line client for the dashboard's remote file manager
//!
//! Opens one file-manager session over WebSocket, waits for the root listing,
//! runs a single command (ls / get / put) and closes the session.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use dashfm::cli::{ClientCommand, ClientOpts};
use dashfm::config::Config;
use dashfm::link::Link;
use dashfm::logger::{Logger, NoopLogger, TextLogger};
use dashfm::progress::TransferBar;
use dashfm::protocol::timeouts::FIRST_LISTING_MS;
use dashfm::reassembler::MemoryBuffer;
use dashfm::session::{Direction, Session, SessionEvent, SessionHandle, SessionOptions};
use dashfm::sink::DirectorySink;
use dashfm::url::session_ws_url;

type Events = UnboundedReceiver<SessionEvent>;

fn main() -> Result<()> {
    let opts = ClientOpts::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run(opts))
}

async fn run(opts: ClientOpts) -> Result<()> {
    // wss:// dashboards; a second install attempt is harmless
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config_path = opts.config.clone().unwrap_or_else(Config::default_path);
    let cfg = Config::load(&config_path)?;
    let url = resolve_url(&opts, &cfg)?;

    let logger: Arc<dyn Logger> = match opts.log_file.as_ref().or(cfg.log_file.as_ref()) {
        Some(path) => Arc::new(
            TextLogger::new(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?,
        ),
        None => Arc::new(NoopLogger),
    };
    let out_dir = match &opts.command {
        ClientCommand::Get { out: Some(dir), .. } => dir.clone(),
        _ => cfg.download_dir.clone(),
    };

    let options = SessionOptions::new(Arc::new(DirectorySink::new(out_dir)))
        .logger(logger)
        .buffer(Box::new(MemoryBuffer::new(cfg.max_download_bytes)))
        .label(url.clone());
    let link = Link::websocket(&url, cfg.outbound_queue);
    let Session {
        handle,
        mut events,
        task,
    } = Session::start(link, options)?;

    // the session lists the root as soon as the socket opens
    wait_listed(&mut events)
        .await
        .with_context(|| format!("Failed to open {}", url))?;

    let result = match opts.command {
        ClientCommand::Ls { path, json } => ls(&handle, &mut events, path, json).await,
        ClientCommand::Get { remote, .. } => get(&handle, &mut events, &remote).await,
        ClientCommand::Put { local, to } => put(&handle, &mut events, &local, &to).await,
    };

    let _ = handle.close();
    let _ = task.await;
    result
}

fn resolve_url(opts: &ClientOpts, cfg: &Config) -> Result<String> {
    if let Some(url) = &opts.url {
        return Ok(url.clone());
    }
    let session = opts
        .session
        .as_deref()
        .context("--session is required without --url")?;
    let base = opts
        .dashboard
        .as_deref()
        .or(cfg.dashboard.as_deref())
        .context("No dashboard URL: pass --dashboard or set `dashboard` in the config file")?;
    session_ws_url(base, session)
}

/// `var/log/` -> `/var/log`, `/` -> `` (the agent's root)
fn wire_path(path: &str) -> String {
    path.split('/')
        .filter(|part| !part.is_empty())
        .fold(String::new(), |acc, part| acc + "/" + part)
}

async fn next_event(events: &mut Events) -> Result<SessionEvent> {
    events.recv().await.ok_or_else(|| anyhow!("session ended"))
}

async fn wait_listed(events: &mut Events) -> Result<()> {
    match tokio::time::timeout(Duration::from_millis(FIRST_LISTING_MS), listed(events)).await {
        Ok(res) => res,
        Err(_) => bail!("timed out waiting for a directory listing"),
    }
}

async fn listed(events: &mut Events) -> Result<()> {
    loop {
        match next_event(events).await? {
            SessionEvent::Listed { .. } => return Ok(()),
            SessionEvent::Notice(e) => return Err(anyhow!(e)),
            SessionEvent::Closed => bail!("connection closed"),
            _ => {}
        }
    }
}

async fn change_dir(handle: &SessionHandle, events: &mut Events, path: &str) -> Result<()> {
    if handle.snapshot().path == path {
        return Ok(());
    }
    handle.goto_path(path)?;
    wait_listed(events).await
}

async fn ls(handle: &SessionHandle, events: &mut Events, path: Option<String>, json: bool) -> Result<()> {
    if let Some(path) = path {
        change_dir(handle, events, &wire_path(&path)).await?;
    }
    let state = handle.snapshot();

    if json {
        let doc = serde_json::json!({
            "path": state.path,
            "entries": state.entries,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("{}:", if state.path.is_empty() { "/" } else { &state.path });
    for entry in &state.entries {
        if entry.is_dir() {
            println!("  {}/", entry.name);
        } else {
            println!("  {}", entry.name);
        }
    }
    Ok(())
}

async fn get(handle: &SessionHandle, events: &mut Events, remote: &str) -> Result<()> {
    let remote = wire_path(remote);
    let Some((dir, name)) = remote.rsplit_once('/').filter(|(_, name)| !name.is_empty()) else {
        bail!("Not a file path: {:?}", remote);
    };
    change_dir(handle, events, dir).await?;

    let h = handle.clone();
    ctrlc::set_handler(move || {
        let _ = h.cancel_download();
    })
    .context("Error setting Ctrl-C handler")?;

    handle.download_file(name)?;
    follow(handle, events, Direction::Download).await
}

async fn put(handle: &SessionHandle, events: &mut Events, local: &Path, to: &str) -> Result<()> {
    if !local.is_file() {
        bail!("Not a regular file: {}", local.display());
    }
    change_dir(handle, events, &wire_path(to)).await?;

    let h = handle.clone();
    ctrlc::set_handler(move || {
        let _ = h.cancel_upload();
    })
    .context("Error setting Ctrl-C handler")?;

    handle.upload_file(local)?;
    follow(handle, events, Direction::Upload).await
}

/// Drive a progress bar from state updates until the transfer ends one way or another.
async fn follow(handle: &SessionHandle, events: &mut Events, direction: Direction) -> Result<()> {
    let mut state = handle.state();
    let mut bar: Option<TransferBar> = None;
    let verb = match direction {
        Direction::Download => "get",
        Direction::Upload => "put",
    };

    let outcome = loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break Err(anyhow!("session ended"));
                }
                let snapshot = state.borrow_and_update().clone();
                let progress = match direction {
                    Direction::Download => snapshot.download,
                    Direction::Upload => snapshot.upload,
                };
                if let Some(p) = progress {
                    bar.get_or_insert_with(|| TransferBar::new(verb, &p.name, p.total))
                        .update(p.done, p.total);
                }
            }
            event = next_event(events) => {
                match event {
                    Ok(SessionEvent::Downloaded { saved_to, bytes, .. }) if direction == Direction::Download => {
                        if let Some(bar) = &bar {
                            bar.finish_success(bytes);
                        }
                        println!("saved {} ({} bytes)", saved_to.display(), bytes);
                        break Ok(());
                    }
                    Ok(SessionEvent::UploadComplete { file_name, bytes }) if direction == Direction::Upload => {
                        if let Some(bar) = &bar {
                            bar.finish_success(bytes);
                        }
                        println!("uploaded {} ({} bytes)", file_name, bytes);
                        break Ok(());
                    }
                    Ok(SessionEvent::DownloadCancelled { file_name })
                    | Ok(SessionEvent::UploadCancelled { file_name }) => {
                        break Err(anyhow!("{} of {} cancelled", direction, file_name));
                    }
                    Ok(SessionEvent::Notice(e)) => break Err(anyhow!(e)),
                    Ok(SessionEvent::Closed) => break Err(anyhow!("connection closed during {}", direction)),
                    Ok(_) => {}
                    Err(e) => break Err(e),
                }
            }
        }
    };

    if outcome.is_err() {
        if let Some(bar) = &bar {
            bar.abandon();
        }
    }
    outcome
}
