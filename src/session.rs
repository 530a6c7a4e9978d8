//! File-manager session controller
//!
//! One tokio task owns the link for the whole session. It sends commands,
//! dispatches inbound frames by identifier, forwards download chunks to the
//! reassembler one at a time, and publishes UI-facing state on a watch channel.
//!
//! Responses carry no request ids. The agent answers commands strictly in
//! order, so a FIFO of pending requests is enough to tell which request a
//! response belongs to. Overlapping transfers are refused up front.

use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{FmError, Result};
use crate::link::{Link, LinkEvent};
use crate::listing::{parse_listing, DirEntry};
use crate::logger::{Logger, NoopLogger};
use crate::protocol::CHUNK_SIZE;
use crate::protocol_core::{
    decode_identifier, encode_cancel, encode_command, error_message, is_cancel_ack,
    split_file_frame, validate_frame_size, Identifier, Opcode,
};
use crate::reassembler::{ChunkBuffer, MemoryBuffer, Reassembler, Request, TransferId, WorkerEvent};
use crate::sink::DownloadSink;
use crate::upload::{build_header, FileChunker, UploadHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Open,
    Closed,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub id: TransferId,
    pub name: String,
    /// 0 until the server announced the size of a download
    pub total: u64,
    pub done: u64,
}

/// Everything a file-manager view renders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub phase: Phase,
    /// Last path confirmed by a listing frame
    pub path: String,
    /// Navigation target still waiting for its listing
    pub pending_path: Option<String>,
    pub entries: Vec<DirEntry>,
    pub download: Option<TransferProgress>,
    pub upload: Option<TransferProgress>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: Phase::Connecting,
            path: String::new(),
            pending_path: None,
            entries: Vec::new(),
            download: None,
            upload: None,
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    Listed { path: String, entries: usize },
    Downloaded {
        file_name: String,
        saved_to: PathBuf,
        bytes: u64,
    },
    DownloadCancelled { file_name: String },
    UploadComplete { file_name: String, bytes: u64 },
    UploadCancelled { file_name: String },
    /// One user-visible notification per failure
    Notice(FmError),
    Closed,
}

pub struct SessionOptions {
    pub sink: Arc<dyn DownloadSink>,
    pub logger: Arc<dyn Logger>,
    pub buffer: Box<dyn ChunkBuffer>,
    pub chunk_size: usize,
    /// Shown in log lines, usually the WebSocket URL
    pub label: String,
}

impl SessionOptions {
    pub fn new(sink: Arc<dyn DownloadSink>) -> Self {
        Self {
            sink,
            logger: Arc::new(NoopLogger),
            buffer: Box::new(MemoryBuffer::default()),
            chunk_size: CHUNK_SIZE,
            label: "fm".into(),
        }
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn buffer(mut self, buffer: Box<dyn ChunkBuffer>) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

#[derive(Debug)]
enum Action {
    List(String),
    Enter(String),
    Goto(String),
    Refresh,
    Download(String),
    Upload(PathBuf),
    CancelDownload,
    CancelUpload,
    Close,
}

/// Cheap to clone; every clone drives the same session.
#[derive(Clone)]
pub struct SessionHandle {
    actions: mpsc::UnboundedSender<Action>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    fn send(&self, action: Action) -> Result<()> {
        self.actions.send(action).map_err(|_| FmError::Closed)
    }

    pub fn list_file(&self, path: &str) -> Result<()> {
        self.send(Action::List(path.to_string()))
    }

    /// Navigate into a directory entry of the current listing.
    pub fn enter(&self, name: &str) -> Result<()> {
        self.send(Action::Enter(name.to_string()))
    }

    pub fn goto_path(&self, path: &str) -> Result<()> {
        self.send(Action::Goto(path.to_string()))
    }

    pub fn refresh(&self) -> Result<()> {
        self.send(Action::Refresh)
    }

    /// Download `basename` from the current directory.
    pub fn download_file(&self, basename: &str) -> Result<()> {
        self.send(Action::Download(basename.to_string()))
    }

    /// Upload a local file into the current directory.
    pub fn upload_file(&self, local: impl Into<PathBuf>) -> Result<()> {
        self.send(Action::Upload(local.into()))
    }

    pub fn cancel_download(&self) -> Result<()> {
        self.send(Action::CancelDownload)
    }

    /// Uploads cannot be stopped in-band, so this also closes the session.
    pub fn cancel_upload(&self) -> Result<()> {
        self.send(Action::CancelUpload)
    }

    pub fn close(&self) -> Result<()> {
        self.send(Action::Close)
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }
}

pub struct Session {
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub task: JoinHandle<()>,
}

impl Session {
    /// Spawn the controller for `link`. Must be called inside a tokio runtime.
    pub fn start(link: Link, options: SessionOptions) -> Result<Session> {
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::default());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();

        let controller = Controller {
            outbound: Some(link.outbound),
            inbound: link.inbound,
            actions: action_rx,
            state: state_tx,
            events: event_tx,
            worker: Reassembler::spawn(options.buffer)?,
            sink: options.sink,
            logger: options.logger,
            label: options.label,
            chunk_size: options.chunk_size,
            pending: VecDeque::new(),
            download: None,
            draining: None,
            upload: None,
            ticks_tx: tick_tx,
            ticks: tick_rx,
        };
        let task = tokio::spawn(controller.run());

        Ok(Session {
            handle: SessionHandle {
                actions: action_tx,
                state: state_rx,
            },
            events: event_rx,
            task,
        })
    }
}

#[derive(Debug)]
enum Pending {
    List,
    Download { id: TransferId, name: String },
    Upload { name: String },
}

struct ActiveDownload {
    id: TransferId,
    name: String,
    total: u64,
}

struct ActiveUpload {
    id: TransferId,
    name: String,
    size: u64,
    task: JoinHandle<()>,
    /// every chunk is in the outbound queue
    sent_all: bool,
}

struct Draining {
    id: TransferId,
    name: String,
    relist: bool,
    /// false when the cancel was sent after a failure already reported
    announce: bool,
}

/// Which request a failed response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Listing,
    Download,
    Upload,
    /// nothing to attribute it to; report only
    Stray,
    /// the connection itself
    Link,
}

enum UploadTick {
    Sent(TransferId, u64),
    Finished(TransferId),
    Failed(TransferId, FmError),
}

struct Controller {
    outbound: Option<mpsc::Sender<Bytes>>,
    inbound: mpsc::Receiver<LinkEvent>,
    actions: mpsc::UnboundedReceiver<Action>,
    state: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    worker: Reassembler,
    sink: Arc<dyn DownloadSink>,
    logger: Arc<dyn Logger>,
    label: String,
    chunk_size: usize,
    pending: VecDeque<Pending>,
    /// Some while continuation chunks are expected (the inverse of "first chunk")
    download: Option<ActiveDownload>,
    /// Some after a cancel, until the agent acknowledges it
    draining: Option<Draining>,
    upload: Option<ActiveUpload>,
    ticks_tx: mpsc::UnboundedSender<UploadTick>,
    ticks: mpsc::UnboundedReceiver<UploadTick>,
}

impl Controller {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.inbound.recv() => {
                    let keep_going = match event {
                        Some(event) => self.on_link(event).await,
                        None => self.on_closed(None, false),
                    };
                    if !keep_going {
                        break;
                    }
                }
                action = self.actions.recv() => {
                    // every handle dropped means nobody is watching any more
                    let action = action.unwrap_or(Action::Close);
                    if !self.on_action(action).await {
                        break;
                    }
                }
                Some(tick) = self.ticks.recv() => {
                    if !self.on_upload_tick(tick) {
                        break;
                    }
                }
            }
        }
        if let Some(upload) = self.upload.take() {
            upload.task.abort();
        }
    }

    // ----- socket events -----

    async fn on_link(&mut self, event: LinkEvent) -> bool {
        match event {
            LinkEvent::Open => {
                self.state.send_modify(|s| s.phase = Phase::Open);
                self.logger.opened(&self.label);
                if let Err(e) = self.list_file(String::new()).await {
                    self.notice(e);
                }
                true
            }
            LinkEvent::Frame(frame) => match self.dispatch(frame).await {
                Ok(()) => true,
                Err((scope, e)) => self.abandon(scope, e).await,
            },
            LinkEvent::Error(msg) => {
                self.state.send_modify(|s| s.phase = Phase::Errored);
                self.abandon(Scope::Link, FmError::Transport(msg)).await
            }
            LinkEvent::Closed(reason) => self.on_closed(reason, true),
        }
    }

    fn on_closed(&mut self, reason: Option<String>, reported: bool) -> bool {
        let errored = self.state.borrow().phase == Phase::Errored;
        self.state.send_modify(|s| {
            if s.phase != Phase::Errored {
                s.phase = Phase::Closed;
            }
            s.download = None;
            s.upload = None;
        });
        if !errored {
            let msg = match (&reason, reported) {
                (Some(r), _) => format!("connection closed: {}", r),
                (None, true) => "connection closed".to_string(),
                (None, false) => "connection dropped".to_string(),
            };
            self.notice(FmError::Transport(msg));
        }
        self.logger.closed(reason.as_deref());
        let _ = self.events.send(SessionEvent::Closed);
        false
    }

    // ----- inbound dispatch -----

    /// Failures come back with the request they belong to.
    async fn dispatch(&mut self, frame: Bytes) -> std::result::Result<(), (Scope, FmError)> {
        if let Err(e) = validate_frame_size(frame.len()) {
            let scope = if self.download.is_some() {
                Scope::Download
            } else {
                Scope::Stray
            };
            return Err((scope, e));
        }

        if self.draining.is_some() {
            self.drain(&frame).await;
            return Ok(());
        }
        if self.download.is_some() {
            return self
                .continue_download(frame)
                .await
                .map_err(|e| (Scope::Download, e));
        }

        match decode_identifier(&frame) {
            Some(Identifier::File) => self
                .begin_download(frame)
                .await
                .map_err(|e| (Scope::Download, e)),
            Some(Identifier::FileName) => self
                .apply_listing(&frame[4..])
                .map_err(|e| (Scope::Listing, e)),
            Some(Identifier::Error) => {
                Err((self.pop_scope(), FmError::Protocol(error_message(&frame))))
            }
            Some(Identifier::Complete) => {
                self.finish_upload().await.map_err(|e| (Scope::Stray, e))
            }
            None => Err((
                self.pop_scope(),
                FmError::decode("first frame carries no known identifier"),
            )),
        }
    }

    /// The oldest request is the one a bare `error` answers.
    fn pop_scope(&mut self) -> Scope {
        match self.pending.pop_front() {
            Some(Pending::List) => Scope::Listing,
            Some(Pending::Download { .. }) => Scope::Download,
            Some(Pending::Upload { .. }) => Scope::Upload,
            None => Scope::Stray,
        }
    }

    fn apply_listing(&mut self, payload: &[u8]) -> Result<()> {
        if matches!(self.pending.front(), Some(Pending::List)) {
            self.pending.pop_front();
        }
        let (path, entries) = parse_listing(payload)?;
        self.logger.listed(&path, entries.len());
        let count = entries.len();
        self.state.send_modify(|s| {
            s.path = path.clone();
            s.pending_path = None;
            s.entries = entries;
        });
        let _ = self.events.send(SessionEvent::Listed {
            path,
            entries: count,
        });
        Ok(())
    }

    async fn begin_download(&mut self, frame: Bytes) -> Result<()> {
        let (id, name) = match self.pending.pop_front() {
            Some(Pending::Download { id, name }) => (id, name),
            other => {
                if let Some(p) = other {
                    self.pending.push_front(p);
                }
                return Err(FmError::decode("file frame without a pending download"));
            }
        };
        let (total, _) = split_file_frame(&frame)?;
        let first = frame.slice(12..);

        // mark active before awaiting so a failure below gets the worker aborted
        self.download = Some(ActiveDownload {
            id,
            name: name.clone(),
            total,
        });
        let event = self
            .worker
            .submit(Request::Begin {
                transfer: id,
                file_name: name,
                chunk: first,
            })
            .await?;
        let received = expect_progress(id, event)?;
        self.record_received(total, received).await
    }

    async fn continue_download(&mut self, chunk: Bytes) -> Result<()> {
        let (id, total) = match &self.download {
            Some(d) => (d.id, d.total),
            None => return Ok(()),
        };
        // the reply is the ready signal: the next chunk waits for it
        let event = self
            .worker
            .submit(Request::Append {
                transfer: id,
                chunk,
            })
            .await?;
        let received = expect_progress(id, event)?;
        self.record_received(total, received).await
    }

    async fn record_received(&mut self, total: u64, received: u64) -> Result<()> {
        if received > total {
            return Err(FmError::Decode(format!(
                "download overran its announced size ({} > {} bytes)",
                received, total
            )));
        }
        self.state.send_modify(|s| {
            if let Some(p) = s.download.as_mut() {
                p.total = total;
                p.done = received;
            }
        });
        if received == total {
            self.complete_download().await?;
        }
        Ok(())
    }

    async fn complete_download(&mut self) -> Result<()> {
        let Some(active) = self.download.take() else {
            return Ok(());
        };
        let event = self
            .worker
            .submit(Request::Finish { transfer: active.id })
            .await?;
        let (file_name, blob) = match event {
            WorkerEvent::Result {
                transfer,
                file_name,
                blob,
            } if transfer == active.id => (file_name, blob),
            WorkerEvent::Error { message, .. } => return Err(FmError::Worker(message)),
            other => {
                return Err(FmError::Worker(format!("unexpected reply {:?}", other)));
            }
        };

        let bytes = blob.len() as u64;
        let sink = self.sink.clone();
        let name = file_name.clone();
        let saved_to = tokio::task::spawn_blocking(move || sink.save(&name, &blob))
            .await
            .map_err(|e| FmError::Worker(format!("save task failed: {}", e)))??;

        self.state.send_modify(|s| s.download = None);
        self.logger
            .transfer_done(Direction::Download, active.id, &file_name, bytes);
        let _ = self.events.send(SessionEvent::Downloaded {
            file_name,
            saved_to,
            bytes,
        });
        Ok(())
    }

    async fn drain(&mut self, frame: &[u8]) {
        if !is_cancel_ack(frame) {
            return;
        }
        let Some(drained) = self.draining.take() else {
            return;
        };
        if drained.announce {
            self.logger
                .transfer_cancelled(Direction::Download, drained.id, &drained.name);
            let _ = self.events.send(SessionEvent::DownloadCancelled {
                file_name: drained.name,
            });
        }
        if drained.relist {
            let path = self.state.borrow().path.clone();
            if let Err(e) = self.list_file(path).await {
                self.notice(e);
            }
        }
    }

    async fn finish_upload(&mut self) -> Result<()> {
        let name = match self.pending.pop_front() {
            Some(Pending::Upload { name }) => name,
            other => {
                if let Some(p) = other {
                    self.pending.push_front(p);
                }
                return Err(FmError::decode("complete frame without a pending upload"));
            }
        };
        let (id, bytes) = match self.upload.take() {
            Some(upload) => {
                upload.task.abort();
                (upload.id, upload.size)
            }
            None => (Uuid::nil(), 0),
        };
        self.state.send_modify(|s| s.upload = None);
        self.logger.transfer_done(Direction::Upload, id, &name, bytes);
        let _ = self.events.send(SessionEvent::UploadComplete {
            file_name: name,
            bytes,
        });

        let path = self.state.borrow().path.clone();
        if let Err(e) = self.list_file(path).await {
            self.notice(e);
        }
        Ok(())
    }

    // ----- user actions -----

    async fn on_action(&mut self, action: Action) -> bool {
        let result = match action {
            Action::Close => {
                self.outbound = None;
                self.state.send_modify(|s| {
                    s.phase = Phase::Closed;
                    s.download = None;
                    s.upload = None;
                });
                self.logger.closed(None);
                let _ = self.events.send(SessionEvent::Closed);
                return false;
            }
            Action::CancelUpload => return self.cancel_upload(),
            Action::CancelDownload => self.cancel_download().await,
            Action::List(path) => self.navigate(path, false).await,
            Action::Goto(path) => self.navigate(path, true).await,
            Action::Enter(name) => {
                let path = format!("{}/{}", self.state.borrow().path, name);
                self.navigate(path, true).await
            }
            Action::Refresh => {
                let path = self.state.borrow().path.clone();
                self.navigate(path, false).await
            }
            Action::Download(name) => self.download_file(name).await,
            Action::Upload(local) => self.upload_file(local).await,
        };
        if let Err(e) = result {
            self.notice(e);
        }
        true
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state.borrow().phase {
            Phase::Open => Ok(()),
            Phase::Connecting => Err(FmError::Transport("connection not open yet".into())),
            Phase::Closed | Phase::Errored => Err(FmError::Closed),
        }
    }

    fn download_in_flight(&self) -> bool {
        self.download.is_some()
            || self.draining.is_some()
            || self
                .pending
                .iter()
                .any(|p| matches!(p, Pending::Download { .. }))
    }

    fn ensure_idle_for(&self, what: &'static str) -> Result<()> {
        if self.upload.is_some() {
            return Err(FmError::Busy("an upload is in progress"));
        }
        if self.download_in_flight() {
            return Err(FmError::Busy(what));
        }
        Ok(())
    }

    async fn navigate(&mut self, path: String, optimistic: bool) -> Result<()> {
        self.ensure_open()?;
        self.ensure_idle_for("a download is in progress")?;
        if optimistic {
            self.state
                .send_modify(|s| s.pending_path = Some(path.clone()));
        }
        self.list_file(path).await
    }

    async fn list_file(&mut self, path: String) -> Result<()> {
        self.pending.push_back(Pending::List);
        self.send(encode_command(Opcode::List, &path)).await
    }

    async fn download_file(&mut self, basename: String) -> Result<()> {
        self.ensure_open()?;
        self.ensure_idle_for("another download is in progress")?;

        let id = Uuid::new_v4();
        let remote = format!("{}/{}", self.state.borrow().path, basename);
        self.pending.push_back(Pending::Download {
            id,
            name: basename.clone(),
        });
        self.state.send_modify(|s| {
            s.download = Some(TransferProgress {
                id,
                name: basename.clone(),
                total: 0,
                done: 0,
            })
        });
        self.logger
            .transfer_start(Direction::Download, id, &basename, None);
        self.send(encode_command(Opcode::Download, &remote)).await
    }

    async fn upload_file(&mut self, local: PathBuf) -> Result<()> {
        self.ensure_open()?;
        self.ensure_idle_for("a download is in progress")?;
        let outbound = self.outbound.clone().ok_or(FmError::Closed)?;

        let (chunker, meta) = FileChunker::open(&local).await?;
        let mut chunker = chunker.with_chunk_size(self.chunk_size);
        let header = UploadHeader {
            path: self.state.borrow().path.clone(),
            file_name: meta.file_name.clone(),
            size: meta.size,
        };
        let id = Uuid::new_v4();

        self.pending.push_back(Pending::Upload {
            name: meta.file_name.clone(),
        });
        self.send(build_header(&header)).await?;
        self.logger
            .transfer_start(Direction::Upload, id, &meta.file_name, Some(meta.size));
        self.state.send_modify(|s| {
            s.upload = Some(TransferProgress {
                id,
                name: meta.file_name.clone(),
                total: meta.size,
                done: 0,
            })
        });

        // chunks go out from their own task so inbound frames keep flowing;
        // the header above is already queued, so ordering holds
        let ticks = self.ticks_tx.clone();
        let task = tokio::spawn(async move {
            let sent = async {
                while let Some(chunk) = chunker.next_chunk().await? {
                    outbound.send(chunk).await.map_err(|_| {
                        FmError::Transport("connection closed during upload".into())
                    })?;
                    let _ = ticks.send(UploadTick::Sent(id, chunker.offset()));
                }
                Ok::<(), FmError>(())
            }
            .await;
            let _ = ticks.send(match sent {
                Ok(()) => UploadTick::Finished(id),
                Err(e) => UploadTick::Failed(id, e),
            });
        });

        self.upload = Some(ActiveUpload {
            id,
            name: meta.file_name,
            size: meta.size,
            task,
            sent_all: false,
        });
        Ok(())
    }

    fn on_upload_tick(&mut self, tick: UploadTick) -> bool {
        match tick {
            UploadTick::Sent(id, done) => {
                self.state.send_modify(|s| {
                    if let Some(p) = s.upload.as_mut().filter(|p| p.id == id) {
                        p.done = done;
                    }
                });
                true
            }
            UploadTick::Finished(id) => {
                if let Some(upload) = self.upload.as_mut().filter(|u| u.id == id) {
                    upload.sent_all = true;
                }
                true
            }
            UploadTick::Failed(id, e) => {
                if !matches!(&self.upload, Some(u) if u.id == id) {
                    return true;
                }
                // the agent is stuck mid-upload expecting bytes; this
                // connection cannot carry another command
                self.notice(e);
                self.close_after_upload()
            }
        }
    }

    fn cancel_upload(&mut self) -> bool {
        let Some(upload) = self.upload.as_ref() else {
            return true;
        };
        upload.task.abort();
        self.logger
            .transfer_cancelled(Direction::Upload, upload.id, &upload.name);
        let _ = self.events.send(SessionEvent::UploadCancelled {
            file_name: upload.name.clone(),
        });
        self.close_after_upload()
    }

    fn close_after_upload(&mut self) -> bool {
        if let Some(upload) = self.upload.take() {
            upload.task.abort();
        }
        self.outbound = None;
        self.state.send_modify(|s| {
            s.phase = Phase::Closed;
            s.upload = None;
            s.download = None;
        });
        self.logger.closed(Some("upload abandoned"));
        let _ = self.events.send(SessionEvent::Closed);
        false
    }

    async fn cancel_download(&mut self) -> Result<()> {
        let target = match (&self.download, self.pending.iter().find_map(pending_download)) {
            (Some(d), _) => Some((d.id, d.name.clone())),
            (None, Some(found)) => Some(found),
            (None, None) => None,
        };
        let Some((id, name)) = target else {
            return Ok(());
        };

        self.send(encode_cancel()).await?;
        if let Some(active) = self.download.take() {
            // whatever the worker says, this transfer is over
            let _ = self.worker.submit(Request::Abort { transfer: active.id }).await;
        }
        // everything up to the acknowledgement gets discarded
        let relist = self.pending.iter().any(|p| matches!(p, Pending::List));
        self.pending.clear();
        self.draining = Some(Draining {
            id,
            name,
            relist,
            announce: true,
        });
        self.state.send_modify(|s| s.download = None);
        Ok(())
    }

    // ----- plumbing -----

    async fn send(&mut self, frame: Bytes) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(FmError::Closed)?;
        outbound
            .send(frame)
            .await
            .map_err(|_| FmError::Transport("connection closed".into()))
    }

    fn notice(&self, e: FmError) {
        self.logger.error(e.kind(), &e.to_string());
        let _ = self.events.send(SessionEvent::Notice(e));
    }

    /// Report once and give up on the request the failure belongs to.
    /// Returns false when the session had to close.
    async fn abandon(&mut self, scope: Scope, e: FmError) -> bool {
        self.notice(e);
        match scope {
            Scope::Stray => {}
            Scope::Listing => {
                if !self.pending.iter().any(|p| matches!(p, Pending::List)) {
                    self.state.send_modify(|s| s.pending_path = None);
                }
            }
            Scope::Download => self.abandon_download(true).await,
            Scope::Upload => return self.abandon_upload(),
            Scope::Link => {
                self.abandon_download(false).await;
                if let Some(upload) = self.upload.take() {
                    upload.task.abort();
                }
                self.state.send_modify(|s| s.upload = None);
            }
        }
        true
    }

    async fn abandon_download(&mut self, stop_stream: bool) {
        if let Some(active) = self.download.take() {
            let _ = self.worker.submit(Request::Abort { transfer: active.id }).await;
            // the rest of the file is still on its way; stop it and skip it
            if stop_stream && self.send(encode_cancel()).await.is_ok() {
                let relist = self.pending.iter().any(|p| matches!(p, Pending::List));
                self.pending.clear();
                self.draining = Some(Draining {
                    id: active.id,
                    name: active.name,
                    relist,
                    announce: false,
                });
            }
        }
        // a download still queued keeps its indicator
        if !self.pending.iter().any(|p| pending_download(p).is_some()) {
            self.state.send_modify(|s| s.download = None);
        }
    }

    /// The agent answered the upload. If chunks are still queued behind the
    /// answer it would read them as commands, so the connection goes.
    fn abandon_upload(&mut self) -> bool {
        if self.upload.as_ref().is_some_and(|u| !u.sent_all) {
            return self.close_after_upload();
        }
        if let Some(upload) = self.upload.take() {
            upload.task.abort();
        }
        self.state.send_modify(|s| s.upload = None);
        true
    }
}

fn pending_download(p: &Pending) -> Option<(TransferId, String)> {
    match p {
        Pending::Download { id, name } => Some((*id, name.clone())),
        _ => None,
    }
}

fn expect_progress(id: TransferId, event: WorkerEvent) -> Result<u64> {
    match event {
        WorkerEvent::Progress { transfer, received } if transfer == id => Ok(received),
        WorkerEvent::Error { message, .. } => Err(FmError::Worker(message)),
        other => Err(FmError::Worker(format!("unexpected reply {:?}", other))),
    }
}
