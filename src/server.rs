//! Reference file-manager agent
//!
//! Serves one directory over the v1 wire contract. Each connection handles its
//! commands strictly in order, which is what lets clients match responses to
//! requests without ids. A Cancel that arrives while a file is streaming is
//! picked up between chunks; other commands arriving then wait their turn.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::listing::{encode_listing, DirEntry, EntryKind};
use crate::protocol::{CHUNK_SIZE, MAX_LIST_ENTRIES};
use crate::protocol_core::{
    cancel_ack_frame, decode_command, error_frame, file_frame, identified_frame,
    resolve_wire_path, wire_path_of, Command, Identifier,
};
use crate::upload::UploadHeader;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

pub async fn serve(bind: &str, root: &Path) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {}", bind))?;
    serve_listener(listener, root).await
}

pub async fn serve_listener(listener: TcpListener, root: &Path) -> Result<()> {
    let root = root
        .canonicalize()
        .with_context(|| format!("canonicalize root {}", root.display()))?;
    eprintln!(
        "dashfmd listening on {} root={}",
        listener.local_addr()?,
        root.display()
    );
    loop {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let root = root.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &root).await {
                eprintln!("connection {} ended: {:#}", peer, e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, root: &Path) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("websocket handshake")?;
    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::channel::<Bytes>(64);
    let reader = tokio::spawn(async move {
        while let Some(msg) = source.next().await {
            match msg {
                Ok(Message::Binary(frame)) => {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let mut conn = Connection {
        root,
        sink: &mut sink,
        rx: &mut rx,
        backlog: VecDeque::new(),
    };
    let res = conn.run().await;
    reader.abort();
    res
}

struct Connection<'a> {
    root: &'a Path,
    sink: &'a mut WsSink,
    rx: &'a mut mpsc::Receiver<Bytes>,
    /// Commands that arrived while a download was streaming
    backlog: VecDeque<Bytes>,
}

impl Connection<'_> {
    async fn run(&mut self) -> Result<()> {
        loop {
            let frame = match self.backlog.pop_front() {
                Some(frame) => frame,
                None => match self.rx.recv().await {
                    Some(frame) => frame,
                    None => return Ok(()),
                },
            };
            match decode_command(&frame) {
                Ok(Command::List(path)) => {
                    let root = self.root.to_path_buf();
                    let listed = tokio::task::spawn_blocking(move || list_dir(&root, &path)).await;
                    let reply = match listed {
                        Ok(Ok(frame)) => frame,
                        Ok(Err(e)) => error_frame(&format!("{:#}", e)),
                        Err(e) => error_frame(&format!("listing failed: {}", e)),
                    };
                    self.send(reply).await?;
                }
                Ok(Command::Download(path)) => self.stream_file(&path).await?,
                Ok(Command::Upload(header)) => self.receive_upload(header).await?,
                Ok(Command::Cancel) => self.send(cancel_ack_frame()).await?,
                Err(e) => self.send(error_frame(&e.to_string())).await?,
            }
        }
    }

    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.sink.send(Message::Binary(frame)).await?;
        Ok(())
    }

    /// True if a Cancel arrived; anything else that arrived is kept for later.
    fn cancel_requested(&mut self) -> bool {
        while let Ok(frame) = self.rx.try_recv() {
            if matches!(decode_command(&frame), Ok(Command::Cancel)) {
                return true;
            }
            self.backlog.push_back(frame);
        }
        false
    }

    async fn stream_file(&mut self, path: &str) -> Result<()> {
        let (mut file, size) = match open_for_download(self.root, path).await {
            Ok(opened) => opened,
            Err(e) => return self.send(error_frame(&format!("{:#}", e))).await,
        };

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;
        let first = read_chunk(&mut file, &mut buf, size - sent).await?;
        sent += first as u64;
        self.send(file_frame(size, &buf[..first])).await?;

        while sent < size {
            if self.cancel_requested() {
                return self.send(cancel_ack_frame()).await;
            }
            let n = read_chunk(&mut file, &mut buf, size - sent).await?;
            sent += n as u64;
            self.send(Bytes::copy_from_slice(&buf[..n])).await?;
        }
        Ok(())
    }

    async fn receive_upload(&mut self, header: UploadHeader) -> Result<()> {
        let mut target = open_upload_target(self.root, &header).await;

        // the client streams `size` bytes no matter what, so they are always
        // consumed; a failed target just discards them
        let mut remaining = header.size;
        while remaining > 0 {
            let Some(frame) = self.rx.recv().await else {
                // disconnect: the temp file is dropped and removed
                return Ok(());
            };
            let take = frame.len().min(remaining as usize);
            remaining -= take as u64;
            if let Ok(t) = &mut target {
                if let Err(e) = t.file.write_all(&frame[..take]).await {
                    target = Err(format!("write {}: {}", header.destination(), e));
                }
            }
        }

        let reply = match target {
            Ok(t) => match t.persist().await {
                Ok(()) => identified_frame(Identifier::Complete, &[]),
                Err(e) => error_frame(&format!("persist {}: {}", header.destination(), e)),
            },
            Err(msg) => error_frame(&msg),
        };
        self.send(reply).await
    }
}

/// Temp file next to the destination, written through tokio and renamed
/// into place once every byte is in.
struct UploadTarget {
    tmp: tempfile::NamedTempFile,
    file: File,
    dest: PathBuf,
}

impl UploadTarget {
    async fn persist(mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        let Self { tmp, dest, .. } = self;
        tokio::task::spawn_blocking(move || tmp.persist(&dest).map(|_| ()).map_err(|e| e.error))
            .await
            .map_err(std::io::Error::other)?
    }
}

async fn open_upload_target(
    root: &Path,
    header: &UploadHeader,
) -> std::result::Result<UploadTarget, String> {
    let root = root.to_path_buf();
    let wanted = header.clone();
    let created = tokio::task::spawn_blocking(move || {
        let (tmp, dest) = create_upload_target(&root, &wanted)?;
        let file = tmp.reopen().context("reopen temp file")?;
        Ok::<_, anyhow::Error>((tmp, file, dest))
    })
    .await;
    match created {
        Ok(Ok((tmp, file, dest))) => Ok(UploadTarget {
            tmp,
            file: File::from_std(file),
            dest,
        }),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(e) => Err(format!("upload setup failed: {}", e)),
    }
}

fn list_dir(root: &Path, path: &str) -> Result<Bytes> {
    let dir = resolve_wire_path(root, path)?;
    if !dir.is_dir() {
        anyhow::bail!("not a directory: {}", path);
    }
    let mut items: Vec<DirEntry> = Vec::new();
    for e in std::fs::read_dir(&dir)
        .with_context(|| format!("read {}", path))?
        .flatten()
    {
        if items.len() >= MAX_LIST_ENTRIES {
            break;
        }
        let name = e.file_name().to_string_lossy().to_string();
        let kind = match e.file_type() {
            Ok(ft) if ft.is_dir() => EntryKind::Directory,
            _ => EntryKind::File,
        };
        items.push(DirEntry::new(name, kind));
    }

    // Sort entries: directories first, then files, alphabetically within each
    items.sort_by(|a, b| match (a.kind, b.kind) {
        (EntryKind::Directory, EntryKind::File) => std::cmp::Ordering::Less,
        (EntryKind::File, EntryKind::Directory) => std::cmp::Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });

    Ok(encode_listing(&wire_path_of(root, &dir), &items))
}

async fn open_for_download(root: &Path, path: &str) -> Result<(File, u64)> {
    let full = {
        let root = root.to_path_buf();
        let wire = path.to_string();
        tokio::task::spawn_blocking(move || resolve_wire_path(&root, &wire)).await??
    };
    let file = File::open(&full)
        .await
        .with_context(|| format!("open {}", path))?;
    let meta = file.metadata().await?;
    if !meta.is_file() {
        anyhow::bail!("not a regular file: {}", path);
    }
    Ok((file, meta.len()))
}

async fn read_chunk(file: &mut File, buf: &mut [u8], remaining: u64) -> Result<usize> {
    let n = buf.len().min(remaining as usize);
    file.read_exact(&mut buf[..n])
        .await
        .context("file shrank while streaming")?;
    Ok(n)
}

fn create_upload_target(
    root: &Path,
    header: &UploadHeader,
) -> Result<(tempfile::NamedTempFile, PathBuf)> {
    let dest = resolve_wire_path(root, &header.destination())?;
    let parent = dest
        .parent()
        .filter(|p| p.is_dir())
        .with_context(|| format!("no such directory: {}", header.path))?;
    if dest.is_dir() {
        anyhow::bail!("destination is a directory: {}", header.destination());
    }
    let tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", header.path))?;
    Ok((tmp, dest))
}
