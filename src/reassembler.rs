//! Download reassembler running on its own OS thread
//!
//! The session controller posts one request at a time and awaits its reply
//! before posting the next. Every request names the transfer it belongs to, so
//! bytes of an abandoned transfer can never end up in the next one's blob.
//!
//! State machine: `Idle --Begin--> Receiving --Append--> Receiving --Finish--> Idle`
//! (emitting `Result`). Any failure replies `Error` and drops back to `Idle`; the
//! caller must abandon that transfer. Chunk order is the caller's job.

use bytes::{Bytes, BytesMut};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{FmError, Result};

pub type TransferId = Uuid;

#[derive(Debug)]
pub enum Request {
    /// First chunk of a transfer (operation 1)
    Begin {
        transfer: TransferId,
        file_name: String,
        chunk: Bytes,
    },
    /// Subsequent chunk (operation 2)
    Append { transfer: TransferId, chunk: Bytes },
    Finish { transfer: TransferId },
    Abort { transfer: TransferId },
}

#[derive(Debug)]
pub enum WorkerEvent {
    /// Ready for the next chunk
    Progress { transfer: TransferId, received: u64 },
    Result {
        transfer: TransferId,
        file_name: String,
        blob: Bytes,
    },
    Error { transfer: TransferId, message: String },
    Aborted { transfer: TransferId },
}

/// Storage behind the reassembler. `MemoryBuffer` is the default; embedders can
/// spill to disk or instrument it.
pub trait ChunkBuffer: Send + 'static {
    fn reset(&mut self);
    fn append(&mut self, chunk: &[u8]) -> std::result::Result<(), String>;
    fn len(&self) -> u64;
    fn take(&mut self) -> Bytes;
}

pub struct MemoryBuffer {
    buf: BytesMut,
    limit: u64,
}

impl MemoryBuffer {
    pub fn new(limit: u64) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }
}

impl Default for MemoryBuffer {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_DOWNLOAD_BYTES)
    }
}

impl ChunkBuffer for MemoryBuffer {
    fn reset(&mut self) {
        self.buf = BytesMut::new();
    }

    fn append(&mut self, chunk: &[u8]) -> std::result::Result<(), String> {
        let after = self.buf.len() as u64 + chunk.len() as u64;
        if after > self.limit {
            return Err(format!(
                "download exceeds buffer limit ({} > {} bytes)",
                after, self.limit
            ));
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    fn take(&mut self) -> Bytes {
        std::mem::take(&mut self.buf).freeze()
    }
}

struct Envelope {
    request: Request,
    reply: oneshot::Sender<WorkerEvent>,
}

/// Handle to one session's worker thread. Dropping it stops and joins the thread.
pub struct Reassembler {
    tx: Option<mpsc::UnboundedSender<Envelope>>,
    thread: Option<JoinHandle<()>>,
}

impl Reassembler {
    pub fn spawn(buffer: Box<dyn ChunkBuffer>) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new()
            .name("dashfm-reassembler".into())
            .spawn(move || Worker::new(buffer).run(rx))?;
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    /// Post one request and wait for the worker's reply to it.
    pub async fn submit(&self, request: Request) -> Result<WorkerEvent> {
        let tx = self.tx.as_ref().ok_or(FmError::Closed)?;
        let (reply, answer) = oneshot::channel();
        tx.send(Envelope { request, reply })
            .map_err(|_| FmError::Worker("reassembler thread is gone".into()))?;
        answer
            .await
            .map_err(|_| FmError::Worker("reassembler dropped the request".into()))
    }
}

impl Drop for Reassembler {
    fn drop(&mut self) {
        // closing the channel ends the worker loop
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

enum State {
    Idle,
    Receiving { transfer: TransferId, file_name: String },
}

struct Worker {
    buffer: Box<dyn ChunkBuffer>,
    state: State,
}

impl Worker {
    fn new(buffer: Box<dyn ChunkBuffer>) -> Self {
        Self {
            buffer,
            state: State::Idle,
        }
    }

    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(Envelope { request, reply }) = rx.blocking_recv() {
            let transfer = request_transfer(&request);
            let event = match catch_unwind(AssertUnwindSafe(|| self.handle(request))) {
                Ok(event) => event,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "panic while buffering".into());
                    self.fail(transfer, message)
                }
            };
            // the controller may have given up waiting; nothing to do then
            let _ = reply.send(event);
        }
    }

    fn handle(&mut self, request: Request) -> WorkerEvent {
        match request {
            Request::Begin {
                transfer,
                file_name,
                chunk,
            } => {
                if let State::Receiving { transfer: busy, .. } = &self.state {
                    let message = format!("transfer {} is still receiving", busy);
                    return self.fail(transfer, message);
                }
                self.buffer.reset();
                if let Err(message) = self.buffer.append(&chunk) {
                    return self.fail(transfer, message);
                }
                self.state = State::Receiving {
                    transfer,
                    file_name,
                };
                WorkerEvent::Progress {
                    transfer,
                    received: self.buffer.len(),
                }
            }
            Request::Append { transfer, chunk } => {
                if let Err(message) = self.expect_receiving(transfer) {
                    return self.fail(transfer, message);
                }
                if let Err(message) = self.buffer.append(&chunk) {
                    return self.fail(transfer, message);
                }
                WorkerEvent::Progress {
                    transfer,
                    received: self.buffer.len(),
                }
            }
            Request::Finish { transfer } => {
                if let Err(message) = self.expect_receiving(transfer) {
                    return self.fail(transfer, message);
                }
                let file_name = match std::mem::replace(&mut self.state, State::Idle) {
                    State::Receiving { file_name, .. } => file_name,
                    State::Idle => String::new(),
                };
                WorkerEvent::Result {
                    transfer,
                    file_name,
                    blob: self.buffer.take(),
                }
            }
            Request::Abort { transfer } => {
                if matches!(&self.state, State::Receiving { transfer: t, .. } if *t == transfer) {
                    self.buffer.reset();
                    self.state = State::Idle;
                }
                WorkerEvent::Aborted { transfer }
            }
        }
    }

    fn expect_receiving(&self, transfer: TransferId) -> std::result::Result<(), String> {
        match &self.state {
            State::Receiving { transfer: t, .. } if *t == transfer => Ok(()),
            State::Receiving { transfer: t, .. } => {
                Err(format!("chunk for {} while receiving {}", transfer, t))
            }
            State::Idle => Err(format!("chunk for {} with no transfer started", transfer)),
        }
    }

    fn fail(&mut self, transfer: TransferId, message: String) -> WorkerEvent {
        self.buffer.reset();
        self.state = State::Idle;
        WorkerEvent::Error { transfer, message }
    }
}

fn request_transfer(request: &Request) -> TransferId {
    match request {
        Request::Begin { transfer, .. }
        | Request::Append { transfer, .. }
        | Request::Finish { transfer }
        | Request::Abort { transfer } => *transfer,
    }
}
