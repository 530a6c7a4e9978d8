//! One full-duplex binary connection, seen by the session controller as a pair
//! of channels: frames out, socket events in.
//!
//! `Link::websocket` pumps a real WebSocket; `Link::memory` hands the other end
//! to the caller so tests (or an embedding UI) can play the server.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::timeouts::CONNECT_MS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Open,
    Frame(Bytes),
    Error(String),
    /// Close reason, if the peer sent one
    Closed(Option<String>),
}

pub struct Link {
    pub outbound: mpsc::Sender<Bytes>,
    pub inbound: mpsc::Receiver<LinkEvent>,
}

/// Server side of an in-memory link
pub struct RemoteEnd {
    pub to_client: mpsc::Sender<LinkEvent>,
    pub from_client: mpsc::Receiver<Bytes>,
}

impl RemoteEnd {
    pub async fn open(&self) {
        let _ = self.to_client.send(LinkEvent::Open).await;
    }

    pub async fn send(&self, frame: impl Into<Bytes>) {
        let _ = self.to_client.send(LinkEvent::Frame(frame.into())).await;
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.from_client.recv().await
    }
}

impl Link {
    /// `queue` bounds the outbound frames in flight; a full queue makes the
    /// sender wait, which is the only upload backpressure there is.
    pub fn memory(queue: usize) -> (Link, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::channel(queue.max(1));
        let (in_tx, in_rx) = mpsc::channel(queue.max(1));
        (
            Link {
                outbound: out_tx,
                inbound: in_rx,
            },
            RemoteEnd {
                to_client: in_tx,
                from_client: out_rx,
            },
        )
    }

    /// Connect in the background. Events arrive in socket order: `Open` (or
    /// `Error`), then frames, then exactly one `Closed`.
    pub fn websocket(url: &str, queue: usize) -> Link {
        let (out_tx, out_rx) = mpsc::channel(queue.max(1));
        let (in_tx, in_rx) = mpsc::channel(queue.max(1));
        tokio::spawn(pump(url.to_string(), out_rx, in_tx));
        Link {
            outbound: out_tx,
            inbound: in_rx,
        }
    }
}

async fn pump(url: String, mut out_rx: mpsc::Receiver<Bytes>, in_tx: mpsc::Sender<LinkEvent>) {
    let ws = match timeout(
        Duration::from_millis(CONNECT_MS),
        tokio_tungstenite::connect_async(url.as_str()),
    )
    .await
    {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => {
            let _ = in_tx.send(LinkEvent::Error(format!("connect {}: {}", url, e))).await;
            let _ = in_tx.send(LinkEvent::Closed(None)).await;
            return;
        }
        Err(_) => {
            let _ = in_tx
                .send(LinkEvent::Error(format!("connect {}: timeout ({} ms)", url, CONNECT_MS)))
                .await;
            let _ = in_tx.send(LinkEvent::Closed(None)).await;
            return;
        }
    };
    if in_tx.send(LinkEvent::Open).await.is_err() {
        return;
    }

    let (mut sink, mut stream) = ws.split();

    let writer = async {
        while let Some(frame) = out_rx.recv().await {
            sink.send(Message::Binary(frame)).await?;
        }
        // controller dropped its sender: close politely
        sink.close().await
    };

    let reader = async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(frame))) => {
                    if in_tx.send(LinkEvent::Frame(frame)).await.is_err() {
                        return None;
                    }
                }
                Some(Ok(Message::Close(close))) => {
                    return close.map(|c| c.reason.to_string()).filter(|r| !r.is_empty());
                }
                // text, ping and pong carry nothing for us
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = in_tx.send(LinkEvent::Error(e.to_string())).await;
                    return None;
                }
                None => return None,
            }
        }
    };

    let reason = tokio::select! {
        res = writer => {
            if let Err(e) = res {
                let _ = in_tx.send(LinkEvent::Error(e.to_string())).await;
            }
            None
        }
        reason = reader => reason,
    };
    let _ = in_tx.send(LinkEvent::Closed(reason)).await;
}
