use anyhow::Result;
use bytes::Bytes;
use dashfm::link::{Link, LinkEvent, RemoteEnd};
use dashfm::listing::{encode_listing, DirEntry, EntryKind};
use dashfm::protocol_core::{
    cancel_ack_frame, decode_command, error_frame, file_frame, identified_frame, Command,
    Identifier,
};
use dashfm::reassembler::{ChunkBuffer, MemoryBuffer};
use dashfm::session::{Phase, Session, SessionEvent, SessionOptions};
use dashfm::sink::MemorySink;
use dashfm::FmError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    session: Session,
    remote: RemoteEnd,
    sink: Arc<MemorySink>,
}

impl Harness {
    async fn event(&mut self) -> SessionEvent {
        timeout(WAIT, self.session.events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("session event channel closed")
    }

    async fn frame(&mut self) -> Bytes {
        timeout(WAIT, self.remote.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the link")
    }

    async fn command(&mut self) -> Command {
        let frame = self.frame().await;
        decode_command(&frame).expect("client sent an undecodable command")
    }

    /// No event shows up within a short grace period.
    async fn quiet(&mut self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(event) = self.session.events.try_recv() {
            panic!("unexpected event {:?}", event);
        }
    }
}

fn root_listing() -> Bytes {
    encode_listing(
        "/root",
        &[
            DirEntry::new("docs", EntryKind::Directory),
            DirEntry::new("a.txt", EntryKind::File),
        ],
    )
}

async fn start_with(options: impl FnOnce(Arc<MemorySink>) -> SessionOptions) -> Harness {
    let (link, remote) = Link::memory(8);
    let sink = Arc::new(MemorySink::new());
    let session = Session::start(link, options(sink.clone())).expect("session start");
    Harness {
        session,
        remote,
        sink,
    }
}

/// Open the link and answer the initial root listing with `/root`.
async fn opened(options: impl FnOnce(Arc<MemorySink>) -> SessionOptions) -> Harness {
    let mut h = start_with(options).await;
    h.remote.open().await;
    assert_eq!(h.command().await, Command::List(String::new()));
    h.remote.send(root_listing()).await;
    match h.event().await {
        SessionEvent::Listed { path, entries } => {
            assert_eq!(path, "/root");
            assert_eq!(entries, 2);
        }
        other => panic!("expected listing, got {:?}", other),
    }
    h
}

async fn opened_default() -> Harness {
    opened(|sink| SessionOptions::new(sink)).await
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_lists_root_in_server_order() {
    let h = opened_default().await;
    let state = h.session.handle.snapshot();
    assert_eq!(state.phase, Phase::Open);
    assert_eq!(state.path, "/root");
    assert_eq!(
        state.entries,
        vec![
            DirEntry::new("docs", EntryKind::Directory),
            DirEntry::new("a.txt", EntryKind::File),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn enter_lists_child_directory() {
    let mut h = opened_default().await;
    h.session.handle.enter("docs").unwrap();
    assert_eq!(h.command().await, Command::List("/root/docs".into()));
    assert_eq!(
        h.session.handle.snapshot().pending_path.as_deref(),
        Some("/root/docs")
    );

    h.remote.send(encode_listing("/root/docs", &[])).await;
    assert!(matches!(h.event().await, SessionEvent::Listed { entries: 0, .. }));
    let state = h.session.handle.snapshot();
    assert_eq!(state.path, "/root/docs");
    assert_eq!(state.pending_path, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn download_in_three_frames_saves_once() {
    let mut h = opened_default().await;
    h.session.handle.download_file("a.txt").unwrap();
    assert_eq!(h.command().await, Command::Download("/root/a.txt".into()));

    h.remote.send(file_frame(12, b"hell")).await;
    h.remote.send(Bytes::from_static(b"o wo")).await;
    h.remote.send(Bytes::from_static(b"rld!")).await;

    match h.event().await {
        SessionEvent::Downloaded {
            file_name, bytes, ..
        } => {
            assert_eq!(file_name, "a.txt");
            assert_eq!(bytes, 12);
        }
        other => panic!("expected download, got {:?}", other),
    }
    h.quiet().await;
    assert_eq!(
        h.sink.saved(),
        vec![("a.txt".to_string(), Bytes::from_static(b"hello world!"))]
    );
    assert_eq!(h.session.handle.snapshot().download, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_download_completes_from_first_frame() {
    let mut h = opened_default().await;
    h.session.handle.download_file("a.txt").unwrap();
    h.command().await;
    h.remote.send(file_frame(0, &[])).await;

    assert!(matches!(h.event().await, SessionEvent::Downloaded { bytes: 0, .. }));
    assert_eq!(h.sink.saved().len(), 1);
}

/// Appends only after a delay, so chunks pile up behind the acknowledgement.
struct SlowBuffer(MemoryBuffer);

impl ChunkBuffer for SlowBuffer {
    fn reset(&mut self) {
        self.0.reset()
    }
    fn append(&mut self, chunk: &[u8]) -> std::result::Result<(), String> {
        std::thread::sleep(Duration::from_millis(15));
        self.0.append(chunk)
    }
    fn len(&self) -> u64 {
        self.0.len()
    }
    fn take(&mut self) -> Bytes {
        self.0.take()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_reassembly_keeps_every_chunk_in_order() {
    let mut h = opened(|sink| {
        SessionOptions::new(sink).buffer(Box::new(SlowBuffer(MemoryBuffer::new(1 << 20))))
    })
    .await;
    h.session.handle.download_file("a.txt").unwrap();
    h.command().await;

    let data = pattern(20 * 1000);
    h.remote.send(file_frame(data.len() as u64, &data[..1000])).await;
    for chunk in data[1000..].chunks(1000) {
        h.remote.send(Bytes::copy_from_slice(chunk)).await;
    }

    assert!(matches!(h.event().await, SessionEvent::Downloaded { .. }));
    let saved = h.sink.saved();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].1.as_ref(), data.as_slice());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_upload_sends_header_only_then_relists() -> Result<()> {
    let mut h = opened_default().await;
    let tmp = tempfile::tempdir()?;
    let local = tmp.path().join("empty.bin");
    std::fs::write(&local, b"")?;

    h.session.handle.upload_file(&local)?;
    match h.command().await {
        Command::Upload(header) => {
            assert_eq!(header.path, "/root");
            assert_eq!(header.file_name, "empty.bin");
            assert_eq!(header.size, 0);
        }
        other => panic!("expected upload header, got {:?}", other),
    }

    h.remote.send(identified_frame(Identifier::Complete, &[])).await;
    match h.event().await {
        SessionEvent::UploadComplete { file_name, bytes } => {
            assert_eq!(file_name, "empty.bin");
            assert_eq!(bytes, 0);
        }
        other => panic!("expected upload completion, got {:?}", other),
    }
    // the next frame is the refresh, so no chunk was ever sent
    assert_eq!(h.command().await, Command::List("/root".into()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_streams_ordered_chunks() -> Result<()> {
    let mut h = opened_default().await;
    let tmp = tempfile::tempdir()?;
    let local = tmp.path().join("big.bin");
    let data = pattern(2_500_000);
    std::fs::write(&local, &data)?;

    h.session.handle.upload_file(&local)?;
    assert!(matches!(h.command().await, Command::Upload(ref hdr) if hdr.size == 2_500_000));

    let mut sizes = Vec::new();
    let mut received = Vec::new();
    while received.len() < data.len() {
        let chunk = h.frame().await;
        sizes.push(chunk.len());
        received.extend_from_slice(&chunk);
    }
    assert_eq!(sizes, vec![1_048_576, 1_048_576, 402_848]);
    assert_eq!(received, data);

    h.remote.send(identified_frame(Identifier::Complete, &[])).await;
    assert!(matches!(
        h.event().await,
        SessionEvent::UploadComplete { bytes: 2_500_000, .. }
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_error_is_one_notice_and_link_stays_open() {
    let mut h = opened_default().await;
    h.session.handle.download_file("secret.txt").unwrap();
    h.command().await;

    h.remote.send(error_frame("permission denied")).await;
    match h.event().await {
        SessionEvent::Notice(FmError::Protocol(msg)) => assert_eq!(msg, "permission denied"),
        other => panic!("expected notice, got {:?}", other),
    }
    h.quiet().await;
    let state = h.session.handle.snapshot();
    assert_eq!(state.phase, Phase::Open);
    assert_eq!(state.download, None);

    h.session.handle.refresh().unwrap();
    assert_eq!(h.command().await, Command::List("/root".into()));
}

/// Open the link but leave the initial root listing unanswered.
async fn opened_unlisted() -> Harness {
    let mut h = start_with(|sink| SessionOptions::new(sink)).await;
    h.remote.open().await;
    assert_eq!(h.command().await, Command::List(String::new()));
    h
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listing_error_leaves_a_streaming_upload_alone() -> Result<()> {
    let mut h = opened_unlisted().await;
    let tmp = tempfile::tempdir()?;
    let local = tmp.path().join("big.bin");
    let data = pattern(3_200_000);
    std::fs::write(&local, &data)?;

    h.session.handle.upload_file(&local)?;
    assert!(matches!(h.command().await, Command::Upload(ref hdr) if hdr.size == 3_200_000));

    // answers the root listing, not the upload
    h.remote.send(error_frame("permission denied")).await;
    assert!(matches!(h.event().await, SessionEvent::Notice(FmError::Protocol(_))));
    let state = h.session.handle.snapshot();
    assert_eq!(state.phase, Phase::Open);
    assert!(state.upload.is_some());

    let mut received = Vec::new();
    while received.len() < data.len() {
        received.extend_from_slice(&h.frame().await);
    }
    assert_eq!(received, data);

    h.remote.send(identified_frame(Identifier::Complete, &[])).await;
    assert!(matches!(
        h.event().await,
        SessionEvent::UploadComplete { bytes: 3_200_000, .. }
    ));
    assert_eq!(h.command().await, Command::List(String::new()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listing_error_keeps_a_queued_download_indicator() {
    let mut h = opened_unlisted().await;
    h.session.handle.download_file("a.txt").unwrap();
    assert_eq!(h.command().await, Command::Download("/a.txt".into()));

    h.remote.send(error_frame("permission denied")).await;
    assert!(matches!(h.event().await, SessionEvent::Notice(FmError::Protocol(_))));
    let progress = h.session.handle.snapshot().download;
    assert_eq!(progress.map(|p| p.name), Some("a.txt".to_string()));

    h.remote.send(file_frame(3, b"abc")).await;
    assert!(matches!(h.event().await, SessionEvent::Downloaded { bytes: 3, .. }));
    assert_eq!(h.session.handle.snapshot().download, None);
    assert_eq!(h.sink.saved().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_refused_mid_stream_closes_the_session() -> Result<()> {
    let mut h = opened_default().await;
    let tmp = tempfile::tempdir()?;
    let local = tmp.path().join("big.bin");
    // more chunks than the outbound queue holds, so sending cannot finish
    std::fs::write(&local, pattern(12 * 1024 * 1024))?;

    h.session.handle.upload_file(&local)?;
    assert!(matches!(h.command().await, Command::Upload(_)));
    h.remote.send(error_frame("disk full")).await;

    assert!(matches!(h.event().await, SessionEvent::Notice(FmError::Protocol(_))));
    assert!(matches!(h.event().await, SessionEvent::Closed));
    let state = h.session.handle.snapshot();
    assert_eq!(state.phase, Phase::Closed);
    assert_eq!(state.upload, None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_error_mid_download_reports_once() {
    let mut h = opened_default().await;
    h.session.handle.download_file("a.txt").unwrap();
    h.command().await;
    h.remote.send(file_frame(100, &[7u8; 10])).await;

    let _ = h
        .remote
        .to_client
        .send(LinkEvent::Error("connection reset".into()))
        .await;
    let _ = h.remote.to_client.send(LinkEvent::Closed(None)).await;

    match h.event().await {
        SessionEvent::Notice(FmError::Transport(msg)) => assert_eq!(msg, "connection reset"),
        other => panic!("expected notice, got {:?}", other),
    }
    assert!(matches!(h.event().await, SessionEvent::Closed));
    h.quiet().await;
    let state = h.session.handle.snapshot();
    assert_eq!(state.phase, Phase::Errored);
    assert_eq!(state.download, None);
    assert!(h.sink.saved().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_identifier_is_a_decode_notice() {
    let mut h = opened_default().await;
    h.remote.send(Bytes::from_static(b"ZZZZpayload")).await;
    assert!(matches!(h.event().await, SessionEvent::Notice(FmError::Decode(_))));
    assert_eq!(h.session.handle.snapshot().phase, Phase::Open);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_transfers_are_refused() {
    let mut h = opened_default().await;
    h.session.handle.download_file("a.txt").unwrap();
    h.session.handle.download_file("b.txt").unwrap();
    h.session.handle.refresh().unwrap();

    assert_eq!(h.command().await, Command::Download("/root/a.txt".into()));
    assert!(matches!(h.event().await, SessionEvent::Notice(FmError::Busy(_))));
    assert!(matches!(h.event().await, SessionEvent::Notice(FmError::Busy(_))));

    // the first download is unaffected
    h.remote.send(file_frame(3, b"abc")).await;
    assert!(matches!(h.event().await, SessionEvent::Downloaded { bytes: 3, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_download_drains_until_acknowledged() {
    let mut h = opened_default().await;
    h.session.handle.download_file("a.txt").unwrap();
    h.command().await;

    h.remote.send(file_frame(100, &[7u8; 10])).await;
    h.session.handle.cancel_download().unwrap();
    assert_eq!(h.command().await, Command::Cancel);

    // frames already in flight are discarded, whatever they look like
    h.remote.send(Bytes::from(vec![8u8; 10])).await;
    h.remote.send(Bytes::from_static(b"NERRnot the ack")).await;
    h.remote.send(cancel_ack_frame()).await;

    match h.event().await {
        SessionEvent::DownloadCancelled { file_name } => assert_eq!(file_name, "a.txt"),
        other => panic!("expected cancellation, got {:?}", other),
    }
    h.quiet().await;
    assert!(h.sink.saved().is_empty());

    h.session.handle.download_file("a.txt").unwrap();
    assert_eq!(h.command().await, Command::Download("/root/a.txt".into()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffer_overflow_abandons_and_stops_the_stream() {
    let mut h = opened(|sink| SessionOptions::new(sink).buffer(Box::new(MemoryBuffer::new(8)))).await;
    h.session.handle.download_file("a.txt").unwrap();
    h.command().await;

    h.remote.send(file_frame(20, &[1u8; 4])).await;
    h.remote.send(Bytes::from(vec![2u8; 10])).await;
    assert!(matches!(h.event().await, SessionEvent::Notice(FmError::Worker(_))));
    assert_eq!(h.command().await, Command::Cancel);

    h.remote.send(Bytes::from(vec![3u8; 6])).await;
    h.remote.send(cancel_ack_frame()).await;
    h.quiet().await;
    assert!(h.sink.saved().is_empty());

    h.session.handle.refresh().unwrap();
    assert_eq!(h.command().await, Command::List("/root".into()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_upload_closes_the_session() -> Result<()> {
    let mut h = opened_default().await;
    let tmp = tempfile::tempdir()?;
    let local = tmp.path().join("big.bin");
    std::fs::write(&local, pattern(4_000_000))?;

    h.session.handle.upload_file(&local)?;
    assert!(matches!(h.command().await, Command::Upload(_)));
    h.session.handle.cancel_upload()?;

    assert!(matches!(h.event().await, SessionEvent::UploadCancelled { .. }));
    assert!(matches!(h.event().await, SessionEvent::Closed));
    assert_eq!(h.session.handle.snapshot().phase, Phase::Closed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_close_reports_once() {
    let mut h = opened_default().await;
    let _ = h
        .remote
        .to_client
        .send(LinkEvent::Closed(Some("going away".into())))
        .await;

    match h.event().await {
        SessionEvent::Notice(FmError::Transport(msg)) => assert!(msg.contains("going away")),
        other => panic!("expected notice, got {:?}", other),
    }
    assert!(matches!(h.event().await, SessionEvent::Closed));
    assert_eq!(h.session.handle.snapshot().phase, Phase::Closed);

    timeout(WAIT, &mut h.session.task)
        .await
        .expect("controller did not stop")
        .unwrap();
    assert!(matches!(h.session.handle.refresh(), Err(FmError::Closed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn actions_before_open_are_refused() {
    let mut h = start_with(|sink| SessionOptions::new(sink)).await;
    h.session.handle.download_file("a.txt").unwrap();
    assert!(matches!(h.event().await, SessionEvent::Notice(FmError::Transport(_))));
}
