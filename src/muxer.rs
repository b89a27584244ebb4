//! # Stream Multiplexer
//!
//! Splits one [`SecureSession`] into many independent, ordered byte streams.
//!
//! ## Architecture
//!
//! ```text
//!  Stream / MuxSession handles --Command--> SessionActor --frames--> write_loop --> SecureWriter
//!                                              ^
//!  SecureReader --> read_loop ----Frame--------+
//! ```
//!
//! The actor owns every piece of per-stream state. Stream handles talk to it
//! over a channel and receive data through their own event queue. The actor
//! never waits on the network: encoded frames go to `write_loop` through a
//! bounded queue, and overflow is held in a local backlog. While the backlog
//! is long, DATA frames stay in their stream's send queue; a backlog of
//! `MAX_WRITE_BACKLOG` frames means the remote stopped reading and the session
//! is torn down.
//!
//! ## Frame Format
//!
//! Each secure frame carries exactly one mux frame:
//! `[kind: u8][stream_id: u32 BE][payload]`. A `WindowUpdate` payload is a
//! u32 BE credit increment.
//!
//! ## Flow Control
//!
//! Every stream starts with `initial_window` bytes of send credit in each
//! direction. The sender never puts more unacknowledged bytes on the wire than
//! its credit; the receiver returns credit as the application consumes data.
//! A peer that exceeds the window has the stream reset. Because of this, the
//! unbounded per-stream event queue never holds more than one window of data.
//!
//! ## Lifecycle
//!
//! - Dropping both halves of a [`Stream`] half-closes it and releases state.
//! - Resetting a stream affects only that stream.
//! - Closing the session, losing the underlying channel, or a protocol
//!   violation tears everything down: pending and later operations on every
//!   stream fail with [`MuxError::SessionClosed`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ConfigError;
use crate::identity::PeerId;
use crate::messages;
use crate::security::{MAX_SECURE_PLAINTEXT, SecureReader, SecureSession, SecureWriter};
use crate::transport::Direction;

// ============================================================================
// Constants
// ============================================================================

/// Default per-stream receive window.
pub const DEFAULT_STREAM_WINDOW: u32 = 256 * 1024;

/// Default cap on concurrently open streams per session.
pub const DEFAULT_MAX_STREAMS: usize = 512;

/// Default largest DATA payload per frame.
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Default number of inbound streams waiting for `accept`.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 64;

const FRAME_HEADER_LEN: usize = 5;

/// Frames decoded ahead of the actor. Bounded so a slow actor pushes back on
/// the network reader.
const FRAME_QUEUE_SIZE: usize = 256;

/// Encoded frames queued for the writer task.
const WRITE_QUEUE_SIZE: usize = 256;

/// Backlog length at which the actor stops producing DATA frames.
const DATA_BACKLOG_LIMIT: usize = 64;

/// SECURITY: bounds control frames queued for a peer that does not read.
const MAX_WRITE_BACKLOG: usize = 1024;

/// Time allowed for a best-effort GoAway on teardown.
const GOAWAY_TIMEOUT: Duration = Duration::from_secs(1);

/// Buffer of the duplex pipe produced by [`Stream::into_io`].
const IO_BRIDGE_BUFFER: usize = 64 * 1024;

// ============================================================================
// Configuration & Errors
// ============================================================================

#[derive(Clone, Debug)]
pub struct MuxConfig {
    pub initial_window: u32,
    pub max_streams: usize,
    pub max_frame_payload: usize,
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            initial_window: DEFAULT_STREAM_WINDOW,
            max_streams: DEFAULT_MAX_STREAMS,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
        }
    }
}

impl MuxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_payload == 0 || self.max_frame_payload + FRAME_HEADER_LEN > MAX_SECURE_PLAINTEXT {
            return Err(ConfigError::Mux(format!(
                "max_frame_payload must be in 1..={}",
                MAX_SECURE_PLAINTEXT - FRAME_HEADER_LEN
            )));
        }
        if (self.initial_window as usize) < self.max_frame_payload {
            return Err(ConfigError::Mux(
                "initial_window must be at least max_frame_payload".into(),
            ));
        }
        if self.max_streams == 0 || self.accept_backlog == 0 {
            return Err(ConfigError::Mux("max_streams and accept_backlog must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("session closed")]
    SessionClosed,
    #[error("stream reset")]
    StreamReset,
    #[error("stream closed for writing")]
    WriteClosed,
    #[error("too many open streams")]
    TooManyStreams,
    #[error("mux protocol violation: {0}")]
    Protocol(String),
}

// ============================================================================
// Frames
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum FrameKind {
    Open = 0,
    Data = 1,
    WindowUpdate = 2,
    Fin = 3,
    Reset = 4,
    GoAway = 5,
}

impl FrameKind {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => FrameKind::Open,
            1 => FrameKind::Data,
            2 => FrameKind::WindowUpdate,
            3 => FrameKind::Fin,
            4 => FrameKind::Reset,
            5 => FrameKind::GoAway,
            _ => return None,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Frame {
    kind: FrameKind,
    stream_id: u32,
    payload: Vec<u8>,
}

impl Frame {
    fn control(kind: FrameKind, stream_id: u32) -> Self {
        Self {
            kind,
            stream_id,
            payload: Vec::new(),
        }
    }

    fn window_update(stream_id: u32, credit: u32) -> Self {
        Self {
            kind: FrameKind::WindowUpdate,
            stream_id,
            payload: credit.to_be_bytes().to_vec(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.stream_id.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    fn decode(mut bytes: Vec<u8>) -> Result<Self, MuxError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(MuxError::Protocol("short frame".into()));
        }
        let kind = FrameKind::from_u8(bytes[0])
            .ok_or_else(|| MuxError::Protocol(format!("unknown frame kind {}", bytes[0])))?;
        let stream_id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let payload = bytes.split_off(FRAME_HEADER_LEN);
        Ok(Self {
            kind,
            stream_id,
            payload,
        })
    }
}

// ============================================================================
// Commands & Events
// ============================================================================

type Reply<T> = oneshot::Sender<Result<T, MuxError>>;

enum Command {
    Open(Reply<Stream>),
    Write { id: u32, data: Vec<u8>, reply: Reply<()> },
    CloseWrite { id: u32, reply: Reply<()> },
    Reset { id: u32 },
    Consumed { id: u32, bytes: usize },
    Release { id: u32 },
    StreamCount(oneshot::Sender<usize>),
}

enum StreamEvent {
    Data(Vec<u8>),
    Fin,
    Reset,
    SessionClosed,
}

/// Sends `Release` once both halves of a stream are gone.
struct StreamGuard {
    id: u32,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Release { id: self.id });
    }
}

// ============================================================================
// Stream Handles
// ============================================================================

pub struct StreamReader {
    id: u32,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    buffer: Vec<u8>,
    read_closed: bool,
    reset: bool,
    guard: Arc<StreamGuard>,
}

impl StreamReader {
    /// Next chunk of data, `Ok(None)` once the remote has half-closed.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, MuxError> {
        if !self.buffer.is_empty() {
            return Ok(Some(std::mem::take(&mut self.buffer)));
        }
        self.next_chunk().await
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, MuxError> {
        if self.reset {
            return Err(MuxError::StreamReset);
        }
        if self.read_closed {
            return Ok(None);
        }
        match self.events.recv().await {
            Some(StreamEvent::Data(data)) => {
                let _ = self.guard.cmd_tx.send(Command::Consumed {
                    id: self.id,
                    bytes: data.len(),
                });
                Ok(Some(data))
            }
            Some(StreamEvent::Fin) => {
                self.read_closed = true;
                Ok(None)
            }
            Some(StreamEvent::Reset) => {
                self.reset = true;
                Err(MuxError::StreamReset)
            }
            Some(StreamEvent::SessionClosed) | None => Err(MuxError::SessionClosed),
        }
    }

    /// Read exactly `n` bytes. `Ok(None)` if the stream ends before the first
    /// byte; a truncated read is a protocol error.
    pub async fn read_exact(&mut self, n: usize) -> Result<Option<Vec<u8>>, MuxError> {
        while self.buffer.len() < n {
            match self.next_chunk().await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None if self.buffer.is_empty() => return Ok(None),
                None => return Err(MuxError::Protocol("stream ended mid-message".into())),
            }
        }
        let rest = self.buffer.split_off(n);
        Ok(Some(std::mem::replace(&mut self.buffer, rest)))
    }

    /// Read one u32 BE length-prefixed message.
    pub async fn read_message(&mut self, max_len: usize) -> Result<Option<Vec<u8>>, MuxError> {
        let Some(len_bytes) = self.read_exact(4).await? else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        if len > max_len {
            return Err(MuxError::Protocol(format!("message of {len} bytes exceeds {max_len}")));
        }
        if len == 0 {
            return Ok(Some(Vec::new()));
        }
        self.read_exact(len)
            .await?
            .ok_or_else(|| MuxError::Protocol("stream ended mid-message".into()))
            .map(Some)
    }

    /// Read and decode one message; a closed stream is an error here.
    pub async fn recv<T: DeserializeOwned>(&mut self, max_len: usize) -> anyhow::Result<T> {
        let frame = self
            .read_message(max_len)
            .await?
            .ok_or_else(|| anyhow::anyhow!("stream closed by remote"))?;
        Ok(messages::deserialize_bounded(&frame)?)
    }
}

pub struct StreamWriter {
    id: u32,
    write_closed: bool,
    guard: Arc<StreamGuard>,
}

impl StreamWriter {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, MuxError> {
        let (tx, rx) = oneshot::channel();
        self.guard
            .cmd_tx
            .send(build(tx))
            .map_err(|_| MuxError::SessionClosed)?;
        rx.await.map_err(|_| MuxError::SessionClosed)?
    }

    /// Resolves once every byte has been handed to the secure channel.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), MuxError> {
        if self.write_closed {
            return Err(MuxError::WriteClosed);
        }
        if data.is_empty() {
            return Ok(());
        }
        let id = self.id;
        let data = data.to_vec();
        self.request(|reply| Command::Write { id, data, reply }).await
    }

    pub async fn write_message(&mut self, payload: &[u8]) -> Result<(), MuxError> {
        let len = u32::try_from(payload.len())
            .map_err(|_| MuxError::Protocol("message too large".into()))?;
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(payload);
        self.write(&framed).await
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> anyhow::Result<()> {
        let bytes = messages::serialize(message)?;
        self.write_message(&bytes).await?;
        Ok(())
    }

    /// Half-close: the remote reads EOF after all queued data.
    pub async fn close(&mut self) -> Result<(), MuxError> {
        if self.write_closed {
            return Ok(());
        }
        self.write_closed = true;
        let id = self.id;
        self.request(|reply| Command::CloseWrite { id, reply }).await
    }

    pub fn reset(&mut self) {
        self.write_closed = true;
        let _ = self.guard.cmd_tx.send(Command::Reset { id: self.id });
    }
}

/// A bidirectional, ordered byte stream inside a multiplexed session.
pub struct Stream {
    reader: StreamReader,
    writer: StreamWriter,
}

impl Stream {
    fn new(id: u32, events: mpsc::UnboundedReceiver<StreamEvent>, cmd_tx: mpsc::UnboundedSender<Command>) -> Self {
        let guard = Arc::new(StreamGuard { id, cmd_tx });
        Self {
            reader: StreamReader {
                id,
                events,
                buffer: Vec::new(),
                read_closed: false,
                reset: false,
                guard: guard.clone(),
            },
            writer: StreamWriter {
                id,
                write_closed: false,
                guard,
            },
        }
    }

    pub fn id(&self) -> u32 {
        self.reader.id
    }

    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, MuxError> {
        self.reader.read().await
    }

    pub async fn read_message(&mut self, max_len: usize) -> Result<Option<Vec<u8>>, MuxError> {
        self.reader.read_message(max_len).await
    }

    pub async fn recv<T: DeserializeOwned>(&mut self, max_len: usize) -> anyhow::Result<T> {
        self.reader.recv(max_len).await
    }

    /// [`Stream::recv`] that gives up after `timeout`.
    pub async fn recv_timeout<T: DeserializeOwned>(&mut self, max_len: usize, timeout: Duration) -> anyhow::Result<T> {
        tokio::time::timeout(timeout, self.reader.recv(max_len))
            .await
            .map_err(|_| anyhow::anyhow!("stream response timed out after {timeout:?}"))?
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), MuxError> {
        self.writer.write(data).await
    }

    pub async fn write_message(&mut self, payload: &[u8]) -> Result<(), MuxError> {
        self.writer.write_message(payload).await
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> anyhow::Result<()> {
        self.writer.send(message).await
    }

    pub async fn close_write(&mut self) -> Result<(), MuxError> {
        self.writer.close().await
    }

    pub fn reset(&mut self) {
        self.writer.reset();
    }

    pub fn split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }

    /// Adapt the stream to `AsyncRead + AsyncWrite` through a pipe pumped by
    /// two tasks. Used to run a nested upgrade over a relayed stream.
    pub fn into_io(self) -> DuplexStream {
        let (local, remote) = tokio::io::duplex(IO_BRIDGE_BUFFER);
        let (mut pipe_rd, mut pipe_wr) = tokio::io::split(remote);
        let (mut reader, mut writer) = self.split();

        tokio::spawn(async move {
            while let Ok(Some(chunk)) = reader.read().await {
                if pipe_wr.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = pipe_wr.shutdown().await;
        });
        tokio::spawn(async move {
            let mut buf = vec![0u8; DEFAULT_MAX_FRAME_PAYLOAD];
            loop {
                match pipe_rd.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        let _ = writer.close().await;
                        break;
                    }
                    Ok(n) => {
                        if writer.write(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        local
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.id()).finish_non_exhaustive()
    }
}

// ============================================================================
// Session Handle
// ============================================================================

pub struct MuxSession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    incoming: Mutex<mpsc::Receiver<Stream>>,
    shutdown: CancellationToken,
}

impl MuxSession {
    /// Start multiplexing over an established secure session.
    pub fn spawn(secure: SecureSession, direction: Direction, config: MuxConfig) -> Self {
        let remote = secure.remote_peer();
        let (reader, writer) = secure.into_split();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_SIZE);
        let (out_tx, out_rx) = mpsc::channel(WRITE_QUEUE_SIZE);
        let (incoming_tx, incoming_rx) = mpsc::channel(config.accept_backlog);
        let shutdown = CancellationToken::new();

        tokio::spawn(read_loop(reader, frame_tx, shutdown.clone()));
        tokio::spawn(write_loop(writer, out_rx, shutdown.clone()));

        let actor = SessionActor {
            remote,
            next_id: match direction {
                Direction::Outbound => 1,
                Direction::Inbound => 2,
            },
            remote_parity: match direction {
                Direction::Outbound => 0,
                Direction::Inbound => 1,
            },
            config,
            out_tx,
            backlog: VecDeque::new(),
            data_stalled: false,
            streams: HashMap::new(),
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            frame_rx,
            incoming_tx: Some(incoming_tx),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            incoming: Mutex::new(incoming_rx),
            shutdown,
        }
    }

    pub async fn open_stream(&self) -> Result<Stream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Open(tx))
            .map_err(|_| MuxError::SessionClosed)?;
        rx.await.map_err(|_| MuxError::SessionClosed)?
    }

    /// Next remote-initiated stream; `SessionClosed` once the session is gone.
    pub async fn accept(&self) -> Result<Stream, MuxError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(MuxError::SessionClosed)
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the session has been closed for any reason.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    pub async fn stream_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::StreamCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn read_loop(
    mut reader: SecureReader,
    frame_tx: mpsc::Sender<Result<Frame, MuxError>>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = reader.read_frame() => next,
        };
        let item = match next {
            Ok(Some(bytes)) => Frame::decode(bytes),
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "secure channel read failed");
                break;
            }
        };
        let fatal = item.is_err();
        if frame_tx.send(item).await.is_err() || fatal {
            break;
        }
    }
}

/// Sole owner of the secure write half. A failed write closes the session;
/// on shutdown, frames already queued and a GoAway get `GOAWAY_TIMEOUT`.
async fn write_loop(mut writer: SecureWriter, mut out_rx: mpsc::Receiver<Vec<u8>>, shutdown: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = out_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let written = tokio::select! {
            // A frame cut short leaves nothing worth saying on this channel.
            _ = shutdown.cancelled() => return,
            written = writer.write_frame(&frame) => written,
        };
        if let Err(e) = written {
            debug!(error = %e, "secure channel write failed");
            shutdown.cancel();
            return;
        }
    }
    let goaway = Frame::control(FrameKind::GoAway, 0).encode();
    let _ = tokio::time::timeout(GOAWAY_TIMEOUT, async {
        while let Ok(frame) = out_rx.try_recv() {
            if writer.write_frame(&frame).await.is_err() {
                return;
            }
        }
        let _ = writer.write_frame(&goaway).await;
        let _ = writer.close().await;
    })
    .await;
}

// ============================================================================
// Session Actor
// ============================================================================

enum Pending {
    Data {
        data: Vec<u8>,
        offset: usize,
        reply: Option<Reply<()>>,
    },
    Fin {
        reply: Option<Reply<()>>,
    },
}

impl Pending {
    fn fail(self, err: MuxError) {
        let reply = match self {
            Pending::Data { reply, .. } | Pending::Fin { reply } => reply,
        };
        if let Some(reply) = reply {
            let _ = reply.send(Err(err));
        }
    }
}

struct StreamState {
    send_credit: u32,
    send_queue: VecDeque<Pending>,
    /// Bytes the remote may still send before waiting for credit.
    recv_remaining: u32,
    /// Consumed by the application but not yet returned to the remote.
    unreturned_credit: u32,
    events: mpsc::UnboundedSender<StreamEvent>,
    write_closed: bool,
    fin_sent: bool,
    remote_fin: bool,
    released: bool,
}

impl StreamState {
    fn new(window: u32, events: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self {
            send_credit: window,
            send_queue: VecDeque::new(),
            recv_remaining: window,
            unreturned_credit: 0,
            events,
            write_closed: false,
            fin_sent: false,
            remote_fin: false,
            released: false,
        }
    }

    fn fail_pending(&mut self, err: MuxError) {
        for pending in self.send_queue.drain(..) {
            pending.fail(err.clone());
        }
    }
}

struct SessionActor {
    remote: PeerId,
    next_id: u32,
    remote_parity: u32,
    config: MuxConfig,
    out_tx: mpsc::Sender<Vec<u8>>,
    /// Encoded frames waiting for room in the writer queue.
    backlog: VecDeque<Vec<u8>>,
    /// Some stream stopped flushing because the backlog was long.
    data_stalled: bool,
    streams: HashMap<u32, StreamState>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    frame_rx: mpsc::Receiver<Result<Frame, MuxError>>,
    incoming_tx: Option<mpsc::Sender<Stream>>,
    shutdown: CancellationToken,
}

impl SessionActor {
    async fn run(mut self) {
        let reason = loop {
            let out_tx = self.out_tx.clone();
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break MuxError::SessionClosed,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break MuxError::SessionClosed,
                },
                frame = self.frame_rx.recv() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame).await,
                    Some(Err(e)) => Err(e),
                    None => break MuxError::SessionClosed,
                },
                permit = out_tx.reserve(), if !self.backlog.is_empty() => match permit {
                    Ok(permit) => {
                        match self.backlog.pop_front() {
                            Some(frame) => permit.send(frame),
                            None => drop(permit),
                        }
                        self.resume_stalled().await
                    }
                    Err(_) => break MuxError::SessionClosed,
                },
            };
            if let Err(e) = result {
                break e;
            }
        };
        self.teardown(reason);
    }

    /// Queue `frame` for the writer task without waiting on the network.
    fn send_frame(&mut self, frame: Frame) -> Result<(), MuxError> {
        let bytes = frame.encode();
        if !self.backlog.is_empty() {
            if self.backlog.len() >= MAX_WRITE_BACKLOG {
                warn!(peer = %self.remote, backlog = self.backlog.len(), "remote stopped reading, closing session");
                return Err(MuxError::Protocol("write backlog exhausted".into()));
            }
            self.backlog.push_back(bytes);
            return Ok(());
        }
        match self.out_tx.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(bytes)) => {
                self.backlog.push_back(bytes);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(MuxError::SessionClosed),
        }
    }

    fn congested(&self) -> bool {
        self.backlog.len() >= DATA_BACKLOG_LIMIT
    }

    /// Flush the streams held back by a long backlog once it has drained.
    async fn resume_stalled(&mut self) -> Result<(), MuxError> {
        if !self.data_stalled || self.backlog.len() > DATA_BACKLOG_LIMIT / 2 {
            return Ok(());
        }
        self.data_stalled = false;
        let waiting: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, s)| s.send_credit > 0 && !s.send_queue.is_empty())
            .map(|(id, _)| *id)
            .collect();
        for id in waiting {
            self.flush(id).await?;
        }
        Ok(())
    }

    fn new_stream(&mut self, id: u32) -> Stream {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.streams
            .insert(id, StreamState::new(self.config.initial_window, events_tx));
        Stream::new(id, events_rx, self.cmd_tx.clone())
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<(), MuxError> {
        match cmd {
            Command::Open(reply) => {
                if self.streams.len() >= self.config.max_streams {
                    let _ = reply.send(Err(MuxError::TooManyStreams));
                    return Ok(());
                }
                let id = self.next_id;
                self.next_id = self
                    .next_id
                    .checked_add(2)
                    .ok_or_else(|| MuxError::Protocol("stream ids exhausted".into()))?;
                self.send_frame(Frame::control(FrameKind::Open, id))?;
                let stream = self.new_stream(id);
                trace!(peer = %self.remote, stream = id, "outbound stream opened");
                let _ = reply.send(Ok(stream));
            }
            Command::Write { id, data, reply } => match self.streams.get_mut(&id) {
                None => {
                    let _ = reply.send(Err(MuxError::StreamReset));
                }
                Some(state) if state.write_closed => {
                    let _ = reply.send(Err(MuxError::WriteClosed));
                }
                Some(state) => {
                    state.send_queue.push_back(Pending::Data {
                        data,
                        offset: 0,
                        reply: Some(reply),
                    });
                    self.flush(id).await?;
                }
            },
            Command::CloseWrite { id, reply } => match self.streams.get_mut(&id) {
                None => {
                    let _ = reply.send(Err(MuxError::StreamReset));
                }
                Some(state) if state.write_closed => {
                    let _ = reply.send(Ok(()));
                }
                Some(state) => {
                    state.write_closed = true;
                    state.send_queue.push_back(Pending::Fin { reply: Some(reply) });
                    self.flush(id).await?;
                }
            },
            Command::Reset { id } => {
                if let Some(mut state) = self.streams.remove(&id) {
                    state.fail_pending(MuxError::StreamReset);
                    self.send_frame(Frame::control(FrameKind::Reset, id))?;
                }
            }
            Command::Consumed { id, bytes } => {
                let threshold = self.config.initial_window / 2;
                let update = match self.streams.get_mut(&id) {
                    Some(state) => {
                        state.unreturned_credit = state
                            .unreturned_credit
                            .saturating_add(u32::try_from(bytes).unwrap_or(u32::MAX));
                        if state.unreturned_credit >= threshold && !state.remote_fin {
                            let credit = std::mem::take(&mut state.unreturned_credit);
                            state.recv_remaining = state.recv_remaining.saturating_add(credit);
                            Some(credit)
                        } else {
                            None
                        }
                    }
                    None => None,
                };
                if let Some(credit) = update {
                    self.send_frame(Frame::window_update(id, credit))?;
                }
            }
            Command::Release { id } => {
                if let Some(state) = self.streams.get_mut(&id) {
                    state.released = true;
                    if !state.write_closed {
                        state.write_closed = true;
                        state.send_queue.push_back(Pending::Fin { reply: None });
                    }
                    self.flush(id).await?;
                }
            }
            Command::StreamCount(reply) => {
                let _ = reply.send(self.streams.len());
            }
        }
        Ok(())
    }

    /// Push queued data for `id` within its send credit, then retire the
    /// stream if it is finished.
    async fn flush(&mut self, id: u32) -> Result<(), MuxError> {
        let max_payload = self.config.max_frame_payload;
        loop {
            let congested = self.congested();
            let Some(state) = self.streams.get_mut(&id) else {
                return Ok(());
            };
            let (frame, done) = match state.send_queue.front_mut() {
                None => break,
                Some(Pending::Data { data, offset, .. }) => {
                    if state.send_credit == 0 {
                        break;
                    }
                    if congested {
                        self.data_stalled = true;
                        break;
                    }
                    let n = (data.len() - *offset)
                        .min(state.send_credit as usize)
                        .min(max_payload);
                    let chunk = data[*offset..*offset + n].to_vec();
                    *offset += n;
                    state.send_credit -= n as u32;
                    let frame = Frame {
                        kind: FrameKind::Data,
                        stream_id: id,
                        payload: chunk,
                    };
                    (frame, *offset == data.len())
                }
                Some(Pending::Fin { .. }) => {
                    state.fin_sent = true;
                    (Frame::control(FrameKind::Fin, id), true)
                }
            };
            let finished = if done { state.send_queue.pop_front() } else { None };

            self.send_frame(frame)?;

            if let Some(Pending::Data { reply: Some(r), .. } | Pending::Fin { reply: Some(r) }) = finished {
                let _ = r.send(Ok(()));
            }
        }
        self.maybe_retire(id).await
    }

    async fn maybe_retire(&mut self, id: u32) -> Result<(), MuxError> {
        let Some(state) = self.streams.get(&id) else {
            return Ok(());
        };
        if !state.released || !state.fin_sent || !state.send_queue.is_empty() {
            return Ok(());
        }
        let remote_done = state.remote_fin;
        self.streams.remove(&id);
        if !remote_done {
            // Nobody will read what the remote still sends.
            self.send_frame(Frame::control(FrameKind::Reset, id))?;
        }
        trace!(peer = %self.remote, stream = id, "stream retired");
        Ok(())
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), MuxError> {
        let id = frame.stream_id;
        match frame.kind {
            FrameKind::Open => {
                if id % 2 != self.remote_parity || id == 0 {
                    return Err(MuxError::Protocol(format!("stream id {id} has wrong parity")));
                }
                if self.streams.contains_key(&id) {
                    return Err(MuxError::Protocol(format!("stream id {id} reused")));
                }
                if self.streams.len() >= self.config.max_streams {
                    debug!(peer = %self.remote, stream = id, "refusing stream: limit reached");
                    return self.send_frame(Frame::control(FrameKind::Reset, id));
                }
                let stream = self.new_stream(id);
                let accepted = match &self.incoming_tx {
                    Some(tx) => tx.try_send(stream).is_ok(),
                    None => false,
                };
                if !accepted {
                    warn!(peer = %self.remote, stream = id, "accept backlog full, resetting stream");
                    self.streams.remove(&id);
                    self.send_frame(Frame::control(FrameKind::Reset, id))?;
                }
            }
            FrameKind::Data => {
                let Some(state) = self.streams.get_mut(&id) else {
                    return Ok(());
                };
                let len = frame.payload.len();
                if state.remote_fin || len > state.recv_remaining as usize {
                    warn!(peer = %self.remote, stream = id, "remote violated stream window, resetting");
                    if let Some(mut state) = self.streams.remove(&id) {
                        let _ = state.events.send(StreamEvent::Reset);
                        state.fail_pending(MuxError::StreamReset);
                    }
                    return self.send_frame(Frame::control(FrameKind::Reset, id));
                }
                state.recv_remaining -= len as u32;
                if state.released {
                    // Nobody reads a released stream; hand the credit straight back.
                    let _ = self.cmd_tx.send(Command::Consumed { id, bytes: len });
                } else {
                    let _ = state.events.send(StreamEvent::Data(frame.payload));
                }
            }
            FrameKind::WindowUpdate => {
                let bytes: [u8; 4] = frame
                    .payload
                    .as_slice()
                    .try_into()
                    .map_err(|_| MuxError::Protocol("bad window update".into()))?;
                if let Some(state) = self.streams.get_mut(&id) {
                    state.send_credit = state.send_credit.saturating_add(u32::from_be_bytes(bytes));
                    self.flush(id).await?;
                }
            }
            FrameKind::Fin => {
                if let Some(state) = self.streams.get_mut(&id) {
                    state.remote_fin = true;
                    let _ = state.events.send(StreamEvent::Fin);
                    self.maybe_retire(id).await?;
                }
            }
            FrameKind::Reset => {
                if let Some(mut state) = self.streams.remove(&id) {
                    let _ = state.events.send(StreamEvent::Reset);
                    state.fail_pending(MuxError::StreamReset);
                    trace!(peer = %self.remote, stream = id, "stream reset by remote");
                }
            }
            FrameKind::GoAway => return Err(MuxError::SessionClosed),
        }
        Ok(())
    }

    fn teardown(mut self, reason: MuxError) {
        debug!(peer = %self.remote, reason = %reason, streams = self.streams.len(), "mux session closing");
        // write_loop flushes what it holds, then sends the GoAway.
        for frame in self.backlog.drain(..) {
            if self.out_tx.try_send(frame).is_err() {
                break;
            }
        }
        self.shutdown.cancel();
        self.incoming_tx = None;
        for (_, mut state) in self.streams.drain() {
            let _ = state.events.send(StreamEvent::SessionClosed);
            state.fail_pending(MuxError::SessionClosed);
        }
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::Open(reply) => {
                    let _ = reply.send(Err(MuxError::SessionClosed));
                }
                Command::Write { reply, .. } | Command::CloseWrite { reply, .. } => {
                    let _ = reply.send(Err(MuxError::SessionClosed));
                }
                _ => {}
            }
        }
    }
}
