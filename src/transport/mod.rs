// ABOUTME: Client WebSocket transport over TCP/TLS
// ABOUTME: Single ordered writer task, fragment reassembly and ping/pong handling

//! Byte-level WebSocket protocol.
//!
//! [`Transport::connect`] dials the endpoint and performs the upgrade. The
//! resulting transport splits into a cloneable [`TransportSender`], whose writes
//! all funnel through one writer task so concurrent senders never interleave
//! frame bytes, and a [`TransportReceiver`] that yields complete messages and
//! control events.

mod frame;
mod handshake;
mod stream;

pub use frame::{apply_mask, close_code, CloseFrame, Frame, FrameCodec, OpCode, MAX_PAYLOAD_LEN};
pub use handshake::{build_request, generate_key, validate_response, HandshakeError, WsUrl};
pub use stream::MaybeTlsStream;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{Framed, FramedParts};

/// Frame-level failure
#[derive(Error, Debug)]
pub enum TransportError {
    /// The socket was closed before or while the write was queued
    #[error("socket has already been closed")]
    ConnectionReset,

    /// Read or write failure on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer violated the framing protocol
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A text message was not valid UTF-8
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,

    /// A frame or message exceeded the payload limit
    #[error("payload of {0} bytes exceeds the limit")]
    TooLarge(u64),
}

/// A complete data message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Binary(Bytes),
}

/// Something read off the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A complete (possibly reassembled) data message
    Message(Message),
    /// A ping; the pong reply has already been queued
    Ping(Bytes),
    /// A pong
    Pong(Bytes),
    /// The socket closed with this code and reason
    Close(CloseFrame),
}

type Io = Framed<MaybeTlsStream, FrameCodec>;
type Ack = oneshot::Sender<Result<(), TransportError>>;

/// State shared between the sender handles and the reader
#[derive(Debug)]
struct Shared {
    closed: AtomicBool,
    local_close: watch::Sender<Option<CloseFrame>>,
}

impl Shared {
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// An open client WebSocket
#[derive(Debug)]
pub struct Transport {
    sender: TransportSender,
    receiver: TransportReceiver,
}

impl Transport {
    /// Dial `endpoint`, perform the upgrade handshake with the extra `headers`
    /// and start the writer task
    pub async fn connect(
        endpoint: &str,
        headers: &[(String, String)],
    ) -> Result<Self, HandshakeError> {
        let url = WsUrl::parse(endpoint)?;
        let mut stream = MaybeTlsStream::dial(&url).await?;
        let leftover = handshake::perform(&mut stream, &url, headers).await?;

        let mask: [u8; 4] = rand::random();
        log::debug!(
            "WebSocket upgraded: {}:{}{}",
            url.host,
            url.port,
            url.resource
        );

        Ok(Self::from_upgraded(stream, FrameCodec::client(mask), leftover))
    }

    /// Wrap an already-upgraded stream
    ///
    /// `read_buf` holds bytes received after the handshake response.
    pub fn from_upgraded(stream: MaybeTlsStream, codec: FrameCodec, read_buf: BytesMut) -> Self {
        let mut parts = FramedParts::new::<Frame>(stream, codec);
        parts.read_buf = read_buf;
        let (sink, stream) = Framed::from_parts(parts).split();

        let (local_close, local_close_rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            local_close,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, rx, Arc::clone(&shared)));

        let sender = TransportSender { tx, shared };
        let receiver = TransportReceiver {
            stream,
            sender: sender.clone(),
            local_close: local_close_rx,
            fragments: None,
            finished: false,
        };

        Self { sender, receiver }
    }

    /// Cloneable write half
    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    /// Split into the write and read halves
    pub fn split(self) -> (TransportSender, TransportReceiver) {
        (self.sender, self.receiver)
    }
}

/// Write half of a transport; clones share one ordered writer
#[derive(Debug, Clone)]
pub struct TransportSender {
    tx: mpsc::UnboundedSender<(Frame, Ack)>,
    shared: Arc<Shared>,
}

impl TransportSender {
    /// Queue a data message
    pub fn send(&self, message: Message) -> WriteHandle {
        let frame = match message {
            Message::Text(text) => Frame::text(text),
            Message::Binary(data) => Frame::binary(data),
        };
        self.enqueue(frame)
    }

    /// Queue a ping
    pub fn ping(&self, payload: impl Into<Bytes>) -> WriteHandle {
        self.enqueue(Frame::ping(payload))
    }

    /// Send a close frame and release the socket
    ///
    /// The receiver reports this close once and then ends. Writes queued after
    /// the close frame fail with [`TransportError::ConnectionReset`].
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Ok(());
        }

        let handle = self.enqueue(Frame::close(code, reason));
        self.shared.local_close.send_replace(Some(CloseFrame::new(code, reason)));
        handle.await
    }

    /// Whether the socket has been closed
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Queue a raw frame behind everything already queued
    pub fn enqueue(&self, frame: Frame) -> WriteHandle {
        let (ack, rx) = oneshot::channel();

        if self.is_closed() {
            let _ = ack.send(Err(TransportError::ConnectionReset));
        } else if let Err(mpsc::error::SendError((_, ack))) = self.tx.send((frame, ack)) {
            let _ = ack.send(Err(TransportError::ConnectionReset));
        }

        WriteHandle(rx)
    }
}

/// Resolves once the frame has been written (or failed)
#[derive(Debug)]
pub struct WriteHandle(oneshot::Receiver<Result<(), TransportError>>);

impl Future for WriteHandle {
    type Output = Result<(), TransportError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(TransportError::ConnectionReset)))
    }
}

/// The single writer: frames hit the wire in the order they were queued
async fn write_loop(
    mut sink: SplitSink<Io, Frame>,
    mut rx: mpsc::UnboundedReceiver<(Frame, Ack)>,
    shared: Arc<Shared>,
) {
    while let Some((frame, ack)) = rx.recv().await {
        let is_close = frame.opcode == OpCode::Close;
        let result = sink.send(frame).await;
        let failed = result.is_err();
        let _ = ack.send(result);

        if is_close || failed {
            break;
        }
    }

    shared.mark_closed();
    let _ = sink.close().await;

    rx.close();
    while let Ok((_, ack)) = rx.try_recv() {
        let _ = ack.send(Err(TransportError::ConnectionReset));
    }
}

/// Read half of a transport
#[derive(Debug)]
pub struct TransportReceiver {
    stream: SplitStream<Io>,
    sender: TransportSender,
    local_close: watch::Receiver<Option<CloseFrame>>,
    fragments: Option<(OpCode, BytesMut)>,
    finished: bool,
}

enum Next {
    LocalClose,
    Frame(Option<Result<Frame, TransportError>>),
}

impl TransportReceiver {
    /// Next event from the socket, or `None` once the socket has closed
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        while !self.finished {
            let next = tokio::select! {
                biased;
                res = self.local_close.changed() => match res {
                    Ok(()) => Next::LocalClose,
                    Err(_) => Next::Frame(None),
                },
                frame = self.stream.next() => Next::Frame(frame),
            };

            let frame = match next {
                Next::LocalClose => {
                    self.finished = true;
                    let close = self.local_close.borrow().clone();
                    return close.map(TransportEvent::Close);
                }
                Next::Frame(None) => {
                    self.finished = true;
                    self.sender.shared.mark_closed();
                    return None;
                }
                Next::Frame(Some(Err(TransportError::TooLarge(len)))) => {
                    return Some(self.fail(close_code::TOO_BIG, &format!("frame of {} bytes", len)));
                }
                Next::Frame(Some(Err(TransportError::Io(e)))) => {
                    log::debug!("WebSocket read failed: {}", e);
                    self.finished = true;
                    self.sender.shared.mark_closed();
                    return None;
                }
                Next::Frame(Some(Err(e))) => {
                    return Some(self.fail(close_code::PROTOCOL_ERROR, &e.to_string()));
                }
                Next::Frame(Some(Ok(frame))) => frame,
            };

            if let Some(event) = self.handle_frame(frame) {
                return Some(event);
            }
        }

        None
    }

    fn handle_frame(&mut self, frame: Frame) -> Option<TransportEvent> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragments.is_some() {
                    return Some(self.fail(
                        close_code::PROTOCOL_ERROR,
                        "data frame inside a fragmented message",
                    ));
                }
                if frame.fin {
                    return Some(self.finish_message(frame.opcode, frame.payload));
                }
                self.fragments = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                None
            }
            OpCode::Continuation => {
                let Some((_, buf)) = self.fragments.as_mut() else {
                    return Some(self.fail(close_code::PROTOCOL_ERROR, "unexpected continuation frame"));
                };
                if buf.len() + frame.payload.len() > MAX_PAYLOAD_LEN {
                    return Some(self.fail(close_code::TOO_BIG, "fragmented message too large"));
                }
                buf.extend_from_slice(&frame.payload);

                if !frame.fin {
                    return None;
                }
                let (opcode, buf) = self.fragments.take()?;
                Some(self.finish_message(opcode, buf.freeze()))
            }
            OpCode::Ping => {
                // reply is queued behind any pending writes
                let _ = self.sender.enqueue(Frame::pong(frame.payload.clone()));
                Some(TransportEvent::Ping(frame.payload))
            }
            OpCode::Pong => Some(TransportEvent::Pong(frame.payload)),
            OpCode::Close => {
                let close = match CloseFrame::parse(&frame.payload) {
                    Ok(close) => close,
                    Err(TransportError::InvalidUtf8) => {
                        return Some(self.fail(close_code::INVALID_DATA, "close reason is not UTF-8"))
                    }
                    Err(e) => return Some(self.fail(close_code::PROTOCOL_ERROR, &e.to_string())),
                };
                let _ = self.sender.enqueue(Frame::close(close.code, ""));
                self.finished = true;
                Some(TransportEvent::Close(close))
            }
        }
    }

    fn finish_message(&mut self, opcode: OpCode, payload: Bytes) -> TransportEvent {
        match opcode {
            OpCode::Text => match String::from_utf8(payload.to_vec()) {
                Ok(text) => TransportEvent::Message(Message::Text(text)),
                Err(_) => self.fail(close_code::INVALID_DATA, "text message is not UTF-8"),
            },
            _ => TransportEvent::Message(Message::Binary(payload)),
        }
    }

    /// Close the socket after a protocol violation
    fn fail(&mut self, code: u16, reason: &str) -> TransportEvent {
        log::warn!("Closing WebSocket ({}): {}", code, reason);
        let _ = self.sender.enqueue(Frame::close(code, reason));
        self.finished = true;
        TransportEvent::Close(CloseFrame::new(code, reason))
    }
}
