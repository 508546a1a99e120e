use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{mpsc, watch};

use crate::config::DEFAULT_MAX_FRAME_SIZE;
use crate::frame::{DESC_SIZE, FrameDesc};
use crate::{Frame, TransportError};

/// Maximum varint length in bytes.
const MAX_VARINT_LEN: usize = 10;

/// Encode a u64 value as a varint into a buffer.
/// Returns the number of bytes written.
fn encode_varint(mut value: u64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut i = 0;
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf[i] = byte;
            return i + 1;
        } else {
            buf[i] = byte | 0x80;
            i += 1;
        }
    }
}

/// Result of reading a varint from a stream.
enum VarintResult {
    Value(u64),
    /// Stream ended cleanly before any varint bytes were read.
    CleanEof,
    /// Stream ended after reading some varint bytes but before termination.
    TruncatedVarint,
    /// Varint exceeded 10 bytes without terminating.
    TooLong,
}

async fn read_varint<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<VarintResult, std::io::Error> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;

    for bytes_read in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if bytes_read == 0 {
                    return Ok(VarintResult::CleanEof);
                } else {
                    return Ok(VarintResult::TruncatedVarint);
                }
            }
            Err(e) => return Err(e),
        }

        value |= ((byte[0] & 0x7F) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(VarintResult::Value(value));
        }
        shift += 7;
    }

    Ok(VarintResult::TooLong)
}

/// Frames waiting for the writer task.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Byte-stream transport: `varint(len) | desc (24 bytes) | payload`.
///
/// Works over anything that is `AsyncRead + AsyncWrite`, typically a
/// `TcpStream` or a `tokio::io::duplex` pair.
///
/// Writes go through a dedicated task fed by a queue, so a `send_frame`
/// dropped mid-flight either queued its whole frame or nothing: the byte
/// stream is never left holding half a frame.
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport").finish_non_exhaustive()
    }
}

struct StreamInner {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    /// Taken on close; the writer task drains what is queued, then shuts the
    /// write half down.
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    closed: AtomicBool,
    closed_signal: watch::Sender<bool>,
    max_frame_size: AtomicUsize,
}

impl StreamInner {
    fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed_signal.send_replace(true);
        self.outbound.lock().take();
    }
}

impl StreamTransport {
    /// Must be called within a Tokio runtime: the writer task is spawned here.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_split(reader, writer)
    }

    /// Create a transport from separate reader and writer halves.
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (closed_signal, _) = watch::channel(false);
        let (outbound, queued) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let inner = Arc::new(StreamInner {
            reader: AsyncMutex::new(Box::new(reader)),
            outbound: Mutex::new(Some(outbound)),
            closed: AtomicBool::new(false),
            closed_signal,
            max_frame_size: AtomicUsize::new(DEFAULT_MAX_FRAME_SIZE),
        });
        tokio::spawn(write_frames(writer, queued, Arc::downgrade(&inner)));
        Self { inner }
    }

    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }

    pub fn set_max_frame_size(&self, size: usize) {
        self.inner.max_frame_size.store(size, Ordering::Release);
    }

    pub fn max_frame_size(&self) -> usize {
        self.inner.max_frame_size.load(Ordering::Acquire)
    }

    /// Queue `frame` for the writer task. Cancel-safe.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let len = DESC_SIZE + frame.payload.len();
        let max = self.max_frame_size();
        if len > max {
            return Err(TransportError::FrameTooLarge { size: len, max });
        }

        let outbound = self.inner.outbound.lock().clone().ok_or(TransportError::Closed)?;
        outbound.send(frame).await.map_err(|_| TransportError::Closed)
    }

    pub async fn recv_frame(&self) -> Result<Frame, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut closed = self.inner.closed_signal.subscribe();
        let mut reader = self.inner.reader.lock().await;
        tokio::select! {
            frame = self.read_frame(&mut *reader) => frame,
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
        }
    }

    async fn read_frame<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Frame, TransportError> {
        let len = match read_varint(reader).await? {
            VarintResult::Value(len) => len as usize,
            VarintResult::CleanEof => return Err(TransportError::Closed),
            VarintResult::TruncatedVarint => {
                return Err(TransportError::Malformed("truncated length prefix"));
            }
            VarintResult::TooLong => return Err(TransportError::Malformed("length prefix too long")),
        };

        let max = self.max_frame_size();
        if len > max {
            return Err(TransportError::FrameTooLarge { size: len, max });
        }
        if len < DESC_SIZE {
            return Err(TransportError::Malformed("frame shorter than descriptor"));
        }

        let mut desc = [0u8; DESC_SIZE];
        reader.read_exact(&mut desc).await?;
        let mut payload = vec![0u8; len - DESC_SIZE];
        reader.read_exact(&mut payload).await?;

        Ok(Frame::new(FrameDesc::from_bytes(&desc), payload))
    }

    /// Stop reading; queued frames are still written, then the write half is
    /// shut down so the peer sees end of stream.
    pub fn close(&self) {
        self.inner.mark_closed();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> std::io::Result<()> {
    let mut prefix = [0u8; MAX_VARINT_LEN];
    let prefix_len = encode_varint((DESC_SIZE + frame.payload.len()) as u64, &mut prefix);
    writer.write_all(&prefix[..prefix_len]).await?;
    writer.write_all(&frame.desc.to_bytes()).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await
}

/// Owns the write half. Runs until every queue sender is gone or a write fails.
async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut queued: mpsc::Receiver<Frame>,
    inner: Weak<StreamInner>,
) {
    while let Some(frame) = queued.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            tracing::debug!(error = %e, "stream write failed; closing transport");
            if let Some(inner) = inner.upgrade() {
                inner.mark_closed();
            }
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        tracing::trace!(error = %e, "write half shutdown failed");
    }
}
