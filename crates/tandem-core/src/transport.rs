//! Transport enum and its backends.
//!
//! A transport moves whole [`Frame`]s, reliably and in order, between two
//! peers. Everything above it (channels, call shapes, deadlines) lives in the
//! session.

use std::fmt;

use crate::{Frame, Status};

#[derive(Clone, Debug)]
pub enum Transport {
    #[cfg(feature = "mem")]
    Mem(mem::MemTransport),
    #[cfg(feature = "stream")]
    Stream(stream::StreamTransport),
}

impl Transport {
    pub async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.send_frame(frame).await,
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.send_frame(frame).await,
        }
    }

    pub async fn recv_frame(&self) -> Result<Frame, TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.recv_frame().await,
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.recv_frame().await,
        }
    }

    pub fn close(&self) {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.close(),
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.is_closed(),
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.is_closed(),
        }
    }

    #[cfg(feature = "mem")]
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Transport::Mem(a), Transport::Mem(b))
    }

    #[cfg(feature = "stream")]
    pub fn stream_pair() -> (Self, Self) {
        let (a, b) = stream::StreamTransport::pair();
        (Transport::Stream(a), Transport::Stream(b))
    }
}

#[cfg(feature = "mem")]
impl From<mem::MemTransport> for Transport {
    fn from(t: mem::MemTransport) -> Self {
        Transport::Mem(t)
    }
}

#[cfg(feature = "stream")]
impl From<stream::StreamTransport> for Transport {
    fn from(t: stream::StreamTransport) -> Self {
        Transport::Stream(t)
    }
}

#[derive(Debug)]
pub enum TransportError {
    /// The transport was closed locally or by the peer.
    Closed,
    Io(std::io::Error),
    /// A frame exceeded the configured maximum size.
    FrameTooLarge { size: usize, max: usize },
    /// Bytes on the wire did not form a valid frame.
    Malformed(&'static str),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::Io(e) => write!(f, "transport i/o error: {}", e),
            TransportError::FrameTooLarge { size, max } => {
                write!(f, "frame of {} bytes exceeds limit of {} bytes", size, max)
            }
            TransportError::Malformed(what) => write!(f, "malformed frame: {}", what),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<TransportError> for Status {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed | TransportError::Io(_) => {
                Status::unavailable(err.to_string())
            }
            TransportError::FrameTooLarge { .. } | TransportError::Malformed(_) => {
                Status::internal(err.to_string())
            }
        }
    }
}

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "stream")]
pub mod stream;
