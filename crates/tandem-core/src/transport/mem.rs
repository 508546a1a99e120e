use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::{Frame, TransportError};

const CHANNEL_CAPACITY: usize = 64;

/// In-process transport: a pair of bounded tokio channels.
#[derive(Clone, Debug)]
pub struct MemTransport {
    inner: Arc<InProcInner>,
}

#[derive(Debug)]
struct InProcInner {
    /// Taken on close so the peer's receiver observes end of stream.
    tx: Mutex<Option<mpsc::Sender<Frame>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Frame>>,
    closed: AtomicBool,
    closed_signal: watch::Sender<bool>,
}

impl MemTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        (Self::half(tx_b, rx_a), Self::half(tx_a, rx_b))
    }

    fn half(tx: mpsc::Sender<Frame>, rx: mpsc::Receiver<Frame>) -> Self {
        let (closed_signal, _) = watch::channel(false);
        Self {
            inner: Arc::new(InProcInner {
                tx: Mutex::new(Some(tx)),
                rx: tokio::sync::Mutex::new(rx),
                closed: AtomicBool::new(false),
                closed_signal,
            }),
        }
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let tx = self.inner.tx.lock().clone().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    pub async fn recv_frame(&self) -> Result<Frame, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut closed = self.inner.closed_signal.subscribe();
        let mut rx = self.inner.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => frame.ok_or(TransportError::Closed),
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.tx.lock().take();
        self.inner.closed_signal.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
