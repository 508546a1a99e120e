//! Per-call channel plumbing shared by the client and server halves.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::{Encoding, Frame, RpcSession, Status};

/// Keeps a channel registered on its session; the last clone releases it.
pub(crate) struct ChannelHandle {
    session: Arc<RpcSession>,
    channel_id: u32,
}

impl ChannelHandle {
    pub(crate) fn new(session: Arc<RpcSession>, channel_id: u32) -> Self {
        Self {
            session,
            channel_id,
        }
    }

    pub(crate) fn channel_id(&self) -> u32 {
        self.channel_id
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.session.release(self.channel_id);
    }
}

/// Outbound half of a channel.
///
/// `DATA` frames spend one credit each; the peer replenishes them with
/// `CREDIT` frames as it consumes. Control frames are never held back.
#[derive(Clone)]
pub(crate) struct ChannelSender {
    handle: Arc<ChannelHandle>,
    encoding: Encoding,
    next_msg_id: Arc<AtomicU64>,
    credits: Arc<Semaphore>,
}

impl ChannelSender {
    pub(crate) fn new(handle: Arc<ChannelHandle>, encoding: Encoding, credits: Arc<Semaphore>) -> Self {
        Self {
            handle,
            encoding,
            next_msg_id: Arc::new(AtomicU64::new(1)),
            credits,
        }
    }

    pub(crate) fn channel_id(&self) -> u32 {
        self.handle.channel_id()
    }

    pub(crate) fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// The peer has finished with this channel and will read no more messages.
    pub(crate) fn peer_stopped(&self) -> bool {
        self.credits.is_closed()
    }

    fn msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Encode before any await so callers never hold a borrow of `msg`
    /// across a suspension point.
    pub(crate) fn encode<T: Serialize>(&self, msg: &T) -> Result<Bytes, Status> {
        Ok(Bytes::from(self.encoding.encode(msg)?))
    }

    async fn send(&self, frame: Frame) -> Result<(), Status> {
        self.handle
            .session
            .transport()
            .send_frame(frame)
            .await
            .map_err(Status::from)
    }

    /// Wait until the peer has room for one more message.
    async fn reserve(&self) -> Result<(), Status> {
        match self.credits.acquire().await {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(Status::cancelled("peer stopped reading")),
        }
    }

    pub(crate) async fn send_payload(&self, payload: Bytes) -> Result<(), Status> {
        self.reserve().await?;
        self.send(Frame::data(self.channel_id(), self.msg_id(), payload))
            .await
    }

    /// Send a final message and end this direction in the same frame.
    pub(crate) async fn send_last_payload(&self, payload: Bytes) -> Result<(), Status> {
        self.reserve().await?;
        self.send(Frame::last_data(self.channel_id(), self.msg_id(), payload))
            .await
    }

    pub(crate) async fn send_eos(&self) -> Result<(), Status> {
        self.send(Frame::eos(self.channel_id(), self.msg_id())).await
    }

    pub(crate) async fn send_error(&self, status: &Status) -> Result<(), Status> {
        self.send(Frame::error(self.channel_id(), self.msg_id(), status))
            .await
    }

    /// Tell the peer to abandon the call without waiting on the transport.
    pub(crate) fn spawn_cancel(&self) {
        let frame = Frame::cancel(self.channel_id(), self.msg_id());
        self.spawn_control(frame, "cancel not delivered");
    }

    /// Let the peer send `messages` more, without waiting on the transport.
    pub(crate) fn spawn_credit(&self, messages: u32) {
        let frame = Frame::credit(self.channel_id(), self.msg_id(), messages);
        self.spawn_control(frame, "credit not delivered");
    }

    fn spawn_control(&self, frame: Frame, failed: &'static str) {
        let sender = self.clone();
        tokio::spawn(async move {
            let channel_id = frame.channel_id();
            if let Err(status) = sender.send(frame).await {
                tracing::trace!(channel_id, %status, "{}", failed);
            }
        });
    }
}
