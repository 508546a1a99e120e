//! Session: one logical connection carrying many concurrent calls.
//!
//! The session handles:
//! - Channel id allocation (initiator odd, acceptor even)
//! - Demultiplexing inbound frames onto per-call queues without ever waiting
//!   on a slow call
//! - Per-call credit flow control (`CREDIT` frames)
//! - Dispatching inbound `OPEN` frames to the router
//! - Cancelling server-side call contexts on `CANCEL` frames
//! - Failing every open call with `Unavailable` when the transport goes away

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc};

use crate::channel::{ChannelHandle, ChannelSender};
use crate::server::{Router, ServerCall, serve_call};
use crate::{
    CallContext, Frame, MAX_CHANNEL_CAPACITY, MethodKind, OpenCall, SessionConfig, Status,
    Streaming, Transport, TransportError,
};

/// Which side of the connection this session is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Dialed the connection; allocates odd channel ids.
    Initiator,
    /// Accepted the connection; allocates even channel ids.
    Acceptor,
}

struct ChannelEntry {
    /// Holds the receive window plus the terminal frames.
    tx: mpsc::Sender<Frame>,
    /// Present for calls this session serves; cancelled by a peer `CANCEL`.
    ctx: Option<CallContext>,
    /// Our send credits, topped up by the peer's `CREDIT` frames.
    credits: Arc<Semaphore>,
}

/// Per-call inbound queue: `window` messages, then `EOS` and `ERROR`.
fn call_queue(window: u32) -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
    mpsc::channel(window as usize + 2)
}

/// The receive window this session advertises for each call.
fn receive_window(config: &SessionConfig) -> u32 {
    let window = config.channel_capacity.clamp(1, MAX_CHANNEL_CAPACITY);
    u32::try_from(window).unwrap_or(1)
}

pub struct RpcSession {
    transport: Transport,
    role: Role,
    config: SessionConfig,
    next_channel_id: AtomicU32,
    channels: Mutex<HashMap<u32, ChannelEntry>>,
    router: Mutex<Option<Arc<Router>>>,
    closed: AtomicBool,
}

impl RpcSession {
    pub fn new(transport: Transport, role: Role, config: SessionConfig) -> Self {
        let first_id = match role {
            Role::Initiator => 1,
            Role::Acceptor => 2,
        };
        #[cfg(feature = "stream")]
        if let Transport::Stream(stream) = &transport {
            stream.set_max_frame_size(config.max_frame_size);
        }
        Self {
            transport,
            role,
            config,
            next_channel_id: AtomicU32::new(first_id),
            channels: Mutex::new(HashMap::new()),
            router: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Serve inbound calls with `router`.
    pub fn set_router(&self, router: Arc<Router>) {
        *self.router.lock() = Some(router);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of calls currently registered on this session.
    pub fn open_calls(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn next_channel_id(&self) -> u32 {
        self.next_channel_id.fetch_add(2, Ordering::Relaxed)
    }

    /// Close the transport; `run` then fails every open call.
    pub fn close(&self) {
        self.transport.close();
    }

    /// Receive and route frames until the transport closes.
    pub async fn run(self: Arc<Self>) -> Result<(), TransportError> {
        tracing::debug!(role = ?self.role, "session running");
        let result = loop {
            match self.transport.recv_frame().await {
                Ok(frame) => self.handle_frame(frame),
                Err(TransportError::Closed) => {
                    tracing::debug!(role = ?self.role, "transport closed");
                    break Ok(());
                }
                Err(e) => {
                    tracing::warn!(role = ?self.role, error = %e, "transport failed");
                    break Err(e);
                }
            }
        };
        self.shutdown();
        result
    }

    /// Drop every per-call queue so pending pulls observe `Unavailable`, and
    /// cancel every served call.
    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.transport.close();
        let drained: Vec<ChannelEntry> = {
            let mut channels = self.channels.lock();
            channels.drain().map(|(_, entry)| entry).collect()
        };
        tracing::debug!(open_calls = drained.len(), "session shut down");
        for entry in drained {
            entry.credits.close();
            if let Some(ctx) = entry.ctx {
                ctx.cancel();
            }
        }
    }

    /// Route one inbound frame. Never waits: a call that stops reading only
    /// ever stalls itself.
    fn handle_frame(self: &Arc<Self>, frame: Frame) {
        let channel_id = frame.channel_id();
        tracing::trace!(
            channel_id,
            msg_id = frame.desc.msg_id,
            flags = ?frame.desc.flags,
            len = frame.payload.len(),
            "frame received"
        );

        if frame.is_open() {
            self.accept_call(frame);
            return;
        }

        if frame.is_cancel() {
            let entry = self
                .channels
                .lock()
                .get(&channel_id)
                .map(|entry| (entry.ctx.clone(), entry.credits.clone()));
            match entry {
                Some((Some(ctx), credits)) => {
                    tracing::debug!(channel_id, "peer cancelled call");
                    ctx.cancel();
                    credits.close();
                }
                _ => tracing::trace!(channel_id, "cancel for unknown channel"),
            }
            return;
        }

        if frame.is_credit() {
            let credits = self
                .channels
                .lock()
                .get(&channel_id)
                .map(|entry| entry.credits.clone());
            match (credits, frame.credit_grant()) {
                (Some(credits), Some(grant)) => {
                    let room = Semaphore::MAX_PERMITS - credits.available_permits();
                    credits.add_permits((grant as usize).min(room));
                }
                (None, _) => tracing::trace!(channel_id, "credit for unknown channel"),
                (Some(_), None) => tracing::debug!(channel_id, "malformed credit frame"),
            }
            return;
        }

        let entry = self
            .channels
            .lock()
            .get(&channel_id)
            .map(|entry| (entry.tx.clone(), entry.credits.clone(), entry.ctx.is_none()));
        let Some((tx, credits, calling)) = entry else {
            // Late frames for calls that already finished locally.
            tracing::trace!(channel_id, "dropping frame for unknown channel");
            return;
        };

        // The peer is done with this call: nothing we send will be read. On
        // the calling side that includes the server's final response.
        if frame.is_error() || (calling && frame.is_eos()) {
            credits.close();
        }

        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => {
                tracing::trace!(channel_id, "call no longer reading; frame dropped");
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(channel_id, "peer overran its credit window; dropping call");
                self.overrun(channel_id);
            }
        }
    }

    /// Drop a call whose peer sent more than it was granted.
    fn overrun(&self, channel_id: u32) {
        let Some(entry) = self.channels.lock().remove(&channel_id) else {
            return;
        };
        entry.credits.close();
        match entry.ctx {
            Some(ctx) => ctx.cancel(),
            None => self.spawn_frame(Frame::cancel(channel_id, 0)),
        }
    }

    fn accept_call(self: &Arc<Self>, frame: Frame) {
        let channel_id = frame.channel_id();
        let open = match OpenCall::decode(&frame.payload) {
            Ok(open) => open,
            Err(e) => {
                tracing::warn!(channel_id, error = %e, "malformed open frame");
                self.reject(channel_id, Status::internal(format!("malformed open frame: {}", e)));
                return;
            }
        };

        let route = self
            .router
            .lock()
            .as_ref()
            .and_then(|router| router.route(&open.method));
        let Some(route) = route else {
            tracing::debug!(channel_id, method = %open.method, "unknown method");
            self.reject(
                channel_id,
                Status::not_found(format!("unknown method: {}", open.method)),
            );
            return;
        };
        if route.kind != open.kind {
            self.reject(
                channel_id,
                Status::internal(format!(
                    "method {} is {} but was called as {}",
                    open.method, route.kind, open.kind
                )),
            );
            return;
        }

        let mut ctx = CallContext::new().with_unix_deadline(frame.desc.deadline_ns);
        for (key, value) in open.metadata {
            ctx = ctx.with_metadata(key, value);
        }

        let window = receive_window(&self.config);
        let (tx, rx) = call_queue(window);
        let credits = Arc::new(Semaphore::new(open.window.max(1) as usize));
        let registered = {
            let mut channels = self.channels.lock();
            if self.is_closed() || channels.contains_key(&channel_id) {
                false
            } else {
                channels.insert(
                    channel_id,
                    ChannelEntry {
                        tx,
                        ctx: Some(ctx.clone()),
                        credits: credits.clone(),
                    },
                );
                true
            }
        };
        if !registered {
            tracing::warn!(channel_id, "open for a channel that is already in use");
            self.reject(channel_id, Status::internal("channel already in use"));
            return;
        }

        tracing::debug!(channel_id, method = %open.method, kind = %open.kind, "call accepted");
        let handle = Arc::new(ChannelHandle::new(self.clone(), channel_id));
        let sender = ChannelSender::new(handle.clone(), open.encoding, credits);
        // The caller starts with room for one request; streamed requests get
        // the rest of the window up front.
        if open.kind.client_streams() && window > 1 {
            sender.spawn_credit(window - 1);
        }
        let call = ServerCall::new(ctx, sender, rx, handle, window);
        tokio::spawn(serve_call(route.handler, call, open.method));
    }

    fn reject(&self, channel_id: u32, status: Status) {
        self.spawn_frame(Frame::error(channel_id, 0, &status));
    }

    fn spawn_frame(&self, frame: Frame) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let channel_id = frame.channel_id();
            if let Err(e) = transport.send_frame(frame).await {
                tracing::debug!(channel_id, error = %e, "could not send frame");
            }
        });
    }

    /// Register a new outbound call and send its `OPEN` frame.
    pub(crate) async fn open_call<Resp>(
        self: &Arc<Self>,
        method: &str,
        kind: MethodKind,
        ctx: &CallContext,
    ) -> Result<(ChannelSender, Streaming<Resp>, CallContext), Status> {
        let ctx = match (ctx.deadline(), self.config.default_timeout) {
            (None, Some(timeout)) => ctx.clone().with_timeout(timeout),
            _ => ctx.clone(),
        };
        if let Some(status) = ctx.err() {
            return Err(status);
        }

        let channel_id = self.next_channel_id();
        let window = receive_window(&self.config);
        let (tx, rx) = call_queue(window);
        // One request may go out before the acceptor grants its window.
        let credits = Arc::new(Semaphore::new(1));
        {
            let mut channels = self.channels.lock();
            if self.is_closed() {
                return Err(Status::unavailable("connection closed"));
            }
            channels.insert(
                channel_id,
                ChannelEntry {
                    tx,
                    ctx: None,
                    credits: credits.clone(),
                },
            );
        }
        let handle = Arc::new(ChannelHandle::new(self.clone(), channel_id));

        let open = OpenCall {
            method: method.to_string(),
            kind,
            encoding: self.config.encoding,
            metadata: ctx.metadata().to_vec(),
            window,
        };
        let frame = Frame::open(channel_id, &open, &ctx)
            .map_err(|e| Status::internal(format!("could not encode open frame: {}", e)))?;
        tracing::debug!(channel_id, method, %kind, "opening call");
        ctx.run(self.transport.send_frame(frame)).await??;

        let sender = ChannelSender::new(handle.clone(), self.config.encoding, credits);
        let responses = Streaming::new(rx, handle, ctx.clone(), sender.clone(), window)
            .cancel_on_abandon();
        Ok((sender, responses, ctx))
    }

    pub(crate) fn release(&self, channel_id: u32) {
        if self.channels.lock().remove(&channel_id).is_some() {
            tracing::trace!(channel_id, "channel released");
        }
    }
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
