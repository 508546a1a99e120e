//! Calling side: the four call shapes over one session.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::channel::ChannelSender;
use crate::session::Role;
use crate::{
    CallCompletion, CallContext, Encoding, MethodKind, RpcSession, SessionConfig, Status,
    Streaming, Transport,
};

/// Issues calls over a session.
///
/// Cheap to clone; clones share the underlying connection.
#[derive(Clone, Debug)]
pub struct Client {
    session: Arc<RpcSession>,
}

impl Client {
    /// Wrap a session that is already being driven by [`RpcSession::run`].
    pub fn new(session: Arc<RpcSession>) -> Self {
        Self { session }
    }

    /// Start an initiator session on `transport` and spawn its demux loop.
    pub fn connect(transport: Transport) -> Self {
        Self::connect_with_config(transport, SessionConfig::default())
    }

    pub fn connect_with_config(transport: Transport, config: SessionConfig) -> Self {
        let session = Arc::new(RpcSession::new(transport, Role::Initiator, config));
        let driver = session.clone();
        tokio::spawn(async move {
            if let Err(e) = driver.run().await {
                tracing::warn!(error = %e, "client session ended with error");
            }
        });
        Self { session }
    }

    pub fn session(&self) -> &Arc<RpcSession> {
        &self.session
    }

    /// Close the connection. Calls still in flight fail with `Unavailable`.
    pub fn close(&self) {
        self.session.close();
    }

    /// One request, one response.
    ///
    /// Returns `DeadlineExceeded` or `Cancelled` as soon as `ctx` fires; a
    /// response that arrives afterwards is discarded.
    pub async fn unary<Req, Resp>(
        &self,
        method: &str,
        ctx: &CallContext,
        request: Req,
    ) -> Result<Resp, Status>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let (sender, mut responses, ctx) = self
            .session
            .open_call::<Resp>(method, MethodKind::Unary, ctx)
            .await?;
        let payload = sender.encode(&request)?;
        let sent = ctx.run(sender.send_last_payload(payload)).await?;
        unread_is_fine(&sender, sent)?;
        responses.single().await
    }

    /// One request, a stream of responses.
    pub async fn server_streaming<Req, Resp>(
        &self,
        method: &str,
        ctx: &CallContext,
        request: Req,
    ) -> Result<Streaming<Resp>, Status>
    where
        Req: Serialize,
    {
        let (sender, responses, ctx) = self
            .session
            .open_call::<Resp>(method, MethodKind::ServerStreaming, ctx)
            .await?;
        let payload = sender.encode(&request)?;
        let sent = ctx.run(sender.send_last_payload(payload)).await?;
        unread_is_fine(&sender, sent)?;
        Ok(responses)
    }

    /// A stream of requests, one aggregate response.
    pub async fn client_streaming<Req, Resp>(
        &self,
        method: &str,
        ctx: &CallContext,
    ) -> Result<ClientStreamingCall<Req, Resp>, Status> {
        let (sender, responses, ctx) = self
            .session
            .open_call::<Resp>(method, MethodKind::ClientStreaming, ctx)
            .await?;
        Ok(ClientStreamingCall {
            sender,
            responses,
            ctx,
            _marker: PhantomData,
        })
    }

    /// Independent request and response streams.
    pub async fn bidi_streaming<Req, Resp>(
        &self,
        method: &str,
        ctx: &CallContext,
    ) -> Result<BidiStream<Req, Resp>, Status> {
        let (sender, responses, ctx) = self
            .session
            .open_call::<Resp>(method, MethodKind::Bidirectional, ctx)
            .await?;

        let (queue, pending) = mpsc::unbounded_channel();
        let completion = responses.completion();
        let encoding = sender.encoding();
        tokio::spawn(drive_send(sender, pending, ctx, completion.clone()));

        Ok(BidiStream {
            requests: RequestSink {
                queue,
                closed: Arc::new(AtomicBool::new(false)),
                completion,
                encoding,
                _marker: PhantomData,
            },
            responses,
        })
    }
}

/// An open client-streaming call.
pub struct ClientStreamingCall<Req, Resp> {
    sender: ChannelSender,
    responses: Streaming<Resp>,
    ctx: CallContext,
    _marker: PhantomData<fn(Req)>,
}

impl<Req: Serialize, Resp: DeserializeOwned> ClientStreamingCall<Req, Resp> {
    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    /// Send one request.
    ///
    /// Waits while the server is a full receive window behind, bounded by the
    /// call's context. Once the server has answered or failed the call,
    /// further requests are discarded and [`close_and_recv`](Self::close_and_recv)
    /// reports the outcome.
    pub async fn send(&mut self, request: Req) -> Result<(), Status> {
        let payload = self.sender.encode(&request)?;
        let sent = self.ctx.run(self.sender.send_payload(payload)).await?;
        unread_is_fine(&self.sender, sent)
    }

    /// End the request stream and wait for the aggregate response.
    pub async fn close_and_recv(mut self) -> Result<Resp, Status> {
        let sent = self.ctx.run(self.sender.send_eos()).await?;
        unread_is_fine(&self.sender, sent)?;
        self.responses.single().await
    }
}

impl<Req, Resp> fmt::Debug for ClientStreamingCall<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStreamingCall")
            .field("channel_id", &self.sender.channel_id())
            .finish_non_exhaustive()
    }
}

enum Outbound {
    Message(Bytes),
    Close,
}

/// Send half of a bidirectional call.
///
/// `send` never waits: messages are queued and written in order by a
/// background driver. Once the receive half reaches a terminal outcome the
/// driver stops and `send` reports that outcome.
pub struct RequestSink<T> {
    queue: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
    completion: CallCompletion,
    encoding: Encoding,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for RequestSink<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            closed: self.closed.clone(),
            completion: self.completion.clone(),
            encoding: self.encoding,
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize> RequestSink<T> {
    pub fn send(&self, request: T) -> Result<(), Status> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::internal("send after close"));
        }
        if let Some(outcome) = self.completion.peek() {
            return Err(halted_status(outcome));
        }
        let payload = Bytes::from(self.encoding.encode(&request)?);
        self.queue
            .send(Outbound::Message(payload))
            .map_err(|_| self.stopped())
    }

    /// Finish the request stream once queued messages are written.
    pub fn close_send(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.queue.send(Outbound::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stopped(&self) -> Status {
        match self.completion.peek() {
            Some(outcome) => halted_status(outcome),
            None => Status::cancelled("request stream stopped"),
        }
    }
}

impl<T> fmt::Debug for RequestSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSink")
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// A request the server will never read is not a failure of its own: the
/// response stream carries how the call ended.
fn unread_is_fine(sender: &ChannelSender, sent: Result<(), Status>) -> Result<(), Status> {
    match sent {
        Err(status) if sender.peer_stopped() => {
            tracing::trace!(channel_id = sender.channel_id(), %status, "server finished first");
            Ok(())
        }
        sent => sent,
    }
}

fn halted_status(outcome: Result<(), Status>) -> Status {
    match outcome {
        Err(status) => status,
        Ok(()) => Status::internal("call already completed"),
    }
}

/// Writes queued requests until close, the receive side finishes, or the
/// context fires.
async fn drive_send(
    sender: ChannelSender,
    mut pending: mpsc::UnboundedReceiver<Outbound>,
    ctx: CallContext,
    mut completion: CallCompletion,
) {
    let channel_id = sender.channel_id();
    loop {
        let next = tokio::select! {
            biased;
            _ = completion.wait() => {
                tracing::trace!(channel_id, "receive side finished; send driver halted");
                return;
            }
            _ = ctx.done() => return,
            next = pending.recv() => next,
        };

        let written = match next {
            Some(Outbound::Message(payload)) => {
                tokio::select! {
                    biased;
                    _ = completion.wait() => return,
                    result = ctx.run(sender.send_payload(payload)) => result,
                }
            }
            // Dropping every sink without close_send still ends the stream.
            Some(Outbound::Close) | None => {
                let result = ctx.run(sender.send_eos()).await;
                if let Ok(Err(status)) = &result {
                    tracing::debug!(channel_id, %status, "end of stream not delivered");
                }
                return;
            }
        };
        if let Ok(Err(status)) = written {
            tracing::debug!(channel_id, %status, "request not delivered; send driver stopped");
            return;
        }
        if written.is_err() {
            return;
        }
    }
}

/// Both halves of a bidirectional call.
pub struct BidiStream<Req, Resp> {
    requests: RequestSink<Req>,
    responses: Streaming<Resp>,
}

impl<Req: Serialize, Resp: DeserializeOwned> BidiStream<Req, Resp> {
    pub fn send(&self, request: Req) -> Result<(), Status> {
        self.requests.send(request)
    }

    pub fn close_send(&self) {
        self.requests.close_send();
    }

    pub async fn message(&mut self) -> Result<Option<Resp>, Status> {
        self.responses.message().await
    }

    pub fn completion(&self) -> CallCompletion {
        self.responses.completion()
    }

    /// Split so each direction can be driven from its own task.
    pub fn into_parts(self) -> (RequestSink<Req>, Streaming<Resp>) {
        (self.requests, self.responses)
    }
}

impl<Req, Resp> fmt::Debug for BidiStream<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BidiStream")
            .field("requests", &self.requests)
            .field("responses", &self.responses)
            .finish()
    }
}
