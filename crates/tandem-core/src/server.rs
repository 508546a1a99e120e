//! Serving calls: method routing, handler adapters and response sinks.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::channel::{ChannelHandle, ChannelSender};
use crate::method::MAX_METHOD_NAME_LEN;
use crate::session::Role;
use crate::{
    CallContext, Frame, MethodKind, RpcSession, SessionConfig, Status, Streaming, Transport,
    TransportError,
};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), Status>> + Send + 'static>>;
pub(crate) type Handler = Arc<dyn Fn(ServerCall) -> HandlerFuture + Send + Sync>;

#[derive(Clone)]
pub(crate) struct Route {
    pub(crate) kind: MethodKind,
    pub(crate) handler: Handler,
}

/// An accepted call, before its handler has been picked apart into typed halves.
pub(crate) struct ServerCall {
    ctx: CallContext,
    sender: ChannelSender,
    rx: mpsc::Receiver<Frame>,
    handle: Arc<ChannelHandle>,
    window: u32,
}

impl ServerCall {
    pub(crate) fn new(
        ctx: CallContext,
        sender: ChannelSender,
        rx: mpsc::Receiver<Frame>,
        handle: Arc<ChannelHandle>,
        window: u32,
    ) -> Self {
        Self {
            ctx,
            sender,
            rx,
            handle,
            window,
        }
    }

    fn into_parts<Req, Resp>(self) -> (CallContext, Streaming<Req>, ResponseSink<Resp>) {
        let requests = Streaming::new(
            self.rx,
            self.handle,
            self.ctx.clone(),
            self.sender.clone(),
            self.window,
        );
        let responses = ResponseSink {
            sender: self.sender,
            ctx: self.ctx.clone(),
            _marker: PhantomData,
        };
        (self.ctx, requests, responses)
    }
}

/// Sends responses from a streaming handler.
///
/// A send waits while the caller is a full receive window behind. Each send
/// is bounded by the call's context, so a handler blocked on a slow peer
/// still observes cancellation and deadlines.
pub struct ResponseSink<T> {
    sender: ChannelSender,
    ctx: CallContext,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for ResponseSink<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            ctx: self.ctx.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ResponseSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSink")
            .field("channel_id", &self.sender.channel_id())
            .finish_non_exhaustive()
    }
}

impl<T: Serialize> ResponseSink<T> {
    pub async fn send(&self, msg: T) -> Result<(), Status> {
        let payload = self.sender.encode(&msg)?;
        self.ctx.run(self.sender.send_payload(payload)).await?
    }

    async fn send_last(&self, msg: T) -> Result<(), Status> {
        let payload = self.sender.encode(&msg)?;
        self.ctx.run(self.sender.send_last_payload(payload)).await?
    }

    async fn finish(&self) -> Result<(), Status> {
        self.ctx.run(self.sender.send_eos()).await?
    }
}

/// Maps method names to handlers.
///
/// Registration fails on empty, overlong or duplicate names:
///
/// ```ignore
/// let mut router = Router::new();
/// router
///     .unary("calculator.Sum", |_ctx, req: SumRequest| async move { Ok(req.a + req.b) })?
///     .server_streaming("calculator.Primes", primes)?;
/// ```
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// One request, one response.
    pub fn unary<Req, Resp, F, Fut>(&mut self, method: &str, f: F) -> Result<&mut Self, RouterError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |call: ServerCall| -> HandlerFuture {
            let f = f.clone();
            Box::pin(async move {
                let (ctx, mut requests, responses) = call.into_parts::<Req, Resp>();
                let request = requests.single().await?;
                let response = f(ctx, request).await?;
                responses.send_last(response).await
            })
        });
        self.insert(method, MethodKind::Unary, handler)
    }

    /// One request, any number of responses pushed through a [`ResponseSink`].
    pub fn server_streaming<Req, Resp, F, Fut>(
        &mut self,
        method: &str,
        f: F,
    ) -> Result<&mut Self, RouterError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext, Req, ResponseSink<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |call: ServerCall| -> HandlerFuture {
            let f = f.clone();
            Box::pin(async move {
                let (ctx, mut requests, responses) = call.into_parts::<Req, Resp>();
                let request = requests.single().await?;
                f(ctx, request, responses.clone()).await?;
                responses.finish().await
            })
        });
        self.insert(method, MethodKind::ServerStreaming, handler)
    }

    /// Any number of requests, one response.
    pub fn client_streaming<Req, Resp, F, Fut>(
        &mut self,
        method: &str,
        f: F,
    ) -> Result<&mut Self, RouterError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext, Streaming<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |call: ServerCall| -> HandlerFuture {
            let f = f.clone();
            Box::pin(async move {
                let (ctx, requests, responses) = call.into_parts::<Req, Resp>();
                let response = f(ctx, requests).await?;
                responses.send_last(response).await
            })
        });
        self.insert(method, MethodKind::ClientStreaming, handler)
    }

    /// Requests and responses flow independently.
    pub fn bidi_streaming<Req, Resp, F, Fut>(
        &mut self,
        method: &str,
        f: F,
    ) -> Result<&mut Self, RouterError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext, Streaming<Req>, ResponseSink<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |call: ServerCall| -> HandlerFuture {
            let f = f.clone();
            Box::pin(async move {
                let (ctx, requests, responses) = call.into_parts::<Req, Resp>();
                f(ctx, requests, responses.clone()).await?;
                responses.finish().await
            })
        });
        self.insert(method, MethodKind::Bidirectional, handler)
    }

    fn insert(
        &mut self,
        method: &str,
        kind: MethodKind,
        handler: Handler,
    ) -> Result<&mut Self, RouterError> {
        if method.is_empty() {
            return Err(RouterError::EmptyMethodName);
        }
        if method.len() > MAX_METHOD_NAME_LEN {
            return Err(RouterError::MethodNameTooLong(method.len()));
        }
        if self.routes.contains_key(method) {
            return Err(RouterError::DuplicateMethod(method.to_string()));
        }
        tracing::debug!(method, %kind, "registered method");
        self.routes
            .insert(method.to_string(), Route { kind, handler });
        Ok(self)
    }

    pub(crate) fn route(&self, method: &str) -> Option<Route> {
        self.routes.get(method).cloned()
    }

    /// The call shape registered for `method`.
    pub fn kind_of(&self, method: &str) -> Option<MethodKind> {
        self.routes.get(method).map(|route| route.kind)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.methods())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    EmptyMethodName,
    MethodNameTooLong(usize),
    DuplicateMethod(String),
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::EmptyMethodName => write!(f, "method name cannot be empty"),
            RouterError::MethodNameTooLong(len) => write!(
                f,
                "method name is {} bytes, limit is {}",
                len, MAX_METHOD_NAME_LEN
            ),
            RouterError::DuplicateMethod(name) => write!(f, "duplicate method name: {}", name),
        }
    }
}

impl std::error::Error for RouterError {}

/// Run one accepted call to its terminal frame.
///
/// The handler runs in its own task so a panic becomes `Internal` instead of
/// taking the session down. If the call's context fires first, the handler is
/// aborted and the context's status is sent.
pub(crate) async fn serve_call(handler: Handler, call: ServerCall, method: String) {
    let ctx = call.ctx.clone();
    let sender = call.sender.clone();
    let channel_id = sender.channel_id();

    let task = tokio::spawn(handler(call));
    let abort = task.abort_handle();
    let outcome = tokio::select! {
        biased;
        status = ctx.done() => {
            abort.abort();
            Err(status)
        }
        joined = task => match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                tracing::error!(channel_id, method = %method, "handler panicked");
                Err(Status::internal("handler panicked"))
            }
            Err(_) => Err(Status::cancelled("handler aborted")),
        },
    };

    match outcome {
        Ok(()) => tracing::debug!(channel_id, method = %method, "call served"),
        Err(status) => {
            tracing::debug!(
                channel_id,
                method = %method,
                code = %status.code(),
                message = status.message(),
                "call ended with error"
            );
            if let Err(e) = sender.send_error(&status).await {
                tracing::trace!(channel_id, error = %e, "error status not delivered");
            }
        }
    }
}

/// Serves a [`Router`] on accepted connections.
#[derive(Clone, Debug)]
pub struct Server {
    router: Arc<Router>,
    config: SessionConfig,
}

impl Server {
    pub fn new(router: Router) -> Self {
        Self {
            router: Arc::new(router),
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// An acceptor session for `transport` with this server's router installed.
    pub fn session(&self, transport: Transport) -> Arc<RpcSession> {
        let session = Arc::new(RpcSession::new(transport, Role::Acceptor, self.config.clone()));
        session.set_router(self.router.clone());
        session
    }

    /// Serve one connection until it closes.
    pub async fn serve(&self, transport: Transport) -> Result<(), TransportError> {
        self.session(transport).run().await
    }
}
