#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

// Re-export tandem_core for code that needs the lower-level pieces.
#[doc(hidden)]
pub extern crate tandem_core;

// Re-export core types
pub use tandem_core::{
    // Calling side
    BidiStream,
    CallCompletion,
    // Deadlines and cancellation
    CallContext,
    Client,
    ClientStreamingCall,
    // Status model
    Code,
    // Encodings
    CodecError,
    Encoding,
    // Frame types (for advanced use)
    Frame,
    FrameFlags,
    MethodKind,
    NO_DEADLINE,
    RequestSink,
    // Serving side
    ResponseSink,
    Role,
    Router,
    RouterError,
    RpcSession,
    Server,
    // Configuration
    ConfigError,
    SessionConfig,
    Status,
    Streaming,
    // Transport types
    Transport,
    TransportError,
};

// Re-export tracing so services can log with the same macros.
#[doc(hidden)]
pub extern crate tracing;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use tandem::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CallContext, Client, Code, ResponseSink, Router, Server, Status, Streaming, Transport,
    };
}

/// Transport implementations.
///
/// Each transport is behind a feature flag. Enable the ones you need:
///
/// ```toml
/// [dependencies]
/// tandem = { version = "0.1", features = ["mem", "stream"] }
/// ```
pub mod transport {
    #[cfg(feature = "mem")]
    pub use tandem_core::mem::MemTransport;
    #[cfg(feature = "stream")]
    pub use tandem_core::stream::StreamTransport;
}

#[cfg(feature = "mem")]
pub use transport::MemTransport;
#[cfg(feature = "stream")]
pub use transport::StreamTransport;

/// Dial `addr` over TCP and start a client session on the connection.
///
/// ```ignore
/// let client = tandem::connect("127.0.0.1:50051").await?;
/// let sum: i64 = client.unary("calculator.Sum", &ctx, request).await?;
/// ```
#[cfg(feature = "stream")]
pub async fn connect(addr: impl tokio::net::ToSocketAddrs) -> std::io::Result<Client> {
    connect_with_config(addr, SessionConfig::default()).await
}

#[cfg(feature = "stream")]
pub async fn connect_with_config(
    addr: impl tokio::net::ToSocketAddrs,
    config: SessionConfig,
) -> std::io::Result<Client> {
    let socket = tokio::net::TcpStream::connect(addr).await?;
    socket.set_nodelay(true)?;
    tracing::debug!(peer = ?socket.peer_addr().ok(), "connected");
    Ok(Client::connect_with_config(
        Transport::Stream(StreamTransport::new(socket)),
        config,
    ))
}

/// Server helpers for running services over TCP.
#[cfg(feature = "stream")]
pub mod server {
    use tokio::net::{TcpListener, TcpStream};

    use crate::{Server, StreamTransport, Transport};

    /// Wrap an accepted TCP stream in a transport.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use tandem::server::serve_connection;
    ///
    /// let listener = TcpListener::bind("127.0.0.1:50051").await?;
    /// loop {
    ///     let (socket, _) = listener.accept().await?;
    ///     let server = server.clone();
    ///     tokio::spawn(async move { server.serve(serve_connection(socket)).await });
    /// }
    /// ```
    pub fn serve_connection(stream: TcpStream) -> Transport {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "could not set TCP_NODELAY");
        }
        Transport::Stream(StreamTransport::new(stream))
    }

    /// Bind `addr` and serve every accepted connection with `server`.
    ///
    /// ```ignore
    /// use tandem::server::run_tcp_server;
    ///
    /// run_tcp_server("127.0.0.1:50051", Server::new(router)).await?;
    /// ```
    pub async fn run_tcp_server(addr: &str, server: Server) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "listening");
        serve_listener(listener, server).await
    }

    /// Serve every connection accepted on `listener`, one session each.
    pub async fn serve_listener(listener: TcpListener, server: Server) -> std::io::Result<()> {
        loop {
            let (socket, peer_addr) = listener.accept().await?;
            tracing::debug!(%peer_addr, "accepted connection");

            let server = server.clone();
            tokio::spawn(async move {
                let transport = serve_connection(socket);
                match server.serve(transport).await {
                    Ok(()) => tracing::debug!(%peer_addr, "connection closed"),
                    Err(e) => tracing::warn!(%peer_addr, error = %e, "connection error"),
                }
            });
        }
    }
}
