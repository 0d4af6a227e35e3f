//! WebSocket server for echo connections.
//!
//! Owns the listening socket, accepts connections and runs one task per
//! connection. Per-connection failures stay inside that task; only bind
//! errors and the shutdown signal affect the whole server.

use crate::config::Config;
use crate::echo::{echo_messages, Disconnect};
use crate::registry::{ClientInfo, ConnectionRegistry};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use futures_util::future::select_all;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

/// Server instance
#[derive(Debug)]
pub struct Server {
    config: Config,
    listeners: Vec<TcpListener>,
    registry: Arc<ConnectionRegistry>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Resolve the configured host and bind one listener per address.
    ///
    /// All listeners share a port: with port 0 the rest reuse the port
    /// the kernel picked for the first. Addresses whose family the host
    /// cannot serve are skipped as long as one listener comes up.
    pub async fn bind(config: Config) -> io::Result<Self> {
        let target = config.bind_target();
        let mut addrs: Vec<SocketAddr> = Vec::new();
        for addr in lookup_host(&target).await? {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        Self::bind_addrs(config, addrs)
    }

    /// Bind listeners on already resolved addresses.
    fn bind_addrs(config: Config, addrs: Vec<SocketAddr>) -> io::Result<Self> {
        let target = config.bind_target();
        let mut listeners: Vec<TcpListener> = Vec::with_capacity(addrs.len());
        let mut skipped: Option<io::Error> = None;
        for mut addr in addrs {
            if let Some(first) = listeners.first() {
                addr.set_port(first.local_addr()?.port());
            }

            match create_listener(addr, config.backlog) {
                Ok(std_listener) => {
                    let listener = TcpListener::from_std(std_listener)?;
                    debug!(address = %listener.local_addr()?, backlog = config.backlog, "Listener bound");
                    listeners.push(listener);
                }
                Err(e) if is_unsupported_family(&e) => {
                    warn!(address = %addr, error = %e, "Skipping address");
                    skipped = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if listeners.is_empty() {
            return Err(skipped.unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no addresses found for {target}"),
                )
            }));
        }

        Ok(Server {
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            registry: ConnectionRegistry::new(),
            listeners,
            config,
        })
    }

    /// Address of the first listener.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listeners[0].local_addr()
    }

    /// Addresses of every listener.
    pub fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.listeners.iter().map(TcpListener::local_addr).collect()
    }

    /// Get a reference to the registry for testing
    #[cfg(test)]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Connection tasks still running at that point are aborted.
    pub async fn run<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Connection task panicked");
                        }
                    }
                }

                accepted = accept_with_permit(&self.listeners, &self.connection_limit) => {
                    match accepted {
                        Ok((stream, peer, permit)) => {
                            debug!(peer = %peer, "New connection");
                            let registry = Arc::clone(&self.registry);
                            let ws_config = websocket_config(self.config.max_message_size);
                            tasks.spawn(async move {
                                handle_connection(stream, peer, registry, ws_config).await;
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        info!(active = self.registry.len(), "Shutting down server");
        if !self.registry.is_empty() {
            for client in self.registry.snapshot() {
                debug!(
                    peer = %client.peer,
                    path = %client.path,
                    connected_secs = client.connected_at.elapsed().as_secs(),
                    "Dropping open connection"
                );
            }
        }
        tasks.shutdown().await;
        Ok(())
    }
}

/// Wait for a free connection slot, then for the next client on any listener.
async fn accept_with_permit(
    listeners: &[TcpListener],
    limit: &Arc<Semaphore>,
) -> io::Result<(TcpStream, SocketAddr, OwnedSemaphorePermit)> {
    let permit = Arc::clone(limit)
        .acquire_owned()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let accepts = listeners.iter().map(|listener| Box::pin(listener.accept()));
    let (accepted, _, _) = select_all(accepts).await;
    let (stream, peer) = accepted?;
    Ok((stream, peer, permit))
}

/// The host has no usable stack for this address family.
fn is_unsupported_family(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::Unsupported
    ) || e.raw_os_error() == Some(libc::EAFNOSUPPORT)
}

/// Handshake, register, echo, unregister.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    ws_config: WebSocketConfig,
) {
    let mut path = String::from("/");
    let capture_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        path = request.uri().path().to_string();
        Ok(response)
    };

    let mut ws = match accept_hdr_async_with_config(stream, capture_path, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let registration = registry.register(ClientInfo::new(peer, path.as_str()));
    info!(
        peer = %peer,
        path = %path,
        active = registration.active(),
        "Client connected"
    );

    let disconnect = echo_messages(&mut ws, peer).await;
    let connected_secs = registration.elapsed().as_secs_f64();
    match &disconnect {
        Disconnect::Normal => {
            info!(peer = %peer, connected_secs, "Client disconnected normally")
        }
        Disconnect::Abnormal(reason) => {
            warn!(peer = %peer, connected_secs, reason = %reason, "Client disconnected with error")
        }
        Disconnect::Failed(reason) => {
            error!(peer = %peer, connected_secs, error = %reason, "Error handling client")
        }
    }

    let active = registration.close();
    info!(peer = %peer, outcome = %disconnect, active, "Client removed");
}

fn websocket_config(max_message_size: usize) -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(max_message_size),
        max_frame_size: Some(max_message_size),
        ..WebSocketConfig::default()
    }
}

/// Create a non-blocking TCP listener.
///
/// SO_REUSEADDR only: a port another socket is listening on must fail.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if addr.is_ipv6() {
        // Keep [::]:port from claiming the IPv4 side of a dual-stack host.
        socket.set_only_v6(true)?;
    }
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}
