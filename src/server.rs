//! Listener and Dispatcher
//!
//! [`Server::bind`] opens the listening socket; [`Server::start`] spawns the
//! accept loop and returns a [`ServerHandle`] to observe and stop it.
//!
//! ```text
//!   accept() ──> permit available? ──yes──> spawn ConnectionHandler
//!                       │
//!                       no
//!                       ▼
//!        "-ERR max number of clients reached", close
//! ```
//!
//! Shutdown stops accepting, signals every connection, waits up to
//! `shutdown_timeout` for them to finish, aborts whatever is left, and
//! finally stops the expiry sweeper.

use crate::commands::CommandExecutor;
use crate::config::ServerConfig;
use crate::connection::handler::shutdown_signalled;
use crate::connection::{handle_connection, ConnectionStats};
use crate::storage::{ExpirySweeper, Store};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Sent to clients turned away by the connection limit
pub const BUSY_REPLY: &[u8] = b"-ERR max number of clients reached\r\n";

/// Pending connection queue length for the listening socket
const LISTEN_BACKLOG: u32 = 1024;

/// First delay after a transient accept error; doubles up to the maximum
const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Errors that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The address could not be resolved or bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The listener failed in a way retrying will not fix
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// The accept loop task panicked or was cancelled
    #[error("server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A bound, not yet running server.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    store: Arc<Store>,
}

impl Server {
    /// Resolves the configured address and starts listening on it.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let addr = config.bind_address();
        let bind_error = |source: io::Error| ServerError::Bind {
            addr: addr.clone(),
            source,
        };

        let resolved = lookup_host(&addr)
            .await
            .map_err(bind_error)?
            .next()
            .ok_or_else(|| {
                bind_error(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "address resolved to nothing",
                ))
            })?;

        let listener = listen(resolved).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        info!(addr = %local_addr, "Listening");

        Ok(Self {
            listener,
            local_addr,
            store: Arc::new(match config.max_keys {
                Some(max_keys) => Store::with_max_keys(max_keys),
                None => Store::new(),
            }),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The store the server will serve.
    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Spawns the accept loop on the current runtime.
    pub fn start(self) -> ServerHandle {
        let stats = Arc::new(ConnectionStats::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(
            self.listener,
            self.config,
            Arc::clone(&self.store),
            Arc::clone(&stats),
            shutdown_rx,
        ));

        ServerHandle {
            local_addr: self.local_addr,
            stats,
            store: self.store,
            shutdown_tx,
            task: Some(task),
            started_at: Instant::now(),
        }
    }
}

fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Control surface of a running server.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    stats: Arc<ConnectionStats>,
    store: Arc<Store>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<Result<(), ServerError>>>,
    started_at: Instant,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Time since the server started accepting.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Asks the server to drain and stop, without waiting.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Drains and stops the server, returning once it has stopped.
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        self.signal_shutdown();
        self.wait().await
    }

    /// Waits for the server to stop, either after a shutdown request or a
    /// fatal accept error.
    ///
    /// Cancel safe: if the future is dropped, `wait` can be called again.
    pub async fn wait(&mut self) -> Result<(), ServerError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let result = task.await;
        self.task = None;
        result?
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: ServerConfig,
    store: Arc<Store>,
    stats: Arc<ConnectionStats>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let sweeper = ExpirySweeper::start(Arc::clone(&store), config.expiry.clone());
    let executor = CommandExecutor::new(store);
    let limiter = Arc::new(Semaphore::new(
        config.max_connections.min(Semaphore::MAX_PERMITS),
    ));
    let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

    let mut clients = JoinSet::new();
    let mut next_id: u64 = 0;
    let mut backoff = MIN_ACCEPT_BACKOFF;

    let result = loop {
        tokio::select! {
            biased;

            _ = shutdown_signalled(&mut shutdown_rx) => {
                info!("Shutdown requested, no longer accepting connections");
                break Ok(());
            }

            Some(joined) = clients.join_next() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(error = ?e, "A connection handler panicked");
                    }
                }
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    backoff = MIN_ACCEPT_BACKOFF;

                    let Ok(permit) = Arc::clone(&limiter).try_acquire_owned() else {
                        reject(stream, addr, &stats);
                        continue;
                    };

                    next_id += 1;
                    let id = next_id;
                    let executor = executor.clone();
                    let stats = Arc::clone(&stats);
                    let shutdown = conn_shutdown_rx.clone();

                    debug!(conn_id = id, client = %addr, "Accepted connection");
                    clients.spawn(async move {
                        let _permit = permit;
                        handle_connection(stream, id, addr, executor, stats, shutdown).await;
                    });
                }
                Err(e) if is_transient(&e) => {
                    warn!(error = %e, retry_in_ms = backoff.as_millis(), "Transient accept error");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
                }
                Err(e) => {
                    error!(error = %e, "Fatal accept error, stopping server");
                    break Err(ServerError::Accept(e));
                }
            },
        }
    };

    drop(listener);
    let _ = conn_shutdown_tx.send(true);

    if !clients.is_empty() {
        info!(active = clients.len(), "Waiting for connections to close");
    }

    let drained = tokio::time::timeout(config.shutdown_timeout, async {
        while let Some(joined) = clients.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = ?e, "A connection handler panicked");
                }
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = clients.len(),
            "Shutdown timeout elapsed, aborting remaining connections"
        );
        clients.shutdown().await;
    }

    sweeper.shutdown().await;
    info!("Server stopped");

    result
}

/// Turns a client away without ever blocking the accept loop.
fn reject(stream: TcpStream, addr: SocketAddr, stats: &ConnectionStats) {
    stats.connection_rejected();
    warn!(client = %addr, "Connection limit reached, rejecting client");

    if let Err(e) = stream.try_write(BUSY_REPLY) {
        debug!(client = %addr, error = %e, "Could not send busy reply");
    }
}

/// Accept errors worth retrying: the failure belongs to one connection
/// attempt, or to a resource that frees up again.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_out_of_descriptors(e)
}

// Unix errno values, the same on Linux, macOS and the BSDs
#[cfg(unix)]
const ENFILE: i32 = 23;
#[cfg(unix)]
const EMFILE: i32 = 24;

#[cfg(unix)]
fn is_out_of_descriptors(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(ENFILE) | Some(EMFILE))
}

#[cfg(not(unix))]
fn is_out_of_descriptors(_: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..Default::default()
        }
    }

    async fn read_some(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = vec![0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf.truncate(n);
        buf
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        #[cfg(unix)]
        {
            assert!(is_transient(&io::Error::from_raw_os_error(EMFILE)));
            assert!(is_transient(&io::Error::from_raw_os_error(ENFILE)));
        }

        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient(&io::Error::new(io::ErrorKind::Other, "broken")));
    }

    #[tokio::test]
    async fn test_bind_and_serve() {
        let server = Server::bind(test_config()).await.unwrap();
        let addr = server.local_addr();
        assert_ne!(addr.port(), 0);

        let handle = server.start();
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"PING\r\n").await.unwrap();
        assert_eq!(read_some(&mut client).await, b"+PONG\r\n");

        drop(client);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_max_keys_bounds_store() {
        let config = ServerConfig {
            max_keys: Some(10),
            ..test_config()
        };
        let server = Server::bind(config).await.unwrap();
        assert_eq!(server.store().max_keys(), Some(10));

        let handle = server.start();
        assert!(handle.uptime() < Duration::from_secs(60));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = ServerConfig {
            max_connections: 1,
            ..test_config()
        };
        let handle = Server::bind(config).await.unwrap().start();
        let addr = handle.local_addr();

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"PING\n").await.unwrap();
        assert_eq!(read_some(&mut first).await, b"+PONG\r\n");

        let mut second = TcpStream::connect(addr).await.unwrap();
        assert_eq!(read_some(&mut second).await, BUSY_REPLY);
        assert!(read_some(&mut second).await.is_empty());
        assert_eq!(handle.stats().connections_rejected.load(Ordering::Relaxed), 1);

        // The first client is unaffected
        first.write_all(b"PING\n").await.unwrap();
        assert_eq!(read_some(&mut first).await, b"+PONG\r\n");

        // Once it leaves, its slot frees up
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut third = TcpStream::connect(addr).await.unwrap();
        third.write_all(b"PING\n").await.unwrap();
        assert_eq!(read_some(&mut third).await, b"+PONG\r\n");

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_idle_connections() {
        let handle = Server::bind(test_config()).await.unwrap().start();
        let addr = handle.local_addr();
        let stats = handle.stats();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"PING\n").await.unwrap();
            assert_eq!(read_some(&mut client).await, b"+PONG\r\n");
            clients.push(client);
        }
        assert_eq!(stats.active(), 3);

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .unwrap()
            .unwrap();

        for client in &mut clients {
            assert!(read_some(client).await.is_empty());
        }
        assert_eq!(stats.active(), 0);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_wait_is_cancel_safe() {
        let mut handle = Server::bind(test_config()).await.unwrap().start();

        let waited = tokio::time::timeout(Duration::from_millis(50), handle.wait()).await;
        assert!(waited.is_err());

        handle.signal_shutdown();
        handle.wait().await.unwrap();
        // Already stopped
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_quit_releases_connection() {
        let handle = Server::bind(test_config()).await.unwrap().start();
        let addr = handle.local_addr();

        for _ in 0..5 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"QUIT\n").await.unwrap();
            assert_eq!(read_some(&mut client).await, b"+OK\r\n");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = handle.stats();
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 5);
        assert_eq!(stats.active(), 0);
        handle.shutdown().await.unwrap();
    }
}
