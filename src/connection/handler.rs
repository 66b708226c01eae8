//! Connection Handler
//!
//! Each client connection is served by its own task running a
//! [`ConnectionHandler`].
//!
//! ## Connection Lifecycle
//!
//! ```text
//!   Open ──> Reading ──> Dispatching ──> Writing ──┐
//!               ▲                                  │
//!               └──────────────────────────────────┘
//!
//!   any state ──> Closed   (EOF, I/O error, QUIT, shutdown signal)
//! ```
//!
//! Bytes are accumulated in a `BytesMut` buffer because TCP is a stream: a
//! read may deliver half a request or several at once. After every read the
//! buffer is decoded, each complete command is executed and its reply
//! written in arrival order, and the replies are flushed together.
//!
//! The shutdown signal is only observed while waiting for a read, so
//! commands that have already arrived are answered before the connection
//! closes. Whatever the exit path, the stream is shut down and dropped.

use crate::commands::CommandExecutor;
use crate::protocol::{decode, Command, ProtocolError};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Maximum size of buffered, not yet complete request data (1 MiB)
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Server-wide connection counters.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted and served
    pub connections_accepted: AtomicU64,
    /// Connections turned away because the server was full
    pub connections_rejected: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Reading,
    Dispatching,
    Writing,
    Closed,
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// End of stream in the middle of a request
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Buffer size limit exceeded
    #[error("Buffer size limit exceeded")]
    BufferFull,
}

/// Serves one client connection.
pub struct ConnectionHandler<S> {
    id: u64,

    stream: BufWriter<S>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Received bytes not yet decoded
    buffer: BytesMut,

    executor: CommandExecutor,

    stats: Arc<ConnectionStats>,

    /// Becomes `true` when the server is shutting down
    shutdown: watch::Receiver<bool>,

    state: ConnectionState,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a handler for an accepted stream.
    pub fn new(
        stream: S,
        id: u64,
        addr: SocketAddr,
        executor: CommandExecutor,
        stats: Arc<ConnectionStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        stats.connection_opened();

        Self {
            id,
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            executor,
            stats,
            shutdown,
            state: ConnectionState::Open,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Serves the connection until it closes.
    ///
    /// Returns `Ok(())` on QUIT or server shutdown, and the reason otherwise.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(conn_id = self.id, client = %self.addr, "Client connected");

        let result = self.main_loop().await;
        self.transition(ConnectionState::Closed);

        // Shut down the socket itself, skipping any buffered bytes: after a
        // write error nothing more may be written.
        if let Err(e) = self.stream.get_mut().shutdown().await {
            trace!(conn_id = self.id, error = %e, "Stream shutdown failed");
        }

        match &result {
            Ok(()) => info!(conn_id = self.id, client = %self.addr, "Connection closed"),
            Err(ConnectionError::ClientDisconnected) => {
                info!(conn_id = self.id, client = %self.addr, "Client disconnected")
            }
            Err(ConnectionError::IoError(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(conn_id = self.id, client = %self.addr, "Connection reset by client")
            }
            Err(e) => warn!(conn_id = self.id, client = %self.addr, error = %e, "Connection error"),
        }

        result
    }

    /// The read-dispatch-write loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            if !self.dispatch_buffered().await? {
                return Ok(());
            }

            self.transition(ConnectionState::Reading);
            if !self.read_more_data().await? {
                return Ok(());
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            trace!(conn_id = self.id, from = ?self.state, to = ?next, "State change");
            self.state = next;
        }
    }

    /// Executes every complete command in the buffer, writing the replies in
    /// order, then flushes them.
    ///
    /// Returns `false` once QUIT or a framing error has been answered;
    /// nothing after it is read.
    async fn dispatch_buffered(&mut self) -> Result<bool, ConnectionError> {
        let (commands, consumed) = decode(&self.buffer);
        self.buffer.advance(consumed);

        if commands.is_empty() {
            return Ok(true);
        }

        trace!(
            conn_id = self.id,
            commands = commands.len(),
            consumed = consumed,
            remaining = self.buffer.len(),
            "Decoded commands"
        );

        let mut out = Vec::with_capacity(64);
        let mut written = 0;
        let mut keep_open = true;

        for command in commands {
            self.transition(ConnectionState::Dispatching);
            let ends_connection = command.ends_connection();
            if let Command::Unknown {
                reason: ProtocolError::Framing(why),
                ..
            } = &command
            {
                warn!(
                    conn_id = self.id,
                    client = %self.addr,
                    reason = *why,
                    "Protocol error, closing connection"
                );
            }
            trace!(conn_id = self.id, command = command.name(), "Executing command");

            let reply = self.executor.execute(command);
            self.stats.command_processed();

            self.transition(ConnectionState::Writing);
            out.clear();
            reply.serialize_into(&mut out);
            self.stream.write_all(&out).await?;
            written += out.len();

            if ends_connection {
                keep_open = false;
                break;
            }
        }

        self.stream.flush().await?;
        self.stats.bytes_written(written);
        trace!(conn_id = self.id, bytes = written, "Sent replies");

        Ok(keep_open)
    }

    /// Waits for more bytes from the client.
    ///
    /// Returns `false` if the shutdown signal arrived first.
    async fn read_more_data(&mut self) -> Result<bool, ConnectionError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            error!(
                conn_id = self.id,
                client = %self.addr,
                size = self.buffer.len(),
                "Buffer size limit exceeded"
            );
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }

        let n = tokio::select! {
            biased;

            _ = shutdown_signalled(&mut self.shutdown) => {
                debug!(conn_id = self.id, "Shutdown signal received, closing connection");
                return Ok(false);
            }
            n = self.stream.get_mut().read_buf(&mut self.buffer) => n?,
        };

        if n == 0 {
            if self.buffer.is_empty() {
                return Err(ConnectionError::ClientDisconnected);
            } else {
                return Err(ConnectionError::UnexpectedEof);
            }
        }

        self.stats.bytes_read(n);
        trace!(conn_id = self.id, bytes = n, "Read data");

        Ok(true)
    }
}

// Runs whether `run` returned or its task was aborted.
impl<S> Drop for ConnectionHandler<S> {
    fn drop(&mut self) {
        self.stats.connection_closed();
    }
}

/// Resolves once the watched flag becomes `true`. A dropped sender counts
/// as `true`.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Serves one connection to completion.
///
/// Errors are logged by the handler; a client hanging up is not an error
/// worth reporting further.
pub async fn handle_connection<S>(
    stream: S,
    id: u64,
    addr: SocketAddr,
    executor: CommandExecutor,
    stats: Arc<ConnectionStats>,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handler = ConnectionHandler::new(stream, id, addr, executor, stats, shutdown);
    let _ = handler.run().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use bytes::Bytes;
    use std::io;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn handler_for<S>(
        stream: S,
        stats: Arc<ConnectionStats>,
        shutdown: watch::Receiver<bool>,
    ) -> ConnectionHandler<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let executor = CommandExecutor::new(Arc::new(Store::new()));
        ConnectionHandler::new(stream, 1, test_addr(), executor, stats, shutdown)
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (_tx, rx) = watch::channel(false);
        let stream = Builder::new().read(b"PING\r\n").write(b"+PONG\r\n").build();

        let result = handler_for(stream, Arc::new(ConnectionStats::new()), rx)
            .run()
            .await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
    }

    #[tokio::test]
    async fn test_batch_replies_in_order() {
        let (_tx, rx) = watch::channel(false);
        let stream = Builder::new()
            .read(b"SET foo bar\nGET foo\nGET missing\n")
            .write(b"+OK\r\n$3\r\nbar\r\n$-1\r\n")
            .build();

        let result = handler_for(stream, Arc::new(ConnectionStats::new()), rx)
            .run()
            .await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
    }

    #[tokio::test]
    async fn test_command_split_across_reads() {
        let (_tx, rx) = watch::channel(false);
        let stream = Builder::new()
            .read(b"SET k")
            .read(b"ey val")
            .read(b"ue\r\nGET key\r")
            .write(b"+OK\r\n")
            .read(b"\n")
            .write(b"$5\r\nvalue\r\n")
            .build();

        let result = handler_for(stream, Arc::new(ConnectionStats::new()), rx)
            .run()
            .await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_connection_open() {
        let (_tx, rx) = watch::channel(false);
        let stream = Builder::new()
            .read(b"BOGUS 1 2\n")
            .write(b"-ERR unknown command 'BOGUS'\r\n")
            .read(b"PING\n")
            .write(b"+PONG\r\n")
            .build();

        let result = handler_for(stream, Arc::new(ConnectionStats::new()), rx)
            .run()
            .await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
    }

    #[tokio::test]
    async fn test_quit_closes_after_reply() {
        let (_tx, rx) = watch::channel(false);
        // PING after QUIT in the same batch is never answered
        let stream = Builder::new()
            .read(b"QUIT\nPING\n")
            .write(b"+OK\r\n")
            .build();

        let result = handler_for(stream, Arc::new(ConnectionStats::new()), rx)
            .run()
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_framing_error_closes_after_reply() {
        let (_tx, rx) = watch::channel(false);
        let store = Arc::new(Store::new());
        let executor = CommandExecutor::new(Arc::clone(&store));
        // The unterminated value must never run as `DEL victim`
        let stream = Builder::new()
            .read(b"SET victim v\n*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$5\r\nDEL victim\n")
            .write(b"+OK\r\n-ERR protocol error: bulk string missing trailing CRLF\r\n")
            .build();

        let handler = ConnectionHandler::new(
            stream,
            1,
            test_addr(),
            executor,
            Arc::new(ConnectionStats::new()),
            rx,
        );
        assert!(handler.run().await.is_ok());
        assert_eq!(store.exists(&[Bytes::from("victim")]).unwrap(), 1);
        assert_eq!(store.exists(&[Bytes::from("k")]).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_partial_request_at_eof() {
        let (_tx, rx) = watch::channel(false);
        let stream = Builder::new().read(b"GET fo").build();

        let result = handler_for(stream, Arc::new(ConnectionStats::new()), rx)
            .run()
            .await;
        assert!(matches!(result, Err(ConnectionError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_read_error_closes_connection() {
        let (_tx, rx) = watch::channel(false);
        let stats = Arc::new(ConnectionStats::new());
        let stream = Builder::new()
            .read(b"PING\n")
            .write(b"+PONG\r\n")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let result = handler_for(stream, Arc::clone(&stats), rx).run().await;
        assert!(matches!(result, Err(ConnectionError::IoError(_))));
        assert_eq!(stats.active(), 0);
    }

    #[tokio::test]
    async fn test_write_error_closes_connection() {
        let (_tx, rx) = watch::channel(false);
        let stream = Builder::new()
            .read(b"PING\n")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();

        let result = handler_for(stream, Arc::new(ConnectionStats::new()), rx)
            .run()
            .await;
        assert!(matches!(result, Err(ConnectionError::IoError(_))));
    }

    #[tokio::test]
    async fn test_shutdown_signal_closes_idle_connection() {
        let (tx, rx) = watch::channel(false);
        let (mut client, server) = duplex(1024);
        let stats = Arc::new(ConnectionStats::new());

        let task = tokio::spawn(handler_for(server, Arc::clone(&stats), rx).run());

        client.write_all(b"PING\n").await.unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"+PONG\r\n");

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());

        // The server side is gone: the client reads EOF
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(stats.active(), 0);
    }

    #[tokio::test]
    async fn test_buffer_limit() {
        let (_tx, rx) = watch::channel(false);
        let (mut client, server) = duplex(64 * 1024);

        let task = tokio::spawn(handler_for(server, Arc::new(ConnectionStats::new()), rx).run());

        // One enormous line without a terminator
        let chunk = vec![b'a'; 64 * 1024];
        let writer = tokio::spawn(async move {
            for _ in 0..(MAX_BUFFER_SIZE / chunk.len() + 1) {
                if client.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            client
        });

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ConnectionError::BufferFull)));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let (_tx, rx) = watch::channel(false);
        let stats = Arc::new(ConnectionStats::new());
        let stream = Builder::new()
            .read(b"PING\nPING\n")
            .write(b"+PONG\r\n+PONG\r\n")
            .build();

        let handler = handler_for(stream, Arc::clone(&stats), rx);
        assert_eq!(handler.state(), ConnectionState::Open);
        assert_eq!(stats.active(), 1);

        let _ = handler.run().await;

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active(), 0);
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 2);
        assert_eq!(stats.bytes_read.load(Ordering::Relaxed), 10);
        assert_eq!(stats.bytes_written.load(Ordering::Relaxed), 14);
    }
}
