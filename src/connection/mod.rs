//! Client Connections
//!
//! Each accepted connection is served by its own Tokio task running a
//! [`ConnectionHandler`], so a slow client never stalls the others.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    ConnectionHandler                     │
//! │                                                          │
//! │  ┌───────────┐    ┌───────────┐    ┌───────────────┐     │
//! │  │ Read      │───>│ Decode    │───>│ Execute cmd   │     │
//! │  │ bytes     │    │ commands  │    └───────┬───────┘     │
//! │  └───────────┘    └───────────┘            │             │
//! │        ▲                                   ▼             │
//! │        │                           ┌───────────────┐     │
//! │        └───────────────────────────│ Write replies │     │
//! │                                    └───────────────┘     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The handler is generic over the stream, so anything that implements
//! `AsyncRead + AsyncWrite` can be served: a `TcpStream` in the server, an
//! in-memory duplex pipe or mock in tests.

pub mod handler;

pub use handler::{
    handle_connection, ConnectionError, ConnectionHandler, ConnectionState, ConnectionStats,
    MAX_BUFFER_SIZE,
};
