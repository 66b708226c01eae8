//! # linekv - A Line-Oriented In-Memory Key-Value Server
//!
//! linekv serves a shared in-memory key-value store over TCP. Clients send
//! one command per line (`SET name linekv`) and get back self-delimiting
//! replies; many clients are served concurrently, each on its own task.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                               linekv                              │
//! │                                                                   │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────────┐        │
//! │  │   Server    │───>│ Connection  │───>│ CommandExecutor │        │
//! │  │ (Listener)  │    │  Handler    │    └────────┬────────┘        │
//! │  └─────────────┘    └──────┬──────┘             │                 │
//! │                            │                    ▼                 │
//! │                     ┌──────┴──────┐   ┌───────────────────────┐   │
//! │                     │  Protocol   │   │         Store         │   │
//! │                     │   Codec     │   │ ┌──────┐ ┌──────┐     │   │
//! │                     └─────────────┘   │ │Shard │ │Shard │ ... │   │
//! │                                       │ └──────┘ └──────┘     │   │
//! │                                       └───────────▲───────────┘   │
//! │                                                   │               │
//! │                                       ┌───────────┴───────────┐   │
//! │                                       │     ExpirySweeper     │   │
//! │                                       └───────────────────────┘   │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use linekv::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), linekv::ServerError> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     let handle = server.start();
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     handle.shutdown().await
//! }
//! ```
//!
//! ## Supported Commands
//!
//! - `GET key`
//! - `SET key value [EX seconds | PX milliseconds]`
//! - `DEL key [key ...]`
//! - `EXISTS key [key ...]`
//! - `PING [message]`
//! - `ECHO message`
//! - `QUIT`
//!
//! ## Module Overview
//!
//! - [`storage`]: sharded store with TTL support and the expiry sweeper
//! - [`protocol`]: request decoding and reply encoding
//! - [`commands`]: maps commands onto the store
//! - [`connection`]: per-client connection handling
//! - [`server`]: listener, connection limit and graceful shutdown
//! - [`config`]: server settings
//!
//! ## Lazy + Active Expiry
//!
//! Keys with a TTL are expired in two ways:
//! 1. **Lazy**: a read that finds an expired entry treats it as absent and
//!    removes it
//! 2. **Active**: a background task periodically purges expired entries
//!
//! This ensures memory is reclaimed even for keys that are never read again.

pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod storage;

pub use commands::CommandExecutor;
pub use config::ServerConfig;
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{decode, parse_reply, Command, Reply};
pub use server::{Server, ServerError, ServerHandle};
pub use storage::{ExpiryConfig, ExpirySweeper, Store, StoreError};

/// The default port linekv listens on
pub const DEFAULT_PORT: u16 = 8080;

/// The default host linekv binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of linekv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
