//! Storage Module
//!
//! The in-memory key-value [`Store`] shared by every connection, and the
//! background [`ExpirySweeper`] that reclaims expired entries.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Store                              │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │...64    │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ shards  │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │
//!              ┌─────────────┴─────────────┐
//!              │      ExpirySweeper        │
//!              │  (Background Tokio Task)  │
//!              └───────────────────────────┘
//! ```
//!
//! Contents are volatile: nothing is written to disk.

pub mod engine;
pub mod expiry;

pub use engine::{validate_key, Entry, Store, StoreError, StoreResult, StoreStats, MAX_KEY_LEN};
pub use expiry::{ExpiryConfig, ExpirySweeper};
