//! Command Execution
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ Request Decoder │  (protocol module)
//! └────────┬────────┘
//!          │ Command
//!          ▼
//! ┌─────────────────┐
//! │ CommandExecutor │  (this module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │      Store      │  (storage module)
//! └─────────────────┘
//! ```

pub mod executor;

pub use executor::CommandExecutor;
