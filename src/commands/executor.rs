//! Command Executor
//!
//! Maps a decoded [`Command`] onto the [`Store`] and produces the [`Reply`].
//! No I/O happens here. The executor holds nothing but a handle to the
//! store, so one clone per connection can run concurrently with all others.

use crate::protocol::{Command, Reply};
use crate::storage::{Store, StoreError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Executes commands against a shared store.
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    store: Arc<Store>,
}

impl CommandExecutor {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Executes a command and returns the reply to send back.
    pub fn execute(&self, command: Command) -> Reply {
        match command {
            Command::Get { key } => self.cmd_get(&key),
            Command::Set { key, value, ttl } => self.cmd_set(key, value, ttl),
            Command::Del { keys } => self.cmd_del(&keys),
            Command::Exists { keys } => self.cmd_exists(&keys),
            Command::Ping { message: None } => Reply::pong(),
            Command::Ping {
                message: Some(message),
            } => Reply::bulk(message),
            Command::Echo { message } => Reply::bulk(message),
            Command::Quit => Reply::ok(),
            Command::Unknown { reason, .. } => Reply::error(format!("ERR {}", reason)),
        }
    }

    /// GET key
    fn cmd_get(&self, key: &Bytes) -> Reply {
        match self.store.get(key) {
            Ok(Some(value)) => Reply::bulk(value),
            Ok(None) => Reply::nil(),
            Err(e) => store_error(e),
        }
    }

    /// SET key value [EX seconds | PX milliseconds]
    fn cmd_set(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) -> Reply {
        match self.store.set(key, value, ttl) {
            Ok(()) => Reply::ok(),
            Err(e) => store_error(e),
        }
    }

    /// DEL key [key ...]
    fn cmd_del(&self, keys: &[Bytes]) -> Reply {
        match self.store.delete(keys) {
            Ok(count) => Reply::integer(count as i64),
            Err(e) => store_error(e),
        }
    }

    /// EXISTS key [key ...]
    fn cmd_exists(&self, keys: &[Bytes]) -> Reply {
        match self.store.exists(keys) {
            Ok(count) => Reply::integer(count as i64),
            Err(e) => store_error(e),
        }
    }
}

fn store_error(e: StoreError) -> Reply {
    Reply::error(format!("ERR {}", e))
}
