//! Request Commands
//!
//! A request is a list of byte-string arguments, the first naming the
//! command (case-insensitive). [`Command::from_args`] validates arity and
//! options; anything it cannot accept becomes [`Command::Unknown`] carrying
//! the raw request and the reason, so the executor can answer with an error
//! while the connection keeps going.
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

use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Why a request could not be turned into a command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),

    #[error("syntax error")]
    Syntax,

    #[error("invalid expire time in '{0}' command")]
    InvalidExpireTime(&'static str),

    #[error("unbalanced quotes in request")]
    UnbalancedQuotes,

    /// A malformed multi-bulk frame. The rest of the stream cannot be
    /// trusted, so the connection is closed after the error reply.
    #[error("protocol error: {0}")]
    Framing(&'static str),
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get {
        key: Bytes,
    },
    Set {
        key: Bytes,
        value: Bytes,
        ttl: Option<Duration>,
    },
    Del {
        keys: Vec<Bytes>,
    },
    Exists {
        keys: Vec<Bytes>,
    },
    Ping {
        message: Option<Bytes>,
    },
    Echo {
        message: Bytes,
    },
    Quit,
    /// A request that could not be decoded into any of the above.
    Unknown {
        raw: Bytes,
        reason: ProtocolError,
    },
}

impl Command {
    /// Builds a command from its arguments, falling back to
    /// [`Command::Unknown`] with `raw` preserved.
    pub fn from_args(args: Vec<Bytes>, raw: Bytes) -> Command {
        match Self::parse_args(args) {
            Ok(command) => command,
            Err(reason) => Command::Unknown { raw, reason },
        }
    }

    /// True for commands after which nothing more is read from the
    /// connection: QUIT, and framing errors.
    pub fn ends_connection(&self) -> bool {
        matches!(
            self,
            Command::Quit
                | Command::Unknown {
                    reason: ProtocolError::Framing(_),
                    ..
                }
        )
    }

    /// Command name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Del { .. } => "DEL",
            Command::Exists { .. } => "EXISTS",
            Command::Ping { .. } => "PING",
            Command::Echo { .. } => "ECHO",
            Command::Quit => "QUIT",
            Command::Unknown { .. } => "UNKNOWN",
        }
    }

    fn parse_args(args: Vec<Bytes>) -> Result<Command, ProtocolError> {
        let mut args = args.into_iter();
        let name = args.next().ok_or(ProtocolError::Syntax)?;
        let rest: Vec<Bytes> = args.collect();

        let typed = String::from_utf8_lossy(&name);
        match typed.to_ascii_uppercase().as_str() {
            "GET" => match <[Bytes; 1]>::try_from(rest) {
                Ok([key]) => Ok(Command::Get { key }),
                Err(_) => Err(ProtocolError::WrongArity("get")),
            },
            "SET" => parse_set(rest),
            "DEL" if !rest.is_empty() => Ok(Command::Del { keys: rest }),
            "DEL" => Err(ProtocolError::WrongArity("del")),
            "EXISTS" if !rest.is_empty() => Ok(Command::Exists { keys: rest }),
            "EXISTS" => Err(ProtocolError::WrongArity("exists")),
            "PING" => match rest.len() {
                0 | 1 => Ok(Command::Ping {
                    message: rest.into_iter().next(),
                }),
                _ => Err(ProtocolError::WrongArity("ping")),
            },
            "ECHO" => match <[Bytes; 1]>::try_from(rest) {
                Ok([message]) => Ok(Command::Echo { message }),
                Err(_) => Err(ProtocolError::WrongArity("echo")),
            },
            "QUIT" if rest.is_empty() => Ok(Command::Quit),
            "QUIT" => Err(ProtocolError::WrongArity("quit")),
            _ => Err(ProtocolError::UnknownCommand(typed.into_owned())),
        }
    }
}

/// SET key value [EX seconds | PX milliseconds]
fn parse_set(args: Vec<Bytes>) -> Result<Command, ProtocolError> {
    let mut args = args.into_iter();
    let (Some(key), Some(value)) = (args.next(), args.next()) else {
        return Err(ProtocolError::WrongArity("set"));
    };

    let options: Vec<Bytes> = args.collect();
    let ttl = match options.as_slice() {
        [] => None,
        [unit, amount] => {
            let amount = parse_positive(amount).ok_or(ProtocolError::InvalidExpireTime("set"))?;
            if unit.eq_ignore_ascii_case(b"EX") {
                Some(Duration::from_secs(amount))
            } else if unit.eq_ignore_ascii_case(b"PX") {
                Some(Duration::from_millis(amount))
            } else {
                return Err(ProtocolError::Syntax);
            }
        }
        _ => return Err(ProtocolError::Syntax),
    };

    Ok(Command::Set { key, value, ttl })
}

fn parse_positive(arg: &[u8]) -> Option<u64> {
    std::str::from_utf8(arg)
        .ok()?
        .parse::<u64>()
        .ok()
        .filter(|n| *n > 0)
}
