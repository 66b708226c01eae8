//! Wire Protocol
//!
//! Requests are lines of whitespace-separated fields (`SET foo bar\n`), or
//! RESP multi-bulk arrays for clients that speak it. Replies are RESP-style
//! frames whose first byte tells the kinds apart.
//!
//! ## Modules
//!
//! - `command`: the [`Command`] enum and argument validation
//! - `types`: the [`Reply`] enum and its encoding
//! - `parser`: request framing ([`decode`]) and reply parsing ([`parse_reply`])
//!
//! ## Example
//!
//! ```
//! use linekv::protocol::{decode, parse_reply, Command, Reply};
//! use bytes::Bytes;
//!
//! let (commands, consumed) = decode(b"GET name\r\nSET na");
//! assert_eq!(commands, vec![Command::Get { key: Bytes::from("name") }]);
//! assert_eq!(consumed, 10);
//!
//! let wire = Reply::bulk(Bytes::from("linekv")).serialize();
//! let (reply, _) = parse_reply(&wire).unwrap().unwrap();
//! assert_eq!(reply, Reply::Bulk(Bytes::from("linekv")));
//! ```

pub mod command;
pub mod parser;
pub mod types;

pub use command::{Command, ProtocolError};
pub use parser::{decode, decode_one, parse_reply, ParseError, ParseResult};
pub use types::Reply;
