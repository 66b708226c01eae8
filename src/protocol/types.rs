//! Reply Types and Wire Encoding
//!
//! Every reply is one self-delimiting frame whose first byte names its kind:
//!
//! - `+` Simple string: `+OK\r\n`
//! - `-` Error: `-ERR unknown command 'FOO'\r\n`
//! - `:` Integer: `:2\r\n`
//! - `$` Bulk value: `$5\r\nhello\r\n`
//! - `$-1` Nil (key not found): `$-1\r\n`
//!
//! Bulk values carry an explicit length and are binary-safe. Simple strings
//! and errors are single lines; any CR or LF inside them is replaced with a
//! space when encoded.

use bytes::Bytes;

/// The CRLF terminator ending every reply line
pub const CRLF: &[u8] = b"\r\n";

/// Reply type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
}

/// The outcome of executing one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Status line, e.g. `OK` or `PONG`.
    Simple(String),

    /// Failure message; the connection stays usable.
    Error(String),

    /// A count.
    Integer(i64),

    /// A stored or echoed value.
    Bulk(Bytes),

    /// No value (missing or expired key).
    Nil,
}

impl Reply {
    pub fn simple(s: impl Into<String>) -> Self {
        Reply::Simple(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Reply::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        Reply::Integer(n)
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(data.into())
    }

    pub fn nil() -> Self {
        Reply::Nil
    }

    /// `+OK`
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    /// `+PONG`
    pub fn pong() -> Self {
        Reply::Simple("PONG".to_string())
    }

    /// Encodes the reply into a fresh buffer.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Appends the encoded reply to `buf`.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Simple(s) => put_line(buf, prefix::SIMPLE_STRING, s.as_bytes()),
            Reply::Error(s) => put_line(buf, prefix::ERROR, s.as_bytes()),
            Reply::Integer(n) => put_line(buf, prefix::INTEGER, n.to_string().as_bytes()),
            Reply::Bulk(data) => {
                put_line(buf, prefix::BULK_STRING, data.len().to_string().as_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            Reply::Nil => put_line(buf, prefix::BULK_STRING, b"-1"),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

fn put_line(buf: &mut Vec<u8>, prefix: u8, content: &[u8]) {
    buf.push(prefix);
    buf.extend(content.iter().map(|&b| match b {
        b'\r' | b'\n' => b' ',
        b => b,
    }));
    buf.extend_from_slice(CRLF);
}
