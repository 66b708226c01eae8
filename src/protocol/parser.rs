//! Request Decoder and Reply Parser
//!
//! ## Requests
//!
//! [`decode`] turns the bytes buffered for a connection into commands. It is
//! a pure function of its input: it returns every complete request found
//! plus the number of bytes those requests occupied, and it never consumes
//! an incomplete trailing request. The caller appends network reads to a
//! buffer, calls `decode`, executes the commands, and advances the buffer
//! by the consumed count.
//!
//! Two request encodings are accepted:
//!
//! 1. **Inline**: one command per line, ending in LF or CRLF, fields split
//!    on whitespace. Fields may be quoted: `"..."` understands `\n`, `\r`,
//!    `\t`, `\b`, `\a`, `\"`, `\\` and `\xHH`; `'...'` is literal except
//!    for `\'`. Blank lines are skipped.
//! 2. **Multi-bulk**: `*<n>\r\n` followed by `n` bulk strings
//!    (`$<len>\r\n<bytes>\r\n`), the form sent by Redis client libraries.
//!
//! A malformed inline request is consumed and reported as
//! [`Command::Unknown`], and the connection stays usable. A malformed
//! multi-bulk frame is different: once a length or terminator is wrong the
//! frame boundaries are lost, so the bytes that follow could be read as
//! commands the client never sent. Such a frame yields an `Unknown` with a
//! [`ProtocolError::Framing`] reason and decoding stops there; the
//! connection answers the error and closes.
//!
//! ## Replies
//!
//! [`parse_reply`] is the client-side counterpart of
//! [`Reply::serialize`](crate::protocol::Reply::serialize): it reads one
//! reply frame and reports `Ok(None)` while the frame is incomplete.

use crate::protocol::command::{Command, ProtocolError};
use crate::protocol::types::{prefix, Reply, CRLF};
use bytes::Bytes;
use std::num::ParseIntError;
use thiserror::Error;

/// Largest bulk string accepted inside a multi-bulk request (512 KiB).
pub const MAX_BULK_LEN: usize = 512 * 1024;

/// Largest argument count accepted in a multi-bulk request.
pub const MAX_MULTIBULK_LEN: i64 = 1024 * 1024;

/// Decodes every complete request in `buf`.
///
/// Returns the commands in arrival order and the number of bytes consumed.
/// Bytes past the consumed count belong to a request that is not complete
/// yet. Decoding stops after a command that ends the connection.
pub fn decode(buf: &[u8]) -> (Vec<Command>, usize) {
    let mut commands = Vec::new();
    let mut consumed = 0;

    while let Some((command, used)) = decode_one(&buf[consumed..]) {
        consumed += used;
        if let Some(command) = command {
            let last = command.ends_connection();
            commands.push(command);
            if last {
                break;
            }
        }
    }

    (commands, consumed)
}

/// Decodes the first request in `buf`.
///
/// - `None`: the request is incomplete, nothing may be consumed
/// - `Some((None, n))`: `n` bytes held no request (blank line, empty array)
/// - `Some((Some(cmd), n))`: one command occupying `n` bytes
///
/// After a [`ProtocolError::Framing`] command the input is out of sync and
/// nothing past it should be decoded.
pub fn decode_one(buf: &[u8]) -> Option<(Option<Command>, usize)> {
    match buf.first()? {
        b'*' => decode_multibulk(buf),
        _ => decode_inline(buf),
    }
}

/// Finds the end of the first line.
///
/// Returns `(content_len, consumed)`, where `consumed` includes the LF and
/// `content_len` excludes an optional CR before it.
#[inline]
fn find_line(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.iter().position(|&b| b == b'\n')?;
    let end = if lf > 0 && buf[lf - 1] == b'\r' {
        lf - 1
    } else {
        lf
    };
    Some((end, lf + 1))
}

fn decode_inline(buf: &[u8]) -> Option<(Option<Command>, usize)> {
    let (end, used) = find_line(buf)?;
    let line = &buf[..end];
    let raw = Bytes::copy_from_slice(line);

    let command = match split_fields(line) {
        Ok(fields) if fields.is_empty() => None,
        Ok(fields) => Some(Command::from_args(fields, raw)),
        Err(reason) => Some(Command::Unknown { raw, reason }),
    };

    Some((command, used))
}

fn decode_multibulk(buf: &[u8]) -> Option<(Option<Command>, usize)> {
    let (end, mut pos) = find_line(buf)?;

    let count = match parse_length(&buf[1..end]) {
        Some(n) if n <= MAX_MULTIBULK_LEN => n,
        _ => return Some((Some(framing_error(&buf[..end], "invalid multibulk length")), pos)),
    };

    // `*0` and `*-1` carry no command
    if count <= 0 {
        return Some((None, pos));
    }

    let mut args = Vec::with_capacity((count as usize).min(64));

    for _ in 0..count {
        let rest = &buf[pos..];
        let (end, used) = find_line(rest)?;
        let header = &rest[..end];

        if header.first() != Some(&prefix::BULK_STRING) {
            return Some((Some(framing_error(header, "expected '$'")), pos + used));
        }

        let len = match parse_length(&header[1..]) {
            Some(n) if n >= 0 && (n as usize) <= MAX_BULK_LEN => n as usize,
            _ => return Some((Some(framing_error(header, "invalid bulk length")), pos + used)),
        };

        let data_start = pos + used;
        let data_end = data_start + len;
        if buf.len() < data_end + CRLF.len() {
            return None;
        }

        if &buf[data_end..data_end + CRLF.len()] != CRLF {
            return Some((
                Some(framing_error(header, "bulk string missing trailing CRLF")),
                data_start,
            ));
        }

        args.push(Bytes::copy_from_slice(&buf[data_start..data_end]));
        pos = data_end + CRLF.len();
    }

    let raw = Bytes::from(args.join(&b' '));
    Some((Some(Command::from_args(args, raw)), pos))
}

fn framing_error(line: &[u8], reason: &'static str) -> Command {
    Command::Unknown {
        raw: Bytes::copy_from_slice(line),
        reason: ProtocolError::Framing(reason),
    }
}

fn parse_length(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Splits an inline request line into fields, honouring quotes.
pub fn split_fields(line: &[u8]) -> Result<Vec<Bytes>, ProtocolError> {
    let mut fields = Vec::new();
    let mut i = 0;

    loop {
        while i < line.len() && line[i].is_ascii_whitespace() {
            i += 1;
        }
        if i == line.len() {
            return Ok(fields);
        }

        let mut field = Vec::new();
        match line[i] {
            b'"' => {
                i += 1;
                loop {
                    match line.get(i) {
                        None => return Err(ProtocolError::UnbalancedQuotes),
                        Some(b'\\') if i + 1 < line.len() => {
                            if let Some(byte) = hex_escape(&line[i + 1..]) {
                                field.push(byte);
                                i += 4;
                                continue;
                            }
                            field.push(match line[i + 1] {
                                b'n' => b'\n',
                                b'r' => b'\r',
                                b't' => b'\t',
                                b'b' => 0x08,
                                b'a' => 0x07,
                                other => other,
                            });
                            i += 2;
                        }
                        Some(b'"') => {
                            i += 1;
                            break;
                        }
                        Some(&b) => {
                            field.push(b);
                            i += 1;
                        }
                    }
                }
                closing_quote_ends_field(line, i)?;
            }
            b'\'' => {
                i += 1;
                loop {
                    match line.get(i) {
                        None => return Err(ProtocolError::UnbalancedQuotes),
                        Some(b'\\') if line.get(i + 1) == Some(&b'\'') => {
                            field.push(b'\'');
                            i += 2;
                        }
                        Some(b'\'') => {
                            i += 1;
                            break;
                        }
                        Some(&b) => {
                            field.push(b);
                            i += 1;
                        }
                    }
                }
                closing_quote_ends_field(line, i)?;
            }
            _ => {
                while i < line.len() && !line[i].is_ascii_whitespace() {
                    field.push(line[i]);
                    i += 1;
                }
            }
        }

        fields.push(Bytes::from(field));
    }
}

/// A closing quote must be followed by whitespace or the end of the line.
fn closing_quote_ends_field(line: &[u8], i: usize) -> Result<(), ProtocolError> {
    match line.get(i) {
        Some(b) if !b.is_ascii_whitespace() => Err(ProtocolError::UnbalancedQuotes),
        _ => Ok(()),
    }
}

/// Decodes `xHH` (the bytes after a backslash).
fn hex_escape(rest: &[u8]) -> Option<u8> {
    match rest {
        [b'x', hi, lo, ..] => {
            let hi = (*hi as char).to_digit(16)?;
            let lo = (*lo as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        }
        _ => None,
    }
}

/// Errors raised while parsing a reply frame.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk length is negative but not -1
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Protocol violation (missing CRLF, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

/// Result type for reply parsing.
pub type ParseResult<T> = Result<T, ParseError>;

/// Parses one reply frame from `buf`.
///
/// - `Ok(Some((reply, consumed)))`: a complete reply
/// - `Ok(None)`: incomplete data, read more
/// - `Err(e)`: the bytes are not a valid reply
pub fn parse_reply(buf: &[u8]) -> ParseResult<Option<(Reply, usize)>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    match first {
        prefix::SIMPLE_STRING => {
            Ok(parse_text_line(buf)?.map(|(s, used)| (Reply::Simple(s), used)))
        }
        prefix::ERROR => Ok(parse_text_line(buf)?.map(|(s, used)| (Reply::Error(s), used))),
        prefix::INTEGER => parse_integer(buf),
        prefix::BULK_STRING => parse_bulk(buf),
        other => Err(ParseError::UnknownPrefix(other)),
    }
}

/// Parses `<prefix><text>\r\n`.
fn parse_text_line(buf: &[u8]) -> ParseResult<Option<(String, usize)>> {
    match find_crlf(&buf[1..]) {
        Some(pos) => {
            let s = std::str::from_utf8(&buf[1..1 + pos])
                .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
            // +1 for prefix, +2 for CRLF
            Ok(Some((s.to_string(), 1 + pos + 2)))
        }
        None => Ok(None),
    }
}

/// Parses an integer: `:<integer>\r\n`
fn parse_integer(buf: &[u8]) -> ParseResult<Option<(Reply, usize)>> {
    match parse_text_line(buf)? {
        Some((s, used)) => {
            let n: i64 = s
                .parse()
                .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))?;
            Ok(Some((Reply::Integer(n), used)))
        }
        None => Ok(None),
    }
}

/// Parses a bulk value: `$<length>\r\n<data>\r\n`, or nil: `$-1\r\n`
fn parse_bulk(buf: &[u8]) -> ParseResult<Option<(Reply, usize)>> {
    let Some((length_str, header_len)) = parse_text_line(buf)? else {
        return Ok(None);
    };

    let length: i64 = length_str
        .parse()
        .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))?;

    if length == -1 {
        return Ok(Some((Reply::Nil, header_len)));
    }
    if length < 0 {
        return Err(ParseError::InvalidBulkLength(length));
    }

    let length = length as usize;
    let total_needed = header_len + length + 2;
    if buf.len() < total_needed {
        return Ok(None);
    }

    if &buf[header_len + length..total_needed] != CRLF {
        return Err(ParseError::ProtocolError(
            "bulk string missing trailing CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&buf[header_len..header_len + length]);
    Ok(Some((Reply::Bulk(data), total_needed)))
}

/// Position of the first `\r\n`, if any.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn b(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[test]
    fn test_decode_lf_and_crlf() {
        let (commands, consumed) = decode(b"PING\nGET foo\r\n");
        assert_eq!(
            commands,
            vec![Command::Ping { message: None }, Command::Get { key: b("foo") }]
        );
        assert_eq!(consumed, 14);
    }

    #[test]
    fn test_decode_keeps_incomplete_line() {
        let input = b"SET foo bar\nGET fo";
        let (commands, consumed) = decode(input);
        assert_eq!(commands.len(), 1);
        assert_eq!(&input[consumed..], b"GET fo");

        // Nothing complete at all
        let (commands, consumed) = decode(b"PIN");
        assert!(commands.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_decode_split_across_reads() {
        let mut buffer = Vec::new();
        let mut decoded = Vec::new();

        for chunk in [&b"SET fo"[..], b"o ba", b"r\r", b"\nGET foo\n"] {
            buffer.extend_from_slice(chunk);
            let (commands, consumed) = decode(&buffer);
            decoded.extend(commands);
            buffer.drain(..consumed);
        }

        assert!(buffer.is_empty());
        assert_eq!(
            decoded,
            vec![
                Command::Set {
                    key: b("foo"),
                    value: b("bar"),
                    ttl: None
                },
                Command::Get { key: b("foo") },
            ]
        );
    }

    #[test]
    fn test_decode_skips_blank_lines() {
        let (commands, consumed) = decode(b"\r\n   \nPING\n");
        assert_eq!(commands, vec![Command::Ping { message: None }]);
        assert_eq!(consumed, 11);
    }

    #[test]
    fn test_decode_unknown_keeps_raw_line() {
        let (commands, _) = decode(b"BOGUS 1 2\r\n");
        assert_eq!(
            commands,
            vec![Command::Unknown {
                raw: b("BOGUS 1 2"),
                reason: ProtocolError::UnknownCommand("BOGUS".to_string()),
            }]
        );
    }

    #[test]
    fn test_decode_set_with_ttl() {
        let (commands, _) = decode(b"SET session abc PX 1500\n");
        assert_eq!(
            commands,
            vec![Command::Set {
                key: b("session"),
                value: b("abc"),
                ttl: Some(Duration::from_millis(1500)),
            }]
        );
    }

    #[test]
    fn test_split_plain_fields() {
        assert_eq!(
            split_fields(b"  SET\tfoo   bar ").unwrap(),
            vec![b("SET"), b("foo"), b("bar")]
        );
        assert!(split_fields(b"   ").unwrap().is_empty());
    }

    #[test]
    fn test_split_quoted_fields() {
        assert_eq!(
            split_fields(br#"SET greeting "hello world""#).unwrap(),
            vec![b("SET"), b("greeting"), b("hello world")]
        );
        assert_eq!(
            split_fields(br#"SET k "a\"b\\c\n\x41""#).unwrap(),
            vec![b("SET"), b("k"), b("a\"b\\c\nA")]
        );
        assert_eq!(
            split_fields(br"SET k 'it\'s \n raw'").unwrap(),
            vec![b("SET"), b("k"), b("it's \\n raw")]
        );
        assert_eq!(split_fields(br#"GET """#).unwrap(), vec![b("GET"), b("")]);
    }

    #[test]
    fn test_split_unbalanced_quotes() {
        assert_eq!(
            split_fields(br#"SET k "open"#),
            Err(ProtocolError::UnbalancedQuotes)
        );
        assert_eq!(
            split_fields(br#"SET k "a"b"#),
            Err(ProtocolError::UnbalancedQuotes)
        );
        assert_eq!(
            split_fields(b"SET k 'open"),
            Err(ProtocolError::UnbalancedQuotes)
        );
    }

    #[test]
    fn test_decode_unbalanced_quotes_is_unknown() {
        let (commands, consumed) = decode(b"SET k \"open\nPING\n");
        assert_eq!(consumed, 17);
        assert!(matches!(
            &commands[0],
            Command::Unknown {
                reason: ProtocolError::UnbalancedQuotes,
                ..
            }
        ));
        assert_eq!(commands[1], Command::Ping { message: None });
    }

    #[test]
    fn test_decode_multibulk() {
        let input = b"*3\r\n$3\r\nSET\r\n$8\r\nuser:101\r\n$5\r\na b\r\n\r\n";
        let (commands, consumed) = decode(input);
        assert_eq!(consumed, input.len());
        assert_eq!(
            commands,
            vec![Command::Set {
                key: b("user:101"),
                value: Bytes::from_static(b"a b\r\n"),
                ttl: None,
            }]
        );
    }

    #[test]
    fn test_decode_multibulk_incomplete() {
        let input = b"*2\r\n$3\r\nGET\r\n$4\r\nna";
        let (commands, consumed) = decode(input);
        assert!(commands.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_decode_multibulk_empty_array() {
        let (commands, consumed) = decode(b"*0\r\nPING\r\n");
        assert_eq!(commands, vec![Command::Ping { message: None }]);
        assert_eq!(consumed, 10);
    }

    #[test]
    fn test_decode_multibulk_bad_header_stops_decoding() {
        let (commands, consumed) = decode(b"*x\r\nPING\r\n");
        assert_eq!(consumed, 4);
        assert_eq!(commands.len(), 1);
        assert!(matches!(
            &commands[0],
            Command::Unknown {
                reason: ProtocolError::Framing(_),
                ..
            }
        ));
        assert!(commands[0].ends_connection());

        let (commands, _) = decode(b"*1\r\n:4\r\n");
        assert!(matches!(
            &commands[0],
            Command::Unknown {
                reason: ProtocolError::Framing("expected '$'"),
                ..
            }
        ));
    }

    #[test]
    fn test_decode_missing_bulk_terminator_hides_payload() {
        // The payload must not resurface as an inline DEL
        let input = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$5\r\nDEL victim\n";
        let (commands, _) = decode(input);
        assert_eq!(commands.len(), 1);
        assert!(matches!(
            &commands[0],
            Command::Unknown {
                reason: ProtocolError::Framing("bulk string missing trailing CRLF"),
                ..
            }
        ));
    }

    #[test]
    fn test_decode_bad_bulk_length_hides_following_lines() {
        let input = b"*2\r\n$3\r\nGET\r\n$x\r\nDEL victim\r\n";
        let (commands, consumed) = decode(input);
        assert_eq!(commands.len(), 1);
        assert!(matches!(
            &commands[0],
            Command::Unknown {
                reason: ProtocolError::Framing("invalid bulk length"),
                ..
            }
        ));
        assert!(consumed < input.len());
    }

    #[test]
    fn test_decode_stops_after_quit() {
        let (commands, consumed) = decode(b"QUIT\nPING\n");
        assert_eq!(commands, vec![Command::Quit]);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_parse_simple_string() {
        let (reply, consumed) = parse_reply(b"+OK\r\n").unwrap().unwrap();
        assert_eq!(reply, Reply::Simple("OK".to_string()));
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_parse_error() {
        let input = b"-ERR unknown command\r\n";
        let (reply, consumed) = parse_reply(input).unwrap().unwrap();
        assert_eq!(reply, Reply::Error("ERR unknown command".to_string()));
        assert_eq!(consumed, 22);
    }

    #[test]
    fn test_parse_integer() {
        let (reply, consumed) = parse_reply(b":1000\r\n").unwrap().unwrap();
        assert_eq!(reply, Reply::Integer(1000));
        assert_eq!(consumed, 7);

        assert!(matches!(
            parse_reply(b":not_a_number\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
    }

    #[test]
    fn test_parse_bulk_and_nil() {
        let (reply, consumed) = parse_reply(b"$5\r\nhello\r\n").unwrap().unwrap();
        assert_eq!(reply, Reply::Bulk(b("hello")));
        assert_eq!(consumed, 11);

        let (reply, consumed) = parse_reply(b"$-1\r\n").unwrap().unwrap();
        assert_eq!(reply, Reply::Nil);
        assert_eq!(consumed, 5);

        let (reply, _) = parse_reply(b"$5\r\nhel\x00o\r\n").unwrap().unwrap();
        assert_eq!(reply, Reply::Bulk(Bytes::from_static(b"hel\x00o")));
    }

    #[test]
    fn test_parse_incomplete_replies() {
        assert!(parse_reply(b"").unwrap().is_none());
        assert!(parse_reply(b"+OK").unwrap().is_none());
        assert!(parse_reply(b"$5\r\nhel").unwrap().is_none());
    }

    #[test]
    fn test_parse_rejects_unknown_prefix() {
        assert_eq!(parse_reply(b"@x\r\n"), Err(ParseError::UnknownPrefix(b'@')));
        assert_eq!(
            parse_reply(b"$-2\r\n"),
            Err(ParseError::InvalidBulkLength(-2))
        );
    }

    #[test]
    fn test_every_reply_kind_parses_back() {
        let replies = [
            Reply::ok(),
            Reply::error("ERR unknown command 'X'"),
            Reply::integer(-3),
            Reply::bulk(b("value with spaces")),
            Reply::nil(),
        ];

        let mut wire = Vec::new();
        for reply in &replies {
            reply.serialize_into(&mut wire);
        }

        let mut offset = 0;
        for expected in &replies {
            let (reply, used) = parse_reply(&wire[offset..]).unwrap().unwrap();
            assert_eq!(&reply, expected);
            offset += used;
        }
        assert_eq!(offset, wire.len());
    }
}
