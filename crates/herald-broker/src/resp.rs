//! ---
//! herald_section: "02-broker-connectivity"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Broker connection primitives and pub/sub transports."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
//! Minimal RESP2 codec: enough to send `PUBLISH` and read its reply.
use bytes::{BufMut, BytesMut};

use crate::{BrokerError, Result};

/// Reply to a single command, as far as a publisher cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `:<n>` integer reply.
    Integer(i64),
    /// `+<text>` simple string reply.
    Status(String),
    /// `-<text>` error reply.
    Error(String),
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[&[u8]]) -> BytesMut {
    let capacity = 16 + args.iter().map(|arg| arg.len() + 16).sum::<usize>();
    let mut buf = BytesMut::with_capacity(capacity);
    buf.put_u8(b'*');
    buf.put_slice(args.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    for arg in args {
        buf.put_u8(b'$');
        buf.put_slice(arg.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
    buf
}

/// Encode `PUBLISH channel payload`.
pub fn encode_publish(channel: &str, payload: &[u8]) -> BytesMut {
    encode_command(&[b"PUBLISH", channel.as_bytes(), payload])
}

/// Parse a single-line reply (terminator included or not).
pub fn parse_reply_line(line: &[u8]) -> Result<Reply> {
    let line = line
        .strip_suffix(b"\r\n")
        .or_else(|| line.strip_suffix(b"\n"))
        .unwrap_or(line);
    let Some((&kind, body)) = line.split_first() else {
        return Err(BrokerError::Protocol("empty reply".into()));
    };
    let text = std::str::from_utf8(body)
        .map_err(|_| BrokerError::Protocol("reply is not valid utf-8".into()))?;
    match kind {
        b':' => text
            .parse::<i64>()
            .map(Reply::Integer)
            .map_err(|_| BrokerError::Protocol(format!("invalid integer reply {:?}", text))),
        b'+' => Ok(Reply::Status(text.to_owned())),
        b'-' => Ok(Reply::Error(text.to_owned())),
        other => Err(BrokerError::Protocol(format!(
            "unexpected reply type {:?}",
            other as char
        ))),
    }
}

/// Interpret the reply to `PUBLISH` as a receiver count.
pub fn publish_receivers(reply: Reply) -> Result<u64> {
    match reply {
        Reply::Integer(count) if count >= 0 => Ok(count as u64),
        Reply::Integer(count) => Err(BrokerError::Protocol(format!(
            "negative receiver count {}",
            count
        ))),
        Reply::Error(message) => Err(BrokerError::Rejected(message)),
        Reply::Status(status) => Err(BrokerError::Protocol(format!(
            "unexpected status reply {:?} to PUBLISH",
            status
        ))),
    }
}
