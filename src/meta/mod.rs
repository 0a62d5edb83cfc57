//! The meta-protocol: request IDs, the line codec, the per-peer
//! connection state machine, and flooding.

pub mod connection;
pub mod flood;
pub mod wire;

use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;

use crate::error::*;

/// Maximum length, in bytes, of one meta-protocol line including its
/// terminating LF.
pub const MAX_LINE_LEN: usize = 4096;

/// Request identifiers carried as the first field of a meta-protocol
/// line.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum RequestId {
    Id,
    Ack,
    Ping,
    Pong,
    AddEdge,
    DelEdge,
    AddSubnet,
    DelSubnet,
    ReqKey,
    AnsKey,
    KeyChanged,
    ReqPubkey,
    AnsPubkey,
    ReqExternal,
    AnsExternal,
    TermReq,
}

impl RequestId {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestId::Id => "ID",
            RequestId::Ack => "ACK",
            RequestId::Ping => "PING",
            RequestId::Pong => "PONG",
            RequestId::AddEdge => "ADD_EDGE",
            RequestId::DelEdge => "DEL_EDGE",
            RequestId::AddSubnet => "ADD_SUBNET",
            RequestId::DelSubnet => "DEL_SUBNET",
            RequestId::ReqKey => "REQ_KEY",
            RequestId::AnsKey => "ANS_KEY",
            RequestId::KeyChanged => "KEY_CHANGED",
            RequestId::ReqPubkey => "REQ_PUBKEY",
            RequestId::AnsPubkey => "ANS_PUBKEY",
            RequestId::ReqExternal => "REQ_EXTERNAL",
            RequestId::AnsExternal => "ANS_EXTERNAL",
            RequestId::TermReq => "TERMREQ",
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "ID" => RequestId::Id,
            "ACK" => RequestId::Ack,
            "PING" => RequestId::Ping,
            "PONG" => RequestId::Pong,
            "ADD_EDGE" => RequestId::AddEdge,
            "DEL_EDGE" => RequestId::DelEdge,
            "ADD_SUBNET" => RequestId::AddSubnet,
            "DEL_SUBNET" => RequestId::DelSubnet,
            "REQ_KEY" => RequestId::ReqKey,
            "ANS_KEY" => RequestId::AnsKey,
            "KEY_CHANGED" => RequestId::KeyChanged,
            "REQ_PUBKEY" => RequestId::ReqPubkey,
            "ANS_PUBKEY" => RequestId::AnsPubkey,
            "REQ_EXTERNAL" => RequestId::ReqExternal,
            "ANS_EXTERNAL" => RequestId::AnsExternal,
            "TERMREQ" => RequestId::TermReq,
            other => return Err(format!("unknown request id `{}`", other)).wrapped(ErrorKind::Protocol),
        })
    }
}

/// One parsed meta-protocol line: `<id> <arg1> <arg2> ...`.
///
/// Arguments are stored inline for up to 6 fields, which covers every
/// request id this crate defines (`ADD_EDGE` is the widest at 6); only
/// a pathologically long line spills onto the heap.
#[derive(Clone, Debug)]
pub struct Line {
    pub id: RequestId,
    pub args: SmallVec<[String; 6]>,
}

impl Line {
    pub fn new(id: RequestId, args: Vec<String>) -> Self {
        Line { id, args: args.into() }
    }

    /// Parses one LF-terminated (LF already stripped) line.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.len() + 1 > MAX_LINE_LEN {
            return Err("meta-protocol line too long").wrapped(ErrorKind::Protocol);
        }
        let mut fields = raw.split_whitespace();
        let id_str = fields.next().ok_or(Error::simple(ErrorKind::Protocol))?;
        let id = id_str.parse()?;
        let args = fields.map(str::to_owned).collect();
        Ok(Line { id, args })
    }

    /// Serialises back to a line, without the trailing LF.
    pub fn encode(&self) -> String {
        let mut out = self.id.to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }

    /// Encodes a binary field as base64.
    pub fn encode_binary(data: &[u8]) -> String {
        base64::encode(data)
    }

    pub fn decode_binary(field: &str) -> Result<Vec<u8>> {
        base64::decode(field).wrapped(ErrorKind::Protocol)
    }
}

/// Accumulates decrypted application bytes and yields completed lines,
/// enforcing the length cap before a LF is ever seen.
#[derive(Default)]
pub struct LineReader {
    buffer: Vec<u8>,
}

impl LineReader {
    pub fn new() -> Self {
        LineReader { buffer: Vec::new() }
    }

    /// Feeds newly decrypted bytes and drains as many complete lines as
    /// are buffered. Returns an error (which the caller should treat as
    /// fatal to the connection) if the partial line overruns the cap.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Line>> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                if self.buffer.len() > MAX_LINE_LEN {
                    return Err("meta-protocol line too long").wrapped(ErrorKind::Protocol);
                }
                break;
            };
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = std::str::from_utf8(&line_bytes[..line_bytes.len() - 1])
                .wrapped(ErrorKind::Protocol)?
                .trim_end_matches('\r');
            if !text.is_empty() {
                lines.push(Line::parse(text)?);
            }
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_line() {
        let line = Line::parse("PING").unwrap();
        assert_eq!(line.id, RequestId::Ping);
        assert!(line.args.is_empty());
    }

    #[test]
    fn parses_line_with_args() {
        let line = Line::parse("ADD_EDGE self a 1 0").unwrap();
        assert_eq!(line.id, RequestId::AddEdge);
        assert_eq!(line.args.to_vec(), vec!["self", "a", "1", "0"]);
    }

    #[test]
    fn rejects_unknown_id() {
        assert!(Line::parse("BOGUS 1 2 3").is_err());
    }

    #[test]
    fn binary_field_roundtrips() {
        let data = b"some binary blob \x00\x01\xff";
        let encoded = Line::encode_binary(data);
        let decoded = Line::decode_binary(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn line_reader_splits_multiple_lines_across_feeds() {
        let mut reader = LineReader::new();
        let lines = reader.feed(b"PING\nPO").unwrap();
        assert_eq!(lines.len(), 1);
        let lines = reader.feed(b"NG\n").unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].id, RequestId::Pong);
    }

    #[test]
    fn line_reader_rejects_oversized_partial_line() {
        let mut reader = LineReader::new();
        let huge = vec![b'a'; MAX_LINE_LEN + 1];
        assert!(reader.feed(&huge).is_err());
    }
}
