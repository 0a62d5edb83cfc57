//! Wire encoding for the plaintext carried inside a sealed SPTPS
//! record sent over UDP. A single leading tag byte disambiguates a raw
//! `send()` datagram from a channel segment, since both ride the same
//! per-peer session and transport.

use crate::channel::ChannelId;
use crate::error::*;

const TAG_DATAGRAM: u8 = 0;
const TAG_SEGMENT: u8 = 1;

/// Fixed header following the tag byte on a channel segment:
/// `local_port(2) || remote_port(2) || seq(4) || fin(1)`.
const SEGMENT_HEADER_LEN: usize = 2 + 2 + 4 + 1;

pub fn encode_datagram(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(TAG_DATAGRAM);
    out.extend_from_slice(payload);
    out
}

pub fn encode_segment(id: ChannelId, seq: u32, data: &[u8], fin: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + SEGMENT_HEADER_LEN + data.len());
    out.push(TAG_SEGMENT);
    out.extend_from_slice(&id.local_port.to_be_bytes());
    out.extend_from_slice(&id.remote_port.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.push(fin as u8);
    out.extend_from_slice(data);
    out
}

#[derive(Debug)]
pub enum Decoded {
    Datagram(Vec<u8>),
    Segment { id: ChannelId, seq: u32, data: Vec<u8>, fin: bool },
}

/// Decodes a plaintext payload opened from an SPTPS record, dispatching
/// on the tag byte. The channel's own `local_port`/`remote_port`
/// ordering is from the sender's perspective, so the receiver must
/// swap them to index its own `ChannelId`.
pub fn decode(payload: &[u8]) -> Result<Decoded> {
    let (&tag, rest) = payload.split_first().ok_or(Error::simple(ErrorKind::Protocol))?;
    match tag {
        TAG_DATAGRAM => Ok(Decoded::Datagram(rest.to_vec())),
        TAG_SEGMENT => {
            if rest.len() < SEGMENT_HEADER_LEN {
                return Err("truncated channel segment header").wrapped(ErrorKind::Protocol);
            }
            let sender_local_port = u16::from_be_bytes([rest[0], rest[1]]);
            let sender_remote_port = u16::from_be_bytes([rest[2], rest[3]]);
            let seq = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
            let fin = rest[8] != 0;
            let data = rest[SEGMENT_HEADER_LEN..].to_vec();
            // From the receiver's point of view the sender's local port
            // is our remote port, and vice versa.
            let id = ChannelId { local_port: sender_remote_port, remote_port: sender_local_port };
            Ok(Decoded::Segment { id, seq, data, fin })
        }
        _ => Err("unknown channel wire tag").wrapped(ErrorKind::Protocol),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_round_trips() {
        let encoded = encode_datagram(b"hello");
        match decode(&encoded).unwrap() {
            Decoded::Datagram(data) => assert_eq!(data, b"hello"),
            _ => panic!("expected a datagram"),
        }
    }

    #[test]
    fn segment_round_trips_with_swapped_ports() {
        let id = ChannelId { local_port: 100, remote_port: 200 };
        let encoded = encode_segment(id, 42, b"payload", true);
        match decode(&encoded).unwrap() {
            Decoded::Segment { id: got_id, seq, data, fin } => {
                assert_eq!(got_id, ChannelId { local_port: 200, remote_port: 100 });
                assert_eq!(seq, 42);
                assert_eq!(data, b"payload");
                assert!(fin);
            }
            _ => panic!("expected a segment"),
        }
    }

    #[test]
    fn truncated_segment_header_is_rejected() {
        let err = decode(&[TAG_SEGMENT, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
