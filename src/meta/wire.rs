//! Length-prefixed framing shared by every byte exchanged on a
//! meta-connection socket: the cleartext bootstrap line, the raw SPTPS
//! handshake legs, and sealed application records alike. A `u32`
//! big-endian length prefix ahead of each frame means none of those
//! payloads need to be self-delimiting on the wire.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::*;

/// Frames larger than this are rejected outright; nothing this library
/// ever sends (handshake legs, sealed records, bootstrap lines) comes
/// close, so this only guards against a misbehaving or hostile peer.
pub const MAX_FRAME_LEN: usize = 1 << 20;

pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err("frame too large to send").wrapped(ErrorKind::Inval);
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await.wrapped(ErrorKind::Network)?;
    writer.write_all(payload).await.wrapped(ErrorKind::Network)?;
    writer.flush().await.wrapped(ErrorKind::Network)?;
    Ok(())
}

pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.wrapped(ErrorKind::Network)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err("peer announced an oversized frame").wrapped(ErrorKind::Protocol);
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.wrapped(ErrorKind::Network)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_over_a_duplex_pipe() {
        tokio_test::block_on(async {
            let (mut a, mut b) = tokio::io::duplex(4096);
            write_frame(&mut a, b"hello there").await.unwrap();
            let got = read_frame(&mut b).await.unwrap();
            assert_eq!(got, b"hello there");
        });
    }

    #[test]
    fn oversized_announced_length_is_rejected() {
        tokio_test::block_on(async {
            let (mut a, mut b) = tokio::io::duplex(16);
            let len = (MAX_FRAME_LEN + 1) as u32;
            a.write_all(&len.to_be_bytes()).await.unwrap();
            let err = read_frame(&mut b).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Protocol);
        });
    }
}
