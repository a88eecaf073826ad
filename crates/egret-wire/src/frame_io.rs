// Async frame IO over any byte stream half.
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Command, Error, Frame, Result};

/// Read one frame. Returns `Ok(None)` on a clean EOF at a frame boundary;
/// an EOF inside a frame is an error. The declared size is checked against
/// `max_frame_bytes` before any allocation.
pub async fn read_frame<R>(recv: &mut R, max_frame_bytes: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = recv.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Incomplete);
        }
        filled += n;
    }
    let total = u32::from_be_bytes(prefix) as usize;
    if total < 4 {
        return Err(Error::Malformed("total size too small"));
    }
    if total > max_frame_bytes {
        return Err(Error::FrameTooLarge(total));
    }

    let mut buf = BytesMut::with_capacity(4 + total);
    buf.extend_from_slice(&prefix);
    buf.resize(4 + total, 0);
    recv.read_exact(&mut buf[4..]).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Incomplete
        } else {
            Error::Io(err)
        }
    })?;
    Frame::decode(buf.freeze()).map(Some)
}

pub async fn write_frame<W>(send: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    // One buffered write per frame keeps the two prefixes and body in a
    // single syscall for small commands.
    let mut buf = BytesMut::with_capacity(frame.encoded_len());
    frame.encode_into(&mut buf);
    send.write_all(&buf).await?;
    Ok(())
}

/// Read one frame and decode its command section.
pub async fn read_command<R>(recv: &mut R, max_frame_bytes: usize) -> Result<Option<(Command, Frame)>>
where
    R: AsyncRead + Unpin,
{
    match read_frame(recv, max_frame_bytes).await? {
        Some(frame) => {
            let command = Command::decode(&frame)?;
            Ok(Some((command, frame)))
        }
        None => Ok(None),
    }
}

pub async fn write_command<W>(send: &mut W, command: &Command) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = command.encode()?;
    write_frame(send, &frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_MAX_FRAME_BYTES;
    use bytes::Bytes;

    #[tokio::test]
    async fn frame_round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let frame = Frame::new(
            Bytes::from_static(b"{\"type\":\"ping\"}"),
            Bytes::from_static(b"payload"),
        )
        .expect("frame");
        write_frame(&mut client, &frame).await.expect("write");
        let read = read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect("read")
            .expect("frame");
        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let read = read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect("read");
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn eof_inside_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // A prefix promising 100 bytes, then hang up.
        client.write_all(&100u32.to_be_bytes()).await.expect("write");
        drop(client);
        let err = read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect_err("truncated");
        assert!(matches!(err, Error::Incomplete));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_reading_body() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(1024u32 * 1024).to_be_bytes())
            .await
            .expect("write");
        let err = read_frame(&mut server, 512).await.expect_err("too large");
        assert!(matches!(err, Error::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn command_helpers_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_command(&mut client, &Command::Ping).await.expect("write");
        let (command, _) = read_command(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect("read")
            .expect("command");
        assert_eq!(command, Command::Ping);
    }
}
