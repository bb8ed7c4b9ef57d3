//! Frame framing on the wire
//!
//! Size-prepended frames are a u32 little-endian length followed by that many
//! payload bytes; a zero length marks end of stream. Chunked streams are read
//! in fixed-size pieces.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::LENGTH_PREFIX_SIZE;
use crate::error::{ProtocolError, Result};

/// Copy `frame` behind its 4-byte little-endian length
pub fn size_prefixed(frame: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + frame.len());
    buf.put_u32_le(frame.len() as u32);
    buf.put_slice(frame);
    buf.freeze()
}

/// Write a bare length prefix
pub async fn write_length<W>(writer: &mut W, len: u32) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&len.to_le_bytes()).await?;
    Ok(())
}

/// Read a bare length prefix
pub async fn read_length<R>(reader: &mut R) -> Result<u32>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut len).await?;
    Ok(u32::from_le_bytes(len))
}

/// Read one size-prepended frame
///
/// Returns `None` on the zero-length end-of-stream marker.
pub async fn read_frame<R>(reader: &mut R, max_size: u32) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let len = read_length(reader).await?;
    if len == 0 {
        return Ok(None);
    }
    if len > max_size {
        return Err(ProtocolError::FrameTooLarge(len).into());
    }

    let mut frame = BytesMut::zeroed(len as usize);
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame.freeze()))
}

/// Read one fixed-size chunk
///
/// Returns `None` when the peer closes before a full chunk arrives.
pub async fn read_chunk<R>(reader: &mut R, size: usize) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = BytesMut::zeroed(size);
    match reader.read_exact(&mut chunk).await {
        Ok(_) => Ok(Some(chunk.freeze())),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_size_prefixed_layout() {
        let framed = size_prefixed(b"abc");
        assert_eq!(&framed[..], &[3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn test_read_frames_until_terminator() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&size_prefixed(b"first"));
        wire.extend_from_slice(&size_prefixed(b"second"));
        wire.extend_from_slice(&0u32.to_le_bytes());
        let mut reader = &wire[..];

        assert_eq!(read_frame(&mut reader, 1024).await.unwrap().unwrap(), &b"first"[..]);
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap().unwrap(), &b"second"[..]);
        assert!(read_frame(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let wire = size_prefixed(&[0u8; 32]);
        let mut reader = &wire[..];
        let err = read_frame(&mut reader, 16).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::FrameTooLarge(32))));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let wire = size_prefixed(b"truncated");
        let mut reader = &wire[..6];
        assert!(matches!(read_frame(&mut reader, 1024).await, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_read_chunk_stops_on_short_tail() {
        let wire = [7u8; 10];
        let mut reader = &wire[..];
        assert_eq!(read_chunk(&mut reader, 4).await.unwrap().unwrap().len(), 4);
        assert_eq!(read_chunk(&mut reader, 4).await.unwrap().unwrap().len(), 4);
        assert!(read_chunk(&mut reader, 4).await.unwrap().is_none());
    }
}
