//! Length-prefixed message framing for byte streams

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest message accepted from the wire.
pub const MAX_MESSAGE_LEN: usize = 256 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Write one message as a little-endian `u32` length followed by its bytes.
pub async fn write_message<W>(writer: &mut W, message: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(message.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(message).await
}

/// Reads length-prefixed messages from a byte stream.
///
/// [`MessageReader::next_message`] is cancel safe: partially received
/// messages stay buffered, so it can be raced against a timeout.
#[derive(Debug)]
pub struct MessageReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R> MessageReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self { inner, buf: BytesMut::with_capacity(64 * 1024) }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between messages.
    pub async fn next_message(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if let Some(message) = self.parse()? {
                return Ok(Some(message));
            }
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a message",
                ));
            }
        }
    }

    fn parse(&mut self) -> io::Result<Option<Bytes>> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_MESSAGE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message of {} bytes exceeds limit", len),
            ));
        }
        if self.buf.len() < LEN_PREFIX + len {
            self.buf.reserve(LEN_PREFIX + len - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(LEN_PREFIX);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_survive_arbitrary_chunking() {
        let (mut client, server) = tokio::io::duplex(7);
        let writer = tokio::spawn(async move {
            write_message(&mut client, b"cam0").await.unwrap();
            write_message(&mut client, &[0u8]).await.unwrap();
            write_message(&mut client, &vec![5u8; 300]).await.unwrap();
        });

        let mut reader = MessageReader::new(server);
        assert_eq!(reader.next_message().await.unwrap().unwrap().as_ref(), b"cam0");
        assert_eq!(reader.next_message().await.unwrap().unwrap().as_ref(), &[0u8]);
        assert_eq!(reader.next_message().await.unwrap().unwrap().len(), 300);
        writer.await.unwrap();
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_message_is_an_error() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let mut reader = MessageReader::new(server);
        let err = reader.next_message().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_le_bytes()).await.unwrap();

        let mut reader = MessageReader::new(server);
        let err = reader.next_message().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
