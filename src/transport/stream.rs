//! Byte-stream indirection.
//!
//! The engine works on a boxed stream split into halves. The read half is
//! owned by the receive loop; the write half lives in a [`StreamWriter`]
//! slot that the secure-channel upgrade can empty and refill while both the
//! send path and the receive loop are paused.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::buffer::GrowableBuffer;
use crate::error::{Result, TransportError};

/// Anything the engine can run over: TCP, local sockets, pipes, TLS, duplex.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn TransportStream>;

pub type StreamReader = ReadHalf<BoxedStream>;

/// Box a concrete stream.
pub fn boxed<S: TransportStream>(stream: S) -> BoxedStream {
    Box::new(stream)
}

/// Split a stream into the engine's halves.
pub(crate) fn split(stream: BoxedStream) -> (StreamReader, WriteHalf<BoxedStream>) {
    tokio::io::split(stream)
}

/// Write half plus the private send arena.
pub(crate) struct StreamWriter {
    half: Option<WriteHalf<BoxedStream>>,
    pub(crate) buffer: GrowableBuffer,
}

impl StreamWriter {
    pub(crate) fn new(half: WriteHalf<BoxedStream>, initial_buffer: usize) -> Self {
        Self {
            half: Some(half),
            buffer: GrowableBuffer::new(initial_buffer),
        }
    }

    /// Write the first `len` bytes of the arena and flush.
    pub(crate) async fn write_buffered(&mut self, len: usize) -> Result<()> {
        let half = self.half.as_mut().ok_or(TransportError::ConnectionClosed)?;
        half.write_all(&self.buffer.as_slice()[..len]).await?;
        half.flush().await?;
        Ok(())
    }

    /// Take the write half out for the upgrade.
    pub(crate) fn take(&mut self) -> Option<WriteHalf<BoxedStream>> {
        self.half.take()
    }

    /// Install the write half of the upgraded stream.
    pub(crate) fn replace(&mut self, half: WriteHalf<BoxedStream>) {
        self.half = Some(half);
    }

    pub(crate) async fn shutdown(&mut self) {
        if let Some(mut half) = self.half.take() {
            let _ = half.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_write_and_rejoin() {
        let (a, mut b) = duplex(1024);
        let (reader, half) = split(boxed(a));
        let mut writer = StreamWriter::new(half, 16);
        writer.buffer.as_mut_slice()[..4].copy_from_slice(b"RRAC");
        writer.write_buffered(4).await.unwrap();

        let mut got = [0u8; 4];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"RRAC");

        let half = writer.take().unwrap();
        let _stream: BoxedStream = reader.unsplit(half);
        assert!(matches!(
            writer.write_buffered(1).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
