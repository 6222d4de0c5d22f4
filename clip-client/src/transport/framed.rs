//! Length-prefixed frame I/O over async byte streams.

use clipsync_types::{Envelope, FrameCodec, FrameDecoder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;

const READ_CHUNK: usize = 8 * 1024;

/// Reads whole frames from a byte stream.
///
/// Partial frames stay buffered across reads. `next_frame` is cancel safe:
/// dropping it between reads loses no bytes.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap `inner`, rejecting frames longer than `max_frame_len`.
    pub fn new(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(max_frame_len),
            chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Next complete frame payload.
    ///
    /// Returns `Ok(None)` on a clean close between frames and
    /// `ConnectionClosed` if the stream ends inside a frame.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                if self.decoder.buffered() == 0 {
                    return Ok(None);
                }
                return Err(TransportError::ConnectionClosed);
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }

    /// Next frame, parsed as an envelope.
    pub async fn next_envelope(&mut self) -> Result<Option<Envelope>, TransportError> {
        match self.next_frame().await? {
            Some(bytes) => Ok(Some(Envelope::from_json_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Unwrap the underlying reader, discarding any buffered bytes.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Write one frame and flush.
pub async fn write_frame<W>(
    writer: &mut W,
    codec: &FrameCodec,
    payload: &[u8],
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = codec.encode(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode and write one envelope.
pub async fn write_envelope<W>(
    writer: &mut W,
    codec: &FrameCodec,
    envelope: &Envelope,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = codec.encode_envelope(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
