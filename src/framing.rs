//! Framed-Message Codec
//!
//! Wire format: a 4-byte big-endian length followed by exactly that many
//! payload bytes (UTF-8 JSON in practice, opaque here).
//!
//! ```text
//! +----------------------+------------------+
//! | length (u32, BE)     | payload          |
//! +----------------------+------------------+
//! ```
//!
//! The decoder works incrementally on whatever bytes have arrived, so chunk
//! boundaries never have to line up with frame boundaries. Lengths above the
//! configured ceiling fail deterministically, and after any decode error the
//! codec is poisoned and yields nothing further.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead};
use tracing::warn;

pub const FRAME_HEADER_LEN: usize = 4;
/// Same ceiling the backend's IPC server enforces.
pub const DEFAULT_MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame length {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    #[error("Decoder stopped after an earlier error")]
    Poisoned,

    #[error("Connection closed before a response frame arrived")]
    ConnectionClosed,

    #[error("Frame payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
    poisoned: bool,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            poisoned: false,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn fail(&mut self, error: FrameError) -> FrameError {
        warn!("Frame decode failed: {}", error);
        self.poisoned = true;
        error
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if self.poisoned {
            return Err(FrameError::Poisoned);
        }
        if src.len() < FRAME_HEADER_LEN {
            src.reserve(FRAME_HEADER_LEN - src.len());
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&src[..FRAME_HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame_len {
            return Err(self.fail(FrameError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            }));
        }

        let total = FRAME_HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                let buffered = src.len();
                Err(self.fail(FrameError::Truncated { buffered }))
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if payload.len() > self.max_frame_len || payload.len() > u32::MAX as usize {
            return Err(FrameError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }
        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Prefix `payload` with its big-endian length.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    let mut dst = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    FrameCodec::with_max_frame_len(u32::MAX as usize).encode(Bytes::copy_from_slice(payload), &mut dst)?;
    Ok(dst.freeze())
}

/// Lazy stream of payloads read off `reader`.
pub fn frame_stream<R: AsyncRead>(reader: R, max_frame_len: usize) -> FramedRead<R, FrameCodec> {
    FramedRead::new(reader, FrameCodec::with_max_frame_len(max_frame_len))
}

// ============================================================================
// Framed JSON request (one exchange per connection)
// ============================================================================

#[cfg(unix)]
pub use self::client::request_framed;

#[cfg(unix)]
mod client {
    use super::{FrameCodec, FrameError};
    use crate::envelope::{RequestEnvelope, ResponseEnvelope};
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use std::path::Path;
    use tokio::net::UnixStream;
    use tokio_util::codec::Framed;
    use tracing::debug;

    /// Connect, send one framed request, read one framed response, close.
    pub async fn request_framed(
        socket_path: &Path,
        request: &RequestEnvelope,
        max_frame_len: usize,
    ) -> Result<ResponseEnvelope, FrameError> {
        let stream = UnixStream::connect(socket_path).await?;
        let mut framed = Framed::new(stream, FrameCodec::with_max_frame_len(max_frame_len));

        let payload = serde_json::to_vec(&request.with_text_body())?;
        debug!(
            "Framed {} {} over {:?} ({} bytes)",
            request.method,
            request.path,
            socket_path,
            payload.len()
        );
        framed.send(Bytes::from(payload)).await?;

        let frame = framed.next().await.ok_or(FrameError::ConnectionClosed)??;
        let response = serde_json::from_slice(&frame)?;
        let _ = framed.close().await;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn feed_in_chunks(encoded: &[u8], chunk_sizes: &[usize]) -> Vec<Bytes> {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::new();
        let mut frames = Vec::new();
        let mut offset = 0;
        let mut sizes = chunk_sizes.iter().cycle();

        while offset < encoded.len() {
            let size = (*sizes.next().unwrap()).max(1);
            let end = (offset + size).min(encoded.len());
            buffer.extend_from_slice(&encoded[offset..end]);
            offset = end;
            while let Some(frame) = codec.decode(&mut buffer).unwrap() {
                frames.push(frame);
            }
        }
        assert!(buffer.is_empty());
        frames
    }

    /// Deterministic pseudo-random split sizes.
    fn scattered_sizes(seed: u64, count: usize) -> Vec<usize> {
        let mut state = seed;
        (0..count)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((state >> 33) % 97) as usize + 1
            })
            .collect()
    }

    fn sample_payloads() -> Vec<Vec<u8>> {
        vec![
            Vec::new(),
            br#"{"method":"GET","path":"/health"}"#.to_vec(),
            (0..200_000u32).map(|i| (i % 251) as u8).collect(),
        ]
    }

    #[test]
    fn header_is_big_endian_length() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn round_trips_regardless_of_chunking() {
        for payload in sample_payloads() {
            let encoded = encode_frame(&payload).unwrap();
            let whole = feed_in_chunks(&encoded, &[encoded.len()]);
            let bytewise = feed_in_chunks(&encoded, &[1]);
            let scattered = feed_in_chunks(&encoded, &scattered_sizes(payload.len() as u64, 64));

            for frames in [whole, bytewise, scattered] {
                assert_eq!(frames.len(), 1);
                assert_eq!(&frames[0][..], &payload[..]);
            }
        }
    }

    #[test]
    fn coalesced_frames_are_all_yielded() {
        let payloads = sample_payloads();
        let mut encoded = Vec::new();
        for payload in &payloads {
            encoded.extend_from_slice(&encode_frame(payload).unwrap());
        }

        let frames = feed_in_chunks(&encoded, &scattered_sizes(7, 128));
        assert_eq!(frames.len(), payloads.len());
        for (frame, payload) in frames.iter().zip(&payloads) {
            assert_eq!(&frame[..], &payload[..]);
        }
    }

    #[test]
    fn oversized_length_fails_and_poisons() {
        let mut codec = FrameCodec::with_max_frame_len(8);
        let mut buffer = BytesMut::from(&encode_frame(&[0u8; 9]).unwrap()[..]);

        assert!(matches!(
            codec.decode(&mut buffer),
            Err(FrameError::FrameTooLarge { len: 9, max: 8 })
        ));
        assert!(codec.is_poisoned());

        let mut next = BytesMut::from(&encode_frame(b"ok").unwrap()[..]);
        assert!(matches!(codec.decode(&mut next), Err(FrameError::Poisoned)));
    }

    #[test]
    fn truncated_payload_at_eof_is_an_error() {
        let encoded = encode_frame(b"hello world").unwrap();
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(&encoded[..encoded.len() - 3]);

        assert!(codec.decode(&mut buffer).unwrap().is_none());
        assert!(matches!(
            codec.decode_eof(&mut buffer),
            Err(FrameError::Truncated { buffered: 12 })
        ));
    }

    #[test]
    fn encoder_rejects_payload_over_ceiling() {
        let mut codec = FrameCodec::with_max_frame_len(2);
        let mut dst = BytesMut::new();
        assert!(codec.encode(Bytes::from_static(b"abc"), &mut dst).is_err());
        assert!(dst.is_empty());
    }

    #[tokio::test]
    async fn frame_stream_yields_payloads_lazily() {
        let mut encoded = Vec::new();
        encoded.extend_from_slice(&encode_frame(b"first").unwrap());
        encoded.extend_from_slice(&encode_frame(b"").unwrap());
        encoded.extend_from_slice(&encode_frame(b"third").unwrap());

        let mut stream = frame_stream(&encoded[..], DEFAULT_MAX_FRAME_LEN);
        assert_eq!(&stream.next().await.unwrap().unwrap()[..], b"first");
        assert_eq!(&stream.next().await.unwrap().unwrap()[..], b"");
        assert_eq!(&stream.next().await.unwrap().unwrap()[..], b"third");
        assert!(stream.next().await.is_none());
    }
}
