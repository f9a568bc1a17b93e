//! Size-delimited protobuf stream decoding.
//!
//! Segment endpoints answer with a stream of messages, each prefixed by a
//! varint byte length. Chunk boundaries are arbitrary: a frame may span
//! chunks, and one chunk may carry many frames.

use bytes::{Buf, BytesMut};
use prost::Message;
use std::marker::PhantomData;
use thiserror::Error;

/// Upper bound on a single frame's payload length.
pub const MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
    #[error("frame length varint overflow")]
    VarintOverflow,
    #[error("frame length {0} exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(u64),
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Incremental decoder over a lazy sequence of byte chunks.
///
/// Feed chunks with [`push`](Self::push); every complete frame is decoded and
/// returned, the incomplete tail stays buffered. After the upstream ends,
/// [`finish`](Self::finish) reports a truncated frame if bytes remain.
#[derive(Debug)]
pub struct StreamDecoder<M> {
    buf: BytesMut,
    _marker: PhantomData<M>,
}

impl<M: Message + Default> StreamDecoder<M> {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            _marker: PhantomData,
        }
    }

    /// Appends a chunk and drains every frame that is now complete.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<M>, FramingError> {
        self.buf.extend_from_slice(chunk);
        let mut decoded = Vec::new();
        while let Some((len, header_len)) = read_varint(&self.buf)? {
            if len > MAX_FRAME_SIZE {
                return Err(FramingError::FrameTooLarge(len));
            }
            let frame_len = header_len + len as usize;
            if self.buf.len() < frame_len {
                break;
            }
            self.buf.advance(header_len);
            let payload = self.buf.split_to(len as usize).freeze();
            decoded.push(M::decode(payload)?);
        }
        Ok(decoded)
    }

    /// Validates that the upstream ended on a frame boundary.
    pub fn finish(&self) -> Result<(), FramingError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(FramingError::Truncated {
                buffered: self.buf.len(),
            })
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl<M: Message + Default> Default for StreamDecoder<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads a varint from the front of `buf` without consuming it.
///
/// Returns `Ok(None)` when the buffer ends inside the varint.
fn read_varint(buf: &[u8]) -> Result<Option<(u64, usize)>, FramingError> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (index, byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return Err(FramingError::VarintOverflow);
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        shift += 7;
    }
    Ok(None)
}
