use crate::buffer::{BufferError, RecvBuffer};
use thiserror::Error;

/// Length prefix: payload size as u32 big-endian.
pub const HEADER_SIZE: usize = 4;
/// Largest payload accepted in either direction.
pub const MAX_PAYLOAD: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Payload (or declared payload) length above `MAX_PAYLOAD`. Connection-fatal when decoding.
    #[error("frame payload of {0} bytes exceeds {MAX_PAYLOAD}")]
    Overflow(usize),
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
}

/// Stateless codec for `[u32 big-endian length][payload]` frames.
pub struct MessageFramer;

impl MessageFramer {
    pub fn encode_header(payload_len: usize) -> Result<[u8; HEADER_SIZE], FrameError> {
        if payload_len > MAX_PAYLOAD {
            return Err(FrameError::Overflow(payload_len));
        }
        Ok((payload_len as u32).to_be_bytes())
    }

    /// Encode one frame into a new vec.
    pub fn encode(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        Self::encode_into(payload, &mut out)?;
        Ok(out)
    }

    /// Append one frame to `out`. `out` is untouched on error.
    pub fn encode_into(payload: &[u8], out: &mut Vec<u8>) -> Result<(), FrameError> {
        let header = Self::encode_header(payload.len())?;
        out.reserve(HEADER_SIZE + payload.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(payload);
        Ok(())
    }

    /// Pop one complete frame from `rb`.
    ///
    /// `Ok(None)` means more bytes are needed; nothing is consumed in that case, nor on `Overflow`,
    /// so a partial frame stays in place until the rest arrives.
    pub fn pop_frame(rb: &mut RecvBuffer) -> Result<Option<Frame>, FrameError> {
        let available = rb.len();
        if available < HEADER_SIZE {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_SIZE];
        rb.peek(&mut header)?;
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_PAYLOAD {
            return Err(FrameError::Overflow(len));
        }
        if available < HEADER_SIZE + len {
            return Ok(None);
        }
        rb.consume(HEADER_SIZE)?;
        let mut payload = vec![0u8; len];
        if len > 0 {
            let read = rb.read(&mut payload)?;
            if read != len {
                return Err(FrameError::Buffer(BufferError::InternalError));
            }
        }
        Ok(Some(Frame { payload }))
    }
}
