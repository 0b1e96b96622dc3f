use crate::ring_buffer::RingBuffer;
use std::marker::PhantomData;
use thiserror::Error;

/// Errors returned by `RecvBuffer` / `SendBuffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer is not open")]
    NotOpen,
    #[error("invalid arguments")]
    InvalidArgs,
    /// The write does not fit in the free space. Nothing was written.
    #[error("buffer overflow")]
    Overflow,
    /// Nothing to read, or asked to consume more than is readable.
    #[error("buffer underflow")]
    Underflow,
    #[error("internal buffer error")]
    InternalError,
}

/// Marker for the inbound direction (socket -> protocol).
pub struct Inbound;
/// Marker for the outbound direction (protocol -> socket).
pub struct Outbound;

/// `StreamBuffer` wraps a `RingBuffer` with an open/closed lifecycle and strict write semantics:
/// a write either fits completely or fails with `Overflow`, it is never truncated.
///
/// The direction marker only keeps a recv buffer from being passed where a send buffer is expected.
/// Use the `RecvBuffer` / `SendBuffer` aliases.
pub struct StreamBuffer<Dir> {
    ring: RingBuffer,
    open: bool,
    _dir: PhantomData<Dir>,
}

pub type RecvBuffer = StreamBuffer<Inbound>;
pub type SendBuffer = StreamBuffer<Outbound>;

impl<Dir> StreamBuffer<Dir> {
    /// Create a closed buffer with a fixed capacity. Call `open` before use.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RingBuffer::new(capacity),
            open: false,
            _dir: PhantomData,
        }
    }

    /// Open an empty buffer. Fails with `InternalError` if already open or the capacity is 0.
    pub fn open(&mut self) -> Result<(), BufferError> {
        if self.open || self.ring.capacity() == 0 {
            return Err(BufferError::InternalError);
        }
        self.ring.reset();
        self.open = true;
        Ok(())
    }

    /// Discard all contents, keeping the buffer open.
    pub fn reset(&mut self) -> Result<(), BufferError> {
        self.check_open()?;
        self.ring.reset();
        Ok(())
    }

    /// Discard all contents and close. Idempotent.
    pub fn close(&mut self) {
        self.ring.reset();
        self.open = false;
    }

    /// Read up to `dst.len()` bytes. A short read is not an error; an empty buffer is `Underflow`.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize, BufferError> {
        self.check_readable(dst)?;
        Ok(self.ring.read(dst))
    }

    /// Same as `read` without advancing.
    pub fn peek(&self, dst: &mut [u8]) -> Result<usize, BufferError> {
        self.check_readable(dst)?;
        Ok(self.ring.peek(dst))
    }

    /// Drop exactly `len` readable bytes. Asking for more than is readable is `Underflow`.
    pub fn consume(&mut self, len: usize) -> Result<(), BufferError> {
        self.check_open()?;
        if len > self.ring.data_space() {
            return Err(BufferError::Underflow);
        }
        self.ring.consume(len);
        Ok(())
    }

    /// Append all of `src` or nothing.
    pub fn write(&mut self, src: &[u8]) -> Result<usize, BufferError> {
        self.check_open()?;
        if src.is_empty() {
            return Err(BufferError::InvalidArgs);
        }
        if src.len() > self.ring.free_space() {
            return Err(BufferError::Overflow);
        }
        let written = self.ring.write(src);
        if written != src.len() {
            return Err(BufferError::InternalError);
        }
        Ok(written)
    }

    /// Readable bytes as two contiguous slices without copying.
    pub fn as_slices(&self) -> Result<(&[u8], &[u8]), BufferError> {
        self.check_open()?;
        Ok(self.ring.as_slices())
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Readable bytes; 0 when closed.
    pub fn len(&self) -> usize {
        if self.open {
            self.ring.data_space()
        } else {
            0
        }
    }

    /// Writable bytes; 0 when closed.
    pub fn free_space(&self) -> usize {
        if self.open {
            self.ring.free_space()
        } else {
            0
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_empty(&self) -> bool {
        !self.open || self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.open && self.ring.is_full()
    }

    fn check_open(&self) -> Result<(), BufferError> {
        if self.open {
            Ok(())
        } else {
            Err(BufferError::NotOpen)
        }
    }

    fn check_readable(&self, dst: &[u8]) -> Result<(), BufferError> {
        self.check_open()?;
        if dst.is_empty() {
            return Err(BufferError::InvalidArgs);
        }
        if self.ring.is_empty() {
            return Err(BufferError::Underflow);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_not_open() {
        let mut rb = RecvBuffer::new(16);
        let mut out = [0u8; 4];
        assert_eq!(rb.write(b"abc"), Err(BufferError::NotOpen));
        assert_eq!(rb.read(&mut out), Err(BufferError::NotOpen));
        assert_eq!(rb.peek(&mut out), Err(BufferError::NotOpen));
        assert_eq!(rb.consume(1), Err(BufferError::NotOpen));
        assert_eq!(rb.reset(), Err(BufferError::NotOpen));
        assert_eq!(rb.len(), 0);
        assert_eq!(rb.free_space(), 0);
        assert!(rb.is_empty());
    }

    #[test]
    pub fn test_open_twice_and_zero_capacity() {
        let mut sb = SendBuffer::new(16);
        assert_eq!(sb.open(), Ok(()));
        assert_eq!(sb.open(), Err(BufferError::InternalError));
        let mut empty = SendBuffer::new(0);
        assert_eq!(empty.open(), Err(BufferError::InternalError));
    }

    #[test]
    pub fn test_write_overflow_is_all_or_nothing() {
        let mut sb = SendBuffer::new(8);
        sb.open().unwrap();
        assert_eq!(sb.write(b"12345"), Ok(5));
        assert_eq!(sb.write(b"6789"), Err(BufferError::Overflow));
        assert_eq!(sb.len(), 5);
        assert_eq!(sb.write(b"678"), Ok(3));
        assert!(sb.is_full());
    }

    #[test]
    pub fn test_invalid_args() {
        let mut rb = RecvBuffer::new(8);
        rb.open().unwrap();
        assert_eq!(rb.write(b""), Err(BufferError::InvalidArgs));
        rb.write(b"x").unwrap();
        assert_eq!(rb.read(&mut []), Err(BufferError::InvalidArgs));
        assert_eq!(rb.peek(&mut []), Err(BufferError::InvalidArgs));
    }

    #[test]
    pub fn test_underflow_and_short_read() {
        let mut rb = RecvBuffer::new(8);
        rb.open().unwrap();
        let mut out = [0u8; 8];
        assert_eq!(rb.read(&mut out), Err(BufferError::Underflow));
        rb.write(b"abc").unwrap();
        assert_eq!(rb.peek(&mut out), Ok(3));
        assert_eq!(rb.consume(4), Err(BufferError::Underflow));
        assert_eq!(rb.read(&mut out), Ok(3));
        assert_eq!(&out[..3], b"abc");
    }

    #[test]
    pub fn test_close_discards_and_reopen() {
        let mut rb = RecvBuffer::new(8);
        rb.open().unwrap();
        rb.write(b"abc").unwrap();
        rb.close();
        assert!(!rb.is_open());
        rb.close(); // idempotent
        rb.open().unwrap();
        assert!(rb.is_empty());
        assert_eq!(rb.free_space(), 8);
    }
}
