/// `RingBuffer` is a fixed-capacity circular byte store.
///
/// The arena is allocated once at construction. `write` never grows it: it copies as much as fits
/// and returns the number of bytes taken. `read`/`peek` copy out at most the readable bytes.
/// Copies that straddle the end of the arena are split into two contiguous slice copies.
///
/// When both cursors coincide the buffer is either empty or full; `full` tells them apart.
pub struct RingBuffer {
    buf: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    full: bool,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            full: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of readable bytes.
    pub fn data_space(&self) -> usize {
        if self.full {
            self.buf.len()
        } else if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            self.buf.len() - (self.read_pos - self.write_pos)
        }
    }

    /// Number of bytes that can be written before the buffer is full.
    pub fn free_space(&self) -> usize {
        self.buf.len() - self.data_space()
    }

    pub fn is_empty(&self) -> bool {
        !self.full && self.read_pos == self.write_pos
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Zero both cursors. Contents are discarded.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.full = false;
    }

    /// Copy as much of `src` as fits. Returns bytes written (0 when full).
    pub fn write(&mut self, src: &[u8]) -> usize {
        let cap = self.buf.len();
        let n = src.len().min(self.free_space());
        if n == 0 {
            return 0;
        }
        let first = n.min(cap - self.write_pos);
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&src[..first]);
        let rest = n - first;
        if rest > 0 {
            // wrapped: continue at the start of the arena.
            self.buf[..rest].copy_from_slice(&src[first..n]);
        }
        self.write_pos = (self.write_pos + n) % cap;
        if self.write_pos == self.read_pos {
            self.full = true;
        }
        n
    }

    /// Copy up to `dst.len()` readable bytes into `dst` and advance the read cursor.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst);
        if n > 0 {
            self.read_pos = (self.read_pos + n) % self.buf.len();
            self.full = false;
        }
        n
    }

    /// Same as `read` but leaves the read cursor untouched.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let (head, tail) = self.as_slices();
        let n = dst.len().min(head.len() + tail.len());
        if n == 0 {
            return 0;
        }
        let first = n.min(head.len());
        dst[..first].copy_from_slice(&head[..first]);
        if n > first {
            dst[first..n].copy_from_slice(&tail[..n - first]);
        }
        n
    }

    /// Drop up to `len` readable bytes. Dropping everything resets both cursors to 0.
    pub fn consume(&mut self, len: usize) {
        let available = self.data_space();
        if len == 0 || available == 0 {
            return;
        }
        if len >= available {
            self.reset();
            return;
        }
        self.read_pos = (self.read_pos + len) % self.buf.len();
        self.full = false;
    }

    /// The readable bytes as two contiguous slices: up to the end of the arena, then the wrapped part.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        if self.is_empty() {
            return (&[], &[]);
        }
        if self.write_pos > self.read_pos {
            (&self.buf[self.read_pos..self.write_pos], &[])
        } else {
            // wrapped, or full with cursors coinciding.
            (&self.buf[self.read_pos..], &self.buf[..self.write_pos])
        }
    }
}
