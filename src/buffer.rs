//! Growable byte buffer with a consume cursor.
//!
//! `IoBuffer` backs every socket's read and write side: producers append at
//! the tail, consumers take from the head, and the storage block is reused
//! by sliding the window back to the front instead of reallocating.

const MIN_BLOCK_SIZE: usize = 32;

#[derive(Default)]
pub struct IoBuffer {
    block: Vec<u8>,
    begin: usize,
    end: usize,
}

impl IoBuffer {
    pub fn new() -> Self {
        IoBuffer::default()
    }

    /// Bytes currently readable.
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// The readable window.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.block[self.begin..self.end]
    }

    pub fn clear(&mut self) {
        self.begin = 0;
        self.end = 0;
    }

    /// Appends `data` at the tail, growing the block as needed.
    pub fn append(&mut self, data: &[u8]) {
        let room = self.prepare(data.len());
        room[..data.len()].copy_from_slice(data);
        self.commit(data.len());
    }

    /// Drops `n` bytes from the head. The cursor snaps back to the front of
    /// the block once the buffer drains empty.
    pub fn consume(&mut self, n: usize) {
        self.begin = (self.begin + n).min(self.end);
        if self.begin >= self.end {
            self.begin = 0;
            self.end = 0;
        }
    }

    /// Copies exactly `out.len()` bytes to `out` and consumes them. Returns
    /// 0 without touching the buffer when fewer bytes are available.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        if self.len() < out.len() {
            return 0;
        }
        out.copy_from_slice(&self.block[self.begin..self.begin + out.len()]);
        self.consume(out.len());
        out.len()
    }

    /// Copies up to `out.len()` bytes starting at `pos` without consuming.
    pub fn copy(&self, out: &mut [u8], pos: usize) -> usize {
        let sz = self.len();
        if pos >= sz {
            return 0;
        }
        let n = (sz - pos).min(out.len());
        out[..n].copy_from_slice(&self.block[self.begin + pos..self.begin + pos + n]);
        n
    }

    /// Makes room for `n` more bytes and returns the writable tail. Bytes
    /// become readable only after [`commit`](IoBuffer::commit).
    pub fn prepare(&mut self, n: usize) -> &mut [u8] {
        self.reserve(self.len() + n);
        let end = self.end;
        &mut self.block[end..end + n]
    }

    /// Marks `n` prepared bytes as readable.
    pub fn commit(&mut self, n: usize) {
        self.end = (self.end + n).min(self.block.len());
    }

    /// Reads once from `r` into a prepared region of `increment` bytes.
    pub fn read_from<R: std::io::Read>(
        &mut self,
        r: &mut R,
        increment: usize,
    ) -> std::io::Result<usize> {
        let room = self.prepare(increment);
        let n = r.read(room)?;
        self.commit(n);
        Ok(n)
    }

    fn reserve(&mut self, n: usize) {
        let capacity = self.block.len() - self.begin;
        if capacity >= n {
            return;
        }
        let sz = self.len();
        if self.begin > 0 {
            // The window always slides back to the front first; growing
            // with a displaced window would leave the tail past the block.
            self.block.copy_within(self.begin..self.end, 0);
            self.begin = 0;
            self.end = sz;
            if self.block.len() >= n {
                return;
            }
        }
        let mut new_size = self.block.len().max(MIN_BLOCK_SIZE);
        while new_size < n {
            new_size *= 2;
        }
        self.block.resize(new_size, 0);
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("len", &self.len())
            .field("capacity", &(self.block.len() - self.begin))
            .finish()
    }
}
