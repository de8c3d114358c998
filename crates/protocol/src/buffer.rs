//! Fixed-capacity byte FIFO used for socket rings and TLV staging.
//!
//! The storage never grows. Bytes are appended at `tail` and consumed at
//! `head`; [`Buffer::compact`] moves the unread window back to offset zero.
//! Invariant: `0 <= head <= tail <= size`.

use crate::error::{Error, Result};
use std::io::{self, Read, Write};

#[derive(Clone)]
pub struct Buffer {
    base: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl Buffer {
    /// Allocate a buffer with room for `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            base: vec![0u8; size].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// Build a buffer whose readable window is exactly `data`.
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            base: data.to_vec().into_boxed_slice(),
            head: 0,
            tail: data.len(),
        }
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.base.len()
    }

    /// Bytes waiting to be read.
    #[must_use]
    pub fn avail(&self) -> usize {
        self.tail - self.head
    }

    /// Room left after the tail.
    #[must_use]
    pub fn tailroom(&self) -> usize {
        self.base.len() - self.tail
    }

    /// Absolute offset of the tail, for later [`Buffer::patch`] calls.
    #[must_use]
    pub fn tail_offset(&self) -> usize {
        self.tail
    }

    /// The unread window `[head, tail)`.
    #[must_use]
    pub fn head(&self) -> &[u8] {
        &self.base[self.head..self.tail]
    }

    /// The writable window `[tail, size)`.
    pub fn tail_mut(&mut self) -> &mut [u8] {
        &mut self.base[self.tail..]
    }

    /// Append `data` at the tail.
    pub fn put(&mut self, data: &[u8]) -> Result<usize> {
        if data.len() > self.tailroom() {
            return Err(Error::InsufficientSpace);
        }
        self.base[self.tail..self.tail + data.len()].copy_from_slice(data);
        self.tail += data.len();
        Ok(data.len())
    }

    pub fn put_u8(&mut self, byte: u8) -> Result<usize> {
        self.put(&[byte])
    }

    /// Consume exactly `out.len()` bytes from the head.
    pub fn get(&mut self, out: &mut [u8]) -> Result<usize> {
        let n = self.peek(out)?;
        self.head += n;
        Ok(n)
    }

    /// Copy `out.len()` bytes from the head without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> Result<usize> {
        if out.len() > self.avail() {
            return Err(Error::InsufficientSpace);
        }
        out.copy_from_slice(&self.base[self.head..self.head + out.len()]);
        Ok(out.len())
    }

    /// Last byte written, if any.
    #[must_use]
    pub fn peek_tail(&self) -> Option<u8> {
        (self.tail > self.head).then(|| self.base[self.tail - 1])
    }

    /// Drop `n` bytes from the head.
    pub fn advance_head(&mut self, n: usize) -> Result<()> {
        if n > self.avail() {
            return Err(Error::InsufficientSpace);
        }
        self.head += n;
        Ok(())
    }

    /// Mark `n` bytes after the tail as written.
    pub fn advance_tail(&mut self, n: usize) -> Result<()> {
        if n > self.tailroom() {
            return Err(Error::InsufficientSpace);
        }
        self.tail += n;
        Ok(())
    }

    /// Overwrite already-written bytes at absolute `offset`.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset < self.head || offset + bytes.len() > self.tail {
            return Err(Error::InsufficientSpace);
        }
        self.base[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Move the unread window to offset zero.
    pub fn compact(&mut self) {
        if self.head == 0 {
            return;
        }
        self.base.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }

    /// Compact, then perform a single read into the tailroom.
    ///
    /// Returns the number of bytes read; zero means end of file.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        self.compact();
        if self.tailroom() == 0 {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "receive buffer full"));
        }
        let n = reader.read(self.tail_mut())?;
        self.tail += n;
        Ok(n)
    }

    /// Perform a single write of the unread window and consume what was sent.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let n = writer.write(self.head())?;
        self.head += n;
        Ok(n)
    }

    /// Take the unread window as an owned vector and empty the buffer.
    pub fn take(&mut self) -> Vec<u8> {
        let out = self.head().to_vec();
        self.clear();
        out
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size())
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish()
    }
}
