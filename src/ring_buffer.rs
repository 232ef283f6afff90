//! A fixed-capacity circular byte store that reassembles frames from notification chunks.
//!
//! Notifications arrive in arbitrary pieces, sometimes duplicated, sometimes corrupted. Bytes
//! are appended as they arrive and [`RingBuffer::try_extract_packet`] is called after every
//! append until it stops producing frames. When the buffer is full the oldest bytes are
//! overwritten: under overload fresh data wins over complete data.

use crate::codec::{END_MARKER, HEADER_LEN, START_MARKER, TRAILER_LEN};

/// The outcome of one extraction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extract {
    /// A complete frame, start marker through end marker, now removed from the buffer
    Frame(Vec<u8>),
    /// Not enough bytes yet
    Incomplete,
    /// The candidate start marker did not lead to an end marker; carries the byte found
    /// where the end marker belonged. One byte was discarded; call again.
    Corrupt(u8),
}

pub struct RingBuffer {
    data: Vec<u8>,
    head: usize,
    len: usize,
    overwritten: u64,
    discarded: u64,
}

impl RingBuffer {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity.max(1)],
            head: 0,
            len: 0,
            overwritten: 0,
            discarded: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Number of bytes lost to overwriting since creation
    pub fn overwrite_count(&self) -> u64 {
        self.overwritten
    }

    /// Number of bytes dropped while resynchronising since creation
    pub fn discarded_count(&self) -> u64 {
        self.discarded
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Append bytes, overwriting the oldest ones if there is no room.
    pub fn append(&mut self, bytes: &[u8]) {
        let capacity = self.capacity();
        for &b in bytes {
            let tail = (self.head + self.len) % capacity;
            self.data[tail] = b;
            if self.len == capacity {
                self.head = (self.head + 1) % capacity;
                self.overwritten += 1;
            } else {
                self.len += 1;
            }
        }
    }

    /// The byte at logical `offset` from the oldest byte.
    pub fn peek(&self, offset: usize) -> Option<u8> {
        if offset >= self.len {
            return None;
        }
        Some(self.data[(self.head + offset) % self.capacity()])
    }

    /// Copy `len` bytes starting at logical `offset` without consuming them.
    pub fn peek_range(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        if offset.checked_add(len)? > self.len {
            return None;
        }
        Some((offset..offset + len).filter_map(|i| self.peek(i)).collect())
    }

    /// Logical offset of the first occurrence of `byte`.
    pub fn find_byte(&self, byte: u8) -> Option<usize> {
        (0..self.len).find(|&i| self.peek(i) == Some(byte))
    }

    /// Logical offset of the first occurrence of `pattern`.
    pub fn find_pattern(&self, pattern: &[u8]) -> Option<usize> {
        if pattern.is_empty() || pattern.len() > self.len {
            return None;
        }
        (0..=self.len - pattern.len()).find(|&start| {
            pattern
                .iter()
                .enumerate()
                .all(|(i, &b)| self.peek(start + i) == Some(b))
        })
    }

    /// Drop up to `n` of the oldest bytes. Returns how many were dropped.
    pub fn remove_bytes(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        self.head = (self.head + n) % self.capacity();
        self.len -= n;
        n
    }

    /// Return `len` bytes starting at logical `offset`, consuming everything up to their end.
    pub fn extract_range(&mut self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let bytes = self.peek_range(offset, len)?;
        self.remove_bytes(offset + len);
        Some(bytes)
    }

    /// Attempt to pull one complete frame from the front of the buffer.
    ///
    /// Junk ahead of the first start marker is discarded. A frame is only removed once every
    /// byte of it, end marker included, is present.
    pub fn try_extract_packet(&mut self) -> Extract {
        match self.find_byte(START_MARKER) {
            Some(0) => {}
            Some(junk) => self.discard(junk),
            None => {
                let junk = self.len;
                self.discard(junk);
                return Extract::Incomplete;
            }
        }

        if self.len < HEADER_LEN {
            return Extract::Incomplete;
        }

        let length = self.peek(3).unwrap_or(0) as usize;
        let total = HEADER_LEN + length + TRAILER_LEN;
        if self.len < total {
            return Extract::Incomplete;
        }

        let end = self.peek(total - 1).unwrap_or(0);
        if end != END_MARKER {
            log::warn!(
                "Frame corrupt: 0x{end:02x} at offset {} instead of end marker, dropping start marker",
                total - 1
            );
            self.discard(1);
            return Extract::Corrupt(end);
        }

        match self.extract_range(0, total) {
            Some(frame) => Extract::Frame(frame),
            None => Extract::Incomplete,
        }
    }

    fn discard(&mut self, n: usize) {
        let removed = self.remove_bytes(n);
        if removed > 0 {
            log::debug!("Discarded {removed} bytes while resynchronising");
        }
        self.discarded += removed as u64;
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
