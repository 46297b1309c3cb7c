//! A growable byte buffer with a reserved prepend region and cheap
//! front-compaction, used for both a connection's input and output queues.
//!
//! Layout: `[ prependable | readable | writable ]`, with
//! `0 <= reader_index <= writer_index <= len(storage)`.

use std::io;
use std::os::fd::RawFd;

/// Always-available space before the readable region, matching the
/// original design's use for writing a length-prefix header in front of
/// already-buffered data without a second allocation. This crate has no
/// framing of its own, but callers building one on top get the same
/// cheap-prepend guarantee.
pub const PREPEND_SIZE: usize = 8;
const INITIAL_SIZE: usize = 1024;
/// Scatter-read overflow area: bounds a single `readFd` to at most two
/// underlying copies even when the kernel has much more than `writableBytes`
/// ready, without growing the primary buffer speculatively.
const EXTRA_BUFFER_SIZE: usize = 65536;

pub struct Buffer {
    storage: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            storage: vec![0u8; PREPEND_SIZE + INITIAL_SIZE],
            reader_index: PREPEND_SIZE,
            writer_index: PREPEND_SIZE,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// The unread bytes, as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.reader_index..self.writer_index]
    }

    /// Advances past `len` bytes without copying them out.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = PREPEND_SIZE;
        self.writer_index = PREPEND_SIZE;
    }

    /// Copies out and retires the first `len` readable bytes.
    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let result = self.as_slice()[..len].to_vec();
        self.retrieve(len);
        result
    }

    /// Copies out and retires every readable byte.
    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        let len = self.readable_bytes();
        self.retrieve_as_vec(len)
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let end = self.writer_index + data.len();
        self.storage[self.writer_index..end].copy_from_slice(data);
        self.writer_index = end;
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + PREPEND_SIZE {
            self.storage.resize(self.writer_index + len, 0);
        } else {
            // Slide the readable region back to the prepend boundary
            // instead of growing the allocation.
            let readable = self.readable_bytes();
            self.storage
                .copy_within(self.reader_index..self.writer_index, PREPEND_SIZE);
            self.reader_index = PREPEND_SIZE;
            self.writer_index = PREPEND_SIZE + readable;
        }
    }

    /// Scatter-reads from `fd` into the writable region, spilling into a
    /// stack-local overflow buffer for anything beyond it, then appending
    /// the overflow tail. Returns the number of bytes read, `0` on EOF, or
    /// an error (including `WouldBlock`).
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; EXTRA_BUFFER_SIZE];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: unsafe { self.storage.as_mut_ptr().add(self.writer_index) as *mut libc::c_void },
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra_buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra_buf.len(),
            },
        ];
        // Only use the second buffer when the first might not be enough;
        // still safe to always pass both, readv simply won't touch the
        // second if the first absorbs everything.
        let iov_count = if writable < EXTRA_BUFFER_SIZE { 2 } else { 1 };

        let n = syscall!(readv(fd, iov.as_mut_ptr(), iov_count))?;
        let n = n as usize;

        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.storage.len();
            let overflow = n - writable;
            self.append(&extra_buf[..overflow]);
        }
        Ok(n)
    }

    /// Writes as much of the readable region as the kernel will accept in
    /// one call. Caller retires the bytes actually written.
    pub fn write_fd(&self, fd: RawFd) -> io::Result<usize> {
        let data = self.as_slice();
        if data.is_empty() {
            return Ok(0);
        }
        let n = syscall!(write(fd, data.as_ptr() as *const libc::c_void, data.len()))?;
        Ok(n as usize)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_retrieve_all_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.retrieve_all_as_vec(), b"hello");
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn make_space_compacts_before_growing() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(3);
        let cap_before = buf.storage.len();
        // Small append after full retrieval should reuse the existing
        // allocation by compacting back to the prepend boundary.
        buf.append(b"xyz");
        assert_eq!(buf.storage.len(), cap_before);
        assert_eq!(buf.as_slice(), b"xyz");
    }

    #[test]
    fn growth_past_capacity_resizes() {
        let mut buf = Buffer::new();
        let big = vec![7u8; INITIAL_SIZE * 2];
        buf.append(&big);
        assert_eq!(buf.readable_bytes(), big.len());
        assert_eq!(buf.as_slice(), &big[..]);
    }

    #[test]
    fn retrieve_partial_advances_reader_index() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        buf.retrieve(6);
        assert_eq!(buf.as_slice(), b"world");
    }
}
