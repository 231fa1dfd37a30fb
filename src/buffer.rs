use std::io;
use std::os::fd::RawFd;

/// Fixed reserve in front of the read cursor, so a header can be prepended
/// without moving live bytes.
const PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;

/// Size of the stack-allocated overflow region used by [`Buffer::read_fd`].
const EXTRA_SIZE: usize = 64 * 1024;

/// Linear byte buffer with prepend/read/write regions.
///
/// Layout invariant: `PREPEND <= read_pos <= write_pos <= store.len()`.
/// The readable region is `[read_pos, write_pos)`; appends land at
/// `write_pos` and grow the store when the tail runs out. The workload is
/// read-until-delimiter / write-until-drained, so a plain linear buffer
/// with in-place compaction beats a ring.
pub struct Buffer {
    store: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            store: vec![0; PREPEND + INITIAL_SIZE],
            read_pos: PREPEND,
            write_pos: PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn writable_bytes(&self) -> usize {
        self.store.len() - self.write_pos
    }

    pub fn prepend_bytes(&self) -> usize {
        self.read_pos
    }

    /// Readable region without consuming it. Stays valid until the next
    /// `retrieve`/`append`.
    pub fn peek(&self) -> &[u8] {
        &self.store[self.read_pos..self.write_pos]
    }

    /// Advance the read cursor by `n` readable bytes. Retrieving everything
    /// snaps both cursors back to the prepend boundary.
    pub fn retrieve(&mut self, n: usize) {
        debug_assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.read_pos += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_pos = PREPEND;
        self.write_pos = PREPEND;
    }

    pub fn retrieve_bytes(&mut self, n: usize) -> Vec<u8> {
        debug_assert!(n <= self.readable_bytes());
        let out = self.peek()[..n].to_vec();
        self.retrieve(n);
        out
    }

    pub fn retrieve_all_bytes(&mut self) -> Vec<u8> {
        let n = self.readable_bytes();
        self.retrieve_bytes(n)
    }

    /// Append always succeeds, growing the store as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.store[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    /// Guarantee at least `len` bytes of writable tail.
    ///
    /// If the free space on both sides already covers the request, live
    /// bytes are shifted down to the prepend boundary; otherwise the store
    /// is reallocated to exactly `write_pos + len`.
    pub fn ensure_writable(&mut self, len: usize) {
        if len > self.writable_bytes() {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Record `len` bytes written directly into the tail (after a raw read).
    pub fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable_bytes());
        self.write_pos += len;
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prepend_bytes() < len + PREPEND {
            self.store.resize(self.write_pos + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.store.copy_within(self.read_pos..self.write_pos, PREPEND);
            self.read_pos = PREPEND;
            self.write_pos = PREPEND + readable;
        }
    }

    /// Explicit shrink-to-fit: keep the readable bytes plus `reserve` of
    /// tail. The buffer never shrinks on its own.
    pub fn shrink(&mut self, reserve: usize) {
        let mut other = Buffer::new();
        other.ensure_writable(self.readable_bytes() + reserve);
        other.append(self.peek());
        *self = other;
    }

    /// Find the first occurrence of `delim` in the readable region. On a
    /// hit, consume and return the prefix before the delimiter; the
    /// delimiter itself is left for the caller. On a miss nothing is
    /// consumed.
    pub fn search(&mut self, delim: &[u8]) -> Option<Vec<u8>> {
        let at = memchr::memmem::find(self.peek(), delim)?;
        Some(self.retrieve_bytes(at))
    }

    /// One scatter read from `fd`: the writable tail plus a 64 KiB stack
    /// overflow region. Overflow beyond the tail is appended, forcing
    /// growth. Returns the total byte count; 0 means EOF.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_SIZE];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: self.store[self.write_pos..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: EXTRA_SIZE,
            },
        ];
        let n = unsafe { libc::readv(fd, iov.as_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.has_written(n);
        } else {
            self.has_written(writable);
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Write the whole readable region to `fd` in one call and retrieve
    /// exactly the bytes accepted; a partial write leaves the remainder for
    /// a later call.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_bytes();
        let n = unsafe {
            libc::write(
                fd,
                self.peek().as_ptr() as *const libc::c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.retrieve(n as usize);
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_buffer_invariants() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prepend_bytes(), PREPEND);
    }

    #[test]
    fn append_retrieve_accounting() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        buf.append(b" world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.peek(), b"world");

        buf.retrieve(5);
        assert_eq!(buf.readable_bytes(), 0);
        // Full drain resets cursors to the prepend boundary.
        assert_eq!(buf.prepend_bytes(), PREPEND);
    }

    #[test]
    fn growth_preserves_unread_bytes() {
        let mut buf = Buffer::new();
        let payload = vec![0xabu8; 700];
        buf.append(&payload);
        buf.retrieve(100);

        // Forces a reallocation: 1024 > 324 tail + 100 slack.
        buf.ensure_writable(INITIAL_SIZE);
        assert!(buf.writable_bytes() >= INITIAL_SIZE);
        assert_eq!(buf.peek(), &payload[100..]);
    }

    #[test]
    fn growth_compacts_in_place_when_slack_suffices() {
        let mut buf = Buffer::new();
        buf.append(&vec![1u8; 900]);
        buf.retrieve(800);
        let cap_before = buf.store.len();

        // 100 readable, tail 124 + slack 800 cover a request for 500.
        buf.ensure_writable(500);
        assert_eq!(buf.store.len(), cap_before);
        assert_eq!(buf.readable_bytes(), 100);
        assert_eq!(buf.prepend_bytes(), PREPEND);
    }

    #[test]
    fn search_consumes_prefix_only_on_hit() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost");
        assert!(buf.search(b"\r\r").is_none());
        assert_eq!(buf.readable_bytes(), 20);

        let line = buf.search(b"\r\n").unwrap();
        assert_eq!(line, b"GET / HTTP/1.1");
        // Delimiter itself stays put.
        assert_eq!(&buf.peek()[..2], b"\r\n");
    }

    #[test]
    fn pipe_roundtrip_through_descriptors() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        let mut out = Buffer::new();
        out.append(b"through the pipe");
        let sent = out.write_fd(wr).unwrap();
        assert_eq!(sent, 16);
        assert_eq!(out.readable_bytes(), 0);

        let mut inb = Buffer::new();
        let got = inb.read_fd(rd).unwrap();
        assert_eq!(got, 16);
        assert_eq!(inb.peek(), b"through the pipe");

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn descriptor_read_overflows_into_appended_region() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        // More than the initial 1 KiB tail in one shot.
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let n = unsafe {
            libc::write(wr, payload.as_ptr() as *const libc::c_void, payload.len())
        };
        assert_eq!(n as usize, payload.len());

        let mut buf = Buffer::new();
        let got = buf.read_fd(rd).unwrap();
        assert_eq!(got, payload.len());
        assert_eq!(buf.peek(), &payload[..]);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn shrink_keeps_readable_bytes() {
        let mut buf = Buffer::new();
        buf.append(&vec![7u8; 4000]);
        buf.retrieve(3990);
        buf.shrink(16);
        assert_eq!(buf.readable_bytes(), 10);
        assert_eq!(buf.peek(), &[7u8; 10]);
    }
}
