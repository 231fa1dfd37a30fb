use std::io;
use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;

use tracing::debug;

use crate::buffer::Buffer;
use crate::error::Result;
use crate::request::Request;
use crate::response::{MappedFile, Response};
use crate::store::UserStore;
use crate::syscalls;

/// Per-socket state: buffers, parser, response leftovers. Owned by a
/// [`ConnHandle`]; the reactor controls membership, a single worker at a
/// time mutates the contents.
pub struct Conn {
    fd: RawFd,
    peer: SocketAddrV4,
    read_buf: Buffer,
    write_buf: Buffer,
    request: Request,
    file: Option<MappedFile>,
    file_sent: usize,
    keep_alive: bool,
    closed: bool,
}

/// What a finished task asks the reactor to do with the fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Re-arm read interest and wait for more request bytes.
    Read,
    /// Re-arm write interest; response bytes remain.
    Write,
    /// Destroy the connection.
    Close,
}

/// Shared handle stored in the connection table and cloned into worker
/// closures. The busy flag enforces at most one outstanding task per
/// connection; the generation lets the reactor spot completions for an fd
/// that was already recycled.
pub struct ConnHandle {
    pub fd: RawFd,
    pub generation: u64,
    pub busy: AtomicBool,
    pub inner: Mutex<Conn>,
}

impl ConnHandle {
    pub fn new(fd: RawFd, peer: SocketAddrV4, generation: u64) -> Self {
        Self {
            fd,
            generation,
            busy: AtomicBool::new(false),
            inner: Mutex::new(Conn::new(fd, peer)),
        }
    }
}

impl Conn {
    fn new(fd: RawFd, peer: SocketAddrV4) -> Self {
        Self {
            fd,
            peer,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            request: Request::new(),
            file: None,
            file_sent: 0,
            keep_alive: false,
            closed: false,
        }
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Response bytes not yet on the wire: buffered headers plus the
    /// unsent tail of the mapped file.
    pub fn bytes_to_send(&self) -> usize {
        let file_left = self
            .file
            .as_ref()
            .map_or(0, |f| f.len() - self.file_sent);
        self.write_buf.readable_bytes() + file_left
    }

    /// Drain the socket into the read buffer. Under edge-triggering the
    /// loop continues until EAGAIN. Returns (bytes read, peer hung up).
    pub fn read(&mut self, edge_triggered: bool) -> io::Result<(usize, bool)> {
        let mut total = 0;
        loop {
            match self.read_buf.read_fd(self.fd) {
                Ok(0) => return Ok((total, true)),
                Ok(n) => {
                    total += n;
                    if !edge_triggered {
                        return Ok((total, false));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok((total, false)),
                Err(e) => return Err(e),
            }
        }
    }

    /// Flush buffered headers and the mapped file through one gather write
    /// per iteration, advancing past whatever the kernel accepted. A
    /// partial write leaves the remainder for the next readiness event.
    pub fn write(&mut self, edge_triggered: bool) -> io::Result<usize> {
        let mut total = 0;
        loop {
            if self.bytes_to_send() == 0 {
                return Ok(total);
            }
            let head = self.write_buf.peek();
            let tail = self
                .file
                .as_ref()
                .map_or(&[][..], |f| &f.as_slice()[self.file_sent..]);
            let n = match syscalls::writev(self.fd, &[head, tail]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) => return Err(e),
            };
            total += n;
            let from_buf = n.min(self.write_buf.readable_bytes());
            self.write_buf.retrieve(from_buf);
            self.file_sent += n - from_buf;

            if !edge_triggered {
                return Ok(total);
            }
        }
    }

    /// Run the parser over buffered bytes and, when a request completed,
    /// build its response. `Ok(true)` means response bytes are ready;
    /// `Ok(false)` means more request bytes are needed first. Protocol
    /// errors bubble up for the orchestrator to close on.
    pub fn process(&mut self, root: &Path, store: &dyn UserStore) -> Result<bool> {
        if !self.request.parse(&mut self.read_buf, store)? {
            return Ok(false);
        }
        self.keep_alive = self.request.is_keep_alive();

        let mut response = Response::new(root, self.request.path(), self.keep_alive, None);
        response.build(&mut self.write_buf);
        // Supersedes any previous mapping, which unmaps on drop.
        self.file = response.take_file();
        self.file_sent = 0;
        debug!(fd = self.fd, code = response.code(), pending = self.bytes_to_send(), "response ready");
        Ok(true)
    }

    /// Reset per-request state for the next exchange on a keep-alive
    /// connection. Leftover buffered bytes are dropped: only one in-flight
    /// request per connection is supported.
    pub fn finish_exchange(&mut self) {
        self.request = Request::new();
        self.file = None;
        self.file_sent = 0;
        self.read_buf.retrieve_all();
        self.write_buf.retrieve_all();
    }

    /// Release the fd. Safe to call once; the reactor is the only caller.
    pub fn close(&mut self) {
        if !self.closed {
            debug!(fd = self.fd, peer = %self.peer, "connection closed");
            syscalls::close_fd(self.fd);
            self.closed = true;
        }
        self.file = None;
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        // Backstop: the orchestrator normally closed us already.
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::fs;
    use std::net::Ipv4Addr;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn peer() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 12345)
    }

    fn read_all(fd: RawFd, want: usize) -> Vec<u8> {
        let mut out = vec![0u8; want];
        let mut got = 0;
        while got < want {
            let n = unsafe {
                libc::read(
                    fd,
                    out[got..].as_mut_ptr() as *mut libc::c_void,
                    want - got,
                )
            };
            assert!(n > 0);
            got += n as usize;
        }
        out
    }

    #[test]
    fn full_request_response_exchange() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"<p>welcome</p>").unwrap();
        let store = MemoryStore::new();

        let (client, server) = socketpair();
        let mut conn = Conn::new(server, peer());

        let req = b"GET /index HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";
        let n = unsafe {
            libc::write(client, req.as_ptr() as *const libc::c_void, req.len())
        };
        assert_eq!(n as usize, req.len());

        let (got, eof) = conn.read(false).unwrap();
        assert_eq!(got, req.len());
        assert!(!eof);

        assert!(conn.process(dir.path(), &store).unwrap());
        assert!(conn.keep_alive());
        let pending = conn.bytes_to_send();
        assert!(pending > 14);

        let sent = conn.write(true).unwrap();
        assert_eq!(sent, pending);
        assert_eq!(conn.bytes_to_send(), 0);

        let raw = read_all(client, sent);
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("<p>welcome</p>"));

        conn.finish_exchange();
        assert_eq!(conn.bytes_to_send(), 0);

        conn.close();
        syscalls::close_fd(client);
    }

    #[test]
    fn incomplete_request_reports_need_more() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let (client, server) = socketpair();
        let mut conn = Conn::new(server, peer());

        let part = b"GET /index HTT";
        unsafe {
            libc::write(client, part.as_ptr() as *const libc::c_void, part.len());
        }
        conn.read(false).unwrap();
        assert!(!conn.process(dir.path(), &store).unwrap());

        conn.close();
        syscalls::close_fd(client);
    }

    #[test]
    fn read_detects_peer_hangup() {
        let (client, server) = socketpair();
        let mut conn = Conn::new(server, peer());
        syscalls::close_fd(client);
        let (n, eof) = conn.read(false).unwrap();
        assert_eq!(n, 0);
        assert!(eof);
        conn.close();
    }
}
