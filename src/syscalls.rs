use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;

/// Create the listening socket: SO_LINGER (optional), SO_REUSEADDR, bind
/// to INADDR_ANY on `port`, listen, set non-blocking. Any failure here is
/// fatal to startup.
pub fn create_listen_socket(port: u16, linger: bool) -> io::Result<RawFd> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let opt_linger = libc::linger {
            l_onoff: linger as libc::c_int,
            l_linger: if linger { 1 } else { 0 },
        };
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &opt_linger as *const _ as *const libc::c_void,
            mem::size_of_val(&opt_linger) as libc::socklen_t,
        ) < 0
        {
            return Err(close_on_err(fd));
        }

        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            mem::size_of_val(&one) as libc::socklen_t,
        ) < 0
        {
            return Err(close_on_err(fd));
        }

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as libc::socklen_t,
        ) < 0
        {
            return Err(close_on_err(fd));
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            return Err(close_on_err(fd));
        }

        if let Err(e) = set_nonblocking(fd) {
            libc::close(fd);
            return Err(e);
        }
        Ok(fd)
    }
}

fn close_on_err(fd: RawFd) -> io::Error {
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    err
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Accept one pending connection. `Ok(None)` when the backlog is drained.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddrV4)>> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd = libc::accept(
            listen_fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        let peer = SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
            u16::from_be(addr.sin_port),
        );
        Ok(Some((fd, peer)))
    }
}

/// One-shot best-effort send, used for the "server busy" rejection before
/// the fd is closed.
pub fn send_bytes(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::send(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Gather write over up to two segments (header buffer + mapped file tail).
pub fn writev(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    debug_assert!(bufs.len() <= 2);
    let mut iovecs = [libc::iovec {
        iov_base: std::ptr::null_mut(),
        iov_len: 0,
    }; 2];
    for (iov, buf) in iovecs.iter_mut().zip(bufs) {
        iov.iov_base = buf.as_ptr() as *mut libc::c_void;
        iov.iov_len = buf.len();
    }
    let n = unsafe { libc::writev(fd, iovecs.as_ptr(), bufs.len() as libc::c_int) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Non-blocking pipe used to wake the reactor when a worker finishes a
/// task. Returns (read end, write end).
pub fn create_wake_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    for fd in fds {
        if let Err(e) = set_nonblocking(fd) {
            close_fd(fds[0]);
            close_fd(fds[1]);
            return Err(e);
        }
    }
    Ok((fds[0], fds[1]))
}

/// Nudge the reactor. A full pipe means wakeups are already pending, so
/// EAGAIN is fine.
pub fn wake(pipe_write_fd: RawFd) {
    unsafe {
        libc::write(pipe_write_fd, b"w".as_ptr() as *const libc::c_void, 1);
    }
}

/// Discard every pending wake byte.
pub fn drain_wake_pipe(pipe_read_fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe {
            libc::read(pipe_read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if n <= 0 {
            break;
        }
    }
}
