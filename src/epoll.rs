use std::io;
use std::os::fd::RawFd;

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EPOLLET: u32 = libc::EPOLLET as u32;
pub const EPOLLONESHOT: u32 = libc::EPOLLONESHOT as u32;

/// Ownership wrapper over one epoll instance plus its ready-event array.
/// Only the reactor thread calls into it; workers hand their interest
/// decisions back over the completion queue instead.
pub struct Epoller {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
}

impl Epoller {
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events],
        })
    }

    pub fn add_fd(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub fn mod_fd(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn del_fd(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Deleting an fd the kernel already dropped is not a failure.
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until ready events exist or `timeout_ms` elapses (-1 blocks
    /// indefinitely). Returns the ready count; EINTR counts as zero events.
    pub fn wait(&mut self, timeout_ms: i32) -> io::Result<usize> {
        let rc = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(rc as usize)
    }

    /// Fd of the i-th ready event from the last `wait`.
    pub fn event_fd(&self, i: usize) -> RawFd {
        self.events[i].u64 as RawFd
    }

    /// Readiness mask of the i-th ready event from the last `wait`.
    pub fn events(&self, i: usize) -> u32 {
        self.events[i].events
    }
}

impl Drop for Epoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
