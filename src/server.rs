use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::conn::{ConnHandle, Interest};
use crate::epoll::{
    EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoller,
};
use crate::error::{Error, Result};
use crate::pool::WorkerPool;
use crate::queue::BlockingQueue;
use crate::store::UserStore;
use crate::syscalls;
use crate::timer::TimerHeap;

const MAX_EVENTS: usize = 1024;
/// Poll ceiling so the loop notices the shutdown flag even with no timers.
const IDLE_POLL_MS: u64 = 1000;

const BUSY_RESPONSE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\n\r\nserver busy";

/// Server configuration. CLI parsing lives outside this crate; callers
/// fill this in and hand it over.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// 0: both level-triggered, 1: connections edge-triggered, 2: listener
    /// edge-triggered, anything else: both edge-triggered.
    pub trig_mode: u8,
    /// Idle-connection eviction timeout; 0 disables the timer wheel.
    pub timeout_ms: u64,
    pub linger: bool,
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_connections: usize,
    pub root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            trig_mode: 3,
            timeout_ms: 60_000,
            linger: false,
            workers: num_cpus::get(),
            queue_capacity: 1000,
            max_connections: 65_536,
            root: PathBuf::from("./resources"),
        }
    }
}

struct Completion {
    fd: RawFd,
    generation: u64,
    interest: Interest,
}

/// The reactor. Owns the multiplexer, the timer heap, the worker pool and
/// the connection table; nothing else touches structural membership.
///
/// Each readiness event is turned into one task: the worker does the
/// socket I/O and parse/build work, then hands its interest decision back
/// over the completion queue and pokes the wake pipe. The busy flag on
/// every connection keeps it to one outstanding task at a time, so worker
/// buffer mutations are always published through the queue boundary before
/// the reactor re-arms the fd.
pub struct Server {
    cfg: Config,
    listen_fd: RawFd,
    listen_events: u32,
    conn_events: u32,
    epoller: Epoller,
    timer: TimerHeap,
    pool: WorkerPool,
    conns: HashMap<RawFd, Arc<ConnHandle>>,
    completions: Arc<BlockingQueue<Completion>>,
    wake_rd: RawFd,
    wake_wr: RawFd,
    next_generation: u64,
    expired: Rc<RefCell<Vec<(RawFd, u64)>>>,
    root: Arc<PathBuf>,
    store: Arc<dyn UserStore>,
    shutdown: Arc<AtomicBool>,
}

fn event_masks(trig_mode: u8) -> (u32, u32) {
    let mut listen = EPOLLRDHUP;
    let mut conn = EPOLLONESHOT | EPOLLRDHUP;
    match trig_mode {
        0 => {}
        1 => conn |= EPOLLET,
        2 => listen |= EPOLLET,
        _ => {
            listen |= EPOLLET;
            conn |= EPOLLET;
        }
    }
    (listen, conn)
}

impl Server {
    pub fn new(cfg: Config, store: Arc<dyn UserStore>) -> Result<Self> {
        if cfg.port < 1024 {
            return Err(Error::Startup(format!("port {} out of range", cfg.port)));
        }

        let (listen_events, conn_events) = event_masks(cfg.trig_mode);

        let listen_fd = syscalls::create_listen_socket(cfg.port, cfg.linger)
            .map_err(|e| Error::Startup(format!("listen on port {}: {e}", cfg.port)))?;

        let mut epoller = match Epoller::new(MAX_EVENTS) {
            Ok(ep) => ep,
            Err(e) => {
                syscalls::close_fd(listen_fd);
                return Err(Error::Startup(format!("epoll: {e}")));
            }
        };
        let startup = (|| {
            epoller.add_fd(listen_fd, listen_events | EPOLLIN)?;
            let pipe = syscalls::create_wake_pipe()?;
            epoller.add_fd(pipe.0, EPOLLIN)?;
            Ok::<_, std::io::Error>(pipe)
        })();
        let (wake_rd, wake_wr) = match startup {
            Ok(pipe) => pipe,
            Err(e) => {
                syscalls::close_fd(listen_fd);
                return Err(Error::Startup(format!("reactor setup: {e}")));
            }
        };

        info!(
            port = cfg.port,
            workers = cfg.workers,
            listen_mode = if listen_events & EPOLLET != 0 { "ET" } else { "LT" },
            conn_mode = if conn_events & EPOLLET != 0 { "ET" } else { "LT" },
            timeout_ms = cfg.timeout_ms,
            root = %cfg.root.display(),
            "server initialized"
        );

        Ok(Self {
            pool: WorkerPool::new(cfg.workers, cfg.queue_capacity),
            // One outstanding task per connection bounds pending
            // completions, so a worker can never block on this push.
            completions: Arc::new(BlockingQueue::new(cfg.max_connections)),
            root: Arc::new(cfg.root.clone()),
            cfg,
            listen_fd,
            listen_events,
            conn_events,
            epoller,
            timer: TimerHeap::new(),
            conns: HashMap::new(),
            wake_rd,
            wake_wr,
            next_generation: 0,
            expired: Rc::new(RefCell::new(Vec::new())),
            store,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag checked once per reactor iteration; flip it (e.g. from a
    /// signal handler) to stop the loop.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn connections(&self) -> usize {
        self.conns.len()
    }

    /// Drive the reactor until the shutdown flag flips.
    pub fn run(&mut self) -> Result<()> {
        info!("server started");
        while !self.shutdown.load(Ordering::Acquire) {
            let timeout = if self.cfg.timeout_ms > 0 {
                let next = self.timer.next_tick();
                self.reap_expired();
                next.unwrap_or(IDLE_POLL_MS)
            } else {
                IDLE_POLL_MS
            };

            let ready = self.epoller.wait(timeout.min(IDLE_POLL_MS) as i32)?;
            for i in 0..ready {
                let fd = self.epoller.event_fd(i);
                let events = self.epoller.events(i);
                if fd == self.listen_fd {
                    self.accept_clients();
                } else if fd == self.wake_rd {
                    syscalls::drain_wake_pipe(self.wake_rd);
                } else if events & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
                    self.close_conn(fd);
                } else if events & EPOLLIN != 0 {
                    self.dispatch(fd, Interest::Read);
                } else if events & EPOLLOUT != 0 {
                    self.dispatch(fd, Interest::Write);
                } else {
                    warn!(fd, events, "unexpected event mask");
                }
            }
            self.drain_completions();
        }
        info!("server stopping");
        self.teardown();
        Ok(())
    }

    fn teardown(&mut self) {
        if self.listen_fd < 0 {
            return;
        }
        syscalls::close_fd(self.listen_fd);
        self.listen_fd = -1;
        self.pool.shutdown();
        self.drain_completions();
        self.completions.close();
        let fds: Vec<RawFd> = self.conns.keys().copied().collect();
        for fd in fds {
            self.close_conn(fd);
        }
        syscalls::close_fd(self.wake_rd);
        syscalls::close_fd(self.wake_wr);
        self.timer.clear();
    }

    fn accept_clients(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => {
                    if self.conns.len() >= self.cfg.max_connections {
                        warn!(fd, "connection table full, rejecting client");
                        let _ = syscalls::send_bytes(fd, BUSY_RESPONSE);
                        syscalls::close_fd(fd);
                    } else {
                        self.add_client(fd, peer);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
            if self.listen_events & EPOLLET == 0 {
                break;
            }
        }
    }

    fn add_client(&mut self, fd: RawFd, peer: std::net::SocketAddrV4) {
        if let Err(e) = syscalls::set_nonblocking(fd) {
            warn!(fd, error = %e, "set_nonblocking failed");
            syscalls::close_fd(fd);
            return;
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        let handle = Arc::new(ConnHandle::new(fd, peer, generation));
        self.conns.insert(fd, handle);
        self.arm_timer(fd, generation);
        if let Err(e) = self.epoller.add_fd(fd, self.conn_events | EPOLLIN) {
            warn!(fd, error = %e, "epoll registration failed");
            self.close_conn(fd);
            return;
        }
        info!(fd, peer = %peer, clients = self.conns.len(), "client in");
    }

    /// Insert or refresh the idle timer for (fd, generation). The eviction
    /// callback only records the pair; the reactor closes the fd itself
    /// right after `tick`, so callbacks never block or touch the table.
    fn arm_timer(&mut self, fd: RawFd, generation: u64) {
        if self.cfg.timeout_ms == 0 {
            return;
        }
        let expired = self.expired.clone();
        self.timer.add(
            fd as u64,
            Duration::from_millis(self.cfg.timeout_ms),
            Box::new(move || expired.borrow_mut().push((fd, generation))),
        );
    }

    fn reap_expired(&mut self) {
        let expired = self.expired.take();
        for (fd, generation) in expired {
            let Some(handle) = self.conns.get(&fd) else {
                continue;
            };
            if handle.generation != generation {
                continue;
            }
            if handle.busy.load(Ordering::Acquire) {
                // A task is mid-flight; give it one more timer round.
                self.arm_timer(fd, generation);
                continue;
            }
            debug!(fd, "idle timeout, evicting");
            self.close_conn(fd);
        }
    }

    fn dispatch(&mut self, fd: RawFd, kind: Interest) {
        let Some(handle) = self.conns.get(&fd) else {
            return;
        };
        // One outstanding task per connection; readiness seen while a
        // task runs is dropped and recreated by the re-arm.
        if handle.busy.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = handle.clone();
        let generation = handle.generation;
        self.arm_timer(fd, generation);

        let completions = self.completions.clone();
        let wake_wr = self.wake_wr;
        let root = self.root.clone();
        let store = self.store.clone();
        let edge = self.conn_events & EPOLLET != 0;

        let spawned = self.pool.spawn(move || {
            let interest = run_task(&handle, kind, edge, &root, store.as_ref());
            let ok = completions
                .push_back(Completion {
                    fd: handle.fd,
                    generation,
                    interest,
                })
                .is_ok();
            if ok {
                syscalls::wake(wake_wr);
            }
        });
        if spawned.is_err() {
            // Pool already shut down; the teardown path closes the fd.
            debug!(fd, "dispatch after pool shutdown");
        }
    }

    fn drain_completions(&mut self) {
        while let Some(c) = self.completions.pop_timeout(Duration::ZERO) {
            self.handle_completion(c);
        }
    }

    fn handle_completion(&mut self, c: Completion) {
        let Some(handle) = self.conns.get(&c.fd) else {
            return; // Stale task for an fd that was already recycled.
        };
        if handle.generation != c.generation {
            return;
        }
        handle.busy.store(false, Ordering::Release);
        self.arm_timer(c.fd, c.generation);
        let rearm = match c.interest {
            Interest::Read => self.epoller.mod_fd(c.fd, self.conn_events | EPOLLIN),
            Interest::Write => self.epoller.mod_fd(c.fd, self.conn_events | EPOLLOUT),
            Interest::Close => {
                self.close_conn(c.fd);
                return;
            }
        };
        if let Err(e) = rearm {
            warn!(fd = c.fd, error = %e, "re-arm failed");
            self.close_conn(c.fd);
        }
    }

    fn close_conn(&mut self, fd: RawFd) {
        let Some(handle) = self.conns.remove(&fd) else {
            return;
        };
        self.timer.remove(fd as u64);
        let _ = self.epoller.del_fd(fd);
        handle.inner.lock().unwrap().close();
        info!(fd, clients = self.conns.len(), "client out");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Worker side of one dispatched readiness event: the socket I/O, the
/// parse/build work, and the interest decision handed back to the reactor.
fn run_task(
    handle: &ConnHandle,
    kind: Interest,
    edge: bool,
    root: &Path,
    store: &dyn UserStore,
) -> Interest {
    let mut conn = handle.inner.lock().unwrap();
    match kind {
        Interest::Read => match conn.read(edge) {
            Err(e) => {
                debug!(fd = handle.fd, error = %e, "read failed");
                Interest::Close
            }
            Ok((0, true)) => Interest::Close,
            Ok((_, eof)) => match conn.process(root, store) {
                Ok(true) => Interest::Write,
                Ok(false) if eof => Interest::Close,
                Ok(false) => Interest::Read,
                Err(e) => {
                    // Protocol error: close with no response.
                    debug!(fd = handle.fd, error = %e, "bad request");
                    Interest::Close
                }
            },
        },
        Interest::Write => match conn.write(edge) {
            Err(e) => {
                debug!(fd = handle.fd, error = %e, "write failed");
                Interest::Close
            }
            Ok(_) => {
                if conn.bytes_to_send() > 0 {
                    Interest::Write
                } else if conn.keep_alive() {
                    conn.finish_exchange();
                    Interest::Read
                } else {
                    Interest::Close
                }
            }
        },
        Interest::Close => Interest::Close,
    }
}
