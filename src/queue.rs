use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

pub const DEFAULT_CAPACITY: usize = 1000;

struct Inner<T> {
    deq: VecDeque<T>,
    closed: bool,
}

/// Bounded blocking deque shared by the worker pool and the reactor's
/// completion channel.
///
/// Two condvars stand in for the classic pair of counting permits: one for
/// free slots (producers), one for available items (consumers). Mutations
/// hold the lock only for the O(1) deque operation, never across I/O.
/// `close()` wakes every waiter immediately; producers then fail, consumers
/// drain the remainder and get `None`.
pub struct BlockingQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T> BlockingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(Inner {
                deq: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().deq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().deq.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().unwrap().deq.len() >= self.capacity
    }

    /// Block until a slot frees up, then enqueue at the back.
    pub fn push_back(&self, item: T) -> Result<()> {
        self.push_with(item, VecDeque::push_back)
    }

    /// Block until a slot frees up, then enqueue at the front.
    pub fn push_front(&self, item: T) -> Result<()> {
        self.push_with(item, VecDeque::push_front)
    }

    fn push_with(&self, item: T, insert: fn(&mut VecDeque<T>, T)) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        while inner.deq.len() >= self.capacity && !inner.closed {
            inner = self.not_full.wait(inner).unwrap();
        }
        if inner.closed {
            return Err(Error::QueueClosed);
        }
        insert(&mut inner.deq, item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Block until an item is available. `None` once the queue is closed
    /// and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.deq.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Block up to `timeout` for an item; `None` on expiry or after close.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.deq.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.not_empty.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    /// Drop all queued items immediately.
    pub fn clear(&self) {
        self.inner.lock().unwrap().deq.clear();
        self.not_full.notify_all();
    }

    /// Close the queue and wake every blocked producer and consumer.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

impl<T: Clone> BlockingQueue<T> {
    /// Non-blocking snapshot of the head.
    pub fn front(&self) -> Option<T> {
        self.inner.lock().unwrap().deq.front().cloned()
    }

    /// Non-blocking snapshot of the tail.
    pub fn back(&self) -> Option<T> {
        self.inner.lock().unwrap().deq.back().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_and_lifo_ends() {
        let q = BlockingQueue::new(8);
        q.push_back(1).unwrap();
        q.push_back(2).unwrap();
        q.push_front(0).unwrap();
        assert_eq!(q.front(), Some(0));
        assert_eq!(q.back(), Some(2));
        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
    }

    #[test]
    fn timed_pop_expires_then_succeeds() {
        let q: Arc<BlockingQueue<u32>> = Arc::new(BlockingQueue::new(4));

        let start = Instant::now();
        assert_eq!(q.pop_timeout(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));

        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.push_back(9).unwrap();
            })
        };
        assert_eq!(q.pop_timeout(Duration::from_secs(2)), Some(9));
        producer.join().unwrap();
    }

    #[test]
    fn size_never_exceeds_capacity_under_contention() {
        let q: Arc<BlockingQueue<usize>> = Arc::new(BlockingQueue::new(4));
        let mut handles = Vec::new();

        for t in 0..4 {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    q.push_back(t * 100 + i).unwrap();
                }
            }));
        }

        let consumer = {
            let q = q.clone();
            thread::spawn(move || {
                let mut got = 0;
                while got < 400 {
                    assert!(q.len() <= q.capacity());
                    if q.pop_timeout(Duration::from_secs(2)).is_some() {
                        got += 1;
                    }
                }
                got
            })
        };

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(consumer.join().unwrap(), 400);
        assert!(q.is_empty());
    }

    #[test]
    fn close_wakes_blocked_popper() {
        let q: Arc<BlockingQueue<u8>> = Arc::new(BlockingQueue::new(2));
        let waiter = {
            let q = q.clone();
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(waiter.join().unwrap(), None);
        assert!(matches!(q.push_back(1), Err(Error::QueueClosed)));
    }

    #[test]
    fn close_drains_remaining_items_first() {
        let q = BlockingQueue::new(4);
        q.push_back('a').unwrap();
        q.close();
        assert_eq!(q.pop(), Some('a'));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn full_queue_blocks_producer_until_pop() {
        let q: Arc<BlockingQueue<u8>> = Arc::new(BlockingQueue::new(1));
        q.push_back(1).unwrap();
        let producer = {
            let q = q.clone();
            thread::spawn(move || q.push_back(2))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.pop(), Some(1));
        producer.join().unwrap().unwrap();
        assert_eq!(q.pop(), Some(2));
    }
}
