use std::collections::HashMap;
use std::time::{Duration, Instant};

pub type TimeoutCallback = Box<dyn FnMut()>;

struct TimerNode {
    id: u64,
    expire: Instant,
    cb: TimeoutCallback,
}

/// Array-backed binary min-heap of per-connection expiry timers, keyed by
/// connection id, with an id-to-index map kept consistent across every
/// sift. Touched only by the reactor thread; callbacks run synchronously
/// during `tick`/`do_work` and must not block.
#[derive(Default)]
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    index: HashMap<u64, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.index.contains_key(&id)
    }

    /// Insert a timer, or refresh expiry and callback when `id` already
    /// exists ("refresh on activity").
    pub fn add(&mut self, id: u64, timeout: Duration, cb: TimeoutCallback) {
        let expire = Instant::now() + timeout;
        match self.index.get(&id).copied() {
            Some(i) => {
                self.heap[i].expire = expire;
                self.heap[i].cb = cb;
                self.sift_down(i);
                self.sift_up(i);
            }
            None => {
                let i = self.heap.len();
                self.heap.push(TimerNode { id, expire, cb });
                self.index.insert(id, i);
                self.sift_up(i);
            }
        }
    }

    /// Update expiry only. Unknown ids are ignored.
    pub fn adjust(&mut self, id: u64, timeout: Duration) {
        if let Some(i) = self.index.get(&id).copied() {
            self.heap[i].expire = Instant::now() + timeout;
            self.sift_down(i);
            self.sift_up(i);
        }
    }

    /// Invoke and remove `id`'s callback immediately (forced eviction).
    pub fn do_work(&mut self, id: u64) {
        if let Some(i) = self.index.get(&id).copied() {
            let mut node = self.remove_at(i);
            (node.cb)();
        }
    }

    /// Drop `id`'s entry without invoking it, for connections destroyed
    /// ahead of their deadline. Unknown ids are ignored.
    pub fn remove(&mut self, id: u64) {
        if let Some(i) = self.index.get(&id).copied() {
            self.remove_at(i);
        }
    }

    /// Pop and invoke every due callback in expiry order, stopping at the
    /// first still-future entry.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while let Some(root) = self.heap.first() {
            if root.expire > now {
                break;
            }
            let mut node = self.remove_at(0);
            (node.cb)();
        }
    }

    /// Drop the earliest entry without invoking it.
    pub fn pop(&mut self) {
        if !self.heap.is_empty() {
            self.remove_at(0);
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// Run `tick()`, then report how long the reactor may sleep before the
    /// next expiry. `None` when no timers remain.
    pub fn next_tick(&mut self) -> Option<u64> {
        self.tick();
        let root = self.heap.first()?;
        Some(
            root.expire
                .saturating_duration_since(Instant::now())
                .as_millis() as u64,
        )
    }

    fn remove_at(&mut self, i: usize) -> TimerNode {
        let last = self.heap.len() - 1;
        self.heap.swap(i, last);
        if i < last {
            self.index.insert(self.heap[i].id, i);
        }
        let node = self.heap.pop().unwrap();
        self.index.remove(&node.id);
        if i < last {
            self.sift_down(i);
            self.sift_up(i);
        }
        node
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[i].expire >= self.heap[parent].expire {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.heap.len();
        loop {
            let mut child = 2 * i + 1;
            if child >= len {
                break;
            }
            if child + 1 < len && self.heap[child + 1].expire < self.heap[child].expire {
                child += 1;
            }
            if self.heap[child].expire >= self.heap[i].expire {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
        }
    }

    fn swap_nodes(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].id, a);
        self.index.insert(self.heap[b].id, b);
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        for (i, node) in self.heap.iter().enumerate() {
            assert_eq!(self.index[&node.id], i);
            if i > 0 {
                assert!(self.heap[(i - 1) / 2].expire <= node.expire);
            }
        }
        assert_eq!(self.index.len(), self.heap.len());
    }
}
