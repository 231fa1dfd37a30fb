use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Result;
use crate::queue::BlockingQueue;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// How long a worker sleeps on an empty queue before rechecking the stop
/// flag.
const POP_TIMEOUT: Duration = Duration::from_millis(100);

/// Fixed set of threads pulling closures off a shared bounded queue.
///
/// `spawn` blocks when the queue is full; that backpressure lands on the
/// reactor thread on purpose. Shutdown closes the queue (waking every
/// waiter) and joins; there is no mid-flight cancellation of a dispatched
/// task.
pub struct WorkerPool {
    tasks: Arc<BlockingQueue<Task>>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize, queue_capacity: usize) -> Self {
        let tasks: Arc<BlockingQueue<Task>> = Arc::new(BlockingQueue::new(queue_capacity));
        let stop = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let tasks = tasks.clone();
            let stop = stop.clone();
            let handle = thread::Builder::new()
                .name(format!("ravel-worker-{i}"))
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        if let Some(task) = tasks.pop_timeout(POP_TIMEOUT) {
                            task();
                        }
                    }
                    // Drain what was queued before the stop flag flipped.
                    while let Some(task) = tasks.pop_timeout(Duration::ZERO) {
                        task();
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self { tasks, stop, handles }
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Enqueue a task; blocks when the queue is at capacity.
    pub fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tasks.push_back(Box::new(task))
    }

    /// Flag the workers down, wake them, and join.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.tasks.close();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.shutdown();
        }
    }
}
