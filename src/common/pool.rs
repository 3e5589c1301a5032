use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::common::queue::Queue;

type Task = Box<dyn FnOnce() + Send + 'static>;

const MAX_THREADS: usize = 16;
const QUEUE_CAPACITY: usize = 4096;

/// Fixed-size worker pool draining a shared task queue.
///
/// A pool started with zero threads degenerates to running every task
/// inline on the caller, which keeps single-threaded configurations
/// free of hand-off overhead.
pub(crate) struct ThreadPool {
    queue: Arc<Queue<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub(crate) fn new(size: usize) -> io::Result<ThreadPool> {
        let queue = Arc::new(Queue::<Task>::with_capacity(QUEUE_CAPACITY));
        if size > MAX_THREADS {
            warn!(size, max = MAX_THREADS, "thread pool size capped");
        }
        let size = size.min(MAX_THREADS);
        debug!(size, "thread pool start");

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("hearth-pool-{}", i))
                .spawn(move || {
                    while let Some(task) = queue.pop() {
                        task();
                    }
                })?;
            workers.push(handle);
        }

        Ok(ThreadPool { queue, workers })
    }

    /// Hand a task to the pool. No ordering is guaranteed across tasks.
    pub(crate) fn run<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.workers.is_empty() {
            task();
        } else {
            self.queue.push(Box::new(task));
        }
    }

    /// Stop the queue and join every worker.
    pub(crate) fn stop(&mut self) {
        self.queue.stop();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn runs_tasks_on_workers() {
        let pool = ThreadPool::new(4).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..32 {
            let tx = tx.clone();
            pool.run(move || tx.send(i).unwrap());
        }
        let mut got: Vec<u32> = rx.iter().take(32).collect();
        got.sort_unstable();
        assert_eq!(got, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn zero_sized_pool_runs_inline() {
        let pool = ThreadPool::new(0).unwrap();
        let tid = thread::current().id();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        pool.run(move || {
            assert_eq!(thread::current().id(), tid);
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_joins_workers() {
        let mut pool = ThreadPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.run(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.stop();
        // stop() may drop tasks that were still queued, but every worker
        // has exited, so the count is final and bounded.
        let settled = counter.load(Ordering::SeqCst);
        assert!(settled <= 16);
        assert_eq!(counter.load(Ordering::SeqCst), settled);
    }
}
