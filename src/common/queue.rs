use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Bounded multi-producer FIFO with blocking hand-off.
///
/// `pop` parks until an item arrives or the queue is stopped; after
/// `stop` every consumer drains out with `None` regardless of queued
/// items, which is what lets owners join their workers promptly.
pub(crate) struct Queue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    running: bool,
}

impl<T> Queue<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Queue<T> {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Queue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                capacity,
                running: true,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueue one item, waiting while the queue is at capacity.
    /// Items pushed after `stop` are discarded.
    pub(crate) fn push(&self, item: T) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        while inner.running && inner.items.len() == inner.capacity {
            inner = self
                .not_full
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        if !inner.running {
            return;
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Dequeue one item, parking while empty. Returns `None` once the
    /// queue has been stopped.
    pub(crate) fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        while inner.items.is_empty() && inner.running {
            inner = self
                .not_empty
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        if !inner.running {
            return None;
        }
        let item = inner.items.pop_front();
        drop(inner);
        self.not_full.notify_one();
        item
    }

    pub(crate) fn stop(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.running = false;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .len()
    }
}
