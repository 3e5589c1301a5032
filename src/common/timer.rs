use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub(crate) type TimerId = u64;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// One-shot timer wheel.
///
/// Deadlines live in an ordered set keyed by `(Instant, TimerId)`, with
/// a side index from id to deadline so `reset` and `remove` stay
/// O(log n). `tick` collects everything due and invokes the callbacks
/// after the lock is released: a fired callback is allowed to call back
/// into the wheel (typically to remove some other connection's timer)
/// without deadlocking.
pub(crate) struct TimerWheel {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

struct Inner {
    deadlines: BTreeSet<(Instant, TimerId)>,
    index: HashMap<TimerId, Instant>,
    callbacks: HashMap<TimerId, Callback>,
}

impl TimerWheel {
    pub(crate) fn new() -> TimerWheel {
        TimerWheel {
            inner: Mutex::new(Inner {
                deadlines: BTreeSet::new(),
                index: HashMap::new(),
                callbacks: HashMap::new(),
            }),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register `callback` to fire `after` from now.
    pub(crate) fn add<F>(&self, after: Duration, callback: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + after;

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.deadlines.insert((deadline, id));
        inner.index.insert(id, deadline);
        inner.callbacks.insert(id, Box::new(callback));
        id
    }

    /// Push an existing timer's deadline out to `after` from now.
    /// Unknown ids (already fired or removed) are ignored.
    pub(crate) fn reset(&self, id: TimerId, after: Duration) {
        let deadline = Instant::now() + after;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let old = match inner.index.get(&id) {
            Some(old) => *old,
            None => return,
        };
        inner.deadlines.remove(&(old, id));
        inner.deadlines.insert((deadline, id));
        inner.index.insert(id, deadline);
    }

    /// Drop a timer without firing it.
    pub(crate) fn remove(&self, id: TimerId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(deadline) = inner.index.remove(&id) {
            inner.deadlines.remove(&(deadline, id));
            inner.callbacks.remove(&id);
        }
    }

    /// Fire everything due, returning the time until the next deadline,
    /// or `None` when the wheel is empty.
    pub(crate) fn tick(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut due: Vec<Callback> = Vec::new();
        let next;

        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            while let Some(&(deadline, id)) = inner.deadlines.iter().next() {
                if deadline > now {
                    break;
                }
                inner.deadlines.remove(&(deadline, id));
                inner.index.remove(&id);
                if let Some(callback) = inner.callbacks.remove(&id) {
                    due.push(callback);
                }
            }
            next = inner
                .deadlines
                .iter()
                .next()
                .map(|&(deadline, _)| deadline.saturating_duration_since(now));
        }

        for callback in due {
            callback();
        }
        next
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .deadlines
            .len()
    }
}
