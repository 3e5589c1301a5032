use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::common::pool::ThreadPool;
use crate::common::timer::{TimerId, TimerWheel};
use crate::server::conn::Conn;
use crate::server::Config;
use crate::sys::{Events, Interest, Poller, TimerFd};

const MAX_EVENTS: usize = 1024;
const TICK_INTERVAL: Duration = Duration::from_secs(2);

/// Per-fd slot in the reactor's connection table.
///
/// The acceptor registers sockets before any context exists; the
/// context is built lazily on the first read event, which keeps all
/// per-connection mutable state confined to the owning reactor.
enum Entry {
    Vacant,
    Pending(OwnedFd),
    Active {
        conn: Arc<Mutex<Conn>>,
        timer: TimerId,
    },
}

/// A worker reactor: one readiness set, one connection table, one timer
/// wheel, and one handler pool.
pub(crate) struct Reactor {
    poller: Poller,
    timer_fd: TimerFd,
    conns: Mutex<Vec<Entry>>,
    wheel: TimerWheel,
    pool: ThreadPool,
    config: Arc<Config>,
}

impl Reactor {
    pub(crate) fn new(config: Arc<Config>) -> std::io::Result<Arc<Reactor>> {
        let poller = Poller::new()?;
        let timer_fd = TimerFd::new(TICK_INTERVAL)?;
        poller.add(timer_fd.as_raw_fd(), Interest::Readable)?;
        let pool = ThreadPool::new(config.pool_size)?;

        Ok(Arc::new(Reactor {
            poller,
            timer_fd,
            conns: Mutex::new(Vec::new()),
            wheel: TimerWheel::new(),
            pool,
            config,
        }))
    }

    /// Take ownership of a freshly accepted socket and arm one-shot
    /// read interest. Called from the acceptor thread.
    pub(crate) fn register(&self, sock: OwnedFd) -> std::io::Result<()> {
        let fd = sock.as_raw_fd();
        {
            let mut conns = self.lock_conns();
            Self::slot_mut(&mut conns, fd);
            conns[fd as usize] = Entry::Pending(sock);
        }
        if let Err(e) = self.poller.add_oneshot(fd, Interest::Readable) {
            let mut conns = self.lock_conns();
            conns[fd as usize] = Entry::Vacant;
            return Err(e);
        }
        trace!(fd, "connection registered");
        Ok(())
    }

    /// Run the event loop forever. Only a failing `epoll_wait` exits.
    pub(crate) fn run(this: &Arc<Reactor>) {
        let mut events = Events::with_capacity(MAX_EVENTS);
        loop {
            if let Err(e) = this.poller.wait(&mut events, None) {
                error!(error = %e, "reactor wait failed");
                return;
            }

            let mut tick = false;
            for event in events.iter() {
                let fd = event.fd();
                if fd == this.timer_fd.as_raw_fd() {
                    tick = true;
                } else if event.is_hangup() {
                    debug!(fd, "hangup");
                    this.teardown(fd);
                } else if event.is_readable() {
                    Reactor::dispatch_read(this, fd);
                } else if event.is_writable() {
                    Reactor::dispatch_write(this, fd);
                }
            }

            if tick {
                this.timer_fd.drain();
                let _ = this.wheel.tick();
            }
        }
    }

    fn dispatch_read(this: &Arc<Reactor>, fd: RawFd) {
        let conn = {
            let mut conns = this.lock_conns();
            match std::mem::replace(Self::slot_mut(&mut conns, fd), Entry::Vacant) {
                Entry::Pending(sock) => {
                    // First readiness on this socket: build the context
                    // and its idle timer. The timer callback only holds
                    // (fd, Weak); it re-validates through the table, so
                    // it never keeps a dead context alive.
                    let weak: Weak<Reactor> = Arc::downgrade(this);
                    let idle = this.config.idle_timeout;
                    let timer = this.wheel.add(idle, move || {
                        if let Some(reactor) = weak.upgrade() {
                            debug!(fd, "idle timeout");
                            reactor.teardown(fd);
                        }
                    });
                    let conn = Arc::new(Mutex::new(Conn::new(
                        sock,
                        Arc::clone(&this.config.root),
                    )));
                    conns[fd as usize] = Entry::Active {
                        conn: Arc::clone(&conn),
                        timer,
                    };
                    conn
                }
                Entry::Active { conn, timer } => {
                    this.wheel.reset(timer, this.config.idle_timeout);
                    let cloned = Arc::clone(&conn);
                    conns[fd as usize] = Entry::Active { conn, timer };
                    cloned
                }
                Entry::Vacant => {
                    debug!(fd, "read event for unknown fd dropped");
                    return;
                }
            }
        };

        let reactor = Arc::clone(this);
        this.pool.run(move || {
            if !reactor.is_live(fd, &conn) {
                trace!(fd, "connection torn down before read task ran");
                return;
            }
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.do_read(&reactor);
        });
    }

    fn dispatch_write(this: &Arc<Reactor>, fd: RawFd) {
        let conn = {
            let mut conns = this.lock_conns();
            match Self::slot_mut(&mut conns, fd) {
                Entry::Active { conn, timer } => {
                    let timer = *timer;
                    let conn = Arc::clone(conn);
                    this.wheel.reset(timer, this.config.idle_timeout);
                    conn
                }
                _ => {
                    debug!(fd, "write event for unknown fd dropped");
                    return;
                }
            }
        };

        let reactor = Arc::clone(this);
        this.pool.run(move || {
            if !reactor.is_live(fd, &conn) {
                trace!(fd, "connection torn down before write task ran");
                return;
            }
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.do_write(&reactor);
        });
    }

    /// Re-arm one-shot interest, dropping the connection if the kernel
    /// refuses (the registration may have been deleted by a racing
    /// timeout).
    pub(crate) fn rearm_or_drop(&self, fd: RawFd, interest: Interest) {
        if let Err(e) = self.poller.rearm(fd, interest) {
            warn!(fd, error = %e, "failed to re-arm interest");
            self.teardown(fd);
        }
    }

    /// Remove the connection: interest deleted and timer removed before
    /// the context can be destroyed. Safe to call twice; the loser sees
    /// a vacant slot.
    pub(crate) fn teardown(&self, fd: RawFd) {
        let entry = {
            let mut conns = self.lock_conns();
            if (fd as usize) >= conns.len() {
                return;
            }
            std::mem::replace(&mut conns[fd as usize], Entry::Vacant)
        };
        match entry {
            Entry::Vacant => {}
            Entry::Pending(sock) => {
                debug!(fd, "dropping connection before first read");
                let _ = self.poller.delete(sock.as_raw_fd());
            }
            Entry::Active { conn, timer } => {
                self.wheel.remove(timer);
                let _ = self.poller.delete(fd);
                // The socket itself closes when the last task holding
                // the context finishes.
                drop(conn);
                trace!(fd, "connection removed");
            }
        }
    }

    /// Check the slot still holds exactly this context.
    fn is_live(&self, fd: RawFd, conn: &Arc<Mutex<Conn>>) -> bool {
        let conns = self.lock_conns();
        match conns.get(fd as usize) {
            Some(Entry::Active { conn: current, .. }) => Arc::ptr_eq(current, conn),
            _ => false,
        }
    }

    fn lock_conns(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.conns.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot_mut(conns: &mut Vec<Entry>, fd: RawFd) -> &mut Entry {
        let index = fd as usize;
        if index >= conns.len() {
            conns.resize_with(index + 1, || Entry::Vacant);
        }
        &mut conns[index]
    }
}
