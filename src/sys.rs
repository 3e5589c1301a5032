//! Thin wrappers over the Linux readiness and socket syscalls.
//!
//! Everything here deals in `OwnedFd`: each descriptor has exactly one
//! owner and is closed when that owner drops.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_ssize(ret: libc::ssize_t) -> io::Result<usize> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Readiness interest for a single direction.
///
/// The engine only ever waits for one direction per fd at a time: the
/// connection state machine is either receiving or sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn bits(self) -> u32 {
        match self {
            // RDHUP rides along so half-closed peers surface as hangups
            // instead of read-readiness on an empty socket.
            Interest::Readable => (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
            Interest::Writable => libc::EPOLLOUT as u32,
        }
    }
}

/// One delivered readiness event.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    fd: RawFd,
    flags: u32,
}

impl Event {
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn is_readable(&self) -> bool {
        self.flags & libc::EPOLLIN as u32 != 0
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.flags & libc::EPOLLOUT as u32 != 0
    }

    pub(crate) fn is_hangup(&self) -> bool {
        self.flags & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0
    }
}

/// Reusable buffer for `Poller::wait`.
pub(crate) struct Events {
    list: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub(crate) fn with_capacity(cap: usize) -> Events {
        Events {
            list: vec![libc::epoll_event { events: 0, u64: 0 }; cap],
            len: 0,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.list[..self.len].iter().map(|ev| Event {
            fd: ev.u64 as RawFd,
            flags: ev.events,
        })
    }
}

/// Epoll-backed readiness demultiplexer.
///
/// One-shot registrations disarm on delivery; the owner must re-arm with
/// [`Poller::rearm`] once it is ready for the next event. That disarm is
/// what serializes handler execution per fd.
pub(crate) struct Poller {
    ep: OwnedFd,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Poller {
            ep: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        cvt(unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut ev) })?;
        Ok(())
    }

    /// Persistent level-triggered interest (used for the timer fd).
    pub(crate) fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest.bits())
    }

    /// Persistent edge-triggered interest (used for the listen socket).
    pub(crate) fn add_edge(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest.bits() | libc::EPOLLET as u32)
    }

    /// One-shot interest for a freshly registered fd.
    pub(crate) fn add_oneshot(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(
            libc::EPOLL_CTL_ADD,
            fd,
            interest.bits() | (libc::EPOLLONESHOT | libc::EPOLLET) as u32,
        )
    }

    /// Re-arm a one-shot registration that has been consumed.
    pub(crate) fn rearm(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(
            libc::EPOLL_CTL_MOD,
            fd,
            interest.bits() | (libc::EPOLLONESHOT | libc::EPOLLET) as u32,
        )
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        cvt(unsafe {
            libc::epoll_ctl(
                self.ep.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        })?;
        Ok(())
    }

    /// Block until at least one event is ready. `None` waits forever.
    pub(crate) fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout.map(|d| d.as_millis().min(i32::MAX as u128) as i32).unwrap_or(-1);
        loop {
            let ret = unsafe {
                libc::epoll_wait(
                    self.ep.as_raw_fd(),
                    events.list.as_mut_ptr(),
                    events.list.len() as libc::c_int,
                    timeout_ms,
                )
            };
            match cvt(ret) {
                Ok(n) => {
                    events.len = n as usize;
                    return Ok(n as usize);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Periodic timer descriptor driving the timer-wheel tick.
pub(crate) struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub(crate) fn new(interval: Duration) -> io::Result<TimerFd> {
        let fd = cvt(unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        })?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let spec = libc::timespec {
            tv_sec: interval.as_secs() as libc::time_t,
            tv_nsec: interval.subsec_nanos() as libc::c_long,
        };
        let timer = libc::itimerspec {
            it_interval: spec,
            it_value: spec,
        };
        cvt(unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, &timer, std::ptr::null_mut()) })?;
        Ok(TimerFd { fd })
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Consume pending expirations so the level-triggered fd goes quiet.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; mem::size_of::<u64>()];
        loop {
            let ret = unsafe {
                libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if ret <= 0 {
                return;
            }
        }
    }
}

/// Accept one pending connection as a non-blocking, close-on-exec fd.
pub(crate) fn accept(listener: RawFd) -> io::Result<OwnedFd> {
    let fd = cvt(unsafe {
        libc::accept4(
            listener,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt_ssize(unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        )
    })
}

pub(crate) fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt_ssize(unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
        )
    })
}

/// Kernel-side copy from `file` into `socket`, advancing `offset`.
pub(crate) fn sendfile(
    socket: RawFd,
    file: RawFd,
    offset: &mut u64,
    count: usize,
) -> io::Result<usize> {
    let mut off = *offset as libc::off_t;
    let sent = cvt_ssize(unsafe { libc::sendfile(socket, file, &mut off, count) })?;
    *offset = off as u64;
    Ok(sent)
}
