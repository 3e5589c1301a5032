use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, trace};

use crate::server::reactor::Reactor;
use crate::sys::{self, Events, Interest, Poller};

const BACKLOG: i32 = 1024;

/// Build a non-blocking listener with the reuse options that let
/// several acceptor threads share one address.
pub(crate) fn bind(addr: SocketAddr) -> crate::Result<TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(crate::Error::new_listen)?;
    socket
        .set_reuse_address(true)
        .map_err(crate::Error::new_listen)?;
    socket
        .set_reuse_port(true)
        .map_err(crate::Error::new_listen)?;
    socket
        .set_nonblocking(true)
        .map_err(crate::Error::new_listen)?;
    socket
        .bind(&addr.into())
        .map_err(crate::Error::new_listen)?;
    socket.listen(BACKLOG).map_err(crate::Error::new_listen)?;
    Ok(socket.into())
}

/// Accept loop: wait on the listen socket, accept until would-block,
/// hand each connection to the next worker round-robin.
///
/// Returns only when the readiness plumbing itself fails.
pub(crate) fn run(listener: TcpListener, workers: Vec<Arc<Reactor>>) -> crate::Result<()> {
    let poller = Poller::new().map_err(crate::Error::new_io)?;
    poller
        .add_edge(listener.as_raw_fd(), Interest::Readable)
        .map_err(crate::Error::new_io)?;

    let mut events = Events::with_capacity(1);
    let mut next_worker = 0usize;

    loop {
        poller
            .wait(&mut events, None)
            .map_err(crate::Error::new_io)?;

        loop {
            let sock = match sys::accept(listener.as_raw_fd()) {
                Ok(sock) => sock,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if is_connection_error(&e) => {
                    // The peer gave up between SYN and accept; move on.
                    debug!(error = %e, "accepted connection already errored");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                    return Err(crate::Error::new_accept(e));
                }
            };

            trace!(fd = sock.as_raw_fd(), "accepted connection");
            if let Err(e) = workers[next_worker].register(sock) {
                error!(error = %e, "failed to register connection with worker");
            }
            next_worker = (next_worker + 1) % workers.len();
        }
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_sets_reuse_and_nonblocking() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        // A second socket may bind the same port thanks to SO_REUSEPORT.
        let second = bind(addr).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), addr.port());

        // Non-blocking accept on an idle listener must not hang.
        let err = sys::accept(listener.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
