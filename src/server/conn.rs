use std::fs::{self, File};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, error, trace, warn};

use crate::proto::h1::{RequestParser, ResponseBuilder};
use crate::proto::{Method, StatusCode, Version};
use crate::server::reactor::Reactor;
use crate::sys::{self, Interest};

const READ_CHUNK: usize = 1024;

/// Where the connection is in its request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    ReceiveHead,
    ReceiveBody,
    Send,
    SendError,
    Close,
}

/// A file staged behind the header buffer for zero-copy transfer.
struct FileBody {
    file: File,
    size: u64,
    offset: u64,
}

enum Drained {
    /// Socket drained to would-block; n bytes appended this round.
    Open(usize),
    /// Peer sent EOF; n bytes appended before it.
    Closed(usize),
}

/// Per-connection state: socket, buffers, parser, builder, and the
/// staged-write bookkeeping. One-shot interest guarantees at most one
/// `do_read`/`do_write` runs at a time for a given connection, so none
/// of this needs interior locking.
pub(crate) struct Conn {
    sock: OwnedFd,
    phase: Phase,
    read_buf: BytesMut,
    body_buf: BytesMut,
    expect_len: usize,
    write_buf: BytesMut,
    write_idx: usize,
    file: Option<FileBody>,
    parser: RequestParser,
    builder: ResponseBuilder,
    root: Arc<PathBuf>,
    force_close: bool,
}

impl Conn {
    pub(crate) fn new(sock: OwnedFd, root: Arc<PathBuf>) -> Conn {
        Conn {
            sock,
            phase: Phase::ReceiveHead,
            read_buf: BytesMut::new(),
            body_buf: BytesMut::new(),
            expect_len: 0,
            write_buf: BytesMut::new(),
            write_idx: 0,
            file: None,
            parser: RequestParser::new(),
            builder: ResponseBuilder::new(),
            root,
            force_close: false,
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// Advance the receive side of the state machine.
    pub(crate) fn do_read(&mut self, reactor: &Reactor) {
        trace!(fd = self.fd(), phase = ?self.phase, "do_read");
        match self.phase {
            Phase::ReceiveHead => self.read_head(reactor),
            Phase::ReceiveBody => self.read_body(reactor),
            _ => warn!(fd = self.fd(), phase = ?self.phase, "read event in send phase"),
        }
    }

    fn read_head(&mut self, reactor: &Reactor) {
        let fd = self.fd();
        let drained = match drain(fd, &mut self.read_buf) {
            Ok(d) => d,
            Err(e) => {
                error!(fd, error = %e, "recv failed");
                self.start_error(StatusCode::INTERNAL_SERVER_ERROR);
                reactor.rearm_or_drop(fd, Interest::Writable);
                return;
            }
        };
        if let Drained::Closed(0) = drained {
            debug!(fd, "peer closed connection");
            reactor.teardown(fd);
            return;
        }

        let head_end = match find_head_end(&self.read_buf) {
            Some(end) => end,
            None => {
                reactor.rearm_or_drop(fd, Interest::Readable);
                return;
            }
        };

        match self.parser.parse(&self.read_buf[..head_end]) {
            Err(e) => {
                debug!(fd, error = %e, "failed to parse request");
                self.start_error(StatusCode::BAD_REQUEST);
            }
            Ok(head_len) => {
                let content_length = self.parser.content_length() as usize;
                if content_length > 0 {
                    if self.parser.method() == Some(Method::Trace) {
                        debug!(fd, "TRACE with a body rejected");
                        self.start_error(StatusCode::BAD_REQUEST);
                    } else {
                        let avail = self.read_buf.len() - head_len;
                        let take = avail.min(content_length);
                        self.body_buf.reserve(content_length);
                        self.body_buf
                            .extend_from_slice(&self.read_buf[head_len..head_len + take]);
                        self.expect_len = content_length;
                        if self.body_buf.len() < content_length {
                            self.phase = Phase::ReceiveBody;
                            reactor.rearm_or_drop(fd, Interest::Readable);
                            return;
                        }
                        self.handle_request();
                    }
                } else {
                    self.handle_request();
                }
            }
        }
        reactor.rearm_or_drop(fd, Interest::Writable);
    }

    fn read_body(&mut self, reactor: &Reactor) {
        let fd = self.fd();
        match drain(fd, &mut self.body_buf) {
            Err(e) => {
                error!(fd, error = %e, "recv failed");
                self.start_error(StatusCode::INTERNAL_SERVER_ERROR);
                reactor.rearm_or_drop(fd, Interest::Writable);
            }
            Ok(Drained::Closed(0)) => {
                debug!(fd, "peer closed connection");
                reactor.teardown(fd);
            }
            Ok(_) => {
                if self.body_buf.len() >= self.expect_len {
                    if self.body_buf.len() > self.expect_len {
                        debug!(
                            fd,
                            got = self.body_buf.len(),
                            expected = self.expect_len,
                            "body overshoot trimmed"
                        );
                        self.body_buf.truncate(self.expect_len);
                    }
                    self.handle_request();
                    reactor.rearm_or_drop(fd, Interest::Writable);
                } else {
                    reactor.rearm_or_drop(fd, Interest::Readable);
                }
            }
        }
    }

    /// The parsed request is complete; fill the write side.
    fn handle_request(&mut self) {
        match self.parser.version() {
            Some(Version::Http10) | Some(Version::Http11) => {}
            v => {
                debug!(fd = self.fd(), version = ?v, "unsupported HTTP version");
                self.start_error_with(
                    StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                    "only HTTP/1.0 and HTTP/1.1 are supported",
                );
                return;
            }
        }

        match self.parser.method() {
            Some(Method::Get) => self.serve_file(true),
            Some(Method::Head) => self.serve_file(false),
            Some(Method::Trace) => self.echo_trace(),
            m => {
                debug!(fd = self.fd(), method = ?m, "method not implemented");
                self.start_error(StatusCode::NOT_IMPLEMENTED);
            }
        }
    }

    fn serve_file(&mut self, attach_body: bool) {
        let fd = self.fd();
        let (full, mime, keep_alive) = {
            let path = self.parser.path();
            let mut full = self.root.join(path.trim_start_matches('/'));
            if path.is_empty() || path.ends_with('/') {
                full.push("index.html");
            }
            (full, self.parser.mime(), self.parser.is_keep_alive())
        };

        let canonical = match fs::canonicalize(&full) {
            Ok(p) => p,
            Err(e) => {
                debug!(fd, path = %full.display(), error = %e, "cannot resolve file");
                self.start_error(status_for_fs_error(&e));
                return;
            }
        };
        if !canonical.starts_with(self.root.as_ref()) {
            debug!(fd, path = %canonical.display(), "path escapes document root");
            self.start_error(StatusCode::FORBIDDEN);
            return;
        }

        let meta = match fs::metadata(&canonical) {
            Ok(m) => m,
            Err(e) => {
                warn!(fd, path = %canonical.display(), error = %e, "stat failed");
                self.start_error(status_for_fs_error(&e));
                return;
            }
        };
        if !meta.is_file() {
            debug!(fd, path = %canonical.display(), "not a regular file");
            self.start_error(StatusCode::NOT_FOUND);
            return;
        }

        let file = match File::open(&canonical) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                debug!(fd, path = %canonical.display(), "no read permission");
                self.start_error(StatusCode::FORBIDDEN);
                return;
            }
            Err(e) => {
                warn!(fd, path = %canonical.display(), error = %e, "open failed");
                self.start_error(StatusCode::INTERNAL_SERVER_ERROR);
                return;
            }
        };

        let size = meta.len();
        let mut buf = itoa::Buffer::new();
        self.builder.add_header("Content-Length", buf.format(size));
        self.builder.add_header("Content-Type", mime);
        if keep_alive {
            self.builder.add_header("Connection", "keep-alive");
        }
        if attach_body {
            self.file = Some(FileBody {
                file,
                size,
                offset: 0,
            });
        }

        self.write_buf = self.builder.build_no_body();
        self.write_idx = 0;
        self.phase = Phase::Send;
    }

    /// TRACE: the response body is the request head, verbatim.
    fn echo_trace(&mut self) {
        let echo = self.parser.raw_head().to_owned();
        let mut buf = itoa::Buffer::new();
        self.builder
            .add_header("Content-Length", buf.format(echo.len()));
        self.builder.add_header("Content-Type", "message/http");
        self.builder.add_header("Connection", "close");
        self.builder.set_body(&echo);

        self.write_buf = self.builder.build();
        self.write_idx = 0;
        self.force_close = true;
        self.phase = Phase::Send;
    }

    /// Switch to emitting an error response; keep-alive is abandoned
    /// once the write completes.
    fn start_error(&mut self, status: StatusCode) {
        self.builder.clear();
        self.builder.set_status(status);
        self.finish_error();
    }

    /// Like [`start_error`](Conn::start_error), with an extra message
    /// spliced into the error page.
    fn start_error_with(&mut self, status: StatusCode, extra: &str) {
        self.builder.clear();
        self.builder.set_status_with_extra(status, extra);
        self.finish_error();
    }

    fn finish_error(&mut self) {
        let body_len = self.builder.body_len();
        let mut buf = itoa::Buffer::new();
        self.builder
            .add_header("Content-Length", buf.format(body_len));
        self.builder.add_header("Content-Type", "text/html");

        self.write_buf = if self.parser.method() == Some(Method::Head) {
            self.builder.build_no_body()
        } else {
            self.builder.build()
        };
        self.write_idx = 0;
        self.file = None;
        self.phase = Phase::SendError;
    }

    /// Advance the send side: header buffer first, then the staged file.
    pub(crate) fn do_write(&mut self, reactor: &Reactor) {
        let fd = self.fd();
        trace!(fd, phase = ?self.phase, "do_write");

        if let Err(e) = self.send_all() {
            match e.kind() {
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                    trace!(fd, "peer went away during send");
                }
                _ => error!(fd, error = %e, "send failed"),
            }
            reactor.teardown(fd);
            return;
        }

        if self.write_idx < self.write_buf.len() || self.file.is_some() {
            reactor.rearm_or_drop(fd, Interest::Writable);
        } else if self.parser.is_keep_alive()
            && self.phase != Phase::SendError
            && !self.force_close
        {
            self.reset();
            reactor.rearm_or_drop(fd, Interest::Readable);
        } else {
            self.phase = Phase::Close;
            reactor.teardown(fd);
        }
    }

    fn send_all(&mut self) -> io::Result<()> {
        let fd = self.fd();
        while self.write_idx < self.write_buf.len() {
            match sys::send(fd, &self.write_buf[self.write_idx..]) {
                Ok(n) => self.write_idx += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }

        if let Some(body) = &mut self.file {
            while body.offset < body.size {
                let left = (body.size - body.offset) as usize;
                match sys::sendfile(fd, body.file.as_raw_fd(), &mut body.offset, left) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "file shrank during sendfile",
                        ));
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
            self.file = None;
        }
        Ok(())
    }

    /// Recycle the connection for the next keep-alive request.
    fn reset(&mut self) {
        self.phase = Phase::ReceiveHead;
        self.read_buf.clear();
        self.body_buf.clear();
        self.expect_len = 0;
        self.write_buf.clear();
        self.write_idx = 0;
        self.file = None;
        self.force_close = false;
        self.parser.clear();
        self.builder.clear();
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }
}

/// Drain the socket until would-block, appending each chunk exactly once.
fn drain(fd: RawFd, buf: &mut BytesMut) -> io::Result<Drained> {
    let mut total = 0;
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match sys::recv(fd, &mut chunk) {
            Ok(0) => return Ok(Drained::Closed(total)),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Drained::Open(total)),
            Err(e) => return Err(e),
        }
    }
}

/// Index just past the first `\r\n\r\n`, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn status_for_fs_error(e: &io::Error) -> StatusCode {
    match e.kind() {
        io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Config;
    use std::io::{Read, Write};
    use std::os::fd::{FromRawFd, IntoRawFd};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn scratch_reactor(root: &std::path::Path) -> Arc<Reactor> {
        let config = Arc::new(Config {
            root: Arc::new(root.to_path_buf()),
            idle_timeout: Duration::from_secs(5),
            pool_size: 0,
        });
        Reactor::new(config).expect("reactor")
    }

    /// A connection over one end of a socketpair, with the peer end
    /// returned for the test to play the client.
    fn pair(root: &std::path::Path) -> (Conn, UnixStream, Arc<Reactor>) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let fd = unsafe { OwnedFd::from_raw_fd(ours.into_raw_fd()) };
        let reactor = scratch_reactor(root);
        (Conn::new(fd, Arc::new(root.to_path_buf())), theirs, reactor)
    }

    fn write_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"hello\n").unwrap();
        dir
    }

    fn canonical_root(dir: &tempfile::TempDir) -> std::path::PathBuf {
        fs::canonicalize(dir.path()).unwrap()
    }

    fn response_of(conn: &Conn) -> String {
        String::from_utf8(conn.write_buf.to_vec()).unwrap()
    }

    #[test]
    fn get_resolves_and_stages_file() {
        let dir = write_root();
        let root = canonical_root(&dir);
        let (mut conn, mut client, reactor) = pair(&root);

        client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        conn.do_read(&reactor);

        assert_eq!(conn.phase(), Phase::Send);
        let head = response_of(&conn);
        assert!(head.starts_with("HTTP/1.1 200 Ok\r\n"), "head: {head}");
        assert!(head.contains("Content-Length: 6\r\n"));
        assert!(head.contains("Content-Type: text/html\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(conn.file.is_some());
    }

    #[test]
    fn head_gets_headers_but_no_file() {
        let dir = write_root();
        let root = canonical_root(&dir);
        let (mut conn, mut client, reactor) = pair(&root);

        client
            .write_all(b"HEAD /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        conn.do_read(&reactor);

        assert_eq!(conn.phase(), Phase::Send);
        assert!(response_of(&conn).contains("Content-Length: 6\r\n"));
        assert!(conn.file.is_none());
    }

    #[test]
    fn trailing_slash_serves_index() {
        let dir = write_root();
        let root = canonical_root(&dir);
        let (mut conn, mut client, reactor) = pair(&root);

        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        conn.do_read(&reactor);
        assert_eq!(conn.phase(), Phase::Send);
        assert!(response_of(&conn).contains("Content-Length: 6\r\n"));
    }

    #[test]
    fn traversal_is_forbidden() {
        // The secret must exist for canonicalization to succeed; the
        // prefix check is what rejects it.
        let base = tempfile::tempdir().unwrap();
        fs::create_dir(base.path().join("root")).unwrap();
        fs::create_dir(base.path().join("etc")).unwrap();
        fs::write(base.path().join("etc/passwd"), b"root:x:0:0\n").unwrap();
        let root = fs::canonicalize(base.path().join("root")).unwrap();
        let (mut conn, mut client, reactor) = pair(&root);

        client
            .write_all(b"GET /../etc/passwd HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        conn.do_read(&reactor);
        assert_eq!(conn.phase(), Phase::SendError);
        assert!(response_of(&conn).starts_with("HTTP/1.1 403 Forbidden\r\n"));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = write_root();
        let root = canonical_root(&dir);
        let (mut conn, mut client, reactor) = pair(&root);

        client
            .write_all(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        conn.do_read(&reactor);
        assert_eq!(conn.phase(), Phase::SendError);
        let body = response_of(&conn);
        assert!(body.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(body.ends_with("<body><h1>404 Not Found</h1></body></html>"));
    }

    #[test]
    fn garbage_is_bad_request() {
        let dir = write_root();
        let root = canonical_root(&dir);
        let (mut conn, mut client, reactor) = pair(&root);

        client.write_all(b"NONSENSE\r\n\r\n").unwrap();
        conn.do_read(&reactor);
        assert_eq!(conn.phase(), Phase::SendError);
        assert!(response_of(&conn).starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn future_version_not_supported() {
        let dir = write_root();
        let root = canonical_root(&dir);
        let (mut conn, mut client, reactor) = pair(&root);

        client
            .write_all(b"POST /x HTTP/1.2\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc")
            .unwrap();
        conn.do_read(&reactor);
        assert_eq!(conn.phase(), Phase::SendError);
        assert!(
            response_of(&conn).starts_with("HTTP/1.1 505 HTTP Version Not Supported\r\n")
        );
    }

    #[test]
    fn post_is_not_implemented() {
        let dir = write_root();
        let root = canonical_root(&dir);
        let (mut conn, mut client, reactor) = pair(&root);

        client
            .write_all(b"POST /x HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        conn.do_read(&reactor);
        assert_eq!(conn.phase(), Phase::SendError);
        assert!(response_of(&conn).starts_with("HTTP/1.1 501 Not Implemented\r\n"));
    }

    #[test]
    fn body_spread_across_reads() {
        let dir = write_root();
        let root = canonical_root(&dir);
        let (mut conn, mut client, reactor) = pair(&root);

        client
            .write_all(b"PUT /x HTTP/1.1\r\nContent-Length: 6\r\n\r\nabc")
            .unwrap();
        conn.do_read(&reactor);
        assert_eq!(conn.phase(), Phase::ReceiveBody);

        client.write_all(b"def").unwrap();
        conn.do_read(&reactor);
        // body complete; PUT is then answered with 501
        assert_eq!(conn.phase(), Phase::SendError);
        assert_eq!(&conn.body_buf[..], b"abcdef");
    }

    #[test]
    fn trace_with_body_is_rejected() {
        let dir = write_root();
        let root = canonical_root(&dir);
        let (mut conn, mut client, reactor) = pair(&root);

        client
            .write_all(b"TRACE / HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi")
            .unwrap();
        conn.do_read(&reactor);
        assert_eq!(conn.phase(), Phase::SendError);
        assert!(response_of(&conn).starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn trace_echoes_request_head() {
        let dir = write_root();
        let root = canonical_root(&dir);
        let (mut conn, mut client, reactor) = pair(&root);

        let head = b"TRACE /here HTTP/1.1\r\nHost: x\r\n\r\n";
        client.write_all(head).unwrap();
        conn.do_read(&reactor);

        assert_eq!(conn.phase(), Phase::Send);
        assert!(conn.force_close);
        let out = response_of(&conn);
        assert!(out.contains("Content-Type: message/http\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(out.ends_with(std::str::from_utf8(head).unwrap()));
    }

    #[test]
    fn write_then_keep_alive_reset() {
        let dir = write_root();
        let root = canonical_root(&dir);
        let (mut conn, mut client, reactor) = pair(&root);

        client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        conn.do_read(&reactor);
        assert_eq!(conn.phase(), Phase::Send);

        conn.do_write(&reactor);
        // headers + file fully sent, keep-alive recycled the connection
        assert_eq!(conn.phase(), Phase::ReceiveHead);
        assert!(conn.file.is_none());
        assert_eq!(conn.write_idx, 0);

        let mut got = vec![0u8; 4096];
        let n = client.read(&mut got).unwrap();
        let got = std::str::from_utf8(&got[..n]).unwrap();
        assert!(got.starts_with("HTTP/1.1 200 Ok\r\n"));
        assert!(got.ends_with("\r\n\r\nhello\n"), "got: {got:?}");
    }

    #[test]
    fn error_write_closes_connection() {
        let dir = write_root();
        let root = canonical_root(&dir);
        let (mut conn, mut client, reactor) = pair(&root);

        client
            .write_all(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        conn.do_read(&reactor);
        assert_eq!(conn.phase(), Phase::SendError);

        conn.do_write(&reactor);
        assert_eq!(conn.phase(), Phase::Close);
    }

    #[test]
    fn head_end_search() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nrest"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(find_head_end(b""), None);
    }

    #[test]
    fn fs_error_mapping() {
        use io::ErrorKind;
        let not_found = io::Error::new(ErrorKind::NotFound, "x");
        let denied = io::Error::new(ErrorKind::PermissionDenied, "x");
        let other = io::Error::new(ErrorKind::Other, "x");
        assert_eq!(status_for_fs_error(&not_found), StatusCode::NOT_FOUND);
        assert_eq!(status_for_fs_error(&denied), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for_fs_error(&other),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
