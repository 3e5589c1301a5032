use bytes::{BufMut, BytesMut};

use crate::pages;
use crate::proto::{StatusCode, Version};

// totally scientific
const AVERAGE_HEADER_SIZE: usize = 30;

/// Accumulates one response and serializes it.
///
/// Header pairs keep insertion order and may repeat. Setting an error
/// status pre-populates the body with the canned page for that code;
/// callers may overwrite it afterwards. `clear()` returns the builder to
/// `HTTP/1.1 200 Ok` with no headers and no body so a single instance
/// serves a whole keep-alive session.
#[derive(Debug)]
pub struct ResponseBuilder {
    version: Version,
    status: StatusCode,
    reason: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl Default for ResponseBuilder {
    fn default() -> ResponseBuilder {
        ResponseBuilder {
            version: Version::Http11,
            status: StatusCode::OK,
            reason: String::new(),
            headers: Vec::new(),
            body: String::new(),
        }
    }
}

impl ResponseBuilder {
    /// A builder at the defaults: `HTTP/1.1 200 Ok`, nothing else.
    pub fn new() -> ResponseBuilder {
        ResponseBuilder::default()
    }

    /// Set the status-line HTTP version.
    pub fn set_version(&mut self, version: Version) -> &mut Self {
        self.version = version;
        self
    }

    /// Set the status code. Error codes bring their default page along
    /// as the body.
    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        if status.is_error() {
            self.body.clear();
            self.body.push_str(pages::default_page(status));
        }
        self
    }

    /// Set an error status whose page carries an extra message.
    pub fn set_status_with_extra(&mut self, status: StatusCode, extra: &str) -> &mut Self {
        self.status = status;
        if status.is_error() {
            self.body = pages::page_with_extra(status, extra);
        }
        self
    }

    /// Override the reason phrase. Empty means the canonical table entry.
    pub fn set_reason(&mut self, reason: &str) -> &mut Self {
        self.reason.clear();
        self.reason.push_str(reason);
        self
    }

    /// Append one header pair. Order is preserved; duplicates allowed.
    pub fn add_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Replace the in-memory body.
    pub fn set_body(&mut self, body: &str) -> &mut Self {
        self.body.clear();
        self.body.push_str(body);
        self
    }

    /// The status the next build will carry.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Length in bytes of the current body.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Serialize status line + headers + the blank line + body.
    pub fn build(&self) -> BytesMut {
        let mut dst = self.build_no_body();
        dst.put_slice(self.body.as_bytes());
        dst
    }

    /// Serialize status line + headers + the blank line only — for HEAD
    /// responses and for staged writes that splice a file afterwards.
    pub fn build_no_body(&self) -> BytesMut {
        let headers_len: usize = self
            .headers
            .iter()
            .map(|(n, v)| n.len() + v.len())
            .sum::<usize>()
            + self.headers.len() * 4;
        let mut dst = BytesMut::with_capacity(
            AVERAGE_HEADER_SIZE + headers_len + self.body.len(),
        );

        dst.put_slice(self.version.as_str().as_bytes());
        dst.put_u8(b' ');
        let mut buf = itoa::Buffer::new();
        dst.put_slice(buf.format(self.status.as_u16()).as_bytes());
        dst.put_u8(b' ');
        if self.reason.is_empty() {
            dst.put_slice(
                self.status
                    .canonical_reason()
                    .unwrap_or("Unknown")
                    .as_bytes(),
            );
        } else {
            dst.put_slice(self.reason.as_bytes());
        }
        dst.put_slice(b"\r\n");

        for (name, value) in &self.headers {
            dst.put_slice(name.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        dst
    }

    /// Back to the defaults: `HTTP/1.1 200 Ok`, no headers, no body.
    pub fn clear(&mut self) {
        self.version = Version::Http11;
        self.status = StatusCode::OK;
        self.reason.clear();
        self.headers.clear();
        self.body.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_build() {
        let builder = ResponseBuilder::new();
        assert_eq!(&builder.build()[..], b"HTTP/1.1 200 Ok\r\n\r\n");
    }

    #[test]
    fn headers_keep_insertion_order() {
        let mut builder = ResponseBuilder::new();
        builder
            .add_header("Content-Length", "6")
            .add_header("Content-Type", "text/html")
            .add_header("Content-Type", "again");
        assert_eq!(
            &builder.build_no_body()[..],
            &b"HTTP/1.1 200 Ok\r\nContent-Length: 6\r\nContent-Type: text/html\r\nContent-Type: again\r\n\r\n"[..]
        );
    }

    #[test]
    fn no_body_plus_body_equals_full_build() {
        let mut builder = ResponseBuilder::new();
        builder
            .add_header("Content-Type", "text/plain")
            .set_body("hello\n");
        let mut combined = builder.build_no_body();
        combined.put_slice(b"hello\n");
        assert_eq!(builder.build(), combined);
    }

    #[test]
    fn error_status_brings_default_page() {
        let mut builder = ResponseBuilder::new();
        builder.set_status(StatusCode::NOT_FOUND);
        let out = builder.build();
        let out = std::str::from_utf8(&out).unwrap();
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.ends_with("<body><h1>404 Not Found</h1></body></html>"));
    }

    #[test]
    fn extra_message_variant() {
        let mut builder = ResponseBuilder::new();
        builder.set_status_with_extra(StatusCode::FORBIDDEN, "nope");
        let out = builder.build();
        let out = std::str::from_utf8(&out).unwrap();
        assert!(out.contains("<p>nope</p>"));
    }

    #[test]
    fn custom_reason_overrides_table() {
        let mut builder = ResponseBuilder::new();
        builder.set_reason("Okey Dokey");
        assert_eq!(&builder.build()[..], b"HTTP/1.1 200 Okey Dokey\r\n\r\n");
    }

    #[test]
    fn http10_status_line() {
        let mut builder = ResponseBuilder::new();
        builder.set_version(Version::Http10);
        assert_eq!(&builder.build()[..], b"HTTP/1.0 200 Ok\r\n\r\n");
    }

    #[test]
    fn clear_resets_to_defaults() {
        let mut builder = ResponseBuilder::new();
        builder
            .set_status(StatusCode::BAD_REQUEST)
            .set_reason("Nope")
            .add_header("Connection", "close")
            .set_body("x");
        builder.clear();
        assert_eq!(&builder.build()[..], b"HTTP/1.1 200 Ok\r\n\r\n");
    }
}
