use tracing::trace;

use crate::error::Parse;
use crate::mime;
use crate::proto::{Method, Version};

/// Spans into the parser's raw buffer, recorded instead of string
/// references so the parsed head can own its storage.
#[derive(Debug, Clone, Copy)]
struct HeaderIndices {
    name: (usize, usize),
    value: (usize, usize),
}

/// An HTTP/1.x request-head parser.
///
/// The parser owns the raw head bytes; every accessor returns a view
/// borrowed from that buffer, so views are valid until the next
/// [`parse`](RequestParser::parse) or [`clear`](RequestParser::clear).
/// One instance is meant to be reused across the requests of a
/// keep-alive connection without reallocating.
#[derive(Debug, Default)]
pub struct RequestParser {
    raw: String,
    method: Option<Method>,
    version: Option<Version>,
    path: (usize, usize),
    query: Option<(usize, usize)>,
    mime: &'static str,
    headers: Vec<HeaderIndices>,
    head_len: usize,
}

struct Parsed {
    method: Method,
    version: Option<Version>,
    path: (usize, usize),
    query: Option<(usize, usize)>,
    mime: &'static str,
    headers: Vec<HeaderIndices>,
    head_len: usize,
}

impl RequestParser {
    /// A parser with empty buffers, ready for its first request.
    pub fn new() -> RequestParser {
        RequestParser::default()
    }

    /// Parse one complete request head (everything through the final
    /// `\r\n\r\n`). Returns the number of bytes consumed.
    ///
    /// Failure leaves the parser cleared; the caller answers it with
    /// `400 Bad Request`.
    pub fn parse(&mut self, head: &[u8]) -> crate::Result<usize> {
        self.clear();

        let s = std::str::from_utf8(head).map_err(|_| Parse::Encoding)?;
        trace!(len = head.len(), "parse request head");
        let parsed = parse_head(s)?;

        self.raw.push_str(s);
        self.method = Some(parsed.method);
        self.version = parsed.version;
        self.path = parsed.path;
        self.query = parsed.query;
        self.mime = parsed.mime;
        self.headers = parsed.headers;
        self.head_len = parsed.head_len;
        Ok(self.head_len)
    }

    /// Reset to the pristine state, keeping buffer capacity.
    pub fn clear(&mut self) {
        self.raw.clear();
        self.method = None;
        self.version = None;
        self.path = (0, 0);
        self.query = None;
        self.mime = "";
        self.headers.clear();
        self.head_len = 0;
    }

    /// The request method, set by a successful parse.
    pub fn method(&self) -> Option<Method> {
        self.method
    }

    /// The recognized HTTP version; `None` for a well-formed but
    /// unrecognized `major.minor`.
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// The request-target path (before any `?`).
    pub fn path(&self) -> &str {
        &self.raw[self.path.0..self.path.1]
    }

    /// The query component, when the target contained a `?`.
    pub fn query(&self) -> Option<&str> {
        self.query.map(|(start, end)| &self.raw[start..end])
    }

    /// Media type derived from the path's extension: `text/html` when the
    /// last segment has no dot, the table entry otherwise, falling back
    /// to `application/octet-stream`.
    pub fn mime(&self) -> &'static str {
        self.mime
    }

    /// Bytes consumed by the last successful parse.
    pub fn head_len(&self) -> usize {
        self.head_len
    }

    /// The raw head exactly as received, for `TRACE` echoes.
    pub fn raw_head(&self) -> &str {
        &self.raw[..self.head_len]
    }

    /// First value stored under `name`. Names compare case-sensitively;
    /// when a request repeats a header, the first occurrence wins and
    /// later ones were dropped at parse time.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|h| {
            if &self.raw[h.name.0..h.name.1] == name {
                Some(&self.raw[h.value.0..h.value.1])
            } else {
                None
            }
        })
    }

    /// All stored headers in request order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(move |h| {
            (
                &self.raw[h.name.0..h.name.1],
                &self.raw[h.value.0..h.value.1],
            )
        })
    }

    /// Whether the client expects the connection to stay open.
    ///
    /// HTTP/1.1 (and anything newer or unrecognized) defaults to
    /// keep-alive unless `Connection: close`; HTTP/1.0 requires an
    /// explicit `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        match self.version {
            Some(Version::Http10) => self
                .header("Connection")
                .map(|v| connection_has(v, "keep-alive"))
                .unwrap_or(false),
            _ => !self
                .header("Connection")
                .map(|v| connection_has(v, "close"))
                .unwrap_or(false),
        }
    }

    /// Declared body length: the `Content-Length` value when present and
    /// all digits, `0` otherwise.
    pub fn content_length(&self) -> u64 {
        match self.header("Content-Length") {
            Some(v) if !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()) => {
                v.parse().unwrap_or(0)
            }
            _ => 0,
        }
    }
}

fn connection_has(value: &str, needle: &str) -> bool {
    value
        .split(',')
        .any(|v| v.trim().eq_ignore_ascii_case(needle))
}

/// request-line = method SP request-target SP HTTP-version CRLF
/// header-field = field-name ":" OWS field-value OWS
/// (RFC 7230 §3; origin-form targets only)
fn parse_head(s: &str) -> Result<Parsed, Parse> {
    let mut pos;

    let sp = s.find(' ').ok_or(Parse::Method)?;
    let method = Method::from_token(&s[..sp]).ok_or(Parse::Method)?;
    pos = sp + 1;

    let sp = s[pos..].find(' ').map(|i| pos + i).ok_or(Parse::Uri)?;
    let (path, query) = match s[pos..sp].find('?') {
        Some(q) => ((pos, pos + q), Some((pos + q + 1, sp))),
        None => ((pos, sp), None),
    };
    let mime = derive_mime(&s[path.0..path.1]);
    pos = sp + 1;

    // Fixed-width version literal: "HTTP/" then major.minor. Byte-wise
    // so a stray multibyte character cannot land a slice mid-codepoint.
    if s.len() < pos + 8 || !s.as_bytes()[pos..].starts_with(b"HTTP/") {
        return Err(Parse::Version);
    }
    let version = s.get(pos + 5..pos + 8).and_then(Version::from_triplet);
    pos += 8;
    if !s.as_bytes()[pos..].starts_with(b"\r\n") {
        return Err(Parse::Version);
    }
    pos += 2;

    let mut headers: Vec<HeaderIndices> = Vec::with_capacity(10);
    while !s[pos..].starts_with("\r\n") {
        let line_end = s[pos..].find("\r\n").map(|i| pos + i).ok_or(Parse::Header)?;
        let line = &s[pos..line_end];
        let colon = line.find(':').ok_or(Parse::Header)?;
        // rfc7230 §3.2.4: no whitespace between field-name and colon
        if line[..colon].bytes().any(|b| b.is_ascii_whitespace()) {
            return Err(Parse::Header);
        }

        let name = (pos, pos + colon);
        let value_raw = &line[colon + 1..];
        let leading = value_raw.len() - value_raw.trim_start_matches([' ', '\t']).len();
        let trimmed = value_raw.trim_matches([' ', '\t']);
        let value_start = pos + colon + 1 + leading;
        let value = (value_start, value_start + trimmed.len());

        // first occurrence wins
        if !headers
            .iter()
            .any(|h| s[h.name.0..h.name.1] == s[name.0..name.1])
        {
            headers.push(HeaderIndices { name, value });
        }
        pos = line_end + 2;
    }
    pos += 2;

    Ok(Parsed {
        method,
        version,
        path,
        query,
        mime,
        headers,
        head_len: pos,
    })
}

/// Extension is whatever follows the final `.` of the last path segment;
/// a dot-less segment means the default document type.
fn derive_mime(path: &str) -> &'static str {
    let last = path.rsplit('/').next().unwrap_or(path);
    match last.rfind('.') {
        Some(dot) => mime::from_extension(&last[dot + 1..]),
        None => "text/html",
    }
}
