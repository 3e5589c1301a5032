//! Default HTML bodies for error responses.

use crate::proto::StatusCode;

macro_rules! page {
    ($code:literal, $reason:literal) => {
        concat!(
            "<html><head><title>",
            $code,
            " ",
            $reason,
            "</title></head><body><h1>",
            $code,
            " ",
            $reason,
            "</h1></body></html>"
        )
    };
}

const BAD_REQUEST: &str = page!(400, "Bad Request");
const UNAUTHORIZED: &str = page!(401, "Unauthorized");
const FORBIDDEN: &str = page!(403, "Forbidden");
const NOT_FOUND: &str = page!(404, "Not Found");
const PROXY_AUTHENTICATION_REQUIRED: &str = page!(407, "Proxy Authentication Required");
const INTERNAL_SERVER_ERROR: &str = page!(500, "Internal Server Error");
const NOT_IMPLEMENTED: &str = page!(501, "Not Implemented");
const SERVICE_UNAVAILABLE: &str = page!(503, "Service Unavailable");
const HTTP_VERSION_NOT_SUPPORTED: &str = page!(505, "HTTP Version Not Supported");

/// The canned body for an error status; empty for anything else.
pub(crate) fn default_page(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => BAD_REQUEST,
        401 => UNAUTHORIZED,
        403 => FORBIDDEN,
        404 => NOT_FOUND,
        407 => PROXY_AUTHENTICATION_REQUIRED,
        500 => INTERNAL_SERVER_ERROR,
        501 => NOT_IMPLEMENTED,
        503 => SERVICE_UNAVAILABLE,
        505 => HTTP_VERSION_NOT_SUPPORTED,
        _ => "",
    }
}

/// The canned body with an extra `<p>` message spliced in.
pub(crate) fn page_with_extra(status: StatusCode, extra: &str) -> String {
    let code = status.as_u16();
    let reason = status.canonical_reason().unwrap_or("Unknown");
    format!(
        "<html><head><title>{code} {reason}</title></head>\
         <body><h1>{code} {reason}</h1><p>{extra}</p></body></html>"
    )
}
