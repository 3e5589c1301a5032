//! Static extension → media-type table.

/// Fallback for extensions the table does not know.
pub(crate) const OCTET_STREAM: &str = "application/octet-stream";

/// Look up the media type for a file extension (without the dot).
pub(crate) fn from_extension(ext: &str) -> &'static str {
    match ext {
        "aac" => "audio/aac",
        "arc" => "application/x-freearc",
        "avi" => "video/x-msvideo",
        "bin" => "application/octet-stream",
        "bmp" => "image/bmp",
        "bz" => "application/x-bzip",
        "bz2" => "application/x-bzip2",
        "css" => "text/css",
        "csv" => "text/csv",
        "doc" => "application/msword",
        "docx" => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        "eot" => "application/vnd.ms-fontobject",
        "epub" => "application/epub+zip",
        "gif" => "image/gif",
        "htm" | "html" => "text/html",
        "ico" => "image/vnd.microsoft.icon",
        "jpeg" | "jpg" => "image/jpeg",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "mpeg" => "video/mpeg",
        "otf" => "font/otf",
        "png" => "image/png",
        "pdf" => "application/pdf",
        "ppt" => "application/vnd.ms-powerpoint",
        "rar" => "application/x-rar-compressed",
        "svg" => "image/svg+xml",
        "tar" => "application/x-tar",
        "ttf" => "font/ttf",
        "txt" => "text/plain",
        "wav" => "audio/wav",
        "weba" => "audio/webm",
        "webm" => "video/webm",
        "webp" => "image/webp",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "xml" => "text/xml",
        "zip" => "application/zip",
        _ => OCTET_STREAM,
    }
}
