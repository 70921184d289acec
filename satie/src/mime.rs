// src/mime.rs
use std::path::Path;

/// Map a file name to a static MIME string by extension. Unknown
/// extensions fall back to application/octet-stream.
pub fn mime_type_for(path: &Path) -> &'static str {
    let ext = match path.extension().and_then(|s| s.to_str()) {
        Some(e) => e,
        None => return "application/octet-stream",
    };

    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "ico" => "image/x-icon",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gz" => "application/gzip",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_extensions() {
        assert_eq!(mime_type_for(Path::new("index.html")), "text/html");
        assert_eq!(mime_type_for(Path::new("a/b/style.CSS")), "text/css");
        assert_eq!(mime_type_for(Path::new("photo.jpeg")), "image/jpeg");
    }

    #[test]
    fn test_unknown_and_missing_extension() {
        assert_eq!(mime_type_for(Path::new("data.xyz")), "application/octet-stream");
        assert_eq!(mime_type_for(Path::new("Makefile")), "application/octet-stream");
    }
}
