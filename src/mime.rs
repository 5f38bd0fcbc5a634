//! Small, built-in extension → MIME-type table, plus the conventional
//! content-types used to mark directories and symlinks at the store
//! boundary (§6).
//!
//! The original implementation loads a system mime file (`/etc/mime.types`)
//! through a process-wide singleton. The distilled spec drops the file
//! format (§1 Non-goals do not cover it, but parsing an OS mime file is
//! outside this crate's concern); this module keeps the lookup surface and
//! bakes in a small table covering the common cases, falling back to
//! `application/octet-stream`.

/// Content-type used to mark a directory object.
pub const DIRECTORY_MIME_TYPE: &str = "application/x-directory";

/// Content-type used to mark a symlink object; the object body holds the
/// target path as plain text.
pub const SYMLINK_MIME_TYPE: &str = "application/symlink";

/// Fallback content-type for anything not found in the table.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const TABLE: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("csv", "text/csv"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("js", "application/javascript"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("tar", "application/x-tar"),
    ("gz", "application/gzip"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
    ("wav", "audio/wav"),
    ("bin", DEFAULT_MIME_TYPE),
];

/// Look up the MIME type for a file path by its extension, case
/// insensitively. Returns [`DEFAULT_MIME_TYPE`] when no entry matches or the
/// path has no extension.
pub fn lookup_mime_type(path: &str) -> &'static str {
    let ext = match path.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => ext,
        _ => return DEFAULT_MIME_TYPE,
    };
    TABLE
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(ext))
        .map(|(_, mime)| *mime)
        .unwrap_or(DEFAULT_MIME_TYPE)
}

/// MIME type to use when creating a directory marker object.
pub fn directory_mime_type() -> &'static str {
    DIRECTORY_MIME_TYPE
}

/// MIME type to use when creating a symlink marker object.
pub fn symlink_mime_type() -> &'static str {
    SYMLINK_MIME_TYPE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extension_resolves() {
        assert_eq!(lookup_mime_type("index.html"), "text/html");
        assert_eq!(lookup_mime_type("archive.TAR"), "application/x-tar");
    }

    #[test]
    fn unknown_extension_falls_back_to_default() {
        assert_eq!(lookup_mime_type("blob.qzx"), DEFAULT_MIME_TYPE);
        assert_eq!(lookup_mime_type("noext"), DEFAULT_MIME_TYPE);
    }
}
