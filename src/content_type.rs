//! Content Type Module
//!
//! Maps object-key extensions to MIME types and MIME types to the eight
//! object categories used for per-type cache policy.

/// Object category used to select cache policy and tag responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectCategory {
    Image,
    Video,
    Audio,
    Font,
    Document,
    Static,
    Archive,
    Binary,
}

impl ObjectCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectCategory::Image => "image",
            ObjectCategory::Video => "video",
            ObjectCategory::Audio => "audio",
            ObjectCategory::Font => "font",
            ObjectCategory::Document => "document",
            ObjectCategory::Static => "static",
            ObjectCategory::Archive => "archive",
            ObjectCategory::Binary => "binary",
        }
    }
}

impl std::fmt::Display for ObjectCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Look up the MIME type for an object key by its extension.
///
/// The extension after the last dot wins and is matched case-insensitively.
/// Keys without a known extension map to `application/octet-stream`.
pub fn mime_for_key(key: &str) -> &'static str {
    let ext = match key.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "application/octet-stream",
    };

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",

        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "mpg" | "mpeg" => "video/mpeg",

        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "aac" => "audio/aac",
        "m4a" => "audio/mp4",

        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "eot" => "application/vnd.ms-fontobject",

        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "rtf" => "application/rtf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",

        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "map" => "application/json",
        "wasm" => "application/wasm",

        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "bz2" => "application/x-bzip2",
        "xz" => "application/x-xz",
        "7z" => "application/x-7z-compressed",
        "rar" => "application/vnd.rar",

        _ => "application/octet-stream",
    }
}

const ARCHIVE_MIMES: &[&str] = &[
    "application/zip",
    "application/gzip",
    "application/x-tar",
    "application/x-bzip2",
    "application/x-xz",
    "application/x-7z-compressed",
    "application/vnd.rar",
    "application/java-archive",
];

const DOCUMENT_MIMES: &[&str] = &[
    "application/pdf",
    "text/plain",
    "text/csv",
    "text/markdown",
    "application/rtf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
];

const STATIC_MIMES: &[&str] = &[
    "text/html",
    "text/css",
    "text/javascript",
    "application/javascript",
    "application/json",
    "application/xml",
    "text/xml",
    "application/wasm",
];

/// Classify a MIME string into an object category.
///
/// Pure function of the MIME value: the `image/`, `video/`, `audio/` and
/// `font/` prefixes map to their obvious categories, explicit sets cover
/// archives, documents and static assets, and everything else is `binary`.
pub fn categorize(mime: &str) -> ObjectCategory {
    let mime = mime
        .split(';')
        .next()
        .unwrap_or(mime)
        .trim()
        .to_ascii_lowercase();

    if mime.starts_with("image/") {
        return ObjectCategory::Image;
    }
    if mime.starts_with("video/") {
        return ObjectCategory::Video;
    }
    if mime.starts_with("audio/") {
        return ObjectCategory::Audio;
    }
    if mime.starts_with("font/") || mime == "application/vnd.ms-fontobject" {
        return ObjectCategory::Font;
    }
    if ARCHIVE_MIMES.contains(&mime.as_str()) {
        return ObjectCategory::Archive;
    }
    if DOCUMENT_MIMES.contains(&mime.as_str()) {
        return ObjectCategory::Document;
    }
    if STATIC_MIMES.contains(&mime.as_str()) {
        return ObjectCategory::Static;
    }

    ObjectCategory::Binary
}
