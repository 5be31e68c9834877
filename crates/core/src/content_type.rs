/// Content type used when the extension is unknown.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Guess a content type from a file path's extension.
pub fn from_path(path: &str) -> &'static str {
    let name = path.rsplit('/').next().unwrap_or(path);
    let Some((_, ext)) = name.rsplit_once('.') else {
        return DEFAULT_CONTENT_TYPE;
    };
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" | "cjs" => "application/javascript; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "map" => "application/json; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "csv" => "text/csv; charset=utf-8",
        "xml" => "application/xml; charset=utf-8",
        "yaml" | "yml" => "text/yaml; charset=utf-8",
        "svg" => "image/svg+xml; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wasm" => "application/wasm",
        _ => DEFAULT_CONTENT_TYPE,
    }
}

/// Whether a payload of this type benefits from gzip compression at rest.
pub fn is_compressible(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    if essence.starts_with("text/") {
        return true;
    }
    matches!(
        essence,
        "application/javascript"
            | "application/json"
            | "application/xml"
            | "image/svg+xml"
            | "application/wasm"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_path() {
        assert_eq!(from_path("/scripts/app.JS"), "application/javascript; charset=utf-8");
        assert_eq!(from_path("head.html"), "text/html; charset=utf-8");
        assert_eq!(from_path("fstab.yaml"), "text/yaml; charset=utf-8");
        assert_eq!(from_path("icons/logo.png"), "image/png");
        assert_eq!(from_path("LICENSE"), DEFAULT_CONTENT_TYPE);
        assert_eq!(from_path(".dir/noext"), DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn test_is_compressible() {
        assert!(is_compressible("text/markdown; charset=utf-8"));
        assert!(is_compressible("application/json"));
        assert!(is_compressible("image/svg+xml; charset=utf-8"));
        assert!(!is_compressible("image/png"));
        assert!(!is_compressible("font/woff2"));
        assert!(!is_compressible(DEFAULT_CONTENT_TYPE));
    }
}
