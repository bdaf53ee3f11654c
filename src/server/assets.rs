//! Demo web UI compiled into the binary, served when no external web root is
//! mounted.

const INDEX_HTML: &[u8] = include_bytes!("../../web/index.html");
const APP_JS: &[u8] = include_bytes!("../../web/app.js");

/// Map a request path to embedded bytes and their MIME type.
pub fn lookup(path: &str) -> Option<(&'static [u8], &'static str)> {
    match path.trim_start_matches('/') {
        "" | "index.html" => Some((INDEX_HTML, "text/html; charset=utf-8")),
        "app.js" => Some((APP_JS, "application/javascript")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_serves_index() {
        let (bytes, mime) = lookup("/").expect("index");
        assert!(mime.starts_with("text/html"));
        assert!(!bytes.is_empty());
    }

    #[test]
    fn unknown_paths_miss() {
        assert!(lookup("/missing.css").is_none());
    }
}
