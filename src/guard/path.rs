//! Path resolution with traversal prevention.
//!
//! Maps a request path to an absolute file beneath the resource root.
//! Nothing outside the canonical root is ever touched: suspicious inputs
//! are rejected before any filesystem call, and the canonicalized result
//! is checked against the root afterwards so symlinks cannot escape
//! either.

use crate::{errors::Reject, limits::SiteConfig};
use std::{io, path::PathBuf};

/// Resolves the path component of a request target (query already
/// stripped) to an absolute file path beneath the resource root.
///
/// Every 403 from this function is reported by the caller as a security
/// violation.
pub(crate) async fn resolve(raw_path: &str, site: &SiteConfig) -> Result<PathBuf, Reject> {
    let decoded = percent_decode(raw_path)?;

    // Leading slashes and backslashes only anchor the path at our root.
    let trimmed = decoded.trim_start_matches(['/', '\\']);

    if has_drive_letter_prefix(trimmed) {
        return Err(Reject::Forbidden("absolute path"));
    }

    let mut relative = PathBuf::new();
    for segment in trimmed.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(Reject::Forbidden("path traversal")),
            segment => relative.push(segment),
        }
    }

    let joined = site.resource_root.join(relative);
    let canonical = tokio::fs::canonicalize(&joined).await.map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Reject::NotFound,
        io::ErrorKind::PermissionDenied => Reject::Forbidden("unreadable path"),
        _ => Reject::Internal,
    })?;

    if !canonical.starts_with(&site.resource_root) {
        return Err(Reject::Forbidden("path escapes resource root"));
    }

    Ok(canonical)
}

/// One decoding pass. Invalid escapes and non-UTF-8 results are rejected
/// rather than passed through.
fn percent_decode(input: &str) -> Result<String, Reject> {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());

    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let (hi, lo) = match (bytes.get(i + 1), bytes.get(i + 2)) {
                    (Some(&hi), Some(&lo)) => (hex_value(hi), hex_value(lo)),
                    _ => (None, None),
                };
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        decoded.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => return Err(Reject::BadRequest("invalid percent-encoding")),
                }
            }
            byte => {
                decoded.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8(decoded).map_err(|_| Reject::BadRequest("non-UTF-8 path"))
}

#[inline]
fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// `C:\...` or `C:/...` after the leading-slash strip.
fn has_drive_letter_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && matches!(bytes[2], b'/' | b'\\')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ServerConfig;
    use std::fs;
    use tempfile::TempDir;

    fn site_with_files() -> (TempDir, SiteConfig) {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("index.html"), "<h1>home</h1>").unwrap();
        fs::create_dir(root.path().join("docs")).unwrap();
        fs::write(root.path().join("docs/guide.txt"), "guide").unwrap();

        let site = SiteConfig::prepare(&ServerConfig::new("127.0.0.1", 8080, root.path())).unwrap();
        (root, site)
    }

    #[tokio::test]
    async fn resolves_files_beneath_root() {
        let (_root, site) = site_with_files();

        let path = resolve("/index.html", &site).await.unwrap();
        assert!(path.starts_with(&site.resource_root));
        assert!(path.ends_with("index.html"));

        let nested = resolve("/docs/guide.txt", &site).await.unwrap();
        assert_eq!(fs::read_to_string(nested).unwrap(), "guide");
    }

    #[tokio::test]
    async fn redundant_segments_are_dropped() {
        let (_root, site) = site_with_files();

        for input in ["//docs//guide.txt", "/./docs/./guide.txt", "docs/guide.txt"] {
            let path = resolve(input, &site).await.unwrap();
            assert!(path.ends_with("docs/guide.txt"), "input: {input:?}");
        }
    }

    #[tokio::test]
    async fn traversal_inputs_forbidden() {
        let (_root, site) = site_with_files();

        #[rustfmt::skip]
        let hostile = [
            "/../etc/passwd",
            "/..",
            "/docs/../../etc/passwd",
            "/%2e%2e/etc/passwd",
            "/%2e%2e%2fetc%2fpasswd",
            "/..%2f..%2fetc%2fpasswd",
            "\\..\\windows\\system32",
        ];
        for input in hostile {
            assert!(
                matches!(resolve(input, &site).await, Err(Reject::Forbidden(_))),
                "resolved: {input:?}"
            );
        }
    }

    #[tokio::test]
    async fn drive_letter_prefixes_forbidden() {
        let (_root, site) = site_with_files();

        for input in ["/C:/windows/win.ini", "C:\\windows\\win.ini", "/c:/x/y"] {
            assert!(
                matches!(resolve(input, &site).await, Err(Reject::Forbidden(_))),
                "resolved: {input:?}"
            );
        }
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (_root, site) = site_with_files();
        assert!(matches!(
            resolve("/nope.html", &site).await,
            Err(Reject::NotFound)
        ));
    }

    #[tokio::test]
    async fn bad_escapes_rejected() {
        let (_root, site) = site_with_files();

        for input in ["/%zz", "/%2", "/%"] {
            assert!(
                matches!(resolve(input, &site).await, Err(Reject::BadRequest(_))),
                "accepted: {input:?}"
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escaping_root_forbidden() {
        let (root, site) = site_with_files();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            root.path().join("leak.txt"),
        )
        .unwrap();

        assert!(matches!(
            resolve("/leak.txt", &site).await,
            Err(Reject::Forbidden(_))
        ));
    }

    #[test]
    fn percent_decode_single_pass() {
        assert_eq!(percent_decode("/a%20b").unwrap(), "/a b");
        // "%252e" decodes to "%2e", not ".": double-encoded traversal
        // stays visible as literal text, not as a dot segment.
        assert_eq!(percent_decode("/%252e%252e").unwrap(), "/%2e%2e");
    }
}
