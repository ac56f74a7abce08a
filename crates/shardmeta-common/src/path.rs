//! Namespace path rules
//!
//! Keys are absolute, slash-separated paths. Entries are placed by their
//! parent directory so that siblings share a shard; account roots
//! (`/<uuid>/stor`) are their own directory.

use crate::error::{Error, Result};
use regex::Regex;
use std::sync::LazyLock;
use url::Url;

static ROOT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}/stor$")
        .expect("valid regex")
});

/// Check whether `key` is a namespace root such as
/// `/ff2f9a80-bbda-11e1-afa7-0800200c9a66/stor`.
#[must_use]
pub fn is_namespace_root(key: &str) -> bool {
    ROOT_RE.is_match(key)
}

/// Posix-style parent directory of `key`.
#[must_use]
pub fn dirname(key: &str) -> &str {
    let trimmed = key.trim_end_matches('/');
    if trimmed.is_empty() {
        return if key.starts_with('/') { "/" } else { "." };
    }
    match trimmed.rfind('/') {
        None => ".",
        Some(idx) => {
            let parent = trimmed[..idx].trim_end_matches('/');
            if parent.is_empty() { "/" } else { parent }
        }
    }
}

/// Posix-style last segment of `key`.
#[must_use]
pub fn basename(key: &str) -> &str {
    let trimmed = key.trim_end_matches('/');
    if trimmed.is_empty() {
        return if key.is_empty() { "" } else { "/" };
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// The directory a key is placed by: the key itself for namespace roots,
/// its parent otherwise.
#[must_use]
pub fn effective_dirname(key: &str) -> &str {
    if is_namespace_root(key) {
        key
    } else {
        dirname(key)
    }
}

/// Normalise a shard URL to `scheme://host[:port]/normalised/path`.
///
/// Trailing slashes, `.` and `..` segments and duplicate separators are
/// collapsed so the same shard always yields the same ring node.
pub fn sanitize_url(raw: &str) -> Result<String> {
    let parsed = Url::parse(raw).map_err(|e| Error::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    let host = match (parsed.host_str(), parsed.port()) {
        (Some(h), Some(p)) => format!("{h}:{p}"),
        (Some(h), None) => h.to_string(),
        (None, _) if parsed.scheme() == "file" => String::new(),
        (None, _) => {
            return Err(Error::InvalidUrl {
                url: raw.to_string(),
                reason: "missing host".to_string(),
            });
        }
    };

    let mut segments: Vec<&str> = Vec::new();
    for seg in parsed.path().split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    Ok(format!(
        "{}://{}/{}",
        parsed.scheme(),
        host,
        segments.join("/")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/ff2f9a80-bbda-11e1-afa7-0800200c9a66/stor";

    #[test]
    fn test_dirname_and_basename() {
        assert_eq!(dirname("/a/b/c.txt"), "/a/b");
        assert_eq!(dirname("/a"), "/");
        assert_eq!(dirname("/a/b/"), "/a");
        assert_eq!(dirname("/"), "/");
        assert_eq!(dirname("a"), ".");
        assert_eq!(basename("/a/b/c.txt"), "c.txt");
        assert_eq!(basename("/a/b/"), "b");
        assert_eq!(basename("/"), "/");
    }

    #[test]
    fn test_namespace_root() {
        assert!(is_namespace_root(ROOT));
        assert!(!is_namespace_root(&format!("{ROOT}/foo")));
        assert!(!is_namespace_root("/mark/stor"));
        assert_eq!(effective_dirname(ROOT), ROOT);
        assert_eq!(effective_dirname(&format!("{ROOT}/foo")), ROOT);
        assert_eq!(
            effective_dirname(&format!("{ROOT}/home/foo.txt")),
            format!("{ROOT}/home")
        );
    }

    #[test]
    fn test_sanitize_url() {
        assert_eq!(sanitize_url("tcp://a:2020").unwrap(), "tcp://a:2020/");
        assert_eq!(sanitize_url("tcp://a:2020/").unwrap(), "tcp://a:2020/");
        assert_eq!(
            sanitize_url("tcp://a:2020//x/./y/../z/").unwrap(),
            "tcp://a:2020/x/z"
        );
        assert_eq!(sanitize_url("mem://shard-1").unwrap(), "mem://shard-1/");
        assert_eq!(
            sanitize_url("file:///tmp/x/../s.redb").unwrap(),
            "file:///tmp/s.redb"
        );
        assert!(matches!(
            sanitize_url("not a url"),
            Err(Error::InvalidUrl { .. })
        ));
    }
}
