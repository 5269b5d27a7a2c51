// SPDX-License-Identifier: AGPL-3.0-or-later
// Pure, side-effect-free path transforms. Everything in this module is
// lexical: nothing here touches the filesystem. The reservation scheduler
// and the directory cache both key off `cache_key`, so the exact composition
// of these functions is load-bearing.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, OnceLock};

// Unicode folding
use unicode_normalization::UnicodeNormalization;

/// Memo table for `normalize_unicode`. Archive members repeat the same
/// directory prefixes over and over, so the table amortizes quickly.
static UNICODE_MEMO: OnceLock<Mutex<HashMap<String, String>>> = OnceLock::new();

/// NFKC-fold a path so that visually equivalent names collide on one key.
/// ASCII input short-circuits (NFKC of ASCII is the identity).
pub fn normalize_unicode(path: &str) -> String {
    if path.is_ascii() {
        return path.to_string();
    }
    let memo = UNICODE_MEMO.get_or_init(|| Mutex::new(HashMap::new()));
    {
        let map = memo.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hit) = map.get(path) {
            return hit.clone();
        }
    }
    let folded: String = path.nfkc().collect();
    let mut map = memo.lock().unwrap_or_else(|e| e.into_inner());
    map.insert(path.to_string(), folded.clone());
    folded
}

/// Remove any number of trailing `/`, except when the entire path is `/`.
pub fn strip_trailing_slashes(path: &str) -> &str {
    if path.is_empty() {
        return path;
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// In windows mode every `\` becomes `/` so the rest of the pipeline only
/// ever sees one separator.
pub fn normalize_separators(path: &str, win: bool) -> String {
    if win {
        path.replace('\\', "/")
    } else {
        path.to_string()
    }
}

/// Length of the leading root prefix of `p`: `/`, a drive letter with colon
/// (and optional slash), or a UNC `//host/share/` prefix. Zero if `p` is
/// relative. Separators must already be normalized.
fn root_prefix_len(p: &str, win: bool) -> usize {
    let bytes = p.as_bytes();
    if win {
        if let Some(rest) = p.strip_prefix("//") {
            // UNC: `//host/share/...` anchors at the share
            match rest.find('/') {
                Some(host_end) => {
                    let after_host = &rest[host_end + 1..];
                    let share_end = match after_host.find('/') {
                        Some(i) => i + 1,
                        None => after_host.len(),
                    };
                    return 2 + host_end + 1 + share_end;
                }
                None => return p.len(),
            }
        }
        if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
            // `c:/` and bare `c:` (drive-relative) both anchor outside the
            // extraction tree
            if bytes.len() >= 3 && bytes[2] == b'/' {
                return 3;
            }
            return 2;
        }
    }
    if bytes.first() == Some(&b'/') {
        return 1;
    }
    0
}

/// Split `path` into (root-prefix, remainder). The root prefix is empty when
/// the path is already relative; otherwise it collects every leading root
/// (repeated slashes, stacked drive prefixes) so the remainder is guaranteed
/// relative.
pub fn strip_absolute(path: &str, win: bool) -> (String, String) {
    let mut root = String::new();
    let mut rest = path;
    loop {
        let n = root_prefix_len(rest, win);
        if n == 0 {
            break;
        }
        root.push_str(&rest[..n]);
        rest = &rest[n..];
    }
    (root, rest.to_string())
}

/// Canonical key used by the reservation scheduler and the directory cache:
/// separators normalized, unicode folded, trailing slashes dropped, case
/// folded. Idempotent.
pub fn cache_key(path: &str, win: bool) -> String {
    let seps = normalize_separators(path, win);
    let folded = normalize_unicode(&seps);
    strip_trailing_slashes(&folded).to_lowercase()
}

const WIN_RESERVED: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Re-encode characters that cannot appear in Windows file names into their
/// private-use-area twins at U+F000 + codepoint. The drive-letter root (if
/// any) is left alone so `c:/` keeps its colon.
pub fn encode_windows_chars(path: &str) -> String {
    let (drive, rest) = split_drive(path);
    let mut out = String::with_capacity(path.len());
    out.push_str(drive);
    for c in rest.chars() {
        if WIN_RESERVED.contains(&c) {
            out.push(char::from_u32(0xF000 + c as u32).unwrap_or(c));
        } else {
            out.push(c);
        }
    }
    out
}

fn split_drive(path: &str) -> (&str, &str) {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        path.split_at(2)
    } else {
        ("", path)
    }
}

/// Proper-prefix directories of `path`, ordered from the filesystem root down
/// to the immediate parent. `/a/b/c` yields `["/", "/a", "/a/b"]`; the root
/// itself has no ancestors. Windows drive keys (`c:/a/b`) chain from the
/// drive root instead of `/`.
pub fn ancestors(path: &str) -> Vec<String> {
    let norm = strip_trailing_slashes(path);
    if norm == "/" {
        return Vec::new();
    }
    let mut out: Vec<String> = Vec::new();
    match norm.strip_prefix('/') {
        Some(rest) => {
            out.push("/".to_string());
            let segs: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
            let mut prefix = String::new();
            for seg in segs.iter().take(segs.len().saturating_sub(1)) {
                prefix.push('/');
                prefix.push_str(seg);
                out.push(prefix.clone());
            }
        }
        None => {
            let segs: Vec<&str> = norm.split('/').collect();
            for i in 1..segs.len() {
                out.push(segs[..i].join("/"));
            }
        }
    }
    out
}

/// Lexically normalizes a path by removing `.` and resolving `..` where
/// possible. This does NOT access the filesystem.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                // pop() stops at root/prefix for absolute paths If nothing to
                // pop and original path is relative, keep leading ".."
                if !out.pop() && !path.is_absolute() {
                    out.push("..");
                }
            }
            Component::Normal(c) => out.push(c),
            // Preserve platform-specific prefix/root (Windows drive letters,
            // UNC, etc.)
            Component::RootDir | Component::Prefix(_) => out.push(
                comp.as_os_str()
            )
        }
    }

    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

/// Resolve an archive-relative path against `base` and normalize the result.
/// An already-absolute `rel` (preserve-paths mode) resolves as-is.
pub fn resolve_under(base: &Path, rel: &str) -> PathBuf {
    let p = Path::new(rel);
    if p.is_absolute() {
        lexical_normalize(p)
    } else {
        lexical_normalize(&base.join(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_idempotent() {
        for p in ["/a/B/c/", "/ä/б", "c:\\Windows\\Temp\\", "/x//y///"] {
            let once = cache_key(p, true);
            assert_eq!(cache_key(&once, true), once);
        }
    }

    #[test]
    fn trailing_slashes() {
        assert_eq!(strip_trailing_slashes("/"), "/");
        assert_eq!(strip_trailing_slashes("///"), "/");
        assert_eq!(strip_trailing_slashes("/a/b//"), "/a/b");
        assert_eq!(strip_trailing_slashes("a/"), "a");
        assert_eq!(strip_trailing_slashes(""), "");
    }

    #[test]
    fn ancestors_chain() {
        assert_eq!(ancestors("/a/b/c"), vec!["/", "/a", "/a/b"]);
        assert_eq!(ancestors("/a"), vec!["/"]);
        assert!(ancestors("/").is_empty());
        // trailing slashes do not change the chain
        assert_eq!(ancestors("/a/b/"), ancestors("/a/b"));
    }

    #[test]
    fn ancestors_are_strictly_ordered_and_unique() {
        let dirs = ancestors("/one/two/three/four");
        let mut seen = std::collections::HashSet::new();
        for d in &dirs {
            assert!(seen.insert(d.clone()), "duplicate ancestor {}", d);
        }
        for pair in dirs.windows(2) {
            assert!(pair[0].len() < pair[1].len());
        }
        assert_eq!(dirs[0], "/");
    }

    #[test]
    fn strip_absolute_posix() {
        assert_eq!(
            strip_absolute("/etc/passwd", false),
            ("/".to_string(), "etc/passwd".to_string())
        );
        assert_eq!(
            strip_absolute("////x", false),
            ("////".to_string(), "x".to_string())
        );
        assert_eq!(
            strip_absolute("rel/path", false),
            (String::new(), "rel/path".to_string())
        );
    }

    #[test]
    fn strip_absolute_windows() {
        assert_eq!(
            strip_absolute("c:/temp/x", true),
            ("c:/".to_string(), "temp/x".to_string())
        );
        assert_eq!(
            strip_absolute("c:temp", true),
            ("c:".to_string(), "temp".to_string())
        );
        assert_eq!(
            strip_absolute("//host/share/x", true),
            ("//host/share/".to_string(), "x".to_string())
        );
    }

    #[test]
    fn windows_char_encoding() {
        assert_eq!(encode_windows_chars("a<b"), "a\u{f03c}b");
        assert_eq!(encode_windows_chars("c:/we|rd"), "c:/we\u{f07c}rd");
        // the drive colon survives, later colons do not
        assert_eq!(encode_windows_chars("c:/a:b"), "c:/a\u{f03a}b");
    }

    #[test]
    fn lexical_normalize_resolves_dots() {
        assert_eq!(
            lexical_normalize(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
        assert_eq!(
            lexical_normalize(Path::new("../x")),
            PathBuf::from("../x")
        );
    }
}
