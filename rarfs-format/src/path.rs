//! Member path sanitization.
//!
//! Every name that ends up in a cache, no matter whether it came from a
//! top-level archive, a nested one or an alias, passes through
//! [`sanitize_member_path`] so all entry points share identical behavior.

/// Longest accepted member path, in bytes.
pub const MAX_MEMBER_PATH: usize = 4096;

/// Sanitize a member name as recorded in an archive.
///
/// Rules, in order: length and emptiness bounds, no absolute POSIX paths,
/// no drive-letter absolute paths, strict UTF-8, backslash normalization,
/// removal of `.`/`..` segments and empty components. Returns the cleaned
/// relative path, or `None` for anything that must not appear in the tree.
pub fn sanitize_member_path(raw: &[u8]) -> Option<String> {
    if raw.is_empty() || raw.len() > MAX_MEMBER_PATH {
        return None;
    }
    if raw[0] == b'/' || raw[0] == b'\\' {
        return None;
    }
    // Drive-letter absolute paths: letter, colon, separator.
    if raw.len() >= 3
        && raw[0].is_ascii_alphabetic()
        && raw[1] == b':'
        && (raw[2] == b'/' || raw[2] == b'\\')
    {
        return None;
    }

    let text = std::str::from_utf8(raw).ok()?;
    let normalized = text.replace('\\', "/");

    let mut parts: Vec<&str> = Vec::new();
    for component in normalized.split('/') {
        match component {
            "" | "." | ".." => continue,
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Whether the raw name marks a directory by convention (trailing
/// separator), independent of any header flag.
pub fn has_trailing_separator(raw: &[u8]) -> bool {
    matches!(raw.last(), Some(b'/') | Some(b'\\'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(raw: &[u8]) -> String {
        sanitize_member_path(raw).expect("expected path to pass")
    }

    #[test]
    fn plain_names_pass_unchanged() {
        assert_eq!(ok(b"hello.txt"), "hello.txt");
        assert_eq!(ok(b"dir/sub/file"), "dir/sub/file");
        assert_eq!(ok("snö/fil.txt".as_bytes()), "sn\u{f6}/fil.txt");
    }

    #[test]
    fn rejects_absolute_paths() {
        assert_eq!(sanitize_member_path(b"/etc/passwd"), None);
        assert_eq!(sanitize_member_path(b"\\windows\\system32"), None);
        assert_eq!(sanitize_member_path(b"C:\\boot.ini"), None);
        assert_eq!(sanitize_member_path(b"c:/boot.ini"), None);
        // A colon without a separator is just a weird file name.
        assert_eq!(ok(b"c:file"), "c:file");
    }

    #[test]
    fn strips_traversal_components() {
        assert_eq!(ok(b"../../../etc/passwd"), "etc/passwd");
        assert_eq!(ok(b"a/../b"), "a/b");
        assert_eq!(ok(b"a/./b"), "a/b");
        assert_eq!(ok(b"..\\..\\x"), "x");
        assert_eq!(sanitize_member_path(b".."), None);
        assert_eq!(sanitize_member_path(b"../.."), None);
        assert_eq!(sanitize_member_path(b"./."), None);
    }

    #[test]
    fn normalizes_backslashes() {
        assert_eq!(ok(b"dir\\sub\\file.bin"), "dir/sub/file.bin");
    }

    #[test]
    fn rejects_invalid_utf8() {
        assert_eq!(sanitize_member_path(&[0x66, 0xff, 0x6f]), None);
        // Overlong encoding of '/'.
        assert_eq!(sanitize_member_path(&[b'a', 0xc0, 0xaf, b'b']), None);
        // Encoded surrogate half.
        assert_eq!(sanitize_member_path(&[0xed, 0xa0, 0x80]), None);
    }

    #[test]
    fn enforces_length_bounds() {
        assert_eq!(sanitize_member_path(b""), None);
        let long = vec![b'a'; MAX_MEMBER_PATH + 1];
        assert_eq!(sanitize_member_path(&long), None);
        let edge = vec![b'a'; MAX_MEMBER_PATH];
        assert!(sanitize_member_path(&edge).is_some());
    }

    #[test]
    fn collapses_empty_components() {
        assert_eq!(ok(b"a//b"), "a/b");
        assert_eq!(ok(b"a/b/"), "a/b");
        assert_eq!(sanitize_member_path(b"//"), None);
    }

    #[test]
    fn trailing_separator_detection() {
        assert!(has_trailing_separator(b"dir/"));
        assert!(has_trailing_separator(b"dir\\"));
        assert!(!has_trailing_separator(b"dir"));
        assert!(!has_trailing_separator(b""));
    }
}
