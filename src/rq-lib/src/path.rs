use unicode_normalization::UnicodeNormalization;

/// Logical tree paths are slash-delimited and always start with `/`.
/// A path whose final segment begins with `.` is a temp path and is never
/// synchronized to the remote.

pub fn clean(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    if !path.starts_with('/') {
        out.push('/');
    }
    out.push_str(path);
    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

pub fn is_temp_name(path: &str) -> bool {
    name_of(path).starts_with('.')
}

pub fn parent_of(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

pub fn name_of(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), name)
    }
}

/// Canonical (NFD) decomposition. Remote repositories and local file systems
/// disagree on the normal form of composed characters; comparing decomposed
/// keeps `é` written by one side equal to `é` written by the other.
pub fn normalize(path: &str) -> String {
    path.nfd().collect()
}

pub fn paths_equal(a: &str, b: &str, no_normalize: bool) -> bool {
    if no_normalize {
        a == b
    } else {
        normalize(a) == normalize(b)
    }
}

/// True when `path` sits strictly below `ancestor`.
pub fn is_descendant(ancestor: &str, path: &str) -> bool {
    if ancestor == "/" {
        return path.len() > 1;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(clean("a/b"), "/a/b");
        assert_eq!(clean("/a/b/"), "/a/b");
        assert_eq!(clean("/"), "/");
    }

    #[test]
    fn test_temp_name() {
        assert!(is_temp_name("/dir/.swp"));
        assert!(is_temp_name("/.hidden"));
        assert!(!is_temp_name("/dir/file.txt"));
        assert!(!is_temp_name("/.tmpdir/file.txt"));
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent_of("/a/b/c"), "/a/b");
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(parent_of("/"), "/");
        assert_eq!(name_of("/a/b/c"), "c");
        assert_eq!(name_of("/a"), "a");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a/b", "c"), "/a/b/c");
        assert_eq!(parent_of(&join("/a", "b")), "/a");
    }

    #[test]
    fn test_unicode_equality() {
        let composed = "/docs/caf\u{e9}.txt";
        let decomposed = "/docs/cafe\u{301}.txt";
        assert!(paths_equal(composed, decomposed, false));
        assert!(!paths_equal(composed, decomposed, true));
    }

    #[test]
    fn test_is_descendant() {
        assert!(is_descendant("/a", "/a/b"));
        assert!(is_descendant("/", "/a"));
        assert!(!is_descendant("/a", "/ab"));
        assert!(!is_descendant("/a/b", "/a"));
        assert!(!is_descendant("/a", "/a"));
    }
}
