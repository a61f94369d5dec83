//! Repository path helpers
//!
//! Paths are stored relative to the root without leading or trailing
//! slashes; the root itself is the empty string.

use crate::error::{FsError, Result};

/// Canonicalize a user-supplied path
pub fn canonicalize(path: &str) -> Result<String> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" => continue,
            "." | ".." => return Err(FsError::InvalidPath(path.to_string())),
            p if p.contains('\n') || p.contains('\0') => return Err(FsError::InvalidPath(path.to_string())),
            p => parts.push(p),
        }
    }
    Ok(parts.join("/"))
}

/// Path components of a canonical path
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|p| !p.is_empty())
}

/// Split a canonical path into parent and basename; `None` for the root
pub fn split(path: &str) -> Option<(&str, &str)> {
    if path.is_empty() {
        return None;
    }
    Some(match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    })
}

pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Whether `ancestor` is `path` or one of its parents
pub fn is_ancestor_or_self(ancestor: &str, path: &str) -> bool {
    ancestor.is_empty()
        || path == ancestor
        || (path.len() > ancestor.len() && path.starts_with(ancestor) && path.as_bytes()[ancestor.len()] == b'/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("/trunk//src/").unwrap(), "trunk/src");
        assert_eq!(canonicalize("/").unwrap(), "");
        assert_eq!(canonicalize("").unwrap(), "");
        assert!(canonicalize("a/../b").is_err());
        assert!(canonicalize("./a").is_err());
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split("a/b/c"), Some(("a/b", "c")));
        assert_eq!(split("a"), Some(("", "a")));
        assert_eq!(split(""), None);
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a/b", "c"), "a/b/c");
    }

    #[test]
    fn test_is_ancestor_or_self() {
        assert!(is_ancestor_or_self("a", "a/b"));
        assert!(!is_ancestor_or_self("a/b", "a"));
        assert!(is_ancestor_or_self("", "x"));
        assert!(is_ancestor_or_self("a/b", "a/b"));
        assert!(!is_ancestor_or_self("a", "ab"));
        assert!(!is_ancestor_or_self("a/b", "a/c"));
    }
}
