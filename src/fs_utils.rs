//! Filesystem helpers shared across the crate: lexical path arithmetic,
//! C/C++ extension classification, environment expansion, and the content
//! fingerprints the skip cache is built on.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use md5::{Digest, Md5};

use crate::error::Result;

/// Extensions treated as C/C++ sources by the watcher and the indexer.
const CPP_EXTENSIONS: [&str; 8] = ["c", "cc", "cpp", "cxx", "h", "hh", "hpp", "hxx"];

/// True when `path` starts with every component of `prefix`.
pub fn path_has_prefix(path: &Path, prefix: &Path) -> bool {
    path.starts_with(prefix)
}

/// Lexical relative path from `base` to `path`, walking up with `..` where
/// the two diverge. Neither path is touched on disk; both should be absolute
/// or both relative for the result to be meaningful.
pub fn relative_to(path: &Path, base: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix(base) {
        if stripped.as_os_str().is_empty() {
            return PathBuf::from(".");
        }
        return stripped.to_path_buf();
    }

    let path_parts: Vec<Component> = path.components().collect();
    let base_parts: Vec<Component> = base.components().collect();

    let common = path_parts
        .iter()
        .zip(base_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base_parts.len() {
        rel.push("..");
    }
    for part in &path_parts[common..] {
        rel.push(part);
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}

/// Joins `path` onto `base` unless it is already absolute.
pub fn absolute_from(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// True for the file extensions the indexer cares about.
pub fn is_cpp_source(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| CPP_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expands `${NAME}` occurrences from the process environment. Unset
/// variables expand to the empty string.
pub fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Ok(v) = std::env::var(name) {
                    out.push_str(&v);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Last modification time as whole seconds since the epoch.
pub fn last_mtime(path: &Path) -> Result<i64> {
    let meta = fs::metadata(path)?;
    let mtime = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(mtime)
}

/// MD5 digest of a byte buffer.
pub fn content_md5(content: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(content);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_under_base() {
        assert_eq!(
            relative_to(Path::new("/home/p/src/a.cpp"), Path::new("/home/p")),
            PathBuf::from("src/a.cpp")
        );
    }

    #[test]
    fn relative_needs_parent_steps() {
        assert_eq!(
            relative_to(Path::new("/home/p/src"), Path::new("/home/p/build/exe")),
            PathBuf::from("../../src")
        );
    }

    #[test]
    fn relative_of_base_itself_is_dot() {
        assert_eq!(
            relative_to(Path::new("/home/p"), Path::new("/home/p")),
            PathBuf::from(".")
        );
    }

    #[test]
    fn cpp_extension_classification() {
        assert!(is_cpp_source(Path::new("a.cpp")));
        assert!(is_cpp_source(Path::new("a.h")));
        assert!(is_cpp_source(Path::new("dir/a.CC")));
        assert!(!is_cpp_source(Path::new("a.rs")));
        assert!(!is_cpp_source(Path::new("Makefile")));
    }

    #[test]
    fn env_expansion() {
        std::env::set_var("SYMDB_TEST_HOME", "/data");
        assert_eq!(expand_env("${SYMDB_TEST_HOME}/db"), "/data/db");
        assert_eq!(expand_env("no vars"), "no vars");
        assert_eq!(expand_env("${SYMDB_TEST_UNSET_VAR}/x"), "/x");
    }

    #[test]
    fn md5_is_stable() {
        assert_eq!(content_md5(b"abc"), content_md5(b"abc"));
        assert_ne!(content_md5(b"abc"), content_md5(b"abd"));
    }
}
