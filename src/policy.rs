//! A pure predicate over a canonicalised executable path against the
//! configured allow-list. No prefix, glob, or runtime symlink equivalence —
//! exact string equality between cleaned paths, with canonicalisation
//! performed once up front on both sides.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Resolves `path` to an absolute path and lexically cleans it (removes
/// `.`, collapses `..` and duplicate separators). Symlinks are resolved by
/// the caller *before* this is invoked (via `std::fs::canonicalize`) when
/// the real on-disk target matters; this function itself is purely lexical
/// so it also works on paths captured from `/proc/<pid>/exe`, which are
/// already fully resolved by the kernel.
pub fn canonicalize(path: &Path) -> io::Result<PathBuf> {
    // std::fs::canonicalize resolves symlinks and normalizes in one step.
    // Falling back to lexical-only cleaning would let a dangling symlink
    // bypass the allow-list silently; surface the I/O error instead.
    std::fs::canonicalize(path)
}

/// Lexical-only cleanup, for paths that are already resolved (e.g. read
/// from `/proc/<pid>/exe`, which the kernel guarantees is an absolute,
/// symlink-free path already).
pub fn clean_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct ProtectionPolicy {
    allow_list: Vec<PathBuf>,
}

impl ProtectionPolicy {
    /// `allow_list` must already be canonicalised (Config::load does this).
    pub fn new(allow_list: Vec<PathBuf>) -> Self {
        ProtectionPolicy { allow_list }
    }

    pub fn is_protected(&self, exec_path: &Path) -> bool {
        let cleaned = clean_lexically(exec_path);
        self.allow_list.iter().any(|entry| entry == &cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_is_protected() {
        let policy = ProtectionPolicy::new(vec![PathBuf::from("/usr/bin/cat")]);
        assert!(policy.is_protected(Path::new("/usr/bin/cat")));
    }

    #[test]
    fn non_matching_path_is_not_protected() {
        let policy = ProtectionPolicy::new(vec![PathBuf::from("/usr/bin/cat")]);
        assert!(!policy.is_protected(Path::new("/usr/bin/ls")));
    }

    #[test]
    fn prefix_is_not_a_match() {
        let policy = ProtectionPolicy::new(vec![PathBuf::from("/usr/bin/cat")]);
        assert!(!policy.is_protected(Path::new("/usr/bin/cat-extra")));
    }

    #[test]
    fn dotted_paths_are_cleaned_before_comparison() {
        let policy = ProtectionPolicy::new(vec![PathBuf::from("/usr/bin/cat")]);
        assert!(policy.is_protected(Path::new("/usr/bin/../bin/./cat")));
    }

    #[test]
    fn symlink_target_matches_canonical_entry() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real-cat");
        std::fs::write(&target, b"").unwrap();
        let link = dir.path().join("cat-link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let canonical_entry = canonicalize(&link).unwrap();
        let policy = ProtectionPolicy::new(vec![canonical_entry]);
        // A process that execs the symlink shows up in /proc/<pid>/exe as
        // the resolved target, which is already what we canonicalised to.
        assert!(policy.is_protected(&canonicalize(&target).unwrap()));
    }
}
