//! Git repository root detection.

use std::path::{Path, PathBuf};
use std::process::Command;

/// Return the enclosing repository root for `dir`, or `None` when the
/// directory is not inside a git repository (or git is unavailable).
pub fn find_root(dir: &Path) -> Option<PathBuf> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["rev-parse", "--show-toplevel"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if root.is_empty() {
        return None;
    }
    Some(PathBuf::from(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_non_repo_returns_none() {
        let dir = tempdir().unwrap();
        assert_eq!(find_root(dir.path()), None);
    }

    #[test]
    fn test_repo_root_found_from_subdir() {
        let dir = tempdir().unwrap();
        let status = Command::new("git")
            .arg("-C")
            .arg(dir.path())
            .args(["init", "-q"])
            .status();
        let Ok(status) = status else {
            return; // git not installed; nothing to verify
        };
        if !status.success() {
            return;
        }

        let sub = dir.path().join("a/b");
        std::fs::create_dir_all(&sub).unwrap();
        let root = find_root(&sub).unwrap();
        assert_eq!(
            root.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }
}
