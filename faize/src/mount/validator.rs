//! Protected-path validation for mounts.
//!
//! A fixed list of credential-bearing prefixes is always blocked no matter
//! what the user config says. Sources are symlink-resolved before
//! comparison so a link into `~/.ssh` cannot slip through; when resolution
//! changed the path, the error says so.

use std::path::{Path, PathBuf};

use crate::errors::{FaizeError, FaizeResult};
use crate::mount::parser::{clean_path, expand_path, Mount};

/// Prefixes that can never be mounted, regardless of configuration.
pub const HARDCODED_BLOCKED_PATHS: &[&str] = &[
    "~/.ssh",
    "~/.aws",
    "~/.config/gcloud",
    "~/.gnupg",
    "~/.password-store",
    "~/.docker/config.json",
];

/// Validates mount sources against a set of blocked path prefixes.
#[derive(Debug, Clone)]
pub struct MountValidator {
    blocked: Vec<PathBuf>,
}

impl MountValidator {
    /// Build a validator from blocked-path strings (`~` allowed). Symlinks
    /// in blocked paths are resolved so comparisons are consistent (e.g.
    /// `/etc` vs `/private/etc` on macOS). Empty entries are skipped.
    pub fn new<S: AsRef<str>>(blocked_paths: &[S]) -> FaizeResult<Self> {
        let mut blocked = Vec::with_capacity(blocked_paths.len());
        for path in blocked_paths {
            let path = path.as_ref();
            if path.is_empty() {
                continue;
            }
            let absolute = expand_path(path)?;
            let resolved = std::fs::canonicalize(&absolute).unwrap_or(absolute);
            blocked.push(resolved);
        }
        Ok(Self { blocked })
    }

    /// Reject the mount if its symlink-resolved source is equal to, or a
    /// strict subpath of, any blocked prefix.
    pub fn validate(&self, mount: &Mount) -> FaizeResult<()> {
        let source = clean_path(&mount.source);
        // Resolve symlinks; a path that does not exist yet is compared as-is.
        let resolved = std::fs::canonicalize(&source).unwrap_or_else(|_| source.clone());

        for blocked in &self.blocked {
            if is_under_or_equal(&resolved, blocked) {
                if resolved != source {
                    return Err(FaizeError::BlockedMount(format!(
                        "{} resolves to protected path {}",
                        mount.source.display(),
                        blocked.display()
                    )));
                }
                return Err(FaizeError::BlockedMount(format!(
                    "{} is a protected path",
                    blocked.display()
                )));
            }
        }

        Ok(())
    }
}

/// True if `test` equals `base` or is a strict subpath of it. Comparison is
/// by path components, so `/home/u/.sshrc` is not under `/home/u/.ssh`.
fn is_under_or_equal(test: &Path, base: &Path) -> bool {
    test.starts_with(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    fn mount(source: &Path) -> Mount {
        Mount {
            source: source.to_path_buf(),
            target: source.to_path_buf(),
            read_only: true,
        }
    }

    #[test]
    fn test_blocked_exact_path() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let ssh = root.join(".ssh");
        std::fs::create_dir(&ssh).unwrap();

        let v = MountValidator::new(&[ssh.to_str().unwrap()]).unwrap();
        let err = v.validate(&mount(&ssh)).unwrap_err();
        assert!(err.to_string().contains("is a protected path"));
    }

    #[test]
    fn test_blocked_subpath() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let ssh = root.join(".ssh");
        std::fs::create_dir(&ssh).unwrap();
        let key = ssh.join("id_rsa");
        std::fs::write(&key, "key").unwrap();

        let v = MountValidator::new(&[ssh.to_str().unwrap()]).unwrap();
        assert!(v.validate(&mount(&key)).is_err());
    }

    #[test]
    fn test_sibling_prefix_not_blocked() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let ssh = root.join(".ssh");
        let sshrc = root.join(".sshrc");
        std::fs::create_dir(&ssh).unwrap();
        std::fs::write(&sshrc, "rc").unwrap();

        let v = MountValidator::new(&[ssh.to_str().unwrap()]).unwrap();
        assert!(v.validate(&mount(&sshrc)).is_ok());
    }

    #[test]
    fn test_symlink_into_blocked_path_is_caught() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let ssh = root.join(".ssh");
        std::fs::create_dir(&ssh).unwrap();
        let link = root.join("innocent");
        symlink(&ssh, &link).unwrap();

        let v = MountValidator::new(&[ssh.to_str().unwrap()]).unwrap();
        let err = v.validate(&mount(&link)).unwrap_err();
        assert!(
            err.to_string().contains("resolves to protected path"),
            "unexpected message: {err}"
        );
    }

    #[test]
    fn test_unrelated_path_allowed() {
        let dir = tempdir().unwrap();
        let project = dir.path().join("project");
        std::fs::create_dir(&project).unwrap();

        let v =
            MountValidator::new(&[dir.path().join(".ssh").to_str().unwrap()]).unwrap();
        assert!(v.validate(&mount(&project)).is_ok());
    }

    #[test]
    fn test_empty_blocked_entries_skipped() {
        let v = MountValidator::new(&["", "/nonexistent/blocked"]).unwrap();
        let dir = tempdir().unwrap();
        assert!(v.validate(&mount(dir.path())).is_ok());
    }

    #[test]
    fn test_nonexistent_source_compared_lexically() {
        let dir = tempdir().unwrap();
        let blocked = dir.path().join("secrets");
        // Neither the blocked dir nor the source exist.
        let v = MountValidator::new(&[blocked.to_str().unwrap()]).unwrap();
        assert!(v.validate(&mount(&blocked.join("token"))).is_err());
        assert!(v.validate(&mount(&dir.path().join("open"))).is_ok());
    }

    #[test]
    fn test_hardcoded_list_covers_spec_prefixes() {
        for prefix in [
            "~/.ssh",
            "~/.aws",
            "~/.config/gcloud",
            "~/.gnupg",
            "~/.password-store",
            "~/.docker/config.json",
        ] {
            assert!(HARDCODED_BLOCKED_PATHS.contains(&prefix));
        }
    }
}
