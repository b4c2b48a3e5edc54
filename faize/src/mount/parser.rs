//! Mount-spec parsing.
//!
//! Accepted forms:
//! - `path`                  → target = source, read-only
//! - `path:ro` / `path:rw`   → target = source
//! - `path:target`           → read-only
//! - `path:target:ro|rw`
//!
//! `~` expands to the home directory; results are absolute, lexically
//! cleaned paths. Read-only is the default.

use std::path::{Component, Path, PathBuf};

use crate::errors::{FaizeError, FaizeResult};

/// A host path to be shared into the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Host path (expanded, absolute).
    pub source: PathBuf,
    /// Guest path (defaults to the source path).
    pub target: PathBuf,
    /// Defaults to true unless `:rw` is given.
    pub read_only: bool,
}

/// Parse a mount specification string.
pub fn parse(spec: &str) -> FaizeResult<Mount> {
    if spec.is_empty() {
        return Err(FaizeError::Mount("mount specification cannot be empty".into()));
    }

    let parts: Vec<&str> = spec.split(':').collect();
    let source = expand_path(parts[0])?;

    match parts.as_slice() {
        [_] => Ok(Mount {
            target: source.clone(),
            source,
            read_only: true,
        }),
        [_, mode @ ("ro" | "rw")] => Ok(Mount {
            target: source.clone(),
            source,
            read_only: *mode == "ro",
        }),
        [_, target] => Ok(Mount {
            source,
            target: expand_path(target)?,
            read_only: true,
        }),
        [_, target, mode] => {
            let read_only = match *mode {
                "ro" => true,
                "rw" => false,
                other => {
                    return Err(FaizeError::Mount(format!(
                        "invalid mode '{other}': must be 'ro' or 'rw'"
                    )));
                }
            };
            Ok(Mount {
                source,
                target: expand_path(target)?,
                read_only,
            })
        }
        _ => Err(FaizeError::Mount(format!(
            "invalid mount specification '{spec}': too many colons"
        ))),
    }
}

/// Expand `~`, absolutize against the current directory, and clean.
pub fn expand_path(path: &str) -> FaizeResult<PathBuf> {
    if path.is_empty() {
        return Err(FaizeError::Mount("path cannot be empty".into()));
    }

    let expanded = if path == "~" {
        dirs::home_dir()
            .ok_or_else(|| FaizeError::Mount("failed to determine home directory".into()))?
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .ok_or_else(|| FaizeError::Mount("failed to determine home directory".into()))?
            .join(rest)
    } else {
        PathBuf::from(path)
    };

    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map_err(|e| FaizeError::Mount(format!("failed to get current directory: {e}")))?
            .join(expanded)
    };

    Ok(clean_path(&absolute))
}

/// Lexically normalize a path: resolve `.` and `..`, drop duplicate
/// separators. Does not touch the filesystem.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push(Component::RootDir);
                }
            }
            other => cleaned.push(other),
        }
    }
    if cleaned.as_os_str().is_empty() {
        cleaned.push(Component::RootDir);
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_path_defaults() {
        let m = parse("/data/project").unwrap();
        assert_eq!(m.source, PathBuf::from("/data/project"));
        assert_eq!(m.target, PathBuf::from("/data/project"));
        assert!(m.read_only);
    }

    #[test]
    fn test_path_with_mode() {
        let m = parse("/data/cache:rw").unwrap();
        assert_eq!(m.source, m.target);
        assert!(!m.read_only);

        let m = parse("/data/cache:ro").unwrap();
        assert!(m.read_only);
    }

    #[test]
    fn test_path_with_target() {
        let m = parse("/data/project:/workspace").unwrap();
        assert_eq!(m.source, PathBuf::from("/data/project"));
        assert_eq!(m.target, PathBuf::from("/workspace"));
        assert!(m.read_only);
    }

    #[test]
    fn test_path_with_target_and_mode() {
        let m = parse("/data/project:/workspace:rw").unwrap();
        assert_eq!(m.target, PathBuf::from("/workspace"));
        assert!(!m.read_only);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let err = parse("/data:/guest:rx").unwrap_err();
        assert!(err.to_string().contains("invalid mode"));
    }

    #[test]
    fn test_too_many_colons_rejected() {
        assert!(parse("/a:/b:ro:extra").is_err());
    }

    #[test]
    fn test_empty_spec_rejected() {
        assert!(parse("").is_err());
    }

    #[test]
    fn test_tilde_expansion() {
        let home = dirs::home_dir().unwrap();
        let m = parse("~/project").unwrap();
        assert_eq!(m.source, home.join("project"));
    }

    #[test]
    fn test_relative_path_absolutized() {
        let m = parse("some/dir").unwrap();
        assert!(m.source.is_absolute());
        assert!(m.source.ends_with("some/dir"));
    }

    #[test]
    fn test_clean_path_normalizes() {
        assert_eq!(
            clean_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(clean_path(Path::new("/../..")), PathBuf::from("/"));
        assert_eq!(clean_path(Path::new("/a//b")), PathBuf::from("/a/b"));
    }
}
