//! Kernel and rootfs artifact management at `~/.faize/artifacts/`.
//!
//! Artifacts are fetched from the releases URL on first use; when a
//! download is unavailable the build scripts shipped next to the binary
//! (`build-kernel.sh`, `build-rootfs.sh`, `build-claude-rootfs.sh`) are
//! run as a fallback. Downloads land via temp file + rename so a partial
//! fetch never masquerades as a valid image.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::errors::{FaizeError, FaizeResult};

/// GitHub releases URL artifacts are downloaded from.
pub const BASE_URL: &str = "https://github.com/faize-ai/faize/releases/download";
/// Artifact release version.
pub const VERSION: &str = "v0.1.0";

#[derive(Debug, Clone)]
pub struct ArtifactManager {
    dir: PathBuf,
}

impl ArtifactManager {
    /// Open the default manager under `~/.faize/artifacts`, creating it.
    pub fn new() -> FaizeResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| FaizeError::Config("failed to determine home directory".into()))?;
        Self::with_dir(home.join(".faize").join("artifacts"))
    }

    pub fn with_dir(dir: PathBuf) -> FaizeResult<Self> {
        std::fs::create_dir_all(&dir).map_err(|e| {
            FaizeError::Artifact(format!(
                "failed to create artifacts directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The base `~/.faize` directory (parent of the artifacts dir).
    pub fn faize_dir(&self) -> &Path {
        self.dir.parent().unwrap_or(&self.dir)
    }

    pub fn kernel_path(&self) -> PathBuf {
        self.dir.join("vmlinux")
    }

    pub fn rootfs_path(&self) -> PathBuf {
        self.dir.join("rootfs.img")
    }

    pub fn claude_rootfs_path(&self) -> PathBuf {
        self.dir.join("claude-rootfs.img")
    }

    pub fn toolchain_dir(&self) -> PathBuf {
        self.faize_dir().join("toolchain")
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.faize_dir().join("credentials")
    }

    /// Ensure kernel and rootfs exist, downloading or building as needed.
    pub async fn ensure_artifacts(&self) -> FaizeResult<()> {
        self.ensure_kernel().await?;
        self.ensure_rootfs().await?;
        Ok(())
    }

    /// Ensure kernel and the agent rootfs exist.
    pub async fn ensure_claude_rootfs(&self) -> FaizeResult<()> {
        self.ensure_kernel().await?;
        if self.claude_rootfs_path().exists() {
            return Ok(());
        }
        self.build_claude_rootfs(&[]).await
    }

    pub fn ensure_toolchain_dir(&self) -> FaizeResult<()> {
        std::fs::create_dir_all(self.toolchain_dir())?;
        Ok(())
    }

    /// The credentials directory carries secrets; keep it owner-only.
    pub fn ensure_credentials_dir(&self) -> FaizeResult<()> {
        let dir = self.credentials_dir();
        std::fs::create_dir_all(&dir)?;
        let mut perms = std::fs::metadata(&dir)?.permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o700);
        std::fs::set_permissions(&dir, perms)?;
        Ok(())
    }

    /// Remove every artifact and recreate the empty directory.
    pub fn clean(&self) -> FaizeResult<()> {
        std::fs::remove_dir_all(&self.dir)
            .map_err(|e| FaizeError::Artifact(format!("failed to clean artifacts: {e}")))?;
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    async fn ensure_kernel(&self) -> FaizeResult<()> {
        let path = self.kernel_path();
        if path.exists() {
            return Ok(());
        }

        let url = format!("{BASE_URL}/{VERSION}/vmlinux");
        match self.download(&url, &path, "vmlinux kernel").await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::info!(%err, "primary kernel unavailable, building from source");
                self.build_kernel(&path).await
            }
        }
    }

    async fn ensure_rootfs(&self) -> FaizeResult<()> {
        let path = self.rootfs_path();
        if path.exists() {
            return Ok(());
        }

        let url = format!("{BASE_URL}/{VERSION}/rootfs.img");
        match self.download(&url, &path, "rootfs image").await {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("HTTP 404") => {
                tracing::info!("rootfs not in releases, building locally");
                self.build_rootfs().await
            }
            Err(err) => Err(err),
        }
    }

    async fn download(&self, url: &str, dest: &Path, name: &str) -> FaizeResult<()> {
        tracing::info!(url, "downloading {name}");

        let resp = reqwest::get(url)
            .await
            .map_err(|e| FaizeError::Artifact(format!("failed to download {name}: {e}")))?;

        if !resp.status().is_success() {
            return Err(FaizeError::Artifact(format!(
                "failed to download {name}: HTTP {}",
                resp.status().as_u16()
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FaizeError::Artifact(format!("failed to read {name}: {e}")))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(dest).map_err(|e| FaizeError::Io(e.error))?;

        tracing::info!(bytes = bytes.len(), "downloaded {name}");
        Ok(())
    }

    async fn build_kernel(&self, dest: &Path) -> FaizeResult<()> {
        let script = find_build_script("build-kernel.sh")?;
        tracing::info!(script = %script.display(), "building kernel (5-10 minutes on first run)");

        // build-kernel.sh <version> <workdir> <output>; empty workdir lets
        // the script pick a temp directory.
        let status = tokio::process::Command::new("bash")
            .arg(&script)
            .arg("6.6.10")
            .arg("")
            .arg(dest)
            .status()
            .await
            .map_err(|e| FaizeError::Artifact(format!("failed to run build-kernel.sh: {e}")))?;

        if !status.success() {
            return Err(FaizeError::Artifact("failed to build kernel".into()));
        }
        Ok(())
    }

    async fn build_rootfs(&self) -> FaizeResult<()> {
        let script = find_build_script("build-rootfs.sh")?;
        tracing::info!(script = %script.display(), "building rootfs");

        let status = tokio::process::Command::new("bash")
            .arg(&script)
            .arg(self.rootfs_path())
            .status()
            .await
            .map_err(|e| FaizeError::Artifact(format!("failed to run build-rootfs.sh: {e}")))?;

        if !status.success() {
            return Err(FaizeError::Artifact("failed to build rootfs".into()));
        }
        Ok(())
    }

    /// Build the agent rootfs, optionally baking extra apk packages in.
    pub async fn build_claude_rootfs(&self, extra_deps: &[String]) -> FaizeResult<()> {
        let script = find_build_script("build-claude-rootfs.sh")?;
        tracing::info!(script = %script.display(), "building agent rootfs");

        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg(&script).arg(self.claude_rootfs_path());
        if !extra_deps.is_empty() {
            cmd.env("EXTRA_DEPS", extra_deps.join(" "));
        }

        let status = cmd.status().await.map_err(|e| {
            FaizeError::Artifact(format!("failed to run build-claude-rootfs.sh: {e}"))
        })?;

        if !status.success() {
            return Err(FaizeError::Artifact("failed to build agent rootfs".into()));
        }
        Ok(())
    }
}

/// Locate a build script next to the installed binary or in the repo tree.
fn find_build_script(name: &str) -> FaizeResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join("..").join("scripts").join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        for candidate in [cwd.join("scripts").join(name), cwd.join("cli/scripts").join(name)] {
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    Err(FaizeError::Artifact(format!(
        "{name} not found in expected locations"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_under_artifacts_dir() {
        let dir = tempdir().unwrap();
        let artifacts = dir.path().join("artifacts");
        let mgr = ArtifactManager::with_dir(artifacts.clone()).unwrap();

        assert_eq!(mgr.kernel_path(), artifacts.join("vmlinux"));
        assert_eq!(mgr.rootfs_path(), artifacts.join("rootfs.img"));
        assert_eq!(mgr.claude_rootfs_path(), artifacts.join("claude-rootfs.img"));
        assert_eq!(mgr.toolchain_dir(), dir.path().join("toolchain"));
        assert_eq!(mgr.credentials_dir(), dir.path().join("credentials"));
    }

    #[test]
    fn test_credentials_dir_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let mgr = ArtifactManager::with_dir(dir.path().join("artifacts")).unwrap();
        mgr.ensure_credentials_dir().unwrap();

        let mode = std::fs::metadata(mgr.credentials_dir())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_clean_recreates_empty_dir() {
        let dir = tempdir().unwrap();
        let mgr = ArtifactManager::with_dir(dir.path().join("artifacts")).unwrap();
        std::fs::write(mgr.kernel_path(), b"stale").unwrap();

        mgr.clean().unwrap();
        assert!(mgr.dir().exists());
        assert!(!mgr.kernel_path().exists());
    }

    #[test]
    fn test_missing_build_script_reports_name() {
        let err = find_build_script("definitely-missing.sh").unwrap_err();
        assert!(err.to_string().contains("definitely-missing.sh"));
    }
}
