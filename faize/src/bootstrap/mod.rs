//! Bootstrap directory protocol — the host↔guest message bus.
//!
//! Each session owns a `bootstrap/` directory shared into the guest at
//! `/mnt/bootstrap` via a VirtioFS share tagged `faize-bootstrap`. Every
//! filename in the directory has exactly one producer; consumers on either
//! side acknowledge by removing the file. Producers write atomically
//! (temp file + rename) so consumers never observe partial content, and
//! polling consumers tolerate missing files.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::errors::{FaizeError, FaizeResult};

/// Guest-side mount point of the bootstrap share.
pub const GUEST_MOUNT_POINT: &str = "/mnt/bootstrap";
/// VirtioFS tag of the bootstrap share. Always the first mount of a session.
pub const MOUNT_TAG: &str = "faize-bootstrap";

/// Well-known filenames inside the bootstrap directory.
pub mod filenames {
    /// Shell program run by the rootfs `/init`. Host writes once before start.
    pub const INIT_SCRIPT: &str = "init.sh";
    /// Unix seconds as a decimal string, for guest clock sync.
    pub const HOST_TIME: &str = "hosttime";
    /// `"<cols> <rows>"`; rewritten atomically on every host resize.
    pub const TERM_SIZE: &str = "termsize";
    /// Presence enables guest-side debug output.
    pub const DEBUG_FLAG: &str = "debug";
    /// Single URL from the guest's browser-open shim; host removes to ack.
    pub const OPEN_URL: &str = "open-url";
    /// Reconstructed OAuth callback URL; guest removes to ack.
    pub const AUTH_CALLBACK: &str = "auth-callback";
    /// Newline-separated absolute guest paths modified during the session.
    pub const GUEST_CHANGES: &str = "guest-changes.txt";
    /// `FAIZE_NET` / `FAIZE_DENY` dmesg lines drained by the guest collector.
    pub const NETWORK_LOG: &str = "network.log";
    /// Query log of the guest DNS forwarder.
    pub const DNS_LOG: &str = "dns.log";
    /// Subdirectory holding the clipboard files below.
    pub const CLIPBOARD_DIR: &str = "clipboard";
    pub const CLIPBOARD_TEXT: &str = "clipboard-text";
    pub const CLIPBOARD_IMAGE: &str = "clipboard-image";
    pub const CLIPBOARD_META: &str = "clipboard-meta";
}

/// Handle to one session's bootstrap directory.
#[derive(Debug, Clone)]
pub struct BootstrapDir {
    path: PathBuf,
}

impl BootstrapDir {
    /// Create `<session_dir>/bootstrap` (and parents) and return a handle.
    pub fn create(session_dir: &Path) -> FaizeResult<Self> {
        let path = session_dir.join("bootstrap");
        fs::create_dir_all(&path).map_err(|e| {
            FaizeError::Session(format!(
                "failed to create bootstrap directory {}: {e}",
                path.display()
            ))
        })?;
        Ok(Self { path })
    }

    /// Wrap an existing bootstrap directory without creating it.
    pub fn open(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the clipboard subdirectory (created on first sync).
    pub fn clipboard_dir(&self) -> PathBuf {
        self.path.join(filenames::CLIPBOARD_DIR)
    }

    pub fn termsize_path(&self) -> PathBuf {
        self.path.join(filenames::TERM_SIZE)
    }

    /// Write the init script, executable, before the VM starts.
    pub fn write_init_script(&self, script: &str) -> FaizeResult<()> {
        self.write_atomic(filenames::INIT_SCRIPT, script.as_bytes(), 0o755)
    }

    /// Write the host clock as unix seconds for guest time sync.
    pub fn write_host_time(&self, unix_secs: i64) -> FaizeResult<()> {
        self.write_atomic(filenames::HOST_TIME, unix_secs.to_string().as_bytes(), 0o644)
    }

    /// Publish the current terminal size as `"<cols> <rows>"`.
    ///
    /// The guest watcher polls this file, so the rewrite must be atomic;
    /// a partially written size would be applied verbatim.
    pub fn write_term_size(&self, cols: u16, rows: u16) -> FaizeResult<()> {
        write_term_size_at(&self.termsize_path(), cols, rows)
    }

    /// Drop the debug flag file; its presence is the signal.
    pub fn write_debug_flag(&self) -> FaizeResult<()> {
        self.write_atomic(filenames::DEBUG_FLAG, b"1", 0o644)
    }

    /// Relay an OAuth callback URL to the guest poller.
    pub fn write_auth_callback(&self, url: &str) -> FaizeResult<()> {
        self.write_atomic(filenames::AUTH_CALLBACK, url.as_bytes(), 0o600)
    }

    /// Consume a pending URL-open request, removing the file as the ack.
    ///
    /// Returns `Ok(None)` when no request is pending (or another reader
    /// raced us to the removal). An empty file is consumed and ignored.
    pub fn take_open_url(&self) -> FaizeResult<Option<String>> {
        let path = self.path.join(filenames::OPEN_URL);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Remove first so the guest shim unblocks even if the URL is junk.
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let url = String::from_utf8_lossy(&data).trim().to_string();
        if url.is_empty() {
            return Ok(None);
        }
        Ok(Some(url))
    }

    /// Read the guest's end-of-session change report, one path per line.
    /// Missing file means the guest never got far enough to write one.
    pub fn read_guest_changes(&self) -> FaizeResult<Vec<String>> {
        let path = self.path.join(filenames::GUEST_CHANGES);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(data
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn network_log_path(&self) -> PathBuf {
        self.path.join(filenames::NETWORK_LOG)
    }

    /// Atomic write-then-rename into the bootstrap directory.
    fn write_atomic(&self, name: &str, data: &[u8], mode: u32) -> FaizeResult<()> {
        write_atomic_at(&self.path.join(name), data, mode)
    }
}

/// Write `"<cols> <rows>"` atomically at an explicit path. Used by the
/// attach client's resize handler, which only carries the file path.
pub fn write_term_size_at(path: &Path, cols: u16, rows: u16) -> FaizeResult<()> {
    write_atomic_at(path, format!("{cols} {rows}").as_bytes(), 0o644)
}

/// Write-then-rename in the target's own directory so the rename never
/// crosses filesystems.
pub fn write_atomic_at(path: &Path, data: &[u8], mode: u32) -> FaizeResult<()> {
    let dir = path.parent().ok_or_else(|| {
        FaizeError::Session(format!("path has no parent directory: {}", path.display()))
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))?;
    tmp.persist(path)
        .map_err(|e| FaizeError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_makes_bootstrap_subdir() {
        let dir = tempdir().unwrap();
        let bs = BootstrapDir::create(dir.path()).unwrap();
        assert!(bs.path().is_dir());
        assert_eq!(bs.path(), dir.path().join("bootstrap"));
    }

    #[test]
    fn test_init_script_is_executable() {
        let dir = tempdir().unwrap();
        let bs = BootstrapDir::create(dir.path()).unwrap();
        bs.write_init_script("#!/bin/sh\necho hi\n").unwrap();

        let path = bs.path().join(filenames::INIT_SCRIPT);
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(fs::read_to_string(&path).unwrap(), "#!/bin/sh\necho hi\n");
    }

    #[test]
    fn test_host_time_is_decimal_string() {
        let dir = tempdir().unwrap();
        let bs = BootstrapDir::create(dir.path()).unwrap();
        bs.write_host_time(1_700_000_000).unwrap();
        let data = fs::read_to_string(bs.path().join(filenames::HOST_TIME)).unwrap();
        assert_eq!(data, "1700000000");
    }

    #[test]
    fn test_term_size_exact_format() {
        let dir = tempdir().unwrap();
        let bs = BootstrapDir::create(dir.path()).unwrap();
        bs.write_term_size(120, 40).unwrap();
        let data = fs::read_to_string(bs.termsize_path()).unwrap();
        assert_eq!(data, "120 40");

        // Rewrite replaces the previous value in place.
        bs.write_term_size(80, 24).unwrap();
        let data = fs::read_to_string(bs.termsize_path()).unwrap();
        assert_eq!(data, "80 24");
    }

    #[test]
    fn test_take_open_url_acks_by_removal() {
        let dir = tempdir().unwrap();
        let bs = BootstrapDir::create(dir.path()).unwrap();
        let url_path = bs.path().join(filenames::OPEN_URL);
        fs::write(&url_path, "https://example.com/auth\n").unwrap();

        let url = bs.take_open_url().unwrap();
        assert_eq!(url.as_deref(), Some("https://example.com/auth"));
        assert!(!url_path.exists(), "file must be removed as ack");

        // Second poll observes nothing.
        assert_eq!(bs.take_open_url().unwrap(), None);
    }

    #[test]
    fn test_take_open_url_consumes_empty_file() {
        let dir = tempdir().unwrap();
        let bs = BootstrapDir::create(dir.path()).unwrap();
        let url_path = bs.path().join(filenames::OPEN_URL);
        fs::write(&url_path, "  \n").unwrap();

        assert_eq!(bs.take_open_url().unwrap(), None);
        assert!(!url_path.exists());
    }

    #[test]
    fn test_auth_callback_round_trip() {
        let dir = tempdir().unwrap();
        let bs = BootstrapDir::create(dir.path()).unwrap();
        bs.write_auth_callback("http://localhost:38449/cb?code=abc")
            .unwrap();

        let path = bs.path().join(filenames::AUTH_CALLBACK);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "http://localhost:38449/cb?code=abc"
        );
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // Guest-side ack: removal leaves the bus without the filename.
        fs::remove_file(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_guest_changes_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let bs = BootstrapDir::create(dir.path()).unwrap();
        assert!(bs.read_guest_changes().unwrap().is_empty());
    }

    #[test]
    fn test_guest_changes_skips_blank_lines() {
        let dir = tempdir().unwrap();
        let bs = BootstrapDir::create(dir.path()).unwrap();
        fs::write(
            bs.path().join(filenames::GUEST_CHANGES),
            "/workspace/a.txt\n\n/workspace/b.txt\n",
        )
        .unwrap();
        assert_eq!(
            bs.read_guest_changes().unwrap(),
            vec!["/workspace/a.txt", "/workspace/b.txt"]
        );
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let bs = BootstrapDir::create(dir.path()).unwrap();
        bs.write_term_size(100, 30).unwrap();
        bs.write_term_size(101, 31).unwrap();

        let entries: Vec<_> = fs::read_dir(bs.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec![filenames::TERM_SIZE.to_string()]);
    }
}
