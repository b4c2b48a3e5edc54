//! Session persistence at `~/.faize/sessions/`.
//!
//! One pretty-printed JSON document per session (`<id>.json`). The same
//! directory also holds each session's working directory (`<id>/`) and the
//! console socket (`<id>.sock`), so everything about a session lives under
//! a single prefix.

use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{FaizeError, FaizeResult};
use crate::session::types::Session;

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Open the default store under `~/.faize/sessions`, creating it if needed.
    pub fn new() -> FaizeResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| FaizeError::Config("failed to determine home directory".into()))?;
        Self::with_dir(home.join(".faize").join("sessions"))
    }

    /// Open a store rooted at an explicit directory.
    pub fn with_dir(dir: PathBuf) -> FaizeResult<Self> {
        fs::create_dir_all(&dir).map_err(|e| {
            FaizeError::Session(format!(
                "failed to create sessions directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Working directory for one session (bootstrap dir, snapshots, ...).
    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Console socket path for one session.
    pub fn socket_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.sock"))
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persist a session record, replacing any previous one for the ID.
    pub fn save(&self, session: &Session) -> FaizeResult<()> {
        let data = serde_json::to_vec_pretty(session)?;
        fs::write(self.record_path(&session.id), data)
            .map_err(|e| FaizeError::Session(format!("failed to write session file: {e}")))?;
        Ok(())
    }

    pub fn load(&self, id: &str) -> FaizeResult<Session> {
        let path = self.record_path(id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FaizeError::SessionNotFound(id.to_string()));
            }
            Err(e) => {
                return Err(FaizeError::Session(format!(
                    "failed to read session file: {e}"
                )));
            }
        };
        let session = serde_json::from_slice(&data)?;
        Ok(session)
    }

    /// List all saved sessions. Unparsable records are skipped.
    pub fn list(&self) -> FaizeResult<Vec<Session>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(FaizeError::Session(format!(
                    "failed to read sessions directory: {e}"
                )));
            }
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            match self.load(id) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::debug!(id, %e, "skipping unreadable session record");
                }
            }
        }

        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(sessions)
    }

    /// Remove a session record. Absence is not an error.
    pub fn delete(&self, id: &str) -> FaizeResult<()> {
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FaizeError::Session(format!(
                "failed to delete session file: {e}"
            ))),
        }
    }
}
