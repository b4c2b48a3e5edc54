//! Session manager stub for platforms without Virtualization.framework.
//!
//! Listing reads the store so `ps` still works anywhere; every VM
//! operation reports the unsupported-platform error.

use async_trait::async_trait;

use crate::errors::{FaizeError, FaizeResult};
use crate::session::{ExitReason, Session, SessionStore};
use crate::vm::{SessionManager, VmConfig};

pub struct StubManager {
    sessions: SessionStore,
}

impl StubManager {
    pub fn new() -> FaizeResult<Self> {
        Ok(Self {
            sessions: SessionStore::new()?,
        })
    }

    pub fn with_store(sessions: SessionStore) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl SessionManager for StubManager {
    async fn create(&self, _cfg: &VmConfig) -> FaizeResult<Session> {
        Err(FaizeError::Unsupported)
    }

    async fn start(&self, _session: &mut Session) -> FaizeResult<()> {
        Err(FaizeError::Unsupported)
    }

    async fn stop(&self, _id: &str, _reason: ExitReason) -> FaizeResult<()> {
        Err(FaizeError::Unsupported)
    }

    async fn list(&self) -> FaizeResult<Vec<Session>> {
        self.sessions.list()
    }

    async fn attach(&self, _id: &str) -> FaizeResult<()> {
        Err(FaizeError::Unsupported)
    }

    async fn wait_for_stop(&self, _id: &str) -> FaizeResult<()> {
        Err(FaizeError::Unsupported)
    }
}
