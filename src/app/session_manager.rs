//! Serializes access to south-side agent processes per north-side session,
//! reusing a live process when one is cached and spawning + rebinding one
//! otherwise.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::domain::error::BridgeError;
use crate::domain::session::{Session, SessionStatus};
use crate::infra::agent_process::AgentProcess;
use crate::infra::db::SessionStore;

use super::registry::AgentRegistry;

/// A live agent process bound to a north-side session, plus the south
/// session id it is currently speaking for.
struct SessionSlot {
    process: Arc<AgentProcess>,
    south_session_id: String,
}

pub struct SessionManager {
    registry: Arc<AgentRegistry>,
    store: SessionStore,
    slots: Mutex<HashMap<String, SessionSlot>>,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    workdir: PathBuf,
    grace_period: Duration,
}

/// A bound process ready to take a prompt, returned by [`SessionManager::acquire`].
pub struct Acquired {
    pub process: Arc<AgentProcess>,
    pub south_session_id: String,
}

impl SessionManager {
    #[must_use]
    pub fn new(registry: Arc<AgentRegistry>, store: SessionStore, workdir: PathBuf, grace_period: Duration) -> Self {
        Self {
            registry,
            store,
            slots: Mutex::new(HashMap::new()),
            session_locks: Mutex::new(HashMap::new()),
            workdir,
            grace_period,
        }
    }

    async fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        Arc::clone(
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Ensures a live, handshaken agent process is bound to `session_id`,
    /// reusing a cached one if present, or spawning and rebinding
    /// (resume-or-open_new) per the south session's persisted state.
    ///
    /// # Errors
    /// Returns [`BridgeError::NotFound`] if the session row doesn't exist,
    /// [`BridgeError::AgentNotFound`] if its agent was removed from the
    /// registry, or a spawn/transport error from the handshake.
    pub async fn acquire(&self, session_id: &str) -> Result<Acquired, BridgeError> {
        let session_lock = self.lock_for(session_id).await;
        let _guard = session_lock.lock().await;

        {
            let slots = self.slots.lock().await;
            if let Some(slot) = slots.get(session_id) {
                if !slot.process.has_exited() {
                    return Ok(Acquired {
                        process: Arc::clone(&slot.process),
                        south_session_id: slot.south_session_id.clone(),
                    });
                }
            }
        }

        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("session `{session_id}`")))?;

        if !session.status.can_transition_to(SessionStatus::Active) {
            return Err(BridgeError::Conflict(format!("session `{session_id}` is terminated")));
        }

        let spec = self
            .registry
            .get(&session.agent_name)
            .ok_or_else(|| BridgeError::AgentNotFound(session.agent_name.clone()))?
            .clone();

        let process = Arc::new(AgentProcess::spawn(&spec, &self.workdir).await?);

        let south_session_id = match &session.south_session_id {
            Some(existing) if process.resume(existing).await? => existing.clone(),
            _ => process.open_new(&self.workdir).await?,
        };

        if session.south_session_id.as_deref() != Some(south_session_id.as_str()) {
            let mut updated = session;
            updated.south_session_id = Some(south_session_id.clone());
            updated.status = SessionStatus::Active;
            self.store.update_session(&updated).await?;
        }

        self.slots.lock().await.insert(
            session_id.to_string(),
            SessionSlot {
                process: Arc::clone(&process),
                south_session_id: south_session_id.clone(),
            },
        );

        Ok(Acquired { process, south_session_id })
    }

    /// Marks a session as last-used without tearing down its process.
    pub async fn release(&self, session_id: &str, now: i64) -> Result<(), BridgeError> {
        if let Some(mut session) = self.store.get_session(session_id).await? {
            session.last_active_at = now;
            session.status = SessionStatus::Idle;
            self.store.update_session(&session).await?;
        }
        Ok(())
    }

    /// Tears down the cached process for a session, if any, without
    /// touching its persisted status. Used for idle-reap teardown, where
    /// the session is still usable and simply respawns its process on the
    /// next [`Self::acquire`].
    async fn evict(&self, session_id: &str) {
        let slot = self.slots.lock().await.remove(session_id);
        if let Some(slot) = slot {
            slot.process.terminate(self.grace_period).await;
        }
    }

    /// Tears down the cached process for a session, clears its binding,
    /// and marks it terminated. A terminated session is absorbing: every
    /// future [`Self::acquire`] against it is rejected.
    pub async fn terminate(&self, session_id: &str) {
        self.evict(session_id).await;

        if let Ok(Some(mut session)) = self.store.get_session(session_id).await {
            session.status = SessionStatus::Terminated;
            let _ = self.store.update_session(&session).await;
        }
    }

    /// Spawns a one-shot process for a run with no persisted session,
    /// bound to a fresh south session under `workdir`. The caller owns its
    /// teardown (it is never cached).
    ///
    /// # Errors
    /// Returns a spawn/transport error from the handshake.
    pub async fn ephemeral(&self, agent_name: &str) -> Result<Acquired, BridgeError> {
        let spec = self
            .registry
            .get(agent_name)
            .ok_or_else(|| BridgeError::AgentNotFound(agent_name.to_string()))?
            .clone();

        let process = Arc::new(AgentProcess::spawn(&spec, &self.workdir).await?);
        let south_session_id = process.open_new(&self.workdir).await?;

        Ok(Acquired { process, south_session_id })
    }

    /// Terminates every process whose session has been idle past
    /// `idle_timeout`, skipping any session currently mid-acquire.
    pub async fn reap_idle(&self, idle_timeout: Duration, now: i64) {
        let session_ids: Vec<String> = self.slots.lock().await.keys().cloned().collect();

        for session_id in session_ids {
            let Ok(Some(session)) = self.store.get_session(&session_id).await else {
                continue;
            };
            let idle_for = now.saturating_sub(session.last_active_at);
            if idle_for < i64::try_from(idle_timeout.as_secs()).unwrap_or(i64::MAX) {
                continue;
            }

            let Ok(lock) = self.session_locks.lock().await.get(&session_id).cloned().ok_or(()) else {
                continue;
            };
            let Ok(_guard) = lock.try_lock() else {
                continue;
            };

            self.evict(&session_id).await;
        }
    }

    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentSpec;

    fn registry_with(spec: AgentSpec) -> Arc<AgentRegistry> {
        let json = serde_json::json!({ "agents": [spec] }).to_string();
        Arc::new(AgentRegistry::from_json(&json).unwrap())
    }

    #[tokio::test]
    async fn acquire_on_missing_session_returns_not_found() {
        // Arrange
        let store = SessionStore::open_in_memory().await.unwrap();
        let registry = registry_with(AgentSpec {
            name: "echo".into(),
            description: "echo".into(),
            command: vec!["cat".into()],
            api_key: None,
        });
        let manager = SessionManager::new(registry, store, PathBuf::from("."), Duration::from_secs(2));

        // Act
        let result = manager.acquire("does-not-exist").await;

        // Assert
        assert!(matches!(result, Err(BridgeError::NotFound(_))));
    }

    #[tokio::test]
    async fn acquire_on_terminated_session_returns_conflict() {
        // Arrange
        let store = SessionStore::open_in_memory().await.unwrap();
        let registry = registry_with(AgentSpec {
            name: "echo".into(),
            description: "echo".into(),
            command: vec!["cat".into()],
            api_key: None,
        });
        let manager = SessionManager::new(registry, store.clone(), PathBuf::from("."), Duration::from_secs(2));
        let session = Session {
            id: "sess-1".into(),
            agent_name: "echo".into(),
            south_session_id: None,
            created_at: 0,
            last_active_at: 0,
            status: SessionStatus::Terminated,
            message_count: 0,
        };
        store.create_session(&session).await.unwrap();

        // Act
        let result = manager.acquire("sess-1").await;

        // Assert
        assert!(matches!(result, Err(BridgeError::Conflict(_))));
    }

    #[tokio::test]
    async fn terminate_persists_terminated_status() {
        // Arrange
        let workdir = tempfile::tempdir().unwrap();
        let store = SessionStore::open_in_memory().await.unwrap();
        let registry = registry_with(AgentSpec {
            name: "echo".into(),
            description: "echo".into(),
            command: vec!["cat".into()],
            api_key: None,
        });
        let manager =
            SessionManager::new(registry, store.clone(), workdir.path().to_path_buf(), Duration::from_secs(2));
        let session = Session {
            id: "sess-1".into(),
            agent_name: "echo".into(),
            south_session_id: None,
            created_at: 0,
            last_active_at: 0,
            status: SessionStatus::Active,
            message_count: 0,
        };
        store.create_session(&session).await.unwrap();

        // Act
        manager.terminate("sess-1").await;

        // Assert
        let stored = store.get_session("sess-1").await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Terminated);
    }

    #[tokio::test]
    async fn reap_idle_terminates_only_sessions_past_the_timeout() {
        // Arrange: a real tempdir workdir, same as a handshake would get in
        // production, but isolated per test run.
        let workdir = tempfile::tempdir().unwrap();
        let store = SessionStore::open_in_memory().await.unwrap();
        let registry = registry_with(AgentSpec {
            name: "echo".into(),
            description: "echo".into(),
            command: vec!["cat".into()],
            api_key: None,
        });
        let manager = Arc::new(SessionManager::new(
            registry,
            store.clone(),
            workdir.path().to_path_buf(),
            Duration::from_secs(2),
        ));

        let stale = Session {
            id: "stale".into(),
            agent_name: "echo".into(),
            south_session_id: None,
            created_at: 0,
            last_active_at: 0,
            status: SessionStatus::Idle,
            message_count: 0,
        };
        let fresh = Session {
            id: "fresh".into(),
            agent_name: "echo".into(),
            created_at: 0,
            last_active_at: 1_000,
            south_session_id: None,
            status: SessionStatus::Idle,
            message_count: 0,
        };
        store.create_session(&stale).await.unwrap();
        store.create_session(&fresh).await.unwrap();

        // `cat` echoes our `session/new` request back; it has no
        // `sessionId` key, so `open_new` would fail to extract one. That's
        // fine here: we only need the process cached in `slots`, not a
        // working handshake round-trip, so we seed the cache directly
        // instead of going through a real `acquire()`.
        for id in ["stale", "fresh"] {
            let spec = manager.registry.get("echo").unwrap().clone();
            let process = Arc::new(AgentProcess::spawn(&spec, manager.workdir()).await.unwrap());
            manager.slots.lock().await.insert(
                id.to_string(),
                SessionSlot { process, south_session_id: "south-1".into() },
            );
            // `reap_idle` skips any session with no registered lock (it
            // treats that as "currently mid-acquire"), so seed one here
            // the same way a real `acquire()` would have.
            manager.lock_for(id).await;
        }

        // Act: `now` is far enough past `stale`'s `last_active_at` to reap
        // it, but not past `fresh`'s.
        manager.reap_idle(Duration::from_secs(500), 1_000).await;

        // Assert
        let slots = manager.slots.lock().await;
        assert!(!slots.contains_key("stale"));
        assert!(slots.contains_key("fresh"));
    }
}
