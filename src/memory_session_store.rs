// SPDX-License-Identifier: Apache-2.0
use actix_session::storage::{LoadError, SaveError, SessionKey, SessionStore, UpdateError};
use actix_web::cookie::time::Duration;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, error};
use uuid::Uuid;

/// Absolute session lifetime, counted from creation and never extended.
pub const SESSION_LIFETIME: std::time::Duration = std::time::Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct StoredSession {
    data: HashMap<String, String>,
    created_at: Instant,
}

/// Server-side session storage; the cookie carries only a random key.
#[derive(Debug, Clone)]
pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, StoredSession>>>,
    lifetime: std::time::Duration,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::with_lifetime(SESSION_LIFETIME)
    }

    pub fn with_lifetime(lifetime: std::time::Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            lifetime,
        }
    }

    fn expired(&self, session: &StoredSession) -> bool {
        session.created_at.elapsed() >= self.lifetime
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_error(e: impl std::fmt::Display) -> anyhow::Error {
    error!(error = %e, "Session store lock poisoned");
    anyhow::anyhow!("session store lock poisoned: {}", e)
}

impl SessionStore for MemorySessionStore {
    async fn load(&self, session_key: &SessionKey) -> Result<Option<HashMap<String, String>>, LoadError> {
        let key = session_key.as_ref();
        let found = {
            let sessions = self.sessions.read().map_err(|e| LoadError::Other(lock_error(e)))?;
            sessions.get(key).cloned()
        };

        match found {
            Some(session) if self.expired(&session) => {
                debug!("Session past its absolute lifetime, discarding");
                if let Ok(mut sessions) = self.sessions.write() {
                    sessions.remove(key);
                }
                Ok(None)
            }
            Some(session) => Ok(Some(session.data)),
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        session_data: HashMap<String, String>,
        _ttl: &Duration,
    ) -> Result<SessionKey, SaveError> {
        let session_key = SessionKey::try_from(Uuid::new_v4().to_string())
            .map_err(|e| SaveError::Other(anyhow::anyhow!("failed to create session key: {}", e)))?;

        let mut sessions = self.sessions.write().map_err(|e| SaveError::Other(lock_error(e)))?;
        // Drop anything past its lifetime while we hold the write lock
        sessions.retain(|_, s| s.created_at.elapsed() < self.lifetime);
        sessions.insert(
            session_key.as_ref().to_string(),
            StoredSession {
                data: session_data,
                created_at: Instant::now(),
            },
        );
        debug!(sessions = sessions.len(), "Created session");
        Ok(session_key)
    }

    async fn update(
        &self,
        session_key: SessionKey,
        session_data: HashMap<String, String>,
        ttl: &Duration,
    ) -> Result<SessionKey, UpdateError> {
        {
            let mut sessions = self.sessions.write().map_err(|e| UpdateError::Other(lock_error(e)))?;
            if let Some(existing) = sessions.get_mut(session_key.as_ref()) {
                existing.data = session_data;
                return Ok(session_key);
            }
        }

        // Key vanished (expired or deleted) between load and update
        self.save(session_data, ttl)
            .await
            .map_err(|e| UpdateError::Other(anyhow::anyhow!("{}", e)))
    }

    async fn update_ttl(&self, _session_key: &SessionKey, _ttl: &Duration) -> Result<(), anyhow::Error> {
        // Lifetime is absolute, so refreshing the cookie never extends it
        Ok(())
    }

    async fn delete(&self, session_key: &SessionKey) -> Result<(), anyhow::Error> {
        let mut sessions = self.sessions.write().map_err(lock_error)?;
        let removed = sessions.remove(session_key.as_ref()).is_some();
        debug!(removed, "Deleted session");
        Ok(())
    }
}
