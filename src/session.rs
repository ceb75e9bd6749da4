/*!
Per user session storage

Sessions are a bag of string values keyed by session id. Anything
structured (a credential record) is serialized into a single value so
that it's always replaced as a whole.
*/
use async_mutex::Mutex;
use cached::stores::TimedCache;
use cached::Cached;
use std::collections::HashMap;
use std::sync::Arc;

use crate::Result;

#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<String>>;
    async fn set(&self, session_id: &str, key: &str, value: String) -> Result<()>;
    /// Remove a single key, removing a missing key is not an error
    async fn delete(&self, session_id: &str, key: &str) -> Result<()>;
    /// Drop the session and everything in it
    async fn destroy(&self, session_id: &str) -> Result<()>;
}

type Values = HashMap<String, String>;

/// In-memory sessions that expire `lifespan` seconds after they were
/// last written to. Expired sessions are swept out on every write.
#[derive(Clone)]
pub struct MemorySessionStore {
    sessions: Arc<Mutex<TimedCache<String, Values>>>,
}

impl MemorySessionStore {
    pub fn new(lifespan_seconds: u64) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(TimedCache::with_lifespan(lifespan_seconds))),
        }
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<String>> {
        let mut lock = self.sessions.lock().await;
        Ok(lock
            .cache_get(&session_id.to_string())
            .and_then(|values| values.get(key).cloned()))
    }

    async fn set(&self, session_id: &str, key: &str, value: String) -> Result<()> {
        let session_id = session_id.to_string();
        let mut lock = self.sessions.lock().await;
        lock.flush();
        // re-inserting re-arms the expiration
        let mut values = lock.cache_get(&session_id).cloned().unwrap_or_default();
        values.insert(key.to_string(), value);
        lock.cache_set(session_id, values);
        Ok(())
    }

    async fn delete(&self, session_id: &str, key: &str) -> Result<()> {
        let mut lock = self.sessions.lock().await;
        if let Some(values) = lock.cache_get_mut(&session_id.to_string()) {
            values.remove(key);
        }
        Ok(())
    }

    async fn destroy(&self, session_id: &str) -> Result<()> {
        let mut lock = self.sessions.lock().await;
        lock.cache_remove(&session_id.to_string());
        Ok(())
    }
}
