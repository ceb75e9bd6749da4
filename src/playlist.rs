/*!
The playlist a session is currently adding tracks to
*/
use std::sync::Arc;

use crate::session::SessionStore;
use crate::Result;

const CURRENT_PLAYLIST_KEY: &str = "current_playlist_id";

#[derive(Clone)]
pub struct PlaylistSession {
    sessions: Arc<dyn SessionStore>,
}

impl PlaylistSession {
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self { sessions }
    }

    /// Overwrites whatever playlist was current
    pub async fn set_current_playlist(&self, session_id: &str, playlist_id: &str) -> Result<()> {
        self.sessions
            .set(session_id, CURRENT_PLAYLIST_KEY, playlist_id.to_string())
            .await
    }

    pub async fn get_current_playlist(&self, session_id: &str) -> Result<Option<String>> {
        self.sessions.get(session_id, CURRENT_PLAYLIST_KEY).await
    }

    pub async fn clear_current_playlist(&self, session_id: &str) -> Result<()> {
        self.sessions.delete(session_id, CURRENT_PLAYLIST_KEY).await
    }
}
