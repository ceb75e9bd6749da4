/*!
Spotify credential lifecycle

A session's credential is minted from an authorization code, refreshed
once it expires and evicted when a refresh fails. The record is always
written to the session as a single value.
*/
use std::convert::TryFrom;
use std::sync::Arc;

use crate::session::SessionStore;
use crate::spotify::{
    AuthProvider, NewPlaylist, Playlist, SpotifyApi, TokenGrant, TokenResponse, UserProfile,
};
use crate::utils::Clock;
use crate::{AppError, Result, LOG};

const CREDENTIAL_KEY: &str = "token_info";

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: String,
    // seconds the access token was issued for
    pub expires_in: u64,
    // timestamp in seconds from epoch after which `access_token`
    // can no longer be used. Always minted as `now + expires_in`.
    pub expires_at: i64,
}

impl CredentialRecord {
    pub fn mint(grant: TokenGrant, now: i64) -> Result<Self> {
        let expires_at = i64::try_from(grant.expires_in)
            .ok()
            .and_then(|expires_in| now.checked_add(expires_in))
            .ok_or_else(|| {
                AppError::Auth(format!("unusable token lifetime {}", grant.expires_in))
            })?;
        Ok(Self {
            expires_at,
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_in: grant.expires_in,
        })
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

/// A spotify api client bound to a valid access token
#[derive(Clone)]
pub struct AuthenticatedClient {
    access_token: String,
    api: Arc<dyn SpotifyApi>,
}

impl AuthenticatedClient {
    #[cfg(test)]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub async fn current_user(&self) -> Result<UserProfile> {
        self.api.current_user(&self.access_token).await
    }

    pub async fn search_tracks(&self, query: &str, limit: u32) -> Result<serde_json::Value> {
        self.api
            .search_tracks(&self.access_token, query, limit)
            .await
    }

    pub async fn create_playlist(&self, user_id: &str, playlist: &NewPlaylist) -> Result<Playlist> {
        self.api
            .create_playlist(&self.access_token, user_id, playlist)
            .await
    }

    pub async fn add_items(&self, playlist_id: &str, uris: &[String]) -> Result<()> {
        self.api
            .add_items(&self.access_token, playlist_id, uris)
            .await
    }
}

#[derive(Clone)]
pub struct TokenManager {
    provider: Arc<dyn AuthProvider>,
    api: Arc<dyn SpotifyApi>,
    sessions: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
}

impl TokenManager {
    pub fn new(
        provider: Arc<dyn AuthProvider>,
        api: Arc<dyn SpotifyApi>,
        sessions: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            api,
            sessions,
            clock,
        }
    }

    /// The spotify url to send a user to so they can log in.
    /// `state` comes back to us untouched on the callback.
    pub fn begin_authorization(&self, state: &str) -> Result<String> {
        self.provider.authorize_url(state)
    }

    /// Trade an authorization code for a credential and save it in the fresh
    /// session `session_id`. A `previous_session` the user arrived with lends
    /// its refresh token to responses that lack one, and is destroyed once
    /// the new credential is saved.
    pub async fn complete_authorization(
        &self,
        session_id: &str,
        previous_session: Option<&str>,
        code: &str,
    ) -> Result<CredentialRecord> {
        let code = code.trim();
        if code.is_empty() {
            return Err(AppError::Auth("missing authorization code".to_string()));
        }
        let cached_refresh_token = self
            .load(previous_session.unwrap_or(session_id))
            .await?
            .map(|record| record.refresh_token);
        let response = self
            .provider
            .exchange_code(code)
            .await
            .map_err(|e| AppError::Auth(e.to_string()))?;
        let record = self.mint(response, cached_refresh_token.as_deref())?;
        self.store(session_id, &record).await?;
        if let Some(previous) = previous_session.filter(|previous| *previous != session_id) {
            self.sessions.destroy(previous).await?;
        }
        slog::info!(LOG, "authorized session"; "expires_at" => record.expires_at);
        Ok(record)
    }

    /// A client with a usable access token, or `None` when the session
    /// has never logged in. Expired tokens are refreshed first. A failed
    /// refresh evicts the stored credential so the user has to log in again.
    pub async fn resolve_active_credential(
        &self,
        session_id: &str,
    ) -> Result<Option<AuthenticatedClient>> {
        let record = match self.load(session_id).await? {
            None => return Ok(None),
            Some(record) => record,
        };
        let record = if record.is_expired(self.clock.now_seconds()) {
            self.refresh(session_id, &record).await?
        } else {
            record
        };
        Ok(Some(AuthenticatedClient {
            access_token: record.access_token,
            api: self.api.clone(),
        }))
    }

    pub async fn is_authenticated(&self, session_id: &str) -> Result<bool> {
        Ok(self.load(session_id).await?.is_some())
    }

    fn mint(
        &self,
        response: TokenResponse,
        cached_refresh_token: Option<&str>,
    ) -> Result<CredentialRecord> {
        let grant = response.into_grant(cached_refresh_token)?;
        CredentialRecord::mint(grant, self.clock.now_seconds())
    }

    async fn refresh(
        &self,
        session_id: &str,
        record: &CredentialRecord,
    ) -> Result<CredentialRecord> {
        slog::info!(LOG, "refreshing access token"; "expired_at" => record.expires_at);
        let refreshed = self
            .provider
            .refresh(&record.refresh_token)
            .await
            .and_then(|response| self.mint(response, Some(&record.refresh_token)));
        match refreshed {
            Ok(refreshed) => {
                self.store(session_id, &refreshed).await?;
                Ok(refreshed)
            }
            Err(e) => {
                slog::warn!(LOG, "token refresh failed, evicting credential"; "error" => %e);
                if let Err(delete_err) = self.sessions.delete(session_id, CREDENTIAL_KEY).await {
                    slog::error!(LOG, "failed evicting credential"; "error" => %delete_err);
                }
                Err(se!("token refresh failed: {}", e))
            }
        }
    }

    async fn load(&self, session_id: &str) -> Result<Option<CredentialRecord>> {
        let raw = match self.sessions.get(session_id, CREDENTIAL_KEY).await? {
            None => return Ok(None),
            Some(raw) => raw,
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                slog::warn!(LOG, "discarding unreadable credential"; "error" => %e);
                self.sessions.delete(session_id, CREDENTIAL_KEY).await?;
                Ok(None)
            }
        }
    }

    async fn store(&self, session_id: &str, record: &CredentialRecord) -> Result<()> {
        let raw = serde_json::to_string(record)
            .map_err(|e| se!("error serializing credential {}", e))?;
        self.sessions.set(session_id, CREDENTIAL_KEY, raw).await
    }
}
