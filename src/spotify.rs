use std::convert::TryFrom;
use std::time::Duration;

use crate::{Config, Result, LOG};

/// Used when spotify doesn't tell us how long an access token lives
pub const DEFAULT_EXPIRES_IN: u64 = 3600;

#[derive(serde::Deserialize, Debug, Clone)]
pub struct SpotifyAccess {
    pub access_token: String,
    pub expires_in: Option<u64>,
    pub refresh_token: Option<String>,
}

/// What comes back from the token endpoint. Normally a full json
/// bundle, but a bare access token string is also accepted.
#[derive(serde::Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum TokenResponse {
    Bundle(SpotifyAccess),
    Bare(String),
}

/// A normalized token response, everything needed to mint a credential
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
}

impl TokenResponse {
    /// Normalize either response shape. `cached_refresh_token` is the refresh
    /// token we already hold, if any, and fills in for responses that don't
    /// carry their own.
    pub fn into_grant(self, cached_refresh_token: Option<&str>) -> Result<TokenGrant> {
        let (access_token, refresh_token, expires_in) = match self {
            TokenResponse::Bundle(access) => {
                (access.access_token, access.refresh_token, access.expires_in)
            }
            TokenResponse::Bare(access_token) => (access_token, None, None),
        };
        if access_token.trim().is_empty() {
            return Err(crate::AppError::Auth("Invalid token response".to_string()));
        }
        let refresh_token = refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| cached_refresh_token.map(String::from))
            .filter(|t| !t.is_empty())
            .ok_or_else(|| crate::AppError::Auth("missing refresh token".to_string()))?;
        Ok(TokenGrant {
            access_token,
            refresh_token,
            expires_in: expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
        })
    }
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct UserProfile {
    pub id: String,
    pub display_name: Option<String>,
}

impl UserProfile {
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(serde::Serialize, Debug, Clone)]
pub struct NewPlaylist {
    pub name: String,
    pub public: bool,
    pub description: String,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct ExternalUrls {
    pub spotify: String,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub external_urls: ExternalUrls,
}

/// The oauth side of spotify
#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync {
    /// Where to send a user so they can grant us access
    fn authorize_url(&self, state: &str) -> Result<String>;
    async fn exchange_code(&self, code: &str) -> Result<TokenResponse>;
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse>;
}

/// The parts of the spotify web api we use
#[async_trait::async_trait]
pub trait SpotifyApi: Send + Sync {
    async fn current_user(&self, access_token: &str) -> Result<UserProfile>;
    /// Returns spotify's search result as is
    async fn search_tracks(
        &self,
        access_token: &str,
        query: &str,
        limit: u32,
    ) -> Result<serde_json::Value>;
    async fn create_playlist(
        &self,
        access_token: &str,
        user_id: &str,
        playlist: &NewPlaylist,
    ) -> Result<Playlist>;
    async fn add_items(&self, access_token: &str, playlist_id: &str, uris: &[String])
        -> Result<()>;
}

#[derive(serde::Serialize)]
struct SpotifyAccessParams<'a> {
    grant_type: &'a str,
    code: &'a str,
    redirect_uri: &'a str,
}

#[derive(serde::Serialize)]
struct RefreshParams<'a> {
    grant_type: &'a str,
    refresh_token: &'a str,
}

#[derive(serde::Serialize)]
struct AddItems<'a> {
    uris: &'a [String],
}

/// Pull a readable message out of a spotify error body. The web api
/// nests it under `error.message`, the accounts service uses
/// `error` / `error_description`.
fn provider_error_message(status: u16, body: &str) -> String {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v["error"]["message"]
                .as_str()
                .or_else(|| v["error_description"].as_str())
                .or_else(|| v["error"].as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.trim().to_string());
    format!("http status: {}, {}", status, message)
}

async fn check_status(mut resp: surf::Response) -> Result<surf::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.body_string().await.unwrap_or_default();
    Err(crate::AppError::Provider(provider_error_message(
        status as u16,
        &body,
    )))
}

/// surf backed spotify client
pub struct SpotifyClient {
    http: surf::Client,
    client_id: String,
    secret_id: String,
    redirect_url: String,
    scope: String,
    accounts_url: String,
    api_url: String,
}

impl SpotifyClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http_config = surf::Config::new()
            .set_timeout(Some(Duration::from_secs(config.http_timeout_seconds)));
        let http = surf::Client::try_from(http_config)
            .map_err(|e| anyhow::anyhow!("error building http client {:?}", e))?;
        Ok(Self {
            http,
            client_id: config.spotify_client_id.clone(),
            secret_id: config.spotify_secret_id.clone(),
            redirect_url: config.spotify_redirect_url(),
            scope: config.spotify_scope.clone(),
            accounts_url: config.spotify_accounts_url.trim_end_matches('/').to_string(),
            api_url: config.spotify_api_url.trim_end_matches('/').to_string(),
        })
    }

    async fn token_request<T: serde::Serialize>(&self, params: &T) -> Result<TokenResponse> {
        let auth = base64::encode(format!("{}:{}", self.client_id, self.secret_id).as_bytes());
        let body = surf::Body::from_form(params).map_err(|e| se!("form error {}", e))?;
        let resp = self
            .http
            .post(format!("{}/api/token", self.accounts_url))
            .body(body)
            .header("authorization", format!("Basic {}", auth))
            .send()
            .await
            .map_err(|e| se!("account request error {}", e))?;
        let mut resp = check_status(resp).await?;
        resp.body_json()
            .await
            .map_err(|e| se!("token json parse error {}", e))
    }

    async fn api_get<T: serde::de::DeserializeOwned>(
        &self,
        url: impl AsRef<str>,
        access_token: &str,
    ) -> Result<T> {
        let resp = self
            .http
            .get(url)
            .header("authorization", format!("Bearer {}", access_token))
            .send()
            .await
            .map_err(|e| se!("spotify request error {}", e))?;
        let mut resp = check_status(resp).await?;
        resp.body_json()
            .await
            .map_err(|e| se!("spotify json parse error {}", e))
    }

    async fn api_post<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        url: impl AsRef<str>,
        access_token: &str,
        body: &B,
    ) -> Result<T> {
        let resp = self
            .http
            .post(url)
            .header("authorization", format!("Bearer {}", access_token))
            .body_json(body)
            .map_err(|e| se!("spotify request body error {}", e))?
            .send()
            .await
            .map_err(|e| se!("spotify request error {}", e))?;
        let mut resp = check_status(resp).await?;
        resp.body_json()
            .await
            .map_err(|e| se!("spotify json parse error {}", e))
    }
}

#[async_trait::async_trait]
impl AuthProvider for SpotifyClient {
    fn authorize_url(&self, state: &str) -> Result<String> {
        let url = surf::Url::parse_with_params(
            &format!("{}/authorize", self.accounts_url),
            &[
                ("client_id", self.client_id.as_str()),
                ("response_type", "code"),
                ("redirect_uri", self.redirect_url.as_str()),
                ("scope", self.scope.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| se!("invalid spotify accounts url {}", e))?;
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        slog::debug!(LOG, "exchanging authorization code");
        self.token_request(&SpotifyAccessParams {
            grant_type: "authorization_code",
            code,
            redirect_uri: &self.redirect_url,
        })
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        slog::debug!(LOG, "refreshing access token");
        self.token_request(&RefreshParams {
            grant_type: "refresh_token",
            refresh_token,
        })
        .await
    }
}

#[async_trait::async_trait]
impl SpotifyApi for SpotifyClient {
    async fn current_user(&self, access_token: &str) -> Result<UserProfile> {
        self.api_get(format!("{}/me", self.api_url), access_token)
            .await
    }

    async fn search_tracks(
        &self,
        access_token: &str,
        query: &str,
        limit: u32,
    ) -> Result<serde_json::Value> {
        let limit = limit.to_string();
        let url = surf::Url::parse_with_params(
            &format!("{}/search", self.api_url),
            &[("q", query), ("type", "track"), ("limit", limit.as_str())],
        )
        .map_err(|e| se!("invalid spotify api url {}", e))?;
        self.api_get(url, access_token).await
    }

    async fn create_playlist(
        &self,
        access_token: &str,
        user_id: &str,
        playlist: &NewPlaylist,
    ) -> Result<Playlist> {
        self.api_post(
            format!("{}/users/{}/playlists", self.api_url, user_id),
            access_token,
            playlist,
        )
        .await
    }

    async fn add_items(
        &self,
        access_token: &str,
        playlist_id: &str,
        uris: &[String],
    ) -> Result<()> {
        let _snapshot: serde_json::Value = self
            .api_post(
                format!("{}/playlists/{}/tracks", self.api_url, playlist_id),
                access_token,
                &AddItems { uris },
            )
            .await?;
        Ok(())
    }
}
