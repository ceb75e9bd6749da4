use anyhow::Context as _;
use std::io::Read;
use std::sync::Arc;
use std::{env, fs};

pub use error::AppError;

pub type Result<T> = std::result::Result<T, AppError>;

/// Build an `AppError::Unexpected` from a format string
#[macro_export]
macro_rules! se {
    ($($arg:tt)*) => {
        $crate::error::AppError::Unexpected(format!($($arg)*))
    };
}

/// Shorthands for building `tide::Response`s
#[macro_export]
macro_rules! resp {
    (json => $obj:expr) => {
        $crate::resp!(status => 200, json => $obj)
    };
    (status => $status:expr, json => $obj:expr) => {{
        let body = tide::Body::from_json(&$obj)?;
        tide::Response::builder($status).body(body).build()
    }};
    (status => $status:expr, message => $msg:expr) => {
        tide::Response::builder($status)
            .body(serde_json::json!({ "error": $msg }))
            .build()
    };
    (status => $status:expr, text => $msg:expr) => {
        tide::Response::builder($status)
            .content_type(tide::http::mime::PLAIN)
            .body(String::from($msg))
            .build()
    };
    (html => $body:expr) => {
        tide::Response::builder(200)
            .content_type(tide::http::mime::HTML)
            .body(String::from($body))
            .build()
    };
}

mod crypto;
mod error;
mod logging;
mod pages;
mod playlist;
mod service;
mod session;
mod spotify;
mod token;
mod utils;

fn env_or(k: &str, default: &str) -> String {
    env::var(k).unwrap_or_else(|_| default.to_string())
}

fn env_required(k: &str) -> anyhow::Result<String> {
    env::var(k).with_context(|| format!("missing required env var {}", k))
}

fn env_parse<T>(k: &str, default: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_or(k, default)
        .parse()
        .with_context(|| format!("invalid {}", k.to_lowercase()))
}

lazy_static::lazy_static! {
    // The "base" logger that all crates should branch off of
    pub static ref BASE_LOG: slog::Logger = logging::base_logger(&logging::LogSettings::from_env());

    // Base logger
    pub static ref LOG: slog::Logger = BASE_LOG.new(slog::o!("app" => "mixtape"));
}

#[derive(Debug, Clone)]
pub struct Config {
    pub version: String,
    pub ssl: bool,
    pub host: String,
    pub real_hostname: Option<String>,
    pub port: u16,
    pub spotify_client_id: String,
    pub spotify_secret_id: String,
    pub spotify_scope: String,
    pub spotify_accounts_url: String,
    pub spotify_api_url: String,
    // key used to sign the session cookie
    pub secret_key: String,
    pub session_ttl_seconds: u64,
    pub login_state_ttl_seconds: u64,
    // request timeout applied to every call made to spotify
    pub http_timeout_seconds: u64,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let version = fs::File::open("commit_hash.txt")
            .map(|mut f| {
                let mut s = String::new();
                f.read_to_string(&mut s).map(|_| s.trim().to_string())
            })
            .unwrap_or_else(|_| Ok("unknown".to_string()))
            .context("error reading commit_hash.txt")?;
        Ok(Self {
            version,
            ssl: env_or("SSL", "false") == "true",
            host: env_or("HOST", "localhost"),
            real_hostname: env::var("REAL_HOSTNAME").ok(),
            port: env_parse("PORT", "3030")?,
            spotify_client_id: env_required("SPOTIFY_CLIENT_ID")?,
            spotify_secret_id: env_required("SPOTIFY_SECRET_ID")?,
            spotify_scope: env_or("SPOTIFY_SCOPE", "playlist-modify-public user-library-read"),
            spotify_accounts_url: env_or("SPOTIFY_ACCOUNTS_URL", "https://accounts.spotify.com"),
            spotify_api_url: env_or("SPOTIFY_API_URL", "https://api.spotify.com/v1"),
            secret_key: env_required("SECRET_KEY")?,
            session_ttl_seconds: env_parse("SESSION_TTL_SECONDS", "86400")?,
            login_state_ttl_seconds: env_parse("LOGIN_STATE_TTL_SECONDS", "300")?,
            http_timeout_seconds: env_parse("HTTP_TIMEOUT_SECONDS", "10")?,
        })
    }

    pub fn initialize(&self) {
        let log_settings = logging::LogSettings::from_env();
        slog::info!(
            LOG, "initialized config";
            "version" => &self.version,
            "ssl" => self.ssl,
            "host" => &self.host,
            "port" => self.port,
            "public_url" => self.public_url(),
            "session_ttl_seconds" => self.session_ttl_seconds,
            "http_timeout_seconds" => self.http_timeout_seconds,
            "log_format" => &log_settings.format,
            "log_level" => &log_settings.level,
        );
    }

    pub fn host(&self) -> String {
        let p = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", p, self.host, self.port)
    }

    /// The externally reachable base url, used for redirects
    pub fn public_url(&self) -> String {
        self.real_hostname.clone().unwrap_or_else(|| self.host())
    }

    pub fn spotify_redirect_url(&self) -> String {
        format!("{}/callback", self.public_url())
    }
}

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    // try sourcing a .env if one exists
    dotenv::dotenv().ok();
    let config = Arc::new(Config::load()?);
    config.initialize();

    let spotify = Arc::new(spotify::SpotifyClient::new(&config)?);
    let sessions = Arc::new(session::MemorySessionStore::new(
        config.session_ttl_seconds,
    ));
    let ctx = service::Context::new(
        config.clone(),
        sessions,
        spotify.clone(),
        spotify,
        Arc::new(utils::SystemClock),
        pages::Pages::new()?,
    );
    service::start(ctx).await
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        version: "test".to_string(),
        ssl: false,
        host: "localhost".to_string(),
        real_hostname: None,
        port: 3030,
        spotify_client_id: "client-id".to_string(),
        spotify_secret_id: "client-secret".to_string(),
        spotify_scope: "playlist-modify-public user-library-read".to_string(),
        spotify_accounts_url: "https://accounts.spotify.com".to_string(),
        spotify_api_url: "https://api.spotify.com/v1".to_string(),
        secret_key: "01234567890123456789012345678901".to_string(),
        session_ttl_seconds: 3600,
        login_state_ttl_seconds: 30,
        http_timeout_seconds: 5,
    }
}
