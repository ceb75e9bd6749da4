/*!
Request level errors and their http translation
*/
use tide::StatusCode;

use crate::LOG;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AppError {
    /// The authorization code exchange failed or returned nothing usable
    #[error("{0}")]
    Auth(String),
    #[error("Not logged in")]
    NotAuthenticated,
    #[error("{0}")]
    Validation(String),
    /// Spotify rejected the request
    #[error("Spotify API error: {0}")]
    Provider(String),
    #[error("{0}")]
    Unexpected(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Auth(_) | AppError::Validation(_) | AppError::Provider(_) => {
                StatusCode::BadRequest
            }
            AppError::NotAuthenticated => StatusCode::Unauthorized,
            AppError::Unexpected(_) => StatusCode::InternalServerError,
        }
    }

    /// Treat a provider rejection as an unexpected failure, leaves
    /// every other kind alone.
    pub fn unexpected(self) -> Self {
        match self {
            AppError::Provider(msg) => AppError::Unexpected(msg),
            other => other,
        }
    }

    fn log(&self) {
        match self {
            AppError::Unexpected(_) => slog::error!(LOG, "request failed"; "error" => %self),
            AppError::NotAuthenticated => slog::debug!(LOG, "request not authenticated"),
            _ => slog::warn!(LOG, "request rejected"; "status" => %self.status(), "error" => %self),
        }
    }

    /// `{"error": ...}` json with the mapped status
    pub fn into_response(self) -> tide::Response {
        self.log();
        resp!(status => self.status(), message => self.to_string())
    }

    /// Plain text body, used on the browser facing login pages
    pub fn into_text_response(self) -> tide::Response {
        self.log();
        resp!(status => self.status(), text => format!("Authentication failed: {}", self))
    }
}
