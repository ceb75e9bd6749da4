/*!
Logger setup and request logging
*/
use slog::{o, Drain};
use std::time::Instant;

use crate::LOG;

pub struct LogSettings {
    pub format: String,
    pub level: String,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self {
            format: crate::env_or("LOG_FORMAT", "json")
                .to_lowercase()
                .trim()
                .to_string(),
            level: crate::env_or("LOG_LEVEL", "INFO"),
        }
    }
}

fn parse_level(level: &str) -> slog::Level {
    level.parse().unwrap_or(slog::Level::Info)
}

pub fn base_logger(settings: &LogSettings) -> slog::Logger {
    let level = parse_level(&settings.level);
    if settings.format == "pretty" {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::CompactFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        let drain = slog::LevelFilter::new(drain, level).fuse();
        slog::Logger::root(drain, o!())
    } else {
        let drain = slog_json::Json::default(std::io::stderr()).fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        let drain = slog::LevelFilter::new(drain, level).fuse();
        slog::Logger::root(drain, o!())
    }
}

/// Logs every request with its status and how long it took
#[derive(Debug, Default, Clone)]
pub struct LogMiddleware;

impl LogMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl<State: Clone + Send + Sync + 'static> tide::Middleware<State> for LogMiddleware {
    async fn handle(&self, req: tide::Request<State>, next: tide::Next<'_, State>) -> tide::Result {
        let method = req.method().to_string();
        let path = req.url().path().to_string();
        let start = Instant::now();
        let resp = next.run(req).await;
        let status = resp.status();
        let elapsed_ms = start.elapsed().as_millis() as u64;
        if status.is_server_error() {
            slog::error!(
                LOG, "request";
                "method" => method, "path" => path, "status" => status as u16, "elapsed_ms" => elapsed_ms,
            );
        } else {
            slog::info!(
                LOG, "request";
                "method" => method, "path" => path, "status" => status as u16, "elapsed_ms" => elapsed_ms,
            );
        }
        Ok(resp)
    }
}
