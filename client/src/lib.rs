pub mod api;
pub mod config;
pub mod controller;
#[cfg(test)]
pub(crate) mod mocks;
pub mod session;
pub mod telegram;
pub mod timers;

pub use api::{Backend, Client};
pub use config::Config;
pub use controller::{Controller, Outcome, Phase, SkipReason, Snapshot};
pub use session::{FileStore, MemoryStore, Session, TokenStore};
pub use telegram::{Authenticator, InitData, Login, StaticHost, Verification, WebAppHost};

use std::time::Duration;
use thiserror::Error;

/// Error type for client operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("failed: {status}: {message}")]
    Failed {
        status: reqwest::StatusCode,
        message: String,
    },
    #[error("unauthorized: session is no longer valid")]
    Unauthorized,
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid URL scheme: {0} (expected http or https)")]
    InvalidScheme(String),
    #[error("not running inside the Telegram WebApp host")]
    NotInTelegram,
    #[error("Telegram init data is missing")]
    MissingInitData,
    #[error("invalid init data: {0}")]
    InvalidInitData(String),
    #[error("init data signature mismatch")]
    InvalidSignature,
    #[error("init data is stale: issued {age:?} ago (max {max:?})")]
    StaleInitData { age: Duration, max: Duration },
    #[error("a bot token is required to verify init data")]
    MissingBotToken,
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the server rejected the bearer token. Callers should run the
    /// identity handshake again.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized)
    }

    /// Whether repeating the same request could succeed. The client never
    /// retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Reqwest(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Error::Failed { status, .. } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
