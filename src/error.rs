use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("The selector you are trying to scrape for is missing. Selector: {0}")]
    ParseMissingSelector(String),

    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),
    #[error("Couldn't load the .env file: {0}")]
    Dotenv(#[from] dotenvy::Error),
    #[error("Credentials file not found: {0}")]
    MissingCredentials(PathBuf),
    #[error("Credentials file must hold a username and a password line: {0}")]
    InvalidCredentials(PathBuf),

    #[error("No .ovpn files found in {0}")]
    NoServerConfigs(PathBuf),
    #[error("No remote servers found in the .ovpn files of {0}")]
    NoRemotes(PathBuf),
    #[error("A VPN connection is already active.")]
    VpnAlreadyConnected,
    #[error("Couldn't connect to VPN server {server}: {reason}")]
    VpnConnect { server: String, reason: String },
    #[error("All {0} VPN servers failed to connect.")]
    VpnExhausted(usize),
    #[error("Signal Error: {0}")]
    Signal(#[from] nix::errno::Errno),

    #[error("Rate limited while fetching profile {0}")]
    RateLimited(String),
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),
    #[error("Unexpected status {status} while fetching profile {username}")]
    UnexpectedStatus { username: String, status: u16 },
    #[error("Unexpected profile payload: {0}")]
    UnexpectedPayload(String),
    #[error("API rejected the profile: {status} - {body}")]
    ApiRejected { status: u16, body: String },

    #[error("Couldn't set up logging: {0}")]
    Logging(String),

    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tokio Join Error, couldn't await a task! {0}")]
    RuntimeJoin(#[from] tokio::task::JoinError),

    #[error("Reqwest Error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("MongoDB Error: {0}")]
    Mongo(#[from] mongodb::error::Error),
}

impl Error {
    /// Instagram asked us to slow down. The caller should spend extra request budget.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::RateLimited(_))
    }
}
