use std::{
    fmt,
    path::{Path, PathBuf},
};

use clap::{Parser, ValueEnum};

use crate::{Error, Result};

#[derive(Parser, Debug)]
#[command(name = "bio-collector")]
#[command(about = "Instagram Bio Collector with VPN")]
pub struct Cli {
    /// VPN service to use
    #[arg(value_enum)]
    pub provider: Provider,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Provider {
    Protonvpn,
    Nordvpn,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Protonvpn => "protonvpn",
            Provider::Nordvpn => "nordvpn",
        }
    }

    /// Directory holding the provider's `.ovpn` server configs.
    pub fn vpn_dir(&self) -> PathBuf {
        Path::new("vpn_files").join(self.as_str())
    }

    /// OpenVPN `auth-user-pass` file in the project root.
    pub fn credentials_path(&self) -> PathBuf {
        PathBuf::from(format!("{}_credentials.txt", self.as_str()))
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings read from the environment (and `.env`).
#[derive(Clone)]
pub struct Config {
    pub mongo_connection_string: String,
    pub mongo_db: String,
    pub mongo_collection: String,
    pub api_route: String,
    pub secret_token: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(_) => {}
            Err(e) if e.not_found() => tracing::debug!("No .env file found, using the process environment."),
            Err(e) => return Err(e.into()),
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(Error::MissingEnv(key))
        };
        Ok(Config {
            mongo_connection_string: get("MONGO_CONNECTION_STRING")?,
            mongo_db: get("MONGO_DB")?,
            mongo_collection: get("MONGO_COLLECTION")?,
            api_route: get("API_ROUTE")?,
            secret_token: get("SECRET_TOKEN")?,
        })
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("mongo_db", &self.mongo_db)
            .field("mongo_collection", &self.mongo_collection)
            .field("api_route", &self.api_route)
            .finish_non_exhaustive()
    }
}

/// VPN login from an OpenVPN `auth-user-pass` file: username line, then password line.
pub struct Credentials {
    pub provider: Provider,
    pub path: PathBuf,
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn load(provider: Provider, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MissingCredentials(path))
            }
            Err(e) => return Err(e.into()),
        };

        let mut lines = text.lines().map(str::trim);
        let (username, password) = match (lines.next(), lines.next()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => (u.to_string(), p.to_string()),
            _ => return Err(Error::InvalidCredentials(path)),
        };

        Ok(Credentials {
            provider,
            path,
            username,
            password,
        })
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("provider", &self.provider)
            .field("path", &self.path)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}
