use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use crate::parse::{parse_profile_html, parse_profile_json};
use crate::{Error, Result};

pub const INSTAGRAM_BASE_URL: &str = "https://www.instagram.com";
/// Public app id the Instagram web client sends with its API calls.
const WEB_APP_ID: &str = "936619743392459";
const RATE_LIMIT_MESSAGE: &str = "Please wait a few minutes before you try again.";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A collected profile, serialized as the payload posted to the API.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Profile {
    pub username: String,
    pub full_name: String,
    pub profile_url: String,
    pub userid: u64,
    pub biography: String,
    pub external_url: Option<String>,
    pub followers: u64,
    pub following: u64,
    #[serde(skip_serializing)]
    pub collected_at: DateTime<Utc>,
}

impl Profile {
    pub fn url_for(username: &str) -> String {
        format!("{INSTAGRAM_BASE_URL}/{username}/")
    }
}

/// Where profiles come from.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn fetch_profile(&self, username: &str) -> Result<Profile>;
}

pub struct InstagramClient {
    client: Client,
    base_url: String,
}

impl InstagramClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(INSTAGRAM_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            // Pooled connections die with the tunnel they were opened through.
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(InstagramClient {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Requests a URL and returns its status and body.
    async fn request_page(&self, url: &str, query: &[(&str, &str)]) -> Result<(StatusCode, String)> {
        let res = self
            .client
            .get(url)
            .query(query)
            .header("x-ig-app-id", WEB_APP_ID)
            .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await?;
        let status = res.status();
        let body = res.text().await?;
        Ok((status, body))
    }

    /// Public profile page, used when the JSON endpoint refuses an anonymous call.
    async fn fetch_profile_page(&self, username: &str) -> Result<Profile> {
        let url = format!("{}/{username}/", self.base_url);
        let (status, html) = self.request_page(&url, &[]).await?;
        check_rate_limit(username, status, &html)?;
        match status {
            s if s.is_success() => parse_profile_html(username, html).await,
            StatusCode::NOT_FOUND => Err(Error::ProfileNotFound(username.into())),
            s => Err(Error::UnexpectedStatus {
                username: username.into(),
                status: s.as_u16(),
            }),
        }
    }
}

fn check_rate_limit(username: &str, status: StatusCode, body: &str) -> Result<()> {
    if status == StatusCode::TOO_MANY_REQUESTS || body.contains(RATE_LIMIT_MESSAGE) {
        return Err(Error::RateLimited(username.into()));
    }
    Ok(())
}

#[async_trait]
impl ProfileSource for InstagramClient {
    async fn fetch_profile(&self, username: &str) -> Result<Profile> {
        let username = username.trim();
        let url = format!("{}/api/v1/users/web_profile_info/", self.base_url);
        let (status, body) = self.request_page(&url, &[("username", username)]).await?;
        debug!("web_profile_info {username}: {status}");
        check_rate_limit(username, status, &body)?;

        match status {
            s if s.is_success() => {
                parse_profile_json(&body)?.ok_or_else(|| Error::ProfileNotFound(username.into()))
            }
            StatusCode::NOT_FOUND => Err(Error::ProfileNotFound(username.into())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!("Profile API refused {username} ({status}), trying the profile page.");
                self.fetch_profile_page(username).await
            }
            s => Err(Error::UnexpectedStatus {
                username: username.into(),
                status: s.as_u16(),
            }),
        }
    }
}
