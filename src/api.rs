use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::{request::Profile, Error, Result};

const API_TIMEOUT: Duration = Duration::from_secs(300);

/// Where collected profiles are delivered.
#[async_trait]
pub trait ProfileSink: Send + Sync {
    async fn submit(&self, profile: &Profile) -> Result<()>;
}

/// Summary the API may return for an accepted payload.
#[derive(Debug, Deserialize)]
struct ApiReply {
    #[serde(default)]
    resposta: Option<ApiSummary>,
}

#[derive(Debug, Deserialize)]
struct ApiSummary {
    #[serde(default)]
    total: Option<Value>,
    #[serde(default)]
    erros: Option<Value>,
}

/// Posts profiles as JSON to `API_ROUTE` with a bearer token.
pub struct ApiClient {
    client: Client,
    route: String,
    secret_token: String,
}

impl ApiClient {
    pub fn new(route: impl Into<String>, secret_token: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(API_TIMEOUT).build()?;
        Ok(ApiClient {
            client,
            route: route.into(),
            secret_token: secret_token.into(),
        })
    }
}

fn show(value: &Option<Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
        None => "N/A".into(),
    }
}

#[async_trait]
impl ProfileSink for ApiClient {
    async fn submit(&self, profile: &Profile) -> Result<()> {
        let res = self
            .client
            .post(&self.route)
            .bearer_auth(&self.secret_token)
            .json(profile)
            .send()
            .await?;

        let status = res.status();
        let body = res.text().await?;
        if status != StatusCode::OK {
            return Err(Error::ApiRejected {
                status: status.as_u16(),
                body,
            });
        }

        // The summary is informational, a body we can't read still counts as accepted.
        if let Ok(ApiReply {
            resposta: Some(summary),
        }) = serde_json::from_str::<ApiReply>(&body)
        {
            info!(
                "API reply: success {}, errors {}",
                show(&summary.total),
                show(&summary.erros)
            );
        }
        Ok(())
    }
}
