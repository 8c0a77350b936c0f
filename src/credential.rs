use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{IdentityConfig, IdentitySource};

const APP_SERVICE_API_VERSION: &str = "2019-08-01";
const IMDS_API_VERSION: &str = "2018-02-01";

// tokens closer than this to expiry are refreshed
const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(thiserror::Error, Debug)]
pub enum CredentialError {
    #[error("managed identity request failed - {0}")]
    Transport(#[from] reqwest::Error),
    #[error("managed identity endpoint returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("managed identity returned an unusable token - {0}")]
    InvalidToken(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_on - now > Duration::seconds(REFRESH_MARGIN_SECS)
    }
}

/// Source of bearer tokens for the Digital Twins data plane.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn get_token(&self) -> Result<AccessToken, CredentialError>;
}

#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(deserialize_with = "unix_seconds")]
    expires_on: i64,
}

// App Service sends expires_on as a string, some IMDS versions as a number
fn unix_seconds<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|e| de::Error::custom(format!("invalid expires_on {text} - {e}"))),
    }
}

/// Platform managed identity scoped to a single audience. Tokens are cached
/// and shared by all invocations served by this process.
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    identity: IdentityConfig,
    audience: String,
    cache: Mutex<Option<AccessToken>>,
}

impl ManagedIdentityCredential {
    pub fn new(http: reqwest::Client, identity: IdentityConfig, audience: impl Into<String>) -> Self {
        ManagedIdentityCredential {
            http,
            identity,
            audience: audience.into(),
            cache: Mutex::new(None),
        }
    }

    async fn request_token(&self) -> Result<AccessToken, CredentialError> {
        let mut query = vec![("resource", self.audience.as_str())];
        if let Some(client_id) = self.identity.client_id.as_deref() {
            query.push(("client_id", client_id));
        }

        let request = match &self.identity.source {
            IdentitySource::AppService { endpoint, header } => {
                query.push(("api-version", APP_SERVICE_API_VERSION));
                self.http
                    .get(endpoint)
                    .header("X-IDENTITY-HEADER", header)
                    .query(&query)
            }
            IdentitySource::Imds { endpoint } => {
                query.push(("api-version", IMDS_API_VERSION));
                self.http
                    .get(endpoint)
                    .header("Metadata", "true")
                    .query(&query)
            }
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Status { status, body });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::InvalidToken(e.to_string()))?;
        let expires_on = Utc
            .timestamp_opt(body.expires_on, 0)
            .single()
            .ok_or_else(|| CredentialError::InvalidToken(format!("expires_on {}", body.expires_on)))?;

        Ok(AccessToken {
            token: body.access_token,
            expires_on,
        })
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn get_token(&self) -> Result<AccessToken, CredentialError> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref() {
            if token.is_fresh(Utc::now()) {
                debug!("using cached token for {}", self.audience);
                return Ok(token.clone());
            }
        }

        let token = self.request_token().await?;
        info!(
            "acquired managed identity token for {} (expires {})",
            self.audience, token.expires_on
        );
        *cache = Some(token.clone());
        Ok(token)
    }
}
