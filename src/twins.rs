use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, info};

use crate::credential::{CredentialError, TokenCredential};
use crate::patch::{self, JsonPatchDocument};

#[derive(thiserror::Error, Debug)]
pub enum TwinsError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("digital twins request failed - {0}")]
    Transport(#[from] reqwest::Error),
    #[error("digital twins returned {status} for twin {twin_id}: {message}")]
    Service {
        twin_id: String,
        status: reqwest::StatusCode,
        message: String,
    },
    #[error("digital twins endpoint {0} cannot carry a twin path")]
    InvalidEndpoint(String),
    #[error("Application setting \"ADT_SERVICE_URL\" not set")]
    MissingEndpoint,
}

/// Seam between the forwarding loop and the twin graph service.
#[async_trait]
pub trait TwinUpdater: Send + Sync {
    /// Called once at the start of an invocation, before any update.
    async fn authenticate(&self) -> Result<(), TwinsError> {
        Ok(())
    }

    async fn update_digital_twin(
        &self,
        twin_id: &str,
        patch: &JsonPatchDocument,
    ) -> Result<(), TwinsError>;
}

#[derive(Deserialize, Debug)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize, Debug)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Azure Digital Twins data-plane client. The `reqwest::Client` is created
/// once at startup and its connection pool is shared by every invocation.
/// Without an endpoint the client still exists but refuses to authenticate.
#[derive(Clone)]
pub struct DigitalTwinsClient {
    http: reqwest::Client,
    endpoint: Option<Url>,
    api_version: String,
    credential: Arc<dyn TokenCredential>,
}

impl DigitalTwinsClient {
    pub fn new(
        http: reqwest::Client,
        endpoint: Option<Url>,
        api_version: impl Into<String>,
        credential: Arc<dyn TokenCredential>,
    ) -> Self {
        DigitalTwinsClient {
            http,
            endpoint,
            api_version: api_version.into(),
            credential,
        }
    }

    pub fn twin_url(&self, twin_id: &str) -> Result<Url, TwinsError> {
        let endpoint = self.endpoint.as_ref().ok_or(TwinsError::MissingEndpoint)?;
        let mut url = endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| TwinsError::InvalidEndpoint(endpoint.to_string()))?
            .pop_if_empty()
            .push("digitaltwins")
            .push(twin_id);
        url.query_pairs_mut()
            .clear()
            .append_pair("api-version", &self.api_version);
        Ok(url)
    }
}

#[async_trait]
impl TwinUpdater for DigitalTwinsClient {
    async fn authenticate(&self) -> Result<(), TwinsError> {
        if self.endpoint.is_none() {
            return Err(TwinsError::MissingEndpoint);
        }
        self.credential.get_token().await?;
        Ok(())
    }

    async fn update_digital_twin(
        &self,
        twin_id: &str,
        patch: &JsonPatchDocument,
    ) -> Result<(), TwinsError> {
        let url = self.twin_url(twin_id)?;
        let token = self.credential.get_token().await?;
        let start_time = Instant::now();

        debug!("PATCH {} with {} operations", url, patch.operations().len());
        let response = self
            .http
            .patch(url)
            .header(AUTHORIZATION, format!("Bearer {}", token.token))
            .header(CONTENT_TYPE, patch::CONTENT_TYPE)
            .json(patch)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(parsed) => format!("{} - {}", parsed.error.code, parsed.error.message),
                Err(_) => body,
            };
            return Err(TwinsError::Service {
                twin_id: twin_id.to_string(),
                status,
                message,
            });
        }

        info!(
            "Updated twin {} in {}ms.",
            twin_id,
            start_time.elapsed().as_millis()
        );
        Ok(())
    }
}
