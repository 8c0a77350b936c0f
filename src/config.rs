use std::env;
use std::string::String;
use std::time::Duration;

use reqwest::Url;
use tracing::error;

use crate::process::FailureMode;

pub const DEFAULT_AUDIENCE: &str = "https://digitaltwins.azure.net";
pub const DEFAULT_API_VERSION: &str = "2023-10-31";
pub const DEFAULT_FUNCTION_NAME: &str = "IoTHubtoDigitaleTwins";

#[derive(Debug, Clone)]
pub struct Config {
    /// `None` when the setting is missing or unusable and `STRICT_CONFIG` is
    /// off; every invocation then logs the problem and sends nothing.
    pub adt_service_url: Option<Url>,
    pub failure_mode: FailureMode,
    pub audience: String,
    pub api_version: String,
    pub request_timeout: Duration,
    pub port: u16,
    pub function_name: String,
    pub identity: IdentityConfig,
}

/// Where managed-identity tokens come from. The Functions host exports
/// `IDENTITY_ENDPOINT` and `IDENTITY_HEADER`; anything else falls back to
/// the instance metadata service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    AppService { endpoint: String, header: String },
    Imds { endpoint: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConfig {
    pub source: IdentitySource,
    pub client_id: Option<String>,
}

pub const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

impl Config {
    pub fn load_from_env() -> Result<Config, String> {
        let strict_config = env::var("STRICT_CONFIG")
            .unwrap_or("false".to_string())
            .parse::<bool>()
            .unwrap_or(false);
        let adt_service_url = match service_url_from_env() {
            Ok(url) => Some(url),
            Err(e) if strict_config => return Err(e),
            Err(e) => {
                error!("{}", e);
                None
            }
        };

        let conf = Config {
            adt_service_url,
            failure_mode: env::var("UPDATE_FAILURE_MODE")
                .unwrap_or(FailureMode::default().to_string())
                .parse::<FailureMode>()?,
            audience: env::var("ADT_AUDIENCE").unwrap_or(DEFAULT_AUDIENCE.to_string()),
            api_version: env::var("ADT_API_VERSION").unwrap_or(DEFAULT_API_VERSION.to_string()),
            request_timeout: env::var("ADT_REQUEST_TIMEOUT_SECS")
                .unwrap_or("30".to_string())
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| format!("Error parsing ADT_REQUEST_TIMEOUT_SECS to u64 - {}", e))?,
            port: env::var("FUNCTIONS_CUSTOMHANDLER_PORT")
                .unwrap_or("8080".to_string())
                .parse::<u16>()
                .map_err(|e| format!("Error parsing FUNCTIONS_CUSTOMHANDLER_PORT to u16 - {}", e))?,
            function_name: env::var("FUNCTION_NAME")
                .unwrap_or(DEFAULT_FUNCTION_NAME.to_string()),
            identity: IdentityConfig::load_from_env(),
        };

        Ok(conf)
    }
}

fn service_url_from_env() -> Result<Url, String> {
    let raw_url = env::var("ADT_SERVICE_URL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| "Application setting \"ADT_SERVICE_URL\" not set".to_string())?;
    let url = Url::parse(raw_url.trim())
        .map_err(|e| format!("error parsing ADT_SERVICE_URL {raw_url} - {e}"))?;
    if url.cannot_be_a_base() {
        return Err(format!("ADT_SERVICE_URL {raw_url} is not a base url"));
    }
    Ok(url)
}

impl IdentityConfig {
    pub fn load_from_env() -> IdentityConfig {
        let source = match (env::var("IDENTITY_ENDPOINT"), env::var("IDENTITY_HEADER")) {
            (Ok(endpoint), Ok(header)) => IdentitySource::AppService { endpoint, header },
            _ => IdentitySource::Imds {
                endpoint: IMDS_ENDPOINT.to_string(),
            },
        };
        IdentityConfig {
            source,
            client_id: env::var("AZURE_CLIENT_ID").ok().filter(|s| !s.is_empty()),
        }
    }
}
