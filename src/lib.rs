use serde_json::Value;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::events::EventGridEvent;
use crate::process::{BatchReport, FailureMode, ProcessError};
use crate::twins::TwinUpdater;

pub mod config;
pub mod credential;
pub mod events;
pub mod patch;
pub mod process;
pub mod resource;
pub mod server;
pub mod twins;

pub type Error = Box<dyn std::error::Error + Send + Sync>;

pub fn set_up_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

/// What an invocation did, in the shape the Functions host reports back.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InvocationOutcome {
    pub report: Option<BatchReport>,
    pub logs: Vec<String>,
}

impl InvocationOutcome {
    pub fn return_value(&self) -> Option<Value> {
        self.report
            .as_ref()
            .and_then(|report| serde_json::to_value(report).ok())
    }
}

// event grid handler
//
// Never fails: errors are logged and reported in the outcome, the trigger
// always completes.
pub async fn function_handler(
    twins: &dyn TwinUpdater,
    mode: FailureMode,
    event: Option<&EventGridEvent>,
) -> InvocationOutcome {
    info!("Handling event grid invocation");

    let mut outcome = InvocationOutcome::default();
    match ingest(twins, mode, event).await {
        Ok(Some(report)) => {
            if !report.is_success() {
                warn!(
                    "{} of {} device messages were not applied",
                    report.failed.len(),
                    report.received
                );
            }
            for failure in &report.failed {
                outcome.logs.push(format!(
                    "Failed to update twin {}: {}",
                    failure.device_name, failure.error
                ));
            }
            outcome.logs.push(format!(
                "Updated {} of {} twins",
                report.updated.len(),
                report.received
            ));
            outcome.report = Some(report);
        }
        Ok(None) => {}
        Err(e) => {
            let line = format!("Error in ingest function: {}", e);
            error!("{}", line);
            outcome.logs.push(line);
        }
    }
    outcome
}

async fn ingest(
    twins: &dyn TwinUpdater,
    mode: FailureMode,
    event: Option<&EventGridEvent>,
) -> Result<Option<BatchReport>, ProcessError> {
    twins.authenticate().await.map_err(ProcessError::Client)?;
    info!("ADT service client connection created.");

    let Some(event) = event else {
        info!("No event received");
        return Ok(None);
    };
    debug!("Handling event: {:?}", event);

    let Some(payload) = event.payload().map_err(ProcessError::InvalidJson)? else {
        info!("Event {} carries no data", event.id);
        return Ok(None);
    };
    info!("{}", payload);

    let messages = process::device_messages(payload)?;
    process::forward_device_messages(twins, messages, mode)
        .await
        .map(Some)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::credential::CredentialError;
    use crate::patch::JsonPatchDocument;
    use crate::twins::TwinsError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingUpdater {
        updates: AtomicUsize,
        deny_auth: bool,
        reject: Option<&'static str>,
    }

    #[async_trait]
    impl TwinUpdater for CountingUpdater {
        async fn authenticate(&self) -> Result<(), TwinsError> {
            if self.deny_auth {
                return Err(TwinsError::Credential(CredentialError::InvalidToken(
                    "no identity assigned".to_string(),
                )));
            }
            Ok(())
        }

        async fn update_digital_twin(
            &self,
            twin_id: &str,
            _: &JsonPatchDocument,
        ) -> Result<(), TwinsError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if self.reject == Some(twin_id) {
                return Err(TwinsError::Service {
                    twin_id: twin_id.to_string(),
                    status: reqwest::StatusCode::BAD_REQUEST,
                    message: "JsonPatchInvalid".to_string(),
                });
            }
            Ok(())
        }
    }

    fn event(data: Option<Value>) -> EventGridEvent {
        EventGridEvent {
            id: "evt-1".to_string(),
            event_type: "Microsoft.Devices.DeviceTelemetry".to_string(),
            data,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_missing_payload_is_a_no_op() {
        let twins = CountingUpdater::default();

        let outcome = function_handler(&twins, FailureMode::default(), Some(&event(None))).await;
        assert_eq!(outcome, InvocationOutcome::default());

        let outcome = function_handler(&twins, FailureMode::default(), None).await;
        assert_eq!(outcome, InvocationOutcome::default());
        assert_eq!(twins.updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_authentication_failure_skips_messages() {
        let twins = CountingUpdater {
            deny_auth: true,
            ..Default::default()
        };
        let data = json!([{"deviceName": "d1", "readings": [{"resourceName": "CO2", "value": 1}]}]);

        let outcome =
            function_handler(&twins, FailureMode::default(), Some(&event(Some(data)))).await;

        assert_eq!(twins.updates.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.report, None);
        assert!(outcome.logs[0].starts_with("Error in ingest function:"));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_logged() {
        let twins = CountingUpdater::default();
        let outcome = function_handler(
            &twins,
            FailureMode::default(),
            Some(&event(Some(json!({"deviceName": "d1"})))),
        )
        .await;

        assert_eq!(twins.updates.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.report, None);
        assert_eq!(
            outcome.logs,
            vec!["Error in ingest function: event payload must be an array of device messages, got an object"]
        );
    }

    #[tokio::test]
    async fn test_report_is_returned() {
        let twins = CountingUpdater::default();
        let data = Value::String(
            r#"[{"deviceName":"d1","readings":[{"resourceName":"CO2","value":412.5}]}]"#
                .to_string(),
        );

        let outcome =
            function_handler(&twins, FailureMode::default(), Some(&event(Some(data)))).await;

        assert_eq!(twins.updates.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.logs, vec!["Updated 1 of 1 twins"]);
        assert_eq!(
            outcome.return_value(),
            Some(json!({"received": 1, "updated": ["d1"], "failed": []}))
        );
    }

    fn three_messages() -> Value {
        json!([
            {"deviceName": "d1", "readings": [{"resourceName": "CO2", "value": 1}]},
            {"deviceName": "d2", "readings": [{"resourceName": "CO2", "value": 2}]},
            {"deviceName": "d3", "readings": [{"resourceName": "CO2", "value": 3}]}
        ])
    }

    #[tokio::test]
    async fn test_update_failure_abandons_remaining_messages() {
        let twins = CountingUpdater {
            reject: Some("d2"),
            ..Default::default()
        };

        let outcome = function_handler(
            &twins,
            FailureMode::AbortBatch,
            Some(&event(Some(three_messages()))),
        )
        .await;

        assert_eq!(twins.updates.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.report, None);
        assert_eq!(outcome.logs.len(), 1);
        assert!(
            outcome.logs[0].starts_with("Error in ingest function: failed to update twin d2"),
            "got: {:?}",
            outcome.logs
        );
    }

    #[tokio::test]
    async fn test_isolated_failures_are_reported() {
        let twins = CountingUpdater {
            reject: Some("d2"),
            ..Default::default()
        };

        let outcome = function_handler(
            &twins,
            FailureMode::Isolate,
            Some(&event(Some(three_messages()))),
        )
        .await;

        assert_eq!(twins.updates.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.logs.len(), 2);
        assert!(outcome.logs[0].starts_with("Failed to update twin d2:"));
        assert_eq!(outcome.logs[1], "Updated 2 of 3 twins");
        let report = outcome.report.unwrap();
        assert!(!report.is_success());
        assert_eq!(report.updated, vec!["d1", "d3"]);
    }
}
