use std::fmt;
use std::str::FromStr;
use std::string::String;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Number, Value};
use tracing::{debug, error, info};

use crate::events::{DeviceMessage, DeviceReading};
use crate::patch::{self, JsonPatchDocument};
use crate::resource::ResourceKind;
use crate::twins::{TwinUpdater, TwinsError};

#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    #[error("failed to create digital twins client - {0}")]
    Client(#[source] TwinsError),
    #[error("event payload is not valid JSON - {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("event payload must be an array of device messages, got {0}")]
    NotAnArray(&'static str),
    #[error("device message {index} is malformed - {reason}")]
    MalformedMessage { index: usize, reason: String },
    #[error("failed to update twin {device_name} from device message {index} - {source}")]
    Update {
        index: usize,
        device_name: String,
        #[source]
        source: TwinsError,
    },
}

/// What a failed twin update does to the rest of the batch.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
pub enum FailureMode {
    /// The first failed update ends the batch.
    #[default]
    AbortBatch,
    /// Failed updates are recorded and the remaining messages still go out.
    Isolate,
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "abort" => Ok(FailureMode::AbortBatch),
            "isolate" => Ok(FailureMode::Isolate),
            other => Err(format!("Invalid update failure mode {}", other)),
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FailureMode::AbortBatch => f.write_str("abort"),
            FailureMode::Isolate => f.write_str("isolate"),
        }
    }
}

/// A single twin update derived from the first reading of a device message.
#[derive(Debug, Clone, PartialEq)]
pub struct TwinUpdate {
    pub device_name: String,
    pub resource: ResourceKind,
    pub value: Number,
}

impl TwinUpdate {
    /// Builds the update for message `index`. Only `readings[0]` is looked
    /// at; later readings are not validated either.
    pub fn from_message(index: usize, message: Value) -> Result<TwinUpdate, ProcessError> {
        let malformed = |reason: String| ProcessError::MalformedMessage { index, reason };

        let message: DeviceMessage =
            serde_json::from_value(message).map_err(|e| malformed(e.to_string()))?;
        let mut readings = message.readings.into_iter();
        let first = readings
            .next()
            .ok_or_else(|| malformed(format!("device {} has no readings", message.device_name)))?;
        let ignored = readings.count();
        if ignored > 0 {
            debug!(
                "ignoring {} additional readings from {}",
                ignored, message.device_name
            );
        }

        let reading: DeviceReading = serde_json::from_value(first)
            .map_err(|e| malformed(format!("first reading of {} - {}", message.device_name, e)))?;
        let value = reading
            .value
            .as_f32()
            .and_then(patch::f32_number)
            .ok_or_else(|| {
                malformed(format!(
                    "value {:?} of {} is not a finite number",
                    reading.value, reading.resource_name
                ))
            })?;
        let resource = reading
            .resource_name
            .parse::<ResourceKind>()
            .unwrap_or_else(|never| match never {});

        Ok(TwinUpdate {
            device_name: message.device_name,
            resource,
            value,
        })
    }

    pub fn to_patch(&self) -> JsonPatchDocument {
        let mut patch = JsonPatchDocument::new();
        patch
            .append_replace("deviceName", self.device_name.as_str())
            .append_replace(self.resource.as_str(), self.value.clone());
        patch
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageFailure {
    pub index: usize,
    pub device_name: String,
    pub error: String,
}

/// Outcome of one invocation's batch.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub received: usize,
    pub updated: Vec<String>,
    pub failed: Vec<MessageFailure>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Splits an event payload into its device messages.
pub fn device_messages(payload: Value) -> Result<Vec<Value>, ProcessError> {
    match payload {
        Value::Array(messages) => Ok(messages),
        Value::Object(_) => Err(ProcessError::NotAnArray("an object")),
        Value::String(_) => Err(ProcessError::NotAnArray("a string")),
        Value::Number(_) => Err(ProcessError::NotAnArray("a number")),
        Value::Bool(_) => Err(ProcessError::NotAnArray("a boolean")),
        Value::Null => Err(ProcessError::NotAnArray("null")),
    }
}

fn log_reading(update: &TwinUpdate) {
    match update.resource {
        ResourceKind::Co2 | ResourceKind::Ch4 | ResourceKind::Nh3 | ResourceKind::N2o => info!(
            "Device name: {} Resource name: {} {}: {}",
            update.device_name, update.resource, update.resource, update.value
        ),
        ResourceKind::Other(_) => {}
    }
}

/// Applies one update per message, strictly in order. A malformed message
/// stops the batch; a failed update stops it too unless `mode` isolates
/// failures, in which case it is recorded and the batch goes on.
pub async fn forward_device_messages(
    updater: &dyn TwinUpdater,
    messages: Vec<Value>,
    mode: FailureMode,
) -> Result<BatchReport, ProcessError> {
    let mut report = BatchReport {
        received: messages.len(),
        ..Default::default()
    };
    let start_time = Instant::now();

    for (index, message) in messages.into_iter().enumerate() {
        let update = TwinUpdate::from_message(index, message)?;
        log_reading(&update);

        let patch = update.to_patch();
        match updater.update_digital_twin(&update.device_name, &patch).await {
            Ok(()) => report.updated.push(update.device_name),
            Err(source) if mode == FailureMode::AbortBatch => {
                return Err(ProcessError::Update {
                    index,
                    device_name: update.device_name,
                    source,
                });
            }
            Err(e) => {
                error!("Failed to update twin {}: {}", update.device_name, e);
                report.failed.push(MessageFailure {
                    index,
                    device_name: update.device_name,
                    error: e.to_string(),
                });
            }
        }
    }

    info!(
        "Forwarded {} of {} device messages in {}ms.",
        report.updated.len(),
        report.received,
        start_time.elapsed().as_millis()
    );
    Ok(report)
}
