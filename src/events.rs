use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const EVENT_GRID_BINDING: &str = "eventGridEvent";
pub const SUBSCRIPTION_VALIDATION_EVENT: &str = "Microsoft.EventGrid.SubscriptionValidationEvent";

/// Event Grid schema event as delivered to a trigger or webhook.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventGridEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub event_time: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub data_version: Option<String>,
    #[serde(default)]
    pub metadata_version: Option<String>,
}

impl EventGridEvent {
    /// Returns the event payload, decoding it first when the publisher sent
    /// the JSON document as a string. `None` when there is nothing to do.
    pub fn payload(&self) -> Result<Option<Value>, serde_json::Error> {
        match &self.data {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
            Some(Value::String(text)) => serde_json::from_str(text).map(Some),
            Some(other) => Ok(Some(other.clone())),
        }
    }

    pub fn is_subscription_validation(&self) -> bool {
        self.event_type == SUBSCRIPTION_VALIDATION_EVENT
    }

    pub fn validation_code(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|data| data.get("validationCode"))
            .and_then(Value::as_str)
    }
}

/// Request body posted by the Functions host to a custom handler.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct InvocationRequest {
    #[serde(rename = "Data", default)]
    pub data: HashMap<String, Value>,
    #[serde(rename = "Metadata", default)]
    pub metadata: HashMap<String, Value>,
}

impl InvocationRequest {
    /// Extracts the trigger event bound as `binding`. The host may send the
    /// event either as an object or as its JSON text.
    pub fn event(&self, binding: &str) -> Result<Option<EventGridEvent>, serde_json::Error> {
        let Some(raw) = self.data.get(binding) else {
            debug!("binding {} missing from invocation", binding);
            return Ok(None);
        };
        match raw {
            Value::Null => Ok(None),
            Value::String(text) => serde_json::from_str(text).map(Some),
            other => EventGridEvent::deserialize(other).map(Some),
        }
    }
}

/// Response body returned to the Functions host.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct InvocationResponse {
    #[serde(rename = "Outputs")]
    pub outputs: HashMap<String, Value>,
    #[serde(rename = "Logs")]
    pub logs: Vec<String>,
    #[serde(rename = "ReturnValue")]
    pub return_value: Option<Value>,
}

/// One element of the telemetry array published by the edge gateway.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMessage {
    pub device_name: String,
    pub readings: Vec<Value>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReading {
    pub resource_name: String,
    pub value: ReadingValue,
}

/// Readings arrive as JSON numbers or as numeric strings.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ReadingValue {
    Number(f64),
    Text(String),
}

impl ReadingValue {
    /// The reading as `f32`; `None` unless it is a finite number within
    /// `f32` range.
    pub fn as_f32(&self) -> Option<f32> {
        let value = match self {
            ReadingValue::Number(n) => *n as f32,
            ReadingValue::Text(text) => text.trim().parse::<f32>().ok()?,
        };
        value.is_finite().then_some(value)
    }
}
