use serde::Serialize;
use serde_json::{Number, Value};

pub const CONTENT_TYPE: &str = "application/json-patch+json";

#[derive(Serialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Replace,
}

#[derive(Serialize, PartialEq, Debug, Clone)]
pub struct Operation {
    pub op: Op,
    pub path: String,
    pub value: Value,
}

/// JSON Patch (RFC 6902) body sent to the twin update API.
#[derive(Serialize, PartialEq, Debug, Clone, Default)]
#[serde(transparent)]
pub struct JsonPatchDocument {
    operations: Vec<Operation>,
}

impl JsonPatchDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a replace of the top-level property `property`.
    pub fn append_replace(&mut self, property: &str, value: impl Into<Value>) -> &mut Self {
        self.operations.push(Operation {
            op: Op::Replace,
            path: format!("/{}", escape_pointer_segment(property)),
            value: value.into(),
        });
        self
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }
}

/// JSON number for an `f32` reading, written with the shortest decimal that
/// round-trips as `f32` (0.1 stays 0.1 instead of its widened f64 digits).
/// `None` for NaN and infinities, which have no JSON form.
pub fn f32_number(value: f32) -> Option<Number> {
    if !value.is_finite() {
        return None;
    }
    value
        .to_string()
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
}

// RFC 6901: '~' must be escaped before '/'
fn escape_pointer_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}
