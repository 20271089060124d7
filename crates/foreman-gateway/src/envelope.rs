//! Result envelope: every structured prompt is validated against a oneOf of
//! the caller's success schema and a fixed error shape, so the model can
//! decline a request in-band instead of hallucinating a fit.

use serde_json::{json, Map, Value};

pub const ERROR_KEY: &str = "unable_to_fulfill_request_error";

fn error_schema() -> Value {
    json!({
        "type": "object",
        "properties": { ERROR_KEY: { "type": "string" } },
        "required": [ERROR_KEY],
        "additionalProperties": false,
    })
}

/// Wrap a success schema in the success-or-error envelope. `None` means the
/// caller wants no validation at all.
pub fn result_envelope(success: Option<&Value>) -> Option<Value> {
    success.map(|schema| json!({ "oneOf": [schema, error_schema()] }))
}

/// The outcome of one structured exchange, as the session layer hands it to
/// pipeline steps.
#[derive(Clone, Debug)]
pub enum ChatResponse {
    Success { data: Map<String, Value> },
    Error { error_message: String },
}

impl ChatResponse {
    /// Split a validated envelope answer into its branch.
    pub fn from_answer(answer: Map<String, Value>) -> Self {
        match answer.get(ERROR_KEY).and_then(Value::as_str) {
            Some(message) => Self::Error {
                error_message: message.to_owned(),
            },
            None => Self::Success { data: answer },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error_message: message.into(),
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn data(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Success { data } => Some(data),
            Self::Error { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Error { error_message } => Some(error_message),
        }
    }
}
