use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::Envelope;

/// No registered pattern matched the envelope.
pub const NOT_IMPLEMENTED: i64 = -32601;
/// The matched handler returned an error.
pub const HANDLER_FAILED: i64 = -32000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Error object carried by an `error` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Result of dispatching one envelope.
///
/// On the wire this is `{"status":"ok","data":...}` or
/// `{"status":"error","error":{"code":..,"message":..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok { data: Value },
    Error { error: ErrorBody },
}

impl Response {
    pub fn ok(data: impl Into<Value>) -> Self {
        Response::Ok { data: data.into() }
    }

    pub fn fail(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Response::Error {
            error: ErrorBody {
                code,
                message: message.into(),
                data,
            },
        }
    }

    /// The canonical answer for an envelope nobody registered a pattern for.
    pub fn not_implemented(envelope: &Envelope) -> Self {
        Self::fail(
            NOT_IMPLEMENTED,
            "Not Implemented",
            Some(envelope.clone().into_value()),
        )
    }

    pub fn status(&self) -> Status {
        match self {
            Response::Ok { .. } => Status::Ok,
            Response::Error { .. } => Status::Error,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status() == Status::Ok
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Response::Ok { data } => Some(data),
            Response::Error { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorBody> {
        match self {
            Response::Ok { .. } => None,
            Response::Error { error } => Some(error),
        }
    }

    pub fn to_value(&self) -> Value {
        // tagged enums of plain structs cannot fail to serialize
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Wire form of the response with the reply route echoed under `reply_field`.
    pub fn into_reply(self, reply_field: &str, route: Value) -> Value {
        let mut map = match self.to_value() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        map.insert(reply_field.to_string(), route);
        Value::Object(map)
    }

    /// Splits a reply back into its route and response.
    pub fn from_reply(
        value: Value,
        reply_field: &str,
    ) -> Result<(Option<Value>, Response), serde_json::Error> {
        let mut value = value;
        let route = value
            .as_object_mut()
            .and_then(|map| map.remove(reply_field));
        let response = serde_json::from_value(value)?;
        Ok((route, response))
    }
}
