use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Field that carries the reply route when no other name is configured.
pub const REPLY_FIELD: &str = "returnPath";

/// A structured message routed through pattern matching.
///
/// The schema is open: any JSON object is a valid envelope. Routing only looks at
/// the fields a [`Pattern`] names, everything else is payload.
///
/// ```ignore
/// use serde_json::json;
/// use sluice_wire::Envelope;
///
/// let env = Envelope::try_from(json!({"role": "adder", "cmd": "add", "first": 1}))?;
/// assert_eq!(env.get("cmd"), Some(&json!("add")));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope {
    fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// Envelopes and patterns are always JSON objects.
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
}

impl Envelope {
    pub fn new() -> Self {
        Self { fields: Map::new() }
    }

    /// Builder style insert, handy in tests and clients.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The reply route stored under `field`. A `null` route counts as absent.
    pub fn reply_to(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).filter(|v| !v.is_null())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

impl TryFrom<Value> for Envelope {
    type Error = EnvelopeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(EnvelopeError::NotAnObject(kind(&other))),
        }
    }
}

impl From<Envelope> for Value {
    fn from(env: Envelope) -> Self {
        env.into_value()
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.fields.clone()))
    }
}

/// A partial field set used to select envelopes.
///
/// A pattern matches an envelope when every one of its fields is present in the
/// envelope with an equal value. The empty pattern matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern {
    fields: Map<String, Value>,
}

impl Pattern {
    pub fn new() -> Self {
        Self { fields: Map::new() }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        self.fields
            .iter()
            .all(|(key, expected)| envelope.get(key) == Some(expected))
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl TryFrom<Value> for Pattern {
    type Error = EnvelopeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(EnvelopeError::NotAnObject(kind(&other))),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.fields.clone()))
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adder() -> Envelope {
        Envelope::try_from(json!({"role": "adder", "cmd": "add", "first": 1, "second": 2}))
            .unwrap()
    }

    #[test]
    fn subset_with_equal_values_matches() {
        let pattern = Pattern::new().with("role", "adder").with("cmd", "add");
        assert!(pattern.matches(&adder()));
    }

    #[test]
    fn differing_value_does_not_match() {
        let pattern = Pattern::new().with("role", "adder").with("cmd", "subtract");
        assert!(!pattern.matches(&adder()));
    }

    #[test]
    fn missing_field_does_not_match() {
        let pattern = Pattern::new().with("role", "adder").with("version", 2);
        assert!(!pattern.matches(&adder()));
    }

    #[test]
    fn empty_pattern_matches_everything() {
        assert!(Pattern::new().matches(&adder()));
        assert!(Pattern::new().matches(&Envelope::new()));
    }

    #[test]
    fn values_compare_structurally() {
        let pattern = Pattern::try_from(json!({"meta": {"v": 1}})).unwrap();
        let env = Envelope::new().with("meta", json!({"v": 1})).with("x", true);
        assert!(pattern.matches(&env));
        // 1 and 1.0 are different JSON numbers
        let env = Envelope::new().with("meta", json!({"v": 1.0}));
        assert!(!pattern.matches(&env));
    }

    #[test]
    fn non_objects_are_rejected() {
        assert_eq!(
            Envelope::try_from(json!([1, 2])),
            Err(EnvelopeError::NotAnObject("an array"))
        );
        assert!(Pattern::try_from(json!("role")).is_err());
    }

    #[test]
    fn null_reply_route_counts_as_absent() {
        let env = adder().with(REPLY_FIELD, Value::Null);
        assert_eq!(env.reply_to(REPLY_FIELD), None);
        let env = adder().with(REPLY_FIELD, "q-1");
        assert_eq!(env.reply_to(REPLY_FIELD), Some(&json!("q-1")));
    }

    #[test]
    fn serializes_as_plain_object() {
        let env = Envelope::new().with("cmd", "add");
        assert_eq!(serde_json::to_string(&env).unwrap(), r#"{"cmd":"add"}"#);
        let back: Envelope = serde_json::from_str(r#"{"cmd":"add"}"#).unwrap();
        assert_eq!(back, env);
    }
}
