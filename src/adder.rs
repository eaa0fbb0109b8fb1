//! The demo adder service: `{role: "adder", cmd: "add", first, second}`
//! answers `{result: first + second}`.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use sluice_wire::{Envelope, Pattern};

use crate::dispatch::DispatcherBuilder;

pub fn pattern() -> Pattern {
    Pattern::new().with("role", "adder").with("cmd", "add")
}

/// Register the adder on `builder`.
pub fn register(builder: DispatcherBuilder) -> DispatcherBuilder {
    builder.add(pattern(), add)
}

pub fn request(first: i64, second: i64) -> Envelope {
    Envelope::new()
        .with("role", "adder")
        .with("cmd", "add")
        .with("first", first)
        .with("second", second)
}

pub async fn add(envelope: Envelope) -> Result<Value> {
    let first = operand(&envelope, "first")?;
    let second = operand(&envelope, "second")?;
    let result = first
        .checked_add(second)
        .context("sum does not fit in 64 bits")?;
    Ok(json!({ "result": result }))
}

// Operands arrive as numbers or, from form posts, as numeric strings.
fn operand(envelope: &Envelope, key: &str) -> Result<i64> {
    match envelope.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .with_context(|| format!("operand '{key}' is not an integer: {n}")),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .with_context(|| format!("operand '{key}' is not an integer: {s:?}")),
        Some(other) => bail!("operand '{key}' has unsupported type: {other}"),
        None => bail!("missing operand '{key}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn adds_numbers_and_numeric_strings() {
        assert_eq!(add(request(1, 2)).await.unwrap(), json!({"result": 3}));
        let env = Envelope::new().with("first", "40").with("second", 2);
        assert_eq!(add(env).await.unwrap(), json!({"result": 42}));
    }

    #[tokio::test]
    async fn missing_operand_is_an_error() {
        let err = add(Envelope::new().with("first", 1)).await.unwrap_err();
        assert!(err.to_string().contains("second"));
    }

    #[test]
    fn pattern_matches_requests() {
        assert!(pattern().matches(&request(0, 0)));
        assert!(!pattern().matches(&Envelope::new().with("cmd", "add")));
    }
}
