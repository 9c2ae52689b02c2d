//! Arithmetic units, used by smoke pipelines and the end-to-end tests

use async_trait::async_trait;
use pipeline_core::{Context, FieldSpec, UnitConfig, UnitError, UnitRequest, ValueKind, WorkUnit};
use serde_json::{json, Value};
use tracing::debug;

/// Integer arithmetic when both operands are integers, float otherwise
fn combine(
    a: &Value,
    b: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, UnitError> {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return int_op(a, b)
            .map(Value::from)
            .ok_or_else(|| UnitError::ExecutionFailed(format!("integer overflow on {a} and {b}")));
    }

    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(float_op(a, b))),
        _ => Err(UnitError::InvalidInput(format!(
            "expected numbers, got {a} and {b}"
        ))),
    }
}

/// `math.double`: x * 2
pub struct DoubleUnit {
    config: UnitConfig,
}

impl DoubleUnit {
    pub const NAME: &'static str = "math.double";

    pub fn new() -> Self {
        Self {
            config: UnitConfig::new(
                Self::NAME,
                vec![FieldSpec::required("x", ValueKind::Number)],
                ValueKind::Number,
            )
            .with_description("Multiply the input by two"),
        }
    }
}

impl Default for DoubleUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkUnit for DoubleUnit {
    fn config(&self) -> &UnitConfig {
        &self.config
    }

    async fn execute(&self, ctx: &Context, request: UnitRequest) -> Result<Value, UnitError> {
        ctx.checkpoint()?;
        let x = request.require("x")?;
        let result = combine(x, &json!(2), i64::checked_mul, |a, b| a * b)?;
        debug!("{} {} -> {}", Self::NAME, x, result);
        Ok(result)
    }
}

/// `math.add`: x + y
pub struct AddUnit {
    config: UnitConfig,
}

impl AddUnit {
    pub const NAME: &'static str = "math.add";

    pub fn new() -> Self {
        Self {
            config: UnitConfig::new(
                Self::NAME,
                vec![
                    FieldSpec::required("x", ValueKind::Number),
                    FieldSpec::required("y", ValueKind::Number),
                ],
                ValueKind::Number,
            )
            .with_description("Add y to the input"),
        }
    }
}

impl Default for AddUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkUnit for AddUnit {
    fn config(&self) -> &UnitConfig {
        &self.config
    }

    async fn execute(&self, ctx: &Context, request: UnitRequest) -> Result<Value, UnitError> {
        ctx.checkpoint()?;
        let x = request.require("x")?;
        let y = request.require("y")?;
        let result = combine(x, y, i64::checked_add, |a, b| a + b)?;
        debug!("{} {} + {} -> {}", Self::NAME, x, y, result);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::HandleId;
    use serde_json::Map;

    fn ctx() -> Context {
        Context::new(HandleId::new(), 0)
    }

    #[tokio::test]
    async fn test_double_keeps_integers() {
        let request = UnitRequest::default().with_piped("x", json!(21));
        let value = DoubleUnit::new().execute(&ctx(), request).await.unwrap();
        assert_eq!(value, json!(42));
        assert!(value.is_i64());
    }

    #[tokio::test]
    async fn test_double_float() {
        let request = UnitRequest::default().with_piped("x", json!(1.25));
        let value = DoubleUnit::new().execute(&ctx(), request).await.unwrap();
        assert_eq!(value, json!(2.5));
    }

    #[tokio::test]
    async fn test_add_param() {
        let mut params = Map::new();
        params.insert("y".to_string(), json!(4));
        let request = UnitRequest::new(params).with_piped("x", json!(2));
        let value = AddUnit::new().execute(&ctx(), request).await.unwrap();
        assert_eq!(value, json!(6));
    }

    #[tokio::test]
    async fn test_add_rejects_text() {
        let mut params = Map::new();
        params.insert("y".to_string(), json!("four"));
        let request = UnitRequest::new(params).with_piped("x", json!(2));
        let err = AddUnit::new().execute(&ctx(), request).await.unwrap_err();
        assert!(matches!(err, UnitError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_overflow_is_an_error() {
        let request = UnitRequest::default().with_piped("x", json!(i64::MAX));
        let err = DoubleUnit::new().execute(&ctx(), request).await.unwrap_err();
        assert!(matches!(err, UnitError::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let ctx = ctx();
        ctx.token().cancel();
        let request = UnitRequest::default().with_piped("x", json!(1));
        let err = DoubleUnit::new().execute(&ctx, request).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
