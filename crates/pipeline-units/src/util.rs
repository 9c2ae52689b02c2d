//! Utility units: pass the input through after a delay, or fail

use async_trait::async_trait;
use pipeline_core::{Context, FieldSpec, UnitConfig, UnitError, UnitRequest, ValueKind, WorkUnit};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_DELAY_SECS: f64 = 1.0;

/// Longest sleep between two cancellation checks
const CHECK_INTERVAL: Duration = Duration::from_millis(100);

fn delay_config(name: &str, description: &str) -> UnitConfig {
    UnitConfig::new(
        name,
        vec![
            FieldSpec::required("value", ValueKind::Any),
            FieldSpec::optional("seconds", ValueKind::Number),
        ],
        ValueKind::Any,
    )
    .with_description(description)
}

fn requested_delay(request: &UnitRequest) -> Result<Duration, UnitError> {
    let seconds = match request.get("seconds") {
        Some(value) => value.as_f64().ok_or_else(|| {
            UnitError::InvalidInput(format!("seconds must be a number, got {value}"))
        })?,
        None => DEFAULT_DELAY_SECS,
    };
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| UnitError::InvalidInput(format!("invalid delay: {seconds}")))
}

/// `util.delay`: cooperative sleep, checking the abort flag as it goes
pub struct DelayUnit {
    config: UnitConfig,
}

impl DelayUnit {
    pub const NAME: &'static str = "util.delay";

    pub fn new() -> Self {
        Self {
            config: delay_config(Self::NAME, "Pass the input through after a delay"),
        }
    }
}

impl Default for DelayUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkUnit for DelayUnit {
    fn config(&self) -> &UnitConfig {
        &self.config
    }

    async fn execute(&self, ctx: &Context, request: UnitRequest) -> Result<Value, UnitError> {
        let total = requested_delay(&request)?;
        let value = request.require("value")?.clone();
        debug!("{} sleeping {:?}", ctx.handle_id, total);

        let deadline = tokio::time::Instant::now() + total;
        loop {
            ctx.checkpoint()?;
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let step = (deadline - now).min(CHECK_INTERVAL);
            tokio::select! {
                _ = ctx.cancelled() => {}
                _ = tokio::time::sleep(step) => {}
            }
        }

        Ok(value)
    }
}

/// `util.block`: sleep without ever looking at the abort flag. Only a
/// forceful revoke stops it early.
pub struct BlockUnit {
    config: UnitConfig,
}

impl BlockUnit {
    pub const NAME: &'static str = "util.block";

    pub fn new() -> Self {
        Self {
            config: delay_config(Self::NAME, "Sleep, ignoring cooperative cancellation"),
        }
    }
}

impl Default for BlockUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkUnit for BlockUnit {
    fn config(&self) -> &UnitConfig {
        &self.config
    }

    async fn execute(&self, ctx: &Context, request: UnitRequest) -> Result<Value, UnitError> {
        let total = requested_delay(&request)?;
        let value = request.require("value")?.clone();
        info!("{} blocking for {:?}", ctx.handle_id, total);
        tokio::time::sleep(total).await;
        Ok(value)
    }
}

/// `util.fail`: always fails with the given message
pub struct FailUnit {
    config: UnitConfig,
}

impl FailUnit {
    pub const NAME: &'static str = "util.fail";

    pub fn new() -> Self {
        Self {
            config: UnitConfig::new(
                Self::NAME,
                vec![
                    FieldSpec::required("value", ValueKind::Any),
                    FieldSpec::optional("message", ValueKind::Text),
                ],
                ValueKind::Any,
            )
            .with_description("Fail unconditionally"),
        }
    }
}

impl Default for FailUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkUnit for FailUnit {
    fn config(&self) -> &UnitConfig {
        &self.config
    }

    async fn execute(&self, _ctx: &Context, request: UnitRequest) -> Result<Value, UnitError> {
        let message = request
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("failed on request");
        Err(UnitError::ExecutionFailed(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::HandleId;
    use serde_json::{json, Map};
    use std::time::Instant;

    fn request(value: Value, seconds: f64) -> UnitRequest {
        let mut params = Map::new();
        params.insert("seconds".to_string(), json!(seconds));
        UnitRequest::new(params).with_piped("value", value)
    }

    #[tokio::test]
    async fn test_delay_passes_value_through() {
        let ctx = Context::new(HandleId::new(), 0);
        let value = DelayUnit::new()
            .execute(&ctx, request(json!({"k": 1}), 0.05))
            .await
            .unwrap();
        assert_eq!(value, json!({"k": 1}));
    }

    #[tokio::test]
    async fn test_delay_stops_on_abort() {
        let ctx = Context::new(HandleId::new(), 0);
        let token = ctx.token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let start = Instant::now();
        let err = DelayUnit::new()
            .execute(&ctx, request(json!(1), 30.0))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_block_ignores_abort() {
        let ctx = Context::new(HandleId::new(), 0);
        ctx.token().cancel();
        let value = BlockUnit::new()
            .execute(&ctx, request(json!("done"), 0.01))
            .await
            .unwrap();
        assert_eq!(value, json!("done"));
    }

    #[tokio::test]
    async fn test_negative_delay_rejected() {
        let ctx = Context::new(HandleId::new(), 0);
        let err = DelayUnit::new()
            .execute(&ctx, request(json!(1), -1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, UnitError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_fail_message() {
        let ctx = Context::new(HandleId::new(), 0);
        let mut params = Map::new();
        params.insert("message".to_string(), json!("model unavailable"));
        let request = UnitRequest::new(params).with_piped("value", json!(1));
        let err = FailUnit::new().execute(&ctx, request).await.unwrap_err();
        assert_eq!(err.to_string(), "Unit execution failed: model unavailable");
    }
}
