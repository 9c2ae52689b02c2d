//! Client unit for a plugin server route
//!
//! Each plugin server exposes routes such as `/audio/transcribe` taking
//! `{"inputs": {...}, "parameters": {...}}`. Path-kind inputs are wrapped as
//! `{"path": ...}`. The response is either a batch of texts, of which the
//! first value is returned, or a directory/file response carrying `path`.

use async_trait::async_trait;
use pipeline_core::{Context, UnitConfig, UnitError, UnitRequest, ValueKind, WorkUnit};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Plugin route description, usually loaded from YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpPluginConfig {
    /// Unit name, inputs and output kind
    #[serde(flatten)]
    pub unit: UnitConfig,

    /// Base URL of the plugin server (e.g. `http://localhost:8000`)
    pub base_url: String,

    /// Route on the server (e.g. `/audio/transcribe`)
    pub route: String,

    /// Input fields sent under `parameters`; all others go under `inputs`
    #[serde(default)]
    pub parameters: Vec<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

impl HttpPluginConfig {
    pub fn new(unit: UnitConfig, base_url: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            unit,
            base_url: base_url.into(),
            route: route.into(),
            parameters: Vec::new(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_parameters(mut self, parameters: &[&str]) -> Self {
        self.parameters = parameters.iter().map(ToString::to_string).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.route.trim_start_matches('/')
        )
    }
}

/// Calls a plugin server route as a work unit
pub struct HttpPluginUnit {
    config: HttpPluginConfig,
    client: reqwest::Client,
}

impl HttpPluginUnit {
    pub fn new(config: HttpPluginConfig) -> Result<Self, UnitError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| UnitError::Http(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    /// Load plugin route from YAML configuration
    pub fn from_yaml(yaml_path: impl AsRef<Path>) -> Result<Self, UnitError> {
        let contents = std::fs::read_to_string(yaml_path.as_ref())?;
        let config: HttpPluginConfig = serde_yaml::from_str(&contents)
            .map_err(|e| UnitError::ExecutionFailed(format!("Failed to parse YAML: {e}")))?;
        Self::new(config)
    }

    pub fn plugin_config(&self) -> &HttpPluginConfig {
        &self.config
    }

    /// Build the `{inputs, parameters}` body from the request
    fn body(&self, request: &UnitRequest) -> Value {
        let mut inputs = Map::new();
        let mut parameters = Map::new();

        for field in &self.config.unit.inputs {
            let Some(value) = request.get(&field.name) else {
                continue;
            };
            if self.config.parameters.contains(&field.name) {
                parameters.insert(field.name.clone(), value.clone());
            } else if field.kind == ValueKind::Path {
                inputs.insert(field.name.clone(), json!({ "path": value }));
            } else {
                inputs.insert(field.name.clone(), value.clone());
            }
        }

        json!({ "inputs": inputs, "parameters": parameters })
    }

    async fn call(&self, body: &Value) -> Result<Value, UnitError> {
        let url = self.config.url();
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| UnitError::Http(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UnitError::Http(format!("{url} returned {status}: {text}")));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| UnitError::Http(format!("{url}: invalid response body: {e}")))
    }
}

/// Pull the useful value out of a plugin response
fn extract_output(response: &Value) -> Option<Value> {
    if let Some(texts) = response.get("texts").and_then(Value::as_array) {
        return texts.first().and_then(|t| t.get("value")).cloned();
    }
    response.get("path").cloned()
}

#[async_trait]
impl WorkUnit for HttpPluginUnit {
    fn config(&self) -> &UnitConfig {
        &self.config.unit
    }

    async fn execute(&self, ctx: &Context, request: UnitRequest) -> Result<Value, UnitError> {
        ctx.checkpoint()?;
        let body = self.body(&request);

        let response = tokio::select! {
            _ = ctx.cancelled() => {
                warn!("{} aborted while waiting on {}", ctx.handle_id, self.config.route);
                return Err(UnitError::Cancelled(format!(
                    "abort requested during {}",
                    self.config.route
                )));
            }
            response = self.call(&body) => response?,
        };

        // The server may finish after an abort was raised; drop its answer.
        ctx.checkpoint()?;

        let output = extract_output(&response).ok_or_else(|| {
            UnitError::ExecutionFailed(format!(
                "{} returned no texts and no path: {}",
                self.config.route, response
            ))
        })?;

        info!("{} finished {}", ctx.handle_id, self.config.route);
        Ok(output)
    }
}
