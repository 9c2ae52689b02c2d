//! Text file units
//!
//! `text.save` writes into the handle's stage directory and publishes the file
//! with a rename, so a re-run never leaves a half-written file behind.

use async_trait::async_trait;
use pipeline_core::{Context, FieldSpec, UnitConfig, UnitError, UnitRequest, ValueKind, WorkUnit};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DEFAULT_FILE_NAME: &str = "output.txt";

/// `text.save`: write text to a file, return its path
pub struct SaveTextUnit {
    config: UnitConfig,
}

impl SaveTextUnit {
    pub const NAME: &'static str = "text.save";

    pub fn new() -> Self {
        Self {
            config: UnitConfig::new(
                Self::NAME,
                vec![
                    FieldSpec::required("text", ValueKind::Text),
                    FieldSpec::optional("file_name", ValueKind::Text),
                ],
                ValueKind::Path,
            )
            .with_description("Save text into the stage directory"),
        }
    }
}

impl Default for SaveTextUnit {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject names that would escape the stage directory
fn checked_file_name(name: &str) -> Result<&str, UnitError> {
    let path = Path::new(name);
    let single = path.components().count() == 1
        && path.file_name().is_some_and(|f| f == path.as_os_str());
    if name.is_empty() || !single {
        return Err(UnitError::InvalidInput(format!(
            "file_name must be a plain file name, got '{name}'"
        )));
    }
    Ok(name)
}

#[async_trait]
impl WorkUnit for SaveTextUnit {
    fn config(&self) -> &UnitConfig {
        &self.config
    }

    async fn execute(&self, ctx: &Context, request: UnitRequest) -> Result<Value, UnitError> {
        let text = request.require_str("text")?;
        let file_name = match request.get("file_name") {
            Some(Value::String(name)) => checked_file_name(name)?,
            Some(Value::Null) | None => DEFAULT_FILE_NAME,
            Some(other) => {
                return Err(UnitError::InvalidInput(format!(
                    "file_name must be text, got {other}"
                )))
            }
        };

        let dir = ctx.ensure_stage_dir().await?;
        let target = dir.join(file_name);
        let staging = dir.join(format!(".{file_name}.partial"));

        ctx.checkpoint()?;
        tokio::fs::write(&staging, text).await?;
        ctx.checkpoint()?;
        tokio::fs::rename(&staging, &target).await?;

        info!("Saved {} bytes to {}", text.len(), target.display());
        Ok(Value::String(target.to_string_lossy().into_owned()))
    }
}

/// `text.read`: read a text file, or the first `.txt` file of a directory
pub struct ReadTextUnit {
    config: UnitConfig,
}

impl ReadTextUnit {
    pub const NAME: &'static str = "text.read";

    pub fn new() -> Self {
        Self {
            config: UnitConfig::new(
                Self::NAME,
                vec![FieldSpec::required("path", ValueKind::Path)],
                ValueKind::Text,
            )
            .with_description("Read text from a file or directory"),
        }
    }
}

impl Default for ReadTextUnit {
    fn default() -> Self {
        Self::new()
    }
}

async fn first_text_file(dir: &Path) -> Result<PathBuf, UnitError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut candidates = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "txt") {
            candidates.push(path);
        }
    }
    candidates.sort();
    candidates.into_iter().next().ok_or_else(|| {
        UnitError::InvalidInput(format!("no .txt file in {}", dir.display()))
    })
}

#[async_trait]
impl WorkUnit for ReadTextUnit {
    fn config(&self) -> &UnitConfig {
        &self.config
    }

    async fn execute(&self, ctx: &Context, request: UnitRequest) -> Result<Value, UnitError> {
        ctx.checkpoint()?;
        let path = PathBuf::from(request.require_str("path")?);

        let file = if tokio::fs::metadata(&path).await?.is_dir() {
            first_text_file(&path).await?
        } else {
            path
        };

        let text = tokio::fs::read_to_string(&file).await?;
        debug!("Read {} bytes from {}", text.len(), file.display());
        Ok(Value::String(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::HandleId;
    use serde_json::{json, Map};

    #[tokio::test]
    async fn test_save_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(HandleId::new(), 1).with_work_dir(dir.path());

        let mut params = Map::new();
        params.insert("file_name".to_string(), json!("audio.txt"));
        let request = UnitRequest::new(params).with_piped("text", json!("hello world"));
        let saved = SaveTextUnit::new().execute(&ctx, request).await.unwrap();

        let path = PathBuf::from(saved.as_str().unwrap());
        assert!(path.starts_with(ctx.stage_dir()));
        assert!(path.ends_with("audio.txt"));
        assert!(!ctx.stage_dir().join(".audio.txt.partial").exists());

        // Directory input resolves to the saved file
        let request = UnitRequest::default()
            .with_piped("path", json!(ctx.stage_dir().to_string_lossy()));
        let text = ReadTextUnit::new().execute(&ctx, request).await.unwrap();
        assert_eq!(text, json!("hello world"));
    }

    #[tokio::test]
    async fn test_save_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(HandleId::new(), 0).with_work_dir(dir.path());
        let unit = SaveTextUnit::new();

        let first = unit
            .execute(&ctx, UnitRequest::default().with_piped("text", json!("a")))
            .await
            .unwrap();
        let second = unit
            .execute(&ctx, UnitRequest::default().with_piped("text", json!("a")))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(first.as_str().unwrap()).unwrap(), "a");
    }

    #[tokio::test]
    async fn test_save_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(HandleId::new(), 0).with_work_dir(dir.path());

        let mut params = Map::new();
        params.insert("file_name".to_string(), json!("../escape.txt"));
        let request = UnitRequest::new(params).with_piped("text", json!("x"));
        let err = SaveTextUnit::new().execute(&ctx, request).await.unwrap_err();
        assert!(matches!(err, UnitError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_read_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(HandleId::new(), 0);
        let request =
            UnitRequest::default().with_piped("path", json!(dir.path().to_string_lossy()));
        let err = ReadTextUnit::new().execute(&ctx, request).await.unwrap_err();
        assert!(matches!(err, UnitError::InvalidInput(_)));
    }
}
