use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::InputProvisioner;
use crate::engine::OperationMonitor;
use crate::types::{ExternalFile, InputFormat};

/// Hands the caller's path to the engine unchanged, after checking it exists locally.
#[derive(Clone, Debug, Default)]
pub struct RawInputProvisioner;

impl RawInputProvisioner {
    async fn matches(format: InputFormat, path: &str) -> Result<()> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Cannot stat '{path}'"))?;
        match format {
            InputFormat::File if !metadata.is_file() => bail!("'{path}' is not a file"),
            InputFormat::Directory if !metadata.is_dir() => bail!("'{path}' is not a directory"),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl InputProvisioner for RawInputProvisioner {
    fn name(&self) -> &str {
        "raw"
    }

    fn formats(&self) -> Vec<InputFormat> {
        vec![InputFormat::File, InputFormat::Directory]
    }

    async fn preflight(&self, format: InputFormat, file: &ExternalFile) -> bool {
        match Self::matches(format, &file.path).await {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %file.path, "Preflight rejected input: {e:#}");
                false
            }
        }
    }

    async fn provision(
        &self,
        format: InputFormat,
        file: &ExternalFile,
        _monitor: &dyn OperationMonitor,
    ) -> Result<Value> {
        Self::matches(format, &file.path).await?;
        Ok(Value::String(file.path.clone()))
    }
}
