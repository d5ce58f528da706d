use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::{OutputProvisioner, OutputRequest};
use crate::engine::OperationMonitor;
use crate::types::{ExternalId, OutputFormat, ProvisionedOutput};

const DEFAULT_METATYPE: &str = "application/octet-stream";

/// Caller metadata accepted for every manual output.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ManualMetadata {
    /// Identifiers to associate; defaults to every identifier the run's inputs require.
    #[serde(default)]
    external_ids: Option<BTreeSet<ExternalId>>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    metatype: Option<String>,
}

/// A file output as printed by the engine: a bare path or a described file.
#[derive(Deserialize)]
#[serde(untagged)]
enum FileValue {
    Path(String),
    Described {
        path: String,
        #[serde(default)]
        metatype: Option<String>,
        #[serde(default)]
        checksum: Option<String>,
    },
}

/// Records engine outputs where they already are; nothing is copied.
#[derive(Clone, Debug, Default)]
pub struct ManualOutputProvisioner;

impl ManualOutputProvisioner {
    fn parse_metadata(metadata: &Value) -> Result<ManualMetadata> {
        if metadata.is_null() {
            return Ok(ManualMetadata::default());
        }
        serde_json::from_value(metadata.clone()).context("Invalid output metadata")
    }

    async fn sha256(path: &str) -> Result<String> {
        let contents = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read output '{path}'"))?;
        Ok(hex::encode(Sha256::digest(&contents)))
    }
}

#[async_trait]
impl OutputProvisioner for ManualOutputProvisioner {
    fn name(&self) -> &str {
        "manual"
    }

    fn formats(&self) -> Vec<OutputFormat> {
        vec![OutputFormat::File, OutputFormat::Url]
    }

    fn check_metadata(&self, format: OutputFormat, metadata: &Value) -> Vec<String> {
        match Self::parse_metadata(metadata) {
            Err(e) => vec![format!("{e:#}")],
            Ok(parsed) if format == OutputFormat::Url && parsed.metatype.is_some() => {
                vec!["metatype only applies to file outputs".to_string()]
            }
            Ok(_) => Vec::new(),
        }
    }

    async fn provision(
        &self,
        request: OutputRequest,
        _monitor: &dyn OperationMonitor,
    ) -> Result<Vec<ProvisionedOutput>> {
        let metadata = Self::parse_metadata(&request.metadata)?;
        let external_ids = metadata
            .external_ids
            .unwrap_or_else(|| request.external_ids.clone());

        let record = match request.format {
            OutputFormat::File => {
                let file: FileValue = serde_json::from_value(request.value.clone())
                    .with_context(|| format!("Output '{}' is not a file", request.output))?;
                let (path, metatype, checksum) = match file {
                    FileValue::Path(path) => (path, None, None),
                    FileValue::Described {
                        path,
                        metatype,
                        checksum,
                    } => (path, metatype, checksum),
                };
                let checksum = match checksum {
                    Some(checksum) => checksum,
                    None => Self::sha256(&path).await?,
                };
                ProvisionedOutput::File {
                    external_ids,
                    storage_path: path,
                    checksum,
                    metatype: metatype
                        .or(metadata.metatype)
                        .unwrap_or_else(|| DEFAULT_METATYPE.to_string()),
                    labels: metadata.labels,
                }
            }
            OutputFormat::Url => {
                let Some(raw) = request.value.as_str() else {
                    bail!("Output '{}' is not a URL string", request.output);
                };
                let url = url::Url::parse(raw)
                    .with_context(|| format!("Output '{}' is not a valid URL", request.output))?;
                ProvisionedOutput::Url {
                    external_ids,
                    url: url.to_string(),
                    labels: metadata.labels,
                }
            }
        };
        debug!(run_id = %request.run_id, output = %request.output, kind = record.kind(), "Provisioned output");
        Ok(vec![record])
    }
}
