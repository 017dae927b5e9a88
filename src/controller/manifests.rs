//! Source of rendered manifests
//!
//! Templating happens upstream; the engine only reads the rendered
//! multi-document YAML and parses it into resources.

use crate::model::{parse_manifests, ModelError, Resource};
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifests from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifests: {0}")]
    Parse(#[from] ModelError),

    #[error("no resources found in rendered manifests")]
    Empty,
}

#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Rendered resources, in manifest order
    async fn resources(&self) -> Result<Vec<Resource>, ManifestError>;
}

/// Rendered manifests read from a file on disk
pub struct FileManifestSource {
    path: PathBuf,
}

impl FileManifestSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileManifestSource { path: path.into() }
    }
}

#[async_trait]
impl ManifestSource for FileManifestSource {
    async fn resources(&self) -> Result<Vec<Resource>, ManifestError> {
        let yaml = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ManifestError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        parse_non_empty(&yaml)
    }
}

/// Rendered manifests held in memory
pub struct StringManifestSource {
    yaml: String,
}

impl StringManifestSource {
    pub fn new(yaml: impl Into<String>) -> Self {
        StringManifestSource { yaml: yaml.into() }
    }
}

#[async_trait]
impl ManifestSource for StringManifestSource {
    async fn resources(&self) -> Result<Vec<Resource>, ManifestError> {
        parse_non_empty(&self.yaml)
    }
}

fn parse_non_empty(yaml: &str) -> Result<Vec<Resource>, ManifestError> {
    let resources = parse_manifests(yaml)?;
    if resources.is_empty() {
        return Err(ManifestError::Empty);
    }
    Ok(resources)
}
