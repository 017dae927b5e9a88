//! Resource identity and release history model
//!
//! `resource` defines what a rendered manifest is and how it is identified;
//! `release` records deployment attempts for a release name and serializes
//! them to the YAML blob persisted in the cluster.

pub mod release;
pub mod resource;

pub use release::{
    ManagedWorkloadRevision, Release, ReleaseHistory, ReleaseStatus, RELEASE_HISTORY_VERSION,
};
pub use resource::{parse_manifests, Resource, ResourceId, WorkloadKind};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("manifest #{index} is missing apiVersion or kind")]
    MissingTypeMeta { index: usize },

    #[error("{kind} manifest #{index} is missing metadata.name")]
    MissingName { kind: String, index: usize },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unsupported release history version: {0}")]
    UnsupportedHistoryVersion(String),

    #[error("release number {0} cannot be followed by another release")]
    ReleaseNumberExhausted(u32),
}

#[cfg(test)]
#[path = "resource_test.rs"]
mod resource_tests;

#[cfg(test)]
#[path = "release_test.rs"]
mod release_tests;
