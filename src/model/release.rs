use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::resource::{Resource, ResourceId};
use super::ModelError;

/// Schema version written into every serialized history blob
pub const RELEASE_HISTORY_VERSION: &str = "v1";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReleaseStatus {
    #[default]
    InProgress,
    Succeeded,
    Failed,
}

/// A managed workload and the cluster revision last observed for it
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedWorkloadRevision {
    pub workload: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// One deployment attempt for a release name
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub number: u32,
    #[serde(default)]
    pub status: ReleaseStatus,
    pub created_at: DateTime<Utc>,
    /// Every resource applied in this release, in apply order
    #[serde(default)]
    pub resources: Vec<ResourceId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versioned_resources: Vec<ResourceId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_workloads: Vec<ManagedWorkloadRevision>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_workloads: Vec<Resource>,
    /// Full snapshots, only retained when pruning was enabled for this release
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources_with_spec: Vec<Resource>,
}

impl Release {
    fn new(number: u32, created_at: DateTime<Utc>) -> Self {
        Release {
            number,
            status: ReleaseStatus::InProgress,
            created_at,
            resources: Vec::new(),
            versioned_resources: Vec::new(),
            managed_workloads: Vec::new(),
            custom_workloads: Vec::new(),
            resources_with_spec: Vec::new(),
        }
    }

    /// Replace the resource list from a full resource set
    pub fn set_resources(&mut self, resources: &[Resource]) {
        self.resources = resources.iter().map(|r| r.id.clone()).collect();
        self.versioned_resources = resources
            .iter()
            .filter(|r| r.versioned)
            .map(|r| r.id.clone())
            .collect();
    }

    /// Record full snapshots for the next release's prune diff
    ///
    /// `skipPruning` is evaluated here, once, so a resource cannot opt out
    /// retroactively at prune time.
    pub fn set_resources_with_spec(&mut self, resources: &[Resource]) {
        self.resources_with_spec = resources
            .iter()
            .filter(|r| !r.skip_pruning)
            .cloned()
            .collect();
    }

    pub fn has_resources_with_spec(&self) -> bool {
        !self.resources_with_spec.is_empty()
    }

    pub fn is_rollback_eligible(&self) -> bool {
        self.status == ReleaseStatus::Succeeded && self.has_resources_with_spec()
    }
}

/// Ordered log of releases for one release name, oldest first
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseHistory {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub releases: Vec<Release>,
}

fn default_version() -> String {
    RELEASE_HISTORY_VERSION.to_string()
}

impl Default for ReleaseHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseHistory {
    pub fn new() -> Self {
        ReleaseHistory {
            version: default_version(),
            releases: Vec::new(),
        }
    }

    /// Load a history from its persisted blob; empty input yields a new history
    ///
    /// # Errors
    /// Returns `ModelError::Yaml` for malformed blobs and
    /// `ModelError::UnsupportedHistoryVersion` for unknown schema versions.
    pub fn from_yaml(data: &str) -> Result<Self, ModelError> {
        if data.trim().is_empty() {
            return Ok(Self::new());
        }
        let mut history: ReleaseHistory = serde_yaml::from_str(data)?;
        if history.version != RELEASE_HISTORY_VERSION {
            return Err(ModelError::UnsupportedHistoryVersion(history.version));
        }
        history.releases.sort_by_key(|r| r.number);
        Ok(history)
    }

    pub fn to_yaml(&self) -> Result<String, ModelError> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn next_number(&self) -> Result<u32, ModelError> {
        let latest = self.releases.iter().map(|r| r.number).max().unwrap_or(0);
        latest
            .checked_add(1)
            .ok_or(ModelError::ReleaseNumberExhausted(latest))
    }

    /// Append a new release recording the given resource identities
    ///
    /// # Errors
    /// `ModelError::ReleaseNumberExhausted` when the latest number is `u32::MAX`.
    pub fn create_new_release(
        &mut self,
        resource_ids: Vec<ResourceId>,
        now: DateTime<Utc>,
    ) -> Result<&mut Release, ModelError> {
        let mut release = Release::new(self.next_number()?, now);
        release.resources = resource_ids;
        Ok(self.push(release))
    }

    /// Append a new release that also keeps full specs for pruning
    pub fn create_new_release_with_resource_map(
        &mut self,
        resources: &[Resource],
        now: DateTime<Utc>,
    ) -> Result<&mut Release, ModelError> {
        let mut release = Release::new(self.next_number()?, now);
        release.set_resources(resources);
        release.set_resources_with_spec(resources);
        Ok(self.push(release))
    }

    fn push(&mut self, release: Release) -> &mut Release {
        self.releases.push(release);
        let last = self.releases.len() - 1;
        &mut self.releases[last]
    }

    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }

    pub fn latest_release(&self) -> Option<&Release> {
        self.releases.iter().max_by_key(|r| r.number)
    }

    pub fn latest_release_mut(&mut self) -> Option<&mut Release> {
        self.releases.iter_mut().max_by_key(|r| r.number)
    }

    pub fn release(&self, number: u32) -> Option<&Release> {
        self.releases.iter().find(|r| r.number == number)
    }

    pub fn release_mut(&mut self, number: u32) -> Option<&mut Release> {
        self.releases.iter_mut().find(|r| r.number == number)
    }

    /// Newest release older than `excluding` that succeeded and kept its specs
    pub fn previous_rollback_eligible_release(&self, excluding: u32) -> Option<&Release> {
        self.releases
            .iter()
            .filter(|r| r.number < excluding && r.is_rollback_eligible())
            .max_by_key(|r| r.number)
    }

    /// Newest succeeded release older than `excluding`, specs or not
    pub fn previous_successful_release(&self, excluding: u32) -> Option<&Release> {
        self.releases
            .iter()
            .filter(|r| r.number < excluding && r.status == ReleaseStatus::Succeeded)
            .max_by_key(|r| r.number)
    }

    /// Set the terminal status of the most recent release
    pub fn set_release_status(&mut self, status: ReleaseStatus) -> Option<u32> {
        let release = self.latest_release_mut()?;
        release.status = status;
        Some(release.number)
    }

    /// Evict releases that fall outside the retention window
    ///
    /// The window starts at the newest rollback-eligible release older than
    /// `current` (falling back to the newest succeeded one); everything older
    /// than that boundary is evicted, `current` never is. Returns the versioned
    /// resources of evicted releases that no kept release uses any more; the
    /// caller deletes those from the cluster. Versioned names are content
    /// hashes, so releases with unchanged config share them.
    pub fn cleanup(&mut self, current: u32) -> Vec<ResourceId> {
        let boundary = self
            .previous_rollback_eligible_release(current)
            .or_else(|| self.previous_successful_release(current))
            .map(|r| r.number)
            .unwrap_or(0);

        let (evicted, kept): (Vec<Release>, Vec<Release>) = std::mem::take(&mut self.releases)
            .into_iter()
            .partition(|r| r.number != current && r.number < boundary);
        self.releases = kept;

        let in_use: HashSet<&ResourceId> = self
            .releases
            .iter()
            .flat_map(|r| r.resources.iter())
            .collect();

        let mut stale = Vec::new();
        let mut seen = HashSet::new();
        for release in evicted.iter().rev() {
            for id in &release.versioned_resources {
                if !in_use.contains(id) && seen.insert(id.clone()) {
                    stale.push(id.clone());
                }
            }
        }
        stale
    }
}
