mod cli;
pub mod reconcile;
pub mod values;

use crate::utils::CommandError;
use async_trait::async_trait;
use std::time::Duration;

pub use cli::HelmCli;
pub use reconcile::reconcile;

pub const STATUS_DEPLOYED: &str = "deployed";

/// A release as Helm reports it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChartRelease {
    pub name: String,
    pub status: String,
    pub chart_version: String,
    pub app_version: String,
}

impl ChartRelease {
    pub fn is_deployed(&self) -> bool {
        self.status == STATUS_DEPLOYED
    }
}

/// A chart as resolved from its repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChartMetadata {
    pub name: String,
    pub version: String,
    pub app_version: String,
}

#[derive(Clone, Debug)]
pub struct ReleaseSpec {
    pub name: String,
    pub namespace: String,
    /// Repository-qualified chart reference, e.g. `airbyte/airbyte`.
    pub chart: String,
    /// Latest when unset.
    pub version: Option<String>,
    pub values: serde_json::Value,
    pub timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ChartError {
    #[error("Release {0} not found")]
    ReleaseNotFound(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Unexpected helm output: {0}")]
    Parse(String),

    #[error("{0:#}")]
    Other(anyhow::Error),
}

impl ChartError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ReleaseNotFound(_))
    }
}

/// Chart repository and release management.
#[async_trait]
pub trait ChartApi: Send + Sync {
    async fn add_repo(&self, name: &str, url: &str) -> Result<(), ChartError>;

    async fn chart_metadata(
        &self,
        chart: &str,
        version: Option<&str>,
    ) -> Result<ChartMetadata, ChartError>;

    /// `Ok(None)` and `Err(ChartError::ReleaseNotFound)` both mean there is
    /// no such release.
    async fn get_release(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ChartRelease>, ChartError>;

    async fn install_or_upgrade(&self, spec: &ReleaseSpec) -> Result<ChartRelease, ChartError>;

    async fn uninstall(&self, namespace: &str, name: &str) -> Result<(), ChartError>;

    /// Renders the chart to its manifests without installing it.
    async fn template(&self, spec: &ReleaseSpec) -> Result<String, ChartError>;
}
