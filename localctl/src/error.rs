use crate::helm::ChartError;
use crate::k8s::PodDiagnosis;
use crate::migrate::MigrationError;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LocalError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unable to communicate with the cluster: {0:#}")]
    ClusterCommunication(anyhow::Error),

    #[error("Failed installing the {release} chart: {source}{}", format_diagnosis(.diagnosis))]
    ChartInstallation {
        release: String,
        source: ChartError,
        diagnosis: Vec<PodDiagnosis>,
    },

    #[error("Failed configuring ingress: {0:#}")]
    IngressConfiguration(anyhow::Error),

    #[error("Port {port} is already in use. Stop whatever is listening on it or pick another port with --port")]
    PortConflict { port: u16, details: String },

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("Timed out after {}s waiting for {what}", .waited.as_secs())]
    Timeout { what: String, waited: Duration },

    #[error("Operation cancelled")]
    Cancelled,
}

pub type LocalResult<T> = Result<T, LocalError>;

impl LocalError {
    pub fn cluster(err: impl Into<anyhow::Error>) -> Self {
        Self::ClusterCommunication(err.into())
    }
}

const PORT_CONFLICT_MARKERS: &[&str] = &[
    "port is already allocated",
    "address already in use",
    "ports are not available",
];

/// Recognizes the different ways docker, kind and helm report a busy port.
pub fn is_port_conflict(details: &str) -> bool {
    let details = details.to_lowercase();
    PORT_CONFLICT_MARKERS
        .iter()
        .any(|marker| details.contains(marker))
}

fn format_diagnosis(diagnosis: &[PodDiagnosis]) -> String {
    diagnosis
        .iter()
        .map(|pod| format!("\n  {pod}"))
        .collect()
}
