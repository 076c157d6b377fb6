use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::BTreeMap;
use std::pin::Pin;
use strum::{Display, EnumString};
use tokio::io::AsyncBufRead;

#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// A cluster lifecycle event, flattened from the events API.
#[derive(Clone, Debug)]
pub struct ClusterEvent {
    pub type_: EventType,
    pub reason: String,
    pub subject_kind: String,
    pub subject_name: String,
    pub subject_namespace: String,
    pub note: String,
    pub count: i32,
    pub last_timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodSummary {
    pub name: String,
    pub phase: String,
}

impl PodSummary {
    pub fn is_failed(&self) -> bool {
        self.phase == "Failed"
    }
}

#[derive(Clone, Debug)]
pub struct VolumeSpec {
    pub name: String,
    /// Path inside the cluster node.
    pub node_path: String,
    pub capacity: String,
}

#[derive(Clone, Debug)]
pub struct ClaimSpec {
    pub name: String,
    pub namespace: String,
    pub volume_name: String,
    pub capacity: String,
}

pub type LogStream = Pin<Box<dyn AsyncBufRead + Send>>;

/// The subset of the Kubernetes API the installer talks to.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn namespace_exists(&self, name: &str) -> Result<bool>;
    async fn namespace_create(&self, name: &str) -> Result<()>;

    async fn volume_exists(&self, name: &str) -> Result<bool>;
    async fn volume_create(&self, spec: &VolumeSpec) -> Result<()>;

    async fn claim_exists(&self, namespace: &str, name: &str) -> Result<bool>;
    async fn claim_create(&self, spec: &ClaimSpec) -> Result<()>;

    /// Create or update.
    async fn secret_apply(&self, namespace: &str, secret: &Secret) -> Result<()>;
    async fn secret_get(&self, namespace: &str, name: &str)
        -> Result<Option<BTreeMap<String, String>>>;

    /// Create or update.
    async fn ingress_apply(&self, namespace: &str, ingress: &Ingress) -> Result<()>;

    async fn pods_list(&self, namespace: &str) -> Result<Vec<PodSummary>>;
    async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<String>;
    async fn pod_logs_follow(&self, namespace: &str, pod: &str) -> Result<LogStream>;

    /// The stream ends when the server closes the watch.
    async fn watch_events(&self, namespace: &str) -> Result<BoxStream<'static, ClusterEvent>>;
}
