pub mod api;
mod cluster;
pub mod events;
mod kind;
mod pods;

use maplit::btreemap;
use std::collections::BTreeMap;

pub use api::{ClaimSpec, ClusterApi, VolumeSpec};
pub use cluster::KubeCluster;
pub use events::EventMonitor;
pub use kind::{KindCluster, VolumeMount, NODE_DATA_ROOT};
pub use pods::{diagnose_failed_pods, PodDiagnosis};

pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";

lazy_static::lazy_static! {
    /// Labels put on every object created outside of a chart.
    pub static ref MANAGED_LABELS: BTreeMap<String, String> = btreemap! {
        MANAGED_BY_LABEL_KEY.to_owned() => "localctl".to_owned(),
    };
}
