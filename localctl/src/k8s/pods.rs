use super::api::ClusterApi;
use std::fmt;
use tracing::debug;

pub const UNKNOWN_CAUSE: &str = "unknown";

/// Root cause of one failed pod, as far as its logs tell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodDiagnosis {
    pub pod: String,
    pub root_cause: String,
}

impl PodDiagnosis {
    pub fn new(pod: &str, root_cause: &str) -> Self {
        Self {
            pod: pod.to_owned(),
            root_cause: root_cause.to_owned(),
        }
    }
}

impl fmt::Display for PodDiagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pod {}: {}", self.pod, self.root_cause)
    }
}

/// Looks for failed pods in `namespace` and pulls the last error out of each
/// one's logs. Never fails: anything that cannot be determined is reported
/// as unknown.
#[tracing::instrument(skip(cluster))]
pub async fn diagnose_failed_pods(cluster: &dyn ClusterApi, namespace: &str) -> Vec<PodDiagnosis> {
    let pods = match cluster.pods_list(namespace).await {
        Ok(pods) => pods,
        Err(err) => {
            debug!(?err, "unable to list pods");
            return vec![PodDiagnosis::new(UNKNOWN_CAUSE, UNKNOWN_CAUSE)];
        }
    };

    let mut diagnosis = Vec::new();
    for pod in pods.iter().filter(|pod| pod.is_failed()) {
        let root_cause = match cluster.pod_logs(namespace, &pod.name).await {
            Ok(logs) => pod_logs::last_error(logs.as_bytes()),
            Err(err) => {
                debug!(?err, pod = %pod.name, "unable to fetch logs");
                String::new()
            }
        };
        let root_cause = if root_cause.is_empty() {
            UNKNOWN_CAUSE
        } else {
            root_cause.as_str()
        };
        diagnosis.push(PodDiagnosis::new(&pod.name, root_cause));
    }
    diagnosis
}
