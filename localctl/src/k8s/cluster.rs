use super::api::{
    ClaimSpec, ClusterApi, ClusterEvent, EventType, LogStream, PodSummary, VolumeSpec,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, Namespace, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeSpec, Pod, Secret, VolumeResourceRequirements,
};
use k8s_openapi::api::events::v1::Event;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, ListParams, LogParams, Patch, PatchParams, PostParams, WatchEvent, WatchParams,
};
use maplit::btreemap;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::debug;

const FIELD_MANAGER: &str = "localctl";
const STORAGE_CLASS: &str = "standard";

/// [`ClusterApi`] backed by a real API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    #[tracing::instrument(err, skip_all, fields(kubeconfig = %kubeconfig.display(), %context))]
    pub async fn connect(kubeconfig: &Path, context: &str) -> Result<Self> {
        let config = kube::config::Kubeconfig::read_from(kubeconfig)
            .with_context(|| format!("Failed reading kubeconfig {}", kubeconfig.display()))?;
        let options = kube::config::KubeConfigOptions {
            context: Some(context.to_owned()),
            ..Default::default()
        };
        let config = kube::Config::from_custom_kubeconfig(config, &options).await?;
        Ok(Self::new(kube::Client::try_from(config)?))
    }
}

fn is_status(err: &kube::Error, status: http::StatusCode) -> bool {
    matches!(err, kube::Error::Api(kube::core::ErrorResponse { code, .. }) if status == *code)
}

fn object_meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_owned()),
        namespace: namespace.map(ToOwned::to_owned),
        labels: Some(super::MANAGED_LABELS.to_owned()),
        ..Default::default()
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let api = Api::<Namespace>::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    #[tracing::instrument(err, skip(self))]
    async fn namespace_create(&self, name: &str) -> Result<()> {
        let api = Api::<Namespace>::all(self.client.clone());
        let namespace = Namespace {
            metadata: object_meta(name, None),
            ..Default::default()
        };
        match api.create(&PostParams::default(), &namespace).await {
            Ok(_) => Ok(()),
            Err(err) if is_status(&err, http::StatusCode::CONFLICT) => {
                debug!("namespace already exists");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        let api = Api::<PersistentVolume>::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    #[tracing::instrument(err, skip_all, fields(name = %spec.name))]
    async fn volume_create(&self, spec: &VolumeSpec) -> Result<()> {
        let api = Api::<PersistentVolume>::all(self.client.clone());
        let volume = PersistentVolume {
            metadata: object_meta(&spec.name, None),
            spec: Some(PersistentVolumeSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_owned()]),
                capacity: Some(btreemap! {
                    "storage".to_owned() => Quantity(spec.capacity.clone()),
                }),
                host_path: Some(HostPathVolumeSource {
                    path: spec.node_path.clone(),
                    type_: Some("DirectoryOrCreate".to_owned()),
                }),
                persistent_volume_reclaim_policy: Some("Retain".to_owned()),
                storage_class_name: Some(STORAGE_CLASS.to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        };
        api.create(&PostParams::default(), &volume).await?;
        Ok(())
    }

    async fn claim_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api = Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }

    #[tracing::instrument(err, skip_all, fields(name = %spec.name, namespace = %spec.namespace))]
    async fn claim_create(&self, spec: &ClaimSpec) -> Result<()> {
        let api = Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), &spec.namespace);
        let claim = PersistentVolumeClaim {
            metadata: object_meta(&spec.name, Some(&spec.namespace)),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_owned()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(btreemap! {
                        "storage".to_owned() => Quantity(spec.capacity.clone()),
                    }),
                    ..Default::default()
                }),
                storage_class_name: Some(STORAGE_CLASS.to_owned()),
                volume_name: Some(spec.volume_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        api.create(&PostParams::default(), &claim).await?;
        Ok(())
    }

    #[tracing::instrument(err, skip(self, secret), fields(name = ?secret.metadata.name))]
    async fn secret_apply(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let name = secret
            .metadata
            .name
            .as_deref()
            .context("Secret has no name")?;
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        debug!("applying...");
        api.patch(name, &params, &Patch::Apply(secret))
            .await
            .context("Failed applying secret")?;
        Ok(())
    }

    async fn secret_get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(|secret| {
            secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, String::from_utf8_lossy(&value.0).into_owned()))
                .collect()
        }))
    }

    #[tracing::instrument(err, skip(self, ingress), fields(name = ?ingress.metadata.name))]
    async fn ingress_apply(&self, namespace: &str, ingress: &Ingress) -> Result<()> {
        let name = ingress
            .metadata
            .name
            .as_deref()
            .context("Ingress has no name")?;
        let api = Api::<Ingress>::namespaced(self.client.clone(), namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(ingress)).await?;
        Ok(())
    }

    async fn pods_list(&self, namespace: &str) -> Result<Vec<PodSummary>> {
        let api = Api::<Pod>::namespaced(self.client.clone(), namespace);
        Ok(api
            .list(&ListParams::default())
            .await?
            .into_iter()
            .map(|pod| PodSummary {
                name: pod.metadata.name.unwrap_or_default(),
                phase: pod.status.and_then(|s| s.phase).unwrap_or_default(),
            })
            .collect())
    }

    async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<String> {
        let api = Api::<Pod>::namespaced(self.client.clone(), namespace);
        Ok(api.logs(pod, &LogParams::default()).await?)
    }

    async fn pod_logs_follow(&self, namespace: &str, pod: &str) -> Result<LogStream> {
        let params = LogParams {
            follow: true,
            ..Default::default()
        };
        let logs = Api::<Pod>::namespaced(self.client.clone(), namespace)
            .log_stream(pod, &params)
            .await?;
        Ok(Box::pin(tokio::io::BufReader::new(logs.compat())))
    }

    async fn watch_events(&self, namespace: &str) -> Result<BoxStream<'static, ClusterEvent>> {
        let events = Api::<Event>::namespaced(self.client.clone(), namespace)
            .watch(&WatchParams::default(), "0")
            .await?
            .filter_map(|result| async move {
                match result {
                    Ok(WatchEvent::Added(event)) | Ok(WatchEvent::Modified(event)) => {
                        Some(to_cluster_event(event))
                    }
                    Ok(WatchEvent::Deleted(_)) | Ok(WatchEvent::Bookmark(_)) => None,
                    Ok(WatchEvent::Error(err)) => {
                        debug!(?err, "event watch reported an error");
                        None
                    }
                    Err(err) => {
                        debug!(?err, "event watch stream error");
                        None
                    }
                }
            })
            .boxed();
        Ok(events)
    }
}

/// Kubelet events arrive through the events API without `eventTime`, so the
/// deprecated fields are consulted too. An event with no timestamp at all
/// sorts before any cutoff and is discarded as stale.
fn last_observed(event: &Event) -> DateTime<Utc> {
    event
        .series
        .as_ref()
        .map(|series| series.last_observed_time.0)
        .or_else(|| event.deprecated_last_timestamp.as_ref().map(|ts| ts.0))
        .or_else(|| event.event_time.as_ref().map(|ts| ts.0))
        .or_else(|| event.deprecated_first_timestamp.as_ref().map(|ts| ts.0))
        .or_else(|| event.metadata.creation_timestamp.as_ref().map(|ts| ts.0))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn to_cluster_event(event: Event) -> ClusterEvent {
    let last_timestamp = last_observed(&event);
    let count = event
        .series
        .as_ref()
        .map(|series| series.count)
        .or(event.deprecated_count)
        .unwrap_or(1);
    let regarding = event.regarding.unwrap_or_default();

    ClusterEvent {
        type_: event
            .type_
            .as_deref()
            .and_then(|t| EventType::from_str(t).ok())
            .unwrap_or(EventType::Normal),
        reason: event.reason.unwrap_or_default(),
        subject_kind: regarding.kind.unwrap_or_default(),
        subject_name: regarding.name.unwrap_or_default(),
        subject_namespace: regarding.namespace.unwrap_or_default(),
        note: event.note.unwrap_or_default(),
        count,
        last_timestamp,
    }
}
