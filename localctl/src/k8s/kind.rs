use crate::error::{is_port_conflict, LocalError, LocalResult};
use crate::utils::{run_command, CommandError};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

const KIND: &str = "kind";
/// Root of the local-path provisioner inside the node; the host data
/// directory is mounted here.
pub const NODE_DATA_ROOT: &str = "/var/local-path-provisioner";
const INGRESS_READY_PATCH: &str = "kind: InitConfiguration
nodeRegistration:
  kubeletExtraArgs:
    node-labels: \"ingress-ready=true\"
";

/// A host directory exposed inside the cluster node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
}

impl FromStr for VolumeMount {
    type Err = LocalError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| {
            LocalError::Config(format!(
                "Volume mount {spec:?} {reason}, expected HOST_PATH:CONTAINER_PATH"
            ))
        };
        let (host, container) = spec
            .rsplit_once(':')
            .ok_or_else(|| invalid("has no separator"))?;
        if host.is_empty() || container.is_empty() {
            return Err(invalid("has an empty side"));
        }
        if !container.starts_with('/') {
            return Err(invalid("has a relative container path"));
        }
        Ok(Self {
            host_path: PathBuf::from(host),
            container_path: container.to_owned(),
        })
    }
}

impl fmt::Display for VolumeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_path.display(), self.container_path)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KindConfig {
    kind: &'static str,
    api_version: &'static str,
    nodes: Vec<KindNode>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KindNode {
    role: &'static str,
    kubeadm_config_patches: Vec<&'static str>,
    extra_port_mappings: Vec<PortMapping>,
    extra_mounts: Vec<VolumeMount>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PortMapping {
    container_port: u16,
    host_port: u16,
    protocol: &'static str,
}

/// The single-node kind cluster everything is installed into.
#[derive(Clone, Debug)]
pub struct KindCluster {
    name: String,
    kubeconfig: PathBuf,
    node_image: Option<String>,
}

impl KindCluster {
    pub fn new(name: &str, kubeconfig: &Path, node_image: Option<String>) -> Self {
        Self {
            name: name.to_owned(),
            kubeconfig: kubeconfig.to_owned(),
            node_image,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    /// The context kind writes into the kubeconfig.
    pub fn context(&self) -> String {
        format!("kind-{}", self.name)
    }

    pub async fn exists(&self) -> LocalResult<bool> {
        let output = run_command(KIND, ["get", "clusters"], None)
            .await
            .map_err(LocalError::cluster)?;
        Ok(output.lines().any(|line| line.trim() == self.name))
    }

    #[tracing::instrument(err, skip_all, fields(name = %self.name, %port))]
    pub async fn create(
        &self,
        port: u16,
        data_dir: &Path,
        extra_mounts: &[VolumeMount],
    ) -> LocalResult<()> {
        let config = render_config(port, data_dir, extra_mounts)
            .map_err(|err| LocalError::Config(format!("Failed rendering kind config: {err}")))?;
        debug!("kind config:\n{config}");

        let kubeconfig = self.kubeconfig.to_string_lossy().into_owned();
        let mut args = vec![
            "create",
            "cluster",
            "--name",
            self.name.as_str(),
            "--kubeconfig",
            kubeconfig.as_str(),
            "--config",
            "-",
        ];
        if let Some(image) = &self.node_image {
            args.extend(["--image", image.as_str()]);
        }

        info!("Creating cluster {}", self.name);
        match run_command(KIND, &args, Some(&config)).await {
            Ok(_) => Ok(()),
            Err(err) if is_port_conflict(err.stderr()) => Err(LocalError::PortConflict {
                port,
                details: err.stderr().to_owned(),
            }),
            Err(err) => Err(LocalError::cluster(err)),
        }
    }

    #[tracing::instrument(err, skip_all, fields(name = %self.name))]
    pub async fn delete(&self) -> LocalResult<()> {
        let kubeconfig = self.kubeconfig.to_string_lossy().into_owned();
        run_command(
            KIND,
            [
                "delete",
                "cluster",
                "--name",
                self.name.as_str(),
                "--kubeconfig",
                kubeconfig.as_str(),
            ],
            None,
        )
        .await
        .map_err(LocalError::cluster)?;
        Ok(())
    }

    /// Copies locally available images into the node so the kubelet does
    /// not have to pull them.
    pub async fn load_images(&self, images: &[String]) -> Result<(), CommandError> {
        if images.is_empty() {
            return Ok(());
        }
        let mut args = vec!["load", "docker-image", "--name", self.name.as_str()];
        args.extend(images.iter().map(String::as_str));
        run_command(KIND, &args, None).await?;
        Ok(())
    }
}

fn render_config(
    port: u16,
    data_dir: &Path,
    extra_mounts: &[VolumeMount],
) -> Result<String, serde_yaml::Error> {
    let mut mounts = vec![VolumeMount {
        host_path: data_dir.to_owned(),
        container_path: NODE_DATA_ROOT.to_owned(),
    }];
    mounts.extend_from_slice(extra_mounts);

    serde_yaml::to_string(&KindConfig {
        kind: "Cluster",
        api_version: "kind.x-k8s.io/v1alpha4",
        nodes: vec![KindNode {
            role: "control-plane",
            kubeadm_config_patches: vec![INGRESS_READY_PATCH],
            extra_port_mappings: vec![PortMapping {
                container_port: 80,
                host_port: port,
                protocol: "TCP",
            }],
            extra_mounts: mounts,
        }],
    })
}
