use crate::error::{LocalError, LocalResult};
use crate::helm::values::RegistryCredentials;
use crate::install::{InstallRequest, InstallSettings};
use crate::k8s::{KindCluster, VolumeMount};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;

const KUBECONFIG_FILE: &str = "localctl.kubeconfig";
const DATA_DIR: &str = "data";

#[derive(Debug, Parser)]
#[clap(name = "localctl", version, about = "Runs the platform on a local kind cluster")]
pub struct Config {
    /// Turn debug logs on
    #[clap(long, global = true)]
    debug: bool,

    /// Turn debug logs for all crates (not recommended)
    #[clap(long, global = true)]
    all_debug: bool,

    /// Name of the kind cluster
    #[clap(long, global = true, env = "LOCALCTL_CLUSTER_NAME", default_value = "localctl")]
    cluster_name: String,

    /// Where the kubeconfig and the data directory live [default: ~/.localctl]
    #[clap(long, global = true, env = "LOCALCTL_HOME")]
    home: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the cluster if needed and install the platform into it
    Install(InstallArgs),
    /// Remove the platform and delete the cluster, keeping the data directory
    Uninstall(NamespaceArgs),
    /// Show the cluster and release status
    Status(NamespaceArgs),
    /// Print the instance admin credentials
    Credentials(NamespaceArgs),
}

#[derive(Debug, Args)]
pub struct NamespaceArgs {
    #[clap(long, env = "LOCALCTL_NAMESPACE", default_value = "platform")]
    pub namespace: String,
}

#[derive(Debug, Args)]
pub struct InstallArgs {
    #[clap(flatten)]
    pub namespace: NamespaceArgs,

    /// Platform chart version [default: latest]
    #[clap(long, env = "LOCALCTL_CHART_VERSION")]
    pub chart_version: Option<String>,

    /// Chart value as KEY=VALUE, may be repeated. Overridden by --values
    #[clap(long = "chart-value")]
    pub chart_values: Vec<String>,

    /// Helm values file
    #[clap(long = "values", env = "LOCALCTL_VALUES")]
    pub values_file: Option<PathBuf>,

    /// Kubernetes secret manifest to apply before installing, may be repeated
    #[clap(long = "secret")]
    pub secret_files: Vec<PathBuf>,

    /// Host name the ingress answers to, may be repeated [default: any]
    #[clap(long = "host")]
    pub hosts: Vec<String>,

    /// Host port the ingress listens on
    #[clap(long, env = "LOCALCTL_PORT", default_value_t = 8000)]
    pub port: u16,

    #[clap(long, env = "LOCALCTL_DOCKER_SERVER")]
    pub docker_server: Option<String>,

    #[clap(long, env = "LOCALCTL_DOCKER_USERNAME")]
    pub docker_username: Option<String>,

    #[clap(long, env = "LOCALCTL_DOCKER_PASSWORD", hide_env_values = true)]
    pub docker_password: Option<String>,

    #[clap(long, env = "LOCALCTL_DOCKER_EMAIL")]
    pub docker_email: Option<String>,

    /// Drop resource requests so the platform fits on a small machine
    #[clap(long)]
    pub low_resource_mode: bool,

    /// Migrate the database of a previous docker compose deployment
    #[clap(long)]
    pub migrate: bool,

    /// Extra HOST_PATH:CONTAINER_PATH mount into the node, may be repeated.
    /// Only applies when the cluster is created
    #[clap(long = "volume")]
    pub volumes: Vec<VolumeMount>,

    /// kind node image
    #[clap(long, env = "LOCALCTL_NODE_IMAGE")]
    pub node_image: Option<String>,

    /// Do not pull the platform images ahead of the install
    #[clap(long)]
    pub no_preload: bool,

    /// Do not open a browser when done
    #[clap(long)]
    pub no_browser: bool,

    #[clap(long, env = "LOCALCTL_ADMIN_EMAIL", default_value = "admin@example.com")]
    pub admin_email: String,

    #[clap(long, env = "LOCALCTL_CHART_TIMEOUT", default_value = "30m")]
    pub chart_timeout: humantime::Duration,

    #[clap(long, env = "LOCALCTL_REACHABILITY_TIMEOUT", default_value = "2m")]
    pub reachability_timeout: humantime::Duration,
}

impl Config {
    pub fn log_level(&self) -> LevelFilter {
        match self.debug {
            true => LevelFilter::DEBUG,
            false => LevelFilter::INFO,
        }
    }

    pub fn all_log_level(&self) -> LevelFilter {
        match self.all_debug {
            true => LevelFilter::DEBUG,
            false => LevelFilter::WARN,
        }
    }

    pub fn home(&self) -> LocalResult<PathBuf> {
        match &self.home {
            Some(home) => Ok(home.clone()),
            None => dirs::home_dir()
                .map(|home| home.join(".localctl"))
                .ok_or_else(|| {
                    LocalError::Config("Unable to find the home directory, set --home".to_owned())
                }),
        }
    }

    pub fn data_dir(&self) -> LocalResult<PathBuf> {
        Ok(self.home()?.join(DATA_DIR))
    }

    pub fn kind_cluster(&self, node_image: Option<String>) -> LocalResult<KindCluster> {
        Ok(KindCluster::new(
            &self.cluster_name,
            &self.home()?.join(KUBECONFIG_FILE),
            node_image,
        ))
    }
}

impl InstallArgs {
    pub fn registry_credentials(&self) -> LocalResult<Option<RegistryCredentials>> {
        let Some(server) = &self.docker_server else {
            return Ok(None);
        };
        match (&self.docker_username, &self.docker_password) {
            (Some(username), Some(password)) => Ok(Some(RegistryCredentials {
                server: server.clone(),
                username: username.clone(),
                password: password.clone(),
                email: self.docker_email.clone(),
            })),
            _ => Err(LocalError::Config(
                "--docker-server requires --docker-username and --docker-password".to_owned(),
            )),
        }
    }

    pub fn request(&self) -> LocalResult<InstallRequest> {
        Ok(InstallRequest {
            namespace: self.namespace.namespace.clone(),
            chart_version: self.chart_version.clone(),
            chart_values: self.chart_values.clone(),
            values_file: self.values_file.clone(),
            secret_files: self.secret_files.clone(),
            hosts: self.hosts.clone(),
            port: self.port,
            docker_registry: self.registry_credentials()?,
            low_resource_mode: self.low_resource_mode,
            migrate: self.migrate,
            open_browser: !self.no_browser,
        })
    }

    pub fn settings(&self, data_dir: PathBuf) -> InstallSettings {
        InstallSettings {
            data_dir,
            chart_timeout: self.chart_timeout.into(),
            reachability_timeout: self.reachability_timeout.into(),
            admin_email: self.admin_email.clone(),
            ..Default::default()
        }
    }
}
