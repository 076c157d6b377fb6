pub mod ingress;
pub mod reachability;

use crate::docker::ContainerRuntime;
use crate::error::{is_port_conflict, LocalError, LocalResult};
use crate::helm::values::{
    self, AuthCredentials, PlatformValuesOptions, RegistryCredentials, AUTH_SECRET_NAME,
};
use crate::helm::{reconcile, ChartApi, ChartError, ChartMetadata, ReleaseSpec};
use crate::k8s::{
    diagnose_failed_pods, ClaimSpec, ClusterApi, EventMonitor, VolumeSpec, NODE_DATA_ROOT,
};
use crate::migrate::{MigrationSettings, Migrator};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

pub use reachability::{wait_for_reachable, HttpClient};

const VOLUME_CAPACITY: &str = "500Mi";
const HOST_DIR_MODE: u32 = 0o777;
/// Where the chart's database keeps its files inside the volume.
const PG_DATA_SUBDIR: &str = "pgdata";

/// A chart and the repository it comes from.
#[derive(Clone, Debug)]
pub struct ChartSource {
    pub release: String,
    pub repo_name: String,
    pub repo_url: String,
    pub chart_name: String,
}

impl ChartSource {
    /// The repository-qualified reference helm resolves.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.repo_name, self.chart_name)
    }
}

#[derive(Clone, Debug)]
pub struct InstallSettings {
    pub platform: ChartSource,
    pub ingress: ChartSource,
    pub ingress_namespace: String,
    /// Host directory mounted into the node at [`NODE_DATA_ROOT`].
    pub data_dir: PathBuf,
    pub chart_timeout: Duration,
    pub reachability_timeout: Duration,
    pub reachability_interval: Duration,
    pub admin_email: String,
    pub migration: MigrationSettings,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            platform: ChartSource {
                release: "platform".to_owned(),
                repo_name: "airbyte".to_owned(),
                repo_url: "https://airbytehq.github.io/helm-charts".to_owned(),
                chart_name: "airbyte".to_owned(),
            },
            ingress: ChartSource {
                release: "ingress-nginx".to_owned(),
                repo_name: "ingress-nginx".to_owned(),
                repo_url: "https://kubernetes.github.io/ingress-nginx".to_owned(),
                chart_name: "ingress-nginx".to_owned(),
            },
            ingress_namespace: "ingress-nginx".to_owned(),
            data_dir: PathBuf::from(".localctl/data"),
            chart_timeout: Duration::from_secs(30 * 60),
            reachability_timeout: Duration::from_secs(2 * 60),
            reachability_interval: Duration::from_secs(1),
            admin_email: "admin@example.com".to_owned(),
            migration: Default::default(),
        }
    }
}

impl InstallSettings {
    pub fn bootloader_pod(&self) -> String {
        format!(
            "{}-{}-bootloader",
            self.platform.release, self.platform.chart_name
        )
    }
}

/// Everything one `install` call was asked to do.
#[derive(Clone, Debug)]
pub struct InstallRequest {
    pub namespace: String,
    pub chart_version: Option<String>,
    /// `a.b.c=value` pairs, lowest priority.
    pub chart_values: Vec<String>,
    pub values_file: Option<PathBuf>,
    /// Secret manifests applied as they are.
    pub secret_files: Vec<PathBuf>,
    pub hosts: Vec<String>,
    pub port: u16,
    pub docker_registry: Option<RegistryCredentials>,
    pub low_resource_mode: bool,
    pub migrate: bool,
    pub open_browser: bool,
}

impl Default for InstallRequest {
    fn default() -> Self {
        Self {
            namespace: "platform".to_owned(),
            chart_version: None,
            chart_values: vec![],
            values_file: None,
            secret_files: vec![],
            hosts: vec![],
            port: 8000,
            docker_registry: None,
            low_resource_mode: false,
            migrate: false,
            open_browser: false,
        }
    }
}

/// A persistent volume, its host directory and the claim the chart's
/// statefulset will look for.
struct StorageVolume {
    name: String,
    host_dir: PathBuf,
    claim: String,
}

/// Drives one installation into an existing cluster.
pub struct Installer {
    cluster: Arc<dyn ClusterApi>,
    charts: Arc<dyn ChartApi>,
    runtime: Arc<dyn ContainerRuntime>,
    http: Arc<dyn HttpClient>,
    settings: InstallSettings,
    cancel: CancellationToken,
}

impl Installer {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        charts: Arc<dyn ChartApi>,
        runtime: Arc<dyn ContainerRuntime>,
        http: Arc<dyn HttpClient>,
        settings: InstallSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cluster,
            charts,
            runtime,
            http,
            settings,
            cancel,
        }
    }

    fn volumes(&self) -> [StorageVolume; 2] {
        let release = &self.settings.platform.release;
        let volume = |name: String, claim: String| StorageVolume {
            host_dir: self.settings.data_dir.join(&name),
            name,
            claim,
        };
        [
            volume(
                format!("{release}-local-pv"),
                format!("airbyte-minio-pv-claim-{release}-minio-0"),
            ),
            volume(
                format!("{release}-volume-db"),
                format!("airbyte-volume-db-{release}-db-0"),
            ),
        ]
    }

    #[tracing::instrument(err, skip_all, fields(namespace = %request.namespace))]
    pub async fn install(&self, request: &InstallRequest) -> LocalResult<()> {
        let monitor_cancel = self.cancel.child_token();
        let _monitor_guard = monitor_cancel.clone().drop_guard();
        let monitor = EventMonitor::new(
            self.cluster.clone(),
            &request.namespace,
            &self.settings.bootloader_pod(),
        );
        tokio::spawn(
            async move {
                let state = monitor.run(monitor_cancel).await;
                debug!(?state, "event monitor finished");
            }
            .in_current_span(),
        );

        self.ensure_namespace(&request.namespace).await?;

        let [storage, database] = self.volumes();
        for volume in [&storage, &database] {
            self.ensure_volume(volume).await?;
        }

        if request.migrate {
            info!("Migrating data from the previous deployment");
            Migrator::new(self.runtime.clone(), self.settings.migration.clone())
                .run(&database.host_dir.join(PG_DATA_SUBDIR))
                .await?;
        }

        for volume in [&storage, &database] {
            self.ensure_claim(&request.namespace, volume).await?;
        }

        let values = self.build_values(request).await?;

        for source in [&self.settings.platform, &self.settings.ingress] {
            self.charts
                .add_repo(&source.repo_name, &source.repo_url)
                .await
                .map_err(|source_err| LocalError::ChartInstallation {
                    release: source.release.clone(),
                    source: source_err,
                    diagnosis: vec![],
                })?;
        }

        self.install_platform(request, values).await?;
        self.install_ingress_controller(request.port).await?;
        self.apply_ingress(request).await?;

        let url = format!("http://localhost:{}", request.port);
        info!("Waiting for {url} to become reachable");
        wait_for_reachable(
            self.http.as_ref(),
            &url,
            self.settings.reachability_timeout,
            self.settings.reachability_interval,
            &self.cancel,
        )
        .await?;
        info!("Installed, {url} is up");

        if request.open_browser {
            if let Err(err) = webbrowser::open(&url) {
                warn!("Failed opening a browser, go to {url}: {err}");
            }
        }
        Ok(())
    }

    async fn ensure_namespace(&self, namespace: &str) -> LocalResult<()> {
        if self
            .cluster
            .namespace_exists(namespace)
            .await
            .map_err(LocalError::cluster)?
        {
            debug!(%namespace, "namespace exists");
            return Ok(());
        }
        info!("Creating namespace {namespace}");
        self.cluster
            .namespace_create(namespace)
            .await
            .map_err(LocalError::cluster)
    }

    async fn ensure_volume(&self, volume: &StorageVolume) -> LocalResult<()> {
        ensure_host_dir(&volume.host_dir).await?;
        if self
            .cluster
            .volume_exists(&volume.name)
            .await
            .map_err(LocalError::cluster)?
        {
            debug!(name = %volume.name, "volume exists");
            return Ok(());
        }
        info!("Creating volume {}", volume.name);
        let dir_name = volume
            .host_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| volume.name.clone());
        self.cluster
            .volume_create(&VolumeSpec {
                name: volume.name.clone(),
                node_path: format!("{NODE_DATA_ROOT}/{dir_name}"),
                capacity: VOLUME_CAPACITY.to_owned(),
            })
            .await
            .map_err(LocalError::cluster)
    }

    async fn ensure_claim(&self, namespace: &str, volume: &StorageVolume) -> LocalResult<()> {
        if self
            .cluster
            .claim_exists(namespace, &volume.claim)
            .await
            .map_err(LocalError::cluster)?
        {
            debug!(name = %volume.claim, "claim exists");
            return Ok(());
        }
        info!("Creating volume claim {}", volume.claim);
        self.cluster
            .claim_create(&ClaimSpec {
                name: volume.claim.clone(),
                namespace: namespace.to_owned(),
                volume_name: volume.name.clone(),
                capacity: VOLUME_CAPACITY.to_owned(),
            })
            .await
            .map_err(LocalError::cluster)
    }

    /// Applies the secrets the values refer to, then layers the values.
    async fn build_values(&self, request: &InstallRequest) -> LocalResult<serde_json::Value> {
        let namespace = &request.namespace;
        let pairs = values::parse_value_pairs(&request.chart_values)?;
        let file = match &request.values_file {
            Some(path) => Some(values::read_values_file(path).await?),
            None => None,
        };

        let existing = self
            .cluster
            .secret_get(namespace, AUTH_SECRET_NAME)
            .await
            .map_err(LocalError::cluster)?;
        let auth = match existing.as_ref().and_then(AuthCredentials::from_secret_data) {
            Some(auth) => {
                debug!("reusing existing credentials");
                auth
            }
            None => AuthCredentials::generate(&self.settings.admin_email),
        };
        self.cluster
            .secret_apply(namespace, &auth.to_secret())
            .await
            .map_err(LocalError::cluster)?;

        let mut options = PlatformValuesOptions {
            low_resource_mode: request.low_resource_mode,
            registry_secret: None,
        };
        if let Some(registry) = &request.docker_registry {
            let secret = registry.to_secret()?;
            options.registry_secret = secret.metadata.name.clone();
            self.cluster
                .secret_apply(namespace, &secret)
                .await
                .map_err(LocalError::cluster)?;
        }

        for path in &request.secret_files {
            let secret = values::read_secret_file(path).await?;
            info!("Applying secret from {}", path.display());
            self.cluster
                .secret_apply(namespace, &secret)
                .await
                .map_err(LocalError::cluster)?;
        }

        Ok(values::layer_values(
            pairs,
            file,
            values::platform_values(&options),
        ))
    }

    async fn resolve_chart(
        &self,
        source: &ChartSource,
        version: Option<&str>,
    ) -> LocalResult<ChartMetadata> {
        self.charts
            .chart_metadata(&source.reference(), version)
            .await
            .map_err(|err| LocalError::ChartInstallation {
                release: source.release.clone(),
                source: err,
                diagnosis: vec![],
            })
    }

    #[tracing::instrument(err, skip_all)]
    async fn install_platform(
        &self,
        request: &InstallRequest,
        values: serde_json::Value,
    ) -> LocalResult<()> {
        let source = &self.settings.platform;
        let chart = self
            .resolve_chart(source, request.chart_version.as_deref())
            .await?;
        info!("Installing {} chart version {}", source.release, chart.version);

        let spec = ReleaseSpec {
            name: source.release.clone(),
            namespace: request.namespace.clone(),
            chart: source.reference(),
            version: Some(chart.version),
            values,
            timeout: self.settings.chart_timeout,
        };
        match self.charts.install_or_upgrade(&spec).await {
            Ok(release) => {
                info!("Installed {} ({})", release.name, release.status);
                Ok(())
            }
            Err(err) => {
                warn!("Chart installation failed, looking for failed pods");
                let diagnosis = diagnose_failed_pods(self.cluster.as_ref(), &request.namespace)
                    .instrument(tracing::debug_span!("diagnosis"))
                    .await;
                Err(LocalError::ChartInstallation {
                    release: source.release.clone(),
                    source: err,
                    diagnosis,
                })
            }
        }
    }

    #[tracing::instrument(err, skip(self))]
    async fn install_ingress_controller(&self, port: u16) -> LocalResult<()> {
        let source = &self.settings.ingress;
        let namespace = &self.settings.ingress_namespace;
        let chart = self.resolve_chart(source, None).await?;

        let chart_err = |err: ChartError| LocalError::ChartInstallation {
            release: source.release.clone(),
            source: err,
            diagnosis: vec![],
        };
        reconcile(self.charts.as_ref(), namespace, &source.release, &chart)
            .await
            .map_err(chart_err)?;

        info!("Installing {} chart version {}", source.release, chart.version);
        let spec = ReleaseSpec {
            name: source.release.clone(),
            namespace: namespace.clone(),
            chart: source.reference(),
            version: Some(chart.version.clone()),
            values: values::ingress_values(),
            timeout: self.settings.chart_timeout,
        };
        match self.charts.install_or_upgrade(&spec).await {
            Ok(_) => Ok(()),
            Err(err) if is_port_conflict(&err.to_string()) => Err(LocalError::PortConflict {
                port,
                details: err.to_string(),
            }),
            Err(err) => Err(chart_err(err)),
        }
    }

    async fn apply_ingress(&self, request: &InstallRequest) -> LocalResult<()> {
        let platform = &self.settings.platform;
        let ingress = ingress::build_ingress(
            &format!("{}-ingress", platform.release),
            &request.namespace,
            &ingress::webapp_service(&platform.release, &platform.chart_name),
            &request.hosts,
        );
        self.cluster
            .ingress_apply(&request.namespace, &ingress)
            .await
            .map_err(LocalError::IngressConfiguration)
    }
}

/// The node runs the chart's containers as various users, so the
/// directories have to be writable by everyone.
async fn ensure_host_dir(path: &Path) -> LocalResult<()> {
    let io_err = |err: std::io::Error| {
        LocalError::Config(format!("Failed preparing {}: {err}", path.display()))
    };
    tokio::fs::create_dir_all(path).await.map_err(io_err)?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(HOST_DIR_MODE))
        .await
        .map_err(io_err)
}
