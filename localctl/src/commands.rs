use crate::config::{Command, Config, InstallArgs, NamespaceArgs};
use crate::docker::{ContainerRuntime, DockerCli};
use crate::error::{LocalError, LocalResult};
use crate::helm::values::{self, AuthCredentials, PlatformValuesOptions, AUTH_SECRET_NAME};
use crate::helm::{ChartApi, ChartError, HelmCli, ReleaseSpec};
use crate::images;
use crate::install::{InstallRequest, InstallSettings, Installer};
use crate::k8s::{ClusterApi, KindCluster, KubeCluster};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config: &Config, cancel: CancellationToken) -> LocalResult<()> {
    match &config.command {
        Command::Install(args) => install(config, args, cancel).await,
        Command::Uninstall(args) => uninstall(config, args).await,
        Command::Status(args) => status(config, args).await,
        Command::Credentials(args) => credentials(config, args).await,
    }
}

async fn connect(kind: &KindCluster) -> LocalResult<KubeCluster> {
    KubeCluster::connect(kind.kubeconfig(), &kind.context())
        .await
        .map_err(LocalError::cluster)
}

#[tracing::instrument(err, skip_all)]
async fn install(config: &Config, args: &InstallArgs, cancel: CancellationToken) -> LocalResult<()> {
    let request = args.request()?;
    let data_dir = config.data_dir()?;
    let settings = args.settings(data_dir.clone());
    let kind = config.kind_cluster(args.node_image.clone())?;

    tokio::fs::create_dir_all(&data_dir).await.map_err(|err| {
        LocalError::Config(format!("Failed creating {}: {err}", data_dir.display()))
    })?;

    if kind.exists().await? {
        info!("Using existing cluster {}", kind.name());
        if !args.volumes.is_empty() {
            warn!("--volume only applies when the cluster is created, ignoring it");
        }
    } else {
        kind.create(request.port, &data_dir, &args.volumes).await?;
    }

    let cluster = Arc::new(connect(&kind).await?);
    let charts = Arc::new(HelmCli::new(kind.kubeconfig(), &kind.context()));
    let runtime = Arc::new(DockerCli::new());

    if !args.no_preload {
        preload_images(charts.as_ref(), runtime.as_ref(), &kind, &settings, &request).await;
    }

    let http = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|err| LocalError::Config(format!("Failed building HTTP client: {err}")))?;

    Installer::new(cluster, charts, runtime, Arc::new(http), settings, cancel)
        .install(&request)
        .await
}

/// Best effort, the cluster pulls whatever is missing.
async fn preload_images(
    charts: &dyn ChartApi,
    runtime: &dyn ContainerRuntime,
    kind: &KindCluster,
    settings: &InstallSettings,
    request: &InstallRequest,
) {
    let source = &settings.platform;
    let spec = ReleaseSpec {
        name: source.release.clone(),
        namespace: request.namespace.clone(),
        chart: source.reference(),
        version: request.chart_version.clone(),
        values: values::platform_values(&PlatformValuesOptions {
            low_resource_mode: request.low_resource_mode,
            registry_secret: None,
        }),
        timeout: settings.chart_timeout,
    };
    let result = async {
        charts.add_repo(&source.repo_name, &source.repo_url).await?;
        images::chart_images(charts, &spec).await
    }
    .await;
    match result {
        Ok(found) => images::preload(runtime, kind, &found).await,
        Err(err) => warn!("Unable to list the platform images, skipping preload: {err}"),
    }
}

#[tracing::instrument(err, skip_all)]
async fn uninstall(config: &Config, args: &NamespaceArgs) -> LocalResult<()> {
    let kind = config.kind_cluster(None)?;
    if !kind.exists().await? {
        info!("Cluster {} does not exist, nothing to uninstall", kind.name());
        return Ok(());
    }

    let settings = InstallSettings::default();
    let charts = HelmCli::new(kind.kubeconfig(), &kind.context());
    for (namespace, release) in [
        (&args.namespace, &settings.platform.release),
        (&settings.ingress_namespace, &settings.ingress.release),
    ] {
        match charts.uninstall(namespace, release).await {
            Ok(()) => info!("Uninstalled {release}"),
            Err(ChartError::ReleaseNotFound(_)) => info!("{release} is not installed"),
            Err(err) => warn!("Failed uninstalling {release}, deleting the cluster anyway: {err}"),
        }
    }

    kind.delete().await?;
    info!(
        "Deleted cluster {}, data is kept in {}",
        kind.name(),
        config.data_dir()?.display()
    );
    Ok(())
}

#[tracing::instrument(err, skip_all)]
async fn status(config: &Config, args: &NamespaceArgs) -> LocalResult<()> {
    let kind = config.kind_cluster(None)?;
    if !kind.exists().await? {
        println!("Cluster {}: not found", kind.name());
        return Ok(());
    }
    println!("Cluster {}: running", kind.name());

    let settings = InstallSettings::default();
    let charts = HelmCli::new(kind.kubeconfig(), &kind.context());
    for (namespace, release) in [
        (&args.namespace, &settings.platform.release),
        (&settings.ingress_namespace, &settings.ingress.release),
    ] {
        match charts.get_release(namespace, release).await {
            Ok(Some(found)) => println!(
                "Release {release}: {} (chart {}, app {})",
                found.status, found.chart_version, found.app_version
            ),
            Ok(None) | Err(ChartError::ReleaseNotFound(_)) => {
                println!("Release {release}: not installed")
            }
            Err(err) => println!("Release {release}: unknown ({err})"),
        }
    }
    Ok(())
}

#[tracing::instrument(err, skip_all)]
async fn credentials(config: &Config, args: &NamespaceArgs) -> LocalResult<()> {
    let kind = config.kind_cluster(None)?;
    let cluster = connect(&kind).await?;
    let credentials = read_credentials(&cluster, &args.namespace).await?;
    println!("Email: {}", credentials.email);
    println!("Password: {}", credentials.password);
    println!("Client-Id: {}", credentials.client_id);
    println!("Client-Secret: {}", credentials.client_secret);
    Ok(())
}

async fn read_credentials(cluster: &dyn ClusterApi, namespace: &str) -> LocalResult<AuthCredentials> {
    let data = cluster
        .secret_get(namespace, AUTH_SECRET_NAME)
        .await
        .map_err(LocalError::cluster)?
        .ok_or_else(|| {
            LocalError::Config(format!(
                "Secret {AUTH_SECRET_NAME} not found in {namespace}, is the platform installed?"
            ))
        })?;
    AuthCredentials::from_secret_data(&data).ok_or_else(|| {
        LocalError::Config(format!("Secret {AUTH_SECRET_NAME} is missing credentials"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;

    #[tokio::test]
    async fn credentials_come_from_the_auth_secret() {
        let cluster = FakeCluster::default();
        assert!(matches!(
            read_credentials(&cluster, "platform").await,
            Err(LocalError::Config(_))
        ));

        let generated = AuthCredentials::generate("admin@example.com");
        cluster
            .secret_apply("platform", &generated.to_secret())
            .await
            .unwrap();
        assert_eq!(read_credentials(&cluster, "platform").await.unwrap(), generated);
    }
}
