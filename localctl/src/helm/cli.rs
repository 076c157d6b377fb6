use super::{ChartApi, ChartError, ChartMetadata, ChartRelease, ReleaseSpec};
use crate::utils::{run_command, CommandError};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const HELM: &str = "helm";
const REPO_ADD_RETRIES: u32 = 3;
const REPO_ADD_BACKOFF: Duration = Duration::from_secs(1);

/// [`ChartApi`] driving the `helm` binary against one kube context.
#[derive(Clone, Debug)]
pub struct HelmCli {
    kubeconfig: PathBuf,
    context: String,
}

impl HelmCli {
    pub fn new(kubeconfig: &Path, context: &str) -> Self {
        Self {
            kubeconfig: kubeconfig.to_owned(),
            context: context.to_owned(),
        }
    }

    async fn helm(&self, args: &[&str], stdin: Option<&str>) -> Result<String, CommandError> {
        let kubeconfig = self.kubeconfig.to_string_lossy();
        let mut full_args = vec![
            "--kubeconfig",
            &*kubeconfig,
            "--kube-context",
            self.context.as_str(),
        ];
        full_args.extend_from_slice(args);
        run_command(HELM, full_args, stdin).await
    }
}

fn is_not_found(err: &CommandError) -> bool {
    err.stderr().contains("not found")
}

fn release_args<'a>(spec: &'a ReleaseSpec, timeout: &'a str) -> Vec<&'a str> {
    let mut args = vec![
        spec.name.as_str(),
        spec.chart.as_str(),
        "--namespace",
        spec.namespace.as_str(),
        "--values",
        "-",
        "--timeout",
        timeout,
    ];
    if let Some(version) = &spec.version {
        args.extend(["--version", version.as_str()]);
    }
    args
}

fn values_yaml(spec: &ReleaseSpec) -> Result<String, ChartError> {
    serde_yaml::to_string(&spec.values).map_err(|err| ChartError::Other(err.into()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartYaml {
    name: String,
    version: String,
    #[serde(default)]
    app_version: String,
}

#[derive(Deserialize)]
struct ReleaseJson {
    name: String,
    info: ReleaseInfoJson,
    chart: ReleaseChartJson,
}

#[derive(Deserialize)]
struct ReleaseInfoJson {
    status: String,
}

#[derive(Deserialize)]
struct ReleaseChartJson {
    metadata: ChartYaml,
}

fn parse_chart_metadata(output: &str) -> Result<ChartMetadata, ChartError> {
    let chart: ChartYaml =
        serde_yaml::from_str(output).map_err(|err| ChartError::Parse(err.to_string()))?;
    Ok(ChartMetadata {
        name: chart.name,
        version: chart.version,
        app_version: chart.app_version,
    })
}

fn parse_release(output: &str) -> Result<ChartRelease, ChartError> {
    let release: ReleaseJson =
        serde_json::from_str(output).map_err(|err| ChartError::Parse(err.to_string()))?;
    Ok(ChartRelease {
        name: release.name,
        status: release.info.status,
        chart_version: release.chart.metadata.version,
        app_version: release.chart.metadata.app_version,
    })
}

#[async_trait]
impl ChartApi for HelmCli {
    #[tracing::instrument(err, skip(self))]
    async fn add_repo(&self, name: &str, url: &str) -> Result<(), ChartError> {
        let args = ["repo", "add", name, url, "--force-update"];
        tryhard::retry_fn(|| self.helm(&args, None))
            .retries(REPO_ADD_RETRIES)
            .fixed_backoff(REPO_ADD_BACKOFF)
            .await?;
        self.helm(&["repo", "update", name], None).await?;
        Ok(())
    }

    #[tracing::instrument(err, skip(self))]
    async fn chart_metadata(
        &self,
        chart: &str,
        version: Option<&str>,
    ) -> Result<ChartMetadata, ChartError> {
        let mut args = vec!["show", "chart", chart];
        if let Some(version) = version {
            args.extend(["--version", version]);
        }
        parse_chart_metadata(&self.helm(&args, None).await?)
    }

    async fn get_release(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ChartRelease>, ChartError> {
        match self
            .helm(&["status", name, "--namespace", namespace, "--output", "json"], None)
            .await
        {
            Ok(output) => parse_release(&output).map(Some),
            Err(err) if is_not_found(&err) => Err(ChartError::ReleaseNotFound(name.to_owned())),
            Err(err) => Err(err.into()),
        }
    }

    #[tracing::instrument(err, skip_all, fields(name = %spec.name, chart = %spec.chart))]
    async fn install_or_upgrade(&self, spec: &ReleaseSpec) -> Result<ChartRelease, ChartError> {
        let timeout = format!("{}s", spec.timeout.as_secs());
        let mut args = vec!["upgrade", "--install", "--create-namespace", "--wait"];
        args.extend(release_args(spec, &timeout));
        args.extend(["--output", "json"]);
        let values = values_yaml(spec)?;
        debug!("values:\n{values}");
        parse_release(&self.helm(&args, Some(&values)).await?)
    }

    #[tracing::instrument(err, skip(self))]
    async fn uninstall(&self, namespace: &str, name: &str) -> Result<(), ChartError> {
        match self
            .helm(&["uninstall", name, "--namespace", namespace, "--wait"], None)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Err(ChartError::ReleaseNotFound(name.to_owned())),
            Err(err) => Err(err.into()),
        }
    }

    #[tracing::instrument(err, skip_all, fields(name = %spec.name, chart = %spec.chart))]
    async fn template(&self, spec: &ReleaseSpec) -> Result<String, ChartError> {
        let timeout = format!("{}s", spec.timeout.as_secs());
        let mut args = vec!["template"];
        args.extend(release_args(spec, &timeout));
        Ok(self.helm(&args, Some(&values_yaml(spec)?)).await?)
    }
}
