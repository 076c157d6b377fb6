//! In-memory stand-ins for the collaborator traits.

use crate::docker::{ContainerRuntime, ContainerSpec, ExecStatus, RuntimeError, VolumeInfo};
use crate::helm::{ChartApi, ChartError, ChartMetadata, ChartRelease, ReleaseSpec, STATUS_DEPLOYED};
use crate::install::HttpClient;
use crate::k8s::api::{ClaimSpec, ClusterApi, ClusterEvent, LogStream, PodSummary, VolumeSpec};
use crate::utils::CommandError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const DEFAULT_CHART_VERSION: &str = "1.0.0";

/// Calls shared between fakes, to check ordering across collaborators.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn record(&self, call: String) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

#[derive(Default)]
struct ClusterState {
    namespaces: BTreeSet<String>,
    volumes: BTreeSet<String>,
    claims: BTreeSet<(String, String)>,
    secrets: BTreeMap<(String, String), BTreeMap<String, String>>,
    ingresses: BTreeSet<(String, String)>,
    pods: Vec<PodSummary>,
    pod_logs: HashMap<String, String>,
    fail_pod_listing: bool,
    fail_ingress: bool,
    stall_pod_logs: bool,
    failing_follows: usize,
    follow_attempts: usize,
    events: Option<mpsc::UnboundedReceiver<ClusterEvent>>,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    log: CallLog,
}

impl FakeCluster {
    pub fn with_log(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn add_pod(&self, name: &str, phase: &str) {
        self.state.lock().unwrap().pods.push(PodSummary {
            name: name.to_owned(),
            phase: phase.to_owned(),
        });
    }

    pub fn set_pod_logs(&self, pod: &str, logs: &str) {
        self.state
            .lock()
            .unwrap()
            .pod_logs
            .insert(pod.to_owned(), logs.to_owned());
    }

    pub fn fail_pod_listing(&self) {
        self.state.lock().unwrap().fail_pod_listing = true;
    }

    pub fn fail_ingress(&self) {
        self.state.lock().unwrap().fail_ingress = true;
    }

    /// Point-in-time log fetches never complete.
    pub fn stall_pod_logs(&self) {
        self.state.lock().unwrap().stall_pod_logs = true;
    }

    /// The next `count` follow attempts fail.
    pub fn fail_log_follows(&self, count: usize) {
        self.state.lock().unwrap().failing_follows = count;
    }

    pub fn log_follow_attempts(&self) -> usize {
        self.state.lock().unwrap().follow_attempts
    }

    /// Events sent here come out of the next watch; dropping the sender ends
    /// it.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<ClusterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().events = Some(rx);
        tx
    }

    pub fn secret_data(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().namespaces.contains(name))
    }

    async fn namespace_create(&self, name: &str) -> Result<()> {
        self.log.record(format!("namespace_create {name}"));
        self.state.lock().unwrap().namespaces.insert(name.to_owned());
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().volumes.contains(name))
    }

    async fn volume_create(&self, spec: &VolumeSpec) -> Result<()> {
        self.log.record(format!("volume_create {}", spec.name));
        self.state.lock().unwrap().volumes.insert(spec.name.clone());
        Ok(())
    }

    async fn claim_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .claims
            .contains(&(namespace.to_owned(), name.to_owned())))
    }

    async fn claim_create(&self, spec: &ClaimSpec) -> Result<()> {
        self.log.record(format!("claim_create {}", spec.name));
        self.state
            .lock()
            .unwrap()
            .claims
            .insert((spec.namespace.clone(), spec.name.clone()));
        Ok(())
    }

    async fn secret_apply(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.log.record(format!("secret_apply {name}"));
        let mut data: BTreeMap<String, String> = secret
            .data
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, String::from_utf8_lossy(&value.0).into_owned()))
            .collect();
        data.extend(secret.string_data.clone().unwrap_or_default());
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert((namespace.to_owned(), name), data);
        Ok(())
    }

    async fn secret_get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.secret_data(namespace, name))
    }

    async fn ingress_apply(&self, namespace: &str, ingress: &Ingress) -> Result<()> {
        let name = ingress.metadata.name.clone().unwrap_or_default();
        self.log.record(format!("ingress_apply {name}"));
        let mut state = self.state.lock().unwrap();
        if state.fail_ingress {
            return Err(anyhow!(
                "admission webhook \"validate.nginx.ingress.kubernetes.io\" denied the request"
            ));
        }
        state.ingresses.insert((namespace.to_owned(), name));
        Ok(())
    }

    async fn pods_list(&self, _namespace: &str) -> Result<Vec<PodSummary>> {
        let state = self.state.lock().unwrap();
        if state.fail_pod_listing {
            return Err(anyhow!("the server is currently unable to handle the request"));
        }
        Ok(state.pods.clone())
    }

    async fn pod_logs(&self, _namespace: &str, pod: &str) -> Result<String> {
        let stalled = self.state.lock().unwrap().stall_pod_logs;
        if stalled {
            futures::future::pending::<()>().await;
        }
        self.state
            .lock()
            .unwrap()
            .pod_logs
            .get(pod)
            .cloned()
            .ok_or_else(|| anyhow!("pods \"{pod}\" not found"))
    }

    async fn pod_logs_follow(&self, _namespace: &str, pod: &str) -> Result<LogStream> {
        let mut state = self.state.lock().unwrap();
        state.follow_attempts += 1;
        if state.failing_follows > 0 {
            state.failing_follows -= 1;
            return Err(anyhow!("container \"{pod}\" is waiting to start"));
        }
        let logs = state
            .pod_logs
            .get(pod)
            .cloned()
            .ok_or_else(|| anyhow!("pods \"{pod}\" not found"))?;
        Ok(Box::pin(std::io::Cursor::new(logs.into_bytes())))
    }

    async fn watch_events(&self, _namespace: &str) -> Result<BoxStream<'static, ClusterEvent>> {
        Ok(match self.state.lock().unwrap().events.take() {
            Some(rx) => futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed(),
            None => futures::stream::empty().boxed(),
        })
    }
}

#[derive(Default)]
struct ChartsState {
    releases: HashMap<String, ChartRelease>,
    uninstalled: Vec<String>,
    install_failures: HashMap<String, ChartError>,
    installed_values: HashMap<String, serde_json::Value>,
    manifest: String,
}

#[derive(Default)]
pub struct FakeCharts {
    state: Mutex<ChartsState>,
    log: CallLog,
}

impl FakeCharts {
    pub fn with_log(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn set_release(&self, name: &str, release: ChartRelease) {
        self.state
            .lock()
            .unwrap()
            .releases
            .insert(name.to_owned(), release);
    }

    /// The next install of `name` fails with `err`.
    pub fn fail_install(&self, name: &str, err: ChartError) {
        self.state
            .lock()
            .unwrap()
            .install_failures
            .insert(name.to_owned(), err);
    }

    pub fn set_manifest(&self, manifest: &str) {
        self.state.lock().unwrap().manifest = manifest.to_owned();
    }

    pub fn uninstalled(&self) -> Vec<String> {
        self.state.lock().unwrap().uninstalled.clone()
    }

    pub fn installed_values(&self, name: &str) -> Option<serde_json::Value> {
        self.state
            .lock()
            .unwrap()
            .installed_values
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl ChartApi for FakeCharts {
    async fn add_repo(&self, name: &str, _url: &str) -> Result<(), ChartError> {
        self.log.record(format!("add_repo {name}"));
        Ok(())
    }

    async fn chart_metadata(
        &self,
        chart: &str,
        version: Option<&str>,
    ) -> Result<ChartMetadata, ChartError> {
        Ok(ChartMetadata {
            name: chart.rsplit('/').next().unwrap_or(chart).to_owned(),
            version: version.unwrap_or(DEFAULT_CHART_VERSION).to_owned(),
            app_version: DEFAULT_CHART_VERSION.to_owned(),
        })
    }

    async fn get_release(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<ChartRelease>, ChartError> {
        self.log.record(format!("get_release {name}"));
        match self.state.lock().unwrap().releases.get(name) {
            Some(release) => Ok(Some(release.clone())),
            None => Err(ChartError::ReleaseNotFound(name.to_owned())),
        }
    }

    async fn install_or_upgrade(&self, spec: &ReleaseSpec) -> Result<ChartRelease, ChartError> {
        self.log.record(format!("install_or_upgrade {}", spec.name));
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.install_failures.remove(&spec.name) {
            return Err(err);
        }
        let release = ChartRelease {
            name: spec.name.clone(),
            status: STATUS_DEPLOYED.to_owned(),
            chart_version: spec
                .version
                .clone()
                .unwrap_or_else(|| DEFAULT_CHART_VERSION.to_owned()),
            app_version: DEFAULT_CHART_VERSION.to_owned(),
        };
        state.releases.insert(spec.name.clone(), release.clone());
        state
            .installed_values
            .insert(spec.name.clone(), spec.values.clone());
        Ok(release)
    }

    async fn uninstall(&self, _namespace: &str, name: &str) -> Result<(), ChartError> {
        self.log.record(format!("uninstall {name}"));
        let mut state = self.state.lock().unwrap();
        match state.releases.remove(name) {
            Some(_) => {
                state.uninstalled.push(name.to_owned());
                Ok(())
            }
            None => Err(ChartError::ReleaseNotFound(name.to_owned())),
        }
    }

    async fn template(&self, spec: &ReleaseSpec) -> Result<String, ChartError> {
        self.log.record(format!("template {}", spec.name));
        Ok(self.state.lock().unwrap().manifest.clone())
    }
}

#[derive(Default)]
struct RuntimeState {
    volumes: BTreeSet<String>,
    images: BTreeSet<String>,
    failing_pulls: BTreeSet<String>,
    fail_starts: bool,
    containers: BTreeSet<String>,
    execs: HashMap<String, usize>,
    exec_running_polls: usize,
    exec_exit_code: i64,
    next_id: usize,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
    log: CallLog,
}

impl FakeRuntime {
    pub fn add_volume(&self, name: &str) {
        self.state.lock().unwrap().volumes.insert(name.to_owned());
    }

    pub fn add_image(&self, image: &str) {
        self.state.lock().unwrap().images.insert(image.to_owned());
    }

    pub fn fail_pull(&self, image: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_pulls
            .insert(image.to_owned());
    }

    pub fn fail_container_starts(&self) {
        self.state.lock().unwrap().fail_starts = true;
    }

    /// Execs report running for `running_polls` inspections, then exit with
    /// `exit_code`.
    pub fn set_exec_result(&self, running_polls: usize, exit_code: i64) {
        let mut state = self.state.lock().unwrap();
        state.exec_running_polls = running_polls;
        state.exec_exit_code = exit_code;
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.calls()
    }

    /// Containers created and not yet removed.
    pub fn containers(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .cloned()
            .collect()
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        format!("{prefix}-{}", state.next_id)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_list(&self) -> Result<Vec<String>, RuntimeError> {
        self.log.record("image_list".to_owned());
        Ok(self.state.lock().unwrap().images.iter().cloned().collect())
    }

    async fn image_pull(&self, image: &str) -> Result<(), RuntimeError> {
        self.log.record(format!("image_pull {image}"));
        let mut state = self.state.lock().unwrap();
        if state.failing_pulls.contains(image) {
            return Err(RuntimeError::Command(CommandError::Failed {
                command: format!("docker pull {image}"),
                code: Some(1),
                stderr: "manifest unknown".to_owned(),
            }));
        }
        state.images.insert(image.to_owned());
        Ok(())
    }

    async fn container_create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.log.record(format!("container_create {}", spec.name));
        let id = self.next_id("container");
        self.state.lock().unwrap().containers.insert(id.clone());
        Ok(id)
    }

    async fn container_start(&self, id: &str) -> Result<(), RuntimeError> {
        self.log.record(format!("container_start {id}"));
        if self.state.lock().unwrap().fail_starts {
            return Err(RuntimeError::Command(CommandError::Failed {
                command: format!("docker start {id}"),
                code: Some(1),
                stderr: "driver failed programming external connectivity".to_owned(),
            }));
        }
        Ok(())
    }

    async fn container_stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.log.record(format!("container_stop {id}"));
        Ok(())
    }

    async fn container_remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.log.record(format!("container_remove {id}"));
        self.state.lock().unwrap().containers.remove(id);
        Ok(())
    }

    async fn copy_from_container(
        &self,
        id: &str,
        src: &str,
        _dest: &Path,
    ) -> Result<(), RuntimeError> {
        self.log.record(format!("copy_from_container {id} {src}"));
        Ok(())
    }

    async fn exec_create(&self, id: &str, _cmd: &[String]) -> Result<String, RuntimeError> {
        self.log.record(format!("exec_create {id}"));
        let exec_id = self.next_id("exec");
        let mut state = self.state.lock().unwrap();
        let polls = state.exec_running_polls;
        state.execs.insert(exec_id.clone(), polls);
        Ok(exec_id)
    }

    async fn exec_start(&self, exec_id: &str) -> Result<(), RuntimeError> {
        self.log.record(format!("exec_start {exec_id}"));
        Ok(())
    }

    async fn exec_inspect(&self, exec_id: &str) -> Result<ExecStatus, RuntimeError> {
        self.log.record(format!("exec_inspect {exec_id}"));
        let mut state = self.state.lock().unwrap();
        let exit_code = state.exec_exit_code;
        let remaining = state
            .execs
            .get_mut(exec_id)
            .ok_or_else(|| RuntimeError::NoSuchExec(exec_id.to_owned()))?;
        if *remaining > 0 {
            *remaining -= 1;
            Ok(ExecStatus {
                running: true,
                exit_code: None,
            })
        } else {
            Ok(ExecStatus {
                running: false,
                exit_code: Some(exit_code),
            })
        }
    }

    async fn volume_inspect(&self, name: &str) -> Result<Option<VolumeInfo>, RuntimeError> {
        self.log.record(format!("volume_inspect {name}"));
        Ok(self
            .state
            .lock()
            .unwrap()
            .volumes
            .contains(name)
            .then(|| VolumeInfo {
                name: name.to_owned(),
                mountpoint: format!("/var/lib/docker/volumes/{name}/_data"),
            }))
    }
}

/// Answers with canned statuses, then 503 forever. `Err(())` stands for a
/// connection failure.
#[derive(Default)]
pub struct FakeHttp {
    statuses: Mutex<VecDeque<Result<u16, ()>>>,
    requests: Mutex<usize>,
    log: CallLog,
}

impl FakeHttp {
    pub fn with_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = Result<u16, ()>>,
    {
        Self {
            statuses: Mutex::new(statuses.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn requests(&self) -> usize {
        *self.requests.lock().unwrap()
    }
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn get_status(&self, url: &str) -> Result<u16> {
        self.log.record(format!("get_status {url}"));
        *self.requests.lock().unwrap() += 1;
        match self.statuses.lock().unwrap().pop_front() {
            Some(Ok(status)) => Ok(status),
            Some(Err(())) => Err(anyhow!("connection refused")),
            None => Ok(503),
        }
    }
}
