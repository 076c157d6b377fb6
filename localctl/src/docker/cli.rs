use super::{ContainerRuntime, ContainerSpec, ExecStatus, Mount, RuntimeError, VolumeInfo};
use crate::utils::{run_command, CommandError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

const DOCKER: &str = "docker";

struct ExecState {
    container: String,
    cmd: Vec<String>,
    child: Option<Child>,
    exit_code: Option<i64>,
}

/// [`ContainerRuntime`] driving the `docker` binary.
///
/// The CLI has no detached exec with a pollable status, so execs are run as
/// child `docker exec` processes and inspected through them.
#[derive(Default)]
pub struct DockerCli {
    execs: Mutex<HashMap<String, ExecState>>,
}

impl DockerCli {
    pub fn new() -> Self {
        Default::default()
    }
}

fn mount_arg(mount: &Mount) -> String {
    match mount {
        Mount::Volume { name, target } => format!("type=volume,source={name},target={target}"),
        Mount::Bind { source, target } => {
            format!("type=bind,source={},target={target}", source.display())
        }
    }
}

fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_owned(), "--name".to_owned(), spec.name.clone()];
    for mount in &spec.mounts {
        args.extend(["--mount".to_owned(), mount_arg(mount)]);
    }
    for (key, value) in &spec.env {
        args.extend(["--env".to_owned(), format!("{key}={value}")]);
    }
    args.push(spec.image.clone());
    args.extend(spec.cmd.iter().cloned());
    args
}

fn is_no_such_volume(err: &CommandError) -> bool {
    err.stderr().to_lowercase().contains("no such volume")
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn image_list(&self) -> Result<Vec<String>, RuntimeError> {
        let output = run_command(
            DOCKER,
            ["image", "ls", "--format", "{{.Repository}}:{{.Tag}}"],
            None,
        )
        .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    #[tracing::instrument(err, skip(self))]
    async fn image_pull(&self, image: &str) -> Result<(), RuntimeError> {
        run_command(DOCKER, ["pull", "--quiet", image], None).await?;
        Ok(())
    }

    #[tracing::instrument(err, skip_all, fields(name = %spec.name, image = %spec.image))]
    async fn container_create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let output = run_command(DOCKER, create_args(spec), None).await?;
        Ok(output.trim().to_owned())
    }

    async fn container_start(&self, id: &str) -> Result<(), RuntimeError> {
        run_command(DOCKER, ["start", id], None).await?;
        Ok(())
    }

    async fn container_stop(&self, id: &str) -> Result<(), RuntimeError> {
        run_command(DOCKER, ["stop", id], None).await?;
        Ok(())
    }

    async fn container_remove(&self, id: &str) -> Result<(), RuntimeError> {
        run_command(DOCKER, ["rm", "--force", "--volumes", id], None).await?;
        Ok(())
    }

    #[tracing::instrument(err, skip(self))]
    async fn copy_from_container(
        &self,
        id: &str,
        src: &str,
        dest: &Path,
    ) -> Result<(), RuntimeError> {
        // A trailing "/." copies the directory's contents, not the directory.
        let src = format!("{id}:{}/.", src.trim_end_matches('/'));
        let dest = dest.to_string_lossy();
        run_command(DOCKER, ["cp", src.as_str(), &*dest], None).await?;
        Ok(())
    }

    async fn exec_create(&self, id: &str, cmd: &[String]) -> Result<String, RuntimeError> {
        let exec_id = Uuid::new_v4().to_string();
        self.execs.lock().await.insert(
            exec_id.clone(),
            ExecState {
                container: id.to_owned(),
                cmd: cmd.to_vec(),
                child: None,
                exit_code: None,
            },
        );
        Ok(exec_id)
    }

    #[tracing::instrument(err, skip(self))]
    async fn exec_start(&self, exec_id: &str) -> Result<(), RuntimeError> {
        let mut execs = self.execs.lock().await;
        let exec = execs
            .get_mut(exec_id)
            .ok_or_else(|| RuntimeError::NoSuchExec(exec_id.to_owned()))?;
        debug!(container = %exec.container, cmd = ?exec.cmd, "starting exec");
        let child = Command::new(DOCKER)
            .arg("exec")
            .arg(&exec.container)
            .args(&exec.cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(RuntimeError::ExecSpawn)?;
        exec.child = Some(child);
        Ok(())
    }

    async fn exec_inspect(&self, exec_id: &str) -> Result<ExecStatus, RuntimeError> {
        let mut execs = self.execs.lock().await;
        let exec = execs
            .get_mut(exec_id)
            .ok_or_else(|| RuntimeError::NoSuchExec(exec_id.to_owned()))?;
        if exec.exit_code.is_none() {
            if let Some(child) = exec.child.as_mut() {
                if let Some(status) = child.try_wait().map_err(RuntimeError::ExecSpawn)? {
                    // Killed by a signal counts as a failure.
                    exec.exit_code = Some(status.code().map_or(-1, i64::from));
                }
            }
        }
        Ok(ExecStatus {
            running: exec.child.is_some() && exec.exit_code.is_none(),
            exit_code: exec.exit_code,
        })
    }

    async fn volume_inspect(&self, name: &str) -> Result<Option<VolumeInfo>, RuntimeError> {
        match run_command(
            DOCKER,
            ["volume", "inspect", "--format", "{{.Mountpoint}}", name],
            None,
        )
        .await
        {
            Ok(output) => Ok(Some(VolumeInfo {
                name: name.to_owned(),
                mountpoint: output.trim().to_owned(),
            })),
            Err(err) if is_no_such_volume(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
