mod cli;

use crate::utils::CommandError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use cli::DockerCli;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mount {
    Volume { name: String, target: String },
    Bind { source: PathBuf, target: String },
}

#[derive(Clone, Debug, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecStatus {
    pub running: bool,
    /// Set once the command has finished.
    pub exit_code: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub mountpoint: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("No such exec instance {0}")]
    NoSuchExec(String),

    #[error("Failed starting exec: {0}")]
    ExecSpawn(#[source] std::io::Error),
}

/// Container engine operations, modelled after the engine API.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Local images as `repository:tag`.
    async fn image_list(&self) -> Result<Vec<String>, RuntimeError>;
    async fn image_pull(&self, image: &str) -> Result<(), RuntimeError>;

    /// Returns the container id.
    async fn container_create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
    async fn container_start(&self, id: &str) -> Result<(), RuntimeError>;
    async fn container_stop(&self, id: &str) -> Result<(), RuntimeError>;
    async fn container_remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Copies the contents of directory `src` inside the container into the
    /// host directory `dest`.
    async fn copy_from_container(&self, id: &str, src: &str, dest: &Path)
        -> Result<(), RuntimeError>;

    /// Returns the exec id.
    async fn exec_create(&self, id: &str, cmd: &[String]) -> Result<String, RuntimeError>;
    /// Starts the exec detached; poll [`ContainerRuntime::exec_inspect`] for
    /// completion.
    async fn exec_start(&self, exec_id: &str) -> Result<(), RuntimeError>;
    async fn exec_inspect(&self, exec_id: &str) -> Result<ExecStatus, RuntimeError>;

    async fn volume_inspect(&self, name: &str) -> Result<Option<VolumeInfo>, RuntimeError>;
}
