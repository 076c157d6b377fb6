use crate::docker::{ContainerRuntime, ContainerSpec, Mount};
use crate::utils::create_interval_stream;
use anyhow::{anyhow, bail, Context};
use futures::StreamExt;
use maplit::btreemap;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tracing::{debug, info, warn};

const PG_DATA: &str = "/var/lib/postgresql/data";
const DEST_DIR_MODE: u32 = 0o777;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum MigrationStep {
    #[strum(to_string = "verify source volume")]
    VerifySource,
    #[strum(to_string = "ensure helper images")]
    EnsureImages,
    #[strum(to_string = "start copy container")]
    StartCopyContainer,
    #[strum(to_string = "copy data")]
    CopyData,
    #[strum(to_string = "remove copy container")]
    RemoveCopyContainer,
    #[strum(to_string = "start database container")]
    StartDatabase,
    #[strum(to_string = "transform database")]
    Transform,
    #[strum(to_string = "wait for transform")]
    AwaitTransform,
    #[strum(to_string = "remove database container")]
    RemoveDatabase,
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Data migration failed at step \"{step}\": {source:#}")]
    Step {
        step: MigrationStep,
        source: anyhow::Error,
    },
}

impl MigrationError {
    #[cfg(test)]
    pub fn step(&self) -> MigrationStep {
        match self {
            Self::Step { step, .. } => *step,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbCredentials {
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Clone, Debug)]
pub struct MigrationSettings {
    pub source_volume: String,
    pub shell_image: String,
    pub db_image: String,
    /// What the legacy deployment created.
    pub legacy: DbCredentials,
    /// What the chart's database expects.
    pub target: DbCredentials,
    /// Only used to boot the transform container.
    pub bootstrap: DbCredentials,
    pub warm_up: Duration,
    pub poll_interval: Duration,
    pub step_timeout: Duration,
    pub transform_timeout: Duration,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            source_volume: "airbyte_db".to_owned(),
            shell_image: "busybox".to_owned(),
            db_image: "postgres:13-alpine".to_owned(),
            legacy: DbCredentials {
                user: "docker".to_owned(),
                password: "docker".to_owned(),
                database: "airbyte".to_owned(),
            },
            target: DbCredentials {
                user: "airbyte".to_owned(),
                password: "airbyte".to_owned(),
                database: "db-airbyte".to_owned(),
            },
            bootstrap: DbCredentials {
                user: "localctl".to_owned(),
                password: "localctl".to_owned(),
                database: "postgres".to_owned(),
            },
            warm_up: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            step_timeout: Duration::from_secs(300),
            transform_timeout: Duration::from_secs(60),
        }
    }
}

/// One migration run. Nothing is persisted, and a run that fails half way
/// leaves the destination as it was when it failed.
#[derive(Debug)]
pub struct MigrationJob {
    pub source_volume: String,
    pub dest_dir: PathBuf,
    pub copy_container: Option<String>,
    pub db_container: Option<String>,
}

/// Moves the database files of the legacy compose deployment into the
/// cluster's database volume, then renames the database and adds the role
/// the chart expects.
pub struct Migrator {
    runtime: Arc<dyn ContainerRuntime>,
    settings: MigrationSettings,
}

impl Migrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: MigrationSettings) -> Self {
        Self { runtime, settings }
    }

    async fn step<T, F>(
        &self,
        step: MigrationStep,
        timeout: Duration,
        fut: F,
    ) -> Result<T, MigrationError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        debug!(%step, "starting");
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(MigrationError::Step { step, source }),
            Err(_) => Err(MigrationError::Step {
                step,
                source: anyhow!(
                    "timed out after {}",
                    humantime::format_duration(timeout)
                ),
            }),
        }
    }

    #[tracing::instrument(err, skip(self), fields(source = %self.settings.source_volume))]
    pub async fn run(&self, dest_dir: &Path) -> Result<(), MigrationError> {
        let mut job = MigrationJob {
            source_volume: self.settings.source_volume.clone(),
            dest_dir: dest_dir.to_owned(),
            copy_container: None,
            db_container: None,
        };
        let timeout = self.settings.step_timeout;

        self.step(MigrationStep::VerifySource, timeout, async {
            match self.runtime.volume_inspect(&job.source_volume).await? {
                Some(volume) => {
                    debug!(mountpoint = %volume.mountpoint, "found source volume");
                    Ok(())
                }
                None => bail!("volume {} does not exist", job.source_volume),
            }
        })
        .await?;

        self.step(MigrationStep::EnsureImages, timeout, self.ensure_images())
            .await?;

        info!("Copying data out of volume {}", job.source_volume);
        job.copy_container = Some(
            self.step(MigrationStep::StartCopyContainer, timeout, async {
                Ok(self
                    .runtime
                    .container_create(&ContainerSpec {
                        name: format!("localctl-migrate-copy-{}", uuid::Uuid::new_v4()),
                        image: self.settings.shell_image.clone(),
                        cmd: vec!["sleep".to_owned(), "3600".to_owned()],
                        mounts: vec![Mount::Volume {
                            name: job.source_volume.clone(),
                            target: PG_DATA.to_owned(),
                        }],
                        ..Default::default()
                    })
                    .await?)
            })
            .await?,
        );

        let copied = match &job.copy_container {
            Some(id) => self.copy_data(id, &job.dest_dir).await,
            None => Ok(()),
        };
        if let Some(id) = job.copy_container.take() {
            self.remove_container(MigrationStep::RemoveCopyContainer, &id)
                .await;
        }
        copied?;

        info!("Transforming the database");
        job.db_container = Some(
            self.step(MigrationStep::StartDatabase, timeout, async {
                let bootstrap = &self.settings.bootstrap;
                Ok(self
                    .runtime
                    .container_create(&ContainerSpec {
                        name: format!("localctl-migrate-db-{}", uuid::Uuid::new_v4()),
                        image: self.settings.db_image.clone(),
                        env: btreemap! {
                            "POSTGRES_USER".to_owned() => bootstrap.user.clone(),
                            "POSTGRES_PASSWORD".to_owned() => bootstrap.password.clone(),
                            "POSTGRES_DB".to_owned() => bootstrap.database.clone(),
                        },
                        mounts: vec![Mount::Bind {
                            source: job.dest_dir.clone(),
                            target: PG_DATA.to_owned(),
                        }],
                        ..Default::default()
                    })
                    .await?)
            })
            .await?,
        );

        let result = match &job.db_container {
            Some(id) => self.transform(id).await,
            None => Ok(()),
        };
        if let Some(id) = job.db_container.take() {
            self.remove_container(MigrationStep::RemoveDatabase, &id)
                .await;
        }

        result?;
        info!("Migrated {} into {}", job.source_volume, job.dest_dir.display());
        Ok(())
    }

    /// Starts the copy container, then copies its data directory out.
    async fn copy_data(&self, container: &str, dest_dir: &Path) -> Result<(), MigrationError> {
        let timeout = self.settings.step_timeout;
        self.step(MigrationStep::StartCopyContainer, timeout, async {
            Ok(self.runtime.container_start(container).await?)
        })
        .await?;

        self.step(MigrationStep::CopyData, timeout, async {
            tokio::fs::create_dir_all(dest_dir)
                .await
                .with_context(|| format!("Failed creating {}", dest_dir.display()))?;
            tokio::fs::set_permissions(dest_dir, std::fs::Permissions::from_mode(DEST_DIR_MODE))
                .await
                .with_context(|| format!("Failed setting permissions on {}", dest_dir.display()))?;
            self.runtime
                .copy_from_container(container, PG_DATA, dest_dir)
                .await?;
            Ok(())
        })
        .await
    }

    async fn ensure_images(&self) -> anyhow::Result<()> {
        let present = self.runtime.image_list().await?;
        for image in [&self.settings.shell_image, &self.settings.db_image] {
            if is_present(&present, image) {
                debug!(%image, "image already present");
                continue;
            }
            info!("Pulling {image}");
            self.runtime
                .image_pull(image)
                .await
                .with_context(|| format!("Failed pulling {image}"))?;
        }
        Ok(())
    }

    /// Starts the database container and runs the rename in it.
    async fn transform(&self, container: &str) -> Result<(), MigrationError> {
        self.step(
            MigrationStep::StartDatabase,
            self.settings.step_timeout,
            async { Ok(self.runtime.container_start(container).await?) },
        )
        .await?;
        tokio::time::sleep(self.settings.warm_up).await;

        let exec_id = self
            .step(MigrationStep::Transform, self.settings.step_timeout, async {
                let cmd = transform_command(&self.settings.legacy, &self.settings.target);
                let exec_id = self.runtime.exec_create(container, &cmd).await?;
                self.runtime.exec_start(&exec_id).await?;
                Ok(exec_id)
            })
            .await?;

        self.step(
            MigrationStep::AwaitTransform,
            self.settings.transform_timeout,
            async {
                let mut ticker = create_interval_stream(self.settings.poll_interval);
                loop {
                    let status = self.runtime.exec_inspect(&exec_id).await?;
                    match status.exit_code {
                        Some(0) => return Ok(()),
                        Some(code) => bail!("transform exited with code {code}"),
                        None if !status.running => bail!("transform exec is not running"),
                        None => debug!("transform still running"),
                    }
                    ticker.next().await;
                }
            },
        )
        .await
    }

    async fn remove_container(&self, step: MigrationStep, id: &str) {
        let result = self
            .step(step, self.settings.step_timeout, async {
                if let Err(err) = self.runtime.container_stop(id).await {
                    debug!(?err, "stop failed, removing anyway");
                }
                self.runtime.container_remove(id).await?;
                Ok(())
            })
            .await;
        if let Err(err) = result {
            warn!("{err}");
        }
    }
}

/// Image references without a tag mean `latest`.
fn is_present(present: &[String], image: &str) -> bool {
    let wanted = if image.rsplit('/').next().is_some_and(|name| name.contains(':')) {
        image.to_owned()
    } else {
        format!("{image}:latest")
    };
    present.iter().any(|p| *p == wanted)
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn sql_identifier(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// One psql invocation connected to the maintenance database, since the
/// database being renamed cannot have connections.
fn transform_command(legacy: &DbCredentials, target: &DbCredentials) -> Vec<String> {
    vec![
        "psql".to_owned(),
        "--username".to_owned(),
        legacy.user.clone(),
        "--dbname".to_owned(),
        "postgres".to_owned(),
        "--set".to_owned(),
        "ON_ERROR_STOP=1".to_owned(),
        "--command".to_owned(),
        format!(
            "CREATE ROLE {} WITH SUPERUSER LOGIN PASSWORD {}",
            sql_identifier(&target.user),
            sql_literal(&target.password)
        ),
        "--command".to_owned(),
        format!(
            "ALTER DATABASE {} RENAME TO {}",
            sql_identifier(&legacy.database),
            sql_identifier(&target.database)
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRuntime;

    fn settings() -> MigrationSettings {
        MigrationSettings {
            warm_up: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            transform_timeout: Duration::from_secs(30),
            ..Default::default()
        }
    }

    #[test]
    fn image_presence_defaults_to_latest() {
        let present = vec!["busybox:latest".to_owned(), "postgres:13-alpine".to_owned()];
        assert!(is_present(&present, "busybox"));
        assert!(is_present(&present, "postgres:13-alpine"));
        assert!(!is_present(&present, "postgres"));
        assert!(!is_present(&present, "localhost:5000/busybox"));
    }

    #[test]
    fn transform_renames_database_and_adds_role() {
        let settings = MigrationSettings::default();
        let cmd = transform_command(&settings.legacy, &settings.target);
        assert_eq!(cmd[..3], ["psql", "--username", "docker"]);
        assert!(cmd.contains(
            &"CREATE ROLE \"airbyte\" WITH SUPERUSER LOGIN PASSWORD 'airbyte'".to_owned()
        ));
        assert!(cmd.contains(&"ALTER DATABASE \"airbyte\" RENAME TO \"db-airbyte\"".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn migrates_through_every_step() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.add_volume("airbyte_db");
        runtime.add_image("busybox:latest");
        runtime.set_exec_result(3, 0);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pgdata");

        Migrator::new(runtime.clone(), settings())
            .run(&dest)
            .await
            .unwrap();

        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
        let calls = runtime.calls();
        let ops: Vec<&str> = calls
            .iter()
            .map(|call| call.split_whitespace().next().unwrap())
            .filter(|op| *op != "exec_inspect")
            .collect();
        assert_eq!(
            ops,
            [
                "volume_inspect",
                "image_list",
                "image_pull",
                "container_create",
                "container_start",
                "copy_from_container",
                "container_stop",
                "container_remove",
                "container_create",
                "container_start",
                "exec_create",
                "exec_start",
                "container_stop",
                "container_remove",
            ]
        );
        assert!(calls.contains(&"image_pull postgres:13-alpine".to_owned()));
        assert!(runtime.containers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_volume_aborts_first() {
        let runtime = Arc::new(FakeRuntime::default());
        let dir = tempfile::tempdir().unwrap();

        let err = Migrator::new(runtime.clone(), settings())
            .run(&dir.path().join("pgdata"))
            .await
            .unwrap_err();
        assert_eq!(err.step(), MigrationStep::VerifySource);
        assert!(err.to_string().contains("airbyte_db does not exist"));
        assert_eq!(runtime.calls(), ["volume_inspect airbyte_db"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_transform_still_removes_database_container() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.add_volume("airbyte_db");
        runtime.set_exec_result(1, 2);
        let dir = tempfile::tempdir().unwrap();

        let err = Migrator::new(runtime.clone(), settings())
            .run(&dir.path().join("pgdata"))
            .await
            .unwrap_err();
        assert_eq!(err.step(), MigrationStep::AwaitTransform);
        assert!(err.to_string().contains("exited with code 2"));
        assert!(runtime.containers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn container_that_fails_to_start_is_removed() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.add_volume("airbyte_db");
        runtime.fail_container_starts();
        let dir = tempfile::tempdir().unwrap();

        let err = Migrator::new(runtime.clone(), settings())
            .run(&dir.path().join("pgdata"))
            .await
            .unwrap_err();
        assert_eq!(err.step(), MigrationStep::StartCopyContainer);
        assert!(err.to_string().contains("driver failed"));
        assert!(runtime.containers().is_empty());
        let calls = runtime.calls();
        assert!(calls.iter().any(|call| call.starts_with("container_remove")));
        assert!(!calls.iter().any(|call| call.starts_with("copy_from_container")));
    }

    #[tokio::test(start_paused = true)]
    async fn transform_that_never_finishes_times_out() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.add_volume("airbyte_db");
        runtime.set_exec_result(usize::MAX, 0);
        let dir = tempfile::tempdir().unwrap();

        let err = Migrator::new(runtime.clone(), settings())
            .run(&dir.path().join("pgdata"))
            .await
            .unwrap_err();
        assert_eq!(err.step(), MigrationStep::AwaitTransform);
        assert!(err.to_string().contains("timed out after 30s"));
        assert!(runtime.containers().is_empty());
    }
}
