//! Ephemeral PostgreSQL instances.
//!
//! Every generation cycle runs against a freshly started server that nothing
//! else touches. A [`DatabaseProvisioner`] starts one and returns an
//! [`EphemeralDatabase`] guard; the guard stops the server when
//! [`EphemeralDatabase::teardown`] is awaited, or from `Drop` if the cycle
//! unwinds first.
//!
//! # Example
//!
//! ```rust,ignore
//! use trek_migrate::shadow::{DatabaseProvisioner, LocalClusterProvisioner};
//!
//! let provisioner = LocalClusterProvisioner::new();
//! let db = provisioner.provision(5433).await?;
//! db.create_database("target").await?;
//! let target = db.connection_info("target");
//! // ...
//! db.teardown().await?;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionInfo, quote_identifier};
use crate::error::{MigrateResult, MigrationError};
use crate::process;

/// Number of connection attempts before a server is considered dead.
pub const READY_ATTEMPTS: u32 = 10;

/// Pause between connection attempts.
pub const READY_INTERVAL: Duration = Duration::from_secs(1);

/// Administrative database present on every server.
pub const ADMIN_DATABASE: &str = "postgres";

/// Starts disposable database servers.
#[async_trait::async_trait]
pub trait DatabaseProvisioner: Send + Sync {
    /// Start a server listening on `port` and wait until it accepts connections.
    async fn provision(&self, port: u16) -> MigrateResult<EphemeralDatabase>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// How a running instance is stopped.
#[derive(Debug)]
enum Instance {
    Local {
        pg_ctl: PathBuf,
        data_dir: PathBuf,
        // Removed after the server stops.
        work_dir: Option<TempDir>,
    },
    Docker {
        docker: PathBuf,
        container: String,
    },
}

impl Instance {
    fn stop_args(&self) -> (PathBuf, Vec<String>) {
        match self {
            Self::Local {
                pg_ctl, data_dir, ..
            } => (
                pg_ctl.clone(),
                vec![
                    "stop".to_string(),
                    "-D".to_string(),
                    data_dir.display().to_string(),
                    "-m".to_string(),
                    "immediate".to_string(),
                    "-w".to_string(),
                ],
            ),
            Self::Docker { docker, container } => {
                (docker.clone(), vec!["kill".to_string(), container.clone()])
            }
        }
    }

    async fn stop(&mut self) -> MigrateResult<()> {
        let (program, args) = self.stop_args();
        process::run(&mut process::command(&program, &args), &program)
            .await
            .map_err(|e| MigrationError::resource(format!("failed to stop instance: {}", e)))?;
        self.release_work_dir();
        Ok(())
    }

    fn stop_blocking(&mut self) -> MigrateResult<()> {
        let (program, args) = self.stop_args();
        let output = std::process::Command::new(&program)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .output()
            .map_err(|e| MigrationError::resource(format!("failed to stop instance: {}", e)))?;
        if !output.status.success() {
            return Err(MigrationError::resource(format!(
                "failed to stop instance: {}",
                process::failure(&program, &output)
            )));
        }
        self.release_work_dir();
        Ok(())
    }

    fn release_work_dir(&mut self) {
        if let Self::Local { work_dir, .. } = self {
            if let Some(dir) = work_dir.take() {
                if let Err(e) = dir.close() {
                    warn!(error = %e, "Failed to remove instance directory");
                }
            }
        }
    }
}

/// A running disposable server.
#[derive(Debug)]
pub struct EphemeralDatabase {
    admin: ConnectionInfo,
    instance: Option<Instance>,
}

impl EphemeralDatabase {
    /// Guard for a container that `docker` stops with `kill`.
    pub(crate) fn in_container(admin: ConnectionInfo, docker: PathBuf, container: String) -> Self {
        Self {
            admin,
            instance: Some(Instance::Docker { docker, container }),
        }
    }

    /// Connection to the administrative database.
    pub fn admin(&self) -> &ConnectionInfo {
        &self.admin
    }

    /// Port the server listens on.
    pub fn port(&self) -> u16 {
        self.admin.port
    }

    /// Connection parameters for a logical database on this server.
    pub fn connection_info(&self, database: &str) -> ConnectionInfo {
        self.admin.with_database(database)
    }

    /// Connection string for a logical database on this server.
    pub fn dsn(&self, database: &str) -> String {
        self.connection_info(database).dsn()
    }

    /// Create an empty logical database.
    pub async fn create_database(&self, name: &str) -> MigrateResult<ConnectionInfo> {
        let client = self.admin.connect().await?;
        client
            .batch_execute(&format!("CREATE DATABASE {}", quote_identifier(name)))
            .await
            .map_err(|e| MigrationError::resource(format!("failed to create database {}: {}", name, e)))?;
        debug!(database = %name, "Created database");
        Ok(self.connection_info(name))
    }

    /// Create login roles that do not exist yet.
    pub async fn create_roles(&self, roles: &[String]) -> MigrateResult<()> {
        if roles.is_empty() {
            return Ok(());
        }
        let client = self.admin.connect().await?;
        create_missing_roles(&client, roles).await
    }

    /// Factory for scratch databases on this server.
    pub fn scratch_factory(&self) -> ScratchDatabaseFactory {
        ScratchDatabaseFactory::new(self.admin.clone())
    }

    /// Stop the server and remove its files.
    pub async fn teardown(mut self) -> MigrateResult<()> {
        if let Some(mut instance) = self.instance.take() {
            instance.stop().await?;
            debug!(port = self.admin.port, "Stopped ephemeral database");
        }
        Ok(())
    }
}

impl Drop for EphemeralDatabase {
    fn drop(&mut self) {
        if let Some(mut instance) = self.instance.take() {
            warn!(
                port = self.admin.port,
                "Ephemeral database dropped without teardown, stopping it"
            );
            if let Err(e) = instance.stop_blocking() {
                warn!(error = %e, "Failed to stop ephemeral database");
            }
        }
    }
}

/// Create each role in `roles` with `LOGIN` unless it already exists.
pub async fn create_missing_roles(
    client: &tokio_postgres::Client,
    roles: &[String],
) -> MigrateResult<()> {
    for role in roles {
        let exists = client
            .query_opt("SELECT 1 FROM pg_roles WHERE rolname = $1", &[role])
            .await?
            .is_some();
        if exists {
            continue;
        }
        client
            .batch_execute(&format!("CREATE ROLE {} WITH LOGIN", quote_identifier(role)))
            .await?;
        debug!(role = %role, "Created role");
    }
    Ok(())
}

/// Poll until a connection succeeds.
pub async fn wait_until_ready(
    info: &ConnectionInfo,
    attempts: u32,
    interval: Duration,
) -> MigrateResult<()> {
    let mut last_error = None;
    for attempt in 1..=attempts {
        match info.connect().await {
            Ok(client) => match client.simple_query("SELECT 1").await {
                Ok(_) => return Ok(()),
                Err(e) => last_error = Some(e.to_string()),
            },
            Err(e) => last_error = Some(e.to_string()),
        }
        debug!(attempt, port = info.port, "Database not ready yet");
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(MigrationError::resource(format!(
        "database on port {} did not become ready: {}",
        info.port,
        last_error.unwrap_or_default()
    )))
}

/// Provisioner running a throwaway cluster with the local `initdb`/`pg_ctl`.
///
/// PostgreSQL refuses to run as root, so this needs an unprivileged user.
#[derive(Debug, Clone, Default)]
pub struct LocalClusterProvisioner {
    bin_dir: Option<PathBuf>,
}

impl LocalClusterProvisioner {
    /// Use binaries from `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use binaries from `bin_dir`.
    pub fn with_bin_dir(mut self, bin_dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(bin_dir.into());
        self
    }

    fn program(&self, name: &str) -> PathBuf {
        process::program_path(self.bin_dir.as_deref(), name)
    }

    async fn init_cluster(&self, data_dir: &Path) -> MigrateResult<()> {
        let initdb = self.program("initdb");
        let data = data_dir.display().to_string();
        process::run(
            &mut process::command(
                &initdb,
                [
                    "-D",
                    data.as_str(),
                    "-U",
                    "postgres",
                    "--auth=trust",
                    "-E",
                    "UTF8",
                    "--no-sync",
                ],
            ),
            &initdb,
        )
        .await
        .map_err(|e| MigrationError::resource(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DatabaseProvisioner for LocalClusterProvisioner {
    async fn provision(&self, port: u16) -> MigrateResult<EphemeralDatabase> {
        let work_dir = tempfile::Builder::new()
            .prefix("trek-postgres-")
            .tempdir()
            .map_err(|e| MigrationError::resource(format!("failed to create temp dir: {}", e)))?;
        let data_dir = work_dir.path().join("data");
        let socket_dir = work_dir.path().to_path_buf();
        let log_file = work_dir.path().join("postgres.log");

        self.init_cluster(&data_dir).await?;

        let pg_ctl = self.program("pg_ctl");
        let options = format!(
            "-p {} -k {} -c listen_addresses=127.0.0.1 -c fsync=off",
            port,
            socket_dir.display()
        );
        let data = data_dir.display().to_string();
        let log = log_file.display().to_string();
        process::run(
            &mut process::command(
                &pg_ctl,
                [
                    "start",
                    "-D",
                    data.as_str(),
                    "-o",
                    options.as_str(),
                    "-l",
                    log.as_str(),
                    "-w",
                ],
            ),
            &pg_ctl,
        )
        .await
        .map_err(|e| MigrationError::resource(e.to_string()))?;

        let db = EphemeralDatabase {
            admin: ConnectionInfo::local(port, ADMIN_DATABASE),
            instance: Some(Instance::Local {
                pg_ctl,
                data_dir,
                work_dir: Some(work_dir),
            }),
        };
        wait_until_ready(db.admin(), READY_ATTEMPTS, READY_INTERVAL).await?;
        info!(port, "Started local PostgreSQL cluster");
        Ok(db)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Provisioner running the official PostgreSQL image with Docker.
#[derive(Debug, Clone)]
pub struct DockerProvisioner {
    docker: PathBuf,
    image: String,
}

impl DockerProvisioner {
    /// Use `postgres:<version>`.
    pub fn new(version: &str) -> Self {
        Self {
            docker: PathBuf::from("docker"),
            image: format!("postgres:{}", version),
        }
    }

    /// Use a specific image reference.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Image that will be started.
    pub fn image(&self) -> &str {
        &self.image
    }

    fn run_args(&self, port: u16) -> Vec<String> {
        vec![
            "run".to_string(),
            "--rm".to_string(),
            "-d".to_string(),
            "-e".to_string(),
            "POSTGRES_PASSWORD=postgres".to_string(),
            "-p".to_string(),
            format!("127.0.0.1:{}:5432", port),
            self.image.clone(),
        ]
    }
}

#[async_trait::async_trait]
impl DatabaseProvisioner for DockerProvisioner {
    async fn provision(&self, port: u16) -> MigrateResult<EphemeralDatabase> {
        let stdout = process::run(
            &mut process::command(&self.docker, self.run_args(port)),
            &self.docker,
        )
        .await
        .map_err(|e| MigrationError::resource(e.to_string()))?;
        let container = stdout.trim().to_string();
        if container.is_empty() {
            return Err(MigrationError::resource("docker run printed no container id"));
        }

        let db = EphemeralDatabase::in_container(
            ConnectionInfo::local(port, ADMIN_DATABASE),
            self.docker.clone(),
            container,
        );
        wait_until_ready(db.admin(), READY_ATTEMPTS, READY_INTERVAL).await?;
        info!(port, image = %self.image, "Started PostgreSQL container");
        Ok(db)
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

/// Hands out uniquely named databases on an existing server.
#[derive(Debug, Clone)]
pub struct ScratchDatabaseFactory {
    admin: ConnectionInfo,
    prefix: String,
}

impl ScratchDatabaseFactory {
    /// Create a factory using the given administrative connection.
    pub fn new(admin: ConnectionInfo) -> Self {
        Self {
            admin,
            prefix: "trek_scratch_".to_string(),
        }
    }

    /// Set a custom prefix for database names.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Administrative connection.
    pub fn admin(&self) -> &ConnectionInfo {
        &self.admin
    }

    /// Generate a unique database name.
    pub fn generate_name(&self) -> String {
        format!("{}{}", self.prefix, uuid::Uuid::new_v4().simple())
    }

    /// Create a new empty database.
    pub async fn create(&self) -> MigrateResult<ConnectionInfo> {
        let name = self.generate_name();
        let client = self.admin.connect().await?;
        client
            .batch_execute(&format!("CREATE DATABASE {}", quote_identifier(&name)))
            .await
            .map_err(|e| MigrationError::diff(format!("failed to create scratch database: {}", e)))?;
        debug!(database = %name, "Created scratch database");
        Ok(self.admin.with_database(name))
    }

    /// Drop a database created by [`ScratchDatabaseFactory::create`].
    pub async fn drop_database(&self, info: &ConnectionInfo) -> MigrateResult<()> {
        let client = self.admin.connect().await?;
        client
            .batch_execute(&format!(
                "DROP DATABASE IF EXISTS {} WITH (FORCE)",
                quote_identifier(&info.database)
            ))
            .await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_names_are_unique() {
        let factory = ScratchDatabaseFactory::new(ConnectionInfo::local(5433, ADMIN_DATABASE));
        let a = factory.generate_name();
        let b = factory.generate_name();
        assert!(a.starts_with("trek_scratch_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_scratch_prefix() {
        let factory = ScratchDatabaseFactory::new(ConnectionInfo::local(5433, ADMIN_DATABASE))
            .with_prefix("validate_");
        assert!(factory.generate_name().starts_with("validate_"));
    }

    #[test]
    fn test_docker_run_args() {
        let provisioner = DockerProvisioner::new("18");
        let args = provisioner.run_args(5433);
        assert_eq!(provisioner.image(), "postgres:18");
        assert!(args.contains(&"127.0.0.1:5433:5432".to_string()));
        assert!(args.contains(&"POSTGRES_PASSWORD=postgres".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("postgres:18"));
    }

    #[test]
    fn test_connection_info_scoped_to_database() {
        let db = EphemeralDatabase {
            admin: ConnectionInfo::local(5433, ADMIN_DATABASE),
            instance: None,
        };
        assert_eq!(db.connection_info("target").database, "target");
        assert!(db.dsn("migrate").contains("/migrate?"));
        assert_eq!(db.port(), 5433);
    }

    #[test]
    fn test_local_stop_uses_immediate_mode() {
        let instance = Instance::Local {
            pg_ctl: PathBuf::from("pg_ctl"),
            data_dir: PathBuf::from("/tmp/data"),
            work_dir: None,
        };
        let (program, args) = instance.stop_args();
        assert_eq!(program, PathBuf::from("pg_ctl"));
        assert!(args.windows(2).any(|w| w == ["-m", "immediate"]));
    }

    #[tokio::test]
    async fn test_wait_until_ready_gives_up() {
        // Nothing listens on port 1.
        let info = ConnectionInfo::local(1, ADMIN_DATABASE);
        let err = wait_until_ready(&info, 2, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Resource(_)));
    }

    #[test]
    fn test_drop_with_failing_stop_does_not_panic() {
        let db = EphemeralDatabase {
            admin: ConnectionInfo::local(5433, ADMIN_DATABASE),
            instance: Some(Instance::Docker {
                docker: PathBuf::from("trek-definitely-not-docker"),
                container: "abc".to_string(),
            }),
        };
        drop(db);
    }
}
