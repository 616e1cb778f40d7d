//! Whole-project validation.
//!
//! [`ProjectChecker::run`] is what CI runs: it replays the migration history
//! on a scratch server and fails on anything that generate would not have
//! produced.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::dump::PgTools;
use crate::error::{MigrateResult, MigrationError};
use crate::file::MigrationFileManager;
use crate::history::DEFAULT_HISTORY_TABLE;
use crate::hooks::{CHECK_POST, CHECK_PRE, HookRunner};
use crate::lock::LockFile;
use crate::model::{ModelInfo, SchemaMaterializer};
use crate::pipeline::{DEFAULT_CHECK_PORT, TARGET_DATABASE, replay};
use crate::reconcile::PermissionReconciler;
use crate::shadow::{DatabaseProvisioner, EphemeralDatabase};
use crate::template::{self, TemplateFile};

/// Directory of test data files, relative to the project root.
pub const TESTDATA_DIR: &str = "testdata";

/// Settings of a [`ProjectChecker`].
#[derive(Debug, Clone)]
pub struct CheckConfig {
    /// Project root.
    pub project_dir: PathBuf,
    /// Declarative model file.
    pub model_path: PathBuf,
    /// Migrations directory.
    pub migrations_dir: PathBuf,
    /// Port for the scratch server.
    pub port: u16,
    /// Database name the model must declare.
    pub db_name: String,
    /// Configured roles.
    pub roles: Vec<String>,
    /// Templated files.
    pub templates: Vec<TemplateFile>,
    /// Compare the replayed history with the lock file.
    pub verify_lock: bool,
    /// Bookkeeping table name.
    pub bookkeeping_table: String,
    /// PostgreSQL client tools.
    pub pg_tools: PgTools,
}

impl CheckConfig {
    /// Defaults for the project at `project_dir`.
    pub fn new(
        project_dir: impl Into<PathBuf>,
        model_path: impl Into<PathBuf>,
        db_name: impl Into<String>,
    ) -> Self {
        let project_dir = project_dir.into();
        Self {
            migrations_dir: project_dir.join("migrations"),
            project_dir,
            model_path: model_path.into(),
            port: DEFAULT_CHECK_PORT,
            db_name: db_name.into(),
            roles: Vec::new(),
            templates: Vec::new(),
            verify_lock: true,
            bookkeeping_table: DEFAULT_HISTORY_TABLE.to_string(),
            pg_tools: PgTools::new(),
        }
    }

    /// Set the configured roles.
    pub fn roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    /// Set the templated files.
    pub fn templates(mut self, templates: Vec<TemplateFile>) -> Self {
        self.templates = templates;
        self
    }

    /// Enable or disable the lock comparison.
    pub fn verify_lock(mut self, verify: bool) -> Self {
        self.verify_lock = verify;
        self
    }

    /// Set the scratch server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Use specific PostgreSQL client tools.
    pub fn pg_tools(mut self, tools: PgTools) -> Self {
        self.pg_tools = tools;
        self
    }

    fn testdata_dir(&self) -> PathBuf {
        self.project_dir.join(TESTDATA_DIR)
    }
}

/// What a successful check covered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    /// Number of migration files replayed.
    pub migrations: usize,
    /// Number of templated files verified.
    pub templates: usize,
    /// Whether the lock file was compared.
    pub lock_verified: bool,
}

/// Validates a project against its model, templates and lock file.
pub struct ProjectChecker {
    config: CheckConfig,
    provisioner: Arc<dyn DatabaseProvisioner>,
    materializer: Arc<dyn SchemaMaterializer>,
}

impl ProjectChecker {
    /// Create a checker.
    pub fn new(
        config: CheckConfig,
        provisioner: Arc<dyn DatabaseProvisioner>,
        materializer: Arc<dyn SchemaMaterializer>,
    ) -> Self {
        Self {
            config,
            provisioner,
            materializer,
        }
    }

    /// Run every check, stopping at the first failure.
    pub async fn run(&self) -> MigrateResult<CheckReport> {
        self.run_until(std::future::pending()).await
    }

    /// Run every check, giving up with [`MigrationError::Interrupted`] once
    /// `shutdown` completes. The server is torn down either way.
    pub async fn run_until<F>(&self, shutdown: F) -> MigrateResult<CheckReport>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let db = self.provisioner.provision(self.config.port).await?;
        let result = tokio::select! {
            biased;
            _ = &mut shutdown => {
                warn!(port = db.port(), "Interrupted, stopping the ephemeral database");
                Err(MigrationError::Interrupted)
            }
            result = self.check_on(&db) => result,
        };
        if let Err(e) = db.teardown().await {
            warn!(error = %e, "Failed to tear down ephemeral database");
        }
        result
    }

    async fn check_on(&self, db: &EphemeralDatabase) -> MigrateResult<CheckReport> {
        let config = &self.config;
        db.create_roles(&config.roles).await?;

        let hooks = HookRunner::new(&config.project_dir).with_connection(db.admin());
        hooks.run(CHECK_PRE, &[]).await?;

        info!("Checking model");
        self.check_model().await?;

        info!("Checking migration file names");
        let files = MigrationFileManager::new(&config.migrations_dir)
            .verify_sequence()
            .await?;
        let version = files.last().map_or(0, |f| f.index);

        info!("Checking templates");
        template::check_all(&config.templates, &config.project_dir, version).await?;

        info!("Checking migrations and testdata");
        let testdata = config.testdata_dir();
        replay(
            db.admin(),
            &files,
            &config.bookkeeping_table,
            Some((testdata.as_path(), &config.pg_tools)),
        )
        .await?;

        let lock_verified = config.verify_lock && !files.is_empty();
        if lock_verified {
            info!("Checking lock file");
            self.check_lock(db).await?;
        }

        hooks.run(CHECK_POST, &[]).await?;

        Ok(CheckReport {
            migrations: files.len(),
            templates: config.templates.len(),
            lock_verified,
        })
    }

    /// pgModeler models also declare roles and the database; SQL models
    /// have nothing to compare.
    async fn check_model(&self) -> MigrateResult<()> {
        if !is_pgmodeler_model(&self.config.model_path) {
            return Ok(());
        }
        let xml = tokio::fs::read_to_string(&self.config.model_path)
            .await
            .map_err(|e| {
                MigrationError::invalid_model(format!(
                    "failed to read {}: {}",
                    self.config.model_path.display(),
                    e
                ))
            })?;
        ModelInfo::parse(&xml).validate(&self.config.db_name, &self.config.roles)
    }

    async fn check_lock(&self, db: &EphemeralDatabase) -> MigrateResult<()> {
        let sql = self
            .materializer
            .export_schema(&self.config.model_path)
            .await?;
        let target = db.create_database(TARGET_DATABASE).await?;
        let client = target.connect().await?;
        client.batch_execute(&sql).await.map_err(|e| {
            MigrationError::invalid_model(format!(
                "model SQL does not apply: {}",
                MigrationError::from(e)
            ))
        })?;
        drop(client);

        let reconciler = PermissionReconciler::new(self.config.pg_tools.clone())
            .with_bookkeeping_table(self.config.bookkeeping_table.clone());
        let diff = reconciler.dump_diff(db.admin(), &target).await?.render();
        LockFile::in_dir(&self.config.project_dir).verify(&diff).await
    }
}

/// Whether `path` is a pgModeler model.
pub fn is_pgmodeler_model(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "dbm")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SqlFileMaterializer;
    use tempfile::TempDir;

    struct Unavailable;

    #[async_trait::async_trait]
    impl DatabaseProvisioner for Unavailable {
        async fn provision(&self, port: u16) -> MigrateResult<EphemeralDatabase> {
            Err(MigrationError::resource(format!("port {} unavailable", port)))
        }

        fn name(&self) -> &'static str {
            "unavailable"
        }
    }

    #[test]
    fn test_is_pgmodeler_model() {
        assert!(is_pgmodeler_model(Path::new("app.dbm")));
        assert!(!is_pgmodeler_model(Path::new("app.sql")));
        assert!(!is_pgmodeler_model(Path::new("dbm")));
    }

    #[test]
    fn test_config_defaults() {
        let config = CheckConfig::new("/project", "/project/app.dbm", "app");
        assert_eq!(config.port, DEFAULT_CHECK_PORT);
        assert_eq!(config.migrations_dir, PathBuf::from("/project/migrations"));
        assert_eq!(config.testdata_dir(), PathBuf::from("/project/testdata"));
        assert!(config.verify_lock);
    }

    #[tokio::test]
    async fn test_model_roles_are_checked() {
        let dir = TempDir::new().unwrap();
        let model = dir.path().join("app.dbm");
        std::fs::write(
            &model,
            "<dbmodel>\n<role name=\"reader\" sql-disabled=\"true\">\n</role>\n<database name=\"app\">\n</database>\n</dbmodel>\n",
        )
        .unwrap();

        let checker = |roles: Vec<String>| {
            ProjectChecker::new(
                CheckConfig::new(dir.path(), &model, "app").roles(roles),
                Arc::new(Unavailable),
                Arc::new(SqlFileMaterializer),
            )
        };

        checker(vec!["reader".to_string()]).check_model().await.unwrap();
        let err = checker(vec!["writer".to_string()])
            .check_model()
            .await
            .unwrap_err();
        assert!(err.is_invalid_model());
        assert!(err.to_string().contains("writer"));
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let checker = ProjectChecker::new(
            CheckConfig::new(dir.path(), dir.path().join("app.sql"), "app"),
            Arc::new(Unavailable),
            Arc::new(SqlFileMaterializer),
        );
        let err = checker.run().await.unwrap_err();
        assert!(err.to_string().contains("port 5434 unavailable"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interrupted_check_tears_down_server() {
        use crate::shadow::testing::RecordingProvisioner;

        let dir = TempDir::new().unwrap();
        let provisioner = Arc::new(RecordingProvisioner::new(dir.path()));
        let checker = ProjectChecker::new(
            CheckConfig::new(dir.path(), dir.path().join("app.sql"), "app"),
            Arc::clone(&provisioner) as Arc<dyn DatabaseProvisioner>,
            Arc::new(SqlFileMaterializer),
        );
        let err = checker.run_until(std::future::ready(())).await.unwrap_err();
        assert!(matches!(err, MigrationError::Interrupted));
        assert_eq!(provisioner.stops(), vec!["kill recorded"]);
    }
}
