//! The generation pipeline.
//!
//! One cycle of [`Generator::run_cycle`]:
//!
//! 1. read the model and stop if it did not change since the last cycle
//! 2. export the model to SQL (renderings are exported in the background)
//! 3. start an ephemeral server with a `migrate` and a `target` database
//! 4. apply the model SQL to `target` and replay the migration history,
//!    minus the slot being generated, into `migrate`
//! 5. diff `migrate` against `target` and recover missing permissions
//! 6. write the migration file, render templates, run the post hook and
//!    reconcile the lock file
//!
//! The server is stopped at the end of every cycle, including failed and
//! interrupted ones. [`Generator::watch`] repeats cycles until a shutdown
//! signal arrives.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::connection::ConnectionInfo;
use crate::diff::SchemaDiffer;
use crate::dump::PgTools;
use crate::engine::{ApplyOutcome, MigrationEngine};
use crate::error::{MigrateResult, MigrationError};
use crate::file::{MigrationFile, MigrationFileManager, testdata_files};
use crate::history::{DEFAULT_HISTORY_TABLE, PostgresHistory};
use crate::hooks::{GENERATE_MIGRATION_POST, HookRunner};
use crate::lock::{ChangeDetector, LockFile};
use crate::model::{RenderFormat, SchemaMaterializer};
use crate::reconcile::PermissionReconciler;
use crate::shadow::{DatabaseProvisioner, EphemeralDatabase};
use crate::template::{self, TemplateFile};

/// Port of the ephemeral server used by `generate`.
pub const DEFAULT_GENERATE_PORT: u16 = 5433;

/// Port of the ephemeral server used by `check`.
pub const DEFAULT_CHECK_PORT: u16 = 5434;

/// Polling interval of watch mode.
pub const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Database receiving the migration history.
pub const MIGRATE_DATABASE: &str = "migrate";

/// Database receiving the model SQL.
pub const TARGET_DATABASE: &str = "target";

/// Database receiving the full history when computing the lock diff.
pub const REPLAY_DATABASE: &str = "replay";

/// Where a generated migration goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Write to an allocated migration slot.
    File {
        /// Migration file path.
        path: PathBuf,
        /// Migration index.
        index: u32,
    },
    /// Print instead of writing a file.
    Stdout,
}

impl OutputTarget {
    /// Path of the generated file, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File { path, .. } => Some(path),
            Self::Stdout => None,
        }
    }
}

/// Result of one generation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The model did not change since the previous cycle.
    Unchanged,
    /// The migrations already describe the model.
    NoChanges {
        /// Stale file from an earlier iteration that was removed.
        removed: Option<PathBuf>,
    },
    /// A migration file was written.
    Written {
        /// File path.
        path: PathBuf,
        /// Migration index.
        index: u32,
        /// Whether the lock file changed, `None` when validation is off.
        lock_updated: Option<bool>,
    },
    /// The migration was generated for printing.
    Printed(String),
}

impl CycleOutcome {
    /// One-line description.
    pub fn summary(&self) -> String {
        match self {
            Self::Unchanged => "Model unchanged".to_string(),
            Self::NoChanges { removed: None } => "No schema changes".to_string(),
            Self::NoChanges {
                removed: Some(path),
            } => format!("No schema changes, removed {}", path.display()),
            Self::Written { path, .. } => format!("Wrote {}", path.display()),
            Self::Printed(_) => "Generated migration".to_string(),
        }
    }
}

/// Files exported next to the model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportPaths {
    /// Copy of the exported SQL.
    pub sql: Option<PathBuf>,
    /// PNG rendering.
    pub png: Option<PathBuf>,
    /// SVG rendering.
    pub svg: Option<PathBuf>,
}

/// Settings of a [`Generator`].
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Project root; hooks, templates and the lock file live here.
    pub project_dir: PathBuf,
    /// Declarative model file.
    pub model_path: PathBuf,
    /// Migrations directory.
    pub migrations_dir: PathBuf,
    /// Port for the ephemeral server.
    pub port: u16,
    /// Roles created on every ephemeral server.
    pub roles: Vec<String>,
    /// Files rendered with the new version.
    pub templates: Vec<TemplateFile>,
    /// Exported artifacts.
    pub exports: ExportPaths,
    /// Reconcile the lock file after writing.
    pub validate: bool,
    /// Bookkeeping table name.
    pub bookkeeping_table: String,
    /// PostgreSQL client tools.
    pub pg_tools: PgTools,
}

impl GeneratorConfig {
    /// Defaults for the project at `project_dir` with the given model.
    pub fn new(project_dir: impl Into<PathBuf>, model_path: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        Self {
            migrations_dir: project_dir.join("migrations"),
            project_dir,
            model_path: model_path.into(),
            port: DEFAULT_GENERATE_PORT,
            roles: Vec::new(),
            templates: Vec::new(),
            exports: ExportPaths::default(),
            validate: true,
            bookkeeping_table: DEFAULT_HISTORY_TABLE.to_string(),
            pg_tools: PgTools::new(),
        }
    }

    /// Set the ephemeral server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the roles to create.
    pub fn roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    /// Set the templated files.
    pub fn templates(mut self, templates: Vec<TemplateFile>) -> Self {
        self.templates = templates;
        self
    }

    /// Set the exported artifacts.
    pub fn exports(mut self, exports: ExportPaths) -> Self {
        self.exports = exports;
        self
    }

    /// Enable or disable lock reconciliation.
    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Use specific PostgreSQL client tools.
    pub fn pg_tools(mut self, tools: PgTools) -> Self {
        self.pg_tools = tools;
        self
    }
}

/// Replay `files` into the database behind `info`.
///
/// With `testdata`, migrations are applied one at a time and matching test
/// data files are loaded with `psql` after each step.
pub async fn replay(
    info: &ConnectionInfo,
    files: &[MigrationFile],
    bookkeeping_table: &str,
    testdata: Option<(&Path, &PgTools)>,
) -> MigrateResult<ApplyOutcome> {
    let client = info.connect().await?;
    let engine = MigrationEngine::new(PostgresHistory::with_table(client, bookkeeping_table));

    let Some((testdata_dir, tools)) = testdata else {
        return engine.apply_all(files).await;
    };

    let start_version = engine.current_version().await?;
    let mut applied = 0;
    let mut duration_ms = 0;
    loop {
        match engine.apply_next(files).await? {
            ApplyOutcome::NoChange { version } if applied == 0 => {
                return Ok(ApplyOutcome::NoChange { version });
            }
            ApplyOutcome::NoChange { version } => {
                return Ok(ApplyOutcome::Applied {
                    count: applied,
                    version,
                    duration_ms,
                });
            }
            ApplyOutcome::Applied {
                version,
                duration_ms: step,
                ..
            } => {
                applied += 1;
                duration_ms += step;
                for file in testdata_files(testdata_dir, version).await? {
                    info!(file = %file.display(), "Loading test data");
                    tools.psql_file(info, &file).await?;
                }
                debug!(from = start_version, to = version, "Replayed migration");
            }
        }
    }
}

/// Orchestrates generation cycles.
pub struct Generator {
    config: GeneratorConfig,
    provisioner: Arc<dyn DatabaseProvisioner>,
    materializer: Arc<dyn SchemaMaterializer>,
    differ: Arc<dyn SchemaDiffer>,
    reconciler: PermissionReconciler,
    detector: ChangeDetector,
    hooks: HookRunner,
    lock: LockFile,
}

impl Generator {
    /// Create a generator.
    pub fn new(
        config: GeneratorConfig,
        provisioner: Arc<dyn DatabaseProvisioner>,
        materializer: Arc<dyn SchemaMaterializer>,
        differ: Arc<dyn SchemaDiffer>,
    ) -> Self {
        let reconciler = PermissionReconciler::new(config.pg_tools.clone())
            .with_bookkeeping_table(config.bookkeeping_table.clone());
        let hooks = HookRunner::new(&config.project_dir);
        let lock = LockFile::in_dir(&config.project_dir);
        Self {
            config,
            provisioner,
            materializer,
            differ,
            reconciler,
            detector: ChangeDetector::new(),
            hooks,
            lock,
        }
    }

    /// Active settings.
    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Lock file reconciled after each written migration.
    pub fn lock_file(&self) -> &LockFile {
        &self.lock
    }

    /// Run one generation cycle.
    pub async fn run_cycle(&mut self, target: &OutputTarget) -> MigrateResult<CycleOutcome> {
        self.run_cycle_until(target, std::future::pending()).await
    }

    /// Run one generation cycle, abandoning it once `shutdown` completes.
    ///
    /// Provisioning runs to completion so that a starting server is always
    /// known. Everything after it is raced against `shutdown`, and the server
    /// is torn down before [`MigrationError::Interrupted`] is returned.
    pub async fn run_cycle_until<F>(
        &mut self,
        target: &OutputTarget,
        shutdown: F,
    ) -> MigrateResult<CycleOutcome>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let model = &self.config.model_path;
        let content = tokio::fs::read_to_string(model).await.map_err(|e| {
            MigrationError::invalid_model(format!("failed to read {}: {}", model.display(), e))
        })?;
        if !self.detector.has_changed(&content) {
            return Ok(CycleOutcome::Unchanged);
        }

        info!(model = %model.display(), "Generating migration");
        self.spawn_renderings();

        let sql = self.materializer.export_schema(model).await?;
        if let Some(path) = &self.config.exports.sql {
            let path = self.config.project_dir.join(path);
            tokio::fs::write(&path, &sql).await?;
            debug!(path = %path.display(), "Exported model SQL");
        }

        let db = self.provisioner.provision(self.config.port).await?;
        let result = tokio::select! {
            biased;
            _ = &mut shutdown => {
                warn!(port = db.port(), "Interrupted, stopping the ephemeral database");
                Err(MigrationError::Interrupted)
            }
            result = self.generate_on(&db, &sql, target) => result,
        };
        if let Err(e) = db.teardown().await {
            warn!(error = %e, "Failed to tear down ephemeral database");
        }
        result
    }

    fn spawn_renderings(&self) {
        let renderings = [
            (self.config.exports.png.clone(), RenderFormat::Png),
            (self.config.exports.svg.clone(), RenderFormat::Svg),
        ];
        for (output, format) in renderings {
            let Some(output) = output else { continue };
            let output = self.config.project_dir.join(output);
            let model = self.config.model_path.clone();
            let materializer = Arc::clone(&self.materializer);
            tokio::spawn(async move {
                if let Err(e) = materializer.export_rendering(&model, &output, format).await {
                    warn!(format = format.extension(), error = %e, "Failed to export rendering");
                }
            });
        }
    }

    async fn generate_on(
        &self,
        db: &EphemeralDatabase,
        sql: &str,
        target: &OutputTarget,
    ) -> MigrateResult<CycleOutcome> {
        db.create_roles(&self.config.roles).await?;
        let migrate = db.create_database(MIGRATE_DATABASE).await?;
        let desired = db.create_database(TARGET_DATABASE).await?;

        let client = desired.connect().await?;
        client.batch_execute(sql).await.map_err(|e| {
            MigrationError::invalid_model(format!(
                "model SQL does not apply: {}",
                MigrationError::from(e)
            ))
        })?;
        drop(client);

        let manager = MigrationFileManager::new(&self.config.migrations_dir);
        let mut history = manager.list_migrations().await?;
        if let OutputTarget::File { index, .. } = target {
            history.retain(|f| f.index < *index);
        }

        let content = if history.is_empty() {
            sql.to_string()
        } else {
            replay(&migrate, &history, &self.config.bookkeeping_table, None).await?;
            let plan = self
                .differ
                .diff(&migrate, &desired, &db.scratch_factory())
                .await?;
            info!(
                differ = self.differ.name(),
                statements = plan.len(),
                hazards = plan.hazard_count(),
                "Computed plan"
            );
            let reconciliation = self.reconciler.reconcile(&plan, &migrate, &desired).await?;
            reconciliation.append_to(&plan.render())
        };

        let (path, index) = match target {
            OutputTarget::Stdout if content.is_empty() => {
                return Ok(CycleOutcome::NoChanges { removed: None });
            }
            OutputTarget::Stdout => return Ok(CycleOutcome::Printed(content)),
            OutputTarget::File { path, index } => (path, *index),
        };

        if content.is_empty() {
            let removed = if tokio::fs::try_exists(path).await? {
                tokio::fs::remove_file(path).await?;
                info!(path = %path.display(), "Removed migration without changes");
                Some(path.clone())
            } else {
                None
            };
            return Ok(CycleOutcome::NoChanges { removed });
        }

        manager.ensure_dir().await?;
        tokio::fs::write(path, &content).await?;
        info!(path = %path.display(), index, "Wrote migration file");

        template::write_all(&self.config.templates, &self.config.project_dir, index).await?;
        self.hooks
            .clone()
            .with_connection(db.admin())
            .run(GENERATE_MIGRATION_POST, &[path.display().to_string()])
            .await?;

        let lock_updated = if self.config.validate {
            Some(self.reconcile_lock(db, &desired, &manager).await?)
        } else {
            None
        };

        Ok(CycleOutcome::Written {
            path: path.clone(),
            index,
            lock_updated,
        })
    }

    /// Replay the whole history, including the new file, and store its dump
    /// diff against the model.
    async fn reconcile_lock(
        &self,
        db: &EphemeralDatabase,
        desired: &ConnectionInfo,
        manager: &MigrationFileManager,
    ) -> MigrateResult<bool> {
        let replayed = db.create_database(REPLAY_DATABASE).await?;
        let files = manager.list_migrations().await?;
        replay(&replayed, &files, &self.config.bookkeeping_table, None).await?;

        let diff = self.reconciler.dump_diff(&replayed, desired).await?.render();
        if !diff.is_empty() {
            warn!(
                lock = %self.lock.path().display(),
                "Migrations do not reproduce the model exactly"
            );
        }
        let updated = self.lock.reconcile(&diff).await?;
        if updated {
            info!(path = %self.lock.path().display(), "Wrote diff lock file");
        }
        Ok(updated)
    }

    /// Run cycles every `interval` until `shutdown` completes.
    ///
    /// A failure of the first cycle ends the loop, except for an invalid
    /// model, which may be fixed while watching. Later failures are logged.
    /// A cycle in progress when `shutdown` completes is torn down first.
    pub async fn watch<F>(
        &mut self,
        target: &OutputTarget,
        interval: Duration,
        shutdown: F,
    ) -> MigrateResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut first = true;
        loop {
            if !first {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = &mut shutdown => break,
                }
            }
            match self.run_cycle_until(target, shutdown.as_mut()).await {
                Ok(outcome) => report(&outcome),
                Err(MigrationError::Interrupted) => break,
                Err(e) if first && e.is_invalid_model() => error!(error = %e, "Invalid model"),
                Err(e) if first => return Err(e),
                Err(e) => error!(stage = e.stage(), error = %e, "Generation failed"),
            }
            first = false;
        }

        info!("Stopped watching");
        Ok(())
    }

    /// Remove the generated file, used when a dev session ends.
    pub async fn cleanup(&self, target: &OutputTarget) -> MigrateResult<bool> {
        let Some(path) = target.path() else {
            return Ok(false);
        };
        if !tokio::fs::try_exists(path).await? {
            return Ok(false);
        }
        tokio::fs::remove_file(path).await?;
        info!(path = %path.display(), "Removed generated migration");
        Ok(true)
    }
}

fn report(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Unchanged => {}
        CycleOutcome::Printed(_) => debug!("Generated migration"),
        other => info!("{}", other.summary()),
    }
}
