//! Migration application.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::error::{MigrateResult, MigrationError};
use crate::file::MigrationFile;
use crate::history::MigrationHistoryRepository;

/// Result of applying migrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// At least one migration ran.
    Applied {
        /// Number of migrations applied.
        count: usize,
        /// Version after applying.
        version: u32,
        /// Total duration in milliseconds.
        duration_ms: u128,
    },
    /// The database was already up to date.
    NoChange {
        /// Current version.
        version: u32,
    },
}

impl ApplyOutcome {
    /// Number of migrations applied.
    pub fn applied_count(&self) -> usize {
        match self {
            Self::Applied { count, .. } => *count,
            Self::NoChange { .. } => 0,
        }
    }

    /// Version of the database afterwards.
    pub fn version(&self) -> u32 {
        match self {
            Self::Applied { version, .. } | Self::NoChange { version } => *version,
        }
    }

    /// Get a summary of the result.
    pub fn summary(&self) -> String {
        match self {
            Self::Applied {
                count,
                version,
                duration_ms,
            } => format!(
                "{} applied in {}ms, now at version {}",
                count, duration_ms, version
            ),
            Self::NoChange { version } => format!("No changes, at version {}", version),
        }
    }
}

/// Applies migration files in index order and tracks the version marker.
pub struct MigrationEngine<H: MigrationHistoryRepository> {
    history: H,
}

impl<H: MigrationHistoryRepository> MigrationEngine<H> {
    /// Create a new engine.
    pub fn new(history: H) -> Self {
        Self { history }
    }

    /// Access the history repository.
    pub fn history(&self) -> &H {
        &self.history
    }

    /// Create the bookkeeping table.
    pub async fn initialize(&self) -> MigrateResult<()> {
        self.history.initialize().await
    }

    /// Current clean version of the database.
    pub async fn current_version(&self) -> MigrateResult<u32> {
        match self.history.version().await? {
            None => Ok(0),
            Some(record) if record.dirty => Err(MigrationError::Dirty {
                version: record.version,
            }),
            Some(record) => u32::try_from(record.version).map_err(|_| {
                MigrationError::Sequence(format!("invalid recorded version {}", record.version))
            }),
        }
    }

    /// Migrations from `files` that have not been applied yet.
    pub async fn pending<'a>(
        &self,
        files: &'a [MigrationFile],
    ) -> MigrateResult<Vec<&'a MigrationFile>> {
        let version = self.current_version().await?;
        Ok(files.iter().filter(|f| f.index > version).collect())
    }

    /// Apply every pending migration.
    ///
    /// Stops at the first failing file. Migrations committed before it stay
    /// applied, and the failing version is left marked dirty.
    pub async fn apply_all(&self, files: &[MigrationFile]) -> MigrateResult<ApplyOutcome> {
        self.apply(files, None).await
    }

    /// Apply only the next pending migration.
    pub async fn apply_next(&self, files: &[MigrationFile]) -> MigrateResult<ApplyOutcome> {
        self.apply(files, Some(1)).await
    }

    async fn apply(
        &self,
        files: &[MigrationFile],
        limit: Option<usize>,
    ) -> MigrateResult<ApplyOutcome> {
        self.history.initialize().await?;
        self.history.lock().await?;
        let result = self.apply_locked(files, limit).await;
        if let Err(e) = self.history.unlock().await {
            warn!(error = %e, "Failed to release migration lock");
        }
        result
    }

    async fn apply_locked(
        &self,
        files: &[MigrationFile],
        limit: Option<usize>,
    ) -> MigrateResult<ApplyOutcome> {
        let start = Instant::now();
        let mut version = self.current_version().await?;
        let pending: Vec<&MigrationFile> = files
            .iter()
            .filter(|f| f.index > version)
            .take(limit.unwrap_or(usize::MAX))
            .collect();

        if pending.is_empty() {
            debug!(version, "No pending migrations");
            return Ok(ApplyOutcome::NoChange { version });
        }

        for file in &pending {
            let sql = file
                .read_sql()
                .await
                .map_err(|e| MigrationError::apply(&file.path, e.to_string()))?;

            self.history.set_version(i64::from(file.index), true).await?;
            self.history
                .execute_migration(&sql)
                .await
                .map_err(|e| MigrationError::apply(&file.path, e.to_string()))?;
            self.history
                .set_version(i64::from(file.index), false)
                .await?;

            version = file.index;
            info!(migration = %file.file_name(), "Applied migration");
        }

        Ok(ApplyOutcome::Applied {
            count: pending.len(),
            version,
            duration_ms: start.elapsed().as_millis(),
        })
    }
}
