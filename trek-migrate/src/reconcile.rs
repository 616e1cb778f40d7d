//! Permission reconciliation.
//!
//! The differs do not emit every kind of statement; grants and ownership
//! changes in particular can be missing from a plan. After the plan is applied
//! to the "migrate" database, both databases are dumped and the lines only the
//! desired dump contains are inspected. Those starting with `ALTER` are kept
//! and appended to the migration for manual review.
//!
//! This compares dump text, so it depends on the formatting of `pg_dump`.

use tracing::{debug, warn};

use crate::connection::ConnectionInfo;
use crate::diff::Plan;
use crate::dump::{DumpDiff, PgTools};
use crate::error::{MigrateResult, MigrationError};
use crate::history::DEFAULT_HISTORY_TABLE;

/// Comment heading the recovered statements in a migration file.
pub const REVIEW_NOTICE: &str =
    "-- Recovered by comparing schema dumps; review these statements manually.";

/// Outcome of a reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Dump diff between the migrated and the desired database.
    pub dump_diff: DumpDiff,
    /// Statements recovered from the dump diff.
    pub statements: Vec<String>,
}

impl Reconciliation {
    /// Check if nothing was recovered.
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// The recovered statements as a SQL section, or an empty string.
    pub fn render(&self) -> String {
        if self.statements.is_empty() {
            return String::new();
        }
        let mut out = String::from(REVIEW_NOTICE);
        out.push('\n');
        for statement in &self.statements {
            out.push_str(statement);
            out.push('\n');
        }
        out
    }

    /// Append the recovered section to a rendered plan.
    pub fn append_to(&self, sql: &str) -> String {
        let section = self.render();
        match (sql.is_empty(), section.is_empty()) {
            (_, true) => sql.to_string(),
            (true, false) => section,
            (false, false) => format!("{}\n{}", sql, section),
        }
    }
}

/// Lines added in the desired dump that look like permission statements.
pub fn alter_lines(diff: &DumpDiff) -> Vec<String> {
    diff.added_lines()
        .filter(|line| line.starts_with("ALTER"))
        .map(str::to_string)
        .collect()
}

/// Recovers statements missing from a plan.
#[derive(Debug, Clone)]
pub struct PermissionReconciler {
    tools: PgTools,
    bookkeeping_table: String,
}

impl Default for PermissionReconciler {
    fn default() -> Self {
        Self::new(PgTools::new())
    }
}

impl PermissionReconciler {
    /// Create a reconciler using the given client tools.
    pub fn new(tools: PgTools) -> Self {
        Self {
            tools,
            bookkeeping_table: DEFAULT_HISTORY_TABLE.to_string(),
        }
    }

    /// Exclude a different bookkeeping table from dumps.
    pub fn with_bookkeeping_table(mut self, table: impl Into<String>) -> Self {
        self.bookkeeping_table = table.into();
        self
    }

    fn excluded_tables(&self) -> Vec<String> {
        vec![format!("public.{}", self.bookkeeping_table)]
    }

    /// Line diff between the dumps of `migrate` and `desired`.
    pub async fn dump_diff(
        &self,
        migrate: &ConnectionInfo,
        desired: &ConnectionInfo,
    ) -> MigrateResult<DumpDiff> {
        let excluded = self.excluded_tables();
        let migrate_dump = self.tools.dump_schema(migrate, &excluded).await?;
        let desired_dump = self.tools.dump_schema(desired, &excluded).await?;
        Ok(DumpDiff::between_dumps(&migrate_dump, &desired_dump))
    }

    /// Apply `plan` to `migrate` and recover what it leaves out.
    pub async fn reconcile(
        &self,
        plan: &Plan,
        migrate: &ConnectionInfo,
        desired: &ConnectionInfo,
    ) -> MigrateResult<Reconciliation> {
        if !plan.is_empty() {
            let client = migrate.connect().await?;
            client
                .batch_execute(&plan.render())
                .await
                .map_err(|e| {
                    MigrationError::diff(format!(
                        "generated plan does not apply: {}",
                        MigrationError::from(e)
                    ))
                })?;
        }

        let dump_diff = self.dump_diff(migrate, desired).await?;
        let statements = alter_lines(&dump_diff);
        if !statements.is_empty() {
            warn!(
                count = statements.len(),
                "Recovered statements from schema dumps, review them manually"
            );
        }
        debug!(
            added = dump_diff.added_lines().count(),
            removed = dump_diff.removed_lines().count(),
            "Compared schema dumps"
        );

        Ok(Reconciliation {
            dump_diff,
            statements,
        })
    }
}
