//! Diff plans and the schema differ capability.
//!
//! A [`Plan`] is an ordered list of DDL statements, each annotated with the
//! session timeouts it should run under and the hazards it carries. Plans are
//! produced by a [`SchemaDiffer`] comparing a "current" database against a
//! "desired" one and serialized with [`Plan::render`]:
//!
//! ```text
//! SET SESSION statement_timeout = 3000;
//! SET SESSION lock_timeout = 3000;
//!
//! ALTER TABLE "public"."users" ADD COLUMN "email" text;
//!
//! SET SESSION statement_timeout = 1200000;
//!
//! /* Hazards:
//!  - INDEX_BUILD: This might affect database performance.
//! */
//! CREATE UNIQUE INDEX users_email_key ON public.users USING btree (email);
//! ```

use std::fmt;
use std::fmt::Write as _;
use std::time::Duration;

use crate::connection::ConnectionInfo;
use crate::error::MigrateResult;
use crate::history::DEFAULT_HISTORY_TABLE;
use crate::shadow::ScratchDatabaseFactory;

/// Default statement and lock timeout for plan statements.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Statement timeout for statements that rewrite or scan whole tables.
pub const LONG_RUNNING_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Kind of risk carried by a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HazardType {
    /// Blocks reads and writes on the object while it runs.
    AcquiresAccessExclusiveLock,
    /// Rows or whole objects are removed.
    DeletesData,
    /// Builds an index, scanning the table.
    IndexBuild,
    /// An index is removed and queries may slow down.
    IndexDropped,
    /// Noticeable load on the server.
    ImpactsDatabasePerformance,
    /// Dependencies the differ cannot track, such as function bodies.
    HasUntrackableDependencies,
    /// Changes privileges.
    AuthzUpdate,
}

impl HazardType {
    /// Canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AcquiresAccessExclusiveLock => "ACQUIRES_ACCESS_EXCLUSIVE_LOCK",
            Self::DeletesData => "DELETES_DATA",
            Self::IndexBuild => "INDEX_BUILD",
            Self::IndexDropped => "INDEX_DROPPED",
            Self::ImpactsDatabasePerformance => "IMPACTS_DATABASE_PERFORMANCE",
            Self::HasUntrackableDependencies => "HAS_UNTRACKABLE_DEPENDENCIES",
            Self::AuthzUpdate => "AUTHZ_UPDATE",
        }
    }
}

impl fmt::Display for HazardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A risk annotation on a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hazard {
    /// Hazard kind.
    pub kind: HazardType,
    /// Optional human explanation.
    pub message: Option<String>,
}

impl Hazard {
    /// Hazard with an explanation.
    pub fn new(kind: HazardType, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    /// Hazard without an explanation.
    pub fn bare(kind: HazardType) -> Self {
        Self {
            kind,
            message: None,
        }
    }
}

/// One statement of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// DDL without the trailing semicolon.
    pub ddl: String,
    /// Session statement timeout.
    pub statement_timeout: Duration,
    /// Session lock timeout.
    pub lock_timeout: Duration,
    /// Risk annotations.
    pub hazards: Vec<Hazard>,
}

impl Statement {
    /// Statement with default timeouts and no hazards.
    pub fn new(ddl: impl Into<String>) -> Self {
        let ddl = ddl.into();
        let ddl = ddl.trim().trim_end_matches(';').trim_end().to_string();
        Self {
            ddl,
            statement_timeout: DEFAULT_TIMEOUT,
            lock_timeout: DEFAULT_TIMEOUT,
            hazards: Vec::new(),
        }
    }

    /// Set the statement timeout.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    /// Set the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Add a hazard.
    pub fn with_hazard(mut self, hazard: Hazard) -> Self {
        self.hazards.push(hazard);
        self
    }
}

/// An ordered list of statements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Statements in execution order.
    pub statements: Vec<Statement>,
}

impl Plan {
    /// Create a plan from statements.
    pub fn new(statements: Vec<Statement>) -> Self {
        Self { statements }
    }

    /// Check if there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Number of statements.
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Remove statements that drop the bookkeeping table or its key.
    pub fn without_bookkeeping(mut self, table: &str) -> Self {
        self.statements
            .retain(|statement| !is_bookkeeping_statement(&statement.ddl, table));
        self
    }

    /// Count of hazard annotations across statements.
    pub fn hazard_count(&self) -> usize {
        self.statements.iter().map(|s| s.hazards.len()).sum()
    }

    /// Serialize the plan as SQL.
    ///
    /// `SET SESSION` directives are emitted only when a timeout differs from
    /// the previously emitted value. Hazards precede their statement as a
    /// comment block.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut last_statement_timeout = 0u128;
        let mut last_lock_timeout = 0u128;

        for (i, statement) in self.statements.iter().enumerate() {
            let statement_timeout = statement.statement_timeout.as_millis();
            let lock_timeout = statement.lock_timeout.as_millis();

            if statement_timeout != last_statement_timeout || lock_timeout != last_lock_timeout {
                if statement_timeout != last_statement_timeout {
                    last_statement_timeout = statement_timeout;
                    let _ = writeln!(out, "SET SESSION statement_timeout = {};", statement_timeout);
                }
                if lock_timeout != last_lock_timeout {
                    last_lock_timeout = lock_timeout;
                    let _ = writeln!(out, "SET SESSION lock_timeout = {};", lock_timeout);
                }
                out.push('\n');
            }

            if !statement.hazards.is_empty() {
                out.push_str("/* Hazards:\n");
                for hazard in &statement.hazards {
                    match &hazard.message {
                        Some(message) => {
                            let _ = writeln!(out, " - {}: {}", hazard.kind, message);
                        }
                        None => {
                            let _ = writeln!(out, " - {}", hazard.kind);
                        }
                    }
                }
                out.push_str("*/\n");
            }

            let _ = writeln!(out, "{};", statement.ddl);
            if i + 1 < self.statements.len() {
                out.push('\n');
            }
        }

        out
    }
}

/// Check whether `ddl` drops the bookkeeping table, its primary key, or the
/// index backing it.
///
/// Both the catalog differ's quoting and migra's lower-case spelling match.
pub fn is_bookkeeping_statement(ddl: &str, table: &str) -> bool {
    let normalized = ddl
        .trim()
        .trim_end_matches(';')
        .trim_end()
        .to_ascii_lowercase();
    let table = table.to_ascii_lowercase();
    let candidates = [
        format!("drop table \"public\".\"{}\"", table),
        format!("drop table if exists \"public\".\"{}\"", table),
        format!(
            "alter table \"public\".\"{0}\" drop constraint \"{0}_pkey\"",
            table
        ),
        format!("drop index if exists \"public\".\"{}_pkey\"", table),
    ];
    candidates.iter().any(|candidate| *candidate == normalized)
}

/// Options shared by differ implementations.
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Allow `CREATE INDEX CONCURRENTLY` and friends.
    ///
    /// Off by default: migration files run inside a transaction.
    pub concurrent_index_ops: bool,
    /// Verify the plan by replaying it on a scratch database.
    pub validate_plan: bool,
    /// Bookkeeping table filtered from plans.
    pub bookkeeping_table: String,
    /// Schemas to compare; empty means all user schemas.
    pub schemas: Vec<String>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            concurrent_index_ops: false,
            validate_plan: false,
            bookkeeping_table: DEFAULT_HISTORY_TABLE.to_string(),
            schemas: Vec::new(),
        }
    }
}

impl DiffOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable plan validation.
    pub fn validate_plan(mut self, validate: bool) -> Self {
        self.validate_plan = validate;
        self
    }

    /// Allow concurrent index operations.
    pub fn concurrent_index_ops(mut self, allow: bool) -> Self {
        self.concurrent_index_ops = allow;
        self
    }

    /// Set the bookkeeping table.
    pub fn bookkeeping_table(mut self, table: impl Into<String>) -> Self {
        self.bookkeeping_table = table.into();
        self
    }

    /// Restrict comparison to the given schemas.
    pub fn schemas(mut self, schemas: Vec<String>) -> Self {
        self.schemas = schemas;
        self
    }
}

/// Computes the statements turning `current` into `desired`.
#[async_trait::async_trait]
pub trait SchemaDiffer: Send + Sync {
    /// Compare two live databases.
    ///
    /// `scratch` hands out disposable databases on the same server for
    /// implementations that validate plans speculatively.
    async fn diff(
        &self,
        current: &ConnectionInfo,
        desired: &ConnectionInfo,
        scratch: &ScratchDatabaseFactory,
    ) -> MigrateResult<Plan>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_plan_renders_nothing() {
        assert_eq!(Plan::default().render(), "");
        assert!(Plan::default().is_empty());
    }

    #[test]
    fn test_render_groups_timeouts() {
        let plan = Plan::new(vec![
            Statement::new("CREATE TABLE \"public\".\"users\" (\"id\" integer)"),
            Statement::new("ALTER TABLE \"public\".\"users\" ADD COLUMN \"email\" text;"),
            Statement::new("CREATE INDEX users_email ON public.users USING btree (email)")
                .with_statement_timeout(LONG_RUNNING_TIMEOUT)
                .with_hazard(Hazard::new(
                    HazardType::IndexBuild,
                    "This might affect database performance.",
                ))
                .with_hazard(Hazard::bare(HazardType::AcquiresAccessExclusiveLock)),
            Statement::new("DROP TABLE \"public\".\"legacy\""),
        ]);

        let expected = "\
SET SESSION statement_timeout = 3000;
SET SESSION lock_timeout = 3000;

CREATE TABLE \"public\".\"users\" (\"id\" integer);

ALTER TABLE \"public\".\"users\" ADD COLUMN \"email\" text;

SET SESSION statement_timeout = 1200000;

/* Hazards:
 - INDEX_BUILD: This might affect database performance.
 - ACQUIRES_ACCESS_EXCLUSIVE_LOCK
*/
CREATE INDEX users_email ON public.users USING btree (email);

SET SESSION statement_timeout = 3000;

DROP TABLE \"public\".\"legacy\";
";
        assert_eq!(plan.render(), expected);
    }

    #[test]
    fn test_render_only_changed_lock_timeout() {
        let plan = Plan::new(vec![
            Statement::new("SELECT 1"),
            Statement::new("SELECT 2").with_lock_timeout(Duration::from_secs(10)),
        ]);
        let rendered = plan.render();
        assert!(rendered.contains("\n\nSET SESSION lock_timeout = 10000;\n\nSELECT 2;\n"));
        assert_eq!(rendered.matches("statement_timeout").count(), 1);
    }

    #[test]
    fn test_bookkeeping_filter() {
        let table = DEFAULT_HISTORY_TABLE;
        assert!(is_bookkeeping_statement(
            "DROP TABLE \"public\".\"schema_migrations\"",
            table
        ));
        assert!(is_bookkeeping_statement(
            "alter table \"public\".\"schema_migrations\" drop constraint \"schema_migrations_pkey\";",
            table
        ));
        assert!(is_bookkeeping_statement(
            "drop index if exists \"public\".\"schema_migrations_pkey\";",
            table
        ));
        assert!(is_bookkeeping_statement(
            "drop table \"public\".\"schema_migrations\";",
            table
        ));
        assert!(!is_bookkeeping_statement(
            "DROP TABLE \"public\".\"users\"",
            table
        ));
        assert!(!is_bookkeeping_statement(
            "DROP TABLE \"audit\".\"schema_migrations\"",
            table
        ));
    }

    #[test]
    fn test_without_bookkeeping_keeps_order() {
        let plan = Plan::new(vec![
            Statement::new("CREATE TABLE \"public\".\"a\" ()"),
            Statement::new("DROP TABLE \"public\".\"schema_migrations\""),
            Statement::new("CREATE TABLE \"public\".\"b\" ()"),
        ])
        .without_bookkeeping(DEFAULT_HISTORY_TABLE);

        let ddl: Vec<&str> = plan.statements.iter().map(|s| s.ddl.as_str()).collect();
        assert_eq!(
            ddl,
            vec!["CREATE TABLE \"public\".\"a\" ()", "CREATE TABLE \"public\".\"b\" ()"]
        );
    }

    #[test]
    fn test_statement_strips_semicolon() {
        assert_eq!(Statement::new("  SELECT 1 ;\n").ddl, "SELECT 1");
    }
}
