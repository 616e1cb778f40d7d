//! Migration history tracking.
//!
//! The applied version lives in a single-row `schema_migrations` table in the
//! layout used by golang-migrate, so databases managed by trek stay readable
//! by that tool and vice versa.

use tokio_postgres::Client;

use crate::connection::quote_identifier;
use crate::error::MigrateResult;

/// Default bookkeeping table name.
pub const DEFAULT_HISTORY_TABLE: &str = "schema_migrations";

/// Advisory lock key held while migrations are applied.
pub const ADVISORY_LOCK_KEY: i64 = 0x7472_656b;

/// Version marker stored in the bookkeeping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRecord {
    /// Index of the last migration started.
    pub version: i64,
    /// Whether that migration was interrupted before completing.
    pub dirty: bool,
}

/// Migration history repository.
#[async_trait::async_trait]
pub trait MigrationHistoryRepository: Send + Sync {
    /// Create the bookkeeping table if needed.
    async fn initialize(&self) -> MigrateResult<()>;

    /// Current version marker, `None` on a fresh database.
    async fn version(&self) -> MigrateResult<Option<VersionRecord>>;

    /// Replace the version marker.
    async fn set_version(&self, version: i64, dirty: bool) -> MigrateResult<()>;

    /// Execute the SQL of one migration file as a single batch.
    async fn execute_migration(&self, sql: &str) -> MigrateResult<()>;

    /// Acquire an exclusive lock for migrations.
    async fn lock(&self) -> MigrateResult<()>;

    /// Release the lock taken by [`MigrationHistoryRepository::lock`].
    async fn unlock(&self) -> MigrateResult<()>;
}

/// History repository backed by a live PostgreSQL connection.
pub struct PostgresHistory {
    client: Client,
    table: String,
}

impl PostgresHistory {
    /// Track history in the default table.
    pub fn new(client: Client) -> Self {
        Self::with_table(client, DEFAULT_HISTORY_TABLE)
    }

    /// Track history in a custom table.
    pub fn with_table(client: Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    /// Underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn table(&self) -> String {
        quote_identifier(&self.table)
    }
}

/// SQL creating the bookkeeping table.
pub fn init_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (version bigint NOT NULL PRIMARY KEY, dirty boolean NOT NULL)",
        quote_identifier(table)
    )
}

#[async_trait::async_trait]
impl MigrationHistoryRepository for PostgresHistory {
    async fn initialize(&self) -> MigrateResult<()> {
        self.client.batch_execute(&init_sql(&self.table)).await?;
        Ok(())
    }

    async fn version(&self) -> MigrateResult<Option<VersionRecord>> {
        let sql = format!("SELECT version, dirty FROM {} LIMIT 1", self.table());
        let row = self.client.query_opt(&sql, &[]).await?;
        Ok(row.map(|row| VersionRecord {
            version: row.get(0),
            dirty: row.get(1),
        }))
    }

    async fn set_version(&self, version: i64, dirty: bool) -> MigrateResult<()> {
        let table = self.table();
        let truncate = format!("TRUNCATE {}", table);
        let insert = format!("INSERT INTO {} (version, dirty) VALUES ($1, $2)", table);

        self.client.batch_execute("BEGIN").await?;
        let result = async {
            self.client.batch_execute(&truncate).await?;
            self.client.execute(&insert, &[&version, &dirty]).await?;
            self.client.batch_execute("COMMIT").await
        }
        .await;
        if let Err(e) = result {
            let _ = self.client.batch_execute("ROLLBACK").await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn execute_migration(&self, sql: &str) -> MigrateResult<()> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    async fn lock(&self) -> MigrateResult<()> {
        self.client
            .execute("SELECT pg_advisory_lock($1)", &[&ADVISORY_LOCK_KEY])
            .await?;
        Ok(())
    }

    async fn unlock(&self) -> MigrateResult<()> {
        self.client
            .execute("SELECT pg_advisory_unlock($1)", &[&ADVISORY_LOCK_KEY])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_sql_has_table() {
        let sql = init_sql(DEFAULT_HISTORY_TABLE);
        assert!(sql.contains("\"schema_migrations\""));
        assert!(sql.contains("version bigint NOT NULL PRIMARY KEY"));
        assert!(sql.contains("dirty boolean"));
    }

    #[test]
    fn test_init_sql_quotes_custom_table() {
        assert!(init_sql("Migrations").contains("\"Migrations\""));
    }
}
