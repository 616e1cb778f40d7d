//! Migration file management.
//!
//! Migrations are flat files named `NNN_<name>.up.sql` where `NNN` is a
//! zero-padded, contiguous index starting at 1:
//!
//! ```text
//! migrations/
//! ├── 001_init.up.sql
//! ├── 002_add-email.up.sql
//! └── 003_orders.up.sql
//! ```

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex_lite::Regex;
use tracing::debug;

use crate::error::{MigrateResult, MigrationError};

/// Suffix shared by all migration files.
pub const MIGRATION_SUFFIX: &str = ".up.sql";

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9\-]*[a-z]$").expect("valid regex"));

static FILE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{3})_([a-z][a-z0-9\-]*[a-z])\.up\.sql$").expect("valid regex")
});

/// Check whether a migration name follows the slug grammar.
pub fn is_valid_migration_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// Check whether a file name follows the `NNN_<name>.up.sql` grammar.
pub fn is_valid_migration_file_name(file_name: &str) -> bool {
    FILE_NAME_RE.is_match(file_name)
}

/// Build the file name for a migration.
pub fn migration_file_name(index: u32, name: &str) -> String {
    format!("{:03}_{}{}", index, name, MIGRATION_SUFFIX)
}

/// Split a migration file name into index and name.
pub fn parse_migration_file_name(file_name: &str) -> MigrateResult<(u32, String)> {
    let caps = FILE_NAME_RE
        .captures(file_name)
        .ok_or_else(|| MigrationError::invalid_naming(file_name))?;
    let index = caps[1]
        .parse()
        .map_err(|_| MigrationError::invalid_naming(file_name))?;
    Ok((index, caps[2].to_string()))
}

/// A migration file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    /// Path to the migration file.
    pub path: PathBuf,
    /// One-based index.
    pub index: u32,
    /// Migration name (the slug part of the file name).
    pub name: String,
}

impl MigrationFile {
    /// File name without directory.
    pub fn file_name(&self) -> String {
        migration_file_name(self.index, &self.name)
    }

    /// Read the SQL content.
    pub async fn read_sql(&self) -> MigrateResult<String> {
        Ok(tokio::fs::read_to_string(&self.path).await?)
    }
}

/// A slot chosen for the next migration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Path the migration will be written to.
    pub path: PathBuf,
    /// Index of the migration.
    pub index: u32,
    /// Whether an existing migration slot is being reused.
    pub reused: bool,
}

/// Migration directory reader.
#[derive(Debug, Clone)]
pub struct MigrationFileManager {
    /// Directory where migrations are stored.
    migrations_dir: PathBuf,
}

impl MigrationFileManager {
    /// Create a new file manager.
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
        }
    }

    /// Get the migrations directory.
    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// Ensure the migrations directory exists.
    pub async fn ensure_dir(&self) -> MigrateResult<()> {
        tokio::fs::create_dir_all(&self.migrations_dir).await?;
        Ok(())
    }

    /// Count migration files, failing on any malformed entry.
    ///
    /// The count doubles as the highest index in a contiguous directory.
    pub async fn inspect(&self) -> MigrateResult<u32> {
        let count = self.list_migrations().await?.len();
        u32::try_from(count).map_err(|_| MigrationError::Sequence("too many migrations".into()))
    }

    /// List all migration files ordered by index.
    ///
    /// Directories are ignored; any other entry must follow the naming grammar.
    pub async fn list_migrations(&self) -> MigrateResult<Vec<MigrationFile>> {
        let mut migrations = Vec::new();

        if !self.migrations_dir.exists() {
            return Ok(migrations);
        }

        let mut entries = tokio::fs::read_dir(&self.migrations_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let (index, name) = parse_migration_file_name(&file_name)?;
            migrations.push(MigrationFile {
                path: entry.path(),
                index,
                name,
            });
        }

        migrations.sort_by(|a, b| a.index.cmp(&b.index).then(a.name.cmp(&b.name)));
        Ok(migrations)
    }

    /// Check that indices run from 1 without gaps or duplicates.
    pub async fn verify_sequence(&self) -> MigrateResult<Vec<MigrationFile>> {
        let migrations = self.list_migrations().await?;
        verify_contiguous(&migrations)?;
        Ok(migrations)
    }

    /// Path of the migration at `index` with `name`.
    pub fn path_for(&self, index: u32, name: &str) -> PathBuf {
        self.migrations_dir.join(migration_file_name(index, name))
    }

    /// Choose the slot for a migration called `name`.
    ///
    /// When the latest migration already has this name the slot can be
    /// reused: unconditionally with `overwrite`, otherwise when `confirm`
    /// agrees. Anything else gets the next index.
    pub async fn allocate(
        &self,
        name: &str,
        overwrite: bool,
        confirm: impl FnOnce(&Path) -> bool,
    ) -> MigrateResult<Allocation> {
        if !is_valid_migration_name(name) {
            return Err(MigrationError::InvalidName(name.to_string()));
        }

        let count = self.inspect().await?;
        if count > 0 {
            let current = self.path_for(count, name);
            if current.exists() && (overwrite || confirm(&current)) {
                debug!(path = %current.display(), "Reusing migration slot");
                return Ok(Allocation {
                    path: current,
                    index: count,
                    reused: true,
                });
            }
        }

        let index = count + 1;
        Ok(Allocation {
            path: self.path_for(index, name),
            index,
            reused: false,
        })
    }
}

/// Check index contiguity of a sorted migration list.
pub fn verify_contiguous(migrations: &[MigrationFile]) -> MigrateResult<()> {
    for (position, migration) in migrations.iter().enumerate() {
        let expected = position as u32 + 1;
        if migration.index == expected {
            continue;
        }
        if migration.index < expected {
            return Err(MigrationError::Sequence(format!(
                "duplicate migration index {:03} ({})",
                migration.index,
                migration.file_name()
            )));
        }
        return Err(MigrationError::Sequence(format!(
            "expected migration {:03}, found {}",
            expected,
            migration.file_name()
        )));
    }
    Ok(())
}

/// Test data files for the migration at `index`.
///
/// Every file below `testdata_dir` whose name starts with the zero-padded
/// index matches, in path order. A missing directory yields nothing.
pub async fn testdata_files(testdata_dir: &Path, index: u32) -> MigrateResult<Vec<PathBuf>> {
    let prefix = format!("{:03}", index);
    let mut found = Vec::new();
    let mut pending = vec![testdata_dir.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if entry.file_name().to_string_lossy().starts_with(&prefix) {
                found.push(path);
            }
        }
    }

    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), "SELECT 1;\n").unwrap();
    }

    #[test]
    fn test_migration_names() {
        assert!(is_valid_migration_name("init"));
        assert!(is_valid_migration_name("add-email2-column"));
        assert!(!is_valid_migration_name("a"));
        assert!(!is_valid_migration_name("2fa"));
        assert!(!is_valid_migration_name("users-"));
        assert!(!is_valid_migration_name("users2"));
        assert!(!is_valid_migration_name("add_email"));
        assert!(!is_valid_migration_name("Users"));
    }

    #[test]
    fn test_file_name_round_trip() {
        let file_name = migration_file_name(7, "add-email");
        assert_eq!(file_name, "007_add-email.up.sql");
        assert!(is_valid_migration_file_name(&file_name));
        assert_eq!(
            parse_migration_file_name(&file_name).unwrap(),
            (7, "add-email".to_string())
        );
    }

    #[test]
    fn test_invalid_file_names() {
        assert!(!is_valid_migration_file_name("1_init.up.sql"));
        assert!(!is_valid_migration_file_name("001_init.sql"));
        assert!(!is_valid_migration_file_name("001_init.down.sql"));
        assert!(!is_valid_migration_file_name("001-init.up.sql"));
        assert!(!is_valid_migration_file_name("README.md"));
    }

    #[tokio::test]
    async fn test_inspect_missing_dir() {
        let dir = TempDir::new().unwrap();
        let manager = MigrationFileManager::new(dir.path().join("migrations"));
        assert_eq!(manager.inspect().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_inspect_counts_and_skips_dirs() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "001_init.up.sql");
        touch(dir.path(), "002_users.up.sql");
        std::fs::create_dir(dir.path().join("archive")).unwrap();

        let manager = MigrationFileManager::new(dir.path());
        assert_eq!(manager.inspect().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_inspect_rejects_malformed_entry() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "001_init.up.sql");
        touch(dir.path(), "notes.txt");

        let manager = MigrationFileManager::new(dir.path());
        let err = manager.inspect().await.unwrap_err();
        assert!(matches!(err, MigrationError::InvalidNaming { name } if name == "notes.txt"));
    }

    #[tokio::test]
    async fn test_list_is_ordered() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "010_ten.up.sql");
        touch(dir.path(), "002_two.up.sql");
        touch(dir.path(), "001_one.up.sql");

        let manager = MigrationFileManager::new(dir.path());
        let indices: Vec<u32> = manager
            .list_migrations()
            .await
            .unwrap()
            .iter()
            .map(|m| m.index)
            .collect();
        assert_eq!(indices, vec![1, 2, 10]);
    }

    #[tokio::test]
    async fn test_verify_sequence() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "001_init.up.sql");
        touch(dir.path(), "003_gap.up.sql");
        let manager = MigrationFileManager::new(dir.path());
        assert!(matches!(
            manager.verify_sequence().await,
            Err(MigrationError::Sequence(_))
        ));

        let dir = TempDir::new().unwrap();
        touch(dir.path(), "001_init.up.sql");
        touch(dir.path(), "001_other.up.sql");
        let manager = MigrationFileManager::new(dir.path());
        let err = manager.verify_sequence().await.unwrap_err();
        assert!(err.to_string().contains("duplicate"));

        let dir = TempDir::new().unwrap();
        touch(dir.path(), "001_init.up.sql");
        touch(dir.path(), "002_next.up.sql");
        let manager = MigrationFileManager::new(dir.path());
        assert_eq!(manager.verify_sequence().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_allocate_fresh_name_increments() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "001_init.up.sql");
        touch(dir.path(), "002_users.up.sql");
        let manager = MigrationFileManager::new(dir.path());

        let allocation = manager.allocate("orders", false, |_| true).await.unwrap();
        assert_eq!(allocation.index, 3);
        assert!(!allocation.reused);
        assert_eq!(allocation.path, dir.path().join("003_orders.up.sql"));
    }

    #[tokio::test]
    async fn test_allocate_overwrite_reuses_latest() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "001_init.up.sql");
        touch(dir.path(), "002_users.up.sql");
        let manager = MigrationFileManager::new(dir.path());

        let allocation = manager.allocate("users", true, |_| false).await.unwrap();
        assert_eq!(allocation.index, 2);
        assert!(allocation.reused);
    }

    #[tokio::test]
    async fn test_allocate_asks_before_reusing() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "001_init.up.sql");
        let manager = MigrationFileManager::new(dir.path());

        let declined = manager.allocate("init", false, |_| false).await.unwrap();
        assert_eq!(declined.index, 2);

        let mut asked = None;
        let accepted = manager
            .allocate("init", false, |path| {
                asked = Some(path.to_path_buf());
                true
            })
            .await
            .unwrap();
        assert_eq!(accepted.index, 1);
        assert_eq!(asked, Some(dir.path().join("001_init.up.sql")));
    }

    #[tokio::test]
    async fn test_allocate_only_reuses_latest_slot() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "001_init.up.sql");
        touch(dir.path(), "002_users.up.sql");
        let manager = MigrationFileManager::new(dir.path());

        let allocation = manager.allocate("init", true, |_| true).await.unwrap();
        assert_eq!(allocation.index, 3);
    }

    #[tokio::test]
    async fn test_allocate_rejects_bad_name() {
        let dir = TempDir::new().unwrap();
        let manager = MigrationFileManager::new(dir.path());
        assert!(matches!(
            manager.allocate("Bad_Name", false, |_| true).await,
            Err(MigrationError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_testdata_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        touch(dir.path(), "001_users.sql");
        touch(dir.path(), "002_orders.sql");
        touch(&dir.path().join("nested"), "001_more.sql");

        let files = testdata_files(dir.path(), 1).await.unwrap();
        assert_eq!(
            files,
            vec![
                dir.path().join("001_users.sql"),
                dir.path().join("nested").join("001_more.sql"),
            ]
        );
        assert!(testdata_files(dir.path(), 3).await.unwrap().is_empty());
        assert!(testdata_files(&dir.path().join("none"), 1).await.unwrap().is_empty());
    }
}
