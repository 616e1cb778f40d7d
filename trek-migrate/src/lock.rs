//! Change detection and the diff lock file.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::dump::DumpDiff;
use crate::error::{MigrateResult, MigrationError};

/// Default lock file name, relative to the project root.
pub const DEFAULT_LOCK_FILE: &str = "diff.lock";

/// Strip a single trailing newline.
pub fn normalize_model(content: &str) -> &str {
    content.strip_suffix('\n').unwrap_or(content)
}

/// Remembers the last model content that triggered a generation.
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    last: Option<String>,
}

impl ChangeDetector {
    /// Create a detector that has seen nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `content` against the last snapshot, recording it if it changed.
    ///
    /// Empty content never counts as a change.
    pub fn has_changed(&mut self, content: &str) -> bool {
        let content = normalize_model(content);
        if content.is_empty() || self.last.as_deref() == Some(content) {
            return false;
        }
        self.last = Some(content.to_string());
        true
    }

    /// Last recorded snapshot.
    pub fn last(&self) -> Option<&str> {
        self.last.as_deref()
    }

    /// Forget the snapshot so the next content counts as changed.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// The persisted dump diff of the last generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Lock file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default lock file inside `project_dir`.
    pub fn in_dir(project_dir: &Path) -> Self {
        Self::new(project_dir.join(DEFAULT_LOCK_FILE))
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored content, or `None` if the file does not exist.
    pub async fn read(&self) -> MigrateResult<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store `diff` unless the file already holds exactly that text.
    ///
    /// Returns whether the file was written.
    pub async fn reconcile(&self, diff: &str) -> MigrateResult<bool> {
        if self.read().await?.as_deref() == Some(diff) {
            return Ok(false);
        }
        tokio::fs::write(&self.path, diff).await?;
        debug!(path = %self.path.display(), "Updated lock file");
        Ok(true)
    }

    /// Fail unless the stored text equals `diff`.
    pub async fn verify(&self, diff: &str) -> MigrateResult<()> {
        let Some(stored) = self.read().await? else {
            return Err(MigrationError::Lock(format!(
                "{} does not exist, run generate first",
                self.path.display()
            )));
        };
        if stored == diff {
            return Ok(());
        }
        let changes = DumpDiff::between(&stored, diff).render_with_labels("lock", "actual");
        Err(MigrationError::Lock(format!(
            "{} is out of date:\n{}",
            self.path.display(),
            changes
        )))
    }
}
