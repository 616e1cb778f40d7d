//! Project hooks.
//!
//! Hooks are executables in `<project>/hooks/` run at fixed points of the
//! `apply`, `generate` and `check` commands. A missing hook is skipped.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tracing::{debug, info};

use crate::connection::ConnectionInfo;
use crate::error::{MigrateResult, MigrationError};

/// Directory holding hooks, relative to the project root.
pub const HOOKS_DIR: &str = "hooks";

/// Hook run before the database is reset by `apply`.
pub const APPLY_RESET_PRE: &str = "apply-reset-pre";
/// Hook run after the database is reset by `apply`.
pub const APPLY_RESET_POST: &str = "apply-reset-post";
/// Hook run before migrations are applied.
pub const APPLY_PRE: &str = "apply-pre";
/// Hook run after migrations are applied.
pub const APPLY_POST: &str = "apply-post";
/// Hook run after a migration file was written, with its path as argument.
pub const GENERATE_MIGRATION_POST: &str = "generate-migration-post";
/// Hook run before `check` validates the project.
pub const CHECK_PRE: &str = "check-pre";
/// Hook run after `check` succeeded.
pub const CHECK_POST: &str = "check-post";

/// Every hook name, in the order they are documented.
pub const HOOK_NAMES: [&str; 7] = [
    APPLY_RESET_PRE,
    APPLY_RESET_POST,
    APPLY_PRE,
    APPLY_POST,
    GENERATE_MIGRATION_POST,
    CHECK_PRE,
    CHECK_POST,
];

/// Runs hooks from a project's hooks directory.
#[derive(Debug, Clone)]
pub struct HookRunner {
    hooks_dir: PathBuf,
    env: Vec<(String, String)>,
}

impl HookRunner {
    /// Runner for the hooks of the project at `project_dir`.
    pub fn new(project_dir: &Path) -> Self {
        Self::with_hooks_dir(project_dir.join(HOOKS_DIR))
    }

    /// Runner for hooks in `hooks_dir`.
    pub fn with_hooks_dir(hooks_dir: impl Into<PathBuf>) -> Self {
        Self {
            hooks_dir: hooks_dir.into(),
            env: Vec::new(),
        }
    }

    /// Pass the `TREK_POSTGRES_*` variables describing `connection`.
    pub fn with_connection(mut self, connection: &ConnectionInfo) -> Self {
        self.env = connection.hook_env();
        self
    }

    /// Hooks directory.
    pub fn hooks_dir(&self) -> &Path {
        &self.hooks_dir
    }

    /// Path of the hook called `name`.
    pub fn hook_path(&self, name: &str) -> PathBuf {
        self.hooks_dir.join(name)
    }

    /// Run the hook called `name` with `args`.
    ///
    /// Returns `false` when the hook does not exist.
    pub async fn run(&self, name: &str, args: &[String]) -> MigrateResult<bool> {
        let path = self.hook_path(name);
        if !tokio::fs::try_exists(&path).await? {
            debug!(hook = name, "Skipping hook");
            return Ok(false);
        }

        info!(hook = name, "Running hook");
        let status = tokio::process::Command::new(&path)
            .args(args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.hooks_dir)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| MigrationError::hook(name, e.to_string()))?;

        if !status.success() {
            return Err(MigrationError::hook(name, status.to_string()));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn write_hook(dir: &Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let hooks = dir.join(HOOKS_DIR);
        std::fs::create_dir_all(&hooks).unwrap();
        let path = hooks.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_missing_hook_is_skipped() {
        let dir = TempDir::new().unwrap();
        let runner = HookRunner::new(dir.path());
        assert!(!runner.run(APPLY_PRE, &[]).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hook_receives_args_env_and_cwd() {
        let dir = TempDir::new().unwrap();
        write_hook(
            dir.path(),
            GENERATE_MIGRATION_POST,
            "echo \"$1 $TREK_POSTGRES_PORT $TREK_POSTGRES_DATABASE\" > \"$(pwd)/out.txt\"",
        );
        let runner = HookRunner::new(dir.path())
            .with_connection(&ConnectionInfo::local(5433, "postgres"));
        let ran = runner
            .run(GENERATE_MIGRATION_POST, &["migrations/002_x.up.sql".to_string()])
            .await
            .unwrap();
        assert!(ran);

        let out = std::fs::read_to_string(dir.path().join(HOOKS_DIR).join("out.txt")).unwrap();
        assert_eq!(out, "migrations/002_x.up.sql 5433 postgres\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_hook_is_an_error() {
        let dir = TempDir::new().unwrap();
        write_hook(dir.path(), CHECK_PRE, "exit 4");
        let err = HookRunner::new(dir.path())
            .run(CHECK_PRE, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Hook { ref name, .. } if name == CHECK_PRE));
    }

    #[test]
    fn test_hook_names() {
        assert_eq!(HOOK_NAMES.len(), 7);
        assert!(HOOK_NAMES.contains(&"generate-migration-post"));
    }
}
