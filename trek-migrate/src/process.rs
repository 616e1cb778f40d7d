//! Helpers for running external tools.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;
use tracing::debug;

use crate::error::{MigrateResult, MigrationError};

/// Resolve `program` inside `bin_dir`, or leave it to `PATH` lookup.
pub fn program_path(bin_dir: Option<&Path>, program: &str) -> PathBuf {
    match bin_dir {
        Some(dir) => dir.join(program),
        None => PathBuf::from(program),
    }
}

/// Check whether `program` can be found on `PATH` (or is an existing path).
pub fn is_available(program: &Path) -> bool {
    if program.components().count() > 1 {
        return program.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

/// Build a command with piped output and no inherited stdin.
pub fn command<I, S>(program: &Path, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Run a command to completion, returning its raw output.
pub async fn output(cmd: &mut Command, program: &Path) -> MigrateResult<Output> {
    debug!(program = %program.display(), "Running external tool");
    cmd.output()
        .await
        .map_err(|e| MigrationError::tool(display_name(program), e.to_string()))
}

/// Run a command and return stdout, failing on a non-zero exit status.
pub async fn run(cmd: &mut Command, program: &Path) -> MigrateResult<String> {
    let output = output(cmd, program).await?;
    if !output.status.success() {
        return Err(failure(program, &output));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Error describing a failed run.
pub fn failure(program: &Path, output: &Output) -> MigrationError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    };
    MigrationError::tool(
        display_name(program),
        format!("{} ({})", detail, output.status),
    )
}

fn display_name(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_path() {
        assert_eq!(program_path(None, "psql"), PathBuf::from("psql"));
        assert_eq!(
            program_path(Some(Path::new("/usr/lib/postgresql/18/bin")), "psql"),
            PathBuf::from("/usr/lib/postgresql/18/bin/psql")
        );
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        assert!(!is_available(Path::new("trek-definitely-not-installed")));
        assert!(!is_available(Path::new("/nonexistent/bin/psql")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_stderr() {
        let sh = Path::new("sh");
        let err = run(&mut command(sh, ["-c", "echo boom >&2; exit 3"]), sh)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("sh failed"));
        assert!(msg.contains("boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_returns_stdout() {
        let sh = Path::new("sh");
        let out = run(&mut command(sh, ["-c", "echo hello"]), sh).await.unwrap();
        assert_eq!(out, "hello\n");
    }
}
