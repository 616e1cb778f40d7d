//! Structural dumps and line-level dump comparison.
//!
//! `pg_dump --schema-only` output is used in two places: recovering statements
//! the catalog differ does not produce, and detecting whether a regenerated
//! migration reproduces the model exactly. Both compare dumps line by line
//! with [`DumpDiff`].

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::connection::ConnectionInfo;
use crate::error::{MigrateResult, MigrationError};
use crate::process;

/// Lines of unchanged context around each hunk.
pub const CONTEXT_LINES: usize = 3;

/// Runner for the PostgreSQL client tools.
#[derive(Debug, Clone, Default)]
pub struct PgTools {
    bin_dir: Option<PathBuf>,
}

impl PgTools {
    /// Use binaries from `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use binaries from `bin_dir`.
    pub fn with_bin_dir(mut self, bin_dir: Option<PathBuf>) -> Self {
        self.bin_dir = bin_dir;
        self
    }

    fn program(&self, name: &str) -> PathBuf {
        process::program_path(self.bin_dir.as_deref(), name)
    }

    /// Schema-only dump of a database, leaving out `exclude_tables`.
    pub async fn dump_schema(
        &self,
        info: &ConnectionInfo,
        exclude_tables: &[String],
    ) -> MigrateResult<String> {
        let pg_dump = self.program("pg_dump");
        let mut args = vec![
            "--dbname".to_string(),
            info.dsn(),
            "--schema-only".to_string(),
        ];
        args.extend(
            exclude_tables
                .iter()
                .map(|table| format!("--exclude-table={}", table)),
        );
        debug!(database = %info.database, "Dumping schema");
        process::run(&mut process::command(&pg_dump, &args), &pg_dump).await
    }

    /// Execute a SQL file with `psql`, stopping at the first error.
    pub async fn psql_file(&self, info: &ConnectionInfo, file: &Path) -> MigrateResult<()> {
        let psql = self.program("psql");
        let file = file.display().to_string();
        let dsn = info.dsn();
        process::run(
            &mut process::command(
                &psql,
                [
                    "--quiet",
                    "--echo-errors",
                    "--variable",
                    "ON_ERROR_STOP=1",
                    "--dbname",
                    dsn.as_str(),
                    "--file",
                    file.as_str(),
                ],
            ),
            &psql,
        )
        .await?;
        Ok(())
    }

    /// Execute a SQL script with `psql`.
    ///
    /// Unlike a driver batch this understands psql meta-commands.
    pub async fn psql_script(&self, info: &ConnectionInfo, sql: &str) -> MigrateResult<()> {
        let file = tempfile::Builder::new()
            .prefix("trek-")
            .suffix(".sql")
            .tempfile()?;
        tokio::fs::write(file.path(), sql).await?;
        self.psql_file(info, file.path()).await
    }
}

/// Drop blank lines, comments and session-restriction keys from a dump.
///
/// `\restrict` keys are random per run and would make every dump differ.
pub fn clean_dump(dump: &str) -> String {
    dump.lines()
        .filter(|line| {
            !line.is_empty()
                && !line.starts_with("--")
                && !line.starts_with("\\restrict")
                && !line.starts_with("\\unrestrict")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One line of a line diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    /// Present on both sides.
    Same(String),
    /// Only in the old text.
    Removed(String),
    /// Only in the new text.
    Added(String),
}

impl DiffLine {
    fn is_change(&self) -> bool {
        !matches!(self, Self::Same(_))
    }
}

/// Line diff between two dumps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpDiff {
    lines: Vec<DiffLine>,
}

impl DumpDiff {
    /// Compare `old` against `new`.
    pub fn between(old: &str, new: &str) -> Self {
        let a: Vec<&str> = old.lines().collect();
        let b: Vec<&str> = new.lines().collect();
        Self {
            lines: myers(&a, &b),
        }
    }

    /// Compare two raw `pg_dump` outputs after cleaning them.
    pub fn between_dumps(old: &str, new: &str) -> Self {
        Self::between(&clean_dump(old), &clean_dump(new))
    }

    /// All lines, in order.
    pub fn lines(&self) -> &[DiffLine] {
        &self.lines
    }

    /// Check if both sides are identical.
    pub fn is_empty(&self) -> bool {
        !self.lines.iter().any(DiffLine::is_change)
    }

    /// Lines only present on the new side.
    pub fn added_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            DiffLine::Added(text) => Some(text.as_str()),
            _ => None,
        })
    }

    /// Lines only present on the old side.
    pub fn removed_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            DiffLine::Removed(text) => Some(text.as_str()),
            _ => None,
        })
    }

    /// Render as a unified diff from `migrate` to `target`.
    ///
    /// Identical inputs render as an empty string.
    pub fn render(&self) -> String {
        self.render_with_labels("migrate", "target")
    }

    /// Render as a unified diff with custom file labels.
    pub fn render_with_labels(&self, old_label: &str, new_label: &str) -> String {
        if self.is_empty() {
            return String::new();
        }

        let mut out = String::new();
        let _ = writeln!(out, "--- {}", old_label);
        let _ = writeln!(out, "+++ {}", new_label);

        for (start, end) in self.hunks() {
            let old_before = self.lines[..start]
                .iter()
                .filter(|l| !matches!(l, DiffLine::Added(_)))
                .count();
            let new_before = self.lines[..start]
                .iter()
                .filter(|l| !matches!(l, DiffLine::Removed(_)))
                .count();
            let old_count = self.lines[start..end]
                .iter()
                .filter(|l| !matches!(l, DiffLine::Added(_)))
                .count();
            let new_count = self.lines[start..end]
                .iter()
                .filter(|l| !matches!(l, DiffLine::Removed(_)))
                .count();

            let old_start = if old_count == 0 { old_before } else { old_before + 1 };
            let new_start = if new_count == 0 { new_before } else { new_before + 1 };
            let _ = writeln!(
                out,
                "@@ -{},{} +{},{} @@",
                old_start, old_count, new_start, new_count
            );

            for line in &self.lines[start..end] {
                let _ = match line {
                    DiffLine::Same(text) => writeln!(out, " {}", text),
                    DiffLine::Removed(text) => writeln!(out, "-{}", text),
                    DiffLine::Added(text) => writeln!(out, "+{}", text),
                };
            }
        }

        out
    }

    /// Ranges of `lines` forming hunks with surrounding context.
    fn hunks(&self) -> Vec<(usize, usize)> {
        let changes: Vec<usize> = self
            .lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.is_change())
            .map(|(i, _)| i)
            .collect();

        let mut hunks: Vec<(usize, usize)> = Vec::new();
        for index in changes {
            let start = index.saturating_sub(CONTEXT_LINES);
            let end = (index + CONTEXT_LINES + 1).min(self.lines.len());
            match hunks.last_mut() {
                Some(last) if start <= last.1 => last.1 = end,
                _ => hunks.push((start, end)),
            }
        }
        hunks
    }
}

/// Line diff of `a` against `b`. The common head and tail are matched
/// directly, the rest goes through [`edit_script`].
fn myers(a: &[&str], b: &[&str]) -> Vec<DiffLine> {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let same = |lines: &[&str]| -> Vec<DiffLine> {
        lines.iter().map(|l| DiffLine::Same(l.to_string())).collect()
    };
    let mut lines = same(&a[..prefix]);
    lines.extend(edit_script(
        &a[prefix..a.len() - suffix],
        &b[prefix..b.len() - suffix],
    ));
    lines.extend(same(&a[a.len() - suffix..]));
    lines
}

/// Shortest edit script between two line slices (Myers, 1986).
///
/// The trace keeps, for each depth `d`, only the diagonals `-d..=d` that the
/// backtrack reads.
fn edit_script(a: &[&str], b: &[&str]) -> Vec<DiffLine> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = n + m;
    let offset = max + 1;
    let mut v = vec![0isize; (2 * max + 3) as usize];
    let mut trace: Vec<Vec<isize>> = Vec::new();

    'search: for d in 0..=max {
        trace.push(v[(offset - d) as usize..=(offset + d) as usize].to_vec());
        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                break 'search;
            }
            k += 2;
        }
    }

    let mut lines = Vec::with_capacity((n + m) as usize);
    let (mut x, mut y) = (n, m);
    for (d, window) in trace.iter().enumerate().rev() {
        let d = d as isize;
        let (prev_x, prev_y) = if d == 0 {
            (0, 0)
        } else {
            let at = |k: isize| window[(k + d) as usize];
            let k = x - y;
            let prev_k = if k == -d || (k != d && at(k - 1) < at(k + 1)) {
                k + 1
            } else {
                k - 1
            };
            let prev_x = at(prev_k);
            (prev_x, prev_x - prev_k)
        };

        while x > prev_x && y > prev_y {
            lines.push(DiffLine::Same(a[(x - 1) as usize].to_string()));
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            if x == prev_x {
                lines.push(DiffLine::Added(b[(y - 1) as usize].to_string()));
                y -= 1;
            } else {
                lines.push(DiffLine::Removed(a[(x - 1) as usize].to_string()));
                x -= 1;
            }
        }
    }

    lines.reverse();
    lines
}

/// Fail with a readable error if `diff` shows residual differences.
pub fn ensure_identical(diff: &DumpDiff) -> MigrateResult<()> {
    if diff.is_empty() {
        Ok(())
    } else {
        Err(MigrationError::Lock(format!(
            "schemas differ:\n{}",
            diff.render()
        )))
    }
}
