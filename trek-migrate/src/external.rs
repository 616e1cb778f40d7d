//! Differ backed by the `migra` executable.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex_lite::Regex;
use tracing::debug;

use crate::connection::ConnectionInfo;
use crate::diff::{DiffOptions, Plan, SchemaDiffer, Statement};
use crate::error::MigrateResult;
use crate::process;
use crate::shadow::ScratchDatabaseFactory;

/// Exit code `migra` uses when differences were found.
const DIFFERENCES_FOUND: i32 = 2;

/// Runs `migra --unsafe --with-privileges <from> <to>`.
#[derive(Debug, Clone)]
pub struct MigraDiffer {
    program: PathBuf,
    options: DiffOptions,
}

impl Default for MigraDiffer {
    fn default() -> Self {
        Self::new(DiffOptions::default())
    }
}

impl MigraDiffer {
    /// Use `migra` from `PATH`.
    pub fn new(options: DiffOptions) -> Self {
        Self {
            program: PathBuf::from("migra"),
            options,
        }
    }

    /// Use a specific executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Executable that will be run.
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

/// Split `migra` output into statements.
pub fn parse_output(output: &str) -> Plan {
    Plan::new(
        split_statements(output)
            .into_iter()
            .map(Statement::new)
            .collect(),
    )
}

static DOLLAR_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$(?:[A-Za-z_][A-Za-z0-9_]*)?\$").expect("valid regex"));

/// Split SQL text at top-level semicolons.
///
/// Semicolons inside quoted literals, identifiers, comments and dollar-quoted
/// bodies do not end a statement. Pieces are trimmed and empty ones dropped.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b';' => {
                pieces.push(&sql[start..i]);
                i += 1;
                start = i;
            }
            b'\'' => {
                let escapes = i > 0 && matches!(bytes[i - 1], b'E' | b'e');
                i = skip_quoted(bytes, i + 1, b'\'', escapes);
            }
            b'"' => i = skip_quoted(bytes, i + 1, b'"', false),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = sql[i..].find('\n').map_or(bytes.len(), |p| i + p + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = sql[i + 2..].find("*/").map_or(bytes.len(), |p| i + p + 4);
            }
            b'$' if i == 0 || !is_identifier_byte(bytes[i - 1]) => {
                match DOLLAR_TAG_RE.find(&sql[i..]) {
                    Some(tag) => {
                        let tag = tag.as_str();
                        let body = i + tag.len();
                        i = sql[body..]
                            .find(tag)
                            .map_or(bytes.len(), |p| body + p + tag.len());
                    }
                    None => i += 1,
                }
            }
            _ => i += 1,
        }
    }
    pieces.push(&sql[start..]);
    pieces
        .into_iter()
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect()
}

/// Index just past the closing `quote`, or the end of input.
fn skip_quoted(bytes: &[u8], mut i: usize, quote: u8, escapes: bool) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if escapes => i += 2,
            b if b == quote && bytes.get(i + 1) == Some(&quote) => i += 2,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn is_identifier_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

#[async_trait::async_trait]
impl SchemaDiffer for MigraDiffer {
    async fn diff(
        &self,
        current: &ConnectionInfo,
        desired: &ConnectionInfo,
        _scratch: &ScratchDatabaseFactory,
    ) -> MigrateResult<Plan> {
        let from = current.dsn();
        let to = desired.dsn();
        let mut cmd = process::command(
            &self.program,
            ["--unsafe", "--with-privileges", from.as_str(), to.as_str()],
        );
        let output = process::output(&mut cmd, &self.program).await?;

        match output.status.code() {
            Some(0) | Some(DIFFERENCES_FOUND) => {}
            _ => return Err(process::failure(&self.program, &output)),
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let plan = parse_output(&stdout).without_bookkeeping(&self.options.bookkeeping_table);
        debug!(statements = plan.len(), "migra finished");
        Ok(plan)
    }

    fn name(&self) -> &'static str {
        "external"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DEFAULT_TIMEOUT;
    use crate::history::DEFAULT_HISTORY_TABLE;
    use pretty_assertions::assert_eq;

    const OUTPUT: &str = "\
alter table \"public\".\"schema_migrations\" drop constraint \"schema_migrations_pkey\";

drop index if exists \"public\".\"schema_migrations_pkey\";

drop table \"public\".\"schema_migrations\";

alter table \"public\".\"users\" add column \"email\" text;

create or replace function public.touch()
 returns trigger
 language plpgsql
as $function$
begin
  new.updated_at = now();
  return new;
end;
$function$
;

";

    #[test]
    fn test_parse_output_splits_on_semicolons() {
        let plan = parse_output(OUTPUT);
        assert_eq!(plan.len(), 5);
        assert!(plan.statements[4].ddl.starts_with("create or replace function"));
        assert!(plan.statements[4].ddl.ends_with("$function$"));
        assert!(plan.statements.iter().all(|s| s.statement_timeout == DEFAULT_TIMEOUT));
    }

    #[test]
    fn test_function_body_with_blank_lines_stays_whole() {
        let output = "\
create or replace function public.touch()
 returns trigger
 language plpgsql
as $function$
begin
  NEW.updated_at = now();

  RETURN NEW;
end;
$function$
;

alter table \"public\".\"users\" add column \"updated_at\" timestamptz;
";
        let plan = parse_output(output);
        assert_eq!(plan.len(), 2);
        let function = &plan.statements[0].ddl;
        assert!(function.contains("NEW.updated_at = now();\n\n  RETURN NEW;"));
        assert!(function.ends_with("$function$"));
        assert!(plan.render().contains("end;\n$function$;\n"));
    }

    #[test]
    fn test_statements_without_blank_lines_are_separated() {
        let plan = parse_output(
            "alter table \"public\".\"users\" add column \"a\" text;\nalter table \"public\".\"users\" add column \"b\" text;\n",
        );
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.statements[1].ddl, "alter table \"public\".\"users\" add column \"b\" text");
    }

    #[test]
    fn test_split_ignores_quoted_and_commented_semicolons() {
        let sql = "\
comment on table users is 'one; two';
-- not; a statement
create table \"odd;name\" (id int);
/* block; comment */ select E'it\\'s; fine';
do $$ begin perform 1; end $$;
select $tag$ a; $$ b; $tag$";
        assert_eq!(
            split_statements(sql),
            vec![
                "comment on table users is 'one; two'",
                "-- not; a statement\ncreate table \"odd;name\" (id int)",
                "/* block; comment */ select E'it\\'s; fine'",
                "do $$ begin perform 1; end $$",
                "select $tag$ a; $$ b; $tag$",
            ]
        );
    }

    #[test]
    fn test_positional_parameters_are_not_dollar_quotes() {
        assert_eq!(
            split_statements("prepare q as select $1; select a$b$c from t;"),
            vec!["prepare q as select $1", "select a$b$c from t"]
        );
    }

    #[test]
    fn test_bookkeeping_statements_removed() {
        let plan = parse_output(OUTPUT).without_bookkeeping(DEFAULT_HISTORY_TABLE);
        let ddl: Vec<&str> = plan.statements.iter().map(|s| s.ddl.as_str()).collect();
        assert_eq!(ddl[0], "alter table \"public\".\"users\" add column \"email\" text");
        assert_eq!(ddl.len(), 2);
    }

    #[test]
    fn test_empty_output() {
        assert!(parse_output("\n\n").is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_two_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("migra");
        std::fs::write(
            &script,
            "#!/bin/sh\necho 'alter table \"public\".\"users\" add column \"email\" text;'\nexit 2\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let differ = MigraDiffer::default().with_program(&script);
        let info = ConnectionInfo::local(5433, "migrate");
        let scratch = ScratchDatabaseFactory::new(ConnectionInfo::local(5433, "postgres"));
        let plan = differ
            .diff(&info, &info.with_database("target"), &scratch)
            .await
            .unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_other_exit_codes_fail() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("migra");
        std::fs::write(&script, "#!/bin/sh\necho 'connection refused' >&2\nexit 1\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let differ = MigraDiffer::default().with_program(&script);
        let info = ConnectionInfo::local(5433, "migrate");
        let scratch = ScratchDatabaseFactory::new(ConnectionInfo::local(5433, "postgres"));
        let err = differ
            .diff(&info, &info.with_database("target"), &scratch)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }
}
