//! `trek check` command - Validate a project.

use std::path::Path;

use trek_migrate::{CheckConfig, ProjectChecker};

use crate::cli::CheckArgs;
use crate::commands;
use crate::config::{Config, MIGRATIONS_DIR};
use crate::error::CliResult;
use crate::output::{self, success};

/// Run the check command
pub async fn run(dir: &Path, args: CheckArgs) -> CliResult<()> {
    output::header("Check Project");

    let project_dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let config = Config::load(&project_dir)?;

    let mut check_config = CheckConfig::new(
        &project_dir,
        config.model_path(&project_dir),
        config.db_name.clone(),
    )
    .port(args.port)
    .roles(config.role_names())
    .templates(config.template_files())
    .verify_lock(!args.no_lock)
    .pg_tools(commands::pg_tools(&config));
    check_config.migrations_dir = project_dir.join(MIGRATIONS_DIR);

    let checker = ProjectChecker::new(
        check_config,
        commands::provisioner(&config),
        commands::materializer(&config),
    );
    let report = checker.run_until(commands::interrupted()).await?;

    output::kv("Migrations", &report.migrations.to_string());
    output::kv("Templates", &report.templates.to_string());
    output::kv(
        "Lock file",
        if report.lock_verified {
            "verified"
        } else {
            "skipped"
        },
    );
    output::newline();
    success("All checks passed");
    Ok(())
}
