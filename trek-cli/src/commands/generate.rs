//! `trek generate` command - Generate a migration from the model.

use std::path::Path;

use trek_migrate::file::is_valid_migration_name;
use trek_migrate::pipeline::WATCH_INTERVAL;
use trek_migrate::{CycleOutcome, Generator, GeneratorConfig, MigrationFileManager, OutputTarget};

use crate::cli::GenerateArgs;
use crate::commands;
use crate::config::{Config, MIGRATIONS_DIR};
use crate::error::{CliError, CliResult};
use crate::output::{self, success};

/// Run the generate command
pub async fn run(dir: &Path, args: GenerateArgs) -> CliResult<()> {
    let name = validate_args(&args)?;

    let project_dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let config = Config::load(&project_dir)?;
    let migrations_dir = project_dir.join(MIGRATIONS_DIR);

    let target = match name {
        Some(name) if !args.stdout => {
            let manager = MigrationFileManager::new(&migrations_dir);
            let allocation = manager
                .allocate(name, args.overwrite, |path| {
                    output::confirm(&format!(
                        "{} already exists. Keep iterating on it instead of creating a new migration?",
                        path.display()
                    ))
                })
                .await?;
            OutputTarget::File {
                path: allocation.path,
                index: allocation.index,
            }
        }
        _ => {
            output::reserve_stdout_for_sql();
            OutputTarget::Stdout
        }
    };

    if let OutputTarget::File { path, index } = &target {
        output::header("Generate Migration");
        output::kv("Model", &config.model_path(&project_dir).display().to_string());
        output::kv("Migration", &path.display().to_string());
        output::kv("Index", &index.to_string());
        output::newline();
    }

    let generator_config = GeneratorConfig::new(&project_dir, config.model_path(&project_dir))
        .port(args.port)
        .roles(config.role_names())
        .templates(config.template_files())
        .exports(config.export_paths())
        .validate(!args.no_validate)
        .pg_tools(commands::pg_tools(&config));

    let mut generator = Generator::new(
        generator_config,
        commands::provisioner(&config),
        commands::materializer(&config),
        commands::differ(&config),
    );

    if !args.dev {
        let outcome = generator
            .run_cycle_until(&target, commands::interrupted())
            .await?;
        report(&outcome);
        return Ok(());
    }

    output::dim("Watching the model for changes, press Ctrl+C to stop");
    let result = generator
        .watch(&target, WATCH_INTERVAL, commands::interrupted())
        .await;

    if args.cleanup {
        if let Err(e) = generator.cleanup(&target).await {
            output::warn(&format!("Failed to remove generated migration: {}", e));
        }
    }

    result.map_err(CliError::from)
}

/// Check the migration name before anything else runs.
fn validate_args(args: &GenerateArgs) -> CliResult<Option<&str>> {
    match args.name.as_deref() {
        None if args.stdout => Ok(None),
        None => Err(CliError::Validation(
            "pass the name of the migration, or use --stdout".to_string(),
        )),
        Some(name) if !is_valid_migration_name(name) => Err(CliError::Validation(format!(
            "migration name \"{}\" must be lower-kebab-case and must not start or end with a number or dash",
            name
        ))),
        Some(name) => Ok(Some(name)),
    }
}

fn report(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Printed(sql) => output::raw(sql),
        CycleOutcome::Written {
            lock_updated: Some(true),
            ..
        } => {
            success(&outcome.summary());
            output::info("Updated diff.lock");
        }
        CycleOutcome::Written { .. } => success(&outcome.summary()),
        CycleOutcome::NoChanges { .. } | CycleOutcome::Unchanged => {
            output::info(&outcome.summary())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(name: Option<&str>, stdout: bool) -> GenerateArgs {
        GenerateArgs {
            name: name.map(String::from),
            stdout,
            dev: false,
            cleanup: true,
            overwrite: false,
            no_validate: false,
            port: 5433,
        }
    }

    #[test]
    fn test_name_required_without_stdout() {
        assert!(validate_args(&args(None, false)).is_err());
        assert_eq!(validate_args(&args(None, true)).unwrap(), None);
    }

    #[test]
    fn test_name_grammar() {
        assert_eq!(
            validate_args(&args(Some("add-users"), false)).unwrap(),
            Some("add-users")
        );
        for bad in ["Add-users", "add-users-", "1-add", "add_users", "a"] {
            let err = validate_args(&args(Some(bad), false)).unwrap_err();
            assert!(err.to_string().contains("lower-kebab-case"), "{}", bad);
        }
    }
}
