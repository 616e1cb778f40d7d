//! `trek apply` command - Apply migrations to a running database.

use std::path::Path;

use trek_migrate::check::TESTDATA_DIR;
use trek_migrate::connection::quote_identifier;
use trek_migrate::history::DEFAULT_HISTORY_TABLE;
use trek_migrate::hooks::{APPLY_POST, APPLY_PRE, APPLY_RESET_POST, APPLY_RESET_PRE};
use trek_migrate::pipeline::replay;
use trek_migrate::shadow::{ADMIN_DATABASE, create_missing_roles};
use trek_migrate::{ApplyOutcome, ConnectionInfo, HookRunner, MigrationFileManager, SslMode};

use crate::cli::ApplyArgs;
use crate::commands;
use crate::config::{Config, MIGRATIONS_DIR};
use crate::error::{CliError, CliResult};
use crate::output::{self, success};

/// Run the apply command
pub async fn run(dir: &Path, args: ApplyArgs) -> CliResult<()> {
    output::header("Apply Migrations");

    let project_dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let config = Config::load(&project_dir)?;
    let admin = admin_connection(&args);
    let target = admin.with_database(&config.db_name);

    output::kv("Server", &admin.to_string());
    output::kv("Database", &config.db_name);
    output::newline();

    let hooks = HookRunner::new(&project_dir).with_connection(&admin);
    let total = if args.reset_db { 4 } else { 3 };
    let mut step = 0;
    let mut next = |text: &str| {
        step += 1;
        output::step(step, total, text);
    };

    if args.reset_db {
        next("Resetting database...");
        hooks.run(APPLY_RESET_PRE, &[]).await?;
        reset_database(&admin, &config.db_name).await?;
        hooks.run(APPLY_RESET_POST, &[]).await?;
    }

    next("Preparing database and roles...");
    prepare_database(&admin, &config).await?;

    next("Applying migrations...");
    hooks.run(APPLY_PRE, &[]).await?;
    let files = MigrationFileManager::new(project_dir.join(MIGRATIONS_DIR))
        .verify_sequence()
        .await?;
    let tools = commands::pg_tools(&config);
    let testdata_dir = project_dir.join(TESTDATA_DIR);
    let testdata = args
        .insert_test_data
        .then_some((testdata_dir.as_path(), &tools));
    let outcome = replay(&target, &files, DEFAULT_HISTORY_TABLE, testdata).await?;

    next("Running hooks...");
    hooks.run(APPLY_POST, &[]).await?;

    output::newline();
    match outcome {
        ApplyOutcome::NoChange { .. } => output::info(&outcome.summary()),
        ApplyOutcome::Applied { .. } => success(&outcome.summary()),
    }
    success("Successfully migrated database");
    Ok(())
}

/// Administrative connection described by the `PG*` variables.
fn admin_connection(args: &ApplyArgs) -> ConnectionInfo {
    ConnectionInfo {
        host: args.host.clone(),
        port: args.port,
        user: args.user.clone(),
        password: args.password.clone(),
        database: ADMIN_DATABASE.to_string(),
        ssl_mode: if args.disable_ssl {
            SslMode::Disable
        } else {
            SslMode::Require
        },
    }
}

async fn reset_database(admin: &ConnectionInfo, db_name: &str) -> CliResult<()> {
    let client = admin.connect().await?;
    client
        .batch_execute(&format!(
            "DROP DATABASE IF EXISTS {} WITH (FORCE)",
            quote_identifier(db_name)
        ))
        .await
        .map_err(|e| CliError::Command(format!("Failed to drop database: {}", e)))?;
    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS {}",
            quote_identifier(DEFAULT_HISTORY_TABLE)
        ))
        .await
        .map_err(|e| CliError::Command(format!("Failed to drop table: {}", e)))?;
    Ok(())
}

async fn prepare_database(admin: &ConnectionInfo, config: &Config) -> CliResult<()> {
    let client = admin.connect().await?;
    let exists = client
        .query_opt(
            "SELECT 1 FROM pg_database WHERE datname = $1",
            &[&config.db_name],
        )
        .await
        .map_err(trek_migrate::MigrationError::from)?
        .is_some();
    if !exists {
        client
            .batch_execute(&format!(
                "CREATE DATABASE {}",
                quote_identifier(&config.db_name)
            ))
            .await
            .map_err(|e| CliError::Command(format!("Failed to create database: {}", e)))?;
        output::list_item(&format!("Created database {}", config.db_name));
    }
    create_missing_roles(&client, &config.role_names()).await?;
    Ok(())
}
