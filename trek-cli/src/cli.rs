//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Trek - forward-only PostgreSQL migrations from a declarative model
#[derive(Parser, Debug)]
#[command(name = "trek")]
#[command(author = "Pegasus Heavy Industries LLC")]
#[command(version)]
#[command(
    about = "Trek - forward-only PostgreSQL migrations from a declarative model",
    long_about = None
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Project directory containing trek.yaml
    #[arg(short = 'C', long, global = true, env = "TREK_DIRECTORY", default_value = ".")]
    pub directory: PathBuf,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a new trek project
    Init(InitArgs),

    /// Generate a migration from the model
    Generate(GenerateArgs),

    /// Apply the migrations to a running database
    Apply(ApplyArgs),

    /// Validate migrations, templates and the lock file
    Check(CheckArgs),

    /// Display version information
    Version,
}

// =============================================================================
// Init Command
// =============================================================================

/// Arguments for the `init` command
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Model (file) name
    #[arg(long)]
    pub model_name: Option<String>,

    /// Database name
    #[arg(long)]
    pub database_name: Option<String>,

    /// Database roles (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub roles: Vec<String>,

    /// Model format
    #[arg(long, default_value = "pgmodeler")]
    pub format: ModelFormatArg,

    /// Accept defaults without prompting
    #[arg(short, long)]
    pub yes: bool,
}

/// Model formats offered by `init`
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ModelFormatArg {
    /// pgModeler `.dbm` model
    #[default]
    Pgmodeler,
    /// Plain SQL model
    Sql,
}

// =============================================================================
// Generate Command
// =============================================================================

/// Arguments for the `generate` command
#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Name of the migration, in lower-kebab-case
    pub name: Option<String>,

    /// Print the migration instead of writing a file
    #[arg(long, env = "TREK_STDOUT")]
    pub stdout: bool,

    /// Watch the model and regenerate the migration on every change
    #[arg(long, env = "TREK_DEV")]
    pub dev: bool,

    /// Remove the generated migration when dev mode ends
    #[arg(
        long,
        env = "TREK_CLEANUP",
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set
    )]
    pub cleanup: bool,

    /// Reuse the index of the latest migration with the same name without asking
    #[arg(long, env = "TREK_OVERWRITE")]
    pub overwrite: bool,

    /// Skip the lock file and drift validation after writing
    #[arg(long, env = "TREK_NO_VALIDATE")]
    pub no_validate: bool,

    /// Port for the ephemeral database
    #[arg(long, env = "TREK_PORT", default_value_t = trek_migrate::pipeline::DEFAULT_GENERATE_PORT)]
    pub port: u16,
}

// =============================================================================
// Apply Command
// =============================================================================

/// Arguments for the `apply` command
#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Database host
    #[arg(long, env = "PGHOST", default_value = "localhost")]
    pub host: String,

    /// Database port
    #[arg(long, env = "PGPORT", default_value_t = 5432)]
    pub port: u16,

    /// Database user
    #[arg(long, env = "PGUSER", default_value = "postgres")]
    pub user: String,

    /// Database password
    #[arg(long, env = "PGPASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Drop and recreate the database before applying
    #[arg(long, env = "RESET_DB")]
    pub reset_db: bool,

    /// Load testdata files after each migration
    #[arg(long, env = "INSERT_TEST_DATA")]
    pub insert_test_data: bool,

    /// Connect without SSL
    #[arg(long, env = "DISABLE_SSL")]
    pub disable_ssl: bool,
}

// =============================================================================
// Check Command
// =============================================================================

/// Arguments for the `check` command
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Port for the ephemeral database
    #[arg(long, env = "TREK_CHECK_PORT", default_value_t = trek_migrate::pipeline::DEFAULT_CHECK_PORT)]
    pub port: u16,

    /// Skip the lock file comparison
    #[arg(long)]
    pub no_lock: bool,
}
