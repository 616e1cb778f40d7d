//! CLI error types and result alias.

use miette::Diagnostic;
use thiserror::Error;
use trek_migrate::MigrationError;

/// Result type alias for CLI operations
pub type CliResult<T> = Result<T, CliError>;

/// CLI error types
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// IO error
    #[error("IO error: {0}")]
    #[diagnostic(code(trek::io))]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    #[diagnostic(code(trek::config))]
    Config(String),

    /// Invalid command-line input
    #[error("Validation error: {0}")]
    #[diagnostic(code(trek::validation))]
    Validation(String),

    /// Migration pipeline error
    #[error(transparent)]
    #[diagnostic(code(trek::migration))]
    Migration(#[from] MigrationError),

    /// Command error
    #[error("Command error: {0}")]
    #[diagnostic(code(trek::command))]
    Command(String),
}

impl From<serde_yaml::Error> for CliError {
    fn from(err: serde_yaml::Error) -> Self {
        CliError::Config(format!("Failed to parse YAML: {}", err))
    }
}

impl CliError {
    /// Process exit status for this error; 130 after Ctrl+C.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Migration(MigrationError::Interrupted) => 130,
            _ => 1,
        }
    }
}
