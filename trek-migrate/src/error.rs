//! Error types for the migration generator.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Errors that can occur while generating, applying, or checking migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database operation error.
    #[error("Database error: {0}")]
    Database(String),

    /// The declarative model could not be exported or does not apply cleanly.
    #[error("Invalid model: {0}")]
    InvalidModel(String),

    /// A file in the migrations directory does not follow the naming grammar.
    #[error("Invalid migration file name '{name}': expected NNN_<name>.up.sql")]
    InvalidNaming {
        /// Offending file name.
        name: String,
    },

    /// A migration name supplied by the user does not follow the slug grammar.
    #[error(
        "Invalid migration name '{0}': use lowercase letters, digits and hyphens, starting and ending with a letter"
    )]
    InvalidName(String),

    /// Migration indices are not contiguous.
    #[error("Migration sequence is broken: {0}")]
    Sequence(String),

    /// The schema comparison failed.
    #[error("Diff generation failed: {0}")]
    DiffGeneration(String),

    /// A specific migration file failed to apply.
    #[error("Failed to apply migration '{}': {message}", file.display())]
    Apply {
        /// Path of the migration that failed.
        file: PathBuf,
        /// Underlying failure.
        message: String,
    },

    /// The bookkeeping table records a half-applied migration.
    #[error("Database is dirty at version {version}; fix it manually before applying migrations")]
    Dirty {
        /// Version recorded as dirty.
        version: i64,
    },

    /// Provisioning or teardown of an ephemeral database failed.
    #[error("Resource error: {0}")]
    Resource(String),

    /// An external tool failed or could not be started.
    #[error("{program} failed: {message}")]
    Tool {
        /// Executable name.
        program: String,
        /// Failure description (usually stderr).
        message: String,
    },

    /// A hook exited unsuccessfully.
    #[error("Hook '{name}' failed: {message}")]
    Hook {
        /// Hook name.
        name: String,
        /// Failure description.
        message: String,
    },

    /// Template rendering error.
    #[error("Template error: {0}")]
    Template(String),

    /// Lock artifact mismatch.
    #[error("Lock file mismatch: {0}")]
    Lock(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation was interrupted by a signal.
    #[error("Interrupted")]
    Interrupted,
}

impl MigrationError {
    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create an invalid model error.
    pub fn invalid_model(msg: impl Into<String>) -> Self {
        Self::InvalidModel(msg.into())
    }

    /// Create a naming error for a file in the migrations directory.
    pub fn invalid_naming(name: impl Into<String>) -> Self {
        Self::InvalidNaming { name: name.into() }
    }

    /// Create a diff generation error.
    pub fn diff(msg: impl Into<String>) -> Self {
        Self::DiffGeneration(msg.into())
    }

    /// Create an apply error for a migration file.
    pub fn apply(file: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Apply {
            file: file.into(),
            message: msg.into(),
        }
    }

    /// Create a resource error.
    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    /// Create an external tool error.
    pub fn tool(program: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Tool {
            program: program.into(),
            message: msg.into(),
        }
    }

    /// Create a hook error.
    pub fn hook(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Hook {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a template error.
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if the error comes from the declarative model.
    pub fn is_invalid_model(&self) -> bool {
        matches!(self, Self::InvalidModel(_))
    }

    /// Name of the pipeline stage responsible for this error.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::InvalidModel(_) => "model",
            Self::InvalidNaming { .. } | Self::InvalidName(_) | Self::Sequence(_) => "sequencer",
            Self::DiffGeneration(_) => "differ",
            Self::Apply { .. } | Self::Dirty { .. } => "applier",
            Self::Resource(_) => "provisioner",
            Self::Hook { .. } => "hooks",
            Self::Template(_) => "templates",
            Self::Lock(_) => "lock",
            Self::Config(_) => "config",
            Self::Io(_) | Self::Database(_) | Self::Tool { .. } | Self::Interrupted => "pipeline",
        }
    }
}

impl From<tokio_postgres::Error> for MigrationError {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => Self::Database(db.message().to_string()),
            None => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrationError::invalid_naming("1_init.sql");
        assert!(err.to_string().contains("1_init.sql"));
    }

    #[test]
    fn test_apply_error_names_file() {
        let err = MigrationError::apply("migrations/002_users.up.sql", "syntax error");
        let msg = err.to_string();
        assert!(msg.contains("002_users.up.sql"));
        assert!(msg.contains("syntax error"));
    }

    #[test]
    fn test_stage() {
        assert_eq!(MigrationError::invalid_model("x").stage(), "model");
        assert_eq!(MigrationError::diff("x").stage(), "differ");
        assert_eq!(MigrationError::Dirty { version: 3 }.stage(), "applier");
        assert!(MigrationError::invalid_model("x").is_invalid_model());
        assert!(!MigrationError::resource("x").is_invalid_model());
    }
}
