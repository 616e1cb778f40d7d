//! Declarative model export.
//!
//! A model is compiled to a flat SQL script by a [`SchemaMaterializer`].
//! Projects either keep a pgModeler `.dbm` file, compiled with `pgmodeler-cli`,
//! or a plain SQL file that is used as-is.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex_lite::Regex;
use tracing::debug;

use crate::error::{MigrateResult, MigrationError};
use crate::process;

/// PostgreSQL version passed to `pgmodeler-cli` when exporting SQL.
pub const PGMODELER_PGSQL_VERSION: &str = "18.0";

/// Format of a visual rendering of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderFormat {
    /// PNG image.
    Png,
    /// SVG image.
    Svg,
}

impl RenderFormat {
    /// File extension.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Svg => "svg",
        }
    }

    fn export_flag(&self) -> &'static str {
        match self {
            Self::Png => "--export-to-png",
            Self::Svg => "--export-to-svg",
        }
    }
}

/// Compiles a declarative model.
#[async_trait::async_trait]
pub trait SchemaMaterializer: Send + Sync {
    /// Produce the SQL script for the model.
    ///
    /// Fails with [`MigrationError::InvalidModel`] if the model cannot be
    /// compiled.
    async fn export_schema(&self, model: &Path) -> MigrateResult<String>;

    /// Write a visual rendering of the model to `output`.
    async fn export_rendering(
        &self,
        model: &Path,
        output: &Path,
        format: RenderFormat,
    ) -> MigrateResult<()>;

    /// Model file extension handled by this materializer.
    fn extension(&self) -> &'static str;
}

/// Materializer running `pgmodeler-cli`.
#[derive(Debug, Clone)]
pub struct PgModelerCli {
    program: PathBuf,
    pgsql_version: String,
}

impl Default for PgModelerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl PgModelerCli {
    /// Use `pgmodeler-cli` from `PATH`.
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("pgmodeler-cli"),
            pgsql_version: PGMODELER_PGSQL_VERSION.to_string(),
        }
    }

    /// Use a specific executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Target a different PostgreSQL version.
    pub fn with_pgsql_version(mut self, version: impl Into<String>) -> Self {
        self.pgsql_version = version.into();
        self
    }

    fn export_sql_args(&self, model: &Path, output: &Path) -> Vec<String> {
        vec![
            "--input".to_string(),
            model.display().to_string(),
            "--export-to-file".to_string(),
            "--output".to_string(),
            output.display().to_string(),
            "--pgsql-ver".to_string(),
            self.pgsql_version.clone(),
        ]
    }

    fn render_args(&self, model: &Path, output: &Path, format: RenderFormat) -> Vec<String> {
        vec![
            "--input".to_string(),
            model.display().to_string(),
            format.export_flag().to_string(),
            "--output".to_string(),
            output.display().to_string(),
        ]
    }
}

#[async_trait::async_trait]
impl SchemaMaterializer for PgModelerCli {
    async fn export_schema(&self, model: &Path) -> MigrateResult<String> {
        let output = tempfile::Builder::new()
            .prefix("trek-model-")
            .suffix(".sql")
            .tempfile()?;
        let args = self.export_sql_args(model, output.path());
        process::run(&mut process::command(&self.program, &args), &self.program)
            .await
            .map_err(|e| MigrationError::invalid_model(e.to_string()))?;

        let sql = tokio::fs::read_to_string(output.path()).await?;
        if sql.trim().is_empty() {
            return Err(MigrationError::invalid_model(format!(
                "{} exported no SQL",
                model.display()
            )));
        }
        debug!(model = %model.display(), bytes = sql.len(), "Exported model SQL");
        Ok(sql)
    }

    async fn export_rendering(
        &self,
        model: &Path,
        output: &Path,
        format: RenderFormat,
    ) -> MigrateResult<()> {
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        // pgmodeler-cli expects the output file to exist.
        tokio::fs::write(output, b"").await?;
        let args = self.render_args(model, output, format);
        process::run(&mut process::command(&self.program, &args), &self.program).await?;
        debug!(output = %output.display(), "Exported model rendering");
        Ok(())
    }

    fn extension(&self) -> &'static str {
        "dbm"
    }
}

/// Materializer for models written directly in SQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlFileMaterializer;

#[async_trait::async_trait]
impl SchemaMaterializer for SqlFileMaterializer {
    async fn export_schema(&self, model: &Path) -> MigrateResult<String> {
        let sql = tokio::fs::read_to_string(model).await.map_err(|e| {
            MigrationError::invalid_model(format!("failed to read {}: {}", model.display(), e))
        })?;
        if sql.trim().is_empty() {
            return Err(MigrationError::invalid_model(format!(
                "{} is empty",
                model.display()
            )));
        }
        Ok(sql)
    }

    async fn export_rendering(
        &self,
        model: &Path,
        _output: &Path,
        format: RenderFormat,
    ) -> MigrateResult<()> {
        Err(MigrationError::config(format!(
            "cannot render {} as {}: SQL models have no diagram",
            model.display(),
            format.extension()
        )))
    }

    fn extension(&self) -> &'static str {
        "sql"
    }
}

// Top-level elements start at column 0; nested references are indented.
static ELEMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^<(role|database)\b([^>]*)>").expect("valid regex"));

static ATTRIBUTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z][A-Za-z0-9\-]*)="([^"]*)""#).expect("valid regex"));

/// A role or database declared in a pgModeler model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelObject {
    /// Object name.
    pub name: String,
    /// Whether SQL generation is disabled for the object.
    pub sql_disabled: bool,
}

/// Roles and databases declared in a pgModeler model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelInfo {
    /// Declared roles.
    pub roles: Vec<ModelObject>,
    /// Declared databases.
    pub databases: Vec<ModelObject>,
}

impl ModelInfo {
    /// Extract roles and databases from `.dbm` XML.
    pub fn parse(xml: &str) -> Self {
        let mut info = Self::default();
        for element in ELEMENT_RE.captures_iter(xml) {
            let mut name = None;
            let mut sql_disabled = false;
            for attribute in ATTRIBUTE_RE.captures_iter(&element[2]) {
                match &attribute[1] {
                    "name" => name = Some(attribute[2].to_string()),
                    "sql-disabled" => sql_disabled = &attribute[2] == "true",
                    _ => {}
                }
            }
            let Some(name) = name else { continue };
            let object = ModelObject { name, sql_disabled };
            match &element[1] {
                "role" => info.roles.push(object),
                _ => info.databases.push(object),
            }
        }
        info
    }

    /// Check the model against the project configuration.
    ///
    /// The model must declare exactly one database called `db_name`, and its
    /// roles must match `roles` exactly with SQL generation disabled.
    pub fn validate(&self, db_name: &str, roles: &[String]) -> MigrateResult<()> {
        let mut problems = Vec::new();

        for role in &self.roles {
            if !roles.contains(&role.name) {
                problems.push(format!(
                    "role \"{}\" is defined in the model but not in the config",
                    role.name
                ));
            }
            if !role.sql_disabled {
                problems.push(format!(
                    "role \"{}\" is missing 'sql disabled' in the model",
                    role.name
                ));
            }
        }
        for role in roles {
            if !self.roles.iter().any(|r| &r.name == role) {
                problems.push(format!(
                    "role \"{}\" is defined in the config but not in the model",
                    role
                ));
            }
        }

        match self.databases.as_slice() {
            [] => problems.push("no database defined in the model".to_string()),
            [database] if database.name != db_name => problems.push(format!(
                "database in the model should be named \"{}\" but is named \"{}\"",
                db_name, database.name
            )),
            [_] => {}
            _ => problems.push("only one database is allowed in the model".to_string()),
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::invalid_model(problems.join("; ")))
        }
    }
}
