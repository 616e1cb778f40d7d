//! Project configuration (`trek.yaml`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex_lite::Regex;
use trek_migrate::TemplateFile;
use trek_migrate::pipeline::ExportPaths;

use crate::error::{CliError, CliResult};

/// Config file name (lives in project root)
pub const CONFIG_FILE_NAME: &str = "trek.yaml";

/// Migrations directory (relative to project root)
pub const MIGRATIONS_DIR: &str = "migrations";

/// Pattern every configured identifier must match
pub const IDENTIFIER_PATTERN: &str = "^[a-z_]+$";

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(IDENTIFIER_PATTERN).expect("valid regex"));

/// Whether `value` is a valid model, database or role name.
pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER_RE.is_match(value)
}

/// Trek project configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Model file name without extension
    pub model_name: String,

    /// Database the model describes
    pub db_name: String,

    /// Format of the model file
    #[serde(default)]
    pub model_format: ModelFormat,

    /// Schema differ implementation
    #[serde(default)]
    pub diff_backend: DiffBackend,

    /// How ephemeral databases are started
    #[serde(default)]
    pub provisioner: ProvisionerKind,

    /// PostgreSQL major version for the docker provisioner
    #[serde(default = "default_postgres_version")]
    pub postgres_version: String,

    /// Directory holding initdb, pg_ctl, pg_dump and psql
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pg_bin_dir: Option<PathBuf>,

    /// Path of the migra executable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migra_path: Option<PathBuf>,

    /// Path of the pgmodeler-cli executable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgmodeler_path: Option<PathBuf>,

    /// Roles created on every database
    #[serde(default)]
    pub roles: Vec<RoleConfig>,

    /// Files rendered with the latest migration version
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<TemplateConfig>,

    /// Artifacts exported from the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputConfig>,
}

fn default_postgres_version() -> String {
    "18".to_string()
}

/// Format of the declarative model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    /// pgModeler `.dbm` file
    #[default]
    Pgmodeler,
    /// Plain SQL file
    Sql,
}

impl ModelFormat {
    /// File extension of the model
    pub fn extension(&self) -> &'static str {
        match self {
            ModelFormat::Pgmodeler => "dbm",
            ModelFormat::Sql => "sql",
        }
    }
}

/// Schema differ implementation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffBackend {
    /// Built-in catalog differ
    #[default]
    Library,
    /// The migra executable
    External,
}

/// Ephemeral database provisioner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerKind {
    /// initdb/pg_ctl on this machine
    #[default]
    Local,
    /// A postgres container
    Docker,
}

/// A database role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Role name
    pub name: String,
}

/// A templated file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Output path, relative to the project root
    pub path: PathBuf,
    /// Template source, may use `{{ new_version }}`
    pub content: String,
}

/// An exported artifact; the path defaults to `<model_name>.gen.<ext>`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    /// Output path, relative to the project root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Exported artifacts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// SQL export of the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<OutputFile>,
    /// PNG rendering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub png: Option<OutputFile>,
    /// SVG rendering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub svg: Option<OutputFile>,
}

impl Config {
    /// Create a configuration with defaults for everything but the names
    pub fn new(model_name: impl Into<String>, db_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            db_name: db_name.into(),
            model_format: ModelFormat::default(),
            diff_backend: DiffBackend::default(),
            provisioner: ProvisionerKind::default(),
            postgres_version: default_postgres_version(),
            pg_bin_dir: None,
            migra_path: None,
            pgmodeler_path: None,
            roles: Vec::new(),
            templates: Vec::new(),
            output: None,
        }
    }

    /// Load and validate `trek.yaml` from `project_dir`
    pub fn load(project_dir: &Path) -> CliResult<Self> {
        let path = project_dir.join(CONFIG_FILE_NAME);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            CliError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> CliResult<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(CliError::Config(format!(
                "invalid values in {}:\n  {}",
                CONFIG_FILE_NAME,
                problems.join("\n  ")
            )));
        }
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> CliResult<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Every problem with the configured identifiers
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !is_valid_identifier(&self.model_name) {
            problems.push(format!(
                "Model name \"{}\" contains invalid characters. Must match \"{}\".",
                self.model_name, IDENTIFIER_PATTERN
            ));
        }
        if !is_valid_identifier(&self.db_name) {
            problems.push(format!(
                "Database name \"{}\" contains invalid characters. Must match \"{}\".",
                self.db_name, IDENTIFIER_PATTERN
            ));
        }
        for role in &self.roles {
            if !is_valid_identifier(&role.name) {
                problems.push(format!(
                    "Role \"{}\" contains invalid characters. Must match \"{}\".",
                    role.name, IDENTIFIER_PATTERN
                ));
            }
        }
        problems
    }

    /// Model file inside `project_dir`
    pub fn model_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(format!(
            "{}.{}",
            self.model_name,
            self.model_format.extension()
        ))
    }

    /// Configured role names
    pub fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.name.clone()).collect()
    }

    /// Templated files
    pub fn template_files(&self) -> Vec<TemplateFile> {
        self.templates
            .iter()
            .map(|t| TemplateFile::new(&t.path, &t.content))
            .collect()
    }

    /// Exported artifact paths, relative to the project root
    pub fn export_paths(&self) -> ExportPaths {
        let Some(output) = &self.output else {
            return ExportPaths::default();
        };
        let resolve = |file: &Option<OutputFile>, ext: &str| {
            file.as_ref().map(|f| {
                f.path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(format!("{}.gen.{}", self.model_name, ext)))
            })
        };
        ExportPaths {
            sql: resolve(&output.sql, "sql"),
            png: resolve(&output.png, "png"),
            svg: resolve(&output.svg, "svg"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FULL: &str = r#"
model_name: app
db_name: app_db
model_format: sql
diff_backend: external
provisioner: docker
postgres_version: "17"
roles:
  - name: app_user
  - name: reader
templates:
  - path: src/schema_version.txt
    content: "{{ new_version }}"
output:
  sql: { path: build/app.sql }
  png: {}
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(FULL).unwrap();
        assert_eq!(config.model_name, "app");
        assert_eq!(config.db_name, "app_db");
        assert_eq!(config.model_format, ModelFormat::Sql);
        assert_eq!(config.diff_backend, DiffBackend::External);
        assert_eq!(config.provisioner, ProvisionerKind::Docker);
        assert_eq!(config.postgres_version, "17");
        assert_eq!(config.role_names(), vec!["app_user", "reader"]);
        assert_eq!(config.template_files().len(), 1);
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse("model_name: app\ndb_name: app\n").unwrap();
        assert_eq!(config.model_format, ModelFormat::Pgmodeler);
        assert_eq!(config.diff_backend, DiffBackend::Library);
        assert_eq!(config.provisioner, ProvisionerKind::Local);
        assert_eq!(config.postgres_version, "18");
        assert!(config.roles.is_empty());
        assert_eq!(config.export_paths(), ExportPaths::default());
        assert_eq!(
            config.model_path(Path::new("/project")),
            PathBuf::from("/project/app.dbm")
        );
    }

    #[test]
    fn test_export_paths() {
        let config = Config::parse(FULL).unwrap();
        assert_eq!(
            config.export_paths(),
            ExportPaths {
                sql: Some(PathBuf::from("build/app.sql")),
                png: Some(PathBuf::from("app.gen.png")),
                svg: None,
            }
        );
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let err = Config::parse("model_name: App\ndb_name: app-db\nroles:\n  - name: ok\n  - name: Bad\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("Model name \"App\""));
        assert!(err.contains("Database name \"app-db\""));
        assert!(err.contains("Role \"Bad\""));
        assert!(!err.contains("Role \"ok\""));
    }

    #[test]
    fn test_identifiers() {
        assert!(is_valid_identifier("app_user"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("app1"));
        assert!(!is_valid_identifier("App"));
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = Config::new("app", "app");
        config.roles.push(RoleConfig {
            name: "app_user".to_string(),
        });
        config.save(&path).unwrap();
        assert_eq!(Config::load(dir.path()).unwrap(), config);
    }
}
