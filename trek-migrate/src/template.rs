//! Templated project files.
//!
//! Projects can keep files in sync with the latest migration version, for
//! example a constant the application compares against the database. Each
//! template is rendered with the variable `new_version`.

use std::path::{Path, PathBuf};

use minijinja::{Environment, context};
use tracing::debug;

use crate::error::{MigrateResult, MigrationError};

/// A file rendered from a template after every generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateFile {
    /// Output path, relative to the project root.
    pub path: PathBuf,
    /// Template source.
    pub content: String,
}

impl TemplateFile {
    /// Create a template file definition.
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Render the template for `version`.
    pub fn render(&self, version: u32) -> MigrateResult<String> {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.render_str(&self.content, context! { new_version => version })
            .map_err(|e| {
                MigrationError::template(format!("{}: {}", self.path.display(), e))
            })
    }

    fn resolve(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.path)
    }

    /// Render and write the file below `project_dir`.
    pub async fn write(&self, project_dir: &Path, version: u32) -> MigrateResult<()> {
        let rendered = self.render(version)?;
        let path = self.resolve(project_dir);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, rendered).await?;
        debug!(path = %path.display(), version, "Wrote templated file");
        Ok(())
    }

    /// Fail unless the file below `project_dir` matches the rendering for
    /// `version`.
    pub async fn check(&self, project_dir: &Path, version: u32) -> MigrateResult<()> {
        let path = self.resolve(project_dir);
        let written = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MigrationError::template(format!(
                    "templated file {} does not exist",
                    self.path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        if written != self.render(version)? {
            return Err(MigrationError::template(format!(
                "templated file {} is not up to date",
                self.path.display()
            )));
        }
        Ok(())
    }
}

/// Write every template for `version`.
pub async fn write_all(
    templates: &[TemplateFile],
    project_dir: &Path,
    version: u32,
) -> MigrateResult<()> {
    for template in templates {
        template.write(project_dir, version).await?;
    }
    Ok(())
}

/// Check every template against `version`.
pub async fn check_all(
    templates: &[TemplateFile],
    project_dir: &Path,
    version: u32,
) -> MigrateResult<()> {
    for template in templates {
        template.check(project_dir, version).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_render_version() {
        let template = TemplateFile::new("version.go", "package db\n\nconst Version = {{ new_version }}\n");
        assert_eq!(
            template.render(7).unwrap(),
            "package db\n\nconst Version = 7\n"
        );
    }

    #[test]
    fn test_render_syntax_error() {
        let template = TemplateFile::new("broken.txt", "{{ new_version ");
        let err = template.render(1).unwrap_err();
        assert!(matches!(err, MigrationError::Template(_)));
        assert!(err.to_string().contains("broken.txt"));
    }

    #[tokio::test]
    async fn test_write_then_check() {
        let dir = TempDir::new().unwrap();
        let templates = vec![TemplateFile::new("src/generated/version.txt", "{{ new_version }}")];

        write_all(&templates, dir.path(), 3).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/generated/version.txt")).unwrap(),
            "3"
        );
        check_all(&templates, dir.path(), 3).await.unwrap();

        let err = check_all(&templates, dir.path(), 4).await.unwrap_err();
        assert!(err.to_string().contains("not up to date"));
    }

    #[tokio::test]
    async fn test_check_missing_file() {
        let dir = TempDir::new().unwrap();
        let template = TemplateFile::new("missing.txt", "{{ new_version }}");
        let err = template.check(dir.path(), 1).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
