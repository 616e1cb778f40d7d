//! `trek init` command - Create a new trek project.

use std::path::Path;

use trek_migrate::check::TESTDATA_DIR;
use trek_migrate::hooks::{APPLY_RESET_POST, APPLY_RESET_PRE, GENERATE_MIGRATION_POST, HOOKS_DIR};

use crate::cli::{InitArgs, ModelFormatArg};
use crate::config::{
    CONFIG_FILE_NAME, Config, IDENTIFIER_PATTERN, MIGRATIONS_DIR, ModelFormat, RoleConfig,
    is_valid_identifier,
};
use crate::error::{CliError, CliResult};
use crate::output::{self, confirm, input, success};

/// Model name used when none is given
const DEFAULT_MODEL_NAME: &str = "app";

/// Run the init command
pub async fn run(dir: &Path, args: InitArgs) -> CliResult<()> {
    output::header("Initialize Trek Project");

    std::fs::create_dir_all(dir)?;
    let project_path = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());

    let config_path = project_path.join(CONFIG_FILE_NAME);
    if config_path.exists() {
        output::warn(&format!(
            "Project already initialized. {} exists.",
            CONFIG_FILE_NAME
        ));

        if !args.yes && !confirm("Reinitialize project?") {
            return Ok(());
        }
    }

    if !args.yes {
        output::dim(&format!(
            "Names may only contain a-z and _ ({})",
            IDENTIFIER_PATTERN
        ));
    }

    let model_name = resolve_identifier(
        args.model_name,
        "Model name",
        DEFAULT_MODEL_NAME,
        args.yes,
    )?;
    let database_name =
        resolve_identifier(args.database_name, "Database name", &model_name, args.yes)?;
    let roles = resolve_roles(args.roles, args.yes)?;

    let mut config = Config::new(&model_name, &database_name);
    config.model_format = match args.format {
        ModelFormatArg::Pgmodeler => ModelFormat::Pgmodeler,
        ModelFormatArg::Sql => ModelFormat::Sql,
    };
    config.roles = roles
        .iter()
        .map(|name| RoleConfig { name: name.clone() })
        .collect();

    output::newline();
    output::step(1, 4, "Creating project structure...");
    create_project_structure(&project_path)?;

    output::step(2, 4, "Creating configuration file...");
    config.save(&config_path)?;

    output::step(3, 4, "Creating model file...");
    let model_path = config.model_path(&project_path);
    if !model_path.exists() {
        let model = match config.model_format {
            ModelFormat::Pgmodeler => starter_dbm(&database_name, &roles),
            ModelFormat::Sql => starter_sql(&database_name),
        };
        std::fs::write(&model_path, model)?;
    }

    output::step(4, 4, "Creating sample hooks...");
    write_sample_hooks(&project_path)?;

    output::newline();
    success("Project initialized successfully!");
    output::newline();

    output::section("Next steps");
    output::list_item(&format!(
        "Edit {} to define your schema",
        model_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    ));
    output::list_item("Run `trek generate init` to create the first migration");
    output::list_item("Run `trek check` in CI");
    output::newline();

    output::section("Created files");
    output::kv(CONFIG_FILE_NAME, "Trek configuration");
    output::kv(&format!("{}/", MIGRATIONS_DIR), "Migration files");
    output::kv(&format!("{}/", HOOKS_DIR), "Hook scripts");
    output::kv(&format!("{}/", TESTDATA_DIR), "Test data loaded by check");

    Ok(())
}

/// Take `given`, or ask for a value, falling back to `default`.
fn resolve_identifier(
    given: Option<String>,
    label: &str,
    default: &str,
    yes: bool,
) -> CliResult<String> {
    if let Some(value) = given {
        if !is_valid_identifier(&value) {
            return Err(CliError::Validation(format!(
                "{} \"{}\" must match \"{}\"",
                label, value, IDENTIFIER_PATTERN
            )));
        }
        return Ok(value);
    }
    if yes {
        return Ok(default.to_string());
    }
    loop {
        let value = input(&format!("{} [{}]", label, default)).unwrap_or_else(|| default.to_string());
        if is_valid_identifier(&value) {
            return Ok(value);
        }
        output::warn(&format!("\"{}\" must match \"{}\"", value, IDENTIFIER_PATTERN));
    }
}

fn resolve_roles(given: Vec<String>, yes: bool) -> CliResult<Vec<String>> {
    let roles = if given.is_empty() && !yes {
        input("Database roles (comma separated)")
            .map(|line| line.split(',').map(|r| r.trim().to_string()).collect())
            .unwrap_or_default()
    } else {
        given
    };
    let invalid: Vec<&String> = roles.iter().filter(|r| !is_valid_identifier(r)).collect();
    if !invalid.is_empty() {
        return Err(CliError::Validation(format!(
            "invalid role names {:?}, must match \"{}\"",
            invalid, IDENTIFIER_PATTERN
        )));
    }
    Ok(roles)
}

/// Create the project directory structure
fn create_project_structure(path: &Path) -> CliResult<()> {
    for dir in [MIGRATIONS_DIR, TESTDATA_DIR, HOOKS_DIR] {
        std::fs::create_dir_all(path.join(dir))?;
    }
    let testdata = path.join(TESTDATA_DIR).join("001_0101-content.sql");
    if !testdata.exists() {
        std::fs::write(testdata, "")?;
    }
    Ok(())
}

fn write_sample_hooks(path: &Path) -> CliResult<()> {
    let hooks: [(&str, &[&str]); 3] = [
        (APPLY_RESET_PRE, &[]),
        (APPLY_RESET_POST, &[]),
        (GENERATE_MIGRATION_POST, &["echo \"Running on migration file $1\""]),
    ];
    for (name, extra) in hooks {
        let mut lines = vec![
            "#!/bin/bash".to_string(),
            "set -euxo pipefail".to_string(),
            String::new(),
            format!("echo \"This is {}\"", name),
        ];
        lines.extend(extra.iter().map(|line| line.to_string()));
        lines.push(String::new());

        let sample = path.join(HOOKS_DIR).join(format!("{}.sample", name));
        std::fs::write(&sample, lines.join("\n"))?;
        make_executable(&sample)?;
    }
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> CliResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> CliResult<()> {
    Ok(())
}

fn starter_dbm(database_name: &str, roles: &[String]) -> String {
    let mut model = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <dbmodel pgmodeler-ver=\"1.2.0\" use-changelog=\"false\" default-owner=\"postgres\">\n",
    );
    for role in roles {
        model.push_str(&format!(
            "<role name=\"{}\" login=\"true\" sql-disabled=\"true\">\n</role>\n\n",
            role
        ));
    }
    model.push_str(&format!(
        "<database name=\"{}\" is-template=\"false\" allow-conns=\"true\">\n</database>\n\n",
        database_name
    ));
    model.push_str(
        "<schema name=\"public\" layers=\"0\" fill-color=\"#e1e1e1\" sql-disabled=\"true\">\n</schema>\n\n",
    );
    model.push_str("</dbmodel>\n");
    model
}

fn starter_sql(database_name: &str) -> String {
    format!(
        "-- Declarative model of the {} database.\n-- Edit this file and run `trek generate <name>`.\n",
        database_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use trek_migrate::ModelInfo;

    #[test]
    fn test_starter_dbm_passes_model_checks() {
        let roles = vec!["app_user".to_string()];
        let model = starter_dbm("app", &roles);
        ModelInfo::parse(&model).validate("app", &roles).unwrap();
    }

    #[test]
    fn test_resolve_identifier() {
        assert_eq!(
            resolve_identifier(None, "Model name", "app", true).unwrap(),
            "app"
        );
        assert_eq!(
            resolve_identifier(Some("shop".to_string()), "Model name", "app", true).unwrap(),
            "shop"
        );
        assert!(resolve_identifier(Some("Shop".to_string()), "Model name", "app", true).is_err());
    }

    #[test]
    fn test_resolve_roles_rejects_invalid_names() {
        assert!(resolve_roles(vec!["app-user".to_string()], true).is_err());
        assert_eq!(resolve_roles(Vec::new(), true).unwrap(), Vec::<String>::new());
    }
}
