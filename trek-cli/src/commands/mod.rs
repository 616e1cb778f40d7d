//! CLI command implementations.

pub mod apply;
pub mod check;
pub mod generate;
pub mod init;
pub mod version;

use std::future::Future;
use std::sync::Arc;

use trek_migrate::{
    CatalogDiffer, DatabaseProvisioner, DiffOptions, DockerProvisioner, LocalClusterProvisioner,
    MigraDiffer, PgModelerCli, PgTools, SchemaDiffer, SchemaMaterializer, SqlFileMaterializer,
};

use crate::config::{Config, DiffBackend, ModelFormat, ProvisionerKind};

/// Completes on the first Ctrl+C.
///
/// The signal is awaited on a spawned task, so the handler is in place while
/// the returned future is not being polled, e.g. during provisioning.
pub(crate) fn interrupted() -> impl Future<Output = ()> + Send + 'static {
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(());
        }
    });
    async move {
        if rx.await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// PostgreSQL client tools from the configured bin directory
pub(crate) fn pg_tools(config: &Config) -> PgTools {
    PgTools::new().with_bin_dir(config.pg_bin_dir.clone())
}

/// Provisioner selected by the configuration
pub(crate) fn provisioner(config: &Config) -> Arc<dyn DatabaseProvisioner> {
    match config.provisioner {
        ProvisionerKind::Local => {
            let provisioner = LocalClusterProvisioner::new();
            match &config.pg_bin_dir {
                Some(dir) => Arc::new(provisioner.with_bin_dir(dir)),
                None => Arc::new(provisioner),
            }
        }
        ProvisionerKind::Docker => Arc::new(DockerProvisioner::new(&config.postgres_version)),
    }
}

/// Materializer for the configured model format
pub(crate) fn materializer(config: &Config) -> Arc<dyn SchemaMaterializer> {
    match config.model_format {
        ModelFormat::Pgmodeler => {
            let cli = PgModelerCli::new()
                .with_pgsql_version(format!("{}.0", config.postgres_version));
            match &config.pgmodeler_path {
                Some(path) => Arc::new(cli.with_program(path)),
                None => Arc::new(cli),
            }
        }
        ModelFormat::Sql => Arc::new(SqlFileMaterializer),
    }
}

/// Differ selected by the configuration
pub(crate) fn differ(config: &Config) -> Arc<dyn SchemaDiffer> {
    let options = DiffOptions::new();
    match config.diff_backend {
        DiffBackend::Library => Arc::new(CatalogDiffer::new(options).with_tools(pg_tools(config))),
        DiffBackend::External => {
            let migra = MigraDiffer::new(options);
            match &config.migra_path {
                Some(path) => Arc::new(migra.with_program(path)),
                None => Arc::new(migra),
            }
        }
    }
}
