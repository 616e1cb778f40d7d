//! # trek-migrate
//!
//! Migration generation engine for trek.
//!
//! This crate provides functionality for:
//! - Compiling a declarative model (pgModeler or plain SQL) into SQL
//! - Running throwaway PostgreSQL servers for every generation cycle
//! - Diffing a database built from the migration history against the model
//! - Recovering permission changes the differ leaves out
//! - Forward-only, contiguously numbered migration files
//! - Applying migrations with golang-migrate compatible bookkeeping
//! - Validating a whole project in CI
//!
//! ## Architecture
//!
//! Each generation cycle compares two databases on the same ephemeral
//! server: `migrate` holds the replayed history, `target` holds the model.
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌─────────────┐
//! │ Model (.dbm) │────▶│ Materializer   │────▶│ target db   │──┐
//! └──────────────┘     └────────────────┘     └─────────────┘  │
//!                                                              ▼
//! ┌──────────────┐     ┌────────────────┐     ┌─────────────┐  ┌──────────┐
//! │ migrations/  │────▶│ Engine replay  │────▶│ migrate db  │─▶│ Differ   │
//! └──────────────┘     └────────────────┘     └─────────────┘  └──────────┘
//!        ▲                                                          │
//!        │             ┌────────────────┐     ┌─────────────┐       │
//!        └─────────────│ NNN_name.up.sql│◀────│ Reconciler  │◀──────┘
//!                      └────────────────┘     └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use trek_migrate::{
//!     CatalogDiffer, DiffOptions, Generator, GeneratorConfig, LocalClusterProvisioner,
//!     MigrationFileManager, OutputTarget, PgModelerCli,
//! };
//!
//! async fn generate() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = MigrationFileManager::new("./migrations");
//!     let slot = manager.allocate("add-users", false, |_| true).await?;
//!
//!     let config = GeneratorConfig::new(".", "./app.dbm")
//!         .roles(vec!["app_user".to_string()]);
//!     let mut generator = Generator::new(
//!         config,
//!         Arc::new(LocalClusterProvisioner::new()),
//!         Arc::new(PgModelerCli::new()),
//!         Arc::new(CatalogDiffer::new(DiffOptions::new())),
//!     );
//!
//!     let target = OutputTarget::File { path: slot.path, index: slot.index };
//!     let outcome = generator.run_cycle(&target).await?;
//!     println!("{}", outcome.summary());
//!     Ok(())
//! }
//! ```
//!
//! ## Migration Files
//!
//! Migrations are single forward-only files with a three digit index:
//!
//! ```text
//! migrations/
//! ├── 001_init.up.sql
//! ├── 002_add-users.up.sql
//! └── 003_user-emails.up.sql
//! ```
//!
//! The newest file is regenerated while the model changes; older files are
//! never touched.

pub mod check;
pub mod connection;
pub mod diff;
pub mod dump;
pub mod engine;
pub mod error;
pub mod external;
pub mod file;
pub mod history;
pub mod hooks;
pub mod introspect;
pub mod lock;
pub mod model;
pub mod pipeline;
pub mod process;
pub mod reconcile;
pub mod shadow;
pub mod sql;
pub mod template;

// Re-exports
pub use check::{CheckConfig, CheckReport, ProjectChecker};
pub use connection::{ConnectionInfo, SslMode};
pub use diff::{DiffOptions, Hazard, HazardType, Plan, SchemaDiffer, Statement};
pub use dump::{DumpDiff, PgTools};
pub use engine::{ApplyOutcome, MigrationEngine};
pub use error::{MigrateResult, MigrationError};
pub use external::MigraDiffer;
pub use file::{Allocation, MigrationFile, MigrationFileManager};
pub use history::{MigrationHistoryRepository, PostgresHistory, VersionRecord};
pub use hooks::HookRunner;
pub use introspect::CatalogSnapshot;
pub use lock::{ChangeDetector, LockFile};
pub use model::{ModelInfo, PgModelerCli, RenderFormat, SchemaMaterializer, SqlFileMaterializer};
pub use pipeline::{CycleOutcome, ExportPaths, Generator, GeneratorConfig, OutputTarget};
pub use reconcile::{PermissionReconciler, Reconciliation};
pub use shadow::{
    DatabaseProvisioner, DockerProvisioner, EphemeralDatabase, LocalClusterProvisioner,
    ScratchDatabaseFactory,
};
pub use sql::CatalogDiffer;
pub use template::TemplateFile;
