//! # Trek
//!
//! Forward-only PostgreSQL migrations generated from a declarative model.
//!
//! Trek provides:
//! - A generation pipeline that diffs the migration history against the model
//!   on throwaway PostgreSQL servers
//! - Contiguously numbered `NNN_<name>.up.sql` migration files
//! - golang-migrate compatible application of migrations
//! - A project check for CI that replays the history and compares a lock file
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use trek::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), trek::MigrationError> {
//!     let config = GeneratorConfig::new(".", "./app.sql");
//!     let mut generator = Generator::new(
//!         config,
//!         Arc::new(LocalClusterProvisioner::new()),
//!         Arc::new(SqlFileMaterializer),
//!         Arc::new(CatalogDiffer::default()),
//!     );
//!
//!     match generator.run_cycle(&OutputTarget::Stdout).await? {
//!         CycleOutcome::Printed(sql) => print!("{}", sql),
//!         outcome => println!("{}", outcome.summary()),
//!     }
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// The migration generation engine.
pub mod migrate {
    pub use trek_migrate::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::migrate::{
        CatalogDiffer, CycleOutcome, DatabaseProvisioner, Generator, GeneratorConfig,
        LocalClusterProvisioner, MigrationFileManager, OutputTarget, SchemaDiffer,
        SqlFileMaterializer,
    };
}

// Re-export key types at the crate root
pub use migrate::{MigrateResult, MigrationError};
