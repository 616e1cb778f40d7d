//! `trek version` command - Display version information.

use trek_migrate::process::is_available;

use crate::error::CliResult;
use crate::output::{self, kv};

/// Package version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name
const NAME: &str = env!("CARGO_PKG_NAME");

/// External tools used by the pipeline
const TOOLS: [&str; 6] = ["pgmodeler-cli", "initdb", "pg_ctl", "pg_dump", "psql", "migra"];

/// Run the version command
pub async fn run() -> CliResult<()> {
    output::logo();
    output::newline();

    kv("Version", VERSION);
    kv("Binary", NAME);

    #[cfg(debug_assertions)]
    let build_mode = "debug";
    #[cfg(not(debug_assertions))]
    let build_mode = "release";

    kv("Build", build_mode);

    output::newline();

    output::section("Tools on PATH");
    for tool in TOOLS {
        let status = if is_available(std::path::Path::new(tool)) {
            "found"
        } else {
            "missing"
        };
        kv(tool, status);
    }

    output::newline();
    output::dim("https://github.com/pegasusheavy/trek");

    Ok(())
}
