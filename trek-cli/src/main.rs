//! Trek CLI - Command-line interface for trek.

use clap::Parser;

use trek_cli::cli::{Cli, Command};
use trek_cli::commands;
use trek_cli::error::CliResult;
use trek_cli::{logging, output};

#[tokio::main]
async fn main() {
    logging::init();

    if let Err(e) = run().await {
        output::newline_err();
        output::error(&e.to_string());
        std::process::exit(e.exit_code());
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();
    let dir = cli.directory;

    match cli.command {
        Command::Init(args) => commands::init::run(&dir, args).await,
        Command::Generate(args) => commands::generate::run(&dir, args).await,
        Command::Apply(args) => commands::apply::run(&dir, args).await,
        Command::Check(args) => commands::check::run(&dir, args).await,
        Command::Version => commands::version::run().await,
    }
}
