use std::process::ExitCode;

use clap::Parser;

mod cli;
mod commands;
mod config;
mod error;
mod launch;

use cli::{Cli, Commands};
use config::{load_config, support_options};
use error::{CliResult, to_exit_code};
use launch::ChildLauncher;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity; stdout carries command output
    let filter = if cli.verbose {
        "tether=debug,tether_cli=debug"
    } else {
        "tether=warn,tether_cli=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = smol::block_on(async_main(cli));
    to_exit_code(result)
}

async fn async_main(cli: Cli) -> CliResult<()> {
    let file_config = load_config(cli.config.as_deref())?;
    let options = support_options(&file_config)?;
    let launcher = ChildLauncher {
        config: cli.config,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Echo(args) => commands::echo::execute(args, &launcher, options).await,
        Commands::SendFile(args) => commands::send_file::execute(args, &launcher, options).await,
        Commands::Child(args) => commands::child::execute(args, options).await,
    }
}
