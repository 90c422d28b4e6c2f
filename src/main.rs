use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use appusage_agent::app;
use appusage_agent::cli::{Cli, Commands};
use appusage_agent::config::{self, AgentConfig};
use appusage_agent::process_guard;
use appusage_agent::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("appusage-agent error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();
    let config = AgentConfig::load_or_init()?;

    match cli.command {
        Some(Commands::Status) => {
            app::print_status(&config)?;
            Ok(0)
        }
        Some(Commands::Doctor) => app::doctor(&config),
        Some(Commands::Accounts) => {
            app::print_accounts(&config)?;
            Ok(0)
        }
        None => {
            let _guard = process_guard::claim_output_dir(&config.effective_output_dir())?;
            let runtime = config::runtime_settings();
            app::run(config, runtime)?;
            Ok(0)
        }
    }
}
