use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "appusage-agent",
    version,
    about = "Record which application holds foreground focus and snapshot usage sessions to disk"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print where snapshots go and whether an agent is running.
    Status,
    /// Check that snapshots can be written and accounts can be read.
    Doctor,
    /// Print the locally stored Steam accounts as JSON.
    Accounts,
}
