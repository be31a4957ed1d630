use clap::{Parser, Subcommand};

use crate::console::{self, ConsoleCommands};
use crate::local::{self, LocalCommands};
use crate::server;

/// Busdeck CLI interface
#[derive(Parser, Debug)]
#[command(name = "busdeck", about = "Broker queue and dead-letter console")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the console HTTP API
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    #[command(flatten)]
    Console(ConsoleCommands),
    /// Local SQLite broker administration
    #[command(subcommand)]
    Local(LocalCommands),
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Commands::Serve { port } => server::run_server(port).await,
            Commands::Console(cmd) => console::run_console_command(cmd).await,
            Commands::Local(cmd) => local::run_local_command(cmd).await,
        }
    }
}
