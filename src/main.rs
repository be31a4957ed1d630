use busdeck::cli;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries command output
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = cli::Cli::parse();
    cli.run().await
}
