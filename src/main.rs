use clap::Parser;
use rtrelay::config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    rtrelay::run(cli.config).await
}
