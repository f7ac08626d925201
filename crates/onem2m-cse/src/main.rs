use anyhow::Result;
use clap::Parser;
use onem2m_cse::cli::CliArgs;
use onem2m_cse::{listen_address, run, settings, setup_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let work_dir = settings::work_directory(args.work_dir)?;
    let config = settings::load(&work_dir, args.config)?;

    setup_tracing(&config)?;

    let listen_addr = listen_address(&config)?;
    run(config, listen_addr).await
}
