#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::Parser;
use mireka::{Config, Mireka, config::find_config_file};

#[derive(Parser)]
#[command(version, about = "Mireka mail server")]
struct Args {
    /// Configuration file, in RON
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = find_config_file(args.config.as_deref())?;
    let config = Config::load(&config_path)?;

    Mireka::new(config).run().await
}
