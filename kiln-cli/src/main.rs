//! Kiln CLI
//!
//! Command-line interface for the Kiln orchestrator.

mod api;
mod commands;
mod config;
mod id_resolver;
mod types;

use clap::Parser;
use colored::*;
use commands::{Commands, handle_command};
use config::Config;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Deploy and manage inference services", long_about = None)]
struct Cli {
    /// Orchestrator API URL
    #[arg(long, env = "KILN_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = Config {
        api_url: cli.api_url,
    };

    if let Err(e) = handle_command(cli.command, &config).await {
        eprintln!("{}", format!("✖ {:#}", e).red());
        std::process::exit(1);
    }
}
