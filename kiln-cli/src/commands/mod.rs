//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod connections;
mod files;
mod service;

pub use files::FileCommands;
pub use service::ServiceCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Service management
    Service {
        #[command(subcommand)]
        command: ServiceCommands,
    },
    /// Browse files under a profile's home directory
    Files {
        #[command(subcommand)]
        command: FileCommands,
    },
    /// Show pooled SSH connections
    Connections,
    /// Show deployment profiles
    Profiles,
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
///
/// # Arguments
/// * `command` - The command to execute
/// * `config` - The CLI configuration
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Service { command } => service::handle_service_command(command, config).await,
        Commands::Files { command } => files::handle_file_command(command, config).await,
        Commands::Connections => connections::list_connections(config).await,
        Commands::Profiles => connections::list_profiles(config).await,
    }
}
