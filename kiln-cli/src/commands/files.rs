//! File command handlers
//!
//! Browse and edit files under a profile's home directory.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use kiln_remote::FileEntry;

use crate::api::ApiClient;
use crate::config::Config;

/// File subcommands
#[derive(Subcommand)]
pub enum FileCommands {
    /// List a directory
    Ls {
        /// Deployment profile
        profile: String,

        /// Directory relative to the profile home
        #[arg(default_value = "")]
        path: String,
    },
    /// Show one file or directory
    Stat { profile: String, path: String },
    /// Create a directory
    Mkdir {
        profile: String,
        path: String,

        /// Create missing parent directories
        #[arg(short, long)]
        parents: bool,
    },
    /// Delete a file or directory
    Rm {
        profile: String,
        path: String,

        /// Delete directories and their contents
        #[arg(short, long)]
        recursive: bool,
    },
    /// Move or rename a file or directory
    Mv {
        profile: String,
        from: String,
        to: String,
    },
}

/// Handle file commands
pub async fn handle_file_command(command: FileCommands, config: &Config) -> Result<()> {
    let client = ApiClient::new(&config.api_url);

    match command {
        FileCommands::Ls { profile, path } => {
            let entries = client.list_files(&profile, &path).await?;
            if entries.is_empty() {
                println!("{}", "Empty directory.".yellow());
            }
            for entry in &entries {
                print_entry(entry);
            }
        }
        FileCommands::Stat { profile, path } => {
            let entry = client.stat_file(&profile, &path).await?;
            print_entry(&entry);
        }
        FileCommands::Mkdir {
            profile,
            path,
            parents,
        } => {
            client.make_directory(&profile, &path, parents).await?;
            println!("{}", format!("✔ Created {}", path).green().bold());
        }
        FileCommands::Rm {
            profile,
            path,
            recursive,
        } => {
            client.delete_file(&profile, &path, recursive).await?;
            println!("{}", format!("✔ Deleted {}", path).green().bold());
        }
        FileCommands::Mv { profile, from, to } => {
            client.rename_file(&profile, &from, &to).await?;
            println!("{}", format!("✔ Moved {} to {}", from, to).green().bold());
        }
    }

    Ok(())
}

/// Print one entry in `ls -l` style
fn print_entry(entry: &FileEntry) {
    let kind = if entry.is_dir { "d" } else { "-" };
    let modified = entry
        .modified
        .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".repeat(16));
    let name = if entry.is_dir {
        format!("{}/", entry.name).blue().bold()
    } else {
        entry.name.normal()
    };

    println!(
        "{}{} {:>10} {} {}",
        kind,
        entry.permissions.dimmed(),
        entry.size,
        modified.dimmed(),
        name
    );
}
