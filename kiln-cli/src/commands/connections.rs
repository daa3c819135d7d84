//! Connection and profile command handlers

use anyhow::Result;
use colored::*;

use crate::api::ApiClient;
use crate::config::Config;

/// Show pooled SSH connections
pub async fn list_connections(config: &Config) -> Result<()> {
    let client = ApiClient::new(&config.api_url);
    let connections = client.list_connections().await?;

    if connections.is_empty() {
        println!("{}", "No open SSH connections.".yellow());
        return Ok(());
    }

    println!(
        "{}",
        format!("{} SSH connection(s):", connections.len()).bold()
    );
    println!();
    for (key, status) in connections {
        let state = if status.is_connected {
            "connected".green()
        } else {
            "disconnected".red()
        };
        println!("  {} {} {}", "▸".cyan(), key.bold(), state);
        println!(
            "    Last used: {} ({:.0}s idle)",
            status.last_used.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            status.idle_time
        );
    }

    Ok(())
}

/// Show configured deployment profiles
pub async fn list_profiles(config: &Config) -> Result<()> {
    let client = ApiClient::new(&config.api_url);
    let profiles = client.list_profiles().await?;

    for profile in profiles {
        let target = match (&profile.user, &profile.host) {
            (Some(user), Some(host)) => format!("{}@{}", user, host),
            (None, Some(host)) => host.clone(),
            _ => "localhost".to_string(),
        };
        let provider = profile
            .provider
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!("  {} {}", "▸".cyan(), profile.name.bold());
        println!("    Target:   {}", target);
        println!("    Home:     {}", profile.home_dir.dimmed());
        println!("    Provider: {}", provider);
    }

    Ok(())
}
