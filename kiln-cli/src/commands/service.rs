//! Service command handlers
//!
//! Handles all service-related CLI commands: starting, listing, inspecting,
//! waiting on, stopping and removing services.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use kiln_core::domain::service::{ImageKind, JobType, Service, ServiceStatus};
use kiln_core::dto::service::{
    ContainerOptions, CreateService, JobOptions, JobView, ServiceFilter, StopService,
};

use crate::api::ApiClient;
use crate::config::Config;
use crate::id_resolver::resolve_service_id;
use crate::types::{IdOrPrefix, parse_key_val};

/// Service subcommands
#[derive(Subcommand)]
pub enum ServiceCommands {
    /// Start a new inference service
    Start {
        /// Service name
        name: String,

        /// Model to serve, e.g. bigscience/bloom-560m
        #[arg(short, long)]
        model: String,

        /// Inference task: text-generation or speech-recognition
        #[arg(short, long, default_value = "text-generation")]
        image: ImageKind,

        /// Deployment profile
        #[arg(short, long, default_value = "local")]
        profile: String,

        /// Job type: local or slurm (default depends on the profile)
        #[arg(long)]
        job_type: Option<JobType>,

        /// Seconds the service may take to become healthy
        #[arg(long)]
        grace_period: Option<u64>,

        /// Extra bind mounts, host:container
        #[arg(long)]
        mount: Vec<String>,

        /// Container image override
        #[arg(long)]
        image_ref: Option<String>,

        /// Model revision
        #[arg(long)]
        revision: Option<String>,

        /// Environment variables for the container as KEY=value
        #[arg(short, long, value_parser = parse_key_val)]
        env: Vec<(String, String)>,

        /// Extra arguments for the inference server
        #[arg(long, allow_hyphen_values = true)]
        arg: Vec<String>,

        /// Slurm wall time, e.g. 01:00:00
        #[arg(long)]
        time: Option<String>,

        #[arg(long)]
        partition: Option<String>,

        #[arg(long)]
        account: Option<String>,

        /// GPUs per node
        #[arg(long)]
        gpus: Option<u32>,

        /// Memory per node in GB
        #[arg(long)]
        mem: Option<u32>,
    },
    /// List services
    List {
        #[arg(long)]
        image: Option<ImageKind>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        status: Option<ServiceStatus>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        profile: Option<String>,
    },
    /// Show service details
    Get {
        /// Service ID or unambiguous prefix
        id: String,
    },
    /// Show the job backing a service
    Job {
        /// Service ID or unambiguous prefix
        id: String,
    },
    /// Wait until a service is healthy or stopped
    Wait {
        /// Service ID or unambiguous prefix
        id: String,

        /// Seconds to wait
        #[arg(long, default_value = "600")]
        timeout: u64,

        /// Seconds between checks
        #[arg(long, default_value = "5")]
        interval: u64,
    },
    /// Stop a service
    Stop {
        /// Service ID or unambiguous prefix
        id: String,

        /// Record the stop as a timeout
        #[arg(long)]
        timeout: bool,

        /// Record the stop as a failure
        #[arg(long)]
        failed: bool,
    },
    /// Remove a stopped service
    Rm {
        /// Service ID or unambiguous prefix
        id: String,
    },
}

/// Handle service commands
///
/// Routes service subcommands to their respective handlers.
///
/// # Arguments
/// * `command` - The service command to execute
/// * `config` - The CLI configuration
pub async fn handle_service_command(command: ServiceCommands, config: &Config) -> Result<()> {
    let client = ApiClient::new(&config.api_url);

    match command {
        ServiceCommands::Start {
            name,
            model,
            image,
            profile,
            job_type,
            grace_period,
            mount,
            image_ref,
            revision,
            env,
            arg,
            time,
            partition,
            account,
            gpus,
            mem,
        } => {
            let req = CreateService {
                name,
                image,
                model,
                profile,
                job_type,
                grace_period,
                mounts: mount,
                container_options: ContainerOptions {
                    image_ref,
                    revision,
                    extra_args: arg,
                    env: env.into_iter().collect(),
                },
                job_options: JobOptions {
                    time,
                    partition,
                    account,
                    gres: gpus,
                    mem,
                    ntasks_per_node: None,
                },
            };
            start_service(&client, req).await
        }
        ServiceCommands::List {
            image,
            model,
            status,
            name,
            profile,
        } => {
            let filter = ServiceFilter {
                image,
                model,
                status,
                name,
                profile,
            };
            list_services(&client, &filter).await
        }
        ServiceCommands::Get { id } => get_service(&client, &id).await,
        ServiceCommands::Job { id } => get_job(&client, &id).await,
        ServiceCommands::Wait {
            id,
            timeout,
            interval,
        } => wait_service(&client, &id, timeout, interval).await,
        ServiceCommands::Stop {
            id,
            timeout,
            failed,
        } => stop_service(&client, &id, StopService { timeout, failed }).await,
        ServiceCommands::Rm { id } => remove_service(&client, &id).await,
    }
}

async fn start_service(client: &ApiClient, req: CreateService) -> Result<()> {
    let service = client.start_service(&req).await?;

    println!("{}", "✔ Service started".green().bold());
    println!("  ID:      {}", service.id.to_string().cyan());
    println!("  Name:    {}", service.name.bold());
    println!("  Job:     {} {}", service.job_type, service.job_id.as_deref().unwrap_or("-"));
    println!("  Status:  {}", colorize_status(service.status));

    Ok(())
}

async fn list_services(client: &ApiClient, filter: &ServiceFilter) -> Result<()> {
    let services = client.list_services(filter).await?;

    if services.is_empty() {
        println!("{}", "No services found.".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} service(s):", services.len()).bold()
        );
        println!();
        for service in services {
            print_service_summary(&service);
        }
    }

    Ok(())
}

async fn get_service(client: &ApiClient, id: &str) -> Result<()> {
    let uuid = resolve_service_id(client, &IdOrPrefix::parse(id)).await?;
    let service = client.get_service(uuid).await?;

    print_service_details(&service);
    Ok(())
}

async fn get_job(client: &ApiClient, id: &str) -> Result<()> {
    let uuid = resolve_service_id(client, &IdOrPrefix::parse(id)).await?;
    let job = client.get_service_job(uuid).await?;

    print_job(&job);
    Ok(())
}

async fn wait_service(client: &ApiClient, id: &str, timeout: u64, interval: u64) -> Result<()> {
    let uuid = resolve_service_id(client, &IdOrPrefix::parse(id)).await?;

    println!(
        "{}",
        format!("Waiting up to {}s for service {}...", timeout, uuid).dimmed()
    );
    let result = client.wait_service(uuid, timeout, interval).await?;

    match result.status {
        ServiceStatus::Healthy => {
            println!("{}", format!("✔ Service {} is healthy", result.id).green().bold())
        }
        status if status.is_terminal() => anyhow::bail!("Service {} ended as {}", result.id, status),
        status => anyhow::bail!("Timed out waiting for service {}; it is {}", result.id, status),
    }

    Ok(())
}

async fn stop_service(client: &ApiClient, id: &str, req: StopService) -> Result<()> {
    let uuid = resolve_service_id(client, &IdOrPrefix::parse(id)).await?;
    let service = client.stop_service(uuid, req).await?;

    println!(
        "{} {}",
        format!("✔ Service {} stopped:", service.id).green().bold(),
        colorize_status(service.status)
    );
    Ok(())
}

async fn remove_service(client: &ApiClient, id: &str) -> Result<()> {
    let uuid = resolve_service_id(client, &IdOrPrefix::parse(id)).await?;
    client.delete_service(uuid).await?;

    println!("{}", format!("✔ Service {} removed", uuid).green().bold());
    Ok(())
}

/// Print a service summary
fn print_service_summary(service: &Service) {
    println!(
        "  {} {} {}",
        "▸".cyan(),
        service.name.bold(),
        colorize_status(service.status)
    );
    println!("    ID:      {}", service.id.to_string().dimmed());
    println!("    Model:   {} ({})", service.model, service.image.to_string().dimmed());
    println!("    Profile: {}", service.profile.dimmed());
    if let Some(port) = service.port {
        println!("    URL:     {}", format!("http://127.0.0.1:{}", port).cyan());
    }
    println!();
}

/// Print detailed service information
fn print_service_details(service: &Service) {
    println!("{}", "Service Details:".bold());
    println!("  ID:           {}", service.id.to_string().cyan());
    println!("  Name:         {}", service.name.bold());
    println!("  Status:       {}", colorize_status(service.status));
    println!("  Image:        {}", service.image);
    println!("  Model:        {}", service.model);
    println!("  Profile:      {}", service.profile);
    match &service.user {
        Some(user) => println!("  Host:         {}@{}", user, service.host),
        None => println!("  Host:         {}", service.host),
    }
    println!(
        "  Job:          {} {}",
        service.job_type,
        service.job_id.as_deref().unwrap_or("-")
    );
    if let Some(port) = service.port {
        println!("  URL:          http://127.0.0.1:{}", port);
    }
    println!("  Grace period: {}s", service.grace_period);
    if !service.mounts.is_empty() {
        println!("  Mounts:       {}", service.mounts.join(", "));
    }
    println!(
        "  Created:      {}",
        service.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "  Updated:      {}",
        service.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
}

fn print_job(job: &JobView) {
    println!("{}", "Job Details:".bold());
    println!("  Type:  {}", job.job_type);
    println!("  ID:    {}", job.job_id.cyan());
    println!("  State: {}", job.state.as_deref().unwrap_or("unknown").yellow());
    println!("  Node:  {}", job.node.as_deref().unwrap_or("-"));
    match job.port {
        Some(port) => println!("  Port:  {}", port),
        None => println!("  Port:  -"),
    }
}

/// Colorize service status for display
fn colorize_status(status: ServiceStatus) -> ColoredString {
    let text = status.as_str();
    match status {
        ServiceStatus::Healthy => text.green(),
        ServiceStatus::Unhealthy | ServiceStatus::Failed => text.red(),
        ServiceStatus::Timeout => text.magenta(),
        ServiceStatus::Stopped => text.dimmed(),
        ServiceStatus::Submitted | ServiceStatus::Pending | ServiceStatus::Starting => {
            text.yellow()
        }
    }
}
