//! Agent-side CLI entrypoint (spec §4.8.1 / §6.4).

use clap::{Parser, Subcommand};
use dispatchd::agent::AgentRuntime;
use dispatchd::config::AgentConfig;
use dispatchd::error::Result;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dispatchd-agent", about = "Dispatchd agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[arg(long, global = true)]
    server_url: Option<String>,
    #[arg(long, global = true)]
    machine_name: Option<String>,
    #[arg(long, global = true)]
    install_dir: Option<String>,
    #[arg(long, global = true)]
    heartbeat_interval: Option<u64>,
    #[arg(long, global = true)]
    config_update_interval: Option<u64>,
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Print what installing the agent as a service would do, and exit.
    Install,
    /// Print what uninstalling the agent as a service would do, and exit.
    Uninstall,
    /// Print what updating the installed agent would do, and exit.
    Update,
    /// Print the resolved configuration.
    Info,
    /// One-shot probe of this agent's registration state on the controller.
    Status,
    /// Start the long-lived runtime (default when no subcommand is given).
    Run,
}

fn resolve_config(cli: &Cli) -> Result<AgentConfig> {
    let mut config = AgentConfig::load()?;
    if let Some(v) = &cli.server_url {
        config.server_url = v.clone();
    }
    if let Some(v) = &cli.machine_name {
        config.machine_name = v.clone();
    }
    if let Some(v) = &cli.install_dir {
        config.install_dir = v.clone();
    }
    if let Some(v) = cli.heartbeat_interval {
        config.heartbeat_interval_secs = v;
    }
    if let Some(v) = cli.config_update_interval {
        config.config_update_interval_secs = v;
    }
    if let Some(v) = &cli.log_level {
        config.log_level = v.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match resolve_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    let exit_code = match cli.command.unwrap_or(Command::Run) {
        Command::Install => {
            println!("would install dispatchd-agent into {} (no OS service registration implemented)", config.install_dir);
            0
        }
        Command::Uninstall => {
            println!("would remove the dispatchd-agent installation at {} (no OS service registration implemented)", config.install_dir);
            0
        }
        Command::Update => {
            println!("would update the dispatchd-agent binary at {} (no OS service registration implemented)", config.install_dir);
            0
        }
        Command::Info => {
            match serde_json::to_string_pretty(&config) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("failed to render config: {e}"),
            }
            0
        }
        Command::Status => match run_status(config).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("status probe failed: {e}");
                1
            }
        },
        Command::Run => match run(config).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("agent runtime failed: {e}");
                1
            }
        },
    };

    std::process::exit(exit_code);
}

async fn run_status(config: AgentConfig) -> Result<()> {
    let runtime = AgentRuntime::new(config)?;
    let status = runtime.probe().await?;
    println!("{}", serde_json::to_string_pretty(&status).unwrap_or_default());
    Ok(())
}

async fn run(config: AgentConfig) -> Result<()> {
    let runtime = Arc::new(AgentRuntime::new(config)?);
    runtime.run().await
}
