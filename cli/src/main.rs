// alertmesh: command-line node
//
// Cross-platform (macOS, Linux, Windows) front end for the alert mesh: keeps the
// device identity and mesh settings in a JSON config file and runs a node that
// shares alerts typed on stdin.

mod config;

use alertmesh_core::signaling::SignalingService;
use alertmesh_core::{
    start_mesh, Alert, Location, MeshEvent, MeshHandle, NetworkStatus, RtcSessionFactory,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

#[derive(Parser)]
#[command(name = "alertmesh")]
#[command(about = "alertmesh — peer-to-peer emergency alert mesh", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config file and device identity
    Init,
    /// Join the mesh and share alerts read from stdin
    Start {
        /// Signaling server URL (ws:// or wss://)
        #[arg(short, long)]
        signaling: Option<String>,
        /// Device name announced to peers
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

/// Lines understood at the `start` prompt
const PROMPT_COMMANDS: &[(&str, &str)] = &[
    ("<json>", r#"share an alert, e.g. {"id":"quake-1","severity":"high"}"#),
    ("location <lat> <lon>", "move this device"),
    ("peers", "list connected peers"),
    ("alerts", "cached alerts, oldest first"),
    ("status", "peer, discovery and alert counts"),
    ("quit", "leave the mesh and exit"),
];

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Init => cmd_init(),
        Commands::Start { signaling, name } => cmd_start(signaling, name).await,
        Commands::Config { action } => cmd_config(action),
    }
}

fn cmd_init() -> Result<()> {
    println!("{}", "Initializing alertmesh...".bold());
    println!();

    let config = config::Config::load()?;
    let config_file = config::Config::config_file()?;
    println!("  {} Configuration: {}", "✓".green(), config_file.display());
    println!();

    println!("{}", "Device:".bold());
    println!("  ID:        {}", config.device.id.bright_cyan());
    println!("  Name:      {}", config.device.name.bright_cyan());
    println!("  Signaling: {}", config.mesh.signaling.url.bright_yellow());
    println!();

    println!("{}", "Next steps:".bold());
    println!(
        "  • Point at a server: {}",
        "alertmesh config set signaling_url wss://<host>/signaling".bright_green()
    );
    println!("  • Start node:        {}", "alertmesh start".bright_green());

    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

async fn cmd_start(signaling_url: Option<String>, name: Option<String>) -> Result<()> {
    let mut config = config::Config::load()?;
    if let Some(url) = signaling_url {
        config.mesh.signaling.url = url;
    }
    if let Some(name) = name {
        config.device.name = name;
    }
    config
        .mesh
        .validate()
        .context("Invalid mesh configuration")?;

    let device = config.device_info();

    println!("{}", "alertmesh — Starting...".bold());
    println!();
    println!("Device: {} ({})", device.name.bright_cyan(), device.id.dimmed());
    println!();

    let (signaling, signaling_events) =
        SignalingService::new(device.id.clone(), config.mesh.signaling.clone());
    let sessions = RtcSessionFactory::new(config.mesh.transport.clone())
        .context("Failed to set up WebRTC")?;
    let (mesh, mut events) = start_mesh(
        device,
        config.mesh.clone(),
        Arc::new(signaling.clone()),
        signaling_events,
        Arc::new(sessions),
    )
    .context("Failed to start mesh")?;

    match signaling.connect().await {
        Ok(()) => println!("{} Signaling: {}", "✓".green(), config.mesh.signaling.url),
        Err(e) => println!(
            "{} Signaling unavailable ({}), retrying in background",
            "!".yellow(),
            e
        ),
    }

    mesh.initialize().await.context("Failed to initialize mesh")?;
    println!("{} Mesh active", "✓".green());
    println!();
    println!("{}", "Commands:".bold());
    for (command, help) in PROMPT_COMMANDS {
        println!("  {:<22} {}", command.bright_green(), help);
    }
    println!();

    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    let stdin_mesh = mesh.clone();
    let stdin_task = tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();

        prompt();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line == "quit" || line == "exit" {
                break;
            }
            if !line.is_empty() {
                if let Err(e) = handle_line(&stdin_mesh, line).await {
                    println!("{} {}", "✗".red(), e);
                }
            }
            prompt();
        }
    });

    tokio::select! {
        _ = stdin_task => {}
        _ = event_task => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    println!("Shutting down...");
    mesh.shutdown().await?;
    signaling.disconnect();

    Ok(())
}

async fn handle_line(mesh: &MeshHandle, line: &str) -> Result<()> {
    match line {
        "status" => print_status(&mesh.network_status().await?),
        "peers" => {
            let status = mesh.network_status().await?;
            if status.peers.is_empty() {
                println!("No peers.");
            }
            for peer in status.peers {
                let name = peer.name.unwrap_or_else(|| "?".to_string());
                println!(
                    "  • {} {} (heartbeat {}ms ago)",
                    name.bright_cyan(),
                    peer.id.dimmed(),
                    peer.last_heartbeat_ms_ago
                );
            }
        }
        "alerts" => {
            let alerts = mesh.cached_alerts().await?;
            if alerts.is_empty() {
                println!("No alerts.");
            }
            for cached in alerts {
                println!(
                    "  • {} from {} ({} hops)",
                    cached.alert_id().bright_yellow(),
                    cached.origin_device,
                    cached.hops
                );
            }
        }
        _ if line.starts_with("location ") => {
            let parts: Vec<&str> = line.split_whitespace().collect();
            anyhow::ensure!(parts.len() == 3, "Usage: location <lat> <lon>");
            let location = Location {
                latitude: parts[1].parse().context("Invalid latitude")?,
                longitude: parts[2].parse().context("Invalid longitude")?,
                accuracy: None,
            };
            mesh.update_location(location).await?;
            println!("{} Location updated", "✓".green());
        }
        _ if line.starts_with('{') => {
            let value: serde_json::Value =
                serde_json::from_str(line).context("Alert is not valid JSON")?;
            let alert = Alert::from_value(value).context("Alert needs a string \"id\"")?;
            let cached = mesh.share_alert(alert).await?;
            println!("{} Shared {}", "✓".green(), cached.alert_id().bright_yellow());
        }
        _ => println!("Try: <json alert>, location, peers, alerts, status, quit"),
    }
    Ok(())
}

fn print_event(event: &MeshEvent) {
    match event {
        MeshEvent::PeerConnected { peer_id } => {
            println!("\n{} Peer connected: {}", "✓".green(), peer_id);
        }
        MeshEvent::PeerDisconnected { peer_id } => {
            println!("\n{} Peer left: {}", "•".dimmed(), peer_id);
        }
        MeshEvent::PeerHandshake { device_info, alert_count, .. } => {
            println!(
                "\n{} {} says hello ({} cached alerts)",
                "←".bright_blue(),
                device_info.name.bright_cyan(),
                alert_count
            );
        }
        MeshEvent::ConnectionError { peer_id, error } => {
            println!("\n{} Connection to {} failed: {}", "✗".red(), peer_id, error);
        }
        MeshEvent::AlertReceived(cached) => {
            let body = serde_json::to_string(&cached.alert).unwrap_or_default();
            println!(
                "\n{} {} {} (origin {}, {} hops)",
                "ALERT".bright_red().bold(),
                cached.alert_id().bright_yellow(),
                body,
                cached.origin_device.bright_cyan(),
                cached.hops
            );
        }
        MeshEvent::SignalingReconnectFailed { attempts } => {
            println!(
                "\n{} Signaling gave up after {} attempts",
                "✗".red(),
                attempts
            );
        }
        // Discovery churn and local echoes stay in the debug log
        _ => {
            tracing::debug!("Mesh event: {:?}", event);
            return;
        }
    }
    prompt();
}

fn print_status(status: &NetworkStatus) {
    let state = if status.is_active {
        "active".green()
    } else {
        "stopped".red()
    };
    println!("Mesh:       {}", state);
    println!("Peers:      {}", status.connected_peers);
    println!("Connecting: {}", status.connecting);
    println!("Discovered: {}", status.discovered_devices);
    println!("Alerts:     {}", status.cached_alerts);
    if let Ok(json) = serde_json::to_string_pretty(status) {
        tracing::debug!("Status: {}", json);
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::Write::flush(&mut std::io::stdout());
}
