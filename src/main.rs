//! connmux - Connection Multiplexer Probe
//!
//! Opens logical sessions to a server through the connection manager,
//! reports how they were multiplexed, and shuts the manager down cleanly.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use connmux::config::{parse_read_mode, Config, ConfigManager, ReadMode};
use connmux::connection::RegistryStats;
use connmux::{
    ConnectionManager, Endpoint, LogicalId, Message, ServerRole, ShutdownCoordinator,
    UnsolicitedHandler,
};

/// CLI arguments for connmux
#[derive(Parser, Debug)]
#[command(name = "connmux")]
#[command(about = "Client-side connection multiplexer")]
#[command(version)]
#[command(long_about = "
connmux - Client-side connection multiplexer

Many logical sessions share one physical TCP connection per server
endpoint. Idle physical connections are reclaimed once their TTL expires.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  CONNMUX_READ_MODE         - Read mode (sync, async)
  CONNMUX_SOCKET_MODE       - Socket mode (blocking, nonblocking)
  CONNMUX_CONNECT_TIMEOUT   - Connect timeout (e.g., 10s)
  CONNMUX_REQUEST_TIMEOUT   - Request timeout (e.g., 30s)
  CONNMUX_GC_INTERVAL       - Garbage collector interval (e.g., 2ms)
  CONNMUX_DATA_SERVER_TTL   - Idle TTL of data server connections (e.g., 5m)
  CONNMUX_REDIRECTOR_TTL    - Idle TTL of redirector connections (e.g., 20m)
  CONNMUX_LOG_LEVEL         - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        global = true,
        default_value = "connmux.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, help = "Log level (overrides config file)")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect sessions to an endpoint and report how they were multiplexed
    Probe(ProbeArgs),
    /// Validate configuration and exit
    ValidateConfig,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Server to connect to, as host:port
    #[arg(value_parser = parse_endpoint)]
    pub endpoint: Endpoint,

    /// Numeric address the host resolves to, used for connection sharing
    #[arg(long)]
    pub resolved_address: Option<String>,

    /// Number of logical sessions to open
    #[arg(short = 'n', long, default_value_t = 2)]
    pub sessions: usize,

    /// Role of the server, selects the idle TTL
    #[arg(long, value_enum, default_value_t = RoleArg::DataServer)]
    pub role: RoleArg,

    /// Output format of the report
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Also print the Prometheus metrics
    #[arg(long)]
    pub metrics: bool,

    /// Keep the sessions open until Ctrl+C or SIGTERM
    #[arg(long)]
    pub hold: bool,

    /// Read mode (overrides config file)
    #[arg(long, value_parser = parse_read_mode)]
    pub read_mode: Option<ReadMode>,

    /// Connect timeout in seconds
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Request timeout in seconds
    #[arg(long)]
    pub request_timeout: Option<u64>,

    /// Idle TTL of data server connections in seconds
    #[arg(long)]
    pub data_server_ttl: Option<u64>,

    /// Disable the background garbage collector
    #[arg(long)]
    pub no_gc: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum RoleArg {
    Redirector,
    DataServer,
}

impl From<RoleArg> for ServerRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Redirector => ServerRole::Redirector,
            RoleArg::DataServer => ServerRole::DataServer,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let config_result = load_config(&args.config);

    // Tracing comes up before the config error is reported, so use the
    // configured level only when loading succeeded
    let config_level = config_result
        .as_ref()
        .map(|config| config.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_tracing(&args, &config_level)?;

    info!("Starting connmux v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config_result?;

    match args.command {
        Command::ValidateConfig => {
            config
                .validate()
                .context("Final configuration validation failed")?;

            info!("Configuration is valid");
            info!("Configuration summary:");
            info!("  Read mode: {:?}", config.manager.read_mode);
            info!("  Socket mode: {:?}", config.manager.socket_mode);
            info!("  Connect timeout: {:?}", config.manager.connect_timeout);
            info!("  Request timeout: {:?}", config.manager.request_timeout);
            info!("  Max message size: {} bytes", config.manager.max_message_size);
            info!("  Redirector TTL: {:?}", config.ttl.redirector);
            info!("  Data server TTL: {:?}", config.ttl.data_server);
            info!(
                "  Garbage collector: {}",
                if config.gc.enabled {
                    format!("every {:?}", config.gc.interval)
                } else {
                    "disabled".to_string()
                }
            );
            Ok(())
        }
        Command::Probe(probe) => {
            // Apply CLI argument overrides (highest priority)
            config.merge_with_cli_args(
                probe.read_mode,
                probe.connect_timeout,
                probe.request_timeout,
                probe.data_server_ttl,
                probe.no_gc,
            );
            config
                .validate()
                .context("Final configuration validation failed")?;

            run_probe(config, probe).await
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        ConfigManager::load_from_file(path)
    } else {
        ConfigManager::load_from_env()
    }
}

async fn run_probe(config: Config, probe: ProbeArgs) -> Result<()> {
    if probe.sessions == 0 {
        bail!("At least one session is required");
    }

    let mut endpoint = probe.endpoint.clone();
    if let Some(address) = &probe.resolved_address {
        endpoint = endpoint.with_resolved_address(address.clone());
    }

    let manager = ConnectionManager::new(Arc::new(config))?;

    let handler: UnsolicitedHandler = Arc::new(|id: LogicalId, message: &Message| {
        info!(
            logical = %id,
            bytes = message.body.len(),
            "Received unsolicited message"
        );
    });

    let mut opened = Vec::with_capacity(probe.sessions);
    for _ in 0..probe.sessions {
        match manager
            .connect_as(&endpoint, probe.role.into(), Some(Arc::clone(&handler)))
            .await
        {
            Ok(id) => opened.push(id),
            Err(e) => {
                error!("Failed to open session to {}: {}", endpoint, e);
                manager.shutdown().await;
                return Err(e).with_context(|| format!("Probe of {} failed", endpoint));
            }
        }
    }
    info!("Opened {} logical sessions to {}", opened.len(), endpoint);

    print_report(&manager.stats(), probe.format)?;
    if probe.metrics {
        println!("{}", manager.metrics().gather_text()?);
    }

    if probe.hold {
        info!("Press Ctrl+C or send SIGTERM/SIGINT to close the sessions");
        let shutdown_coordinator = ShutdownCoordinator::new();
        if let Err(e) = shutdown_coordinator.listen_for_signals().await {
            error!("Error setting up signal handlers: {}", e);
        }
    }

    for id in opened {
        if let Err(e) = manager.disconnect(id, false).await {
            warn!("Failed to close session {}: {}", id, e);
        }
    }
    manager.shutdown().await;

    info!("Probe complete");
    Ok(())
}

fn print_report(stats: &RegistryStats, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(stats)?);
        }
        OutputFormat::Text => {
            println!(
                "logical connections:  {} ({} slots)",
                stats.logical_connections, stats.logical_slots
            );
            println!(
                "physical connections: {} ({} slots)",
                stats.physical_connections, stats.physical_slots
            );
            for phys in &stats.physical {
                println!(
                    "  {} -> {} refs={} connected={} idle={} ttl={}",
                    phys.id,
                    phys.endpoint,
                    phys.ref_count,
                    phys.connected,
                    humantime::format_duration(std::time::Duration::from_millis(phys.idle_ms)),
                    humantime::format_duration(std::time::Duration::from_millis(phys.ttl_ms)),
                );
            }
        }
    }
    Ok(())
}

/// Parse `host:port`, with IPv6 hosts in brackets
fn parse_endpoint(value: &str) -> Result<Endpoint> {
    let (host, port) = value
        .rsplit_once(':')
        .with_context(|| format!("Endpoint '{}' must be host:port", value))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("Endpoint '{}' has an empty host", value);
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("Invalid port in endpoint '{}'", value))?;
    Ok(Endpoint::new(host, port))
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, config_level: &str) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or(config_level)
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
