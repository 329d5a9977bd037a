//! fwctl - VPN firewall policy tool
//!
//! Inspects the role registry, prints the filter set a state would install,
//! and replays state sequences against the in-memory engine.
//!
//! # Usage
//!
//! ```bash
//! # List every role with its stable identifier
//! fwctl roles
//!
//! # Filter set for the connecting state, as JSON
//! fwctl -o json plan connecting --relay 185.65.135.1:51820 --protocol udp
//!
//! # Replay a lifecycle and write the diagnostic log
//! fwctl simulate connecting connected blocked --relay 185.65.135.1 --tunnel wg0 --log
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use libfwctl::firewall::{
    build_filter_set, InMemoryEngine, Role, TransportProtocol, REGISTRY_VERSION,
};
use libfwctl::{
    FileSink, FirewallConfig, FirewallController, Logger, PolicyParams, RelayEndpoint, VpnState,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "fwctl")]
#[command(version)]
#[command(
    about = "VPN firewall policy tool - inspect roles, plan and simulate filter sets",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format: text, json
    #[arg(short = 'o', long, default_value = "text", global = true)]
    output: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the role registry
    Roles,

    /// Print the exception filters a state installs
    Plan {
        /// Target state (blocked, disconnected, connecting, connected)
        state: VpnState,

        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// Apply a sequence of states to an in-memory engine and report each diff
    Simulate {
        /// States to apply, in order
        #[arg(required = true)]
        states: Vec<VpnState>,

        #[command(flatten)]
        policy: PolicyArgs,

        /// Write the diagnostic log to the configured log directory
        #[arg(long)]
        log: bool,

        /// Write the diagnostic log to this file instead
        #[arg(long, conflicts_with = "log")]
        log_file: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct PolicyArgs {
    /// Relay endpoint, ADDR or ADDR:PORT
    #[arg(long, value_parser = parse_relay)]
    relay: Option<RelayEndpoint>,

    /// Relay transport protocol (udp, tcp)
    #[arg(long)]
    protocol: Option<TransportProtocol>,

    /// Tunnel interface name
    #[arg(long)]
    tunnel: Option<String>,

    /// DNS resolver reachable while connecting (repeatable)
    #[arg(long = "dns")]
    dns_servers: Vec<IpAddr>,

    /// Block LAN traffic
    #[arg(long)]
    no_lan: bool,
}

impl PolicyArgs {
    /// Merge command-line values over the configured defaults
    fn to_params(&self, config: &FirewallConfig) -> Result<PolicyParams> {
        let mut params = config.default_params();
        if self.no_lan {
            params = params.with_allow_lan(false);
        }
        if !self.dns_servers.is_empty() {
            params = params.with_dns_servers(self.dns_servers.clone());
        }
        if let Some(relay) = &self.relay {
            let mut relay = relay.clone();
            if let Some(protocol) = self.protocol {
                relay = relay.with_protocol(protocol);
            }
            params = params.with_relay(relay);
        } else if self.protocol.is_some() {
            bail!("--protocol requires --relay");
        }
        if let Some(tunnel) = &self.tunnel {
            params = params.with_tunnel(tunnel);
        }
        Ok(params)
    }
}

fn parse_relay(s: &str) -> std::result::Result<RelayEndpoint, String> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(RelayEndpoint::from(addr));
    }
    s.parse::<IpAddr>()
        .map(RelayEndpoint::from)
        .map_err(|_| format!("invalid relay endpoint '{}'", s))
}

/// Initialize logging
fn init_logging(cli: &Cli) {
    let log_level = if cli.verbose {
        "debug"
    } else {
        &cli.log_level
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            EnvFilter::new(format!("fwctl={},libfwctl={}", log_level, log_level))
        });

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

fn load_config(cli: &Cli) -> Result<FirewallConfig> {
    let config = match &cli.config {
        Some(path) => FirewallConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => FirewallConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("JSON serialization error")?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Roles => handle_roles(&cli),
        Commands::Plan { state, policy } => handle_plan(&cli, *state, policy),
        Commands::Simulate { states, policy, log, log_file } => {
            handle_simulate(&cli, states, policy, *log, log_file.as_ref()).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn handle_roles(cli: &Cli) -> Result<()> {
    if cli.output == "json" {
        let roles: Vec<_> = Role::all()
            .map(|r| {
                serde_json::json!({
                    "name": r.name(),
                    "id": r.id(),
                    "description": r.description()
                })
            })
            .collect();
        return print_json(&serde_json::json!({ "version": REGISTRY_VERSION, "roles": roles }));
    }

    println!("Role registry v{}", REGISTRY_VERSION);
    for role in Role::all() {
        println!("{:<40} {}  {}", role.name(), role.id(), role.description());
    }
    Ok(())
}

fn handle_plan(cli: &Cli, state: VpnState, policy: &PolicyArgs) -> Result<()> {
    let config = load_config(cli)?;
    let params = policy.to_params(&config)?;
    let set = build_filter_set(state, &params)
        .with_context(|| format!("building filter set for {}", state))?;

    if cli.output == "json" {
        return print_json(&set);
    }

    println!("State {}: {} exception filters", state, set.len());
    for filter in &set.filters {
        println!(
            "  {:<40} {:?} {:?} {:?} weight {}",
            filter.role.name(),
            filter.action,
            filter.direction,
            filter.family,
            filter.weight
        );
    }
    Ok(())
}

async fn handle_simulate(
    cli: &Cli,
    states: &[VpnState],
    policy: &PolicyArgs,
    log: bool,
    log_file: Option<&PathBuf>,
) -> Result<()> {
    let config = load_config(cli)?;
    let params = policy.to_params(&config)?;

    let engine = Arc::new(InMemoryEngine::new());
    let controller = if let Some(path) = log_file {
        let sink = FileSink::open(path, config.logging.append, config.logging.flush)
            .with_context(|| format!("opening log file {}", path.display()))?;
        FirewallController::new(engine.clone(), Logger::new(sink), config.call_timeout())
    } else if log {
        FirewallController::from_config(engine.clone(), &config)
            .with_context(|| format!("opening log file {}", config.log_path().display()))?
    } else {
        FirewallController::new(engine.clone(), Logger::null(), config.call_timeout())
    };
    controller.initialize().await.context("initializing firewall")?;
    info!("Simulating {} transitions", states.len());

    let mut reports = Vec::new();
    for state in states {
        let report = controller
            .transition_to(*state, params.clone())
            .await
            .with_context(|| format!("transition to {}", state))?;
        debug!("{} engine mutations so far", engine.mutation_count());

        if cli.output != "json" {
            println!(
                "{} -> {}: {} added, {} removed, {} replaced",
                report.from,
                report.to,
                report.diff.added.len(),
                report.diff.removed.len(),
                report.diff.replaced.len()
            );
            for line in report.diff.detail_lines() {
                println!("    {}", line);
            }
        }
        reports.push(report);
    }

    let snapshot = controller.snapshot();
    if cli.output == "json" {
        return print_json(&serde_json::json!({ "transitions": reports, "final": snapshot }));
    }
    println!(
        "Final state {} with {} exception filters, {} filters committed",
        snapshot.state,
        snapshot.roles.len(),
        engine.committed_filters().len()
    );
    Ok(())
}
