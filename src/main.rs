//! SAS Topology
//!
//! Runs discovery against a simulated fabric described in YAML or JSON and
//! prints the committed topology of each port.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sas_topology::{
    gather_text, DiscoveryConfig, DiscoveryManager, FabricSpec, PortDescriptor, PortId, SimulatedFabric,
    VitesseSesQuirk,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// SAS Topology - discover expanders and end devices behind each host port
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Fabric description (YAML, or JSON by extension)
    #[arg(long, env = "FABRIC_FILE")]
    fabric: PathBuf,

    /// Discovery settings file (YAML)
    #[arg(long, env = "DISCOVERY_CONFIG")]
    config: Option<PathBuf>,

    /// Only discover this port
    #[arg(long, env = "PORT")]
    port: Option<u8>,

    /// Retry failed sessions with exponential backoff
    #[arg(long, env = "RETRY")]
    retry: bool,

    /// Enable the Vitesse SES relink-and-retry quirk
    #[arg(long, env = "VITESSE_QUIRK")]
    vitesse_quirk: bool,

    /// Print Prometheus metrics after discovery
    #[arg(long, env = "PRINT_METRICS")]
    print_metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting SAS topology discovery");
    info!("  Version: {}", sas_topology::VERSION);
    info!("  Fabric: {}", args.fabric.display());

    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading discovery config {}", path.display()))?;
            serde_yaml::from_str::<DiscoveryConfig>(&text)
                .with_context(|| format!("parsing discovery config {}", path.display()))?
        }
        None => DiscoveryConfig::default(),
    };

    let spec = FabricSpec::load(&args.fabric).with_context(|| format!("loading fabric {}", args.fabric.display()))?;
    let fabric = Arc::new(SimulatedFabric::new(spec));

    let ports: Vec<PortDescriptor> = match args.port {
        Some(id) => vec![fabric
            .port(PortId(id))
            .with_context(|| format!("port {} is not in the fabric", id))?],
        None => fabric.ports(),
    };

    let mut manager = DiscoveryManager::new(config, fabric.clone()).context("creating discovery manager")?;
    if args.vitesse_quirk {
        manager = manager.with_quirk(Arc::new(VitesseSesQuirk));
    }

    let mut failed = 0;
    for port in ports {
        let id = port.id;
        let result = if args.retry {
            manager.discover_with_retry(port).await
        } else {
            manager.discover(port).await
        };
        match result {
            Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            Err(e) => {
                error!(port = %id, error = %e, "discovery failed");
                failed += 1;
            }
        }
    }

    if args.print_metrics {
        print!("{}", gather_text(&manager.metrics())?);
    }

    if failed > 0 {
        anyhow::bail!("discovery failed on {} port(s)", failed);
    }
    info!("Discovery complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("sas_topology::discovery::stack=info".parse()?);

    // Reports go to stdout, logs to stderr
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}
