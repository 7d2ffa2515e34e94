//! fabrikd — the Fabrik daemon.
//!
//! Single binary that assembles the orchestration engine:
//! - Resource store (redb, or in-memory)
//! - Backend clients (simulated director, snapshot and agent services)
//! - One operator and one status poller per resource type
//!
//! # Usage
//!
//! ```text
//! fabrikd standalone --config fabrik.toml --data-dir /var/lib/fabrik
//! fabrikd manifest --config fabrik.toml --index 3 --instance 8f2e...
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use fabrik_network::{DeploymentManifest, deployment_name, plan_networks};
use fabrik_operator::{Backends, Engine, FabrikConfig};
use fabrik_state::{ResourceClient, StateStore};

#[derive(Parser)]
#[command(name = "fabrikd", about = "Fabrik orchestration daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every operator and poller in one process.
    Standalone {
        /// Engine configuration (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/fabrik")]
        data_dir: PathBuf,

        /// Replica identity written into claims and locks.
        #[arg(long)]
        identity: Option<String>,

        /// Keep state in memory only.
        #[arg(long)]
        in_memory: bool,

        /// Status polls after which simulated backend jobs succeed.
        #[arg(long, default_value = "3")]
        simulate_polls: u32,
    },

    /// Render the deployment manifest for one network segment and exit.
    Manifest {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Network segment index.
        #[arg(long, default_value = "0")]
        index: u32,

        /// Service instance guid.
        #[arg(long)]
        instance: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,fabrikd=debug,fabrik=debug".into());
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Standalone {
            config,
            data_dir,
            identity,
            in_memory,
            simulate_polls,
        } => {
            let config = load_config(config.as_deref())?;
            run_standalone(config, data_dir, identity, in_memory, simulate_polls).await
        }
        Command::Manifest {
            config,
            index,
            instance,
        } => {
            let config = load_config(config.as_deref())?;
            print!("{}", render_manifest(&config, index, &instance)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FabrikConfig> {
    let config = match path {
        Some(path) => FabrikConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FabrikConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn render_manifest(config: &FabrikConfig, index: u32, instance: &str) -> anyhow::Result<String> {
    let network = &config.network;
    let plans = plan_networks(&network.networks, index, &network.segmentation)?;
    let deployment = &config.deployment;
    let manifest = DeploymentManifest::build(
        deployment_name(&deployment.name_prefix, index, instance),
        deployment.release.clone(),
        &deployment.instance_group,
        &plans,
        serde_json::json!({ "instance_guid": instance }),
    );
    Ok(manifest.to_yaml()?)
}

async fn run_standalone(
    config: FabrikConfig,
    data_dir: PathBuf,
    identity: Option<String>,
    in_memory: bool,
    simulate_polls: u32,
) -> anyhow::Result<()> {
    info!("Fabrik daemon starting in standalone mode");

    // ── Resource store ─────────────────────────────────────────

    let store = if in_memory {
        StateStore::open_in_memory()?
    } else {
        std::fs::create_dir_all(&data_dir)?;
        let db_path = data_dir.join("fabrik.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        store
    };
    let client: Arc<dyn ResourceClient> = Arc::new(store);

    // ── Engine ─────────────────────────────────────────────────

    let backends = Backends::simulated(simulate_polls);
    let engine = Engine::new(client, backends, config, identity)?;
    info!(identity = engine.identity(), "engine initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = engine.spawn(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "engine task ended abnormally");
        }
    }

    info!("Fabrik daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabrik_network::{NetworkSpec, SubnetSpec};

    #[test]
    fn manifest_for_segment() {
        let mut config = FabrikConfig::default();
        config.network.networks = vec![NetworkSpec::manual(
            "sf_network",
            vec![SubnetSpec::new("10.11.0.0/18", "z1")],
        )];
        let yaml = render_manifest(&config, 2, "abc").unwrap();
        assert!(yaml.contains("service-fabrik-0002-abc"));
        assert!(yaml.contains("iptables-manager"));
    }

    #[test]
    fn cli_parses_standalone() {
        let cli = Cli::try_parse_from([
            "fabrikd",
            "standalone",
            "--in-memory",
            "--identity",
            "fabrik-a",
            "--log-json",
        ])
        .unwrap();
        assert!(cli.log_json);
        match cli.command {
            Command::Standalone {
                in_memory,
                identity,
                simulate_polls,
                ..
            } => {
                assert!(in_memory);
                assert_eq!(identity.as_deref(), Some("fabrik-a"));
                assert_eq!(simulate_polls, 3);
            }
            Command::Manifest { .. } => panic!("wrong subcommand"),
        }
    }
}
