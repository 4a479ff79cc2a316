//! Homelab CLI - Talos Kubernetes on Proxmox VE.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use homelab::providers::proxmox::ProxmoxClient;
use homelab::settings::{Settings, DEFAULT_STATE_DIR};
use homelab::state::Outputs;
use homelab::talos::Talosctl;
use homelab::Provisioner;

/// Homelab CLI - provision a Talos Kubernetes cluster on Proxmox VE.
#[derive(Parser)]
#[command(name = "homelab")]
#[command(about = "Provision and manage the homelab Talos cluster", version)]
struct Cli {
    /// Directory for secrets, rendered configs, state and outputs.
    #[arg(long, env = "HOMELAB_STATE_DIR", default_value = DEFAULT_STATE_DIR, global = true)]
    state_dir: PathBuf,

    /// TOML stack file with overrides.
    #[arg(long, env = "HOMELAB_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the VMs, apply configs, bootstrap and fetch credentials.
    Up,

    /// Delete every cluster VM.
    Destroy,

    /// Show the provisioning steps and their order without changing anything.
    Preview,

    /// Print the machine config of a node.
    Render {
        /// Node name, e.g. k8s-control-0.
        node: String,
    },

    /// Print the outputs of the last successful run.
    Output {
        /// A single key, e.g. kubeconfig or k8s-control-0.ip.
        key: Option<String>,

        /// Show credential values in the listing.
        #[arg(long)]
        show_secrets: bool,
    },
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let settings = Settings::load(self.config.as_deref()).context("Invalid configuration")?;
        Ok(settings.with_state_dir(&self.state_dir))
    }

    fn provisioner(&self) -> Result<(Provisioner, Talosctl)> {
        let settings = self.settings()?;

        let hypervisor = ProxmoxClient::new(&settings.proxmox)
            .context("Failed to create Proxmox client")?
            .with_task_timeout(settings.timeouts.vm_create)
            .with_download_timeout(settings.timeouts.iso_download);
        let talos = Talosctl::new(settings.state_dir.join("talosconfig"), &settings.state_dir);

        let provisioner =
            Provisioner::new(settings, Arc::new(hypervisor), Arc::new(talos.clone()))?;
        Ok((provisioner, talos))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Commands::Up => {
            let (provisioner, talos) = cli.provisioner()?;
            talos.check().await.context("talosctl is required")?;

            let outputs = provisioner.up().await?;

            println!("\nCluster ready!");
            for vm in outputs.control_plane.iter().chain(&outputs.workers) {
                println!("  {:<16} {:>5}  {}", vm.name, vm.vm_id, vm.ip);
            }
            println!("\nKubeconfig:  {}", provisioner.kubeconfig_path().display());
            println!("Talosconfig: {}", provisioner.talosconfig_path().display());
        }

        Commands::Destroy => {
            let (provisioner, _) = cli.provisioner()?;
            provisioner.destroy().await?;
            println!("Cluster destroyed. Secrets kept in {}", cli.state_dir.display());
        }

        Commands::Preview => {
            let (provisioner, _) = cli.provisioner()?;
            print!("{}", provisioner.preview()?);
        }

        Commands::Render { node } => {
            let (provisioner, _) = cli.provisioner()?;
            print!("{}", provisioner.render(node)?.to_yaml()?);
        }

        Commands::Output { key, show_secrets } => {
            let outputs = Outputs::load(&cli.state_dir)?;
            match key {
                Some(key) => {
                    let value = outputs
                        .get(key)
                        .ok_or_else(|| anyhow!("Unknown output: {key}"))?;
                    println!("{value}");
                }
                None => {
                    let entries = if *show_secrets {
                        outputs.entries()
                    } else {
                        outputs.masked_entries()
                    };
                    for (key, value) in entries {
                        if value.contains('\n') {
                            println!("{key}: <{} lines>", value.lines().count());
                        } else {
                            println!("{key}: {value}");
                        }
                    }
                    info!("Use `homelab output <key>` to print a single value");
                }
            }
        }
    }

    Ok(())
}
