//! Talos Linux Kubernetes cluster provisioning on Proxmox VE.
//!
//! This crate creates one VM per node in a static node table, generates a
//! single set of cluster secrets, renders a Talos machine configuration for
//! every node, applies it, bootstraps etcd on the first control-plane node
//! and fetches the cluster credentials.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use homelab::providers::proxmox::ProxmoxClient;
//! use homelab::provision::Provisioner;
//! use homelab::talos::Talosctl;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = homelab::settings::Settings::load(None)?;
//!     let hypervisor = Arc::new(ProxmoxClient::new(&settings.proxmox)?);
//!     let talos = Arc::new(Talosctl::new(
//!         settings.state_dir.join("talosconfig"),
//!         &settings.state_dir,
//!     ));
//!
//!     let outputs = Provisioner::new(settings, hypervisor, talos)?.up().await?;
//!     println!("{}", outputs.kubeconfig.unwrap_or_default());
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod nodes;
pub mod plan;
pub mod providers;
pub mod provision;
pub mod settings;
pub mod state;
pub mod talos;

pub use nodes::{NodeSpec, NodeTable, Role};
pub use plan::{Plan, Step};
pub use providers::{CreateVmRequest, Hypervisor, IsoRequest, ProviderError, VmHandle};
pub use provision::Provisioner;
pub use settings::{ClusterSettings, Settings};
pub use state::{ClusterState, Outputs};
