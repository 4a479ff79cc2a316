//! Proxmox VE provider.
//!
//! Implements the [`Hypervisor`](crate::providers::Hypervisor) trait over the
//! Proxmox VE REST API (`/api2/json`).
//!
//! ## Talos VM requirements
//!
//! - CPU type `host` (Talos needs x86-64-v2; `kvm64` does not boot)
//! - Memory ballooning disabled
//! - QEMU guest agent enabled so the VM reports its DHCP address
//! - Boot order: installer CD-ROM first, then the disk

mod client;
mod models;

pub use client::ProxmoxClient;
pub use models::*;
