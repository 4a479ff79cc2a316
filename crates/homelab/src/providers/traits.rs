//! Hypervisor trait and common types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// VM not found.
    #[error("VM not found: {0}")]
    NotFound(u32),

    /// Operation timed out.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// A long-running task finished unsuccessfully.
    #[error("Task {upid} failed: {exit_status}")]
    TaskFailed { upid: String, exit_status: String },

    /// Login did not return a ticket.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// VM power status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    /// VM is running.
    Running,
    /// VM is stopped.
    Stopped,
    /// VM is paused.
    Paused,
    /// Unknown status.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Paused => write!(f, "paused"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A provisioned VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHandle {
    /// Numeric VM id.
    pub vm_id: u32,
    /// VM name.
    pub name: String,
    /// Current status.
    pub status: VmStatus,
    /// Primary IPv4 address, once the guest agent reports one.
    pub ipv4: Option<String>,
}

/// Request to download the installer ISO onto the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsoRequest {
    /// Source URL.
    pub url: String,
    /// File name on the datastore.
    pub file_name: String,
}

/// Request to create a new VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVmRequest {
    /// VM id.
    pub vm_id: u32,
    /// VM name.
    pub name: String,
    /// CPU cores (single socket).
    pub cpu_cores: u32,
    /// Dedicated memory in MiB.
    pub memory_mb: u32,
    /// Boot disk size in GiB.
    pub disk_gb: u32,
    /// Storage pool for the boot disk.
    pub storage_pool: String,
    /// Network bridge for the single NIC.
    pub network_bridge: String,
    /// Volume id of the installer ISO.
    pub iso_volume: String,
}

/// Trait for hypervisors that host the cluster VMs.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Make sure the installer ISO is present. Returns its volume id.
    ///
    /// An ISO already stored under the requested file name is left alone.
    async fn ensure_iso(&self, req: &IsoRequest) -> Result<String, ProviderError>;

    /// Create and start a VM.
    async fn create_vm(&self, req: &CreateVmRequest) -> Result<VmHandle, ProviderError>;

    /// Get a VM by id, or `None` if it does not exist.
    async fn get_vm(&self, vm_id: u32) -> Result<Option<VmHandle>, ProviderError>;

    /// Power on an existing VM and wait for the start task.
    async fn start_vm(&self, vm_id: u32) -> Result<(), ProviderError>;

    /// IPv4 addresses reported by the guest agent, one list per interface.
    ///
    /// Returns an empty list while the guest agent is not running yet.
    async fn ipv4_addresses(&self, vm_id: u32) -> Result<Vec<Vec<String>>, ProviderError>;

    /// Stop and delete a VM. Deleting an absent VM succeeds.
    async fn delete_vm(&self, vm_id: u32) -> Result<(), ProviderError>;
}

/// Pick the node address out of the guest agent's per-interface lists.
///
/// The first list is normally loopback, so the second interface wins when it
/// has an address.
#[must_use]
pub fn primary_ipv4(addresses: &[Vec<String>]) -> Option<String> {
    addresses
        .get(1)
        .and_then(|a| a.first())
        .or_else(|| addresses.first().and_then(|a| a.first()))
        .cloned()
}
