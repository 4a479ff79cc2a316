//! Proxmox VE API request and response models.

use serde::{Deserialize, Serialize};

use crate::providers::CreateVmRequest;

/// Every API response wraps its payload in `data`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

// ============================================================================
// Authentication
// ============================================================================

/// Body for `POST /access/ticket`.
#[derive(Debug, Serialize)]
pub struct TicketRequest {
    pub username: String,
    pub password: String,
}

/// Ticket returned by a successful login.
#[derive(Debug, Clone, Deserialize)]
pub struct TicketData {
    /// Value of the `PVEAuthCookie` cookie.
    pub ticket: String,
    /// Required on every write request.
    #[serde(rename = "CSRFPreventionToken")]
    pub csrf_prevention_token: String,
    /// Authenticated user.
    pub username: String,
}

// ============================================================================
// VM types
// ============================================================================

/// An entry of `GET /nodes/{node}/qemu`.
#[derive(Debug, Clone, Deserialize)]
pub struct VmSummary {
    pub vmid: u32,
    pub name: Option<String>,
    /// `running` or `stopped`.
    pub status: String,
    /// QEMU's own view, e.g. `paused`. Only set with `full=1`.
    pub qmpstatus: Option<String>,
}

/// Body for `POST /nodes/{node}/qemu`.
///
/// Option strings use Proxmox's comma-separated property syntax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateVmBody {
    pub vmid: u32,
    pub name: String,
    pub bios: String,
    pub machine: String,
    pub cores: u32,
    pub sockets: u32,
    pub cpu: String,
    pub memory: u32,
    /// `0` disables ballooning; Talos does not support memory hotplug.
    pub balloon: u32,
    pub agent: String,
    pub ide2: String,
    pub boot: String,
    pub scsi0: String,
    pub scsihw: String,
    pub net0: String,
    pub ostype: String,
    pub onboot: u8,
    pub start: u8,
}

impl From<&CreateVmRequest> for CreateVmBody {
    fn from(req: &CreateVmRequest) -> Self {
        Self {
            vmid: req.vm_id,
            name: req.name.clone(),
            bios: "seabios".to_string(),
            machine: "q35".to_string(),
            cores: req.cpu_cores,
            sockets: 1,
            cpu: "host".to_string(),
            memory: req.memory_mb,
            balloon: 0,
            agent: "enabled=1,type=virtio".to_string(),
            ide2: format!("{},media=cdrom", req.iso_volume),
            boot: "order=ide2;scsi0".to_string(),
            scsi0: format!(
                "{}:{},format=raw,iothread=1,ssd=1,discard=on",
                req.storage_pool, req.disk_gb
            ),
            scsihw: "virtio-scsi-single".to_string(),
            net0: format!("virtio,bridge={},firewall=0", req.network_bridge),
            ostype: "l26".to_string(),
            onboot: 1,
            start: 1,
        }
    }
}

// ============================================================================
// Guest agent types
// ============================================================================

/// `GET /nodes/{node}/qemu/{vmid}/agent/network-get-interfaces`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentInterfaces {
    pub result: Vec<AgentInterface>,
}

/// A network interface as seen by the guest.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentInterface {
    pub name: String,
    #[serde(rename = "hardware-address")]
    pub hardware_address: Option<String>,
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<AgentIpAddress>,
}

/// One address on a guest interface.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentIpAddress {
    #[serde(rename = "ip-address")]
    pub ip_address: String,
    /// `ipv4` or `ipv6`.
    #[serde(rename = "ip-address-type")]
    pub ip_address_type: String,
    pub prefix: Option<u8>,
}

impl AgentInterfaces {
    /// IPv4 addresses grouped per interface, in reporting order.
    #[must_use]
    pub fn ipv4_by_interface(&self) -> Vec<Vec<String>> {
        self.result
            .iter()
            .map(|iface| {
                iface
                    .ip_addresses
                    .iter()
                    .filter(|a| a.ip_address_type == "ipv4")
                    .map(|a| a.ip_address.clone())
                    .collect()
            })
            .collect()
    }
}

// ============================================================================
// Task types
// ============================================================================

/// `GET /nodes/{node}/tasks/{upid}/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatus {
    /// `running` or `stopped`.
    pub status: String,
    /// Set once stopped; `OK` on success.
    pub exitstatus: Option<String>,
}

// ============================================================================
// Storage types
// ============================================================================

/// An entry of `GET /nodes/{node}/storage/{storage}/content`.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageContent {
    pub volid: String,
    pub format: Option<String>,
    pub size: Option<u64>,
}

/// Body for `POST /nodes/{node}/storage/{storage}/download-url`.
#[derive(Debug, Serialize)]
pub struct DownloadUrlBody {
    pub content: String,
    pub filename: String,
    pub url: String,
    #[serde(rename = "verify-certificates")]
    pub verify_certificates: u8,
}
