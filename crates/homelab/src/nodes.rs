//! Static node table.
//!
//! Every node in the cluster is declared up front with its VM id, sizing and
//! role. The table is loaded once and never mutated afterwards.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when a node table is inconsistent.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum NodeTableError {
    /// At least one control-plane node is required to bootstrap.
    #[error("node table has no control-plane nodes")]
    NoControlPlane,

    /// Two nodes share a hostname.
    #[error("duplicate node name: {0}")]
    DuplicateName(String),

    /// Two nodes share a VM id.
    #[error("duplicate VM id: {0}")]
    DuplicateVmId(u32),

    /// A node is listed under the wrong role.
    #[error("node {name} is listed as a {listed} but declares role {declared}")]
    RoleMismatch {
        name: String,
        listed: Role,
        declared: Role,
    },
}

/// Machine role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Runs etcd and the Kubernetes control plane.
    #[serde(rename = "controlplane")]
    ControlPlane,
    /// Runs workloads only.
    #[serde(rename = "worker")]
    Worker,
}

impl Role {
    /// Talos machine type string for this role.
    #[must_use]
    pub fn machine_type(self) -> &'static str {
        match self {
            Self::ControlPlane => "controlplane",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.machine_type())
    }
}

/// Specification for a single Talos node VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Hostname, also used as the VM name.
    pub name: String,
    /// Proxmox VM id.
    pub vm_id: u32,
    /// Number of CPU cores.
    pub cpu_cores: u32,
    /// Dedicated memory in MiB.
    pub memory_mb: u32,
    /// Boot disk size in GiB.
    pub disk_gb: u32,
    /// Machine role.
    pub role: Role,
}

impl NodeSpec {
    /// Create a control-plane node spec.
    #[must_use]
    pub fn control_plane(name: impl Into<String>, vm_id: u32) -> Self {
        Self {
            name: name.into(),
            vm_id,
            cpu_cores: 4,
            memory_mb: 8192,
            disk_gb: 50,
            role: Role::ControlPlane,
        }
    }

    /// Create a worker node spec.
    #[must_use]
    pub fn worker(name: impl Into<String>, vm_id: u32) -> Self {
        Self {
            name: name.into(),
            vm_id,
            cpu_cores: 4,
            memory_mb: 16384,
            disk_gb: 100,
            role: Role::Worker,
        }
    }
}

/// Ordered control-plane and worker node lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTable {
    /// Control-plane nodes. The first entry is bootstrapped.
    pub control_plane: Vec<NodeSpec>,
    /// Worker nodes.
    #[serde(default)]
    pub workers: Vec<NodeSpec>,
}

impl Default for NodeTable {
    /// Three control-plane nodes (ids 200-202) and three workers (ids 210-212).
    fn default() -> Self {
        Self {
            control_plane: (0..3)
                .map(|i| NodeSpec::control_plane(format!("k8s-control-{i}"), 200 + i))
                .collect(),
            workers: (0..3)
                .map(|i| NodeSpec::worker(format!("k8s-worker-{i}"), 210 + i))
                .collect(),
        }
    }
}

impl NodeTable {
    /// Check the table is usable for provisioning.
    ///
    /// # Errors
    /// Returns an error if there is no control-plane node, a name or VM id is
    /// repeated, or a node sits in the list for the other role.
    pub fn validate(&self) -> Result<(), NodeTableError> {
        if self.control_plane.is_empty() {
            return Err(NodeTableError::NoControlPlane);
        }

        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        let listed = self
            .control_plane
            .iter()
            .map(|n| (n, Role::ControlPlane))
            .chain(self.workers.iter().map(|n| (n, Role::Worker)));

        for (node, role) in listed {
            if node.role != role {
                return Err(NodeTableError::RoleMismatch {
                    name: node.name.clone(),
                    listed: role,
                    declared: node.role,
                });
            }
            if !names.insert(node.name.as_str()) {
                return Err(NodeTableError::DuplicateName(node.name.clone()));
            }
            if !ids.insert(node.vm_id) {
                return Err(NodeTableError::DuplicateVmId(node.vm_id));
            }
        }

        Ok(())
    }

    /// The node the cluster is bootstrapped on.
    ///
    /// # Panics
    /// Panics if the table has no control-plane node; call [`Self::validate`] first.
    #[must_use]
    pub fn first_control_plane(&self) -> &NodeSpec {
        &self.control_plane[0]
    }

    /// All nodes, control plane first.
    pub fn all(&self) -> impl Iterator<Item = &NodeSpec> {
        self.control_plane.iter().chain(self.workers.iter())
    }

    /// Look up a node by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&NodeSpec> {
        self.all().find(|n| n.name == name)
    }

    /// Total number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.control_plane.len() + self.workers.len()
    }

    /// Whether the table declares no nodes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
