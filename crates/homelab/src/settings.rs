//! Process-wide settings.
//!
//! Settings are read once at startup, from lowest to highest precedence:
//! built-in defaults, environment variables (a `.env` file is loaded into the
//! environment by the binary), then an optional TOML stack file. Required
//! secrets that are missing fail here, before any resource is touched.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::nodes::{NodeTable, NodeTableError};
use crate::talos::image::DEFAULT_SCHEMATIC_ID;

/// Default Talos version.
pub const DEFAULT_TALOS_VERSION: &str = "v1.9.0";

/// Kubernetes version shipped with [`DEFAULT_TALOS_VERSION`].
pub const DEFAULT_KUBERNETES_VERSION: &str = "v1.32.0";

/// Default directory for secrets, rendered configs and outputs.
pub const DEFAULT_STATE_DIR: &str = ".homelab";

/// Errors raised while loading settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// A required environment variable is not set.
    #[error("required setting {0} is not set")]
    Missing(&'static str),

    /// A value could not be parsed.
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    /// Neither an API token nor a username/password pair was given.
    #[error("Proxmox credentials missing: set PROXMOX_VE_API_TOKEN or PROXMOX_VE_USERNAME and PROXMOX_VE_PASSWORD")]
    MissingProxmoxCredentials,

    /// The stack file could not be read.
    #[error("failed to read stack file {path}: {source}")]
    StackFileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The stack file is not valid TOML.
    #[error("failed to parse stack file {path}: {source}")]
    StackFileParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// The node table is inconsistent.
    #[error(transparent)]
    Nodes(#[from] NodeTableError),
}

/// How to authenticate against the Proxmox VE API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxmoxAuth {
    /// `user@realm!token-id=secret`.
    ApiToken(String),
    /// Ticket login with a username and password.
    Password { username: String, password: String },
}

/// Proxmox VE API configuration.
#[derive(Debug, Clone)]
pub struct ProxmoxSettings {
    /// API endpoint, e.g. `https://pve.lan:8006/`.
    pub endpoint: String,
    /// Credentials.
    pub auth: ProxmoxAuth,
    /// Skip TLS verification (self-signed Proxmox certs).
    pub insecure: bool,
    /// Proxmox node that hosts the VMs.
    pub node_name: String,
    /// Datastore the installer ISO is downloaded to.
    pub iso_datastore: String,
}

/// Cluster-wide settings shared by every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Cluster name.
    pub name: String,
    /// Talos version, e.g. `v1.9.0`.
    pub talos_version: String,
    /// Kubernetes version installed by Talos.
    pub kubernetes_version: String,
    /// Proxmox storage pool for VM disks.
    pub storage_pool: String,
    /// Proxmox network bridge.
    pub network_bridge: String,
    /// Stable API endpoint hostname shared by the control plane.
    pub vip_hostname: Option<String>,
    /// Disk Talos installs to.
    pub install_disk: String,
    /// Image Factory schematic id.
    pub schematic_id: String,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            name: "homelab".to_string(),
            talos_version: DEFAULT_TALOS_VERSION.to_string(),
            kubernetes_version: DEFAULT_KUBERNETES_VERSION.to_string(),
            storage_pool: "local-lvm".to_string(),
            network_bridge: "vmbr0".to_string(),
            vip_hostname: None,
            install_disk: "/dev/sda".to_string(),
            schematic_id: DEFAULT_SCHEMATIC_ID.to_string(),
        }
    }
}

/// Tailscale extension settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailscaleSettings {
    /// Auth key the node extension joins the tailnet with.
    pub authkey: String,
}

/// Timeouts for the provider calls that can block on external convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Applying a machine configuration.
    pub apply: Duration,
    /// Bootstrapping etcd.
    pub bootstrap: Duration,
    /// Proxmox create, start and delete tasks.
    pub vm_create: Duration,
    /// Downloading the installer ISO onto the datastore.
    pub iso_download: Duration,
    /// Waiting for the guest agent to report an address.
    pub ip_wait: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            apply: Duration::from_secs(15 * 60),
            bootstrap: Duration::from_secs(15 * 60),
            vm_create: Duration::from_secs(300),
            iso_download: Duration::from_secs(600),
            ip_wait: Duration::from_secs(15 * 60),
        }
    }
}

/// Everything the provisioner needs, loaded once.
#[derive(Debug, Clone)]
pub struct Settings {
    pub proxmox: ProxmoxSettings,
    pub cluster: ClusterSettings,
    pub tailscale: TailscaleSettings,
    pub nodes: NodeTable,
    pub timeouts: Timeouts,
    /// Where secrets, rendered configs, the state log and outputs live.
    pub state_dir: PathBuf,
}

/// Optional TOML overrides.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackFile {
    #[serde(default)]
    pub proxmox: ProxmoxOverrides,
    #[serde(default)]
    pub cluster: ClusterOverrides,
    #[serde(default)]
    pub timeouts: TimeoutOverrides,
    pub nodes: Option<NodeTable>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxmoxOverrides {
    pub node_name: Option<String>,
    pub iso_datastore: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterOverrides {
    pub name: Option<String>,
    pub talos_version: Option<String>,
    pub kubernetes_version: Option<String>,
    pub storage_pool: Option<String>,
    pub network_bridge: Option<String>,
    pub vip_hostname: Option<String>,
    pub install_disk: Option<String>,
    pub schematic_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutOverrides {
    pub apply_secs: Option<u64>,
    pub bootstrap_secs: Option<u64>,
    pub vm_create_secs: Option<u64>,
    pub iso_download_secs: Option<u64>,
    pub ip_wait_secs: Option<u64>,
}

impl StackFile {
    /// Read a stack file from disk.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content =
            std::fs::read_to_string(path).map_err(|source| SettingsError::StackFileRead {
                path: path.to_path_buf(),
                source,
            })?;
        toml::from_str(&content).map_err(|source| SettingsError::StackFileParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Settings {
    /// Load settings from the process environment and an optional stack file.
    ///
    /// # Errors
    /// Returns an error if a required secret is missing or a value is invalid.
    pub fn load(stack_file: Option<&Path>) -> Result<Self, SettingsError> {
        let stack = stack_file.map(StackFile::load).transpose()?;
        Self::from_lookup(|key| std::env::var(key).ok(), stack)
    }

    /// Build settings from an arbitrary variable lookup.
    ///
    /// # Errors
    /// Returns an error if a required secret is missing or a value is invalid.
    pub fn from_lookup<F>(lookup: F, stack: Option<StackFile>) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty values are treated as unset, the way `.env` files leave them.
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| var(key).ok_or(SettingsError::Missing(key));

        let auth = match var("PROXMOX_VE_API_TOKEN") {
            Some(token) => ProxmoxAuth::ApiToken(token),
            None => match (var("PROXMOX_VE_USERNAME"), var("PROXMOX_VE_PASSWORD")) {
                (Some(username), Some(password)) => ProxmoxAuth::Password { username, password },
                _ => return Err(SettingsError::MissingProxmoxCredentials),
            },
        };

        let insecure = match var("PROXMOX_VE_INSECURE") {
            Some(v) => parse_bool(&v).ok_or_else(|| SettingsError::Invalid {
                var: "PROXMOX_VE_INSECURE",
                reason: format!("expected a boolean, got '{v}'"),
            })?,
            None => true,
        };

        let mut proxmox = ProxmoxSettings {
            endpoint: required("PROXMOX_VE_ENDPOINT")?,
            auth,
            insecure,
            node_name: var("PROXMOX_NODE").unwrap_or_else(|| "proxmox".to_string()),
            iso_datastore: var("PROXMOX_ISO_DATASTORE").unwrap_or_else(|| "local".to_string()),
        };

        let defaults = ClusterSettings::default();
        let mut cluster = ClusterSettings {
            name: var("CLUSTER_NAME").unwrap_or(defaults.name),
            talos_version: var("CLUSTER_TALOS_VERSION").unwrap_or(defaults.talos_version),
            kubernetes_version: var("CLUSTER_KUBERNETES_VERSION")
                .unwrap_or(defaults.kubernetes_version),
            storage_pool: var("CLUSTER_STORAGE_POOL").unwrap_or(defaults.storage_pool),
            network_bridge: var("CLUSTER_NETWORK_BRIDGE").unwrap_or(defaults.network_bridge),
            vip_hostname: var("CLUSTER_VIP_HOSTNAME"),
            install_disk: var("CLUSTER_INSTALL_DISK").unwrap_or(defaults.install_disk),
            schematic_id: var("CLUSTER_SCHEMATIC_ID").unwrap_or(defaults.schematic_id),
        };

        let tailscale = TailscaleSettings {
            authkey: required("TAILSCALE_AUTHKEY")?,
        };

        let mut nodes = NodeTable::default();
        let mut timeouts = Timeouts::default();

        if let Some(stack) = stack {
            debug!("Applying stack file overrides");
            stack.apply(&mut proxmox, &mut cluster, &mut timeouts, &mut nodes);
        }

        nodes.validate()?;

        Ok(Self {
            proxmox,
            cluster,
            tailscale,
            nodes,
            timeouts,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
        })
    }

    /// Set the state directory.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }
}

impl StackFile {
    fn apply(
        self,
        proxmox: &mut ProxmoxSettings,
        cluster: &mut ClusterSettings,
        timeouts: &mut Timeouts,
        nodes: &mut NodeTable,
    ) {
        fn set<T>(target: &mut T, value: Option<T>) {
            if let Some(v) = value {
                *target = v;
            }
        }

        set(&mut proxmox.node_name, self.proxmox.node_name);
        set(&mut proxmox.iso_datastore, self.proxmox.iso_datastore);

        let c = self.cluster;
        set(&mut cluster.name, c.name);
        set(&mut cluster.talos_version, c.talos_version);
        set(&mut cluster.kubernetes_version, c.kubernetes_version);
        set(&mut cluster.storage_pool, c.storage_pool);
        set(&mut cluster.network_bridge, c.network_bridge);
        set(&mut cluster.install_disk, c.install_disk);
        set(&mut cluster.schematic_id, c.schematic_id);
        if let Some(vip) = c.vip_hostname {
            cluster.vip_hostname = Some(vip).filter(|v| !v.is_empty());
        }

        let t = self.timeouts;
        set(&mut timeouts.apply, t.apply_secs.map(Duration::from_secs));
        set(&mut timeouts.bootstrap, t.bootstrap_secs.map(Duration::from_secs));
        set(&mut timeouts.vm_create, t.vm_create_secs.map(Duration::from_secs));
        set(&mut timeouts.iso_download, t.iso_download_secs.map(Duration::from_secs));
        set(&mut timeouts.ip_wait, t.ip_wait_secs.map(Duration::from_secs));

        set(nodes, self.nodes);
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
