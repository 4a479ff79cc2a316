//! Cluster provisioning state persistence.
//!
//! [`ClusterState`] is a write-ahead log of what a run has done so far, so an
//! interrupted `up` can be re-run and an operator can see where it stopped.
//! [`Outputs`] holds the values exported for external tooling.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::providers::{primary_ipv4, ProviderError};
use crate::talos::secrets::write_private;

/// Placeholder for values not known yet.
pub const PENDING: &str = "pending";

/// Shown in place of a credential output.
pub const SECRET: &str = "[secret]";

/// Outputs that hold credentials.
const SECRET_KEYS: &[&str] = &[
    "kubeconfig",
    "talosconfig",
    "talos_client_crt",
    "talos_client_key",
];

/// Cluster provisioning state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Cluster name.
    pub name: String,
    /// Per-node progress keyed by node name.
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeState>,
    /// Whether etcd has been bootstrapped.
    #[serde(default)]
    pub bootstrapped: bool,
    /// Whether the kubeconfig has been retrieved.
    #[serde(default)]
    pub kubeconfig_fetched: bool,
    /// Timestamp of last update.
    pub updated_at: String,
}

/// Individual node state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// Proxmox VM id.
    pub vm_id: u32,
    /// Address reported by the guest agent.
    pub ip: Option<String>,
    /// Whether the machine config has been applied.
    #[serde(default)]
    pub config_applied: bool,
}

impl ClusterState {
    /// Create a new cluster state.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: BTreeMap::new(),
            bootstrapped: false,
            kubeconfig_fetched: false,
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Get the state file path.
    #[must_use]
    pub fn state_file(state_dir: &Path) -> PathBuf {
        state_dir.join("cluster-state.json")
    }

    /// Load state from file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(state_dir: &Path) -> Result<Option<Self>> {
        let path = Self::state_file(state_dir);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path).context("Failed to read state file")?;
        let state: Self = serde_json::from_str(&content).context("Failed to parse state file")?;

        info!(
            nodes = state.nodes.len(),
            bootstrapped = state.bootstrapped,
            "Loaded cluster state"
        );
        Ok(Some(state))
    }

    /// Save state to file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&mut self, state_dir: &Path) -> Result<()> {
        self.updated_at = chrono::Utc::now().to_rfc3339();

        std::fs::create_dir_all(state_dir).context("Failed to create state directory")?;
        let content = serde_json::to_string_pretty(self).context("Failed to serialize state")?;
        std::fs::write(Self::state_file(state_dir), content)
            .context("Failed to write state file")?;

        Ok(())
    }

    /// Record a node's VM and address.
    pub fn set_node(&mut self, name: &str, vm_id: u32, ip: Option<String>) {
        let node = self.nodes.entry(name.to_string()).or_insert(NodeState {
            vm_id,
            ip: None,
            config_applied: false,
        });
        node.vm_id = vm_id;
        node.ip = ip;
    }

    /// Mark a node's config as applied.
    pub fn set_config_applied(&mut self, name: &str) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.config_applied = true;
        }
    }

    /// Address of a node, if known.
    #[must_use]
    pub fn ip(&self, name: &str) -> Option<&str> {
        self.nodes.get(name).and_then(|n| n.ip.as_deref())
    }
}

/// Bounded exponential backoff for polling external convergence.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Initial delay between polls.
    pub initial_delay: Duration,
    /// Maximum delay between polls.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Total time allowed.
    pub timeout: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            timeout: Duration::from_secs(15 * 60),
        }
    }
}

impl Backoff {
    /// Default backoff with a different overall timeout.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        std::cmp::min(
            self.max_delay,
            Duration::from_secs_f64(delay.as_secs_f64() * self.multiplier),
        )
    }

    /// Poll `f` until it yields a value or the timeout passes.
    ///
    /// # Errors
    /// Returns the first error from `f`, or [`ProviderError::Timeout`].
    pub async fn poll<T, F, Fut>(&self, what: &str, mut f: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, ProviderError>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut delay = self.initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if let Some(value) = f().await? {
                return Ok(value);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ProviderError::Timeout(self.timeout.as_secs()));
            }

            debug!(what, attempt, delay_secs = delay.as_secs(), "Not ready, waiting");
            tokio::time::sleep(std::cmp::min(delay, deadline - now)).await;
            delay = self.next_delay(delay);
        }
    }
}

/// Wait until the guest agent of `vm_id` reports a usable IPv4 address.
///
/// # Errors
/// Returns an error if the hypervisor call fails or the timeout passes.
pub async fn wait_for_ipv4(
    hypervisor: &dyn crate::providers::Hypervisor,
    vm_id: u32,
    backoff: &Backoff,
) -> Result<String, ProviderError> {
    let ip = backoff
        .poll("guest agent address", || async move {
            Ok(primary_ipv4(&hypervisor.ipv4_addresses(vm_id).await?))
        })
        .await?;
    info!(vm_id, ip = %ip, "VM address discovered");
    Ok(ip)
}

/// A provisioned VM as exported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmOutput {
    pub vm_id: u32,
    pub name: String,
    /// [`PENDING`] until the guest agent reports an address.
    pub ip: String,
}

/// Values exported after a run, persisted to `outputs.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outputs {
    /// Volume id of the installer ISO.
    pub iso_id: Option<String>,
    pub control_plane: Vec<VmOutput>,
    pub workers: Vec<VmOutput>,
    pub kubeconfig: Option<String>,
    pub talosconfig: Option<String>,
    pub talos_client_ca: Option<String>,
    pub talos_client_crt: Option<String>,
    pub talos_client_key: Option<String>,
}

impl Outputs {
    /// Get the outputs file path.
    #[must_use]
    pub fn file(state_dir: &Path) -> PathBuf {
        state_dir.join("outputs.json")
    }

    /// Load outputs from file.
    ///
    /// # Errors
    /// Returns an error if the file is missing or cannot be parsed.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = Self::file(state_dir);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("No outputs at {}; run `homelab up` first", path.display()))?;
        serde_json::from_str(&content).context("Failed to parse outputs file")
    }

    /// Save outputs to file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(state_dir).context("Failed to create state directory")?;
        let content = serde_json::to_string_pretty(self).context("Failed to serialize outputs")?;
        // Holds the kubeconfig and the admin client key.
        write_private(&Self::file(state_dir), content.as_bytes())
            .context("Failed to write outputs file")
    }

    /// Flat key/value view, e.g. `k8s-control-0.ip` or `kubeconfig`.
    #[must_use]
    pub fn entries(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();

        let mut put = |key: &str, value: Option<&String>| {
            map.insert(
                key.to_string(),
                value.map_or_else(|| PENDING.to_string(), Clone::clone),
            );
        };
        put("iso_id", self.iso_id.as_ref());
        put("kubeconfig", self.kubeconfig.as_ref());
        put("talosconfig", self.talosconfig.as_ref());
        put("talos_client_ca", self.talos_client_ca.as_ref());
        put("talos_client_crt", self.talos_client_crt.as_ref());
        put("talos_client_key", self.talos_client_key.as_ref());

        for vm in self.control_plane.iter().chain(&self.workers) {
            map.insert(format!("{}.vm_id", vm.name), vm.vm_id.to_string());
            map.insert(format!("{}.ip", vm.name), vm.ip.clone());
        }
        map
    }

    /// Look up a single output by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries().remove(key)
    }

    /// Whether `key` names a credential.
    #[must_use]
    pub fn is_secret(key: &str) -> bool {
        SECRET_KEYS.contains(&key)
    }

    /// [`Outputs::entries`] with known credential values replaced by
    /// [`SECRET`].
    #[must_use]
    pub fn masked_entries(&self) -> BTreeMap<String, String> {
        let mut entries = self.entries();
        for (key, value) in &mut entries {
            if Self::is_secret(key) && value != PENDING {
                *value = SECRET.to_string();
            }
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_cluster_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ClusterState::load(dir.path()).unwrap().is_none());

        let mut state = ClusterState::new("homelab");
        state.set_node("k8s-control-0", 200, Some("192.168.1.50".to_string()));
        state.set_config_applied("k8s-control-0");
        state.save(dir.path()).unwrap();

        let loaded = ClusterState::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.ip("k8s-control-0"), Some("192.168.1.50"));
        assert!(loaded.nodes["k8s-control-0"].config_applied);
        assert!(!loaded.bootstrapped);
    }

    #[test]
    fn test_set_node_keeps_applied_flag() {
        let mut state = ClusterState::new("homelab");
        state.set_node("w", 210, None);
        state.set_config_applied("w");
        state.set_node("w", 210, Some("10.0.0.9".to_string()));
        assert!(state.nodes["w"].config_applied);
        assert_eq!(state.ip("w"), Some("10.0.0.9"));
    }

    #[test]
    fn test_backoff_delays_are_capped() {
        let backoff = Backoff::default();
        let mut delay = backoff.initial_delay;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(delay.as_secs());
            delay = backoff.next_delay(delay);
        }
        assert_eq!(seen, vec![5, 10, 20, 30, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_ready() {
        let calls = AtomicU32::new(0);
        let value = Backoff::default()
            .poll("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok((n >= 2).then_some(n)) }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out() {
        let backoff = Backoff::with_timeout(Duration::from_secs(60));
        let result: Result<(), _> = backoff.poll("test", || async { Ok(None) }).await;
        assert!(matches!(result, Err(ProviderError::Timeout(60))));
    }

    #[test]
    fn test_outputs_entries() {
        let outputs = Outputs {
            iso_id: Some("local:iso/talos-v1.9.0-amd64.iso".to_string()),
            control_plane: vec![VmOutput {
                vm_id: 200,
                name: "k8s-control-0".to_string(),
                ip: "192.168.1.50".to_string(),
            }],
            workers: vec![VmOutput {
                vm_id: 210,
                name: "k8s-worker-0".to_string(),
                ip: PENDING.to_string(),
            }],
            ..Outputs::default()
        };

        assert_eq!(outputs.get("k8s-control-0.ip").as_deref(), Some("192.168.1.50"));
        assert_eq!(outputs.get("k8s-worker-0.vm_id").as_deref(), Some("210"));
        assert_eq!(outputs.get("k8s-worker-0.ip").as_deref(), Some(PENDING));
        assert_eq!(outputs.get("kubeconfig").as_deref(), Some(PENDING));
        assert_eq!(outputs.get("nope"), None);
    }

    #[test]
    fn test_masked_entries_hide_credentials() {
        let outputs = Outputs {
            iso_id: Some("local:iso/talos-v1.9.0-amd64.iso".to_string()),
            kubeconfig: Some("apiVersion: v1\n".to_string()),
            talosconfig: Some("context: homelab\n".to_string()),
            talos_client_ca: Some("Y2E=".to_string()),
            talos_client_crt: Some("Y3J0".to_string()),
            talos_client_key: Some("a2V5".to_string()),
            ..Outputs::default()
        };

        let masked = outputs.masked_entries();
        for key in ["kubeconfig", "talosconfig", "talos_client_crt", "talos_client_key"] {
            assert_eq!(masked[key], SECRET, "{key}");
        }
        assert_eq!(masked["talos_client_ca"], "Y2E=");
        assert_eq!(masked["iso_id"], "local:iso/talos-v1.9.0-amd64.iso");

        // Named lookups still return the value.
        assert_eq!(outputs.get("talos_client_key").as_deref(), Some("a2V5"));

        let empty = Outputs::default().masked_entries();
        assert_eq!(empty["talos_client_key"], PENDING);
    }

    #[cfg(unix)]
    #[test]
    fn test_outputs_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        Outputs::default().save(dir.path()).unwrap();

        let mode = std::fs::metadata(Outputs::file(dir.path()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_outputs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Outputs::load(dir.path()).is_err());

        let outputs = Outputs {
            kubeconfig: Some("apiVersion: v1\n".to_string()),
            ..Outputs::default()
        };
        outputs.save(dir.path()).unwrap();
        assert_eq!(Outputs::load(dir.path()).unwrap(), outputs);
    }
}
