//! Cluster bring-up and tear-down.
//!
//! [`Provisioner`] wires the hypervisor, the Talos client and the generated
//! configs together and drives them through the [`Plan`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::nodes::NodeSpec;
use crate::plan::{self, Plan, Step};
use crate::providers::{CreateVmRequest, Hypervisor, IsoRequest, VmStatus};
use crate::settings::Settings;
use crate::state::{self, Backoff, ClusterState, Outputs, VmOutput, PENDING};
use crate::talos::config::uses_fallback_endpoint;
use crate::talos::secrets::write_private;
use crate::talos::{
    cluster_endpoint, generate, render_talosconfig, ApplyMode, MachineConfig, MachineSecrets,
    TalosApi, TalosImage,
};

/// Provisions and tears down the cluster described by [`Settings`].
pub struct Provisioner {
    settings: Arc<Settings>,
    hypervisor: Arc<dyn Hypervisor>,
    talos: Arc<dyn TalosApi>,
    backoff: Backoff,
}

/// Everything a running step needs.
struct Run {
    settings: Arc<Settings>,
    hypervisor: Arc<dyn Hypervisor>,
    talos: Arc<dyn TalosApi>,
    backoff: Backoff,
    secrets: Arc<MachineSecrets>,
    endpoint: String,
    image: TalosImage,
    state: Mutex<ClusterState>,
    iso: Mutex<Option<String>>,
    kubeconfig: Mutex<Option<String>>,
}

impl Provisioner {
    /// Create a provisioner.
    ///
    /// # Errors
    /// Returns an error if the node table is invalid.
    pub fn new(
        settings: Settings,
        hypervisor: Arc<dyn Hypervisor>,
        talos: Arc<dyn TalosApi>,
    ) -> Result<Self> {
        settings.nodes.validate().context("Invalid node table")?;
        let backoff = Backoff::with_timeout(settings.timeouts.ip_wait);

        Ok(Self {
            settings: Arc::new(settings),
            hypervisor,
            talos,
            backoff,
        })
    }

    /// Use a different polling schedule for address discovery.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn state_dir(&self) -> &Path {
        &self.settings.state_dir
    }

    /// Path of the persisted machine secrets.
    #[must_use]
    pub fn secrets_path(&self) -> PathBuf {
        self.state_dir().join("secrets.yaml")
    }

    /// Path of the rendered talosconfig.
    #[must_use]
    pub fn talosconfig_path(&self) -> PathBuf {
        self.state_dir().join("talosconfig")
    }

    /// Path of the retrieved kubeconfig.
    #[must_use]
    pub fn kubeconfig_path(&self) -> PathBuf {
        self.state_dir().join("kubeconfig")
    }

    /// The bring-up plan for the configured nodes.
    ///
    /// # Errors
    /// Returns an error if the plan cannot be built.
    pub fn plan(&self) -> Result<Plan> {
        Plan::build(&self.settings.nodes).context("Failed to build provisioning plan")
    }

    /// Describe the plan without touching anything.
    ///
    /// # Errors
    /// Returns an error if the plan cannot be built.
    pub fn preview(&self) -> Result<String> {
        let plan = self.plan()?;
        let mut out = format!(
            "Cluster {} ({} control plane, {} workers), endpoint {}\n",
            self.settings.cluster.name,
            self.settings.nodes.control_plane.len(),
            self.settings.nodes.workers.len(),
            cluster_endpoint(&self.settings.cluster, &self.settings.nodes),
        );

        for (i, step) in plan.topological_order()?.iter().enumerate() {
            let deps = plan.dependencies(step);
            if deps.is_empty() {
                out.push_str(&format!("{:>3}. {step}\n", i + 1));
            } else {
                let deps: Vec<String> = deps.iter().map(ToString::to_string).collect();
                out.push_str(&format!("{:>3}. {step} (after {})\n", i + 1, deps.join(", ")));
            }
        }
        Ok(out)
    }

    /// Render the machine config of a single node.
    ///
    /// Generates and persists the cluster secrets if they do not exist yet.
    ///
    /// # Errors
    /// Returns an error if the node is unknown or the secrets are unusable.
    pub fn render(&self, node: &str) -> Result<MachineConfig> {
        let spec = self
            .settings
            .nodes
            .get(node)
            .ok_or_else(|| anyhow!("Unknown node: {node}"))?;
        let (secrets, _) = MachineSecrets::load_or_generate(&self.secrets_path())?;
        let endpoint = cluster_endpoint(&self.settings.cluster, &self.settings.nodes);

        Ok(generate(
            spec,
            &self.settings.cluster,
            &self.settings.tailscale,
            &secrets,
            &endpoint,
        ))
    }

    /// Converge the cluster: create the VMs, apply configs, bootstrap and
    /// fetch credentials.
    ///
    /// # Errors
    /// Returns the first failure; nothing is rolled back.
    pub async fn up(&self) -> Result<Outputs> {
        let settings = &self.settings;
        let state_dir = self.state_dir();
        std::fs::create_dir_all(state_dir).context("Failed to create state directory")?;

        info!(
            cluster = %settings.cluster.name,
            talos_version = %settings.cluster.talos_version,
            nodes = settings.nodes.len(),
            "Provisioning cluster"
        );

        let (secrets, generated) = MachineSecrets::load_or_generate(&self.secrets_path())?;
        if generated {
            info!("New cluster secrets; every node will get a fresh PKI");
        }

        let endpoint = cluster_endpoint(&settings.cluster, &settings.nodes);
        if uses_fallback_endpoint(&settings.cluster) {
            warn!(
                endpoint = %endpoint,
                "No VIP hostname configured; using the first control-plane node's name, which must resolve via external DNS"
            );
        }

        // Needed before any apply so re-runs can authenticate to configured nodes.
        let talosconfig = render_talosconfig(
            &settings.cluster.name,
            &settings.nodes.first_control_plane().name,
            &secrets.client,
        );
        write_private(&self.talosconfig_path(), talosconfig.as_bytes())
            .context("Failed to write talosconfig")?;

        let state = ClusterState::load(state_dir)?
            .unwrap_or_else(|| ClusterState::new(&settings.cluster.name));

        let run = Arc::new(Run {
            settings: Arc::clone(settings),
            hypervisor: Arc::clone(&self.hypervisor),
            talos: Arc::clone(&self.talos),
            backoff: self.backoff.clone(),
            image: TalosImage::new(&settings.cluster.talos_version, &settings.cluster.schematic_id),
            secrets: Arc::new(secrets),
            endpoint,
            state: Mutex::new(state),
            iso: Mutex::new(None),
            kubeconfig: Mutex::new(None),
        });

        let plan = self.plan()?;
        let runner = Arc::clone(&run);
        plan::execute(&plan, move |step| {
            let run = Arc::clone(&runner);
            async move { run.step(step).await }
        })
        .await?;

        let outputs = run.outputs(talosconfig).await;
        outputs.save(state_dir)?;
        info!(
            cluster = %settings.cluster.name,
            kubeconfig = %self.kubeconfig_path().display(),
            "Cluster provisioned"
        );
        Ok(outputs)
    }

    /// Delete every VM, workers first.
    ///
    /// The machine secrets are kept.
    ///
    /// # Errors
    /// Returns the first deletion failure.
    pub async fn destroy(&self) -> Result<()> {
        let nodes: Vec<&NodeSpec> = self.settings.nodes.all().collect();
        for node in nodes.into_iter().rev() {
            info!(node = %node.name, vm_id = node.vm_id, "Destroying VM");
            self.hypervisor
                .delete_vm(node.vm_id)
                .await
                .with_context(|| format!("Failed to delete VM {} ({})", node.vm_id, node.name))?;
        }

        for path in [
            ClusterState::state_file(self.state_dir()),
            Outputs::file(self.state_dir()),
            self.kubeconfig_path(),
        ] {
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }

        info!(cluster = %self.settings.cluster.name, "Cluster destroyed");
        Ok(())
    }
}

impl Run {
    async fn step(&self, step: Step) -> Result<()> {
        match step {
            Step::DownloadIso => self.download_iso().await,
            Step::CreateVm(name) => self.create_vm(self.node(&name)?).await,
            Step::ApplyConfig(name) => self.apply_config(self.node(&name)?).await,
            Step::Bootstrap => self.bootstrap().await,
            Step::Kubeconfig => self.fetch_kubeconfig().await,
        }
    }

    fn node(&self, name: &str) -> Result<&NodeSpec> {
        self.settings
            .nodes
            .get(name)
            .ok_or_else(|| anyhow!("Unknown node: {name}"))
    }

    async fn ip(&self, name: &str) -> Result<String> {
        self.state
            .lock()
            .await
            .ip(name)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("No address known for {name}"))
    }

    async fn save_state(&self, update: impl FnOnce(&mut ClusterState)) -> Result<()> {
        let mut state = self.state.lock().await;
        update(&mut state);
        state.save(&self.settings.state_dir)
    }

    async fn download_iso(&self) -> Result<()> {
        let req = IsoRequest {
            url: self.image.iso_url(),
            file_name: self.image.iso_file_name(),
        };
        let volume = self
            .hypervisor
            .ensure_iso(&req)
            .await
            .context("Failed to download Talos ISO")?;
        *self.iso.lock().await = Some(volume);
        Ok(())
    }

    async fn create_vm(&self, node: &NodeSpec) -> Result<()> {
        let iso_volume = self
            .iso
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("ISO volume not available"))?;

        if let Some(vm) = self.hypervisor.get_vm(node.vm_id).await? {
            info!(node = %node.name, vm_id = vm.vm_id, status = %vm.status, "VM exists, reusing");
            if vm.status != VmStatus::Running {
                self.hypervisor
                    .start_vm(node.vm_id)
                    .await
                    .with_context(|| format!("Failed to start VM for {}", node.name))?;
            }
        } else {
            let cluster = &self.settings.cluster;
            self.hypervisor
                .create_vm(&CreateVmRequest {
                    vm_id: node.vm_id,
                    name: node.name.clone(),
                    cpu_cores: node.cpu_cores,
                    memory_mb: node.memory_mb,
                    disk_gb: node.disk_gb,
                    storage_pool: cluster.storage_pool.clone(),
                    network_bridge: cluster.network_bridge.clone(),
                    iso_volume,
                })
                .await
                .with_context(|| format!("Failed to create VM for {}", node.name))?;
        }

        let ip = state::wait_for_ipv4(self.hypervisor.as_ref(), node.vm_id, &self.backoff)
            .await
            .with_context(|| format!("No address reported for {}", node.name))?;

        self.save_state(|s| s.set_node(&node.name, node.vm_id, Some(ip)))
            .await
    }

    async fn apply_config(&self, node: &NodeSpec) -> Result<()> {
        let ip = self.ip(&node.name).await?;
        let config = generate(
            node,
            &self.settings.cluster,
            &self.settings.tailscale,
            &self.secrets,
            &self.endpoint,
        );

        self.talos
            .apply_config(&ip, &config, ApplyMode::Reboot, self.settings.timeouts.apply)
            .await
            .with_context(|| format!("Failed to apply config to {}", node.name))?;
        info!(node = %node.name, role = %node.role, ip = %ip, "Config applied");

        self.save_state(|s| s.set_config_applied(&node.name)).await
    }

    async fn bootstrap(&self) -> Result<()> {
        let first = self.settings.nodes.first_control_plane();
        let ip = self.ip(&first.name).await?;

        info!(node = %first.name, ip = %ip, "Bootstrapping cluster");
        self.talos
            .bootstrap(&ip, self.settings.timeouts.bootstrap)
            .await
            .context("Failed to bootstrap cluster")?;

        self.save_state(|s| s.bootstrapped = true).await
    }

    async fn fetch_kubeconfig(&self) -> Result<()> {
        let first = self.settings.nodes.first_control_plane();
        let ip = self.ip(&first.name).await?;

        let kubeconfig = self
            .talos
            .kubeconfig(&ip)
            .await
            .context("Failed to retrieve kubeconfig")?;

        let path = self.settings.state_dir.join("kubeconfig");
        write_private(&path, kubeconfig.as_bytes()).context("Failed to write kubeconfig")?;
        info!(path = %path.display(), "Kubeconfig written");

        *self.kubeconfig.lock().await = Some(kubeconfig);
        self.save_state(|s| s.kubeconfig_fetched = true).await
    }

    async fn outputs(&self, talosconfig: String) -> Outputs {
        let state = self.state.lock().await;
        let vm = |node: &NodeSpec| VmOutput {
            vm_id: node.vm_id,
            name: node.name.clone(),
            ip: state
                .ip(&node.name)
                .map_or_else(|| PENDING.to_string(), str::to_string),
        };

        Outputs {
            iso_id: self.iso.lock().await.clone(),
            control_plane: self.settings.nodes.control_plane.iter().map(vm).collect(),
            workers: self.settings.nodes.workers.iter().map(vm).collect(),
            kubeconfig: self.kubeconfig.lock().await.clone(),
            talosconfig: Some(talosconfig),
            talos_client_ca: Some(self.secrets.client.ca_certificate.clone()),
            talos_client_crt: Some(self.secrets.client.client_certificate.clone()),
            talos_client_key: Some(self.secrets.client.client_key.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::providers::{ProviderError, VmHandle};
    use crate::talos::TalosError;

    fn test_settings(dir: &Path) -> Settings {
        let env = |key: &str| match key {
            "PROXMOX_VE_ENDPOINT" => Some("https://pve.lan:8006/".to_string()),
            "PROXMOX_VE_API_TOKEN" => Some("root@pam!homelab=secret".to_string()),
            "TAILSCALE_AUTHKEY" => Some("tskey-auth-test".to_string()),
            _ => None,
        };
        Settings::from_lookup(env, None).unwrap().with_state_dir(dir)
    }

    struct Unused;

    #[async_trait::async_trait]
    impl Hypervisor for Unused {
        async fn ensure_iso(&self, _: &IsoRequest) -> Result<String, ProviderError> {
            unreachable!()
        }
        async fn create_vm(&self, _: &CreateVmRequest) -> Result<VmHandle, ProviderError> {
            unreachable!()
        }
        async fn get_vm(&self, _: u32) -> Result<Option<VmHandle>, ProviderError> {
            unreachable!()
        }
        async fn start_vm(&self, _: u32) -> Result<(), ProviderError> {
            unreachable!()
        }
        async fn ipv4_addresses(&self, _: u32) -> Result<Vec<Vec<String>>, ProviderError> {
            unreachable!()
        }
        async fn delete_vm(&self, _: u32) -> Result<(), ProviderError> {
            unreachable!()
        }
    }

    #[async_trait::async_trait]
    impl TalosApi for Unused {
        async fn apply_config(
            &self,
            _: &str,
            _: &MachineConfig,
            _: ApplyMode,
            _: std::time::Duration,
        ) -> Result<(), TalosError> {
            unreachable!()
        }
        async fn bootstrap(&self, _: &str, _: std::time::Duration) -> Result<(), TalosError> {
            unreachable!()
        }
        async fn kubeconfig(&self, _: &str) -> Result<String, TalosError> {
            unreachable!()
        }
    }

    fn provisioner(dir: &Path) -> Provisioner {
        Provisioner::new(test_settings(dir), Arc::new(Unused), Arc::new(Unused)).unwrap()
    }

    #[test]
    fn test_preview_lists_every_step() {
        let dir = tempfile::tempdir().unwrap();
        let preview = provisioner(dir.path()).preview().unwrap();

        assert!(preview.contains("endpoint https://k8s-control-0:6443"));
        assert!(preview.contains("  1. download-iso\n"));
        assert!(preview.contains("bootstrap (after apply-config[k8s-control-0])"));
        assert_eq!(preview.lines().count(), 16);
        // Preview must not create anything.
        assert!(!dir.path().join("secrets.yaml").exists());
    }

    #[test]
    fn test_render_is_stable_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path());

        let first = p.render("k8s-worker-1").unwrap().to_yaml().unwrap();
        let second = p.render("k8s-worker-1").unwrap().to_yaml().unwrap();
        assert_eq!(first, second);
        assert!(dir.path().join("secrets.yaml").exists());
        assert!(p.render("k8s-worker-9").is_err());
    }
}
