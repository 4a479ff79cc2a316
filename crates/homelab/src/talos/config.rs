//! Talos machine configuration generation.
//!
//! [`generate`] is a pure function of the node, the cluster settings and the
//! shared secrets: the same inputs always render the same document, so a
//! configuration can be re-applied without drift.

use serde_json::{json, Map, Value};

use crate::nodes::{NodeSpec, NodeTable, Role};
use crate::settings::{ClusterSettings, TailscaleSettings};
use crate::talos::image::TalosImage;
use crate::talos::secrets::MachineSecrets;

/// Kubernetes API server port.
pub const K8S_API_PORT: u16 = 6443;

/// KubePrism local load balancer port.
const KUBE_PRISM_PORT: u16 = 7445;

/// Path the Tailscale extension reads its environment from.
const TAILSCALE_ENV_PATH: &str = "/var/etc/tailscale/auth.env";

/// Interface the VMs get their DHCP lease on.
const PRIMARY_INTERFACE: &str = "eth0";

/// A rendered machine configuration for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineConfig {
    /// Node hostname.
    pub node: String,
    /// Machine role.
    pub role: Role,
    /// Patches layered over the base document, in application order.
    pub patches: Vec<Value>,
    /// The fully merged v1alpha1 document.
    pub document: Value,
}

impl MachineConfig {
    /// Render the document as YAML.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.document)
    }

    /// `machine.type` of the rendered document.
    #[must_use]
    pub fn machine_type(&self) -> Option<&str> {
        self.document.pointer("/machine/type").and_then(Value::as_str)
    }

    /// `machine.network.hostname` of the rendered document.
    #[must_use]
    pub fn hostname(&self) -> Option<&str> {
        self.document
            .pointer("/machine/network/hostname")
            .and_then(Value::as_str)
    }

    /// `machine.install.disk` of the rendered document.
    #[must_use]
    pub fn install_disk(&self) -> Option<&str> {
        self.document
            .pointer("/machine/install/disk")
            .and_then(Value::as_str)
    }

    /// `machine.install.image` of the rendered document.
    #[must_use]
    pub fn install_image(&self) -> Option<&str> {
        self.document
            .pointer("/machine/install/image")
            .and_then(Value::as_str)
    }

    /// `cluster.controlPlane.endpoint` of the rendered document.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.document
            .pointer("/cluster/controlPlane/endpoint")
            .and_then(Value::as_str)
    }
}

/// Kubernetes API endpoint every node is configured with.
///
/// Uses the VIP hostname when one is configured. Otherwise falls back to the
/// first control-plane node's bare hostname, which only resolves if something
/// outside this crate (tailnet MagicDNS, local DNS) knows that name before
/// the node has an address.
#[must_use]
pub fn cluster_endpoint(cluster: &ClusterSettings, nodes: &NodeTable) -> String {
    let host = cluster
        .vip_hostname
        .as_deref()
        .unwrap_or(&nodes.first_control_plane().name);
    format!("https://{host}:{K8S_API_PORT}")
}

/// Whether [`cluster_endpoint`] is using the first-node fallback.
#[must_use]
pub fn uses_fallback_endpoint(cluster: &ClusterSettings) -> bool {
    cluster.vip_hostname.is_none()
}

/// Patches applied on top of the base document for `node`.
#[must_use]
pub fn config_patches(
    node: &NodeSpec,
    cluster: &ClusterSettings,
    tailscale: &TailscaleSettings,
) -> Vec<Value> {
    let image = TalosImage::new(&cluster.talos_version, &cluster.schematic_id);

    let mut patches = vec![
        json!({
            "machine": {
                "install": {
                    "disk": cluster.install_disk,
                    "image": image.installer_image(),
                    "bootloader": true,
                    "wipe": false,
                },
            },
        }),
        json!({
            "machine": {
                "network": {
                    "hostname": node.name,
                },
            },
        }),
        tailscale_patch(node, tailscale),
    ];

    let wants_dhcp_interface = match node.role {
        Role::Worker => true,
        Role::ControlPlane => cluster.vip_hostname.is_some(),
    };
    if wants_dhcp_interface {
        patches.push(json!({
            "machine": {
                "network": {
                    "interfaces": [
                        { "interface": PRIMARY_INTERFACE, "dhcp": true },
                    ],
                },
            },
        }));
    }

    patches
}

fn tailscale_patch(node: &NodeSpec, tailscale: &TailscaleSettings) -> Value {
    let content = format!(
        "apiVersion: v1alpha1\n\
         kind: ExtensionServiceConfig\n\
         name: tailscale\n\
         environment:\n  \
         - TS_AUTHKEY={}\n  \
         - TS_EXTRA_ARGS=--advertise-tags=tag:k8s-{}\n  \
         - TS_HOSTNAME={}\n",
        tailscale.authkey, node.role, node.name
    );

    json!({
        "machine": {
            "files": [
                {
                    "content": content,
                    "path": TAILSCALE_ENV_PATH,
                    "op": "create",
                    "permissions": 0o600,
                },
            ],
        },
    })
}

/// Render the machine configuration for `node`.
#[must_use]
pub fn generate(
    node: &NodeSpec,
    cluster: &ClusterSettings,
    tailscale: &TailscaleSettings,
    secrets: &MachineSecrets,
    endpoint: &str,
) -> MachineConfig {
    let patches = config_patches(node, cluster, tailscale);

    let mut document = base_document(node.role, cluster, secrets, endpoint);
    for patch in &patches {
        merge(&mut document, patch.clone());
    }

    MachineConfig {
        node: node.name.clone(),
        role: node.role,
        patches,
        document,
    }
}

fn base_document(
    role: Role,
    cluster: &ClusterSettings,
    secrets: &MachineSecrets,
    endpoint: &str,
) -> Value {
    let k8s = &cluster.kubernetes_version;
    let is_control_plane = role == Role::ControlPlane;

    // Workers only get the public halves of the CAs.
    let (os_ca, k8s_ca) = if is_control_plane {
        (secrets.certs.os.clone(), secrets.certs.k8s.clone())
    } else {
        (secrets.certs.os.public(), secrets.certs.k8s.public())
    };

    let mut machine = json!({
        "type": role.machine_type(),
        "token": secrets.trustd_info.token,
        "ca": os_ca,
        "certSANs": [],
        "kubelet": {
            "image": format!("ghcr.io/siderolabs/kubelet:{k8s}"),
            "defaultRuntimeSeccompProfileEnabled": true,
            "disableManifestsDirectory": true,
        },
        "network": {},
        "features": {
            "rbac": true,
            "stableHostname": true,
            "apidCheckExtKeyUsage": true,
            "diskQuotaSupport": true,
            "kubePrism": { "enabled": true, "port": KUBE_PRISM_PORT },
            "hostDNS": { "enabled": true, "forwardKubeDNSToHost": true },
        },
    });

    let mut cluster_section = json!({
        "id": secrets.cluster.id,
        "secret": secrets.cluster.secret,
        "controlPlane": { "endpoint": endpoint },
        "clusterName": cluster.name,
        "network": {
            "dnsDomain": "cluster.local",
            "podSubnets": ["10.244.0.0/16"],
            "serviceSubnets": ["10.96.0.0/12"],
        },
        "token": secrets.secrets.bootstrap_token,
        "ca": k8s_ca,
        "discovery": {
            "enabled": true,
            "registries": {
                "kubernetes": { "disabled": true },
                "service": {},
            },
        },
    });

    if is_control_plane {
        merge(
            &mut machine,
            json!({
                "nodeLabels": {
                    "node.kubernetes.io/exclude-from-external-load-balancers": "",
                },
            }),
        );
        merge(
            &mut cluster_section,
            json!({
                "secretboxEncryptionSecret": secrets.secrets.secretbox_encryption_secret,
                "aggregatorCA": secrets.certs.k8s_aggregator,
                "serviceAccount": { "key": secrets.certs.k8s_service_account.key },
                "apiServer": {
                    "image": format!("registry.k8s.io/kube-apiserver:{k8s}"),
                    "certSANs": [endpoint_host(endpoint)],
                    "disablePodSecurityPolicy": true,
                },
                "controllerManager": {
                    "image": format!("registry.k8s.io/kube-controller-manager:{k8s}"),
                },
                "proxy": {
                    "image": format!("registry.k8s.io/kube-proxy:{k8s}"),
                },
                "scheduler": {
                    "image": format!("registry.k8s.io/kube-scheduler:{k8s}"),
                },
                "etcd": { "ca": secrets.certs.etcd },
            }),
        );
    }

    json!({
        "version": "v1alpha1",
        "debug": false,
        "persist": true,
        "machine": machine,
        "cluster": cluster_section,
    })
}

fn endpoint_host(endpoint: &str) -> String {
    url::Url::parse(endpoint)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| endpoint.to_string())
}

/// Merge `patch` into `base` the way Talos merges config patches.
///
/// Objects merge key by key, lists are appended, and entries of
/// `machine.network.interfaces` that name the same interface are merged into
/// one.
pub fn merge(base: &mut Value, patch: Value) {
    merge_at(base, patch, &mut Vec::new());
}

fn merge_at(base: &mut Value, patch: Value, path: &mut Vec<String>) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                path.push(key.clone());
                match base.get_mut(&key) {
                    Some(existing) => merge_at(existing, value, path),
                    None => {
                        base.insert(key, value);
                    }
                }
                path.pop();
            }
        }
        (Value::Array(base), Value::Array(patch)) => {
            if path.iter().map(String::as_str).eq(["machine", "network", "interfaces"]) {
                merge_interfaces(base, patch);
            } else {
                base.extend(patch);
            }
        }
        (base, patch) => *base = patch,
    }
}

fn merge_interfaces(base: &mut Vec<Value>, patch: Vec<Value>) {
    for entry in patch {
        let name = interface_name(&entry).map(str::to_string);
        let existing = name
            .as_deref()
            .and_then(|n| base.iter_mut().find(|b| interface_name(b) == Some(n)));
        match existing {
            Some(existing) => merge_at(existing, entry, &mut Vec::new()),
            None => base.push(entry),
        }
    }
}

fn interface_name(entry: &Value) -> Option<&str> {
    entry
        .as_object()
        .and_then(|o: &Map<String, Value>| o.get("interface"))
        .and_then(Value::as_str)
}
