//! Talos API access.
//!
//! [`TalosApi`] is the seam the provisioner talks to. [`Talosctl`] implements
//! it by driving the `talosctl` binary.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::talos::config::MachineConfig;
use crate::talos::secrets::write_private;

/// Default Talos API port.
pub const TALOS_API_PORT: u16 = 50000;

/// Delay between attempts while a node is rebooting.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Errors returned by Talos API calls.
#[derive(Error, Debug)]
pub enum TalosError {
    /// `talosctl` could not be started, or a local file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `talosctl` exited with an error.
    #[error("talosctl {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    /// The call did not finish within its timeout.
    #[error("talosctl {command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    /// The machine config could not be rendered.
    #[error("failed to render machine config: {0}")]
    Render(#[from] serde_yaml::Error),
}

/// How a node picks up a newly applied configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyMode {
    /// Let Talos decide.
    Auto,
    /// Apply without rebooting.
    NoReboot,
    /// Reboot into the new configuration.
    #[default]
    Reboot,
    /// Stage the configuration for the next reboot.
    Staged,
}

impl ApplyMode {
    /// Value for `talosctl apply-config --mode`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::NoReboot => "no-reboot",
            Self::Reboot => "reboot",
            Self::Staged => "staged",
        }
    }
}

/// Operations the provisioner needs from the Talos API.
#[async_trait]
pub trait TalosApi: Send + Sync {
    /// Push a machine configuration to the node at `node_ip`.
    async fn apply_config(
        &self,
        node_ip: &str,
        config: &MachineConfig,
        mode: ApplyMode,
        timeout: Duration,
    ) -> Result<(), TalosError>;

    /// Initialize etcd on the node at `node_ip`.
    async fn bootstrap(&self, node_ip: &str, timeout: Duration) -> Result<(), TalosError>;

    /// Fetch the admin kubeconfig from the node at `node_ip`.
    async fn kubeconfig(&self, node_ip: &str) -> Result<String, TalosError>;
}

/// [`TalosApi`] backed by the `talosctl` CLI.
#[derive(Debug, Clone)]
pub struct Talosctl {
    /// Path to the `talosctl` binary.
    binary: PathBuf,
    /// talosconfig with the admin client certificate.
    talosconfig: PathBuf,
    /// Where rendered machine configs are written before they are applied.
    work_dir: PathBuf,
    /// Port the Talos API listens on.
    api_port: u16,
    /// Delay between attempts while a node is rebooting.
    poll_interval: Duration,
}

impl Talosctl {
    /// Create a client that authenticates with `talosconfig` and keeps
    /// rendered configs under `work_dir`.
    #[must_use]
    pub fn new(talosconfig: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: PathBuf::from("talosctl"),
            talosconfig: talosconfig.into(),
            work_dir: work_dir.into(),
            api_port: TALOS_API_PORT,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Use a specific `talosctl` binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Wait for the Talos API on a different port.
    #[must_use]
    pub fn with_api_port(mut self, port: u16) -> Self {
        self.api_port = port;
        self
    }

    /// Set the delay between attempts while a node is unavailable.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Check that talosctl is installed.
    ///
    /// # Errors
    /// Returns an error if talosctl cannot be run.
    pub async fn check(&self) -> Result<(), TalosError> {
        let output = Command::new(&self.binary)
            .args(["version", "--client"])
            .output()
            .await?;
        let output = check_status("version", output)?;
        debug!(
            "talosctl version: {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(())
    }

    /// Path a node's rendered config is written to.
    #[must_use]
    pub fn config_path(&self, node: &str) -> PathBuf {
        self.work_dir.join("nodes").join(format!("{node}.yaml"))
    }

    /// `talosctl --talosconfig <cfg> -e <ip> -n <ip> <args...>`.
    ///
    /// The endpoint is always given explicitly because the talosconfig names
    /// nodes by hostname.
    fn authenticated(&self, node_ip: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--talosconfig")
            .arg(&self.talosconfig)
            .args(["-e", node_ip, "-n", node_ip])
            .kill_on_drop(true);
        cmd
    }

    fn apply_command(&self, node_ip: &str, path: &Path, mode: ApplyMode, insecure: bool) -> Command {
        let mut cmd = if insecure {
            let mut cmd = Command::new(&self.binary);
            cmd.args(["--nodes", node_ip]).kill_on_drop(true);
            cmd
        } else {
            self.authenticated(node_ip)
        };
        cmd.arg("apply-config");
        if insecure {
            cmd.arg("--insecure");
        }
        cmd.arg("--file").arg(path).args(["--mode", mode.as_str()]);
        cmd
    }
}

#[async_trait]
impl TalosApi for Talosctl {
    async fn apply_config(
        &self,
        node_ip: &str,
        config: &MachineConfig,
        mode: ApplyMode,
        timeout: Duration,
    ) -> Result<(), TalosError> {
        let deadline = Instant::now() + timeout;
        let path = self.config_path(&config.node);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Control-plane documents carry CA keys and the secretbox secret.
        write_private(&path, config.to_yaml()?.as_bytes())?;

        info!(node = %config.node, node_ip, "Applying Talos config...");
        debug!(path = %path.display(), mode = mode.as_str(), "Machine config written");

        wait_for_port(node_ip, self.api_port, self.poll_interval, deadline)
            .await
            .map_err(|()| timed_out("apply-config", timeout))?;

        // Nodes in maintenance mode only accept unauthenticated applies; once
        // configured they refuse them and require the admin certificate.
        let output = run_until(self.apply_command(node_ip, &path, mode, true), deadline)
            .await
            .map_err(|()| timed_out("apply-config", timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if !requires_authentication(&stderr) {
                return Err(TalosError::Command {
                    command: "apply-config".to_string(),
                    stderr,
                });
            }

            debug!(node = %config.node, "Node is configured, applying with talosconfig");
            let output = run_until(self.apply_command(node_ip, &path, mode, false), deadline)
                .await
                .map_err(|()| timed_out("apply-config", timeout))??;
            check_status("apply-config", output)?;
        }

        info!(node = %config.node, "✅ Config applied");
        Ok(())
    }

    async fn bootstrap(&self, node_ip: &str, timeout: Duration) -> Result<(), TalosError> {
        let deadline = Instant::now() + timeout;
        info!(node_ip, "Bootstrapping Talos cluster...");

        // The node reboots after its config is applied; keep trying until its
        // API answers.
        loop {
            let mut cmd = self.authenticated(node_ip);
            cmd.arg("bootstrap");
            let output = run_until(cmd, deadline)
                .await
                .map_err(|()| timed_out("bootstrap", timeout))??;

            if output.status.success() {
                info!("✅ Cluster bootstrapped!");
                return Ok(());
            }

            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if already_bootstrapped(&stderr) {
                warn!("Cluster appears to already be bootstrapped");
                return Ok(());
            }
            if !is_unavailable(&stderr) {
                return Err(TalosError::Command {
                    command: "bootstrap".to_string(),
                    stderr,
                });
            }

            debug!("Talos API not ready yet: {}", stderr.trim());
            if Instant::now() + self.poll_interval > deadline {
                return Err(timed_out("bootstrap", timeout));
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn kubeconfig(&self, node_ip: &str) -> Result<String, TalosError> {
        info!("Fetching kubeconfig...");
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let path = self.work_dir.join("kubeconfig.fetch");

        let mut cmd = self.authenticated(node_ip);
        cmd.arg("kubeconfig")
            .arg(&path)
            .args(["--force", "--merge=false"]);
        check_status("kubeconfig", cmd.output().await?)?;

        let kubeconfig = tokio::fs::read_to_string(&path).await?;
        // Best-effort cleanup; the provisioner persists its own copy.
        let _ = tokio::fs::remove_file(&path).await;
        Ok(kubeconfig)
    }
}

/// Poll a TCP port until it accepts connections or `deadline` passes.
async fn wait_for_port(
    ip: &str,
    port: u16,
    interval: Duration,
    deadline: Instant,
) -> Result<(), ()> {
    let addr = format!("{ip}:{port}");
    loop {
        match timeout_at(deadline, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => {
                debug!(%addr, "Talos API is reachable");
                return Ok(());
            }
            Ok(Err(e)) => debug!(%addr, "Connection attempt failed: {e}"),
            Err(_) => return Err(()),
        }
        if Instant::now() + interval > deadline {
            return Err(());
        }
        sleep(interval).await;
    }
}

async fn run_until(mut cmd: Command, deadline: Instant) -> Result<std::io::Result<Output>, ()> {
    timeout_at(deadline, cmd.output()).await.map_err(|_| ())
}

fn check_status(command: &str, output: Output) -> Result<Output, TalosError> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(TalosError::Command {
            command: command.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

fn timed_out(command: &str, timeout: Duration) -> TalosError {
    TalosError::Timeout {
        command: command.to_string(),
        secs: timeout.as_secs(),
    }
}

fn requires_authentication(stderr: &str) -> bool {
    ["certificate required", "Unauthenticated", "PermissionDenied", "x509:"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

fn already_bootstrapped(stderr: &str) -> bool {
    ["already bootstrapped", "etcd is already running", "AlreadyExists"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

fn is_unavailable(stderr: &str) -> bool {
    [
        "Unavailable",
        "connection refused",
        "DeadlineExceeded",
        "no route to host",
        "i/o timeout",
    ]
    .iter()
    .any(|needle| stderr.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_mode_strings() {
        assert_eq!(ApplyMode::default(), ApplyMode::Reboot);
        assert_eq!(ApplyMode::Reboot.as_str(), "reboot");
        assert_eq!(ApplyMode::NoReboot.as_str(), "no-reboot");
    }

    #[test]
    fn test_config_path() {
        let client = Talosctl::new("/tmp/x/talosconfig", "/tmp/x");
        assert_eq!(
            client.config_path("k8s-worker-0"),
            PathBuf::from("/tmp/x/nodes/k8s-worker-0.yaml")
        );
    }

    #[test]
    fn test_stderr_classification() {
        assert!(requires_authentication(
            "rpc error: code = Unavailable desc = connection error: remote error: tls: certificate required"
        ));
        assert!(already_bootstrapped(
            "rpc error: code = AlreadyExists desc = etcd data directory is not empty"
        ));
        assert!(is_unavailable(
            "rpc error: code = Unavailable desc = connection refused"
        ));
        assert!(!is_unavailable("rpc error: code = InvalidArgument"));
    }

    #[tokio::test]
    async fn test_wait_for_port_times_out() {
        // Port 9 on localhost is closed on CI runners; the deadline is already
        // past after the first attempt.
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(wait_for_port("127.0.0.1", 9, POLL_INTERVAL, deadline)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_wait_for_port_succeeds_when_listening() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(wait_for_port("127.0.0.1", port, POLL_INTERVAL, deadline)
            .await
            .is_ok());
    }
}
