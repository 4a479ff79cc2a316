//! Proxmox VE API client implementation.
//!
//! API Documentation: <https://pve.proxmox.com/pve-docs/api-viewer/>

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::models::{
    AgentInterfaces, ApiResponse, CreateVmBody, DownloadUrlBody, StorageContent, TaskStatus,
    TicketData, TicketRequest, VmSummary,
};
use crate::providers::traits::{
    CreateVmRequest, Hypervisor, IsoRequest, ProviderError, VmHandle, VmStatus,
};
use crate::settings::{ProxmoxAuth, ProxmoxSettings};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default timeout for long-running tasks (create, start, stop, delete).
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

/// Default timeout for the ISO `download-url` task.
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 600;

/// Polling interval when waiting for a task.
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Tickets are valid for two hours; renew well before that.
const TICKET_LIFETIME: Duration = Duration::from_secs(90 * 60);

/// A cached login ticket.
#[derive(Debug, Clone)]
struct Ticket {
    data: TicketData,
    issued: Instant,
}

/// Proxmox VE hypervisor.
pub struct ProxmoxClient {
    /// HTTP client.
    client: Client,
    /// `<endpoint>/api2/json/`.
    base_url: Url,
    /// Credentials.
    auth: ProxmoxAuth,
    /// Cached ticket for password auth.
    ticket: Mutex<Option<Ticket>>,
    /// Node hosting the VMs.
    node: String,
    /// Datastore the ISO lives on.
    iso_datastore: String,
    /// Upper bound for task completion.
    task_timeout: Duration,
    /// Upper bound for the ISO download task.
    download_timeout: Duration,
    /// Delay between task status polls.
    poll_interval: Duration,
}

impl ProxmoxClient {
    /// Create a new Proxmox VE client.
    ///
    /// # Errors
    /// Returns error if the endpoint is invalid or the HTTP client cannot be
    /// created.
    pub fn new(settings: &ProxmoxSettings) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .danger_accept_invalid_certs(settings.insecure)
            .build()?;

        Ok(Self {
            client,
            base_url: api_base(&settings.endpoint)?,
            auth: settings.auth.clone(),
            ticket: Mutex::new(None),
            node: settings.node_name.clone(),
            iso_datastore: settings.iso_datastore.clone(),
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            poll_interval: TASK_POLL_INTERVAL,
        })
    }

    /// Set the upper bound for task completion.
    #[must_use]
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Set the upper bound for the ISO download task.
    #[must_use]
    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    /// Set the delay between task status polls.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build a URL from path segments under `/api2/json`.
    fn url(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ProviderError::Config("endpoint cannot be a base URL".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn vm_url(&self, vm_id: u32, rest: &[&str]) -> Result<Url, ProviderError> {
        let id = vm_id.to_string();
        let mut segments = vec!["nodes", self.node.as_str(), "qemu", id.as_str()];
        segments.extend_from_slice(rest);
        self.url(&segments)
    }

    /// Log in with username/password, reusing a fresh cached ticket.
    async fn ticket(&self, username: &str, password: &str) -> Result<TicketData, ProviderError> {
        let mut cached = self.ticket.lock().await;
        if let Some(ticket) = cached.as_ref() {
            if ticket.issued.elapsed() < TICKET_LIFETIME {
                return Ok(ticket.data.clone());
            }
        }

        let url = self.url(&["access", "ticket"])?;
        debug!(url = %url, username, "Requesting ticket");

        let response = self
            .client
            .post(url)
            .json(&TicketRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ProviderError::Auth(format!("login rejected for {username}")));
        }
        let data: TicketData = handle_response(response).await?;
        info!(user = %data.username, "Authenticated to Proxmox VE");

        *cached = Some(Ticket {
            data: data.clone(),
            issued: Instant::now(),
        });
        Ok(data)
    }

    /// Build an authenticated request.
    async fn request(&self, method: Method, url: Url) -> Result<RequestBuilder, ProviderError> {
        debug!(url = %url, method = %method, "Proxmox request");
        let is_write = method != Method::GET;
        let builder = self.client.request(method, url);

        Ok(match &self.auth {
            ProxmoxAuth::ApiToken(token) => {
                builder.header("Authorization", format!("PVEAPIToken={token}"))
            }
            ProxmoxAuth::Password { username, password } => {
                let ticket = self.ticket(username, password).await?;
                let builder =
                    builder.header("Cookie", format!("PVEAuthCookie={}", ticket.ticket));
                if is_write {
                    builder.header("CSRFPreventionToken", ticket.csrf_prevention_token)
                } else {
                    builder
                }
            }
        })
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, ProviderError> {
        let response = self.request(Method::GET, url).await?.send().await?;
        handle_response(response).await
    }

    async fn post<T, B>(&self, url: Url, body: &B) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        let response = self
            .request(Method::POST, url)
            .await?
            .json(body)
            .send()
            .await?;
        handle_response(response).await
    }

    async fn delete<T: DeserializeOwned>(&self, url: Url) -> Result<T, ProviderError> {
        let response = self.request(Method::DELETE, url).await?.send().await?;
        handle_response(response).await
    }

    /// Poll a task until it stops; fail unless it exited `OK`.
    async fn wait_task(&self, upid: &str, timeout: Duration) -> Result<(), ProviderError> {
        let url = self.url(&["nodes", &self.node, "tasks", upid, "status"])?;
        let start = Instant::now();

        loop {
            let status: TaskStatus = self.get(url.clone()).await?;
            debug!(
                upid,
                status = %status.status,
                elapsed_secs = start.elapsed().as_secs(),
                "Polling task status"
            );

            if status.status == "stopped" {
                let exit = status.exitstatus.unwrap_or_default();
                if exit == "OK" {
                    return Ok(());
                }
                return Err(ProviderError::TaskFailed {
                    upid: upid.to_string(),
                    exit_status: exit,
                });
            }

            if start.elapsed() > timeout {
                return Err(ProviderError::Timeout(timeout.as_secs()));
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn iso_volume(&self, file_name: &str) -> String {
        format!("{}:iso/{file_name}", self.iso_datastore)
    }

    fn to_handle(vm_id: u32, status: &VmSummary) -> VmHandle {
        let status_enum = match status.qmpstatus.as_deref().unwrap_or(&status.status) {
            "running" => VmStatus::Running,
            "stopped" => VmStatus::Stopped,
            "paused" | "suspended" => VmStatus::Paused,
            _ => VmStatus::Unknown,
        };

        VmHandle {
            vm_id,
            name: status.name.clone().unwrap_or_default(),
            status: status_enum,
            ipv4: None,
        }
    }
}

#[async_trait]
impl Hypervisor for ProxmoxClient {
    async fn ensure_iso(&self, req: &IsoRequest) -> Result<String, ProviderError> {
        let volume = self.iso_volume(&req.file_name);

        let mut url = self.url(&["nodes", &self.node, "storage", &self.iso_datastore, "content"])?;
        url.query_pairs_mut().append_pair("content", "iso");
        let contents: Vec<StorageContent> = self.get(url).await?;

        if contents.iter().any(|c| c.volid == volume) {
            info!(volume = %volume, "ISO already present");
            return Ok(volume);
        }

        info!(url = %req.url, volume = %volume, "Downloading ISO");
        let url = self.url(&[
            "nodes",
            &self.node,
            "storage",
            &self.iso_datastore,
            "download-url",
        ])?;
        let upid: String = self
            .post(
                url,
                &DownloadUrlBody {
                    content: "iso".to_string(),
                    filename: req.file_name.clone(),
                    url: req.url.clone(),
                    verify_certificates: 1,
                },
            )
            .await?;
        self.wait_task(&upid, self.download_timeout).await?;

        info!(volume = %volume, "ISO downloaded");
        Ok(volume)
    }

    async fn create_vm(&self, req: &CreateVmRequest) -> Result<VmHandle, ProviderError> {
        info!(
            vm_id = req.vm_id,
            name = %req.name,
            cores = req.cpu_cores,
            memory_mb = req.memory_mb,
            disk_gb = req.disk_gb,
            "Creating VM"
        );

        let url = self.url(&["nodes", &self.node, "qemu"])?;
        let upid: String = self.post(url, &CreateVmBody::from(req)).await?;
        self.wait_task(&upid, self.task_timeout).await?;

        info!(vm_id = req.vm_id, "VM created");
        self.get_vm(req.vm_id)
            .await?
            .ok_or(ProviderError::NotFound(req.vm_id))
    }

    async fn get_vm(&self, vm_id: u32) -> Result<Option<VmHandle>, ProviderError> {
        // A missing VM is a 500 whose reason only travels in the status line,
        // so existence comes from the node's VM list.
        let mut url = self.url(&["nodes", &self.node, "qemu"])?;
        url.query_pairs_mut().append_pair("full", "1");
        let vms: Vec<VmSummary> = self.get(url).await?;

        Ok(vms
            .iter()
            .find(|vm| vm.vmid == vm_id)
            .map(|vm| Self::to_handle(vm_id, vm)))
    }

    async fn start_vm(&self, vm_id: u32) -> Result<(), ProviderError> {
        info!(vm_id, "Starting VM");
        let upid: String = self
            .post(self.vm_url(vm_id, &["status", "start"])?, &serde_json::json!({}))
            .await?;
        self.wait_task(&upid, self.task_timeout).await?;

        info!(vm_id, "VM started");
        Ok(())
    }

    async fn ipv4_addresses(&self, vm_id: u32) -> Result<Vec<Vec<String>>, ProviderError> {
        let url = self.vm_url(vm_id, &["agent", "network-get-interfaces"])?;
        match self.get::<AgentInterfaces>(url).await {
            Ok(interfaces) => Ok(interfaces.ipv4_by_interface()),
            // Booting guest, agent not up or not answering yet
            Err(ProviderError::Api { status: 500, message }) => {
                debug!(vm_id, reason = %message, "Guest agent not ready yet");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_vm(&self, vm_id: u32) -> Result<(), ProviderError> {
        let Some(vm) = self.get_vm(vm_id).await? else {
            info!(vm_id, "VM already absent");
            return Ok(());
        };

        if vm.status != VmStatus::Stopped {
            info!(vm_id, "Stopping VM");
            let upid: String = self
                .post(self.vm_url(vm_id, &["status", "stop"])?, &serde_json::json!({}))
                .await?;
            self.wait_task(&upid, self.task_timeout).await?;
        }

        info!(vm_id, "Deleting VM");
        let mut url = self.vm_url(vm_id, &[])?;
        url.query_pairs_mut()
            .append_pair("purge", "1")
            .append_pair("destroy-unreferenced-disks", "1");
        let upid: String = self.delete(url).await?;
        self.wait_task(&upid, self.task_timeout).await?;

        info!(vm_id, "VM deleted");
        Ok(())
    }
}

/// Normalize the configured endpoint to `<scheme>://<host>:<port>/api2/json/`.
fn api_base(endpoint: &str) -> Result<Url, ProviderError> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| ProviderError::Config(format!("invalid endpoint '{endpoint}': {e}")))?;

    let path = url.path().trim_end_matches('/').to_string();
    if !path.ends_with("/api2/json") {
        url.set_path(&format!("{path}/api2/json/"));
    } else {
        url.set_path(&format!("{path}/"));
    }
    Ok(url)
}

/// Handle API response, unwrapping `data` or mapping the error.
async fn handle_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let status = response.status();
    let text = response.text().await?;

    if status.is_success() {
        serde_json::from_str::<ApiResponse<T>>(&text)
            .map(|r| r.data)
            .map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                ProviderError::Serialization(e)
            })
    } else {
        // Proxmox puts the reason in the status line and sometimes the body.
        let reason = status.canonical_reason().unwrap_or_default();
        let message = if text.trim().is_empty() || text.trim() == "{\"data\":null}" {
            reason.to_string()
        } else {
            text
        };
        Err(ProviderError::Api {
            status: status.as_u16(),
            message,
        })
    }
}
