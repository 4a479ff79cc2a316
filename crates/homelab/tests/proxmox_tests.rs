//! Proxmox VE client tests against a mock API.

use std::time::Duration;

use homelab::providers::proxmox::ProxmoxClient;
use homelab::providers::{CreateVmRequest, Hypervisor, IsoRequest, ProviderError, VmStatus};
use homelab::settings::{ProxmoxAuth, ProxmoxSettings};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "root@pam!homelab=00000000-1111-2222-3333-444444444444";
const UPID: &str = "UPID:pve:000A1B2C:0F00BA12:67000000:qmcreate:200:root@pam:";
const TASK_STATUS: &str = r"^/api2/json/nodes/pve/tasks/.+/status$";

fn settings(server: &MockServer, auth: ProxmoxAuth) -> ProxmoxSettings {
    ProxmoxSettings {
        endpoint: server.uri(),
        auth,
        insecure: true,
        node_name: "pve".to_string(),
        iso_datastore: "local".to_string(),
    }
}

fn client(server: &MockServer) -> ProxmoxClient {
    ProxmoxClient::new(&settings(server, ProxmoxAuth::ApiToken(TOKEN.to_string())))
        .unwrap()
        .with_poll_interval(Duration::from_millis(10))
}

fn data(value: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "data": value }))
}

/// pveproxy reports API errors in the status line with an empty `data`.
fn api_error(status: u16) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(json!({ "data": null }))
}

async fn mount_vm_list(server: &MockServer, vms: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu"))
        .and(query_param("full", "1"))
        .respond_with(data(vms))
        .mount(server)
        .await;
}

async fn mount_task_ok(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path_regex(TASK_STATUS))
        .respond_with(data(json!({ "status": "stopped", "exitstatus": "OK" })))
        .mount(server)
        .await;
}

fn iso_request() -> IsoRequest {
    IsoRequest {
        url: "https://factory.talos.dev/image/abc/v1.9.0/metal-amd64.iso".to_string(),
        file_name: "talos-v1.9.0-amd64.iso".to_string(),
    }
}

#[tokio::test]
async fn test_ensure_iso_skips_existing_download() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/storage/local/content"))
        .and(query_param("content", "iso"))
        .and(header("Authorization", format!("PVEAPIToken={TOKEN}").as_str()))
        .respond_with(data(json!([
            { "volid": "local:iso/talos-v1.9.0-amd64.iso", "format": "iso", "size": 104_857_600 }
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/storage/local/download-url"))
        .respond_with(data(json!(UPID)))
        .expect(0)
        .mount(&server)
        .await;

    let volume = client(&server).ensure_iso(&iso_request()).await.unwrap();
    assert_eq!(volume, "local:iso/talos-v1.9.0-amd64.iso");
}

#[tokio::test]
async fn test_ensure_iso_downloads_and_waits() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/storage/local/content"))
        .respond_with(data(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/storage/local/download-url"))
        .and(body_partial_json(json!({
            "content": "iso",
            "filename": "talos-v1.9.0-amd64.iso",
            "verify-certificates": 1
        })))
        .respond_with(data(json!(UPID)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(TASK_STATUS))
        .respond_with(data(json!({ "status": "running" })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_task_ok(&server).await;

    let volume = client(&server).ensure_iso(&iso_request()).await.unwrap();
    assert_eq!(volume, "local:iso/talos-v1.9.0-amd64.iso");
}

#[tokio::test]
async fn test_create_vm() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu"))
        .and(body_partial_json(json!({
            "vmid": 200,
            "name": "k8s-control-0",
            "cores": 4,
            "memory": 8192,
            "cpu": "host",
            "balloon": 0,
            "ide2": "local:iso/talos-v1.9.0-amd64.iso,media=cdrom",
            "scsi0": "local-lvm:50,format=raw,iothread=1,ssd=1,discard=on",
            "net0": "virtio,bridge=vmbr0,firewall=0",
            "start": 1
        })))
        .respond_with(data(json!(UPID)))
        .expect(1)
        .mount(&server)
        .await;
    mount_task_ok(&server).await;
    mount_vm_list(
        &server,
        json!([
            { "vmid": 200, "name": "k8s-control-0", "status": "running", "qmpstatus": "running" }
        ]),
    )
    .await;

    let vm = client(&server)
        .create_vm(&CreateVmRequest {
            vm_id: 200,
            name: "k8s-control-0".to_string(),
            cpu_cores: 4,
            memory_mb: 8192,
            disk_gb: 50,
            storage_pool: "local-lvm".to_string(),
            network_bridge: "vmbr0".to_string(),
            iso_volume: "local:iso/talos-v1.9.0-amd64.iso".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(vm.vm_id, 200);
    assert_eq!(vm.name, "k8s-control-0");
    assert_eq!(vm.status, VmStatus::Running);
}

#[tokio::test]
async fn test_failed_task_is_an_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu"))
        .respond_with(data(json!(UPID)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(TASK_STATUS))
        .respond_with(data(json!({
            "status": "stopped",
            "exitstatus": "unable to create VM 200 - VM 200 already exists on node 'pve'"
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .create_vm(&CreateVmRequest {
            vm_id: 200,
            name: "k8s-control-0".to_string(),
            cpu_cores: 4,
            memory_mb: 8192,
            disk_gb: 50,
            storage_pool: "local-lvm".to_string(),
            network_bridge: "vmbr0".to_string(),
            iso_volume: "local:iso/talos-v1.9.0-amd64.iso".to_string(),
        })
        .await
        .unwrap_err();

    match err {
        ProviderError::TaskFailed { upid, exit_status } => {
            assert_eq!(upid, UPID);
            assert!(exit_status.contains("already exists"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_get_vm_missing_is_none() {
    let server = MockServer::start().await;

    mount_vm_list(
        &server,
        json!([{ "vmid": 100, "name": "router", "status": "running" }]),
    )
    .await;
    // What pveproxy answers for an unknown VM; must not be consulted.
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu/299/status/current"))
        .respond_with(api_error(500))
        .expect(0)
        .mount(&server)
        .await;

    assert_eq!(client(&server).get_vm(299).await.unwrap(), None);
}

#[tokio::test]
async fn test_get_vm_reports_stopped() {
    let server = MockServer::start().await;

    mount_vm_list(
        &server,
        json!([
            { "vmid": 200, "name": "k8s-control-0", "status": "running", "qmpstatus": "running" },
            { "vmid": 210, "name": "k8s-worker-0", "status": "stopped", "qmpstatus": "stopped" }
        ]),
    )
    .await;

    let vm = client(&server).get_vm(210).await.unwrap().unwrap();
    assert_eq!(vm.name, "k8s-worker-0");
    assert_eq!(vm.status, VmStatus::Stopped);
}

#[tokio::test]
async fn test_start_vm_waits_for_task() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/210/status/start"))
        .respond_with(data(json!(UPID)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(TASK_STATUS))
        .respond_with(data(json!({ "status": "running" })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_task_ok(&server).await;

    client(&server).start_vm(210).await.unwrap();
}

#[tokio::test]
async fn test_api_errors_propagate() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu"))
        .respond_with(api_error(403))
        .mount(&server)
        .await;

    let err = client(&server).get_vm(200).await.unwrap_err();
    assert!(matches!(err, ProviderError::Api { status: 403, .. }), "{err}");
}

#[tokio::test]
async fn test_ipv4_addresses() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu/210/agent/network-get-interfaces"))
        .respond_with(data(json!({ "result": [
            { "name": "lo", "ip-addresses": [
                { "ip-address": "127.0.0.1", "ip-address-type": "ipv4", "prefix": 8 }
            ]},
            { "name": "eth0", "hardware-address": "bc:24:11:aa:bb:cc", "ip-addresses": [
                { "ip-address": "fe80::1", "ip-address-type": "ipv6", "prefix": 64 },
                { "ip-address": "192.168.1.60", "ip-address-type": "ipv4", "prefix": 24 }
            ]}
        ]})))
        .mount(&server)
        .await;

    let addrs = client(&server).ipv4_addresses(210).await.unwrap();
    assert_eq!(
        addrs,
        vec![vec!["127.0.0.1".to_string()], vec!["192.168.1.60".to_string()]]
    );
    assert_eq!(
        homelab::providers::primary_ipv4(&addrs).as_deref(),
        Some("192.168.1.60")
    );
}

#[tokio::test]
async fn test_ipv4_addresses_before_agent_starts() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu/210/agent/network-get-interfaces"))
        .respond_with(api_error(500))
        .mount(&server)
        .await;

    assert!(client(&server).ipv4_addresses(210).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ipv4_addresses_other_errors_propagate() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu/210/agent/network-get-interfaces"))
        .respond_with(api_error(403))
        .mount(&server)
        .await;

    let err = client(&server).ipv4_addresses(210).await.unwrap_err();
    assert!(matches!(err, ProviderError::Api { status: 403, .. }), "{err}");
}

#[tokio::test]
async fn test_iso_download_has_its_own_timeout() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/storage/local/content"))
        .respond_with(data(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/storage/local/download-url"))
        .respond_with(data(json!(UPID)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(TASK_STATUS))
        .respond_with(data(json!({ "status": "running" })))
        .mount(&server)
        .await;

    // A generous task timeout does not extend the download.
    let err = client(&server)
        .with_task_timeout(Duration::from_secs(3600))
        .with_download_timeout(Duration::from_millis(50))
        .ensure_iso(&iso_request())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Timeout(_)), "{err}");
}

#[tokio::test]
async fn test_password_auth_uses_ticket_and_csrf_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api2/json/access/ticket"))
        .and(body_partial_json(json!({ "username": "root@pam", "password": "hunter2" })))
        .respond_with(data(json!({
            "ticket": "PVE:root@pam:67000000::sig",
            "CSRFPreventionToken": "67000000:csrf",
            "username": "root@pam"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/200/status/stop"))
        .and(header("Cookie", "PVEAuthCookie=PVE:root@pam:67000000::sig"))
        .and(header("CSRFPreventionToken", "67000000:csrf"))
        .respond_with(data(json!(UPID)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu"))
        .and(header("Cookie", "PVEAuthCookie=PVE:root@pam:67000000::sig"))
        .respond_with(data(json!([
            { "vmid": 200, "name": "k8s-control-0", "status": "running" }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api2/json/nodes/pve/qemu/200"))
        .and(query_param("purge", "1"))
        .and(query_param("destroy-unreferenced-disks", "1"))
        .and(header("CSRFPreventionToken", "67000000:csrf"))
        .respond_with(data(json!(UPID)))
        .expect(1)
        .mount(&server)
        .await;
    mount_task_ok(&server).await;

    let client = ProxmoxClient::new(&settings(
        &server,
        ProxmoxAuth::Password {
            username: "root@pam".to_string(),
            password: "hunter2".to_string(),
        },
    ))
    .unwrap()
    .with_poll_interval(Duration::from_millis(10));

    client.delete_vm(200).await.unwrap();
}

#[tokio::test]
async fn test_rejected_login() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api2/json/access/ticket"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = ProxmoxClient::new(&settings(
        &server,
        ProxmoxAuth::Password {
            username: "root@pam".to_string(),
            password: "wrong".to_string(),
        },
    ))
    .unwrap();

    let err = client.get_vm(200).await.unwrap_err();
    assert!(matches!(err, ProviderError::Auth(_)), "{err}");
}

#[tokio::test]
async fn test_delete_absent_vm_succeeds() {
    let server = MockServer::start().await;

    mount_vm_list(&server, json!([])).await;
    Mock::given(method("DELETE"))
        .respond_with(data(json!(UPID)))
        .expect(0)
        .mount(&server)
        .await;

    client(&server).delete_vm(211).await.unwrap();
}
