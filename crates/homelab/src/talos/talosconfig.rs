//! `talosconfig` rendering.

use crate::talos::secrets::ClientConfiguration;

/// Render a single-context talosconfig for `talosctl`.
///
/// Endpoints and nodes both point at the first control-plane node by name.
#[must_use]
pub fn render_talosconfig(
    cluster_name: &str,
    first_control_plane: &str,
    client: &ClientConfiguration,
) -> String {
    format!(
        "context: {cluster_name}\n\
         contexts:\n\
         \x20 {cluster_name}:\n\
         \x20   endpoints:\n\
         \x20     - {first_control_plane}\n\
         \x20   nodes:\n\
         \x20     - {first_control_plane}\n\
         \x20   ca: {ca}\n\
         \x20   crt: {crt}\n\
         \x20   key: {key}\n",
        ca = client.ca_certificate,
        crt = client.client_certificate,
        key = client.client_key,
    )
}
