//! Talos Image Factory references.

use serde::{Deserialize, Serialize};

/// Schematic with the `siderolabs/qemu-guest-agent` and `siderolabs/tailscale`
/// extensions.
///
/// Regenerate by POSTing this document to `https://factory.talos.dev/schematics`:
///
/// ```yaml
/// customization:
///   systemExtensions:
///     officialExtensions:
///       - siderolabs/qemu-guest-agent
///       - siderolabs/tailscale
/// ```
pub const DEFAULT_SCHEMATIC_ID: &str =
    "7d4c31cbd96db9f90c874990697c523482b2bae27fb4631d5583dcd9c281b1ff";

/// Talos Image Factory host.
const IMAGE_FACTORY_HOST: &str = "factory.talos.dev";

/// A Talos release built from a particular schematic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalosImage {
    /// Talos version (e.g., "v1.9.0").
    pub version: String,
    /// Schematic ID from Talos Image Factory.
    pub schematic_id: String,
}

impl TalosImage {
    /// Create a new image reference.
    #[must_use]
    pub fn new(version: impl Into<String>, schematic_id: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            schematic_id: schematic_id.into(),
        }
    }

    /// Download URL of the amd64 installer ISO.
    #[must_use]
    pub fn iso_url(&self) -> String {
        format!(
            "https://{IMAGE_FACTORY_HOST}/image/{}/{}/metal-amd64.iso",
            self.schematic_id, self.version
        )
    }

    /// File name the ISO is stored under on the hypervisor.
    #[must_use]
    pub fn iso_file_name(&self) -> String {
        format!("talos-{}-amd64.iso", self.version)
    }

    /// Installer image reference used in `machine.install.image`.
    #[must_use]
    pub fn installer_image(&self) -> String {
        format!(
            "{IMAGE_FACTORY_HOST}/installer/{}:{}",
            self.schematic_id, self.version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_url() {
        let image = TalosImage::new("v1.9.0", DEFAULT_SCHEMATIC_ID);
        assert_eq!(
            image.iso_url(),
            format!("https://factory.talos.dev/image/{DEFAULT_SCHEMATIC_ID}/v1.9.0/metal-amd64.iso")
        );
        assert_eq!(image.iso_file_name(), "talos-v1.9.0-amd64.iso");
    }

    #[test]
    fn test_installer_image() {
        let image = TalosImage::new("v1.8.3", "custom-schematic-id");
        assert_eq!(
            image.installer_image(),
            "factory.talos.dev/installer/custom-schematic-id:v1.8.3"
        );
    }
}
