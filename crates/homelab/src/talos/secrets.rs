//! Cluster-wide machine secrets.
//!
//! One bundle of PKI material and tokens is generated per cluster and shared
//! read-only by every node's configuration. Regenerating it would invalidate
//! every node that already has a configuration applied, so once it is written
//! to disk it is only ever loaded.

use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{Datelike, Utc};
use rand::{Rng, RngCore};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SignatureAlgorithm,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use x509_parser::pem::parse_x509_pem;

/// CA certificate validity.
const CA_VALIDITY_YEARS: i32 = 10;

/// Admin client certificate validity.
const CLIENT_VALIDITY_YEARS: i32 = 1;

/// The admin client certificate is reissued once it is this close to expiry.
const CLIENT_RENEW_BEFORE_SECS: i64 = 30 * 24 * 60 * 60;

/// Organization that grants the Talos `os:admin` role.
const ADMIN_ROLE: &str = "os:admin";

/// A base64-encoded PEM certificate and private key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertAndKey {
    /// Base64 of the PEM certificate.
    #[serde(default)]
    pub crt: String,
    /// Base64 of the PEM private key.
    #[serde(default)]
    pub key: String,
}

impl CertAndKey {
    /// The same certificate with the private key stripped.
    #[must_use]
    pub fn public(&self) -> Self {
        Self {
            crt: self.crt.clone(),
            key: String::new(),
        }
    }
}

/// Cluster identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterIdentity {
    pub id: String,
    pub secret: String,
}

/// Kubernetes bootstrap secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesSecrets {
    #[serde(rename = "bootstraptoken")]
    pub bootstrap_token: String,
    #[serde(rename = "secretboxencryptionsecret")]
    pub secretbox_encryption_secret: String,
}

/// Token nodes present to `trustd` to obtain certificates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustdInfo {
    pub token: String,
}

/// Certificate authorities and signing keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certs {
    pub etcd: CertAndKey,
    pub k8s: CertAndKey,
    #[serde(rename = "k8saggregator")]
    pub k8s_aggregator: CertAndKey,
    #[serde(rename = "k8sserviceaccount")]
    pub k8s_service_account: CertAndKey,
    pub os: CertAndKey,
}

/// Credentials `talosctl` uses to talk to the Talos API as an admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfiguration {
    /// Base64 PEM of the OS CA certificate.
    pub ca_certificate: String,
    /// Base64 PEM of the admin client certificate.
    pub client_certificate: String,
    /// Base64 PEM of the admin client key.
    pub client_key: String,
}

/// The full secrets bundle.
///
/// The layout of everything except `client` matches `talosctl gen secrets`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSecrets {
    pub cluster: ClusterIdentity,
    pub secrets: KubernetesSecrets,
    #[serde(rename = "trustdinfo")]
    pub trustd_info: TrustdInfo,
    pub certs: Certs,
    pub client: ClientConfiguration,
}

impl MachineSecrets {
    /// Generate a fresh bundle.
    ///
    /// # Errors
    /// Returns an error if key or certificate generation fails.
    pub fn generate() -> Result<Self, rcgen::Error> {
        let os = CertificateAuthority::new("talos", &rcgen::PKCS_ED25519)?;
        let client = os.issue_client(ADMIN_ROLE, CLIENT_VALIDITY_YEARS)?;

        let k8s = CertificateAuthority::new("kubernetes", &rcgen::PKCS_ECDSA_P256_SHA256)?;
        let k8s_aggregator = CertificateAuthority::new("", &rcgen::PKCS_ECDSA_P256_SHA256)?;
        let etcd = CertificateAuthority::new("etcd", &rcgen::PKCS_ECDSA_P256_SHA256)?;
        let service_account = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

        Ok(Self {
            cluster: ClusterIdentity {
                id: random_base64(32),
                secret: random_base64(32),
            },
            secrets: KubernetesSecrets {
                bootstrap_token: random_token(),
                secretbox_encryption_secret: random_base64(32),
            },
            trustd_info: TrustdInfo {
                token: random_token(),
            },
            client: ClientConfiguration {
                ca_certificate: os.material.crt.clone(),
                client_certificate: client.crt,
                client_key: client.key,
            },
            certs: Certs {
                etcd: etcd.material,
                k8s: k8s.material,
                k8s_aggregator: k8s_aggregator.material,
                k8s_service_account: CertAndKey {
                    crt: String::new(),
                    key: encode(&service_account.serialize_pem()),
                },
                os: os.material,
            },
        })
    }

    /// Load the bundle at `path`, generating and persisting it on first use.
    ///
    /// Returns the bundle and whether it was newly generated. An admin client
    /// certificate close to expiry is reissued from the stored OS CA and the
    /// bundle rewritten; nothing else in it changes.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed, or a
    /// new bundle cannot be generated or written.
    pub fn load_or_generate(path: &Path) -> Result<(Self, bool)> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read secrets from {}", path.display()))?;
            let mut secrets: Self = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse secrets in {}", path.display()))?;
            info!(path = %path.display(), "Loaded machine secrets");

            if secrets.client_needs_renewal()? {
                info!("Admin client certificate is about to expire, reissuing");
                secrets.renew_client()?;
                secrets.save(path)?;
            }
            return Ok((secrets, false));
        }

        info!("Generating machine secrets...");
        let secrets = Self::generate().context("Failed to generate machine secrets")?;
        secrets.save(path)?;
        info!(path = %path.display(), "Machine secrets generated");
        Ok((secrets, true))
    }

    /// Whether the admin client certificate expires within the renewal window.
    ///
    /// # Errors
    /// Returns an error if the certificate cannot be decoded.
    pub fn client_needs_renewal(&self) -> Result<bool> {
        let not_after = not_after(&self.client.client_certificate)
            .context("Failed to read admin client certificate")?;
        Ok(not_after - Utc::now().timestamp() < CLIENT_RENEW_BEFORE_SECS)
    }

    /// Issue a new admin client certificate from the stored OS CA.
    ///
    /// # Errors
    /// Returns an error if the CA cannot be loaded or signing fails.
    pub fn renew_client(&mut self) -> Result<()> {
        let os = CertificateAuthority::load(&self.certs.os).context("Failed to load OS CA")?;
        let client = os
            .issue_client(ADMIN_ROLE, CLIENT_VALIDITY_YEARS)
            .context("Failed to issue admin client certificate")?;

        self.client.client_certificate = client.crt;
        self.client.client_key = client.key;
        Ok(())
    }

    /// Write the bundle to `path` with owner-only permissions.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create secrets directory")?;
        }
        let content = serde_yaml::to_string(self).context("Failed to serialize secrets")?;
        write_private(path, content.as_bytes())
            .with_context(|| format!("Failed to write secrets to {}", path.display()))
    }
}

/// A CA certificate together with the issuer used to sign leaves.
struct CertificateAuthority {
    material: CertAndKey,
    issuer: Issuer<'static, KeyPair>,
}

impl CertificateAuthority {
    fn new(organization: &str, alg: &'static SignatureAlgorithm) -> Result<Self, rcgen::Error> {
        let key = KeyPair::generate_for(alg)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        if !organization.is_empty() {
            dn.push(DnType::OrganizationName, organization);
        }
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        set_validity(&mut params, CA_VALIDITY_YEARS);

        let cert = params.self_signed(&key)?;
        let material = CertAndKey {
            crt: encode(&cert.pem()),
            key: encode(&key.serialize_pem()),
        };

        Ok(Self {
            material,
            issuer: Issuer::new(params, key),
        })
    }

    /// Rebuild the issuer from stored CA material.
    fn load(material: &CertAndKey) -> Result<Self> {
        let crt = decode(&material.crt)?;
        let key = KeyPair::from_pem(&decode(&material.key)?)?;
        let issuer = Issuer::from_ca_cert_pem(&crt, key)?;

        Ok(Self {
            material: material.clone(),
            issuer,
        })
    }

    fn issue_client(&self, role: &str, years: i32) -> Result<CertAndKey, rcgen::Error> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ED25519)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, role);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        set_validity(&mut params, years);

        let cert = params.signed_by(&key, &self.issuer)?;
        Ok(CertAndKey {
            crt: encode(&cert.pem()),
            key: encode(&key.serialize_pem()),
        })
    }
}

fn set_validity(params: &mut CertificateParams, years: i32) {
    let today = Utc::now().date_naive();
    // Clamp the day so the same date exists in every month.
    let (month, day) = (
        u8::try_from(today.month()).unwrap_or(1),
        u8::try_from(today.day().min(28)).unwrap_or(1),
    );
    params.not_before = rcgen::date_time_ymd(today.year(), month, day);
    params.not_after = rcgen::date_time_ymd(today.year() + years, month, day);
}

fn encode(pem: &str) -> String {
    STANDARD.encode(pem.as_bytes())
}

fn decode(b64: &str) -> Result<String> {
    let bytes = STANDARD.decode(b64).context("Invalid base64")?;
    String::from_utf8(bytes).context("PEM is not UTF-8")
}

/// Expiry of a base64 PEM certificate as a Unix timestamp.
fn not_after(b64: &str) -> Result<i64> {
    let pem = STANDARD.decode(b64).context("Invalid base64")?;
    let (_, pem) = parse_x509_pem(&pem).map_err(|e| anyhow::anyhow!("Invalid PEM: {e}"))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| anyhow::anyhow!("Invalid certificate: {e}"))?;
    Ok(cert.validity().not_after.timestamp())
}

fn random_base64(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// A Kubernetes-style token: `[a-z0-9]{6}.[a-z0-9]{16}`.
fn random_token() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let mut part = |len: usize| -> String {
        (0..len)
            .map(|_| char::from(CHARSET[rng.gen_range(0..CHARSET.len())]))
            .collect()
    };
    let id = part(6);
    let secret = part(16);
    format!("{id}.{secret}")
}

/// Write `contents` readable by the owner only.
///
/// A file that already exists is narrowed to 0600 before it is rewritten.
#[cfg(unix)]
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)
}

#[cfg(not(unix))]
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(b64: &str) -> String {
        String::from_utf8(STANDARD.decode(b64).unwrap()).unwrap()
    }

    #[test]
    fn test_token_format() {
        for _ in 0..20 {
            let token = random_token();
            let (id, secret) = token.split_once('.').unwrap();
            assert_eq!(id.len(), 6);
            assert_eq!(secret.len(), 16);
            assert!(token
                .chars()
                .all(|c| c == '.' || c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_generate_produces_pem_material() {
        let secrets = MachineSecrets::generate().unwrap();

        assert!(decode(&secrets.certs.os.crt).starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(decode(&secrets.certs.os.key).contains("PRIVATE KEY"));
        assert!(decode(&secrets.certs.k8s_service_account.key).contains("PRIVATE KEY"));
        assert!(secrets.certs.k8s_service_account.crt.is_empty());
        assert_eq!(secrets.client.ca_certificate, secrets.certs.os.crt);
        assert_ne!(secrets.client.client_certificate, secrets.certs.os.crt);
        assert_eq!(STANDARD.decode(&secrets.cluster.id).unwrap().len(), 32);
    }

    #[test]
    fn test_load_or_generate_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.yaml");

        let (first, created) = MachineSecrets::load_or_generate(&path).unwrap();
        assert!(created);

        let (second, created) = MachineSecrets::load_or_generate(&path).unwrap();
        assert!(!created);
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn test_secrets_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.yaml");
        MachineSecrets::load_or_generate(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_private_narrows_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outputs.json");
        std::fs::write(&path, "{}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        write_private(&path, b"{\"kubeconfig\":\"x\"}").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"kubeconfig\":\"x\"}");
    }

    #[test]
    fn test_fresh_client_certificate_is_not_renewed() {
        let secrets = MachineSecrets::generate().unwrap();
        assert!(!secrets.client_needs_renewal().unwrap());
    }

    #[test]
    fn test_expiring_client_certificate_is_reissued_from_os_ca() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.yaml");

        let mut stale = MachineSecrets::generate().unwrap();
        let os = CertificateAuthority::load(&stale.certs.os).unwrap();
        let expiring = os.issue_client(ADMIN_ROLE, 0).unwrap();
        stale.client.client_certificate = expiring.crt.clone();
        stale.client.client_key = expiring.key;
        assert!(stale.client_needs_renewal().unwrap());
        stale.save(&path).unwrap();

        let (loaded, created) = MachineSecrets::load_or_generate(&path).unwrap();
        assert!(!created);
        assert!(!loaded.client_needs_renewal().unwrap());
        assert_ne!(loaded.client.client_certificate, expiring.crt);

        // Only the client pair changes; every CA and token is kept.
        assert_eq!(loaded.certs, stale.certs);
        assert_eq!(loaded.cluster, stale.cluster);
        assert_eq!(loaded.secrets, stale.secrets);
        assert_eq!(loaded.client.ca_certificate, stale.client.ca_certificate);

        // Signed by the stored OS CA.
        let ca_pem = STANDARD.decode(&loaded.certs.os.crt).unwrap();
        let (_, ca_pem) = parse_x509_pem(&ca_pem).unwrap();
        let ca = ca_pem.parse_x509().unwrap();
        let client_pem = STANDARD.decode(&loaded.client.client_certificate).unwrap();
        let (_, client_pem) = parse_x509_pem(&client_pem).unwrap();
        let client = client_pem.parse_x509().unwrap();
        assert_eq!(client.issuer(), ca.subject());

        // The renewed bundle was persisted.
        let (reloaded, _) = MachineSecrets::load_or_generate(&path).unwrap();
        assert_eq!(reloaded, loaded);
    }

    #[test]
    fn test_talosctl_compatible_layout() {
        let secrets = MachineSecrets::generate().unwrap();
        let yaml = serde_yaml::to_string(&secrets).unwrap();
        assert!(yaml.contains("bootstraptoken:"));
        assert!(yaml.contains("trustdinfo:"));
        assert!(yaml.contains("k8saggregator:"));
        assert!(yaml.contains("k8sserviceaccount:"));
    }
}
