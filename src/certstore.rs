//! Certificate store wiring for the TLS harness mode.
//!
//! The store is a directory of PEM files playing the role a keystore/truststore
//! pair plays for a JVM broker: a CA certificate both sides trust, a broker
//! certificate/key presented by the QUIC listener, and a client certificate/key
//! presented by producers and consumers. TLS mode is mutual: the broker only
//! accepts clients whose certificate chains to the store's CA.

use crate::error::{BrokerUnitError, Result};
use rcgen::{BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, SanType};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertStoreConfig {
    /// Directory holding the PEM files.
    pub path: PathBuf,
    pub ca_cert: String,
    pub server_cert: String,
    pub server_key: String,
    pub client_cert: String,
    pub client_key: String,
}

impl CertStoreConfig {
    /// A store at `path` using the default file names.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ca_cert: "ca.pem".to_string(),
            server_cert: "broker.pem".to_string(),
            server_key: "broker.key.pem".to_string(),
            client_cert: "client.pem".to_string(),
            client_key: "client.key.pem".to_string(),
        }
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.path.join(&self.ca_cert)
    }

    pub fn server_cert_path(&self) -> PathBuf {
        self.path.join(&self.server_cert)
    }

    pub fn server_key_path(&self) -> PathBuf {
        self.path.join(&self.server_key)
    }

    pub fn client_cert_path(&self) -> PathBuf {
        self.path.join(&self.client_cert)
    }

    pub fn client_key_path(&self) -> PathBuf {
        self.path.join(&self.client_key)
    }

    /// Server-side rustls config: broker certificate plus mandatory client
    /// authentication against the store's CA.
    pub fn server_config(&self) -> Result<rustls::ServerConfig> {
        let certs = load_certs(&self.server_cert_path())?;
        let key = load_private_key(&self.server_key_path())?;

        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs(&self.ca_cert_path())? {
            roots.add(&cert)?;
        }
        let verifier = rustls::server::AllowAnyAuthenticatedClient::new(roots);

        let config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(Arc::new(verifier))
            .with_single_cert(certs, key)?;
        Ok(config)
    }

    /// Client-side rustls config: verify the broker against the store's CA and
    /// present the store's client certificate.
    pub fn client_config(&self) -> Result<rustls::ClientConfig> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs(&self.ca_cert_path())? {
            roots.add(&cert)?;
        }

        let certs = load_certs(&self.client_cert_path())?;
        let key = load_private_key(&self.client_key_path())?;

        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)?;
        Ok(config)
    }
}

/// Generate a fresh cert store under `dir`: a CA, a broker certificate for
/// localhost signed by it, and a client certificate signed by it.
pub fn generate_cert_store(dir: &Path) -> Result<CertStoreConfig> {
    std::fs::create_dir_all(dir)?;
    let store = CertStoreConfig::new(dir);

    let mut ca_params = CertificateParams::new(Vec::<String>::new());
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name = distinguished_name("brokerunit test CA");
    let ca = Certificate::from_params(ca_params)?;
    std::fs::write(store.ca_cert_path(), ca.serialize_pem()?)?;

    let mut server_params = CertificateParams::new(vec!["localhost".to_string()]);
    server_params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    server_params.distinguished_name = distinguished_name("brokerunit broker");
    let server = Certificate::from_params(server_params)?;
    std::fs::write(store.server_cert_path(), server.serialize_pem_with_signer(&ca)?)?;
    std::fs::write(store.server_key_path(), server.serialize_private_key_pem())?;

    let mut client_params = CertificateParams::new(vec!["brokerunit-client".to_string()]);
    client_params.distinguished_name = distinguished_name("brokerunit client");
    let client = Certificate::from_params(client_params)?;
    std::fs::write(store.client_cert_path(), client.serialize_pem_with_signer(&ca)?)?;
    std::fs::write(store.client_key_path(), client.serialize_private_key_pem())?;

    info!("Generated certificate store in {}", dir.display());
    Ok(store)
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

fn load_certs(path: &Path) -> Result<Vec<rustls::Certificate>> {
    let pem = std::fs::read(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())?;
    if certs.is_empty() {
        return Err(BrokerUnitError::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<rustls::PrivateKey> {
    let pem = std::fs::read(path)?;
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut pem.as_slice())?;
    keys.pop().map(rustls::PrivateKey).ok_or_else(|| {
        BrokerUnitError::Config(format!("no PKCS#8 private key found in {}", path.display()))
    })
}

/// Accepts whatever certificate the broker presents. Backs the non-cert-store
/// harness mode, where the broker runs on a throwaway self-signed certificate.
pub struct SkipServerVerification;

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Client config for the non-cert-store mode: encrypted, unverified.
pub fn insecure_client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_writes_all_files() {
        let dir = TempDir::new().unwrap();
        let store = generate_cert_store(dir.path()).unwrap();

        assert!(store.ca_cert_path().exists());
        assert!(store.server_cert_path().exists());
        assert!(store.server_key_path().exists());
        assert!(store.client_cert_path().exists());
        assert!(store.client_key_path().exists());
    }

    #[test]
    fn test_generated_store_loads_into_rustls() {
        let dir = TempDir::new().unwrap();
        let store = generate_cert_store(dir.path()).unwrap();

        store.server_config().unwrap();
        store.client_config().unwrap();
    }

    #[test]
    fn test_missing_store_is_a_config_error() {
        let store = CertStoreConfig::new("/nonexistent/certstore");
        assert!(store.server_config().is_err());
    }

    #[test]
    fn test_insecure_client_config_builds() {
        let _ = insecure_client_config();
    }
}
