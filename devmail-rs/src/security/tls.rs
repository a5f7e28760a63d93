//! TLS for the SMTP listeners
//!
//! Used both for STARTTLS upgrades on the plaintext port and for the
//! implicit-TLS (SMTPS) listener. Certificates come from PEM files or, when
//! none are configured, from an in-memory self-signed certificate.
//!
//! **WARNING**: self-signed certificates are for local development only.

use crate::error::{MailError, Result};
use chrono::{Datelike, Duration, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyUsagePurpose, SanType};
use rustls::ServerConfig;
use rustls_pemfile::Item;
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// TLS configuration for SMTP
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Create TLS config from certificate and key files
    ///
    /// The key file may hold a PKCS#8, SEC1 (EC) or PKCS#1 (RSA) key.
    ///
    /// ```no_run
    /// use devmail_rs::security::TlsConfig;
    ///
    /// # fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let tls_config = TlsConfig::from_pem_files("cert.pem", "key.pem")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        info!("Loading TLS certificate from {:?}", cert_path.as_ref());

        let cert_file = File::open(cert_path.as_ref())
            .map_err(|e| MailError::Tls(format!("Failed to open certificate file: {}", e)))?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .map_err(|e| MailError::Tls(format!("Failed to read certificates: {}", e)))?;

        if certs.is_empty() {
            return Err(MailError::Tls("No certificates found in file".to_string()));
        }
        debug!("Loaded {} certificate(s)", certs.len());

        let key_file = File::open(key_path.as_ref())
            .map_err(|e| MailError::Tls(format!("Failed to open key file: {}", e)))?;
        let items = rustls_pemfile::read_all(&mut BufReader::new(key_file))
            .map_err(|e| MailError::Tls(format!("Failed to read private keys: {}", e)))?;

        let private_key = items
            .into_iter()
            .find_map(|item| match item {
                Item::PKCS8Key(key) | Item::ECKey(key) | Item::RSAKey(key) => Some(key),
                _ => None,
            })
            .ok_or_else(|| MailError::Tls("No private key found in file".to_string()))?;

        Self::from_der(certs, private_key)
    }

    /// Self-signed P-256 certificate for `localhost`, `127.0.0.1` and `::1`,
    /// valid for one year
    pub fn self_signed() -> Result<Self> {
        let cert = self_signed_certificate()?;

        let cert_der = cert
            .serialize_der()
            .map_err(|e| MailError::Tls(format!("Failed to serialize certificate: {}", e)))?;
        let key_der = cert.serialize_private_key_der();

        info!("Using generated self-signed TLS certificate");
        Self::from_der(vec![cert_der], key_der)
    }

    fn from_der(certs: Vec<Vec<u8>>, private_key: Vec<u8>) -> Result<Self> {
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(rustls::Certificate).collect(),
                rustls::PrivateKey(private_key),
            )
            .map_err(|e| MailError::Tls(format!("Failed to create TLS config: {}", e)))?;

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    /// Configured certificate if both paths are set, otherwise a self-signed one
    pub fn load_or_generate(cert_path: Option<&str>, key_path: Option<&str>) -> Result<Self> {
        match (cert_path, key_path) {
            (Some(cert), Some(key)) if !cert.is_empty() && !key.is_empty() => {
                Self::from_pem_files(cert, key)
            }
            _ => Self::self_signed(),
        }
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }

    /// Acceptor that upgrades a plain stream to TLS
    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }
}

fn self_signed_certificate() -> Result<rcgen::Certificate> {
    let mut params = CertificateParams::default();
    params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;

    let mut name = DistinguishedName::new();
    name.push(DnType::OrganizationName, "DevMail");
    name.push(DnType::CountryName, "US");
    params.distinguished_name = name;

    params.subject_alt_names = vec![
        SanType::DnsName("localhost".to_string()),
        SanType::DnsName("127.0.0.1".to_string()),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
    ];
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = Utc::now();
    let expires = now + Duration::days(365);
    params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
    params.not_after =
        rcgen::date_time_ymd(expires.year(), expires.month() as u8, expires.day() as u8);

    rcgen::Certificate::from_params(params)
        .map_err(|e| MailError::Tls(format!("Failed to generate certificate: {}", e)))
}

/// Write a self-signed certificate and its PKCS#8 key as PEM files
pub fn generate_self_signed_cert(cert_output: &Path, key_output: &Path) -> Result<()> {
    let cert = self_signed_certificate()?;

    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| MailError::Tls(format!("Failed to serialize certificate: {}", e)))?;
    std::fs::write(cert_output, cert_pem)
        .map_err(|e| MailError::Tls(format!("Failed to write certificate: {}", e)))?;
    std::fs::write(key_output, cert.serialize_private_key_pem())
        .map_err(|e| MailError::Tls(format!("Failed to write private key: {}", e)))?;

    info!(
        "Self-signed certificate generated: {} and {}",
        cert_output.display(),
        key_output.display()
    );
    Ok(())
}
