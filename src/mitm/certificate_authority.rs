//! Certificate Authority - Dynamic certificate generation for MITM
//!
//! Issues leaf certificates for intercepted hosts, signed by a configured or
//! freshly generated CA. Issued certificates are cached per exact hostname
//! for the life of the process; generation for one host never holds a lock
//! that lookups for other hosts need.

use crate::mitm::error::{MitmError, Result};
use crate::mitm::tls_config::ClientTlsConfig;
use rand::Rng;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Leaf validity, backdated by one day to absorb clock skew
const LEAF_VALIDITY_DAYS: i64 = 90;
const CA_VALIDITY_DAYS: i64 = 3650;

/// Subject of an issued certificate
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum HostIdentifier {
    /// Regular domain (e.g., example.com)
    Domain(String),

    /// IP address (e.g., 192.168.1.1)
    IpAddress(IpAddr),
}

impl HostIdentifier {
    /// Parse from a hostname or IP literal (brackets allowed for IPv6)
    pub fn from_hostname(hostname: &str) -> Self {
        let bare = hostname.trim_start_matches('[').trim_end_matches(']');
        match bare.parse::<IpAddr>() {
            Ok(ip) => Self::IpAddress(ip),
            Err(_) => Self::Domain(hostname.to_ascii_lowercase()),
        }
    }

    fn common_name(&self) -> String {
        match self {
            Self::Domain(domain) => domain.clone(),
            Self::IpAddress(ip) => ip.to_string(),
        }
    }

    fn subject_alt_name(&self) -> Result<SanType> {
        match self {
            Self::Domain(domain) => Ia5String::try_from(domain.clone())
                .map(SanType::DnsName)
                .map_err(|e| MitmError::cert_generation(domain.clone(), e.to_string())),
            Self::IpAddress(ip) => Ok(SanType::IpAddress(*ip)),
        }
    }
}

/// Leaf certificate ready to terminate TLS for one host
pub struct IssuedCertificate {
    host: HostIdentifier,
    chain: Vec<CertificateDer<'static>>,
    key: PrivatePkcs8KeyDer<'static>,
    server_config: Arc<ServerConfig>,
}

impl IssuedCertificate {
    pub fn host(&self) -> &HostIdentifier {
        &self.host
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key.clone_key())
    }

    /// Client-facing TLS config presenting this certificate
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("host", &self.host)
            .field("chain_len", &self.chain.len())
            .field("key", &"<REDACTED>")
            .finish()
    }
}

type CacheSlot = Arc<OnceCell<Arc<IssuedCertificate>>>;

/// Certificate Authority - generates and caches certificates
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_pem: String,
    cache: Mutex<HashMap<String, CacheSlot>>,
}

impl CertificateAuthority {
    /// Load a CA from already-read PEM material
    ///
    /// The certificate must be a CA, may sign certificates and must be
    /// within its validity window.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        validate_ca_certificate(cert_pem)?;

        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| MitmError::ca_load(format!("invalid CA key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| MitmError::ca_load(format!("invalid CA certificate: {}", e)))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| MitmError::ca_load(e.to_string()))?;

        info!("CA certificate loaded and validated");

        Ok(Self {
            ca_cert,
            ca_key,
            ca_pem: cert_pem.to_string(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Generate a fresh self-signed CA for this process
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "meterproxy");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(CA_VALIDITY_DAYS);
        params.serial_number = Some(generate_serial_number());

        let ca_key = KeyPair::generate().map_err(|e| MitmError::ca_generation(e.to_string()))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| MitmError::ca_generation(e.to_string()))?;
        let ca_pem = ca_cert.pem();

        warn!(
            common_name = %common_name,
            "Generated ephemeral CA; clients must trust it for interception to succeed"
        );

        Ok(Self {
            ca_cert,
            ca_key,
            ca_pem,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// CA certificate in PEM form, for installing in clients
    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca_pem
    }

    pub fn ca_certificate_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// Get the cached certificate for `host` or issue one
    ///
    /// Concurrent callers for the same host share a single generation.
    pub async fn get_or_generate(&self, host: &str) -> Result<Arc<IssuedCertificate>> {
        let slot = {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(cache.entry(host.to_string()).or_default())
        };

        if let Some(issued) = slot.get() {
            debug!(host = %host, "Certificate cache hit");
            return Ok(Arc::clone(issued));
        }

        let issued = slot
            .get_or_try_init(|| async {
                debug!(host = %host, "Generating new certificate");
                self.issue(&HostIdentifier::from_hostname(host)).map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(issued))
    }

    /// Number of hosts with a cached certificate
    pub fn cached_hosts(&self) -> usize {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.values().filter(|slot| slot.initialized()).count()
    }

    fn issue(&self, host: &HostIdentifier) -> Result<IssuedCertificate> {
        let name = host.common_name();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name.clone());
        params.distinguished_name = dn;
        params.subject_alt_names = vec![host.subject_alt_name()?];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);
        params.serial_number = Some(generate_serial_number());

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| MitmError::cert_generation(name.clone(), e.to_string()))?;
        let leaf = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| MitmError::cert_generation(name.clone(), e.to_string()))?;

        let chain = vec![leaf.der().clone()];
        let key = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
        let server_config =
            ClientTlsConfig::new(chain.clone(), PrivateKeyDer::Pkcs8(key.clone_key()))
                .map_err(|e| MitmError::cert_generation(name.clone(), e.to_string()))?
                .server_config();

        info!(host = %name, "Issued interception certificate");

        Ok(IssuedCertificate {
            host: host.clone(),
            chain,
            key,
            server_config,
        })
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_key", &"<REDACTED>")
            .field("cached_hosts", &self.cached_hosts())
            .finish()
    }
}

/// Unique serial from a timestamp and crypto RNG output
fn generate_serial_number() -> SerialNumber {
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = chrono::Utc::now().timestamp() as u32;
    let serial = ((timestamp_part as u64) << 32) | (random_part as u64);
    SerialNumber::from_slice(&serial.to_be_bytes())
}

/// Validate CA certificate properties
fn validate_ca_certificate(cert_pem: &str) -> Result<()> {
    use x509_parser::prelude::*;

    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| MitmError::ca_load(format!("PEM parse failed: {}", e)))?;
    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| MitmError::ca_load(format!("X.509 parse failed: {}", e)))?;

    match cert
        .basic_constraints()
        .map_err(|e| MitmError::ca_load(format!("Failed to read basicConstraints: {}", e)))?
    {
        Some(bc) if !bc.value.ca => {
            return Err(MitmError::ca_load("Certificate is not a CA (basicConstraints.ca = false)"));
        }
        Some(_) => {}
        None => warn!("CA certificate missing basicConstraints extension"),
    }

    if let Some(key_usage) = cert
        .key_usage()
        .map_err(|e| MitmError::ca_load(format!("Failed to read keyUsage: {}", e)))?
    {
        if !key_usage.value.key_cert_sign() {
            return Err(MitmError::ca_load("Certificate missing keyCertSign usage"));
        }
    }

    let now = chrono::Utc::now().timestamp();
    if now < cert.validity().not_before.timestamp() {
        return Err(MitmError::ca_load(format!(
            "Certificate not yet valid (notBefore: {})",
            cert.validity().not_before
        )));
    }
    if now > cert.validity().not_after.timestamp() {
        return Err(MitmError::ca_load(format!(
            "Certificate expired (notAfter: {})",
            cert.validity().not_after
        )));
    }

    Ok(())
}
